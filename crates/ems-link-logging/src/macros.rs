//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __link_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx: &$crate::LogContext<'_> = $ctx;
        tracing::event!(
            $level,
            edge = ctx.edge.unwrap_or(""),
            method = ctx.method.unwrap_or(""),
            request_id = ctx.request_id.unwrap_or(""),
            mode = ctx.mode.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with session context.
#[macro_export]
macro_rules! link_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__link_event!(tracing::Level::INFO, &$ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__link_event!(tracing::Level::INFO, &$crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with session context.
#[macro_export]
macro_rules! link_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__link_event!(tracing::Level::DEBUG, &$ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__link_event!(tracing::Level::DEBUG, &$crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with session context.
#[macro_export]
macro_rules! link_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__link_event!(tracing::Level::WARN, &$ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__link_event!(tracing::Level::WARN, &$crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with session context.
#[macro_export]
macro_rules! link_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__link_event!(tracing::Level::ERROR, &$ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__link_event!(tracing::Level::ERROR, &$crate::LogContext::default(), $($arg)+)
    };
}
