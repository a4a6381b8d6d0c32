//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Tracing bootstrap and context-aware logging macros for ems-link.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "EMS_LINK_LOG";

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::from_default_env().add_directive(Level::INFO.into()));
    let _ = Registry::default()
        .with(filter)
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogContext<'a> {
    /// Edge the event relates to.
    pub edge: Option<&'a str>,
    /// JSON-RPC method involved.
    pub method: Option<&'a str>,
    /// Correlation id of the request involved.
    pub request_id: Option<&'a str>,
    /// Connection mode (`direct` or `backend`).
    pub mode: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an Edge identifier.
    pub fn with_edge(mut self, edge: &'a str) -> Self {
        self.edge = Some(edge);
        self
    }

    /// Attach a method name.
    pub fn with_method(mut self, method: &'a str) -> Self {
        self.method = Some(method);
        self
    }

    /// Attach a request correlation id.
    pub fn with_request_id(mut self, request_id: &'a str) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Attach the connection mode.
    pub fn with_mode(mut self, mode: &'a str) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// High-level outcome used when emitting session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventOutcome {
    /// The step completed successfully.
    Success,
    /// The step is degraded but recoverable (e.g. reconnect scheduled).
    Degraded,
    /// The step failed.
    Fault,
}

impl SessionEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SessionEventOutcome::Success => "success",
            SessionEventOutcome::Degraded => "degraded",
            SessionEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized session lifecycle event.
pub fn log_session_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SessionEventOutcome,
) {
    let ctx = context.copied().unwrap_or_default();
    let outcome_str = outcome.as_str();
    macro_rules! emit {
        ($level:expr) => {
            tracing::event!(
                $level,
                event,
                outcome = outcome_str,
                edge = ctx.edge.unwrap_or(""),
                mode = ctx.mode.unwrap_or(""),
                message = %message
            )
        };
    }
    match outcome {
        SessionEventOutcome::Success => emit!(Level::INFO),
        SessionEventOutcome::Degraded => emit!(Level::WARN),
        SessionEventOutcome::Fault => emit!(Level::ERROR),
    }
}
