//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC session client over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::panic::{catch_unwind, AssertUnwindSafe};

use ems_link_msg::methods::EDGE_RPC;
use ems_link_msg::{EdgeRpcNotification, Notification};
use tracing::{debug, warn};

/// A notification as seen by handlers, identical in direct and backend mode.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedNotification {
    /// Originating device, when known.
    pub device_id: Option<String>,
    /// The (unwrapped) notification.
    pub notification: Notification,
}

/// Callback invoked on the dispatch loop for every matching notification.
pub type Handler = Box<dyn FnMut(&RoutedNotification) -> anyhow::Result<()> + Send>;

/// Token returned by [`NotificationRouter::on`] to remove a handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    method: String,
    device: Option<String>,
    handler: Handler,
}

/// Handler registry keyed by method name and optional device id.
#[derive(Default)]
pub struct NotificationRouter {
    next_id: u64,
    registrations: Vec<Registration>,
    default_device: Option<String>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device id attached to notifications that arrive unwrapped (direct mode).
    pub fn set_default_device(&mut self, device: Option<String>) {
        self.default_device = device;
    }

    /// Register `handler` for `method`, optionally restricted to one device.
    pub fn on(&mut self, method: impl Into<String>, device: Option<String>, handler: Handler) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.registrations.push(Registration {
            id,
            method: method.into(),
            device,
            handler,
        });
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn off(&mut self, id: HandlerId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|registration| registration.id != id);
        before != self.registrations.len()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Normalise a raw notification into the routed shape.
    pub fn route(&self, notification: Notification) -> RoutedNotification {
        if notification.method == EDGE_RPC {
            match EdgeRpcNotification::from_params(&notification.params) {
                Ok(envelope) => {
                    return RoutedNotification {
                        device_id: Some(envelope.edge_id),
                        notification: envelope.payload,
                    }
                }
                Err(err) => {
                    warn!(error = %err, "malformed edgeRpc notification; routing unwrapped");
                }
            }
        }
        RoutedNotification {
            device_id: self.default_device.clone(),
            notification,
        }
    }

    /// Deliver `notification` to every matching handler in registration
    /// order. A failing handler is logged and does not stop delivery.
    /// Returns the number of handlers invoked.
    pub fn dispatch(&mut self, notification: Notification) -> usize {
        let routed = self.route(notification);
        let mut delivered = 0;
        for registration in self.registrations.iter_mut() {
            if registration.method != routed.notification.method {
                continue;
            }
            if let Some(device) = &registration.device {
                if routed.device_id.as_deref() != Some(device.as_str()) {
                    continue;
                }
            }
            delivered += 1;
            match catch_unwind(AssertUnwindSafe(|| (registration.handler)(&routed))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    handler = registration.id.0,
                    method = %routed.notification.method,
                    error = %err,
                    "notification handler failed"
                ),
                Err(_) => warn!(
                    handler = registration.id.0,
                    method = %routed.notification.method,
                    "notification handler panicked"
                ),
            }
        }
        if delivered == 0 {
            debug!(method = %routed.notification.method, device = ?routed.device_id, "notification without handler");
        }
        delivered
    }
}

impl std::fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRouter")
            .field("handlers", &self.registrations.len())
            .field("default_device", &self.default_device)
            .finish()
    }
}
