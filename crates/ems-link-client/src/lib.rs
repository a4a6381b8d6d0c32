//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC session client over WebSocket."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Session client for OpenEMS style Edges, directly or through a backend
//! that multiplexes many Edges over one connection.

pub mod backoff;
pub mod correlator;
pub mod device;
pub mod error;
pub mod router;
pub mod session;
pub mod state;
pub mod subscriptions;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use device::{ChannelWatch, DeviceProxy};
pub use error::{ClientError, ErrorKind, Result};
pub use router::{Handler, HandlerId, NotificationRouter, RoutedNotification};
pub use session::{Credentials, Session, SessionEvent, SessionOptions, DIRECT_EDGE_ID};
pub use state::{AuthEvent, ConnectionState};
pub use subscriptions::{ChannelSet, SubscriptionRegistry};
pub use transport::{Connector, Link, TransportEvent, WebSocketConnector};

pub use ems_link_common::ConnectionMode;
