//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC message model and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod channel;
pub mod logging;
pub mod methods;
pub mod types;

/// Shared result type for decoding operations.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Reasons a wire frame could not be turned into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The frame is not valid JSON at all.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame is valid JSON but not an object.
    #[error("frame is not a json object")]
    NotAnObject,
    /// The protocol tag is missing or carries an unexpected version.
    #[error("unsupported protocol version: {0}")]
    Version(String),
    /// A field required by the detected variant is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A field is present but has the wrong shape.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Human readable description of the problem.
        reason: String,
    },
    /// None of the four message shapes matched.
    #[error("frame matches no json-rpc message shape")]
    UnknownShape,
}

pub use channel::{ChannelAddress, ChannelAddressError};
pub use logging::{log_message, MessageDirection, RpcMetricsExporter};
pub use methods::{
    AuthenticateResponse, AuthenticateWithPassword, AuthenticateWithToken, ComponentJsonApi,
    CreateComponentConfig, CurrentDataNotification, DeleteComponentConfig, EdgeMetadata, EdgeRpc,
    EdgeRpcNotification, EdgeRpcResponse, GetEdgeConfig, Logout, Property, Role, RpcMethod,
    SetChannelValue, SubscribeChannels, SubscribeSystemLog, UpdateComponentConfig,
};
pub use types::{
    decode, encode, Message, Notification, Request, ResponseError, ResponseSuccess, RpcError,
    JSONRPC_VERSION,
};
