//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC message model and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Catalogue of the methods and notifications spoken between the dashboard
//! and an Edge (or a backend multiplexing many Edges).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::channel::ChannelAddress;
use crate::types::{Message, Notification, Request};
use crate::{ParseError, Result};

/// Notification pushing live channel values.
pub const CURRENT_DATA: &str = "currentData";
/// Envelope method used for device addressed traffic through a backend.
pub const EDGE_RPC: &str = "edgeRpc";
/// Backend notification announcing a valid session.
pub const AUTHENTICATE_WITH_SESSION_ID: &str = "authenticateWithSessionId";
/// Backend notification invalidating the session.
pub const AUTHENTICATE_WITH_SESSION_ID_FAILED: &str = "authenticateWithSessionIdFailed";
/// Notification carrying a fresh Edge configuration.
pub const EDGE_CONFIG: &str = "edgeConfig";
/// Notification carrying one system log line.
pub const SYSTEM_LOG: &str = "systemLog";

/// Typed JSON-RPC method: the implementing struct is the params object.
pub trait RpcMethod: Serialize {
    /// Wire method name.
    const METHOD: &'static str;
    /// Shape of the `result` member of a successful response.
    type Response: DeserializeOwned;

    /// Build a request with a fresh id.
    fn to_request(&self) -> std::result::Result<Request, serde_json::Error> {
        Ok(Request::new(Self::METHOD, serde_json::to_value(self)?))
    }
}

/// Whether `method` belongs to the login handshake.
pub fn is_authentication_method(method: &str) -> bool {
    method == AuthenticateWithPassword::METHOD || method == AuthenticateWithToken::METHOD
}

/// Role of the user on a particular Edge, ordered by privilege.
///
/// Unknown role names read as [`Role::Guest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Role {
    /// Read only visitor.
    Guest,
    /// Owner of the installation.
    Owner,
    /// Installer with configuration rights.
    Installer,
    /// Full administrative rights.
    Admin,
}

impl Role {
    /// Whether this role is equal to or more privileged than `other`.
    pub fn is_at_least(self, other: Role) -> bool {
        self >= other
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "owner" => Role::Owner,
            "installer" => Role::Installer,
            "admin" => Role::Admin,
            _ => Role::Guest,
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Guest
    }
}

/// Edge metadata as delivered in authentication payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeMetadata {
    /// Stable Edge id.
    pub id: String,
    /// Free text comment set by the operator.
    #[serde(default)]
    pub comment: Option<String>,
    /// Product type string.
    #[serde(default, rename = "producttype")]
    pub product_type: Option<String>,
    /// Firmware version.
    #[serde(default)]
    pub version: Option<String>,
    /// Role of the current user on this Edge.
    #[serde(default)]
    pub role: Role,
    /// Whether the Edge is currently connected to the backend.
    #[serde(default)]
    pub is_online: bool,
    /// Timestamp of the last message seen from the Edge.
    #[serde(default, rename = "lastmessage")]
    pub last_message: Option<DateTime<Utc>>,
}

/// Result of a successful login, also the params of the session notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    /// Token to use for later `authenticateWithToken` calls.
    pub token: String,
    /// Opaque user metadata.
    #[serde(default)]
    pub user: Option<JsonValue>,
    /// Edges visible to the user.
    #[serde(default)]
    pub edges: Vec<EdgeMetadata>,
}

/// Login with username/password.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticateWithPassword {
    /// Optional user name; direct Edge logins use the password alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password.
    pub password: String,
}

impl RpcMethod for AuthenticateWithPassword {
    const METHOD: &'static str = "authenticateWithPassword";
    type Response = AuthenticateResponse;
}

/// Login with a previously issued token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticateWithToken {
    /// Session token.
    pub token: String,
}

impl RpcMethod for AuthenticateWithToken {
    const METHOD: &'static str = "authenticateWithToken";
    type Response = AuthenticateResponse;
}

/// Terminate the server side session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Logout {}

impl RpcMethod for Logout {
    const METHOD: &'static str = "logout";
    type Response = JsonValue;
}

/// Replace the set of channels pushed via `currentData`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeChannels {
    /// Monotonic sequence number letting the server discard stale sets.
    pub count: u64,
    /// Full set of channels wanted.
    pub channels: Vec<ChannelAddress>,
}

impl SubscribeChannels {
    /// Build a subscription for `channels` tagged with sequence `count`.
    pub fn new(count: u64, channels: impl IntoIterator<Item = ChannelAddress>) -> Self {
        Self {
            count,
            channels: channels.into_iter().collect(),
        }
    }
}

impl RpcMethod for SubscribeChannels {
    const METHOD: &'static str = "subscribeChannels";
    type Response = JsonValue;
}

/// Envelope routing an inner request to one Edge behind a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRpc {
    /// Target Edge.
    pub edge_id: String,
    /// Inner request, serialized with its own protocol tag.
    #[serde(with = "request_payload")]
    pub payload: Request,
}

impl EdgeRpc {
    /// Wrap `payload` for `edge_id`.
    pub fn new(edge_id: impl Into<String>, payload: Request) -> Self {
        Self {
            edge_id: edge_id.into(),
            payload,
        }
    }
}

/// Result of an [`EdgeRpc`]: the inner response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRpcResponse {
    /// Inner response object.
    pub payload: JsonValue,
}

impl RpcMethod for EdgeRpc {
    const METHOD: &'static str = EDGE_RPC;
    type Response = EdgeRpcResponse;
}

mod request_payload {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value as JsonValue;

    use crate::types::{Message, Request};

    pub fn serialize<S: Serializer>(request: &Request, serializer: S) -> Result<S::Ok, S::Error> {
        Message::Request(request.clone())
            .to_value()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Request, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        match Message::from_value(value).map_err(D::Error::custom)? {
            Message::Request(request) => Ok(request),
            other => Err(D::Error::custom(format!(
                "expected request payload, found {}",
                other.kind()
            ))),
        }
    }
}

/// Request the current Edge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetEdgeConfig {}

impl RpcMethod for GetEdgeConfig {
    const METHOD: &'static str = "getEdgeConfig";
    type Response = JsonValue;
}

/// Single configuration property update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// New value.
    pub value: JsonValue,
}

impl Property {
    /// Build a property update.
    pub fn new(name: impl Into<String>, value: JsonValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Create a component from a factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateComponentConfig {
    /// Factory PID.
    pub factory_pid: String,
    /// Initial properties.
    pub properties: Vec<Property>,
}

impl RpcMethod for CreateComponentConfig {
    const METHOD: &'static str = "createComponentConfig";
    type Response = JsonValue;
}

/// Update properties of an existing component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateComponentConfig {
    /// Component id.
    pub component_id: String,
    /// Properties to change.
    pub properties: Vec<Property>,
}

impl RpcMethod for UpdateComponentConfig {
    const METHOD: &'static str = "updateComponentConfig";
    type Response = JsonValue;
}

/// Remove a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteComponentConfig {
    /// Component id.
    pub component_id: String,
}

impl RpcMethod for DeleteComponentConfig {
    const METHOD: &'static str = "deleteComponentConfig";
    type Response = JsonValue;
}

/// Toggle the `systemLog` notification stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeSystemLog {
    /// `true` to start, `false` to stop.
    pub subscribe: bool,
}

impl RpcMethod for SubscribeSystemLog {
    const METHOD: &'static str = "subscribeSystemLog";
    type Response = JsonValue;
}

/// Write a value to a writable channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChannelValue {
    /// Component id.
    pub component_id: String,
    /// Channel id.
    pub channel_id: String,
    /// Value to write.
    pub value: JsonValue,
}

impl SetChannelValue {
    /// Build a write for `address`.
    pub fn new(address: &ChannelAddress, value: JsonValue) -> Self {
        Self {
            component_id: address.component_id().to_owned(),
            channel_id: address.channel_id().to_owned(),
            value,
        }
    }
}

impl RpcMethod for SetChannelValue {
    const METHOD: &'static str = "setChannelValue";
    type Response = JsonValue;
}

/// Forward a request to a component's own JSON API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentJsonApi {
    /// Target component, e.g. `_componentManager`.
    pub component_id: String,
    /// Inner request.
    #[serde(with = "request_payload")]
    pub payload: Request,
}

impl RpcMethod for ComponentJsonApi {
    const METHOD: &'static str = "componentJsonApi";
    type Response = JsonValue;
}

/// Typed view of a `currentData` notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrentDataNotification(pub BTreeMap<ChannelAddress, JsonValue>);

impl CurrentDataNotification {
    /// Parse the params of a `currentData` notification.
    pub fn from_params(params: &JsonValue) -> Result<Self> {
        serde_json::from_value(params.clone()).map_err(|err| ParseError::InvalidField {
            field: "params",
            reason: err.to_string(),
        })
    }

    /// Value of one channel, if present.
    pub fn get(&self, address: &ChannelAddress) -> Option<&JsonValue> {
        self.0.get(address)
    }
}

/// Typed view of the session notification pushed by a backend.
pub type AuthenticateWithSessionIdNotification = AuthenticateResponse;

/// Notification from one Edge relayed by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRpcNotification {
    /// Originating Edge.
    pub edge_id: String,
    /// Inner notification.
    pub payload: Notification,
}

impl EdgeRpcNotification {
    /// Parse the params of an `edgeRpc` notification.
    pub fn from_params(params: &JsonValue) -> Result<Self> {
        let edge_id = params
            .get("edgeId")
            .ok_or(ParseError::MissingField("edgeId"))?
            .as_str()
            .ok_or_else(|| ParseError::InvalidField {
                field: "edgeId",
                reason: "expected string".into(),
            })?
            .to_owned();
        let payload = params
            .get("payload")
            .cloned()
            .ok_or(ParseError::MissingField("payload"))?;
        match Message::from_value(payload)? {
            Message::Notification(payload) => Ok(Self { edge_id, payload }),
            other => Err(ParseError::InvalidField {
                field: "payload",
                reason: format!("expected notification, found {}", other.kind()),
            }),
        }
    }

    /// Render back into an `edgeRpc` notification.
    pub fn into_notification(self) -> Notification {
        Notification::new(
            EDGE_RPC,
            serde_json::json!({
                "edgeId": self.edge_id,
                "payload": Message::Notification(self.payload).to_value(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn password_login_omits_missing_username() {
        let request = AuthenticateWithPassword {
            username: None,
            password: "user".into(),
        }
        .to_request()
        .expect("serializable");
        assert_eq!(request.method, "authenticateWithPassword");
        assert_eq!(request.params, json!({"password": "user"}));
    }

    #[test]
    fn subscribe_channels_renders_addresses_as_strings() {
        let request = SubscribeChannels::new(
            3,
            [
                ChannelAddress::new("_sum", "State"),
                ChannelAddress::new("ess0", "Soc"),
            ],
        )
        .to_request()
        .expect("serializable");
        assert_eq!(
            request.params,
            json!({"count": 3, "channels": ["_sum/State", "ess0/Soc"]})
        );
    }

    #[test]
    fn edge_rpc_embeds_full_inner_request() {
        let inner = Request::with_id("inner", "getEdgeConfig", json!({}));
        let outer = EdgeRpc::new("edge0", inner.clone())
            .to_request()
            .expect("serializable");
        assert_eq!(outer.params["edgeId"], "edge0");
        assert_eq!(outer.params["payload"]["jsonrpc"], "2.0");
        assert_eq!(outer.params["payload"]["id"], "inner");

        let parsed: EdgeRpc = serde_json::from_value(outer.params).expect("deserialize");
        assert_eq!(parsed.payload, inner);
    }

    #[test]
    fn current_data_parses_channel_keys() {
        let data = CurrentDataNotification::from_params(&json!({
            "_sum/EssSoc": 54,
            "_sum/GridActivePower": -1200
        }))
        .expect("valid params");
        assert_eq!(
            data.get(&ChannelAddress::new("_sum", "EssSoc")),
            Some(&json!(54))
        );
        assert!(CurrentDataNotification::from_params(&json!({"bad": 1})).is_err());
    }

    #[test]
    fn edge_rpc_notification_unwraps_inner() {
        let wrapped = EdgeRpcNotification {
            edge_id: "edge7".into(),
            payload: Notification::new(CURRENT_DATA, json!({"_sum/State": 0})),
        }
        .into_notification();
        let parsed = EdgeRpcNotification::from_params(&wrapped.params).expect("parses");
        assert_eq!(parsed.edge_id, "edge7");
        assert_eq!(parsed.payload.method, CURRENT_DATA);

        assert!(matches!(
            EdgeRpcNotification::from_params(&json!({"payload": {}})),
            Err(ParseError::MissingField("edgeId"))
        ));
    }

    #[test]
    fn authenticate_response_reads_edge_list() {
        let response: AuthenticateResponse = serde_json::from_value(json!({
            "token": "xyz",
            "edges": [
                {"id": "edge0", "role": "admin", "isOnline": true, "producttype": "home"},
                {"id": "edge1", "role": "superuser"}
            ]
        }))
        .expect("valid response");
        assert_eq!(response.edges.len(), 2);
        assert_eq!(response.edges[0].role, Role::Admin);
        assert!(response.edges[0].is_online);
        assert_eq!(response.edges[0].product_type.as_deref(), Some("home"));
        assert_eq!(response.edges[1].role, Role::Guest);
        assert!(Role::Installer.is_at_least(Role::Owner));
        assert!(!Role::Guest.is_at_least(Role::Owner));
        assert!(Role::Admin > Role::Guest);
        assert_eq!(
            serde_json::to_value(Role::Installer).expect("serializes"),
            json!("installer")
        );
    }
}
