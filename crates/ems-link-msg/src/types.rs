//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC message model and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::{ParseError, Result};

/// Protocol tag carried by every frame.
pub const JSONRPC_VERSION: &str = "2.0";

fn empty_params() -> JsonValue {
    JsonValue::Object(Map::new())
}

/// Request expecting exactly one response with the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id.
    pub id: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "empty_params")]
    pub params: JsonValue,
}

impl Request {
    /// Build a request with a freshly generated correlation id.
    pub fn new(method: impl Into<String>, params: JsonValue) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), method, params)
    }

    /// Build a request with a caller supplied id.
    pub fn with_id(id: impl Into<String>, method: impl Into<String>, params: JsonValue) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// One-way message without correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Notification parameters.
    #[serde(default = "empty_params")]
    pub params: JsonValue,
}

impl Notification {
    /// Build a notification.
    pub fn new(method: impl Into<String>, params: JsonValue) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Successful response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSuccess {
    /// Id of the request being answered.
    pub id: String,
    /// Result payload.
    pub result: JsonValue,
}

/// Error body of a [`ResponseError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Application defined error code.
    pub code: i64,
    /// Human readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl RpcError {
    /// Build an error body without details.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Failed response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Id of the request being answered.
    pub id: String,
    /// Error body.
    pub error: RpcError,
}

/// The four message shapes exchanged over the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request expecting a response.
    Request(Request),
    /// One-way notification.
    Notification(Notification),
    /// Successful response.
    Success(ResponseSuccess),
    /// Error response.
    Error(ResponseError),
}

impl Message {
    /// Convenience accessor returning the variant as a static string.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Notification(_) => "notification",
            Message::Success(_) => "success",
            Message::Error(_) => "error",
        }
    }

    /// Correlation id, if the variant carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.id),
            Message::Success(success) => Some(&success.id),
            Message::Error(error) => Some(&error.id),
            Message::Notification(_) => None,
        }
    }

    /// Method name, if the variant carries one.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Success(_) | Message::Error(_) => None,
        }
    }

    /// Render the message as a JSON value including the protocol tag.
    pub fn to_value(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), JsonValue::from(JSONRPC_VERSION));
        match self {
            Message::Request(request) => {
                map.insert("id".into(), JsonValue::from(request.id.clone()));
                map.insert("method".into(), JsonValue::from(request.method.clone()));
                map.insert("params".into(), request.params.clone());
            }
            Message::Notification(notification) => {
                map.insert(
                    "method".into(),
                    JsonValue::from(notification.method.clone()),
                );
                map.insert("params".into(), notification.params.clone());
            }
            Message::Success(success) => {
                map.insert("id".into(), JsonValue::from(success.id.clone()));
                map.insert("result".into(), success.result.clone());
            }
            Message::Error(error) => {
                let mut body = Map::new();
                body.insert("code".into(), JsonValue::from(error.error.code));
                body.insert(
                    "message".into(),
                    JsonValue::from(error.error.message.clone()),
                );
                if let Some(data) = &error.error.data {
                    body.insert("data".into(), data.clone());
                }
                map.insert("id".into(), JsonValue::from(error.id.clone()));
                map.insert("error".into(), JsonValue::Object(body));
            }
        }
        JsonValue::Object(map)
    }

    /// Classify an already parsed JSON value.
    ///
    /// Variants are tried in a fixed order: `method`+`id` is a request,
    /// `method` alone a notification, then `result` and finally `error`.
    pub fn from_value(value: JsonValue) -> Result<Self> {
        let JsonValue::Object(mut map) = value else {
            return Err(ParseError::NotAnObject);
        };

        match map.get("jsonrpc") {
            Some(JsonValue::String(version)) if version == JSONRPC_VERSION => {}
            Some(other) => return Err(ParseError::Version(other.to_string())),
            None => return Err(ParseError::Version("<missing>".into())),
        }

        if let Some(method) = map.remove("method") {
            let method = match method {
                JsonValue::String(method) => method,
                other => {
                    return Err(ParseError::InvalidField {
                        field: "method",
                        reason: format!("expected string, found {other}"),
                    })
                }
            };
            let params = map.remove("params").unwrap_or_else(empty_params);
            return match map.remove("id") {
                Some(id) => Ok(Message::Request(Request {
                    id: parse_id(id)?,
                    method,
                    params,
                })),
                None => Ok(Message::Notification(Notification { method, params })),
            };
        }

        if let Some(result) = map.remove("result") {
            let id = map.remove("id").ok_or(ParseError::MissingField("id"))?;
            return Ok(Message::Success(ResponseSuccess {
                id: parse_id(id)?,
                result,
            }));
        }

        if let Some(error) = map.remove("error") {
            let id = map.remove("id").ok_or(ParseError::MissingField("id"))?;
            let mut body = match error {
                JsonValue::Object(body) => body,
                other => {
                    return Err(ParseError::InvalidField {
                        field: "error",
                        reason: format!("expected object, found {other}"),
                    })
                }
            };
            // Taken out by hand so an explicit `"data": null` stays `Some(Null)`.
            let data = body.remove("data");
            let mut error = serde_json::from_value::<RpcError>(JsonValue::Object(body)).map_err(
                |err| ParseError::InvalidField {
                    field: "error",
                    reason: err.to_string(),
                },
            )?;
            error.data = data;
            return Ok(Message::Error(ResponseError {
                id: parse_id(id)?,
                error,
            }));
        }

        Err(ParseError::UnknownShape)
    }
}

fn parse_id(value: JsonValue) -> Result<String> {
    match value {
        JsonValue::String(id) => Ok(id),
        JsonValue::Number(number) => Ok(number.to_string()),
        other => Err(ParseError::InvalidField {
            field: "id",
            reason: format!("expected string or number, found {other}"),
        }),
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Message::Notification(value)
    }
}

impl From<ResponseSuccess> for Message {
    fn from(value: ResponseSuccess) -> Self {
        Message::Success(value)
    }
}

impl From<ResponseError> for Message {
    fn from(value: ResponseError) -> Self {
        Message::Error(value)
    }
}

/// Serialize a message into wire text.
pub fn encode(message: &Message) -> String {
    message.to_value().to_string()
}

/// Parse wire text into a message. Never panics on malformed input.
pub fn decode(text: &str) -> Result<Message> {
    let value: JsonValue = serde_json::from_str(text)?;
    Message::from_value(value)
}
