//! Rust struct definitions that ser/de to/from the JSON-RPC messages carried inside each frame.
//!
//! The request type is deliberately permissive when deserializing: a message that is missing
//! `jsonrpc` or `method` still decodes, so that the dispatcher can tell an *invalid* request (which
//! gets an `InvalidRequest` error) apart from a payload that isn't a request at all.  Whether a
//! request is a notification hinges entirely on whether the `id` member was present, so [`Id`]
//! models absence as its own variant rather than folding it into `null`.
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Re-export the structs and enums that are part of the JSON-RPC protocol
///
/// No need to re-invent this wheel.  The Request and Response types are not suitable for our use
/// case but other basic types are exactly what we would declare ourselves so we can just
/// re-export.
pub use jsonrpsee_types::{error::ErrorCode, params::TwoPointZero};
pub use serde_json::Value as JsonValue;

/// The only protocol version this crate speaks
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR_MSG: &str = "Parse error";
pub const INVALID_REQUEST_MSG: &str = "Invalid Request";
pub const METHOD_NOT_FOUND_MSG: &str = "Method not found";
pub const INVALID_PARAMS_MSG: &str = "Invalid params";
pub const INTERNAL_ERROR_MSG: &str = "Internal error";

/// Request Id
///
/// `Absent` and `Null` are different things: a request with no `id` member is a notification and
/// must never be answered, while a request with `"id": null` is a method call whose response
/// carries a `null` id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Id {
    /// The `id` member was not present at all
    #[default]
    Absent,
    /// The `id` member was present with a `null` value
    Null,
    /// Numeric id, kept exactly as it was written on the wire
    Number(serde_json::Number),
    /// String id
    Str(String),
}

impl Id {
    pub fn is_absent(&self) -> bool {
        matches!(self, Id::Absent)
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id::Number(value.into())
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Number(value.into())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::Str(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Str(value.to_string())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Absent => f.write_str("<none>"),
            Id::Null => f.write_str("null"),
            Id::Number(n) => write!(f, "{n}"),
            Id::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            // An absent id is normally skipped entirely; if it does get serialized (for instance as
            // the id of a response) null is the only sensible rendering.
            Id::Absent | Id::Null => serializer.serialize_unit(),
            Id::Number(n) => n.serialize(serializer),
            Id::Str(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Id {
    /// Only ever invoked when the member is present, hence never produces [`Id::Absent`].  Fields
    /// of this type need `#[serde(default)]` to get `Absent` when the member is missing.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match JsonValue::deserialize(deserializer)? {
            JsonValue::Null => Ok(Id::Null),
            JsonValue::Number(n) => Ok(Id::Number(n)),
            JsonValue::String(s) => Ok(Id::Str(s)),
            other => Err(D::Error::custom(format!(
                "invalid request id {other}; expected a string, number, or null"
            ))),
        }
    }
}

/// [JSON-RPC request object](https://www.jsonrpc.org/specification#request-object), which is also
/// the shape of an inbound notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// JSON-RPC version.  Any string is accepted here; see [`Self::is_valid`].
    #[serde(default)]
    pub jsonrpc: String,
    /// Name of the method to be invoked.
    #[serde(default)]
    pub method: String,
    /// Parameter values of the request.  `None` if the member was absent, `Some(Null)` if it was
    /// an explicit `null`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<JsonValue>,
    /// Request ID, [`Id::Absent`] for notifications.
    #[serde(default, skip_serializing_if = "Id::is_absent")]
    pub id: Id,
}

/// Plain `Option` deserialization turns `null` into `None`; a member that is present is always
/// `Some`, and `#[serde(default)]` covers the absent case.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    JsonValue::deserialize(deserializer).map(Some)
}

impl Request {
    /// Create a serializable JSON-RPC method call.
    pub fn new(id: impl Into<Id>, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: params.into(),
            id: id.into(),
        }
    }

    /// Create a request without an id, which the receiving end must never answer.
    pub fn notification(method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: params.into(),
            id: Id::Absent,
        }
    }

    /// A request is valid if it claims protocol version 2.0 and names a method.
    ///
    /// This is independent of [`Self::is_notification`].
    pub fn is_valid(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION && !self.method.is_empty()
    }

    /// True if the `id` member was absent.  `"id": null` is a method call, not a notification.
    pub fn is_notification(&self) -> bool {
        self.id.is_absent()
    }
}

/// Serializable [JSON-RPC notification object](https://www.jsonrpc.org/specification#notification)
/// as sent by the server to push an event to the peer.
///
/// Differs from the request object in that it does not have an `id` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notification {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Name of the event.
    pub method: String,
    /// Event payload.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<JsonValue>,
}

impl Notification {
    /// Create a serializable JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            method: method.into(),
            params: params.into(),
        }
    }
}

/// JSON-RPC response object as defined in the [spec](https://www.jsonrpc.org/specification#response_object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version.
    pub jsonrpc: TwoPointZero,
    /// Payload which can be result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
    /// Request ID
    #[serde(default)]
    pub id: Id,
}

impl Response {
    /// Create a owned successful response
    pub fn success(id: Id, result: JsonValue) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            payload: ResponsePayload::success(result),
            id,
        }
    }

    /// Create an error response
    pub fn error(id: Id, error: impl Into<ErrorDetails>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            payload: ResponsePayload::error(error),
            id,
        }
    }

    /// Error details if this is an error response
    pub fn error_details(&self) -> Option<&ErrorDetails> {
        match &self.payload {
            ResponsePayload::Error(ErrorResponse { error }) => Some(error),
            ResponsePayload::Success(_) => None,
        }
    }

    /// Convert into the result value, or the error that the remote peer reported
    pub fn into_result(self) -> Result<JsonValue, ErrorDetails> {
        match self.payload {
            ResponsePayload::Success(SuccessResponse { result }) => Ok(result),
            ResponsePayload::Error(ErrorResponse { error }) => Err(error),
        }
    }
}

/// Possible payloads of a JSON RPC response
///
/// This is an `untagged` enum so that serde will try to deserialize into each variant in order
/// until one succeeds.  This works because successs responses should have `result` and error
/// responses should have `error`.  Having exactly one of them is enforced by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Corresponds to failed JSON-RPC response with a error object with the field `error`.
    Error(ErrorResponse),
    /// Corresponds to successful JSON-RPC response with the field `result`.
    Success(SuccessResponse),
}

impl ResponsePayload {
    /// Create a successful response payload
    pub fn success(result: JsonValue) -> Self {
        ResponsePayload::Success(SuccessResponse { result })
    }

    /// Create an error response payload
    pub fn error(details: impl Into<ErrorDetails>) -> Self {
        ResponsePayload::Error(ErrorResponse {
            error: details.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub result: JsonValue,
}

/// [Failed JSON-RPC response object](https://www.jsonrpc.org/specification#error_object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// [JSON-RPC failed response error details](https://www.jsonrpc.org/specification#error_object).
///
/// This is also the error type that handlers return when they want to control exactly what the
/// remote peer sees.  It implements [`std::error::Error`] so it survives a trip through
/// `anyhow::Error` and is still recognized on the other side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("JSON-RPC error {}: {}", .code.code(), .message)]
pub struct ErrorDetails {
    /// Code
    pub code: ErrorCode,
    /// Message
    pub message: String,
    /// Optional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ParseError, message, data)
    }
    pub fn invalid_request(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, data)
    }
    pub fn method_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message, data)
    }
    pub fn invalid_params(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, data)
    }
    pub fn internal_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InternalError, message, data)
    }
    /// Application-defined error, with a code in the range reserved for implementations
    pub fn server_error(code: i32, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ServerError(code), message, data)
    }

    /// The numeric error code as it appears on the wire
    pub fn code(&self) -> i32 {
        self.code.code()
    }
}

/// Every message the server side of a connection sends to its peer
///
/// Represented as an `untagged` enum so serde will try to deserialize into each variant in order
/// until one succeeds.  The order matters: a notification is recognized by its `method` member,
/// which a response never has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// A server-initiated event
    Notification(Notification),

    /// A response to an earlier request
    Response(Response),
}
