//! JSON-RPC 2.0 message types.
//!
//! Parameter and result payloads are kept as raw [`serde_json::value::RawValue`]
//! so the codec never needs to know a handler's argument/reply types — the
//! registry performs the one typed decode per call (§4.1's "Rationale for
//! deferred payload parsing").

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

/// The only protocol version this crate speaks.
pub const VERSION: &str = "2.0";

/// A JSON-RPC request identifier: either an integer or a string.
///
/// The client only ever emits integers (§9 "Identifier parity"), but a
/// well-formed incoming message may carry either shape, and replies must
/// preserve whatever shape arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => write!(f, "{s}"),
        }
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    pub id: Id,
}

impl Request {
    /// Build a request, inserting the default version tag.
    pub fn new(method: impl Into<String>, id: Id, params: Option<Box<RawValue>>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&crate::error::Error> for RpcError {
    fn from(err: &crate::error::Error) -> Self {
        let rpc_err = RpcError::new(err.code(), err.to_string());
        match err {
            crate::error::Error::Panic {
                message, backtrace, ..
            } => rpc_err.with_data(serde_json::json!({
                "panic": message,
                "backtrace": backtrace,
            })),
            _ => rpc_err,
        }
    }
}

/// A JSON-RPC 2.0 response.
///
/// Invariant: exactly one of `result`/`error` is populated. This is not
/// enforced by the type (JSON has no sum types) but is checked by the codec
/// on both encode and decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<Id>,
}

impl Response {
    pub fn success(id: Id, result: Box<RawValue>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn failure(id: Option<Id>, error: RpcError) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
