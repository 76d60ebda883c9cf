//! Error taxonomy for the wire-rpc core.
//!
//! Every variant that can legitimately reach the wire carries its numeric
//! JSON-RPC 2.0 error code via [`Error::code`]; callers should match on the
//! variant (or compare `code()`), never on the `Display` string.

use thiserror::Error;

/// Standard JSON-RPC 2.0 error codes.
pub mod code {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// The crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed JSON at the wire.
    #[error("parse error: {0}")]
    Parse(String),

    /// Version mismatch, missing method, or both/neither result+error.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown service or method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Typed parameter decode failed.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Handler returned an error or encode/marshal failed.
    #[error("internal error: {0}")]
    Internal(String),

    /// Handler panicked during dispatch. Carries the recovered panic
    /// message and a captured backtrace so both can be surfaced in the
    /// wire error's `data` field (§4.4 step 5, §7).
    #[error("panic in {service}.{method}: {message}")]
    Panic {
        service: String,
        method: String,
        message: String,
        backtrace: String,
    },

    /// Pool has been closed.
    #[error("pool closed")]
    PoolClosed,

    /// Pool is at `max_active` capacity.
    #[error("pool exhausted")]
    PoolExhausted,

    /// A pooled connection failed a health check or I/O operation and was
    /// destroyed rather than returned.
    #[error("invalid connection: {0}")]
    InvalidConn(String),

    /// Client has been closed.
    #[error("client closed")]
    ClientClosed,

    /// No connection could be obtained for a call.
    #[error("no connection available: {0}")]
    NoConnection(String),

    /// A deadline elapsed or the caller's cancellation handle fired.
    #[error("timeout")]
    Timeout,

    /// Response identifier did not match the pending call it was read for.
    #[error("call id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: String, got: String },

    /// Underlying I/O failure (dial, read, write).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The JSON-RPC 2.0 numeric code for this error, if it has one.
    ///
    /// Pool/client lifecycle errors (`PoolClosed`, `Timeout`, …) never
    /// reach the wire as a `Response`, so they have no assigned code and
    /// fall back to `INTERNAL_ERROR` for any caller that serializes them
    /// anyway.
    pub fn code(&self) -> i32 {
        match self {
            Error::Parse(_) => code::PARSE_ERROR,
            Error::InvalidRequest(_) => code::INVALID_REQUEST,
            Error::MethodNotFound(_) => code::METHOD_NOT_FOUND,
            Error::InvalidParams(_) => code::INVALID_PARAMS,
            _ => code::INTERNAL_ERROR,
        }
    }

    /// Whether a call that failed with this error should be retried by
    /// the client's retry policy (§4.6 / §7).
    ///
    /// Network/I/O failures and a momentary lack of a free connection are
    /// retryable; pool/client lifecycle terminals and cancellation are not.
    pub fn should_retry(&self) -> bool {
        matches!(self, Error::Io(_) | Error::NoConnection(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
