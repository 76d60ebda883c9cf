//! Framing and encode/decode for JSON-RPC 2.0 messages over newline-
//! delimited byte streams (§4.1).
//!
//! Each message occupies one line terminated by `0x0A`. Encoding appends
//! exactly one trailing newline; decoding expects the newline to already
//! have been stripped by the caller (the server/client read loops consume
//! up to and including it via a buffered line reader).

use crate::error::Error;
use crate::protocol::{Id, Request, Response, RpcError, VERSION};
use serde_json::value::RawValue;

/// Decode one line of bytes into a [`Request`].
///
/// Fails with [`Error::Parse`] if the JSON is invalid, or
/// [`Error::InvalidRequest`] if the version tag is wrong or the method is
/// empty.
pub fn decode_request(line: &[u8]) -> Result<Request, Error> {
    let req: Request =
        serde_json::from_slice(line).map_err(|e| Error::Parse(e.to_string()))?;
    if req.jsonrpc != VERSION {
        return Err(Error::InvalidRequest(format!(
            "unsupported jsonrpc version {:?}",
            req.jsonrpc
        )));
    }
    if req.method.is_empty() {
        return Err(Error::InvalidRequest("empty method".to_string()));
    }
    Ok(req)
}

/// Decode one line of bytes into a [`Response`].
///
/// Fails with [`Error::Parse`] if the JSON is invalid, or
/// [`Error::InvalidRequest`] if the version tag is wrong or neither
/// `result` nor `error` is present.
pub fn decode_response(line: &[u8]) -> Result<Response, Error> {
    let resp: Response =
        serde_json::from_slice(line).map_err(|e| Error::Parse(e.to_string()))?;
    if resp.jsonrpc != VERSION {
        return Err(Error::InvalidRequest(format!(
            "unsupported jsonrpc version {:?}",
            resp.jsonrpc
        )));
    }
    if resp.result.is_none() && resp.error.is_none() {
        return Err(Error::InvalidRequest(
            "response has neither result nor error".to_string(),
        ));
    }
    Ok(resp)
}

/// Encode a [`Request`], inserting the default version tag if empty.
///
/// Returns a freshly owned byte vector terminated by exactly one `\n`.
/// Fails with [`Error::InvalidRequest`] if the method is empty.
pub fn encode_request(mut req: Request) -> Result<Vec<u8>, Error> {
    if req.jsonrpc.is_empty() {
        req.jsonrpc = VERSION.to_string();
    }
    if req.method.is_empty() {
        return Err(Error::InvalidRequest("empty method".to_string()));
    }
    let mut bytes = serde_json::to_vec(&req).map_err(|e| Error::Internal(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Encode a [`Response`].
///
/// Fails with [`Error::Internal`] if both or neither of `result`/`error`
/// are populated — a well-formed response must carry exactly one.
pub fn encode_response(resp: &Response) -> Result<Vec<u8>, Error> {
    match (&resp.result, &resp.error) {
        (Some(_), None) | (None, Some(_)) => {}
        (Some(_), Some(_)) => {
            return Err(Error::Internal(
                "response carries both result and error".to_string(),
            ))
        }
        (None, None) => {
            return Err(Error::Internal(
                "response carries neither result nor error".to_string(),
            ))
        }
    }
    let mut bytes = serde_json::to_vec(resp).map_err(|e| Error::Internal(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Build an error `Response` for `id` (which may be absent when the inbound
/// request itself failed to decode far enough to have one).
pub fn error_response(id: Option<Id>, err: &Error) -> Response {
    Response::failure(id, RpcError::from(err))
}

/// The last-resort fallback frame (§6), used when even [`encode_response`]
/// of an error response fails.
pub fn fallback_internal_error_line() -> Vec<u8> {
    let mut bytes = br#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":null}"#
        .to_vec();
    bytes.push(b'\n');
    bytes
}

/// Encode a response, falling back to [`fallback_internal_error_line`] if
/// encoding itself fails (it should not, given [`encode_response`]'s
/// invariant check ran over caller-constructed data, but §6 requires the
/// fallback to exist as a last resort).
pub fn encode_response_or_fallback(resp: &Response) -> Vec<u8> {
    encode_response(resp).unwrap_or_else(|_| fallback_internal_error_line())
}

/// Serialize a typed value to a boxed raw JSON value, the shape
/// [`Request::params`] and the successful half of [`Response::result`]
/// carry on the wire.
pub fn to_raw_value<T: serde::Serialize>(value: &T) -> Result<Box<RawValue>, Error> {
    let s = serde_json::to_string(value).map_err(|e| Error::Internal(e.to_string()))?;
    RawValue::from_string(s).map_err(|e| Error::Internal(e.to_string()))
}
