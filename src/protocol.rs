//! Agent wire protocol.
//!
//! The agent protocol is deliberately minimal:
//!
//! | Step | Direction | Frame |
//! |------|-----------|-------|
//! | Login | Pool → Agent | Text frame containing the token verbatim |
//! | Request | Pool → Agent | Text frame, one JSON object |
//! | Reply | Agent → Pool | Text frame, one JSON object |
//!
//! There is no login acknowledgement and no request id. Replies are matched
//! to requests purely by order, one in flight per socket.

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{Result, TAG_INVALID_JSON, TAG_UNKNOWN};

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a request payload as the text of one frame.
///
/// # Errors
///
/// Returns [`Error::Json`](crate::Error::Json) if the payload cannot be
/// represented as JSON.
pub fn encode_payload<P: Serialize + ?Sized>(payload: &P) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}

// ============================================================================
// Decoding
// ============================================================================

/// Parses a reply frame.
///
/// A body that is not JSON yields `{"error": "invalid_json", "raw": text}`.
#[must_use]
pub fn decode_reply(text: String) -> Value {
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => json!({ "error": TAG_INVALID_JSON, "raw": text }),
    }
}

/// Reply returned when every attempt failed without a captured cause.
#[must_use]
pub fn unknown_reply() -> Value {
    json!({ "error": TAG_UNKNOWN })
}

/// Returns the `error` tag of a reply, if it carries one.
#[must_use]
pub fn reply_error(reply: &Value) -> Option<&str> {
    reply.get("error").and_then(Value::as_str)
}

// ============================================================================
// Tests
// ============================================================================
