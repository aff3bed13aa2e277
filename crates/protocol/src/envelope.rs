//! Socket message envelope.
//!
//! Every frame in both directions is a JSON object of the shape
//! `{"type": <string>, "data": <base64 of JSON-encoded payload>}`. The
//! payload is optional; lifecycle frames carry no `data` field.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Decoding failures for inbound frames.
///
/// These are protocol errors in the taxonomy sense: the router logs and
/// drops the frame, it never crashes on one.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("frame of type `{0}` is missing its payload")]
    MissingPayload(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Envelope {
    /// Wrap a payload for sending: JSON-encode, then base64 the bytes.
    pub fn encode<T: Serialize>(kind: &str, payload: &T) -> Result<Self, WireError> {
        let json = serde_json::to_vec(payload)?;
        Ok(Self {
            kind: kind.to_string(),
            data: Some(BASE64.encode(json)),
        })
    }

    /// Parse a raw text frame into an envelope.
    pub fn from_text(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize the envelope to the text frame sent on the wire.
    pub fn into_text(self) -> Result<String, WireError> {
        Ok(serde_json::to_string(&self)?)
    }

    /// Decode the base64-of-JSON payload into a concrete type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| WireError::MissingPayload(self.kind.clone()))?;
        let bytes = BASE64.decode(data)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
