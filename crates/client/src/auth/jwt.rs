//! Minimal JWT claim inspection.
//!
//! The session layer never verifies signatures; it only needs the `exp`
//! claim to know when a credential stops being attachable. Verification is
//! the server's job.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::error::AuthError;

#[derive(Deserialize)]
struct Claims {
    exp: u64,
}

/// Decode the expiry instant out of a JWT without verifying it.
pub fn expires_at(token: &str) -> Result<SystemTime, AuthError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::new("malformed token: missing payload segment"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::new("malformed token: payload is not base64url"))?;
    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|_| AuthError::new("malformed token: payload is not a claim set"))?;
    Ok(UNIX_EPOCH + Duration::from_secs(claims.exp))
}

/// Build an unsigned token with the given expiry. Test fixtures only.
#[cfg(test)]
pub(crate) fn forge(expires_at: SystemTime) -> String {
    let exp = expires_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{payload}.sig")
}
