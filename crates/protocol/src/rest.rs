//! REST response envelopes.
//!
//! Consumed at the boundary only: every REST endpoint wraps its payload in
//! `{status: "success", data}` or `{status: "error", message, errorCode}`
//! paired with an HTTP status.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<D> {
    pub status: String,
    pub data: D,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub status: String,
    pub message: String,
    #[serde(rename = "errorCode", default)]
    pub error_code: u32,
}
