//! Normalization of heterogeneous failure codes.
//!
//! Workers report failures either as numbers or as symbolic reason strings.
//! Everything past the router uses one numeric vocabulary, so unknown
//! symbols must map to something rather than fail.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Fallback for reasons the table does not know about.
pub const UNKNOWN_FAILURE: u32 = 5000;
pub const SERVER_RESTARTING: u32 = 5001;
pub const WORKER_DISCONNECTED: u32 = 5002;
pub const JOB_TIMED_OUT: u32 = 5003;
pub const ARTIST_CANCELED: u32 = 5004;
pub const WORKER_CANCELED: u32 = 5005;

/// A failure code as it appears on the wire: numeric or symbolic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawErrorCode {
    Number(i64),
    Symbol(String),
}

/// Maps symbolic failure reasons to stable numeric codes.
///
/// The enumerated set is what the server is known to send today, not a
/// closed vocabulary; callers can register further mappings.
#[derive(Debug, Clone)]
pub struct ErrorCodeTable {
    map: HashMap<String, u32>,
}

impl Default for ErrorCodeTable {
    fn default() -> Self {
        let mut map = HashMap::new();
        map.insert("server restarting".to_string(), SERVER_RESTARTING);
        map.insert("worker disconnected".to_string(), WORKER_DISCONNECTED);
        map.insert("job timed out".to_string(), JOB_TIMED_OUT);
        map.insert("artist canceled".to_string(), ARTIST_CANCELED);
        map.insert("worker canceled".to_string(), WORKER_CANCELED);
        Self { map }
    }
}

impl ErrorCodeTable {
    /// Register or override a symbolic mapping.
    pub fn register(&mut self, reason: impl Into<String>, code: u32) {
        self.map.insert(reason.into(), code);
    }

    /// Resolve a raw wire code to a numeric one. Never fails: numbers pass
    /// through, numeric strings parse, known symbols map, anything else
    /// falls back to [`UNKNOWN_FAILURE`].
    pub fn resolve(&self, raw: &RawErrorCode) -> u32 {
        match raw {
            RawErrorCode::Number(n) => u32::try_from(*n).unwrap_or(UNKNOWN_FAILURE),
            RawErrorCode::Symbol(s) => {
                if let Ok(n) = s.trim().parse::<u32>() {
                    return n;
                }
                self.map
                    .get(s.trim())
                    .copied()
                    .unwrap_or(UNKNOWN_FAILURE)
            }
        }
    }
}
