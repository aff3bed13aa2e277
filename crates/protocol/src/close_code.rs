//! Socket close-code taxonomy.
//!
//! Three codes force session invalidation; everything else is eligible for
//! automatic reconnect. A close without any code is treated as not
//! recoverable as well, since the server only omits the code when it is
//! tearing the connection down deliberately.

/// This application identity is blocked from connecting.
pub const APP_ID_BLOCKED: u16 = 4010;
/// A newer connection from the same identity superseded this one.
pub const SWITCH_CONNECTION: u16 = 4015;
/// Authentication failed during or after the handshake.
pub const AUTH_ERROR: u16 = 4021;

/// Whether a close code allows an automatic reconnect attempt.
pub fn is_recoverable(code: Option<u16>) -> bool {
    match code {
        None => false,
        Some(APP_ID_BLOCKED | SWITCH_CONNECTION | AUTH_ERROR) => false,
        Some(_) => true,
    }
}
