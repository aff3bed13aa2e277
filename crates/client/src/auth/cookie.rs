//! Cookie-backed session state.
//!
//! Used for deployments where the service sets an auth cookie on its own
//! domain and the raw token is never exposed to the client. There is no
//! local way to tell whether such a session is valid; the flag flips on a
//! successful `authenticate` and off on `clear`.

use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct CookieAuth {
    authenticated: AtomicBool,
}

impl CookieAuth {
    pub(crate) fn new() -> Self {
        Self {
            authenticated: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Returns whether the flag changed.
    pub(crate) fn set_authenticated(&self, value: bool) -> bool {
        self.authenticated.swap(value, Ordering::SeqCst) != value
    }
}
