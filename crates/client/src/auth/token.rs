//! Token-backed session state.
//!
//! Holds the access/refresh pair and their decoded expiries. All methods
//! here are synchronous state manipulation; the renewal round-trip and the
//! single-flight cache live on [`AuthManager`](super::AuthManager) because
//! the shared future has to capture a handle to the whole manager.

use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use url::Url;

use super::jwt;
use crate::error::AuthError;

/// In-flight renewal shared by every caller that needs it.
pub(crate) type RenewalFuture = Shared<BoxFuture<'static, Result<String, AuthError>>>;

/// Persistable token pair returned by `backup()`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub token: String,
    pub refresh_token: String,
}

pub(crate) struct TokenSession {
    pub token: Option<String>,
    pub token_expires_at: SystemTime,
    pub refresh_token: Option<String>,
    pub refresh_expires_at: SystemTime,
}

impl Default for TokenSession {
    fn default() -> Self {
        Self {
            token: None,
            token_expires_at: UNIX_EPOCH,
            refresh_token: None,
            refresh_expires_at: UNIX_EPOCH,
        }
    }
}

pub(crate) struct TokenAuth {
    pub(crate) base_url: Url,
    pub(crate) http: reqwest::Client,
    pub(crate) session: Mutex<TokenSession>,
    pub(crate) renewal: tokio::sync::Mutex<Option<RenewalFuture>>,
}

impl TokenAuth {
    pub(crate) fn new(base_url: Url) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
            session: Mutex::new(TokenSession::default()),
            renewal: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        let session = self.session.lock();
        session.refresh_token.is_some() && session.refresh_expires_at > SystemTime::now()
    }

    /// Current access token if it has not expired yet.
    pub(crate) fn valid_token(&self) -> Option<String> {
        let session = self.session.lock();
        if session.token_expires_at > SystemTime::now() {
            session.token.clone()
        } else {
            None
        }
    }

    pub(crate) fn has_refresh(&self) -> bool {
        self.session.lock().refresh_token.is_some()
    }

    pub(crate) fn refresh_credential(&self) -> (Option<String>, SystemTime) {
        let session = self.session.lock();
        (session.refresh_token.clone(), session.refresh_expires_at)
    }

    pub(crate) fn adopt_refresh(&self, refresh_token: String) -> Result<(), AuthError> {
        let expires_at = jwt::expires_at(&refresh_token)?;
        let mut session = self.session.lock();
        session.refresh_token = Some(refresh_token);
        session.refresh_expires_at = expires_at;
        Ok(())
    }

    /// Store a fresh pair. Returns whether anything actually changed, so
    /// duplicate `updated` notifications can be suppressed.
    pub(crate) fn set_tokens(
        &self,
        token: String,
        refresh_token: String,
    ) -> Result<bool, AuthError> {
        let token_expires_at = jwt::expires_at(&token)?;
        let refresh_expires_at = jwt::expires_at(&refresh_token)?;
        let mut session = self.session.lock();
        if session.token.as_deref() == Some(token.as_str())
            && session.refresh_token.as_deref() == Some(refresh_token.as_str())
        {
            return Ok(false);
        }
        session.token = Some(token);
        session.token_expires_at = token_expires_at;
        session.refresh_token = Some(refresh_token);
        session.refresh_expires_at = refresh_expires_at;
        Ok(true)
    }

    pub(crate) fn backup(&self) -> Option<TokenPair> {
        let session = self.session.lock();
        match (&session.token, &session.refresh_token) {
            (Some(token), Some(refresh_token)) => Some(TokenPair {
                token: token.clone(),
                refresh_token: refresh_token.clone(),
            }),
            _ => None,
        }
    }

    /// Wipe the session. Returns false when there was nothing to wipe.
    pub(crate) fn wipe(&self) -> bool {
        let mut session = self.session.lock();
        if session.token.is_none() && session.refresh_token.is_none() {
            return false;
        }
        *session = TokenSession::default();
        true
    }
}
