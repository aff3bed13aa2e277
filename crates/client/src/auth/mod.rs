//! Credential and token lifecycle.
//!
//! [`AuthManager`] owns the session and answers two questions for the rest
//! of the client: "is this session currently usable" and "decorate this
//! outbound call/connection with proof of identity". Runtime-conditional
//! behavior (header vs. cookie transport, whether keep-alive pings may be
//! sent) is a strategy chosen at construction, never probed at call sites.
//!
//! Renewal discipline: an access token past its expiry is never attached.
//! It is renewed first, and at most one renewal is in flight at a time.
//! Concurrent callers share the outstanding renewal and settle together.
//! A failed renewal clears the whole session rather than retrying.

mod cookie;
pub(crate) mod jwt;
mod token;

pub use token::TokenPair;

use std::sync::Arc;
use std::time::SystemTime;

use futures_util::FutureExt;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as HandshakeRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, warn};
use url::Url;

use crate::error::{AuthError, Error, Result};
use cookie::CookieAuth;
use pictor_protocol::{ApiErrorResponse, ApiResponse};
use token::TokenAuth;

const RENEW_PATH: &str = "/v1/account/refresh-token";

/// Credentials supplied at login or restored from a previous `backup()`.
#[derive(Debug, Clone)]
pub struct AuthCredentials {
    /// Live access token, adopted directly when still unexpired.
    pub token: Option<String>,
    /// Long-lived refresh credential.
    pub refresh_token: String,
}

enum Strategy {
    Token(TokenAuth),
    Cookie(CookieAuth),
}

struct AuthInner {
    strategy: Strategy,
    events: broadcast::Sender<bool>,
}

/// Owns the auth session; cheap to clone and share.
#[derive(Clone)]
pub struct AuthManager {
    inner: Arc<AuthInner>,
}

#[derive(Deserialize)]
struct TokenPairData {
    token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
}

impl AuthManager {
    /// Token strategy: `Authorization` headers on REST calls and on the
    /// socket handshake, transport pings allowed.
    pub fn token(base_url: Url) -> Self {
        Self::with_strategy(Strategy::Token(TokenAuth::new(base_url)))
    }

    /// Cookie strategy: identity travels in a cookie scoped to the service
    /// domain; the raw token is never exposed and pings are not sent.
    pub fn cookie() -> Self {
        Self::with_strategy(Strategy::Cookie(CookieAuth::new()))
    }

    fn with_strategy(strategy: Strategy) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(AuthInner { strategy, events }),
        }
    }

    /// Connectivity-relevant `updated(bool)` signal: `true` after a
    /// successful authentication or token refresh, `false` after `clear`.
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.inner.events.subscribe()
    }

    fn emit(&self, authenticated: bool) {
        let _ = self.inner.events.send(authenticated);
    }

    pub fn is_authenticated(&self) -> bool {
        match &self.inner.strategy {
            Strategy::Token(t) => t.is_authenticated(),
            Strategy::Cookie(c) => c.is_authenticated(),
        }
    }

    /// Whether the transport layer may originate keep-alive pings.
    pub(crate) fn keepalive(&self) -> bool {
        matches!(self.inner.strategy, Strategy::Token(_))
    }

    /// Establish a session. A still-valid supplied access token is adopted
    /// directly; otherwise the refresh credential is adopted and one
    /// renewal is attempted immediately.
    pub async fn authenticate(&self, credentials: AuthCredentials) -> Result<()> {
        match &self.inner.strategy {
            Strategy::Cookie(c) => {
                if c.set_authenticated(true) {
                    self.emit(true);
                }
                Ok(())
            }
            Strategy::Token(t) => {
                if let Some(access) = &credentials.token {
                    let expires_at = jwt::expires_at(access)?;
                    if expires_at > SystemTime::now() {
                        if t.set_tokens(access.clone(), credentials.refresh_token)? {
                            self.emit(true);
                        }
                        return Ok(());
                    }
                }
                t.adopt_refresh(credentials.refresh_token)?;
                self.renew_token().await?;
                Ok(())
            }
        }
    }

    /// Idempotent: wipes the session and emits `updated(false)` exactly
    /// once per transition.
    pub fn clear(&self) {
        let changed = match &self.inner.strategy {
            Strategy::Token(t) => t.wipe(),
            Strategy::Cookie(c) => c.set_authenticated(false),
        };
        if changed {
            debug!(target: "pictor.auth", "session cleared");
            self.emit(false);
        }
    }

    /// Persistable token pair, `None` when nothing is stored yet.
    ///
    /// Fails with [`Error::BackupNotSupported`] for the cookie strategy,
    /// which never sees the raw token.
    pub fn backup(&self) -> Result<Option<TokenPair>> {
        match &self.inner.strategy {
            Strategy::Token(t) => Ok(t.backup()),
            Strategy::Cookie(_) => Err(Error::BackupNotSupported),
        }
    }

    /// Decorate an outbound REST call. Renews first when the access token
    /// is expired; passes the request through anonymously when no refresh
    /// credential exists.
    pub async fn authenticate_request(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder> {
        match &self.inner.strategy {
            // The cookie jar on the HTTP client carries the identity.
            Strategy::Cookie(_) => Ok(builder),
            Strategy::Token(_) => match self.current_token().await? {
                Some(token) => Ok(builder.header(reqwest::header::AUTHORIZATION, token)),
                None => Ok(builder),
            },
        }
    }

    /// Decorate the websocket handshake.
    pub(crate) async fn socket_request(&self, url: &Url) -> Result<HandshakeRequest> {
        let mut request = url.as_str().into_client_request()?;
        if let Strategy::Token(_) = &self.inner.strategy {
            if let Some(token) = self.current_token().await? {
                let value = HeaderValue::from_str(&token)
                    .map_err(|_| AuthError::new("token is not a valid header value"))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }
        }
        Ok(request)
    }

    /// Valid access token, renewing through the refresh credential when
    /// necessary. `None` means the call should go out anonymous.
    async fn current_token(&self) -> Result<Option<String>> {
        let Strategy::Token(t) = &self.inner.strategy else {
            return Ok(None);
        };
        if let Some(token) = t.valid_token() {
            return Ok(Some(token));
        }
        if !t.has_refresh() {
            return Ok(None);
        }
        Ok(Some(self.renew_token().await?))
    }

    /// Single-flight renewal: callers arriving while one is outstanding
    /// await the same future; the cache slot is cleared once it settles.
    async fn renew_token(&self) -> Result<String> {
        let Strategy::Token(t) = &self.inner.strategy else {
            return Err(AuthError::new("token renewal requires the token strategy").into());
        };
        let fut = {
            let mut slot = t.renewal.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let this = self.clone();
                    let fut = async move { this.perform_renewal().await }.boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        let outcome = fut.clone().await;
        {
            let mut slot = t.renewal.lock().await;
            if slot.as_ref().is_some_and(|cached| cached.ptr_eq(&fut)) {
                *slot = None;
            }
        }
        outcome.map_err(Error::from)
    }

    /// One network round-trip exchanging the refresh credential for a
    /// fresh pair. Any failure clears the session.
    async fn perform_renewal(&self) -> std::result::Result<String, AuthError> {
        let Strategy::Token(t) = &self.inner.strategy else {
            return Err(AuthError::new("token renewal requires the token strategy"));
        };
        let (refresh_token, refresh_expires_at) = t.refresh_credential();
        let Some(refresh_token) = refresh_token else {
            return Err(AuthError::new("no refresh credential"));
        };
        if refresh_expires_at <= SystemTime::now() {
            self.clear();
            return Err(AuthError::new("refresh credential expired"));
        }

        let url = t
            .base_url
            .join(RENEW_PATH)
            .map_err(|e| AuthError::new(format!("invalid renewal url: {e}")))?;
        debug!(target: "pictor.auth", %url, "renewing access token");
        let response = t
            .http
            .post(url)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| {
                self.clear();
                AuthError::new(format!("renewal request failed: {e}"))
            })?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|e| {
            self.clear();
            AuthError::new(format!("renewal response was not JSON: {e}"))
        })?;
        if !status.is_success() {
            self.clear();
            let payload: ApiErrorResponse =
                serde_json::from_value(body).unwrap_or_else(|_| ApiErrorResponse {
                    status: "error".into(),
                    message: format!("token renewal rejected with HTTP {status}"),
                    error_code: 0,
                });
            warn!(
                target: "pictor.auth",
                code = payload.error_code,
                "token renewal rejected: {}", payload.message
            );
            return Err(AuthError {
                message: payload.message,
                code: Some(payload.error_code),
            });
        }

        let pair: ApiResponse<TokenPairData> = serde_json::from_value(body).map_err(|e| {
            self.clear();
            AuthError::new(format!("unexpected renewal payload: {e}"))
        })?;
        let token = pair.data.token.clone();
        match t.set_tokens(pair.data.token, pair.data.refresh_token) {
            Ok(changed) => {
                if changed {
                    self.emit(true);
                }
                Ok(token)
            }
            Err(e) => {
                self.clear();
                Err(e)
            }
        }
    }
}
