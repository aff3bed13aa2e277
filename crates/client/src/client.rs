//! Client core: wires auth, REST and the socket together and owns the
//! reconnect policy.
//!
//! A supervisor task watches both the socket and the auth manager. Auth
//! gained brings the socket up, auth lost tears it down. Recoverable
//! disconnects are retried on a fixed delay against a budget of
//! [`RECONNECT_ATTEMPTS`]; the budget refills on every successful
//! connect, and when it runs dry a terminal `Disconnected` is published
//! and the budget refills for any later manual connect. Close codes the
//! server marks non-recoverable clear the session instead of retrying.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use pictor_protocol::close_code;

use crate::auth::AuthManager;
use crate::error::Result;
use crate::rest::RestClient;
use crate::socket::{NetworkTier, SocketClient, SocketEvent, SocketOptions};

/// Consecutive recoverable disconnects tolerated before giving up.
pub const RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Token,
    Cookie,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub app_id: String,
    pub rest_url: Url,
    pub socket_url: Url,
    pub network: NetworkTier,
    pub auth_mode: AuthMode,
    /// Leave the socket down even when authenticated; REST still works.
    pub disable_socket: bool,
    pub reconnect_delay: Duration,
}

impl ClientOptions {
    pub fn new(app_id: impl Into<String>, rest_url: Url, socket_url: Url) -> Self {
        Self {
            app_id: app_id.into(),
            rest_url,
            socket_url,
            network: NetworkTier::default(),
            auth_mode: AuthMode::Token,
            disable_socket: false,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Connection lifecycle notifications. `Disconnected` is terminal: it is
/// published only when no automatic reconnect will follow.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { network: NetworkTier },
    Disconnected { code: Option<u16>, reason: String },
}

struct ClientInner {
    auth: AuthManager,
    rest: RestClient,
    socket: SocketClient,
    socket_enabled: bool,
    reconnect_delay: Duration,
    attempts_left: Mutex<u32>,
    events: broadcast::Sender<ClientEvent>,
}

/// Shared client core; clones are handles onto the same state. Must be
/// created inside a Tokio runtime, since construction spawns the
/// supervisor task.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let auth = match options.auth_mode {
            AuthMode::Token => AuthManager::token(options.rest_url.clone()),
            AuthMode::Cookie => AuthManager::cookie(),
        };
        let rest = RestClient::new(options.rest_url, auth.clone())?;
        let socket_options = SocketOptions::new(options.socket_url, options.app_id);
        let socket = SocketClient::new(socket_options, auth.clone(), options.network);

        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(ClientInner {
            auth,
            rest,
            socket,
            socket_enabled: !options.disable_socket,
            reconnect_delay: options.reconnect_delay,
            attempts_left: Mutex::new(RECONNECT_ATTEMPTS),
            events,
        });
        // Subscribe before spawning so an authenticate() racing the
        // supervisor's first poll is never missed.
        let socket_rx = inner.socket.subscribe();
        let auth_rx = inner.auth.subscribe();
        tokio::spawn(supervise(Arc::downgrade(&inner), socket_rx, auth_rx));
        Ok(Self { inner })
    }

    pub fn auth(&self) -> &AuthManager {
        &self.inner.auth
    }

    pub fn rest(&self) -> &RestClient {
        &self.inner.rest
    }

    pub fn socket(&self) -> &SocketClient {
        &self.inner.socket
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.auth.is_authenticated()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }
}

async fn supervise(
    inner: Weak<ClientInner>,
    mut socket_rx: broadcast::Receiver<SocketEvent>,
    mut auth_rx: broadcast::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = socket_rx.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    Ok(SocketEvent::Connected { network }) => {
                        *inner.attempts_left.lock() = RECONNECT_ATTEMPTS;
                        let _ = inner.events.send(ClientEvent::Connected { network });
                    }
                    Ok(SocketEvent::Disconnected { code, reason }) => {
                        handle_disconnect(&inner, code, reason).await;
                    }
                    Ok(SocketEvent::Message(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "pictor.client", missed, "supervisor lagged on socket events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            update = auth_rx.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match update {
                    Ok(true) => {
                        if inner.socket_enabled && !inner.socket.is_connected() {
                            debug!(target: "pictor.client", "authenticated, bringing socket up");
                            inner.socket.connect();
                        }
                    }
                    Ok(false) => {
                        if inner.socket.is_connected() {
                            debug!(target: "pictor.client", "auth lost, closing socket");
                            inner.socket.disconnect();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn handle_disconnect(inner: &Arc<ClientInner>, code: Option<u16>, reason: String) {
    if !close_code::is_recoverable(code) {
        warn!(target: "pictor.client", ?code, %reason, "unrecoverable disconnect, clearing session");
        // Publish before clearing auth: listeners that watch both streams
        // must see the disconnect first, not the logout it causes.
        let _ = inner.events.send(ClientEvent::Disconnected { code, reason });
        inner.auth.clear();
        return;
    }
    {
        let mut attempts = inner.attempts_left.lock();
        if *attempts == 0 {
            // Budget spent. Refill it so a later manual connect starts
            // fresh, and go quiet.
            *attempts = RECONNECT_ATTEMPTS;
            drop(attempts);
            warn!(target: "pictor.client", ?code, %reason, "reconnect budget exhausted");
            let _ = inner.events.send(ClientEvent::Disconnected { code, reason });
            return;
        }
        *attempts -= 1;
        info!(target: "pictor.client", ?code, remaining = *attempts, "reconnecting after disconnect");
    }
    tokio::time::sleep(inner.reconnect_delay).await;
    inner.socket.connect();
}
