//! Persistent socket channel to the generation network.
//!
//! Owns at most one live transport connection; `connect` always tears down
//! any prior connection first, and a connection epoch counter keeps tasks
//! belonging to a torn-down connection from touching current state or
//! emitting stale events. Reconnect *policy* does not live here; the
//! owning [`ApiClient`](crate::client::ApiClient) decides when to call
//! `connect` again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::AuthManager;
use crate::error::{Error, Result};
use pictor_protocol::{Envelope, ServerEvent};

const CLIENT_NAME: &str = concat!("pictor-rs/", env!("CARGO_PKG_VERSION"));

/// Network tier selector sent with the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkTier {
    #[default]
    Fast,
    Relaxed,
}

impl NetworkTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Relaxed => "relaxed",
        }
    }
}

impl std::fmt::Display for NetworkTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection lifecycle and decoded application events.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Connected {
        network: NetworkTier,
    },
    /// The transport closed. `code: None` means the peer closed without a
    /// close frame, which the policy layer treats as not recoverable.
    Disconnected {
        code: Option<u16>,
        reason: String,
    },
    Message(ServerEvent),
}

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub url: Url,
    pub app_id: String,
    /// Polling cadence while a send waits for an in-progress connect.
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub ping_interval: Duration,
}

impl SocketOptions {
    pub fn new(url: Url, app_id: impl Into<String>) -> Self {
        Self {
            url,
            app_id: app_id.into(),
            poll_interval: Duration::from_secs(1),
            poll_attempts: 10,
            ping_interval: Duration::from_secs(30),
        }
    }
}

enum ChannelState {
    Disconnected,
    Connecting,
    /// Holds the writer-task handle; dropping it closes the connection.
    Connected(mpsc::UnboundedSender<WsMessage>),
}

struct SocketInner {
    options: SocketOptions,
    auth: AuthManager,
    network: Mutex<NetworkTier>,
    state: Mutex<ChannelState>,
    /// Bumped on every connect/disconnect; tasks carry the epoch they were
    /// spawned under and go inert once it goes stale.
    epoch: AtomicU64,
    events: broadcast::Sender<SocketEvent>,
}

/// The socket client. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<SocketInner>,
}

impl SocketClient {
    pub fn new(options: SocketOptions, auth: AuthManager, network: NetworkTier) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SocketInner {
                options,
                auth,
                network: Mutex::new(network),
                state: Mutex::new(ChannelState::Disconnected),
                epoch: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.inner.events.subscribe()
    }

    pub fn network(&self) -> NetworkTier {
        *self.inner.network.lock()
    }

    /// Whether a connection exists or is being established.
    pub fn is_connected(&self) -> bool {
        !matches!(*self.inner.state.lock(), ChannelState::Disconnected)
    }

    /// Open a connection, tearing down any existing one first.
    pub fn connect(&self) {
        let epoch = self.teardown();
        *self.inner.state.lock() = ChannelState::Connecting;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_connection(inner, epoch));
    }

    /// Idempotent teardown. Emits no event; only server-initiated closes
    /// are observable.
    pub fn disconnect(&self) {
        self.teardown();
    }

    /// Reconnect against a different network tier.
    pub fn switch_network(&self, network: NetworkTier) {
        *self.inner.network.lock() = network;
        self.connect();
    }

    fn teardown(&self) -> u64 {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.state.lock() = ChannelState::Disconnected;
        epoch
    }

    /// Serialize and send an application message. Waits (bounded) for an
    /// in-progress connect; never silently drops or queues forever.
    pub async fn send<T: Serialize>(&self, kind: &str, payload: &T) -> Result<()> {
        self.wait_for_connection().await?;
        let text = Envelope::encode(kind, payload)?.into_text()?;
        let state = self.inner.state.lock();
        match &*state {
            ChannelState::Connected(tx) => tx
                .send(WsMessage::Text(text))
                .map_err(|_| Error::ConnectionFailed),
            _ => Err(Error::ConnectionFailed),
        }
    }

    async fn wait_for_connection(&self) -> Result<()> {
        match *self.inner.state.lock() {
            ChannelState::Connected(_) => return Ok(()),
            ChannelState::Disconnected => return Err(Error::NotConnected),
            ChannelState::Connecting => {}
        }
        let mut attempts = self.inner.options.poll_attempts;
        while matches!(*self.inner.state.lock(), ChannelState::Connecting) {
            debug!(target: "pictor.socket", "waiting for socket connection");
            tokio::time::sleep(self.inner.options.poll_interval).await;
            attempts = attempts.saturating_sub(1);
            if attempts == 0 {
                self.disconnect();
                return Err(Error::ConnectionTimeout);
            }
        }
        // State may have changed between checks.
        if matches!(*self.inner.state.lock(), ChannelState::Connected(_)) {
            Ok(())
        } else {
            self.disconnect();
            Err(Error::ConnectionFailed)
        }
    }
}

fn build_url(inner: &SocketInner) -> Url {
    let mut url = inner.options.url.clone();
    let network = *inner.network.lock();
    url.query_pairs_mut()
        .append_pair("appId", &inner.options.app_id)
        .append_pair("clientName", CLIENT_NAME)
        .append_pair("clientType", "artist")
        .append_pair("forceWorkerId", network.as_str());
    url
}

async fn run_connection(inner: Arc<SocketInner>, epoch: u64) {
    let url = build_url(&inner);
    let request = match inner.auth.socket_request(&url).await {
        Ok(request) => request,
        Err(e) => {
            settle_closed(&inner, epoch, Some(1006), format!("handshake: {e}"));
            return;
        }
    };
    info!(target: "pictor.socket", %url, "connecting");
    let ws = match connect_async(request).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            settle_closed(&inner, epoch, Some(1006), e.to_string());
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    {
        let mut state = inner.state.lock();
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            // Superseded while the handshake was in flight.
            return;
        }
        *state = ChannelState::Connected(tx);
    }
    let network = *inner.network.lock();
    info!(target: "pictor.socket", %network, "connected");
    let _ = inner.events.send(SocketEvent::Connected { network });

    let (mut sink, mut stream) = ws.split();
    let keepalive = inner.auth.keepalive();
    let ping_interval = inner.options.ping_interval;
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Channel dropped on teardown: close cleanly.
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick(), if keepalive => {
                    if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut close: (Option<u16>, String) = (Some(1006), String::new());
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => handle_frame(&inner, epoch, &text),
            Ok(WsMessage::Close(frame)) => {
                close = match frame {
                    Some(f) => (Some(f.code.into()), f.reason.to_string()),
                    None => (None, String::new()),
                };
                break;
            }
            Ok(_) => {}
            Err(e) => {
                close = (Some(1006), e.to_string());
                break;
            }
        }
    }
    writer.abort();
    settle_closed(&inner, epoch, close.0, close.1);
}

fn handle_frame(inner: &SocketInner, epoch: u64, text: &str) {
    if inner.epoch.load(Ordering::SeqCst) != epoch {
        return;
    }
    let envelope = match Envelope::from_text(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(target: "pictor.socket", error = %e, "dropping undecodable frame");
            return;
        }
    };
    match ServerEvent::decode(&envelope) {
        Ok(event) => {
            debug!(target: "pictor.socket", kind = %envelope.kind, "server event");
            let _ = inner.events.send(SocketEvent::Message(event));
        }
        Err(e) => {
            warn!(
                target: "pictor.socket",
                kind = %envelope.kind,
                error = %e,
                "dropping undecodable payload"
            );
        }
    }
}

/// Record the close and surface it, unless the connection was already
/// superseded by a newer epoch (manual disconnect or restart).
fn settle_closed(inner: &SocketInner, epoch: u64, code: Option<u16>, reason: String) {
    {
        let mut state = inner.state.lock();
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        *state = ChannelState::Disconnected;
    }
    warn!(target: "pictor.socket", ?code, %reason, "socket closed");
    let _ = inner.events.send(SocketEvent::Disconnected { code, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pictor_protocol::JobProgressData;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    fn test_client(addr: std::net::SocketAddr) -> SocketClient {
        let url = Url::parse(&format!("ws://{addr}")).unwrap();
        let mut options = SocketOptions::new(url, "test-app");
        options.poll_interval = Duration::from_millis(20);
        let auth = AuthManager::token(Url::parse("http://127.0.0.1:9").unwrap());
        SocketClient::new(options, auth, NetworkTier::Fast)
    }

    async fn wait_connected(rx: &mut broadcast::Receiver<SocketEvent>) {
        loop {
            if let SocketEvent::Connected { .. } = rx.recv().await.unwrap() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn round_trips_envelopes_and_identifies_itself() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut seen_uri = String::new();
            let callback = |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                            resp| {
                seen_uri = req.uri().to_string();
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            assert!(seen_uri.contains("appId=test-app"));
            assert!(seen_uri.contains("clientType=artist"));
            assert!(seen_uri.contains("forceWorkerId=fast"));

            // Client -> server application message.
            let frame = ws.next().await.unwrap().unwrap();
            let envelope = Envelope::from_text(frame.to_text().unwrap()).unwrap();
            assert_eq!(envelope.kind, "jobRequest");

            // Server -> client event.
            let event = Envelope::encode(
                "jobProgress",
                &json!({
                    "jobID": "p1", "imgID": "i1", "hasImage": false,
                    "step": 5, "stepCount": 20
                }),
            )
            .unwrap();
            ws.send(WsMessage::Text(event.into_text().unwrap()))
                .await
                .unwrap();
            // Keep the connection up until the client has read the event.
            let _ = ws.next().await;
        });

        let client = test_client(addr);
        let mut rx = client.subscribe();
        client.connect();
        wait_connected(&mut rx).await;

        client
            .send("jobRequest", &json!({"jobID": "p1"}))
            .await
            .unwrap();

        loop {
            match rx.recv().await.unwrap() {
                SocketEvent::Message(ServerEvent::JobProgress(JobProgressData {
                    job_id,
                    step,
                    ..
                })) => {
                    assert_eq!(job_id, "p1");
                    assert_eq!(step, 5);
                    break;
                }
                SocketEvent::Disconnected { code, reason } => {
                    panic!("unexpected disconnect: {code:?} {reason}");
                }
                _ => {}
            }
        }
        client.disconnect();
        server.abort();
    }

    #[tokio::test]
    async fn send_races_the_connect_and_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let frame = ws.next().await.unwrap().unwrap();
            let envelope = Envelope::from_text(frame.to_text().unwrap()).unwrap();
            assert_eq!(envelope.kind, "jobRequest");
        });

        let client = test_client(addr);
        client.connect();
        // No waiting for the connected event: send must poll through the
        // Connecting state on its own.
        client
            .send("jobRequest", &json!({"jobID": "p2"}))
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn surfaces_server_close_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::from(4021),
                reason: "authentication failure".into(),
            }))
            .await
            .unwrap();
        });

        let client = test_client(addr);
        let mut rx = client.subscribe();
        client.connect();
        loop {
            if let SocketEvent::Disconnected { code, reason } = rx.recv().await.unwrap() {
                assert_eq!(code, Some(4021));
                assert_eq!(reason, "authentication failure");
                break;
            }
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn manual_disconnect_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let client = test_client(addr);
        let mut rx = client.subscribe();
        client.connect();
        wait_connected(&mut rx).await;
        client.disconnect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn send_while_disconnected_fails_fast() {
        let client = test_client("127.0.0.1:9".parse().unwrap());
        let err = client
            .send("jobRequest", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn send_times_out_when_the_connect_never_completes() {
        // Nothing listens here, but the handshake failure also takes time;
        // bind a listener that accepts and never answers the upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // Hold the TCP connection open without completing the
            // websocket handshake.
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = test_client(addr);
        client.connect();
        let err = client
            .send("jobRequest", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionTimeout | Error::ConnectionFailed
        ));
        assert!(!client.is_connected());
    }
}
