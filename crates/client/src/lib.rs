//! Client session layer for the Pictor generation network.
//!
//! Talks to the service over two transports: a REST API for account and
//! asset operations and a persistent websocket for generation traffic.
//! The crate keeps the session alive across token expiry and transient
//! socket drops, and turns the server's event stream into per-project
//! and per-job state machines a caller can await.
//!
//! ```no_run
//! use pictor::{ClientConfig, PictorClient};
//! use pictor::auth::AuthCredentials;
//! use pictor::projects::ProjectParams;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PictorClient::new(ClientConfig::new("my-app"))?;
//! client.auth().authenticate(AuthCredentials {
//!     token: None,
//!     refresh_token: "...".into(),
//! }).await?;
//!
//! let project = client.projects.create(ProjectParams {
//!     model_id: "flux.1-schnell".into(),
//!     positive_prompt: "a lighthouse at dusk".into(),
//!     ..ProjectParams::default()
//! }).await?;
//! let urls = project.wait_for_completion().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod projects;
pub mod rest;
pub mod socket;

pub use client::{ApiClient, AuthMode, ClientEvent, ClientOptions};
pub use error::{Error, ErrorData, Result};
pub use projects::{
    Job, JobEvent, JobField, JobStatus, Project, ProjectEvent, ProjectField, ProjectStatus,
    ProjectsApi,
};
pub use socket::NetworkTier;

use std::time::Duration;

use url::Url;

const DEFAULT_REST_ENDPOINT: &str = "https://api.pictor.dev";
const DEFAULT_SOCKET_ENDPOINT: &str = "wss://socket.pictor.dev";

/// Top-level configuration. Only the application id is required; the
/// endpoint overrides exist for self-hosted deployments and tests.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub app_id: String,
    pub rest_endpoint: Option<String>,
    pub socket_endpoint: Option<String>,
    pub network: NetworkTier,
    pub auth_mode: AuthMode,
    pub disable_socket: bool,
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            rest_endpoint: None,
            socket_endpoint: None,
            network: NetworkTier::default(),
            auth_mode: AuthMode::Token,
            disable_socket: false,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Assembled client. Construction wires the transports together and
/// spawns the supervising tasks, so it must happen inside a Tokio
/// runtime.
pub struct PictorClient {
    pub projects: ProjectsApi,
    api: ApiClient,
}

impl PictorClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let rest_url = Url::parse(
            config.rest_endpoint.as_deref().unwrap_or(DEFAULT_REST_ENDPOINT),
        )?;
        let socket_url = Url::parse(
            config.socket_endpoint.as_deref().unwrap_or(DEFAULT_SOCKET_ENDPOINT),
        )?;
        let mut options = ClientOptions::new(config.app_id, rest_url, socket_url);
        options.network = config.network;
        options.auth_mode = config.auth_mode;
        options.disable_socket = config.disable_socket;
        options.reconnect_delay = config.reconnect_delay;
        let api = ApiClient::new(options)?;
        let projects = ProjectsApi::new(api.clone());
        Ok(Self { projects, api })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn auth(&self) -> &auth::AuthManager {
        self.api.auth()
    }

    pub fn socket(&self) -> &socket::SocketClient {
        self.api.socket()
    }

    pub fn is_authenticated(&self) -> bool {
        self.api.is_authenticated()
    }

    /// Drop the session: clears credentials, which in turn closes the
    /// socket.
    pub fn logout(&self) {
        self.api.auth().clear();
    }
}
