//! Project tracking: request creation, socket event routing, and the
//! registry of in-flight projects.
//!
//! A routing task listens on the raw socket stream, normalizes each wire
//! event into a project- or job-scoped signal, and forwards it to the
//! owning state machine. Events for unknown projects are logged and
//! dropped. Settled projects linger in the registry for a grace period so
//! stragglers still find them, then a sweep evicts them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use pictor_protocol::error_code::ErrorCodeTable;
use pictor_protocol::events::{JobStateData, ServerEvent};
use pictor_protocol::rest::ApiResponse;

use crate::client::{ApiClient, ClientEvent};
use crate::error::{ErrorData, Result};
use crate::socket::SocketEvent;

mod events;
pub mod job;
pub mod project;
mod request;

pub use job::{Job, JobEvent, JobField, JobStatus};
pub use project::{Project, ProjectEvent, ProjectField, ProjectStatus};

use events::{JobSignal, ProjectSignal};
use job::JobDelta;

/// How long a settled project stays findable for late events.
const GARBAGE_COLLECT_TIMEOUT: Duration = Duration::from_secs(10);

const DOWNLOAD_URL_PATH: &str = "/v1/image/downloadUrl";

/// Parameters for one generation request.
#[derive(Debug, Clone)]
pub struct ProjectParams {
    pub model_id: String,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub style_prompt: String,
    pub steps: u32,
    pub guidance: f64,
    pub seed: Option<String>,
    pub number_of_images: u32,
    pub number_of_previews: u32,
    /// Fetch result URLs even when the server flags the output.
    pub disable_nsfw_filter: bool,
    pub scheduler: Option<String>,
}

impl Default for ProjectParams {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            positive_prompt: String::new(),
            negative_prompt: String::new(),
            style_prompt: String::new(),
            steps: 20,
            guidance: 7.5,
            seed: None,
            number_of_images: 1,
            number_of_previews: 0,
            disable_nsfw_filter: false,
            scheduler: None,
        }
    }
}

struct ProjectsState {
    client: ApiClient,
    projects: Mutex<Vec<Project>>,
    error_codes: Mutex<ErrorCodeTable>,
    gc_grace: Duration,
}

/// Entry point for creating and tracking projects.
#[derive(Clone)]
pub struct ProjectsApi {
    inner: Arc<ProjectsState>,
}

impl ProjectsApi {
    pub(crate) fn new(client: ApiClient) -> Self {
        Self::with_gc_grace(client, GARBAGE_COLLECT_TIMEOUT)
    }

    fn with_gc_grace(client: ApiClient, gc_grace: Duration) -> Self {
        let socket_rx = client.socket().subscribe();
        let client_rx = client.subscribe();
        let auth_rx = client.auth().subscribe();
        let inner = Arc::new(ProjectsState {
            client,
            projects: Mutex::new(Vec::new()),
            error_codes: Mutex::new(ErrorCodeTable::default()),
            gc_grace,
        });
        tokio::spawn(route_loop(Arc::downgrade(&inner), socket_rx, client_rx, auth_rx));
        Self { inner }
    }

    /// Send a generation request over the socket and start tracking it.
    /// Fails with [`crate::Error::NotConnected`] when the socket is down.
    pub async fn create(&self, params: ProjectParams) -> Result<Project> {
        let id = Uuid::new_v4().to_string();
        let request = request::build_job_request(&id, &params);
        let project = Project::new(id, params);
        // Register before sending so the first server event cannot race
        // past an empty registry.
        self.inner.projects.lock().push(project.clone());
        if let Err(e) = self.inner.client.socket().send("jobRequest", &request).await {
            self.inner.projects.lock().retain(|p| p.id() != project.id());
            return Err(e);
        }
        debug!(target: "pictor.projects", project = %project.id(), "submitted generation request");
        Ok(project)
    }

    pub fn get(&self, id: &str) -> Option<Project> {
        find_project(&self.inner, id)
    }

    pub fn list(&self) -> Vec<Project> {
        self.inner.projects.lock().clone()
    }

    /// Teach the error-code table an additional failure phrase.
    pub fn register_error_code(&self, reason: impl Into<String>, code: u32) {
        self.inner.error_codes.lock().register(reason, code);
    }
}

async fn route_loop(
    state: Weak<ProjectsState>,
    mut socket_rx: broadcast::Receiver<SocketEvent>,
    mut client_rx: broadcast::Receiver<ClientEvent>,
    mut auth_rx: broadcast::Receiver<bool>,
) {
    loop {
        tokio::select! {
            // In-order polling: a terminal disconnect that also clears the
            // session must be seen before the logout it triggers.
            biased;
            event = socket_rx.recv() => match event {
                Ok(SocketEvent::Message(event)) => {
                    let Some(state) = state.upgrade() else { break };
                    route_server_event(&state, event).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(target: "pictor.projects", missed, "router lagged on socket events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = client_rx.recv() => match event {
                Ok(ClientEvent::Disconnected { .. }) => {
                    let Some(state) = state.upgrade() else { break };
                    fail_in_flight(&state, "Server disconnected");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            update = auth_rx.recv() => match update {
                // Logout: nothing in flight can finish.
                Ok(false) => {
                    let Some(state) = state.upgrade() else { break };
                    fail_in_flight(&state, "Logged out");
                }
                Ok(true) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn route_server_event(state: &Arc<ProjectsState>, event: ServerEvent) {
    match event {
        ServerEvent::JobState(data) => match data {
            JobStateData::Queued { job_id, queue_position } => {
                dispatch_project(state, &job_id, ProjectSignal::Queued { queue_position });
            }
            JobStateData::JobCompleted { job_id } => {
                dispatch_project(state, &job_id, ProjectSignal::Completed);
            }
            JobStateData::InitiatingModel { job_id, img_id, .. } => {
                dispatch_job(state, &job_id, &img_id, JobSignal::Initiating);
            }
            JobStateData::JobStarted { job_id, img_id, .. } => {
                dispatch_job(state, &job_id, &img_id, JobSignal::Started);
            }
        },
        ServerEvent::JobProgress(data) => {
            dispatch_job(
                state,
                &data.job_id,
                &data.img_id,
                JobSignal::Progress { step: data.step, step_count: data.step_count },
            );
            if data.has_image {
                // Fetching the preview URL must not stall routing.
                let state = Arc::downgrade(state);
                tokio::spawn(async move {
                    let Some(state) = state.upgrade() else { return };
                    match fetch_image_url(&state, &data.job_id, &data.img_id, "preview").await {
                        Ok(url) => {
                            dispatch_job(&state, &data.job_id, &data.img_id, JobSignal::Preview { url });
                        }
                        Err(e) => {
                            warn!(target: "pictor.projects", job = %data.img_id, error = %e, "preview url fetch failed");
                        }
                    }
                });
            }
        }
        ServerEvent::JobResult(data) => {
            let Some(project) = find_project(state, &data.job_id) else {
                debug!(target: "pictor.projects", project = %data.job_id, "result for untracked project");
                return;
            };
            let filtered = data.triggered_nsfw_filter && !project.params().disable_nsfw_filter;
            let mut result_url = None;
            if !filtered && !data.user_canceled {
                match fetch_image_url(state, &data.job_id, &data.img_id, "complete").await {
                    Ok(url) => result_url = Some(url),
                    Err(e) => {
                        warn!(target: "pictor.projects", job = %data.img_id, error = %e, "result url fetch failed");
                    }
                }
            }
            dispatch_job(
                state,
                &data.job_id,
                &data.img_id,
                JobSignal::Completed {
                    steps: data.performed_step_count,
                    result_url,
                    canceled: data.user_canceled,
                },
            );
        }
        ServerEvent::JobError(data) => {
            let code = state.error_codes.lock().resolve(&data.error);
            let error = ErrorData { code, message: data.error_message };
            match data.img_id {
                Some(img_id) => dispatch_job(state, &data.job_id, &img_id, JobSignal::Error { error }),
                None => dispatch_project(state, &data.job_id, ProjectSignal::Error { error }),
            }
        }
        ServerEvent::SwarmModels(models) => {
            debug!(target: "pictor.projects", models = models.len(), "model availability update");
        }
        ServerEvent::Other { kind } => {
            debug!(target: "pictor.projects", %kind, "ignoring unhandled event");
        }
    }
}

fn dispatch_project(state: &Arc<ProjectsState>, project_id: &str, signal: ProjectSignal) {
    let Some(project) = find_project(state, project_id) else {
        debug!(target: "pictor.projects", project = %project_id, "event for untracked project");
        return;
    };
    match signal {
        ProjectSignal::Queued { queue_position } => project.mark_queued(queue_position),
        ProjectSignal::Completed => project.server_completed(),
        ProjectSignal::Error { error } => project.fail(error),
    }
    maybe_schedule_gc(state, &project);
}

fn dispatch_job(state: &Arc<ProjectsState>, project_id: &str, job_id: &str, signal: JobSignal) {
    let Some(project) = find_project(state, project_id) else {
        debug!(target: "pictor.projects", project = %project_id, "event for untracked project");
        return;
    };
    match signal {
        JobSignal::Initiating => {
            project.apply_job(job_id, JobDelta { status: Some(JobStatus::Initiating), ..Default::default() });
        }
        JobSignal::Started => {
            project.apply_job(job_id, JobDelta { status: Some(JobStatus::Processing), ..Default::default() });
        }
        JobSignal::Progress { step, step_count } => {
            project.apply_job(
                job_id,
                JobDelta {
                    status: Some(JobStatus::Processing),
                    step: Some(step),
                    step_count: Some(step_count),
                    ..Default::default()
                },
            );
            project.mark_processing();
        }
        JobSignal::Preview { url } => {
            project.apply_job(job_id, JobDelta { preview_url: Some(url), ..Default::default() });
        }
        JobSignal::Completed { steps, result_url, canceled } => {
            let status = if canceled { JobStatus::Canceled } else { JobStatus::Completed };
            project.apply_job(
                job_id,
                JobDelta { status: Some(status), step: Some(steps), result_url, ..Default::default() },
            );
        }
        JobSignal::Error { error } => {
            project.apply_job(
                job_id,
                JobDelta { status: Some(JobStatus::Failed), error: Some(error), ..Default::default() },
            );
        }
    }
    maybe_schedule_gc(state, &project);
}

/// The session is over (terminal disconnect or logout); nothing in
/// flight can finish.
fn fail_in_flight(state: &Arc<ProjectsState>, reason: &str) {
    let projects = state.projects.lock().clone();
    for project in projects {
        if !project.is_terminal() {
            project.fail(ErrorData { code: 0, message: reason.into() });
        }
        maybe_schedule_gc(state, &project);
    }
}

fn find_project(state: &ProjectsState, id: &str) -> Option<Project> {
    state.projects.lock().iter().find(|p| p.id() == id).cloned()
}

fn maybe_schedule_gc(state: &Arc<ProjectsState>, project: &Project) {
    if !project.is_terminal() || !project.mark_gc_scheduled() {
        return;
    }
    let grace = state.gc_grace;
    let state = Arc::downgrade(state);
    let id = project.id().to_string();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if let Some(state) = state.upgrade() {
            state.projects.lock().retain(|p| p.id() != id);
            debug!(target: "pictor.projects", project = %id, "evicted settled project");
        }
    });
}

#[derive(Deserialize)]
struct DownloadUrlData {
    #[serde(rename = "downloadUrl")]
    download_url: String,
}

async fn fetch_image_url(
    state: &ProjectsState,
    project_id: &str,
    job_id: &str,
    kind: &str,
) -> Result<String> {
    let response: ApiResponse<DownloadUrlData> = state
        .client
        .rest()
        .get(
            DOWNLOAD_URL_PATH,
            &[("jobId", project_id), ("imageId", job_id), ("type", kind)],
        )
        .await?;
    Ok(response.data.download_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiClient, ClientOptions};
    use axum::Json;
    use axum::extract::Query;
    use axum::routing::get;
    use pictor_protocol::error_code::RawErrorCode;
    use pictor_protocol::events::{JobErrorData, JobProgressData, JobResultData};
    use serde_json::json;
    use std::collections::HashMap;
    use url::Url;

    fn offline_client() -> ApiClient {
        let dead = Url::parse("http://127.0.0.1:1").unwrap();
        let dead_ws = Url::parse("ws://127.0.0.1:1").unwrap();
        ApiClient::new(ClientOptions::new("app-1", dead, dead_ws)).unwrap()
    }

    async fn rest_backed_client() -> ApiClient {
        let app = axum::Router::new().route(
            DOWNLOAD_URL_PATH,
            get(|Query(q): Query<HashMap<String, String>>| async move {
                Json(json!({
                    "status": "success",
                    "data": { "downloadUrl": format!("https://cdn/{}/{}.png", q["type"], q["imageId"]) },
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        let rest = Url::parse(&format!("http://{addr}")).unwrap();
        let dead_ws = Url::parse("ws://127.0.0.1:1").unwrap();
        ApiClient::new(ClientOptions::new("app-1", rest, dead_ws)).unwrap()
    }

    fn track(api: &ProjectsApi, id: &str, params: ProjectParams) -> Project {
        let project = Project::new(id.to_string(), params);
        api.inner.projects.lock().push(project.clone());
        project
    }

    fn progress_event(project: &str, job: &str, step: u32, step_count: u32) -> ServerEvent {
        ServerEvent::JobProgress(JobProgressData {
            job_id: project.into(),
            img_id: job.into(),
            has_image: false,
            step,
            step_count,
        })
    }

    #[tokio::test]
    async fn progress_events_drive_the_job_and_project() {
        let api = ProjectsApi::new(offline_client());
        let project = track(&api, "p1", ProjectParams::default());
        route_server_event(&api.inner, progress_event("p1", "i1", 5, 20)).await;
        assert_eq!(project.status(), ProjectStatus::Processing);
        let job = project.job("i1").unwrap();
        assert_eq!(job.status(), JobStatus::Processing);
        assert_eq!(job.step(), 5);
        assert_eq!(project.progress(), 25);
    }

    #[tokio::test]
    async fn events_for_unknown_projects_are_dropped() {
        let api = ProjectsApi::new(offline_client());
        route_server_event(&api.inner, progress_event("ghost", "i1", 5, 20)).await;
        assert!(api.list().is_empty());
    }

    #[tokio::test]
    async fn result_event_completes_the_job_with_a_url() {
        let api = ProjectsApi::new(rest_backed_client().await);
        let project = track(&api, "p1", ProjectParams::default());
        route_server_event(
            &api.inner,
            ServerEvent::JobResult(JobResultData {
                job_id: "p1".into(),
                img_id: "i1".into(),
                performed_step_count: 20,
                last_seed: "42".into(),
                user_canceled: false,
                triggered_nsfw_filter: false,
            }),
        )
        .await;
        assert_eq!(project.status(), ProjectStatus::Completed);
        assert_eq!(project.result_urls(), vec!["https://cdn/complete/i1.png".to_string()]);
    }

    #[tokio::test]
    async fn filtered_results_complete_without_a_url() {
        let api = ProjectsApi::new(rest_backed_client().await);
        let project = track(&api, "p1", ProjectParams::default());
        route_server_event(
            &api.inner,
            ServerEvent::JobResult(JobResultData {
                job_id: "p1".into(),
                img_id: "i1".into(),
                performed_step_count: 20,
                last_seed: "0".into(),
                user_canceled: false,
                triggered_nsfw_filter: true,
            }),
        )
        .await;
        let job = project.job("i1").unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.result_url(), None);
        assert!(project.result_urls().is_empty());
    }

    #[tokio::test]
    async fn symbolic_worker_errors_resolve_through_the_table() {
        let api = ProjectsApi::new(offline_client());
        let project = track(&api, "p1", ProjectParams::default());
        route_server_event(
            &api.inner,
            ServerEvent::JobError(JobErrorData {
                job_id: "p1".into(),
                img_id: Some("i1".into()),
                is_from_worker: true,
                error_message: "timed out".into(),
                error: RawErrorCode::Symbol("job timed out".into()),
            }),
        )
        .await;
        assert_eq!(project.status(), ProjectStatus::Failed);
        assert_eq!(
            project.error(),
            Some(ErrorData { code: 5003, message: "timed out".into() })
        );
    }

    #[tokio::test]
    async fn project_level_errors_fail_everything_outstanding() {
        let api = ProjectsApi::new(offline_client());
        let project = track(
            &api,
            "p1",
            ProjectParams { number_of_images: 2, ..ProjectParams::default() },
        );
        route_server_event(&api.inner, progress_event("p1", "i1", 3, 20)).await;
        route_server_event(
            &api.inner,
            ServerEvent::JobError(JobErrorData {
                job_id: "p1".into(),
                img_id: None,
                is_from_worker: false,
                error_message: "restarting".into(),
                error: RawErrorCode::Symbol("server restarting".into()),
            }),
        )
        .await;
        assert_eq!(project.status(), ProjectStatus::Failed);
        assert_eq!(project.job("i1").unwrap().status(), JobStatus::Canceled);
        assert_eq!(
            project.wait_for_completion().await,
            Err(ErrorData { code: 5001, message: "restarting".into() })
        );
    }

    #[tokio::test]
    async fn registered_error_codes_take_effect() {
        let api = ProjectsApi::new(offline_client());
        api.register_error_code("gpu on fire", 5100);
        let project = track(&api, "p1", ProjectParams::default());
        route_server_event(
            &api.inner,
            ServerEvent::JobError(JobErrorData {
                job_id: "p1".into(),
                img_id: None,
                is_from_worker: false,
                error_message: "hardware fault".into(),
                error: RawErrorCode::Symbol("gpu on fire".into()),
            }),
        )
        .await;
        assert_eq!(project.error().map(|e| e.code), Some(5100));
    }

    #[tokio::test]
    async fn settled_projects_are_evicted_after_the_grace_period() {
        let api = ProjectsApi::with_gc_grace(offline_client(), Duration::from_millis(30));
        let project = track(&api, "p1", ProjectParams::default());
        route_server_event(
            &api.inner,
            ServerEvent::JobError(JobErrorData {
                job_id: "p1".into(),
                img_id: None,
                is_from_worker: false,
                error_message: "canceled".into(),
                error: RawErrorCode::Number(5004),
            }),
        )
        .await;
        assert!(project.is_terminal());
        assert!(api.get("p1").is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(api.get("p1").is_none());
    }

    #[tokio::test]
    async fn logout_fails_in_flight_projects() {
        use crate::auth::{AuthCredentials, jwt};
        use std::time::SystemTime;

        let client = offline_client();
        let expiry = SystemTime::now() + Duration::from_secs(3600);
        client
            .auth()
            .authenticate(AuthCredentials {
                token: Some(jwt::forge(expiry)),
                refresh_token: jwt::forge(expiry),
            })
            .await
            .unwrap();
        let api = ProjectsApi::new(client.clone());
        let project = track(&api, "p1", ProjectParams::default());

        client.auth().clear();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(project.status(), ProjectStatus::Failed);
        assert_eq!(
            project.error(),
            Some(ErrorData { code: 0, message: "Logged out".into() })
        );
    }

    #[tokio::test]
    async fn terminal_disconnect_fails_all_in_flight_projects() {
        let api = ProjectsApi::new(offline_client());
        let running = track(&api, "p1", ProjectParams::default());
        let settled = track(&api, "p2", ProjectParams::default());
        route_server_event(
            &api.inner,
            ServerEvent::JobResult(JobResultData {
                job_id: "p2".into(),
                img_id: "i1".into(),
                performed_step_count: 20,
                last_seed: "0".into(),
                user_canceled: true,
                triggered_nsfw_filter: false,
            }),
        )
        .await;
        fail_in_flight(&api.inner, "Server disconnected");
        assert_eq!(running.status(), ProjectStatus::Failed);
        assert_eq!(
            running.error(),
            Some(ErrorData { code: 0, message: "Server disconnected".into() })
        );
        // Already-settled projects keep their original outcome.
        assert_ne!(
            settled.error(),
            Some(ErrorData { code: 0, message: "Server disconnected".into() })
        );
    }

    #[tokio::test]
    async fn auth_rejection_close_reports_a_disconnect_not_a_logout() {
        use crate::auth::{AuthCredentials, jwt};
        use std::time::SystemTime;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socket_url = Url::parse(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::from(4021),
                reason: "invalid token".into(),
            }))
            .await
            .unwrap();
        });

        let dead_rest = Url::parse("http://127.0.0.1:1").unwrap();
        let client = ApiClient::new(ClientOptions::new("app-1", dead_rest, socket_url)).unwrap();
        let api = ProjectsApi::new(client.clone());
        let project = track(&api, "p1", ProjectParams::default());

        // Authentication brings the socket up; the server rejects it with
        // an auth close, which both ends the connection and clears the
        // session. The disconnect must win the race against the logout.
        let expiry = SystemTime::now() + Duration::from_secs(3600);
        client
            .auth()
            .authenticate(AuthCredentials {
                token: Some(jwt::forge(expiry)),
                refresh_token: jwt::forge(expiry),
            })
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), project.wait_for_completion())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, ErrorData { code: 0, message: "Server disconnected".into() });
    }
}
