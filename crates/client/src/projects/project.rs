//! Project aggregate state machine.
//!
//! A Project owns the jobs spawned for one generation request and settles
//! exactly once: `completed` when the work is done and at least one job
//! produced a result, `failed` otherwise. Terminal states are absorbing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ErrorData;
use crate::projects::ProjectParams;
use crate::projects::job::{Job, JobDelta, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectField {
    Status,
    QueuePosition,
    Error,
    Jobs,
}

#[derive(Debug, Clone)]
pub enum ProjectEvent {
    Updated(Vec<ProjectField>),
    /// Whole-number percentage over all expected jobs. Emitted only when
    /// the rounded value moves.
    Progress(u32),
    /// Result URLs of the jobs that completed with an image.
    Completed(Vec<String>),
    Failed(ErrorData),
}

struct ProjectState {
    status: ProjectStatus,
    queue_position: i64,
    error: Option<ErrorData>,
    jobs: Vec<Job>,
    /// Last emitted percentage, -1 until the first emission.
    last_progress: i64,
    /// Server said the whole project is done; jobs we never heard about
    /// will not arrive.
    server_complete: bool,
}

struct ProjectInner {
    id: String,
    created_at: SystemTime,
    params: ProjectParams,
    state: Mutex<ProjectState>,
    gc_scheduled: AtomicBool,
    events: broadcast::Sender<ProjectEvent>,
}

enum Outcome {
    Completed(Vec<String>),
    Failed(ErrorData),
}

/// Handle to a project; clones share state.
#[derive(Clone)]
pub struct Project {
    inner: Arc<ProjectInner>,
}

impl Project {
    pub(crate) fn new(id: String, params: ProjectParams) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            inner: Arc::new(ProjectInner {
                id,
                created_at: SystemTime::now(),
                params,
                state: Mutex::new(ProjectState {
                    status: ProjectStatus::Pending,
                    queue_position: -1,
                    error: None,
                    jobs: Vec::new(),
                    last_progress: -1,
                    server_complete: false,
                }),
                gc_scheduled: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.inner.created_at
    }

    pub fn params(&self) -> &ProjectParams {
        &self.inner.params
    }

    pub fn status(&self) -> ProjectStatus {
        self.inner.state.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Position in the server queue, -1 until the server reports one.
    pub fn queue_position(&self) -> i64 {
        self.inner.state.lock().queue_position
    }

    pub fn error(&self) -> Option<ErrorData> {
        self.inner.state.lock().error.clone()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.inner.state.lock().jobs.clone()
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.inner.state.lock().jobs.iter().find(|j| j.id() == id).cloned()
    }

    /// Result URLs of completed jobs, in job order.
    pub fn result_urls(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .jobs
            .iter()
            .filter(|j| j.status() == JobStatus::Completed)
            .filter_map(|j| j.result_url())
            .collect()
    }

    /// Whole-number percentage across all expected jobs.
    pub fn progress(&self) -> u32 {
        let state = self.inner.state.lock();
        compute_progress(&state, &self.inner.params)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProjectEvent> {
        self.inner.events.subscribe()
    }

    /// Resolve once the project settles. Returns the result URLs on
    /// completion or the project error on failure. Subscribes before
    /// releasing the state lock, so a settlement racing this call is
    /// never missed.
    pub async fn wait_for_completion(&self) -> Result<Vec<String>, ErrorData> {
        let mut rx = {
            let state = self.inner.state.lock();
            match state.status {
                ProjectStatus::Completed => return Ok(self.collect_urls(&state)),
                ProjectStatus::Failed => return Err(settled_error(&state)),
                _ => self.inner.events.subscribe(),
            }
        };
        loop {
            match rx.recv().await {
                Ok(ProjectEvent::Completed(urls)) => return Ok(urls),
                Ok(ProjectEvent::Failed(error)) => return Err(error),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Dropped events may have included the settlement.
                    let state = self.inner.state.lock();
                    match state.status {
                        ProjectStatus::Completed => return Ok(self.collect_urls(&state)),
                        ProjectStatus::Failed => return Err(settled_error(&state)),
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ErrorData { code: 0, message: "project dropped".into() });
                }
            }
        }
    }

    fn collect_urls(&self, state: &ProjectState) -> Vec<String> {
        state
            .jobs
            .iter()
            .filter(|j| j.status() == JobStatus::Completed)
            .filter_map(|j| j.result_url())
            .collect()
    }

    // One GC sweep per project.
    pub(crate) fn mark_gc_scheduled(&self) -> bool {
        !self.inner.gc_scheduled.swap(true, Ordering::SeqCst)
    }

    /// Server accepted the request and queued it.
    pub(crate) fn mark_queued(&self, queue_position: i64) {
        let changed = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                return;
            }
            let mut changed = Vec::new();
            if state.status == ProjectStatus::Pending {
                state.status = ProjectStatus::Queued;
                changed.push(ProjectField::Status);
            }
            if state.queue_position != queue_position {
                state.queue_position = queue_position;
                changed.push(ProjectField::QueuePosition);
            }
            changed
        };
        self.finish_update(changed);
    }

    /// First sign of actual work.
    pub(crate) fn mark_processing(&self) {
        let changed = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() || state.status == ProjectStatus::Processing {
                return;
            }
            state.status = ProjectStatus::Processing;
            vec![ProjectField::Status]
        };
        self.finish_update(changed);
    }

    /// Server-side "everything for this project is done" marker. Jobs we
    /// never heard about will not arrive, so aggregation may settle with
    /// fewer jobs than requested.
    pub(crate) fn server_completed(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() || state.server_complete {
                return;
            }
            state.server_complete = true;
        }
        self.finish_update(Vec::new());
        self.try_finalize();
    }

    /// Project-level error. Outstanding jobs are canceled so aggregation
    /// can settle, then the project fails with this error.
    pub(crate) fn fail(&self, error: ErrorData) {
        let jobs = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                return;
            }
            if state.error.is_none() {
                state.error = Some(error);
            }
            state.jobs.clone()
        };
        let mut changed = vec![ProjectField::Error];
        let mut any_canceled = false;
        for job in &jobs {
            if !job.status().is_terminal() {
                job.apply(JobDelta { status: Some(JobStatus::Canceled), ..Default::default() });
                any_canceled = true;
            }
        }
        if any_canceled {
            changed.push(ProjectField::Jobs);
        }
        self.finish_update(changed);
        self.try_finalize();
    }

    /// Merge a delta into the identified job, creating it on first
    /// contact. Progress can outrun the start signal, so creation here is
    /// the normal path, not an error.
    pub(crate) fn apply_job(&self, job_id: &str, delta: JobDelta) {
        let (job, created) = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                return;
            }
            match state.jobs.iter().find(|j| j.id() == job_id) {
                Some(job) => (job.clone(), false),
                None => {
                    let job = Job::new(job_id.to_string(), self.inner.params.steps);
                    state.jobs.push(job.clone());
                    debug!(target: "pictor.project", project = %self.inner.id, job = %job_id, "tracking new job");
                    (job, true)
                }
            }
        };
        let job_changed = job.apply(delta);
        let changed = if created || !job_changed.is_empty() {
            vec![ProjectField::Jobs]
        } else {
            Vec::new()
        };
        self.finish_update(changed);
        self.try_finalize();
    }

    fn finish_update(&self, changed: Vec<ProjectField>) {
        if !changed.is_empty() {
            let _ = self.inner.events.send(ProjectEvent::Updated(changed));
        }
        let progress = {
            let mut state = self.inner.state.lock();
            let pct = i64::from(compute_progress(&state, &self.inner.params));
            if pct != state.last_progress {
                state.last_progress = pct;
                Some(pct as u32)
            } else {
                None
            }
        };
        if let Some(pct) = progress {
            let _ = self.inner.events.send(ProjectEvent::Progress(pct));
        }
    }

    /// Settle when every known job is terminal and the job set is known
    /// to be complete, either because the server said so or because all
    /// expected jobs have appeared. Without that guard a one-of-many
    /// project would settle as soon as its first job finished.
    fn try_finalize(&self) {
        let outcome = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                return;
            }
            if !state.jobs.iter().all(|j| j.status().is_terminal()) {
                return;
            }
            let expected = self.inner.params.number_of_images as usize;
            let set_complete = state.server_complete || state.jobs.len() >= expected;
            if let Some(error) = state.error.clone() {
                state.status = ProjectStatus::Failed;
                Outcome::Failed(error)
            } else if set_complete && !state.jobs.is_empty() {
                if state.jobs.iter().any(|j| j.status() == JobStatus::Completed) {
                    state.status = ProjectStatus::Completed;
                    Outcome::Completed(self.collect_urls(&state))
                } else {
                    let error = state
                        .jobs
                        .iter()
                        .find_map(|j| j.error())
                        .unwrap_or(ErrorData { code: 0, message: "no job completed".into() });
                    state.error = Some(error.clone());
                    state.status = ProjectStatus::Failed;
                    Outcome::Failed(error)
                }
            } else if state.server_complete && state.jobs.is_empty() {
                state.status = ProjectStatus::Completed;
                Outcome::Completed(Vec::new())
            } else {
                return;
            }
        };
        let _ = self.inner.events.send(ProjectEvent::Updated(vec![ProjectField::Status]));
        match outcome {
            Outcome::Completed(urls) => {
                debug!(target: "pictor.project", project = %self.inner.id, images = urls.len(), "project completed");
                let _ = self.inner.events.send(ProjectEvent::Completed(urls));
            }
            Outcome::Failed(error) => {
                debug!(target: "pictor.project", project = %self.inner.id, code = error.code, "project failed");
                let _ = self.inner.events.send(ProjectEvent::Failed(error));
            }
        }
    }
}

fn settled_error(state: &ProjectState) -> ErrorData {
    state
        .error
        .clone()
        .unwrap_or(ErrorData { code: 0, message: "project failed".into() })
}

fn compute_progress(state: &ProjectState, params: &ProjectParams) -> u32 {
    let steps_per_job = state.jobs.first().map(Job::step_count).unwrap_or(params.steps);
    let denominator = u64::from(steps_per_job) * u64::from(params.number_of_images);
    if denominator == 0 {
        return 0;
    }
    let done: u64 = state.jobs.iter().map(|j| u64::from(j.step())).sum();
    // Jobs can disagree on step count while the denominator is scaled
    // from the first one's, so cap the result.
    (((done as f64 / denominator as f64) * 100.0).round() as u32).min(100)
}
