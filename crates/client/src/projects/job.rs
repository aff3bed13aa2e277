//! Job leaf state machine.
//!
//! A Job is one unit of work (one image) inside a Project. It is created
//! once (sometimes lazily, since the server may deliver a progress update
//! before any "started" signal) and mutated only through [`Job::apply`],
//! which merges a delta, computes which logical fields changed, and emits
//! one `Updated` notification carrying the changed-field set.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::ErrorData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Initiating,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Logical field names carried by `Updated` notifications. Observers get
/// the set of affected names, never old/new value pairs; derived getters
/// recompute on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobField {
    Status,
    Step,
    StepCount,
    PreviewUrl,
    ResultUrl,
    Error,
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    Updated(Vec<JobField>),
    /// Fraction of steps done, 0.0..=1.0.
    Progress(f64),
    /// Result URL when one exists; a job that tripped the content filter
    /// completes without one.
    Completed(Option<String>),
    Failed(ErrorData),
}

/// Partial update merged into the job state.
#[derive(Debug, Clone, Default)]
pub(crate) struct JobDelta {
    pub status: Option<JobStatus>,
    pub step: Option<u32>,
    pub step_count: Option<u32>,
    pub preview_url: Option<String>,
    pub result_url: Option<String>,
    pub error: Option<ErrorData>,
}

struct JobState {
    status: JobStatus,
    step: u32,
    step_count: u32,
    preview_url: Option<String>,
    result_url: Option<String>,
    error: Option<ErrorData>,
}

struct JobInner {
    id: String,
    state: Mutex<JobState>,
    events: broadcast::Sender<JobEvent>,
}

/// Handle to a job; clones share state.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub(crate) fn new(id: String, step_count: u32) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(JobInner {
                id,
                state: Mutex::new(JobState {
                    status: JobStatus::Pending,
                    step: 0,
                    step_count,
                    preview_url: None,
                    result_url: None,
                    error: None,
                }),
                events,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> JobStatus {
        self.inner.state.lock().status
    }

    pub fn step(&self) -> u32 {
        self.inner.state.lock().step
    }

    pub fn step_count(&self) -> u32 {
        self.inner.state.lock().step_count
    }

    /// Fraction of steps done, 0.0..=1.0.
    pub fn progress(&self) -> f64 {
        let state = self.inner.state.lock();
        if state.step_count == 0 {
            return 0.0;
        }
        f64::from(state.step) / f64::from(state.step_count)
    }

    pub fn preview_url(&self) -> Option<String> {
        self.inner.state.lock().preview_url.clone()
    }

    pub fn result_url(&self) -> Option<String> {
        self.inner.state.lock().result_url.clone()
    }

    /// Result when available, else the latest preview.
    pub fn image_url(&self) -> Option<String> {
        let state = self.inner.state.lock();
        state.result_url.clone().or_else(|| state.preview_url.clone())
    }

    pub fn error(&self) -> Option<ErrorData> {
        self.inner.state.lock().error.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Merge a delta and notify. Returns the changed-field set so the
    /// owning project can fold it into its own `jobs` notification.
    /// Terminal jobs absorb everything.
    pub(crate) fn apply(&self, delta: JobDelta) -> Vec<JobField> {
        let mut changed = Vec::new();
        let (progress, terminal_event) = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                return changed;
            }
            if let Some(step_count) = delta.step_count {
                if step_count != state.step_count {
                    state.step_count = step_count;
                    changed.push(JobField::StepCount);
                }
            }
            if let Some(step) = delta.step {
                // A worker may report a step past a reduced step count.
                let step = step.min(state.step_count);
                if step != state.step {
                    state.step = step;
                    changed.push(JobField::Step);
                }
            }
            if let Some(preview_url) = delta.preview_url {
                if state.preview_url.as_deref() != Some(preview_url.as_str()) {
                    state.preview_url = Some(preview_url);
                    changed.push(JobField::PreviewUrl);
                }
            }
            if let Some(result_url) = delta.result_url {
                if state.result_url.as_deref() != Some(result_url.as_str()) {
                    state.result_url = Some(result_url);
                    changed.push(JobField::ResultUrl);
                }
            }
            if let Some(error) = delta.error {
                if state.error.as_ref() != Some(&error) {
                    state.error = Some(error);
                    changed.push(JobField::Error);
                }
            }
            if let Some(status) = delta.status {
                if status != state.status {
                    state.status = status;
                    changed.push(JobField::Status);
                }
            }

            let progress = if changed.contains(&JobField::Step)
                || changed.contains(&JobField::StepCount)
            {
                if state.step_count == 0 {
                    Some(0.0)
                } else {
                    Some(f64::from(state.step) / f64::from(state.step_count))
                }
            } else {
                None
            };
            let terminal_event = if changed.contains(&JobField::Status) {
                match state.status {
                    JobStatus::Completed => Some(JobEvent::Completed(state.result_url.clone())),
                    JobStatus::Failed => Some(JobEvent::Failed(
                        state.error.clone().unwrap_or(ErrorData {
                            code: 0,
                            message: "job failed".into(),
                        }),
                    )),
                    _ => None,
                }
            } else {
                None
            };
            (progress, terminal_event)
        };

        if !changed.is_empty() {
            let _ = self.inner.events.send(JobEvent::Updated(changed.clone()));
        }
        if let Some(progress) = progress {
            let _ = self.inner.events.send(JobEvent::Progress(progress));
        }
        if let Some(event) = terminal_event {
            let _ = self.inner.events.send(event);
        }
        changed
    }
}
