//! Internal signal families produced by the event router.
//!
//! Raw socket events are normalized into two families before they touch
//! any state machine: project-scoped signals and job-scoped signals.
//! Everything downstream of the router works in these terms, never in
//! wire shapes.

use crate::error::ErrorData;

/// Signals addressed to a project as a whole.
#[derive(Debug, Clone)]
pub(crate) enum ProjectSignal {
    Queued { queue_position: i64 },
    /// Server-side completion marker for the whole project.
    Completed,
    Error { error: ErrorData },
}

/// Signals addressed to one job within a project.
#[derive(Debug, Clone)]
pub(crate) enum JobSignal {
    Initiating,
    Started,
    Progress { step: u32, step_count: u32 },
    Preview { url: String },
    Completed { steps: u32, result_url: Option<String>, canceled: bool },
    Error { error: ErrorData },
}
