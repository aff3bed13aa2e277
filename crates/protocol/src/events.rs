//! Inbound server event payloads.
//!
//! Field names mirror the wire exactly; the `jobID`/`imgID` naming is the
//! server's. On the wire `jobID` identifies the *project* (the whole
//! request) and `imgID` identifies the individual image job within it.
//! Only the event router in `pictor-client` is allowed to interpret that.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, WireError};
use crate::error_code::RawErrorCode;

/// All server-originated events the session layer understands.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    JobState(JobStateData),
    JobProgress(JobProgressData),
    JobResult(JobResultData),
    JobError(JobErrorData),
    /// Worker counts per model id. Thin config data; the session layer
    /// only logs it.
    SwarmModels(HashMap<String, u32>),
    /// Recognizably framed but unhandled event type.
    Other { kind: String },
}

impl ServerEvent {
    /// Decode a deframed envelope into a typed event.
    pub fn decode(envelope: &Envelope) -> Result<Self, WireError> {
        Ok(match envelope.kind.as_str() {
            "jobState" => Self::JobState(envelope.payload()?),
            "jobProgress" => Self::JobProgress(envelope.payload()?),
            "jobResult" => Self::JobResult(envelope.payload()?),
            "jobError" => Self::JobError(envelope.payload()?),
            "swarmModels" => Self::SwarmModels(envelope.payload()?),
            other => Self::Other {
                kind: other.to_string(),
            },
        })
    }
}

/// Queue/lifecycle notifications, discriminated by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobStateData {
    #[serde(rename = "queued")]
    Queued {
        #[serde(rename = "jobID")]
        job_id: String,
        #[serde(rename = "queuePosition")]
        queue_position: i64,
    },
    #[serde(rename = "initiatingModel")]
    InitiatingModel {
        #[serde(rename = "jobID")]
        job_id: String,
        #[serde(rename = "imgID")]
        img_id: String,
        #[serde(rename = "workerName", default)]
        worker_name: Option<String>,
    },
    #[serde(rename = "jobStarted")]
    JobStarted {
        #[serde(rename = "jobID")]
        job_id: String,
        #[serde(rename = "imgID")]
        img_id: String,
        #[serde(rename = "workerName", default)]
        worker_name: Option<String>,
    },
    #[serde(rename = "jobCompleted")]
    JobCompleted {
        #[serde(rename = "jobID")]
        job_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgressData {
    #[serde(rename = "jobID")]
    pub job_id: String,
    #[serde(rename = "imgID")]
    pub img_id: String,
    #[serde(rename = "hasImage", default)]
    pub has_image: bool,
    pub step: u32,
    #[serde(rename = "stepCount")]
    pub step_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultData {
    #[serde(rename = "jobID")]
    pub job_id: String,
    #[serde(rename = "imgID")]
    pub img_id: String,
    #[serde(rename = "performedStepCount")]
    pub performed_step_count: u32,
    #[serde(rename = "lastSeed")]
    pub last_seed: String,
    #[serde(rename = "userCanceled", default)]
    pub user_canceled: bool,
    #[serde(rename = "triggeredNSFWFilter", default)]
    pub triggered_nsfw_filter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorData {
    #[serde(rename = "jobID")]
    pub job_id: String,
    /// Absent when the failure concerns the whole project.
    #[serde(rename = "imgID", default)]
    pub img_id: Option<String>,
    #[serde(rename = "isFromWorker", default)]
    pub is_from_worker: bool,
    pub error_message: String,
    pub error: RawErrorCode,
}
