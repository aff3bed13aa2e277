//! Outbound job request message.
//!
//! The server accepts a much larger keyframe shape than this; fields we
//! never set are omitted rather than sent with dummy values.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(rename = "keyFrames")]
    pub key_frames: Vec<KeyFrame>,
    pub previews: u32,
    #[serde(rename = "numberOfImages")]
    pub number_of_images: u32,
    /// Locally generated project id; the server echoes it back as `jobID`.
    #[serde(rename = "jobID")]
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    pub steps: u32,
    #[serde(rename = "guidanceScale")]
    pub guidance_scale: f64,
    #[serde(rename = "modelID")]
    pub model_id: String,
    #[serde(rename = "positivePrompt")]
    pub positive_prompt: String,
    #[serde(rename = "negativePrompt")]
    pub negative_prompt: String,
    #[serde(rename = "stylePrompt")]
    pub style_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}
