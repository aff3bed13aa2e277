//! Mapping from project parameters to the wire request.

use pictor_protocol::request::{JobRequest, KeyFrame};

use crate::projects::ProjectParams;

pub(crate) fn build_job_request(project_id: &str, params: &ProjectParams) -> JobRequest {
    JobRequest {
        job_id: project_id.to_string(),
        number_of_images: params.number_of_images,
        previews: params.number_of_previews,
        key_frames: vec![KeyFrame {
            scheduler: params.scheduler.clone(),
            steps: params.steps,
            guidance_scale: params.guidance,
            model_id: params.model_id.clone(),
            positive_prompt: params.positive_prompt.clone(),
            negative_prompt: params.negative_prompt.clone(),
            style_prompt: params.style_prompt.clone(),
            seed: params.seed.clone(),
        }],
    }
}
