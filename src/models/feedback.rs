use serde::{Deserialize, Serialize};

use super::job::{JobMessage, MessageError};

/// Published once a result artifact is stored; drives the email notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMessage {
    /// Informational only; the notification loop never reads it back.
    #[serde(rename = "wav_minio_path", default)]
    pub input_artifact_ref: String,

    /// Key of the result artifact inside the configured bucket.
    #[serde(rename = "json_minio_path")]
    pub result_artifact_ref: String,

    #[serde(rename = "email")]
    pub requester_email: String,

    #[serde(rename = "ticket_number")]
    pub ticket_id: String,
}

impl FeedbackMessage {
    pub fn for_job(job: &JobMessage, bucket: &str, result_key: &str) -> Self {
        Self {
            input_artifact_ref: format!("{}/{}", bucket, job.input_key()),
            result_artifact_ref: result_key.to_string(),
            requester_email: job.requester_email.clone(),
            ticket_id: job.ticket_id.clone(),
        }
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
