use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Extension given to result artifacts.
pub const RESULT_EXTENSION: &str = "json";

/// Progress of one job attempt through the inference pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum JobStage {
    Received,
    Downloaded,
    Classified,
    Uploaded,
    FeedbackSent,
    Acked,
}

/// Stage at which a job attempt stopped. Used as the `stage` metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailedStage {
    Decode,
    Download,
    Classify,
    Upload,
    Publish,
    Ack,
}

/// Classification request read from the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct JobMessage {
    /// Reference to the uploaded audio; only its basename is used as the store key.
    #[serde(rename = "minio_path")]
    #[garde(length(min = 1))]
    pub artifact_ref: String,

    #[serde(rename = "email")]
    #[garde(length(min = 1))]
    pub requester_email: String,

    #[serde(rename = "ticket_number")]
    #[garde(length(min = 1))]
    pub ticket_id: String,
}

impl JobMessage {
    /// Decode and validate a queue payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, MessageError> {
        let message: JobMessage = serde_json::from_slice(payload)?;
        message
            .validate()
            .map_err(|report| MessageError::Invalid(report.to_string()))?;
        if message.input_key().is_empty() {
            return Err(MessageError::Invalid(format!(
                "minio_path '{}' has no file name",
                message.artifact_ref
            )));
        }
        Ok(message)
    }

    /// Object key of the input artifact: the basename of `minio_path`.
    pub fn input_key(&self) -> &str {
        input_key(&self.artifact_ref)
    }

    /// Object key of the result artifact.
    pub fn output_key(&self) -> String {
        output_key(self.input_key())
    }
}

pub fn input_key(artifact_ref: &str) -> &str {
    artifact_ref.rsplit('/').next().unwrap_or(artifact_ref)
}

/// Replace the final extension of `key` with `.json`.
///
/// A leading dot does not start an extension, so `.hidden` becomes `.hidden.json`.
pub fn output_key(key: &str) -> String {
    let stem = match key.rfind('.') {
        Some(idx) if idx > 0 => &key[..idx],
        _ => key,
    };
    format!("{stem}.{RESULT_EXTENSION}")
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Payload is not valid message JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message failed validation: {0}")]
    Invalid(String),
}
