//! Per-job orchestration for the inference worker.
//!
//! A job moves through `Received → Downloaded → Classified → Uploaded →
//! FeedbackSent → Acked`. The delivery is acknowledged only after the result
//! is stored and the feedback message is published. Any earlier failure
//! returns the delivery to the queue, so redelivery is the only retry.
//! Side effects of a failed attempt are kept: a retried job overwrites the
//! same result key.

pub mod feedback;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::models::feedback::FeedbackMessage;
use crate::models::job::{FailedStage, JobMessage, JobStage, MessageError};
use crate::services::broker::{BrokerError, Delivery, DeliveryHandler, MessageBroker};
use crate::services::classifier::{ClassificationEngine, ClassifyError};
use crate::services::storage::{ObjectStore, StorageError};

/// Summary of a fully processed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub ticket_id: String,
    pub output_key: String,
    /// Label of the stored detection, `None` when nothing was detected.
    pub primary_label: Option<String>,
    pub stage: JobStage,
}

pub struct InferencePipeline {
    storage: Arc<dyn ObjectStore>,
    engine: Arc<dyn ClassificationEngine>,
    bucket: String,
    feedback_queue: String,
}

impl InferencePipeline {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        engine: Arc<dyn ClassificationEngine>,
        bucket: impl Into<String>,
        feedback_queue: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            engine,
            bucket: bucket.into(),
            feedback_queue: feedback_queue.into(),
        }
    }

    /// Process one delivery and settle it: ack on success, reject when the
    /// payload can never be processed, nack otherwise.
    pub async fn process(
        &self,
        broker: &mut dyn MessageBroker,
        delivery: &Delivery,
    ) -> Result<JobReport, JobError> {
        metrics::counter!("inference_jobs_received_total").increment(1);

        match self.run(broker, delivery).await {
            Ok(report) => {
                metrics::counter!("inference_jobs_completed_total").increment(1);
                tracing::info!(
                    ticket_id = %report.ticket_id,
                    output_key = %report.output_key,
                    primary_label = report.primary_label.as_deref().unwrap_or("none"),
                    "Job completed"
                );
                Ok(report)
            }
            Err(e) => {
                let stage = e.stage();
                metrics::counter!("inference_jobs_failed_total", "stage" => stage.to_string())
                    .increment(1);
                tracing::error!(stage = %stage, error = %e, "Job failed");
                self.settle_failure(broker, delivery, stage).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        broker: &mut dyn MessageBroker,
        delivery: &Delivery,
    ) -> Result<JobReport, JobError> {
        let job = JobMessage::from_slice(&delivery.payload)?;
        let mut stage = JobStage::Received;
        tracing::info!(
            minio_path = %job.artifact_ref,
            email = %job.requester_email,
            ticket_id = %job.ticket_id,
            "Received job"
        );

        let input_key = job.input_key();
        let local_audio = self
            .storage
            .fetch_to_local(&self.bucket, input_key)
            .await
            .map_err(JobError::Download)?;
        advance(&mut stage, JobStage::Downloaded);

        let started = Instant::now();
        let classification = self
            .engine
            .classify(&local_audio)
            .await
            .map_err(JobError::Classify)?
            .retain_detected();
        metrics::histogram!("classification_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        drop(local_audio);
        advance(&mut stage, JobStage::Classified);

        let output_key = job.output_key();
        let primary_label = classification.primary().map(|(label, _)| label.to_string());
        if primary_label.is_none() {
            tracing::warn!(ticket_id = %job.ticket_id, "No detections, storing empty result");
        }
        let body = classification
            .primary_result_bytes()
            .map_err(JobError::Serialize)?;
        self.storage
            .write_bytes(&self.bucket, &output_key, &body)
            .await
            .map_err(JobError::Upload)?;
        advance(&mut stage, JobStage::Uploaded);

        let feedback = FeedbackMessage::for_job(&job, &self.bucket, &output_key);
        let payload = feedback.to_bytes().map_err(JobError::Serialize)?;
        broker
            .publish(&self.feedback_queue, &payload)
            .await
            .map_err(JobError::Publish)?;
        advance(&mut stage, JobStage::FeedbackSent);

        broker.ack(&delivery.tag).await.map_err(JobError::Ack)?;
        advance(&mut stage, JobStage::Acked);

        Ok(JobReport {
            ticket_id: job.ticket_id.clone(),
            output_key,
            primary_label,
            stage,
        })
    }

    async fn settle_failure(&self, broker: &mut dyn MessageBroker, delivery: &Delivery, stage: FailedStage) {
        let settled = match stage {
            FailedStage::Decode => broker.reject(&delivery.tag).await,
            // Feedback is out already; the delivery stays in flight until recovery.
            FailedStage::Ack => return,
            _ => broker.nack(&delivery.tag).await,
        };
        if let Err(e) = settled {
            tracing::error!(error = %e, "Failed to return delivery to the broker");
        }
    }
}

fn advance(stage: &mut JobStage, next: JobStage) {
    tracing::debug!(from = %stage, to = %next, "Job stage transition");
    *stage = next;
}

#[async_trait]
impl DeliveryHandler for InferencePipeline {
    type Error = JobError;

    async fn handle(&self, broker: &mut dyn MessageBroker, delivery: Delivery) -> Result<(), JobError> {
        let span = tracing::info_span!("job", attempt_id = %Uuid::new_v4());
        self.process(broker, &delivery).instrument(span).await.map(|_| ())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Malformed job message: {0}")]
    Malformed(#[from] MessageError),

    #[error("Failed to download audio: {0}")]
    Download(StorageError),

    #[error("Classification failed: {0}")]
    Classify(ClassifyError),

    #[error("Failed to serialize result: {0}")]
    Serialize(serde_json::Error),

    #[error("Failed to upload result: {0}")]
    Upload(StorageError),

    #[error("Failed to publish feedback: {0}")]
    Publish(BrokerError),

    #[error("Failed to acknowledge job: {0}")]
    Ack(BrokerError),
}

impl JobError {
    pub fn stage(&self) -> FailedStage {
        match self {
            JobError::Malformed(_) => FailedStage::Decode,
            JobError::Download(_) => FailedStage::Download,
            JobError::Classify(_) => FailedStage::Classify,
            JobError::Serialize(_) | JobError::Upload(_) => FailedStage::Upload,
            JobError::Publish(_) => FailedStage::Publish,
            JobError::Ack(_) => FailedStage::Ack,
        }
    }
}
