//! Polling loop that turns feedback messages into result emails.

use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio_util::sync::CancellationToken;

use crate::models::feedback::FeedbackMessage;
use crate::services::broker::{pause, BrokerError, Delivery, MessageBroker};
use crate::services::notifier::NotificationSender;
use crate::services::storage::ObjectStore;

/// What happened to one feedback message. Everything except `Malformed` is acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FeedbackOutcome {
    Notified,
    NotificationFailed,
    ArtifactUnavailable,
    Malformed,
}

/// Count one settled feedback message under `feedback_notifications_total`.
pub fn record_outcome(outcome: FeedbackOutcome) {
    metrics::counter!("feedback_notifications_total", "outcome" => outcome.to_string()).increment(1);
}

pub struct FeedbackConsumer {
    storage: Arc<dyn ObjectStore>,
    notifier: Arc<dyn NotificationSender>,
    bucket: String,
    queue: String,
    idle_interval: Duration,
}

impl FeedbackConsumer {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        notifier: Arc<dyn NotificationSender>,
        bucket: impl Into<String>,
        queue: impl Into<String>,
        idle_interval: Duration,
    ) -> Self {
        Self {
            storage,
            notifier,
            bucket: bucket.into(),
            queue: queue.into(),
            idle_interval,
        }
    }

    /// Poll until `shutdown` is cancelled. The token is checked before every
    /// dequeue and wakes the idle sleep early.
    ///
    /// Only an exhausted reconnect ends the loop with an error.
    pub async fn run(
        &self,
        broker: &mut dyn MessageBroker,
        shutdown: &CancellationToken,
    ) -> Result<(), BrokerError> {
        tracing::info!(queue = %self.queue, "Feedback consumer started");

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(queue = %self.queue, "Feedback consumer stopping");
                return Ok(());
            }

            match broker.poll_once(&self.queue).await {
                Ok(Some(delivery)) => {
                    let outcome = self.process(&delivery).await;
                    record_outcome(outcome);

                    let settled = match outcome {
                        FeedbackOutcome::Malformed => broker.reject(&delivery.tag).await,
                        _ => broker.ack(&delivery.tag).await,
                    };
                    match settled {
                        Ok(()) => {}
                        Err(e @ BrokerError::Connection { .. }) => return Err(e),
                        Err(e) => {
                            tracing::warn!(error = %e, %outcome, "Failed to settle feedback message");
                        }
                    }
                }
                Ok(None) => {
                    pause(shutdown, self.idle_interval).await;
                }
                Err(e @ BrokerError::Connection { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(queue = %self.queue, error = %e, "Failed to poll feedback queue");
                    pause(shutdown, self.idle_interval).await;
                }
            }
        }
    }

    /// Fetch the result artifact and hand it to the notifier. Never fails:
    /// every problem is folded into the outcome and logged.
    pub async fn process(&self, delivery: &Delivery) -> FeedbackOutcome {
        let message = match FeedbackMessage::from_slice(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "Malformed feedback message");
                return FeedbackOutcome::Malformed;
            }
        };

        let local_result = match self
            .storage
            .fetch_to_local(&self.bucket, &message.result_artifact_ref)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(
                    ticket_id = %message.ticket_id,
                    key = %message.result_artifact_ref,
                    error = %e,
                    "Result artifact unavailable, skipping notification"
                );
                return FeedbackOutcome::ArtifactUnavailable;
            }
        };

        let sent = self
            .notifier
            .notify(&message.requester_email, &local_result, &message.ticket_id)
            .await;
        drop(local_result);

        match sent {
            Ok(()) => {
                tracing::info!(
                    ticket_id = %message.ticket_id,
                    email = %message.requester_email,
                    "Notification sent"
                );
                FeedbackOutcome::Notified
            }
            Err(e) => {
                tracing::error!(
                    ticket_id = %message.ticket_id,
                    email = %message.requester_email,
                    error = %e,
                    "Notification failed, acknowledging anyway"
                );
                FeedbackOutcome::NotificationFailed
            }
        }
    }
}
