use serde::Deserialize;
use std::time::Duration;

use crate::services::broker::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Health and metrics bind address (e.g., "0.0.0.0:3000"). Only used by the inference worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Metrics bind address of the feedback consumer
    #[serde(default = "default_feedback_bind_addr")]
    pub feedback_bind_addr: String,

    /// Broker (Redis) hostname
    pub broker_host: String,

    /// Broker (Redis) port
    pub broker_port: u16,

    /// Connection attempts before giving up at startup or on reconnect
    #[serde(default = "default_broker_max_retries")]
    pub broker_max_retries: u32,

    /// Constant delay between connection attempts, in seconds
    #[serde(default = "default_broker_retry_delay_secs")]
    pub broker_retry_delay_secs: u64,

    /// Names this process's in-flight list. Falls back to `HOSTNAME`, and
    /// loading fails when neither is set. Must differ between replicas and
    /// stay stable across restarts of one replica.
    #[serde(default)]
    pub broker_consumer_id: String,

    #[serde(default)]
    hostname: Option<String>,

    /// Queue carrying inbound classification jobs
    pub job_queue: String,

    /// Queue carrying feedback messages for the notification loop
    pub feedback_queue: String,

    /// MinIO endpoint, with or without scheme (e.g., "minio:9000")
    pub minio_endpoint: String,

    /// MinIO access key ID (S3-compatible)
    pub minio_access_key: String,

    /// MinIO secret access key (S3-compatible)
    pub minio_secret_key: String,

    /// Bucket holding both audio inputs and JSON results
    pub minio_bucket: String,

    /// Use https when the endpoint carries no scheme
    #[serde(default)]
    pub minio_secure: bool,

    /// Base URL of the model-serving process
    pub model_server_url: String,

    /// Weights the model server loads on warm-up
    #[serde(default = "default_weights_path")]
    pub model_weights_path: String,

    /// Upper bound on a single classification request, in seconds
    #[serde(default = "default_classify_timeout_secs")]
    pub classify_timeout_secs: u64,

    /// SMTP relay hostname
    pub smtp_server: String,

    /// SMTP relay port
    pub smtp_port: u16,

    /// From address on feedback emails
    pub sender_email: String,

    /// Sleep between empty polls of the feedback queue, in seconds
    #[serde(default = "default_feedback_idle_secs")]
    pub feedback_idle_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_broker_max_retries() -> u32 {
    5
}

fn default_broker_retry_delay_secs() -> u64 {
    5
}

fn default_feedback_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_weights_path() -> String {
    "models/detr_noneg_100q_bs20_r50dc5".to_string()
}

fn default_classify_timeout_secs() -> u64 {
    300
}

fn default_feedback_idle_secs() -> u64 {
    1
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env::<Self>().and_then(Self::resolve_consumer_id)
    }

    /// Build from explicit key/value pairs using the same names as the environment.
    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter::<_, Self>(vars).and_then(Self::resolve_consumer_id)
    }

    fn resolve_consumer_id(mut self) -> Result<Self, envy::Error> {
        if self.broker_consumer_id.is_empty() {
            match self.hostname.as_deref().filter(|host| !host.is_empty()) {
                Some(host) => self.broker_consumer_id = host.to_string(),
                None => return Err(envy::Error::MissingValue("broker_consumer_id")),
            }
        }
        Ok(self)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.broker_max_retries,
            Duration::from_secs(self.broker_retry_delay_secs),
        )
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_secs(self.classify_timeout_secs)
    }

    pub fn feedback_idle_interval(&self) -> Duration {
        Duration::from_secs(self.feedback_idle_secs)
    }
}
