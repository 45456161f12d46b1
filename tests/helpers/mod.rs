//! In-memory collaborators for pipeline and feedback tests
#![allow(dead_code)]

use async_trait::async_trait;
use birdsong_pipeline::models::detection::Classification;
use birdsong_pipeline::services::broker::{BrokerError, Delivery, DeliveryTag, MessageBroker};
use birdsong_pipeline::services::classifier::{ClassificationEngine, ClassifyError};
use birdsong_pipeline::services::notifier::{NotificationSender, NotifyError};
use birdsong_pipeline::services::storage::{ObjectStore, StorageError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const BUCKET: &str = "bird-audio";
pub const JOB_QUEUE: &str = "jobs";
pub const FEEDBACK_QUEUE: &str = "feedback";

/// Everything the broker was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Published { queue: String, payload: Vec<u8> },
    Acked(Vec<u8>),
    Nacked(Vec<u8>),
    Rejected(Vec<u8>),
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    events: Vec<BrokerEvent>,
    polls: Vec<Instant>,
    fail_publish: bool,
    fail_ack: bool,
}

/// Single-process broker. Clones share state so a test can inspect what a
/// loop did with its copy.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.into());
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().events.clone()
    }

    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Published { queue: q, payload } if q == queue => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn acked(&self) -> usize {
        self.count(|e| matches!(e, BrokerEvent::Acked(_)))
    }

    pub fn nacked(&self) -> usize {
        self.count(|e| matches!(e, BrokerEvent::Nacked(_)))
    }

    pub fn rejected(&self) -> usize {
        self.count(|e| matches!(e, BrokerEvent::Rejected(_)))
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn poll_times(&self) -> Vec<Instant> {
        self.state.lock().polls.clone()
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }

    pub fn fail_ack(&self, fail: bool) {
        self.state.lock().fail_ack = fail;
    }

    /// Take the next delivery the way a consume loop would.
    pub fn take(&self, queue: &str) -> Option<Delivery> {
        self.pop(queue)
    }

    fn count(&self, predicate: impl Fn(&BrokerEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| predicate(e)).count()
    }

    fn pop(&self, queue: &str) -> Option<Delivery> {
        let payload = self.state.lock().queues.get_mut(queue)?.pop_front()?;
        Some(Delivery {
            tag: DeliveryTag::new(queue, payload.clone()),
            payload,
        })
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.fail_publish {
            return Err(BrokerError::Disconnected("publish refused".into()));
        }
        state.events.push(BrokerEvent::Published {
            queue: queue.to_string(),
            payload: payload.to_vec(),
        });
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_vec());
        Ok(())
    }

    async fn poll_once(&mut self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.state.lock().polls.push(Instant::now());
        Ok(self.pop(queue))
    }

    async fn next_delivery(
        &mut self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        if let Some(delivery) = self.poll_once(queue).await? {
            return Ok(Some(delivery));
        }
        tokio::time::sleep(wait).await;
        Ok(None)
    }

    async fn ack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.fail_ack {
            return Err(BrokerError::Closed);
        }
        state.events.push(BrokerEvent::Acked(tag.raw().to_vec()));
        Ok(())
    }

    async fn nack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.events.push(BrokerEvent::Nacked(tag.raw().to_vec()));
        state
            .queues
            .entry(tag.queue().to_string())
            .or_default()
            .push_back(tag.raw().to_vec());
        Ok(())
    }

    async fn reject(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        self.state
            .lock()
            .events
            .push(BrokerEvent::Rejected(tag.raw().to_vec()));
        Ok(())
    }

    async fn recover(&mut self, _queue: &str) -> Result<usize, BrokerError> {
        Ok(0)
    }
}

/// Object store backed by a map, with switchable failures.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    writes: Mutex<Vec<String>>,
    pub fail_writes: AtomicBool,
    pub fail_gets: AtomicBool,
}

impl MemoryStore {
    pub fn with_object(container: &str, key: &str, data: &[u8]) -> Self {
        let store = Self::default();
        store.put(container, key, data);
        store
    }

    pub fn put(&self, container: &str, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .insert((container.to_string(), key.to_string()), data.to_vec());
    }

    pub fn object(&self, container: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(container.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys written, in order, including overwrites.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn container_exists(&self, container: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().keys().any(|(c, _)| c == container))
    }

    async fn create_container(&self, _container: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_bytes(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                code: 503,
                key: key.to_string(),
            });
        }
        self.object(container, key)
            .ok_or_else(|| StorageError::not_found(container, key))
    }

    async fn write_bytes(&self, container: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                code: 500,
                key: key.to_string(),
            });
        }
        self.put(container, key, data);
        self.writes.lock().push(key.to_string());
        Ok(())
    }
}

/// Engine returning a canned classification.
pub struct StubEngine {
    response: Mutex<serde_json::Value>,
    pub fail: AtomicBool,
    pub calls: AtomicU32,
}

impl StubEngine {
    pub fn returning(response: serde_json::Value) -> Self {
        Self {
            response: Mutex::new(response),
            fail: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassificationEngine for StubEngine {
    async fn load(&self) -> Result<(), ClassifyError> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn classify(&self, audio_path: &Path) -> Result<Classification, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(audio_path.exists(), "audio must be on local disk while classifying");
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClassifyError::Io(std::io::Error::other("model crashed")));
        }
        let response = self.response.lock().clone();
        Ok(serde_json::from_value(response).expect("stub response must be a JSON object"))
    }
}

/// One call to the notifier, with the attachment contents captured at call time.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipient: String,
    pub attachment: Vec<u8>,
    pub ticket_id: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<Notification>>,
    pub fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn calls(&self) -> Vec<Notification> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn notify(
        &self,
        recipient: &str,
        attachment_path: &Path,
        ticket_id: &str,
    ) -> Result<(), NotifyError> {
        let attachment = std::fs::read(attachment_path)?;
        self.calls.lock().push(Notification {
            recipient: recipient.to_string(),
            attachment,
            ticket_id: ticket_id.to_string(),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Io(std::io::Error::other("smtp relay down")));
        }
        Ok(())
    }
}

pub fn job_payload(minio_path: &str, email: &str, ticket: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "minio_path": minio_path,
        "email": email,
        "ticket_number": ticket,
    }))
    .unwrap()
}

pub fn feedback_payload(json_path: &str, email: &str, ticket: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "wav_minio_path": format!("{BUCKET}/bird.wav"),
        "json_minio_path": json_path,
        "email": email,
        "ticket_number": ticket,
    }))
    .unwrap()
}
