use std::sync::Arc;

use crate::services::{broker::redis::RedisConnector, storage::ObjectStore};

/// Shared state for the worker's health endpoint.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn ObjectStore>,
    pub bucket: String,
    pub broker: RedisConnector,
}

impl AppState {
    pub fn new(storage: Arc<dyn ObjectStore>, bucket: impl Into<String>, broker: RedisConnector) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            broker,
        }
    }
}
