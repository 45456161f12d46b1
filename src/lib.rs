//! Bird sound classification pipeline
//!
//! Consumes classification jobs from a Redis-backed queue, runs audio through a
//! model server, stores the primary detection in MinIO and publishes a feedback
//! message that a second loop turns into a result email.

pub mod app_state;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
