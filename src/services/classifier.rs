use async_trait::async_trait;
use reqwest::{multipart, Client};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::models::detection::Classification;

/// Bird sound classifier. Calls are long-running and may fail.
#[async_trait]
pub trait ClassificationEngine: Send + Sync {
    /// Warm the model up. Repeated calls after success are no-ops.
    async fn load(&self) -> Result<(), ClassifyError>;

    fn is_ready(&self) -> bool;

    /// Classify a local audio file. Loads the model first if needed.
    async fn classify(&self, audio_path: &Path) -> Result<Classification, ClassifyError>;
}

/// Client for the model-serving process.
pub struct ModelServerClient {
    http: Client,
    base_url: String,
    weights_path: String,
    ready: AtomicBool,
    loading: Mutex<()>,
}

impl ModelServerClient {
    pub fn new(base_url: &str, weights_path: &str, timeout: Duration) -> Result<Self, ClassifyError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            weights_path: weights_path.to_string(),
            ready: AtomicBool::new(false),
            loading: Mutex::new(()),
        })
    }
}

#[async_trait]
impl ClassificationEngine for ModelServerClient {
    async fn load(&self) -> Result<(), ClassifyError> {
        let _guard = self.loading.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        tracing::info!(weights_path = %self.weights_path, "Loading model");
        self.http
            .post(format!("{}/load", self.base_url))
            .json(&serde_json::json!({ "weights_path": self.weights_path }))
            .send()
            .await?
            .error_for_status()?;

        self.ready.store(true, Ordering::SeqCst);
        tracing::info!("Model loaded successfully");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn classify(&self, audio_path: &Path) -> Result<Classification, ClassifyError> {
        if !self.is_ready() {
            tracing::info!("Model not loaded yet, loading before classification");
            self.load().await?;
        }

        let audio = tokio::fs::read(audio_path).await?;
        let file_name = audio_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        let part = multipart::Part::bytes(audio)
            .file_name(file_name.clone())
            .mime_str(audio_mime(audio_path))?;
        let form = multipart::Form::new().part("file", part);

        tracing::info!(file = %file_name, "Starting classification");
        let classification: Classification = self
            .http
            .post(format!("{}/classify", self.base_url))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tracing::info!(
            file = %file_name,
            categories = classification.len(),
            "Classification complete"
        );
        Ok(classification)
    }
}

fn audio_mime(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("mp3") => "audio/mpeg",
        _ => "audio/wav",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Model server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to read audio file: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Multipart, State};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct FakeModelServer {
        loads: Arc<AtomicU32>,
        classifies: Arc<AtomicU32>,
    }

    async fn load_handler(State(server): State<FakeModelServer>, Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["weights_path"], "models/test");
        server.loads.fetch_add(1, Ordering::SeqCst);
        Json(json!({"status": "loaded"}))
    }

    async fn classify_handler(State(server): State<FakeModelServer>, mut multipart: Multipart) -> Json<Value> {
        let field = multipart.next_field().await.unwrap().unwrap();
        assert_eq!(field.name(), Some("file"));
        assert_eq!(field.content_type(), Some("audio/wav"));
        assert_eq!(field.bytes().await.unwrap().as_ref(), b"RIFF");
        server.classifies.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "Turdus merula": {"bbox_coord": [[0.1, 0.2, 0.3, 0.4]]},
            "Erithacus rubecula": {"bbox_coord": [[1, 1, 2, 2]]}
        }))
    }

    async fn spawn_server(server: FakeModelServer) -> String {
        let app = Router::new()
            .route("/load", post(load_handler))
            .route("/classify", post(classify_handler))
            .with_state(server);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn audio_file() -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        std::fs::write(file.path(), b"RIFF").unwrap();
        file
    }

    #[tokio::test]
    async fn test_first_classify_triggers_single_load() {
        let server = FakeModelServer::default();
        let url = spawn_server(server.clone()).await;
        let client = ModelServerClient::new(&url, "models/test", Duration::from_secs(5)).unwrap();
        let audio = audio_file();

        assert!(!client.is_ready());
        let first = client.classify(audio.path()).await.unwrap();
        let second = client.classify(audio.path()).await.unwrap();

        assert!(client.is_ready());
        assert_eq!(server.loads.load(Ordering::SeqCst), 1);
        assert_eq!(server.classifies.load(Ordering::SeqCst), 2);
        assert_eq!(first, second);
        let labels: Vec<_> = first.labels().collect();
        assert_eq!(labels, vec!["Turdus merula", "Erithacus rubecula"]);
    }

    #[tokio::test]
    async fn test_explicit_load_is_idempotent() {
        let server = FakeModelServer::default();
        let url = spawn_server(server.clone()).await;
        let client = ModelServerClient::new(&url, "models/test", Duration::from_secs(5)).unwrap();

        client.load().await.unwrap();
        client.load().await.unwrap();
        client.classify(audio_file().path()).await.unwrap();

        assert_eq!(server.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let server = FakeModelServer::default();
        let url = spawn_server(server.clone()).await;
        let client = ModelServerClient::new(&url, "models/test", Duration::from_secs(5)).unwrap();

        let err = client
            .classify(Path::new("/nonexistent/bird.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::Io(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_load() {
        let client =
            ModelServerClient::new("http://127.0.0.1:9", "models/test", Duration::from_secs(2)).unwrap();
        assert!(matches!(client.load().await, Err(ClassifyError::Http(_))));
        assert!(!client.is_ready());
    }

    #[test]
    fn test_audio_mime_by_extension() {
        assert_eq!(audio_mime(Path::new("a.MP3")), "audio/mpeg");
        assert_eq!(audio_mime(Path::new("a.wav")), "audio/wav");
        assert_eq!(audio_mime(Path::new("noext")), "audio/wav");
    }
}
