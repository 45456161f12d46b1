use axum::{routing::get, Router};
use birdsong_pipeline::{
    app_state::AppState,
    config::AppConfig,
    pipeline::InferencePipeline,
    routes,
    services::{
        broker::{consume, redis::RedisConnector, BrokerConnection, MessageBroker},
        classifier::{ClassificationEngine, ModelServerClient},
        storage::{ObjectStore, S3Store},
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing inference worker");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("inference_jobs_received_total", "Job deliveries taken from the queue");
    metrics::describe_counter!("inference_jobs_completed_total", "Jobs stored, published and acked");
    metrics::describe_counter!("inference_jobs_failed_total", "Job attempts that failed, by stage");
    metrics::describe_histogram!(
        "classification_duration_seconds",
        "Time spent in a single classification call"
    );

    tracing::info!(endpoint = %config.minio_endpoint, "Initializing object storage client");
    let storage: Arc<dyn ObjectStore> = Arc::new(
        S3Store::new(
            &config.minio_endpoint,
            &config.minio_access_key,
            &config.minio_secret_key,
            config.minio_secure,
        )
        .expect("Failed to initialize object storage client"),
    );
    storage
        .ensure_container(&config.minio_bucket)
        .await
        .expect("Failed to provision storage bucket");

    let engine = Arc::new(
        ModelServerClient::new(
            &config.model_server_url,
            &config.model_weights_path,
            config.classify_timeout(),
        )
        .expect("Failed to initialize model server client"),
    );
    if let Err(e) = engine.load().await {
        tracing::warn!(error = %e, "Model warm-up failed, the first job will retry the load");
    }

    tracing::info!("Connecting to broker");
    let connector = RedisConnector::new(&config.broker_host, config.broker_port, &config.broker_consumer_id)
        .expect("Invalid broker address");
    let mut connection = BrokerConnection::connect(connector.clone(), config.retry_policy())
        .await
        .expect("Failed to connect to broker");

    match connection.recover(&config.job_queue).await {
        Ok(0) => {}
        Ok(requeued) => tracing::info!(requeued, queue = %config.job_queue, "Requeued unacknowledged jobs"),
        Err(e) => tracing::warn!(error = %e, "Failed to recover in-flight jobs"),
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(storage.clone(), config.minio_bucket.clone(), connector);
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!("Health and metrics listening on {}", config.bind_addr);

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                signal_shutdown.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let pipeline = InferencePipeline::new(
        storage,
        engine,
        config.minio_bucket.clone(),
        config.feedback_queue.clone(),
    );

    if let Err(e) = consume(&mut connection, &config.job_queue, &pipeline, &shutdown).await {
        tracing::error!(error = %e, "Broker connection lost for good, exiting");
        shutdown.cancel();
        std::process::exit(1);
    }

    shutdown.cancel();
    tracing::info!("Inference worker stopped");
}
