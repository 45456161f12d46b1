use axum::{routing::get, Router};
use birdsong_pipeline::{
    config::AppConfig,
    pipeline::feedback::FeedbackConsumer,
    routes,
    services::{
        broker::{redis::connect, MessageBroker},
        notifier::SmtpNotifier,
        storage::S3Store,
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

    tracing::info!("Starting feedback consumer");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "feedback_notifications_total",
        "Feedback messages settled, by outcome"
    );

    let storage = S3Store::new(
        &config.minio_endpoint,
        &config.minio_access_key,
        &config.minio_secret_key,
        config.minio_secure,
    )
    .expect("Failed to initialize object storage client");

    let notifier = SmtpNotifier::new(&config.smtp_server, config.smtp_port, &config.sender_email)
        .expect("Failed to initialize SMTP notifier");

    tracing::info!("Connecting to broker");
    let mut connection = connect(
        &config.broker_host,
        config.broker_port,
        &config.broker_consumer_id,
        config.retry_policy(),
    )
    .await
    .expect("Failed to connect to broker");

    match connection.recover(&config.feedback_queue).await {
        Ok(0) => {}
        Ok(requeued) => tracing::info!(requeued, "Requeued unacknowledged feedback messages"),
        Err(e) => tracing::warn!(error = %e, "Failed to recover in-flight feedback messages"),
    }

    let shutdown = CancellationToken::new();
    let app = Router::new()
        .route("/metrics", get(routes::metrics::prometheus_metrics))
        .with_state(prometheus_handle)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.feedback_bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!("Metrics listening on {}", config.feedback_bind_addr);

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Metrics server error");
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

    let consumer = FeedbackConsumer::new(
        Arc::new(storage),
        Arc::new(notifier),
        config.minio_bucket.clone(),
        config.feedback_queue.clone(),
        config.feedback_idle_interval(),
    );

    if let Err(e) = consumer.run(&mut connection, &shutdown).await {
        tracing::error!(error = %e, "Broker connection lost for good, exiting");
        shutdown.cancel();
        std::process::exit(1);
    }

    shutdown.cancel();
    tracing::info!("Feedback consumer stopped");
}
