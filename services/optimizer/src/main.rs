//! Optimizer service entry point: runs the dispatcher, worker or
//! single-stage consumers plus the manifest API.

use anyhow::{Context, Result};
use optimizer_service::api::{start_api_server, AppState};
use optimizer_service::{
    Config, DispatchHandler, Dispatcher, ImageCodec, ImageRsCodec, KafkaTaskQueue, ObjectStore,
    ProcessorHandler, S3ObjectStore, ServiceMode, SingleStageProcessor, VariantCatalog,
    VariantRenderer, VariantWorker, VariantWriter, WorkerHandler,
};
use pixforge_pipeline::{ConsumerError, KafkaConfig, MessageHandler, PipelineConsumer, PipelineProducer};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long consumers get to finish their current message on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

type ConsumerTask = (String, Arc<PipelineConsumer>, JoinHandle<Result<(), ConsumerError>>);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    let mode = match std::env::args().nth(1) {
        Some(arg) => ServiceMode::parse(&arg)
            .with_context(|| format!("Unknown mode '{}', expected dispatcher, worker, processor or all", arg))?,
        None => config.service.mode,
    };

    info!(
        service = %config.service.name,
        stage = %config.service.stage,
        mode = ?mode,
        "Starting Pixforge Optimizer Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let catalog = Arc::new(
        VariantCatalog::from_config(&config.catalog).context("Invalid variant catalog")?,
    );
    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.storage).await);
    let codec: Arc<dyn ImageCodec> = Arc::new(ImageRsCodec::new());
    let producer = Arc::new(
        PipelineProducer::new(config.kafka.clone()).context("Failed to initialize Kafka producer")?,
    );

    let renderer = VariantRenderer::new(codec);
    let writer = VariantWriter::new(
        store.clone(),
        config.storage.processed_bucket.clone(),
        config.storage.cache_control.clone(),
        catalog.encoder_profile(),
    );

    let shutdown = CancellationToken::new();
    let mut consumers: Vec<ConsumerTask> = Vec::new();

    if matches!(mode, ServiceMode::Dispatcher | ServiceMode::All) {
        let queue = Arc::new(KafkaTaskQueue::new(producer.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue,
            renderer.clone(),
            catalog.clone(),
        ));
        consumers.push(spawn_consumer(
            "dispatcher",
            &config,
            &producer,
            PipelineConsumer::subscribe_uploads,
            Arc::new(DispatchHandler::new(dispatcher)),
            shutdown.clone(),
        )?);
    }

    if matches!(mode, ServiceMode::Worker | ServiceMode::All) {
        let worker = Arc::new(VariantWorker::new(
            store.clone(),
            renderer.clone(),
            writer.clone(),
            catalog.clone(),
        ));
        consumers.push(spawn_consumer(
            "worker",
            &config,
            &producer,
            PipelineConsumer::subscribe_tasks,
            Arc::new(WorkerHandler::new(worker)),
            shutdown.clone(),
        )?);
    }

    if mode == ServiceMode::Processor {
        let processor = Arc::new(SingleStageProcessor::new(
            store.clone(),
            renderer.clone(),
            writer.clone(),
            catalog.clone(),
            config.worker.chunk_size,
        ));
        consumers.push(spawn_consumer(
            "processor",
            &config,
            &producer,
            PipelineConsumer::subscribe_uploads,
            Arc::new(ProcessorHandler::new(processor)),
            shutdown.clone(),
        )?);
    }

    // Spawn API server task
    let api_state = AppState {
        store: store.clone(),
        catalog: catalog.clone(),
        processed_bucket: config.storage.processed_bucket.clone(),
        presigned_url_expiry: config.presigned_url_expiry(),
    };
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!(consumers = consumers.len(), "Optimizer service started successfully");

    // Wait for shutdown signal or a consumer that stopped on its own
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {
            warn!("A consumer stopped unexpectedly");
        }
    }

    info!("Shutting down optimizer service");
    shutdown.cancel();

    let mut failures = Vec::new();
    for (stage, consumer, handle) in consumers {
        consumer.shutdown();
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(Ok(()))) => info!(stage = %stage, "Consumer stopped"),
            Ok(Ok(Err(e))) => failures.push(format!("{}: {}", stage, e)),
            Ok(Err(e)) => failures.push(format!("{}: task failed: {}", stage, e)),
            Err(_) => warn!(stage = %stage, "Consumer did not stop within grace period"),
        }
    }

    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        warn!(error = %e, "Failed to flush producer");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, api_handle).await.is_err() {
        warn!("API server did not stop within grace period");
    }

    if !failures.is_empty() {
        anyhow::bail!("Consumers failed: {}", failures.join("; "));
    }

    info!("Optimizer service stopped");

    Ok(())
}

/// Kafka settings for one stage; each stage consumes in its own group
fn stage_kafka_config(base: &KafkaConfig, stage: &str) -> KafkaConfig {
    let mut kafka = base.clone();
    kafka.consumer.group_id = format!("{}-{}", base.consumer.group_id, stage);
    kafka
}

/// Create, subscribe and spawn a consumer for one stage.
///
/// A consumer that returns an error cancels `shutdown`, stopping the service.
fn spawn_consumer<H: MessageHandler + 'static>(
    stage: &str,
    config: &Config,
    producer: &Arc<PipelineProducer>,
    subscribe: fn(&PipelineConsumer) -> Result<(), ConsumerError>,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> Result<ConsumerTask> {
    let consumer = Arc::new(
        PipelineConsumer::new(
            stage_kafka_config(&config.kafka, stage),
            producer.clone(),
            config.task_timeout(),
        )
        .with_context(|| format!("Failed to initialize {} consumer", stage))?,
    );
    subscribe(&consumer).with_context(|| format!("Failed to subscribe {} consumer", stage))?;

    let running = consumer.clone();
    let stage_name = stage.to_string();
    let handle = tokio::spawn(async move {
        let result = running.run(handler).await;
        if let Err(ref e) = result {
            error!(stage = %stage_name, error = %e, "Consumer stopped with error");
            shutdown.cancel();
        }
        result
    });

    Ok((stage.to_string(), consumer, handle))
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
