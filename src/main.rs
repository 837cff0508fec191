//! draft-worker - queue-driven LinkedIn draft generation

use clap::{Parser, Subcommand};
use draft_pipeline::config::WorkerConfig;
use draft_pipeline::error::{WorkerError, WorkerResult};
use draft_pipeline::llm::{OpenAiConfig, OpenAiProvider};
use draft_pipeline::messaging::{Consumer, Publisher};
use draft_pipeline::observability::{init_default_logging, HealthServer, MetricsRegistry};
use draft_pipeline::protocol::DraftJobMessage;
use draft_pipeline::transport::mqtt::MqttClient;
use draft_pipeline::transport::{Transport, TransportEvent};
use draft_pipeline::usecase::LlmDraftGenerator;
use draft_pipeline::worker::DraftWorker;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["draft-worker.toml", "config/draft-worker.toml"];

#[derive(Parser)]
#[command(name = "draft-worker")]
#[command(about = "Generates LinkedIn post drafts from queued jobs")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume draft-generation jobs until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Enqueue one draft-generation job
    Publish {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        idea_id: String,
        /// Defaults to a random UUID
        #[arg(long)]
        job_id: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_worker(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Publish {
            user_id,
            idea_id,
            job_id,
        } => publish_job(config, user_id, idea_id, job_id).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&Path>) -> WorkerResult<WorkerConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(WorkerConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(WorkerConfig::load_from_file(path)?);
        }
    }

    Err(WorkerError::internal(format!(
        "No configuration file found; pass -c/--config or create one of {}",
        DEFAULT_CONFIG_PATHS.join(", ")
    )))
}

fn handle_config_command(config: &WorkerConfig, show: bool) -> WorkerResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| WorkerError::internal(format!("Failed to render configuration: {e}")))?;
        println!("{rendered}");
    }
    info!(worker_id = %config.worker.id, "Configuration is valid");
    Ok(())
}

async fn connect_transport(config: &WorkerConfig) -> WorkerResult<Arc<MqttClient>> {
    let transport = Arc::new(MqttClient::new(&config.worker.id, config.mqtt.clone()));
    transport.connect(config.connect_timeout()).await?;
    Ok(transport)
}

async fn publish_job(
    config: WorkerConfig,
    user_id: String,
    idea_id: String,
    job_id: Option<String>,
) -> WorkerResult<()> {
    let transport = connect_transport(&config).await?;
    let mut publisher = Publisher::new(transport.clone(), &config.queue.subject)?;
    if let Some(ttl) = config.queue.ttl_secs {
        publisher = publisher.with_ttl(Duration::from_secs(ttl));
    }

    let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let message = DraftJobMessage::new(job_id.clone(), user_id, idea_id);
    let result = publisher
        .publish_sync(&message, config.connect_timeout(), &CancellationToken::new())
        .await;

    if let Err(e) = transport.disconnect(config.drain_timeout()).await {
        warn!(error = %e, "Disconnect after publish failed");
    }
    result?;

    info!(job_id = %job_id, subject = %publisher.subject(), "Job published");
    Ok(())
}

async fn run_worker(config: WorkerConfig) -> WorkerResult<()> {
    info!(
        worker_id = %config.worker.id,
        version = env!("CARGO_PKG_VERSION"),
        "Starting draft worker"
    );

    let api_key = config.get_llm_api_key()?;
    let provider = OpenAiProvider::new(OpenAiConfig::from_section(&config.llm, api_key))
        .map_err(|e| WorkerError::internal(format!("LLM provider setup failed: {e}")))?;
    let use_case = Arc::new(LlmDraftGenerator::new(Arc::new(provider), &config.llm));

    let transport = connect_transport(&config).await?;
    let transport_dyn: Arc<dyn Transport> = transport.clone();

    let mut consumer = Consumer::new(
        transport_dyn.clone(),
        &config.queue.subject,
        config.queue.max_redeliveries,
    )?
    .with_max_in_flight(config.queue.max_in_flight);
    if let Some(group) = &config.queue.queue_group {
        consumer = consumer.with_queue_group(group.clone());
    }
    if let Some(dead_letter_subject) = &config.queue.dead_letter_subject {
        consumer = consumer.with_dead_letter(Publisher::new(
            transport_dyn.clone(),
            dead_letter_subject,
        )?);
    }
    let consumer = Arc::new(consumer);

    let shutdown = CancellationToken::new();
    let worker = Arc::new(
        DraftWorker::builder()
            .with_config(&config)
            .use_case(use_case)
            .consumer(consumer.clone())
            .shutdown(shutdown.child_token())
            .build()?,
    );

    let registry = Arc::new(MetricsRegistry::new());
    registry.register("consumer", consumer.metrics());
    registry.register("worker", worker.clone());

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let health_server = Arc::new(
        HealthServer::new(
            config.worker.id.clone(),
            health_port,
            transport_dyn.clone(),
            registry,
        )
        .with_consumer(consumer.clone()),
    );
    let health_shutdown = shutdown.clone();
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run(health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    worker.start().await?;

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| WorkerError::internal(format!("Failed to install SIGTERM handler: {e}")))?;

    info!("Draft worker is running and waiting for jobs");

    let mut lost_connection = false;
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = wait_for_permanent_disconnect(transport_dyn.as_ref()) => {
            error!("Broker connection permanently lost, shutting down worker...");
            lost_connection = true;
        }
    }

    // Stop intake first so in-flight jobs can drain before the retry loops are cancelled
    if let Err(e) = worker.stop(config.drain_timeout()).await {
        warn!(error = %e, "Worker stop reported an error");
    }
    shutdown.cancel();
    if let Err(e) = transport.disconnect(config.drain_timeout()).await {
        warn!(error = %e, "Transport disconnect reported an error");
    }
    let _ = health_task.await;

    info!(metrics = ?worker.snapshot(), "Draft worker stopped");

    if lost_connection {
        return Err(WorkerError::internal("broker connection permanently lost"));
    }
    Ok(())
}

async fn wait_for_permanent_disconnect(transport: &dyn Transport) {
    let mut events = transport.events();
    if transport.is_permanently_disconnected() {
        return;
    }
    loop {
        match events.recv().await {
            Ok(TransportEvent::PermanentlyDisconnected { reason }) => {
                warn!(reason = %reason, "Transport gave up reconnecting");
                return;
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                if transport.is_permanently_disconnected() {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await;
            }
        }
    }
}
