//! Vigil - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vigil_common::logging::{init_logging, LogConfig, LogLevel};
use vigil_common::types::{BackfillRequest, Channel};

use vigil_pipeline::{
    broker::Broker,
    capture::CaptureStage,
    config::{self, MailSourceKind, PipelineConfig},
    connector::{ConnectorRuntime, RuntimeConfig},
    dead_letter::DeadLetterSink,
    email::{EmailConnector, EmailNormalizer, EmailProcessor, ImapMailbox, MailSource, SpoolMailbox},
    health::HealthState,
    normalize::{IngestionService, NormalizerRegistry},
    processor::StageRunner,
    shutdown,
    sink::HttpSink,
    storage::{claim_check::ClaimCheckStore, s3::S3Store},
    Cli, Commands,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut log_config = LogConfig::for_service(cli.command.service_name());
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }

    // Environment variables take precedence
    let log_config = match LogConfig::from_env_with(log_config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: invalid logging configuration: {e:#}");
            process::exit(2);
        },
    };
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e:#}");
            process::exit(2);
        },
    };

    if let Err(e) = run(cli.command).await {
        error!(error = %format!("{e:#}"), "vigil failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = PipelineConfig::load()?;
    info!(service = command.service_name(), "starting");

    let cancel = CancellationToken::new();
    shutdown::install(cancel.clone());

    match command {
        Commands::Connector => run_connector(&config, cancel).await,
        Commands::Processor => run_processor(&config, cancel).await,
        Commands::Normalizer => run_normalizer(&config, cancel).await,
        Commands::Backfill {
            channel,
            start,
            end,
            mailbox,
        } => {
            let mut request = BackfillRequest::new(channel, start, end)?;
            if let Some(mailbox) = mailbox {
                request = request.with_param("mailbox", mailbox);
            }
            run_backfill(&config, request, cancel).await
        },
    }
}

#[cfg(feature = "kafka")]
fn connect_broker(config: &PipelineConfig) -> Result<Arc<dyn Broker>> {
    let broker = vigil_pipeline::broker::kafka::KafkaBroker::new(&config.broker)
        .context("failed to create Kafka client")?;
    info!(bootstrap_servers = %config.broker.bootstrap_servers, "broker client created");
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "kafka"))]
fn connect_broker(_config: &PipelineConfig) -> Result<Arc<dyn Broker>> {
    anyhow::bail!("built without the `kafka` feature; no broker available")
}

async fn connect_storage(config: &PipelineConfig) -> Result<ClaimCheckStore> {
    let store = S3Store::new(&config.storage);
    store
        .ensure_bucket()
        .await
        .with_context(|| format!("bucket {} is not usable", config.storage.bucket))?;
    info!(bucket = %config.storage.bucket, endpoint = ?config.storage.endpoint, "object store ready");
    Ok(ClaimCheckStore::new(Arc::new(store), config.retry_policy()))
}

fn health_addr(config: &PipelineConfig, default_port: u16) -> Result<SocketAddr> {
    let port = config.health.port.unwrap_or(default_port);
    format!("{}:{}", config.health.host, port)
        .parse()
        .with_context(|| format!("invalid health address {}:{}", config.health.host, port))
}

fn email_connector(
    config: &PipelineConfig,
    claim_check: ClaimCheckStore,
    mailbox: Option<&str>,
) -> EmailConnector {
    let source: Arc<dyn MailSource> = match config.connector.source {
        MailSourceKind::Spool => {
            let mailbox = mailbox.unwrap_or(&config.connector.mailbox);
            Arc::new(SpoolMailbox::new(&config.connector.spool_dir, mailbox))
        },
        MailSourceKind::Imap => {
            let mut imap = config.imap.clone();
            if let Some(mailbox) = mailbox {
                imap.mailbox = mailbox.to_string();
            }
            Arc::new(ImapMailbox::new(imap))
        },
    };
    let capture = CaptureStage::new(
        Channel::Email,
        claim_check,
        config.claim_check.inline_threshold_bytes,
    );
    EmailConnector::new(&config.connector.name, source, capture, config.connector.batch_size)
        .with_cursor_file(config.cursor_file())
}

fn connector_runtime(
    config: &PipelineConfig,
    connector: EmailConnector,
    broker: Arc<dyn Broker>,
    health_addr: Option<SocketAddr>,
) -> Result<ConnectorRuntime> {
    let retry = config.retry_policy();
    let dead_letter = DeadLetterSink::new(broker.clone(), &config.topics.dead_letter, retry.clone());
    let runtime_config = RuntimeConfig {
        poll_interval: config.poll_interval(),
        queue_capacity: config.connector.queue_capacity,
        secondary_queue: config.secondary_sink.queue_capacity,
        connect_backoff: retry.clone(),
        health_addr,
    };

    let mut runtime =
        ConnectorRuntime::new(Arc::new(connector), broker, dead_letter, retry, runtime_config);
    if let Some(sink) = HttpSink::new(&config.secondary_sink)? {
        info!(url = sink.url(), "secondary sink enabled");
        runtime = runtime.with_secondary(Arc::new(sink));
    }
    Ok(runtime)
}

async fn run_connector(config: &PipelineConfig, cancel: CancellationToken) -> Result<()> {
    let broker = connect_broker(config)?;
    let claim_check = connect_storage(config).await?;
    let connector = email_connector(config, claim_check, None);
    let addr = health_addr(config, config::DEFAULT_CONNECTOR_HEALTH_PORT)?;

    let runtime = connector_runtime(config, connector, broker, Some(addr))?;
    let summary = runtime.run(cancel).await?;
    info!(delivered = summary.delivered, dead_lettered = summary.dead_lettered, "connector stopped");
    Ok(())
}

async fn run_backfill(
    config: &PipelineConfig,
    request: BackfillRequest,
    cancel: CancellationToken,
) -> Result<()> {
    let broker = connect_broker(config)?;
    let claim_check = connect_storage(config).await?;
    let mailbox = request.params.get("mailbox").and_then(|v| v.as_str()).map(str::to_string);
    let connector = email_connector(config, claim_check, mailbox.as_deref());

    let runtime = connector_runtime(config, connector, broker, None)?;
    let summary = runtime.run_backfill(&request, cancel).await?;
    info!(
        start = %request.start,
        end = %request.end,
        delivered = summary.delivered,
        dead_lettered = summary.dead_lettered,
        "backfill finished"
    );
    Ok(())
}

async fn run_processor(config: &PipelineConfig, cancel: CancellationToken) -> Result<()> {
    let broker = connect_broker(config)?;
    let claim_check = connect_storage(config).await?;
    let retry = config.retry_policy();

    let dead_letter = DeadLetterSink::new(broker.clone(), &config.topics.dead_letter, retry.clone());
    let processor = EmailProcessor::new(
        broker.clone(),
        claim_check,
        dead_letter,
        retry.clone(),
        &config.processor.group,
    )
    .with_body_inline_limit(config.processor.body_inline_limit_bytes);

    let health = HealthState::new("vigil-processor");
    let runner = StageRunner::new(broker, health, retry)
        .with_health_addr(health_addr(config, config::DEFAULT_PROCESSOR_HEALTH_PORT)?);
    runner.run(&processor, cancel).await?;
    Ok(())
}

async fn run_normalizer(config: &PipelineConfig, cancel: CancellationToken) -> Result<()> {
    let registry = NormalizerRegistry::builder()
        .register(Arc::new(EmailNormalizer::new(&config.normalizer.monitored_domains)))
        .build()?;
    // refuse to start rather than dead-letter every record of a channel
    registry.require(&config.normalizer.channels)?;

    let broker = connect_broker(config)?;
    let claim_check = connect_storage(config).await?;
    let retry = config.retry_policy();

    let dead_letter =
        DeadLetterSink::new(broker.clone(), &config.topics.normalized_dlq, retry.clone());
    let service = IngestionService::new(
        registry,
        broker.clone(),
        claim_check,
        dead_letter,
        retry.clone(),
        &config.topics.normalized,
        config.normalizer.channels.clone(),
        &config.normalizer.group,
    );

    let health = HealthState::new("vigil-normalizer");
    let supported: Vec<String> = service
        .supported_channels()
        .iter()
        .map(ToString::to_string)
        .collect();
    health.set_detail("supported_channels", supported);
    if !config.normalizer.monitored_domains.is_empty() {
        health.set_detail("monitored_domains", config.normalizer.monitored_domains.clone());
    }

    let runner = StageRunner::new(broker, health, retry)
        .with_health_addr(health_addr(config, config::DEFAULT_NORMALIZER_HEALTH_PORT)?);
    runner.run(&service, cancel).await?;
    Ok(())
}
