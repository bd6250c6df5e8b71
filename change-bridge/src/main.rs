use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use change_bridge::config::Config;
use change_bridge::server::{router, serve, setup_metrics_recorder, Readiness};
use change_bridge::service::ChangeBridgeService;

/// Replicate document changes from a Kafka topic into MongoDB.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// MongoDB connection string, overrides SINK_URI
    sink_uri: Option<String>,

    /// Change topic to consume, overrides KAFKA_CONSUMER_TOPIC
    topic: Option<String>,
}

fn start_server(config: &Config, readiness: Readiness) -> Result<JoinHandle<()>> {
    let recorder_handle =
        setup_metrics_recorder().context("Failed to install metrics recorder")?;
    let router = router(readiness, recorder_handle);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(bind = %bind, error = ?e, "Metrics server stopped");
        }
    }))
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?
        .with_overrides(args.sink_uri, args.topic);

    info!(
        topic = %config.kafka_consumer_topic,
        database = config.sink_database.as_str(),
        collection = config.sink_collection.as_str(),
        "Configuration loaded"
    );

    let readiness = Readiness::default();
    let service = ChangeBridgeService::new(config.clone(), readiness.clone())?;
    let server_handle = start_server(&config, readiness)?;
    info!("Started metrics server on {}", config.bind_address());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal_token.cancel();
            }
            Err(e) => warn!(error = ?e, "Failed to listen for Ctrl-C"),
        }
    });

    let result = service.run(shutdown).await;

    server_handle.abort();
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let log_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .boxed();

    tracing_subscriber::registry().with(log_layer).init();

    match run().await {
        Ok(()) => {
            info!("Change bridge drained, exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Change bridge failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
