use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry_relay::kafka::{EnvelopeBuilder, KafkaProducer, Publisher, RetryPolicy};
use telemetry_relay::postgres::{self, PostgresStore};
use telemetry_relay::{Config, Relay, RelaySettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "telemetry-relay")]
#[command(about = "Publishes unsent telemetry rows from PostgreSQL to Kafka", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, env = "PROFILE", help = "Overlay <config>.<profile>.<ext> on the base file")]
    profile: Option<String>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting telemetry-relay");
    info!(profile = ?args.profile, "Loading configuration from {:?}", args.config);

    let config = Config::load(&args.config, args.profile.as_deref())
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    info!(
        postgres = %config.postgres_url(),
        table = %config.store.table,
        columns = ?config.store.columns,
        kafka_brokers = ?config.kafka.brokers,
        kafka_topic = %config.kafka.topic,
        batch_size = config.relay.batch_size,
        "Configuration summary"
    );

    let pool = postgres::connect(&config.postgres)
        .await
        .context("failed to connect to PostgreSQL")?;
    let store = Arc::new(PostgresStore::new(pool, &config.store));
    store
        .verify()
        .await
        .context("telemetry table does not match the configured columns")?;

    let producer = Arc::new(KafkaProducer::new(&config.kafka).context("failed to create Kafka producer")?);
    producer.verify().await.context("failed to reach Kafka")?;

    let builder = EnvelopeBuilder::from_config(&config.store)?;
    let publisher = Publisher::new(producer.clone(), RetryPolicy::from(&config.relay.retry));
    let relay = Relay::new(store, builder, publisher, RelaySettings::from(&config.relay));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    relay.run(shutdown).await;

    if let Err(e) = producer.flush(FLUSH_TIMEOUT).await {
        warn!(error = %e, "Kafka producer did not flush cleanly");
    }

    info!("telemetry-relay stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("telemetry_relay=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("telemetry_relay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
