//! Outbox relay binary entry point.
//!
//! Usage: outbox-relay [run|migrate|place-order <amount>] [options]
//!
//! Without a subcommand the relay runs until interrupted.

use clap::{Args, Parser, Subcommand};
use observability::LogFormat;
use outbox_database::AsyncDatabase;
use outbox_relay::change_source::RedisChangeStream;
use outbox_relay::http::{self, HttpState};
use outbox_relay::{
    orders, ChangeSource, DispatchSettings, Dispatcher, FailurePolicy, Heartbeat, LoopSettings,
    OutboxStore, PollingSource, Relay, RelayConfig, RelayResult, RetryPolicy, Shutdown,
    SourceKind, SqliteOutboxStore, StreamingSource, WebhookSink,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Outbox relay: delivers transactional outbox events to a webhook.
#[derive(Parser, Debug)]
#[command(name = "outbox-relay")]
#[command(about = "Crash-safe relay from a transactional outbox to a webhook")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay (default).
    Run,
    /// Apply schema migrations and exit.
    Migrate,
    /// Insert an order and its outbox event in one transaction.
    PlaceOrder {
        /// Order total.
        total_amount: f64,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// SQLite database path.
    #[arg(long, env = "OUTBOX_DB_PATH", default_value = "outbox.db", global = true)]
    database: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Log format (compact, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "compact", global = true)]
    log_format: LogFormat,

    /// Append JSON log lines to this file.
    #[arg(long, env = "LOG_FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Webhook receiving `{"order_id", "status"}`.
    #[arg(
        long,
        env = "WEBHOOK_URL",
        default_value = "http://webhook-consumer:8082/orders/finish"
    )]
    webhook_url: String,

    /// Change source.
    #[arg(long, env = "OUTBOX_SOURCE", value_enum, default_value_t = SourceKind::Polling)]
    source: SourceKind,

    /// Polling interval in milliseconds.
    #[arg(long, env = "OUTBOX_POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    /// Maximum records per cycle.
    #[arg(long, env = "OUTBOX_BATCH_SIZE", default_value = "100")]
    batch_size: usize,

    /// Aggregates delivered concurrently.
    #[arg(long, env = "OUTBOX_WORKERS", default_value = "4")]
    workers: usize,

    /// Webhook request timeout in seconds.
    #[arg(long, env = "OUTBOX_DELIVERY_TIMEOUT_SECS", default_value = "5")]
    delivery_timeout_secs: u64,

    /// Status sent with every delivery.
    #[arg(long, env = "OUTBOX_STATUS_TO_APPLY", default_value = "finished")]
    status_to_apply: String,

    /// Handling of permanent (4xx) delivery failures.
    #[arg(long, env = "OUTBOX_FAILURE_POLICY", value_enum, default_value_t = FailurePolicy::MarkFailed)]
    failure_policy: FailurePolicy,

    /// Immediate retries of a retryable failure within one cycle.
    #[arg(long, env = "OUTBOX_IMMEDIATE_RETRIES", default_value = "0")]
    immediate_retries: u32,

    /// First immediate retry delay in milliseconds.
    #[arg(long, env = "OUTBOX_RETRY_DELAY_MS", default_value = "200")]
    retry_delay_ms: u64,

    /// Maximum immediate retry delay in milliseconds.
    #[arg(long, env = "OUTBOX_MAX_RETRY_DELAY_MS", default_value = "5000")]
    max_retry_delay_ms: u64,

    /// Redis connection URL (streaming source).
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Redis stream carrying outbox change events.
    #[arg(long, env = "OUTBOX_STREAM_KEY", default_value = "outbox.events")]
    stream_key: String,

    /// Consumer group name.
    #[arg(long, env = "OUTBOX_CONSUMER_GROUP", default_value = "outbox-relay")]
    consumer_group: String,

    /// Consumer name. Defaults to a unique name per process.
    #[arg(long, env = "OUTBOX_CONSUMER_NAME")]
    consumer_name: Option<String>,

    /// XREADGROUP block timeout in milliseconds.
    #[arg(long, env = "OUTBOX_BLOCK_MS", default_value = "5000")]
    block_ms: u64,

    /// Listen address for /health and /debezium.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8081")]
    listen_addr: SocketAddr,

    /// Heartbeat age in seconds after which /health reports unavailable.
    #[arg(long, env = "OUTBOX_HEALTH_STALENESS_SECS", default_value = "60")]
    health_staleness_secs: u64,
}

impl Cli {
    fn into_config(self) -> RelayConfig {
        let defaults = RelayConfig::default();
        let run = self.run;

        RelayConfig {
            database_path: self.common.database,
            webhook_url: run.webhook_url,
            source: run.source,
            poll_interval: Duration::from_millis(run.poll_interval_ms),
            batch_size: run.batch_size,
            worker_count: run.workers,
            delivery_timeout: Duration::from_secs(run.delivery_timeout_secs),
            status_to_apply: run.status_to_apply,
            failure_policy: run.failure_policy,
            retry: RetryPolicy {
                immediate_retries: run.immediate_retries,
                initial_retry_delay_ms: run.retry_delay_ms,
                max_retry_delay_ms: run.max_retry_delay_ms,
            },
            redis_url: run.redis_url,
            stream_key: run.stream_key,
            consumer_group: run.consumer_group,
            consumer_name: run.consumer_name.unwrap_or(defaults.consumer_name),
            block_timeout_ms: run.block_ms,
            listen_addr: run.listen_addr,
            health_staleness: Duration::from_secs(run.health_staleness_secs),
        }
    }
}

#[tokio::main]
async fn main() -> RelayResult<()> {
    let mut cli = Cli::parse();

    observability::init_with_config(observability::LogConfig {
        service_name: "outbox-relay".into(),
        default_level: cli.common.log_level.clone(),
        format: cli.common.log_format,
        log_path: cli.common.log_file.clone(),
        also_stderr: true,
    });

    let command = cli.command.take().unwrap_or(Command::Run);
    let config = cli.into_config();

    match command {
        Command::Run => run(config).await,
        Command::Migrate => migrate(&config).await,
        Command::PlaceOrder { total_amount } => place_order(&config, total_amount).await,
    }
}

async fn migrate(config: &RelayConfig) -> RelayResult<()> {
    let db = AsyncDatabase::open(&config.database_path).await?;
    let version = db.call(outbox_database::schema_version).await?;
    info!(
        path = %config.database_path.display(),
        schema_version = version,
        "Database migrated"
    );
    db.close().await?;
    Ok(())
}

async fn place_order(config: &RelayConfig, total_amount: f64) -> RelayResult<()> {
    let db = AsyncDatabase::open(&config.database_path).await?;
    let placed = orders::place_order(&db, total_amount).await?;
    println!(
        "order {} placed, outbox event {}",
        placed.order.id, placed.outbox_id
    );
    db.close().await?;
    Ok(())
}

async fn run(config: RelayConfig) -> RelayResult<()> {
    config.validate()?;

    info!(
        database = %config.database_path.display(),
        webhook_url = %config.webhook_url,
        source = config.source.as_str(),
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        workers = config.worker_count,
        failure_policy = ?config.failure_policy,
        listen_addr = %config.listen_addr,
        "Configuration loaded"
    );

    // Start-up failures are fatal: nothing below retries them.
    let db = AsyncDatabase::open(&config.database_path).await.map_err(|e| {
        error!(error = %e, "Failed to open database");
        e
    })?;
    let store: Arc<dyn OutboxStore> = Arc::new(SqliteOutboxStore::new(db.clone()));
    let sink = Arc::new(WebhookSink::new(
        config.webhook_url.clone(),
        config.delivery_timeout,
    )?);

    let shutdown = Shutdown::new();
    let heartbeat = Heartbeat::new();
    let dispatcher = Dispatcher::new(
        store.clone(),
        sink,
        DispatchSettings::from(&config),
        shutdown.subscribe(),
    );

    let source = match config.source {
        SourceKind::Polling => {
            ChangeSource::Polling(PollingSource::new(store.clone(), config.batch_size))
        }
        SourceKind::Streaming => {
            let stream = RedisChangeStream::connect(&config).await.map_err(|e| {
                error!(error = %e, redis_url = %config.redis_url, "Failed to connect to Redis");
                e
            })?;
            info!(
                stream = %config.stream_key,
                group = %config.consumer_group,
                consumer = %config.consumer_name,
                "Consuming change stream"
            );
            ChangeSource::Streaming(StreamingSource::new(
                Box::new(stream),
                config.batch_size,
                config.block_timeout_ms,
            ))
        }
    };

    let listener = http::bind(config.listen_addr).await?;
    let http_state = HttpState {
        store,
        dispatcher: dispatcher.clone(),
        heartbeat: heartbeat.clone(),
        staleness: config.health_staleness,
    };
    let mut http_shutdown = shutdown.subscribe();
    let server = tokio::spawn(http::serve(listener, http_state, async move {
        let _ = http_shutdown.wait_for(|stopping| *stopping).await;
    }));

    let mut relay = Relay::new(
        source,
        dispatcher,
        heartbeat,
        shutdown.subscribe(),
        LoopSettings::from(&config),
    );

    let relay_task = tokio::spawn(async move { relay.run().await });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal, finishing in-flight deliveries...");
    shutdown.trigger();

    match relay_task.await {
        Ok(summary) => info!(
            cycles = summary.cycles,
            acked = summary.totals.acked,
            "Relay stopped"
        ),
        Err(e) => error!(error = %e, "Relay task failed"),
    }

    match server.await {
        Ok(Err(e)) => error!(error = %e, "HTTP server exited with error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
        Ok(Ok(())) => {}
    }

    db.close().await?;
    info!("Outbox relay stopped");
    Ok(())
}
