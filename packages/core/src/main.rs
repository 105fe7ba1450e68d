use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use event_calendar::catalog::Catalog;
use event_calendar::cli::{Cli, Command};
use event_calendar::config::{Config, StorageKind};
use event_calendar::consumer::{IdempotentHandler, LogHandler, NotificationConsumer};
use event_calendar::error::AppError;
use event_calendar::logging::{init_logging, LogFormat};
use event_calendar::queue::{AmqpConnector, NotificationChannel};
use event_calendar::scheduler::run_dispatcher;
use event_calendar::storage::{EventStore, MemoryEventStore, SqlEventStore};

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::from_env().and_then(|config| config.with_overrides(&cli)) {
        Ok(config) => config,
        Err(msg) => {
            init_logging("info", LogFormat::Compact);
            tracing::error!("{}", AppError::Config(msg));
            std::process::exit(1);
        }
    };
    init_logging(&config.log_level, config.log_format);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let result = match cli.command {
        Command::Scheduler { .. } => run_scheduler(config, shutdown).await,
        Command::Sender { .. } => run_sender(config, shutdown).await,
        Command::Migrate { .. } => run_migrate(config).await,
    };

    if let Err(err) = result {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "SIGTERM handler unavailable; listening for Ctrl+C only"
                );
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}

/// Open the configured store. The SQL handle is returned separately so it
/// can be closed on exit.
async fn open_store(
    config: &Config,
) -> Result<(Arc<dyn EventStore>, Option<SqlEventStore>), AppError> {
    match config.storage {
        StorageKind::Memory => {
            tracing::warn!("Using in-memory event storage; events are lost on exit");
            Ok((Arc::new(MemoryEventStore::new()), None))
        }
        StorageKind::Sql => {
            let store = SqlEventStore::connect(&config.database).await?;
            store.migrate(config.database.migrations.as_deref()).await?;
            Ok((Arc::new(store.clone()), Some(store)))
        }
    }
}

async fn run_scheduler(config: Config, shutdown: CancellationToken) -> Result<(), AppError> {
    let (store, sql) = open_store(&config).await?;
    let catalog = Arc::new(Catalog::new(store));

    let channel = Arc::new(NotificationChannel::new(
        Arc::new(AmqpConnector::new()),
        config.queue.clone(),
    ));
    channel.connect().await?;

    let result = run_dispatcher(catalog, channel.clone(), config.dispatch_interval, shutdown).await;

    if let Err(err) = channel.close().await {
        tracing::warn!(error = %err, "Closing message channel failed");
    }
    if let Some(sql) = sql {
        sql.close().await;
    }
    result.map_err(AppError::from)
}

async fn run_sender(config: Config, shutdown: CancellationToken) -> Result<(), AppError> {
    let channel = Arc::new(NotificationChannel::new(
        Arc::new(AmqpConnector::new()),
        config.queue.clone(),
    ));
    if let Err(err) = channel.connect().await {
        // The consumer retries with backoff.
        tracing::warn!(error = %err, "Initial broker connection failed");
    }

    let consumer = NotificationConsumer::new(channel, Arc::new(IdempotentHandler::new(LogHandler)))
        .with_workers(config.workers)
        .with_backoff(config.backoff.clone());

    consumer.run(&shutdown).await?;
    Ok(())
}

async fn run_migrate(config: Config) -> Result<(), AppError> {
    let store = SqlEventStore::connect(&config.database).await?;
    let result = store.migrate(config.database.migrations.as_deref()).await;
    store.close().await;
    result?;
    Ok(())
}
