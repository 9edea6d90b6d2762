use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use corto::adapters::{BinanceClient, SqliteStore, UserDataStream};
use corto::api::{self, AppState};
use corto::config::{AppConfig, LoggingConfig};
use corto::domain::EventType;
use corto::engine::{EventSink, TradeEngine};
use corto::error::Result;
use corto::shutdown::{install_signal_handlers, Shutdown};
use corto::signals::SignalWatcher;

/// Soft deadline for the shutdown sequence; unfinished tasks are abandoned
/// past it (their effects are durable at the venue).
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Automated short-side trade manager for Binance USDⓈ-M futures
#[derive(Parser, Debug)]
#[command(name = "corto")]
#[command(version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match AppConfig::load_from(&cli.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("fatal: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&cfg.logging);
    cfg.warn_inapplicable();

    if let Err(e) = run(cfg).await {
        error!(error = %e, "fatal initialization failure");
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run(cfg: Arc<AppConfig>) -> Result<()> {
    info!("corto starting");

    // Durable state first
    let store = Arc::new(SqliteStore::new(&cfg.database.path).await?);
    store.migrate().await?;

    // Venue client: clock sync, then a balance call doubling as the
    // credential check.
    let venue = Arc::new(BinanceClient::new(&cfg.binance)?);
    venue.sync_server_time().await?;
    let balance = venue.available_balance().await?;
    info!(balance_usdt = %balance, "Binance credentials verified");

    let shutdown = Arc::new(Shutdown::new());
    install_signal_handlers(shutdown.clone());

    let events = EventSink::new(store.clone());
    let engine = TradeEngine::new(
        cfg.clone(),
        venue.clone(),
        store.clone(),
        events,
        shutdown.subscribe(),
    );

    // Reconcile persisted trades against the venue before any stream event
    // or new signal can race them.
    engine.reconcile_startup().await?;

    let mut tasks = Vec::new();

    // User-data stream feeding the dispatch loop
    let (updates_tx, updates_rx) = mpsc::channel(1024);
    let (stream, ws_connected) =
        UserDataStream::new(venue.clone(), cfg.binance.ws_base_url(), updates_tx);
    let stream = Arc::new(stream);
    tasks.push(tokio::spawn({
        let stream = stream.clone();
        let rx = shutdown.subscribe();
        async move { stream.run(rx).await }
    }));

    tasks.push(tokio::spawn(
        engine.clone().run_dispatch(updates_rx, shutdown.subscribe()),
    ));
    tasks.push(tokio::spawn(
        engine.clone().run_timeout_scanner(shutdown.subscribe()),
    ));
    tasks.push(tokio::spawn(engine.clone().run_reconnect_monitor(
        ws_connected.clone(),
        shutdown.subscribe(),
    )));

    // Signal source
    let watcher = SignalWatcher::new(cfg.clone(), engine.clone());
    tasks.push(tokio::spawn({
        let rx = shutdown.subscribe();
        async move { watcher.run(rx).await }
    }));

    // Dashboard
    if cfg.dashboard.enabled {
        let state = AppState::new(cfg.clone(), store.clone(), engine.clone(), ws_connected);
        let host = cfg.dashboard.host.clone();
        let port = cfg.dashboard.port;
        let rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = api::serve(state, &host, port, rx).await {
                error!(error = %e, "dashboard server failed");
            }
        }));
    }

    engine
        .events()
        .emit(
            None,
            EventType::Startup,
            json!({
                "max_open_trades": cfg.strategy.max_open_trades,
                "capital_per_trade": cfg.strategy.capital_per_trade,
                "leverage": cfg.strategy.leverage,
                "tp_pct": cfg.strategy.tp_pct,
                "sl_pct": cfg.strategy.sl_pct,
                "timeout_hours": cfg.strategy.timeout_hours,
            }),
        )
        .await;
    info!("system ready, waiting for signals");

    shutdown.wait().await;

    // Ordered teardown: tasks drain on the watch signal; open positions stay
    // protected by their venue-resident TP/SL.
    info!("shutting down");
    engine
        .events()
        .emit(
            None,
            EventType::Shutdown,
            json!({"active_trades": engine.active_count().await}),
        )
        .await;

    let drain = futures_util::future::join_all(tasks);
    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        warn!(
            deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
            "shutdown deadline exceeded, abandoning unfinished tasks"
        );
    }

    info!("shutdown complete");
    Ok(())
}

fn init_logging(cfg: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},sqlx=warn,hyper=warn", cfg.level))
    });

    // `tracing_appender::rolling::daily` panics if it cannot create the
    // first log file, so writability is preflighted.
    let file_layer = if std::fs::create_dir_all(&cfg.dir).is_ok() {
        let test_path = std::path::Path::new(&cfg.dir).join(".corto_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(&cfg.dir, "corto.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Keep the guard alive for the process lifetime
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "warning: log directory {} not writable ({}), file logging disabled",
                    cfg.dir, e
                );
                None
            }
        }
    } else {
        eprintln!(
            "warning: could not create log directory {}, file logging disabled",
            cfg.dir
        );
        None
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}
