use std::sync::Arc;

use onair_proto::config::Config;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use onair_daemon::ledger::Ledger;
use onair_daemon::moderation::Moderation;
use onair_daemon::resolver::{DurationResolver, SearchService};
use onair_daemon::scheduler::Scheduler;
use onair_daemon::snapshot::SnapshotStore;
use onair_daemon::{events, http, socket, DaemonContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup file logging in the data directory
    let data_dir = onair_proto::paths::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stdout_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,onair_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Broadcast channel: every state change fans out to connected clients
    let events = events::channel();

    // Scheduler state, recovered from the last snapshot so still-running
    // tracks resume mid-play instead of restarting
    let store = SnapshotStore::new(config.daemon.snapshot_file.clone());
    let scheduler = Scheduler::new(events.clone(), store);
    scheduler.restore().await;

    let ledger = Arc::new(Ledger::open(&config.daemon.ledger_file).await?);
    let resolver = Arc::new(DurationResolver::new(&config.resolver));
    let search = Arc::new(SearchService::new(&config.resolver));

    let moderation = Arc::new(Moderation::new(
        ledger.clone(),
        resolver,
        scheduler.clone(),
        config.moderation.cooldown_secs,
    ));
    moderation.init_pending().await;

    let context = DaemonContext {
        scheduler: scheduler.clone(),
        moderation,
        ledger,
        search,
        events,
    };

    let _socket_handle = socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        context.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(&config.http, context.clone());
    }

    info!("Daemon initialised, serving");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down, persisting state");
    scheduler.persist().await;

    Ok(())
}
