// Live draw display entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, not terminal)
// 2. Load config
// 3. Open database, make sure the event and its slots exist
// 4. Pick the push source (in-process feed or notifier WebSocket) and the
//    fetch source (local database or remote store, which makes the display
//    read-only)
// 5. Open the live connection and load the slot catalog
// 6. Start the draw countdown, if configured
// 7. Spawn app logic task
// 8. Run the console until the operator quits
// 9. Cleanup on exit

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};

use sweepdraw_core::config;
use sweepdraw_core::connection::ConnectionManager;
use sweepdraw_core::countdown::Countdown;
use sweepdraw_core::db::Database;
use sweepdraw_core::feed::ChangeFeed;
use sweepdraw_core::transport::{Fetcher, Subscription};

use sweepdraw_live::app;
use sweepdraw_live::console;
use sweepdraw_live::rest::HttpStore;
use sweepdraw_live::ws_feed::WsFeed;
use sweepdraw_live::ws_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Tracing
    init_tracing()?;
    info!("sweepdraw starting up");

    // 2. Config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "config loaded: event={} ({} slots)",
        config.event.id, config.event.slot_count
    );

    // 3. Database
    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("failed to create database directory")?;
        }
    }
    let db = Arc::new(Database::open(&config.db_path).context("failed to open database")?);
    info!("database opened at {}", config.db_path);
    if db
        .create_event(&config.event.id, &config.event.name, config.event.slot_count)
        .context("failed to create event")?
    {
        info!("created event {} with {} slots", config.event.id, config.event.slot_count);
    }

    // 4. Push and fetch sources
    let feed = Arc::new(ChangeFeed::new(config.sync.heartbeat));
    let mut background = Vec::new();
    let subscription: Arc<dyn Subscription> = if config.websocket.enabled {
        let ws_feed = Arc::new(WsFeed::new());
        let (ws_tx, ws_rx) = mpsc::channel(256);
        background.push(ws_feed.spawn_pump(ws_rx));
        let port = config.websocket.port;
        background.push(tokio::spawn(async move {
            if let Err(e) = ws_server::run(port, ws_tx).await {
                error!("notifier endpoint on port {port} failed: {e:#}");
            }
        }));
        ws_feed
    } else {
        feed.clone()
    };

    let (fetcher, writes): (Arc<dyn Fetcher>, app::Writes) = match &config.store {
        Some(store) => {
            info!("fetching from remote store {}; display is read-only", store.base_url);
            (Arc::new(HttpStore::new(&store.base_url)?), app::Writes::ReadOnly)
        }
        None if config.websocket.enabled => (db.clone(), app::Writes::Resync),
        None => (db.clone(), app::Writes::LocalFeed),
    };

    // 5. Live connection and slot catalog
    let (sync_tx, sync_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, ui_rx) = mpsc::channel(256);
    let (countdown_tx, countdown_rx) = mpsc::channel(8);

    let slots = fetcher
        .fetch_slots(&config.event.id)
        .await
        .context("failed to load slot catalog")?;
    let manager = ConnectionManager::new(subscription, fetcher.clone(), config.sync.clone());
    let connection = manager.open(&config.event.id, sync_tx);

    // 6. Countdown to the draw
    let _countdown = match &config.event.draw_at {
        Some(draw_at) => {
            let countdown = Countdown::parse(draw_at).context("invalid event.draw_at")?;
            info!("draw opens at {}", countdown.deadline());
            Some(countdown.spawn(Duration::from_secs(1), countdown_tx))
        }
        None => {
            drop(countdown_tx);
            None
        }
    };

    // 7. App task
    let state =
        app::AppState::new(&config, db, feed, fetcher, connection, slots).with_writes(writes);
    let app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(sync_rx, cmd_rx, countdown_rx, ui_tx, state).await {
            error!("application loop error: {e:#}");
        }
    });

    // 8. Console
    info!("display ready for {}", config.event.id);
    if let Err(e) = console::run(ui_rx, cmd_tx).await {
        error!("console error: {e:#}");
    }

    // 9. Cleanup
    let _ = tokio::time::timeout(Duration::from_secs(5), app_handle).await;
    for task in background {
        task.abort();
    }

    info!("sweepdraw shut down cleanly");
    Ok(())
}

/// Log to a file; the terminal belongs to the console.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("sweepdraw.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sweepdraw=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
