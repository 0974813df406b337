use std::sync::Arc;

use tracing::{debug, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use punchclock_session::auth::{FileStore, KeyValueStore, MemoryStore};
use punchclock_session::{
    config, CountdownDisplay, EventBus, HttpRefreshClient, RouteGuard, SessionMonitor, TokenStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    let env_file_path = dotenvy::dotenv().ok();

    // Initialize the tracing subscriber for structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "punchclock_session=debug,warn".into()
            } else {
                "punchclock_session=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!(version = punchclock_session::VERSION, "Punchclock session monitor starting");

    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let config = config::load_config().await?;

    // Fall back to an in-memory session when the store file can't be used
    let backend: Arc<dyn KeyValueStore> = match FileStore::open(&config.storage_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(
                error = %e,
                path = %config.storage_path.display(),
                "Session file unusable, keeping the session in memory only"
            );
            Arc::new(MemoryStore::new())
        }
    };

    let store = Arc::new(
        TokenStore::new(backend).with_expiry_buffer(config.expiry_buffer()),
    );
    store.init();

    let client = Arc::new(HttpRefreshClient::new(
        config.refresh_url.clone(),
        config.request_timeout(),
    )?);
    let bus = EventBus::new(config.event_bus_capacity);
    let monitor = SessionMonitor::new(Arc::clone(&store), client, bus.clone(), &config);

    let countdown = CountdownDisplay::new(monitor.view(), config.countdown_warn_secs).attach(&bus);
    let guard = RouteGuard::new(monitor.view());
    info!(decision = ?guard.check(), state = ?monitor.state(), "Initial session state");

    let handle = monitor.start()?;
    let mut snapshots = handle.subscribe_snapshots();

    info!("Press Ctrl+C to stop");

    let observer = tokio::spawn(async move {
        let mut last_text = None;
        while snapshots.changed().await.is_ok() {
            let state = snapshots.borrow_and_update().state;
            let frame = countdown.poll();
            if frame.text != last_text {
                debug!(state = ?state, countdown = ?frame.text, "Session countdown");
                last_text = frame.text;
            }
            if frame.warning {
                warn!("Session expires soon, save your work");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping session monitor...");

    handle.shutdown().await?;
    observer.abort();

    info!("Session monitor stopped");
    Ok(())
}
