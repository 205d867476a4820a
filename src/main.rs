//! # Telemetry Relay
//!
//! Relay live vehicle telemetry to WebSocket subscribers.
//!
//! Usage: `telemetry-relay [CONFIG.toml]`. Without a file every setting
//! takes its default and the relay serves `ws://localhost:8765`.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use telemetry_relay::config::{Config, LoggingConfig};
use telemetry_relay::connection::ConnectionManager;
use telemetry_relay::resilience::BreakerRegistry;
use telemetry_relay::server::BroadcastServer;
use telemetry_relay::source::SimulatedSource;
use telemetry_relay::telemetry::TelemetrySnapshotCache;

/// Main entry point for the telemetry relay
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (argument path or defaults)
///    - Set up logging with tracing subscriber, plus a daily file when configured
///    - Build breakers, snapshot cache and connection manager
///
/// 2. **Serving**
///    - Start the WebSocket server and its broadcast loop
///    - Signal handlers are installed before anything can block
///    - Try each configured source address in order, in the background
///    - Subscribers can still `connect` later if none succeeded
///
/// 3. **Graceful Shutdown**
///    - First of Ctrl+C, SIGTERM or SIGQUIT triggers it
///    - Broadcast stops, clients are notified, listener closes, source disconnects
///
/// # Errors
///
/// Returns error if:
/// - The configuration file cannot be loaded or is invalid
/// - The listen address cannot be bound
#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("loading config from {}", path))?,
        None => Config::default(),
    };

    let _log_guard = init_logging(&config.logging);

    info!("Telemetry Relay v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut signals = ShutdownSignals::install().context("installing signal handlers")?;

    let registry = BreakerRegistry::new();
    let cache = Arc::new(TelemetrySnapshotCache::new(config.cache.clone()));
    let (sweeper_stop, sweeper_rx) = watch::channel(false);
    let sweeper = cache.spawn_sweeper(sweeper_rx);

    let manager = ConnectionManager::new(Arc::new(SimulatedSource::new()), &config, &registry, cache);
    let server = BroadcastServer::new(&config, manager.clone());
    server.start().await.context("starting WebSocket server")?;

    let search = tokio::spawn({
        let manager = manager.clone();
        let candidates = config.source.addresses.clone();
        async move {
            if manager.connect_first_available(&candidates).await.is_none() {
                error!("No telemetry source available; waiting for a connect request");
            }
        }
    });

    info!("Press Ctrl+C to exit");
    signals.recv().await;

    // A search still retrying is abandoned; shutdown disconnects whatever it left
    search.abort();
    server.shutdown().await;
    server.wait().await;

    sweeper_stop.send_replace(true);
    if let Err(e) = sweeper.await {
        warn!("Cache sweeper ended abnormally: {}", e);
    }

    info!("Telemetry relay stopped");
    Ok(())
}

/// Console logging, plus a daily rolling file when `dir` is set
///
/// The returned guard flushes the file writer on drop.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let console = tracing_subscriber::fmt::layer();

    match &logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

/// Shutdown signal streams
///
/// Handlers are registered by [`install`](Self::install), so a signal that
/// arrives while sources are still being tried is not lost.
struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
    #[cfg(unix)]
    quit: Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Resolves on the first of Ctrl+C, SIGTERM or SIGQUIT
    #[cfg(unix)]
    async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => info!("Received Ctrl+C"),
            _ = self.terminate.recv() => info!("Received SIGTERM"),
            _ = self.quit.recv() => info!("Received SIGQUIT"),
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => {
                error!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}
