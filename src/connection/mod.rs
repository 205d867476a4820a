//! # Connection Module
//!
//! Owns the link to the telemetry source and keeps it alive.
//!
//! [`ConnectionManager`] serializes connect attempts, paces retries with
//! [`ExponentialBackoff`], isolates failures with two circuit breakers and
//! runs a background monitor that detects a silently dead source, reconnects
//! and feeds the snapshot cache.
//!
//! ## Breakers
//!
//! | Key | Breaker | Guards |
//! |-----|---------|--------|
//! | `connection` | `drone_connection` | each connect attempt |
//! | `telemetry` | `telemetry_read` | each snapshot read |
//!
//! ## Snapshot fallback
//!
//! [`ConnectionManager::get_snapshot`] never fails. When no fresh read is
//! possible it serves the last known good snapshot re-tagged with why, or
//! [`Snapshot::defaults`] when nothing was ever read.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{age_of, unix_timestamp};
use crate::config::{Config, MonitorConfig, RetryConfig, SourceAddress};
use crate::error::{RelayError, Result};
use crate::resilience::{BreakerRegistry, BreakerState, CircuitBreaker, ExponentialBackoff};
use crate::source::{ConnectParams, TelemetrySource, VehicleLink};
use crate::telemetry::{ConnectionStatus, Snapshot, TelemetrySnapshotCache};

pub mod reader;
pub mod retry;

pub use reader::FieldReader;
pub use retry::ConnectionRetryState;

/// Breaker guarding connect attempts
pub const CONNECTION_BREAKER: &str = "drone_connection";

/// Breaker guarding snapshot reads
pub const TELEMETRY_BREAKER: &str = "telemetry_read";

/// Connect bound used when the request does not carry `timeout_s`
const DEFAULT_CONNECT_TIMEOUT_S: f64 = 30.0;

/// Link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Vehicle state last observed by the monitor
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct VehicleSummary {
    pub armed: bool,
    pub mode: String,
    pub system_status: String,
    pub last_heartbeat: Option<f64>,
}

struct LinkSlot {
    state: LinkState,
    link: Option<Arc<dyn VehicleLink>>,
    /// Where to reconnect after the link drops
    target: Option<(String, ConnectParams)>,
}

struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct MonitorFailures {
    connect: u32,
    read: u32,
}

struct Inner {
    source: Arc<dyn TelemetrySource>,
    retry: RetryConfig,
    monitor: MonitorConfig,
    backoff: ExponentialBackoff,
    reader: FieldReader,
    connection_breaker: Arc<CircuitBreaker>,
    telemetry_breaker: Arc<CircuitBreaker>,
    cache: Arc<TelemetrySnapshotCache>,
    slot: Mutex<LinkSlot>,
    retry_state: Mutex<ConnectionRetryState>,
    last_good: Mutex<Option<Snapshot>>,
    summary: Mutex<VehicleSummary>,
    /// Held for the whole retry loop so attempts never overlap
    connect_gate: tokio::sync::Mutex<()>,
    monitor_task: Mutex<Option<MonitorHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection manager for one telemetry source
///
/// Cheap to clone; clones share the same link and state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a disconnected manager
    ///
    /// # Arguments
    ///
    /// * `source` - Collaborator that opens vehicle links
    /// * `config` - Relay configuration (retry, monitor and breaker sections)
    /// * `registry` - Registry the two breakers are registered in
    /// * `cache` - Shared snapshot history fed by successful reads
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        config: &Config,
        registry: &BreakerRegistry,
        cache: Arc<TelemetrySnapshotCache>,
    ) -> Self {
        let breakers = &config.breakers;
        let connection_breaker = registry.register(
            CONNECTION_BREAKER,
            breakers.connection_threshold,
            breakers.connection_reset_timeout(),
        );
        let telemetry_breaker = registry.register(
            TELEMETRY_BREAKER,
            breakers.telemetry_threshold,
            breakers.telemetry_reset_timeout(),
        );

        Self {
            inner: Arc::new(Inner {
                source,
                retry: config.retry.clone(),
                monitor: config.monitor.clone(),
                backoff: ExponentialBackoff::from_config(&config.retry),
                reader: FieldReader::from_config(&config.monitor),
                connection_breaker,
                telemetry_breaker,
                cache,
                slot: Mutex::new(LinkSlot {
                    state: LinkState::Disconnected,
                    link: None,
                    target: None,
                }),
                retry_state: Mutex::new(ConnectionRetryState::default()),
                last_good: Mutex::new(None),
                summary: Mutex::new(VehicleSummary::default()),
                connect_gate: tokio::sync::Mutex::new(()),
                monitor_task: Mutex::new(None),
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, LinkSlot> {
        lock(&self.inner.slot)
    }

    /// Connect to the vehicle at `address` and start monitoring
    ///
    /// Succeeds immediately if a link is already up.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SourceUnavailable`] once the retry budget is
    /// exhausted; the manager is left disconnected.
    pub async fn connect(&self, address: &str, params: ConnectParams) -> Result<()> {
        self.establish(address, &params).await?;
        self.start_monitoring();
        Ok(())
    }

    async fn establish(&self, address: &str, params: &ConnectParams) -> Result<()> {
        let _gate = self.inner.connect_gate.lock().await;
        {
            let mut slot = self.slot();
            if slot.state == LinkState::Connected && slot.link.is_some() {
                warn!("Already connected to vehicle");
                return Ok(());
            }
            let retarget = slot.target.as_ref().map_or(true, |(current, _)| current != address);
            if retarget {
                lock(&self.inner.retry_state).reset();
            }
            slot.state = LinkState::Connecting;
            slot.target = Some((address.to_string(), params.clone()));
        }

        let result = self.connect_with_retry(address, params).await;
        if result.is_err() {
            self.slot().state = LinkState::Disconnected;
        }
        result
    }

    /// Try `candidates` in order until one connects
    ///
    /// Each address gets its own retry budget. Returns the address that
    /// connected, or `None` if none did.
    pub async fn connect_first_available(&self, candidates: &[SourceAddress]) -> Option<String> {
        for candidate in candidates {
            let params = ConnectParams { baud: candidate.baud, timeout_s: None };
            match self.connect(&candidate.address, params).await {
                Ok(()) => {
                    info!("Connected to vehicle at {}", candidate.address);
                    return Some(candidate.address.clone());
                }
                Err(e) => warn!("Could not connect to {}: {}", candidate.address, e),
            }
        }
        None
    }

    async fn connect_with_retry(&self, address: &str, params: &ConnectParams) -> Result<()> {
        let inner = &self.inner;
        let max_attempts = inner.retry.max_retry_attempts;

        loop {
            let wait = {
                let mut retry = lock(&inner.retry_state);
                let now = Instant::now();
                if retry.renew_if_idle(now, max_attempts, inner.backoff.max_delay) {
                    info!("Retry budget renewed for {}", address);
                }
                if retry.is_exhausted(max_attempts) {
                    error!("Max retry attempts reached. Connection to {} failed.", address);
                    return Err(RelayError::SourceUnavailable {
                        address: address.to_string(),
                        attempts: retry.attempts,
                    });
                }
                retry.wait_time(now)
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            let attempt = lock(&inner.retry_state).attempts + 1;
            info!("Attempting connection to {} (attempt {}/{})", address, attempt, max_attempts);

            match self.attempt_connect(address, params).await {
                Ok(link) => {
                    lock(&inner.retry_state).reset();
                    let mut slot = self.slot();
                    slot.link = Some(link);
                    slot.state = LinkState::Connected;
                    info!("Successfully connected to vehicle at {}", address);
                    return Ok(());
                }
                Err(e) => {
                    let mut retry = lock(&inner.retry_state);
                    let delay = inner.backoff.next_delay(retry.attempts + 1);
                    retry.record_failure(Instant::now(), delay);
                    error!("Connection attempt {} failed: {}", retry.attempts, e);
                    if !retry.is_exhausted(max_attempts) {
                        info!("Retrying in {:.2} seconds...", delay.as_secs_f64());
                    }
                }
            }
        }
    }

    /// One breaker-guarded connect on a blocking worker
    async fn attempt_connect(&self, address: &str, params: &ConnectParams) -> Result<Arc<dyn VehicleLink>> {
        let source = Arc::clone(&self.inner.source);
        let target = address.to_string();
        let params = params.clone();
        let bound = Duration::from_secs_f64(params.timeout_s.unwrap_or(DEFAULT_CONNECT_TIMEOUT_S).max(0.001));

        self.inner
            .connection_breaker
            .call(|| async move {
                let label = target.clone();
                let worker = tokio::task::spawn_blocking(move || source.connect(&target, &params));
                match tokio::time::timeout(bound, worker).await {
                    Ok(joined) => joined.unwrap_or_else(|e| Err(e.into())),
                    Err(_) => Err(RelayError::Source(format!(
                        "connect to {} timed out after {:.1}s",
                        label,
                        bound.as_secs_f64()
                    ))),
                }
            })
            .await
    }

    fn current_link(&self) -> Option<Arc<dyn VehicleLink>> {
        let slot = self.slot();
        match slot.state {
            LinkState::Connected => slot.link.clone(),
            _ => None,
        }
    }

    /// Current telemetry, never failing
    ///
    /// | Situation | Result |
    /// |-----------|--------|
    /// | fresh read succeeded | fresh snapshot, `CONNECTED` |
    /// | no link | last good, `DISCONNECTED` |
    /// | telemetry breaker open | last good, `CIRCUIT_BREAKER_OPEN` |
    /// | read failed | last good, `DEGRADED` |
    /// | nothing ever read | [`Snapshot::defaults`] |
    ///
    /// Latency is bounded by the slow field timeout.
    pub async fn get_snapshot(&self) -> Snapshot {
        let Some(link) = self.current_link() else {
            return self.fallback(ConnectionStatus::Disconnected);
        };

        let reader = self.inner.reader;
        let result = self
            .inner
            .telemetry_breaker
            .call(|| async move { reader.read_snapshot(&link).await })
            .await;

        match result {
            Ok(snapshot) => {
                *lock(&self.inner.last_good) = Some(snapshot.clone());
                if let Err(e) = self.inner.cache.put(snapshot.clone()) {
                    error!("Failed to cache telemetry snapshot: {}", e);
                }
                snapshot
            }
            Err(RelayError::BreakerOpen { .. }) => {
                debug!("Telemetry breaker open, serving cached telemetry");
                self.fallback(ConnectionStatus::CircuitBreakerOpen)
            }
            Err(e) => {
                warn!("Using cached telemetry data due to read failure: {}", e);
                self.fallback(ConnectionStatus::Degraded)
            }
        }
    }

    fn fallback(&self, status: ConnectionStatus) -> Snapshot {
        match lock(&self.inner.last_good).clone() {
            Some(snapshot) => snapshot.with_status(status),
            None => Snapshot::defaults(unix_timestamp()),
        }
    }

    /// Stop monitoring, close the link and forget the reconnect target
    ///
    /// Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.stop_monitoring().await;
        if self.release_link(true).await {
            info!("Disconnected from vehicle");
        } else {
            debug!("No vehicle to disconnect");
        }
    }

    /// Take the link out of service and close it on a worker (bounded)
    ///
    /// Returns `false` if there was no link.
    async fn release_link(&self, clear_target: bool) -> bool {
        let link = {
            let mut slot = self.slot();
            slot.state = LinkState::Disconnected;
            if clear_target {
                slot.target = None;
            }
            slot.link.take()
        };
        let Some(link) = link else {
            return false;
        };

        let bound = self.inner.monitor.stop_timeout();
        match tokio::time::timeout(bound, tokio::task::spawn_blocking(move || link.close())).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("Error closing vehicle link: {}", e),
            Ok(Err(e)) => warn!("Vehicle link close worker failed: {}", e),
            Err(_) => warn!("Closing vehicle link timed out after {:?}", bound),
        }
        true
    }

    fn start_monitoring(&self) {
        let mut handle = lock(&self.inner.monitor_task);
        if handle.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.monitor_loop(stop_rx).await });
        *handle = Some(MonitorHandle { stop, task });
        info!("Started vehicle monitoring");
    }

    async fn stop_monitoring(&self) {
        let handle = lock(&self.inner.monitor_task).take();
        let Some(MonitorHandle { stop, mut task }) = handle else {
            return;
        };

        let _ = stop.send(true);
        let bound = self.inner.monitor.stop_timeout();
        match tokio::time::timeout(bound, &mut task).await {
            Ok(_) => info!("Stopped vehicle monitoring"),
            Err(_) => {
                warn!("Monitoring loop did not stop within {:?}, aborting", bound);
                task.abort();
            }
        }
    }

    async fn monitor_loop(self, mut stop: watch::Receiver<bool>) {
        let mut failures = MonitorFailures::default();
        let mut pause = self.inner.monitor.interval();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(pause) => {}
            }
            tokio::select! {
                _ = stop.changed() => break,
                next = self.monitor_cycle(&mut failures) => pause = next,
            }
        }
        debug!("Vehicle monitoring loop exited");
    }

    /// One monitoring pass; returns the pause before the next one
    async fn monitor_cycle(&self, failures: &mut MonitorFailures) -> Duration {
        let monitor = &self.inner.monitor;
        let Some(link) = self.current_link() else {
            return self.reconnect_cycle(failures).await;
        };
        failures.connect = 0;

        match self.inner.reader.read_vitals(&link).await {
            Ok(vitals) => {
                failures.read = 0;
                if let Some(heartbeat) = vitals.last_heartbeat {
                    let age = age_of(heartbeat, unix_timestamp());
                    if age > monitor.heartbeat_timeout().as_secs_f64() {
                        error!("{}. Dropping vehicle link", RelayError::StaleHeartbeat { age_s: age });
                        self.release_link(false).await;
                        return monitor.interval();
                    }
                }

                debug!(
                    armed = vitals.armed,
                    mode = %vitals.mode,
                    status = %vitals.system_status,
                    heartbeat = ?vitals.last_heartbeat,
                    "Vehicle state"
                );
                *lock(&self.inner.summary) = vitals;
                self.get_snapshot().await;
                monitor.interval()
            }
            Err(e) => {
                failures.read += 1;
                error!("Monitor error ({}/{}): {}", failures.read, monitor.max_consecutive_failures, e);
                if failures.read >= monitor.max_consecutive_failures {
                    error!("Too many monitoring errors. Attempting connection reset...");
                    failures.read = 0;
                    self.release_link(false).await;
                    return self.inner.retry.reconnect_interval();
                }
                monitor.interval()
            }
        }
    }

    async fn reconnect_cycle(&self, failures: &mut MonitorFailures) -> Duration {
        let monitor = &self.inner.monitor;
        let target = self.slot().target.clone();
        let Some((address, params)) = target else {
            return monitor.interval();
        };

        warn!("Vehicle disconnected. Attempting reconnect to {}...", address);
        match self.establish(&address, &params).await {
            Ok(()) => {
                failures.connect = 0;
                monitor.interval()
            }
            Err(e) => {
                failures.connect += 1;
                let base = self.inner.retry.reconnect_interval();
                if failures.connect >= monitor.max_consecutive_failures {
                    error!(
                        "Too many consecutive connection failures ({}). Backing off...",
                        failures.connect
                    );
                    failures.connect = 0;
                    base * monitor.failure_backoff_factor
                } else {
                    info!("Reconnect failed ({}). Retrying in {:?}", e, base);
                    base
                }
            }
        }
    }

    /// Breaker states keyed `connection` and `telemetry`
    pub fn get_circuit_breaker_status(&self) -> BTreeMap<String, BreakerState> {
        BTreeMap::from([
            ("connection".to_string(), self.inner.connection_breaker.get_state()),
            ("telemetry".to_string(), self.inner.telemetry_breaker.get_state()),
        ])
    }

    pub fn is_connected(&self) -> bool {
        self.current_link().is_some()
    }

    pub fn status(&self) -> LinkState {
        self.slot().state
    }

    pub fn retry_state(&self) -> ConnectionRetryState {
        *lock(&self.inner.retry_state)
    }

    pub fn cache(&self) -> &Arc<TelemetrySnapshotCache> {
        &self.inner.cache
    }

    pub fn last_known_good(&self) -> Option<Snapshot> {
        lock(&self.inner.last_good).clone()
    }

    pub fn vehicle_summary(&self) -> VehicleSummary {
        lock(&self.inner.summary).clone()
    }

    /// Address the manager is connected or reconnecting to
    pub fn target_address(&self) -> Option<String> {
        self.slot().target.as_ref().map(|(address, _)| address.clone())
    }
}
