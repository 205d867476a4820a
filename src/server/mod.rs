//! # Server Module
//!
//! WebSocket endpoint serving the control protocol and pushing telemetry.
//!
//! ## Per-connection tasks
//!
//! ```text
//! socket --split--> reader  --requests-->  request worker --+
//!               \                                          |
//!                +-> writer <--Outbound queue-- broadcast --+
//! ```
//!
//! The reader tracks keep-alive and feeds requests to a worker, so a slow
//! `connect` never stops the connection from reading pongs. All frames to
//! the client go through the subscriber's bounded [`Outbound`] queue.
//!
//! ## Shutdown sequence
//!
//! 1. stop flag; broadcast loop exits (bounded, then aborted)
//! 2. every subscriber gets the shutdown notice and a close frame (bounded)
//! 3. listener stops accepting (bounded, then aborted)
//! 4. connection manager disconnects

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::unix_timestamp;
use crate::config::{Config, ServerConfig, ShutdownConfig};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::telemetry::{validation, Snapshot};

pub mod health;
pub mod protocol;
pub mod subscribers;

pub use health::{HealthReport, HealthStatus};
pub use subscribers::{FanOut, Outbound, SubscriberSet};

use health::{HealthInputs, HealthThresholds, ServerStats};
use protocol::{Action, Request, INTERNAL_ERROR, INVALID_INPUT, UNKNOWN_ACTION};
use subscribers::Subscriber;

#[derive(Default)]
struct ServerTasks {
    listener: Option<JoinHandle<()>>,
    broadcast: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

struct ServerInner {
    config: ServerConfig,
    shutdown: ShutdownConfig,
    manager: ConnectionManager,
    subscribers: SubscriberSet,
    stats: ServerStats,
    started_at: Instant,
    shutting_down: AtomicBool,
    stop: watch::Sender<bool>,
    done: watch::Sender<bool>,
    tasks: Mutex<ServerTasks>,
}

/// Telemetry broadcast server
///
/// Cheap to clone; clones drive the same server.
#[derive(Clone)]
pub struct BroadcastServer {
    inner: Arc<ServerInner>,
}

impl BroadcastServer {
    pub fn new(config: &Config, manager: ConnectionManager) -> Self {
        let (stop, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                config: config.server.clone(),
                shutdown: config.shutdown.clone(),
                manager,
                subscribers: SubscriberSet::new(),
                stats: ServerStats::new(),
                started_at: Instant::now(),
                shutting_down: AtomicBool::new(false),
                stop,
                done,
                tasks: Mutex::new(ServerTasks::default()),
            }),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, ServerTasks> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the listener and spawn the accept and broadcast tasks
    ///
    /// Returns the bound address (useful with port 0). Calling it again
    /// returns the existing address.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::RelayError::Io`] if the address cannot be bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.tasks().local_addr {
            return Ok(addr);
        }

        let config = &self.inner.config;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;

        let app = Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .with_state(self.clone());

        let mut stop = self.inner.stop.subscribe();
        let listener_task = tokio::spawn(async move {
            let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopping| *stopping).await;
                })
                .await;
            if let Err(e) = result {
                error!("WebSocket listener error: {}", e);
            }
        });
        let broadcast_task = tokio::spawn(self.clone().broadcast_loop(self.inner.stop.subscribe()));

        let mut tasks = self.tasks();
        tasks.listener = Some(listener_task);
        tasks.broadcast = Some(broadcast_task);
        tasks.local_addr = Some(addr);
        info!("WebSocket server started at ws://{}", addr);
        Ok(addr)
    }

    /// Resolves once [`shutdown`](Self::shutdown) has completed
    pub async fn wait(&self) {
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Graceful shutdown; later calls are no-ops
    ///
    /// Every stage is time-bounded. A stage that times out is logged and
    /// the sequence moves on.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return;
        }
        info!("Starting graceful shutdown...");
        inner.stop.send_replace(true);

        let (broadcast, listener) = {
            let mut tasks = self.tasks();
            (tasks.broadcast.take(), tasks.listener.take())
        };

        if let Some(mut task) = broadcast {
            let bound = inner.shutdown.broadcast_stop_timeout();
            if tokio::time::timeout(bound, &mut task).await.is_err() {
                warn!("Broadcast task didn't stop within {:?}, aborting", bound);
                task.abort();
            }
        }

        self.close_subscribers().await;

        if let Some(mut task) = listener {
            let bound = inner.shutdown.server_close_timeout();
            if tokio::time::timeout(bound, &mut task).await.is_err() {
                warn!("Server didn't close within {:?}, aborting", bound);
                task.abort();
            }
        }

        inner.manager.disconnect().await;
        info!("Graceful shutdown completed");
        inner.done.send_replace(true);
    }

    async fn close_subscribers(&self) {
        let subscribers = self.inner.subscribers.drain();
        if subscribers.is_empty() {
            return;
        }
        info!("Notifying {} clients of shutdown", subscribers.len());

        let notice = Utf8Bytes::from(protocol::shutdown_notice());
        let bound = self.inner.shutdown.client_close_timeout();
        let mut writers: Vec<JoinHandle<()>> = Vec::new();

        let closing = async {
            for Subscriber { addr, tx, writer } in subscribers {
                writers.extend(writer);
                if tx.send(Outbound::Text(notice.clone())).await.is_err() || tx.send(Outbound::Close).await.is_err() {
                    warn!("Error notifying client {} of shutdown", addr);
                }
            }
            futures::future::join_all(writers.iter_mut()).await;
        };

        if tokio::time::timeout(bound, closing).await.is_err() {
            warn!("Some clients didn't disconnect within {:?}", bound);
        }
        for writer in &writers {
            writer.abort();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tasks().local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    /// Aggregate health; reads only
    pub fn get_health_status(&self) -> HealthReport {
        let inner = &self.inner;
        let cache = match inner.manager.cache().stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Cache stats unavailable: {}", e);
                None
            }
        };

        health::assess(
            HealthInputs {
                stats: inner.stats.view(),
                uptime: inner.started_at.elapsed(),
                connected_clients: inner.subscribers.len(),
                drone_connected: inner.manager.is_connected(),
                circuit_breakers: inner.manager.get_circuit_breaker_status(),
                cache,
                now: unix_timestamp(),
            },
            &HealthThresholds {
                stale_telemetry: inner.config.stale_telemetry(),
                max_error_rate_percent: inner.config.max_error_rate_percent,
            },
        )
    }

    /// Handle one request frame and produce the response frame
    ///
    /// Only malformed requests are answered with an error; source failures
    /// show up in the returned telemetry and health instead.
    pub async fn process_message(&self, text: &str) -> String {
        let inner = &self.inner;
        inner.stats.record_message();

        let action = match protocol::parse_request(text) {
            Ok(Request::Action(action)) => action,
            Ok(Request::Unknown(name)) => {
                debug!("Unknown action: {}", name);
                return protocol::error_response(UNKNOWN_ACTION);
            }
            Err(e) => {
                inner.stats.record_error();
                debug!("Rejected request: {}", e);
                return protocol::error_response(INVALID_INPUT);
            }
        };

        match action {
            Action::Connect(request) => {
                let status = match inner.manager.connect(&request.address, request.params()).await {
                    Ok(()) => "connected",
                    Err(e) => {
                        warn!("Connect request for {} failed: {}", request.address, e);
                        "failed"
                    }
                };
                protocol::status_response(status)
            }
            Action::Disconnect => {
                inner.manager.disconnect().await;
                protocol::status_response("disconnected")
            }
            Action::GetTelemetry => {
                let snapshot = inner.manager.get_snapshot().await;
                let now = unix_timestamp();
                if validation::validate(&snapshot, now, inner.config.freshness()).is_ok() {
                    inner.stats.record_telemetry(now);
                }
                self.encode(&snapshot)
            }
            Action::HealthCheck => self.encode(&self.get_health_status()),
        }
    }

    fn encode<T: Serialize>(&self, value: &T) -> String {
        match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                self.inner.stats.record_error();
                error!("Failed to encode response: {}", e);
                protocol::error_response(INTERNAL_ERROR)
            }
        }
    }

    async fn broadcast_loop(self, mut stop: watch::Receiver<bool>) {
        let period = self.inner.config.broadcast_interval();
        let health_every = self.inner.config.health_log_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_health_log: Option<Instant> = None;

        while !*stop.borrow() {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }

            if last_health_log.map_or(true, |at| at.elapsed() >= health_every) {
                self.log_health();
                last_health_log = Some(Instant::now());
            }
            self.broadcast_cycle().await;
        }
        info!("Broadcast telemetry stopped");
    }

    fn log_health(&self) {
        let health = self.get_health_status();
        info!(
            status = ?health.status,
            clients = health.connected_clients,
            drone_connected = health.drone_connected,
            errors = health.error_count,
            issues = ?health.issues,
            "Health status"
        );
    }

    /// One broadcast period
    ///
    /// Returns `None` when nothing was sent: no subscribers, or the snapshot
    /// failed validation.
    pub async fn broadcast_cycle(&self) -> Option<FanOut> {
        let inner = &self.inner;
        if inner.subscribers.is_empty() {
            return None;
        }

        let snapshot = if inner.manager.is_connected() || !inner.config.placeholder_when_disconnected {
            inner.manager.get_snapshot().await
        } else {
            Snapshot::placeholder(unix_timestamp())
        };

        let value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to encode telemetry: {}", e);
                return None;
            }
        };

        let now = unix_timestamp();
        if let Err(e) = validation::validate_value(&value, now, inner.config.freshness()) {
            inner.stats.record_validation_failure();
            warn!("Invalid telemetry data, skipping broadcast: {}", e);
            return None;
        }
        inner.stats.record_telemetry(now);

        let report = inner.subscribers.broadcast(Utf8Bytes::from(value.to_string()));
        if report.dropped > 0 {
            info!("Removed {} disconnected subscribers", report.dropped);
        }
        Some(report)
    }

    async fn handle_socket(self, socket: WebSocket, addr: SocketAddr) {
        let queue = self.inner.config.subscriber_queue;
        let (sink, stream) = socket.split();

        let (outbound, outbound_rx) = mpsc::channel(queue);
        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let id = self.inner.subscribers.register(addr, outbound.clone(), Some(writer));
        info!("Client connected: {}", addr);

        let (requests, requests_rx) = mpsc::channel(queue);
        tokio::spawn(self.clone().request_loop(requests_rx, outbound.clone()));

        self.read_loop(stream, requests, outbound, addr).await;

        self.inner.subscribers.remove(id);
        info!("Client disconnected: {}", addr);
    }

    async fn read_loop(
        &self,
        mut stream: SplitStream<WebSocket>,
        requests: mpsc::Sender<Utf8Bytes>,
        outbound: mpsc::Sender<Outbound>,
        addr: SocketAddr,
    ) {
        let config = &self.inner.config;
        let ping_every = config.keepalive_interval();
        let idle_limit = ping_every + config.keepalive_timeout();
        let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        let mut deadline = Instant::now() + idle_limit;
        let mut stop = self.inner.stop.subscribe();
        let mut closing = *stop.borrow();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !closing {
                            deadline = Instant::now() + idle_limit;
                        }
                        if requests.send(text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        if !closing {
                            deadline = Instant::now() + idle_limit;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                },
                _ = ping.tick(), if !closing => {
                    if let Err(mpsc::error::TrySendError::Closed(_)) = outbound.try_send(Outbound::Ping) {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if closing {
                        debug!("Close handshake with {} timed out", addr);
                    } else {
                        warn!("Client {} missed keep-alive, closing connection", addr);
                        let _ = outbound.try_send(Outbound::Close);
                    }
                    break;
                }
                _ = outbound.closed() => {
                    debug!("Subscriber {} was dropped, closing connection", addr);
                    break;
                }
                _ = stop.changed(), if !closing => {
                    closing = true;
                    deadline = deadline.min(Instant::now() + config.close_timeout());
                }
            }
        }
    }

    async fn request_loop(self, mut requests: mpsc::Receiver<Utf8Bytes>, outbound: mpsc::Sender<Outbound>) {
        while let Some(text) = requests.recv().await {
            let response = self.process_message(text.as_str()).await;
            if outbound.send(Outbound::Text(Utf8Bytes::from(response))).await.is_err() {
                break;
            }
        }
    }
}

async fn ws_handler(
    State(server): State<BroadcastServer>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if server.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| server.handle_socket(socket, addr))
}

/// Drain a subscriber's queue onto its socket
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(item) = outbound.recv().await {
        let (message, last) = match item {
            Outbound::Text(text) => (Message::Text(text), false),
            Outbound::Ping => (Message::Ping(Bytes::new()), false),
            Outbound::Close => (
                Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: Utf8Bytes::from("going away"),
                })),
                true,
            ),
        };
        if sink.send(message).await.is_err() || last {
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::resilience::BreakerRegistry;
    use crate::source::mocks::MockSource;
    use crate::source::{ConnectParams, TelemetrySource};
    use crate::telemetry::{ConnectionStatus, TelemetrySnapshotCache};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.retry.reconnect_interval_ms = 10;
        config.retry.min_delay_ms = 1;
        config.retry.max_backoff_delay_ms = 20;
        config.retry.jitter_fraction = 0.0;
        config.monitor.interval_ms = 60_000;
        config.monitor.field_timeout_ms = 100;
        config.monitor.slow_field_timeout_ms = 200;
        config.shutdown.server_close_timeout_ms = 1000;
        config
    }

    fn server_with(source: Arc<dyn TelemetrySource>, config: &Config) -> BroadcastServer {
        let registry = BreakerRegistry::new();
        let cache = Arc::new(TelemetrySnapshotCache::new(CacheConfig::default()));
        let manager = ConnectionManager::new(source, config, &registry, cache);
        BroadcastServer::new(config, manager)
    }

    fn fake_subscriber(server: &BroadcastServer, port: u16) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(8);
        server.inner.subscribers.register(SocketAddr::from(([127, 0, 0, 1], port)), tx, None);
        rx
    }

    fn received_snapshot(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("Expected a text frame, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_requests() {
        let server = server_with(MockSource::new(0), &test_config());

        assert_eq!(server.process_message("{not json").await, r#"{"error":"invalid input"}"#);
        assert_eq!(server.process_message(r#"{"action":"connect"}"#).await, r#"{"error":"invalid input"}"#);
        assert_eq!(server.process_message(r#"{"action":"takeoff"}"#).await, r#"{"error":"unknown action"}"#);

        let health: Value = serde_json::from_str(&server.process_message(r#"{"action":"health_check"}"#).await).unwrap();
        assert_eq!(health["messages_processed"], 4);
        assert_eq!(health["error_count"], 2);
        assert_eq!(health["status"], "unhealthy");
        assert!(health["issues"].as_array().unwrap().iter().any(|i| i == "drone_disconnected"));
    }

    #[tokio::test]
    async fn test_connect_telemetry_disconnect_actions() {
        let server = server_with(MockSource::new(0), &test_config());

        let response = server.process_message(r#"{"action":"connect","address":"sim://a"}"#).await;
        assert_eq!(response, r#"{"status":"connected"}"#);
        assert!(server.manager().is_connected());

        let telemetry: Value = serde_json::from_str(&server.process_message(r#"{"action":"get_telemetry"}"#).await).unwrap();
        assert_eq!(telemetry["connection_status"], "CONNECTED");
        assert!(server.get_health_status().last_telemetry_update.is_some());

        let response = server.process_message(r#"{"action":"disconnect"}"#).await;
        assert_eq!(response, r#"{"status":"disconnected"}"#);
        assert!(!server.manager().is_connected());
    }

    #[tokio::test]
    async fn test_failed_connect_reports_failed() {
        let mut config = test_config();
        config.retry.max_retry_attempts = 1;
        let server = server_with(MockSource::new(u32::MAX), &config);

        let response = server
            .process_message(r#"{"action":"connect","connection_string":"/dev/ttyUSB0"}"#)
            .await;
        assert_eq!(response, r#"{"status":"failed"}"#);
    }

    #[tokio::test]
    async fn test_no_subscribers_skips_cycle() {
        let source = MockSource::new(0);
        let server = server_with(source.clone(), &test_config());
        server.manager().connect("sim://a", ConnectParams::default()).await.unwrap();
        let reads = source.link.read_count();

        assert!(server.broadcast_cycle().await.is_none());
        assert_eq!(source.link.read_count(), reads);
        server.manager().disconnect().await;
    }

    #[tokio::test]
    async fn test_connected_subscriber_gets_one_fresh_snapshot() {
        let server = server_with(MockSource::new(0), &test_config());
        server.manager().connect("sim://a", ConnectParams::default()).await.unwrap();
        let mut rx = fake_subscriber(&server, 4000);

        let report = server.broadcast_cycle().await.unwrap();
        assert_eq!(report, FanOut { delivered: 1, dropped: 0 });

        let snapshot = received_snapshot(&mut rx);
        assert_eq!(snapshot["connection_status"], "CONNECTED");
        let age = unix_timestamp() - snapshot["timestamp"].as_f64().unwrap();
        assert!((0.0..=10.0).contains(&age));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        server.manager().disconnect().await;
    }

    #[tokio::test]
    async fn test_source_loss_keeps_subscribers_with_degraded_data() {
        let source = MockSource::new(0);
        let server = server_with(source.clone(), &test_config());
        server.manager().connect("sim://a", ConnectParams::default()).await.unwrap();
        let mut first = fake_subscriber(&server, 4001);
        let mut second = fake_subscriber(&server, 4002);

        server.broadcast_cycle().await.unwrap();
        received_snapshot(&mut first);
        received_snapshot(&mut second);

        source.link.set_failing(true);
        let report = server.broadcast_cycle().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(received_snapshot(&mut first)["connection_status"], "DEGRADED");
        assert_eq!(received_snapshot(&mut second)["connection_status"], "DEGRADED");
        assert_eq!(server.subscriber_count(), 2);
        server.manager().disconnect().await;
    }

    #[tokio::test]
    async fn test_placeholder_when_disconnected() {
        let server = server_with(MockSource::new(0), &test_config());
        let mut rx = fake_subscriber(&server, 4003);

        server.broadcast_cycle().await.unwrap();
        assert_eq!(received_snapshot(&mut rx)["connection_status"], "MOCK_DATA");
    }

    #[tokio::test]
    async fn test_invalid_snapshot_is_counted_not_sent() {
        let mut config = test_config();
        config.server.placeholder_when_disconnected = false;
        let server = server_with(MockSource::new(0), &config);
        let mut rx = fake_subscriber(&server, 4004);

        assert!(server.broadcast_cycle().await.is_none());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(server.get_health_status().validation_failures, 1);
        assert_eq!(server.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_prunes_subscriber() {
        let server = server_with(MockSource::new(0), &test_config());
        let mut live = fake_subscriber(&server, 4005);
        drop(fake_subscriber(&server, 4006));

        let report = server.broadcast_cycle().await.unwrap();
        assert_eq!(report, FanOut { delivered: 1, dropped: 1 });
        assert_eq!(server.subscriber_count(), 1);
        assert_eq!(
            received_snapshot(&mut live)["connection_status"],
            serde_json::to_value(ConnectionStatus::MockData).unwrap()
        );
    }

    #[tokio::test]
    async fn test_broadcast_loop_sends_once_per_period() {
        let mut config = test_config();
        config.server.broadcast_interval_ms = 200;
        let server = server_with(MockSource::new(0), &config);
        server.start().await.unwrap();
        let mut rx = fake_subscriber(&server, 4007);

        tokio::time::sleep(Duration::from_millis(300)).await;
        received_snapshot(&mut rx);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_and_shutdown_are_idempotent() {
        let server = server_with(MockSource::new(0), &test_config());
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.start().await.unwrap(), addr);
        assert_eq!(server.local_addr(), Some(addr));

        server.shutdown().await;
        assert!(server.is_shutting_down());
        server.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), server.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_websocket_client_gets_shutdown_notice() {
        let mut config = test_config();
        config.server.broadcast_interval_ms = 60_000;
        let server = server_with(MockSource::new(0), &config);
        let addr = server.start().await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /ws HTTP/1.1\r\nHost: 127.0.0.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 101"));

        for _ in 0..100 {
            if server.subscriber_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.subscriber_count(), 1);

        let stopping = server.clone();
        let shutdown = tokio::spawn(async move { stopping.shutdown().await });

        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => break,
                Ok(Ok(n)) => {
                    seen.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&seen).contains("server_shutdown") {
                        break;
                    }
                }
                Err(_) => continue,
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("Server is shutting down"));

        drop(stream);
        shutdown.await.unwrap();
        assert_eq!(server.subscriber_count(), 0);
    }
}
