//! Server counters and the aggregate health verdict.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::clock::age_of;
use crate::resilience::{BreakerState, BreakerStatus};
use crate::telemetry::CacheStats;

/// Overall verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Request and broadcast counters, updated lock-free
#[derive(Debug, Default)]
pub struct ServerStats {
    messages_processed: AtomicU64,
    error_count: AtomicU64,
    validation_failures: AtomicU64,
    /// Unix seconds of the last snapshot that passed validation
    last_telemetry_update: Mutex<Option<f64>>,
}

/// Plain copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatsView {
    pub messages_processed: u64,
    pub error_count: u64,
    pub validation_failures: u64,
    pub last_telemetry_update: Option<f64>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_telemetry(&self, at: f64) {
        *self.last_telemetry_update.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    pub fn view(&self) -> StatsView {
        StatsView {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            last_telemetry_update: *self.last_telemetry_update.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Limits above which the server reports itself unhealthy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub stale_telemetry: Duration,
    pub max_error_rate_percent: f64,
}

/// Everything the verdict is computed from
#[derive(Debug, Clone)]
pub struct HealthInputs {
    pub stats: StatsView,
    pub uptime: Duration,
    pub connected_clients: usize,
    pub drone_connected: bool,
    pub circuit_breakers: BTreeMap<String, BreakerState>,
    pub cache: Option<CacheStats>,
    /// Unix seconds
    pub now: f64,
}

/// Health report returned by `health_check`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_seconds: f64,
    pub connected_clients: usize,
    pub drone_connected: bool,
    pub messages_processed: u64,
    pub error_count: u64,
    pub error_rate_percent: f64,
    pub validation_failures: u64,
    pub last_telemetry_update: Option<f64>,
    pub last_telemetry_age: Option<f64>,
    pub circuit_breakers: BTreeMap<String, BreakerState>,
    pub cache: Option<CacheStats>,
    pub issues: Vec<String>,
    pub timestamp: f64,
}

/// Errors as a percentage of processed messages
pub fn error_rate_percent(errors: u64, messages: u64) -> f64 {
    errors as f64 / messages.max(1) as f64 * 100.0
}

/// Compute the health report; pure
pub fn assess(inputs: HealthInputs, thresholds: &HealthThresholds) -> HealthReport {
    let stats = inputs.stats;
    let mut issues = Vec::new();

    if !inputs.drone_connected {
        issues.push("drone_disconnected".to_string());
    }

    let last_telemetry_age = stats.last_telemetry_update.map(|at| age_of(at, inputs.now));
    if let Some(age) = last_telemetry_age {
        if age > thresholds.stale_telemetry.as_secs_f64() {
            issues.push(format!("stale_telemetry_{:.1}s", age));
        }
    }

    let error_rate = error_rate_percent(stats.error_count, stats.messages_processed);
    if error_rate > thresholds.max_error_rate_percent {
        issues.push(format!("high_error_rate_{:.1}%", error_rate));
    }

    for (name, state) in &inputs.circuit_breakers {
        if state.state == BreakerStatus::Open {
            issues.push(format!("circuit_breaker_{}_open", name));
        }
    }

    HealthReport {
        status: if issues.is_empty() { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
        uptime_seconds: inputs.uptime.as_secs_f64(),
        connected_clients: inputs.connected_clients,
        drone_connected: inputs.drone_connected,
        messages_processed: stats.messages_processed,
        error_count: stats.error_count,
        error_rate_percent: error_rate,
        validation_failures: stats.validation_failures,
        last_telemetry_update: stats.last_telemetry_update,
        last_telemetry_age,
        circuit_breakers: inputs.circuit_breakers,
        cache: inputs.cache,
        issues,
        timestamp: inputs.now,
    }
}
