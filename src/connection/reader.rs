//! Time-boxed field reads.
//!
//! Every [`VehicleLink`] call runs on its own blocking worker under a
//! timeout. A timed-out worker is detached and its late result discarded,
//! so one stuck field never stalls a snapshot beyond its bound.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::VehicleSummary;
use crate::clock::unix_timestamp;
use crate::config::MonitorConfig;
use crate::error::{RelayError, Result};
use crate::source::VehicleLink;
use crate::telemetry::{
    ConnectionStatus, Control, FlightModes, Heartbeat, Navigation, Snapshot,
};

/// Number of independent reads that make up a snapshot
pub const SNAPSHOT_FIELDS: usize = 15;

/// Run one blocking link read under `bound`
pub async fn read_field<T, F>(
    link: &Arc<dyn VehicleLink>,
    field: &'static str,
    bound: Duration,
    read: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn VehicleLink) -> Result<T> + Send + 'static,
{
    let link = Arc::clone(link);
    let worker = tokio::task::spawn_blocking(move || read(link.as_ref()));

    match tokio::time::timeout(bound, worker).await {
        Ok(joined) => joined?,
        Err(_) => Err(RelayError::ReadTimeout(format!(
            "{} exceeded {}ms",
            field,
            bound.as_millis()
        ))),
    }
}

/// Keeps a field's value, or records the failure and yields the default
fn or_default<T: Default>(field: &'static str, result: Result<T>, failed: &mut Vec<&'static str>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            debug!(field, error = %e, "Field read failed, using default");
            failed.push(field);
            T::default()
        }
    }
}

/// Snapshot assembler with per-field time bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldReader {
    /// Bound for cheap reads
    pub field_timeout: Duration,
    /// Bound for channels, home location and flight modes
    pub slow_field_timeout: Duration,
}

impl FieldReader {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            field_timeout: config.field_timeout(),
            slow_field_timeout: config.slow_field_timeout(),
        }
    }

    /// Read every field concurrently and assemble a `CONNECTED` snapshot
    ///
    /// Failed or timed-out fields hold their safe default. Completes within
    /// `slow_field_timeout` regardless of how many reads hang.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ReadTimeout`] only when every field failed.
    pub async fn read_snapshot(&self, link: &Arc<dyn VehicleLink>) -> Result<Snapshot> {
        let fast = self.field_timeout;
        let slow = self.slow_field_timeout;

        let (
            position,
            velocity,
            attitude,
            state,
            battery,
            channels,
            last_heartbeat,
            gps,
            heading,
            groundspeed,
            airspeed,
            home_location,
            is_armable,
            ekf_ok,
            modes,
        ) = tokio::join!(
            read_field(link, "position", fast, |l| l.position()),
            read_field(link, "velocity", fast, |l| l.velocity()),
            read_field(link, "attitude", fast, |l| l.attitude()),
            read_field(link, "vehicle_state", fast, |l| l.vehicle_state()),
            read_field(link, "battery", fast, |l| l.battery()),
            read_field(link, "channels", slow, |l| l.channels()),
            read_field(link, "last_heartbeat", fast, |l| l.last_heartbeat()),
            read_field(link, "gps", fast, |l| l.gps()),
            read_field(link, "heading", fast, |l| l.heading()),
            read_field(link, "groundspeed", fast, |l| l.groundspeed()),
            read_field(link, "airspeed", fast, |l| l.airspeed()),
            read_field(link, "home_location", slow, |l| l.home_location()),
            read_field(link, "is_armable", fast, |l| l.is_armable()),
            read_field(link, "ekf_ok", fast, |l| l.ekf_ok()),
            read_field(link, "flight_modes", slow, |l| l.flight_modes()),
        );

        let mut failed = Vec::new();
        let position = or_default("position", position, &mut failed);
        let velocity = or_default("velocity", velocity, &mut failed);
        let attitude = or_default("attitude", attitude, &mut failed);
        let state = or_default("vehicle_state", state, &mut failed);
        let battery = or_default("battery", battery, &mut failed);
        let channels = or_default("channels", channels, &mut failed);
        let last_heartbeat = or_default("last_heartbeat", last_heartbeat, &mut failed);
        let gps = or_default("gps", gps, &mut failed);
        let heading = or_default("heading", heading, &mut failed);
        let groundspeed = or_default("groundspeed", groundspeed, &mut failed);
        let airspeed = or_default("airspeed", airspeed, &mut failed);
        let home_location = or_default("home_location", home_location, &mut failed);
        let is_armable = or_default("is_armable", is_armable, &mut failed);
        let ekf_ok = or_default("ekf_ok", ekf_ok, &mut failed);
        let modes = or_default("flight_modes", modes, &mut failed);

        if failed.len() == SNAPSHOT_FIELDS {
            return Err(RelayError::ReadTimeout(format!(
                "all {} telemetry fields failed",
                SNAPSHOT_FIELDS
            )));
        }
        if !failed.is_empty() {
            debug!(failed = ?failed, "Snapshot assembled with defaults");
        }

        Ok(Snapshot {
            timestamp: unix_timestamp(),
            position,
            velocity,
            attitude,
            control: Control {
                armed: state.armed,
                mode: state.mode.clone(),
                system_status: state.system_status.clone(),
                channels,
            },
            heartbeat: Heartbeat { last_heartbeat, armed: state.armed },
            state,
            battery,
            navigation: Navigation {
                fix_type: gps.fix_type,
                satellites_visible: gps.satellites_visible,
                heading,
                groundspeed,
                airspeed,
                home_location,
                is_armable,
                ekf_ok,
            },
            valid_modes: FlightModes { modes },
            connection_status: ConnectionStatus::Connected,
        })
    }

    /// Read armed/mode/status and the last heartbeat
    ///
    /// # Errors
    ///
    /// Fails if either read fails or times out.
    pub async fn read_vitals(&self, link: &Arc<dyn VehicleLink>) -> Result<VehicleSummary> {
        let (state, last_heartbeat) = tokio::join!(
            read_field(link, "vehicle_state", self.field_timeout, |l| l.vehicle_state()),
            read_field(link, "last_heartbeat", self.field_timeout, |l| l.last_heartbeat()),
        );
        let state = state?;

        Ok(VehicleSummary {
            armed: state.armed,
            mode: state.mode,
            system_status: state.system_status,
            last_heartbeat: last_heartbeat?,
        })
    }
}
