//! In-process simulated vehicle.
//!
//! Lets the relay run end to end without hardware. The vehicle flies a slow
//! circle and reports a heartbeat on every read.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use super::{ConnectParams, TelemetrySource, VehicleLink};
use crate::clock::unix_timestamp;
use crate::error::{RelayError, Result};
use crate::telemetry::{
    Attitude, Battery, GpsFix, HomeLocation, Position, Snapshot, VehicleState, Velocity,
};

/// Address scheme handled by [`SimulatedSource`]
pub const SIM_SCHEME: &str = "sim://";

/// Number of RC channels the simulated receiver reports
const SIM_CHANNELS: usize = 8;

/// Source that opens [`SimulatedLink`]s for `sim://` addresses
#[derive(Debug, Default, Clone)]
pub struct SimulatedSource;

impl SimulatedSource {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetrySource for SimulatedSource {
    fn connect(&self, address: &str, params: &ConnectParams) -> Result<Arc<dyn VehicleLink>> {
        let name = address
            .strip_prefix(SIM_SCHEME)
            .ok_or_else(|| RelayError::Source(format!("Unsupported address: {}", address)))?;

        info!(vehicle = name, baud = ?params.baud, "Simulated vehicle link opened");
        Ok(Arc::new(SimulatedLink::new()))
    }
}

/// Link to the simulated vehicle
#[derive(Debug)]
pub struct SimulatedLink {
    closed: AtomicBool,
}

impl SimulatedLink {
    fn new() -> Self {
        Self { closed: AtomicBool::new(false) }
    }

    /// Current simulated state; fails once the link is closed
    fn frame(&self) -> Result<Snapshot> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Source("Simulated link closed".to_string()));
        }
        Ok(Snapshot::placeholder(unix_timestamp()))
    }
}

impl VehicleLink for SimulatedLink {
    fn position(&self) -> Result<Position> {
        Ok(self.frame()?.position)
    }

    fn velocity(&self) -> Result<Velocity> {
        Ok(self.frame()?.velocity)
    }

    fn attitude(&self) -> Result<Attitude> {
        Ok(self.frame()?.attitude)
    }

    fn vehicle_state(&self) -> Result<VehicleState> {
        Ok(self.frame()?.state)
    }

    fn battery(&self) -> Result<Battery> {
        Ok(self.frame()?.battery)
    }

    fn channels(&self) -> Result<BTreeMap<String, i32>> {
        self.frame()?;
        Ok((1..=SIM_CHANNELS).map(|ch| (ch.to_string(), 1500)).collect())
    }

    fn last_heartbeat(&self) -> Result<Option<f64>> {
        Ok(self.frame()?.heartbeat.last_heartbeat)
    }

    fn gps(&self) -> Result<GpsFix> {
        let nav = self.frame()?.navigation;
        Ok(GpsFix { fix_type: nav.fix_type, satellites_visible: nav.satellites_visible })
    }

    fn heading(&self) -> Result<f64> {
        Ok(self.frame()?.navigation.heading)
    }

    fn groundspeed(&self) -> Result<f64> {
        Ok(self.frame()?.navigation.groundspeed)
    }

    fn airspeed(&self) -> Result<f64> {
        Ok(self.frame()?.navigation.airspeed)
    }

    fn home_location(&self) -> Result<HomeLocation> {
        Ok(self.frame()?.navigation.home_location)
    }

    fn is_armable(&self) -> Result<bool> {
        Ok(self.frame()?.navigation.is_armable)
    }

    fn ekf_ok(&self) -> Result<bool> {
        Ok(self.frame()?.navigation.ekf_ok)
    }

    fn flight_modes(&self) -> Result<Vec<String>> {
        Ok(self.frame()?.valid_modes.modes)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_foreign_address() {
        let source = SimulatedSource::new();
        assert!(source.connect("udp:127.0.0.1:14550", &ConnectParams::default()).is_err());
    }

    #[test]
    fn test_link_reports_fresh_heartbeat() {
        let link = SimulatedSource::new()
            .connect("sim://local", &ConnectParams::default())
            .unwrap();
        let heartbeat = link.last_heartbeat().unwrap().unwrap();
        assert!((unix_timestamp() - heartbeat).abs() < 1.0);
        assert_eq!(link.channels().unwrap().len(), SIM_CHANNELS);
        assert_eq!(link.gps().unwrap().fix_type, 3);
    }

    #[test]
    fn test_closed_link_fails_reads() {
        let link = SimulatedSource::new()
            .connect("sim://local", &ConnectParams::default())
            .unwrap();
        link.close().unwrap();
        assert!(link.position().is_err());
        assert!(link.last_heartbeat().is_err());
    }
}
