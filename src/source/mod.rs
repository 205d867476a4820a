//! # Telemetry Source Module
//!
//! Boundary to the external vehicle/protocol decoder.
//!
//! A [`TelemetrySource`] opens a [`VehicleLink`]; the link exposes a fixed
//! set of typed, independently fallible reads. All calls are blocking and
//! may hang, so callers run them on blocking workers under a timeout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::telemetry::{Attitude, Battery, GpsFix, HomeLocation, Position, VehicleState, Velocity};

pub mod simulated;

pub use simulated::SimulatedSource;

/// Extra connection parameters passed through to the source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Serial baud rate, for serial addresses
    #[serde(default)]
    pub baud: Option<u32>,

    /// Source-side connect/wait-ready timeout in seconds
    #[serde(default)]
    pub timeout_s: Option<f64>,
}

/// Capability to open a link to a vehicle
#[cfg_attr(test, mockall::automock)]
pub trait TelemetrySource: Send + Sync {
    /// Open a link to the vehicle at `address` (blocking)
    fn connect(&self, address: &str, params: &ConnectParams) -> Result<Arc<dyn VehicleLink>>;
}

/// Live link to one vehicle
pub trait VehicleLink: Send + Sync {
    fn position(&self) -> Result<Position>;
    fn velocity(&self) -> Result<Velocity>;
    fn attitude(&self) -> Result<Attitude>;
    /// Armed flag, flight mode name and system status
    fn vehicle_state(&self) -> Result<VehicleState>;
    fn battery(&self) -> Result<Battery>;
    /// Raw RC channel values keyed by channel number
    fn channels(&self) -> Result<BTreeMap<String, i32>>;
    /// Unix seconds of the most recent heartbeat, if any was received
    fn last_heartbeat(&self) -> Result<Option<f64>>;
    fn gps(&self) -> Result<GpsFix>;
    /// Heading in degrees
    fn heading(&self) -> Result<f64>;
    fn groundspeed(&self) -> Result<f64>;
    fn airspeed(&self) -> Result<f64>;
    fn home_location(&self) -> Result<HomeLocation>;
    fn is_armable(&self) -> Result<bool>;
    fn ekf_ok(&self) -> Result<bool>;
    /// Names of the flight modes the vehicle supports
    fn flight_modes(&self) -> Result<Vec<String>>;
    /// Release the link
    fn close(&self) -> Result<()>;
}
