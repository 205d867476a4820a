//! # Telemetry Snapshot
//!
//! One complete reading of every telemetry field at a point in time.
//!
//! A [`Snapshot`] always carries every sub-record. When an individual read
//! fails the sub-record holds its documented safe default instead, so
//! downstream consumers never see a partial snapshot.
//!
//! ## Safe Defaults
//!
//! | Sub-record | Default |
//! |------------|---------|
//! | position / velocity / attitude | all `0.0` |
//! | state / control | not armed, mode and status `UNKNOWN` |
//! | battery | `0.0` V, `0.0` A, level `-1` |
//! | heartbeat | `last_heartbeat: null` |
//! | navigation | no fix, 0 satellites, unknown home, not armable |
//! | valid_modes | empty |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::mem::size_of;

/// Mode/status string used when the real value is unknown
pub const UNKNOWN: &str = "UNKNOWN";

/// Connection status tag carried by every snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// Fresh read from a live source
    Connected,
    /// No source; data is cached or defaults
    Disconnected,
    /// Last known good data served after a failed read
    Degraded,
    /// Last known good data served because the telemetry breaker is open
    CircuitBreakerOpen,
    /// Synthetic placeholder generated by the relay
    MockData,
}

/// Global position (degrees, metres)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Velocity in NED frame (m/s)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
}

/// Attitude (radians)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Arming and mode state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub armed: bool,
    pub mode: String,
    pub system_status: String,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            armed: false,
            mode: UNKNOWN.to_string(),
            system_status: UNKNOWN.to_string(),
        }
    }
}

/// Battery readings; `level` is percent remaining or `-1` when unknown
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub voltage: f64,
    pub current: f64,
    pub level: i32,
}

impl Default for Battery {
    fn default() -> Self {
        Self { voltage: 0.0, current: 0.0, level: -1 }
    }
}

/// Vehicle state plus raw RC channel values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub armed: bool,
    pub mode: String,
    pub system_status: String,
    pub channels: BTreeMap<String, i32>,
}

impl Default for Control {
    fn default() -> Self {
        let state = VehicleState::default();
        Self {
            armed: state.armed,
            mode: state.mode,
            system_status: state.system_status,
            channels: BTreeMap::new(),
        }
    }
}

/// Heartbeat timestamp (Unix seconds) as last seen from the source
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    pub last_heartbeat: Option<f64>,
    pub armed: bool,
}

/// GPS fix quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpsFix {
    pub fix_type: u8,
    pub satellites_visible: u8,
}

/// Home position; members are null until the vehicle reports one
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HomeLocation {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
}

/// Navigation and GPS summary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Navigation {
    pub fix_type: u8,
    pub satellites_visible: u8,
    /// Degrees, 0-360
    pub heading: f64,
    pub groundspeed: f64,
    pub airspeed: f64,
    pub home_location: HomeLocation,
    pub is_armable: bool,
    pub ekf_ok: bool,
}

impl Default for Navigation {
    fn default() -> Self {
        Self {
            fix_type: 0,
            satellites_visible: 0,
            heading: 0.0,
            groundspeed: 0.0,
            airspeed: 0.0,
            home_location: HomeLocation::default(),
            is_armable: false,
            ekf_ok: false,
        }
    }
}

/// Flight modes the vehicle can be switched into
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlightModes {
    pub modes: Vec<String>,
}

/// Complete telemetry snapshot
///
/// # Examples
///
/// ```
/// use telemetry_relay::telemetry::{ConnectionStatus, Snapshot};
///
/// let snapshot = Snapshot::defaults(1_700_000_000.0);
/// assert_eq!(snapshot.connection_status, ConnectionStatus::Disconnected);
/// assert_eq!(snapshot.battery.level, -1);
/// assert!(snapshot.heartbeat.last_heartbeat.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unix seconds at which the snapshot was assembled
    pub timestamp: f64,
    pub position: Position,
    pub velocity: Velocity,
    pub attitude: Attitude,
    pub state: VehicleState,
    pub battery: Battery,
    pub control: Control,
    pub heartbeat: Heartbeat,
    pub navigation: Navigation,
    pub valid_modes: FlightModes,
    pub connection_status: ConnectionStatus,
}

impl Snapshot {
    /// All-safe-defaults snapshot tagged `DISCONNECTED`
    pub fn defaults(timestamp: f64) -> Self {
        Self {
            timestamp,
            position: Position::default(),
            velocity: Velocity::default(),
            attitude: Attitude::default(),
            state: VehicleState::default(),
            battery: Battery::default(),
            control: Control::default(),
            heartbeat: Heartbeat::default(),
            navigation: Navigation::default(),
            valid_modes: FlightModes::default(),
            connection_status: ConnectionStatus::Disconnected,
        }
    }

    /// Synthetic snapshot tagged `MOCK_DATA`, simulating a slow circle
    /// around a fixed point. Heartbeat and timestamp are `now`.
    pub fn placeholder(now: f64) -> Self {
        let t = now / 10.0;
        let heading = (t * 10.0).rem_euclid(360.0);
        let state = VehicleState {
            armed: true,
            mode: "AUTO".to_string(),
            system_status: "ACTIVE".to_string(),
        };

        Self {
            timestamp: now,
            position: Position {
                latitude: 37.7749 + 0.001 * t.cos(),
                longitude: -122.4194 + 0.001 * t.sin(),
                altitude: 100.0 + 10.0 * (t * 2.0).sin(),
            },
            velocity: Velocity { vx: 2.0, vy: 1.0, vz: 0.1 },
            attitude: Attitude {
                roll: 5.0 * t.sin(),
                pitch: 3.0 * t.cos(),
                yaw: heading,
            },
            control: Control {
                armed: state.armed,
                mode: state.mode.clone(),
                system_status: state.system_status.clone(),
                channels: BTreeMap::new(),
            },
            state,
            battery: Battery { voltage: 12.6, current: 15.3, level: 85 },
            heartbeat: Heartbeat { last_heartbeat: Some(now), armed: true },
            navigation: Navigation {
                fix_type: 3,
                satellites_visible: 12,
                heading,
                groundspeed: 5.0,
                airspeed: 5.2,
                home_location: HomeLocation {
                    lat: Some(37.7749),
                    lon: Some(-122.4194),
                    alt: Some(0.0),
                },
                is_armable: true,
                ekf_ok: true,
            },
            valid_modes: FlightModes {
                modes: ["STABILIZE", "AUTO", "GUIDED", "LOITER", "RTL", "LAND"]
                    .iter()
                    .map(|m| m.to_string())
                    .collect(),
            },
            connection_status: ConnectionStatus::MockData,
        }
    }

    /// Same snapshot re-tagged with `status`
    pub fn with_status(mut self, status: ConnectionStatus) -> Self {
        self.connection_status = status;
        self
    }

    /// Rough heap + inline footprint in bytes
    pub fn approx_size(&self) -> usize {
        let strings = self.state.mode.capacity()
            + self.state.system_status.capacity()
            + self.control.mode.capacity()
            + self.control.system_status.capacity();
        let channels: usize = self
            .control
            .channels
            .keys()
            .map(|k| k.capacity() + size_of::<String>() + size_of::<i32>())
            .sum();
        let modes: usize = self
            .valid_modes
            .modes
            .iter()
            .map(|m| m.capacity() + size_of::<String>())
            .sum();
        size_of::<Self>() + strings + channels + modes
    }
}
