//! # Telemetry Module
//!
//! Telemetry data model, validation, and snapshot history.
//!
//! This module handles:
//! - The [`Snapshot`] record and its per-field safe defaults
//! - Freshness/completeness validation before broadcast
//! - The bounded, time-indexed snapshot cache with background eviction

pub mod snapshot;
pub mod validation;
pub mod cache;

pub use cache::{CacheStats, TelemetrySnapshotCache};
pub use snapshot::{
    Attitude, Battery, ConnectionStatus, Control, FlightModes, GpsFix, Heartbeat, HomeLocation,
    Navigation, Position, Snapshot, VehicleState, Velocity,
};
