//! # Telemetry Relay Library
//!
//! Relay live vehicle telemetry to WebSocket subscribers.
//!
//! The relay pulls snapshots from a vehicle link, keeps a bounded history
//! of them, and pushes validated snapshots to every attached subscriber at
//! a fixed rate. Retry with exponential backoff and circuit breakers keep a
//! flaky link from stalling the subscribers.

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod resilience;
pub mod server;
pub mod source;
pub mod telemetry;
