//! # Resilience Module
//!
//! Failure isolation and retry pacing.
//!
//! This module handles:
//! - Circuit breakers guarding connect and telemetry read paths
//! - The breaker registry shared by every component that creates breakers
//! - Exponential backoff with jitter for reconnect attempts

pub mod circuit_breaker;
pub mod backoff;

pub use backoff::ExponentialBackoff;
pub use circuit_breaker::{BreakerRegistry, BreakerState, BreakerStatus, CircuitBreaker};
