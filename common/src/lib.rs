//! Shared types and constants for the QoS probes
//!
//! This crate provides the measurement names, default parameters and packet
//! event types shared between the probe implementations and their consumers.

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{PacketEvent, ProbeKind};
