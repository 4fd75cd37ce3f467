//! # outback-bridge - Outback SPC III telemetry for Victron Venus OS
//!
//! Reads the inverter's telemetry over Bluetooth LE, reconciles its L1
//! output against the battery monitor so solar passing through the inverter
//! is not counted twice, and publishes the result as VeDbus-style services.
//!
//! ## Architecture
//!
//! - `link`: radio rounds, block decoding, backoff and the worker task
//! - `sources`: battery monitor and auxiliary meters read from the bus
//! - `reconcile`: solar share and smoothed battery remainder
//! - `regime`: operating regime and VE.Bus-style state
//! - `counters`: persisted forward energy counters
//! - `generator`: generator channel with hysteresis
//! - `publish`: service roles and their path sets
//! - `dbus`: VeDbus-style export on top of zbus
//! - `bridge`: the tick loop tying it together
//! - `sim`: synthetic telemetry scenarios
//! - `config`, `cli`, `logging`, `persistence`, `error`: ambient plumbing

pub mod bridge;
pub mod cli;
pub mod config;
pub mod counters;
pub mod dbus;
pub mod error;
pub mod generator;
pub mod link;
pub mod logging;
pub mod persistence;
pub mod publish;
pub mod reconcile;
pub mod regime;
pub mod sim;
pub mod sources;

// Re-export commonly used types
pub use bridge::Bridge;
pub use config::Config;
pub use error::{BridgeError, Result};
