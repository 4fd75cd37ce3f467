//! Configuration management for the bridge
//!
//! The configuration is a single typed YAML document resolved once at startup.
//! Every section has explicit defaults so an empty or missing file yields a
//! working setup; command line flags are applied on top by the binary.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Radio peer identity
    pub device: DeviceConfig,

    /// Round scheduling and timeouts for the radio link
    pub link: LinkConfig,

    /// Reconciliation, smoothing and classification constants
    pub reconcile: ReconcileConfig,

    /// Generator relay control
    pub generator: GeneratorConfig,

    /// Published bus services
    pub services: ServicesConfig,

    /// Counter persistence
    pub persistence: PersistenceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Synthetic telemetry instead of the radio link
    pub simulation: SimulationConfig,

    /// Orchestrator tick interval in milliseconds
    pub poll_interval_ms: u64,

    /// Summary log period in seconds (0 disables)
    pub summary_period_s: f64,

    /// Warn when L1 differs from solar share plus battery remainder
    pub balance_check: bool,

    /// Seconds without a fresh snapshot before the reader counts as stalled
    pub stall_after_s: f64,

    /// IANA timezone for the counters' calendar day; host local time when unset
    pub timezone: Option<String>,
}

/// Link-layer address type used when connecting to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Public,
    Random,
}

impl AddressType {
    /// The other addressing mode
    pub const fn toggled(self) -> Self {
        match self {
            Self::Public => Self::Random,
            Self::Random => Self::Public,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Random => "random",
        }
    }
}

/// Radio peer identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bluetooth MAC of the inverter
    pub mac: String,

    /// Local adapter name (hci0, hci1, ...)
    pub adapter: String,
}

/// Round scheduling and timeouts for the radio link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Minimum seconds between round starts after a success
    pub min_interval_s: f64,

    /// Upper bound of the backoff ladder in seconds
    pub backoff_max_s: f64,

    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Per-characteristic read timeout in milliseconds
    pub read_timeout_ms: u64,

    /// Initial address type, overridden by the persisted known-good mode
    pub address_type: AddressType,

    /// Toggle address type after repeated failures
    pub adaptive_addressing: bool,

    /// Seconds between link statistics log lines
    pub stats_period_s: f64,
}

/// Reconciliation, smoothing and classification constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Maximum battery remainder ramp in W/s
    pub ramp_w_per_s: f64,

    /// EMA factor applied to the ramped battery remainder
    pub ema_alpha: f64,

    /// Inverter self consumption attributed to the battery at night (W)
    pub self_consumption_w: f64,

    /// Solar share below which the self consumption applies (W)
    pub night_pv_threshold_w: f64,

    /// EMA factor for classifier inputs
    pub classify_ema_alpha: f64,

    /// Hysteresis band for regime classification (W)
    pub regime_eps_w: f64,

    /// Residual that triggers a balance warning (W)
    pub balance_tolerance_w: f64,
}

/// Where the generator channel reads its power
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GeneratorSource {
    /// Fixed power value
    Static { power_w: f64 },
    /// A numeric BusItem on the system bus
    Remote { service: String, path: String },
}

/// Where the passthrough flag comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PassthroughSource {
    /// Derived from the inverter state heuristic (state 11)
    Derived,
    /// A numeric BusItem; non-zero means passthrough
    Remote { service: String, path: String },
}

/// Generator relay control
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Publish and drive the generator channel
    pub enabled: bool,

    /// Start threshold in W
    pub start_w: f64,

    /// Stop threshold in W
    pub stop_w: f64,

    /// Minimum run time in seconds
    pub min_run_s: f64,

    /// Power limit advertised on the generator service
    pub power_limit_w: f64,

    /// Generator power source
    pub source: GeneratorSource,

    /// Passthrough flag source
    pub passthrough: PassthroughSource,
}

/// Published bus services
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Keep values in memory only, no bus connection
    pub dry_run: bool,

    /// Fail startup when the bus cannot be reached
    pub require_dbus: bool,

    pub vebus_instance: u32,
    pub pvinverter_instance: u32,
    pub generator_instance: u32,
    pub l2_meter_instance: u32,
    pub l3_meter_instance: u32,

    /// Publish the L2/L3 auxiliary meters as acmeter services
    pub publish_phase_meters: bool,

    pub l1_limit_w: f64,
    pub l2_limit_w: f64,
    pub l3_limit_w: f64,
}

/// Counter persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// JSON state file
    pub state_file: String,

    /// Minimum seconds between non-forced writes
    pub debounce_s: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level
    pub level: String,

    /// Optional console level override
    pub console_level: Option<String>,

    /// Optional file level override
    pub file_level: Option<String>,

    /// Log file path; its directory receives the daily rolled files
    pub file: String,

    /// Number of rolled files to keep
    pub backup_count: u32,

    /// Also log to stdout
    pub console_output: bool,

    /// Emit JSON lines
    pub json_format: bool,

    /// Drop identical messages from one component within this window (ms)
    pub rate_limit_ms: u64,
}

/// Synthetic telemetry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Scenario name; `None` runs the live radio link
    pub scenario: Option<String>,

    /// Seed for jitter, making runs reproducible
    pub seed: Option<u64>,

    /// Capacity of the simulated battery in Wh
    pub battery_capacity_wh: f64,

    /// State of charge the simulated battery starts from (%)
    pub initial_soc: f64,
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default locations or fall back to defaults
    pub fn load() -> Result<Self> {
        let default_paths = [
            "outback_bridge.yaml",
            "/data/outback_spc/config.yaml",
            "/etc/outback-bridge/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.simulation.scenario.is_none() && self.device.mac.trim().is_empty() {
            return Err(BridgeError::validation(
                "device.mac",
                "MAC address cannot be empty",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(BridgeError::validation(
                "poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        for (field, seconds, zero_ok) in [
            ("link.min_interval_s", self.link.min_interval_s, false),
            ("link.backoff_max_s", self.link.backoff_max_s, false),
            ("link.stats_period_s", self.link.stats_period_s, false),
            ("stall_after_s", self.stall_after_s, false),
            ("persistence.debounce_s", self.persistence.debounce_s, true),
            ("summary_period_s", self.summary_period_s, true),
            ("generator.min_run_s", self.generator.min_run_s, true),
        ] {
            check_seconds(field, seconds, zero_ok)?;
        }

        if self.link.connect_timeout_ms == 0 || self.link.read_timeout_ms == 0 {
            return Err(BridgeError::validation(
                "link.timeouts",
                "Connect and read timeouts must be greater than 0",
            ));
        }

        for (field, alpha) in [
            ("reconcile.ema_alpha", self.reconcile.ema_alpha),
            ("reconcile.classify_ema_alpha", self.reconcile.classify_ema_alpha),
        ] {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(BridgeError::validation(field, "Must be in (0, 1]"));
            }
        }

        if !(self.reconcile.ramp_w_per_s > 0.0 && self.reconcile.ramp_w_per_s.is_finite()) {
            return Err(BridgeError::validation(
                "reconcile.ramp_w_per_s",
                "Must be positive",
            ));
        }

        if !(self.reconcile.regime_eps_w >= 0.0 && self.reconcile.regime_eps_w.is_finite()) {
            return Err(BridgeError::validation(
                "reconcile.regime_eps_w",
                "Must not be negative",
            ));
        }

        if !self.generator.start_w.is_finite() || !self.generator.stop_w.is_finite() {
            return Err(BridgeError::validation(
                "generator.start_w",
                "Thresholds must be finite",
            ));
        }

        if self.generator.start_w <= self.generator.stop_w {
            return Err(BridgeError::validation(
                "generator.start_w",
                "Must be greater than generator.stop_w",
            ));
        }

        if self.persistence.state_file.trim().is_empty() {
            return Err(BridgeError::validation(
                "persistence.state_file",
                "Path cannot be empty",
            ));
        }

        if let Some(tz) = &self.timezone
            && tz.parse::<chrono_tz::Tz>().is_err()
        {
            return Err(BridgeError::validation(
                "timezone".to_string(),
                format!("Unknown timezone '{}'", tz),
            ));
        }

        let sim = &self.simulation;
        if !(sim.battery_capacity_wh > 0.0 && sim.battery_capacity_wh.is_finite()) {
            return Err(BridgeError::validation(
                "simulation.battery_capacity_wh",
                "Must be positive",
            ));
        }

        if !(0.0..=100.0).contains(&sim.initial_soc) {
            return Err(BridgeError::validation(
                "simulation.initial_soc",
                "Must be within 0..=100",
            ));
        }

        if let Some(name) = &self.simulation.scenario
            && crate::sim::Scenario::by_name(name).is_none()
        {
            return Err(BridgeError::validation(
                "simulation.scenario".to_string(),
                format!("Unknown scenario '{}'", name),
            ));
        }

        Ok(())
    }
}

/// Reject seconds that cannot become a `Duration`, and zero unless `zero_ok`
fn check_seconds(field: &str, seconds: f64, zero_ok: bool) -> Result<()> {
    let in_range = if zero_ok { seconds >= 0.0 } else { seconds > 0.0 };
    if in_range && Duration::try_from_secs_f64(seconds).is_ok() {
        return Ok(());
    }
    let expected = if zero_ok {
        "Must be a finite, non-negative number of seconds"
    } else {
        "Must be a finite, positive number of seconds"
    };
    Err(BridgeError::validation(field.to_string(), expected.to_string()))
}
