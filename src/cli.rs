//! Command line surface
//!
//! Every flag overrides the matching configuration value; unset flags leave
//! the file (or default) value alone.

use crate::config::{Config, GeneratorSource};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(author, version = env!("APP_VERSION"), about = "Outback SPC III to Venus OS bridge")]
pub struct Args {
    /// YAML configuration file; the default locations are searched otherwise
    #[clap(long, env = "OUTBACK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Inverter Bluetooth MAC
    #[clap(long = "bt", env = "OUTBACK_MAC")]
    pub mac: Option<String>,

    /// Bluetooth adapter
    #[clap(long = "hci")]
    pub adapter: Option<String>,

    /// Run a simulation scenario instead of the radio link
    #[clap(long = "test", value_name = "SCENARIO")]
    pub scenario: Option<String>,

    /// Seed for simulation and schedule jitter
    #[clap(long)]
    pub seed: Option<u64>,

    /// Starting state of charge of the simulated battery, in percent
    #[clap(long = "test-soc", value_name = "PERCENT")]
    pub test_soc: Option<f64>,

    /// Capacity of the simulated battery
    #[clap(long = "test-capacity", value_name = "WH")]
    pub test_capacity_wh: Option<f64>,

    /// Keep services in memory, no bus
    #[clap(long)]
    pub dry_run: bool,

    /// Run a single tick and exit
    #[clap(long)]
    pub once: bool,

    /// Log the persisted counters and exit
    #[clap(long)]
    pub dump_now: bool,

    /// Warn when L1 does not match solar share plus battery remainder
    #[clap(long)]
    pub balance_check: bool,

    /// Tick interval in milliseconds
    #[clap(long = "poll-ms")]
    pub poll_ms: Option<u64>,

    /// Minimum seconds between radio rounds
    #[clap(long = "bt-interval")]
    pub bt_interval: Option<f64>,

    /// Backoff ceiling in seconds
    #[clap(long = "bt-backoff-max")]
    pub bt_backoff_max: Option<f64>,

    /// Summary log period in seconds, 0 disables
    #[clap(long)]
    pub summary_period: Option<f64>,

    /// Duplicate log suppression window in milliseconds
    #[clap(long)]
    pub rate_limit_ms: Option<u64>,

    #[clap(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Debug logging
    #[clap(long)]
    pub debug: bool,

    #[clap(long)]
    pub vebus_instance: Option<u32>,

    #[clap(long)]
    pub pv_instance: Option<u32>,

    #[clap(long)]
    pub gen_instance: Option<u32>,

    #[clap(long)]
    pub l2_instance: Option<u32>,

    #[clap(long)]
    pub l3_instance: Option<u32>,

    /// L1 power limit in W
    #[clap(long)]
    pub l1_limit: Option<f64>,

    #[clap(long)]
    pub l2_limit: Option<f64>,

    #[clap(long)]
    pub l3_limit: Option<f64>,

    /// Publish and drive the generator channel
    #[clap(long)]
    pub gen_enabled: bool,

    /// Static generator power in W
    #[clap(long)]
    pub gen_power: Option<f64>,
}

impl Args {
    /// Apply the flags on top of `cfg`
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(mac) = &self.mac {
            cfg.device.mac = mac.clone();
        }
        if let Some(adapter) = &self.adapter {
            cfg.device.adapter = adapter.clone();
        }
        if self.scenario.is_some() {
            cfg.simulation.scenario = self.scenario.clone();
        }
        if self.seed.is_some() {
            cfg.simulation.seed = self.seed;
        }
        if let Some(soc) = self.test_soc {
            cfg.simulation.initial_soc = soc;
        }
        if let Some(wh) = self.test_capacity_wh {
            cfg.simulation.battery_capacity_wh = wh;
        }
        if self.dry_run {
            cfg.services.dry_run = true;
        }
        if self.balance_check {
            cfg.balance_check = true;
        }
        if let Some(ms) = self.poll_ms {
            cfg.poll_interval_ms = ms;
        }
        if let Some(s) = self.bt_interval {
            cfg.link.min_interval_s = s;
        }
        if let Some(s) = self.bt_backoff_max {
            cfg.link.backoff_max_s = s;
        }
        if let Some(s) = self.summary_period {
            cfg.summary_period_s = s;
        }
        if let Some(ms) = self.rate_limit_ms {
            cfg.logging.rate_limit_ms = ms;
        }
        if let Some(format) = self.log_format {
            cfg.logging.json_format = format == LogFormat::Json;
        }
        if self.debug {
            cfg.logging.level = "DEBUG".to_string();
        }

        let s = &mut cfg.services;
        for (flag, slot) in [
            (self.vebus_instance, &mut s.vebus_instance),
            (self.pv_instance, &mut s.pvinverter_instance),
            (self.gen_instance, &mut s.generator_instance),
            (self.l2_instance, &mut s.l2_meter_instance),
            (self.l3_instance, &mut s.l3_meter_instance),
        ] {
            if let Some(v) = flag {
                *slot = v;
            }
        }
        for (flag, slot) in [
            (self.l1_limit, &mut s.l1_limit_w),
            (self.l2_limit, &mut s.l2_limit_w),
            (self.l3_limit, &mut s.l3_limit_w),
        ] {
            if let Some(v) = flag {
                *slot = v;
            }
        }

        if self.gen_enabled {
            cfg.generator.enabled = true;
        }
        if let Some(power_w) = self.gen_power {
            cfg.generator.source = GeneratorSource::Static { power_w };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "outback-bridge",
            "--bt",
            "AA:BB:CC:DD:EE:FF",
            "--hci",
            "hci1",
            "--poll-ms",
            "500",
            "--bt-interval",
            "2.5",
            "--log-format",
            "json",
            "--l3-limit",
            "2000",
            "--gen-enabled",
            "--gen-power",
            "800",
            "--debug",
        ]);
        let mut cfg = Config::default();
        args.apply(&mut cfg);

        assert_eq!(cfg.device.mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(cfg.device.adapter, "hci1");
        assert_eq!(cfg.poll_interval_ms, 500);
        assert_eq!(cfg.link.min_interval_s, 2.5);
        assert!(cfg.logging.json_format);
        assert_eq!(cfg.logging.level, "DEBUG");
        assert_eq!(cfg.services.l3_limit_w, 2000.0);
        assert!(cfg.generator.enabled);
        assert_eq!(
            cfg.generator.source,
            GeneratorSource::Static { power_w: 800.0 }
        );
    }

    #[test]
    fn unset_flags_keep_file_values() {
        let args = Args::parse_from(["outback-bridge"]);
        let mut cfg = Config::default();
        cfg.services.vebus_instance = 277;
        cfg.summary_period_s = 0.0;
        args.apply(&mut cfg);
        assert_eq!(cfg.services.vebus_instance, 277);
        assert_eq!(cfg.summary_period_s, 0.0);
        assert!(!cfg.services.dry_run);
    }

    #[test]
    fn test_flag_selects_scenario() {
        let args = Args::parse_from(["outback-bridge", "--test", "night_idle", "--seed", "7"]);
        let mut cfg = Config::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.simulation.scenario.as_deref(), Some("night_idle"));
        assert_eq!(cfg.simulation.seed, Some(7));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn simulated_battery_flags() {
        let args = Args::parse_from([
            "outback-bridge",
            "--test",
            "day_charge",
            "--test-soc",
            "40",
            "--test-capacity",
            "10000",
        ]);
        let mut cfg = Config::default();
        assert_eq!(cfg.simulation.initial_soc, 75.0);
        args.apply(&mut cfg);
        assert_eq!(cfg.simulation.initial_soc, 40.0);
        assert_eq!(cfg.simulation.battery_capacity_wh, 10000.0);
        assert!(cfg.validate().is_ok());

        let args = Args::parse_from(["outback-bridge", "--test-soc", "130"]);
        args.apply(&mut cfg);
        assert!(cfg.validate().is_err());
    }
}
