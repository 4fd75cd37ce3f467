use super::*;

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mac: String::new(),
            adapter: "hci0".to_string(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            min_interval_s: 1.8,
            backoff_max_s: 15.0,
            connect_timeout_ms: 3000,
            read_timeout_ms: 1500,
            address_type: AddressType::Public,
            adaptive_addressing: true,
            stats_period_s: 30.0,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            ramp_w_per_s: 700.0,
            ema_alpha: 0.35,
            self_consumption_w: 35.0,
            night_pv_threshold_w: 5.0,
            classify_ema_alpha: 0.3,
            regime_eps_w: 50.0,
            balance_tolerance_w: 50.0,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_w: 120.0,
            stop_w: 60.0,
            min_run_s: 8.0,
            power_limit_w: 3000.0,
            source: GeneratorSource::Static { power_w: 0.0 },
            passthrough: PassthroughSource::Derived,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            require_dbus: false,
            vebus_instance: 40,
            pvinverter_instance: 61,
            generator_instance: 38,
            l2_meter_instance: 32,
            l3_meter_instance: 33,
            publish_phase_meters: true,
            l1_limit_w: 3000.0,
            l2_limit_w: 3000.0,
            l3_limit_w: 1500.0,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_file: "/data/outback_spc/state.json".to_string(),
            debounce_s: 15.0,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            scenario: None,
            seed: None,
            battery_capacity_wh: 5000.0,
            initial_soc: 75.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/data/log/outback-bridge/outback-bridge.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
            rate_limit_ms: 400,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            link: LinkConfig::default(),
            reconcile: ReconcileConfig::default(),
            generator: GeneratorConfig::default(),
            services: ServicesConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
            simulation: SimulationConfig::default(),
            poll_interval_ms: 1000,
            summary_period_s: 5.0,
            balance_check: false,
            stall_after_s: 10.0,
            timezone: None,
        }
    }
}
