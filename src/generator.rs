//! Generator relay control with start/stop hysteresis and minimum run time

use crate::config::GeneratorConfig;
use crate::logging::{StructuredLogger, get_logger};
use tokio::time::Instant;

/// Controller state; memory only, a restart begins Off
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorState {
    pub running: bool,
    pub last_change_at: Option<Instant>,
}

/// Values published on the generator channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorOutput {
    pub running: bool,
    pub power_w: f64,
    pub voltage: f64,
    pub current: f64,
}

impl GeneratorOutput {
    pub const STOPPED: Self = Self {
        running: false,
        power_w: 0.0,
        voltage: 0.0,
        current: 0.0,
    };
}

#[derive(Debug)]
pub struct GeneratorController {
    start_w: f64,
    stop_w: f64,
    min_run_s: f64,
    state: GeneratorState,
    logger: StructuredLogger,
}

impl GeneratorController {
    pub fn new(cfg: &GeneratorConfig) -> Self {
        Self {
            start_w: cfg.start_w,
            stop_w: cfg.stop_w,
            min_run_s: cfg.min_run_s,
            state: GeneratorState {
                running: false,
                last_change_at: None,
            },
            logger: get_logger("generator"),
        }
    }

    pub const fn state(&self) -> GeneratorState {
        self.state
    }

    /// Apply the hysteresis rule at the current instant
    pub fn update(&mut self, passthrough_active: bool, source_power_w: f64, voltage: f64) -> GeneratorOutput {
        self.update_at(passthrough_active, source_power_w, voltage, Instant::now())
    }

    /// Apply the hysteresis rule at `now`
    pub fn update_at(
        &mut self,
        passthrough_active: bool,
        source_power_w: f64,
        voltage: f64,
        now: Instant,
    ) -> GeneratorOutput {
        let power = if source_power_w.is_finite() {
            source_power_w
        } else {
            0.0
        };

        if !passthrough_active {
            if self.state.running {
                self.transition(false, now, power, "passthrough inactive");
            }
        } else if !self.state.running {
            if power >= self.start_w {
                self.transition(true, now, power, "start threshold reached");
            }
        } else {
            let elapsed = self
                .state
                .last_change_at
                .map_or(f64::INFINITY, |t| now.saturating_duration_since(t).as_secs_f64());
            if elapsed >= self.min_run_s && power <= self.stop_w {
                self.transition(false, now, power, "stop threshold reached");
            }
        }

        if !self.state.running {
            return GeneratorOutput::STOPPED;
        }
        let current = if voltage > 0.0 { power / voltage } else { 0.0 };
        GeneratorOutput {
            running: true,
            power_w: power,
            voltage,
            current,
        }
    }

    fn transition(&mut self, running: bool, now: Instant, power: f64, reason: &str) {
        self.state = GeneratorState {
            running,
            last_change_at: Some(now),
        };
        self.logger.info(&format!(
            "Generator {} ({}, P={:.0} W)",
            if running { "START" } else { "STOP" },
            reason,
            power
        ));
    }
}
