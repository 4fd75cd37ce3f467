//! Anti-double-counting reconciliation of the inverter's L1 output
//!
//! The inverter reports a single AC power for L1 that mixes solar passing
//! straight through and energy drawn from the battery. The battery monitor
//! tells how much is actually leaving storage; everything above that is
//! attributed to solar. The battery-facing remainder is ramp limited and
//! smoothed, the solar share is reported as-is.

use crate::config::ReconcileConfig;

/// Solar share of the L1 output.
///
/// `dc_power_signed > 0` is charging, `< 0` discharging. The result never
/// exceeds `l1_ac_power` and is never negative.
pub fn compute_pv_ac(l1_ac_power: f64, dc_power_signed: f64) -> f64 {
    let l1 = l1_ac_power.max(0.0);
    (l1 - (-dc_power_signed).max(0.0)).clamp(0.0, l1)
}

/// Tick-scoped reconciliation result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconciledPowers {
    /// Solar-attributed L1 power, unsmoothed
    pub pv_to_ac_l1: f64,
    /// Battery-only L1 power after ramp and EMA
    pub battery_remainder_l1: f64,
    /// Unsmoothed remainder target, useful for diagnostics
    pub battery_target_l1: f64,
    pub dc_power_signed: f64,
}

/// Exponential moving average
///
/// With `seed = None` the first sample is taken as-is; with a seed the
/// filter starts from that value.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub const fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub const fn seeded(alpha: f64, seed: f64) -> Self {
        Self {
            alpha,
            value: Some(seed),
        }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        let y = match self.value {
            Some(prev) => self.alpha.mul_add(x, (1.0 - self.alpha) * prev),
            None => x,
        };
        self.value = Some(y);
        y
    }

    pub const fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Rate limiter on a scalar signal (units per second)
#[derive(Debug, Clone, Copy)]
pub struct RampLimiter {
    rate_per_s: f64,
    prev: f64,
}

impl RampLimiter {
    pub const fn new(rate_per_s: f64) -> Self {
        Self {
            rate_per_s,
            prev: 0.0,
        }
    }

    pub fn step(&mut self, target: f64, dt_s: f64) -> f64 {
        let max_step = self.rate_per_s * dt_s.max(0.0);
        self.prev += (target - self.prev).clamp(-max_step, max_step);
        self.prev
    }
}

/// Stateful reconciler: formula plus battery-remainder smoothing
#[derive(Debug, Clone)]
pub struct EnergyReconciler {
    self_consumption_w: f64,
    night_pv_threshold_w: f64,
    ramp: RampLimiter,
    ema: Ema,
}

impl EnergyReconciler {
    pub const fn new(cfg: &ReconcileConfig) -> Self {
        Self {
            self_consumption_w: cfg.self_consumption_w,
            night_pv_threshold_w: cfg.night_pv_threshold_w,
            ramp: RampLimiter::new(cfg.ramp_w_per_s),
            ema: Ema::seeded(cfg.ema_alpha, 0.0),
        }
    }

    /// Unsmoothed split of L1 into solar share and battery remainder
    pub fn split(&self, l1_ac_power: f64, dc_power_signed: f64) -> (f64, f64) {
        let l1 = l1_ac_power.max(0.0);
        let pv = compute_pv_ac(l1, dc_power_signed);
        let night = if pv < self.night_pv_threshold_w && dc_power_signed < 0.0 {
            self.self_consumption_w
        } else {
            0.0
        };
        (pv, (l1 - pv + night).max(0.0))
    }

    /// Reconcile one tick; `dt_s` drives the ramp limit
    pub fn reconcile(&mut self, l1_ac_power: f64, dc_power_signed: f64, dt_s: f64) -> ReconciledPowers {
        let (pv, target) = self.split(l1_ac_power, dc_power_signed);
        let ramped = self.ramp.step(target, dt_s);
        let smoothed = self.ema.update(ramped).max(0.0);
        ReconciledPowers {
            pv_to_ac_l1: pv,
            battery_remainder_l1: smoothed,
            battery_target_l1: target,
            dc_power_signed,
        }
    }
}
