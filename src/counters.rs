//! Forward energy counters
//!
//! A [`ForwardCounter`] integrates positive power over time into a lifetime
//! total and a per-calendar-day total. [`ForwardCounterStore`] owns the three
//! persisted counters together with the link's known-good address type and
//! writes them through a debounced, atomic save.

use crate::config::AddressType;
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::persistence::{PersistenceManager, PersistentState};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

/// Convert power over an interval to kWh
pub fn kwh(power_w: f64, dt_s: f64) -> f64 {
    power_w * dt_s / 3600.0 / 1000.0
}

/// Lifetime and day-scoped energy totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardCounter {
    pub lifetime_kwh: f64,
    pub day_kwh: f64,
    pub day_date: Option<NaiveDate>,
}

/// Point-in-time view of a counter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSnapshot {
    pub lifetime_kwh: f64,
    pub day_kwh: f64,
    pub day_date: Option<NaiveDate>,
}

impl ForwardCounter {
    /// Add `power_w` over `dt_s` seconds, rolling the day over first if
    /// `today` differs from the stored date. Returns whether anything changed.
    pub fn integrate(&mut self, power_w: f64, dt_s: f64, today: NaiveDate) -> bool {
        let mut changed = false;
        if self.day_date != Some(today) {
            self.day_kwh = 0.0;
            self.day_date = Some(today);
            changed = true;
        }
        if !power_w.is_finite() || !dt_s.is_finite() {
            return changed;
        }
        let inc = kwh(power_w, dt_s);
        if inc > 0.0 {
            self.lifetime_kwh += inc;
            self.day_kwh += inc;
            changed = true;
        }
        changed
    }

    pub const fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            lifetime_kwh: self.lifetime_kwh,
            day_kwh: self.day_kwh,
            day_date: self.day_date,
        }
    }
}

/// Which persisted counter to address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meter {
    /// Solar share on L1
    Pv,
    /// Auxiliary meter on L2
    L2,
    /// Auxiliary meter on L3
    L3,
}

/// Source of the local calendar date
#[derive(Debug, Clone, Copy)]
pub enum DayClock {
    /// Host local time
    Local,
    /// Fixed IANA zone
    Zone(chrono_tz::Tz),
}

impl DayClock {
    /// Build from an optional IANA name; unknown names fall back to host time
    pub fn from_timezone(tz: Option<&str>) -> Self {
        tz.and_then(|name| name.parse::<chrono_tz::Tz>().ok())
            .map_or(Self::Local, Self::Zone)
    }

    pub fn today(&self) -> NaiveDate {
        match self {
            Self::Local => chrono::Local::now().date_naive(),
            Self::Zone(tz) => chrono::Utc::now().with_timezone(tz).date_naive(),
        }
    }
}

/// Persisted forward counters with debounced atomic saves
#[derive(Debug)]
pub struct ForwardCounterStore {
    state: PersistentState,
    persistence: PersistenceManager,
    clock: DayClock,
    debounce: Duration,
    dirty: bool,
    last_save: Option<Instant>,
    logger: StructuredLogger,
}

impl ForwardCounterStore {
    /// Open the store, loading existing state or starting from zero
    pub fn open<P: AsRef<Path>>(path: P, debounce: Duration, clock: DayClock) -> Self {
        let persistence = PersistenceManager::new(path);
        let state = persistence.load();
        Self {
            state,
            persistence,
            clock,
            debounce,
            dirty: false,
            last_save: None,
            logger: get_logger("counters"),
        }
    }

    fn counter_mut(&mut self, meter: Meter) -> &mut ForwardCounter {
        match meter {
            Meter::Pv => &mut self.state.pv,
            Meter::L2 => &mut self.state.l2,
            Meter::L3 => &mut self.state.l3,
        }
    }

    const fn counter(&self, meter: Meter) -> &ForwardCounter {
        match meter {
            Meter::Pv => &self.state.pv,
            Meter::L2 => &self.state.l2,
            Meter::L3 => &self.state.l3,
        }
    }

    /// Integrate power for `meter` against the clock's current date
    pub fn integrate(&mut self, meter: Meter, power_w: f64, dt_s: f64) {
        let today = self.clock.today();
        self.integrate_on(meter, power_w, dt_s, today);
    }

    /// Integrate power for `meter` against an explicit date
    pub fn integrate_on(&mut self, meter: Meter, power_w: f64, dt_s: f64, today: NaiveDate) {
        if self.counter_mut(meter).integrate(power_w, dt_s, today) {
            self.dirty = true;
        }
    }

    pub const fn snapshot(&self, meter: Meter) -> CounterSnapshot {
        self.counter(meter).snapshot()
    }

    pub const fn address_mode(&self) -> Option<AddressType> {
        self.state.link_address_mode
    }

    /// Record the link's known-good address type
    pub fn set_address_mode(&mut self, mode: AddressType) {
        if self.state.link_address_mode != Some(mode) {
            self.state.link_address_mode = Some(mode);
            self.dirty = true;
        }
    }

    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Save when dirty and the debounce window has passed, or unconditionally
    /// when `force` is set. Returns whether a write happened. On error the
    /// in-memory values stay authoritative and the store stays dirty.
    pub fn save_if_needed(&mut self, force: bool) -> Result<bool> {
        self.save_at(force, Instant::now())
    }

    fn save_at(&mut self, force: bool, now: Instant) -> Result<bool> {
        if !force {
            if !self.dirty {
                return Ok(false);
            }
            if let Some(last) = self.last_save
                && now.saturating_duration_since(last) < self.debounce
            {
                return Ok(false);
            }
        }
        self.persistence.save(&self.state)?;
        self.dirty = false;
        self.last_save = Some(now);
        Ok(true)
    }

    /// Final flush; logs instead of failing
    pub fn flush(&mut self) {
        match self.save_if_needed(true) {
            Ok(_) => {
                let pv = self.snapshot(Meter::Pv);
                self.logger.info(&format!(
                    "Counters flushed to {} (pv lifetime={:.3} kWh, day={:.3} kWh)",
                    self.persistence.path().display(),
                    pv.lifetime_kwh,
                    pv.day_kwh
                ));
            }
            Err(e) => self
                .logger
                .error(&format!("Final counter flush failed: {}", e)),
        }
    }
}

/// In-memory energy flow accumulators (kWh) for the inverter service
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyPaths {
    pub solar_to_battery: f64,
    pub solar_to_inverter: f64,
    pub inverter_to_ac_out: f64,
    pub battery_to_inverter: f64,
}

impl EnergyPaths {
    /// Accumulate one tick of flows
    pub fn accumulate(&mut self, pv_to_ac: f64, battery_remainder: f64, dc_power: f64, dt_s: f64) {
        self.solar_to_inverter += kwh(pv_to_ac.max(0.0), dt_s);
        self.inverter_to_ac_out += kwh(battery_remainder.max(0.0), dt_s);
        if dc_power > 0.0 {
            self.solar_to_battery += kwh(dc_power, dt_s);
        } else if dc_power < 0.0 {
            self.battery_to_inverter += kwh(-dc_power, dt_s);
        }
    }
}
