//! Synthetic telemetry for bench runs without an inverter
//!
//! A [`Scenario`] fixes the nominal powers of one operating situation. The
//! [`Simulator`] adds seeded jitter, balances the battery flow so the numbers
//! stay physically consistent, and encodes the result into raw blocks so the
//! real decode path runs. The battery flow also drives a state-of-charge
//! model. [`SimulatedBus`] serves the battery monitor, the auxiliary meters
//! and the generator channel the same way a live bus would.

use crate::config::{Config, GeneratorSource, PassthroughSource};
use crate::error::{BridgeError, Result};
use crate::link::{
    Block, GattTransport, InverterBlock, PvBlock, encode_inverter_block, encode_pv_block,
};
use crate::sources::BusReader;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

pub const SIM_BATTERY_SERVICE: &str = "com.victronenergy.battery.outback_sim";
pub const SIM_L2_SERVICE: &str = "com.victronenergy.acload.outback_sim_l2";
pub const SIM_L3_SERVICE: &str = "com.victronenergy.acload.outback_sim_l3";
pub const SIM_GENERATOR_SERVICE: &str = "com.victronenergy.genset.outback_sim";
pub const SIM_GENERATOR_POWER_PATH: &str = "/Ac/Power";
pub const SIM_PASSTHROUGH_PATH: &str = "/Passthrough";

const AC_VOLTAGE: f64 = 230.0;
const AC_FREQUENCY: f64 = 50.0;
const PV_VOLTAGE: f64 = 120.0;
const RATED_POWER_W: f64 = 3000.0;

/// Share of charging power that ends up stored
const CHARGE_EFFICIENCY: f64 = 0.97;
/// Share of stored energy that reaches the DC bus while discharging
const DISCHARGE_EFFICIENCY: f64 = 0.95;
pub const DEFAULT_CAPACITY_WH: f64 = 5000.0;
pub const DEFAULT_INITIAL_SOC: f64 = 75.0;

/// What the battery does with surplus solar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryMode {
    /// All surplus solar charges the battery
    Charge,
    /// No solar reaches the battery
    Discharge,
    /// Solar covers what the battery would otherwise deliver
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scenario {
    pub name: &'static str,
    pub pv_w: f64,
    pub l1_w: f64,
    pub l2_w: f64,
    pub l3_w: f64,
    pub dc_voltage: f64,
    pub mode: BatteryMode,
    /// Generator power fed through the inverter, 0 when none
    pub generator_w: f64,
}

const fn scenario(
    name: &'static str,
    pv_w: f64,
    l1_w: f64,
    l2_w: f64,
    l3_w: f64,
    dc_voltage: f64,
    mode: BatteryMode,
) -> Scenario {
    Scenario {
        name,
        pv_w,
        l1_w,
        l2_w,
        l3_w,
        dc_voltage,
        mode,
        generator_w: 0.0,
    }
}

pub const SCENARIOS: [Scenario; 9] = [
    scenario("day_charge", 1800.0, 500.0, 200.0, 100.0, 26.8, BatteryMode::Charge),
    scenario("day_cover_l1", 700.0, 600.0, 400.0, 150.0, 26.7, BatteryMode::Discharge),
    scenario("balanced", 1000.0, 600.0, 300.0, 100.0, 26.8, BatteryMode::Balanced),
    scenario("evening_l23", 0.0, 80.0, 900.0, 700.0, 26.5, BatteryMode::Discharge),
    scenario("night_idle", 0.0, 10.0, 5.0, 5.0, 26.5, BatteryMode::Discharge),
    scenario("cloud_bursts", 1200.0, 800.0, 300.0, 100.0, 26.8, BatteryMode::Balanced),
    scenario("day_plus_batt", 1500.0, 300.0, 200.0, 100.0, 27.0, BatteryMode::Charge),
    scenario("day_surplus", 2200.0, 400.0, 100.0, 50.0, 27.2, BatteryMode::Charge),
    Scenario {
        generator_w: 1500.0,
        ..scenario("gen", 0.0, 50.0, 0.0, 0.0, 26.6, BatteryMode::Discharge)
    },
];

impl Scenario {
    pub fn by_name(name: &str) -> Option<Self> {
        SCENARIOS.iter().copied().find(|s| s.name == name)
    }

    pub fn names() -> Vec<&'static str> {
        SCENARIOS.iter().map(|s| s.name).collect()
    }

    /// Point the generator channel at the simulated bus when the scenario
    /// runs a generator
    pub fn configure(&self, cfg: &mut Config) {
        if self.generator_w <= 0.0 {
            return;
        }
        cfg.generator.enabled = true;
        cfg.generator.source = GeneratorSource::Remote {
            service: SIM_GENERATOR_SERVICE.to_string(),
            path: SIM_GENERATOR_POWER_PATH.to_string(),
        };
        cfg.generator.passthrough = PassthroughSource::Remote {
            service: SIM_GENERATOR_SERVICE.to_string(),
            path: SIM_PASSTHROUGH_PATH.to_string(),
        };
    }
}

/// Battery energy store behind the simulated DC bus
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimBattery {
    pub capacity_wh: f64,
    pub soc: f64,
}

impl SimBattery {
    pub const fn new(capacity_wh: f64, soc: f64) -> Self {
        Self { capacity_wh, soc }
    }

    /// Move `dc_power` watts (positive while charging) for `dt_s` seconds
    pub fn apply(&mut self, dc_power: f64, dt_s: f64) {
        if self.capacity_wh <= 0.0 || !dc_power.is_finite() || dt_s <= 0.0 {
            return;
        }
        let wh = dc_power * dt_s / 3600.0;
        let stored = if wh >= 0.0 {
            wh * CHARGE_EFFICIENCY
        } else {
            wh / DISCHARGE_EFFICIENCY
        };
        self.soc = (self.soc + stored / self.capacity_wh * 100.0).clamp(0.0, 100.0);
    }
}

impl Default for SimBattery {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_WH, DEFAULT_INITIAL_SOC)
    }
}

/// Signed battery power for the given flows; positive while charging
pub fn balance_dc_power(mode: BatteryMode, pv: f64, l1: f64, l2: f64, l3: f64) -> f64 {
    let pv_to_l1 = l1.min(pv);
    let battery_to_ac = (l1 - pv_to_l1).max(0.0) + l2 + l3;
    let pv_rest = (pv - pv_to_l1).max(0.0);
    let pv_to_battery = match mode {
        BatteryMode::Charge => pv_rest,
        BatteryMode::Discharge => 0.0,
        BatteryMode::Balanced => battery_to_ac.min(pv_rest),
    };
    pv_to_battery - battery_to_ac
}

/// One generated measurement set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimSample {
    pub pv_w: f64,
    pub l1_w: f64,
    pub l2_w: f64,
    pub l3_w: f64,
    pub dc_voltage: f64,
    pub dc_current: f64,
    pub dc_power: f64,
    pub generator_w: f64,
    /// Battery state of charge in percent
    pub soc: f64,
}

impl SimSample {
    pub fn inverter_block(&self) -> InverterBlock {
        InverterBlock {
            ac_voltage: AC_VOLTAGE,
            ac_frequency: AC_FREQUENCY,
            ac_active_power: self.l1_w,
            ac_apparent_power: self.l1_w * 1.05,
            load_percent: (self.l1_w / RATED_POWER_W * 100.0).min(100.0),
            dc_voltage: self.dc_voltage,
            dc_current: self.dc_current,
        }
    }

    pub fn pv_block(&self) -> PvBlock {
        PvBlock {
            pv_voltage: if self.pv_w > 0.0 { PV_VOLTAGE } else { 0.0 },
            pv_power: self.pv_w,
        }
    }
}

pub struct Simulator {
    scenario: Scenario,
    rng: StdRng,
    started: Instant,
    battery: SimBattery,
    last: Option<SimSample>,
    last_at: Option<Instant>,
}

impl Simulator {
    pub fn new(scenario: Scenario, seed: Option<u64>) -> Self {
        Self {
            scenario,
            rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
            started: Instant::now(),
            battery: SimBattery::default(),
            last: None,
            last_at: None,
        }
    }

    pub fn shared(scenario: Scenario, seed: Option<u64>) -> SharedSimulator {
        Self::new(scenario, seed).into_shared()
    }

    /// Replace the default battery
    #[must_use]
    pub fn with_battery(mut self, battery: SimBattery) -> Self {
        self.battery = battery;
        self
    }

    pub fn into_shared(self) -> SharedSimulator {
        Arc::new(Mutex::new(self))
    }

    pub const fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub const fn battery(&self) -> &SimBattery {
        &self.battery
    }

    /// Slow sinusoidal drift with a random phase, `pct` of the nominal value
    fn jitter(&mut self, value: f64, pct: f64) -> f64 {
        let t = self.started.elapsed().as_secs_f64();
        let phase: f64 = self.rng.r#gen();
        (value * (1.0 + pct * (t / 7.0 + phase).sin())).max(0.0)
    }

    /// Generate a fresh sample; the previous battery flow is charged against
    /// the state of charge for the time since the last sample.
    pub fn sample(&mut self) -> SimSample {
        let now = Instant::now();
        if let (Some(prev), Some(at)) = (self.last, self.last_at) {
            self.battery
                .apply(prev.dc_power, now.saturating_duration_since(at).as_secs_f64());
        }
        self.last_at = Some(now);

        let s = self.scenario;
        let pv_w = self.jitter(s.pv_w, 0.05);
        let l1_w = self.jitter(s.l1_w, 0.02);
        let l2_w = self.jitter(s.l2_w, 0.02);
        let l3_w = self.jitter(s.l3_w, 0.02);
        let dc_power = balance_dc_power(s.mode, pv_w, l1_w, l2_w, l3_w);
        let dc_current = if s.dc_voltage > 0.0 {
            dc_power / s.dc_voltage
        } else {
            0.0
        };
        let sample = SimSample {
            pv_w,
            l1_w,
            l2_w,
            l3_w,
            dc_voltage: s.dc_voltage,
            dc_current,
            dc_power,
            generator_w: s.generator_w,
            soc: self.battery.soc,
        };
        self.last = Some(sample);
        sample
    }

    /// The most recent sample, generating one if none exists yet
    pub fn last_or_sample(&mut self) -> SimSample {
        match self.last {
            Some(s) => s,
            None => self.sample(),
        }
    }
}

pub type SharedSimulator = Arc<Mutex<Simulator>>;

fn lock(sim: &SharedSimulator) -> MutexGuard<'_, Simulator> {
    sim.lock().unwrap_or_else(PoisonError::into_inner)
}

/// GATT backend that serves simulator samples
pub struct SimulatedTransport {
    sim: SharedSimulator,
    connected: bool,
}

impl SimulatedTransport {
    pub const fn new(sim: SharedSimulator) -> Self {
        Self {
            sim,
            connected: false,
        }
    }
}

#[async_trait]
impl GattTransport for SimulatedTransport {
    async fn connect(&mut self, _address_type: crate::config::AddressType) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    /// The inverter block starts a new sample; the PV block reuses it so both
    /// halves of a round describe the same instant.
    async fn read_block(&mut self, block: Block) -> Result<Vec<u8>> {
        if !self.connected {
            return Err(BridgeError::link_lost("simulator not connected"));
        }
        let mut sim = lock(&self.sim);
        Ok(match block {
            Block::Inverter => encode_inverter_block(&sim.sample().inverter_block()),
            Block::Pv => encode_pv_block(&sim.last_or_sample().pv_block()),
        })
    }

    fn describe(&self) -> String {
        "TEST".to_string()
    }
}

/// Bus reader serving the simulator's auxiliary values
pub struct SimulatedBus {
    sim: SharedSimulator,
}

impl SimulatedBus {
    pub const fn new(sim: SharedSimulator) -> Self {
        Self { sim }
    }
}

#[async_trait]
impl BusReader for SimulatedBus {
    async fn list_services(&self, prefix: &str) -> Result<Vec<String>> {
        let has_generator = lock(&self.sim).scenario().generator_w > 0.0;
        let mut names = vec![SIM_BATTERY_SERVICE, SIM_L2_SERVICE, SIM_L3_SERVICE];
        if has_generator {
            names.push(SIM_GENERATOR_SERVICE);
        }
        Ok(names
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }

    async fn read_f64(&self, service: &str, path: &str) -> Result<f64> {
        let s = lock(&self.sim).last_or_sample();
        let meter = match service {
            SIM_L2_SERVICE => Some(s.l2_w),
            SIM_L3_SERVICE => Some(s.l3_w),
            _ => None,
        };
        if let Some(power) = meter {
            return match path {
                "/Ac/L1/Power" => Ok(power),
                "/Ac/L1/Voltage" => Ok(AC_VOLTAGE),
                "/Ac/L1/Current" => Ok(power / AC_VOLTAGE),
                _ => Err(BridgeError::dbus(format!("{}{} not simulated", service, path))),
            };
        }
        match (service, path) {
            (SIM_BATTERY_SERVICE, "/Dc/0/Voltage") => Ok(s.dc_voltage),
            (SIM_BATTERY_SERVICE, "/Dc/0/Current") => Ok(s.dc_current),
            (SIM_BATTERY_SERVICE, "/Dc/0/Power") => Ok(s.dc_power),
            (SIM_BATTERY_SERVICE, "/Soc") => Ok(s.soc),
            (SIM_GENERATOR_SERVICE, SIM_GENERATOR_POWER_PATH) => Ok(s.generator_w),
            (SIM_GENERATOR_SERVICE, SIM_PASSTHROUGH_PATH) => {
                Ok(if s.generator_w > 0.0 { 1.0 } else { 0.0 })
            }
            _ => Err(BridgeError::dbus(format!("{}{} not simulated", service, path))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{decode_inverter_block, decode_pv_block};
    use crate::sources::{ACLOAD_PREFIX, BATTERY_PREFIX};
    use approx::assert_abs_diff_eq;
    use std::time::Duration;

    #[test]
    fn scenarios_are_unique_and_resolvable() {
        let names = Scenario::names();
        assert_eq!(names.len(), 9);
        for name in &names {
            assert_eq!(Scenario::by_name(name).map(|s| s.name), Some(*name));
        }
        assert!(Scenario::by_name("off").is_none());
        assert_eq!(Scenario::by_name("gen").map(|s| s.generator_w), Some(1500.0));
    }

    #[test]
    fn balance_per_mode() {
        // day_charge nominal: all surplus solar into the battery
        assert_abs_diff_eq!(
            balance_dc_power(BatteryMode::Charge, 1800.0, 500.0, 200.0, 100.0),
            1000.0
        );
        // evening: battery carries everything
        assert_abs_diff_eq!(
            balance_dc_power(BatteryMode::Discharge, 0.0, 80.0, 900.0, 700.0),
            -1680.0
        );
        // balanced: surplus covers L2+L3 exactly
        assert_abs_diff_eq!(
            balance_dc_power(BatteryMode::Balanced, 1000.0, 600.0, 300.0, 100.0),
            0.0
        );
    }

    #[tokio::test]
    async fn transport_round_decodes_to_sample() {
        let sim = Simulator::shared(Scenario::by_name("day_charge").unwrap(), Some(3));
        let mut t = SimulatedTransport::new(sim.clone());
        assert!(t.read_block(Block::Inverter).await.is_err());
        t.connect(crate::config::AddressType::Public).await.unwrap();

        let inv = decode_inverter_block(&t.read_block(Block::Inverter).await.unwrap()).unwrap();
        let pv = decode_pv_block(&t.read_block(Block::Pv).await.unwrap()).unwrap();
        let s = sim.lock().unwrap().last_or_sample();

        assert_abs_diff_eq!(inv.ac_active_power, s.l1_w.round());
        assert_abs_diff_eq!(pv.pv_power, s.pv_w.round());
        assert_abs_diff_eq!(inv.dc_voltage, 26.8, epsilon = 0.005);
        assert_abs_diff_eq!(inv.dc_current, s.dc_current.round());
        assert_abs_diff_eq!(pv.pv_voltage, 120.0);
    }

    #[tokio::test]
    async fn bus_serves_meters_and_generator() {
        let sim = Simulator::shared(Scenario::by_name("gen").unwrap(), Some(1));
        let bus = SimulatedBus::new(sim);
        let meters = bus.list_services(ACLOAD_PREFIX).await.unwrap();
        assert_eq!(meters, vec![SIM_L2_SERVICE, SIM_L3_SERVICE]);
        assert_eq!(
            bus.read_f64(SIM_GENERATOR_SERVICE, SIM_GENERATOR_POWER_PATH)
                .await
                .unwrap(),
            1500.0
        );
        assert_eq!(
            bus.read_f64(SIM_GENERATOR_SERVICE, SIM_PASSTHROUGH_PATH)
                .await
                .unwrap(),
            1.0
        );
        assert!(bus.read_f64(SIM_L2_SERVICE, "/Soc").await.is_err());
        assert_eq!(
            bus.list_services(BATTERY_PREFIX).await.unwrap(),
            vec![SIM_BATTERY_SERVICE]
        );
        assert_eq!(bus.read_f64(SIM_BATTERY_SERVICE, "/Soc").await.unwrap(), 75.0);
        assert_abs_diff_eq!(
            bus.read_f64(SIM_BATTERY_SERVICE, "/Dc/0/Voltage").await.unwrap(),
            26.6
        );
    }

    #[test]
    fn battery_losses_depend_on_direction() {
        let mut b = SimBattery::new(1000.0, 50.0);
        // 100 Wh in, 97 Wh stored
        b.apply(100.0, 3600.0);
        assert_abs_diff_eq!(b.soc, 59.7, epsilon = 1e-9);
        // 95 Wh out costs 100 Wh of charge
        b.apply(-95.0, 3600.0);
        assert_abs_diff_eq!(b.soc, 49.7, epsilon = 1e-9);

        b.apply(-10_000.0, 3600.0);
        assert_eq!(b.soc, 0.0);
        b.apply(50_000.0, 3600.0);
        assert_eq!(b.soc, 100.0);
    }

    async fn soc_after_ten_minutes(name: &str) -> f64 {
        let mut sim = Simulator::new(Scenario::by_name(name).unwrap(), Some(5))
            .with_battery(SimBattery::new(5000.0, 75.0));
        assert_eq!(sim.sample().soc, 75.0);
        tokio::time::advance(Duration::from_secs(600)).await;
        sim.sample().soc
    }

    #[tokio::test(start_paused = true)]
    async fn soc_follows_the_scenario_battery_flow() {
        // ~1000 W in for ten minutes: +3.2 % of 5 kWh
        let charged = soc_after_ten_minutes("day_charge").await;
        assert!(charged > 77.5 && charged < 78.8, "{}", charged);

        // ~1680 W out: -5.9 %
        let drained = soc_after_ten_minutes("evening_l23").await;
        assert!(drained > 68.5 && drained < 69.7, "{}", drained);
    }
}
