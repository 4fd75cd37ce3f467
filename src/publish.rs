//! Published services and their path layout
//!
//! The bridge exports up to five services: the inverter (vebus), the solar
//! share of L1 (pvinverter), the generator channel (grid) and the two
//! auxiliary phase meters (acmeter). [`Publisher`] owns them and turns one
//! [`Frame`] per tick into one update batch per service.

use crate::config::{Config, ServicesConfig};
use crate::counters::{CounterSnapshot, EnergyPaths};
use crate::dbus::{UPDATE_INDEX_PATH, VeService, connect_bus};
use crate::error::Result;
use crate::generator::GeneratorOutput;
use crate::logging::{StructuredLogger, get_logger};
use crate::regime::VE_MODE_ON;
use crate::sources::{AcReading, BatteryReading};
use serde_json::{Value, json};

pub const PROCESS_NAME: &str = "outback-bridge";
pub const PROCESS_VERSION: &str = env!("APP_VERSION");

/// Product id used for devices without an assigned Victron id
const GENERIC_PRODUCT_ID: u32 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Inverter,
    PvInverter,
    Generator,
    L2Meter,
    L3Meter,
}

impl Role {
    pub const ALL: [Self; 5] = [
        Self::Inverter,
        Self::PvInverter,
        Self::Generator,
        Self::L2Meter,
        Self::L3Meter,
    ];

    pub fn service_name(self, adapter: &str) -> String {
        match self {
            Self::Inverter => format!("com.victronenergy.vebus.outback_{}", adapter),
            Self::PvInverter => format!("com.victronenergy.pvinverter.outback_{}", adapter),
            Self::Generator => "com.victronenergy.grid.outback_generator".to_string(),
            Self::L2Meter => "com.victronenergy.acmeter.outback_l2".to_string(),
            Self::L3Meter => "com.victronenergy.acmeter.outback_l3".to_string(),
        }
    }

    pub const fn product_name(self) -> &'static str {
        match self {
            Self::Inverter => "Outback SPC III",
            Self::PvInverter => "Outback PV (AC L1 share)",
            Self::Generator => "Generator",
            Self::L2Meter => "AC meter L2",
            Self::L3Meter => "AC meter L3",
        }
    }

    pub const fn device_instance(self, cfg: &ServicesConfig) -> u32 {
        match self {
            Self::Inverter => cfg.vebus_instance,
            Self::PvInverter => cfg.pvinverter_instance,
            Self::Generator => cfg.generator_instance,
            Self::L2Meter => cfg.l2_meter_instance,
            Self::L3Meter => cfg.l3_meter_instance,
        }
    }

    /// Whether the configuration exports this role at all
    pub const fn enabled(self, cfg: &Config) -> bool {
        match self {
            Self::Inverter | Self::PvInverter => true,
            Self::Generator => cfg.generator.enabled,
            Self::L2Meter | Self::L3Meter => cfg.services.publish_phase_meters,
        }
    }
}

fn p(path: &str, value: Value) -> (String, Value) {
    (path.to_string(), value)
}

fn ratio(power: f64, voltage: f64) -> f64 {
    if voltage > 0.0 { power / voltage } else { 0.0 }
}

/// Paths registered once at startup, before the first batch
pub fn static_paths(role: Role, cfg: &Config, connection_label: &str) -> Vec<(String, Value, bool)> {
    let s = &cfg.services;
    let mut out = vec![
        ("/Mgmt/ProcessName".to_string(), json!(PROCESS_NAME), false),
        ("/Mgmt/ProcessVersion".to_string(), json!(PROCESS_VERSION), false),
        ("/Mgmt/Connection".to_string(), json!(connection_label), false),
        ("/DeviceInstance".to_string(), json!(role.device_instance(s)), false),
        ("/ProductId".to_string(), json!(GENERIC_PRODUCT_ID), false),
        ("/ProductName".to_string(), json!(role.product_name()), false),
        ("/FirmwareVersion".to_string(), json!(PROCESS_VERSION), false),
        ("/Connected".to_string(), json!(0), false),
        (UPDATE_INDEX_PATH.to_string(), json!(0), false),
    ];
    let mut add = |path: &str, value: Value| out.push((path.to_string(), value, false));
    match role {
        Role::Inverter => {
            add("/Ac/NumberOfPhases", json!(3));
            for (ph, limit) in [("L1", s.l1_limit_w), ("L2", s.l2_limit_w), ("L3", s.l3_limit_w)] {
                add(&format!("/Ac/Out/{}/PowerLimit", ph), json!(limit));
            }
            out.push(("/Mode".to_string(), json!(VE_MODE_ON), true));
        }
        Role::PvInverter => {
            add("/Ac/L1/PowerLimit", json!(s.l1_limit_w));
            add("/Position", json!(1));
        }
        Role::Generator => {
            add("/Ac/NumberOfPhases", json!(1));
            add("/Ac/L1/PowerLimit", json!(cfg.generator.power_limit_w));
        }
        Role::L2Meter => {
            add("/Ac/L1/PowerLimit", json!(s.l2_limit_w));
        }
        Role::L3Meter => {
            add("/Ac/L1/PowerLimit", json!(s.l3_limit_w));
        }
    }
    out
}

/// Everything published for one tick
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// Telemetry is fresh or last-good rather than zeroed
    pub connected: bool,
    pub ac_voltage: f64,
    pub ac_frequency: f64,
    /// Battery share of L1 after smoothing
    pub battery_remainder_l1: f64,
    pub pv_to_ac_l1: f64,
    pub l2: AcReading,
    pub l3: AcReading,
    pub battery: BatteryReading,
    pub energy: EnergyPaths,
    pub inverter_state: u8,
    pub pv_counter: CounterSnapshot,
    pub l2_counter: CounterSnapshot,
    pub l3_counter: CounterSnapshot,
    pub generator: GeneratorOutput,
}

fn inverter_updates(f: &Frame) -> Vec<(String, Value)> {
    let mut out = vec![p("/Connected", json!(i32::from(f.connected)))];
    let phases = [
        ("L1", f.battery_remainder_l1, f.ac_voltage),
        ("L2", f.l2.power, f.l2.voltage),
        ("L3", f.l3.power, f.l3.voltage),
    ];
    for (ph, power, voltage) in phases {
        out.push(p(&format!("/Ac/Out/{}/P", ph), json!(power)));
        out.push(p(&format!("/Ac/Out/{}/V", ph), json!(voltage)));
        out.push(p(&format!("/Ac/Out/{}/F", ph), json!(f.ac_frequency)));
    }
    out.push(p("/Ac/Out/L1/I", json!(ratio(f.battery_remainder_l1, f.ac_voltage))));
    out.push(p("/Ac/Out/L2/I", json!(f.l2.current)));
    out.push(p("/Ac/Out/L3/I", json!(f.l3.current)));

    out.push(p("/Dc/0/Voltage", json!(f.battery.voltage)));
    out.push(p("/Dc/0/Current", json!(f.battery.current)));
    out.push(p("/Dc/0/Power", json!(f.battery.power)));
    if let Some(soc) = f.battery.state_of_charge {
        out.push(p("/Soc", json!(soc)));
    }

    out.push(p("/Energy/SolarToBattery", json!(f.energy.solar_to_battery)));
    out.push(p("/Energy/SolarToInverter", json!(f.energy.solar_to_inverter)));
    out.push(p("/Energy/InverterToAcOut", json!(f.energy.inverter_to_ac_out)));
    out.push(p("/Energy/BatteryToInverter", json!(f.energy.battery_to_inverter)));
    out.push(p("/State", json!(f.inverter_state)));
    out
}

fn pv_updates(f: &Frame) -> Vec<(String, Value)> {
    vec![
        p("/Connected", json!(i32::from(f.connected))),
        p("/Ac/Power", json!(f.pv_to_ac_l1)),
        p("/Ac/L1/Power", json!(f.pv_to_ac_l1)),
        p("/Ac/L2/Power", json!(0.0)),
        p("/Ac/L3/Power", json!(0.0)),
        p("/Ac/L1/Energy/Forward", json!(f.pv_counter.lifetime_kwh)),
        p("/Ac/Energy/Forward", json!(f.pv_counter.lifetime_kwh)),
    ]
}

fn generator_updates(f: &Frame) -> Vec<(String, Value)> {
    let g = &f.generator;
    vec![
        p("/Connected", json!(1)),
        p("/Status/Running", json!(i32::from(g.running))),
        p("/Ac/L1/Power", json!(g.power_w)),
        p("/Ac/L1/Voltage", json!(g.voltage)),
        p("/Ac/L1/Current", json!(g.current)),
    ]
}

fn meter_updates(reading: &AcReading, counter: &CounterSnapshot) -> Vec<(String, Value)> {
    vec![
        p("/Connected", json!(1)),
        p("/Ac/Power", json!(reading.power)),
        p("/Ac/L1/Power", json!(reading.power)),
        p("/Ac/L1/Voltage", json!(reading.voltage)),
        p("/Ac/L1/Current", json!(reading.current)),
        p("/Ac/Energy/Forward", json!(counter.lifetime_kwh)),
        p("/Ac/L1/Energy/Forward", json!(counter.lifetime_kwh)),
    ]
}

/// The update batch for `role`
pub fn updates_for(role: Role, f: &Frame) -> Vec<(String, Value)> {
    match role {
        Role::Inverter => inverter_updates(f),
        Role::PvInverter => pv_updates(f),
        Role::Generator => generator_updates(f),
        Role::L2Meter => meter_updates(&f.l2, &f.l2_counter),
        Role::L3Meter => meter_updates(&f.l3, &f.l3_counter),
    }
}

/// Owns every exported service
pub struct Publisher {
    services: Vec<(Role, VeService)>,
    logger: StructuredLogger,
}

impl Publisher {
    /// Build the enabled services and register their static paths
    pub async fn new(cfg: &Config, connection_label: &str) -> Result<Self> {
        let mut services = Vec::new();
        for role in Role::ALL.into_iter().filter(|r| r.enabled(cfg)) {
            let mut svc = VeService::new(&role.service_name(&cfg.device.adapter))?;
            for (path, value, writable) in static_paths(role, cfg, connection_label) {
                svc.add_path(&path, value, writable).await?;
            }
            services.push((role, svc));
        }
        Ok(Self {
            services,
            logger: get_logger("publish"),
        })
    }

    /// Put every service on its own bus connection.
    ///
    /// When the bus is unreachable and not required, the services stay
    /// in memory and the bridge keeps running.
    pub async fn start(&mut self, require_bus: bool) -> Result<()> {
        for (_, svc) in &mut self.services {
            match connect_bus(&self.logger).await {
                Ok(conn) => svc.start(conn).await?,
                Err(e) if !require_bus => {
                    self.logger.warn(&format!(
                        "{} stays offline: {}",
                        svc.service_name(),
                        e
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Push one frame to every service; returns how many services failed
    pub async fn publish(&mut self, frame: &Frame) -> usize {
        self.publish_batches(|role| updates_for(role, frame)).await
    }

    /// A failing service is logged and skipped; the others still update
    pub(crate) async fn publish_batches(
        &mut self,
        mut batch: impl FnMut(Role) -> Vec<(String, Value)>,
    ) -> usize {
        let mut failed = 0;
        for (role, svc) in &mut self.services {
            if let Err(e) = svc.publish(batch(*role)).await {
                failed += 1;
                self.logger
                    .warn(&format!("Publish to {} failed: {}", svc.service_name(), e));
            }
        }
        failed
    }

    pub fn service(&self, role: Role) -> Option<&VeService> {
        self.services
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, s)| s)
    }

    pub fn roles(&self) -> Vec<Role> {
        self.services.iter().map(|(r, _)| *r).collect()
    }

    pub async fn stop(&mut self) {
        for (_, svc) in &mut self.services {
            svc.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::BatterySource;

    fn frame() -> Frame {
        let counter = CounterSnapshot {
            lifetime_kwh: 1.5,
            day_kwh: 0.5,
            day_date: None,
        };
        Frame {
            connected: true,
            ac_voltage: 230.0,
            ac_frequency: 50.0,
            battery_remainder_l1: 115.0,
            pv_to_ac_l1: 385.0,
            l2: AcReading {
                power: 200.0,
                voltage: 231.0,
                current: 0.9,
            },
            l3: AcReading::default(),
            battery: BatteryReading {
                voltage: 26.8,
                current: -4.3,
                power: -115.0,
                state_of_charge: None,
                source: BatterySource::DeviceDerived,
            },
            energy: EnergyPaths::default(),
            inverter_state: 9,
            pv_counter: counter,
            l2_counter: counter,
            l3_counter: counter,
            generator: GeneratorOutput::STOPPED,
        }
    }

    fn lookup(updates: &[(String, Value)], path: &str) -> Option<Value> {
        updates.iter().find(|(k, _)| k == path).map(|(_, v)| v.clone())
    }

    #[test]
    fn service_names_follow_adapter() {
        assert_eq!(
            Role::Inverter.service_name("hci0"),
            "com.victronenergy.vebus.outback_hci0"
        );
        assert_eq!(
            Role::PvInverter.service_name("hci1"),
            "com.victronenergy.pvinverter.outback_hci1"
        );
    }

    #[test]
    fn inverter_batch_carries_remainder_not_l1() {
        let u = updates_for(Role::Inverter, &frame());
        assert_eq!(lookup(&u, "/Ac/Out/L1/P"), Some(json!(115.0)));
        assert_eq!(lookup(&u, "/Ac/Out/L2/P"), Some(json!(200.0)));
        assert_eq!(lookup(&u, "/State"), Some(json!(9)));
        // no battery monitor: SoC unknown and not published
        assert_eq!(lookup(&u, "/Soc"), None);
    }

    #[test]
    fn pv_batch_uses_forward_counter() {
        let u = updates_for(Role::PvInverter, &frame());
        assert_eq!(lookup(&u, "/Ac/Power"), Some(json!(385.0)));
        assert_eq!(lookup(&u, "/Ac/Energy/Forward"), Some(json!(1.5)));
    }

    #[tokio::test]
    async fn dry_run_publisher_keeps_values() {
        let mut cfg = Config::default();
        cfg.services.dry_run = true;
        let mut publisher = Publisher::new(&cfg, "Bluetooth hci0").await.unwrap();
        assert_eq!(
            publisher.roles(),
            vec![Role::Inverter, Role::PvInverter, Role::L2Meter, Role::L3Meter]
        );
        assert_eq!(publisher.publish(&frame()).await, 0);
        let pv = publisher.service(Role::PvInverter).unwrap();
        assert_eq!(pv.f64_value("/Ac/L1/Power"), Some(385.0));
        assert_eq!(pv.update_index(), 1);
        assert_eq!(pv.value("/Position"), Some(json!(1)));
    }

    #[tokio::test]
    async fn one_failing_service_does_not_block_the_rest() {
        let mut cfg = Config::default();
        cfg.services.dry_run = true;
        let mut publisher = Publisher::new(&cfg, "Bluetooth hci0").await.unwrap();
        let f = frame();

        let failed = publisher
            .publish_batches(|role| {
                let mut batch = updates_for(role, &f);
                if role == Role::Inverter {
                    batch.insert(0, ("/Ac/Out/L1/Bad-Path".to_string(), json!(1)));
                }
                batch
            })
            .await;
        assert_eq!(failed, 1);

        let vebus = publisher.service(Role::Inverter).unwrap();
        // the rest of the failing batch still landed
        assert_eq!(vebus.f64_value("/Ac/Out/L1/P"), Some(115.0));
        assert_eq!(vebus.update_index(), 1);
        assert_eq!(vebus.value("/Ac/Out/L1/Bad-Path"), None);
        for role in [Role::PvInverter, Role::L2Meter, Role::L3Meter] {
            assert_eq!(publisher.service(role).unwrap().update_index(), 1);
        }
        let l2 = publisher.service(Role::L2Meter).unwrap();
        assert_eq!(l2.f64_value("/Ac/Power"), Some(200.0));
    }
}
