//! External measurements read from other services on the bus
//!
//! The battery monitor is the source of truth for DC values when one is
//! present; otherwise the inverter's own DC readings are used. Two auxiliary
//! AC-load meters supply the L2 and L3 phases.
//!
//! Bus reads run on their own worker task; the tick only looks at the most
//! recent [`ExternalSnapshot`], so a slow peer service cannot delay it.

use crate::config::{GeneratorSource, PassthroughSource};
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::regime::ve_state;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

mod worker;

pub use worker::{SourcesReceiver, spawn_sources_worker};

pub const BATTERY_PREFIX: &str = "com.victronenergy.battery.";
pub const ACLOAD_PREFIX: &str = "com.victronenergy.acload.";

/// How often service discovery is repeated while a source is missing
const RESCAN_PERIOD: Duration = Duration::from_secs(30);

/// Read access to values exported by other bus services
#[async_trait]
pub trait BusReader: Send + Sync {
    /// Names of services starting with `prefix`
    async fn list_services(&self, prefix: &str) -> Result<Vec<String>>;

    /// Numeric value of `path` on `service`
    async fn read_f64(&self, service: &str, path: &str) -> Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatterySource {
    ExternalMonitor,
    DeviceDerived,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatteryReading {
    pub voltage: f64,
    pub current: f64,
    /// Signed DC power; positive while charging
    pub power: f64,
    pub state_of_charge: Option<f64>,
    pub source: BatterySource,
}

impl BatteryReading {
    /// DC values as measured by the inverter itself.
    ///
    /// A missing or non-positive voltage means no current is flowing.
    pub fn device_derived(dc_voltage: f64, dc_current: f64) -> Self {
        let (voltage, current) = if dc_voltage.is_finite() && dc_voltage > 0.0 {
            let i = if dc_current.is_finite() { dc_current } else { 0.0 };
            (dc_voltage, i)
        } else {
            (0.0, 0.0)
        };
        Self {
            voltage,
            current,
            power: voltage * current,
            state_of_charge: None,
            source: BatterySource::DeviceDerived,
        }
    }
}

/// One auxiliary phase meter reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AcReading {
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
}

/// Discovers and reads the external services; driven by the sources worker
pub struct ExternalSources {
    bus: Option<Arc<dyn BusReader>>,
    battery_service: Option<String>,
    meter_services: Vec<String>,
    last_scan: Option<Instant>,
    logger: StructuredLogger,
}

impl ExternalSources {
    pub fn new(bus: Option<Arc<dyn BusReader>>) -> Self {
        Self {
            bus,
            battery_service: None,
            meter_services: Vec::new(),
            last_scan: None,
            logger: get_logger("sources"),
        }
    }

    pub fn battery_service(&self) -> Option<&str> {
        self.battery_service.as_deref()
    }

    pub fn meter_services(&self) -> &[String] {
        &self.meter_services
    }

    /// Rediscover services when nothing was found yet or the last scan is stale
    pub async fn refresh(&mut self) {
        let Some(bus) = self.bus.clone() else {
            return;
        };
        let complete = self.battery_service.is_some() && self.meter_services.len() >= 2;
        if complete || self.last_scan.is_some_and(|t| t.elapsed() < RESCAN_PERIOD) {
            return;
        }
        self.last_scan = Some(Instant::now());

        match bus.list_services(BATTERY_PREFIX).await {
            Ok(mut names) => {
                names.sort();
                let found = names.into_iter().next();
                if found != self.battery_service {
                    if let Some(name) = &found {
                        self.logger.info(&format!("Battery monitor: {}", name));
                    }
                    self.battery_service = found;
                }
            }
            Err(e) => self.logger.debug(&format!("Battery discovery failed: {}", e)),
        }

        match bus.list_services(ACLOAD_PREFIX).await {
            Ok(mut names) => {
                names.sort();
                names.truncate(2);
                if names != self.meter_services {
                    for (i, name) in names.iter().enumerate() {
                        self.logger.info(&format!("AC load L{}: {}", i + 2, name));
                    }
                    self.meter_services = names;
                }
            }
            Err(e) => self.logger.debug(&format!("AC load discovery failed: {}", e)),
        }
    }

    /// One pass over every external value, the reads running concurrently
    pub async fn sweep(
        &mut self,
        generator: &GeneratorSource,
        passthrough: &PassthroughSource,
    ) -> ExternalSnapshot {
        self.refresh().await;
        let (battery, meters, generator_power, passthrough) = tokio::join!(
            self.battery_monitor(),
            self.phase_meters(),
            self.remote_generator_power(generator),
            self.remote_passthrough(passthrough),
        );
        ExternalSnapshot {
            battery,
            meters,
            generator_power,
            passthrough,
            read_at: Instant::now(),
        }
    }

    /// The battery monitor's reading, if one is known and answers
    pub async fn battery_monitor(&self) -> Option<BatteryReading> {
        let (Some(bus), Some(service)) = (&self.bus, &self.battery_service) else {
            return None;
        };
        match read_battery_monitor(bus.as_ref(), service).await {
            Ok(reading) => Some(reading),
            Err(e) => {
                self.logger
                    .debug(&format!("Battery monitor read failed: {}", e));
                None
            }
        }
    }

    /// L2 and L3 meter readings; a missing meter reads as zero
    pub async fn phase_meters(&self) -> [AcReading; 2] {
        let Some(bus) = &self.bus else {
            return [AcReading::default(); 2];
        };
        let read = |index: usize| async move {
            let Some(service) = self.meter_services.get(index) else {
                return AcReading::default();
            };
            let (power, voltage, current) = tokio::join!(
                read_or_zero(bus.as_ref(), service, "/Ac/L1/Power"),
                read_or_zero(bus.as_ref(), service, "/Ac/L1/Voltage"),
                read_or_zero(bus.as_ref(), service, "/Ac/L1/Current"),
            );
            AcReading {
                power,
                voltage,
                current,
            }
        };
        let (l2, l3) = tokio::join!(read(0), read(1));
        [l2, l3]
    }

    /// Generator power from a remote source; a static source needs no bus
    pub async fn remote_generator_power(&self, source: &GeneratorSource) -> f64 {
        match (source, &self.bus) {
            (GeneratorSource::Static { power_w }, _) => *power_w,
            (GeneratorSource::Remote { service, path }, Some(bus)) => {
                read_or_zero(bus.as_ref(), service, path).await
            }
            (GeneratorSource::Remote { .. }, None) => 0.0,
        }
    }

    /// Remote passthrough flag; `None` when the flag is derived locally
    pub async fn remote_passthrough(&self, source: &PassthroughSource) -> Option<bool> {
        match source {
            PassthroughSource::Derived => None,
            PassthroughSource::Remote { service, path } => Some(match &self.bus {
                Some(bus) => read_or_zero(bus.as_ref(), service, path).await > 0.5,
                None => false,
            }),
        }
    }
}

/// External values gathered by one sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExternalSnapshot {
    /// Battery monitor reading; `None` when no monitor answered
    pub battery: Option<BatteryReading>,
    pub meters: [AcReading; 2],
    /// Generator power as resolved from the configured source
    pub generator_power: f64,
    /// Remote passthrough flag; `None` when derived or not configured
    pub passthrough: Option<bool>,
    pub read_at: Instant,
}

impl ExternalSnapshot {
    /// Nothing known: device values only, meters at zero
    pub const fn empty(read_at: Instant) -> Self {
        Self {
            battery: None,
            meters: [AcReading {
                power: 0.0,
                voltage: 0.0,
                current: 0.0,
            }; 2],
            generator_power: 0.0,
            passthrough: None,
            read_at,
        }
    }

    /// Battery truth for this tick: the monitor when it answered, otherwise
    /// the inverter's own DC values
    pub fn battery_or_device(&self, dc_voltage: f64, dc_current: f64) -> BatteryReading {
        self.battery
            .unwrap_or_else(|| BatteryReading::device_derived(dc_voltage, dc_current))
    }

    /// Generator power for `source`; a static source never depends on a sweep
    pub fn generator_power(&self, source: &GeneratorSource) -> f64 {
        match source {
            GeneratorSource::Static { power_w } => *power_w,
            GeneratorSource::Remote { .. } => self.generator_power,
        }
    }

    /// Passthrough flag: derived from the inverter state or the swept value
    pub fn passthrough(&self, source: &PassthroughSource, inverter_state: u8) -> bool {
        match source {
            PassthroughSource::Derived => inverter_state == ve_state::PASSTHRU,
            PassthroughSource::Remote { .. } => self.passthrough.unwrap_or(false),
        }
    }
}

async fn read_or_zero(bus: &dyn BusReader, service: &str, path: &str) -> f64 {
    bus.read_f64(service, path)
        .await
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

async fn read_battery_monitor(bus: &dyn BusReader, service: &str) -> Result<BatteryReading> {
    let voltage = bus.read_f64(service, "/Dc/0/Voltage").await?;
    let current = bus.read_f64(service, "/Dc/0/Current").await?;
    let power = match bus.read_f64(service, "/Dc/0/Power").await {
        Ok(p) if p.is_finite() => p,
        _ => voltage * current,
    };
    let state_of_charge = bus
        .read_f64(service, "/Soc")
        .await
        .ok()
        .filter(|s| s.is_finite())
        .map(|s| s.clamp(0.0, 100.0));
    Ok(BatteryReading {
        voltage,
        current,
        power,
        state_of_charge,
        source: BatterySource::ExternalMonitor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use std::collections::HashMap;

    struct FakeBus {
        values: HashMap<(String, String), f64>,
    }

    impl FakeBus {
        fn new(entries: &[(&str, &str, f64)]) -> Self {
            Self {
                values: entries
                    .iter()
                    .map(|(s, p, v)| ((s.to_string(), p.to_string()), *v))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl BusReader for FakeBus {
        async fn list_services(&self, prefix: &str) -> Result<Vec<String>> {
            let mut names: Vec<String> = self
                .values
                .keys()
                .map(|(s, _)| s.clone())
                .filter(|s| s.starts_with(prefix))
                .collect();
            names.sort();
            names.dedup();
            Ok(names)
        }

        async fn read_f64(&self, service: &str, path: &str) -> Result<f64> {
            self.values
                .get(&(service.to_string(), path.to_string()))
                .copied()
                .ok_or_else(|| BridgeError::dbus(format!("{}{} missing", service, path)))
        }
    }

    #[test]
    fn device_derived_zero_voltage_means_no_current() {
        let r = BatteryReading::device_derived(0.0, -12.0);
        assert_eq!(r.current, 0.0);
        assert_eq!(r.power, 0.0);
        let r = BatteryReading::device_derived(26.0, -10.0);
        assert!((r.power + 260.0).abs() < 1e-9);
        assert_eq!(r.source, BatterySource::DeviceDerived);
    }

    #[tokio::test]
    async fn external_monitor_wins_when_present() {
        let bus = FakeBus::new(&[
            ("com.victronenergy.battery.ttyS1", "/Dc/0/Voltage", 52.0),
            ("com.victronenergy.battery.ttyS1", "/Dc/0/Current", -5.0),
            ("com.victronenergy.battery.ttyS1", "/Soc", 81.0),
            ("com.victronenergy.acload.b", "/Ac/L1/Power", 300.0),
            ("com.victronenergy.acload.a", "/Ac/L1/Power", 200.0),
        ]);
        let mut sources = ExternalSources::new(Some(Arc::new(bus)));
        sources.refresh().await;

        let b = sources.battery_monitor().await.unwrap();
        assert_eq!(b.source, BatterySource::ExternalMonitor);
        // power path absent: derived from V*I
        assert!((b.power + 260.0).abs() < 1e-9);
        assert_eq!(b.state_of_charge, Some(81.0));

        let [l2, l3] = sources.phase_meters().await;
        assert_eq!(l2.power, 200.0);
        assert_eq!(l3.power, 300.0);
        assert_eq!(l3.voltage, 0.0);
    }

    #[tokio::test]
    async fn no_bus_falls_back_to_device() {
        let mut sources = ExternalSources::new(None);
        assert!(sources.battery_monitor().await.is_none());

        let snap = sources
            .sweep(
                &GeneratorSource::Static { power_w: 900.0 },
                &PassthroughSource::Derived,
            )
            .await;
        let b = snap.battery_or_device(26.5, 4.0);
        assert_eq!(b.source, BatterySource::DeviceDerived);
        assert!(snap.passthrough(&PassthroughSource::Derived, ve_state::PASSTHRU));
        assert!(!snap.passthrough(&PassthroughSource::Derived, ve_state::INVERTING));
        assert_eq!(
            snap.generator_power(&GeneratorSource::Static { power_w: 900.0 }),
            900.0
        );
    }

    #[tokio::test]
    async fn sweep_collects_every_remote_value() {
        let bus = FakeBus::new(&[
            ("com.victronenergy.battery.socket", "/Dc/0/Voltage", 26.4),
            ("com.victronenergy.battery.socket", "/Dc/0/Current", 10.0),
            ("com.victronenergy.battery.socket", "/Dc/0/Power", 270.0),
            ("com.victronenergy.acload.l2", "/Ac/L1/Power", 410.0),
            ("com.victronenergy.acload.l2", "/Ac/L1/Voltage", 231.0),
            ("com.victronenergy.genset.g", "/Ac/Power", 1250.0),
            ("com.victronenergy.genset.g", "/Passthrough", 1.0),
        ]);
        let generator = GeneratorSource::Remote {
            service: "com.victronenergy.genset.g".to_string(),
            path: "/Ac/Power".to_string(),
        };
        let passthrough = PassthroughSource::Remote {
            service: "com.victronenergy.genset.g".to_string(),
            path: "/Passthrough".to_string(),
        };
        let mut sources = ExternalSources::new(Some(Arc::new(bus)));
        let snap = sources.sweep(&generator, &passthrough).await;

        assert_eq!(sources.battery_service(), Some("com.victronenergy.battery.socket"));
        let b = snap.battery_or_device(0.0, 0.0);
        assert_eq!(b.source, BatterySource::ExternalMonitor);
        assert_eq!(b.power, 270.0);
        assert_eq!(snap.meters[0].power, 410.0);
        assert_eq!(snap.meters[0].voltage, 231.0);
        assert_eq!(snap.meters[1], AcReading::default());
        assert_eq!(snap.generator_power(&generator), 1250.0);
        // a remote flag ignores the inverter state
        assert!(snap.passthrough(&passthrough, ve_state::INVERTING));
    }

    #[test]
    fn empty_snapshot_reads_as_device_only() {
        let snap = ExternalSnapshot::empty(Instant::now());
        let remote = PassthroughSource::Remote {
            service: "com.victronenergy.genset.g".to_string(),
            path: "/Passthrough".to_string(),
        };
        assert_eq!(
            snap.battery_or_device(26.0, -4.0).source,
            BatterySource::DeviceDerived
        );
        assert!(!snap.passthrough(&remote, ve_state::PASSTHRU));
        assert_eq!(snap.meters, [AcReading::default(); 2]);
    }
}
