//! Tick orchestration
//!
//! The bridge owns every stateful piece of the pipeline and runs one tick per
//! interval in a fixed order: telemetry, battery, reconcile, classify,
//! counters, generator, publish. Radio I/O happens on the link worker and bus
//! reads on the sources worker; a tick only reads the latest snapshot of each
//! from a `watch` channel.

use crate::config::Config;
use crate::counters::{EnergyPaths, ForwardCounterStore, Meter};
use crate::generator::GeneratorController;
use crate::link::{DeviceLink, RoundSnapshot};
use crate::logging::StructuredLogger;
use crate::publish::{Frame, Publisher};
use crate::reconcile::{Ema, EnergyReconciler, ReconciledPowers};
use crate::regime::OperatingRegime;
use crate::sources::{BatteryReading, SourcesReceiver};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

mod runtime;
mod tick;

/// Latest-snapshot channel between the link worker and the bridge
pub type TelemetryReceiver = watch::Receiver<Option<Arc<RoundSnapshot>>>;

/// Where this tick's telemetry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Freshness {
    /// A snapshot not seen by an earlier tick
    Fresh,
    /// The previous snapshot, still younger than the stall threshold
    LastGood,
    /// No usable snapshot; every device value reads as zero
    Stale,
}

/// Outcome of one tick, mostly for tests and `--once`
#[derive(Debug, Clone, Copy)]
pub struct TickReport {
    pub freshness: Freshness,
    pub dt_s: f64,
    pub battery: BatteryReading,
    pub powers: ReconciledPowers,
    pub regime: OperatingRegime,
    pub passthrough: bool,
    pub frame: Frame,
}

/// A background task the bridge stops on shutdown
struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// The orchestrator
pub struct Bridge {
    config: Config,
    telemetry: TelemetryReceiver,
    link: Option<Arc<DeviceLink>>,
    workers: Vec<Worker>,
    external: Option<SourcesReceiver>,
    reconciler: EnergyReconciler,
    pv_smooth: Ema,
    l1_smooth: Ema,
    gen_smooth: Ema,
    counters: ForwardCounterStore,
    energy: EnergyPaths,
    generator: GeneratorController,
    publisher: Publisher,
    started_at: Instant,
    last_tick: Option<Instant>,
    last_capture: Option<Instant>,
    last_summary: Option<Instant>,
    last_regime: Option<OperatingRegime>,
    stalled: bool,
    sources_stale: bool,
    logger: StructuredLogger,
}

impl Bridge {
    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn counters(&self) -> &ForwardCounterStore {
        &self.counters
    }

    pub const fn energy(&self) -> &EnergyPaths {
        &self.energy
    }

    pub const fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn link(&self) -> Option<&DeviceLink> {
        self.link.as_deref()
    }

    /// Log counters and energy paths immediately
    pub fn dump_now(&self) {
        dump_counters(&self.counters, &self.logger);
        let e = &self.energy;
        self.logger.info(&format!(
            "Energy paths: solar->batt={:.3} solar->inv={:.3} inv->ac={:.3} batt->inv={:.3} kWh",
            e.solar_to_battery, e.solar_to_inverter, e.inverter_to_ac_out, e.battery_to_inverter
        ));
    }
}

/// Log the persisted forward counters
pub fn dump_counters(store: &ForwardCounterStore, logger: &StructuredLogger) {
    for (label, meter) in [("PV", Meter::Pv), ("L2", Meter::L2), ("L3", Meter::L3)] {
        let snap = store.snapshot(meter);
        let date = snap
            .day_date
            .map_or_else(|| "-".to_string(), |d| d.to_string());
        logger.info(&format!(
            "{} forward: total={:.3} kWh day={:.3} kWh ({})",
            label, snap.lifetime_kwh, snap.day_kwh, date
        ));
    }
    if let Some(mode) = store.address_mode() {
        logger.info(&format!("Known-good address type: {}", mode.as_str()));
    }
}
