use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};

use super::{Bridge, TelemetryReceiver, Worker};
use crate::config::Config;
use crate::counters::{DayClock, EnergyPaths, ForwardCounterStore};
use crate::dbus::{RemoteBus, connect_bus};
use crate::error::{BridgeError, Result};
use crate::generator::GeneratorController;
use crate::link::{BluezTransport, DeviceLink, GattTransport, spawn_link_worker};
use crate::logging::get_logger;
use crate::publish::Publisher;
use crate::reconcile::{Ema, EnergyReconciler};
use crate::sim::{Scenario, SimBattery, SimulatedBus, SimulatedTransport, Simulator};
use crate::sources::{BusReader, ExternalSources, spawn_sources_worker};

/// How long shutdown waits for each worker before aborting it
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

impl Bridge {
    /// Assemble every component from `config` and start the workers.
    ///
    /// A configured scenario selects the simulator for both the radio link
    /// and the auxiliary bus values; otherwise BlueZ is used and the bus is
    /// read unless running dry.
    pub async fn start(mut config: Config) -> Result<Self> {
        let logger = get_logger("bridge");

        let counters = ForwardCounterStore::open(
            &config.persistence.state_file,
            Duration::from_secs_f64(config.persistence.debounce_s),
            DayClock::from_timezone(config.timezone.as_deref()),
        );
        let address_type = counters.address_mode().unwrap_or(config.link.address_type);

        let (transport, bus): (Box<dyn GattTransport>, Option<Arc<dyn BusReader>>) =
            match config.simulation.scenario.clone() {
                Some(name) => {
                    let scenario = Scenario::by_name(&name).ok_or_else(|| {
                        BridgeError::config(format!("Unknown scenario '{}'", name))
                    })?;
                    scenario.configure(&mut config);
                    logger.info(&format!("Simulation scenario: {}", name));
                    let sim = Simulator::new(scenario, config.simulation.seed)
                        .with_battery(SimBattery::new(
                            config.simulation.battery_capacity_wh,
                            config.simulation.initial_soc,
                        ))
                        .into_shared();
                    let transport: Box<dyn GattTransport> =
                        Box::new(SimulatedTransport::new(Arc::clone(&sim)));
                    let bus: Arc<dyn BusReader> = Arc::new(SimulatedBus::new(sim));
                    (transport, Some(bus))
                }
                None => {
                    let bus: Option<Arc<dyn BusReader>> = if config.services.dry_run {
                        None
                    } else {
                        match connect_bus(&logger).await {
                            Ok(conn) => {
                                let remote: Arc<dyn BusReader> = Arc::new(RemoteBus::new(conn));
                                Some(remote)
                            }
                            Err(e) => {
                                logger.warn(&format!("External sources unavailable: {}", e));
                                None
                            }
                        }
                    };
                    let transport: Box<dyn GattTransport> = Box::new(BluezTransport::new(
                        &config.device.adapter,
                        &config.device.mac,
                    ));
                    (transport, bus)
                }
            };

        let link = Arc::new(DeviceLink::new(
            &config.link,
            transport,
            address_type,
            config.simulation.seed,
        ));

        let mut publisher = Publisher::new(&config, link.label()).await?;
        if config.services.dry_run {
            logger.info("Dry run: services stay in memory");
        } else {
            publisher.start(config.services.require_dbus).await?;
        }

        Ok(Self::with_link(config, link, bus, publisher, counters))
    }

    /// Build a bridge around `link` and start its worker
    pub fn with_link(
        config: Config,
        link: Arc<DeviceLink>,
        bus: Option<Arc<dyn BusReader>>,
        publisher: Publisher,
        counters: ForwardCounterStore,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        let (stop, stop_rx) = watch::channel(false);
        let handle = spawn_link_worker(Arc::clone(&link), tx, stop_rx);

        let mut bridge = Self::new(config, rx, Some(link), bus, publisher, counters);
        bridge.workers.push(Worker {
            name: "link",
            handle,
            stop,
        });
        bridge
    }

    /// Build a bridge from already assembled parts, without a link worker.
    ///
    /// With a bus, the sources worker is started here, so this must run
    /// inside a tokio runtime.
    pub fn new(
        config: Config,
        telemetry: TelemetryReceiver,
        link: Option<Arc<DeviceLink>>,
        bus: Option<Arc<dyn BusReader>>,
        publisher: Publisher,
        counters: ForwardCounterStore,
    ) -> Self {
        let alpha = config.reconcile.classify_ema_alpha;
        let mut workers = Vec::new();
        let external = bus.map(|bus| {
            let (tx, rx) = watch::channel(None);
            let (stop, stop_rx) = watch::channel(false);
            let handle = spawn_sources_worker(
                ExternalSources::new(Some(bus)),
                config.generator.source.clone(),
                config.generator.passthrough.clone(),
                Duration::from_millis(config.poll_interval_ms),
                tx,
                stop_rx,
            );
            workers.push(Worker {
                name: "sources",
                handle,
                stop,
            });
            rx
        });
        Self {
            reconciler: EnergyReconciler::new(&config.reconcile),
            generator: GeneratorController::new(&config.generator),
            pv_smooth: Ema::new(alpha),
            l1_smooth: Ema::new(alpha),
            gen_smooth: Ema::new(alpha),
            energy: EnergyPaths::default(),
            telemetry,
            link,
            workers,
            external,
            counters,
            publisher,
            config,
            started_at: Instant::now(),
            last_tick: None,
            last_capture: None,
            last_summary: None,
            last_regime: None,
            stalled: false,
            sources_stale: false,
            logger: get_logger("bridge"),
        }
    }

    /// Wait until the first device snapshot and, with a bus, the first
    /// sources sweep have arrived; false on timeout
    pub async fn wait_for_telemetry(&mut self, limit: Duration) -> bool {
        let telemetry = &mut self.telemetry;
        let external = self.external.as_mut();
        let ready = async move {
            let device = telemetry.wait_for(Option::is_some).await.is_ok();
            let swept = match external {
                Some(rx) => rx.wait_for(Option::is_some).await.is_ok(),
                None => true,
            };
            device && swept
        };
        matches!(timeout(limit, ready).await, Ok(true))
    }

    /// Tick until `shutdown` flips to true, then shut down cleanly
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.logger.info(&format!(
            "Bridge running: tick={}ms, link={}",
            self.config.poll_interval_ms,
            self.link.as_ref().map_or("none", |l| l.label())
        ));

        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    if let Err(e) = self.tick().await {
                        self.logger.error(&format!("Tick failed: {}", e));
                    }
                    let took = started.elapsed();
                    if took.as_millis() > u128::from(self.config.poll_interval_ms) {
                        self.logger.debug(&format!("Tick overran: {} ms", took.as_millis()));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.logger.info("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Flush counters, stop the workers and release the bus names
    pub async fn shutdown(&mut self) {
        if let Some(mode) = self.link.as_ref().and_then(|l| l.known_good()) {
            self.counters.set_address_mode(mode);
        }
        self.counters.flush();

        for worker in &self.workers {
            let _ = worker.stop.send(true);
        }
        for mut worker in self.workers.drain(..) {
            if timeout(WORKER_STOP_TIMEOUT, &mut worker.handle).await.is_err() {
                worker.handle.abort();
                self.logger.warn(&format!(
                    "{} worker did not stop in time; aborted",
                    worker.name
                ));
            }
        }

        self.publisher.stop().await;
        self.logger.info("Bridge shutdown complete");
    }
}
