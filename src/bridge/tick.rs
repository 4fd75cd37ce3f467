use std::time::Duration;
use tokio::time::Instant;

use super::{Bridge, Freshness, TickReport};
use crate::counters::Meter;
use crate::error::Result;
use crate::generator::GeneratorOutput;
use crate::publish::Frame;
use crate::regime::{classify, inverter_state, state_label};
use crate::sources::ExternalSnapshot;

/// Generator voltage when the inverter reports none
const FALLBACK_AC_VOLTAGE: f64 = 230.0;

/// Device values used by one tick
#[derive(Debug, Clone, Copy, Default)]
struct DeviceValues {
    l1_power: f64,
    ac_voltage: f64,
    ac_frequency: f64,
    dc_voltage: f64,
    dc_current: f64,
    pv_power: f64,
}

impl Bridge {
    /// Run one tick of the pipeline
    pub async fn tick(&mut self) -> Result<TickReport> {
        let now = Instant::now();
        let dt_s = self.last_tick.map_or_else(
            || self.config.poll_interval_ms as f64 / 1000.0,
            |t| now.saturating_duration_since(t).as_secs_f64(),
        );
        self.last_tick = Some(now);

        // telemetry
        let (freshness, dev) = self.select_telemetry(now);

        // battery
        let external = self.select_external(now);
        let battery = external.battery_or_device(dev.dc_voltage, dev.dc_current);

        // reconcile
        let powers = self.reconciler.reconcile(dev.l1_power, battery.power, dt_s);
        let [l2, l3] = external.meters;
        let total_ac = powers.battery_remainder_l1 + l2.power + l3.power + powers.pv_to_ac_l1;
        let ve_state = inverter_state(powers.pv_to_ac_l1, battery.power, total_ac);

        // classify
        let gen_cfg = self.config.generator.clone();
        let passthrough = external.passthrough(&gen_cfg.passthrough, ve_state);
        let gen_source_power = if gen_cfg.enabled {
            self.gen_smooth
                .update(external.generator_power(&gen_cfg.source))
        } else {
            0.0
        };
        let regime = classify(
            self.pv_smooth.update(powers.pv_to_ac_l1),
            self.l1_smooth.update(dev.l1_power),
            battery.power,
            passthrough,
            gen_source_power,
            self.config.reconcile.regime_eps_w,
        );
        if self.last_regime != Some(regime) {
            if let Some(prev) = self.last_regime {
                self.logger
                    .info(&format!("Regime {} -> {}", prev, regime));
            }
            self.last_regime = Some(regime);
        }

        // counters
        self.counters.integrate(Meter::Pv, powers.pv_to_ac_l1, dt_s);
        self.counters.integrate(Meter::L2, l2.power, dt_s);
        self.counters.integrate(Meter::L3, l3.power, dt_s);
        self.energy.accumulate(
            powers.pv_to_ac_l1,
            powers.battery_remainder_l1,
            battery.power,
            dt_s,
        );
        self.persist_counters();

        // generator
        let generator = if gen_cfg.enabled {
            let voltage = if dev.ac_voltage > 0.0 {
                dev.ac_voltage
            } else {
                FALLBACK_AC_VOLTAGE
            };
            self.generator.update(passthrough, gen_source_power, voltage)
        } else {
            GeneratorOutput::STOPPED
        };

        let frame = Frame {
            connected: freshness != Freshness::Stale,
            ac_voltage: dev.ac_voltage,
            ac_frequency: dev.ac_frequency,
            battery_remainder_l1: powers.battery_remainder_l1,
            pv_to_ac_l1: powers.pv_to_ac_l1,
            l2,
            l3,
            battery,
            energy: self.energy,
            inverter_state: ve_state,
            pv_counter: self.counters.snapshot(Meter::Pv),
            l2_counter: self.counters.snapshot(Meter::L2),
            l3_counter: self.counters.snapshot(Meter::L3),
            generator,
        };
        let report = TickReport {
            freshness,
            dt_s,
            battery,
            powers,
            regime,
            passthrough,
            frame,
        };
        self.log_tick(&report, dev, now);

        // publish
        self.publisher.publish(&frame).await;
        Ok(report)
    }

    /// This tick's view of the other bus services: the newest sweep while it
    /// is younger than the stall threshold, nothing otherwise.
    fn select_external(&mut self, now: Instant) -> ExternalSnapshot {
        let Some(rx) = &mut self.external else {
            return ExternalSnapshot::empty(now);
        };
        let latest = *rx.borrow_and_update();
        let stall_after = Duration::from_secs_f64(self.config.stall_after_s);

        match latest {
            Some(snap) if now.saturating_duration_since(snap.read_at) <= stall_after => {
                if self.sources_stale {
                    self.sources_stale = false;
                    self.logger.info("External sources recovered");
                }
                snap
            }
            _ => {
                let waited = now.saturating_duration_since(self.started_at);
                if !self.sources_stale && waited > stall_after {
                    self.sources_stale = true;
                    self.logger.warn(&format!(
                        "External sources silent > {:.0}s; using device values",
                        self.config.stall_after_s
                    ));
                }
                ExternalSnapshot::empty(now)
            }
        }
    }

    /// Pick this tick's telemetry: the newest snapshot while it is younger
    /// than the stall threshold, zeros otherwise.
    fn select_telemetry(&mut self, now: Instant) -> (Freshness, DeviceValues) {
        let stall_after = Duration::from_secs_f64(self.config.stall_after_s);
        let latest = self.telemetry.borrow_and_update().clone();

        if let Some(snap) = latest
            && now.saturating_duration_since(snap.captured_at) <= stall_after
        {
            if self.stalled {
                self.stalled = false;
                self.logger.info("Reader recovered");
            }
            let freshness = if self.last_capture == Some(snap.captured_at) {
                Freshness::LastGood
            } else {
                Freshness::Fresh
            };
            self.last_capture = Some(snap.captured_at);
            let values = DeviceValues {
                l1_power: snap.ac_active_power,
                ac_voltage: snap.ac_voltage,
                ac_frequency: snap.ac_frequency,
                dc_voltage: snap.dc_voltage,
                dc_current: snap.dc_current,
                pv_power: snap.pv_power,
            };
            return (freshness, values);
        }

        let waited = now.saturating_duration_since(self.last_capture.unwrap_or(self.started_at));
        if !self.stalled && waited > stall_after {
            self.stalled = true;
            self.logger.warn(&format!(
                "Reader stalled > {:.0}s; publishing zeros",
                self.config.stall_after_s
            ));
        }
        (Freshness::Stale, DeviceValues::default())
    }

    fn persist_counters(&mut self) {
        if let Some(mode) = self.link.as_ref().and_then(|l| l.known_good()) {
            self.counters.set_address_mode(mode);
        }
        if let Err(e) = self.counters.save_if_needed(false) {
            self.logger
                .warn(&format!("Counter save failed, keeping values in memory: {}", e));
        }
    }

    fn log_tick(&mut self, r: &TickReport, dev: DeviceValues, now: Instant) {
        let f = &r.frame;
        self.logger.debug(&format!(
            "INV l1_out={:.0}W | batt={:+.0}W | state={}",
            f.battery_remainder_l1,
            r.battery.power,
            state_label(f.inverter_state)
        ));

        if self.config.balance_check {
            let residual = dev.l1_power - (f.pv_to_ac_l1 + f.battery_remainder_l1);
            if residual.abs() > self.config.reconcile.balance_tolerance_w {
                self.logger.warn(&format!(
                    "Balance L1 off by {:+.0}W (L1={:.0} pv_ac={:.0} batt_ac={:.0})",
                    residual, dev.l1_power, f.pv_to_ac_l1, f.battery_remainder_l1
                ));
            }
        }

        let period = self.config.summary_period_s;
        if period <= 0.0 {
            return;
        }
        let due = self
            .last_summary
            .is_none_or(|t| now.saturating_duration_since(t).as_secs_f64() >= period);
        if !due {
            return;
        }
        self.last_summary = Some(now);
        let soc = r
            .battery
            .state_of_charge
            .map_or_else(|| "--".to_string(), |s| format!("{:.0}%", s));
        self.logger.info(&format!(
            "SUM L1={:.0}W L2={:.0}W L3={:.0}W | PV_ac={:.0}W (dev {:.0}W) | GEN={:.0}W | BATT={:+.0}W (SOC={}) | {} {:?}",
            dev.l1_power,
            f.l2.power,
            f.l3.power,
            f.pv_to_ac_l1,
            dev.pv_power,
            f.generator.power_w,
            r.battery.power,
            soc,
            r.regime,
            r.freshness
        ));
    }
}
