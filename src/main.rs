use anyhow::{Context, Result};
use clap::Parser;
use outback_bridge::bridge::{Bridge, dump_counters};
use outback_bridge::cli::Args;
use outback_bridge::config::Config;
use outback_bridge::counters::{DayClock, ForwardCounterStore};
use outback_bridge::logging::{get_logger, init_logging, set_rate_limit_ms};
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging).context("Failed to initialize logging")?;
    set_rate_limit_ms(config.logging.rate_limit_ms);
    let logger = get_logger("main");

    if args.dump_now {
        let store = ForwardCounterStore::open(
            &config.persistence.state_file,
            Duration::from_secs_f64(config.persistence.debounce_s),
            DayClock::from_timezone(config.timezone.as_deref()),
        );
        dump_counters(&store, &logger);
        return Ok(());
    }

    logger.info(&format!(
        "Outback bridge {} starting (device={}, adapter={})",
        env!("APP_VERSION"),
        config
            .simulation
            .scenario
            .as_deref()
            .map_or(config.device.mac.as_str(), |_| "simulator"),
        config.device.adapter
    ));

    let first_round = Duration::from_millis(
        config.link.connect_timeout_ms + 2 * config.link.read_timeout_ms,
    );
    let mut bridge = Bridge::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start bridge: {}", e))?;

    if args.once {
        if !bridge.wait_for_telemetry(first_round).await {
            logger.warn("No telemetry before the first tick");
        }
        let outcome = bridge.tick().await;
        bridge.dump_now();
        bridge.shutdown().await;
        let report = outcome.map_err(|e| anyhow::anyhow!("Tick failed: {}", e))?;
        logger.info(&format!(
            "Single tick: regime={} pv_ac={:.0}W batt_ac={:.0}W ({:?})",
            report.regime,
            report.powers.pv_to_ac_l1,
            report.powers.battery_remainder_l1,
            report.freshness
        ));
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    bridge
        .run(shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!("Bridge error: {}", e))?;
    logger.info("Outback bridge stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
