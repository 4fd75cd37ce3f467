use super::{ExternalSnapshot, ExternalSources};
use crate::config::{GeneratorSource, PassthroughSource};
use crate::logging::get_logger;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Latest-sweep channel between the sources worker and the bridge
pub type SourcesReceiver = watch::Receiver<Option<ExternalSnapshot>>;

/// Sweep `sources` every `period` on its own task, publishing each result.
///
/// A sweep that takes longer than `period` is followed directly by the next
/// one. The task runs until `shutdown` flips to true or every receiver is
/// gone.
pub fn spawn_sources_worker(
    mut sources: ExternalSources,
    generator: GeneratorSource,
    passthrough: PassthroughSource,
    period: Duration,
    tx: watch::Sender<Option<ExternalSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let logger = get_logger("sources");
        logger.debug(&format!(
            "Sources worker started (every {} ms)",
            period.as_millis()
        ));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = tokio::time::Instant::now();
            let snapshot = tokio::select! {
                snapshot = sources.sweep(&generator, &passthrough) => snapshot,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            if tx.send(Some(snapshot)).is_err() {
                logger.debug("No sources receivers left");
                break;
            }

            let took = started.elapsed();
            if took > period {
                logger.debug(&format!("Sources sweep took {} ms", took.as_millis()));
            }
            tokio::select! {
                _ = tokio::time::sleep(period.saturating_sub(took)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        logger.debug("Sources worker stopped");
    })
}
