use super::{DeviceLink, PollOutcome, RoundSnapshot};
use crate::logging::get_logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Floor for the worker's sleep so a zero schedule cannot spin
const MIN_NAP: Duration = Duration::from_millis(50);

/// Drive `link` on its own task, publishing every fresh snapshot to `tx`.
///
/// The task runs until `shutdown` flips to true or every receiver is gone,
/// then disconnects the link.
pub fn spawn_link_worker(
    link: Arc<DeviceLink>,
    tx: watch::Sender<Option<Arc<RoundSnapshot>>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let logger = get_logger("link");
        logger.info(&format!("Link worker started ({})", link.label()));

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let PollOutcome::Snapshot(snapshot) = link.poll().await
                && tx.send(Some(Arc::new(snapshot))).is_err()
            {
                logger.debug("No snapshot receivers left");
                break;
            }

            if link.reconnect_pending() {
                link.reconnect().await;
            }

            let nap = link.next_attempt_in().max(MIN_NAP);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        link.shutdown().await;
        logger.info("Link worker stopped");
    })
}
