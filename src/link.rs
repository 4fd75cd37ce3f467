//! Radio link to the inverter's telemetry characteristics
//!
//! `DeviceLink` owns the connection lifecycle and the round schedule. Each
//! `poll()` either yields one complete `RoundSnapshot` or reports why no
//! round ran. All radio calls are bounded by timeouts, so a poll never
//! blocks longer than the connect timeout plus two read timeouts.

mod bluez;
mod codec;
mod schedule;
mod transport;
mod worker;

pub use bluez::{BluezTransport, device_object_path, resolve_characteristics};
pub use codec::{
    InverterBlock, PvBlock, RoundSnapshot, a03, a11, decode_inverter_block, decode_pv_block,
    encode_inverter_block, encode_pv_block, swap_decode, swap_encode,
};
pub use schedule::{BACKOFF_LADDER_S, MAX_JITTER, ScheduleState, Scheduler, backoff_delay};
pub use transport::{Block, GattTransport};
pub use worker::spawn_link_worker;

use crate::config::{AddressType, LinkConfig};
use crate::error::{BridgeError, FailureKind, Result};
use crate::logging::{StructuredLogger, get_logger};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, timeout};

/// Consecutive soft failures that force a reconnect
const SOFT_RECONNECT_AFTER: u32 = 2;

/// Consecutive failures before the address type is toggled
const TOGGLE_AFTER: u32 = 3;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

/// Why a poll produced no snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    /// Called before the next scheduled round; not a failure
    Throttled,
    /// Another round or reconnect is in flight
    Busy,
    /// The round ran and failed; backoff is scheduled
    Failed,
}

#[derive(Debug, Clone)]
pub enum PollOutcome {
    Snapshot(RoundSnapshot),
    Unavailable(Unavailable),
}

impl PollOutcome {
    pub fn snapshot(self) -> Option<RoundSnapshot> {
        match self {
            Self::Snapshot(s) => Some(s),
            Self::Unavailable(_) => None,
        }
    }
}

/// Point-in-time view of the link for logs and tests
#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub address_type: AddressType,
    pub known_good: Option<AddressType>,
    pub consecutive_failures: u32,
    pub ok_count: u64,
    pub fail_count: u64,
    pub avg_read_ms: f64,
    pub avg_skew_ms: f64,
    pub next_attempt_in: Duration,
    pub reconnect_pending: bool,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct LinkInner {
    scheduler: Scheduler,
    state: ConnectionState,
    address_type: AddressType,
    known_good: Option<AddressType>,
    toggled_this_streak: bool,
    soft_streak: u32,
    reconnect_pending: bool,
    last_error: Option<String>,
    last_stats_at: Option<Instant>,
}

pub struct DeviceLink {
    transport: tokio::sync::Mutex<Box<dyn GattTransport>>,
    inner: Mutex<LinkInner>,
    connect_timeout: Duration,
    read_timeout: Duration,
    adaptive_addressing: bool,
    stats_period: Duration,
    label: String,
    logger: StructuredLogger,
}

impl DeviceLink {
    /// `address_type` is the starting mode, usually the persisted known-good one
    pub fn new(
        cfg: &LinkConfig,
        transport: Box<dyn GattTransport>,
        address_type: AddressType,
        seed: Option<u64>,
    ) -> Self {
        let label = transport.describe();
        Self {
            transport: tokio::sync::Mutex::new(transport),
            inner: Mutex::new(LinkInner {
                scheduler: Scheduler::new(
                    Duration::from_secs_f64(cfg.min_interval_s),
                    Duration::from_secs_f64(cfg.backoff_max_s),
                    seed,
                ),
                state: ConnectionState::Disconnected,
                address_type,
                known_good: None,
                toggled_this_streak: false,
                soft_streak: 0,
                reconnect_pending: false,
                last_error: None,
                last_stats_at: None,
            }),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
            adaptive_addressing: cfg.adaptive_addressing,
            stats_period: Duration::from_secs_f64(cfg.stats_period_s),
            label,
            logger: get_logger("link"),
        }
    }

    fn inner(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connection label published as `/Mgmt/Connection`
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run one round if it is due and no other round is in flight
    pub async fn poll(&self) -> PollOutcome {
        let Ok(mut transport) = self.transport.try_lock() else {
            return PollOutcome::Unavailable(Unavailable::Busy);
        };

        let address_type = {
            let inner = self.inner();
            if !inner.scheduler.is_due(Instant::now()) {
                return PollOutcome::Unavailable(Unavailable::Throttled);
            }
            inner.address_type
        };

        let outcome = match self.run_round(&mut **transport, address_type).await {
            Ok((snapshot, read_ms, skew_ms)) => {
                self.on_success(address_type, read_ms, skew_ms);
                PollOutcome::Snapshot(snapshot)
            }
            Err(e) => {
                if self.on_failure(&e) {
                    Self::drop_connection(&mut **transport, &self.logger).await;
                }
                PollOutcome::Unavailable(Unavailable::Failed)
            }
        };
        self.maybe_log_stats();
        outcome
    }

    async fn run_round(
        &self,
        transport: &mut dyn GattTransport,
        address_type: AddressType,
    ) -> Result<(RoundSnapshot, f64, f64)> {
        if !transport.is_connected() {
            self.set_state(ConnectionState::Connecting);
            self.connect(transport, address_type).await?;
            self.set_state(ConnectionState::Connected);
        }

        let t0 = Instant::now();
        let raw_inverter = self.read(transport, Block::Inverter).await?;
        let t_mid = Instant::now();
        let raw_pv = self.read(transport, Block::Pv).await?;
        let t1 = Instant::now();

        let inverter = decode_inverter_block(&raw_inverter)?;
        let pv = decode_pv_block(&raw_pv)?;

        let read_ms = t1.duration_since(t0).as_secs_f64() * 1000.0;
        let skew_ms = t1.duration_since(t_mid).as_secs_f64() * 1000.0;
        Ok((RoundSnapshot::from_blocks(inverter, pv, t1), read_ms, skew_ms))
    }

    async fn connect(
        &self,
        transport: &mut dyn GattTransport,
        address_type: AddressType,
    ) -> Result<()> {
        match timeout(self.connect_timeout, transport.connect(address_type)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ BridgeError::LinkLost { .. })) => Err(e),
            Ok(Err(e)) => Err(BridgeError::link_lost(format!("connect failed: {}", e))),
            Err(_) => Err(BridgeError::link_lost(format!(
                "connect timed out after {} ms",
                self.connect_timeout.as_millis()
            ))),
        }
    }

    async fn read(&self, transport: &mut dyn GattTransport, block: Block) -> Result<Vec<u8>> {
        match timeout(self.read_timeout, transport.read_block(block)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::timeout(format!(
                "read {} timed out after {} ms",
                block,
                self.read_timeout.as_millis()
            ))),
        }
    }

    async fn drop_connection(transport: &mut dyn GattTransport, logger: &StructuredLogger) {
        match timeout(DISCONNECT_TIMEOUT, transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => logger.debug(&format!("Disconnect failed: {}", e)),
            Err(_) => logger.debug("Disconnect timed out"),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner().state = state;
    }

    fn on_success(&self, address_type: AddressType, read_ms: f64, skew_ms: f64) {
        let mut inner = self.inner();
        let recovered_after = inner.scheduler.state().consecutive_failures;
        inner
            .scheduler
            .record_success(Instant::now(), read_ms, skew_ms);
        inner.state = ConnectionState::Connected;
        inner.soft_streak = 0;
        inner.toggled_this_streak = false;
        inner.last_error = None;
        inner.known_good = Some(address_type);
        drop(inner);

        if recovered_after > 0 {
            self.logger.info(&format!(
                "Link restored after {} failed round(s) ({})",
                recovered_after,
                address_type.as_str()
            ));
        }
        self.logger
            .trace(&format!("Round ok: read={:.0} ms skew={:.0} ms", read_ms, skew_ms));
    }

    /// Book a failed round. Returns true when the connection must be dropped.
    fn on_failure(&self, err: &BridgeError) -> bool {
        let kind = err.failure_kind();
        let mut inner = self.inner();
        let delay = inner.scheduler.record_failure(Instant::now());
        let failures = inner.scheduler.state().consecutive_failures;
        inner.state = ConnectionState::Backoff;
        inner.last_error = Some(err.to_string());

        let mut drop_link = match kind {
            FailureKind::Hard => {
                inner.soft_streak = 0;
                true
            }
            FailureKind::Soft => {
                inner.soft_streak += 1;
                if inner.soft_streak >= SOFT_RECONNECT_AFTER {
                    inner.soft_streak = 0;
                    true
                } else {
                    false
                }
            }
        };

        let mut toggled = None;
        if self.adaptive_addressing && failures >= TOGGLE_AFTER && !inner.toggled_this_streak {
            inner.address_type = inner.address_type.toggled();
            inner.toggled_this_streak = true;
            toggled = Some(inner.address_type);
            drop_link = true;
        }
        if drop_link {
            inner.reconnect_pending = true;
        }
        drop(inner);

        self.logger.warn(&format!(
            "Round failed ({:?}, #{}): {}; retry in {:.1}s",
            kind,
            failures,
            err,
            delay.as_secs_f64()
        ));
        if let Some(mode) = toggled {
            self.logger
                .info(&format!("Switching address type to {}", mode.as_str()));
        }
        drop_link
    }

    /// Reconnect ahead of the next round when a failure requested it.
    ///
    /// Returns true when a connection was established. A failed attempt is not
    /// booked as a round failure; the next round retries the connect itself.
    pub async fn reconnect(&self) -> bool {
        let Ok(mut transport) = self.transport.try_lock() else {
            return false;
        };
        let address_type = {
            let mut inner = self.inner();
            if !inner.reconnect_pending {
                return false;
            }
            inner.reconnect_pending = false;
            inner.state = ConnectionState::Connecting;
            inner.address_type
        };

        if transport.is_connected() {
            Self::drop_connection(&mut **transport, &self.logger).await;
        }
        match self.connect(&mut **transport, address_type).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                self.logger
                    .debug(&format!("Reconnected ({})", address_type.as_str()));
                true
            }
            Err(e) => {
                self.set_state(ConnectionState::Backoff);
                self.logger.debug(&format!("Reconnect failed: {}", e));
                false
            }
        }
    }

    pub fn reconnect_pending(&self) -> bool {
        self.inner().reconnect_pending
    }

    /// Time until the next round may start
    pub fn next_attempt_in(&self) -> Duration {
        self.inner().scheduler.next_in(Instant::now())
    }

    /// Address type of the last successful round
    pub fn known_good(&self) -> Option<AddressType> {
        self.inner().known_good
    }

    pub fn status(&self) -> LinkStatus {
        let inner = self.inner();
        let sched = inner.scheduler.state();
        LinkStatus {
            state: inner.state,
            address_type: inner.address_type,
            known_good: inner.known_good,
            consecutive_failures: sched.consecutive_failures,
            ok_count: sched.ok_count,
            fail_count: sched.fail_count,
            avg_read_ms: sched.avg_read_ms(),
            avg_skew_ms: sched.avg_skew_ms(),
            next_attempt_in: inner.scheduler.next_in(Instant::now()),
            reconnect_pending: inner.reconnect_pending,
            last_error: inner.last_error.clone(),
        }
    }

    fn maybe_log_stats(&self) {
        let now = Instant::now();
        let mut inner = self.inner();
        let Some(last) = inner.last_stats_at else {
            inner.last_stats_at = Some(now);
            return;
        };
        if now.duration_since(last) < self.stats_period {
            return;
        }
        inner.last_stats_at = Some(now);
        let s = inner.scheduler.state();
        let line = format!(
            "Link stats: ok={} fail={} avg_read={:.0}ms avg_skew={:.0}ms next_in={:.1}s",
            s.ok_count,
            s.fail_count,
            s.avg_read_ms(),
            s.avg_skew_ms(),
            inner.scheduler.next_in(now).as_secs_f64()
        );
        drop(inner);
        self.logger.info(&line);
    }

    /// Drop the connection for good; waits for an in-flight round
    pub async fn shutdown(&self) {
        let mut transport = self.transport.lock().await;
        if transport.is_connected() {
            Self::drop_connection(&mut **transport, &self.logger).await;
        }
        let mut inner = self.inner();
        inner.state = ConnectionState::Disconnected;
        inner.reconnect_pending = false;
    }
}
