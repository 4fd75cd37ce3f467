use async_trait::async_trait;
use outback_bridge::config::{AddressType, LinkConfig};
use outback_bridge::error::{BridgeError, Result};
use outback_bridge::link::{
    Block, DeviceLink, GattTransport, InverterBlock, PollOutcome, PvBlock, Unavailable,
    encode_inverter_block, encode_pv_block,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Script {
    connect_results: VecDeque<Result<()>>,
    reads: VecDeque<Result<Vec<u8>>>,
    read_delay: Option<Duration>,
    connects: Vec<AddressType>,
    disconnects: u32,
}

/// Transport that plays back queued results and succeeds once the queue is empty
struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    connected: bool,
}

fn inverter_block() -> InverterBlock {
    InverterBlock {
        ac_voltage: 230.1,
        ac_frequency: 50.0,
        ac_apparent_power: 540.0,
        ac_active_power: 500.0,
        load_percent: 17.0,
        dc_voltage: 26.8,
        dc_current: -12.0,
    }
}

fn pv_block() -> PvBlock {
    PvBlock {
        pv_voltage: 120.5,
        pv_power: 1800.0,
    }
}

#[async_trait]
impl GattTransport for ScriptedTransport {
    async fn connect(&mut self, address_type: AddressType) -> Result<()> {
        let result = {
            let mut s = self.script.lock().unwrap();
            s.connects.push(address_type);
            s.connect_results.pop_front().unwrap_or(Ok(()))
        };
        self.connected = result.is_ok();
        result
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.script.lock().unwrap().disconnects += 1;
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_block(&mut self, block: Block) -> Result<Vec<u8>> {
        let (delay, scripted) = {
            let mut s = self.script.lock().unwrap();
            (s.read_delay, s.reads.pop_front())
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        scripted.unwrap_or_else(|| {
            Ok(match block {
                Block::Inverter => encode_inverter_block(&inverter_block()),
                Block::Pv => encode_pv_block(&pv_block()),
            })
        })
    }

    fn describe(&self) -> String {
        "Scripted".to_string()
    }
}

fn link_with(script: Script) -> (Arc<DeviceLink>, Arc<Mutex<Script>>) {
    let script = Arc::new(Mutex::new(script));
    let transport = ScriptedTransport {
        script: Arc::clone(&script),
        connected: false,
    };
    let link = DeviceLink::new(
        &LinkConfig::default(),
        Box::new(transport),
        AddressType::Public,
        Some(1),
    );
    (Arc::new(link), script)
}

async fn wait_until_due(link: &DeviceLink) {
    tokio::time::sleep(link.next_attempt_in()).await;
}

#[tokio::test(start_paused = true)]
async fn round_yields_decoded_snapshot_then_throttles() {
    let (link, _) = link_with(Script::default());

    let snap = link.poll().await.snapshot().expect("first round");
    assert!((snap.ac_voltage - 230.1).abs() < 1e-9);
    assert_eq!(snap.ac_active_power, 500.0);
    assert!((snap.dc_voltage - 26.8).abs() < 1e-9);
    assert_eq!(snap.dc_current, -12.0);
    assert_eq!(snap.pv_power, 1800.0);

    assert!(matches!(
        link.poll().await,
        PollOutcome::Unavailable(Unavailable::Throttled)
    ));
    let status = link.status();
    assert_eq!(status.ok_count, 1);
    assert_eq!(status.fail_count, 0);
    assert_eq!(status.known_good, Some(AddressType::Public));
    assert!(status.next_attempt_in >= Duration::from_millis(1800));
    assert!(status.next_attempt_in < Duration::from_millis(2000));
}

#[tokio::test(start_paused = true)]
async fn concurrent_poll_reports_busy() {
    let (link, _) = link_with(Script {
        read_delay: Some(Duration::from_millis(500)),
        ..Script::default()
    });

    let in_flight = {
        let link = Arc::clone(&link);
        tokio::spawn(async move { link.poll().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(
        link.poll().await,
        PollOutcome::Unavailable(Unavailable::Busy)
    ));
    assert!(in_flight.await.unwrap().snapshot().is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_second_read_discards_round() {
    let (link, script) = link_with(Script {
        reads: VecDeque::from([
            Ok(encode_inverter_block(&inverter_block())),
            Err(BridgeError::link("GATT read failed")),
        ]),
        ..Script::default()
    });

    assert!(matches!(
        link.poll().await,
        PollOutcome::Unavailable(Unavailable::Failed)
    ));
    let status = link.status();
    assert_eq!(status.consecutive_failures, 1);
    assert_eq!(status.ok_count, 0);
    assert!(status.last_error.is_some());
    // one soft failure keeps the connection
    assert!(!link.reconnect_pending());
    assert_eq!(script.lock().unwrap().disconnects, 0);
}

#[tokio::test(start_paused = true)]
async fn second_soft_failure_forces_reconnect() {
    let short = vec![0u8; 6];
    let (link, script) = link_with(Script {
        reads: VecDeque::from([
            Ok(short.clone()),
            Ok(encode_pv_block(&pv_block())),
            Ok(short),
            Ok(encode_pv_block(&pv_block())),
        ]),
        ..Script::default()
    });

    assert!(link.poll().await.snapshot().is_none());
    assert!(!link.reconnect_pending());
    wait_until_due(&link).await;
    assert!(link.poll().await.snapshot().is_none());
    assert!(link.reconnect_pending());
    assert_eq!(script.lock().unwrap().disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn hard_failure_disconnects_and_reconnects_early() {
    let (link, script) = link_with(Script {
        reads: VecDeque::from([Err(BridgeError::link("Not connected"))]),
        ..Script::default()
    });

    assert!(link.poll().await.snapshot().is_none());
    assert!(link.reconnect_pending());
    assert_eq!(script.lock().unwrap().disconnects, 1);

    assert!(link.reconnect().await);
    assert!(!link.reconnect_pending());
    assert_eq!(script.lock().unwrap().connects.len(), 2);

    // the reconnect does not bypass the backoff schedule
    assert!(matches!(
        link.poll().await,
        PollOutcome::Unavailable(Unavailable::Throttled)
    ));
    wait_until_due(&link).await;
    assert!(link.poll().await.snapshot().is_some());
    assert_eq!(link.status().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn address_type_toggles_once_per_streak() {
    let (link, script) = link_with(Script {
        connect_results: (0..4)
            .map(|_| Err(BridgeError::link("Host is down")))
            .collect(),
        ..Script::default()
    });

    for _ in 0..5 {
        wait_until_due(&link).await;
        link.poll().await;
    }

    let connects = script.lock().unwrap().connects.clone();
    assert_eq!(
        connects,
        vec![
            AddressType::Public,
            AddressType::Public,
            AddressType::Public,
            AddressType::Random,
            AddressType::Random,
        ]
    );
    let status = link.status();
    assert_eq!(status.ok_count, 1);
    assert_eq!(status.known_good, Some(AddressType::Random));
    assert_eq!(status.address_type, AddressType::Random);
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_then_resets_on_success() {
    let (link, _) = link_with(Script {
        connect_results: (0..6)
            .map(|_| Err(BridgeError::link_lost("no such device")))
            .collect(),
        ..Script::default()
    });

    let expected = [1.0, 2.0, 4.0, 8.0, 12.0, 12.0];
    let mut previous = Duration::ZERO;
    for (n, base) in expected.iter().enumerate() {
        wait_until_due(&link).await;
        assert!(link.poll().await.snapshot().is_none());
        let wait = link.status().next_attempt_in;
        let base = Duration::from_secs_f64(*base);
        assert!(wait >= base, "failure {} waited {:?}", n + 1, wait);
        assert!(wait < base + Duration::from_millis(200));
        assert!(wait + Duration::from_millis(200) >= previous);
        previous = wait;
    }

    wait_until_due(&link).await;
    assert!(link.poll().await.snapshot().is_some());
    let status = link.status();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.fail_count, 6);
    assert!(status.next_attempt_in < Duration::from_millis(2000));
}

#[tokio::test(start_paused = true)]
async fn slow_read_times_out_as_failure() {
    let (link, _) = link_with(Script {
        read_delay: Some(Duration::from_secs(5)),
        ..Script::default()
    });
    assert!(matches!(
        link.poll().await,
        PollOutcome::Unavailable(Unavailable::Failed)
    ));
    let err = link.status().last_error.unwrap_or_default();
    assert!(err.contains("timed out"), "{}", err);
}
