use approx::assert_abs_diff_eq;
use chrono::NaiveDate;
use outback_bridge::config::AddressType;
use outback_bridge::counters::{DayClock, ForwardCounterStore, Meter};
use outback_bridge::persistence::{PersistenceManager, PersistentState};
use std::fs;
use std::time::Duration;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
}

fn open(path: &std::path::Path) -> ForwardCounterStore {
    ForwardCounterStore::open(path, Duration::from_secs(15), DayClock::Local)
}

#[test]
fn default_state_is_zeroed() {
    let s = PersistentState::default();
    assert_eq!(s.pv.lifetime_kwh, 0.0);
    assert_eq!(s.l3.day_date, None);
    assert_eq!(s.link_address_mode, None);
}

#[test]
fn counters_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut store = open(&path);
    store.integrate_on(Meter::Pv, 2000.0, 1800.0, day(4));
    store.integrate_on(Meter::L2, 400.0, 3600.0, day(4));
    store.set_address_mode(AddressType::Random);
    store.flush();
    assert!(!store.is_dirty());

    let reopened = open(&path);
    let pv = reopened.snapshot(Meter::Pv);
    assert_abs_diff_eq!(pv.lifetime_kwh, 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(pv.day_kwh, 1.0, epsilon = 1e-9);
    assert_eq!(pv.day_date, Some(day(4)));
    assert_abs_diff_eq!(reopened.snapshot(Meter::L2).lifetime_kwh, 0.4, epsilon = 1e-9);
    assert_eq!(reopened.snapshot(Meter::L3).lifetime_kwh, 0.0);
    assert_eq!(reopened.address_mode(), Some(AddressType::Random));
}

#[test]
fn state_file_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let mut store = open(&path);
    store.integrate_on(Meter::L3, 1000.0, 3600.0, day(9));
    store.save_if_needed(true).unwrap();

    let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(doc["l3"]["day_date"], "2025-03-09");
    assert_abs_diff_eq!(doc["l3"]["lifetime_kwh"].as_f64().unwrap(), 1.0, epsilon = 1e-9);
    assert!(doc.get("pv").is_some());
    assert!(doc.get("link_address_mode").is_some());
}

#[test]
fn corrupt_file_loads_as_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fs::write(&path, b"{\"pv\": {\"lifetime_kwh\": ").unwrap();

    let mgr = PersistenceManager::new(&path);
    assert_eq!(mgr.load(), PersistentState::default());

    let store = open(&path);
    assert_eq!(store.snapshot(Meter::Pv).lifetime_kwh, 0.0);
}

#[test]
fn unwritable_location_keeps_memory_values() {
    let dir = tempfile::tempdir().unwrap();
    // a regular file where the parent directory should be
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, b"").unwrap();
    let mut store = open(&blocker.join("state.json"));

    store.integrate_on(Meter::Pv, 3600.0, 1000.0, day(1));
    assert!(store.save_if_needed(true).is_err());
    assert!(store.is_dirty());
    assert_abs_diff_eq!(store.snapshot(Meter::Pv).lifetime_kwh, 1.0, epsilon = 1e-9);
}

#[test]
fn day_total_is_monotonic_within_a_day_and_resets_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(&dir.path().join("state.json"));
    let powers = [0.0, 150.0, -40.0, 1200.0, 3.0, f64::NAN, 800.0];

    let mut last_day = 0.0;
    let mut last_life = 0.0;
    for p in powers {
        store.integrate_on(Meter::Pv, p, 1.0, day(1));
        let s = store.snapshot(Meter::Pv);
        assert!(s.day_kwh >= last_day);
        assert!(s.lifetime_kwh >= last_life);
        last_day = s.day_kwh;
        last_life = s.lifetime_kwh;
    }

    store.integrate_on(Meter::Pv, 100.0, 1.0, day(2));
    let s = store.snapshot(Meter::Pv);
    assert!(s.day_kwh < last_day);
    assert!(s.lifetime_kwh > last_life);
    // snapshot is idempotent
    assert_eq!(store.snapshot(Meter::Pv), s);

    store.integrate_on(Meter::Pv, 100.0, 1.0, day(2));
    assert!(store.snapshot(Meter::Pv).day_kwh > s.day_kwh);
}
