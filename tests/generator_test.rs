use outback_bridge::config::GeneratorConfig;
use outback_bridge::generator::GeneratorController;
use std::time::Duration;
use tokio::time::Instant;

fn controller() -> GeneratorController {
    GeneratorController::new(&GeneratorConfig::default())
}

#[test]
fn below_start_threshold_never_runs() {
    let mut g = controller();
    let t0 = Instant::now();
    for (i, p) in [0.0, 50.0, 90.0, 119.9, 100.0].into_iter().enumerate() {
        let out = g.update_at(true, p, 230.0, t0 + Duration::from_secs(i as u64));
        assert!(!out.running);
        assert_eq!(out.power_w, 0.0);
        assert_eq!(out.current, 0.0);
    }
}

#[test]
fn hysteresis_band_keeps_state() {
    let mut g = controller();
    let t0 = Instant::now();
    assert!(g.update_at(true, 150.0, 230.0, t0).running);

    // between stop and start: keeps running even after min run
    let later = t0 + Duration::from_secs(30);
    let out = g.update_at(true, 90.0, 230.0, later);
    assert!(out.running);
    assert_eq!(out.power_w, 90.0);

    assert!(!g.update_at(true, 60.0, 230.0, later).running);
    // and stays off inside the band
    assert!(!g.update_at(true, 90.0, 230.0, later + Duration::from_secs(1)).running);
}

#[test]
fn below_stop_before_min_run_keeps_running() {
    let mut g = controller();
    let t0 = Instant::now();
    g.update_at(true, 1500.0, 230.0, t0);
    for s in 1..8 {
        let out = g.update_at(true, 0.0, 230.0, t0 + Duration::from_secs(s));
        assert!(out.running, "stopped after {}s", s);
    }
    assert!(!g.update_at(true, 0.0, 230.0, t0 + Duration::from_secs(8)).running);
}

#[test]
fn losing_passthrough_overrides_min_run() {
    let mut g = controller();
    let t0 = Instant::now();
    g.update_at(true, 1500.0, 230.0, t0);
    let out = g.update_at(false, 1500.0, 230.0, t0 + Duration::from_secs(1));
    assert!(!out.running);
    assert!(g.state().last_change_at.is_some());
}

#[test]
fn custom_thresholds_apply() {
    let cfg = GeneratorConfig {
        start_w: 1000.0,
        stop_w: 400.0,
        min_run_s: 0.0,
        ..GeneratorConfig::default()
    };
    let mut g = GeneratorController::new(&cfg);
    let t0 = Instant::now();
    assert!(!g.update_at(true, 900.0, 230.0, t0).running);
    let out = g.update_at(true, 1150.0, 230.0, t0);
    assert!(out.running);
    assert!((out.current - 5.0).abs() < 1e-9);
    assert!(!g.update_at(true, 399.0, 230.0, t0).running);
}
