//! Operating regime classification and the VE.Bus-style state heuristic

use serde::Serialize;
use std::fmt;

/// Default hysteresis band in watts
pub const DEFAULT_EPS_W: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperatingRegime {
    /// Solar covers L1, battery roughly idle
    DayPvDirect,
    /// Solar is short and the battery supplies the rest
    DayPvPlusBattery,
    /// Solar exceeds L1
    DayPvSurplus,
    /// No solar, battery supplies the load
    NightBattery,
    /// Inverter passes through generator power
    GeneratorPassthrough,
}

impl OperatingRegime {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DayPvDirect => "DAY_PV_DIRECT",
            Self::DayPvPlusBattery => "DAY_PV_PLUS_BATT",
            Self::DayPvSurplus => "DAY_PV_SURPLUS",
            Self::NightBattery => "NIGHT_BATT",
            Self::GeneratorPassthrough => "GEN_PASSTHROUGH",
        }
    }
}

impl fmt::Display for OperatingRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the current tick. First matching rule wins; `eps` is the dead
/// band that keeps adjacent regimes from chattering.
pub fn classify(
    pv_ac: f64,
    l1_out: f64,
    battery_power: f64,
    passthrough_active: bool,
    generator_power: f64,
    eps: f64,
) -> OperatingRegime {
    if passthrough_active && generator_power > eps {
        return OperatingRegime::GeneratorPassthrough;
    }
    if pv_ac <= eps && l1_out > eps {
        return OperatingRegime::NightBattery;
    }

    let diff = pv_ac - l1_out;
    if battery_power.abs() <= eps && diff.abs() <= eps {
        return OperatingRegime::DayPvDirect;
    }
    if diff >= eps {
        return OperatingRegime::DayPvSurplus;
    }
    if diff <= -eps && battery_power < -eps {
        return OperatingRegime::DayPvPlusBattery;
    }

    if pv_ac > eps {
        OperatingRegime::DayPvDirect
    } else {
        OperatingRegime::NightBattery
    }
}

/// VE.Bus state codes used on the inverter service
pub mod ve_state {
    pub const BULK: u8 = 4;
    pub const ABSORPTION: u8 = 5;
    pub const INVERTING: u8 = 9;
    pub const PASSTHRU: u8 = 11;
}

/// VE.Bus mode "on"
pub const VE_MODE_ON: u8 = 3;

/// Heuristic inverter state from the reconciled flows
pub fn inverter_state(pv_ac: f64, dc_power: f64, total_ac: f64) -> u8 {
    if pv_ac > 80.0 && dc_power >= 30.0 {
        ve_state::ABSORPTION
    } else if pv_ac > 50.0 && dc_power >= 0.0 {
        ve_state::BULK
    } else if total_ac > 50.0 && dc_power < 0.0 {
        ve_state::INVERTING
    } else {
        ve_state::PASSTHRU
    }
}

/// Short label for log lines
pub const fn state_label(state: u8) -> &'static str {
    match state {
        ve_state::INVERTING => "Invert",
        ve_state::BULK | ve_state::ABSORPTION => "Charge",
        _ => "Standby",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_passthrough_wins() {
        assert_eq!(
            classify(500.0, 1600.0, -100.0, true, 1200.0, DEFAULT_EPS_W),
            OperatingRegime::GeneratorPassthrough
        );
        // without passthrough the same flows are a battery-assisted day
        assert_eq!(
            classify(500.0, 1600.0, -100.0, false, 1200.0, DEFAULT_EPS_W),
            OperatingRegime::DayPvPlusBattery
        );
    }

    #[test]
    fn night_when_no_solar_and_load() {
        assert_eq!(
            classify(0.0, 300.0, -320.0, false, 0.0, DEFAULT_EPS_W),
            OperatingRegime::NightBattery
        );
    }

    #[test]
    fn surplus_and_direct() {
        assert_eq!(
            classify(900.0, 400.0, 500.0, false, 0.0, DEFAULT_EPS_W),
            OperatingRegime::DayPvSurplus
        );
        assert_eq!(
            classify(420.0, 400.0, 10.0, false, 0.0, DEFAULT_EPS_W),
            OperatingRegime::DayPvDirect
        );
    }

    #[test]
    fn fallback_rules() {
        // battery charging hard while solar matches the load
        assert_eq!(
            classify(500.0, 500.0, 1000.0, false, 0.0, DEFAULT_EPS_W),
            OperatingRegime::DayPvDirect
        );
        // idle system
        assert_eq!(
            classify(0.0, 0.0, 0.0, false, 0.0, DEFAULT_EPS_W),
            OperatingRegime::DayPvDirect
        );
        assert_eq!(
            classify(10.0, 30.0, -100.0, false, 0.0, DEFAULT_EPS_W),
            OperatingRegime::NightBattery
        );
    }

    #[test]
    fn inverter_state_heuristic() {
        assert_eq!(inverter_state(500.0, 1000.0, 800.0), ve_state::ABSORPTION);
        assert_eq!(inverter_state(60.0, 0.0, 100.0), ve_state::BULK);
        assert_eq!(inverter_state(0.0, -300.0, 300.0), ve_state::INVERTING);
        assert_eq!(inverter_state(0.0, 0.0, 0.0), ve_state::PASSTHRU);
        assert_eq!(state_label(ve_state::INVERTING), "Invert");
    }
}
