//! Telemetry block decoding
//!
//! Each block is a run of big-endian 16-bit words whose two bytes are
//! swapped before use. Field offsets and fixed-point scales are fixed by the
//! inverter firmware.

use crate::error::{BridgeError, Result};
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// A03 (inverter block) word offsets
pub mod a03 {
    pub const AC_VOLTAGE: usize = 2;
    pub const AC_FREQUENCY: usize = 3;
    pub const AC_APPARENT: usize = 4;
    pub const AC_ACTIVE: usize = 5;
    pub const LOAD_PERCENT: usize = 6;
    pub const DC_VOLTAGE: usize = 8;
    pub const DC_CURRENT: usize = 9;
    pub const MIN_WORDS: usize = DC_CURRENT + 1;
}

/// A11 (PV block) word offsets
pub mod a11 {
    pub const PV_VOLTAGE: usize = 6;
    pub const PV_POWER: usize = 7;
    pub const MIN_WORDS: usize = PV_POWER + 1;
}

const DECI: f64 = 0.1;
const CENTI: f64 = 0.01;

/// Split a raw block into byte-swapped words
pub fn swap_decode(raw: &[u8]) -> Result<Vec<u16>> {
    if raw.len() % 2 != 0 {
        return Err(BridgeError::decode(format!(
            "block length {} is not a whole number of words",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]).swap_bytes())
        .collect())
}

/// Inverse of [`swap_decode`]
pub fn swap_encode(words: &[u16]) -> Vec<u8> {
    words
        .iter()
        .flat_map(|w| w.swap_bytes().to_be_bytes())
        .collect()
}

fn require_words(words: &[u16], min: usize, block: &str) -> Result<()> {
    if words.len() < min {
        return Err(BridgeError::decode(format!(
            "{} block has {} words, need at least {}",
            block,
            words.len(),
            min
        )));
    }
    Ok(())
}

/// Decoded AC/DC block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverterBlock {
    pub ac_voltage: f64,
    pub ac_frequency: f64,
    pub ac_apparent_power: f64,
    pub ac_active_power: f64,
    pub load_percent: f64,
    pub dc_voltage: f64,
    pub dc_current: f64,
}

/// Decoded PV block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PvBlock {
    pub pv_voltage: f64,
    pub pv_power: f64,
}

pub fn decode_inverter_block(raw: &[u8]) -> Result<InverterBlock> {
    let w = swap_decode(raw)?;
    require_words(&w, a03::MIN_WORDS, "A03")?;
    Ok(InverterBlock {
        ac_voltage: f64::from(w[a03::AC_VOLTAGE]) * DECI,
        ac_frequency: f64::from(w[a03::AC_FREQUENCY]) * DECI,
        ac_apparent_power: f64::from(w[a03::AC_APPARENT]),
        ac_active_power: f64::from(w[a03::AC_ACTIVE]),
        load_percent: f64::from(w[a03::LOAD_PERCENT]),
        dc_voltage: f64::from(w[a03::DC_VOLTAGE]) * CENTI,
        // two's complement: negative while discharging
        dc_current: f64::from(i16::from_ne_bytes(w[a03::DC_CURRENT].to_ne_bytes())),
    })
}

pub fn decode_pv_block(raw: &[u8]) -> Result<PvBlock> {
    let w = swap_decode(raw)?;
    require_words(&w, a11::MIN_WORDS, "A11")?;
    Ok(PvBlock {
        pv_voltage: f64::from(w[a11::PV_VOLTAGE]) * DECI,
        pv_power: f64::from(w[a11::PV_POWER]),
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_word(value: f64, scale: f64) -> u16 {
    (value / scale).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

#[allow(clippy::cast_possible_truncation)]
fn to_signed_word(value: f64) -> u16 {
    let signed = value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
    u16::from_ne_bytes(signed.to_ne_bytes())
}

/// Encode an inverter block the way the device lays it out
pub fn encode_inverter_block(b: &InverterBlock) -> Vec<u8> {
    let mut w = [0u16; a03::MIN_WORDS];
    w[a03::AC_VOLTAGE] = to_word(b.ac_voltage, DECI);
    w[a03::AC_FREQUENCY] = to_word(b.ac_frequency, DECI);
    w[a03::AC_APPARENT] = to_word(b.ac_apparent_power, 1.0);
    w[a03::AC_ACTIVE] = to_word(b.ac_active_power, 1.0);
    w[a03::LOAD_PERCENT] = to_word(b.load_percent, 1.0);
    w[a03::DC_VOLTAGE] = to_word(b.dc_voltage, CENTI);
    w[a03::DC_CURRENT] = to_signed_word(b.dc_current);
    swap_encode(&w)
}

/// Encode a PV block the way the device lays it out
pub fn encode_pv_block(b: &PvBlock) -> Vec<u8> {
    let mut w = [0u16; a11::MIN_WORDS];
    w[a11::PV_VOLTAGE] = to_word(b.pv_voltage, DECI);
    w[a11::PV_POWER] = to_word(b.pv_power, 1.0);
    swap_encode(&w)
}

/// One complete round of telemetry
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSnapshot {
    pub ac_voltage: f64,
    pub ac_frequency: f64,
    pub ac_apparent_power: f64,
    /// L1 active power
    pub ac_active_power: f64,
    pub load_percent: f64,
    pub dc_voltage: f64,
    pub dc_current: f64,
    pub pv_voltage: f64,
    pub pv_power: f64,
    /// Monotonic capture time, for freshness checks
    pub captured_at: Instant,
    /// Wall clock capture time, for logs
    pub captured_wall: DateTime<Utc>,
}

impl RoundSnapshot {
    pub fn from_blocks(inv: InverterBlock, pv: PvBlock, captured_at: Instant) -> Self {
        Self {
            ac_voltage: inv.ac_voltage,
            ac_frequency: inv.ac_frequency,
            ac_apparent_power: inv.ac_apparent_power,
            ac_active_power: inv.ac_active_power,
            load_percent: inv.load_percent,
            dc_voltage: inv.dc_voltage,
            dc_current: inv.dc_current,
            pv_voltage: pv.pv_voltage,
            pv_power: pv.pv_power,
            captured_at,
            captured_wall: Utc::now(),
        }
    }

    /// PV current derived from power and voltage
    pub fn pv_current(&self) -> f64 {
        if self.pv_voltage > 0.0 {
            self.pv_power / self.pv_voltage
        } else {
            0.0
        }
    }
}
