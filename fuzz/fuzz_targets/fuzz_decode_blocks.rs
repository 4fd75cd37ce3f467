#![no_main]
use libfuzzer_sys::fuzz_target;
use outback_bridge::link::{decode_inverter_block, decode_pv_block, swap_decode};

fuzz_target!(|data: &[u8]| {
    // Any byte string must decode or fail cleanly, never panic
    let words = swap_decode(data);
    let inv = decode_inverter_block(data);
    let pv = decode_pv_block(data);

    if data.len() % 2 != 0 {
        assert!(words.is_err() && inv.is_err() && pv.is_err());
    }
    if let Ok(block) = inv {
        assert!(block.ac_voltage.is_finite() && block.dc_current.is_finite());
    }
});
