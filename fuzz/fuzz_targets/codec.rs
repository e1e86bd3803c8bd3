//! Fuzz target for the wire codec
//!
//! VarLong, map and packet readers must reject malformed input without
//! panicking, and round-trip whatever they accept.

#![no_main]

use libfuzzer_sys::fuzz_target;
use weft_core::codec;
use weft_core::Packet;

fuzz_target!(|data: &[u8]| {
    if let Ok((value, len)) = codec::read_var_long(data, 0) {
        let mut reencoded = Vec::new();
        codec::write_var_long(&mut reencoded, value);
        // Canonical re-encoding never exceeds what was consumed.
        assert!(reencoded.len() <= len);
    }

    let _ = codec::read_map(data, 0);
    let _ = Packet::parse(data, true);
    let _ = Packet::parse(data, false);
});
