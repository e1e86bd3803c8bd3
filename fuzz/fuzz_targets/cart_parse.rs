//! Fuzz target for rail cart parsing
//!
//! Arbitrary carts against keyed, plaintext and absent channels must never
//! panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use weft_crypto::AeadKey;
use weft_rail::{RailConfig, RawCart, Station};

fuzz_target!(|data: &[u8]| {
    let _ = RawCart::parse(data);

    let mut empty = Station::new(RailConfig::default());
    let _ = empty.recv(data, 1);

    let mut keyed = Station::new(RailConfig::default());
    if keyed.open_channel(1, Some(AeadKey::new([0u8; 32])), 0).is_ok() {
        let _ = keyed.recv(data, 1);
    }
});
