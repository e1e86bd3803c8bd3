//! Fuzz target for bundle parsing
//!
//! Malformed bundles must be dropped silently, never panic, in every
//! combination of windowed/secure mode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use weft_core::{Tunnel, TunnelConfig};

fuzz_target!(|data: &[u8]| {
    let mut plain = Tunnel::new(TunnelConfig::default());
    let _ = plain.parse(data, 1);

    let mut windowed = Tunnel::new(TunnelConfig::default());
    windowed.enable_windowing();
    let _ = windowed.parse(data, 1);

    let mut secure = Tunnel::new(TunnelConfig::default());
    secure.enable_windowing();
    let _ = secure.enable_security(&[0u8; 32]);
    let _ = secure.parse(data, 1);
    let _ = secure.flush(2);
});
