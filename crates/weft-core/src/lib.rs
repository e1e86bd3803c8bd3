//! # WEFT Core
//!
//! Core protocol implementation for the WEFT reliable, authenticated,
//! framed messaging stack over unreliable datagram substrates.
//!
//! This crate provides:
//! - VarLong / fixed-width / map wire codec
//! - The bundle engine (packing, padding, AEAD framing, selective repeat,
//!   fragmentation, glare resolution, heartbeats)
//! - The session state machine (probe/announce, key switch, disconnect)
//! - The reach loop (hop-by-hop symbolic destination resolution)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Session                                 │
//! │   (handshake state machine, key switch, teardown)               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Tunnel                                  │
//! │   (bundle packing, reliability window, fragmentation, AEAD)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Packets                                 │
//! │   (application message units, channel-tagged, fragmentable)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is sans-IO: callers own the sockets and the clock, and drive
//! `parse` / `push` / `flush` / `update` from exactly one owner per session.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod codec;
pub mod error;
pub mod meta;
pub mod packet;
pub mod reach;
pub mod reassembly;
pub mod session;
pub mod tunnel;
pub mod window;

pub use error::Error;
pub use meta::MetaMap;
pub use packet::{FragmentStatus, Packet, CONTROL_CHANNEL, DEFAULT_CHANNEL};
pub use reach::{HopDriver, HopReply, Hostname, Reach, ReachError};
pub use session::{Session, SessionHandler, SessionState};
pub use tunnel::{InflightBundle, Tunnel, TunnelConfig};
pub use window::{ReplayWindow, SeqRange};
