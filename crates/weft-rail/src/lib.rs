//! # WEFT Rail
//!
//! Broadcast-style channelized bus over a shared datagram substrate.
//!
//! Where a tunnel is one stateful point-to-point session, a rail station
//! multiplexes many logical channels over the same substrate. Each channel
//! carries its own key, an independent sliding-window replay bitmap, and a
//! metadata map transmitted as a diff. Channel ids are 24-bit and drawn
//! from a pre-generated pool with collision avoidance; idle channels are
//! garbage collected.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bitmap;
pub mod error;
pub mod station;

pub use bitmap::SlidingBitmap;
pub use error::RailError;
pub use station::{Delivery, RailConfig, RawCart, Station, CHANNEL_ID_MAX};
