//! The channel multiplexer: many keyed logical channels over one substrate.
//!
//! Cart wire format (secure):
//!
//! ```text
//! header(1) || channelId(3 BE) || VarLong(nonce) || tag(8) || ciphertext
//! ```
//!
//! with AD = `header || channelId`. Plaintext carts omit the nonce and tag.
//! Content is `[VarLong(metaLen) || metaBlob when has-meta] || payload`;
//! metadata travels only when it changed since the last transmission.

use crate::bitmap::SlidingBitmap;
use crate::error::RailError;
use rand_core::RngCore;
use std::collections::BTreeMap;
use tracing::{debug, trace};
use weft_core::codec;
use weft_core::meta::MetaMap;
use weft_crypto::aead::{self, AeadKey, TagLen};
use weft_crypto::constant_time::ct_eq;

/// Largest addressable channel id (24-bit wire field).
pub const CHANNEL_ID_MAX: u32 = 0x00FF_FFFF;

const CART_SECURE: u8 = 1 << 0;
const CART_BROADCAST: u8 = 1 << 1;
const CART_META: u8 = 1 << 2;

/// Station configuration.
#[derive(Debug, Clone)]
pub struct RailConfig {
    /// Replay bitmap width per channel, in bits (multiple of 8)
    pub window_bits: usize,
    /// Idle time after which a channel is garbage collected
    pub destroy_timeout_ms: u64,
    /// Target size of the pre-generated channel-id pool
    pub pool_size: usize,
}

impl Default for RailConfig {
    fn default() -> Self {
        Self {
            window_bits: 64,
            destroy_timeout_ms: 30_000,
            pool_size: 10,
        }
    }
}

/// Per-channel state.
struct Channel {
    key: Option<AeadKey>,
    window: SlidingBitmap,
    last_sent_nonce: u64,
    last_seen_ms: u64,
    last_sent_ms: u64,
    meta: MetaMap,
    their_meta: MetaMap,
    last_meta_sent: Option<Vec<u8>>,
    enabled: bool,
}

/// One delivered cart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel the cart arrived on
    pub channel: u32,
    /// Application payload
    pub payload: Vec<u8>,
    /// Whether the cart was a broadcast
    pub broadcast: bool,
}

/// Parsed cart framing, for the one-hop forwarding hook: enough to route a
/// cart onward without holding any channel key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCart {
    /// Raw header byte
    pub header: u8,
    /// Channel id
    pub channel: u32,
    /// Nonce, when the cart is secure
    pub nonce: Option<u64>,
}

impl RawCart {
    /// Parse the unencrypted framing of a cart.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let header = bytes[0];
        let channel = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]);
        let nonce = if header & CART_SECURE != 0 {
            let (nonce, _) = codec::read_var_long(bytes, 4).ok()?;
            Some(nonce)
        } else {
            None
        };
        Some(Self {
            header,
            channel,
            nonce,
        })
    }

    /// Whether the cart is addressed to nobody in particular.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.header & CART_BROADCAST != 0
    }
}

/// A station multiplexing channels over one substrate.
pub struct Station {
    config: RailConfig,
    channels: BTreeMap<u32, Channel>,
    pool: Vec<u32>,
}

impl Station {
    /// Create a station. Call [`Station::maintain_pool`] to pre-generate
    /// allocatable channel ids.
    #[must_use]
    pub fn new(config: RailConfig) -> Self {
        Self {
            config,
            channels: BTreeMap::new(),
            pool: Vec::new(),
        }
    }

    /// Station configuration.
    #[must_use]
    pub fn config(&self) -> &RailConfig {
        &self.config
    }

    /// Currently allocatable pre-generated channel ids.
    #[must_use]
    pub fn pool(&self) -> &[u32] {
        &self.pool
    }

    /// Refill the id pool to its target size with fresh random 24-bit ids,
    /// skipping ids already pooled or in use.
    pub fn maintain_pool<R: RngCore>(&mut self, rng: &mut R) {
        while self.pool.len() < self.config.pool_size {
            let id = (rng.next_u32() & CHANNEL_ID_MAX).max(1);
            if self.pool.contains(&id) || self.channels.contains_key(&id) {
                continue;
            }
            self.pool.push(id);
        }
    }

    /// Take a pre-generated id from the pool.
    pub fn allocate_channel<R: RngCore>(&mut self, rng: &mut R) -> u32 {
        if self.pool.is_empty() {
            self.maintain_pool(rng);
        }
        self.pool.pop().unwrap_or(1)
    }

    /// Open a channel, optionally keyed.
    ///
    /// # Errors
    ///
    /// Returns `RailError::InvalidChannelId` for id 0 or beyond 24 bits,
    /// and propagates bitmap construction errors.
    pub fn open_channel(
        &mut self,
        id: u32,
        key: Option<AeadKey>,
        now_ms: u64,
    ) -> Result<(), RailError> {
        if id == 0 || id > CHANNEL_ID_MAX {
            return Err(RailError::InvalidChannelId(id));
        }
        let channel = Channel {
            key,
            window: SlidingBitmap::new(self.config.window_bits)?,
            last_sent_nonce: 0,
            last_seen_ms: now_ms,
            last_sent_ms: now_ms,
            meta: MetaMap::new(),
            their_meta: MetaMap::new(),
            last_meta_sent: None,
            enabled: true,
        };
        self.channels.insert(id, channel);
        Ok(())
    }

    /// Close a channel.
    pub fn close_channel(&mut self, id: u32) {
        self.channels.remove(&id);
    }

    /// Enable or disable delivery on a channel.
    ///
    /// # Errors
    ///
    /// Returns `RailError::UnknownChannel` when no such channel is open.
    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> Result<(), RailError> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(RailError::UnknownChannel(id))?;
        channel.enabled = enabled;
        Ok(())
    }

    /// Local metadata map of a channel, for editing.
    pub fn meta_mut(&mut self, id: u32) -> Option<&mut MetaMap> {
        self.channels.get_mut(&id).map(|c| &mut c.meta)
    }

    /// The peer-observed metadata snapshot of a channel.
    #[must_use]
    pub fn peer_meta(&self, id: u32) -> Option<&MetaMap> {
        self.channels.get(&id).map(|c| &c.their_meta)
    }

    /// Ids of currently open channels.
    #[must_use]
    pub fn channel_ids(&self) -> Vec<u32> {
        self.channels.keys().copied().collect()
    }

    /// Build a cart on a channel. Metadata is included only when it changed
    /// since the last transmission (compared in constant time).
    ///
    /// # Errors
    ///
    /// Returns `RailError::UnknownChannel` / `RailError::ChannelDisabled`
    /// when the channel cannot send.
    pub fn send(
        &mut self,
        id: u32,
        payload: &[u8],
        broadcast: bool,
        now_ms: u64,
    ) -> Result<Vec<u8>, RailError> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(RailError::UnknownChannel(id))?;
        if !channel.enabled {
            return Err(RailError::ChannelDisabled(id));
        }

        let mut header = 0u8;
        if channel.key.is_some() {
            header |= CART_SECURE;
        }
        if broadcast {
            header |= CART_BROADCAST;
        }

        let mut meta_blob = Vec::new();
        codec::write_map(&mut meta_blob, &channel.meta);
        let meta_changed = match &channel.last_meta_sent {
            Some(previous) => !ct_eq(previous, &meta_blob),
            None => !channel.meta.is_empty(),
        };
        if meta_changed {
            header |= CART_META;
        }

        let mut content = Vec::new();
        if meta_changed {
            codec::write_var_long(&mut content, meta_blob.len() as u64);
            content.extend_from_slice(&meta_blob);
        }
        content.extend_from_slice(payload);

        let id_bytes = id.to_be_bytes();
        let mut wire = Vec::with_capacity(content.len() + 16);
        wire.push(header);
        wire.extend_from_slice(&id_bytes[1..4]);

        if let Some(key) = &channel.key {
            channel.last_sent_nonce += 1;
            let nonce = channel.last_sent_nonce;

            let mut ad = Vec::with_capacity(4);
            ad.push(header);
            ad.extend_from_slice(&id_bytes[1..4]);

            let sealed = aead::seal(key, nonce, &content, &ad, TagLen::Short);
            codec::write_var_long(&mut wire, nonce);
            wire.extend_from_slice(&sealed.tag);
            wire.extend_from_slice(&sealed.ciphertext);
        } else {
            wire.extend_from_slice(&content);
        }

        if meta_changed {
            channel.last_meta_sent = Some(meta_blob);
        }
        channel.last_sent_ms = now_ms;
        Ok(wire)
    }

    /// Ingest one cart from the substrate.
    ///
    /// Replayed, unauthenticated, mode-mismatched or unaddressable carts
    /// are dropped silently (`None`). Plaintext broadcast carts for
    /// channels this station does not hold surface as broadcast deliveries.
    pub fn recv(&mut self, bytes: &[u8], now_ms: u64) -> Option<Delivery> {
        if bytes.len() < 4 {
            return None;
        }
        let header = bytes[0];
        let id = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]);
        let secure = header & CART_SECURE != 0;
        let broadcast = header & CART_BROADCAST != 0;
        let has_meta = header & CART_META != 0;
        let mut at = 4usize;

        // Collision avoidance: a live foreign channel id must leave the
        // allocation pool.
        if let Some(idx) = self.pool.iter().position(|&pooled| pooled == id) {
            debug!(channel = id, "channel id collision, dropping from pool");
            self.pool.swap_remove(idx);
        }

        let Some(channel) = self.channels.get_mut(&id) else {
            if broadcast && !secure {
                let payload = Self::parse_content(&bytes[at..], has_meta, None)?;
                return Some(Delivery {
                    channel: id,
                    payload,
                    broadcast: true,
                });
            }
            trace!(channel = id, "drop cart: unknown channel");
            return None;
        };
        if !channel.enabled {
            return None;
        }
        if channel.key.is_some() != secure {
            trace!(channel = id, "drop cart: security mode mismatch");
            return None;
        }

        let plain;
        if secure {
            let (nonce, n) = codec::read_var_long(bytes, at).ok()?;
            at += n;
            if bytes.len() < at + 8 {
                return None;
            }
            let tag = &bytes[at..at + 8];
            let ciphertext = &bytes[at + 8..];
            if channel.window.has_seen(nonce) {
                trace!(channel = id, nonce, "drop cart: replay");
                return None;
            }

            let mut ad = Vec::with_capacity(4);
            ad.push(header);
            ad.extend_from_slice(&bytes[1..4]);

            let key = channel.key.as_ref()?;
            plain = aead::open(key, nonce, ciphertext, tag, &ad).ok()?;
            channel.window.mark(nonce);
        } else {
            plain = bytes[at..].to_vec();
        }

        let payload = Self::parse_content(&plain, has_meta, Some(&mut channel.their_meta))?;
        channel.last_seen_ms = now_ms;
        Some(Delivery {
            channel: id,
            payload,
            broadcast,
        })
    }

    /// Split `[VarLong(metaLen) || metaBlob] || payload`, merging the meta
    /// diff into `their_meta` when given.
    fn parse_content(
        content: &[u8],
        has_meta: bool,
        their_meta: Option<&mut MetaMap>,
    ) -> Option<Vec<u8>> {
        let mut at = 0usize;
        if has_meta {
            let (meta_len, n) = codec::read_var_long(content, at).ok()?;
            at += n;
            let meta_len = usize::try_from(meta_len).ok()?;
            let end = at.checked_add(meta_len)?;
            if end > content.len() {
                return None;
            }
            let (diff, _) = codec::read_map(&content[at..end], 0).ok()?;
            if let Some(their_meta) = their_meta {
                for (key, value) in diff {
                    their_meta.insert(key, value);
                }
            }
            at = end;
        }
        Some(content[at..].to_vec())
    }

    /// Remove channels idle past the destroy timeout. Returns the cleared
    /// channel ids.
    pub fn gc(&mut self, now_ms: u64) -> Vec<u32> {
        let timeout = self.config.destroy_timeout_ms;
        if timeout == 0 {
            return Vec::new();
        }
        let stale: Vec<u32> = self
            .channels
            .iter()
            .filter(|(_, channel)| now_ms.saturating_sub(channel.last_seen_ms) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            debug!(channel = id, "garbage collecting idle channel");
            self.channels.remove(id);
        }
        stale
    }
}
