//! The bundle engine: outbox packetization, AEAD framing and selective-repeat
//! reliability over an unreliable datagram substrate.
//!
//! The engine is sans-IO and single-owner: callers feed raw datagrams in via
//! [`Tunnel::parse`], queue packets with [`Tunnel::push`] and drain at most
//! one sealed bundle per [`Tunnel::flush`]. Time is observed only through the
//! `now_ms` arguments, so tests can drive a synthetic clock.
//!
//! Wire layout of a bundle (windowed, secure):
//!
//! ```text
//! VarLong(nonce) || ciphertext || tag(8)
//! ```
//!
//! where the decrypted plaintext is
//! `header(1) [VarLong(padLen)] body [zeros(padLen)]` and the body is either
//! one serialized packet (single mode) or `VarLong(len) || packet` entries.

use crate::codec;
use crate::packet::{FragmentStatus, Packet, CONTROL_CHANNEL};
use crate::reassembly::ReassemblyBuffer;
use crate::window::{ReplayWindow, SeqRange, WINDOW_BITS};
use std::collections::VecDeque;
use tracing::{debug, trace};
use weft_crypto::aead::{self, AeadKey, TagLen};

// Bundle header bits. Bit 1 (compressed) is reserved and never emitted.
const HDR_SECURE: u8 = 1 << 0;
const HDR_PADDED: u8 = 1 << 2;
const HDR_SINGLE: u8 = 1 << 3;
const HDR_GLARE: u8 = 1 << 4;

// Control commands consumed by the engine itself.
const CMD_HEARTBEAT: u64 = 0;
const CMD_LEGACY_ACK: u64 = 1;

/// Worst-case per-bundle overhead: header, max nonce VarLong, tag, padding.
fn bundle_overhead(block_size: usize) -> usize {
    1 + 9 + 8 + block_size
}

/// Engine configuration. All fields have defaults; none are required.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Padding granularity in bytes
    pub block_size: usize,
    /// Maximum wire bytes per bundle
    pub max_bundle: usize,
    /// Heartbeat cadence; 0 disables heartbeats and sleep
    pub alive_timeout_ms: u64,
    /// Idle death; 0 disables the timeout
    pub disconnect_timeout_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            block_size: 32,
            max_bundle: 1400,
            alive_timeout_ms: 8_000,
            disconnect_timeout_ms: 20_000,
        }
    }
}

/// A sealed bundle retained for (possible) retransmission.
#[derive(Debug, Clone)]
pub struct InflightBundle {
    /// Bundle id (equals its nonce)
    pub id: u64,
    /// Sealed wire bytes
    pub data: Vec<u8>,
    /// Whether the bundle carries any important packet
    pub important: bool,
}

/// The bundle engine for one point-to-point link.
pub struct Tunnel {
    config: TunnelConfig,

    key: Option<AeadKey>,
    staged_key: Option<AeadKey>,
    is_secure: bool,
    is_windowed: bool,
    is_asleep: bool,

    glare_position: bool,
    glare_locked: bool,

    last_sent_nonce: u64,
    window: ReplayWindow,

    outbox: VecDeque<Packet>,
    inflight: Vec<InflightBundle>,
    non_important: VecDeque<InflightBundle>,
    priority_resend: VecDeque<InflightBundle>,
    resend_position: usize,
    dropped: Vec<u64>,
    reassembly: ReassemblyBuffer,

    last_sent_ms: u64,
    last_heartbeat_ms: u64,
    last_seen_ms: u64,

    destroy_after_flush: bool,
    secure_after_flush: bool,
    window_after_flush: bool,
    destroyed: bool,
}

impl Tunnel {
    /// Create an engine with the given configuration.
    #[must_use]
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            key: None,
            staged_key: None,
            is_secure: false,
            is_windowed: false,
            is_asleep: false,
            glare_position: false,
            glare_locked: false,
            last_sent_nonce: 0,
            window: ReplayWindow::new(),
            outbox: VecDeque::new(),
            inflight: Vec::new(),
            non_important: VecDeque::new(),
            priority_resend: VecDeque::new(),
            resend_position: 0,
            dropped: Vec::new(),
            reassembly: ReassemblyBuffer::new(),
            last_sent_ms: 0,
            last_heartbeat_ms: 0,
            last_seen_ms: 0,
            destroy_after_flush: false,
            secure_after_flush: false,
            window_after_flush: false,
            destroyed: false,
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Configuration and state management
    // ------------------------------------------------------------------

    /// Adopt a 32-byte session key and switch to secure framing.
    ///
    /// Resets nonces, the receive window and the outbox: pre-key traffic
    /// cannot straddle the key boundary.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidKeyLength`] for a non-32-byte key.
    pub fn enable_security(&mut self, key: &[u8]) -> Result<(), crate::Error> {
        if key.len() != 32 {
            return Err(crate::Error::InvalidKeyLength(key.len()));
        }
        let key = AeadKey::from_slice(key)?;
        self.install_key(key);
        Ok(())
    }

    fn install_key(&mut self, key: AeadKey) {
        self.key = Some(key);
        self.is_secure = true;
        self.last_sent_nonce = 0;
        self.window.reset();
        self.outbox.clear();
    }

    /// Stage a key to be adopted at the next flush boundary, so bundles
    /// already sealed keep their framing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidKeyLength`] for a non-32-byte key.
    pub fn enable_security_after_flush(&mut self, key: &[u8]) -> Result<(), crate::Error> {
        if key.len() != 32 {
            return Err(crate::Error::InvalidKeyLength(key.len()));
        }
        self.staged_key = Some(AeadKey::from_slice(key)?);
        self.secure_after_flush = true;
        Ok(())
    }

    /// Enable windowed (reliable) mode immediately.
    pub fn enable_windowing(&mut self) {
        self.is_windowed = true;
        self.last_sent_nonce = 0;
        self.window.reset();
        self.outbox.clear();
    }

    /// Enable windowed mode at the next flush boundary.
    pub fn enable_windowing_after_flush(&mut self) {
        self.window_after_flush = true;
    }

    /// Request teardown once the outbox and all inflight bundles drain.
    pub fn mark_destroy_after_flush(&mut self) {
        self.destroy_after_flush = true;
    }

    /// Whether the engine has fully drained after a destroy request.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Whether secure framing is active.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Whether windowed (reliable) mode is active.
    #[must_use]
    pub fn is_windowed(&self) -> bool {
        self.is_windowed
    }

    /// Whether the link idled out and the engine stopped emitting.
    #[must_use]
    pub fn is_asleep(&self) -> bool {
        self.is_asleep
    }

    /// Milliseconds timestamp of the last parsed bundle.
    #[must_use]
    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms
    }

    /// Number of important bundles awaiting acknowledgement.
    #[must_use]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Ids of important bundles awaiting acknowledgement.
    #[must_use]
    pub fn inflight_ids(&self) -> Vec<u64> {
        self.inflight.iter().map(|b| b.id).collect()
    }

    /// Number of packets queued for packing.
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Queue a packet for the next flush.
    pub fn push(&mut self, packet: Packet) {
        self.outbox.push_back(packet);
    }

    /// Contiguous received ranges for SACK emission.
    #[must_use]
    pub fn received_ranges(&self) -> Vec<SeqRange> {
        self.window.received_ranges()
    }

    /// Remove one important inflight bundle after acknowledgement.
    pub fn remove_inflight(&mut self, id: u64) {
        if let Some(idx) = self.inflight.iter().position(|b| b.id == id) {
            self.inflight.remove(idx);
            if self.resend_position > idx {
                self.resend_position -= 1;
            }
        }
    }

    /// Drop an important inflight bundle without acknowledgement and record
    /// it for the next heartbeat's unavailable list.
    pub fn abandon_inflight(&mut self, id: u64) {
        if self.inflight.iter().any(|b| b.id == id) {
            self.remove_inflight(id);
            self.dropped.push(id);
        }
    }

    /// Reset the resend cursor to the first inflight bundle with id >= `id`.
    pub fn resend_from(&mut self, id: u64) {
        self.resend_position = 0;
        for (idx, bundle) in self.inflight.iter().enumerate() {
            if bundle.id >= id {
                self.resend_position = idx;
                break;
            }
        }
    }

    /// Whether a flush right now would produce output.
    #[must_use]
    pub fn ready_to_send(&self, now_ms: u64) -> bool {
        if self.is_asleep {
            return false;
        }
        !self.non_important.is_empty()
            || !self.priority_resend.is_empty()
            || self.resend_position < self.inflight.len()
            || !self.outbox.is_empty()
            || self.heartbeat_due(now_ms)
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Ingest one raw bundle from the substrate.
    ///
    /// Returns the packets it surfaced (after defragmentation). Malformed,
    /// replayed, mode-mismatched, glare-colliding or unauthenticated bundles
    /// are dropped silently. Channel-0 heartbeat/ACK traffic is consumed by
    /// the engine; everything else is returned to the caller.
    pub fn parse(&mut self, bundle: &[u8], now_ms: u64) -> Vec<Packet> {
        self.touch(now_ms);
        self.last_seen_ms = now_ms;
        self.is_asleep = false;

        let mut at = 0usize;
        let bundle_id = if self.is_windowed {
            match codec::read_var_long(bundle, at) {
                Ok((value, n)) => {
                    at += n;
                    value
                }
                Err(_) => {
                    trace!("drop bundle: malformed nonce");
                    return Vec::new();
                }
            }
        } else {
            self.window.head() + 1
        };

        if self.is_windowed && self.window.has_received(bundle_id) {
            trace!(nonce = bundle_id, "drop bundle: replay");
            return Vec::new();
        }

        if at >= bundle.len() {
            return Vec::new();
        }
        let wire_secure = bundle[at] & 1 == 1;
        if wire_secure != self.is_secure {
            debug!(
                wire_secure,
                local_secure = self.is_secure,
                "drop bundle: security mode mismatch"
            );
            return Vec::new();
        }

        let plain = if self.is_secure {
            let payload = &bundle[at..];
            if payload.len() < 9 {
                return Vec::new();
            }
            let split = payload.len() - 8;
            let mut ciphertext = payload[..split].to_vec();
            let tag = &payload[split..];
            // Undo the wire-level discriminator bit before authenticating.
            ciphertext[0] &= 0xFE;

            let mut ad = Vec::new();
            if self.is_windowed {
                codec::write_var_long(&mut ad, bundle_id);
            }
            let Some(key) = &self.key else {
                return Vec::new();
            };
            match aead::open(key, bundle_id, &ciphertext, tag, &ad) {
                Ok(plain) => plain,
                Err(_) => {
                    trace!(nonce = bundle_id, "drop bundle: authentication failed");
                    return Vec::new();
                }
            }
        } else {
            bundle[at..].to_vec()
        };

        if plain.is_empty() {
            return Vec::new();
        }

        let header = plain[0];
        let padded = header & HDR_PADDED != 0;
        let single = header & HDR_SINGLE != 0;
        let glare = header & HDR_GLARE != 0;

        if self.glare_locked {
            if glare == self.glare_position {
                trace!("drop bundle: glare collision");
                return Vec::new();
            }
        } else {
            self.glare_position = !glare;
            self.glare_locked = true;
        }

        let mut p_at = 1usize;
        let mut end = plain.len();
        if padded {
            let Ok((pad_len, n)) = codec::read_var_long(&plain, p_at) else {
                return Vec::new();
            };
            p_at += n;
            let Ok(pad_len) = usize::try_from(pad_len) else {
                return Vec::new();
            };
            if end - p_at < pad_len {
                return Vec::new();
            }
            end -= pad_len;
        }

        let body = &plain[p_at..end];
        let mut delivered = Vec::new();
        if single {
            if let Some(pkt) = Packet::parse(body, self.is_windowed) {
                Self::accept_packet(
                    &mut self.reassembly,
                    pkt,
                    &mut delivered,
                );
            }
        } else {
            let mut s_at = 0usize;
            while s_at < body.len() {
                let Ok((len, n)) = codec::read_var_long(body, s_at) else {
                    break;
                };
                s_at += n;
                let Ok(len) = usize::try_from(len) else {
                    break;
                };
                let Some(end) = s_at.checked_add(len) else {
                    break;
                };
                if end > body.len() {
                    break;
                }
                if let Some(pkt) = Packet::parse(&body[s_at..end], self.is_windowed) {
                    Self::accept_packet(
                        &mut self.reassembly,
                        pkt,
                        &mut delivered,
                    );
                }
                s_at = end;
            }
        }

        if self.is_windowed {
            self.window.mark_received(bundle_id);
        } else {
            self.window.force_head(bundle_id);
        }

        // Acks and heartbeats stay inside the engine.
        delivered.retain(|pkt| !(pkt.channel == CONTROL_CHANNEL && self.is_engine_control(pkt)));
        delivered
    }

    fn accept_packet(reassembly: &mut ReassemblyBuffer, pkt: Packet, out: &mut Vec<Packet>) {
        if let Some(pkt) = reassembly.offer(pkt) {
            out.push(pkt);
        }
    }

    /// Consume channel-0 commands owned by the engine (heartbeat, legacy
    /// ACK). Returns true when the packet was consumed.
    fn is_engine_control(&mut self, pkt: &Packet) -> bool {
        let Ok((cmd, at)) = codec::read_var_long(&pkt.payload, 0) else {
            // Malformed control packet: swallow it.
            return true;
        };
        match cmd {
            CMD_HEARTBEAT => {
                if self.is_windowed {
                    self.handle_heartbeat(&pkt.payload, at);
                }
                true
            }
            CMD_LEGACY_ACK => {
                if self.is_windowed {
                    self.handle_legacy_ack(&pkt.payload, at);
                }
                true
            }
            _ => false,
        }
    }

    fn read_ranges(payload: &[u8], at: &mut usize) -> Option<Vec<SeqRange>> {
        let (count, n) = codec::read_var_long(payload, *at).ok()?;
        *at += n;
        let mut ranges = Vec::new();
        for _ in 0..count {
            let (from, n) = codec::read_var_long(payload, *at).ok()?;
            *at += n;
            let (to, n) = codec::read_var_long(payload, *at).ok()?;
            *at += n;
            if from <= to {
                ranges.push(SeqRange { from, to });
            }
        }
        Some(ranges)
    }

    fn remove_inflight_range(&mut self, range: SeqRange) {
        let mut idx = 0;
        while idx < self.inflight.len() {
            let id = self.inflight[idx].id;
            if id >= range.from && id <= range.to {
                self.inflight.remove(idx);
                if self.resend_position > idx {
                    self.resend_position -= 1;
                }
            } else {
                idx += 1;
            }
        }
    }

    /// Heartbeat: SACK ranges to clear from inflight, then unavailable
    /// ranges. Unavailable ids still held inflight become priority resends
    /// (the peer lacks them); the rest are written off as received (the peer
    /// abandoned them). The resend cursor restarts either way.
    fn handle_heartbeat(&mut self, payload: &[u8], mut at: usize) {
        let Some(acked) = Self::read_ranges(payload, &mut at) else {
            return;
        };
        for range in acked {
            self.remove_inflight_range(range);
        }
        // The sack told us what the peer holds; restart the stride over
        // whatever is left so gaps retransmit.
        self.resend_position = 0;

        let Some(unavailable) = Self::read_ranges(payload, &mut at) else {
            return;
        };
        if unavailable.is_empty() {
            return;
        }
        for range in &unavailable {
            let mut held = Vec::new();
            for bundle in &self.inflight {
                if bundle.id >= range.from && bundle.id <= range.to {
                    held.push(bundle.id);
                    self.priority_resend.push_back(bundle.clone());
                }
            }
            // Ids we no longer hold are the peer's abandoned bundles: write
            // them off as received. Only the window's reach matters, so the
            // scan is bounded regardless of range width.
            let low = range.from.max(range.to.saturating_sub(WINDOW_BITS - 1));
            for id in low..=range.to {
                if !held.contains(&id) {
                    self.window.mark_received(id);
                }
            }
        }
    }

    /// Legacy ACK: ignored anchor, then SACK ranges.
    fn handle_legacy_ack(&mut self, payload: &[u8], mut at: usize) {
        let Ok((_anchor, n)) = codec::read_var_long(payload, at) else {
            return;
        };
        at += n;
        let Some(acked) = Self::read_ranges(payload, &mut at) else {
            return;
        };
        for range in acked {
            self.remove_inflight_range(range);
        }
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    fn heartbeat_due(&self, now_ms: u64) -> bool {
        if !self.is_windowed || self.config.alive_timeout_ms == 0 {
            return false;
        }
        let interval = self.config.alive_timeout_ms * 2 / 5;
        now_ms > self.last_sent_ms + self.config.alive_timeout_ms
            || now_ms > self.last_heartbeat_ms + interval
    }

    fn maybe_heartbeat(&mut self, now_ms: u64) {
        if !self.heartbeat_due(now_ms) {
            return;
        }
        let mut payload = Vec::new();
        codec::write_var_long(&mut payload, CMD_HEARTBEAT);

        let received = self.window.received_ranges();
        codec::write_var_long(&mut payload, received.len() as u64);
        for range in &received {
            codec::write_var_long(&mut payload, range.from);
            codec::write_var_long(&mut payload, range.to);
        }

        let unavailable: Vec<u64> = self.dropped.drain(..).collect();
        codec::write_var_long(&mut payload, unavailable.len() as u64);
        for id in &unavailable {
            codec::write_var_long(&mut payload, *id);
            codec::write_var_long(&mut payload, *id);
        }

        let mut pkt = Packet::new(payload, CONTROL_CHANNEL);
        pkt.important = false;
        pkt.bypass_hol = true;
        self.outbox.push_front(pkt);
        self.last_heartbeat_ms = now_ms;
    }

    /// Pack the outbox into sealed bundles. Runs until the outbox drains.
    fn build(&mut self) {
        let block = self.config.block_size.max(1);
        let overhead = bundle_overhead(block);
        let available = self.config.max_bundle.saturating_sub(overhead);

        while !self.outbox.is_empty() {
            let (first_len, first_important) = {
                let first = &self.outbox[0];
                (first.serialized_len(self.is_windowed), first.important)
            };

            if first_len > available {
                self.fragment_first(available);
                continue;
            }

            let mut body = Vec::new();
            let mut single = false;
            let mut important = false;
            let mut consumed = 0usize;

            if self.outbox.len() == 1 {
                single = true;
                self.outbox[0].serialize(self.is_windowed, &mut body);
                important = first_important;
                consumed = 1;
            } else {
                for pkt in &self.outbox {
                    let mut ser = Vec::new();
                    pkt.serialize(self.is_windowed, &mut ser);
                    let projected =
                        1 + body.len() + codec::var_long_len(ser.len() as u64) + ser.len() + 5;
                    if consumed > 0 && projected > available {
                        break;
                    }
                    codec::write_var_long(&mut body, ser.len() as u64);
                    body.extend_from_slice(&ser);
                    important |= pkt.important;
                    consumed += 1;
                }
            }
            for _ in 0..consumed {
                self.outbox.pop_front();
            }

            self.seal_bundle(body, single, important, block);
        }
    }

    /// Split the oversized head-of-outbox packet into fragments and unshift
    /// them back, preserving order.
    fn fragment_first(&mut self, available: usize) {
        let Some(packet) = self.outbox.pop_front() else {
            return;
        };
        let frag_size = available.saturating_sub(15).max(1);
        let chunks: Vec<&[u8]> = packet.payload.chunks(frag_size).collect();
        let count = chunks.len();

        let mut fragments: Vec<Packet> = Vec::with_capacity(count);
        for (idx, chunk) in chunks.iter().enumerate() {
            let mut frag = Packet::new(chunk.to_vec(), packet.channel);
            frag.id = packet.id;
            frag.important = packet.important;
            frag.bypass_hol = packet.bypass_hol;
            frag.fragment_start = packet.id;
            frag.fragment_status = if count == 1 {
                FragmentStatus::Single
            } else if idx == 0 {
                FragmentStatus::Start
            } else if idx == count - 1 {
                FragmentStatus::End
            } else {
                FragmentStatus::Middle
            };
            fragments.push(frag);
        }
        for frag in fragments.into_iter().rev() {
            self.outbox.push_front(frag);
        }
    }

    /// Pad, finalize the header, seal and book the bundle as inflight.
    fn seal_bundle(&mut self, body: Vec<u8>, single: bool, important: bool, block: usize) {
        let mut content = Vec::with_capacity(1 + body.len() + block);
        content.push(0);

        let mut padded = false;
        let remainder = (1 + body.len()) % block;
        if remainder != 0 {
            padded = true;
            let pad = block - remainder;
            codec::write_var_long(&mut content, pad as u64);
            content.extend_from_slice(&body);
            content.resize(content.len() + pad, 0);
        } else {
            content.extend_from_slice(&body);
        }

        let mut header = 0u8;
        if self.is_secure {
            header |= HDR_SECURE;
        }
        if padded {
            header |= HDR_PADDED;
        }
        if single {
            header |= HDR_SINGLE;
        }
        if self.glare_position {
            header |= HDR_GLARE;
        }
        content[0] = header;

        self.last_sent_nonce += 1;
        let id = self.last_sent_nonce;

        let mut wire = Vec::new();
        if self.is_windowed {
            codec::write_var_long(&mut wire, id);
        }

        if self.is_secure {
            let Some(key) = &self.key else {
                debug!("secure mode without a key, dropping bundle");
                return;
            };
            // The plaintext header's LSB is 0 on the wire-facing side; the
            // ciphertext's first byte carries the discriminator instead.
            content[0] &= 0xFE;
            let mut ad = Vec::new();
            if self.is_windowed {
                codec::write_var_long(&mut ad, id);
            }
            let sealed = aead::seal(key, id, &content, &ad, TagLen::Short);
            let mut ciphertext = sealed.ciphertext;
            ciphertext[0] |= 1;
            wire.extend_from_slice(&ciphertext);
            wire.extend_from_slice(&sealed.tag);
        } else {
            content[0] &= 0xFE;
            wire.extend_from_slice(&content);
        }

        // Outside windowed mode every bundle is fire-and-forget.
        let important = self.is_windowed && important;
        let bundle = InflightBundle {
            id,
            data: wire,
            important,
        };
        if important {
            self.inflight.push(bundle);
        } else {
            self.non_important.push_back(bundle);
        }
    }

    /// Emit at most one sealed bundle.
    ///
    /// Priority: pending heartbeat (queued into the outbox), fire-and-forget
    /// bundles, NACK-driven priority resends, then the important-inflight
    /// stride cursor. Deferred state transitions (secure/window-after-flush)
    /// apply exactly at the end of the call.
    pub fn flush(&mut self, now_ms: u64) -> Option<Vec<u8>> {
        self.touch(now_ms);
        if self.destroyed || self.is_asleep {
            return None;
        }

        if self.destroy_after_flush
            && self.inflight.is_empty()
            && self.non_important.is_empty()
            && self.priority_resend.is_empty()
            && self.outbox.is_empty()
        {
            self.destroyed = true;
            return None;
        }

        self.maybe_heartbeat(now_ms);
        if !self.outbox.is_empty() {
            self.build();
        }

        let mut out = None;
        if let Some(bundle) = self.non_important.pop_front() {
            out = Some(bundle.data);
        } else if let Some(bundle) = self.priority_resend.pop_front() {
            out = Some(bundle.data);
        } else if self.resend_position < self.inflight.len() {
            out = Some(self.inflight[self.resend_position].data.clone());
            self.resend_position += 1;
        }

        if out.is_some() {
            self.last_sent_ms = now_ms;
        }

        if self.config.alive_timeout_ms > 0
            && now_ms.saturating_sub(self.last_seen_ms) > self.config.alive_timeout_ms
        {
            self.is_asleep = true;
        }

        if self.secure_after_flush {
            self.secure_after_flush = false;
            if let Some(key) = self.staged_key.take() {
                debug!("adopting staged session key");
                self.install_key(key);
            }
        }
        if self.window_after_flush {
            self.window_after_flush = false;
            self.enable_windowing();
        }

        out
    }

    /// First-call clock initialization: a fresh engine adopts the caller's
    /// epoch instead of timing out against 0.
    fn touch(&mut self, now_ms: u64) {
        if self.last_seen_ms == 0 {
            self.last_seen_ms = now_ms;
        }
        if self.last_sent_ms == 0 {
            self.last_sent_ms = now_ms;
        }
        if self.last_heartbeat_ms == 0 {
            self.last_heartbeat_ms = now_ms;
        }
    }
}

impl Default for Tunnel {
    fn default() -> Self {
        Self::new(TunnelConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DEFAULT_CHANNEL;

    fn pair() -> (Tunnel, Tunnel) {
        (Tunnel::default(), Tunnel::default())
    }

    fn push_bytes(tunnel: &mut Tunnel, payload: &[u8]) {
        tunnel.push(Packet::new(payload.to_vec(), DEFAULT_CHANNEL));
    }

    #[test]
    fn test_plaintext_roundtrip() {
        let (mut a, mut b) = pair();
        push_bytes(&mut a, b"hi");

        let wire = a.flush(1).unwrap();
        let delivered = b.parse(&wire, 1);

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, b"hi");
        assert_eq!(delivered[0].channel, DEFAULT_CHANNEL);
        // Non-windowed bundles are fire-and-forget.
        assert_eq!(a.inflight_len(), 0);
    }

    #[test]
    fn test_secure_windowed_roundtrip() {
        let (mut a, mut b) = pair();
        let key = [0x11u8; 32];
        a.enable_windowing();
        b.enable_windowing();
        a.enable_security(&key).unwrap();
        b.enable_security(&key).unwrap();

        push_bytes(&mut a, b"abc");
        let wire = a.flush(1).unwrap();
        // nonce(1) + header(1) + tag(8) at minimum, padded to the block
        assert!(wire.len() >= 1 + 1 + 8);

        let delivered = b.parse(&wire, 1);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, b"abc");
    }

    #[test]
    fn test_replayed_bundle_dropped() {
        let (mut a, mut b) = pair();
        a.enable_windowing();
        b.enable_windowing();

        push_bytes(&mut a, b"once");
        let wire = a.flush(1).unwrap();

        assert_eq!(b.parse(&wire, 1).len(), 1);
        assert!(b.parse(&wire, 2).is_empty());
    }

    #[test]
    fn test_mode_mismatch_dropped() {
        let (mut a, mut b) = pair();
        a.enable_security(&[0x22u8; 32]).unwrap();
        // b stays plaintext

        push_bytes(&mut a, b"secret");
        let wire = a.flush(1).unwrap();
        assert!(b.parse(&wire, 1).is_empty());
    }

    #[test]
    fn test_corrupted_tag_dropped_and_window_untouched() {
        let (mut a, mut b) = pair();
        let key = [0x33u8; 32];
        a.enable_windowing();
        b.enable_windowing();
        a.enable_security(&key).unwrap();
        b.enable_security(&key).unwrap();

        push_bytes(&mut a, b"payload");
        let mut wire = a.flush(1).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;

        assert!(b.parse(&wire, 1).is_empty());
        // The nonce was not consumed: the intact bundle still delivers.
        wire[last] ^= 0xFF;
        assert_eq!(b.parse(&wire, 2).len(), 1);
    }

    #[test]
    fn test_multi_packet_bundle_order() {
        let (mut a, mut b) = pair();
        a.enable_windowing();
        b.enable_windowing();

        for payload in [b"one".as_slice(), b"two", b"three"] {
            push_bytes(&mut a, payload);
        }
        let wire = a.flush(1).unwrap();
        let delivered = b.parse(&wire, 1);

        let payloads: Vec<&[u8]> = delivered.iter().map(|p| p.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"one".as_slice(), b"two", b"three"]);
    }

    #[test]
    fn test_padding_to_block_size() {
        let mut a = Tunnel::default();
        push_bytes(&mut a, b"x");
        let wire = a.flush(1).unwrap();
        // Plaintext non-windowed: content is header + padLen + body + zeros.
        // 1 (header) + 1 (padLen varlong) + 3 (packet) + pad
        assert!(wire.len() > 1 + 3);
    }

    #[test]
    fn test_fragmentation_and_reassembly() {
        let config = TunnelConfig {
            block_size: 32,
            max_bundle: 80,
            ..TunnelConfig::default()
        };
        let mut a = Tunnel::new(config.clone());
        let mut b = Tunnel::new(config);
        a.enable_windowing();
        b.enable_windowing();

        let big = vec![0xABu8; 500];
        let mut pkt = Packet::new(big.clone(), DEFAULT_CHANNEL);
        pkt.id = 77;
        a.push(pkt);

        let mut bundles = Vec::new();
        while let Some(wire) = a.flush(1) {
            bundles.push(wire);
            if bundles.len() > 64 {
                break;
            }
        }
        assert!(bundles.len() >= 8, "expected >= 8 bundles, got {}", bundles.len());

        let mut delivered = Vec::new();
        for wire in &bundles {
            delivered.extend(b.parse(wire, 1));
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, big);
        assert_eq!(delivered[0].id, 77);
    }

    #[test]
    fn test_important_bundles_stay_inflight_until_acked() {
        let (mut a, mut _b) = pair();
        a.enable_windowing();

        push_bytes(&mut a, b"reliable");
        let first = a.flush(1).unwrap();
        assert_eq!(a.inflight_len(), 1);

        // The stride cursor retransmits the same bundle on a later flush
        // after the cursor resets.
        a.resend_from(0);
        let again = a.flush(2).unwrap();
        assert_eq!(first, again);

        a.remove_inflight(1);
        assert_eq!(a.inflight_len(), 0);
    }

    #[test]
    fn test_heartbeat_carries_sack_and_clears_inflight() {
        let config = TunnelConfig {
            alive_timeout_ms: 100,
            ..TunnelConfig::default()
        };
        let mut a = Tunnel::new(config.clone());
        let mut b = Tunnel::new(config);
        a.enable_windowing();
        b.enable_windowing();

        push_bytes(&mut a, b"data");
        let wire = a.flush(1).unwrap();
        assert_eq!(b.parse(&wire, 1).len(), 1);
        assert_eq!(a.inflight_len(), 1);

        // b's heartbeat fires once its interval elapses.
        let hb = b.flush(60).expect("heartbeat due");
        assert!(a.parse(&hb, 60).is_empty());
        assert_eq!(a.inflight_len(), 0);
    }

    #[test]
    fn test_abandoned_bundle_advertised_and_written_off() {
        let config = TunnelConfig {
            alive_timeout_ms: 100,
            ..TunnelConfig::default()
        };
        let mut a = Tunnel::new(config.clone());
        let mut b = Tunnel::new(config);
        a.enable_windowing();
        b.enable_windowing();

        // a seals bundles 1 and 2 but only delivers 2.
        push_bytes(&mut a, b"lost");
        let _lost = a.flush(1).unwrap();
        push_bytes(&mut a, b"arrives");
        // The cursor walks on to bundle 2.
        let wire2 = a.flush(2).unwrap();
        b.parse(&wire2, 2);
        assert!(!b.window.has_received(1));

        // a gives up on bundle 1; its next heartbeat says so.
        a.abandon_inflight(1);
        let hb = a.flush(60).expect("heartbeat due");
        b.parse(&hb, 60);
        assert!(b.window.has_received(1));
    }

    #[test]
    fn test_unavailable_ranges_trigger_priority_resend() {
        let (mut a, mut b) = pair();
        a.enable_windowing();
        b.enable_windowing();

        push_bytes(&mut a, b"missing");
        let _wire = a.flush(1).unwrap();
        assert_eq!(a.inflight_ids(), vec![1]);

        // Hand-built heartbeat from the peer: nothing acked, id 1 missing.
        let mut payload = Vec::new();
        codec::write_var_long(&mut payload, CMD_HEARTBEAT);
        codec::write_var_long(&mut payload, 0); // no sack ranges
        codec::write_var_long(&mut payload, 1); // one unavailable range
        codec::write_var_long(&mut payload, 1);
        codec::write_var_long(&mut payload, 1);
        let mut hb = Packet::new(payload, CONTROL_CHANNEL);
        hb.important = false;
        b.push(hb);
        let hb_wire = b.flush(1).unwrap();

        assert!(a.parse(&hb_wire, 2).is_empty());
        assert_eq!(a.priority_resend.len(), 1);

        // Priority resend outranks the stride cursor.
        let resent = a.flush(3).unwrap();
        let delivered = b.parse(&resent, 3);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, b"missing");
    }

    #[test]
    fn test_glare_lock_drops_equal_position() {
        let (mut a, mut b) = pair();

        // a -> b locks b to the opposite position.
        push_bytes(&mut a, b"first");
        let wire = a.flush(1).unwrap();
        assert_eq!(b.parse(&wire, 1).len(), 1);

        // b -> a now carries b's locked position; a locks opposite.
        push_bytes(&mut b, b"reply");
        let wire = b.flush(2).unwrap();
        assert_eq!(a.parse(&wire, 2).len(), 1);

        // Traffic keeps flowing both ways afterwards.
        push_bytes(&mut a, b"more");
        let wire = a.flush(3).unwrap();
        assert_eq!(b.parse(&wire, 3).len(), 1);
    }

    #[test]
    fn test_asleep_after_silence_wakes_on_parse() {
        let config = TunnelConfig {
            alive_timeout_ms: 50,
            ..TunnelConfig::default()
        };
        let mut a = Tunnel::new(config.clone());
        a.enable_windowing();

        push_bytes(&mut a, b"before sleep");
        let _ = a.flush(1);
        // Far past the alive timeout with no inbound traffic.
        let _ = a.flush(200);
        assert!(a.is_asleep());
        assert!(a.flush(201).is_none());

        let mut b = Tunnel::new(config);
        b.enable_windowing();
        push_bytes(&mut b, b"wake up");
        let wire = b.flush(1).unwrap();
        a.parse(&wire, 250);
        assert!(!a.is_asleep());
    }

    #[test]
    fn test_destroy_after_flush_waits_for_drain() {
        let mut a = Tunnel::default();
        a.enable_windowing();

        push_bytes(&mut a, b"last words");
        a.mark_destroy_after_flush();

        assert!(!a.is_destroyed());
        let _wire = a.flush(1).unwrap();
        assert!(!a.is_destroyed()); // important bundle still inflight

        a.remove_inflight(1);
        assert!(a.flush(2).is_none());
        assert!(a.is_destroyed());
    }

    #[test]
    fn test_enable_security_rejects_bad_key_length() {
        let mut a = Tunnel::default();
        assert!(a.enable_security(&[0u8; 16]).is_err());
        assert!(!a.is_secure());
    }

    #[test]
    fn test_staged_security_applies_at_flush_boundary() {
        let mut a = Tunnel::default();
        a.enable_security_after_flush(&[0x44u8; 32]).unwrap();
        assert!(!a.is_secure());
        let _ = a.flush(1);
        assert!(a.is_secure());
    }

    #[test]
    fn test_malformed_bundles_never_panic() {
        let (mut a, _) = pair();
        a.enable_windowing();
        for len in 0..64 {
            let junk = vec![0xFFu8; len];
            let _ = a.parse(&junk, 1);
        }
        let mut b = Tunnel::default();
        b.enable_security(&[0u8; 32]).unwrap();
        for len in 0..64 {
            let junk = vec![0x01u8; len];
            let _ = b.parse(&junk, 1);
        }
    }
}
