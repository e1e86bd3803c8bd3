//! Session state machine: ephemeral publication, authenticated key switch
//! and teardown, layered over the bundle engine.
//!
//! States move `Idle -> EphemeralPublished -> SwitchPending -> Live ->
//! DestroyPending -> Destroyed`. A switch pins the peer's ephemeral key,
//! exchanges sealed request/response payloads carrying optional static-key
//! possession proofs, and rotates the session key atomically at the next
//! flush boundary so in-flight pre-upgrade bundles remain valid.

use crate::codec;
use crate::error::Error;
use crate::meta::MetaMap;
use crate::packet::{Packet, CONTROL_CHANNEL};
use crate::tunnel::{Tunnel, TunnelConfig};
use rand_core::{CryptoRng, RngCore};
use tracing::{debug, trace};
use weft_crypto::aead::{self, AeadKey, TagLen};
use weft_crypto::constant_time::ct_eq;
use weft_crypto::hash::{hash8, kdf32};
use weft_crypto::x25519::{shared_key, Keypair, PublicKey, SharedSecret};

const CMD_PROBE: u64 = 10;
const CMD_ANNOUNCE: u64 = 11;
const CMD_SWITCH_REQUEST: u64 = 20;
const CMD_SWITCH_RESPONSE: u64 = 21;
const CMD_DISCONNECT: u64 = 1000;

/// KDF label for the switch-exchange temporary key.
const SWITCH_INFO: &[u8] = b"WeftSwitchV1";
/// KDF label for the ephemeral rekey path.
const REKEY_INFO: &[u8] = b"WeftBundleV1";

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Fresh session, nothing published
    Idle,
    /// Own ephemeral announced or probe sent
    EphemeralPublished,
    /// Switch request sent or received, awaiting completion
    SwitchPending,
    /// Keyed and upgraded
    Live,
    /// Teardown requested, draining
    DestroyPending,
    /// Fully drained and wiped
    Destroyed,
}

/// Callbacks fired by [`Session::parse`], [`Session::flush`] and
/// [`Session::update`].
///
/// All methods have no-op defaults; implement the ones the application
/// cares about. `on_switch_accepted` gates the upgrade: returning `false`
/// aborts it and the session stays down.
pub trait SessionHandler {
    /// The session went live.
    fn on_live(&mut self) {}

    /// An application packet arrived.
    fn on_packet(&mut self, packet: Packet) {
        let _ = packet;
    }

    /// A probe arrived.
    fn on_probe(&mut self, data: MetaMap) {
        let _ = data;
    }

    /// An announce arrived, possibly carrying the peer's ephemeral key.
    fn on_announce(&mut self, data: MetaMap, ephemeral: Option<PublicKey>) {
        let _ = (data, ephemeral);
    }

    /// A switch request arrived; `validated` holds the static keys whose
    /// possession proofs checked out. Answer with
    /// [`Session::accept_switch`] to go live.
    fn on_switch_request(
        &mut self,
        code: [u8; 8],
        data: MetaMap,
        their_ephemeral: PublicKey,
        validated: Vec<[u8; 32]>,
    ) {
        let _ = (code, data, their_ephemeral, validated);
    }

    /// The peer confirmed our switch request. Return `true` to complete the
    /// upgrade, `false` to abort it.
    fn on_switch_accepted(&mut self, data: &MetaMap, validated: &[[u8; 32]]) -> bool {
        let _ = (data, validated);
        true
    }

    /// The session disconnected; `local` is true when this side initiated.
    fn on_disconnect(&mut self, local: bool, reason: MetaMap) {
        let _ = (local, reason);
    }

    /// The session drained after a disconnect and was wiped.
    fn on_destroy(&mut self) {}
}

/// A point-to-point session over one bundle engine.
pub struct Session {
    tunnel: Tunnel,
    state: SessionState,
    ephemeral: Option<Keypair>,
    their_ephemeral: Option<PublicKey>,
    intended_ephemeral_hash: Option<[u8; 8]>,
    temp_shared: Option<SharedSecret>,
    last_switch_code: Option<[u8; 8]>,
    secure_x_after_flush: bool,
    destroy_notified: bool,
}

impl Session {
    /// Create a session with the given engine configuration.
    #[must_use]
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            tunnel: Tunnel::new(config),
            state: SessionState::Idle,
            ephemeral: None,
            their_ephemeral: None,
            intended_ephemeral_hash: None,
            temp_shared: None,
            last_switch_code: None,
            secure_x_after_flush: false,
            destroy_notified: false,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the switch completed.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }

    /// Access the underlying bundle engine.
    #[must_use]
    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Mutable access to the underlying bundle engine (windowing, security
    /// and reliability controls).
    pub fn tunnel_mut(&mut self) -> &mut Tunnel {
        &mut self.tunnel
    }

    /// Ensure an ephemeral keypair exists and return its public half.
    pub fn init_ephemeral<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> PublicKey {
        if self.ephemeral.is_none() {
            self.ephemeral = Some(Keypair::generate(rng));
        }
        self.ephemeral
            .as_ref()
            .map(|kp| kp.public)
            .unwrap_or_else(|| PublicKey::from_bytes([0u8; 32]))
    }

    /// Own ephemeral public key, if one exists.
    #[must_use]
    pub fn ephemeral_public(&self) -> Option<PublicKey> {
        self.ephemeral.as_ref().map(|kp| kp.public)
    }

    /// Peer ephemeral public key, if pinned.
    #[must_use]
    pub fn their_ephemeral(&self) -> Option<PublicKey> {
        self.their_ephemeral
    }

    /// BLAKE2b-8 of the peer ephemeral this session's switch request was
    /// bound to.
    #[must_use]
    pub fn intended_ephemeral_hash(&self) -> Option<[u8; 8]> {
        self.intended_ephemeral_hash
    }

    /// Queue an application packet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlChannelReserved`] for channel 0.
    pub fn push(&mut self, packet: Packet) -> Result<(), Error> {
        if packet.channel == CONTROL_CHANNEL {
            return Err(Error::ControlChannelReserved);
        }
        self.tunnel.push(packet);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control operations
    // ------------------------------------------------------------------

    /// Publish a probe carrying a metadata map.
    pub fn probe(&mut self, data: &MetaMap) {
        let mut payload = Vec::new();
        codec::write_var_long(&mut payload, CMD_PROBE);
        codec::write_map(&mut payload, data);

        let mut pkt = Packet::new(payload, CONTROL_CHANNEL);
        pkt.important = false;
        self.tunnel.push(pkt);

        if self.state == SessionState::Idle {
            self.state = SessionState::EphemeralPublished;
        }
    }

    /// Publish an announce: metadata map plus our ephemeral public key.
    pub fn announce<R: RngCore + CryptoRng>(&mut self, data: &MetaMap, rng: &mut R) {
        let public = self.init_ephemeral(rng);

        let mut payload = Vec::new();
        codec::write_var_long(&mut payload, CMD_ANNOUNCE);
        codec::write_map(&mut payload, data);
        payload.extend_from_slice(public.as_bytes());

        let mut pkt = Packet::new(payload, CONTROL_CHANNEL);
        pkt.important = false;
        self.tunnel.push(pkt);

        if self.state == SessionState::Idle {
            self.state = SessionState::EphemeralPublished;
        }
    }

    /// Serialize `data` plus possession proofs for `statics` against the
    /// peer ephemeral.
    fn switch_plaintext(
        data: &MetaMap,
        statics: &[Keypair],
        peer_ephemeral: &PublicKey,
    ) -> Result<Vec<u8>, Error> {
        let mut plaintext = Vec::new();
        codec::write_map(&mut plaintext, data);
        codec::write_var_long(&mut plaintext, statics.len() as u64);
        for keypair in statics {
            let shared = shared_key(&keypair.secret, peer_ephemeral)?;
            plaintext.extend_from_slice(keypair.public.as_bytes());
            plaintext.extend_from_slice(&hash8(shared.as_bytes()));
        }
        Ok(plaintext)
    }

    /// Parse a sealed switch payload: metadata map, then statics proofs
    /// validated against our ephemeral secret.
    fn parse_switch_plaintext(&self, plain: &[u8]) -> Option<(MetaMap, Vec<[u8; 32]>)> {
        let (data, consumed) = codec::read_map(plain, 0).ok()?;
        let mut at = consumed;
        let (count, n) = codec::read_var_long(plain, at).ok()?;
        at += n;

        let ephemeral = self.ephemeral.as_ref()?;
        let mut validated = Vec::new();
        for _ in 0..count {
            if at + 32 + 8 > plain.len() {
                break;
            }
            let mut public = [0u8; 32];
            public.copy_from_slice(&plain[at..at + 32]);
            at += 32;
            let proof = &plain[at..at + 8];
            at += 8;

            let Ok(shared) = shared_key(&ephemeral.secret, &PublicKey::from_bytes(public)) else {
                continue;
            };
            if ct_eq(&hash8(shared.as_bytes()), proof) {
                validated.push(public);
            }
        }
        Some((data, validated))
    }

    /// Initiate a key switch toward a known peer ephemeral, proving
    /// possession of `statics` along the way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the session is Idle or has
    /// only published its ephemeral, and propagates crypto failures.
    pub fn request_switch<R: RngCore + CryptoRng>(
        &mut self,
        data: &MetaMap,
        peer_ephemeral: PublicKey,
        statics: &[Keypair],
        rng: &mut R,
    ) -> Result<(), Error> {
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::EphemeralPublished
        ) {
            return Err(Error::InvalidState);
        }
        self.init_ephemeral(rng);
        let ephemeral = self.ephemeral.as_ref().ok_or(Error::InvalidState)?;

        let mut code = [0u8; 8];
        rng.fill_bytes(&mut code);

        let shared = shared_key(&ephemeral.secret, &peer_ephemeral)?;
        let temp_key = AeadKey::new(kdf32(shared.as_bytes(), SWITCH_INFO)?);

        let plaintext = Self::switch_plaintext(data, statics, &peer_ephemeral)?;
        let sealed = aead::seal(&temp_key, 0, &plaintext, &code, TagLen::Full);

        let mut payload = Vec::new();
        codec::write_var_long(&mut payload, CMD_SWITCH_REQUEST);
        payload.extend_from_slice(&code);
        payload.extend_from_slice(ephemeral.public.as_bytes());
        payload.extend_from_slice(&sealed.ciphertext);
        payload.extend_from_slice(&sealed.tag);

        self.tunnel.push(Packet::new(payload, CONTROL_CHANNEL));

        self.intended_ephemeral_hash = Some(hash8(peer_ephemeral.as_bytes()));
        self.their_ephemeral = Some(peer_ephemeral);
        self.temp_shared = Some(shared);
        self.last_switch_code = Some(code);
        self.state = SessionState::SwitchPending;
        Ok(())
    }

    /// Answer a received switch request, completing the handshake on this
    /// side. The session key is staged and adopted at the next flush
    /// boundary so the response itself still uses pre-upgrade framing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] outside SwitchPending and
    /// [`Error::NoPeerEphemeral`] when no request pinned a temp secret.
    pub fn accept_switch(
        &mut self,
        code: [u8; 8],
        data: &MetaMap,
        statics: &[Keypair],
        handler: &mut dyn SessionHandler,
    ) -> Result<(), Error> {
        if self.state != SessionState::SwitchPending {
            return Err(Error::InvalidState);
        }
        let their_ephemeral = self.their_ephemeral.ok_or(Error::NoPeerEphemeral)?;
        let temp_shared = self.temp_shared.as_ref().ok_or(Error::NoPeerEphemeral)?;

        let temp_key = AeadKey::new(kdf32(temp_shared.as_bytes(), SWITCH_INFO)?);
        let plaintext = Self::switch_plaintext(data, statics, &their_ephemeral)?;
        let sealed = aead::seal(&temp_key, 1, &plaintext, &code, TagLen::Full);

        let mut payload = Vec::new();
        codec::write_var_long(&mut payload, CMD_SWITCH_RESPONSE);
        payload.extend_from_slice(&code);
        payload.extend_from_slice(&sealed.ciphertext);
        payload.extend_from_slice(&sealed.tag);

        self.tunnel.push(Packet::new(payload, CONTROL_CHANNEL));

        let session_key = kdf32(temp_shared.as_bytes(), b"")?;
        self.tunnel.enable_security_after_flush(&session_key)?;

        debug!("switch accepted, session live");
        self.state = SessionState::Live;
        handler.on_live();
        Ok(())
    }

    /// Send a disconnect carrying a reason map and mark the session for
    /// teardown once the outbox and inflight drain.
    pub fn disconnect(&mut self, reason: &MetaMap, handler: &mut dyn SessionHandler) {
        if matches!(
            self.state,
            SessionState::DestroyPending | SessionState::Destroyed
        ) {
            return;
        }
        let mut payload = Vec::new();
        codec::write_var_long(&mut payload, CMD_DISCONNECT);
        codec::write_map(&mut payload, reason);
        self.tunnel.push(Packet::new(payload, CONTROL_CHANNEL));

        self.tunnel.mark_destroy_after_flush();
        self.state = SessionState::DestroyPending;
        handler.on_disconnect(true, reason.clone());
    }

    /// Stage an ephemeral rekey: at the next flush boundary the session key
    /// becomes `KDF(X25519(ephemeral, peer-ephemeral), rekey-label)`.
    pub fn enable_security_x_after_flush(&mut self) {
        self.secure_x_after_flush = true;
    }

    // ------------------------------------------------------------------
    // Wire entry points
    // ------------------------------------------------------------------

    /// Ingest one raw bundle; control packets drive the state machine and
    /// data packets surface through `handler`.
    pub fn parse(&mut self, bundle: &[u8], now_ms: u64, handler: &mut dyn SessionHandler) {
        let packets = self.tunnel.parse(bundle, now_ms);
        for packet in packets {
            if packet.channel == CONTROL_CHANNEL {
                self.handle_control(&packet, handler);
            } else {
                handler.on_packet(packet);
            }
        }
    }

    /// Emit at most one sealed bundle, applying staged rekeys at the flush
    /// boundary and firing `on_destroy` once a teardown drains.
    pub fn flush(&mut self, now_ms: u64, handler: &mut dyn SessionHandler) -> Option<Vec<u8>> {
        let out = self.tunnel.flush(now_ms);

        if self.secure_x_after_flush {
            self.secure_x_after_flush = false;
            self.apply_security_x();
        }

        if self.tunnel.is_destroyed() && !self.destroy_notified {
            self.destroy_notified = true;
            self.state = SessionState::Destroyed;
            self.wipe();
            handler.on_destroy();
        }
        out
    }

    /// Drive timeouts. Emits a synthetic `{0: "Timeout"}` disconnect when
    /// the peer has been silent past the disconnect timeout.
    pub fn update(&mut self, now_ms: u64, handler: &mut dyn SessionHandler) {
        let timeout = self.tunnel.config().disconnect_timeout_ms;
        if timeout == 0
            || matches!(
                self.state,
                SessionState::DestroyPending | SessionState::Destroyed
            )
        {
            return;
        }
        let last_seen = self.tunnel.last_seen_ms();
        if last_seen > 0 && now_ms > last_seen + timeout {
            debug!(now_ms, last_seen, "session timed out");
            let mut reason = MetaMap::new();
            reason.insert(0, b"Timeout".to_vec());
            self.disconnect(&reason, handler);
        }
    }

    // ------------------------------------------------------------------
    // Control dispatch
    // ------------------------------------------------------------------

    fn handle_control(&mut self, packet: &Packet, handler: &mut dyn SessionHandler) {
        let Ok((cmd, at)) = codec::read_var_long(&packet.payload, 0) else {
            return;
        };
        match cmd {
            CMD_PROBE => {
                if let Ok((data, _)) = codec::read_map(&packet.payload, at) {
                    handler.on_probe(data);
                }
            }
            CMD_ANNOUNCE => self.handle_announce(&packet.payload, at, handler),
            CMD_SWITCH_REQUEST => self.handle_switch_request(&packet.payload, at, handler),
            CMD_SWITCH_RESPONSE => self.handle_switch_response(&packet.payload, at, handler),
            CMD_DISCONNECT => {
                let reason = codec::read_map(&packet.payload, at)
                    .map(|(map, _)| map)
                    .unwrap_or_default();
                self.tunnel.mark_destroy_after_flush();
                self.state = SessionState::DestroyPending;
                handler.on_disconnect(false, reason);
            }
            other => trace!(cmd = other, "ignoring unknown control command"),
        }
    }

    fn handle_announce(&mut self, payload: &[u8], at: usize, handler: &mut dyn SessionHandler) {
        let Ok((data, consumed)) = codec::read_map(payload, at) else {
            return;
        };
        let cursor = at + consumed;
        let ephemeral = payload.get(cursor..cursor + 32).map(|bytes| {
            let mut key = [0u8; 32];
            key.copy_from_slice(bytes);
            PublicKey::from_bytes(key)
        });
        if let Some(key) = ephemeral {
            self.their_ephemeral = Some(key);
        }
        handler.on_announce(data, ephemeral);
    }

    fn handle_switch_request(&mut self, payload: &[u8], at: usize, handler: &mut dyn SessionHandler) {
        if matches!(
            self.state,
            SessionState::Live | SessionState::DestroyPending | SessionState::Destroyed
        ) {
            return;
        }
        // 8-byte code + 32-byte ephemeral + at least a 16-byte tag.
        if payload.len() < at + 8 + 32 + 16 {
            return;
        }
        let Some(ephemeral) = self.ephemeral.as_ref() else {
            debug!("switch request before any ephemeral existed, dropping");
            return;
        };

        let mut code = [0u8; 8];
        code.copy_from_slice(&payload[at..at + 8]);
        let mut their_key = [0u8; 32];
        their_key.copy_from_slice(&payload[at + 8..at + 40]);
        let their_ephemeral = PublicKey::from_bytes(their_key);
        let sealed = &payload[at + 40..];

        let Ok(shared) = shared_key(&ephemeral.secret, &their_ephemeral) else {
            return;
        };
        let Ok(temp_key_bytes) = kdf32(shared.as_bytes(), SWITCH_INFO) else {
            return;
        };
        let temp_key = AeadKey::new(temp_key_bytes);

        let split = sealed.len() - 16;
        let Ok(plain) = aead::open(&temp_key, 0, &sealed[..split], &sealed[split..], &code) else {
            trace!("switch request failed to open, dropping");
            return;
        };

        self.their_ephemeral = Some(their_ephemeral);
        self.temp_shared = Some(shared);

        let Some((data, validated)) = self.parse_switch_plaintext(&plain) else {
            return;
        };
        self.state = SessionState::SwitchPending;
        handler.on_switch_request(code, data, their_ephemeral, validated);
    }

    fn handle_switch_response(
        &mut self,
        payload: &[u8],
        at: usize,
        handler: &mut dyn SessionHandler,
    ) {
        if self.state != SessionState::SwitchPending {
            return;
        }
        let (Some(expected_code), Some(temp_shared)) =
            (self.last_switch_code, self.temp_shared.as_ref())
        else {
            return;
        };
        if payload.len() < at + 8 + 16 {
            return;
        }
        let code = &payload[at..at + 8];
        if !ct_eq(code, &expected_code) {
            trace!("switch response code mismatch, dropping");
            return;
        }

        let Ok(temp_key_bytes) = kdf32(temp_shared.as_bytes(), SWITCH_INFO) else {
            return;
        };
        let temp_key = AeadKey::new(temp_key_bytes);

        let sealed = &payload[at + 8..];
        let split = sealed.len() - 16;
        let Ok(plain) = aead::open(&temp_key, 1, &sealed[..split], &sealed[split..], code) else {
            trace!("switch response failed to open, dropping");
            return;
        };

        let Some((data, validated)) = self.parse_switch_plaintext(&plain) else {
            return;
        };
        let Ok(session_key) = kdf32(temp_shared.as_bytes(), b"") else {
            return;
        };

        if handler.on_switch_accepted(&data, &validated) {
            // The acceptor defers its upgrade to the flush that emits the
            // response; on this side nothing is left to send under the old
            // framing, so the key installs immediately.
            if self.tunnel.enable_security(&session_key).is_ok() {
                debug!("switch confirmed, session live");
                self.state = SessionState::Live;
                handler.on_live();
            }
        } else {
            debug!("application rejected switch, staying down");
        }
    }

    fn apply_security_x(&mut self) {
        let (Some(ephemeral), Some(their_ephemeral)) =
            (self.ephemeral.as_ref(), self.their_ephemeral.as_ref())
        else {
            debug!("ephemeral rekey requested without key material, skipping");
            return;
        };
        let Ok(shared) = shared_key(&ephemeral.secret, their_ephemeral) else {
            return;
        };
        let Ok(key) = kdf32(shared.as_bytes(), REKEY_INFO) else {
            return;
        };
        if self.tunnel.enable_security(&key).is_ok() {
            debug!("ephemeral rekey applied");
        }
    }

    /// Wipe handshake secrets after teardown.
    fn wipe(&mut self) {
        self.ephemeral = None;
        self.temp_shared = None;
        self.last_switch_code = None;
        self.intended_ephemeral_hash = None;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(TunnelConfig::default())
    }
}
