//! End-to-end switch handshake scenarios: shared-key agreement, static-key
//! possession proofs and atomic key rotation at the flush boundary.

use rand_core::OsRng;
use weft_core::{
    MetaMap, Packet, Session, SessionHandler, TunnelConfig, DEFAULT_CHANNEL,
};
use weft_crypto::x25519::{Keypair, PublicKey};

#[derive(Default)]
struct Events {
    live: usize,
    packets: Vec<Vec<u8>>,
    requests: Vec<([u8; 8], Vec<[u8; 32]>)>,
    accepted_statics: Vec<Vec<[u8; 32]>>,
}

impl SessionHandler for Events {
    fn on_live(&mut self) {
        self.live += 1;
    }
    fn on_packet(&mut self, packet: Packet) {
        self.packets.push(packet.payload);
    }
    fn on_switch_request(
        &mut self,
        code: [u8; 8],
        _data: MetaMap,
        _their_ephemeral: PublicKey,
        validated: Vec<[u8; 32]>,
    ) {
        self.requests.push((code, validated));
    }
    fn on_switch_accepted(&mut self, _data: &MetaMap, validated: &[[u8; 32]]) -> bool {
        self.accepted_statics.push(validated.to_vec());
        true
    }
}

fn shuttle(from: &mut Session, from_events: &mut Events, to: &mut Session, to_events: &mut Events, now: u64) {
    for _ in 0..64 {
        let Some(wire) = from.flush(now, from_events) else {
            break;
        };
        to.parse(&wire, now, to_events);
    }
}

/// Run announce + switch-request + accept until both sides are live.
fn handshake(
    a: &mut Session,
    ea: &mut Events,
    b: &mut Session,
    eb: &mut Events,
    a_statics: &[Keypair],
    b_statics: &[Keypair],
) {
    b.announce(&MetaMap::new(), &mut OsRng);
    shuttle(b, eb, a, ea, 1);
    let b_eph = a.their_ephemeral().expect("announce carried ephemeral");

    a.request_switch(&MetaMap::new(), b_eph, a_statics, &mut OsRng)
        .unwrap();
    shuttle(a, ea, b, eb, 2);

    let (code, _) = eb.requests.last().cloned().expect("switch request seen");
    b.accept_switch(code, &MetaMap::new(), b_statics, eb).unwrap();
    shuttle(b, eb, a, ea, 3);
}

#[test]
fn s5_switch_handshake_derives_shared_key() {
    let mut a = Session::default();
    let mut b = Session::default();
    let (mut ea, mut eb) = (Events::default(), Events::default());

    handshake(&mut a, &mut ea, &mut b, &mut eb, &[], &[]);

    assert!(a.is_live());
    assert!(b.is_live());
    assert_eq!(ea.live, 1);
    assert_eq!(eb.live, 1);
    assert!(a.tunnel().is_secure());
    assert!(b.tunnel().is_secure());

    // Subsequent bundles authenticate under the shared key, both ways.
    a.push(Packet::new(b"a->b".to_vec(), DEFAULT_CHANNEL)).unwrap();
    shuttle(&mut a, &mut ea, &mut b, &mut eb, 4);
    assert_eq!(eb.packets, vec![b"a->b".to_vec()]);

    b.push(Packet::new(b"b->a".to_vec(), DEFAULT_CHANNEL)).unwrap();
    shuttle(&mut b, &mut eb, &mut a, &mut ea, 5);
    assert_eq!(ea.packets, vec![b"b->a".to_vec()]);
}

#[test]
fn s6_proofed_statics_validated_on_both_sides() {
    let mut a = Session::default();
    let mut b = Session::default();
    let (mut ea, mut eb) = (Events::default(), Events::default());

    let s1 = Keypair::generate(&mut OsRng);
    let s2 = Keypair::generate(&mut OsRng);
    let s3 = Keypair::generate(&mut OsRng);

    handshake(
        &mut a,
        &mut ea,
        &mut b,
        &mut eb,
        &[s1.clone(), s2.clone()],
        &[s3.clone()],
    );

    // B validated A's statics from the request.
    let (_, validated) = eb.requests[0].clone();
    assert_eq!(validated, vec![*s1.public.as_bytes(), *s2.public.as_bytes()]);

    // A validated B's statics from the response.
    assert_eq!(ea.accepted_statics, vec![vec![*s3.public.as_bytes()]]);
}

#[test]
fn atomic_rotation_pre_upgrade_bundle_still_readable() {
    let mut a = Session::default();
    let mut b = Session::default();
    let (mut ea, mut eb) = (Events::default(), Events::default());

    b.announce(&MetaMap::new(), &mut OsRng);
    shuttle(&mut b, &mut eb, &mut a, &mut ea, 1);
    let b_eph = a.their_ephemeral().unwrap();

    a.request_switch(&MetaMap::new(), b_eph, &[], &mut OsRng)
        .unwrap();
    shuttle(&mut a, &mut ea, &mut b, &mut eb, 2);
    let (code, _) = eb.requests[0].clone();

    // b queues application data *before* accepting: it rides out under the
    // pre-upgrade framing together with the switch response and must still
    // be readable by a.
    b.push(Packet::new(b"before upgrade".to_vec(), DEFAULT_CHANNEL))
        .unwrap();
    b.accept_switch(code, &MetaMap::new(), &[], &mut eb).unwrap();
    shuttle(&mut b, &mut eb, &mut a, &mut ea, 3);

    assert!(a.is_live());
    assert!(ea.packets.contains(&b"before upgrade".to_vec()));

    // The first bundle after the switch uses the new key on both sides.
    assert!(a.tunnel().is_secure());
    assert!(b.tunnel().is_secure());
    b.push(Packet::new(b"after upgrade".to_vec(), DEFAULT_CHANNEL))
        .unwrap();
    shuttle(&mut b, &mut eb, &mut a, &mut ea, 4);
    assert!(ea.packets.contains(&b"after upgrade".to_vec()));

    a.push(Packet::new(b"echo".to_vec(), DEFAULT_CHANNEL)).unwrap();
    shuttle(&mut a, &mut ea, &mut b, &mut eb, 5);
    assert!(eb.packets.contains(&b"echo".to_vec()));
}

#[test]
fn switch_works_over_windowed_engines() {
    let mut a = Session::new(TunnelConfig {
        alive_timeout_ms: 0,
        ..TunnelConfig::default()
    });
    let mut b = Session::new(TunnelConfig {
        alive_timeout_ms: 0,
        ..TunnelConfig::default()
    });
    a.tunnel_mut().enable_windowing();
    b.tunnel_mut().enable_windowing();
    let (mut ea, mut eb) = (Events::default(), Events::default());

    handshake(&mut a, &mut ea, &mut b, &mut eb, &[], &[]);
    assert!(a.is_live() && b.is_live());

    a.push(Packet::new(b"windowed+secure".to_vec(), DEFAULT_CHANNEL))
        .unwrap();
    shuttle(&mut a, &mut ea, &mut b, &mut eb, 6);
    assert_eq!(eb.packets, vec![b"windowed+secure".to_vec()]);
}
