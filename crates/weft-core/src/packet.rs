//! The application-visible message unit and its per-packet wire codec.

use crate::codec;

/// Channel reserved for control traffic (handshake, acks, disconnect).
pub const CONTROL_CHANNEL: u64 = 0;

/// Default data channel; elided from the wire encoding.
pub const DEFAULT_CHANNEL: u64 = 1;

const HDR_FRAG_MASK: u8 = 0b0000_0011;
const HDR_HAS_CHANNEL: u8 = 1 << 2;
const HDR_BYPASS_HOL: u8 = 1 << 3;

/// Position of a packet within a fragmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FragmentStatus {
    /// Complete message, no reassembly needed
    #[default]
    Single = 0,
    /// First fragment
    Start = 1,
    /// Interior fragment
    Middle = 2,
    /// Last fragment; surfaces the reassembled payload
    End = 3,
}

impl FragmentStatus {
    /// Decode from the low two header bits.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & HDR_FRAG_MASK {
            1 => Self::Start,
            2 => Self::Middle,
            3 => Self::End,
            _ => Self::Single,
        }
    }
}

/// One application message unit (possibly a fragment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Message payload bytes
    pub payload: Vec<u8>,
    /// Channel id; 0 is control, 1 is the default data channel
    pub channel: u64,
    /// Reliability requested: retransmit until acknowledged
    pub important: bool,
    /// Skip head-of-line ordering for this packet
    pub bypass_hol: bool,
    /// Message id (serialized only in windowed mode)
    pub id: u64,
    /// Id of the first fragment of this message
    pub fragment_start: u64,
    /// Position within a fragmented message
    pub fragment_status: FragmentStatus,
}

impl Packet {
    /// Create an important packet on the given channel.
    #[must_use]
    pub fn new(payload: Vec<u8>, channel: u64) -> Self {
        Self {
            payload,
            channel,
            important: true,
            bypass_hol: false,
            id: 0,
            fragment_start: 0,
            fragment_status: FragmentStatus::Single,
        }
    }

    /// Serialize into `out`.
    ///
    /// Layout: `header(1)`, `VarLong(id)` when windowed, `VarLong(channel)`
    /// when the channel is not the default, `VarLong(fragment_start)` when
    /// fragmented, then the raw payload.
    pub fn serialize(&self, windowed: bool, out: &mut Vec<u8>) {
        let mut header = self.fragment_status as u8;
        if self.channel != DEFAULT_CHANNEL {
            header |= HDR_HAS_CHANNEL;
        }
        if self.bypass_hol {
            header |= HDR_BYPASS_HOL;
        }
        out.push(header);
        if windowed {
            codec::write_var_long(out, self.id);
        }
        if self.channel != DEFAULT_CHANNEL {
            codec::write_var_long(out, self.channel);
        }
        if self.fragment_status != FragmentStatus::Single {
            codec::write_var_long(out, self.fragment_start);
        }
        out.extend_from_slice(&self.payload);
    }

    /// Serialized size in bytes.
    #[must_use]
    pub fn serialized_len(&self, windowed: bool) -> usize {
        let mut len = 1 + self.payload.len();
        if windowed {
            len += codec::var_long_len(self.id);
        }
        if self.channel != DEFAULT_CHANNEL {
            len += codec::var_long_len(self.channel);
        }
        if self.fragment_status != FragmentStatus::Single {
            len += codec::var_long_len(self.fragment_start);
        }
        len
    }

    /// Parse a serialized packet. Returns `None` on malformed input.
    #[must_use]
    pub fn parse(raw: &[u8], windowed: bool) -> Option<Self> {
        let header = *raw.first()?;
        let mut at = 1usize;

        let fragment_status = FragmentStatus::from_bits(header);
        let has_channel = header & HDR_HAS_CHANNEL != 0;
        let bypass_hol = header & HDR_BYPASS_HOL != 0;

        let id = if windowed {
            let (value, n) = codec::read_var_long(raw, at).ok()?;
            at += n;
            value
        } else {
            0
        };

        let channel = if has_channel {
            let (value, n) = codec::read_var_long(raw, at).ok()?;
            at += n;
            value
        } else {
            DEFAULT_CHANNEL
        };

        let fragment_start = if fragment_status != FragmentStatus::Single {
            let (value, n) = codec::read_var_long(raw, at).ok()?;
            at += n;
            value
        } else {
            0
        };

        Some(Self {
            payload: raw[at..].to_vec(),
            channel,
            important: true,
            bypass_hol,
            id,
            fragment_start,
            fragment_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_default_channel() {
        let pkt = Packet::new(b"hello".to_vec(), DEFAULT_CHANNEL);
        let mut buf = Vec::new();
        pkt.serialize(false, &mut buf);
        // header + payload only: default channel is elided
        assert_eq!(buf.len(), 1 + 5);

        let parsed = Packet::parse(&buf, false).unwrap();
        assert_eq!(parsed.payload, b"hello");
        assert_eq!(parsed.channel, DEFAULT_CHANNEL);
        assert_eq!(parsed.fragment_status, FragmentStatus::Single);
    }

    #[test]
    fn test_roundtrip_windowed_with_channel() {
        let mut pkt = Packet::new(b"data".to_vec(), 9);
        pkt.id = 1234;
        pkt.bypass_hol = true;

        let mut buf = Vec::new();
        pkt.serialize(true, &mut buf);
        let parsed = Packet::parse(&buf, true).unwrap();

        assert_eq!(parsed.id, 1234);
        assert_eq!(parsed.channel, 9);
        assert!(parsed.bypass_hol);
        assert_eq!(parsed.payload, b"data");
    }

    #[test]
    fn test_roundtrip_fragment() {
        let mut pkt = Packet::new(b"chunk".to_vec(), DEFAULT_CHANNEL);
        pkt.id = 7;
        pkt.fragment_start = 7;
        pkt.fragment_status = FragmentStatus::Middle;

        let mut buf = Vec::new();
        pkt.serialize(true, &mut buf);
        let parsed = Packet::parse(&buf, true).unwrap();

        assert_eq!(parsed.fragment_status, FragmentStatus::Middle);
        assert_eq!(parsed.fragment_start, 7);
    }

    #[test]
    fn test_serialized_len_matches() {
        let mut pkt = Packet::new(vec![0u8; 33], 300);
        pkt.id = 1 << 30;
        pkt.fragment_status = FragmentStatus::Start;
        pkt.fragment_start = 1 << 30;

        for windowed in [false, true] {
            let mut buf = Vec::new();
            pkt.serialize(windowed, &mut buf);
            assert_eq!(buf.len(), pkt.serialized_len(windowed));
        }
    }

    #[test]
    fn test_parse_empty_is_none() {
        assert!(Packet::parse(&[], false).is_none());
    }

    #[test]
    fn test_parse_truncated_varlong_is_none() {
        // Windowed header followed by an unterminated id
        assert!(Packet::parse(&[0x00, 0x80], true).is_none());
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let pkt = Packet::new(Vec::new(), DEFAULT_CHANNEL);
        let mut buf = Vec::new();
        pkt.serialize(false, &mut buf);
        let parsed = Packet::parse(&buf, false).unwrap();
        assert!(parsed.payload.is_empty());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_roundtrip(
                payload in prop::collection::vec(any::<u8>(), 0..256),
                channel in 1u64..1_000_000,
                id in any::<u64>(),
                windowed in any::<bool>(),
                bypass in any::<bool>(),
            ) {
                let mut pkt = Packet::new(payload, channel);
                pkt.id = id;
                pkt.bypass_hol = bypass;

                let mut buf = Vec::new();
                pkt.serialize(windowed, &mut buf);
                let parsed = Packet::parse(&buf, windowed).unwrap();

                prop_assert_eq!(parsed.payload, pkt.payload);
                prop_assert_eq!(parsed.channel, channel);
                prop_assert_eq!(parsed.id, if windowed { id } else { 0 });
                prop_assert_eq!(parsed.bypass_hol, bypass);
            }

            #[test]
            fn prop_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..128)) {
                let _ = Packet::parse(&data, true);
                let _ = Packet::parse(&data, false);
            }
        }
    }
}
