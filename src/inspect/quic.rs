//! QUIC Initial packet metadata parser
//!
//! Decodes a single UDP datagram as a QUIC long-header packet (RFC 9000),
//! extracting version, connection id lengths, token length and the declared
//! payload length. Total function: parse failures are reported through the
//! summary's `error` field, never as an error return. No decryption and no
//! integrity validation is attempted.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

/// Metadata extracted from a QUIC Initial datagram.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSummary {
    pub version: u32,
    pub dcid_len: usize,
    pub scid_len: usize,
    pub token_len: usize,
    /// Length field after the token (protected payload length).
    pub declared_length: usize,
    /// Derived from the low two bits of the first byte, plus one.
    pub packet_number_len: usize,
    pub datagram_size: usize,
    pub valid: bool,
    #[serde(default)]
    pub error: String,
}

impl InitialSummary {
    fn fail(mut self, reason: &str) -> Self {
        self.error = reason.to_string();
        self
    }
}

/// Parse a UDP datagram believed to contain a QUIC Initial packet.
pub fn parse_initial(datagram: &[u8]) -> InitialSummary {
    let mut s = InitialSummary {
        datagram_size: datagram.len(),
        ..InitialSummary::default()
    };
    if datagram.len() < 7 {
        return s.fail("too short");
    }

    let mut cur = Cursor::new(datagram);
    // First byte: bit 7 set marks a long header; low two bits encode the
    // packet number length minus one. The 7-byte minimum covers the first
    // byte, the version and the DCID length, so these reads cannot fail.
    let Ok(first) = cur.read_u8() else {
        return s.fail("too short");
    };
    if first & 0x80 == 0 {
        return s.fail("not long header");
    }
    s.packet_number_len = usize::from(first & 0x03) + 1;
    let Ok(version) = cur.read_u32::<BigEndian>() else {
        return s.fail("too short");
    };
    s.version = version;

    let Ok(dcid_len) = cur.read_u8() else {
        return s.fail("too short");
    };
    let dcid_len = usize::from(dcid_len);
    if remaining(&cur) < dcid_len + 1 {
        return s.fail("trunc dcid");
    }
    s.dcid_len = dcid_len;
    cur.set_position(cur.position() + dcid_len as u64);

    let Ok(scid_len) = cur.read_u8() else {
        return s.fail("trunc scid");
    };
    let scid_len = usize::from(scid_len);
    if remaining(&cur) < scid_len {
        return s.fail("trunc scid");
    }
    s.scid_len = scid_len;
    cur.set_position(cur.position() + scid_len as u64);

    if remaining(&cur) == 0 {
        return s.fail("trunc token len");
    }
    let Some(token_len) = read_varint(&mut cur) else {
        return s.fail("bad token varint");
    };
    let token_len = token_len as usize;
    if remaining(&cur) < token_len {
        return s.fail("trunc token");
    }
    s.token_len = token_len;
    cur.set_position(cur.position() + token_len as u64);

    if remaining(&cur) == 0 {
        return s.fail("trunc length");
    }
    let Some(declared) = read_varint(&mut cur) else {
        return s.fail("bad length varint");
    };
    s.declared_length = declared as usize;

    // Remainder holds the packet number and protected payload — skipped.
    s.valid = true;
    s
}

fn remaining(cur: &Cursor<&[u8]>) -> usize {
    cur.get_ref().len().saturating_sub(cur.position() as usize)
}

/// QUIC variable-length integer: the top two bits of the first byte select a
/// 1, 2, 4 or 8 byte encoding; the low six bits are the high value bits.
fn read_varint(cur: &mut Cursor<&[u8]>) -> Option<u64> {
    let first = cur.read_u8().ok()?;
    let len = 1usize << (first >> 6);
    let mut val = u64::from(first & 0x3F);
    for _ in 1..len {
        val = (val << 8) | u64::from(cur.read_u8().ok()?);
    }
    Some(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_short() {
        let s = parse_initial(&[0x80]);
        assert!(!s.valid);
        assert_eq!(s.error, "too short");
        assert_eq!(s.datagram_size, 1);
    }

    #[test]
    fn test_short_header_rejected() {
        let s = parse_initial(&[0x43, 0, 0, 0, 1, 0, 0]);
        assert!(!s.valid);
        assert_eq!(s.error, "not long header");
    }

    #[test]
    fn test_minimal_initial() {
        // 0xC3: long header, pn length bits 0b11 -> 4 bytes.
        let pkt = [
            0xC3, 0, 0, 0, 1, 1, 0x11, 1, 0x22, 0x00, 0x05, 0, 0, 0, 0, 0,
        ];
        let s = parse_initial(&pkt);
        assert!(s.valid, "unexpected failure: {}", s.error);
        assert!(s.error.is_empty());
        assert_eq!(s.version, 1);
        assert_eq!(s.dcid_len, 1);
        assert_eq!(s.scid_len, 1);
        assert_eq!(s.token_len, 0);
        assert_eq!(s.declared_length, 5);
        assert_eq!(s.packet_number_len, 4);
        assert_eq!(s.datagram_size, pkt.len());
    }

    #[test]
    fn test_packet_number_len_range() {
        for bits in 0..=3u8 {
            let pkt = [
                0x80 | bits,
                0,
                0,
                0,
                1,
                0,
                0,
                0x00,
                0x00,
            ];
            let s = parse_initial(&pkt);
            assert_eq!(s.packet_number_len, usize::from(bits) + 1);
            assert!((1..=4).contains(&s.packet_number_len));
        }
    }

    #[test]
    fn test_two_byte_varint_length() {
        // Token varint 0x00, then length as a 2-byte varint 0x41 0x00 = 256.
        let pkt = [0xC0, 0, 0, 0, 1, 0, 0, 0x00, 0x41, 0x00];
        let s = parse_initial(&pkt);
        assert!(s.valid, "unexpected failure: {}", s.error);
        assert_eq!(s.declared_length, 256);
    }

    #[test]
    fn test_truncated_dcid() {
        let pkt = [0xC0, 0, 0, 0, 1, 8, 0x11];
        let s = parse_initial(&pkt);
        assert!(!s.valid);
        assert_eq!(s.error, "trunc dcid");
    }

    #[test]
    fn test_truncated_scid() {
        let pkt = [0xC0, 0, 0, 0, 1, 1, 0x11, 4, 0x22];
        let s = parse_initial(&pkt);
        assert!(!s.valid);
        assert_eq!(s.error, "trunc scid");
    }

    #[test]
    fn test_truncated_token() {
        // Token varint says 4 bytes but only 1 follows.
        let pkt = [0xC0, 0, 0, 0, 1, 1, 0x11, 0, 0x04, 0xAA];
        let s = parse_initial(&pkt);
        assert!(!s.valid);
        assert_eq!(s.error, "trunc token");
    }

    #[test]
    fn test_missing_length_field() {
        let pkt = [0xC0, 0, 0, 0, 1, 1, 0x11, 0, 0x00];
        let s = parse_initial(&pkt);
        assert!(!s.valid);
        assert_eq!(s.error, "trunc length");
    }

    #[test]
    fn test_bad_length_varint() {
        // Length varint prefix declares 4 bytes; only 2 present.
        let pkt = [0xC0, 0, 0, 0, 1, 1, 0x11, 0, 0x00, 0x80, 0x01];
        let s = parse_initial(&pkt);
        assert!(!s.valid);
        assert_eq!(s.error, "bad length varint");
    }
}
