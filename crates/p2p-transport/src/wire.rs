//! # P2P Wire Format
//!
//! Fixed-size header, byte-stuffed content, fixed-size checksum footer.
//!
//! ## Header (13 bytes, network byte order)
//!
//! ```text
//!  0        1        2        3                                 11       13
//! +--------+--------+--------+---------------------------------+--------+
//! |  0x7E  |  Prio  | Flags  |      Sequence Number (64)       | Len 16 |
//! +--------+--------+--------+---------------------------------+--------+
//! ```
//!
//! Flags: bit 0 continuation, bit 1 link init, bit 2 requires ack.
//!
//! ## Content and footer
//!
//! A content or footer byte equal to [`START_TOKEN`] is followed on the wire
//! by [`ESCAPE_TOKEN`]. The header `length` counts stuffed content bytes. The
//! footer is a CRC-16/CCITT-FALSE over the canonical header and the stuffed
//! content; its escape bytes do not count toward [`CHECKSUM_LEN`].
//!
//! Header fields are never stuffed. A sequence number or length byte that
//! happens to equal [`START_TOKEN`] makes the receiver resynchronize on it,
//! which keeps the header a fixed size on the wire. The send side therefore
//! never emits such a header: sequence numbers skip values containing a
//! reserved byte ([`next_clear_sequence`]) and lengths containing one are
//! refused at staging or avoided at preemption ([`is_clear_length`]).

use bytes::{Buf, BufMut};
use std::fmt;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Marks the first byte of every frame.
pub const START_TOKEN: u8 = 0x7E;

/// Follows a literal [`START_TOKEN`] value inside content or footer.
pub const ESCAPE_TOKEN: u8 = 0x7D;

/// Header size: 1 (start) + 1 (priority) + 1 (flags) + 8 (sequence) + 2 (length).
pub const HEADER_LEN: usize = 13;

/// Decoded footer size (checksum only).
pub const CHECKSUM_LEN: usize = 2;

/// Footer size on the wire when both checksum bytes need stuffing.
pub const MAX_FOOTER_WIRE_LEN: usize = 2 * CHECKSUM_LEN;

/// Largest stuffed content the 16-bit length field can describe.
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

const FLAG_CONTINUATION: u8 = 0b001;
const FLAG_INIT: u8 = 0b010;
const FLAG_REQUIRES_ACK: u8 = 0b100;

// ─── Priority ────────────────────────────────────────────────────────────────

/// Packet priority level. Lower value wins the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Link control and time-critical commands.
    High = 0,
    /// Replies and regular commands.
    Medium = 1,
    /// Bulk telemetry.
    Low = 2,
}

impl Priority {
    /// Number of priority levels.
    pub const LEVELS: usize = 3;

    /// All levels, highest first.
    pub const ALL: [Priority; Priority::LEVELS] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Priority::High),
            1 => Some(Priority::Medium),
            2 => Some(Priority::Low),
            _ => None,
        }
    }

    /// Index into per-priority tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(name)
    }
}

// ─── Packet Header ──────────────────────────────────────────────────────────

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub priority: Priority,
    /// Monotonic per priority, reused verbatim by retransmissions.
    pub sequence_number: u64,
    /// Stuffed content length, or the unsent remainder on a continuation.
    pub length: u16,
    /// This frame resumes an interrupted send of the same packet.
    pub is_continuation: bool,
    /// Link (re)establishment packet with a random sequence number.
    pub is_init: bool,
    /// Delivery counts toward the reliable-packets statistic.
    pub requires_ack: bool,
}

impl PacketHeader {
    /// Create a fresh header. The length is filled in when content is staged.
    pub fn new(priority: Priority, sequence_number: u64) -> Self {
        PacketHeader {
            priority,
            sequence_number,
            length: 0,
            is_continuation: false,
            is_init: false,
            requires_ack: false,
        }
    }

    /// Mark as a link (re)initialization packet.
    pub fn with_init(mut self) -> Self {
        self.is_init = true;
        self
    }

    /// Mark as requiring acknowledgment.
    pub fn with_requires_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_continuation {
            flags |= FLAG_CONTINUATION;
        }
        if self.is_init {
            flags |= FLAG_INIT;
        }
        if self.requires_ack {
            flags |= FLAG_REQUIRES_ACK;
        }
        flags
    }

    /// Encode the header, start token included.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(START_TOKEN);
        buf.put_u8(self.priority as u8);
        buf.put_u8(self.flags());
        buf.put_u64(self.sequence_number);
        buf.put_u16(self.length);
    }

    /// Encode into a fixed array, ready to be written out.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }

    /// Decode a header. Returns `None` on a short buffer, a missing start
    /// token or an out-of-range priority.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < HEADER_LEN {
            return None;
        }
        if buf.get_u8() != START_TOKEN {
            return None;
        }
        let priority = Priority::from_byte(buf.get_u8())?;
        let flags = buf.get_u8();
        let sequence_number = buf.get_u64();
        let length = buf.get_u16();

        Some(PacketHeader {
            priority,
            sequence_number,
            length,
            is_continuation: flags & FLAG_CONTINUATION != 0,
            is_init: flags & FLAG_INIT != 0,
            requires_ack: flags & FLAG_REQUIRES_ACK != 0,
        })
    }
}

// ─── Header Field Values ────────────────────────────────────────────────────

/// Whether `bytes` contains [`START_TOKEN`] or [`ESCAPE_TOKEN`].
pub fn has_reserved_byte(bytes: &[u8]) -> bool {
    bytes.iter().any(|&b| b == START_TOKEN || b == ESCAPE_TOKEN)
}

/// Smallest sequence number at or above `seq` whose big-endian bytes hold
/// no reserved token.
pub fn next_clear_sequence(mut seq: u64) -> u64 {
    loop {
        let Some(i) = seq
            .to_be_bytes()
            .iter()
            .position(|&b| b == START_TOKEN || b == ESCAPE_TOKEN)
        else {
            return seq;
        };
        // Bump the offending byte and clear everything below it. The byte is
        // below 0xFF, so this never carries out of the top.
        let shift = 8 * (7 - i) as u32;
        seq = ((seq >> shift) + 1) << shift;
    }
}

/// Whether a header `length` of `len` stays clear of the reserved tokens.
pub fn is_clear_length(len: usize) -> bool {
    u16::try_from(len).is_ok_and(|len| !has_reserved_byte(&len.to_be_bytes()))
}

// ─── Checksum ───────────────────────────────────────────────────────────────

/// Incremental CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF).
#[derive(Debug, Clone, Copy)]
pub struct Crc16(u16);

impl Crc16 {
    pub fn new() -> Self {
        Crc16(0xFFFF)
    }

    pub fn update(mut self, bytes: &[u8]) -> Self {
        for &b in bytes {
            self.0 ^= (b as u16) << 8;
            for _ in 0..8 {
                if self.0 & 0x8000 != 0 {
                    self.0 = (self.0 << 1) ^ 0x1021;
                } else {
                    self.0 <<= 1;
                }
            }
        }
        self
    }

    pub fn finish(self) -> u16 {
        self.0
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum carried in the footer.
///
/// Covers the canonical header (continuation cleared, full stuffed length)
/// so that a packet resumed after preemption still verifies.
pub fn packet_checksum(header: &PacketHeader, stuffed_content: &[u8]) -> u16 {
    let mut canonical = *header;
    canonical.is_continuation = false;
    canonical.length = stuffed_content.len() as u16;
    Crc16::new()
        .update(&canonical.to_bytes())
        .update(stuffed_content)
        .finish()
}

// ─── Byte Stuffing ──────────────────────────────────────────────────────────

/// Wire size of `payload` once stuffed.
pub fn stuffed_len(payload: &[u8]) -> usize {
    payload.len() + payload.iter().filter(|&&b| b == START_TOKEN).count()
}

/// Stuff `buf[..len]` in place, growing toward the end of `buf`.
///
/// Returns the stuffed length, or `None` if it does not fit in `buf`.
pub fn stuff_in_place(buf: &mut [u8], len: usize) -> Option<usize> {
    let stuffed = stuffed_len(&buf[..len]);
    if stuffed > buf.len() {
        return None;
    }
    let mut write = stuffed;
    for read in (0..len).rev() {
        let byte = buf[read];
        if byte == START_TOKEN {
            write -= 1;
            buf[write] = ESCAPE_TOKEN;
        }
        write -= 1;
        buf[write] = byte;
    }
    Some(stuffed)
}

/// Undo [`stuff_in_place`]. Returns `None` on a start token that is not
/// followed by an escape token.
pub fn unstuff_in_place(buf: &mut [u8]) -> Option<usize> {
    let mut write = 0;
    let mut read = 0;
    while read < buf.len() {
        let byte = buf[read];
        buf[write] = byte;
        write += 1;
        read += 1;
        if byte == START_TOKEN {
            if buf.get(read) != Some(&ESCAPE_TOKEN) {
                return None;
            }
            read += 1;
        }
    }
    Some(write)
}

/// Stuff a checksum into its wire form. Returns the number of bytes used.
pub fn encode_footer(checksum: u16, out: &mut [u8; MAX_FOOTER_WIRE_LEN]) -> usize {
    let mut len = 0;
    for byte in checksum.to_be_bytes() {
        out[len] = byte;
        len += 1;
        if byte == START_TOKEN {
            out[len] = ESCAPE_TOKEN;
            len += 1;
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = PacketHeader {
            priority: Priority::Medium,
            sequence_number: 0x0102_0304_0506_0708,
            length: 0x0A0B,
            is_continuation: true,
            is_init: false,
            requires_ack: true,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], START_TOKEN);
        assert_eq!(bytes[1], 1);
        assert_eq!(bytes[2], FLAG_CONTINUATION | FLAG_REQUIRES_ACK);
        assert_eq!(&bytes[3..11], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[11..13], &[0x0A, 0x0B]);

        let decoded = PacketHeader::decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_rejects_bad_priority() {
        let mut bytes = PacketHeader::new(Priority::Low, 9).to_bytes();
        bytes[1] = Priority::LEVELS as u8;
        assert!(PacketHeader::decode(&mut &bytes[..]).is_none());
    }

    #[test]
    fn header_rejects_short_buffer() {
        let bytes = PacketHeader::new(Priority::Low, 9).to_bytes();
        assert!(PacketHeader::decode(&mut &bytes[..HEADER_LEN - 1]).is_none());
    }

    #[test]
    fn priority_and_flag_bytes_never_collide_with_tokens() {
        for priority in Priority::ALL {
            assert_ne!(priority as u8, START_TOKEN);
            assert_ne!(priority as u8, ESCAPE_TOKEN);
        }
        for flags in 0..=(FLAG_CONTINUATION | FLAG_INIT | FLAG_REQUIRES_ACK) {
            assert_ne!(flags, START_TOKEN);
            assert_ne!(flags, ESCAPE_TOKEN);
        }
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::Low.index(), 2);
    }

    #[test]
    fn clear_sequences_skip_reserved_bytes() {
        assert_eq!(next_clear_sequence(0), 0);
        assert_eq!(next_clear_sequence(124), 124);
        assert_eq!(next_clear_sequence(125), 127);
        assert_eq!(next_clear_sequence(126), 127);
        assert_eq!(next_clear_sequence(0x7D00), 0x7F00);
        assert_eq!(next_clear_sequence(0x7E_7D12), 0x7F_0000);
        assert_eq!(next_clear_sequence(0x7D << 56), 0x7F << 56);
        assert_eq!(next_clear_sequence(u64::MAX), u64::MAX);
        for seq in 0..2048u64 {
            let clear = next_clear_sequence(seq);
            assert!(clear >= seq);
            assert!(!has_reserved_byte(&clear.to_be_bytes()));
        }
    }

    #[test]
    fn clear_lengths() {
        assert!(is_clear_length(0));
        assert!(is_clear_length(124));
        assert!(!is_clear_length(125));
        assert!(!is_clear_length(126));
        assert!(is_clear_length(127));
        assert!(!is_clear_length(0x7E01));
        assert!(!is_clear_length(0x1_0000));
    }

    #[test]
    fn crc16_check_value() {
        assert_eq!(Crc16::new().update(b"123456789").finish(), 0x29B1);
    }

    #[test]
    fn checksum_ignores_continuation_rewrite() {
        let content = [1u8, 2, 3, 4, 5];
        let header = PacketHeader::new(Priority::High, 77);
        let fresh = packet_checksum(&header, &content);

        let mut resumed = header;
        resumed.is_continuation = true;
        resumed.length = 2;
        assert_eq!(packet_checksum(&resumed, &content), fresh);
    }

    #[test]
    fn start_token_is_stuffed() {
        let mut buf = [0u8; 4];
        buf[0] = START_TOKEN;
        let len = stuff_in_place(&mut buf, 1).unwrap();
        assert_eq!(&buf[..len], &[START_TOKEN, ESCAPE_TOKEN]);

        let len = unstuff_in_place(&mut buf[..len]).unwrap();
        assert_eq!(&buf[..len], &[START_TOKEN]);
    }

    #[test]
    fn stuffing_keeps_lone_escape_bytes() {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&[ESCAPE_TOKEN, START_TOKEN, 0x00, START_TOKEN]);
        let len = stuff_in_place(&mut buf, 4).unwrap();
        assert_eq!(
            &buf[..len],
            &[ESCAPE_TOKEN, START_TOKEN, ESCAPE_TOKEN, 0x00, START_TOKEN, ESCAPE_TOKEN]
        );
        let len = unstuff_in_place(&mut buf[..len]).unwrap();
        assert_eq!(&buf[..len], &[ESCAPE_TOKEN, START_TOKEN, 0x00, START_TOKEN]);
    }

    #[test]
    fn stuffing_reports_overflow() {
        let mut buf = [START_TOKEN; 3];
        assert!(stuff_in_place(&mut buf, 2).is_none());
    }

    #[test]
    fn unstuff_rejects_dangling_start_token() {
        let mut buf = [0x01, START_TOKEN];
        assert!(unstuff_in_place(&mut buf).is_none());
        let mut buf = [START_TOKEN, 0x01];
        assert!(unstuff_in_place(&mut buf).is_none());
    }

    #[test]
    fn footer_stuffing() {
        let mut out = [0u8; MAX_FOOTER_WIRE_LEN];
        assert_eq!(encode_footer(0x1234, &mut out), 2);
        assert_eq!(&out[..2], &[0x12, 0x34]);

        assert_eq!(encode_footer(0x7E7E, &mut out), 4);
        assert_eq!(&out, &[START_TOKEN, ESCAPE_TOKEN, START_TOKEN, ESCAPE_TOKEN]);

        assert_eq!(encode_footer(0x7D00, &mut out), 2);
        assert_eq!(&out[..2], &[ESCAPE_TOKEN, 0x00]);
    }
}
