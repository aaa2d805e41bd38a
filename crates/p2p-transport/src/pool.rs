//! # Priority Packet Store
//!
//! Fixed-capacity packet storage indexed by priority. Each priority owns a
//! ring arena of `DEPTH` slots: a FIFO of committed packets followed by the
//! single slot currently being assembled (receive side) or staged (send
//! side). Committing advances an index; nothing is copied and nothing is
//! allocated after construction.

use thiserror::Error;

use crate::wire::{
    encode_footer, has_reserved_byte, is_clear_length, next_clear_sequence, packet_checksum,
    stuff_in_place, stuffed_len, unstuff_in_place, PacketHeader, Priority, HEADER_LEN,
    MAX_CONTENT_LEN, MAX_FOOTER_WIRE_LEN,
};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("content needs {len} bytes once stuffed, capacity is {capacity}")]
    ContentTooLong { len: usize, capacity: usize },
    #[error("no free slot for {priority} priority packets")]
    StoreFull { priority: Priority },
    /// The unstuffed header would carry a reserved token byte.
    #[error("stuffed length {len} contains a reserved token byte")]
    ReservedLength { len: usize },
    #[error("sequence number {sequence_number:#x} contains a reserved token byte")]
    ReservedSequence { sequence_number: u64 },
}

/// Predicate consulted when a packet is committed (receive side) or fully
/// sent (send side). Returning `false` suppresses delivery.
pub type PacketFilter<const CAPACITY: usize> = Box<dyn FnMut(&Packet<CAPACITY>) -> bool + Send>;

// ─── Packet ─────────────────────────────────────────────────────────────────

/// A packet slot: header, content, footer and bookkeeping.
///
/// While a packet travels, `content` holds its stuffed wire form. Once the
/// receive side validates it, the content is unstuffed in place and
/// [`Packet::content`] returns the original payload.
#[derive(Debug, Clone)]
pub struct Packet<const CAPACITY: usize> {
    header: PacketHeader,
    content: [u8; CAPACITY],
    content_len: usize,
    footer: [u8; MAX_FOOTER_WIRE_LEN],
    footer_len: usize,
    checksum: u16,
    commit_time_ns: u64,
}

impl<const CAPACITY: usize> Packet<CAPACITY> {
    pub fn new() -> Self {
        Packet {
            header: PacketHeader::new(Priority::Low, 0),
            content: [0; CAPACITY],
            content_len: 0,
            footer: [0; MAX_FOOTER_WIRE_LEN],
            footer_len: 0,
            checksum: 0,
            commit_time_ns: 0,
        }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn priority(&self) -> Priority {
        self.header.priority
    }

    pub fn sequence_number(&self) -> u64 {
        self.header.sequence_number
    }

    pub fn is_continuation(&self) -> bool {
        self.header.is_continuation
    }

    pub fn is_init(&self) -> bool {
        self.header.is_init
    }

    pub fn requires_ack(&self) -> bool {
        self.header.requires_ack
    }

    /// Payload once validated; stuffed wire bytes while in flight.
    pub fn content(&self) -> &[u8] {
        &self.content[..self.content_len]
    }

    pub fn len(&self) -> usize {
        self.content_len
    }

    pub fn is_empty(&self) -> bool {
        self.content_len == 0
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Monotonic timestamp of the commit that published this packet.
    pub fn commit_time_ns(&self) -> u64 {
        self.commit_time_ns
    }

    /// Stuffed footer size.
    pub fn footer_wire_len(&self) -> usize {
        self.footer_len
    }

    /// Full framed size: header, stuffed content and stuffed footer.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.content_len + self.footer_len
    }

    /// Stage an outbound packet: copy, stuff, checksum.
    pub(crate) fn prepare_to_send(
        &mut self,
        mut header: PacketHeader,
        payload: &[u8],
        commit_time_ns: u64,
    ) -> Result<(), PacketError> {
        let len = stuffed_len(payload);
        if len > CAPACITY || len > MAX_CONTENT_LEN {
            return Err(PacketError::ContentTooLong {
                len,
                capacity: CAPACITY.min(MAX_CONTENT_LEN),
            });
        }
        if !is_clear_length(len) {
            return Err(PacketError::ReservedLength { len });
        }
        if has_reserved_byte(&header.sequence_number.to_be_bytes()) {
            return Err(PacketError::ReservedSequence {
                sequence_number: header.sequence_number,
            });
        }
        self.content[..payload.len()].copy_from_slice(payload);
        self.content_len = stuff_in_place(&mut self.content, payload.len()).unwrap_or(len);

        header.is_continuation = false;
        header.length = self.content_len as u16;
        self.header = header;
        self.checksum = packet_checksum(&self.header, self.content());
        self.footer_len = encode_footer(self.checksum, &mut self.footer);
        self.commit_time_ns = commit_time_ns;
        Ok(())
    }

    /// Start assembling a received fresh header. Returns `false` if the
    /// declared length does not fit.
    pub(crate) fn start_receive(&mut self, header: PacketHeader) -> bool {
        let len = header.length as usize;
        if len > CAPACITY {
            return false;
        }
        self.header = header;
        self.content_len = len;
        true
    }

    pub(crate) fn put_content_byte(&mut self, offset: usize, byte: u8) {
        self.content[offset] = byte;
    }

    pub(crate) fn set_checksum(&mut self, checksum: u16) {
        self.checksum = checksum;
    }

    pub(crate) fn set_commit_time(&mut self, commit_time_ns: u64) {
        self.commit_time_ns = commit_time_ns;
    }

    /// Verify the checksum over the stuffed content, then unstuff it.
    pub(crate) fn prepare_to_read(&mut self) -> bool {
        if packet_checksum(&self.header, self.content()) != self.checksum {
            return false;
        }
        match unstuff_in_place(&mut self.content[..self.content_len]) {
            Some(len) => {
                self.content_len = len;
                self.header.length = len as u16;
                true
            }
            None => false,
        }
    }

    /// Bytes following the header, starting `offset` bytes in: the rest of
    /// the content, or the rest of the footer once the content is done.
    pub(crate) fn body_segment(&self, offset: usize) -> &[u8] {
        if offset < self.content_len {
            &self.content[offset..self.content_len]
        } else {
            let footer_offset = (offset - self.content_len).min(self.footer_len);
            &self.footer[footer_offset..self.footer_len]
        }
    }

    /// Rewrite the header for a resumed send of the last `remaining`
    /// content bytes.
    pub(crate) fn mark_continuation(&mut self, remaining: usize) {
        self.header.is_continuation = true;
        self.header.length = remaining as u16;
    }

    /// Turn a continuation back into a full send.
    pub(crate) fn clear_continuation(&mut self) {
        self.header.is_continuation = false;
        self.header.length = self.content_len as u16;
    }
}

impl<const CAPACITY: usize> Default for Packet<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── PacketStore ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PriorityRing<const CAPACITY: usize, const DEPTH: usize> {
    slots: [Packet<CAPACITY>; DEPTH],
    head: usize,
    len: usize,
}

impl<const CAPACITY: usize, const DEPTH: usize> PriorityRing<CAPACITY, DEPTH> {
    fn new() -> Self {
        PriorityRing {
            slots: std::array::from_fn(|_| Packet::new()),
            head: 0,
            len: 0,
        }
    }

    fn tail(&self) -> usize {
        (self.head + self.len) % DEPTH
    }
}

/// Per-priority arena of `DEPTH` packet slots holding up to `CAPACITY`
/// stuffed content bytes each.
#[derive(Debug)]
pub struct PacketStore<const CAPACITY: usize, const DEPTH: usize> {
    rings: [PriorityRing<CAPACITY, DEPTH>; Priority::LEVELS],
}

impl<const CAPACITY: usize, const DEPTH: usize> PacketStore<CAPACITY, DEPTH> {
    const NON_EMPTY: () = assert!(DEPTH > 0, "a packet store needs at least one slot per priority");

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_EMPTY;
        PacketStore {
            rings: std::array::from_fn(|_| PriorityRing::new()),
        }
    }

    /// Content capacity of each slot.
    pub fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Slots per priority.
    pub fn depth(&self) -> usize {
        DEPTH
    }

    /// Obtain the slot being assembled for `priority`, or `None` if every
    /// slot holds a committed packet. Repeated calls return the same slot
    /// until it is committed.
    pub fn new_value(&mut self, priority: Priority) -> Option<&mut Packet<CAPACITY>> {
        let ring = &mut self.rings[priority.index()];
        if ring.len == DEPTH {
            return None;
        }
        let tail = ring.tail();
        Some(&mut ring.slots[tail])
    }

    /// Publish the slot being assembled for `priority`.
    pub fn commit(&mut self, priority: Priority) -> bool {
        let ring = &mut self.rings[priority.index()];
        if ring.len == DEPTH {
            return false;
        }
        ring.len += 1;
        true
    }

    /// Highest priority with a committed packet.
    pub fn oldest_priority(&self) -> Option<Priority> {
        Priority::ALL
            .into_iter()
            .find(|p| self.rings[p.index()].len > 0)
    }

    /// Head of the highest-priority non-empty queue, left in place.
    pub fn oldest_value(&self) -> Option<&Packet<CAPACITY>> {
        self.peek(self.oldest_priority()?)
    }

    pub fn oldest_value_mut(&mut self) -> Option<&mut Packet<CAPACITY>> {
        let priority = self.oldest_priority()?;
        self.peek_mut(priority)
    }

    /// Head of the queue for `priority`.
    pub fn peek(&self, priority: Priority) -> Option<&Packet<CAPACITY>> {
        let ring = &self.rings[priority.index()];
        if ring.len == 0 {
            return None;
        }
        Some(&ring.slots[ring.head])
    }

    pub fn peek_mut(&mut self, priority: Priority) -> Option<&mut Packet<CAPACITY>> {
        let ring = &mut self.rings[priority.index()];
        if ring.len == 0 {
            return None;
        }
        Some(&mut ring.slots[ring.head])
    }

    /// Drop the head of the queue for `priority`.
    pub fn consume(&mut self, priority: Priority) -> bool {
        let ring = &mut self.rings[priority.index()];
        if ring.len == 0 {
            return false;
        }
        ring.head = (ring.head + 1) % DEPTH;
        ring.len -= 1;
        true
    }

    /// Committed packets waiting at `priority`.
    pub fn len(&self, priority: Priority) -> usize {
        self.rings[priority.index()].len
    }

    pub fn is_empty(&self) -> bool {
        self.rings.iter().all(|ring| ring.len == 0)
    }

    pub fn is_full(&self, priority: Priority) -> bool {
        self.rings[priority.index()].len == DEPTH
    }

    /// Forget every committed packet.
    pub fn clear(&mut self) {
        for ring in &mut self.rings {
            ring.head = 0;
            ring.len = 0;
        }
    }

    /// Stage, stuff, checksum and commit an outbound packet in one go.
    pub fn submit(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
        commit_time_ns: u64,
    ) -> Result<(), PacketError> {
        let priority = header.priority;
        let slot = self
            .new_value(priority)
            .ok_or(PacketError::StoreFull { priority })?;
        slot.prepare_to_send(header, payload, commit_time_ns)?;
        self.commit(priority);
        Ok(())
    }
}

impl<const CAPACITY: usize, const DEPTH: usize> Default for PacketStore<CAPACITY, DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Sequence Generator ─────────────────────────────────────────────────────

/// Monotonic sequence number generator, one per priority. Values whose
/// bytes include a reserved token are skipped.
#[derive(Debug, Clone)]
pub struct SequenceGenerator {
    next: u64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        SequenceGenerator { next: 0 }
    }

    /// Start counting at `first`, or the next usable value above it.
    pub fn starting_at(first: u64) -> Self {
        SequenceGenerator {
            next: next_clear_sequence(first),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u64 {
        let seq = self.next;
        self.next = next_clear_sequence(self.next.wrapping_add(1));
        seq
    }

    /// The number the next call to [`SequenceGenerator::next`] returns.
    pub fn current(&self) -> u64 {
        self.next
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ESCAPE_TOKEN, START_TOKEN};

    type Store = PacketStore<32, 3>;

    fn header(priority: Priority, seq: u64) -> PacketHeader {
        PacketHeader::new(priority, seq)
    }

    #[test]
    fn submit_stuffs_and_checksums() {
        let mut store = Store::new();
        store
            .submit(header(Priority::Medium, 4), &[1, START_TOKEN, 2], 1_000)
            .unwrap();

        let packet = store.peek(Priority::Medium).unwrap();
        assert_eq!(packet.content(), &[1, START_TOKEN, ESCAPE_TOKEN, 2]);
        assert_eq!(packet.header().length, 4);
        assert_eq!(packet.commit_time_ns(), 1_000);
        assert_eq!(
            packet.checksum(),
            packet_checksum(packet.header(), packet.content())
        );
        assert_eq!(packet.wire_len(), HEADER_LEN + 4 + packet.footer_wire_len());
    }

    #[test]
    fn submit_rejects_oversized_content() {
        let mut store = Store::new();
        let payload = [START_TOKEN; 17];
        let err = store
            .submit(header(Priority::High, 0), &payload, 0)
            .unwrap_err();
        assert_eq!(
            err,
            PacketError::ContentTooLong {
                len: 34,
                capacity: 32
            }
        );
        assert!(store.is_empty());
    }

    #[test]
    fn store_capacity_limit() {
        let mut store = Store::new();
        for seq in 0..3 {
            store.submit(header(Priority::Low, seq), b"x", 0).unwrap();
        }
        assert!(store.is_full(Priority::Low));
        assert!(store.new_value(Priority::Low).is_none());
        assert_eq!(
            store.submit(header(Priority::Low, 3), b"x", 0),
            Err(PacketError::StoreFull {
                priority: Priority::Low
            })
        );
        // Other levels are unaffected.
        assert!(store.new_value(Priority::High).is_some());
    }

    #[test]
    fn oldest_value_prefers_high_priority() {
        let mut store = Store::new();
        store.submit(header(Priority::Low, 10), b"low", 0).unwrap();
        store.submit(header(Priority::Medium, 20), b"mid", 0).unwrap();
        assert_eq!(store.oldest_value().unwrap().sequence_number(), 20);

        store.submit(header(Priority::High, 30), b"high", 0).unwrap();
        assert_eq!(store.oldest_priority(), Some(Priority::High));

        assert!(store.consume(Priority::High));
        assert!(store.consume(Priority::Medium));
        assert_eq!(store.oldest_value().unwrap().sequence_number(), 10);
        assert!(store.consume(Priority::Low));
        assert!(store.oldest_value().is_none());
        assert!(!store.consume(Priority::Low));
    }

    #[test]
    fn fifo_order_survives_wraparound() {
        let mut store = Store::new();
        for round in 0..5u64 {
            store.submit(header(Priority::Medium, round * 2), b"a", 0).unwrap();
            store
                .submit(header(Priority::Medium, round * 2 + 1), b"b", 0)
                .unwrap();
            assert_eq!(store.peek(Priority::Medium).unwrap().sequence_number(), round * 2);
            store.consume(Priority::Medium);
            assert_eq!(
                store.peek(Priority::Medium).unwrap().sequence_number(),
                round * 2 + 1
            );
            store.consume(Priority::Medium);
        }
        assert!(store.is_empty());
    }

    #[test]
    fn new_value_is_idempotent_until_commit() {
        let mut store = Store::new();
        store
            .new_value(Priority::High)
            .unwrap()
            .start_receive(PacketHeader::new(Priority::High, 5));
        assert_eq!(store.new_value(Priority::High).unwrap().sequence_number(), 5);
        assert!(store.peek(Priority::High).is_none());

        assert!(store.commit(Priority::High));
        assert_eq!(store.peek(Priority::High).unwrap().sequence_number(), 5);
    }

    #[test]
    fn continuation_rewrite_and_restore() {
        let mut store = Store::new();
        store.submit(header(Priority::Low, 1), b"abcdef", 0).unwrap();
        let packet = store.peek_mut(Priority::Low).unwrap();
        packet.mark_continuation(2);
        assert!(packet.is_continuation());
        assert_eq!(packet.header().length, 2);
        assert_eq!(packet.body_segment(4), b"ef");

        packet.clear_continuation();
        assert!(!packet.is_continuation());
        assert_eq!(packet.header().length, 6);
    }

    #[test]
    fn body_segment_spans_content_then_footer() {
        let mut store = Store::new();
        store.submit(header(Priority::Low, 1), b"abc", 0).unwrap();
        let packet = store.peek(Priority::Low).unwrap();
        assert_eq!(packet.body_segment(1), b"bc");
        let footer = packet.body_segment(3);
        assert_eq!(footer.len(), packet.footer_wire_len());
        assert_eq!(packet.body_segment(3 + footer.len()), &[] as &[u8]);
    }

    #[test]
    fn prepare_to_read_verifies_then_unstuffs() {
        let mut sent = Packet::<32>::new();
        sent.prepare_to_send(header(Priority::High, 9), &[START_TOKEN, 1], 0)
            .unwrap();

        let mut received = Packet::<32>::new();
        assert!(received.start_receive(*sent.header()));
        for (i, &b) in sent.content().iter().enumerate() {
            received.put_content_byte(i, b);
        }
        received.set_checksum(sent.checksum());
        assert!(received.prepare_to_read());
        assert_eq!(received.content(), &[START_TOKEN, 1]);
        assert_eq!(received.header().length, 2);

        let mut corrupt = Packet::<32>::new();
        corrupt.start_receive(*sent.header());
        corrupt.set_checksum(sent.checksum() ^ 1);
        assert!(!corrupt.prepare_to_read());
    }

    #[test]
    fn sequence_generator() {
        let mut gen = SequenceGenerator::new();
        assert_eq!(gen.next(), 0);
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.current(), 2);

        let mut wrap = SequenceGenerator::starting_at(u64::MAX);
        assert_eq!(wrap.next(), u64::MAX);
        assert_eq!(wrap.next(), 0);
    }

    #[test]
    fn sequence_generator_skips_reserved_bytes() {
        let mut gen = SequenceGenerator::starting_at(124);
        assert_eq!(gen.next(), 124);
        assert_eq!(gen.next(), 127);
        assert_eq!(SequenceGenerator::starting_at(START_TOKEN.into()).current(), 127);

        let mut gen = SequenceGenerator::new();
        let mut prev = None;
        for _ in 0..600 {
            let seq = gen.next();
            if let Some(prev) = prev {
                assert!(seq > prev);
            }
            assert!(!seq
                .to_be_bytes()
                .iter()
                .any(|&b| b == START_TOKEN || b == ESCAPE_TOKEN));
            prev = Some(seq);
        }
    }

    #[test]
    fn submit_refuses_reserved_header_fields() {
        let mut store = PacketStore::<256, 2>::new();
        assert_eq!(
            store.submit(header(Priority::Low, 1), &[1u8; 126], 0),
            Err(PacketError::ReservedLength { len: 126 })
        );
        // 63 start tokens stuff to 126 bytes.
        assert_eq!(
            store.submit(header(Priority::Low, 1), &[START_TOKEN; 63], 0),
            Err(PacketError::ReservedLength { len: 126 })
        );
        assert_eq!(
            store.submit(header(Priority::Low, 0x7D), b"x", 0),
            Err(PacketError::ReservedSequence { sequence_number: 0x7D })
        );
        assert!(store.is_empty());
        store.submit(header(Priority::Low, 127), &[1u8; 127], 0).unwrap();
        assert_eq!(store.len(Priority::Low), 1);
    }
}
