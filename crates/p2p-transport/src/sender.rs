//! # Framer
//!
//! Scheduler and pacer for the outbound side. Picks the head packet of the
//! highest-priority non-empty queue in a [`PacketStore`], frames it and
//! writes it to a [`ByteTransport`] in paced bursts:
//!
//! ```text
//! GettingNextPacket → SendingHeaderBurst ⇄ WaitingForHeaderBurstIngestion
//!        ↑                                          ↓
//!        └──── WaitingForBurstIngestion ⇄ SendingBurst
//!        └──── WaitingForPartialBurstIngestionBeforeHigherPriorityPacket (preemption)
//! ```
//!
//! Each burst is followed by a wait of `burst_bytes × ingestion_ns_per_byte`,
//! returned from [`Framer::run`] as a "not before" hint. Once a header is
//! out, a strictly higher-priority packet may cut in: the current packet is
//! rewritten as a continuation carrying only its unsent remainder and is
//! resumed when its priority is selected again.

use std::time::Duration;

use tracing::{debug, trace};

use crate::clock::MonotonicClock;
use crate::link::ByteTransport;
use crate::pool::{PacketFilter, PacketStore};
use crate::stats::SenderStats;
use crate::wire::{is_clear_length, Priority, HEADER_LEN, START_TOKEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    GettingNextPacket,
    SendingHeaderBurst,
    WaitingForHeaderBurstIngestion,
    SendingBurst,
    WaitingForBurstIngestion,
    WaitingForPartialBurstIngestionBeforeHigherPriorityPacket,
}

pub struct Framer<const CAPACITY: usize> {
    state: FramerState,
    /// Priority of the packet on the wire.
    current: Priority,
    header: [u8; HEADER_LEN],
    /// Full framed size of the packet last started per priority.
    total_packet_bytes: [Option<usize>; Priority::LEVELS],
    pending_packet_bytes: usize,
    total_burst_bytes: usize,
    pending_burst_bytes: usize,
    after_burst_wait_end_ns: u64,
    last_sent_sequence_number: [Option<u64>; Priority::LEVELS],
    filter: Option<PacketFilter<CAPACITY>>,
    stats: SenderStats,
}

impl<const CAPACITY: usize> Framer<CAPACITY> {
    pub fn new() -> Self {
        Framer {
            state: FramerState::GettingNextPacket,
            current: Priority::Low,
            header: [0; HEADER_LEN],
            total_packet_bytes: [None; Priority::LEVELS],
            pending_packet_bytes: 0,
            total_burst_bytes: 0,
            pending_burst_bytes: 0,
            after_burst_wait_end_ns: 0,
            last_sent_sequence_number: [None; Priority::LEVELS],
            filter: None,
            stats: SenderStats::new(),
        }
    }

    /// Consult `filter` when a packet has been fully sent. Rejected packets
    /// are released without delivery accounting.
    pub fn with_filter(mut self, filter: PacketFilter<CAPACITY>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn state(&self) -> FramerState {
        self.state
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// Sequence number last delivered for `priority`, if any.
    pub fn last_sent_sequence_number(&self, priority: Priority) -> Option<u64> {
        self.last_sent_sequence_number[priority.index()]
    }

    /// Abandon the packet in flight. Interrupted packets are rewound to a
    /// full send since the far end no longer holds their prefix.
    pub fn reset<const DEPTH: usize>(&mut self, store: &mut PacketStore<CAPACITY, DEPTH>) {
        for priority in Priority::ALL {
            if let Some(packet) = store.peek_mut(priority) {
                if packet.is_continuation() {
                    packet.clear_continuation();
                }
            }
        }
        self.state = FramerState::GettingNextPacket;
        self.total_packet_bytes = [None; Priority::LEVELS];
        self.pending_packet_bytes = 0;
        self.total_burst_bytes = 0;
        self.pending_burst_bytes = 0;
        self.after_burst_wait_end_ns = 0;
    }

    /// Emit at most one burst.
    ///
    /// Returns `Some(wait)` when the caller must not tick again before
    /// `wait` has elapsed, `None` when there is nothing to send or the
    /// transport accepted nothing.
    ///
    /// # Panics
    ///
    /// If the store hands out a continuation for a priority this framer
    /// never started.
    pub fn run<T, C, const DEPTH: usize>(
        &mut self,
        transport: &mut T,
        store: &mut PacketStore<CAPACITY, DEPTH>,
        clock: &C,
    ) -> Option<Duration>
    where
        T: ByteTransport + ?Sized,
        C: MonotonicClock + ?Sized,
    {
        loop {
            match self.state {
                FramerState::GettingNextPacket => {
                    if !self.start_next_packet(transport, store) {
                        return None;
                    }
                }
                FramerState::SendingHeaderBurst => return self.send_header_burst(transport, clock),
                FramerState::WaitingForHeaderBurstIngestion => {
                    if let Some(wait) = self.ingestion_pending(clock) {
                        return Some(wait);
                    }
                    if self.pending_packet_bytes > 0 {
                        self.state = FramerState::SendingHeaderBurst;
                    } else {
                        let Some(packet) = store.peek(self.current) else {
                            self.state = FramerState::GettingNextPacket;
                            continue;
                        };
                        // Content remainder (all of it unless resuming) plus footer.
                        self.pending_packet_bytes =
                            usize::from(packet.header().length) + packet.footer_wire_len();
                        self.state = FramerState::SendingBurst;
                    }
                    self.begin_burst(transport);
                }
                FramerState::SendingBurst => return self.send_burst(transport, store, clock),
                FramerState::WaitingForBurstIngestion => {
                    if let Some(wait) = self.ingestion_pending(clock) {
                        return Some(wait);
                    }
                    if self.pending_packet_bytes == 0 {
                        self.state = FramerState::GettingNextPacket;
                    } else {
                        self.state = FramerState::SendingBurst;
                        self.begin_burst(transport);
                    }
                }
                FramerState::WaitingForPartialBurstIngestionBeforeHigherPriorityPacket => {
                    if let Some(wait) = self.ingestion_pending(clock) {
                        return Some(wait);
                    }
                    self.state = FramerState::GettingNextPacket;
                }
            }
        }
    }

    fn start_next_packet<T, const DEPTH: usize>(
        &mut self,
        transport: &T,
        store: &PacketStore<CAPACITY, DEPTH>,
    ) -> bool
    where
        T: ByteTransport + ?Sized,
    {
        let Some(packet) = store.oldest_value() else {
            return false;
        };
        let priority = packet.priority();
        if packet.is_continuation() {
            assert!(
                self.total_packet_bytes[priority.index()].is_some(),
                "continuation selected for {priority} priority packet {} that was never started",
                packet.sequence_number(),
            );
            trace!(%priority, seq = packet.sequence_number(), remaining = packet.header().length, "resuming");
        } else {
            self.total_packet_bytes[priority.index()] = Some(packet.wire_len());
            trace!(%priority, seq = packet.sequence_number(), len = packet.wire_len(), "sending");
        }

        self.current = priority;
        self.header = packet.header().to_bytes();
        self.pending_packet_bytes = HEADER_LEN;
        self.state = FramerState::SendingHeaderBurst;
        self.begin_burst(transport);
        true
    }

    fn send_header_burst<T, C>(&mut self, transport: &mut T, clock: &C) -> Option<Duration>
    where
        T: ByteTransport + ?Sized,
        C: MonotonicClock + ?Sized,
    {
        let atomic = transport.max_atomic_send_length().max(1);
        while self.pending_burst_bytes > 0 {
            let offset = HEADER_LEN - self.pending_packet_bytes;
            let len = self.pending_burst_bytes.min(atomic);
            let written = transport.write(&self.header[offset..offset + len]).min(len);
            if written == 0 {
                return None;
            }
            self.advance(written);
        }
        self.state = FramerState::WaitingForHeaderBurstIngestion;
        Some(self.end_burst(self.total_burst_bytes, transport, clock))
    }

    fn send_burst<T, C, const DEPTH: usize>(
        &mut self,
        transport: &mut T,
        store: &mut PacketStore<CAPACITY, DEPTH>,
        clock: &C,
    ) -> Option<Duration>
    where
        T: ByteTransport + ?Sized,
        C: MonotonicClock + ?Sized,
    {
        let priority = self.current;
        let atomic = transport.max_atomic_send_length().max(1);
        loop {
            let Some(packet) = store.peek(priority) else {
                self.state = FramerState::GettingNextPacket;
                return None;
            };
            let footer_len = packet.footer_wire_len();
            let body_len = packet.len() + footer_len;
            let segment = packet.body_segment(body_len - self.pending_packet_bytes);
            let len = segment.len().min(self.pending_burst_bytes).min(atomic);
            let written = transport.write(&segment[..len]).min(len);
            if written == 0 {
                return None;
            }
            let last_byte = segment[written - 1];
            self.advance(written);

            if self.pending_packet_bytes == 0 {
                self.finish_packet(store, clock);
                self.state = FramerState::WaitingForBurstIngestion;
                return Some(self.end_burst(self.total_burst_bytes, transport, clock));
            }

            // Only inside content, never between a stuffed start token and
            // its escape byte, and only where the continuation's length field
            // stays clear of the reserved tokens.
            let remaining = self.pending_packet_bytes.saturating_sub(footer_len);
            let preemptable =
                remaining > 0 && last_byte != START_TOKEN && is_clear_length(remaining);
            if preemptable && self.higher_priority_waiting(store) {
                if let Some(packet) = store.peek_mut(priority) {
                    packet.mark_continuation(remaining);
                    debug!(%priority, seq = packet.sequence_number(), remaining, "preempted");
                }
                self.stats.preemptions += 1;
                self.state = FramerState::WaitingForPartialBurstIngestionBeforeHigherPriorityPacket;
                let sent = self.total_burst_bytes - self.pending_burst_bytes;
                return Some(self.end_burst(sent, transport, clock));
            }

            if self.pending_burst_bytes == 0 {
                self.state = FramerState::WaitingForBurstIngestion;
                return Some(self.end_burst(self.total_burst_bytes, transport, clock));
            }
        }
    }

    fn finish_packet<C, const DEPTH: usize>(
        &mut self,
        store: &mut PacketStore<CAPACITY, DEPTH>,
        clock: &C,
    ) where
        C: MonotonicClock + ?Sized,
    {
        let priority = self.current;
        let now = clock.now_nanoseconds();
        let total = self.total_packet_bytes[priority.index()].take();
        if let Some(packet) = store.peek(priority) {
            let accepted = match self.filter.as_mut() {
                Some(filter) => filter(packet),
                None => true,
            };
            let seq = packet.sequence_number();
            if !accepted {
                trace!(%priority, seq, "filtered");
            } else if !packet.is_init() {
                let last = &mut self.last_sent_sequence_number[priority.index()];
                let stats = self.stats.priority_mut(priority);
                match *last {
                    Some(prev) if seq <= prev => {
                        stats.record_retransmission();
                        trace!(%priority, seq, "retransmission");
                    }
                    _ => {
                        *last = Some(seq);
                        let latency = now.saturating_sub(packet.commit_time_ns());
                        stats.record_delivery(
                            latency,
                            total.unwrap_or_else(|| packet.wire_len()),
                            packet.requires_ack(),
                        );
                        trace!(%priority, seq, latency_ns = latency, "sent");
                    }
                }
            }
        }
        store.consume(priority);
    }

    fn higher_priority_waiting<const DEPTH: usize>(
        &self,
        store: &PacketStore<CAPACITY, DEPTH>,
    ) -> bool {
        store
            .oldest_priority()
            .is_some_and(|head| head < self.current)
    }

    fn begin_burst<T: ByteTransport + ?Sized>(&mut self, transport: &T) {
        self.total_burst_bytes = self
            .pending_packet_bytes
            .min(transport.max_burst_length().max(1));
        self.pending_burst_bytes = self.total_burst_bytes;
    }

    fn advance(&mut self, written: usize) {
        self.pending_packet_bytes -= written;
        self.pending_burst_bytes -= written;
        self.stats.bytes_written += written as u64;
    }

    fn end_burst<T, C>(&mut self, bytes: usize, transport: &T, clock: &C) -> Duration
    where
        T: ByteTransport + ?Sized,
        C: MonotonicClock + ?Sized,
    {
        let wait_ns = transport
            .ingestion_nanoseconds_per_byte()
            .saturating_mul(bytes as u64);
        self.after_burst_wait_end_ns = clock.now_nanoseconds().saturating_add(wait_ns);
        Duration::from_nanos(wait_ns)
    }

    fn ingestion_pending<C: MonotonicClock + ?Sized>(&self, clock: &C) -> Option<Duration> {
        let now = clock.now_nanoseconds();
        (now < self.after_burst_wait_end_ns)
            .then(|| Duration::from_nanos(self.after_burst_wait_end_ns - now))
    }
}

impl<const CAPACITY: usize> Default for Framer<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAPACITY: usize> std::fmt::Debug for Framer<CAPACITY> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framer")
            .field("state", &self.state)
            .field("current", &self.current)
            .field("pending_packet_bytes", &self.pending_packet_bytes)
            .field("last_sent_sequence_number", &self.last_sent_sequence_number)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
