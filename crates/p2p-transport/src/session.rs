//! # Session
//!
//! One end of a point-to-point link: a transport, a clock, an inbound and
//! an outbound [`PacketStore`], and the [`Deframer`] and [`Framer`] that
//! move packets between the stores and the wire.
//!
//! ```text
//!   send / resend / send_init ──▶ outbound store ──Framer──▶ transport
//!   receive ◀── inbound store ◀──Deframer── transport
//! ```
//!
//! [`Session::poll`] is the only place bytes move. It never blocks and
//! returns the framer's pacing hint so the caller can sleep until the next
//! burst is due.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use tracing::debug;

use crate::clock::MonotonicClock;
use crate::link::ByteTransport;
use crate::pool::{Packet, PacketError, PacketFilter, PacketStore, SequenceGenerator};
use crate::receiver::Deframer;
use crate::sender::Framer;
use crate::stats::{ReceiverStats, SenderStats, SessionStats};
use crate::wire::{has_reserved_byte, PacketHeader, Priority};

pub struct Session<T, C, const CAPACITY: usize, const DEPTH: usize> {
    transport: T,
    clock: C,
    inbound: PacketStore<CAPACITY, DEPTH>,
    outbound: PacketStore<CAPACITY, DEPTH>,
    deframer: Deframer<CAPACITY>,
    framer: Framer<CAPACITY>,
    sequences: [SequenceGenerator; Priority::LEVELS],
    rng: StdRng,
}

impl<T, C, const CAPACITY: usize, const DEPTH: usize> Session<T, C, CAPACITY, DEPTH>
where
    T: ByteTransport,
    C: MonotonicClock,
{
    /// Create a session whose init sequence numbers are seeded from the clock.
    pub fn new(transport: T, clock: C) -> Self {
        let seed = clock.now_nanoseconds();
        Self::with_seed(transport, clock, seed)
    }

    pub fn with_seed(transport: T, clock: C, seed: u64) -> Self {
        Session {
            transport,
            clock,
            inbound: PacketStore::new(),
            outbound: PacketStore::new(),
            deframer: Deframer::new(),
            framer: Framer::new(),
            sequences: std::array::from_fn(|_| SequenceGenerator::new()),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Only deliver received packets `filter` accepts.
    pub fn with_inbound_filter(mut self, filter: PacketFilter<CAPACITY>) -> Self {
        self.deframer = std::mem::take(&mut self.deframer).with_filter(filter);
        self
    }

    /// Consult `filter` as each outbound packet finishes sending.
    pub fn with_outbound_filter(mut self, filter: PacketFilter<CAPACITY>) -> Self {
        self.framer = std::mem::take(&mut self.framer).with_filter(filter);
        self
    }

    /// One tick of both engines. Returns the framer's wait hint.
    pub fn poll(&mut self) -> Option<Duration> {
        self.deframer
            .run(&mut self.transport, &mut self.inbound, &self.clock);
        self.framer
            .run(&mut self.transport, &mut self.outbound, &self.clock)
    }

    /// Queue `payload` under the next sequence number of `priority`.
    pub fn send(
        &mut self,
        priority: Priority,
        payload: &[u8],
        requires_ack: bool,
    ) -> Result<u64, PacketError> {
        let seq = self.sequences[priority.index()].current();
        let mut header = PacketHeader::new(priority, seq);
        header.requires_ack = requires_ack;
        self.submit(header, payload)?;
        self.sequences[priority.index()].next();
        Ok(seq)
    }

    /// Queue `payload` again under a sequence number already sent.
    pub fn resend(
        &mut self,
        priority: Priority,
        sequence_number: u64,
        payload: &[u8],
        requires_ack: bool,
    ) -> Result<(), PacketError> {
        let mut header = PacketHeader::new(priority, sequence_number);
        header.requires_ack = requires_ack;
        self.submit(header, payload)
    }

    /// Queue a link (re)initialization packet under a random sequence number.
    pub fn send_init(&mut self, priority: Priority, payload: &[u8]) -> Result<u64, PacketError> {
        let seq = random_init_sequence(&mut self.rng);
        self.submit(PacketHeader::new(priority, seq).with_init(), payload)?;
        Ok(seq)
    }

    fn submit(&mut self, header: PacketHeader, payload: &[u8]) -> Result<(), PacketError> {
        let now = self.clock.now_nanoseconds();
        self.outbound.submit(header, payload, now)
    }

    /// Hand the oldest received packet to `f`, then release it.
    pub fn receive<R>(&mut self, f: impl FnOnce(&Packet<CAPACITY>) -> R) -> Option<R> {
        let priority = self.inbound.oldest_priority()?;
        let out = self.inbound.peek(priority).map(f);
        self.inbound.consume(priority);
        out
    }

    /// Drop partial frames in both directions, e.g. after reconnecting the
    /// transport. Queued and received packets are kept.
    pub fn reset(&mut self) {
        debug!(
            outbound = Priority::ALL.iter().map(|&p| self.outbound.len(p)).sum::<usize>(),
            "session reset"
        );
        self.deframer.reset();
        self.framer.reset(&mut self.outbound);
    }

    /// Sequence number the next [`Session::send`] on `priority` uses.
    pub fn next_sequence_number(&self, priority: Priority) -> u64 {
        self.sequences[priority.index()].current()
    }

    /// Packets waiting to go out on `priority`.
    pub fn pending(&self, priority: Priority) -> usize {
        self.outbound.len(priority)
    }

    /// Whether a received packet is waiting.
    pub fn has_received(&self) -> bool {
        !self.inbound.is_empty()
    }

    pub fn sender_stats(&self) -> &SenderStats {
        self.framer.stats()
    }

    pub fn receiver_stats(&self) -> &ReceiverStats {
        self.deframer.stats()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            sender: self.framer.stats().clone(),
            receiver: self.deframer.stats().clone(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

/// Headers are not stuffed, so init sequence numbers avoid the reserved
/// bytes to keep the receiver from resynchronizing inside them.
fn random_init_sequence(rng: &mut StdRng) -> u64 {
    loop {
        let seq = rng.random::<u64>();
        if !has_reserved_byte(&seq.to_be_bytes()) {
            return seq;
        }
    }
}

impl<T, C, const CAPACITY: usize, const DEPTH: usize> std::fmt::Debug
    for Session<T, C, CAPACITY, DEPTH>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("deframer", &self.deframer)
            .field("framer", &self.framer)
            .finish_non_exhaustive()
    }
}
