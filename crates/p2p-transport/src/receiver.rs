//! # Deframer
//!
//! Turns the raw, glitch-prone byte stream coming off a [`ByteTransport`]
//! into validated packets committed to a [`PacketStore`].
//!
//! Every byte drives exactly one transition of an explicit state machine:
//!
//! ```text
//! WaitingForPacket → ReadingHeader → ReadingContent ⇄ DisambiguatingStartToken
//!                                          ↓
//!                      ReadingFooter ⇄ DisambiguatingFooterStartToken → WaitingForPacket
//! ```
//!
//! A start token always wins: inside a header it restarts the header, and
//! inside content or footer it is either stuffed data (followed by an escape
//! token) or the beginning of another frame. In the latter case the offset
//! reached is remembered per priority, so a later continuation frame can
//! resume the interrupted packet where it broke off.
//!
//! Nothing here is an error. Malformed input is counted in
//! [`ReceiverStats`] and the machine resynchronizes on the next start token.

use tracing::{debug, trace};

use crate::clock::MonotonicClock;
use crate::link::ByteTransport;
use crate::pool::{PacketFilter, PacketStore};
use crate::stats::ReceiverStats;
use crate::wire::{PacketHeader, Priority, CHECKSUM_LEN, ESCAPE_TOKEN, HEADER_LEN, START_TOKEN};

/// Bytes pulled from the transport per read call.
const READ_CHUNK: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeframerState {
    WaitingForPacket,
    ReadingHeader,
    ReadingContent,
    /// A start token arrived mid-content: stuffed data or a new frame.
    DisambiguatingStartToken,
    ReadingFooter,
    DisambiguatingFooterStartToken,
}

pub struct Deframer<const CAPACITY: usize> {
    state: DeframerState,
    header: [u8; HEADER_LEN],
    header_read: usize,
    priority: Priority,
    content_read: usize,
    content_len: usize,
    footer: [u8; CHECKSUM_LEN],
    footer_read: usize,
    /// Content offset at which each priority's packet was broken off.
    write_offset_before_break: [Option<usize>; Priority::LEVELS],
    filter: Option<PacketFilter<CAPACITY>>,
    stats: ReceiverStats,
}

impl<const CAPACITY: usize> Deframer<CAPACITY> {
    pub fn new() -> Self {
        Deframer {
            state: DeframerState::WaitingForPacket,
            header: [0; HEADER_LEN],
            header_read: 0,
            priority: Priority::Low,
            content_read: 0,
            content_len: 0,
            footer: [0; CHECKSUM_LEN],
            footer_read: 0,
            write_offset_before_break: [None; Priority::LEVELS],
            filter: None,
            stats: ReceiverStats::new(),
        }
    }

    /// Only commit packets the filter accepts.
    pub fn with_filter(mut self, filter: PacketFilter<CAPACITY>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn state(&self) -> DeframerState {
        self.state
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Drop any partial frame and forget interruption offsets.
    pub fn reset(&mut self) {
        self.state = DeframerState::WaitingForPacket;
        self.header_read = 0;
        self.content_read = 0;
        self.content_len = 0;
        self.footer_read = 0;
        self.write_offset_before_break = [None; Priority::LEVELS];
    }

    /// Consume up to one maximum burst of input. Returns the bytes consumed.
    pub fn run<T, C, const DEPTH: usize>(
        &mut self,
        transport: &mut T,
        store: &mut PacketStore<CAPACITY, DEPTH>,
        clock: &C,
    ) -> usize
    where
        T: ByteTransport + ?Sized,
        C: MonotonicClock + ?Sized,
    {
        let budget = transport.max_burst_length().max(1);
        let mut chunk = [0u8; READ_CHUNK];
        let mut consumed = 0;
        while consumed < budget {
            let want = (budget - consumed).min(READ_CHUNK);
            let n = transport.read(&mut chunk[..want]);
            if n == 0 {
                break;
            }
            self.push_bytes(&chunk[..n], store, clock);
            consumed += n;
        }
        consumed
    }

    pub fn push_bytes<C, const DEPTH: usize>(
        &mut self,
        bytes: &[u8],
        store: &mut PacketStore<CAPACITY, DEPTH>,
        clock: &C,
    ) where
        C: MonotonicClock + ?Sized,
    {
        for &byte in bytes {
            self.push_byte(byte, store, clock);
        }
    }

    /// Advance the state machine by one input byte.
    pub fn push_byte<C, const DEPTH: usize>(
        &mut self,
        byte: u8,
        store: &mut PacketStore<CAPACITY, DEPTH>,
        clock: &C,
    ) where
        C: MonotonicClock + ?Sized,
    {
        self.stats.bytes_read += 1;
        match self.state {
            DeframerState::WaitingForPacket => {
                if byte == START_TOKEN {
                    self.begin_header(&[byte]);
                }
            }
            DeframerState::ReadingHeader => self.read_header_byte(byte, store),
            DeframerState::ReadingContent => {
                if byte != START_TOKEN {
                    self.store_content(&[byte], store);
                } else if self.content_read + 1 < self.content_len {
                    self.state = DeframerState::DisambiguatingStartToken;
                } else {
                    // No room left for an escape byte.
                    self.interrupt(self.content_read);
                    self.begin_header(&[byte]);
                }
            }
            DeframerState::DisambiguatingStartToken => match byte {
                ESCAPE_TOKEN => self.store_content(&[START_TOKEN, ESCAPE_TOKEN], store),
                START_TOKEN => {
                    self.interrupt(self.content_read);
                    self.begin_header(&[byte]);
                }
                _ => {
                    self.interrupt(self.content_read);
                    self.begin_header(&[START_TOKEN, byte]);
                }
            },
            DeframerState::ReadingFooter => {
                if byte == START_TOKEN {
                    self.state = DeframerState::DisambiguatingFooterStartToken;
                } else {
                    self.store_footer(byte, store, clock);
                }
            }
            DeframerState::DisambiguatingFooterStartToken => match byte {
                ESCAPE_TOKEN => {
                    self.state = DeframerState::ReadingFooter;
                    self.store_footer(START_TOKEN, store, clock);
                }
                START_TOKEN => {
                    self.interrupt(self.content_len);
                    self.begin_header(&[byte]);
                }
                _ => {
                    self.interrupt(self.content_len);
                    self.begin_header(&[START_TOKEN, byte]);
                }
            },
        }
    }

    // ─── Header ─────────────────────────────────────────────────────────

    fn begin_header(&mut self, bytes: &[u8]) {
        self.header[..bytes.len()].copy_from_slice(bytes);
        self.header_read = bytes.len();
        self.state = DeframerState::ReadingHeader;
    }

    fn read_header_byte<const DEPTH: usize>(
        &mut self,
        byte: u8,
        store: &mut PacketStore<CAPACITY, DEPTH>,
    ) {
        match byte {
            START_TOKEN => {
                self.stats.header_resyncs += 1;
                trace!(discarded = self.header_read, "header resync");
                self.begin_header(&[byte]);
            }
            ESCAPE_TOKEN => {
                self.stats.malformed_frames += 1;
                debug!(offset = self.header_read, "escape token inside header");
                self.state = DeframerState::WaitingForPacket;
            }
            _ => {
                self.header[self.header_read] = byte;
                self.header_read += 1;
                if self.header_read == HEADER_LEN {
                    self.accept_header(store);
                }
            }
        }
    }

    fn accept_header<const DEPTH: usize>(&mut self, store: &mut PacketStore<CAPACITY, DEPTH>) {
        self.state = DeframerState::WaitingForPacket;

        let Some(header) = PacketHeader::decode(&mut &self.header[..]) else {
            self.stats.invalid_priorities += 1;
            debug!(priority = self.header[1], "invalid priority");
            return;
        };
        let priority = header.priority;
        let Some(slot) = store.new_value(priority) else {
            self.stats.store_overflows += 1;
            debug!(%priority, seq = header.sequence_number, "no free slot, frame dropped");
            return;
        };

        let length = usize::from(header.length);
        if header.is_continuation {
            match self.write_offset_before_break[priority.index()] {
                Some(offset)
                    if slot.sequence_number() == header.sequence_number
                        && slot.len() == offset + length =>
                {
                    self.write_offset_before_break[priority.index()] = None;
                    self.content_read = offset;
                    self.stats.continuations_resumed += 1;
                    trace!(%priority, seq = header.sequence_number, offset, "continuation resumed");
                }
                recorded => {
                    self.stats.continuation_mismatches += 1;
                    debug!(
                        %priority,
                        seq = header.sequence_number,
                        remaining = length,
                        ?recorded,
                        "continuation does not match interrupted packet"
                    );
                    return;
                }
            }
        } else {
            if !slot.start_receive(header) {
                self.stats.malformed_frames += 1;
                debug!(length, capacity = CAPACITY, "declared length exceeds slot capacity");
                return;
            }
            self.write_offset_before_break[priority.index()] = None;
            self.content_read = 0;
        }

        self.priority = priority;
        self.content_len = slot.len();
        self.footer_read = 0;
        self.state = if self.content_read == self.content_len {
            DeframerState::ReadingFooter
        } else {
            DeframerState::ReadingContent
        };
        trace!(%priority, seq = header.sequence_number, length, "header accepted");
    }

    // ─── Content & Footer ───────────────────────────────────────────────

    fn store_content<const DEPTH: usize>(
        &mut self,
        bytes: &[u8],
        store: &mut PacketStore<CAPACITY, DEPTH>,
    ) {
        let Some(slot) = store.new_value(self.priority) else {
            self.state = DeframerState::WaitingForPacket;
            return;
        };
        for &byte in bytes {
            slot.put_content_byte(self.content_read, byte);
            self.content_read += 1;
        }
        self.state = if self.content_read == self.content_len {
            DeframerState::ReadingFooter
        } else {
            DeframerState::ReadingContent
        };
    }

    fn store_footer<C, const DEPTH: usize>(
        &mut self,
        byte: u8,
        store: &mut PacketStore<CAPACITY, DEPTH>,
        clock: &C,
    ) where
        C: MonotonicClock + ?Sized,
    {
        self.footer[self.footer_read] = byte;
        self.footer_read += 1;
        if self.footer_read == CHECKSUM_LEN {
            self.finish_packet(store, clock);
        }
    }

    fn finish_packet<C, const DEPTH: usize>(
        &mut self,
        store: &mut PacketStore<CAPACITY, DEPTH>,
        clock: &C,
    ) where
        C: MonotonicClock + ?Sized,
    {
        self.state = DeframerState::WaitingForPacket;
        let priority = self.priority;
        let Some(slot) = store.new_value(priority) else {
            return;
        };

        slot.set_checksum(u16::from_be_bytes(self.footer));
        if !slot.prepare_to_read() {
            self.stats.checksum_failures += 1;
            debug!(%priority, seq = slot.sequence_number(), "checksum mismatch");
            return;
        }
        if let Some(filter) = self.filter.as_mut() {
            if !filter(&*slot) {
                self.stats.packets_filtered += 1;
                trace!(%priority, seq = slot.sequence_number(), "filtered");
                return;
            }
        }

        slot.set_commit_time(clock.now_nanoseconds());
        trace!(%priority, seq = slot.sequence_number(), len = slot.len(), "committed");
        store.commit(priority);
        self.stats.packets_committed += 1;
    }

    fn interrupt(&mut self, offset: usize) {
        self.write_offset_before_break[self.priority.index()] = Some(offset);
        self.stats.frames_interrupted += 1;
        trace!(priority = %self.priority, offset, "frame interrupted");
    }
}

impl<const CAPACITY: usize> Default for Deframer<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAPACITY: usize> std::fmt::Debug for Deframer<CAPACITY> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deframer")
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("content_read", &self.content_read)
            .field("write_offset_before_break", &self.write_offset_before_break)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
