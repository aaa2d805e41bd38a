//! # Byte Transports
//!
//! The engines see the link through [`ByteTransport`]: non-blocking reads
//! and writes of raw bytes plus the pacing parameters the framer needs.
//! Two implementations ship here, an in-memory pair for tests and
//! simulation and an adapter over any non-blocking `Read + Write` stream.

use std::io::{self, Read, Write};
use std::time::Duration;

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::warn;

/// Raw, non-blocking byte link.
pub trait ByteTransport {
    /// Fill as much of `buf` as is available. Zero means nothing to read.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Write a prefix of `buf`, returning how much was accepted.
    fn write(&mut self, buf: &[u8]) -> usize;

    fn max_burst_length(&self) -> usize;

    fn max_atomic_send_length(&self) -> usize;

    /// Time the far end needs to absorb one byte.
    fn ingestion_nanoseconds_per_byte(&self) -> u64;
}

impl<T: ByteTransport + ?Sized> ByteTransport for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        (**self).write(buf)
    }

    fn max_burst_length(&self) -> usize {
        (**self).max_burst_length()
    }

    fn max_atomic_send_length(&self) -> usize {
        (**self).max_atomic_send_length()
    }

    fn ingestion_nanoseconds_per_byte(&self) -> u64 {
        (**self).ingestion_nanoseconds_per_byte()
    }
}

// ─── Pacing ─────────────────────────────────────────────────────────────────

/// Pacing parameters of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkPacing {
    /// Bytes written before the framer must wait for ingestion.
    pub max_burst_length: usize,
    /// Largest single write the link accepts without splitting.
    pub max_atomic_send_length: usize,
    pub ingestion_ns_per_byte: u64,
}

impl LinkPacing {
    /// Serial line time of one 8N1 byte (10 bit times) at `baud`.
    pub fn ns_per_byte_at_baud(baud: u32) -> u64 {
        10_000_000_000 / u64::from(baud.max(1))
    }

    /// How long the far end needs for `bytes` bytes.
    pub fn ingestion_time(&self, bytes: usize) -> Duration {
        Duration::from_nanos(self.ingestion_ns_per_byte.saturating_mul(bytes as u64))
    }
}

impl Default for LinkPacing {
    fn default() -> Self {
        LinkPacing {
            max_burst_length: 64,
            max_atomic_send_length: 32,
            ingestion_ns_per_byte: Self::ns_per_byte_at_baud(115_200),
        }
    }
}

// ─── In-Memory Link ─────────────────────────────────────────────────────────

/// One end of a bounded, full-duplex in-memory link.
pub struct MemoryLink {
    tx: Producer<u8>,
    rx: Consumer<u8>,
    pacing: LinkPacing,
}

impl MemoryLink {
    /// Two connected ends, each direction buffering up to `capacity` bytes.
    pub fn pair(pacing: LinkPacing, capacity: usize) -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = RingBuffer::new(capacity);
        let (b_tx, a_rx) = RingBuffer::new(capacity);
        (
            MemoryLink {
                tx: a_tx,
                rx: a_rx,
                pacing,
            },
            MemoryLink {
                tx: b_tx,
                rx: b_rx,
                pacing,
            },
        )
    }

    pub fn pacing(&self) -> LinkPacing {
        self.pacing
    }

    /// Bytes waiting to be read on this end.
    pub fn readable(&self) -> usize {
        self.rx.slots()
    }

    /// Whether the far end has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_abandoned()
    }
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLink")
            .field("readable", &self.rx.slots())
            .field("writable", &self.tx.slots())
            .field("pacing", &self.pacing)
            .finish()
    }
}

impl ByteTransport for MemoryLink {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop() {
                Ok(b) => {
                    buf[n] = b;
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let mut n = 0;
        for &b in buf {
            if self.tx.push(b).is_err() {
                break;
            }
            n += 1;
        }
        n
    }

    fn max_burst_length(&self) -> usize {
        self.pacing.max_burst_length
    }

    fn max_atomic_send_length(&self) -> usize {
        self.pacing.max_atomic_send_length
    }

    fn ingestion_nanoseconds_per_byte(&self) -> u64 {
        self.pacing.ingestion_ns_per_byte
    }
}

// ─── Stream Adapter ─────────────────────────────────────────────────────────

/// Adapter over a non-blocking stream such as a serial port or socket.
///
/// Would-block and interrupted calls count as zero bytes. Any other error
/// is logged and parked until [`IoTransport::take_error`] collects it, at
/// which point the owner is expected to reconnect and reset its engines.
#[derive(Debug)]
pub struct IoTransport<S> {
    stream: S,
    pacing: LinkPacing,
    error: Option<io::Error>,
}

impl<S: Read + Write> IoTransport<S> {
    pub fn new(stream: S, pacing: LinkPacing) -> Self {
        IoTransport {
            stream,
            pacing,
            error: None,
        }
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn park(&mut self, op: &'static str, err: io::Error) -> usize {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
            _ => {
                warn!(op, error = %err, "transport fault");
                self.error = Some(err);
            }
        }
        0
    }
}

impl<S: Read + Write> ByteTransport for IoTransport<S> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.error.is_some() {
            return 0;
        }
        match self.stream.read(buf) {
            Ok(n) => n,
            Err(e) => self.park("read", e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        if self.error.is_some() {
            return 0;
        }
        match self.stream.write(buf) {
            Ok(n) => n,
            Err(e) => self.park("write", e),
        }
    }

    fn max_burst_length(&self) -> usize {
        self.pacing.max_burst_length
    }

    fn max_atomic_send_length(&self) -> usize {
        self.pacing.max_atomic_send_length
    }

    fn ingestion_nanoseconds_per_byte(&self) -> u64 {
        self.pacing.ingestion_ns_per_byte
    }
}
