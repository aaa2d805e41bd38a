//! # Transport Statistics
//!
//! Counters kept by the framer and deframer. Everything serializes to JSON
//! so a host process can dump a snapshot next to its own telemetry.

use std::time::Duration;

use serde::Serialize;

use crate::wire::Priority;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Delivery accounting for one priority level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PriorityStats {
    /// Packets fully written for the first time.
    pub packets_sent: u64,
    /// Packets re-sent with a sequence number not above the last one sent.
    pub retransmissions: u64,
    /// First-time packets that asked for an acknowledgement.
    pub reliable_packets: u64,
    /// Sum of commit-to-sent latency over `packets_sent`, in ns.
    pub total_latency_ns: u64,
    /// Sum of per-packet latency divided by its wire length, in ns.
    pub total_latency_per_byte_ns: u64,
}

impl PriorityStats {
    pub(crate) fn record_delivery(&mut self, latency_ns: u64, wire_len: usize, reliable: bool) {
        self.packets_sent += 1;
        if reliable {
            self.reliable_packets += 1;
        }
        self.total_latency_ns = self.total_latency_ns.saturating_add(latency_ns);
        self.total_latency_per_byte_ns = self
            .total_latency_per_byte_ns
            .saturating_add(latency_ns / wire_len.max(1) as u64);
    }

    pub(crate) fn record_retransmission(&mut self) {
        self.retransmissions += 1;
    }

    /// Mean commit-to-sent latency of first-time packets.
    pub fn average_latency(&self) -> Duration {
        match self.packets_sent {
            0 => Duration::ZERO,
            n => Duration::from_nanos(self.total_latency_ns / n),
        }
    }

    /// Retransmission overhead ratio.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.packets_sent as f64
        }
    }
}

/// Aggregate framer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SenderStats {
    /// Indexed by [`Priority::index`].
    pub priorities: [PriorityStats; Priority::LEVELS],
    /// Packets cut short so a higher priority could go first.
    pub preemptions: u64,
    /// Bytes accepted by the transport.
    pub bytes_written: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(&self, priority: Priority) -> &PriorityStats {
        &self.priorities[priority.index()]
    }

    pub(crate) fn priority_mut(&mut self, priority: Priority) -> &mut PriorityStats {
        &mut self.priorities[priority.index()]
    }

    /// First-time packets across all priorities.
    pub fn packets_sent(&self) -> u64 {
        self.priorities.iter().map(|p| p.packets_sent).sum()
    }

    pub fn retransmissions(&self) -> u64 {
        self.priorities.iter().map(|p| p.retransmissions).sum()
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Aggregate deframer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStats {
    pub bytes_read: u64,
    /// Packets validated and published to the inbound store.
    pub packets_committed: u64,
    pub checksum_failures: u64,
    /// Valid packets dropped by the inbound filter.
    pub packets_filtered: u64,
    /// Headers dropped because their priority had no free slot.
    pub store_overflows: u64,
    pub invalid_priorities: u64,
    /// Escape bytes where they cannot appear, or content longer than a slot.
    pub malformed_frames: u64,
    /// START seen mid-header; the header restarts.
    pub header_resyncs: u64,
    /// Packets broken off by the start of another one.
    pub frames_interrupted: u64,
    pub continuations_resumed: u64,
    /// Continuation headers that did not match the recorded break.
    pub continuation_mismatches: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames discarded for any reason other than filtering.
    pub fn frames_dropped(&self) -> u64 {
        self.checksum_failures
            + self.store_overflows
            + self.invalid_priorities
            + self.malformed_frames
            + self.continuation_mismatches
    }
}

// ─── Session Stats ──────────────────────────────────────────────────────────

/// Both directions of one session, as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub sender: SenderStats,
    pub receiver: ReceiverStats,
}
