//! Deterministic two-node loopback runs.
//!
//! Node A queues one packet per tick at a random priority and node B
//! receives them over an in-memory link whose B end is impaired. Time is
//! virtual: a mock clock is advanced by the framer's wait hints, so a run
//! for a given seed always produces the same report.

use std::time::Duration;

use anyhow::{bail, ensure, Result};
use p2p_transport::config::LinkConfig;
use p2p_transport::link::MemoryLink;
use p2p_transport::stats::{ReceiverStats, SenderStats};
use p2p_transport::wire::{Priority, START_TOKEN};
use p2p_transport::{Packet, PacketError, Session, SystemClock};
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::impairment::{ImpairedLink, ImpairmentConfig, ImpairmentStats};

pub const SIM_CAPACITY: usize = 128;
pub const SIM_DEPTH: usize = 8;

/// Largest payload a run may ask for. Even fully stuffed it fits a slot and
/// its length stays below the reserved token values.
pub const MAX_PAYLOAD: usize = 60;

/// Step taken when neither node has anything to wait for.
const IDLE_STEP: Duration = Duration::from_micros(10);

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub seed: u64,
    pub packets: usize,
    pub min_payload: usize,
    pub max_payload: usize,
    pub link: LinkConfig,
    pub impairment: ImpairmentConfig,
    /// Virtual time after which the run gives up.
    pub time_limit: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            seed: 42,
            packets: 100,
            min_payload: 1,
            max_payload: 48,
            link: LinkConfig::default(),
            impairment: ImpairmentConfig::default(),
            time_limit: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopbackReport {
    pub seed: u64,
    pub packets_sent: u64,
    pub packets_delivered: u64,
    pub packets_lost: u64,
    /// Delivered packets whose content did not match what was sent.
    pub corrupt_deliveries: u64,
    pub payload_bytes_delivered: u64,
    pub elapsed_ns: u64,
    pub goodput_bytes_per_sec: f64,
    pub timed_out: bool,
    pub sender: SenderStats,
    pub receiver: ReceiverStats,
    pub impairment: ImpairmentStats,
}

/// Content of packet `seq` on `priority`. Roughly one byte in eleven is a
/// start token so stuffing and preemption points are exercised.
pub fn payload(priority: Priority, seq: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let x = (seq as usize)
                .wrapping_mul(31)
                .wrapping_add(i * 7)
                .wrapping_add(priority.index() * 13);
            if x % 11 == 0 {
                START_TOKEN
            } else {
                x as u8
            }
        })
        .collect()
}

fn matches_payload(packet: &Packet<SIM_CAPACITY>) -> bool {
    packet.content() == payload(packet.priority(), packet.sequence_number(), packet.len())
}

/// Run one loopback exchange to completion or until the time limit.
pub fn run(cfg: &LoopbackConfig) -> Result<LoopbackReport> {
    ensure!(cfg.min_payload <= cfg.max_payload, "min_payload exceeds max_payload");
    ensure!(
        cfg.max_payload <= MAX_PAYLOAD,
        "max_payload {} exceeds {MAX_PAYLOAD}",
        cfg.max_payload
    );

    let (clock, mock) = SystemClock::mock();
    let (a_end, b_end) = MemoryLink::pair(cfg.link.pacing, cfg.link.buffer_capacity);
    let mut a: Session<_, _, SIM_CAPACITY, SIM_DEPTH> = Session::with_seed(a_end, &clock, cfg.seed);
    let mut b: Session<_, _, SIM_CAPACITY, SIM_DEPTH> = Session::with_seed(
        ImpairedLink::new(b_end, cfg.impairment.clone()),
        &clock,
        cfg.seed.wrapping_add(1),
    );

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut next: Option<(Priority, usize)> = None;
    let mut sent = 0u64;
    let mut delivered = 0u64;
    let mut corrupt = 0u64;
    let mut payload_bytes = 0u64;
    let mut elapsed = Duration::ZERO;
    let mut timed_out = false;

    info!(
        seed = cfg.seed,
        packets = cfg.packets,
        clean = cfg.impairment.is_clean(),
        "loopback start"
    );

    loop {
        if (sent as usize) < cfg.packets {
            let (priority, len) = *next.get_or_insert_with(|| {
                let priority = Priority::ALL[rng.random_range(0..Priority::LEVELS)];
                (priority, rng.random_range(cfg.min_payload..=cfg.max_payload))
            });
            let data = payload(priority, a.next_sequence_number(priority), len);
            match a.send(priority, &data, false) {
                Ok(_) => {
                    sent += 1;
                    next = None;
                }
                Err(PacketError::StoreFull { .. }) => {}
                Err(e) => bail!(e),
            }
        }

        let wait = a.poll();
        b.poll();
        while let Some((ok, len)) = b.receive(|p| (matches_payload(p), p.len())) {
            delivered += 1;
            payload_bytes += len as u64;
            if !ok {
                corrupt += 1;
            }
        }

        let drained = (sent as usize) == cfg.packets
            && Priority::ALL.iter().all(|&p| a.pending(p) == 0)
            && b.transport().readable() == 0;
        if wait.is_none() && drained {
            break;
        }
        if elapsed >= cfg.time_limit {
            timed_out = true;
            break;
        }
        let step = wait.unwrap_or(IDLE_STEP).max(Duration::from_nanos(1));
        mock.increment(step);
        elapsed += step;
    }

    let secs = elapsed.as_secs_f64();
    let report = LoopbackReport {
        seed: cfg.seed,
        packets_sent: sent,
        packets_delivered: delivered,
        packets_lost: sent.saturating_sub(delivered),
        corrupt_deliveries: corrupt,
        payload_bytes_delivered: payload_bytes,
        elapsed_ns: elapsed.as_nanos() as u64,
        goodput_bytes_per_sec: if secs > 0.0 {
            payload_bytes as f64 / secs
        } else {
            0.0
        },
        timed_out,
        sender: a.sender_stats().clone(),
        receiver: b.receiver_stats().clone(),
        impairment: b.transport().stats().clone(),
    };
    debug!(?report, "loopback done");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_contains_start_tokens() {
        let data = payload(Priority::Low, 3, 48);
        assert!(data.contains(&START_TOKEN));
        assert_eq!(data, payload(Priority::Low, 3, 48));
        assert_ne!(data, payload(Priority::High, 3, 48));
    }

    #[test]
    fn rejects_oversized_payloads() {
        let cfg = LoopbackConfig {
            max_payload: MAX_PAYLOAD + 1,
            ..Default::default()
        };
        assert!(run(&cfg).is_err());
    }

    #[test]
    fn rejects_inverted_payload_range() {
        let cfg = LoopbackConfig {
            min_payload: 10,
            max_payload: 5,
            ..Default::default()
        };
        assert!(run(&cfg).is_err());
    }

    #[test]
    fn clean_run_delivers_everything() {
        let cfg = LoopbackConfig {
            packets: 30,
            ..Default::default()
        };
        let report = run(&cfg).unwrap();
        assert!(!report.timed_out);
        assert_eq!(report.packets_sent, 30);
        assert_eq!(report.packets_delivered, 30);
        assert_eq!(report.corrupt_deliveries, 0);
        assert_eq!(report.sender.packets_sent(), 30);
        assert_eq!(report.receiver.checksum_failures, 0);
        assert!(report.elapsed_ns > 0);
    }
}
