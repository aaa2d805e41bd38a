//! Seeded byte-level impairment for in-memory links.
//!
//! [`ImpairedLink`] wraps the receiving end of a [`ByteTransport`] and
//! mangles the bytes it reads the way a noisy serial or radio line does:
//! lost bytes, flipped bits, stray start tokens, and short outages that
//! swallow a run of bytes. Writes pass through untouched.

use std::collections::VecDeque;

use p2p_transport::link::{ByteTransport, MemoryLink};
use p2p_transport::wire::START_TOKEN;
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Per-byte impairment probabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpairmentConfig {
    pub seed: u64,
    /// Probability a byte is lost.
    pub drop_probability: f64,
    /// Probability a byte has one random bit flipped.
    pub corrupt_probability: f64,
    /// Probability a stray start token is inserted before a byte.
    pub spurious_start_probability: f64,
    /// Probability an outage begins at a byte.
    pub cut_probability: f64,
    /// Bytes swallowed by one outage.
    pub cut_length: usize,
}

impl ImpairmentConfig {
    pub fn is_clean(&self) -> bool {
        self.drop_probability <= 0.0
            && self.corrupt_probability <= 0.0
            && self.spurious_start_probability <= 0.0
            && self.cut_probability <= 0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImpairmentStats {
    pub bytes_in: u64,
    pub bytes_dropped: u64,
    pub bytes_corrupted: u64,
    pub starts_inserted: u64,
    pub cuts: u64,
}

/// Receiving end of a link with seeded line noise.
#[derive(Debug)]
pub struct ImpairedLink<T> {
    inner: T,
    cfg: ImpairmentConfig,
    rng: StdRng,
    pending: VecDeque<u8>,
    cut_remaining: usize,
    stats: ImpairmentStats,
}

impl<T: ByteTransport> ImpairedLink<T> {
    pub fn new(inner: T, cfg: ImpairmentConfig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        ImpairedLink {
            inner,
            cfg,
            rng,
            pending: VecDeque::new(),
            cut_remaining: 0,
            stats: ImpairmentStats::default(),
        }
    }

    pub fn stats(&self) -> &ImpairmentStats {
        &self.stats
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn chance(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.random::<f64>() < p
    }

    fn impair(&mut self, byte: u8) {
        self.stats.bytes_in += 1;
        if self.cut_remaining > 0 {
            self.cut_remaining -= 1;
            self.stats.bytes_dropped += 1;
            return;
        }
        if self.cfg.cut_length > 0 && self.chance(self.cfg.cut_probability) {
            self.stats.cuts += 1;
            self.stats.bytes_dropped += 1;
            self.cut_remaining = self.cfg.cut_length - 1;
            trace!(len = self.cfg.cut_length, "link cut");
            return;
        }
        if self.chance(self.cfg.drop_probability) {
            self.stats.bytes_dropped += 1;
            return;
        }
        if self.chance(self.cfg.spurious_start_probability) {
            self.stats.starts_inserted += 1;
            self.pending.push_back(START_TOKEN);
        }
        let byte = if self.chance(self.cfg.corrupt_probability) {
            self.stats.bytes_corrupted += 1;
            byte ^ (1 << self.rng.random_range(0..8u32))
        } else {
            byte
        };
        self.pending.push_back(byte);
    }
}

impl ImpairedLink<MemoryLink> {
    /// Bytes readable right now, impaired or not yet impaired.
    pub fn readable(&self) -> usize {
        self.pending.len() + self.inner.readable()
    }
}

impl<T: ByteTransport> ByteTransport for ImpairedLink<T> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut scratch = [0u8; 64];
        while self.pending.len() < buf.len() {
            let n = self.inner.read(&mut scratch);
            if n == 0 {
                break;
            }
            for &b in &scratch[..n] {
                self.impair(b);
            }
        }
        let n = buf.len().min(self.pending.len());
        for (slot, b) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = b;
        }
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.inner.write(buf)
    }

    fn max_burst_length(&self) -> usize {
        self.inner.max_burst_length()
    }

    fn max_atomic_send_length(&self) -> usize {
        self.inner.max_atomic_send_length()
    }

    fn ingestion_nanoseconds_per_byte(&self) -> u64 {
        self.inner.ingestion_nanoseconds_per_byte()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2p_transport::link::LinkPacing;

    fn read_all(link: &mut ImpairedLink<MemoryLink>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = link.read(&mut buf);
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    fn through(cfg: ImpairmentConfig, data: &[u8]) -> (Vec<u8>, ImpairmentStats) {
        let (mut tx, rx) = MemoryLink::pair(LinkPacing::default(), 4096);
        let mut link = ImpairedLink::new(rx, cfg);
        tx.write(data);
        let out = read_all(&mut link);
        (out, link.stats().clone())
    }

    #[test]
    fn clean_link_is_transparent() {
        let data: Vec<u8> = (0..=255).collect();
        let (out, stats) = through(ImpairmentConfig::default(), &data);
        assert_eq!(out, data);
        assert_eq!(stats.bytes_in, 256);
        assert_eq!(stats.bytes_dropped, 0);
    }

    #[test]
    fn drop_everything() {
        let cfg = ImpairmentConfig {
            drop_probability: 1.0,
            ..Default::default()
        };
        let (out, stats) = through(cfg, &[1, 2, 3]);
        assert!(out.is_empty());
        assert_eq!(stats.bytes_dropped, 3);
    }

    #[test]
    fn corruption_flips_exactly_one_bit() {
        let cfg = ImpairmentConfig {
            corrupt_probability: 1.0,
            ..Default::default()
        };
        let data = [0u8; 32];
        let (out, stats) = through(cfg, &data);
        assert_eq!(stats.bytes_corrupted, 32);
        assert!(out.iter().all(|b| b.count_ones() == 1));
    }

    #[test]
    fn spurious_starts_are_inserted() {
        let cfg = ImpairmentConfig {
            spurious_start_probability: 1.0,
            ..Default::default()
        };
        let (out, _) = through(cfg, &[1, 2]);
        assert_eq!(out, vec![START_TOKEN, 1, START_TOKEN, 2]);
    }

    #[test]
    fn cut_swallows_a_run() {
        let cfg = ImpairmentConfig {
            cut_probability: 1.0,
            cut_length: 4,
            ..Default::default()
        };
        let (out, stats) = through(cfg, &[0u8; 10]);
        assert_eq!(stats.cuts, 3);
        assert_eq!(stats.bytes_dropped, 10);
        assert!(out.is_empty());
    }

    #[test]
    fn same_seed_same_noise() {
        let cfg = ImpairmentConfig {
            seed: 99,
            drop_probability: 0.1,
            corrupt_probability: 0.1,
            spurious_start_probability: 0.05,
            ..Default::default()
        };
        let data: Vec<u8> = (0..200u8).collect();
        assert_eq!(through(cfg.clone(), &data), through(cfg, &data));
    }
}
