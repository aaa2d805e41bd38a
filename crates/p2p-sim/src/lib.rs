//! Link simulation for p2p-transport.
//!
//! Provides seeded byte-level impairment for in-memory links and a
//! deterministic two-node loopback runner that reports delivery, loss and
//! per-direction statistics under virtual time.

pub mod impairment;
pub mod loopback;

pub use impairment::{ImpairedLink, ImpairmentConfig, ImpairmentStats};
pub use loopback::{LoopbackConfig, LoopbackReport};
