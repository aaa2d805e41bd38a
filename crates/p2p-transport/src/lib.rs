//! # p2p-transport
//!
//! Point-to-point packet transport for byte links without native framing,
//! such as a serial line or a radio modem.
//!
//! Packets are byte-stuffed, checksummed and scheduled by priority. Both
//! directions run as non-blocking state machines ticked from an external
//! loop, resynchronize on the next start token after a glitch, and pace
//! their output to the far end's ingestion rate. A higher-priority packet
//! may preempt a lower-priority one mid-content; the interrupted packet is
//! resumed later as a continuation.
//!
//! ## Crate structure
//!
//! - [`wire`]: Header layout, reserved tokens, checksum, byte stuffing
//! - [`pool`]: Packet slots and the per-priority packet store
//! - [`clock`]: Monotonic clock seam (quanta-backed)
//! - [`link`]: Byte transport seam, in-memory link, stream adapter
//! - [`config`]: Link configuration from TOML
//! - [`receiver`]: Deframer state machine
//! - [`sender`]: Framer, scheduler and pacer state machine
//! - [`stats`]: Sender and receiver statistics
//! - [`session`]: Both engines composed over one transport

pub mod clock;
pub mod config;
pub mod link;
pub mod pool;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod wire;

pub use clock::{MonotonicClock, SystemClock};
pub use link::{ByteTransport, IoTransport, LinkPacing, MemoryLink};
pub use pool::{Packet, PacketError, PacketFilter, PacketStore};
pub use receiver::Deframer;
pub use sender::Framer;
pub use session::Session;
pub use wire::{PacketHeader, Priority};
