#![no_main]

use libfuzzer_sys::fuzz_target;
use p2p_transport::clock::SystemClock;
use p2p_transport::pool::PacketStore;
use p2p_transport::receiver::Deframer;

/// Fuzz the deframer state machine with arbitrary line bytes.
///
/// This target exercises:
/// - Header resynchronization on stray start tokens
/// - Start token disambiguation in content and footer
/// - Continuation matching against recorded break offsets
/// - Checksum validation and in-place unstuffing
/// - Store overflow when nothing drains the inbound queue
///
/// The deframer must never panic, even on garbage input.
fuzz_target!(|data: &[u8]| {
    let (clock, _) = SystemClock::mock();
    let mut deframer = Deframer::<64>::new();
    let mut store = PacketStore::<64, 2>::new();
    deframer.push_bytes(data, &mut store, &clock);

    // Every committed packet must have been unstuffed to fit its slot.
    while let Some(packet) = store.oldest_value() {
        assert!(packet.len() <= 64);
        let priority = packet.priority();
        store.consume(priority);
    }
});
