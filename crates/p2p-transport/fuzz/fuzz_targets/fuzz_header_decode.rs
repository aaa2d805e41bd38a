#![no_main]

use libfuzzer_sys::fuzz_target;
use p2p_transport::wire::PacketHeader;

// Decoding arbitrary bytes must never panic, and a decoded header must
// re-encode to the same 13 bytes apart from ignored flag bits.
fuzz_target!(|data: &[u8]| {
    let mut buf = data;
    if let Some(header) = PacketHeader::decode(&mut buf) {
        let encoded = header.to_bytes();
        assert_eq!(encoded[..2], data[..2]);
        assert_eq!(encoded[3..], data[3..13]);
        assert_eq!(encoded[2], data[2] & 0b111);
    }
});
