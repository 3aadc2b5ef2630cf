//! Fuzz target for frame header boundary conditions
//!
//! # Strategy
//!
//! - Magic bytes: valid, off-by-one, all-zeros, random
//! - Payload size: zero, small, at-max, just-over-max, `u32::MAX`
//! - Version: valid (0x01), zero, random
//! - Truncation: fewer payload bytes than claimed
//!
//! # Invariants
//!
//! - `payload_size > MAX_PAYLOAD_SIZE` returns `PayloadTooLarge`
//! - Invalid magic returns `InvalidMagic`
//! - Header errors are fatal; nothing here may panic
//! - A decoded frame re-encodes to exactly `SIZE + payload_size` bytes

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomcast_proto::{Frame, FrameHeader, ProtocolError};

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryFrame {
    magic: MagicBytes,
    version: u8,
    payload_size: PayloadSize,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Arbitrary)]
enum MagicBytes {
    Valid,
    OffByOne,
    Zero,
    Random(u32),
}

#[derive(Debug, Clone, Arbitrary)]
enum PayloadSize {
    Exact,
    Zero,
    AtMax,
    JustOverMax,
    Max,
    Random(u32),
}

fuzz_target!(|input: BoundaryFrame| {
    let magic = match input.magic {
        MagicBytes::Valid => FrameHeader::MAGIC,
        MagicBytes::OffByOne => FrameHeader::MAGIC.wrapping_add(1),
        MagicBytes::Zero => 0,
        MagicBytes::Random(v) => v,
    };
    let payload_size = match input.payload_size {
        PayloadSize::Exact => input.payload.len() as u32,
        PayloadSize::Zero => 0,
        PayloadSize::AtMax => FrameHeader::MAX_PAYLOAD_SIZE,
        PayloadSize::JustOverMax => FrameHeader::MAX_PAYLOAD_SIZE + 1,
        PayloadSize::Max => u32::MAX,
        PayloadSize::Random(v) => v,
    };

    let mut bytes = Vec::with_capacity(FrameHeader::SIZE + input.payload.len());
    bytes.extend_from_slice(&magic.to_be_bytes());
    bytes.push(input.version);
    bytes.extend_from_slice(&[0; 3]);
    bytes.extend_from_slice(&payload_size.to_be_bytes());
    bytes.extend_from_slice(&input.payload);

    match FrameHeader::from_bytes(&bytes) {
        Ok(header) => {
            assert_eq!(magic, FrameHeader::MAGIC);
            assert_eq!(header.version(), FrameHeader::VERSION);
            assert!(header.payload_size() <= FrameHeader::MAX_PAYLOAD_SIZE);
        },
        Err(ProtocolError::InvalidMagic) => assert_ne!(magic, FrameHeader::MAGIC),
        Err(ProtocolError::PayloadTooLarge { .. }) => {
            assert!(payload_size > FrameHeader::MAX_PAYLOAD_SIZE);
        },
        Err(e) => assert!(e.is_fatal()),
    }

    if let Ok(frame) = Frame::decode(&bytes) {
        let mut encoded = Vec::new();
        frame.encode(&mut encoded).expect("decoded frame must re-encode");
        assert_eq!(encoded.len(), FrameHeader::SIZE + frame.payload.len());
        assert_eq!(frame.payload.len(), payload_size as usize);
    }
});
