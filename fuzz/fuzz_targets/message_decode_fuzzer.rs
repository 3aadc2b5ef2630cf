//! Fuzz target for event payload decoding
//!
//! Arbitrary bytes as CBOR payloads for both directions, plus structured
//! CBOR that is well-formed but the wrong shape.
//!
//! # Invariants
//!
//! - Decoding never panics
//! - Payload failures are never fatal (the connection survives them)
//! - Anything that decodes re-encodes and decodes to the same event

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomcast_proto::{ClientMessage, Frame, ServerMessage};

#[derive(Debug, Clone, Arbitrary)]
enum Input {
    Raw(Vec<u8>),
    Tagged { tag: String, fields: Vec<(String, u64)> },
    Nested { depth: u8 },
}

fuzz_target!(|input: Input| {
    let payload = match input {
        Input::Raw(bytes) => bytes,
        Input::Tagged { tag, fields } => {
            // A map keyed by an arbitrary event name, with arbitrary fields
            let mut buf = Vec::new();
            buf.push(0xa1);
            push_text(&mut buf, &tag);
            buf.push(0xa0 | (fields.len().min(23) as u8));
            for (name, value) in fields.iter().take(23) {
                push_text(&mut buf, name);
                buf.push(0x1b);
                buf.extend_from_slice(&value.to_be_bytes());
            }
            buf
        },
        Input::Nested { depth } => {
            let mut buf = vec![0x81; depth as usize];
            buf.push(0x00);
            buf
        },
    };

    let frame = Frame::new(payload);

    match ClientMessage::from_frame(&frame) {
        Ok(message) => {
            let again = message.into_frame().expect("decoded event must re-encode");
            assert_eq!(ClientMessage::from_frame(&again).ok(), Some(message));
        },
        Err(e) => assert!(!e.is_fatal()),
    }

    match ServerMessage::from_frame(&frame) {
        Ok(message) => {
            let again = message.into_frame().expect("decoded event must re-encode");
            assert_eq!(ServerMessage::from_frame(&again).ok(), Some(message));
        },
        Err(e) => assert!(!e.is_fatal()),
    }
});

fn push_text(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.push(0x79);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&bytes[..len]);
}
