//! Fuzz target for Frame::decode
//!
//! This fuzzer tests frame decoding with arbitrary datagrams to find:
//! - Parser crashes or panics
//! - Length fields that read past the datagram
//! - Headers that bypass structural validation
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use fieldsec_proto::{Frame, SecureHeader};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode(data) else {
        return;
    };

    // A decoded frame re-encodes to exactly the bytes it was read from;
    // trailing datagram bytes are never part of it
    let consumed = SecureHeader::SIZE + frame.payload.len();
    assert!(consumed <= data.len());
    assert!(frame.payload.len() <= SecureHeader::MAX_PAYLOAD_SIZE as usize);

    let encoded = frame.to_vec().expect("decoded frame must re-encode");
    assert_eq!(encoded.as_slice(), &data[..consumed]);
});
