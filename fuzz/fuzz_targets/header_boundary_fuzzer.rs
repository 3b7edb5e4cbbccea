//! Fuzz target for secure header boundary conditions
//!
//! # Strategy
//!
//! - Magic: valid, off-by-one, all-zeros, random
//! - Version: valid (0x01), zero, random
//! - Payload size: zero, at-max, just-over-max, u16::MAX, random
//! - Sender and sequence: 48-bit boundaries
//!
//! # Invariants
//!
//! - `payload_size > 1400` MUST return `ProtocolError::PayloadTooLarge`
//! - Invalid magic MUST return `ProtocolError::InvalidMagic`
//! - A datagram shorter than the claimed payload MUST return
//!   `ProtocolError::FrameTruncated`
//! - 48-bit fields decode to at most `MAX_U48`

#![no_main]

use arbitrary::Arbitrary;
use fieldsec_proto::{Frame, MAX_U48, ProtocolError, SecureHeader};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryHeader {
    magic: MagicBytes,
    version: VersionByte,
    flags: u8,
    service: u16,
    payload_size: PayloadSize,
    channel_id: u16,
    sender_id: [u8; 6],
    sequence: [u8; 6],
    tag: [u8; 16],
    body: Vec<u8>,
}

#[derive(Debug, Clone, Arbitrary)]
enum MagicBytes {
    Valid,
    OffByOne(u8),
    AllZeros,
    Random([u8; 2]),
}

#[derive(Debug, Clone, Arbitrary)]
enum VersionByte {
    Valid,
    Zero,
    Random(u8),
}

#[derive(Debug, Clone, Arbitrary)]
enum PayloadSize {
    Zero,
    AtMax,
    JustOverMax,
    MaxU16,
    Random(u16),
}

fuzz_target!(|boundary: BoundaryHeader| {
    let mut buffer = vec![0u8; SecureHeader::SIZE];

    let magic = match boundary.magic {
        MagicBytes::Valid => SecureHeader::MAGIC.to_be_bytes(),
        MagicBytes::OffByOne(offset) => {
            let mut magic = SecureHeader::MAGIC.to_be_bytes();
            let idx = (offset % 2) as usize;
            magic[idx] = magic[idx].wrapping_add(1);
            magic
        },
        MagicBytes::AllZeros => [0, 0],
        MagicBytes::Random(bytes) => bytes,
    };
    buffer[0..2].copy_from_slice(&magic);

    buffer[2] = match boundary.version {
        VersionByte::Valid => SecureHeader::VERSION,
        VersionByte::Zero => 0,
        VersionByte::Random(v) => v,
    };
    buffer[3] = boundary.flags;
    buffer[4..6].copy_from_slice(&boundary.service.to_be_bytes());

    let payload_size = match boundary.payload_size {
        PayloadSize::Zero => 0,
        PayloadSize::AtMax => SecureHeader::MAX_PAYLOAD_SIZE,
        PayloadSize::JustOverMax => SecureHeader::MAX_PAYLOAD_SIZE + 1,
        PayloadSize::MaxU16 => u16::MAX,
        PayloadSize::Random(r) => r,
    };
    buffer[6..8].copy_from_slice(&payload_size.to_be_bytes());
    buffer[8..10].copy_from_slice(&boundary.channel_id.to_be_bytes());
    buffer[10..16].copy_from_slice(&boundary.sender_id);
    buffer[16..22].copy_from_slice(&boundary.sequence);
    buffer[22..38].copy_from_slice(&boundary.tag);
    buffer.extend_from_slice(&boundary.body);

    let magic_valid = magic == SecureHeader::MAGIC.to_be_bytes();
    let version_valid = buffer[2] == SecureHeader::VERSION;

    match Frame::decode(&buffer) {
        Ok(frame) => {
            assert!(magic_valid && version_valid);
            assert!(payload_size <= SecureHeader::MAX_PAYLOAD_SIZE);
            assert!(boundary.body.len() >= payload_size as usize);
            assert!(frame.header.sender_id() <= MAX_U48);
            assert!(frame.header.sequence() <= MAX_U48);
            assert_eq!(frame.header.channel_id(), boundary.channel_id);
        },
        Err(ProtocolError::InvalidMagic) => assert!(!magic_valid),
        Err(ProtocolError::UnsupportedVersion(_)) => assert!(magic_valid && !version_valid),
        Err(ProtocolError::PayloadTooLarge { .. }) => {
            assert!(payload_size > SecureHeader::MAX_PAYLOAD_SIZE);
        },
        Err(ProtocolError::FrameTruncated { .. }) => {
            assert!(boundary.body.len() < payload_size as usize);
        },
        Err(_) => {},
    }
});
