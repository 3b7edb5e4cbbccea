//! Property-based tests for frame encoding/decoding
//!
//! Verifies the frame codec for ALL valid headers and payloads, and that
//! arbitrary datagrams never panic the decoder.

use bytes::Bytes;
use fieldsec_proto::{
    Frame, FrameFlags, MAX_U48, Payload, ProtocolError, SecureHeader, ServiceType,
    SessionChallenge, SessionRequest, SessionResponse, SessionStatus, StatusCode,
};
use proptest::prelude::*;

fn arbitrary_service() -> impl Strategy<Value = ServiceType> {
    prop_oneof![
        Just(ServiceType::SecureData),
        Just(ServiceType::SessionRequest),
        Just(ServiceType::SessionChallenge),
        Just(ServiceType::SessionResponse),
        Just(ServiceType::SessionStatus),
        Just(ServiceType::TimerNotify),
    ]
}

fn arbitrary_header() -> impl Strategy<Value = SecureHeader> {
    (
        arbitrary_service(),
        any::<u8>(),      // flags
        any::<u16>(),     // channel_id
        0..=MAX_U48,      // sender_id
        0..=MAX_U48,      // sequence
        any::<[u8; 16]>() // tag
    )
        .prop_map(|(service, flags, channel_id, sender_id, sequence, tag)| {
            let mut header = SecureHeader::new(service);
            header.set_flags(FrameFlags::from_byte(flags));
            header.set_channel_id(channel_id);
            header.set_sender_id(sender_id);
            header.set_sequence(sequence);
            header.set_tag(tag);
            header
        })
}

fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (
        arbitrary_header(),
        prop::collection::vec(any::<u8>(), 0..=SecureHeader::MAX_PAYLOAD_SIZE as usize),
    )
        .prop_map(|(header, payload)| Frame::new(header, Bytes::from(payload)))
}

fn arbitrary_status() -> impl Strategy<Value = StatusCode> {
    prop_oneof![
        Just(StatusCode::AuthSuccess),
        Just(StatusCode::AuthFailed),
        Just(StatusCode::Unauthenticated),
        Just(StatusCode::Timeout),
        Just(StatusCode::KeepAlive),
        Just(StatusCode::Close),
    ]
}

fn arbitrary_payload() -> impl Strategy<Value = Payload> {
    prop_oneof![
        (any::<u8>(), any::<[u8; 16]>()).prop_map(|(user_id, client_nonce)| {
            Payload::SessionRequest(SessionRequest { user_id, client_nonce })
        }),
        (1..=u16::MAX, any::<[u8; 16]>()).prop_map(|(session_id, challenge)| {
            Payload::SessionChallenge(SessionChallenge { session_id, challenge })
        }),
        any::<[u8; 16]>()
            .prop_map(|response| Payload::SessionResponse(SessionResponse { response })),
        arbitrary_status().prop_map(|status| Payload::SessionStatus(SessionStatus::new(status))),
        prop::collection::vec(any::<u8>(), 0..256)
            .prop_map(|data| Payload::SecureData(Bytes::from(data))),
        Just(Payload::TimerNotify),
    ]
}

#[test]
fn prop_frame_encode_decode_roundtrip() {
    proptest!(|(frame in arbitrary_frame())| {
        let bytes = frame.to_vec().expect("encode should succeed");
        let decoded = Frame::decode(&bytes).expect("decode should succeed");

        // PROPERTY: Round-trip must be identity
        prop_assert_eq!(decoded, frame);
    });
}

#[test]
fn prop_payload_survives_framing() {
    proptest!(|(payload in arbitrary_payload(), header in arbitrary_header())| {
        let frame = payload.clone().into_frame(header).expect("into_frame should succeed");
        let bytes = frame.to_vec().expect("encode should succeed");
        let decoded = Frame::decode(&bytes).expect("decode should succeed");

        // PROPERTY: header service matches payload and the payload decodes back
        prop_assert_eq!(decoded.header.service_type(), Some(payload.service()));
        prop_assert_eq!(Payload::from_frame(&decoded).expect("payload should decode"), payload);
    });
}

#[test]
fn prop_decode_never_panics() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..2048))| {
        // PROPERTY: arbitrary datagrams produce Ok or Err, never a panic
        if let Ok(frame) = Frame::decode(&bytes) {
            let _ = Payload::from_frame(&frame);
        }
    });
}

#[test]
fn prop_truncation_is_detected() {
    proptest!(|(frame in arbitrary_frame(), cut in 1usize..64)| {
        prop_assume!(!frame.payload.is_empty());
        let bytes = frame.to_vec().expect("encode should succeed");
        let cut = cut.min(frame.payload.len());

        let result = Frame::decode(&bytes[..bytes.len() - cut]);

        // PROPERTY: a short payload is always reported, never padded
        let is_truncated = matches!(result, Err(ProtocolError::FrameTruncated { .. }));
        prop_assert!(is_truncated);
    });
}
