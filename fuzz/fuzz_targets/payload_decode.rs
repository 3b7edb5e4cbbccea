//! Fuzz target for Payload::decode
//!
//! This fuzzer tests payload deserialization for every service type with:
//! - Malformed CBOR in handshake and status messages
//! - Type confusion (a payload decoded under the wrong service)
//! - Truncated nonces, challenges and responses
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use fieldsec_proto::{Payload, ServiceType};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let services = [
        ServiceType::SecureData,
        ServiceType::SessionRequest,
        ServiceType::SessionChallenge,
        ServiceType::SessionResponse,
        ServiceType::SessionStatus,
        ServiceType::TimerNotify,
    ];

    for service in services {
        let Ok(payload) = Payload::decode(service, data) else {
            continue;
        };

        // Whatever decodes must encode again
        let mut encoded = Vec::new();
        assert!(payload.encode(&mut encoded).is_ok());
        assert_eq!(payload.service(), service);
    }
});
