//! Fuzz target for the gateway side of the handshake
//!
//! An attacker without any user password sends arbitrary datagrams from a
//! handful of addresses while time passes.
//!
//! # Invariants
//!
//! - No session is ever established
//! - No application data is ever delivered
//! - Nothing panics, whatever the frame claims

#![no_main]

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use arbitrary::Arbitrary;
use fieldsec_core::{Responder, ResponderAction, SessionConfig, env::test_utils::MockEnv};
use fieldsec_crypto::DerivedKey;
use fieldsec_proto::Frame;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    Datagram { peer: u8, bytes: Vec<u8> },
    Wait { millis: u16 },
}

fuzz_target!(|steps: Vec<Step>| {
    let env = MockEnv::with_seed(7);
    let start = Instant::now();
    let mut elapsed = Duration::ZERO;

    let mut responder = Responder::new(SessionConfig::default());
    responder.add_user(1, DerivedKey::from_bytes([0x11; 16]));

    for step in steps.into_iter().take(256) {
        let actions = match step {
            Step::Datagram { peer, bytes } => {
                let Ok(frame) = Frame::decode(&bytes) else {
                    continue;
                };
                let from = SocketAddr::from(([10, 0, 0, peer % 4], 3671));
                responder.handle_frame(&env, from, &frame, start + elapsed).unwrap_or_default()
            },
            Step::Wait { millis } => {
                elapsed += Duration::from_millis(u64::from(millis));
                responder.tick(start + elapsed)
            },
        };

        for action in actions {
            assert!(
                !matches!(
                    action,
                    ResponderAction::SessionEstablished { .. } | ResponderAction::Deliver { .. }
                ),
                "attacker without a password got {action:?}"
            );
        }
    }
});
