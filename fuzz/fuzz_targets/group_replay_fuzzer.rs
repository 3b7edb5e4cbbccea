//! Fuzz target for the multicast group's replay windows
//!
//! An attacker controls the order in which recorded group frames arrive,
//! replays any of them, corrupts some, and lets time pass between them.
//!
//! # Invariants
//!
//! - No (sender, sequence) pair is delivered twice while its window is live
//! - Every delivered payload is the one its sender sealed
//! - Each sender's deliveries rise strictly while its window is live
//! - The sender table never exceeds its capacity

#![no_main]

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use arbitrary::Arbitrary;
use bytes::Bytes;
use fieldsec_core::{GroupAction, GroupConfig, MulticastGroup, SequenceCounter};
use fieldsec_crypto::DerivedKey;
use libfuzzer_sys::fuzz_target;

const SENDERS: u64 = 4;

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    /// A legitimate sender emits a new frame
    Send { sender: u8, payload: Vec<u8> },
    /// A previously recorded frame arrives again
    Replay { index: u16 },
    /// A recorded frame arrives with one byte changed
    Corrupt { index: u16, offset: u16, mask: u8 },
    /// Time passes
    Wait { millis: u16 },
    /// Raw datagram
    Raw(Vec<u8>),
}

fn key() -> DerivedKey {
    DerivedKey::from_bytes([0x42; 16])
}

fuzz_target!(|steps: Vec<Step>| {
    let start = Instant::now();
    let config = GroupConfig { max_senders: 2, ..GroupConfig::default() };

    let mut senders: Vec<MulticastGroup> = (1..=SENDERS)
        .map(|id| {
            MulticastGroup::new(key(), id, SequenceCounter::starting_at(id * 1000), config, start)
                .expect("valid sender")
        })
        .collect();
    let mut receiver =
        MulticastGroup::new(key(), 0xFF, SequenceCounter::starting_at(0), config, start)
            .expect("valid receiver");

    let mut recorded: Vec<Vec<u8>> = Vec::new();
    let mut sealed: HashMap<(u64, u64), Bytes> = HashMap::new();
    let mut delivered: HashSet<(u64, u64)> = HashSet::new();
    let mut last_delivered: HashMap<u64, u64> = HashMap::new();
    let mut elapsed = Duration::ZERO;

    for step in steps.into_iter().take(256) {
        let now = start + elapsed;

        let datagram = match step {
            Step::Send { sender, payload } => {
                let sender = &mut senders[usize::from(sender) % senders.len()];
                let payload = Bytes::from(payload);
                let Ok(frame) = sender.seal(payload.clone(), now) else {
                    continue;
                };
                sealed.insert((sender.local_sender(), frame.header.sequence()), payload);
                let bytes = frame.to_vec().expect("sealed frame encodes");
                recorded.push(bytes.clone());
                bytes
            },
            Step::Replay { index } => {
                if recorded.is_empty() {
                    continue;
                }
                recorded[usize::from(index) % recorded.len()].clone()
            },
            Step::Corrupt { index, offset, mask } => {
                if recorded.is_empty() || mask == 0 {
                    continue;
                }
                let mut bytes = recorded[usize::from(index) % recorded.len()].clone();
                let position = usize::from(offset) % bytes.len();
                bytes[position] ^= mask;
                bytes
            },
            Step::Wait { millis } => {
                elapsed += Duration::from_millis(u64::from(millis));
                let actions = receiver.tick(start + elapsed).unwrap_or_default();
                check(actions, &sealed, &mut delivered, &mut last_delivered);
                continue;
            },
            Step::Raw(bytes) => bytes,
        };

        let actions = receiver.handle_datagram(&datagram, now);
        check(actions, &sealed, &mut delivered, &mut last_delivered);

        assert!(receiver.sender_count() <= config.max_senders);
    }
});

fn check(
    actions: Vec<GroupAction>,
    sealed: &HashMap<(u64, u64), Bytes>,
    delivered: &mut HashSet<(u64, u64)>,
    last_delivered: &mut HashMap<u64, u64>,
) {
    for action in actions {
        match action {
            GroupAction::Deliver { sender_id, sequence, payload } => {
                assert_eq!(sealed.get(&(sender_id, sequence)), Some(&payload), "forged delivery");
                assert!(
                    delivered.insert((sender_id, sequence)),
                    "sender {sender_id} sequence {sequence} delivered twice"
                );
                if let Some(previous) = last_delivered.insert(sender_id, sequence) {
                    assert!(previous < sequence, "sender {sender_id} delivered {sequence} after {previous}");
                }
            },
            // Eviction forgets old pairs; a later replay is accepted once
            GroupAction::SenderEvicted { sender_id } => {
                delivered.retain(|(sender, _)| *sender != sender_id);
                last_delivered.remove(&sender_id);
            },
            _ => {},
        }
    }
}
