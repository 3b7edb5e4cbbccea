//! Secure multicast group.
//!
//! Every member shares the group key. Each sender stamps its frames with its
//! own 48-bit counter; each receiver keeps one replay window per sender.
//!
//! ```text
//!  sender A ──┐                      ┌── window[A] ── Deliver(A, seq)
//!  sender B ──┼── group key MAC ─────┼── window[B] ── Deliver(B, seq)
//!  sender C ──┘                      └── window[C] ── Deliver(C, seq)
//! ```
//!
//! # Sender Lifecycle
//!
//! A sender's window is created by its first authentic frame and evicted
//! once the sender has been silent for longer than the inactivity threshold,
//! or when the sender table is full and it is the least recently heard.
//! After eviction its next frame is treated as coming from a fresh sender.
//! This bounds memory at the cost of replay protection for frames older than
//! the eviction: a frame recorded before the eviction and replayed after it
//! is accepted once. Silent senders emit `TimerNotify` every sync interval
//! so receivers keep their windows while they have nothing to say.
//!
//! # Delivery Order
//!
//! Accepted frames are released to the application in sequence order per
//! sender. A frame that arrives ahead of a gap is held until the gap fills,
//! the gap falls out of the replay window, or the reorder hold expires. A
//! frame that fills a gap only after its successors were released is
//! dropped as [`DropReason::Late`]. Ordering across senders is not defined.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Sub,
    time::{Duration, Instant},
};

use bytes::Bytes;
use fieldsec_crypto::{DerivedKey, MAX_SEQUENCE, MacProfile};
use fieldsec_proto::{Frame, Payload, ProtocolError, SecureHeader, ServiceType};

use crate::{
    env::Environment,
    error::GroupError,
    observer::{DropReason, SecurityEvent},
    seal::{open_first, open_frame, seal_frame},
    sequence::{MAX_REPLAY_TOLERANCE, SequenceCounter, SequenceState},
};

/// How far behind a sender's highest sequence number a frame may arrive.
pub const DEFAULT_REPLAY_TOLERANCE: u8 = 32;

/// Silence after which a sender's window is evicted.
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Most senders tracked at once.
pub const DEFAULT_MAX_SENDERS: usize = 1024;

/// Silence after which the local sender emits a `TimerNotify`.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Longest a frame waits behind a gap in its sender's sequence.
pub const DEFAULT_REORDER_HOLD: Duration = Duration::from_millis(100);

/// Actions returned by the group state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    /// Send this frame to the group
    SendFrame(Frame),

    /// Authentic, fresh application data
    Deliver {
        /// Sender the data came from
        sender_id: u64,
        /// Sequence number the sender stamped on the frame
        sequence: u64,
        /// Application payload
        payload: Bytes,
    },

    /// A frame was dropped
    Security(SecurityEvent),

    /// A sender's window was dropped
    SenderEvicted {
        /// Evicted sender
        sender_id: u64,
    },
}

/// Group configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupConfig {
    /// Backward tolerance per sender (at most 63)
    pub replay_tolerance: u8,
    /// Silence after which a sender is evicted
    pub inactivity_threshold: Duration,
    /// Sender table capacity
    pub max_senders: usize,
    /// Silence after which the local sender emits `TimerNotify` (must be
    /// shorter than `inactivity_threshold`)
    pub sync_interval: Duration,
    /// Tag width for outgoing frames; incoming frames must carry the same
    pub mac_profile: MacProfile,
    /// Longest a frame is held waiting for an earlier one from its sender
    /// (zero releases every frame as soon as it is accepted)
    pub reorder_hold: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            replay_tolerance: DEFAULT_REPLAY_TOLERANCE,
            inactivity_threshold: DEFAULT_INACTIVITY_THRESHOLD,
            max_senders: DEFAULT_MAX_SENDERS,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            mac_profile: MacProfile::default(),
            reorder_hold: DEFAULT_REORDER_HOLD,
        }
    }
}

impl GroupConfig {
    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// - `GroupError::InvalidConfig` naming the first field out of range
    pub fn validate(&self) -> Result<(), GroupError> {
        let invalid = |reason: &str| Err(GroupError::InvalidConfig { reason: reason.to_string() });

        if self.replay_tolerance > MAX_REPLAY_TOLERANCE {
            return invalid("replay_tolerance exceeds 63");
        }
        if self.max_senders == 0 {
            return invalid("max_senders must be at least 1");
        }
        if self.sync_interval.is_zero() || self.sync_interval >= self.inactivity_threshold {
            return invalid("sync_interval must be non-zero and shorter than inactivity_threshold");
        }
        if self.reorder_hold >= self.inactivity_threshold {
            return invalid("reorder_hold must be shorter than inactivity_threshold");
        }

        Ok(())
    }
}

/// One member's view of a secure multicast group.
///
/// Pure state machine: no I/O, time passed in.
#[derive(Debug)]
pub struct MulticastGroup<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    key: DerivedKey,
    local_sender: u64,
    counter: SequenceCounter,
    senders: HashMap<u64, SenderState<I>>,
    config: GroupConfig,
    last_sent: I,
}

/// Receive state for one remote sender.
#[derive(Debug)]
struct SenderState<I> {
    window: SequenceState<I>,
    /// Highest sequence handed to the application
    released: Option<u64>,
    /// Accepted frames waiting for a gap below them; `None` for TimerNotify
    held: BTreeMap<u64, Option<Bytes>>,
    held_since: Option<I>,
}

impl<I> SenderState<I>
where
    I: Copy + Sub<Output = Duration>,
{
    fn new(window: SequenceState<I>) -> Self {
        Self { window, released: None, held: BTreeMap::new(), held_since: None }
    }

    fn hold(&mut self, sequence: u64, payload: Option<Bytes>, now: I) {
        self.held.insert(sequence, payload);
        self.held_since.get_or_insert(now);
    }

    /// Release held frames that no longer wait on a gap, in sequence order.
    fn release(
        &mut self,
        sender_id: u64,
        hold: Duration,
        now: I,
        force: bool,
        actions: &mut Vec<GroupAction>,
    ) {
        let expired = force || self.held_since.is_some_and(|since| now - since >= hold);
        // Nothing below the floor can still be accepted
        let floor = self.window.highest().saturating_sub(u64::from(self.window.tolerance()));

        while let Some(entry) = self.held.first_entry() {
            let sequence = *entry.key();
            let next_in_line = self.released.is_some_and(|released| sequence == released + 1);
            if !(expired || next_in_line || sequence <= floor) {
                break;
            }

            self.released = Some(sequence);
            if let Some(payload) = entry.remove() {
                actions.push(GroupAction::Deliver { sender_id, sequence, payload });
            }
        }

        if self.held.is_empty() {
            self.held_since = None;
        }
    }

    fn release_delay(&self, hold: Duration, now: I) -> Option<Duration> {
        self.held_since.map(|since| hold.saturating_sub(now - since))
    }
}

impl<I> MulticastGroup<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Join the group as `local_sender`.
    ///
    /// `counter` is the sender's outgoing counter: a fresh one from
    /// [`SequenceCounter::from_wall_clock`] or the one returned by
    /// [`Self::into_counter`] when rejoining.
    ///
    /// # Errors
    ///
    /// - `GroupError::InvalidConfig` if `config` fails validation or the
    ///   sender id does not fit in 48 bits
    pub fn new(
        key: DerivedKey,
        local_sender: u64,
        counter: SequenceCounter,
        config: GroupConfig,
        now: I,
    ) -> Result<Self, GroupError> {
        config.validate()?;
        if local_sender > MAX_SEQUENCE {
            return Err(GroupError::InvalidConfig {
                reason: format!("sender id {local_sender:#x} exceeds 48 bits"),
            });
        }

        Ok(Self { key, local_sender, counter, senders: HashMap::new(), config, last_sent: now })
    }

    /// Random non-zero 48-bit sender id.
    pub fn random_sender_id<E: Environment>(env: &E) -> u64 {
        loop {
            let sender_id = env.random_u64() & MAX_SEQUENCE;
            if sender_id != 0 {
                return sender_id;
            }
        }
    }

    /// Local sender id
    pub fn local_sender(&self) -> u64 {
        self.local_sender
    }

    /// Number of senders with a live window
    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Configuration in use
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Leave the group, keeping the outgoing counter for the next join.
    pub fn into_counter(self) -> SequenceCounter {
        self.counter
    }

    /// Seal application data for the group.
    ///
    /// # Errors
    ///
    /// - `GroupError::Protocol` if the payload exceeds the frame limit
    /// - `GroupError::SequenceExhausted` once the 48-bit counter is used up
    pub fn seal(&mut self, payload: Bytes, now: I) -> Result<Frame, GroupError> {
        let max = SecureHeader::MAX_PAYLOAD_SIZE as usize;
        if payload.len() > max {
            return Err(ProtocolError::PayloadTooLarge { size: payload.len(), max }.into());
        }

        self.seal_payload(Payload::SecureData(payload), now)
    }

    /// Process a received datagram.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: I) -> Vec<GroupAction> {
        match Frame::decode(datagram) {
            Ok(frame) => self.handle_frame(&frame, now),
            Err(err) => {
                tracing::trace!(error = %err, len = datagram.len(), "undecodable datagram");
                vec![GroupAction::Security(SecurityEvent::malformed())]
            },
        }
    }

    /// Process a received frame.
    ///
    /// Frames from the local sender (multicast loopback) are ignored.
    pub fn handle_frame(&mut self, frame: &Frame, now: I) -> Vec<GroupAction> {
        let sender_id = frame.header.sender_id();
        if sender_id == self.local_sender {
            return vec![];
        }

        let service = match frame.header.service_type() {
            Some(service @ (ServiceType::SecureData | ServiceType::TimerNotify)) => service,
            _ => return vec![drop_event(DropReason::Malformed, frame)],
        };

        let mut actions = Vec::new();
        self.evict_if_stale(sender_id, now, &mut actions);

        let profile = self.config.mac_profile;
        let accepted = if let Some(state) = self.senders.get_mut(&sender_id) {
            open_frame(&self.key, profile, frame, &mut state.window, now)
        } else {
            open_first(&self.key, profile, frame, self.config.replay_tolerance, now).map(|window| {
                let sequence = window.highest();
                self.make_room(now, &mut actions);
                self.senders.insert(sender_id, SenderState::new(window));
                tracing::debug!(sender_id, sequence, "new sender");
                sequence
            })
        };

        let sequence = match accepted {
            Ok(sequence) => sequence,
            Err(reason) => {
                actions.push(drop_event(reason, frame));
                return actions;
            },
        };
        let Some(state) = self.senders.get_mut(&sender_id) else {
            return actions;
        };

        if state.released.is_some_and(|released| sequence <= released) {
            tracing::debug!(sender_id, sequence, "frame arrived after its successors");
            actions.push(drop_event(DropReason::Late, frame));
            return actions;
        }

        let payload = (service == ServiceType::SecureData).then(|| frame.payload.clone());
        state.hold(sequence, payload, now);
        state.release(sender_id, self.config.reorder_hold, now, false, &mut actions);

        actions
    }

    /// Release frames whose reorder hold has expired.
    pub fn release_held(&mut self, now: I) -> Vec<GroupAction> {
        let mut waiting: Vec<u64> = self
            .senders
            .iter()
            .filter(|(_, state)| state.held_since.is_some())
            .map(|(&sender_id, _)| sender_id)
            .collect();
        waiting.sort_unstable();

        let mut actions = Vec::new();
        for sender_id in waiting {
            if let Some(state) = self.senders.get_mut(&sender_id) {
                state.release(sender_id, self.config.reorder_hold, now, false, &mut actions);
            }
        }
        actions
    }

    /// Time until the next held frame is due, if any are held.
    pub fn release_delay(&self, now: I) -> Option<Duration> {
        self.senders
            .values()
            .filter_map(|state| state.release_delay(self.config.reorder_hold, now))
            .min()
    }

    /// Process periodic maintenance: evict silent senders and keep the local
    /// sender visible with `TimerNotify`.
    ///
    /// # Errors
    ///
    /// - `GroupError::SequenceExhausted` if the local counter is used up
    pub fn tick(&mut self, now: I) -> Result<Vec<GroupAction>, GroupError> {
        let threshold = self.config.inactivity_threshold;
        let mut stale: Vec<u64> = self
            .senders
            .iter()
            .filter(|(_, state)| now - state.window.last_seen() > threshold)
            .map(|(&sender_id, _)| sender_id)
            .collect();
        stale.sort_unstable();

        let mut actions = self.release_held(now);
        for sender_id in stale {
            self.evict(sender_id, now, &mut actions);
            tracing::debug!(sender_id, "evicted silent sender");
        }

        if now - self.last_sent >= self.config.sync_interval {
            let frame = self.seal_payload(Payload::TimerNotify, now)?;
            actions.push(GroupAction::SendFrame(frame));
        }

        Ok(actions)
    }

    fn seal_payload(&mut self, payload: Payload, now: I) -> Result<Frame, GroupError> {
        let sequence = self.counter.next()?;
        let mut header = SecureHeader::new(payload.service());
        header.set_sender_id(self.local_sender);

        let frame = seal_frame(&self.key, self.config.mac_profile, header, sequence, payload)?;
        self.last_sent = now;
        Ok(frame)
    }

    fn evict_if_stale(&mut self, sender_id: u64, now: I, actions: &mut Vec<GroupAction>) {
        let stale = self
            .senders
            .get(&sender_id)
            .is_some_and(|state| now - state.window.last_seen() > self.config.inactivity_threshold);

        if stale {
            self.evict(sender_id, now, actions);
            tracing::debug!(sender_id, "evicted silent sender");
        }
    }

    /// Drop a sender's state, first releasing whatever it still holds.
    fn evict(&mut self, sender_id: u64, now: I, actions: &mut Vec<GroupAction>) {
        if let Some(mut state) = self.senders.remove(&sender_id) {
            state.release(sender_id, self.config.reorder_hold, now, true, actions);
            actions.push(GroupAction::SenderEvicted { sender_id });
        }
    }

    fn make_room(&mut self, now: I, actions: &mut Vec<GroupAction>) {
        if self.senders.len() < self.config.max_senders {
            return;
        }

        let oldest = self
            .senders
            .iter()
            .min_by_key(|(sender_id, state)| (state.window.last_seen(), **sender_id))
            .map(|(&sender_id, _)| sender_id);

        if let Some(sender_id) = oldest {
            self.evict(sender_id, now, actions);
            tracing::debug!(sender_id, "evicted least recently heard sender");
        }
    }
}

fn drop_event(reason: DropReason, frame: &Frame) -> GroupAction {
    GroupAction::Security(SecurityEvent::for_frame(reason, &frame.header))
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: u64 = 0xA;
    const B: u64 = 0xB;

    fn key() -> DerivedKey {
        DerivedKey::from_bytes([0x42; 16])
    }

    /// Releases every accepted frame at once.
    fn immediate() -> GroupConfig {
        GroupConfig { reorder_hold: Duration::ZERO, ..GroupConfig::default() }
    }

    fn group(local: u64, now: Instant) -> MulticastGroup {
        MulticastGroup::new(key(), local, SequenceCounter::starting_at(0), immediate(), now).unwrap()
    }

    fn reordering_group(local: u64, now: Instant) -> MulticastGroup {
        MulticastGroup::new(key(), local, SequenceCounter::starting_at(0), GroupConfig::default(), now)
            .unwrap()
    }

    fn collect_deliveries(actions: Vec<GroupAction>, delivered: &mut HashMap<u64, Vec<u64>>) {
        for action in actions {
            if let GroupAction::Deliver { sender_id, sequence, .. } = action {
                delivered.entry(sender_id).or_default().push(sequence);
            }
        }
    }

    fn sender(id: u64, start: u64, now: Instant) -> MulticastGroup {
        MulticastGroup::new(key(), id, SequenceCounter::starting_at(start), GroupConfig::default(), now)
            .unwrap()
    }

    fn data(frame_sender: &mut MulticastGroup, body: &'static [u8], now: Instant) -> Frame {
        frame_sender.seal(Bytes::from_static(body), now).unwrap()
    }

    #[test]
    fn config_validation() {
        let bad_tolerance = GroupConfig { replay_tolerance: 64, ..GroupConfig::default() };
        assert!(bad_tolerance.validate().is_err());

        let no_senders = GroupConfig { max_senders: 0, ..GroupConfig::default() };
        assert!(no_senders.validate().is_err());

        let slow_sync = GroupConfig { sync_interval: Duration::from_secs(60), ..GroupConfig::default() };
        assert!(slow_sync.validate().is_err());

        let long_hold = GroupConfig { reorder_hold: Duration::from_secs(60), ..GroupConfig::default() };
        assert!(long_hold.validate().is_err());

        assert!(GroupConfig::default().validate().is_ok());
    }

    #[test]
    fn sender_id_must_fit_48_bits() {
        let result = MulticastGroup::new(
            key(),
            MAX_SEQUENCE + 1,
            SequenceCounter::starting_at(0),
            GroupConfig::default(),
            Instant::now(),
        );
        assert!(matches!(result, Err(GroupError::InvalidConfig { .. })));
    }

    #[test]
    fn accepts_each_frame_once() {
        let now = Instant::now();
        let mut receiver = group(0x1, now);
        let mut a = sender(A, 100, now);

        let frame = data(&mut a, b"on", now);
        assert_eq!(receiver.handle_frame(&frame, now), vec![GroupAction::Deliver {
            sender_id: A,
            sequence: 100,
            payload: Bytes::from_static(b"on"),
        }]);

        let replay = receiver.handle_frame(&frame, now);
        assert!(matches!(
            replay.as_slice(),
            [GroupAction::Security(SecurityEvent { reason: DropReason::Replayed, .. })]
        ));
    }

    #[test]
    fn two_senders_interleaved_each_frame_once() {
        let now = Instant::now();
        let mut receiver = group(0x1, now);
        let mut a = sender(A, 0, now);
        let mut b = sender(B, 0, now);

        let from_a: Vec<Frame> = (0..5).map(|_| data(&mut a, b"a", now)).collect();
        let from_b: Vec<Frame> = (0..5).map(|_| data(&mut b, b"b", now)).collect();
        let arrival = [
            &from_a[0], &from_a[1], &from_b[0], &from_a[2], &from_b[1], &from_b[2], &from_b[3],
            &from_a[3], &from_b[4], &from_a[4],
        ];

        let mut delivered: HashMap<u64, Vec<u64>> = HashMap::new();
        for frame in arrival {
            for action in receiver.handle_frame(frame, now) {
                let GroupAction::Deliver { sender_id, sequence, .. } = action else {
                    panic!("unexpected {action:?}");
                };
                delivered.entry(sender_id).or_default().push(sequence);
            }
        }

        assert_eq!(delivered[&A], vec![0, 1, 2, 3, 4]);
        assert_eq!(delivered[&B], vec![0, 1, 2, 3, 4]);

        let replay = receiver.handle_frame(&from_a[2], now);
        assert!(matches!(
            replay.as_slice(),
            [GroupAction::Security(SecurityEvent { reason: DropReason::Replayed, sequence: 2, .. })]
        ));
    }

    #[test]
    fn restarted_sender_accepted_after_eviction() {
        let start = Instant::now();
        let mut receiver = group(0x1, start);
        let mut before = sender(A, 100, start);
        let mut restarted = sender(A, 5, start);

        receiver.handle_frame(&data(&mut before, b"100", start), start);

        // Inside the threshold a lower sequence is a replay
        let early = data(&mut restarted, b"5", start);
        assert!(matches!(receiver.handle_frame(&early, start).as_slice(), [GroupAction::Security(_)]));

        // Past it, the sender's state is gone and sequence 5 starts a new window
        let later = start + DEFAULT_INACTIVITY_THRESHOLD + Duration::from_secs(1);
        let actions = receiver.handle_frame(&early, later);
        assert_eq!(actions, vec![
            GroupAction::SenderEvicted { sender_id: A },
            GroupAction::Deliver { sender_id: A, sequence: 5, payload: Bytes::from_static(b"5") },
        ]);
    }

    #[test]
    fn reordered_frames_inside_tolerance_delivered_in_order() {
        let now = Instant::now();
        let mut receiver = reordering_group(0x1, now);
        let mut a = sender(A, 0, now);

        let first = data(&mut a, b"1", now);
        let second = data(&mut a, b"2", now);
        let third = data(&mut a, b"3", now);

        assert_eq!(receiver.handle_frame(&first, now).len(), 1);
        // Held behind the missing second frame
        assert!(receiver.handle_frame(&third, now).is_empty());

        let mut delivered = HashMap::new();
        collect_deliveries(receiver.handle_frame(&second, now), &mut delivered);
        assert_eq!(delivered[&A], vec![1, 2]);
    }

    #[test]
    fn two_senders_out_of_order_delivered_in_sequence_per_sender() {
        let now = Instant::now();
        let mut receiver = reordering_group(0x1, now);
        let mut a = sender(A, 0, now);
        let mut b = sender(B, 0, now);

        let from_a: Vec<Frame> = (0..5).map(|_| data(&mut a, b"a", now)).collect();
        let from_b: Vec<Frame> = (0..5).map(|_| data(&mut b, b"b", now)).collect();
        let arrival = [
            &from_a[3], &from_b[4], &from_a[0], &from_b[2], &from_a[4], &from_b[0], &from_a[1],
            &from_b[3], &from_a[2], &from_b[1],
        ];

        let mut delivered = HashMap::new();
        for frame in arrival {
            collect_deliveries(receiver.handle_frame(frame, now), &mut delivered);
        }

        assert_eq!(delivered[&A], vec![0, 1, 2, 3, 4]);
        assert_eq!(delivered[&B], vec![0, 1, 2, 3, 4]);
        assert_eq!(receiver.release_delay(now), None);

        let replay = receiver.handle_frame(&from_a[2], now);
        assert!(matches!(
            replay.as_slice(),
            [GroupAction::Security(SecurityEvent { reason: DropReason::Replayed, sequence: 2, .. })]
        ));
    }

    #[test]
    fn held_frame_released_when_hold_expires() {
        let start = Instant::now();
        let mut receiver = reordering_group(0x1, start);
        let mut a = sender(A, 100, start);

        let first = data(&mut a, b"100", start);
        let lost = data(&mut a, b"101", start);
        let after_gap = data(&mut a, b"102", start);

        // A new sender's first frame may still have predecessors in flight
        assert!(receiver.handle_frame(&first, start).is_empty());
        assert_eq!(receiver.release_delay(start), Some(DEFAULT_REORDER_HOLD));

        let due = start + DEFAULT_REORDER_HOLD;
        assert!(matches!(receiver.release_held(due).as_slice(), [GroupAction::Deliver {
            sequence: 100,
            ..
        }]));

        assert!(receiver.handle_frame(&after_gap, due).is_empty());
        let later = due + DEFAULT_REORDER_HOLD;
        assert!(matches!(receiver.tick(later).unwrap().as_slice(), [GroupAction::Deliver {
            sequence: 102,
            ..
        }]));

        // Filling the gap now would deliver out of order
        assert!(matches!(receiver.handle_frame(&lost, later).as_slice(), [GroupAction::Security(
            SecurityEvent { reason: DropReason::Late, sequence: 101, .. }
        )]));
    }

    #[test]
    fn gap_below_the_window_does_not_hold_frames() {
        let now = Instant::now();
        let mut receiver = reordering_group(0x1, now);
        let mut a = sender(A, 0, now);

        let frames: Vec<Frame> = (0..40).map(|_| data(&mut a, b"x", now)).collect();
        receiver.handle_frame(&frames[0], now);
        assert!(receiver.handle_frame(&frames[2], now).is_empty());

        // Sequence 1 falls out of the window once 34 is accepted
        let mut delivered = HashMap::new();
        collect_deliveries(receiver.handle_frame(&frames[34], now), &mut delivered);
        assert_eq!(delivered[&A], vec![2]);
    }

    #[test]
    fn eviction_releases_held_frames_first() {
        let start = Instant::now();
        let config = GroupConfig { max_senders: 1, ..GroupConfig::default() };
        let mut receiver =
            MulticastGroup::new(key(), 0x1, SequenceCounter::starting_at(0), config, start).unwrap();
        let mut a = sender(A, 50, start);
        let mut b = sender(B, 60, start);

        assert!(receiver.handle_frame(&data(&mut a, b"a", start), start).is_empty());

        let t1 = start + Duration::from_millis(10);
        let actions = receiver.handle_frame(&data(&mut b, b"b", t1), t1);
        assert_eq!(actions, vec![
            GroupAction::Deliver { sender_id: A, sequence: 50, payload: Bytes::from_static(b"a") },
            GroupAction::SenderEvicted { sender_id: A },
        ]);
    }

    #[test]
    fn weaker_tag_profile_is_forged() {
        let now = Instant::now();
        let mut receiver = group(0x1, now);
        let short = GroupConfig { mac_profile: MacProfile::Short, ..GroupConfig::default() };
        let mut downgraded =
            MulticastGroup::new(key(), A, SequenceCounter::starting_at(0), short, now).unwrap();

        let frame = data(&mut downgraded, b"open door", now);
        assert_eq!(frame.header.tag_bytes().len(), 4);

        assert!(matches!(receiver.handle_frame(&frame, now).as_slice(), [GroupAction::Security(
            SecurityEvent { reason: DropReason::Forged, .. }
        )]));
        assert_eq!(receiver.sender_count(), 0);
    }

    #[test]
    fn frames_older_than_tolerance_rejected() {
        let now = Instant::now();
        let mut receiver = group(0x1, now);
        let mut a = sender(A, 0, now);

        let old = data(&mut a, b"old", now);
        let newest = (0..40).map(|_| data(&mut a, b"tick", now)).last().unwrap();
        assert_eq!(newest.header.sequence(), 40);

        receiver.handle_frame(&newest, now);
        let late = receiver.handle_frame(&old, now);
        assert!(matches!(late.as_slice(), [GroupAction::Security(SecurityEvent {
            reason: DropReason::Replayed,
            ..
        })]));
    }

    #[test]
    fn forged_frame_dropped_without_creating_sender() {
        let now = Instant::now();
        let mut receiver = group(0x1, now);
        let mut outsider = MulticastGroup::new(
            DerivedKey::from_bytes([0x43; 16]),
            A,
            SequenceCounter::starting_at(0),
            GroupConfig::default(),
            now,
        )
        .unwrap();

        let forged = data(&mut outsider, b"open door", now);
        let actions = receiver.handle_frame(&forged, now);

        assert!(matches!(actions.as_slice(), [GroupAction::Security(SecurityEvent {
            reason: DropReason::Forged,
            ..
        })]));
        assert_eq!(receiver.sender_count(), 0);
    }

    #[test]
    fn loopback_ignored() {
        let now = Instant::now();
        let mut member = group(A, now);
        let own = data(&mut member, b"echo", now);

        assert!(member.handle_frame(&own, now).is_empty());
    }

    #[test]
    fn unicast_services_are_malformed_here() {
        let now = Instant::now();
        let mut receiver = group(0x1, now);
        let frame = Frame::new(SecureHeader::new(ServiceType::SessionRequest), Bytes::new());

        assert!(matches!(receiver.handle_frame(&frame, now).as_slice(), [GroupAction::Security(
            SecurityEvent { reason: DropReason::Malformed, .. }
        )]));
    }

    #[test]
    fn garbage_datagram_is_malformed() {
        let now = Instant::now();
        let mut receiver = group(0x1, now);

        assert_eq!(receiver.handle_datagram(&[0xde, 0xad], now), vec![GroupAction::Security(
            SecurityEvent::malformed()
        )]);
    }

    #[test]
    fn timer_notify_keeps_sender_alive_without_delivery() {
        let start = Instant::now();
        let mut receiver = group(0x1, start);
        let mut a = sender(A, 0, start);

        receiver.handle_frame(&data(&mut a, b"x", start), start);

        let later = start + Duration::from_secs(10);
        let actions = a.tick(later).unwrap();
        let [GroupAction::SendFrame(notify)] = actions.as_slice() else {
            panic!("expected TimerNotify");
        };
        assert_eq!(notify.header.service_type(), Some(ServiceType::TimerNotify));
        assert!(receiver.handle_frame(notify, later).is_empty());

        let evictions = receiver.tick(start + Duration::from_secs(65)).unwrap();
        assert!(!evictions.contains(&GroupAction::SenderEvicted { sender_id: A }));
    }

    #[test]
    fn silent_sender_evicted_then_fresh() {
        let start = Instant::now();
        let mut receiver = group(0x1, start);
        let mut a = sender(A, 500, start);

        let recorded = data(&mut a, b"first", start);
        receiver.handle_frame(&recorded, start);

        let later = start + Duration::from_secs(61);
        let actions = receiver.tick(later).unwrap();
        assert!(actions.contains(&GroupAction::SenderEvicted { sender_id: A }));
        assert_eq!(receiver.sender_count(), 0);

        // A fresh window accepts the sender's next frame from any sequence
        let next = data(&mut a, b"second", later);
        assert!(matches!(receiver.handle_frame(&next, later).as_slice(), [GroupAction::Deliver {
            sequence: 501,
            ..
        }]));
    }

    #[test]
    fn lazy_eviction_on_receive() {
        let start = Instant::now();
        let mut receiver = group(0x1, start);
        let mut a = sender(A, 0, start);
        receiver.handle_frame(&data(&mut a, b"x", start), start);

        let later = start + Duration::from_secs(61);
        let actions = receiver.handle_frame(&data(&mut a, b"y", later), later);

        assert_eq!(actions[0], GroupAction::SenderEvicted { sender_id: A });
        assert!(matches!(actions[1], GroupAction::Deliver { sequence: 1, .. }));
    }

    #[test]
    fn full_table_evicts_least_recently_heard() {
        let start = Instant::now();
        let config = GroupConfig { max_senders: 2, ..immediate() };
        let mut receiver =
            MulticastGroup::new(key(), 0x1, SequenceCounter::starting_at(0), config, start).unwrap();
        let mut a = sender(A, 0, start);
        let mut b = sender(B, 0, start);
        let mut c = sender(0xC, 0, start);

        receiver.handle_frame(&data(&mut a, b"a", start), start);
        let t1 = start + Duration::from_secs(1);
        receiver.handle_frame(&data(&mut b, b"b", t1), t1);

        let t2 = start + Duration::from_secs(2);
        let actions = receiver.handle_frame(&data(&mut c, b"c", t2), t2);

        assert_eq!(actions[0], GroupAction::SenderEvicted { sender_id: A });
        assert_eq!(receiver.sender_count(), 2);
    }

    #[test]
    fn counter_survives_rejoin() {
        let now = Instant::now();
        let mut member = sender(A, 7, now);
        data(&mut member, b"x", now);

        let counter = member.into_counter();
        assert_eq!(counter.peek(), 8);

        let mut rejoined =
            MulticastGroup::new(key(), A, counter, GroupConfig::default(), now).unwrap();
        assert_eq!(data(&mut rejoined, b"y", now).header.sequence(), 8);
    }

    #[test]
    fn exhausted_counter_is_fatal() {
        let now = Instant::now();
        let mut member = sender(A, MAX_SEQUENCE, now);
        data(&mut member, b"last", now);

        let result = member.seal(Bytes::from_static(b"one more"), now);
        assert_eq!(result, Err(GroupError::SequenceExhausted));
    }
}
