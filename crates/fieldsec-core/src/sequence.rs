//! Sequence numbers: outgoing counters and incoming replay windows.
//!
//! # Incoming Window
//!
//! ```text
//!                     tolerance
//!              ◄──────────────────►
//!   ... ──────┬───────────────────┬──────────────────────► sequence
//!   rejected  │  accepted if the  │ highest   accepted
//!   (too old) │  bit is not set   │ (seen)    (advances highest)
//! ```
//!
//! The window is a 64-bit bitmap anchored at the highest accepted sequence
//! number: bit `k` records whether `highest - k` has been accepted. A
//! tolerance of zero degenerates to "strictly greater than highest", which is
//! the unicast rule.

use fieldsec_crypto::MAX_SEQUENCE;
use thiserror::Error;

/// Largest supported backward tolerance (bits in the window minus one)
pub const MAX_REPLAY_TOLERANCE: u8 = 63;

/// Outgoing counter ran past 48 bits.
///
/// Fatal for the owning session or group: reusing a sequence number would let
/// peers reject fresh frames or accept replays.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("48-bit sequence space exhausted")]
pub struct SequenceExhausted;

/// Outgoing 48-bit sequence counter.
///
/// Never repeats and never goes backward. Multicast senders keep the counter
/// across leave/rejoin via `MulticastGroup::into_counter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    /// Counter whose first value is `start`.
    pub fn starting_at(start: u64) -> Self {
        debug_assert!(start <= MAX_SEQUENCE, "start {start} exceeds 48 bits");
        Self { next: start.min(MAX_SEQUENCE) }
    }

    /// Counter seeded from the wall clock in milliseconds.
    ///
    /// A restarted process that lost its counter starts above every value it
    /// could have used before, as long as it sent fewer than one frame per
    /// millisecond.
    pub fn from_wall_clock(millis: u64) -> Self {
        Self::starting_at(millis & MAX_SEQUENCE)
    }

    /// Value the next call to [`Self::next`] returns.
    pub fn peek(&self) -> u64 {
        self.next
    }

    /// Take the next sequence number.
    ///
    /// # Errors
    ///
    /// - [`SequenceExhausted`] once every 48-bit value has been used
    pub fn next(&mut self) -> Result<u64, SequenceExhausted> {
        if self.next > MAX_SEQUENCE {
            return Err(SequenceExhausted);
        }

        let sequence = self.next;
        self.next += 1;
        Ok(sequence)
    }

    /// Move the counter forward to at least `floor`. Never moves it back.
    pub fn advance_to(&mut self, floor: u64) {
        self.next = self.next.max(floor.min(MAX_SEQUENCE));
    }
}

/// Per-peer or per-sender incoming sequence state.
///
/// Mutated only through [`SequenceState::accept`], which callers invoke after
/// the frame's MAC has verified (see `crate::seal::open_frame`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceState<I> {
    highest: u64,
    window: u64,
    tolerance: u8,
    last_seen: I,
}

impl<I: Copy> SequenceState<I> {
    /// State whose first accepted frame carried `sequence`.
    pub fn first(sequence: u64, tolerance: u8, now: I) -> Self {
        debug_assert!(tolerance <= MAX_REPLAY_TOLERANCE);

        Self {
            highest: sequence,
            window: 1,
            tolerance: tolerance.min(MAX_REPLAY_TOLERANCE),
            last_seen: now,
        }
    }

    /// Whether `sequence` would be accepted. Pure: does not update state.
    pub fn is_fresh(&self, sequence: u64) -> bool {
        if sequence > self.highest {
            return true;
        }

        let offset = self.highest - sequence;
        offset != 0 && offset <= u64::from(self.tolerance) && self.window & (1 << offset) == 0
    }

    /// Record `sequence` as accepted.
    ///
    /// Callers MUST check [`Self::is_fresh`] first.
    pub fn accept(&mut self, sequence: u64, now: I) {
        debug_assert!(self.is_fresh(sequence), "accepting stale sequence {sequence}");

        if sequence > self.highest {
            let shift = sequence - self.highest;
            self.window = if shift >= 64 { 0 } else { self.window << shift };
            self.window |= 1;
            self.highest = sequence;
        } else {
            self.window |= 1 << (self.highest - sequence);
        }

        self.last_seen = now;
    }

    /// Highest sequence number accepted so far.
    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// Time the last frame was accepted.
    pub fn last_seen(&self) -> I {
        self.last_seen
    }

    /// Backward tolerance in sequence numbers.
    pub fn tolerance(&self) -> u8 {
        self.tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_counts_up() {
        let mut counter = SequenceCounter::starting_at(10);
        assert_eq!(counter.next(), Ok(10));
        assert_eq!(counter.next(), Ok(11));
        assert_eq!(counter.peek(), 12);
    }

    #[test]
    fn counter_exhausts_after_max() {
        let mut counter = SequenceCounter::starting_at(MAX_SEQUENCE);
        assert_eq!(counter.next(), Ok(MAX_SEQUENCE));
        assert_eq!(counter.next(), Err(SequenceExhausted));
        assert_eq!(counter.next(), Err(SequenceExhausted));
    }

    #[test]
    fn counter_never_moves_back() {
        let mut counter = SequenceCounter::starting_at(100);
        counter.advance_to(50);
        assert_eq!(counter.peek(), 100);

        counter.advance_to(200);
        assert_eq!(counter.peek(), 200);
    }

    #[test]
    fn wall_clock_seed_fits_48_bits() {
        let counter = SequenceCounter::from_wall_clock(u64::MAX);
        assert!(counter.peek() <= MAX_SEQUENCE);
    }

    #[test]
    fn strict_window_requires_strictly_greater() {
        let mut state = SequenceState::first(5, 0, 0u64);

        assert!(!state.is_fresh(5));
        assert!(!state.is_fresh(4));
        assert!(state.is_fresh(6));

        state.accept(6, 1);
        assert!(!state.is_fresh(6));
        assert_eq!(state.highest(), 6);
    }

    #[test]
    fn window_accepts_reordered_once() {
        let mut state = SequenceState::first(10, 8, 0u64);

        assert!(state.is_fresh(7));
        state.accept(7, 1);
        assert!(!state.is_fresh(7), "duplicate inside the window");
        assert_eq!(state.highest(), 10, "late frame does not move highest");
    }

    #[test]
    fn window_rejects_beyond_tolerance() {
        let state = SequenceState::first(100, 8, 0u64);

        assert!(state.is_fresh(92));
        assert!(!state.is_fresh(91));
    }

    #[test]
    fn window_slides_with_highest() {
        let mut state = SequenceState::first(1, 32, 0u64);
        state.accept(3, 1);
        state.accept(2, 2);

        state.accept(40, 3);
        assert!(!state.is_fresh(3), "now older than the tolerance");
        assert!(state.is_fresh(39));

        state.accept(200, 4);
        assert!(state.is_fresh(199), "large jump clears the bitmap");
        assert!(!state.is_fresh(40));
    }

    #[test]
    fn accept_updates_last_seen() {
        let mut state = SequenceState::first(1, 4, 10u64);
        state.accept(2, 20);
        assert_eq!(state.last_seen(), 20);
    }
}
