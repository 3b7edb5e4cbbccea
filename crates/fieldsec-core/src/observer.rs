//! Security events for dropped frames.
//!
//! Frames that fail authentication or freshness are dropped silently: they
//! never produce an error on the application data path, so an attacker who
//! injects bad frames cannot disrupt legitimate traffic. The drop is reported
//! as a [`SecurityEvent`] to a [`SecurityObserver`] instead.

use std::sync::atomic::{AtomicU64, Ordering};

/// Why a frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Tag missing or did not verify under the expected key
    Forged,
    /// Tag verified but the sequence number was already seen or too old
    Replayed,
    /// Frame was structurally invalid or unexpected in the current state
    Malformed,
    /// Authentic and fresh, but a later frame from the same sender was
    /// already delivered
    Late,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forged => write!(f, "forged"),
            Self::Replayed => write!(f, "replayed"),
            Self::Malformed => write!(f, "malformed"),
            Self::Late => write!(f, "late"),
        }
    }
}

/// A dropped frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityEvent {
    /// Why the frame was dropped
    pub reason: DropReason,
    /// Sender id from the header (zero if the header did not parse)
    pub sender_id: u64,
    /// Session id from the header (zero for multicast)
    pub channel_id: u16,
    /// Claimed sequence number (zero if the header did not parse)
    pub sequence: u64,
}

impl SecurityEvent {
    /// Event for a datagram whose header could not be parsed.
    pub fn malformed() -> Self {
        Self { reason: DropReason::Malformed, sender_id: 0, channel_id: 0, sequence: 0 }
    }

    /// Event for a parsed frame.
    pub fn for_frame(reason: DropReason, header: &fieldsec_proto::SecureHeader) -> Self {
        Self {
            reason,
            sender_id: header.sender_id(),
            channel_id: header.channel_id(),
            sequence: header.sequence(),
        }
    }
}

/// Receives security events from channel drivers.
///
/// Called on the driver task; implementations must not block.
pub trait SecurityObserver: Send + Sync {
    /// A frame was dropped.
    fn on_drop(&self, event: &SecurityEvent);
}

/// Logs every event at `debug` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SecurityObserver for TracingObserver {
    fn on_drop(&self, event: &SecurityEvent) {
        tracing::debug!(
            reason = %event.reason,
            sender_id = event.sender_id,
            channel_id = event.channel_id,
            sequence = event.sequence,
            "dropped frame"
        );
    }
}

/// Counts dropped frames per reason.
#[derive(Debug, Default)]
pub struct SecurityCounters {
    forged: AtomicU64,
    replayed: AtomicU64,
    malformed: AtomicU64,
    late: AtomicU64,
}

/// Point-in-time copy of [`SecurityCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Frames whose tag did not verify
    pub forged: u64,
    /// Authentic frames with a stale sequence number
    pub replayed: u64,
    /// Structurally invalid or unexpected frames
    pub malformed: u64,
    /// Authentic frames that arrived behind a delivered successor
    pub late: u64,
}

impl CounterSnapshot {
    /// Sum over all reasons.
    pub fn total(&self) -> u64 {
        self.forged + self.replayed + self.malformed + self.late
    }
}

impl SecurityCounters {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counts.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            forged: self.forged.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
        }
    }
}

impl SecurityObserver for SecurityCounters {
    fn on_drop(&self, event: &SecurityEvent) {
        let counter = match event.reason {
            DropReason::Forged => &self.forged,
            DropReason::Replayed => &self.replayed,
            DropReason::Malformed => &self.malformed,
            DropReason::Late => &self.late,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
