//! fieldsec Core
//!
//! Sans-IO state machines for the fieldsec secure-session layer. Nothing in
//! this crate touches a socket or a clock: methods take the current time and
//! return actions (frames to send, payloads to deliver, security events) for
//! a driver to execute.
//!
//! # Components
//!
//! ```text
//!               ┌──────────────┐        ┌───────────┐
//!  client  ───> │  Negotiator  │ ─────> │  Session  │ ──> Deliver
//!               └──────────────┘        └───────────┘
//!  gateway ───────────────────────────> │ Responder │ ──> Deliver
//!                                       └───────────┘
//!  group   ───────────────────────────> │ Multicast │ ──> Deliver
//!                                       └───────────┘
//!                   all three share seal::open_frame + SequenceState
//! ```
//!
//! # Invariants
//!
//! - A frame is accepted only if its MAC verifies AND its sequence number is
//!   fresh; a sequence window changes only when both hold
//! - Outgoing 48-bit counters never repeat; exhaustion is an error, never a
//!   wrap
//! - Rejected frames never surface as errors on the data path; they become
//!   [`SecurityEvent`]s
//! - Each remote sender's payloads are delivered in sequence order

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod env;
pub mod error;
pub mod multicast;
pub mod negotiator;
pub mod observer;
pub mod responder;
pub mod seal;
pub mod sequence;
pub mod session;

pub use env::Environment;
pub use error::{GroupError, SessionError};
pub use multicast::{DEFAULT_REORDER_HOLD, GroupAction, GroupConfig, MulticastGroup};
pub use negotiator::Negotiator;
pub use observer::{
    CounterSnapshot, DropReason, SecurityCounters, SecurityEvent, SecurityObserver,
    TracingObserver,
};
pub use responder::{Responder, ResponderAction};
pub use seal::{authenticate, open_frame, seal_frame};
pub use sequence::{MAX_REPLAY_TOLERANCE, SequenceCounter, SequenceExhausted, SequenceState};
pub use session::{CloseReason, Session, SessionAction, SessionConfig, SessionState};
