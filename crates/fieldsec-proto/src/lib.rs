//! fieldsec Wire Protocol
//!
//! The secure-frame envelope shared by unicast sessions and multicast
//! groups: a fixed 38-byte header followed by the payload.
//!
//! ```text
//! ┌────────────────────────── SecureHeader (38 bytes) ──────────────────────────┐
//! │ magic │ version │ flags │ service │ length │ channel │ sender │ seq │ tag   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ┌─────────────── payload (≤ 1400 bytes) ───────────────┐
//! │ CBOR handshake/status payload, or opaque SecureData  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! This crate is structural only: it parses and builds frames but holds no
//! keys. Authentication lives in `fieldsec-crypto` and the state machines in
//! `fieldsec-core`.

#![deny(missing_docs)]

pub mod errors;
pub mod frame;
pub mod header;
pub mod payloads;
pub mod service;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::{MAX_U48, SecureHeader};
pub use payloads::{
    Payload,
    session::{SessionChallenge, SessionRequest, SessionResponse, SessionStatus, StatusCode},
};
pub use service::{FrameFlags, ServiceType};
