//! Sealing and opening authenticated frames.
//!
//! Authentication and freshness are ONE check. [`open_frame`] always
//! evaluates both the MAC and the sequence window, and updates the window only
//! when both pass. Callers learn a single accept/reject outcome; the
//! distinction between a forged and a replayed frame is reported to
//! observability only.

use fieldsec_crypto::{DerivedKey, MacProfile, mac_with_profile, verify};
use fieldsec_proto::{Frame, FrameFlags, Payload, ProtocolError, SecureHeader};

use crate::{observer::DropReason, sequence::SequenceState};

/// Build an authenticated frame carrying `payload` at `sequence`.
///
/// Sets the sequence number and flags on `header`, then computes the tag over
/// the header (tag zeroed) and the payload.
///
/// # Errors
///
/// - `ProtocolError::CborEncode` if the payload cannot be encoded
pub fn seal_frame(
    key: &DerivedKey,
    profile: MacProfile,
    mut header: SecureHeader,
    sequence: u64,
    payload: Payload,
) -> Result<Frame, ProtocolError> {
    header.set_sequence(sequence);
    header.set_flags(
        FrameFlags::empty().with_authenticated().with_short_tag(profile == MacProfile::Short),
    );
    header.set_tag([0; 16]);

    let mut frame = payload.into_frame(header)?;
    let tag = mac_with_profile(key, sequence, &frame.authenticated_bytes(), profile);
    frame.header.set_tag(tag.to_wire());

    Ok(frame)
}

/// Build an unauthenticated frame (handshake messages and `AuthFailed`).
///
/// # Errors
///
/// - `ProtocolError::CborEncode` if the payload cannot be encoded
pub fn plain_frame(mut header: SecureHeader, payload: Payload) -> Result<Frame, ProtocolError> {
    header.set_flags(FrameFlags::empty());
    header.set_tag([0; 16]);
    payload.into_frame(header)
}

/// Whether the frame's tag verifies under `key` for its claimed sequence.
///
/// The receiver's `profile` fixes the tag width. Frames without the
/// authenticated flag, or whose short-tag flag disagrees with `profile`, never
/// verify.
pub fn authenticate(key: &DerivedKey, profile: MacProfile, frame: &Frame) -> bool {
    let flags = frame.header.flags();
    if !flags.is_authenticated() || flags.is_short_tag() != (profile == MacProfile::Short) {
        return false;
    }

    verify(key, frame.header.sequence(), &frame.authenticated_bytes(), frame.header.tag_bytes())
}

/// Combined authentication and freshness check.
///
/// Both checks run unconditionally. On success the sequence window records
/// the frame; on failure the window is untouched and the reason is returned
/// for observability.
///
/// # Errors
///
/// - [`DropReason::Forged`] if the tag does not verify under `profile`
/// - [`DropReason::Replayed`] if the tag verifies but the sequence number is
///   stale
pub fn open_frame<I: Copy>(
    key: &DerivedKey,
    profile: MacProfile,
    frame: &Frame,
    window: &mut SequenceState<I>,
    now: I,
) -> Result<u64, DropReason> {
    let sequence = frame.header.sequence();
    let authentic = authenticate(key, profile, frame);
    let fresh = window.is_fresh(sequence);

    match (authentic, fresh) {
        (true, true) => {
            window.accept(sequence, now);
            Ok(sequence)
        },
        (true, false) => Err(DropReason::Replayed),
        (false, _) => Err(DropReason::Forged),
    }
}

/// Authenticate the first frame from a peer or sender and start its window.
///
/// The claimed sequence number becomes the window's high watermark.
///
/// # Errors
///
/// - [`DropReason::Forged`] if the tag does not verify under `profile`
pub fn open_first<I: Copy>(
    key: &DerivedKey,
    profile: MacProfile,
    frame: &Frame,
    tolerance: u8,
    now: I,
) -> Result<SequenceState<I>, DropReason> {
    if authenticate(key, profile, frame) {
        Ok(SequenceState::first(frame.header.sequence(), tolerance, now))
    } else {
        Err(DropReason::Forged)
    }
}
