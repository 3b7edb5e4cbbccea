//! Typed frame payloads.
//!
//! Handshake and status payloads are CBOR-encoded; application data is
//! carried as opaque bytes. The service type in the header identifies the
//! payload, so payloads carry no variant tag.
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one service type (enforced by match
//! exhaustiveness).

pub mod session;

use bytes::{BufMut, Bytes};

use crate::{
    Frame, SecureHeader, ServiceType,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads
///
/// # Security
///
/// - No Variant Tag: The header's service field alone selects the decoder, so
///   a payload cannot claim a different type than its header.
///
/// - Opaque Data: `SecureData` bytes are never parsed by this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Client handshake opener
    SessionRequest(session::SessionRequest),
    /// Gateway challenge
    SessionChallenge(session::SessionChallenge),
    /// Client challenge response
    SessionResponse(session::SessionResponse),
    /// Handshake result, keep-alive or close
    SessionStatus(session::SessionStatus),
    /// Application data
    SecureData(Bytes),
    /// Multicast timer synchronization (empty)
    TimerNotify,
}

impl Payload {
    /// Service type corresponding to this payload.
    #[must_use]
    pub const fn service(&self) -> ServiceType {
        match self {
            Self::SessionRequest(_) => ServiceType::SessionRequest,
            Self::SessionChallenge(_) => ServiceType::SessionChallenge,
            Self::SessionResponse(_) => ServiceType::SessionResponse,
            Self::SessionStatus(_) => ServiceType::SessionStatus,
            Self::SecureData(_) => ServiceType::SecureData,
            Self::TimerNotify => ServiceType::TimerNotify,
        }
    }

    /// Encode payload to buffer.
    ///
    /// Does NOT enforce the payload size limit; that happens in
    /// [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::SessionRequest(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::SessionChallenge(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::SessionResponse(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::SessionStatus(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::SecureData(data) => {
                writer.get_mut().put_slice(data);
                Ok(())
            },
            Self::TimerNotify => Ok(()),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload bytes for `service`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed `MAX_PAYLOAD_SIZE`
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    /// - `ProtocolError::InvalidField` for a non-empty `TimerNotify` payload
    pub fn decode(service: ServiceType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > SecureHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: SecureHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match service {
            ServiceType::SessionRequest => Self::SessionRequest(decode_cbor(bytes)?),
            ServiceType::SessionChallenge => Self::SessionChallenge(decode_cbor(bytes)?),
            ServiceType::SessionResponse => Self::SessionResponse(decode_cbor(bytes)?),
            ServiceType::SessionStatus => Self::SessionStatus(decode_cbor(bytes)?),
            ServiceType::SecureData => Self::SecureData(Bytes::copy_from_slice(bytes)),
            ServiceType::TimerNotify => {
                if !bytes.is_empty() {
                    return Err(ProtocolError::InvalidField {
                        field: "payload",
                        reason: format!("TimerNotify carries {} unexpected bytes", bytes.len()),
                    });
                }
                Self::TimerNotify
            },
        };

        Ok(payload)
    }

    /// Convert payload into a frame
    ///
    /// Encodes the payload, sets the service type and payload size. The
    /// remaining header fields (sender, sequence, tag) are left as given.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self, mut header: SecureHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.service = self.service().to_u16().to_be_bytes();
        Ok(Frame::new(header, buf))
    }

    /// Parse payload from a frame
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownService` if the service type is unrecognized
    /// - Any error from [`Payload::decode`]
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let service = frame
            .header
            .service_type()
            .ok_or(ProtocolError::UnknownService(frame.header.service()))?;
        Self::decode(service, &frame.payload)
    }
}

fn decode_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{session::StatusCode, *};

    #[test]
    fn status_code_encodes_as_integer() {
        let payload = Payload::SessionStatus(session::SessionStatus::new(StatusCode::KeepAlive));
        let mut buf = Vec::new();
        payload.encode(&mut buf).unwrap();

        // CBOR map(1) { "status": 4 }
        assert_eq!(buf.last(), Some(&0x04));
        assert_eq!(Payload::decode(ServiceType::SessionStatus, &buf).unwrap(), payload);
    }

    #[test]
    fn unknown_status_code_rejected() {
        #[derive(serde::Serialize)]
        struct RawStatus {
            status: u8,
        }

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&RawStatus { status: 99 }, &mut buf).unwrap();

        let result = Payload::decode(ServiceType::SessionStatus, &buf);
        assert!(matches!(result, Err(ProtocolError::CborDecode(_))));
    }

    #[test]
    fn secure_data_is_opaque() {
        let data = Bytes::from_static(b"\xff\x00not cbor");
        let frame = Payload::SecureData(data.clone())
            .into_frame(SecureHeader::new(ServiceType::SessionRequest))
            .unwrap();

        assert_eq!(frame.header.service_type(), Some(ServiceType::SecureData));
        assert_eq!(frame.payload, data);
        assert_eq!(Payload::from_frame(&frame).unwrap(), Payload::SecureData(data));
    }

    #[test]
    fn timer_notify_is_empty() {
        let frame =
            Payload::TimerNotify.into_frame(SecureHeader::new(ServiceType::SecureData)).unwrap();
        assert!(frame.payload.is_empty());

        let result = Payload::decode(ServiceType::TimerNotify, b"x");
        assert!(matches!(result, Err(ProtocolError::InvalidField { .. })));
    }

    #[test]
    fn request_decoded_with_wrong_service_fails() {
        let frame = Payload::SessionRequest(session::SessionRequest {
            user_id: 1,
            client_nonce: [7; 16],
        })
        .into_frame(SecureHeader::new(ServiceType::SessionRequest))
        .unwrap();

        assert!(Payload::decode(ServiceType::SessionChallenge, &frame.payload).is_err());
    }

    #[test]
    fn unknown_service_rejected() {
        let mut bytes = Frame::new(SecureHeader::new(ServiceType::SecureData), Bytes::new())
            .to_vec()
            .unwrap();
        bytes[4..6].copy_from_slice(&0x0999u16.to_be_bytes());

        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(Payload::from_frame(&frame), Err(ProtocolError::UnknownService(0x0999)));
    }
}
