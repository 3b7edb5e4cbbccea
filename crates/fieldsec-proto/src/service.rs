//! Service types and header flags.

/// Service type carried in the frame header.
///
/// The service type alone identifies the payload encoding; payloads carry no
/// variant tag of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServiceType {
    /// Authenticated application data (unicast or multicast)
    SecureData = 0x0950,
    /// Client opens a handshake
    SessionRequest = 0x0951,
    /// Gateway challenges the client
    SessionChallenge = 0x0952,
    /// Client answers the challenge
    SessionResponse = 0x0953,
    /// Handshake result, keep-alive and close notifications
    SessionStatus = 0x0954,
    /// Multicast timer synchronization
    TimerNotify = 0x0955,
}

impl ServiceType {
    /// Raw wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value. `None` if unrecognized.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0950 => Some(Self::SecureData),
            0x0951 => Some(Self::SessionRequest),
            0x0952 => Some(Self::SessionChallenge),
            0x0953 => Some(Self::SessionResponse),
            0x0954 => Some(Self::SessionStatus),
            0x0955 => Some(Self::TimerNotify),
            _ => None,
        }
    }

    /// Whether frames of this service belong to the handshake exchange and
    /// are sent before any session key exists.
    #[must_use]
    pub const fn is_handshake(self) -> bool {
        matches!(self, Self::SessionRequest | Self::SessionChallenge | Self::SessionResponse)
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Tag field holds a MAC over the frame
    pub const AUTHENTICATED: u8 = 0b0000_0001;
    /// MAC is truncated to 4 bytes (short profile)
    pub const SHORT_TAG: u8 = 0b0000_0010;

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags from a raw header byte. Unknown bits are preserved.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw header byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.0
    }

    /// Whether the frame carries a MAC.
    #[must_use]
    pub const fn is_authenticated(self) -> bool {
        self.0 & Self::AUTHENTICATED != 0
    }

    /// Whether the MAC uses the 4-byte short profile.
    #[must_use]
    pub const fn is_short_tag(self) -> bool {
        self.0 & Self::SHORT_TAG != 0
    }

    /// Copy with the authenticated bit set.
    #[must_use]
    pub const fn with_authenticated(self) -> Self {
        Self(self.0 | Self::AUTHENTICATED)
    }

    /// Copy with the short-tag bit set or cleared.
    #[must_use]
    pub const fn with_short_tag(self, short: bool) -> Self {
        if short { Self(self.0 | Self::SHORT_TAG) } else { Self(self.0 & !Self::SHORT_TAG) }
    }
}
