//! Channel configuration.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use fieldsec_core::{GroupConfig, SecurityObserver, SessionConfig, TracingObserver};

use crate::error::ChannelError;

/// How often drivers run timeouts, keep-alives and eviction.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Received payloads buffered per channel before the driver waits for the
/// application.
pub const DEFAULT_DELIVERY_CAPACITY: usize = 64;

/// Pending `send` calls per channel.
pub const DEFAULT_COMMAND_CAPACITY: usize = 32;

/// Configuration shared by unicast and multicast channels.
#[derive(Clone)]
pub struct ChannelConfig {
    /// Handshake, idle and keep-alive timing of unicast sessions
    pub session: SessionConfig,
    /// Replay tolerance, eviction and sync timing of multicast groups
    pub group: GroupConfig,
    /// Local address for unicast sockets. An unspecified address of the
    /// wrong family is swapped for the peer's family.
    pub bind_address: SocketAddr,
    /// Interface multicast groups are joined on
    pub multicast_interface: Ipv4Addr,
    /// Driver timer resolution
    pub tick_interval: Duration,
    /// Receive queue depth
    pub delivery_capacity: usize,
    /// Receives every dropped frame
    pub observer: Arc<dyn SecurityObserver>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            group: GroupConfig::default(),
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            tick_interval: DEFAULT_TICK_INTERVAL,
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
            observer: Arc::new(TracingObserver),
        }
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("session", &self.session)
            .field("group", &self.group)
            .field("bind_address", &self.bind_address)
            .field("multicast_interface", &self.multicast_interface)
            .field("tick_interval", &self.tick_interval)
            .field("delivery_capacity", &self.delivery_capacity)
            .finish_non_exhaustive()
    }
}

impl ChannelConfig {
    /// Replace the security observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn SecurityObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Check ranges before any socket is opened.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.tick_interval.is_zero() {
            return Err(ChannelError::Config("tick_interval must be non-zero".into()));
        }
        if self.delivery_capacity == 0 {
            return Err(ChannelError::Config("delivery_capacity must be at least 1".into()));
        }
        if self.session.handshake_timeout.is_zero() {
            return Err(ChannelError::Config("handshake_timeout must be non-zero".into()));
        }
        if self.session.keepalive_interval >= self.session.idle_timeout {
            return Err(ChannelError::Config(
                "keepalive_interval must be shorter than idle_timeout".into(),
            ));
        }
        self.group.validate()?;
        Ok(())
    }

    /// Local address for a unicast socket talking to `peer`.
    pub(crate) fn bind_address_for(&self, peer: SocketAddr) -> SocketAddr {
        let configured = self.bind_address;
        if !configured.ip().is_unspecified() || configured.is_ipv4() == peer.is_ipv4() {
            return configured;
        }

        let ip = if peer.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, configured.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(ChannelConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_tick_is_rejected() {
        let config = ChannelConfig { tick_interval: Duration::ZERO, ..ChannelConfig::default() };
        assert!(matches!(config.validate(), Err(ChannelError::Config(_))));
    }

    #[test]
    fn keepalive_must_beat_idle_timeout() {
        let mut config = ChannelConfig::default();
        config.session.keepalive_interval = config.session.idle_timeout;

        assert!(matches!(config.validate(), Err(ChannelError::Config(_))));
    }

    #[test]
    fn invalid_group_config_is_a_group_error() {
        let mut config = ChannelConfig::default();
        config.group.replay_tolerance = 64;

        assert!(matches!(config.validate(), Err(ChannelError::Group(_))));
    }

    #[test]
    fn unspecified_bind_address_follows_peer_family() {
        let config = ChannelConfig::default();
        let v6_peer = SocketAddr::from((Ipv6Addr::LOCALHOST, 3671));
        let v4_peer = SocketAddr::from(([192, 0, 2, 1], 3671));

        assert!(config.bind_address_for(v6_peer).is_ipv6());
        assert_eq!(config.bind_address_for(v4_peer), config.bind_address);
    }

    #[test]
    fn debug_omits_observer() {
        let rendered = format!("{:?}", ChannelConfig::default());
        assert!(rendered.contains("tick_interval"));
        assert!(!rendered.contains("observer"));
    }
}
