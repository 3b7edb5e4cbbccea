//! Unicast handshake scenarios across simulated hosts.
//!
//! A client host runs the production `SecureConnector` and session driver
//! against a `SimGateway` host over turmoil UDP, on virtual time.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use fieldsec_channel::{ChannelConfig, ChannelError, SecureChannel, SecureConnector};
use fieldsec_core::SessionConfig;
use fieldsec_crypto::{KeyRole, derive_role_key};
use fieldsec_harness::{GatewayBehavior, SimEnv, SimGateway, SimUdp};

const GATEWAY_PORT: u16 = 3671;
const CLIENT_PORT: u16 = 40_000;
const USER: u8 = 1;
const PASSWORD: &str = "tunnel-1";

fn sim() -> turmoil::Sim<'static> {
    turmoil::Builder::new().simulation_duration(Duration::from_secs(60)).build()
}

fn gateway_host(sim: &mut turmoil::Sim<'_>, behavior: GatewayBehavior) {
    sim.host("gateway", move || async move {
        let transport = SimUdp::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, GATEWAY_PORT))).await?;
        let (gateway, _events) =
            SimGateway::new(Arc::new(transport), SimEnv::with_seed(1), SessionConfig::default());

        gateway.with_user(USER, PASSWORD).with_behavior(behavior).run().await?;
        Ok(())
    });
}

async fn connect(password: &str) -> Result<fieldsec_channel::UnicastChannel, ChannelError> {
    let transport = SimUdp::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, CLIENT_PORT))).await?;
    let peer = SocketAddr::new(turmoil::lookup("gateway"), GATEWAY_PORT);
    let key = derive_role_key(password, KeyRole::User(USER));

    SecureConnector::with_env(SimEnv::with_seed(2), ChannelConfig::default())
        .connect(Arc::new(transport), peer, USER, key)
        .await
}

#[test]
fn handshake_succeeds_and_data_flows() {
    let mut sim = sim();
    gateway_host(&mut sim, GatewayBehavior::Echo);

    sim.client("client", async {
        let mut channel = connect(PASSWORD).await?;
        assert_ne!(channel.session_id(), 0);

        channel.send(Bytes::from_static(b"GroupValueRead 1/2/3")).await?;
        let echoed = channel.receive().await.expect("echo should arrive");
        assert_eq!(echoed.payload, Bytes::from_static(b"GroupValueRead 1/2/3"));

        channel.close().await?;
        assert_eq!(channel.receive().await, None);
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn unanswered_handshake_times_out_after_five_seconds() {
    let mut sim = sim();
    gateway_host(&mut sim, GatewayBehavior::Silent);

    sim.client("client", async {
        let started = tokio::time::Instant::now();
        let result = connect(PASSWORD).await;
        let elapsed = started.elapsed();

        let Err(err) = result else {
            panic!("handshake with a silent gateway must fail");
        };
        assert!(matches!(err, ChannelError::HandshakeTimeout { .. }), "got {err}");
        assert!(err.is_retryable());
        assert!(elapsed >= Duration::from_secs(5), "timed out early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "timed out late: {elapsed:?}");
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn wrong_password_is_rejected_not_retried() {
    let mut sim = sim();
    gateway_host(&mut sim, GatewayBehavior::Echo);

    sim.client("client", async {
        let started = tokio::time::Instant::now();
        let result = connect("tunnel-2").await;

        let Err(err) = result else {
            panic!("wrong password must not establish a session");
        };
        assert!(matches!(err, ChannelError::HandshakeRejected), "got {err}");
        assert!(!err.is_retryable());
        // Rejection is immediate, not a timeout
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn handshake_survives_network_latency() {
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(60))
        .min_message_latency(Duration::from_millis(200))
        .max_message_latency(Duration::from_millis(800))
        .build();
    gateway_host(&mut sim, GatewayBehavior::Echo);

    sim.client("client", async {
        let mut channel = connect(PASSWORD).await?;

        for i in 0..5u8 {
            channel.send(Bytes::from(vec![i])).await?;
            let echoed = channel.receive().await.expect("echo should arrive");
            assert_eq!(echoed.payload, Bytes::from(vec![i]));
        }

        channel.close().await?;
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn partitioned_gateway_times_out() {
    let mut sim = sim();
    gateway_host(&mut sim, GatewayBehavior::Echo);

    sim.client("client", async {
        let result = connect(PASSWORD).await;
        assert!(matches!(result, Err(ChannelError::HandshakeTimeout { .. })));
        Ok(())
    });

    sim.partition("client", "gateway");
    sim.run().expect("simulation failed");
}
