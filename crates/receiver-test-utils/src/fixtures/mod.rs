//! Pre-configured test data and the `TestReceiver` harness.
//!
//! Provides:
//! - A receiver config with short deadlines
//! - Accepted connections wired to a `MockControllerLink`
//! - `setUpStreams` payloads for screen and audio streams
//! - `TestReceiver`: a real `ServerActor` running against the mocks

use crate::mock_delegate::{RecordingServerDelegate, RecordingSessionDelegate};
use crate::mock_link::MockControllerLink;
use crate::mock_platform::{MockAdvertiser, MockAuthenticator, MockClock, MockListener};
use crate::wait_for;
use accessory_receiver::actors::{ActorMetrics, ServerActor, ServerHandle, ServerPlatform, SessionHandle};
use accessory_receiver::arbiter::ConstraintPolicy;
use accessory_receiver::config::ReceiverConfig;
use accessory_receiver::platform::{Connection, TransportType};
use accessory_receiver::protocol::{keys, StreamType};
use accessory_receiver::value::{Dict, Value};
use common::types::{ClientSessionId, DeviceId};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Device id every test receiver advertises.
pub const TEST_DEVICE_ID: u64 = 0x0011_2233_4455;

/// Receiver config with short deadlines.
#[must_use]
pub fn test_config() -> ReceiverConfig {
    let mut config = ReceiverConfig::new(DeviceId::from_u64(TEST_DEVICE_ID));
    config.name = "Test Dash".to_string();
    config.command_timeout = Duration::from_millis(500);
    config.revoke_grace = Duration::from_millis(250);
    config.audio_ring_frames = 256;
    config.shutdown_timeout = Duration::from_secs(2);
    config
}

/// An accepted connection from a fresh controller.
#[must_use]
pub fn test_connection(link: Arc<MockControllerLink>) -> Connection {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    Connection {
        peer: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), 49_152 + (n % 1000) as u16),
        transport_type: TransportType::WiFi,
        client_device_id: DeviceId::from_u64(0xAA00 + n),
        client_session_id: ClientSessionId(n),
        auth_payload: bytes::Bytes::from_static(b"pair-setup"),
        link,
    }
}

/// `setUpStreams` payload for the given streams.
#[must_use]
pub fn stream_setup(streams: &[StreamType]) -> Dict {
    let entries = streams
        .iter()
        .map(|t| {
            let mut entry = Dict::from([(keys::TYPE.to_string(), Value::from(*t))]);
            if t.is_audio() {
                entry.insert(keys::SAMPLE_RATE.to_string(), Value::from(44_100_i64));
            }
            Value::Dict(entry)
        })
        .collect();
    Dict::from([(keys::STREAMS.to_string(), Value::Array(entries))])
}

/// A session created through a [`TestReceiver`], with its mocks.
#[derive(Debug)]
pub struct TestSession {
    pub handle: SessionHandle,
    pub link: Arc<MockControllerLink>,
    pub delegate: Arc<RecordingSessionDelegate>,
}

impl TestSession {
    /// Announce, configure a screen stream, record and start.
    pub async fn activate(&self) {
        self.activate_with(&[StreamType::Screen]).await;
    }

    /// Announce, configure `streams`, record and start.
    pub async fn activate_with(&self, streams: &[StreamType]) {
        self.handle.set_up_streams(Dict::new()).await.unwrap();
        self.handle.set_up_streams(stream_setup(streams)).await.unwrap();
        self.handle.record().await.unwrap();
        self.handle.start(Dict::new()).await.unwrap();
    }
}

/// A running `ServerActor` wired to mocks.
pub struct TestReceiver {
    pub server: ServerHandle,
    pub task: JoinHandle<()>,
    pub advertiser: Arc<MockAdvertiser>,
    pub listener: Arc<MockListener>,
    pub authenticator: Arc<MockAuthenticator>,
    pub clock: Arc<MockClock>,
    pub delegate: Arc<RecordingServerDelegate>,
    pub metrics: Arc<ActorMetrics>,
}

impl TestReceiver {
    #[must_use]
    pub fn builder() -> TestReceiverBuilder {
        TestReceiverBuilder::default()
    }

    /// Accept a connection and wait for its session to exist.
    pub async fn connect(&self) -> TestSession {
        let link = Arc::new(MockControllerLink::new());
        let before = self.delegate.created().len();
        self.server
            .accept_connection(test_connection(Arc::clone(&link)))
            .await
            .unwrap();
        wait_for(|| self.delegate.created().len() > before).await;

        let info = self.delegate.created().last().cloned().unwrap();
        let handle = self.server.session(info.id).await.unwrap().unwrap();
        let delegate = self.delegate.session_delegate(info.id).unwrap();
        TestSession {
            handle,
            link,
            delegate,
        }
    }

    /// Connect and bring the session to `Active`.
    pub async fn connect_active(&self) -> TestSession {
        let session = self.connect().await;
        session.activate().await;
        session
    }

    /// Shut the server down and wait for its task.
    pub async fn shutdown(self) {
        self.server.shutdown(Duration::from_secs(2)).await.unwrap();
        self.task.await.unwrap();
    }
}

/// Builder for `TestReceiver` configuration.
#[derive(Default)]
pub struct TestReceiverBuilder {
    config: Option<ReceiverConfig>,
    advertiser: Option<MockAdvertiser>,
    listener: Option<MockListener>,
    authenticator: Option<MockAuthenticator>,
    delegate: Option<RecordingServerDelegate>,
    constraints: Option<Arc<dyn ConstraintPolicy>>,
}

impl TestReceiverBuilder {
    #[must_use]
    pub fn config(mut self, config: ReceiverConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn advertiser(mut self, advertiser: MockAdvertiser) -> Self {
        self.advertiser = Some(advertiser);
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: MockListener) -> Self {
        self.listener = Some(listener);
        self
    }

    #[must_use]
    pub fn authenticator(mut self, authenticator: MockAuthenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    #[must_use]
    pub fn delegate(mut self, delegate: RecordingServerDelegate) -> Self {
        self.delegate = Some(delegate);
        self
    }

    #[must_use]
    pub fn constraint_policy(mut self, constraints: Arc<dyn ConstraintPolicy>) -> Self {
        self.constraints = Some(constraints);
        self
    }

    /// Spawn the server. It is not started.
    #[must_use]
    pub fn build(self) -> TestReceiver {
        let advertiser = Arc::new(self.advertiser.unwrap_or_default());
        let listener = Arc::new(self.listener.unwrap_or_default());
        let authenticator = Arc::new(self.authenticator.unwrap_or_else(MockAuthenticator::accepting));
        let clock = Arc::new(MockClock::new());
        let delegate = Arc::new(self.delegate.unwrap_or_default());
        let metrics = ActorMetrics::new();

        let mut platform = ServerPlatform::new(
            Arc::clone(&advertiser) as _,
            Arc::clone(&listener) as _,
            Arc::clone(&authenticator) as _,
            Arc::clone(&clock) as _,
        );
        if let Some(constraints) = self.constraints {
            platform = platform.with_constraint_policy(constraints);
        }

        let (server, task) = ServerActor::spawn(
            self.config.unwrap_or_else(test_config),
            platform,
            Arc::clone(&delegate) as _,
            Arc::clone(&metrics),
        );

        TestReceiver {
            server,
            task,
            advertiser,
            listener,
            authenticator,
            clock,
            delegate,
            metrics,
        }
    }
}
