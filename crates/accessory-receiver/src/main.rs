//! Accessory Receiver
//!
//! Standalone receiver process. Discovery, transport framing and key
//! exchange are platform services; this binary wires in minimal stand-ins
//! so the control plane can be run and observed on its own:
//! - Advertisement is logged instead of published
//! - The listener binds a TCP port and closes whatever it accepts
//! - Every connection is refused at authentication
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Spawn the `ServerActor`
//! 4. Start advertising and listening
//! 5. Wait for shutdown signal, then shut the server down gracefully

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;

use accessory_receiver::actors::{ActorMetrics, ServerActor, ServerPlatform};
use accessory_receiver::config::ReceiverConfig;
use accessory_receiver::delegate::{ServerDelegate, SessionDelegate};
use accessory_receiver::errors::{ReceiverError, ReceiverResult};
use accessory_receiver::observability::init_metrics_recorder;
use accessory_receiver::platform::{
    AdvertisementHandle, Advertiser, AuthChallenge, Authenticator, ClockSync, Connection,
    Listener, ListenerInfo, SecurityContext, ServiceRecord, SessionInfo,
};
use async_trait::async_trait;
use common::types::SessionId;
use parking_lot::Mutex;
use tokio::signal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Address the control listener binds to.
const LISTEN_ADDRESS: &str = "0.0.0.0:7000";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accessory_receiver=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Accessory Receiver");

    let config = ReceiverConfig::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        device_id = %config.device_id,
        name = %config.name,
        enabled = config.enabled,
        pin_policy = ?config.pin_policy,
        single_audio = ?config.single_audio,
        contention = ?config.contention,
        command_timeout_ms = config.command_timeout.as_millis(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let _prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let listen_address: SocketAddr = LISTEN_ADDRESS.parse()?;
    let shutdown_timeout = config.shutdown_timeout;
    let platform = ServerPlatform::new(
        Arc::new(LogAdvertiser),
        Arc::new(TcpControlListener::new(listen_address)),
        Arc::new(RefuseAll),
        Arc::new(MonotonicClock::new()),
    );

    let (server, server_task) = ServerActor::spawn(
        config,
        platform,
        Arc::new(LoggingDelegate),
        ActorMetrics::new(),
    );

    server.start().await.map_err(|e| {
        error!(error = %e, "Failed to start server");
        e
    })?;

    info!("Accessory Receiver running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    if let Err(e) = server.shutdown(shutdown_timeout).await {
        warn!(error = %e, "Server shutdown error");
    }
    if let Err(e) = server_task.await {
        warn!(error = %e, "Server task ended abnormally");
    }

    info!("Accessory Receiver shutdown complete");
    Ok(())
}

struct LogAdvertiser;

#[async_trait]
impl Advertiser for LogAdvertiser {
    async fn advertise(&self, record: &ServiceRecord) -> ReceiverResult<AdvertisementHandle> {
        info!(
            service_type = %record.service_type,
            name = %record.name,
            attributes = ?record.attributes(),
            "Advertising"
        );
        Ok(AdvertisementHandle(1))
    }

    async fn stop_advertising(&self, _handle: AdvertisementHandle) -> ReceiverResult<()> {
        info!("Advertising stopped");
        Ok(())
    }
}

struct TcpControlListener {
    address: SocketAddr,
    accept_token: Mutex<Option<CancellationToken>>,
}

impl TcpControlListener {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            accept_token: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Listener for TcpControlListener {
    async fn start(&self) -> ReceiverResult<ListenerInfo> {
        let listener = tokio::net::TcpListener::bind(self.address)
            .await
            .map_err(|e| ReceiverError::NotReady(format!("bind {}: {e}", self.address)))?;
        let local = listener
            .local_addr()
            .map_err(|e| ReceiverError::Unknown(format!("local address: {e}")))?;

        let token = CancellationToken::new();
        if let Some(previous) = self.accept_token.lock().replace(token.clone()) {
            previous.cancel();
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((_stream, peer)) => {
                            warn!(%peer, "No transport framing available, closing connection");
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    },
                }
            }
            debug!("Control listener stopped");
        });

        Ok(ListenerInfo {
            interface_name: local.ip().to_string(),
            port: local.port(),
        })
    }

    async fn stop(&self) -> ReceiverResult<()> {
        if let Some(token) = self.accept_token.lock().take() {
            token.cancel();
        }
        Ok(())
    }
}

struct RefuseAll;

#[async_trait]
impl Authenticator for RefuseAll {
    async fn authenticate(&self, connection: &Connection, _challenge: &AuthChallenge) -> ReceiverResult<SecurityContext> {
        Err(ReceiverError::AuthFailed(format!(
            "no key exchange available for {}",
            connection.peer
        )))
    }
}

/// Nanoseconds since process start, used as both local and synchronized time.
struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl ClockSync for MonotonicClock {
    fn synchronized_time(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn synchronized_time_near_local_tick(&self, tick: u64) -> u64 {
        tick
    }

    fn local_tick_near_synchronized_time(&self, time: u64) -> u64 {
        time
    }
}

struct LoggingDelegate;

struct LoggingSession;

impl SessionDelegate for LoggingSession {
    fn started(&self, info: &SessionInfo) {
        info!(session_id = %info.id, peer = %info.peer, "Session started");
    }
}

impl ServerDelegate for LoggingDelegate {
    fn session_created(&self, info: &SessionInfo) -> ReceiverResult<Arc<dyn SessionDelegate>> {
        info!(session_id = %info.id, peer = %info.peer, "Session created");
        Ok(Arc::new(LoggingSession))
    }

    fn session_failed(&self, reason: &ReceiverError) {
        warn!(error = %reason, "Connection failed");
    }

    fn session_ended(&self, id: SessionId, reason: Option<&ReceiverError>) {
        info!(session_id = %id, reason = ?reason, "Session ended");
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
