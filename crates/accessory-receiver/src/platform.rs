//! External collaborators.
//!
//! Discovery, the listening transport, authentication/key exchange, clock
//! synchronization and the per-session controller link are provided by the
//! embedder. The receiver only talks to them through these traits, so every
//! one of them can be replaced by a mock in tests.

use crate::errors::{ReceiverError, ReceiverResult};
use crate::value::Dict;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretBox, SecretString};
use common::types::{ClientSessionId, DeviceId, SessionId};
use ring::digest;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Service type the receiver advertises under.
pub const SERVICE_TYPE: &str = "_accessory-receiver._tcp";

/// What gets advertised while the server is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub service_type: String,
    pub name: String,
    pub device_id: DeviceId,
    pub features: u64,
    pub pin_required: bool,
    pub password_required: bool,
    pub source_version: String,
}

impl ServiceRecord {
    /// TXT-style attribute map.
    #[must_use]
    pub fn attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("deviceid".to_string(), self.device_id.to_string()),
            ("features".to_string(), format!("{:#x}", self.features)),
            ("pin".to_string(), u8::from(self.pin_required).to_string()),
            ("pw".to_string(), u8::from(self.password_required).to_string()),
            ("srcvers".to_string(), self.source_version.clone()),
        ])
    }
}

/// Opaque handle returned by [`Advertiser::advertise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertisementHandle(pub u64);

/// One change observed while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Added {
        name: String,
        addresses: Vec<SocketAddr>,
        attributes: BTreeMap<String, String>,
    },
    Removed {
        name: String,
    },
    /// The discovery daemon restarted; everything seen so far is stale.
    Restarted,
}

/// Service discovery (enables mocking).
#[async_trait]
pub trait Advertiser: Send + Sync {
    /// # Errors
    ///
    /// Whatever the discovery layer reports.
    async fn advertise(&self, record: &ServiceRecord) -> ReceiverResult<AdvertisementHandle>;

    /// # Errors
    ///
    /// Whatever the discovery layer reports.
    async fn stop_advertising(&self, handle: AdvertisementHandle) -> ReceiverResult<()>;

    /// Watch for other services of `service_type`.
    ///
    /// # Errors
    ///
    /// `UnsupportedCommand` unless the implementation can browse.
    async fn browse(&self, service_type: &str) -> ReceiverResult<mpsc::Receiver<BrowseEvent>> {
        Err(ReceiverError::UnsupportedCommand(format!(
            "browse {service_type}"
        )))
    }
}

/// Where the listener ended up bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub interface_name: String,
    pub port: u16,
}

/// The listening transport. Accepted connections are handed to the server
/// by the embedder through `ServerHandle::accept_connection`.
#[async_trait]
pub trait Listener: Send + Sync {
    /// # Errors
    ///
    /// Whatever the transport reports, typically a bind failure.
    async fn start(&self) -> ReceiverResult<ListenerInfo>;

    /// # Errors
    ///
    /// Whatever the transport reports.
    async fn stop(&self) -> ReceiverResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportType {
    Ethernet,
    WiFi,
    Usb,
}

impl TransportType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Ethernet => "ethernet",
            TransportType::WiFi => "wifi",
            TransportType::Usb => "usb",
        }
    }
}

/// Outbound command to the controller. The reply, when it arrives, is fed
/// back with `SessionHandle::controller_reply` under the same transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCommand {
    pub transaction: u64,
    pub command: String,
    pub params: Dict,
}

/// The controller side of one session's connection.
///
/// Sends are non-blocking hand-offs to the transport; they run on the
/// session's queue. An error means the link is no longer usable.
pub trait ControllerLink: Send + Sync {
    /// # Errors
    ///
    /// Any transport failure. The session tears down when this fails.
    fn send_command(&self, command: OutboundCommand) -> ReceiverResult<()>;

    /// One-way notice with no transaction.
    ///
    /// # Errors
    ///
    /// Any transport failure.
    fn send_event(&self, name: &str, params: Dict) -> ReceiverResult<()>;
}

/// An accepted, not yet authenticated connection.
#[derive(Clone)]
pub struct Connection {
    pub peer: SocketAddr,
    pub transport_type: TransportType,
    pub client_device_id: DeviceId,
    pub client_session_id: ClientSessionId,
    /// Bytes the key exchange consumes. Opaque to the receiver.
    pub auth_payload: bytes::Bytes,
    pub link: Arc<dyn ControllerLink>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("transport_type", &self.transport_type)
            .field("client_device_id", &self.client_device_id.to_string())
            .field("client_session_id", &self.client_session_id.to_string())
            .field("auth_payload_len", &self.auth_payload.len())
            .finish_non_exhaustive()
    }
}

/// Identity of a session. Fixed once the session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub transport_type: TransportType,
    pub client_device_id: DeviceId,
    pub client_session_id: ClientSessionId,
}

impl SessionInfo {
    #[must_use]
    pub fn for_connection(id: SessionId, connection: &Connection) -> Self {
        Self {
            id,
            peer: connection.peer,
            transport_type: connection.transport_type,
            client_device_id: connection.client_device_id,
            client_session_id: connection.client_session_id,
        }
    }
}

/// Secrets the authenticator must check the connection against.
#[derive(Debug, Default)]
pub struct AuthChallenge {
    /// PIN shown to the user for this connection.
    pub pin: Option<SecretString>,
    pub password: Option<SecretString>,
}

/// Result of a successful key exchange, stored verbatim on the session.
#[derive(Debug)]
pub enum SecurityContext {
    Symmetric {
        key: SecretBox<Vec<u8>>,
        iv: SecretBox<Vec<u8>>,
    },
    /// The platform keeps the keys; we only hold its handle.
    Pairing(u64),
}

impl SecurityContext {
    #[must_use]
    pub fn symmetric(key: Vec<u8>, iv: Vec<u8>) -> Self {
        SecurityContext::Symmetric {
            key: SecretBox::new(Box::new(key)),
            iv: SecretBox::new(Box::new(iv)),
        }
    }

    /// Loggable stand-in for the key: a short SHA-256 prefix.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        match self {
            SecurityContext::Symmetric { key, .. } => {
                let digest = digest::digest(&digest::SHA256, key.expose_secret());
                let prefix = digest.as_ref().get(..8).unwrap_or_default();
                format!("sha256:{}", hex::encode(prefix))
            }
            SecurityContext::Pairing(handle) => format!("pairing:{handle:#x}"),
        }
    }
}

/// Key exchange (enables mocking).
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// # Errors
    ///
    /// `AuthFailed` when the connection does not authenticate; anything else
    /// the exchange reports.
    async fn authenticate(
        &self,
        connection: &Connection,
        challenge: &AuthChallenge,
    ) -> ReceiverResult<SecurityContext>;
}

/// Clock synchronization with the controller. Times are nanoseconds.
///
/// Called from real-time audio callbacks, so implementations must not block.
pub trait ClockSync: Send + Sync {
    fn synchronized_time(&self) -> u64;

    fn synchronized_time_near_local_tick(&self, tick: u64) -> u64;

    fn local_tick_near_synchronized_time(&self, time: u64) -> u64;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct NoBrowse;

    #[async_trait]
    impl Advertiser for NoBrowse {
        async fn advertise(&self, _record: &ServiceRecord) -> ReceiverResult<AdvertisementHandle> {
            Ok(AdvertisementHandle(1))
        }

        async fn stop_advertising(&self, _handle: AdvertisementHandle) -> ReceiverResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_browse_unsupported_by_default() {
        let result = NoBrowse.browse(SERVICE_TYPE).await;
        assert!(matches!(result, Err(ReceiverError::UnsupportedCommand(_))));
    }

    #[test]
    fn test_fingerprint_hides_key() {
        let key = vec![0xAB; 16];
        let context = SecurityContext::symmetric(key, vec![0x01; 16]);

        let fingerprint = context.fingerprint();
        assert!(fingerprint.starts_with("sha256:"));
        assert_eq!(fingerprint.len(), "sha256:".len() + 16);
        assert!(!fingerprint.contains("abababab"));

        // Same key, same fingerprint
        let again = SecurityContext::symmetric(vec![0xAB; 16], vec![0x02; 16]);
        assert_eq!(again.fingerprint(), fingerprint);

        assert_eq!(SecurityContext::Pairing(0x2a).fingerprint(), "pairing:0x2a");
    }

    #[test]
    fn test_security_context_debug_redacts() {
        let context = SecurityContext::symmetric(b"supersecretkey!!".to_vec(), vec![0; 16]);
        let debug = format!("{context:?}");
        assert!(!debug.contains("supersecretkey"));
    }

    #[test]
    fn test_service_record_attributes() {
        let record = ServiceRecord {
            service_type: SERVICE_TYPE.to_string(),
            name: "Dash".to_string(),
            device_id: "00:11:22:33:44:55".parse().unwrap(),
            features: 0x44,
            pin_required: true,
            password_required: false,
            source_version: "1.0".to_string(),
        };

        let attributes = record.attributes();
        assert_eq!(attributes.get("deviceid").unwrap(), "00:11:22:33:44:55");
        assert_eq!(attributes.get("features").unwrap(), "0x44");
        assert_eq!(attributes.get("pin").unwrap(), "1");
        assert_eq!(attributes.get("pw").unwrap(), "0");
    }
}
