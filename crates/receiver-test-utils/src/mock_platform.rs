//! Mock platform services.
//!
//! - `MockAdvertiser` records every service record it is asked to publish
//! - `MockListener` counts starts and stops, and can be told to fail binding
//! - `MockAuthenticator` accepts or rejects, and records the challenges it saw
//! - `MockClock` reports a settable synchronized time
//!
//! # Example
//!
//! ```rust,ignore
//! use receiver_test_utils::MockAuthenticator;
//!
//! let authenticator = MockAuthenticator::builder().reject().build();
//! ```

use accessory_receiver::errors::{ReceiverError, ReceiverResult};
use accessory_receiver::platform::{
    AdvertisementHandle, Advertiser, AuthChallenge, Authenticator, ClockSync, Connection,
    Listener, ListenerInfo, SecurityContext, ServiceRecord,
};
use async_trait::async_trait;
use common::secret::ExposeSecret;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Mock service discovery.
#[derive(Debug, Default)]
pub struct MockAdvertiser {
    inner: Mutex<MockAdvertiserInner>,
}

#[derive(Debug, Default)]
struct MockAdvertiserInner {
    records: Vec<ServiceRecord>,
    active: Vec<AdvertisementHandle>,
    next_handle: u64,
    fail: bool,
}

impl MockAdvertiser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `advertise` call fail.
    #[must_use]
    pub fn failing() -> Self {
        let advertiser = Self::default();
        advertiser.inner.lock().unwrap().fail = true;
        advertiser
    }

    /// Every record advertised so far, oldest first.
    pub fn records(&self) -> Vec<ServiceRecord> {
        self.inner.lock().unwrap().records.clone()
    }

    /// Advertisements not yet stopped.
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }
}

#[async_trait]
impl Advertiser for MockAdvertiser {
    async fn advertise(&self, record: &ServiceRecord) -> ReceiverResult<AdvertisementHandle> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail {
            return Err(ReceiverError::NotReady("discovery unavailable".to_string()));
        }
        inner.next_handle += 1;
        let handle = AdvertisementHandle(inner.next_handle);
        inner.records.push(record.clone());
        inner.active.push(handle);
        Ok(handle)
    }

    async fn stop_advertising(&self, handle: AdvertisementHandle) -> ReceiverResult<()> {
        self.inner.lock().unwrap().active.retain(|h| *h != handle);
        Ok(())
    }
}

/// Mock listening transport.
#[derive(Debug)]
pub struct MockListener {
    info: ListenerInfo,
    starts: AtomicU64,
    stops: AtomicU64,
    fail_bind: bool,
}

impl Default for MockListener {
    fn default() -> Self {
        Self::new()
    }
}

impl MockListener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            info: ListenerInfo {
                interface_name: "wlan0".to_string(),
                port: 7000,
            },
            starts: AtomicU64::new(0),
            stops: AtomicU64::new(0),
            fail_bind: false,
        }
    }

    /// A listener whose `start` always fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_bind: true,
            ..Self::new()
        }
    }

    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Listener for MockListener {
    async fn start(&self) -> ReceiverResult<ListenerInfo> {
        if self.fail_bind {
            return Err(ReceiverError::NotReady("address in use".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(self.info.clone())
    }

    async fn stop(&self) -> ReceiverResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What a [`MockAuthenticator`] saw for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenChallenge {
    pub pin: Option<String>,
    pub password: Option<String>,
}

/// Mock key exchange.
#[derive(Debug)]
pub struct MockAuthenticator {
    accept: bool,
    next_handle: AtomicU64,
    challenges: Mutex<Vec<SeenChallenge>>,
}

impl MockAuthenticator {
    /// Create a new `MockAuthenticator` builder.
    #[must_use]
    pub fn builder() -> MockAuthenticatorBuilder {
        MockAuthenticatorBuilder::default()
    }

    /// Authenticator that accepts every connection.
    #[must_use]
    pub fn accepting() -> Self {
        Self::builder().accept().build()
    }

    /// Authenticator that rejects every connection.
    #[must_use]
    pub fn rejecting() -> Self {
        Self::builder().reject().build()
    }

    /// Challenges seen so far, secrets exposed for assertions.
    pub fn challenges(&self) -> Vec<SeenChallenge> {
        self.challenges.lock().unwrap().clone()
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn authenticate(&self, _connection: &Connection, challenge: &AuthChallenge) -> ReceiverResult<SecurityContext> {
        self.challenges.lock().unwrap().push(SeenChallenge {
            pin: challenge.pin.as_ref().map(|p| p.expose_secret().to_string()),
            password: challenge
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_string()),
        });
        if !self.accept {
            return Err(ReceiverError::AuthFailed("pairing rejected".to_string()));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        Ok(SecurityContext::Pairing(handle))
    }
}

/// Builder for `MockAuthenticator` configuration.
#[derive(Debug)]
pub struct MockAuthenticatorBuilder {
    accept: bool,
}

impl Default for MockAuthenticatorBuilder {
    fn default() -> Self {
        Self { accept: true }
    }
}

impl MockAuthenticatorBuilder {
    /// Configure the mock to accept every connection.
    #[must_use]
    pub fn accept(mut self) -> Self {
        self.accept = true;
        self
    }

    /// Configure the mock to reject every connection with `AuthFailed`.
    #[must_use]
    pub fn reject(mut self) -> Self {
        self.accept = false;
        self
    }

    #[must_use]
    pub fn build(self) -> MockAuthenticator {
        MockAuthenticator {
            accept: self.accept,
            next_handle: AtomicU64::new(1),
            challenges: Mutex::new(Vec::new()),
        }
    }
}

/// Clock whose synchronized time is whatever the test last set. Local ticks
/// and synchronized times are offset by a fixed amount.
#[derive(Debug, Default)]
pub struct MockClock {
    now: AtomicU64,
    offset: u64,
}

impl MockClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_offset(offset: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            offset,
        }
    }

    pub fn set(&self, nanos: u64) {
        self.now.store(nanos, Ordering::SeqCst);
    }
}

impl ClockSync for MockClock {
    fn synchronized_time(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn synchronized_time_near_local_tick(&self, tick: u64) -> u64 {
        tick.wrapping_add(self.offset)
    }

    fn local_tick_near_synchronized_time(&self, time: u64) -> u64 {
        time.wrapping_sub(self.offset)
    }
}
