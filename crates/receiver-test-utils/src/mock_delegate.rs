//! Recording delegates.
//!
//! `RecordingServerDelegate` hands every created session its own
//! `RecordingSessionDelegate` and keeps both around for assertions.

use accessory_receiver::arbiter::Revocation;
use accessory_receiver::delegate::{ServerDelegate, SessionDelegate, StreamSetup};
use accessory_receiver::errors::{ReceiverError, ReceiverResult};
use accessory_receiver::platform::SessionInfo;
use accessory_receiver::protocol::{ModeState, StreamType};
use accessory_receiver::value::Dict;
use common::secret::{ExposeSecret, SecretString};
use common::types::SessionId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One callback received by a [`RecordingSessionDelegate`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCall {
    Initialize,
    Finalize,
    Started,
    SetupStream(StreamType),
    TeardownStream(StreamType),
    ModesChanged(ModeState),
    RequestUi(Option<String>),
    DuckAudio { duration: Duration, volume: f64 },
    UnduckAudio(Duration),
    ResourceRevoked { revocation: Revocation, grace: Duration },
}

/// Session delegate that records every callback.
#[derive(Debug, Default)]
pub struct RecordingSessionDelegate {
    calls: Mutex<Vec<SessionCall>>,
}

impl RecordingSessionDelegate {
    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls for which `matches` holds.
    pub fn count(&self, matches: impl Fn(&SessionCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub fn finalized(&self) -> usize {
        self.count(|c| matches!(c, SessionCall::Finalize))
    }

    pub fn revocations(&self) -> Vec<Revocation> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                SessionCall::ResourceRevoked { revocation, .. } => Some(revocation.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: SessionCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl SessionDelegate for RecordingSessionDelegate {
    fn initialize(&self, _info: &SessionInfo) -> ReceiverResult<()> {
        self.record(SessionCall::Initialize);
        Ok(())
    }

    fn finalize(&self, _info: &SessionInfo) {
        self.record(SessionCall::Finalize);
    }

    fn started(&self, _info: &SessionInfo) {
        self.record(SessionCall::Started);
    }

    fn setup_stream(&self, stream: &StreamSetup) -> ReceiverResult<Dict> {
        self.record(SessionCall::SetupStream(stream.stream_type));
        Ok(Dict::new())
    }

    fn teardown_stream(&self, stream_type: StreamType) {
        self.record(SessionCall::TeardownStream(stream_type));
    }

    fn modes_changed(&self, modes: &ModeState) {
        self.record(SessionCall::ModesChanged(modes.clone()));
    }

    fn request_ui(&self, url: Option<&str>) {
        self.record(SessionCall::RequestUi(url.map(str::to_string)));
    }

    fn duck_audio(&self, duration: Duration, volume: f64) {
        self.record(SessionCall::DuckAudio { duration, volume });
    }

    fn unduck_audio(&self, duration: Duration) {
        self.record(SessionCall::UnduckAudio(duration));
    }

    fn resource_revoked(&self, revocation: &Revocation, grace: Duration) {
        self.record(SessionCall::ResourceRevoked {
            revocation: revocation.clone(),
            grace,
        });
    }
}

/// Server delegate that records sessions, failures, local revocations and
/// displayed PINs.
#[derive(Debug, Default)]
pub struct RecordingServerDelegate {
    inner: Mutex<RecordingServerInner>,
    refuse_sessions: bool,
}

#[derive(Debug, Default)]
struct RecordingServerInner {
    created: Vec<SessionInfo>,
    sessions: HashMap<SessionId, Arc<RecordingSessionDelegate>>,
    failures: Vec<ReceiverError>,
    ended: Vec<(SessionId, Option<ReceiverError>)>,
    revoked: Vec<Revocation>,
    pins: Vec<String>,
}

impl RecordingServerDelegate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A delegate that refuses every session in `session_created`.
    #[must_use]
    pub fn refusing() -> Self {
        Self {
            refuse_sessions: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<SessionInfo> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn session_delegate(&self, id: SessionId) -> Option<Arc<RecordingSessionDelegate>> {
        self.inner.lock().unwrap().sessions.get(&id).cloned()
    }

    pub fn failures(&self) -> Vec<ReceiverError> {
        self.inner.lock().unwrap().failures.clone()
    }

    pub fn ended(&self) -> Vec<(SessionId, Option<ReceiverError>)> {
        self.inner.lock().unwrap().ended.clone()
    }

    pub fn has_ended(&self, id: SessionId) -> bool {
        self.inner.lock().unwrap().ended.iter().any(|(e, _)| *e == id)
    }

    pub fn revoked(&self) -> Vec<Revocation> {
        self.inner.lock().unwrap().revoked.clone()
    }

    pub fn pins(&self) -> Vec<String> {
        self.inner.lock().unwrap().pins.clone()
    }
}

impl ServerDelegate for RecordingServerDelegate {
    fn session_created(&self, info: &SessionInfo) -> ReceiverResult<Arc<dyn SessionDelegate>> {
        if self.refuse_sessions {
            return Err(ReceiverError::NotReady("sessions refused".to_string()));
        }
        let delegate = Arc::new(RecordingSessionDelegate::default());
        let mut inner = self.inner.lock().unwrap();
        inner.created.push(info.clone());
        inner.sessions.insert(info.id, Arc::clone(&delegate));
        Ok(delegate)
    }

    fn session_failed(&self, reason: &ReceiverError) {
        self.inner.lock().unwrap().failures.push(reason.clone());
    }

    fn session_ended(&self, id: SessionId, reason: Option<&ReceiverError>) {
        self.inner.lock().unwrap().ended.push((id, reason.cloned()));
    }

    fn resource_revoked(&self, revocation: &Revocation) {
        self.inner.lock().unwrap().revoked.push(revocation.clone());
    }

    fn display_pin(&self, pin: &SecretString) {
        self.inner
            .lock()
            .unwrap()
            .pins
            .push(pin.expose_secret().to_string());
    }
}
