//! `SessionActor` - one authenticated conversation with one controller.
//!
//! Lifecycle:
//!
//! ```text
//! Authenticated -> Announced -> StreamsConfigured -> Recording -> Active
//!        \______________\_______________\________________\__________\
//!                                                                     -> TearingDown -> Terminated
//! ```
//!
//! A session is born `Authenticated`, already carrying its security context.
//! `setUpStreams` without streams announces; with streams it configures them
//! (announcing implicitly if needed) and is repeatable while `Active`.
//! `record` then `start` bring it to `Active`. Teardown runs to `Terminated`
//! in one step on the session's queue: pending commands and deferred
//! requests complete with `Cancelled`, `finalize` runs exactly once, and the
//! server is told the session may be deleted. The actor keeps answering
//! (teardown with success, everything else with `NotReady`) until the server
//! cancels it.
//!
//! Audio stream setup first claims the server's single-audio flag. Requests
//! arriving while that claim is outstanding are deferred and replayed in
//! arrival order once the server answers.
//!
//! A panic in delegate code is contained to the message that triggered it:
//! the caller sees `Unknown` (or `Cancelled` if its reply was lost with the
//! panic) and the session is torn down as for any other unplanned failure.
//!
//! The actor's state sits behind a mutex that only the session's own task
//! takes. Completion jobs run with it released, so code on the session's
//! queue can issue direct calls to the session; those run inline.

use super::dispatch::{Dispatcher, PendingCommands, Reply, Request, RequestKind};
use super::messages::{ServerNotice, SessionMessage, SessionNotice, SessionStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::queue::{run_job, run_on_queue, Job, Lane, QueueId};
use crate::arbiter::{ClaimKind, ResourceOutcome, Revocation};
use crate::audio::{
    AudioFormat, AudioRing, AudioStreams, ReadOutcome, WriteOutcome, DEFAULT_BYTES_PER_FRAME,
    DEFAULT_SAMPLE_RATE,
};
use crate::config::ReceiverConfig;
use crate::delegate::{SessionDelegate, StreamSetup};
use crate::errors::{ReceiverError, ReceiverResult, STATUS_OK};
use crate::observability::metrics as prom;
use crate::platform::{ClockSync, ControllerLink, OutboundCommand, SecurityContext, SessionInfo};
use crate::protocol::{
    commands, keys, properties, AppStateChange, ModeState, ResourceChange, ResourceId, SpeechMode,
    StreamType, TransferPriority, TransferType,
};
use crate::value::{Dict, DictExt, Value};
use async_trait::async_trait;
use bytes::Bytes;
use common::types::SessionId;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Session lifecycle state. Ordered: later states compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SessionState {
    Authenticated,
    Announced,
    StreamsConfigured,
    Recording,
    Active,
    TearingDown,
    Terminated,
}

impl SessionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Authenticated => "authenticated",
            SessionState::Announced => "announced",
            SessionState::StreamsConfigured => "streams_configured",
            SessionState::Recording => "recording",
            SessionState::Active => "active",
            SessionState::TearingDown => "tearing_down",
            SessionState::Terminated => "terminated",
        }
    }

    fn is_ending(self) -> bool {
        self >= SessionState::TearingDown
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session settings taken from [`ReceiverConfig`].
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub command_timeout: Duration,
    pub audio_ring_frames: usize,
    pub mailbox: usize,
}

impl From<&ReceiverConfig> for SessionConfig {
    fn from(config: &ReceiverConfig) -> Self {
        Self {
            command_timeout: config.command_timeout,
            audio_ring_frames: config.audio_ring_frames,
            mailbox: config.session_mailbox,
        }
    }
}

/// Milestones from advertisement to `Active`.
#[derive(Debug, Clone)]
pub(crate) struct PhaseTiming {
    pub advertised_at: Option<Instant>,
    pub accepted_at: Instant,
    pub authenticated_at: Instant,
    pub announced_at: Option<Instant>,
    pub audio_setup_at: Option<Instant>,
    pub screen_setup_at: Option<Instant>,
    pub recorded_at: Option<Instant>,
    pub started_at: Option<Instant>,
}

fn elapsed_ms(from: Option<Instant>, to: Option<Instant>) -> Option<i64> {
    let (from, to) = (from?, to?);
    i64::try_from(to.checked_duration_since(from)?.as_millis()).ok()
}

impl PhaseTiming {
    pub fn new(advertised_at: Option<Instant>, accepted_at: Instant, authenticated_at: Instant) -> Self {
        Self {
            advertised_at,
            accepted_at,
            authenticated_at,
            announced_at: None,
            audio_setup_at: None,
            screen_setup_at: None,
            recorded_at: None,
            started_at: None,
        }
    }

    fn last_setup(&self) -> Option<Instant> {
        match (self.audio_setup_at, self.screen_setup_at) {
            (Some(a), Some(s)) => Some(a.max(s)),
            (a, s) => a.or(s),
        }
    }

    /// Phase durations in milliseconds. Phases not yet reached are absent.
    fn phases(&self) -> Vec<(&'static str, i64)> {
        [
            ("bonjourMs", elapsed_ms(self.advertised_at, Some(self.accepted_at))),
            ("authMs", elapsed_ms(Some(self.accepted_at), Some(self.authenticated_at))),
            ("announceMs", elapsed_ms(Some(self.authenticated_at), self.announced_at)),
            ("setupAudioMs", elapsed_ms(self.announced_at, self.audio_setup_at)),
            ("setupScreenMs", elapsed_ms(self.announced_at, self.screen_setup_at)),
            ("recordMs", elapsed_ms(self.last_setup(), self.recorded_at)),
            ("totalMs", elapsed_ms(Some(self.accepted_at), self.started_at)),
        ]
        .into_iter()
        .filter_map(|(name, ms)| ms.map(|ms| (name, ms)))
        .collect()
    }

    fn to_dict(&self) -> Dict {
        self.phases()
            .into_iter()
            .map(|(name, ms)| (name.to_string(), Value::Integer(ms)))
            .collect()
    }

    fn phase(&self, name: &str) -> i64 {
        self.phases()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map_or(-1, |(_, ms)| ms)
    }
}

/// Builders for every request a session accepts. Pass them to
/// [`Dispatcher::call_blocking`] or [`Dispatcher::call_with_completion`];
/// the typed methods on [`SessionHandle`] are the blocking forms.
pub mod requests {
    use super::{commands, keys, AppStateChange, Bytes, Dict, Request, ResourceChange, StreamType, Value};
    use std::time::Duration;

    fn stream_list(streams: &[StreamType]) -> Value {
        Value::Array(
            streams
                .iter()
                .map(|t| Value::Dict(Dict::from([(keys::TYPE.to_string(), Value::from(*t))])))
                .collect(),
        )
    }

    /// `params` is the controller's offer; its `streams` entry, if any,
    /// lists the streams to configure.
    #[must_use]
    pub fn set_up_streams(params: Dict) -> Request {
        Request::control(commands::SET_UP_STREAMS, params)
    }

    /// Empty `streams` tears down the whole session.
    #[must_use]
    pub fn tear_down(streams: &[StreamType], reason: Option<&str>) -> Request {
        let mut params = Dict::new();
        if !streams.is_empty() {
            params.insert(keys::STREAMS.to_string(), stream_list(streams));
        }
        if let Some(reason) = reason {
            params.insert(keys::REASON.to_string(), Value::from(reason));
        }
        Request::control(commands::TEAR_DOWN_STREAMS, params)
    }

    #[must_use]
    pub fn record() -> Request {
        Request::control(commands::RECORD, Dict::new())
    }

    #[must_use]
    pub fn start(timing: Dict) -> Request {
        Request::control(commands::START, timing)
    }

    #[must_use]
    pub fn flush_audio(until_timestamp: u32, until_sequence: Option<u32>) -> Request {
        let mut params = Dict::from([(
            keys::UNTIL_TIMESTAMP.to_string(),
            Value::from(until_timestamp),
        )]);
        if let Some(sequence) = until_sequence {
            params.insert(keys::UNTIL_SEQUENCE.to_string(), Value::from(sequence));
        }
        Request::control(commands::FLUSH_AUDIO, params)
    }

    #[must_use]
    pub fn change_resource_mode(change: &ResourceChange) -> Request {
        Request::control(commands::CHANGE_RESOURCE_MODE, change.to_params())
    }

    #[must_use]
    pub fn change_app_state(change: &AppStateChange) -> Request {
        Request::control(commands::CHANGE_MODES, change.to_params())
    }

    #[must_use]
    pub fn request_ui(url: Option<&str>) -> Request {
        let mut params = Dict::new();
        if let Some(url) = url {
            params.insert(keys::URL.to_string(), Value::from(url));
        }
        Request::control(commands::REQUEST_UI, params)
    }

    #[must_use]
    pub fn set_night_mode(on: bool) -> Request {
        Request::control(
            commands::SET_NIGHT_MODE,
            Dict::from([(keys::NIGHT_MODE.to_string(), Value::from(on))]),
        )
    }

    #[must_use]
    pub fn set_limited_ui(on: bool) -> Request {
        Request::control(
            commands::SET_LIMITED_UI,
            Dict::from([(keys::LIMITED_UI.to_string(), Value::from(on))]),
        )
    }

    #[must_use]
    pub fn send_message(message: Bytes) -> Request {
        Request::control(
            commands::SEND_MESSAGE,
            Dict::from([(keys::MESSAGE.to_string(), Value::from(message))]),
        )
    }

    #[must_use]
    pub fn update_vehicle_information(information: Dict) -> Request {
        Request::control(
            commands::UPDATE_VEHICLE_INFORMATION,
            Dict::from([(
                keys::VEHICLE_INFORMATION.to_string(),
                Value::from(information),
            )]),
        )
    }

    #[must_use]
    pub fn force_key_frame() -> Request {
        Request::control(commands::FORCE_KEY_FRAME, Dict::new())
    }

    #[must_use]
    pub fn request_siri_action(action: i64) -> Request {
        Request::control(
            commands::REQUEST_SIRI,
            Dict::from([(keys::SIRI_ACTION.to_string(), Value::from(action))]),
        )
    }

    /// Override the command deadline of an outbound controller command.
    #[must_use]
    pub fn with_timeout(mut request: Request, timeout: Duration) -> Request {
        if let crate::actors::dispatch::RequestKind::Control { params, .. } = &mut request.kind {
            let ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
            params.insert(keys::TIMEOUT_MS.to_string(), Value::Integer(ms));
        }
        request
    }
}

/// Handle to a `SessionActor`.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    queue: QueueId,
    sender: mpsc::Sender<SessionMessage>,
    lane: Lane<SessionNotice>,
    mailbox: Arc<MailboxMonitor>,
    actor: Weak<Mutex<SessionActor>>,
    audio: Arc<AudioStreams>,
    cancel_token: CancellationToken,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dispatcher for SessionHandle {
    fn queue_id(&self) -> QueueId {
        self.queue
    }

    async fn enqueue(&self, request: Request, reply: Reply) -> ReceiverResult<()> {
        self.send(SessionMessage::Dispatch { request, reply }).await
    }

    fn dispatch_inline(&self, request: Request) -> ReceiverResult<Value> {
        let actor = self
            .actor
            .upgrade()
            .ok_or_else(|| ReceiverError::NotReady("session terminated".to_string()))?;
        // Held only while the session handles a message: this is a handler
        // calling back into its own session
        let mut actor = actor.try_lock().map_err(|_| {
            ReceiverError::NotReady(format!("'{}' issued from inside a session handler", request.name()))
        })?;
        actor.dispatch_inline(request)
    }
}

impl SessionHandle {
    async fn send(&self, message: SessionMessage) -> ReceiverResult<()> {
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|e| {
            self.mailbox.record_unsent();
            ReceiverError::NotReady(format!("channel send failed: {e}"))
        })
    }

    /// Messages sent to the session and not yet handled.
    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.current_depth()
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Cancel the actor (for immediate shutdown). Runs teardown first.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub(crate) fn notify(&self, notice: SessionNotice) -> Result<(), SessionNotice> {
        self.lane.try_post(notice)
    }

    /// Audio rings shared with the real-time side.
    #[must_use]
    pub fn audio(&self) -> &Arc<AudioStreams> {
        &self.audio
    }

    /// Real-time read; never waits on the session's queue.
    pub fn read_audio(&self, stream_type: StreamType, sample_time: u32, out: &mut [u8]) -> ReadOutcome {
        self.audio.read(stream_type, sample_time, out)
    }

    /// Real-time write; never waits on the session's queue.
    ///
    /// # Errors
    ///
    /// See [`AudioStreams::write`].
    pub fn write_audio(
        &self,
        stream_type: StreamType,
        sample_time: u32,
        host_tick: u64,
        data: &[u8],
    ) -> ReceiverResult<WriteOutcome> {
        self.audio.write(stream_type, sample_time, host_tick, data)
    }

    /// Feed the controller's reply to an outbound command.
    ///
    /// # Errors
    ///
    /// `NotReady` if the session is gone.
    pub async fn controller_reply(&self, transaction: u64, response: Dict) -> ReceiverResult<()> {
        self.send(SessionMessage::ControllerReply {
            transaction,
            response,
        })
        .await
    }

    /// Report a transport or security failure; the session tears down.
    ///
    /// # Errors
    ///
    /// `NotReady` if the session is gone.
    pub async fn transport_failed(&self, error: ReceiverError) -> ReceiverResult<()> {
        self.send(SessionMessage::TransportFailed { error }).await
    }

    /// # Errors
    ///
    /// `NotReady` if the session is gone.
    pub async fn status(&self) -> ReceiverResult<SessionStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::GetStatus { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| ReceiverError::NotReady(format!("response receive failed: {e}")))
    }

    /// # Errors
    ///
    /// Whatever the session or its delegate reports.
    pub async fn set_up_streams(&self, params: Dict) -> ReceiverResult<Dict> {
        self.call_blocking(requests::set_up_streams(params))
            .await
            .map(Value::into_dict)
    }

    /// Returns `done`: true once the whole session is down.
    ///
    /// # Errors
    ///
    /// Whatever the session reports for a partial teardown.
    pub async fn tear_down(&self, streams: &[StreamType], reason: Option<&str>) -> ReceiverResult<bool> {
        match self.call_blocking(requests::tear_down(streams, reason)).await {
            Ok(response) => Ok(response.into_dict().bool_field(keys::DONE).unwrap_or(true)),
            // Already removed by the server: nothing left to tear down
            Err(ReceiverError::NotReady(_)) if self.sender.is_closed() => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// # Errors
    ///
    /// `NotReady` unless streams are configured.
    pub async fn record(&self) -> ReceiverResult<()> {
        self.call_blocking(requests::record()).await.map(|_| ())
    }

    /// # Errors
    ///
    /// `NotReady` unless recording.
    pub async fn start(&self, timing: Dict) -> ReceiverResult<()> {
        self.call_blocking(requests::start(timing)).await.map(|_| ())
    }

    /// Returns the last sample time the rings still hold.
    ///
    /// # Errors
    ///
    /// `NotReady` before streams are configured.
    pub async fn flush_audio(&self, until_timestamp: u32, until_sequence: Option<u32>) -> ReceiverResult<u32> {
        let response = self
            .call_blocking(requests::flush_audio(until_timestamp, until_sequence))
            .await?
            .into_dict();
        response
            .int_field(keys::LAST_TIMESTAMP)
            .and_then(|ts| u32::try_from(ts).ok())
            .ok_or_else(|| ReceiverError::Unknown("flush response without lastTimestamp".to_string()))
    }

    /// # Errors
    ///
    /// `NotReady` unless `Active`; `Cancelled` if the session ends first.
    pub async fn change_resource_mode(&self, change: &ResourceChange) -> ReceiverResult<ResourceOutcome> {
        let value = self
            .call_blocking(requests::change_resource_mode(change))
            .await?;
        ResourceOutcome::from_value(&value)
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_resource_mode`].
    pub async fn take_resource(&self, resource: ResourceId, priority: TransferPriority) -> ReceiverResult<ResourceOutcome> {
        self.change_resource_mode(&ResourceChange::take(resource, priority))
            .await
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_resource_mode`].
    pub async fn untake_resource(&self, resource: ResourceId) -> ReceiverResult<ResourceOutcome> {
        self.change_resource_mode(&ResourceChange::untake(resource))
            .await
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_resource_mode`].
    pub async fn borrow_resource(&self, resource: ResourceId, priority: TransferPriority) -> ReceiverResult<ResourceOutcome> {
        self.change_resource_mode(&ResourceChange::borrow(resource, priority))
            .await
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_resource_mode`].
    pub async fn unborrow_resource(&self, resource: ResourceId) -> ReceiverResult<ResourceOutcome> {
        self.change_resource_mode(&ResourceChange::unborrow(resource))
            .await
    }

    /// # Errors
    ///
    /// `NotReady` unless `Active`, `Timeout` without a reply in time, or
    /// the status the controller answered with.
    pub async fn change_app_state(&self, change: &AppStateChange) -> ReceiverResult<Dict> {
        self.call_blocking(requests::change_app_state(change))
            .await
            .map(Value::into_dict)
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_app_state`].
    pub async fn set_phone_call(&self, active: bool) -> ReceiverResult<Dict> {
        self.change_app_state(&AppStateChange::phone_call(active))
            .await
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_app_state`].
    pub async fn set_speech_mode(&self, mode: SpeechMode) -> ReceiverResult<Dict> {
        self.change_app_state(&AppStateChange::speech_mode(mode))
            .await
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_app_state`].
    pub async fn set_turn_by_turn(&self, active: bool) -> ReceiverResult<Dict> {
        self.change_app_state(&AppStateChange::turn_by_turn(active))
            .await
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_app_state`].
    pub async fn request_ui(&self, url: Option<&str>) -> ReceiverResult<Dict> {
        self.call_blocking(requests::request_ui(url))
            .await
            .map(Value::into_dict)
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_app_state`].
    pub async fn set_night_mode(&self, on: bool) -> ReceiverResult<Dict> {
        self.call_blocking(requests::set_night_mode(on))
            .await
            .map(Value::into_dict)
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_app_state`].
    pub async fn set_limited_ui(&self, on: bool) -> ReceiverResult<Dict> {
        self.call_blocking(requests::set_limited_ui(on))
            .await
            .map(Value::into_dict)
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_app_state`].
    pub async fn send_message(&self, message: Bytes) -> ReceiverResult<Dict> {
        self.call_blocking(requests::send_message(message))
            .await
            .map(Value::into_dict)
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_app_state`].
    pub async fn update_vehicle_information(&self, information: Dict) -> ReceiverResult<Dict> {
        self.call_blocking(requests::update_vehicle_information(information))
            .await
            .map(Value::into_dict)
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_app_state`].
    pub async fn force_key_frame(&self) -> ReceiverResult<Dict> {
        self.call_blocking(requests::force_key_frame())
            .await
            .map(Value::into_dict)
    }

    /// # Errors
    ///
    /// See [`SessionHandle::change_app_state`].
    pub async fn request_siri_action(&self, action: i64) -> ReceiverResult<Dict> {
        self.call_blocking(requests::request_siri_action(action))
            .await
            .map(Value::into_dict)
    }
}

/// Everything a session needs at spawn time.
pub(crate) struct SessionParts {
    pub info: SessionInfo,
    pub security: SecurityContext,
    pub delegate: Arc<dyn SessionDelegate>,
    pub link: Arc<dyn ControllerLink>,
    pub clock: Arc<dyn ClockSync>,
    pub server: Lane<ServerNotice>,
    pub config: SessionConfig,
    pub timing: PhaseTiming,
    pub metrics: Arc<ActorMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AudioClaim {
    None,
    Pending,
    Held,
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    info: SessionInfo,
    security: SecurityContext,
    delegate: Arc<dyn SessionDelegate>,
    link: Arc<dyn ControllerLink>,
    clock: Arc<dyn ClockSync>,
    server: Lane<ServerNotice>,
    config: SessionConfig,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
    lane: Lane<SessionNotice>,

    state: SessionState,
    offer: Dict,
    start_params: Dict,
    timing: PhaseTiming,
    streams: BTreeMap<StreamType, Dict>,
    audio: Arc<AudioStreams>,
    audio_claim: AudioClaim,
    /// The setup request waiting on the audio claim.
    awaiting_claim: Option<(Vec<StreamSetup>, Reply)>,
    deferred: VecDeque<(Request, Reply)>,
    pending: PendingCommands,
    /// Mirror of what the arbiter granted this session.
    claims: BTreeMap<(ResourceId, ClaimKind), TransferPriority>,
    modes: ModeState,
    finalized: bool,
    /// Set when a delegate call panicked; forces teardown once the current
    /// message is handled.
    faulted: Option<ReceiverError>,
}

impl SessionActor {
    /// Spawn the session's queue and return a handle to it.
    pub(crate) fn spawn(parts: SessionParts, cancel_token: CancellationToken) -> (SessionHandle, JoinHandle<()>) {
        let queue = QueueId::next();
        let (sender, receiver) = mpsc::channel(parts.config.mailbox.max(1));
        let (lane, notices) = Lane::new(queue, SessionNotice::Job);
        let audio = AudioStreams::new();
        let id = parts.info.id;
        let peer = parts.info.peer;
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Session, id.to_string()));
        let metrics = Arc::clone(&parts.metrics);

        let actor = Arc::new(Mutex::new(Self {
            mailbox: Arc::clone(&mailbox),
            info: parts.info,
            security: parts.security,
            delegate: parts.delegate,
            link: parts.link,
            clock: parts.clock,
            server: parts.server,
            config: parts.config,
            metrics: parts.metrics,
            lane: lane.clone(),
            state: SessionState::Authenticated,
            offer: Dict::new(),
            start_params: Dict::new(),
            timing: parts.timing,
            streams: BTreeMap::new(),
            audio: Arc::clone(&audio),
            audio_claim: AudioClaim::None,
            awaiting_claim: None,
            deferred: VecDeque::new(),
            pending: PendingCommands::default(),
            claims: BTreeMap::new(),
            modes: ModeState::default(),
            finalized: false,
            faulted: None,
        }));

        let handle = SessionHandle {
            id,
            queue,
            sender,
            lane,
            mailbox: Arc::clone(&mailbox),
            actor: Arc::downgrade(&actor),
            audio,
            cancel_token: cancel_token.clone(),
        };

        let task_loop = SessionLoop {
            id,
            peer,
            actor,
            receiver,
            notices,
            cancel_token,
            mailbox,
            metrics,
        };
        let task = tokio::spawn(run_on_queue(queue, task_loop.run()));

        (handle, task)
    }

    fn log_started(&self) {
        info!(
            target: "ar.actor.session",
            session_id = %self.info.id,
            peer = %self.info.peer,
            transport = self.info.transport_type.as_str(),
            client_device_id = %self.info.client_device_id,
            client_session_id = %self.info.client_session_id,
            key = %self.security.fingerprint(),
            "SessionActor started"
        );
    }

    /// Run `f`. A panic inside it, or a delegate call it made that
    /// panicked, tears the session down with `Unknown`.
    fn contain(&mut self, what: &'static str, f: impl FnOnce(&mut Self)) {
        if !self.isolate(what, f) {
            self.faulted
                .get_or_insert_with(|| ReceiverError::Unknown(format!("panic while handling {what}")));
        }
        if let Some(reason) = self.faulted.take() {
            self.metrics.record_panic(ActorType::Session);
            self.tear_down(Some(reason));
        }
    }

    /// Run `f`, containing a panic to a log line. Returns whether `f`
    /// completed.
    fn isolate(&mut self, what: &'static str, f: impl FnOnce(&mut Self)) -> bool {
        let completed = std::panic::catch_unwind(AssertUnwindSafe(|| f(&mut *self))).is_ok();
        if !completed {
            error!(
                target: "ar.actor.session",
                session_id = %self.info.id,
                during = what,
                state = %self.state,
                "Panic contained"
            );
        }
        completed
    }

    /// Call the delegate for a result. A panic becomes `Unknown` for the
    /// caller and marks the session faulted.
    fn delegate_call<R>(
        &mut self,
        what: &str,
        f: impl FnOnce(&dyn SessionDelegate) -> ReceiverResult<R>,
    ) -> ReceiverResult<R> {
        let delegate = Arc::clone(&self.delegate);
        match std::panic::catch_unwind(AssertUnwindSafe(|| f(delegate.as_ref()))) {
            Ok(result) => result,
            Err(_) => {
                error!(
                    target: "ar.actor.session",
                    session_id = %self.info.id,
                    call = what,
                    "Delegate panicked"
                );
                let err = ReceiverError::Unknown(format!("delegate panicked in '{what}'"));
                self.faulted.get_or_insert_with(|| err.clone());
                Err(err)
            }
        }
    }

    /// Answer a message that arrived after the loop stopped.
    fn reject(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Dispatch { request, reply } => {
                let result = if request.name() == commands::TEAR_DOWN_STREAMS {
                    Ok(done(true))
                } else {
                    Err(ReceiverError::NotReady("session terminated".to_string()))
                };
                self.respond(reply, result);
            }
            SessionMessage::ControllerReply { .. } => self.metrics.record_late_reply(),
            SessionMessage::TransportFailed { .. } => {}
            SessionMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
        }
    }

    fn respond(&self, reply: Reply, result: ReceiverResult<Value>) {
        reply.deliver(result, &self.lane);
    }

    fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Dispatch { request, reply } => self.handle_dispatch(request, reply),

            SessionMessage::ControllerReply {
                transaction,
                response,
            } => self.handle_controller_reply(transaction, response),

            SessionMessage::TransportFailed { error } => {
                warn!(
                    target: "ar.actor.session",
                    session_id = %self.info.id,
                    error = %error,
                    "Transport failed"
                );
                self.tear_down(Some(error));
            }

            SessionMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
        }
    }

    fn handle_notice(&mut self, notice: SessionNotice) {
        match notice {
            SessionNotice::Job(job) => run_completion(self.info.id, job),

            SessionNotice::AudioClaimDecided { result } => self.audio_claim_decided(result),

            SessionNotice::ArbitrationDecided {
                change,
                outcome,
                reply,
            } => {
                if let Ok(outcome) = &outcome {
                    self.mirror_claim(&change, *outcome);
                }
                self.respond(reply, outcome.map(|o| o.to_value()));
            }

            SessionNotice::Revoked {
                revocation,
                grace,
                ack,
            } => {
                self.revoked(&revocation, grace);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }

            SessionNotice::TearDown { reason, ack } => {
                self.tear_down(Some(reason));
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    }

    /// Handle `request` for a caller already on this queue. A request whose
    /// answer only arrives through another queue cannot be waited for here
    /// and is refused.
    fn dispatch_inline(&mut self, request: Request) -> ReceiverResult<Value> {
        if let Some(why) = self.answers_later(&request) {
            return Err(ReceiverError::NotReady(format!(
                "'{}' {why}; issue it with a completion",
                request.name()
            )));
        }
        let (tx, mut rx) = oneshot::channel();
        self.contain("inline request", |actor| {
            actor.handle_dispatch(request, Reply::Direct(tx));
        });
        rx.try_recv().unwrap_or(Err(ReceiverError::Cancelled))
    }

    fn answers_later(&self, request: &Request) -> Option<&'static str> {
        if self.audio_claim == AudioClaim::Pending {
            return Some("would queue behind the audio claim");
        }
        let RequestKind::Control { command, params } = &request.kind else {
            return None;
        };
        match command.as_str() {
            commands::CHANGE_RESOURCE_MODE => Some("is decided by the server"),
            c if is_outbound(c) => Some("waits for the controller"),
            commands::SET_UP_STREAMS if self.audio_claim == AudioClaim::None => parse_stream_setups(params)
                .ok()?
                .iter()
                .any(|s| s.stream_type.is_audio())
                .then_some("waits for the server's audio claim"),
            _ => None,
        }
    }

    fn handle_dispatch(&mut self, request: Request, reply: Reply) {
        if self.audio_claim == AudioClaim::Pending {
            debug!(
                target: "ar.actor.session",
                session_id = %self.info.id,
                request = request.name(),
                "Deferring request until the audio claim is answered"
            );
            self.deferred.push_back((request, reply));
            return;
        }

        let Request {
            kind,
            qualifier,
            issued_at,
        } = request;
        let qualifier = qualifier.as_deref();

        match kind {
            RequestKind::Control { command, params } => {
                self.handle_control(&command, qualifier, params, issued_at, reply);
            }
            RequestKind::GetProperty { name } => {
                let result = self.get_property(&name, qualifier);
                self.respond(reply, result);
            }
            RequestKind::SetProperty { name, value } => {
                let result = self
                    .set_property(&name, qualifier, &value)
                    .map(|()| Value::Dict(Dict::new()));
                self.respond(reply, result);
            }
            RequestKind::Event { name, params } => {
                self.handle_event(&name, &params);
                self.respond(reply, Ok(Value::Dict(Dict::new())));
            }
        }
    }

    fn handle_control(
        &mut self,
        command: &str,
        qualifier: Option<&str>,
        params: Dict,
        issued_at: Instant,
        reply: Reply,
    ) {
        if self.state.is_ending() && command != commands::TEAR_DOWN_STREAMS {
            let err = ReceiverError::NotReady(format!("'{command}' while {}", self.state));
            self.respond(reply, Err(err));
            return;
        }

        match command {
            commands::SET_UP_STREAMS => self.handle_setup(params, reply),
            commands::TEAR_DOWN_STREAMS => {
                let result = self.handle_teardown_request(&params);
                self.respond(reply, result);
            }
            commands::RECORD => {
                let result = self.record();
                self.respond(reply, result);
            }
            commands::START => {
                let result = self.start(params);
                self.respond(reply, result);
            }
            commands::FLUSH_AUDIO => {
                let result = self.flush_audio(&params);
                self.respond(reply, result);
            }
            commands::CHANGE_RESOURCE_MODE => self.change_resource_mode(&params, issued_at, reply),
            c if is_outbound(c) => self.send_outbound(command, params, reply),
            _ => {
                let result = self
                    .delegate_call(command, |d| d.control(command, qualifier, &params))
                    .map(Value::Dict);
                self.respond(reply, result);
            }
        }
    }

    // ------------------------------------------------------------------
    // Setup and teardown
    // ------------------------------------------------------------------

    fn handle_setup(&mut self, params: Dict, reply: Reply) {
        let entries = match parse_stream_setups(&params) {
            Ok(entries) => entries,
            Err(e) => {
                self.respond(reply, Err(e));
                return;
            }
        };

        if entries.is_empty() {
            self.announce(params);
            self.respond(reply, Ok(Value::Dict(Dict::new())));
            return;
        }

        let needs_claim = self.audio_claim == AudioClaim::None
            && entries.iter().any(|s| s.stream_type.is_audio());
        if needs_claim {
            match self.server.post(ServerNotice::ClaimAudio {
                session: self.info.id,
            }) {
                Ok(()) => {
                    self.audio_claim = AudioClaim::Pending;
                    self.awaiting_claim = Some((entries, reply));
                }
                Err(e) => self.respond(reply, Err(e)),
            }
            return;
        }

        let result = self.set_up(entries);
        self.respond(reply, result);
    }

    fn announce(&mut self, offer: Dict) {
        if self.state == SessionState::Authenticated {
            self.state = SessionState::Announced;
            self.timing.announced_at = Some(Instant::now());
            info!(
                target: "ar.actor.session",
                session_id = %self.info.id,
                "Session announced"
            );
        }
        if !offer.is_empty() {
            self.offer = offer;
        }
    }

    fn audio_claim_decided(&mut self, result: ReceiverResult<()>) {
        let Some((entries, reply)) = self.awaiting_claim.take() else {
            debug!(
                target: "ar.actor.session",
                session_id = %self.info.id,
                "Audio claim answered with nothing waiting"
            );
            return;
        };

        match result {
            Ok(()) => {
                self.audio_claim = AudioClaim::Held;
                let result = self.set_up(entries);
                self.respond(reply, result);
            }
            Err(e) => {
                self.audio_claim = AudioClaim::None;
                info!(
                    target: "ar.actor.session",
                    session_id = %self.info.id,
                    error = %e,
                    "Audio setup refused"
                );
                self.respond(reply, Err(e));
            }
        }

        while self.audio_claim != AudioClaim::Pending {
            let Some((request, reply)) = self.deferred.pop_front() else {
                break;
            };
            self.handle_dispatch(request, reply);
        }
    }

    fn set_up(&mut self, entries: Vec<StreamSetup>) -> ReceiverResult<Value> {
        if self.state == SessionState::Authenticated {
            self.announce(Dict::new());
        }

        let mut created = Vec::new();
        let mut response = Vec::with_capacity(entries.len());
        for setup in &entries {
            let existed = self.streams.contains_key(&setup.stream_type);
            match self.set_up_stream(setup) {
                Ok(entry) => {
                    if !existed {
                        created.push(setup.stream_type);
                    }
                    response.push(Value::Dict(entry));
                }
                Err(e) => {
                    for stream_type in created {
                        self.remove_stream(stream_type);
                    }
                    self.release_audio_if_unused();
                    return Err(e);
                }
            }
        }

        let now = Instant::now();
        if entries.iter().any(|s| s.stream_type.is_audio()) {
            self.timing.audio_setup_at.get_or_insert(now);
        }
        if entries.iter().any(|s| !s.stream_type.is_audio()) {
            self.timing.screen_setup_at.get_or_insert(now);
        }
        if self.state < SessionState::StreamsConfigured {
            self.state = SessionState::StreamsConfigured;
        }

        info!(
            target: "ar.actor.session",
            session_id = %self.info.id,
            streams = ?entries.iter().map(|s| s.stream_type).collect::<Vec<_>>(),
            state = %self.state,
            "Streams configured"
        );

        Ok(Value::Dict(Dict::from([(
            keys::STREAMS.to_string(),
            Value::Array(response),
        )])))
    }

    fn set_up_stream(&mut self, setup: &StreamSetup) -> ReceiverResult<Dict> {
        let mut entry = self.delegate_call("setupStream", |d| d.setup_stream(setup))?;

        if setup.stream_type.is_audio() {
            let format = AudioFormat {
                sample_rate: setup
                    .params
                    .int_field(keys::SAMPLE_RATE)
                    .map(u32::try_from)
                    .transpose()
                    .map_err(|_| ReceiverError::InvalidParameter("sampleRate out of range".to_string()))?
                    .unwrap_or(DEFAULT_SAMPLE_RATE),
                bytes_per_frame: setup
                    .params
                    .int_field(keys::BYTES_PER_FRAME)
                    .map(usize::try_from)
                    .transpose()
                    .map_err(|_| ReceiverError::InvalidParameter("bytesPerFrame out of range".to_string()))?
                    .unwrap_or(DEFAULT_BYTES_PER_FRAME),
            };
            let ring = AudioRing::new(
                setup.stream_type,
                format,
                self.config.audio_ring_frames,
                Arc::clone(&self.clock),
            )?;
            self.audio.insert(ring);
        }

        self.streams.insert(setup.stream_type, setup.params.clone());
        entry.insert(keys::TYPE.to_string(), setup.stream_type.into());
        Ok(entry)
    }

    fn remove_stream(&mut self, stream_type: StreamType) {
        if self.streams.remove(&stream_type).is_some() {
            self.audio.remove(stream_type);
            self.delegate.teardown_stream(stream_type);
        }
    }

    fn release_audio_if_unused(&mut self) {
        if self.audio_claim == AudioClaim::Held && !self.streams.keys().any(|t| t.is_audio()) {
            self.audio_claim = AudioClaim::None;
            if self
                .server
                .post(ServerNotice::ReleaseAudio {
                    session: self.info.id,
                })
                .is_err()
            {
                debug!(target: "ar.actor.session", session_id = %self.info.id, "Server gone, audio release dropped");
            }
        }
    }

    fn handle_teardown_request(&mut self, params: &Dict) -> ReceiverResult<Value> {
        if self.state.is_ending() {
            return Ok(done(true));
        }

        let streams = parse_stream_types(params)?;
        if !streams.is_empty() {
            for stream_type in &streams {
                self.remove_stream(*stream_type);
            }
            self.release_audio_if_unused();
            info!(
                target: "ar.actor.session",
                session_id = %self.info.id,
                streams = ?streams,
                "Streams torn down"
            );
            return Ok(done(false));
        }

        if let Some(reason) = params.str_field(keys::REASON) {
            info!(target: "ar.actor.session", session_id = %self.info.id, reason, "Teardown requested");
        }
        self.tear_down(None);
        Ok(done(true))
    }

    /// Run teardown to `Terminated`. `reason` is `None` for a requested
    /// teardown. A second call is a no-op.
    fn tear_down(&mut self, reason: Option<ReceiverError>) {
        if self.state.is_ending() {
            return;
        }
        let previous = self.state;
        self.state = SessionState::TearingDown;

        match &reason {
            Some(error) => warn!(
                target: "ar.actor.session",
                session_id = %self.info.id,
                previous_state = %previous,
                reason = %error,
                "Session tearing down"
            ),
            None => info!(
                target: "ar.actor.session",
                session_id = %self.info.id,
                previous_state = %previous,
                "Session tearing down"
            ),
        }

        let pending = self.pending.drain();
        let cancelled = pending.len();
        for (_, command) in pending {
            self.respond(command.reply, Err(ReceiverError::Cancelled));
        }
        if let Some((_, reply)) = self.awaiting_claim.take() {
            self.respond(reply, Err(ReceiverError::Cancelled));
        }
        for (_, reply) in std::mem::take(&mut self.deferred) {
            self.respond(reply, Err(ReceiverError::Cancelled));
        }

        let streams: Vec<StreamType> = self.streams.keys().copied().collect();
        for stream_type in streams {
            self.isolate("teardownStream", |actor| actor.remove_stream(stream_type));
        }
        self.audio.clear();
        self.audio_claim = AudioClaim::None;
        self.claims.clear();

        if !self.finalized {
            self.finalized = true;
            self.isolate("finalize", |actor| actor.delegate.finalize(&actor.info));
        }
        self.state = SessionState::Terminated;

        prom::record_session_teardown(reason.as_ref().map_or("requested", ReceiverError::label));
        info!(
            target: "ar.actor.session",
            session_id = %self.info.id,
            cancelled_commands = cancelled,
            "Session terminated"
        );

        if self
            .server
            .post(ServerNotice::SessionEnded {
                session: self.info.id,
                reason,
            })
            .is_err()
        {
            debug!(target: "ar.actor.session", session_id = %self.info.id, "Server gone, end of session not reported");
        }
    }

    // ------------------------------------------------------------------
    // Record, start, flush
    // ------------------------------------------------------------------

    fn record(&mut self) -> ReceiverResult<Value> {
        match self.state {
            SessionState::StreamsConfigured => {
                self.state = SessionState::Recording;
                self.timing.recorded_at = Some(Instant::now());
                info!(target: "ar.actor.session", session_id = %self.info.id, "Session recording");
                Ok(Value::Dict(Dict::new()))
            }
            SessionState::Recording => Ok(Value::Dict(Dict::new())),
            other => Err(ReceiverError::NotReady(format!("record while {other}"))),
        }
    }

    fn start(&mut self, params: Dict) -> ReceiverResult<Value> {
        if self.state != SessionState::Recording {
            return Err(ReceiverError::NotReady(format!("start while {}", self.state)));
        }
        self.state = SessionState::Active;
        let now = Instant::now();
        self.timing.started_at = Some(now);
        self.start_params = params;
        self.delegate.started(&self.info);

        prom::record_session_start(now.duration_since(self.timing.accepted_at));
        info!(
            target: "ar.actor.session",
            session_id = %self.info.id,
            bonjour_ms = self.timing.phase("bonjourMs"),
            auth_ms = self.timing.phase("authMs"),
            announce_ms = self.timing.phase("announceMs"),
            setup_audio_ms = self.timing.phase("setupAudioMs"),
            setup_screen_ms = self.timing.phase("setupScreenMs"),
            record_ms = self.timing.phase("recordMs"),
            total_ms = self.timing.phase("totalMs"),
            "Session active"
        );
        Ok(Value::Dict(Dict::new()))
    }

    fn flush_audio(&mut self, params: &Dict) -> ReceiverResult<Value> {
        if self.state < SessionState::StreamsConfigured {
            return Err(ReceiverError::NotReady(format!("flushAudio while {}", self.state)));
        }
        let until_timestamp = u32::try_from(params.require_int(keys::UNTIL_TIMESTAMP)?)
            .map_err(|_| ReceiverError::InvalidParameter("untilTimestamp out of range".to_string()))?;
        let until_sequence = params
            .int_field(keys::UNTIL_SEQUENCE)
            .map(u32::try_from)
            .transpose()
            .map_err(|_| ReceiverError::InvalidParameter("untilSequence out of range".to_string()))?;

        let last = self.audio.flush(until_timestamp, until_sequence);
        Ok(Value::Dict(Dict::from([(
            keys::LAST_TIMESTAMP.to_string(),
            Value::from(last),
        )])))
    }

    // ------------------------------------------------------------------
    // Resources and controller commands
    // ------------------------------------------------------------------

    fn change_resource_mode(&mut self, params: &Dict, issued_at: Instant, reply: Reply) {
        if self.state != SessionState::Active {
            let err = ReceiverError::NotReady(format!("changeResourceMode while {}", self.state));
            self.respond(reply, Err(err));
            return;
        }
        let change = match ResourceChange::from_params(params) {
            Ok(change) => change,
            Err(e) => {
                self.respond(reply, Err(e));
                return;
            }
        };

        let notice = ServerNotice::ChangeResource {
            session: self.info.id,
            change,
            issued_at,
            reply,
        };
        if let Err(ServerNotice::ChangeResource { reply, .. }) = self.server.try_post(notice) {
            self.respond(reply, Err(ReceiverError::Cancelled));
        }
    }

    fn mirror_claim(&mut self, change: &ResourceChange, outcome: ResourceOutcome) {
        let key = match change.transfer {
            TransferType::Take | TransferType::Untake => (change.resource, ClaimKind::Take),
            TransferType::Borrow | TransferType::Unborrow => (change.resource, ClaimKind::Borrow),
        };
        match (change.transfer, outcome) {
            (TransferType::Take | TransferType::Borrow, ResourceOutcome::Granted) => {
                self.claims.insert(key, change.priority);
            }
            (
                TransferType::Untake | TransferType::Unborrow,
                ResourceOutcome::Released | ResourceOutcome::NotHeld,
            ) => {
                self.claims.remove(&key);
            }
            _ => {}
        }
    }

    fn revoked(&mut self, revocation: &Revocation, grace: Duration) {
        self.claims
            .remove(&(revocation.resource, revocation.claim.kind));
        if self.state.is_ending() {
            return;
        }

        info!(
            target: "ar.actor.session",
            session_id = %self.info.id,
            resource = %revocation.resource,
            kind = ?revocation.claim.kind,
            reason = revocation.reason.as_deref().unwrap_or(""),
            "Resource revoked"
        );
        self.delegate.resource_revoked(revocation, grace);

        let released = match revocation.claim.kind {
            ClaimKind::Take => TransferType::Untake,
            ClaimKind::Borrow => TransferType::Unborrow,
        };
        let mut params = Dict::from([
            (
                keys::RESOURCES.to_string(),
                Value::Array(vec![Value::Dict(Dict::from([
                    (keys::RESOURCE_ID.to_string(), revocation.resource.into()),
                    (keys::TRANSFER_TYPE.to_string(), released.into()),
                ]))]),
            ),
            (
                keys::GRACE_MS.to_string(),
                Value::Integer(i64::try_from(grace.as_millis()).unwrap_or(i64::MAX)),
            ),
        ]);
        if let Some(reason) = &revocation.reason {
            params.insert(keys::REASON.to_string(), Value::from(reason.as_str()));
        }
        if let Err(e) = self.link.send_event(commands::CHANGE_MODES, params) {
            self.tear_down(Some(e));
        }
    }

    fn send_outbound(&mut self, command: &str, mut params: Dict, reply: Reply) {
        if self.state != SessionState::Active {
            let err = ReceiverError::NotReady(format!("'{command}' while {}", self.state));
            self.respond(reply, Err(err));
            return;
        }

        let timeout = params
            .shift_remove(keys::TIMEOUT_MS)
            .and_then(|v| v.as_i64())
            .and_then(|ms| u64::try_from(ms).ok())
            .map_or(self.config.command_timeout, Duration::from_millis);
        let transaction = self
            .pending
            .insert(command, reply, Instant::now() + timeout);

        debug!(
            target: "ar.actor.session",
            session_id = %self.info.id,
            command,
            transaction,
            timeout_ms = timeout.as_millis(),
            "Sending controller command"
        );

        let outbound = OutboundCommand {
            transaction,
            command: command.to_string(),
            params,
        };
        if let Err(e) = self.link.send_command(outbound) {
            if let Some(pending) = self.pending.take(transaction) {
                self.respond(pending.reply, Err(e.clone()));
            }
            self.tear_down(Some(e));
        }
    }

    fn handle_controller_reply(&mut self, transaction: u64, response: Dict) {
        let Some(pending) = self.pending.take(transaction) else {
            self.metrics.record_late_reply();
            debug!(
                target: "ar.actor.session",
                session_id = %self.info.id,
                transaction,
                "Late controller reply discarded"
            );
            return;
        };

        let status = response.int_field(keys::STATUS).unwrap_or(STATUS_OK);
        let result = ReceiverError::from_status(status, &pending.command).map(|()| Value::Dict(response));
        self.respond(pending.reply, result);
    }

    fn expire_pending(&mut self) {
        for (transaction, pending) in self.pending.take_expired(Instant::now()) {
            self.metrics.record_command_timeout(&pending.command);
            warn!(
                target: "ar.actor.session",
                session_id = %self.info.id,
                command = %pending.command,
                transaction,
                "Controller command timed out"
            );
            let err = ReceiverError::Timeout(format!("{} (transaction {transaction})", pending.command));
            self.respond(pending.reply, Err(err));
        }
    }

    // ------------------------------------------------------------------
    // Events and properties
    // ------------------------------------------------------------------

    fn handle_event(&mut self, name: &str, params: &Dict) {
        if self.state.is_ending() {
            debug!(target: "ar.actor.session", session_id = %self.info.id, event = name, "Event after teardown ignored");
            return;
        }

        match name {
            commands::MODES_CHANGED => {
                if let Err(e) = self.modes.apply(params) {
                    warn!(target: "ar.actor.session", session_id = %self.info.id, error = %e, "Malformed modesChanged");
                    return;
                }
                self.delegate.modes_changed(&self.modes);
                let notice = ServerNotice::ModesChanged {
                    session: self.info.id,
                    modes: self.modes.clone(),
                };
                if self.server.post(notice).is_err() {
                    debug!(target: "ar.actor.session", session_id = %self.info.id, "Server gone, modes not forwarded");
                }
            }
            commands::DUCK_AUDIO => {
                let volume = params.float_field(keys::VOLUME).unwrap_or(0.0);
                self.delegate.duck_audio(duration_field(params), volume);
            }
            commands::UNDUCK_AUDIO => self.delegate.unduck_audio(duration_field(params)),
            commands::REQUEST_UI => self.delegate.request_ui(params.str_field(keys::URL)),
            other => debug!(
                target: "ar.actor.session",
                session_id = %self.info.id,
                event = other,
                "Unhandled event"
            ),
        }
    }

    fn get_property(&mut self, name: &str, qualifier: Option<&str>) -> ReceiverResult<Value> {
        match name {
            properties::MODES => Ok(Value::Dict(self.modes.to_dict())),
            properties::TRANSPORT_TYPE => Ok(Value::from(self.info.transport_type.as_str())),
            properties::TIMESTAMP_INFO => Ok(Value::Dict(self.timing.to_dict())),
            _ => self.delegate_call(name, |d| d.copy_property(name, qualifier)),
        }
    }

    fn set_property(&mut self, name: &str, qualifier: Option<&str>, value: &Value) -> ReceiverResult<()> {
        match name {
            properties::MODES | properties::TRANSPORT_TYPE | properties::TIMESTAMP_INFO => Err(
                ReceiverError::InvalidParameter(format!("'{name}' is read-only")),
            ),
            _ => self.delegate_call(name, |d| d.set_property(name, qualifier, value)),
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.info.id,
            state: self.state,
            streams: self.streams.keys().copied().collect(),
            claims: self.claims.keys().copied().collect(),
            modes: self.modes.clone(),
            pending_commands: self.pending.len(),
            deferred_requests: self.deferred.len() + usize::from(self.awaiting_claim.is_some()),
            mailbox_depth: self.mailbox.current_depth(),
        }
    }
}

/// The session's task: owns its inputs and feeds them to the actor in
/// arrival order.
struct SessionLoop {
    id: SessionId,
    peer: SocketAddr,
    actor: Arc<Mutex<SessionActor>>,
    receiver: mpsc::Receiver<SessionMessage>,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    metrics: Arc<ActorMetrics>,
}

impl SessionLoop {
    #[instrument(skip_all, name = "ar.actor.session", fields(session_id = %self.id, peer = %self.peer))]
    async fn run(mut self) {
        self.actor.lock().await.log_started();

        loop {
            let deadline = self.actor.lock().await.pending.next_deadline();

            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    self.actor
                        .lock()
                        .await
                        .contain("cancellation", |actor| actor.tear_down(Some(ReceiverError::Cancelled)));
                    break;
                }

                Some(notice) = self.notices.recv() => {
                    self.handle_notice(notice).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.actor
                                .lock()
                                .await
                                .contain("message", |actor| actor.handle_message(message));
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            self.actor
                                .lock()
                                .await
                                .contain("mailbox close", |actor| actor.tear_down(Some(ReceiverError::Cancelled)));
                            break;
                        }
                    }
                }

                () = sleep_until_deadline(deadline) => {
                    self.actor
                        .lock()
                        .await
                        .contain("command deadline", SessionActor::expire_pending);
                }
            }
        }

        self.drain().await;

        let state = self.actor.lock().await.state;
        info!(
            target: "ar.actor.session",
            session_id = %self.id,
            state = %state,
            messages_processed = self.mailbox.messages_processed(),
            "SessionActor stopped"
        );
    }

    async fn handle_notice(&self, notice: SessionNotice) {
        match notice {
            // Runs with the actor unlocked so it can call back in
            SessionNotice::Job(job) => run_completion(self.id, job),
            notice => self
                .actor
                .lock()
                .await
                .contain("notice", |actor| actor.handle_notice(notice)),
        }
    }

    /// Answer whatever is still queued so nothing waits forever.
    async fn drain(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            self.mailbox.record_rejected();
            self.actor
                .lock()
                .await
                .contain("rejected message", |actor| actor.reject(message));
        }

        self.notices.close();
        while let Ok(notice) = self.notices.try_recv() {
            self.handle_notice(notice).await;
        }
    }
}

fn run_completion(session: SessionId, job: Job) {
    if let Err(e) = run_job(job) {
        warn!(target: "ar.actor.session", session_id = %session, error = %e, "Completion failed");
    }
}

fn is_outbound(command: &str) -> bool {
    matches!(
        command,
        commands::CHANGE_MODES
            | commands::REQUEST_UI
            | commands::SET_NIGHT_MODE
            | commands::SET_LIMITED_UI
            | commands::SEND_MESSAGE
            | commands::UPDATE_VEHICLE_INFORMATION
            | commands::FORCE_KEY_FRAME
            | commands::REQUEST_SIRI
    )
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn done(done: bool) -> Value {
    Value::Dict(Dict::from([(keys::DONE.to_string(), Value::from(done))]))
}

fn duration_field(params: &Dict) -> Duration {
    params
        .int_field(keys::DURATION_MS)
        .and_then(|ms| u64::try_from(ms).ok())
        .map_or(Duration::ZERO, Duration::from_millis)
}

fn parse_stream_setups(params: &Dict) -> ReceiverResult<Vec<StreamSetup>> {
    params
        .array_field(keys::STREAMS)
        .unwrap_or_default()
        .iter()
        .map(|item| {
            let entry = item.as_dict().ok_or_else(|| {
                ReceiverError::InvalidParameter("streams entries must be mappings".to_string())
            })?;
            Ok(StreamSetup {
                stream_type: StreamType::from_i64(entry.require_int(keys::TYPE)?)?,
                params: entry.clone(),
            })
        })
        .collect()
}

/// Stream types named by a teardown; entries are mappings with `type` or
/// bare integers.
fn parse_stream_types(params: &Dict) -> ReceiverResult<Vec<StreamType>> {
    params
        .array_field(keys::STREAMS)
        .unwrap_or_default()
        .iter()
        .map(|item| {
            let raw = match item {
                Value::Dict(entry) => entry.require_int(keys::TYPE)?,
                other => other.as_i64().ok_or_else(|| {
                    ReceiverError::InvalidParameter("streams entries must name a type".to_string())
                })?,
            };
            StreamType::from_i64(raw)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::queue::current_queue;
    use crate::arbiter::{Claim, Holder};
    use crate::platform::TransportType;
    use crate::protocol::Constraint;
    use common::types::{ClientSessionId, DeviceId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        /// Command or callback that panics.
        panic_on: Option<&'static str>,
    }

    impl Recorder {
        fn panicking_on(name: &'static str) -> Self {
            Self {
                panic_on: Some(name),
                ..Self::default()
            }
        }

        fn count(&self, name: &str) -> usize {
            self.calls.lock().iter().filter(|c| *c == name).count()
        }

        #[allow(clippy::panic)]
        fn maybe_panic(&self, name: &str) {
            if self.panic_on == Some(name) {
                panic!("delegate failure in {name}");
            }
        }
    }

    impl SessionDelegate for Recorder {
        fn control(&self, command: &str, _qualifier: Option<&str>, _params: &Dict) -> ReceiverResult<Dict> {
            self.maybe_panic(command);
            self.calls.lock().push(command.to_string());
            Ok(Dict::new())
        }

        fn duck_audio(&self, _duration: Duration, _volume: f64) {
            self.maybe_panic(commands::DUCK_AUDIO);
            self.calls.lock().push("duck_audio".to_string());
        }

        fn finalize(&self, _info: &SessionInfo) {
            self.calls.lock().push("finalize".to_string());
        }

        fn started(&self, _info: &SessionInfo) {
            self.calls.lock().push("started".to_string());
        }

        fn teardown_stream(&self, _stream_type: StreamType) {
            self.calls.lock().push("teardown_stream".to_string());
        }

        fn resource_revoked(&self, _revocation: &Revocation, _grace: Duration) {
            self.calls.lock().push("resource_revoked".to_string());
        }
    }

    #[derive(Default)]
    struct Link {
        commands: Mutex<Vec<OutboundCommand>>,
        events: Mutex<Vec<(String, Dict)>>,
    }

    impl ControllerLink for Link {
        fn send_command(&self, command: OutboundCommand) -> ReceiverResult<()> {
            self.commands.lock().push(command);
            Ok(())
        }

        fn send_event(&self, name: &str, params: Dict) -> ReceiverResult<()> {
            self.events.lock().push((name.to_string(), params));
            Ok(())
        }
    }

    struct Clock;

    impl ClockSync for Clock {
        fn synchronized_time(&self) -> u64 {
            0
        }

        fn synchronized_time_near_local_tick(&self, tick: u64) -> u64 {
            tick
        }

        fn local_tick_near_synchronized_time(&self, time: u64) -> u64 {
            time
        }
    }

    struct Fixture {
        handle: SessionHandle,
        task: JoinHandle<()>,
        delegate: Arc<Recorder>,
        link: Arc<Link>,
        server: mpsc::UnboundedReceiver<ServerNotice>,
    }

    fn spawn_session() -> Fixture {
        spawn_session_with(Recorder::default())
    }

    fn spawn_session_with(recorder: Recorder) -> Fixture {
        let delegate = Arc::new(recorder);
        let link = Arc::new(Link::default());
        let (server_lane, server) = Lane::new(QueueId::next(), ServerNotice::Job);
        let now = Instant::now();
        let info = SessionInfo {
            id: SessionId::new(),
            peer: "192.0.2.10:7000".parse().unwrap(),
            transport_type: TransportType::WiFi,
            client_device_id: DeviceId::from_u64(0xAABB),
            client_session_id: ClientSessionId(7),
        };
        let parts = SessionParts {
            info,
            security: SecurityContext::Pairing(1),
            delegate: Arc::clone(&delegate) as Arc<dyn SessionDelegate>,
            link: Arc::clone(&link) as Arc<dyn ControllerLink>,
            clock: Arc::new(Clock),
            server: server_lane,
            config: SessionConfig {
                command_timeout: Duration::from_secs(2),
                audio_ring_frames: 64,
                mailbox: 16,
            },
            timing: PhaseTiming::new(None, now, now),
            metrics: ActorMetrics::new(),
        };
        let (handle, task) = SessionActor::spawn(parts, CancellationToken::new());
        Fixture {
            handle,
            task,
            delegate,
            link,
            server,
        }
    }

    fn screen_setup() -> Dict {
        Dict::from([(
            keys::STREAMS.to_string(),
            Value::Array(vec![Value::Dict(Dict::from([(
                keys::TYPE.to_string(),
                StreamType::Screen.into(),
            )]))]),
        )])
    }

    fn audio_setup() -> Dict {
        Dict::from([(
            keys::STREAMS.to_string(),
            Value::Array(vec![Value::Dict(Dict::from([
                (keys::TYPE.to_string(), StreamType::MainAudio.into()),
                (keys::BYTES_PER_FRAME.to_string(), Value::from(2_i64)),
            ]))]),
        )])
    }

    async fn activate(handle: &SessionHandle) {
        handle.set_up_streams(Dict::new()).await.unwrap();
        handle.set_up_streams(screen_setup()).await.unwrap();
        handle.record().await.unwrap();
        handle.start(Dict::new()).await.unwrap();
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn shut(fixture: Fixture) {
        fixture.handle.cancel();
        fixture.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_reaches_active() {
        let fixture = spawn_session();
        let handle = &fixture.handle;

        handle.set_up_streams(Dict::new()).await.unwrap();
        assert_eq!(handle.status().await.unwrap().state, SessionState::Announced);

        let response = handle.set_up_streams(screen_setup()).await.unwrap();
        assert_eq!(response.array_field(keys::STREAMS).unwrap().len(), 1);
        assert_eq!(
            handle.status().await.unwrap().state,
            SessionState::StreamsConfigured
        );

        handle.record().await.unwrap();
        // Recording again is a no-op
        handle.record().await.unwrap();
        handle.start(Dict::new()).await.unwrap();

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, SessionState::Active);
        assert_eq!(status.streams, vec![StreamType::Screen]);
        assert_eq!(fixture.delegate.count("started"), 1);

        let timing = handle
            .get_property(properties::TIMESTAMP_INFO)
            .await
            .unwrap();
        assert!(timing.as_dict().unwrap().contains_key("totalMs"));

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_out_of_order_lifecycle_is_not_ready() {
        let fixture = spawn_session();
        let handle = &fixture.handle;

        assert!(matches!(handle.record().await, Err(ReceiverError::NotReady(_))));
        assert!(matches!(
            handle.start(Dict::new()).await,
            Err(ReceiverError::NotReady(_))
        ));
        assert!(matches!(
            handle.force_key_frame().await,
            Err(ReceiverError::NotReady(_))
        ));

        // First stream setup announces implicitly
        handle.set_up_streams(screen_setup()).await.unwrap();
        assert!(matches!(
            handle.start(Dict::new()).await,
            Err(ReceiverError::NotReady(_))
        ));

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_teardown_twice_finalizes_once() {
        let mut fixture = spawn_session();
        activate(&fixture.handle).await;

        assert!(fixture.handle.tear_down(&[], Some("user")).await.unwrap());
        assert!(fixture.handle.tear_down(&[], None).await.unwrap());

        assert_eq!(fixture.delegate.count("finalize"), 1);
        assert_eq!(
            fixture.handle.status().await.unwrap().state,
            SessionState::Terminated
        );
        assert!(matches!(
            fixture.server.recv().await,
            Some(ServerNotice::SessionEnded { reason: None, .. })
        ));

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_partial_teardown_keeps_session() {
        let fixture = spawn_session();
        activate(&fixture.handle).await;

        let done = fixture
            .handle
            .tear_down(&[StreamType::Screen], None)
            .await
            .unwrap();
        assert!(!done);

        let status = fixture.handle.status().await.unwrap();
        assert_eq!(status.state, SessionState::Active);
        assert!(status.streams.is_empty());
        assert_eq!(fixture.delegate.count("teardown_stream"), 1);
        assert_eq!(fixture.delegate.count("finalize"), 0);

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_requests_deferred_while_audio_claim_outstanding() {
        let mut fixture = spawn_session();
        let handle = fixture.handle.clone();

        let setup = tokio::spawn({
            let handle = handle.clone();
            async move { handle.set_up_streams(audio_setup()).await }
        });
        assert!(matches!(
            fixture.server.recv().await,
            Some(ServerNotice::ClaimAudio { .. })
        ));

        // Arrives while the claim is outstanding
        let (tx, rx) = oneshot::channel();
        handle
            .call_with_completion(
                Request::get_property(properties::TRANSPORT_TYPE),
                None,
                Some(Box::new(move |result: ReceiverResult<Value>| {
                    let _ = tx.send(result);
                })),
            )
            .await
            .unwrap();
        assert_eq!(handle.status().await.unwrap().deferred_requests, 2);

        assert!(handle
            .notify(SessionNotice::AudioClaimDecided { result: Ok(()) })
            .is_ok());

        let response = setup.await.unwrap().unwrap();
        assert_eq!(response.array_field(keys::STREAMS).unwrap().len(), 1);
        assert_eq!(rx.await.unwrap().unwrap(), Value::from("wifi"));
        assert_eq!(handle.audio().stream_types(), vec![StreamType::MainAudio]);

        // Dropping the only audio stream gives the claim back
        handle.tear_down(&[StreamType::MainAudio], None).await.unwrap();
        assert!(matches!(
            fixture.server.recv().await,
            Some(ServerNotice::ReleaseAudio { .. })
        ));

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_refused_audio_claim_reports_resource_denied() {
        let mut fixture = spawn_session();
        let handle = fixture.handle.clone();

        let setup = tokio::spawn({
            let handle = handle.clone();
            async move { handle.set_up_streams(audio_setup()).await }
        });
        assert!(matches!(
            fixture.server.recv().await,
            Some(ServerNotice::ClaimAudio { .. })
        ));
        assert!(handle
            .notify(SessionNotice::AudioClaimDecided {
                result: Err(ReceiverError::ResourceDenied("audio owned".to_string())),
            })
            .is_ok());

        assert!(matches!(
            setup.await.unwrap(),
            Err(ReceiverError::ResourceDenied(_))
        ));
        assert!(handle.audio().stream_types().is_empty());

        shut(fixture).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_command_times_out_and_late_reply_discarded() {
        let fixture = spawn_session();
        activate(&fixture.handle).await;

        let started = Instant::now();
        let result = fixture.handle.set_phone_call(true).await;
        assert!(matches!(result, Err(ReceiverError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_secs(2));

        let transaction = fixture.link.commands.lock().first().unwrap().transaction;
        fixture
            .handle
            .controller_reply(transaction, Dict::new())
            .await
            .unwrap();
        assert_eq!(fixture.handle.status().await.unwrap().pending_commands, 0);

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_controller_status_completes_command() {
        let fixture = spawn_session();
        activate(&fixture.handle).await;

        let handle = fixture.handle.clone();
        let call = tokio::spawn(async move { handle.set_night_mode(true).await });
        while fixture.link.commands.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let sent = fixture.link.commands.lock().first().cloned().unwrap();
        assert_eq!(sent.command, commands::SET_NIGHT_MODE);
        assert_eq!(sent.params.bool_field(keys::NIGHT_MODE), Some(true));

        let response = Dict::from([(
            keys::STATUS.to_string(),
            Value::from(crate::errors::STATUS_UNSUPPORTED),
        )]);
        fixture
            .handle
            .controller_reply(sent.transaction, response)
            .await
            .unwrap();
        assert!(matches!(
            call.await.unwrap(),
            Err(ReceiverError::UnsupportedCommand(_))
        ));

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_teardown_cancels_pending_commands() {
        let fixture = spawn_session();
        activate(&fixture.handle).await;

        let handle = fixture.handle.clone();
        let call = tokio::spawn(async move { handle.request_siri_action(1).await });
        while fixture.link.commands.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        fixture
            .handle
            .transport_failed(ReceiverError::AuthFailed("bad frame".to_string()))
            .await
            .unwrap();

        assert_eq!(call.await.unwrap(), Err(ReceiverError::Cancelled));
        let status = fixture.handle.status().await.unwrap();
        assert_eq!(status.state, SessionState::Terminated);
        assert_eq!(status.pending_commands, 0);

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_revocation_clears_mirror_and_notifies_controller() {
        let mut fixture = spawn_session();
        activate(&fixture.handle).await;

        let handle = fixture.handle.clone();
        let take = tokio::spawn(async move {
            handle
                .take_resource(ResourceId::MainScreen, TransferPriority(5))
                .await
        });
        let Some(ServerNotice::ChangeResource { change, reply, .. }) = fixture.server.recv().await
        else {
            unreachable!("expected a forwarded resource change");
        };
        assert!(fixture
            .handle
            .notify(SessionNotice::ArbitrationDecided {
                change: change.clone(),
                outcome: Ok(ResourceOutcome::Granted),
                reply,
            })
            .is_ok());
        assert_eq!(take.await.unwrap().unwrap(), ResourceOutcome::Granted);
        assert_eq!(
            fixture.handle.status().await.unwrap().claims,
            vec![(ResourceId::MainScreen, ClaimKind::Take)]
        );

        let (ack, acked) = oneshot::channel();
        let revocation = Revocation {
            resource: ResourceId::MainScreen,
            claim: Claim {
                holder: Holder::Session(fixture.handle.id()),
                kind: ClaimKind::Take,
                priority: TransferPriority(5),
                take_constraint: Constraint::NOT_APPLICABLE,
                borrow_constraint: Constraint::NOT_APPLICABLE,
                issued_at: Instant::now(),
                reason: None,
            },
            reason: Some("safety alert".to_string()),
        };
        assert!(fixture
            .handle
            .notify(SessionNotice::Revoked {
                revocation,
                grace: Duration::from_millis(500),
                ack: Some(ack),
            })
            .is_ok());
        acked.await.unwrap();

        assert!(fixture.handle.status().await.unwrap().claims.is_empty());
        assert_eq!(fixture.delegate.count("resource_revoked"), 1);
        let events = fixture.link.events.lock().clone();
        let (name, params) = events.first().unwrap();
        assert_eq!(name, commands::CHANGE_MODES);
        assert_eq!(params.int_field(keys::GRACE_MS), Some(500));
        assert_eq!(params.str_field(keys::REASON), Some("safety alert"));

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_direct_call_from_own_queue_runs_inline() {
        let fixture = spawn_session();
        activate(&fixture.handle).await;
        let handle = fixture.handle.clone();
        let (tx, rx) = oneshot::channel();

        // The completion runs on the session's own queue
        fixture
            .handle
            .call_with_completion(
                Request::get_property(properties::MODES),
                None,
                Some(Box::new(move |_: ReceiverResult<Value>| {
                    assert_eq!(current_queue(), Some(handle.queue_id()));
                    let transport = futures::executor::block_on(handle.get_property(properties::TRANSPORT_TYPE));
                    let read_only = futures::executor::block_on(handle.set_property(properties::MODES, Value::from(0_i64)));
                    // Its answer would come back through the queue we are on
                    let command = futures::executor::block_on(handle.force_key_frame());
                    let _ = tx.send((transport, read_only, command));
                })),
            )
            .await
            .unwrap();

        let (transport, read_only, command) = rx.await.unwrap();
        assert_eq!(transport.unwrap(), Value::from("wifi"));
        assert!(matches!(read_only, Err(ReceiverError::InvalidParameter(_))));
        assert!(matches!(command, Err(ReceiverError::NotReady(_))));
        assert!(fixture.link.commands.lock().is_empty());
        assert_eq!(fixture.handle.status().await.unwrap().state, SessionState::Active);

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_requests_from_one_caller_are_handled_in_order() {
        let fixture = spawn_session();
        fixture.handle.set_up_streams(Dict::new()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for (label, request) in [
            ("setUpStreams", requests::set_up_streams(screen_setup())),
            ("record", requests::record()),
            ("start", requests::start(Dict::new())),
        ] {
            let seen = Arc::clone(&seen);
            fixture
                .handle
                .call_with_completion(
                    request,
                    None,
                    Some(Box::new(move |result: ReceiverResult<Value>| {
                        seen.lock().push((label, result.is_ok()));
                    })),
                )
                .await
                .unwrap();
        }

        // Queued behind the three requests
        let status = fixture.handle.status().await.unwrap();
        assert_eq!(status.state, SessionState::Active);
        wait_for(|| seen.lock().len() == 3).await;
        assert_eq!(
            *seen.lock(),
            vec![("setUpStreams", true), ("record", true), ("start", true)]
        );

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_delegate_panic_tears_down_and_completes_pending() {
        let mut fixture = spawn_session_with(Recorder::panicking_on("vendorCommand"));
        activate(&fixture.handle).await;

        // An outstanding controller command with a completion
        let (tx, rx) = oneshot::channel();
        fixture
            .handle
            .call_with_completion(
                requests::set_night_mode(true),
                None,
                Some(Box::new(move |result: ReceiverResult<Value>| {
                    let _ = tx.send(result);
                })),
            )
            .await
            .unwrap();

        let result = fixture
            .handle
            .call_blocking(Request::control("vendorCommand", Dict::new()))
            .await;
        assert!(matches!(result, Err(ReceiverError::Unknown(_))));

        assert_eq!(rx.await.unwrap(), Err(ReceiverError::Cancelled));
        assert_eq!(fixture.delegate.count("finalize"), 1);
        assert_eq!(
            fixture.handle.status().await.unwrap().state,
            SessionState::Terminated
        );
        assert!(matches!(
            fixture.server.recv().await,
            Some(ServerNotice::SessionEnded {
                reason: Some(ReceiverError::Unknown(_)),
                ..
            })
        ));

        // The task itself survived
        fixture.handle.cancel();
        assert!(fixture.task.await.is_ok());
    }

    #[tokio::test]
    async fn test_panic_in_event_callback_is_contained() {
        let mut fixture = spawn_session_with(Recorder::panicking_on(commands::DUCK_AUDIO));
        activate(&fixture.handle).await;

        fixture
            .handle
            .send_event(commands::DUCK_AUDIO, Dict::new())
            .await
            .unwrap();

        assert!(matches!(
            fixture.server.recv().await,
            Some(ServerNotice::SessionEnded {
                reason: Some(ReceiverError::Unknown(_)),
                ..
            })
        ));
        assert_eq!(fixture.delegate.count("finalize"), 1);
        assert!(matches!(
            fixture.handle.record().await,
            Err(ReceiverError::NotReady(_))
        ));

        fixture.handle.cancel();
        assert!(fixture.task.await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_modes_changed_keeps_previous_modes() {
        let mut fixture = spawn_session();
        activate(&fixture.handle).await;

        let phone_call = Dict::from([(
            keys::APP_STATES.to_string(),
            Value::Array(vec![Value::Dict(Dict::from([
                (keys::APP_STATE_ID.to_string(), Value::from(2_i64)),
                (keys::ENTITY.to_string(), Value::from(1_i64)),
            ]))]),
        )]);
        fixture
            .handle
            .send_event(commands::MODES_CHANGED, phone_call)
            .await
            .unwrap();
        assert!(matches!(
            fixture.server.recv().await,
            Some(ServerNotice::ModesChanged { .. })
        ));

        // Valid screen entry followed by an unknown resource
        let malformed = Dict::from([(
            keys::RESOURCES.to_string(),
            Value::Array(vec![
                Value::Dict(Dict::from([
                    (keys::RESOURCE_ID.to_string(), Value::from(1_i64)),
                    (keys::ENTITY.to_string(), Value::from(2_i64)),
                ])),
                Value::Dict(Dict::from([
                    (keys::RESOURCE_ID.to_string(), Value::from(7_i64)),
                    (keys::ENTITY.to_string(), Value::from(1_i64)),
                ])),
            ]),
        )]);
        fixture
            .handle
            .send_event(commands::MODES_CHANGED, malformed)
            .await
            .unwrap();

        let modes = fixture.handle.status().await.unwrap().modes;
        assert_eq!(modes.phone_call, Some(crate::protocol::Entity::Controller));
        assert_eq!(modes.screen, None);
        assert!(fixture.server.try_recv().is_err());

        shut(fixture).await;
    }

    #[tokio::test]
    async fn test_mailbox_depth_counts_unhandled_messages() {
        let fixture = spawn_session();

        // The session task has not run yet: all three wait in the mailbox
        for _ in 0..3 {
            fixture
                .handle
                .send_event(commands::UNDUCK_AUDIO, Dict::new())
                .await
                .unwrap();
        }
        assert_eq!(fixture.handle.mailbox_depth(), 3);

        let status = fixture.handle.status().await.unwrap();
        // Only the status request itself was still counted
        assert_eq!(status.mailbox_depth, 1);
        assert_eq!(fixture.handle.mailbox_depth(), 0);

        shut(fixture).await;
    }

    #[test]
    fn test_with_timeout_sets_deadline_param() {
        let request = requests::with_timeout(requests::force_key_frame(), Duration::from_secs(2));
        let RequestKind::Control { params, .. } = request.kind else {
            unreachable!("control request expected");
        };
        assert_eq!(params.int_field(keys::TIMEOUT_MS), Some(2000));
    }

    #[test]
    fn test_session_state_ordering() {
        assert!(SessionState::Authenticated < SessionState::Active);
        assert!(SessionState::TearingDown.is_ending());
        assert!(!SessionState::Active.is_ending());
    }
}
