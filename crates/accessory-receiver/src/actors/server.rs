//! `ServerActor` - the receiver's root actor.
//!
//! The server:
//! - Owns advertisement and the listening transport
//! - Authenticates accepted connections and spawns one `SessionActor` each
//! - Enforces the single-audio policy
//! - Is the only authority over resource claims (`ResourceArbiter`), for
//!   sessions and for the local system alike
//! - Supervises sessions (removal, panic detection, graceful shutdown)
//!
//! The server never waits on a session's bounded mailbox. It talks to
//! sessions through their lanes and, where ordering matters (a revoke before
//! the competing grant, a preempted audio session before the newcomer),
//! waits for the session's acknowledgement under a timeout. Sessions never
//! wait on the server, so those waits cannot deadlock.
//!
//! Mode changes reported by a session only recheck that session's claims.
//!
//! The actor's state sits behind a mutex taken by the server's task while it
//! handles a message. Completion jobs run with it released; a direct call
//! made from one runs inline when it can be answered without waiting. A
//! panic while handling one message is logged and counted, and the server
//! carries on with the next.

use super::dispatch::{Dispatcher, Reply, Request, RequestKind};
use super::messages::{ServerMessage, ServerNotice, ServerStatus, SessionNotice};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::queue::{run_job, run_on_queue, CompletionQueue, Job, Lane, QueueId};
use super::session::{requests, PhaseTiming, SessionActor, SessionConfig, SessionHandle, SessionParts};
use crate::arbiter::{
    ConstraintPolicy, Decision, Holder, Promotion, ResourceArbiter, ResourceOutcome, RetainAll,
    Revocation,
};
use crate::config::{PinPolicy, ReceiverConfig, SingleAudioPolicy};
use crate::delegate::ServerDelegate;
use crate::errors::{ReceiverError, ReceiverResult};
use crate::observability::metrics as prom;
use crate::platform::{
    AdvertisementHandle, Advertiser, AuthChallenge, Authenticator, ClockSync, Connection,
    Listener, ListenerInfo, SecurityContext, ServiceRecord, SessionInfo, SERVICE_TYPE,
};
use crate::protocol::{commands, properties, ResourceChange, ResourceId, TransferPriority};
use crate::value::{Dict, Value};
use async_trait::async_trait;
use common::secret::SecretString;
use common::types::{DeviceId, SessionId};
use futures::FutureExt;
use indexmap::IndexMap;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Version reported through `sourceVersion` and the service record.
pub const SOURCE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long a removed session gets to finish before we stop watching it.
const SESSION_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// External collaborators the server drives.
#[derive(Clone)]
pub struct ServerPlatform {
    pub advertiser: Arc<dyn Advertiser>,
    pub listener: Arc<dyn Listener>,
    pub authenticator: Arc<dyn Authenticator>,
    pub clock: Arc<dyn ClockSync>,
    /// Decides which claims survive a mode change.
    pub constraints: Arc<dyn ConstraintPolicy>,
}

impl ServerPlatform {
    #[must_use]
    pub fn new(
        advertiser: Arc<dyn Advertiser>,
        listener: Arc<dyn Listener>,
        authenticator: Arc<dyn Authenticator>,
        clock: Arc<dyn ClockSync>,
    ) -> Self {
        Self {
            advertiser,
            listener,
            authenticator,
            clock,
            constraints: Arc::new(RetainAll),
        }
    }

    #[must_use]
    pub fn with_constraint_policy(mut self, constraints: Arc<dyn ConstraintPolicy>) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Handle to the `ServerActor`.
#[derive(Clone)]
pub struct ServerHandle {
    queue: QueueId,
    sender: mpsc::Sender<ServerMessage>,
    lane: Lane<ServerNotice>,
    mailbox: Arc<MailboxMonitor>,
    actor: Weak<Mutex<ServerActor>>,
    cancel_token: CancellationToken,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dispatcher for ServerHandle {
    fn queue_id(&self) -> QueueId {
        self.queue
    }

    async fn enqueue(&self, request: Request, reply: Reply) -> ReceiverResult<()> {
        self.send(ServerMessage::Dispatch { request, reply }).await
    }

    fn dispatch_inline(&self, request: Request) -> ReceiverResult<Value> {
        let actor = self
            .actor
            .upgrade()
            .ok_or_else(|| ReceiverError::NotReady("server stopped".to_string()))?;
        let mut actor = actor.try_lock().map_err(|_| {
            ReceiverError::NotReady(format!("'{}' issued from inside a server handler", request.name()))
        })?;
        actor.dispatch_inline(request)
    }
}

impl ServerHandle {
    async fn send(&self, message: ServerMessage) -> ReceiverResult<()> {
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|e| {
            self.mailbox.record_unsent();
            ReceiverError::NotReady(format!("channel send failed: {e}"))
        })
    }

    /// Messages sent to the server and not yet handled.
    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.current_depth()
    }

    /// Start the listener and advertise.
    ///
    /// # Errors
    ///
    /// `NotReady` when the receiver is disabled; whatever the listener or
    /// advertiser reports.
    pub async fn start(&self) -> ReceiverResult<()> {
        self.control(commands::START_SERVER, Dict::new())
            .await
            .map(|_| ())
    }

    /// Stop advertising and listening, and tear down every session.
    ///
    /// # Errors
    ///
    /// `NotReady` if the server is gone.
    pub async fn stop(&self) -> ReceiverResult<()> {
        self.control(commands::STOP_SERVER, Dict::new())
            .await
            .map(|_| ())
    }

    /// # Errors
    ///
    /// Whatever the advertiser reports.
    pub async fn update_advertising(&self) -> ReceiverResult<()> {
        self.control(commands::UPDATE_ADVERTISING, Dict::new())
            .await
            .map(|_| ())
    }

    /// Hand an accepted connection to the server. Returns once
    /// authentication has started; the outcome arrives through the
    /// delegate (`session_created` or `session_failed`).
    ///
    /// # Errors
    ///
    /// `NotReady` unless the server is started and accepting.
    pub async fn accept_connection(&self, connection: Connection) -> ReceiverResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMessage::AcceptConnection {
            connection,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| ReceiverError::NotReady(format!("response receive failed: {e}")))?
    }

    /// Look up a live session.
    ///
    /// # Errors
    ///
    /// `NotReady` if the server is gone.
    pub async fn session(&self, session_id: SessionId) -> ReceiverResult<Option<SessionHandle>> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMessage::GetSession {
            session_id,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| ReceiverError::NotReady(format!("response receive failed: {e}")))
    }

    /// # Errors
    ///
    /// `NotReady` if the server is gone.
    pub async fn status(&self) -> ReceiverResult<ServerStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMessage::GetStatus { respond_to: tx }).await?;

        rx.await
            .map_err(|e| ReceiverError::NotReady(format!("response receive failed: {e}")))
    }

    /// Stop accepting, tear down every session and wait up to `deadline`
    /// for their tasks. The server exits afterwards.
    ///
    /// # Errors
    ///
    /// `NotReady` if the server is already gone.
    pub async fn shutdown(&self, deadline: Duration) -> ReceiverResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ServerMessage::Shutdown {
            deadline,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| ReceiverError::NotReady(format!("response receive failed: {e}")))?
    }

    /// Arbitrate on behalf of the local system.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for a malformed change; `NotReady` if the server
    /// is gone. A denial is an `Ok` outcome.
    pub async fn change_resource_mode(&self, change: &ResourceChange) -> ReceiverResult<ResourceOutcome> {
        let value = self
            .call_blocking(requests::change_resource_mode(change))
            .await?;
        ResourceOutcome::from_value(&value)
    }

    /// # Errors
    ///
    /// See [`ServerHandle::change_resource_mode`].
    pub async fn take_resource(&self, resource: ResourceId, priority: TransferPriority) -> ReceiverResult<ResourceOutcome> {
        self.change_resource_mode(&ResourceChange::take(resource, priority))
            .await
    }

    /// # Errors
    ///
    /// See [`ServerHandle::change_resource_mode`].
    pub async fn untake_resource(&self, resource: ResourceId) -> ReceiverResult<ResourceOutcome> {
        self.change_resource_mode(&ResourceChange::untake(resource))
            .await
    }

    /// # Errors
    ///
    /// See [`ServerHandle::change_resource_mode`].
    pub async fn borrow_resource(&self, resource: ResourceId, priority: TransferPriority) -> ReceiverResult<ResourceOutcome> {
        self.change_resource_mode(&ResourceChange::borrow(resource, priority))
            .await
    }

    /// # Errors
    ///
    /// See [`ServerHandle::change_resource_mode`].
    pub async fn unborrow_resource(&self, resource: ResourceId) -> ReceiverResult<ResourceOutcome> {
        self.change_resource_mode(&ResourceChange::unborrow(resource))
            .await
    }

    /// The server's queue, for completions that must run there.
    #[must_use]
    pub fn completion_queue(&self) -> Arc<dyn CompletionQueue> {
        Arc::new(self.lane.clone())
    }

    /// Cancel the server (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Managed session entry.
struct ManagedSession {
    handle: SessionHandle,
    task_handle: JoinHandle<()>,
    info: SessionInfo,
}

/// A Take parked under the `queue` contention policy.
struct ParkedTake {
    holder: Holder,
    change: ResourceChange,
    reply: Reply,
}

/// The `ServerActor` implementation.
pub struct ServerActor {
    config: ReceiverConfig,
    platform: ServerPlatform,
    delegate: Arc<dyn ServerDelegate>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
    lane: Lane<ServerNotice>,
    /// Parent of every session's token.
    cancel_token: CancellationToken,

    sessions: IndexMap<SessionId, ManagedSession>,
    arbiter: ResourceArbiter,
    parked: HashMap<u64, ParkedTake>,
    audio_owner: Option<SessionId>,

    started: bool,
    accepting: bool,
    advertisement: Option<AdvertisementHandle>,
    advertised_at: Option<Instant>,
    listener: Option<ListenerInfo>,
    playing: bool,
    device_id: DeviceId,
    interface_name: Option<String>,
    rng: SystemRandom,
}

impl ServerActor {
    /// Spawn the server and return a handle to it.
    #[must_use]
    pub fn spawn(
        config: ReceiverConfig,
        platform: ServerPlatform,
        delegate: Arc<dyn ServerDelegate>,
        metrics: Arc<ActorMetrics>,
    ) -> (ServerHandle, JoinHandle<()>) {
        let queue = QueueId::next();
        let (sender, receiver) = mpsc::channel(config.server_mailbox.max(1));
        let (lane, notices) = Lane::new(queue, ServerNotice::Job);
        let cancel_token = CancellationToken::new();
        let device_id = config.device_id;
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Server, device_id.to_string()));

        let actor = Arc::new(Mutex::new(Self {
            mailbox: Arc::clone(&mailbox),
            arbiter: ResourceArbiter::new(config.contention),
            device_id,
            config,
            platform,
            delegate,
            metrics: Arc::clone(&metrics),
            lane: lane.clone(),
            cancel_token: cancel_token.clone(),
            sessions: IndexMap::new(),
            parked: HashMap::new(),
            audio_owner: None,
            started: false,
            accepting: true,
            advertisement: None,
            advertised_at: None,
            listener: None,
            playing: false,
            interface_name: None,
            rng: SystemRandom::new(),
        }));

        let handle = ServerHandle {
            queue,
            sender,
            lane,
            mailbox: Arc::clone(&mailbox),
            actor: Arc::downgrade(&actor),
            cancel_token: cancel_token.clone(),
        };

        let task_loop = ServerLoop {
            device_id,
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
            target: "ar.actor.server",
            device_id = %self.device_id,
            name = %self.config.name,
            "ServerActor started"
        );
    }

    /// Stop using the configured timeout.
    async fn shut_down(&mut self) {
        self.graceful_shutdown(self.config.shutdown_timeout).await;
    }

    /// Call the delegate for a result. A panic becomes `Unknown`.
    fn delegate_call<R>(
        &self,
        what: &str,
        f: impl FnOnce(&dyn ServerDelegate) -> ReceiverResult<R>,
    ) -> ReceiverResult<R> {
        std::panic::catch_unwind(AssertUnwindSafe(|| f(self.delegate.as_ref()))).unwrap_or_else(|_| {
            error!(target: "ar.actor.server", call = what, "Delegate panicked");
            self.metrics.record_panic(ActorType::Server);
            Err(ReceiverError::Unknown(format!("delegate panicked in '{what}'")))
        })
    }

    async fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Dispatch { request, reply } => self.handle_dispatch(request, reply).await,

            ServerMessage::AcceptConnection {
                connection,
                respond_to,
            } => {
                let result = self.accept_connection(connection);
                let _ = respond_to.send(result);
            }

            ServerMessage::GetSession {
                session_id,
                respond_to,
            } => {
                let handle = self.sessions.get(&session_id).map(|m| m.handle.clone());
                let _ = respond_to.send(handle);
            }

            ServerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }

            ServerMessage::Shutdown { deadline, respond_to } => {
                self.graceful_shutdown(deadline).await;
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    async fn handle_notice(&mut self, notice: ServerNotice) {
        match notice {
            ServerNotice::Job(job) => run_completion(job),

            ServerNotice::ChangeResource {
                session,
                change,
                issued_at,
                reply,
            } => {
                if self.sessions.contains_key(&session) {
                    self.arbitrate(Holder::Session(session), change, issued_at, reply)
                        .await;
                } else {
                    self.complete(Holder::Session(session), change, Err(ReceiverError::Cancelled), reply);
                }
            }

            ServerNotice::ClaimAudio { session } => self.claim_audio(session).await,

            ServerNotice::ReleaseAudio { session } => {
                if self.audio_owner == Some(session) {
                    self.audio_owner = None;
                    debug!(target: "ar.actor.server", session_id = %session, "Audio released");
                }
            }

            ServerNotice::ModesChanged { session, modes } => {
                debug!(target: "ar.actor.server", session_id = %session, "Modes changed, rechecking the session's claims");
                let recheck = self.arbiter.recheck(
                    Holder::Session(session),
                    &modes,
                    self.platform.constraints.as_ref(),
                );
                self.deliver_revocations(recheck.revoked).await;
                for promotion in recheck.promoted {
                    self.complete_promotion(promotion);
                }
            }

            ServerNotice::SessionEnded { session, reason } => self.remove_session(session, reason).await,

            ServerNotice::AuthCompleted {
                connection,
                result,
                accepted_at,
            } => self.auth_completed(connection, result, accepted_at),
        }
    }

    fn respond(&self, reply: Reply, result: ReceiverResult<Value>) {
        reply.deliver(result, &self.lane);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn handle_dispatch(&mut self, request: Request, reply: Reply) {
        let Request {
            kind,
            qualifier,
            issued_at,
        } = request;
        let qualifier = qualifier.as_deref();

        match kind {
            RequestKind::Control { command, params } => match command.as_str() {
                commands::START_SERVER => {
                    let result = self.start_server().await.map(|()| Value::Dict(Dict::new()));
                    self.respond(reply, result);
                }
                commands::STOP_SERVER => {
                    self.stop_server().await;
                    self.respond(reply, Ok(Value::Dict(Dict::new())));
                }
                commands::SESSION_DIED => {
                    self.tear_down_sessions(ReceiverError::Cancelled).await;
                    self.respond(reply, Ok(Value::Dict(Dict::new())));
                }
                commands::UPDATE_ADVERTISING => {
                    let result = self
                        .update_advertising()
                        .await
                        .map(|()| Value::Dict(Dict::new()));
                    self.respond(reply, result);
                }
                commands::CHANGE_RESOURCE_MODE => match ResourceChange::from_params(&params) {
                    Ok(change) => self.arbitrate(Holder::Local, change, issued_at, reply).await,
                    Err(e) => self.respond(reply, Err(e)),
                },
                _ => {
                    let result = self
                        .delegate_call(&command, |d| d.control(&command, qualifier, &params))
                        .map(Value::Dict);
                    self.respond(reply, result);
                }
            },

            RequestKind::GetProperty { name } => {
                let result = self.get_property(&name, qualifier);
                self.respond(reply, result);
            }

            RequestKind::SetProperty { name, value } => {
                let result = self
                    .set_property(&name, qualifier, &value)
                    .await
                    .map(|()| Value::Dict(Dict::new()));
                self.respond(reply, result);
            }

            RequestKind::Event { name, .. } => {
                debug!(target: "ar.actor.server", event = %name, "Unhandled server event");
                self.respond(reply, Ok(Value::Dict(Dict::new())));
            }
        }
    }

    fn get_property(&self, name: &str, qualifier: Option<&str>) -> ReceiverResult<Value> {
        match name {
            properties::PLAYING => Ok(Value::from(self.playing)),
            properties::SOURCE_VERSION => Ok(Value::from(SOURCE_VERSION)),
            properties::DEVICE_ID => Ok(Value::from(self.device_id.to_string())),
            properties::INTERFACE_NAME => self
                .interface_name
                .as_deref()
                .map(Value::from)
                .ok_or_else(|| ReceiverError::NotReady("no interface bound yet".to_string())),
            _ => self.delegate_call(name, |d| d.copy_property(name, qualifier)),
        }
    }

    async fn set_property(&mut self, name: &str, qualifier: Option<&str>, value: &Value) -> ReceiverResult<()> {
        self.store_property(name, qualifier, value)?;
        if name == properties::DEVICE_ID {
            self.update_advertising().await?;
        }
        Ok(())
    }

    /// Record a property. A new `deviceID` still has to be advertised.
    fn store_property(&mut self, name: &str, qualifier: Option<&str>, value: &Value) -> ReceiverResult<()> {
        match name {
            properties::PLAYING => {
                self.playing = value
                    .as_bool()
                    .ok_or_else(|| ReceiverError::InvalidParameter("playing must be a boolean".to_string()))?;
                Ok(())
            }
            properties::SOURCE_VERSION => Err(ReceiverError::InvalidParameter(
                "sourceVersion is read-only".to_string(),
            )),
            properties::DEVICE_ID => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| ReceiverError::InvalidParameter("deviceID must be a string".to_string()))?;
                self.device_id = raw
                    .parse()
                    .map_err(|e| ReceiverError::InvalidParameter(format!("deviceID: {e}")))?;
                Ok(())
            }
            properties::INTERFACE_NAME => {
                let raw = value.as_str().ok_or_else(|| {
                    ReceiverError::InvalidParameter("interfaceName must be a string".to_string())
                })?;
                self.interface_name = Some(raw.to_string());
                Ok(())
            }
            _ => self.delegate_call(name, |d| d.set_property(name, qualifier, value)),
        }
    }

    /// Handle `request` for a caller already on the server's queue. Requests
    /// that wait on the platform or on sessions are refused.
    fn dispatch_inline(&mut self, request: Request) -> ReceiverResult<Value> {
        let Request { kind, qualifier, .. } = request;
        let qualifier = qualifier.as_deref();

        match kind {
            RequestKind::Control { command, params } => match command.as_str() {
                commands::START_SERVER
                | commands::STOP_SERVER
                | commands::SESSION_DIED
                | commands::UPDATE_ADVERTISING
                | commands::CHANGE_RESOURCE_MODE => Err(ReceiverError::NotReady(format!(
                    "'{command}' cannot complete inline; issue it with a completion"
                ))),
                _ => self
                    .delegate_call(&command, |d| d.control(&command, qualifier, &params))
                    .map(Value::Dict),
            },
            RequestKind::GetProperty { name } => self.get_property(&name, qualifier),
            RequestKind::SetProperty { name, .. } if name == properties::DEVICE_ID => Err(ReceiverError::NotReady(
                "'deviceID' re-advertises; issue it with a completion".to_string(),
            )),
            RequestKind::SetProperty { name, value } => self
                .store_property(&name, qualifier, &value)
                .map(|()| Value::Dict(Dict::new())),
            RequestKind::Event { name, .. } => {
                debug!(target: "ar.actor.server", event = %name, "Unhandled server event");
                Ok(Value::Dict(Dict::new()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Advertising and listening
    // ------------------------------------------------------------------

    fn service_record(&self) -> ServiceRecord {
        ServiceRecord {
            service_type: SERVICE_TYPE.to_string(),
            name: self.config.name.clone(),
            device_id: self.device_id,
            features: self.config.features,
            pin_required: matches!(self.config.pin_policy, PinPolicy::RandomPin),
            password_required: matches!(self.config.pin_policy, PinPolicy::Password(_)),
            source_version: SOURCE_VERSION.to_string(),
        }
    }

    async fn start_server(&mut self) -> ReceiverResult<()> {
        if self.started {
            return Ok(());
        }
        if !self.config.enabled {
            return Err(ReceiverError::NotReady("receiver is disabled".to_string()));
        }
        if !self.accepting {
            return Err(ReceiverError::NotReady("server is shutting down".to_string()));
        }

        let listener = self.platform.listener.start().await?;
        let record = self.service_record();
        let advertisement = match self.platform.advertiser.advertise(&record).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(stop_error) = self.platform.listener.stop().await {
                    warn!(target: "ar.actor.server", error = %stop_error, "Listener stop failed");
                }
                return Err(e);
            }
        };

        if self.interface_name.is_none() {
            self.interface_name = Some(listener.interface_name.clone());
        }
        info!(
            target: "ar.actor.server",
            device_id = %self.device_id,
            interface = %listener.interface_name,
            port = listener.port,
            "Server started"
        );
        self.listener = Some(listener);
        self.advertisement = Some(advertisement);
        self.advertised_at = Some(Instant::now());
        self.started = true;
        Ok(())
    }

    async fn stop_listening(&mut self) {
        if let Some(handle) = self.advertisement.take() {
            if let Err(e) = self.platform.advertiser.stop_advertising(handle).await {
                warn!(target: "ar.actor.server", error = %e, "Stop advertising failed");
            }
        }
        if self.listener.take().is_some() {
            if let Err(e) = self.platform.listener.stop().await {
                warn!(target: "ar.actor.server", error = %e, "Listener stop failed");
            }
        }
        self.started = false;
    }

    async fn stop_server(&mut self) {
        self.stop_listening().await;
        self.tear_down_sessions(ReceiverError::Cancelled).await;
        info!(target: "ar.actor.server", device_id = %self.device_id, "Server stopped");
    }

    async fn update_advertising(&mut self) -> ReceiverResult<()> {
        let Some(previous) = self.advertisement.take() else {
            return Ok(());
        };
        if let Err(e) = self.platform.advertiser.stop_advertising(previous).await {
            warn!(target: "ar.actor.server", error = %e, "Stop advertising failed");
        }
        let record = self.service_record();
        let handle = self.platform.advertiser.advertise(&record).await?;
        self.advertisement = Some(handle);
        self.advertised_at = Some(Instant::now());
        debug!(target: "ar.actor.server", device_id = %self.device_id, "Advertisement updated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connections and sessions
    // ------------------------------------------------------------------

    fn random_pin(&self) -> ReceiverResult<SecretString> {
        let mut bytes = [0_u8; 4];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| ReceiverError::Unknown("random source unavailable".to_string()))?;
        let pin = u32::from_be_bytes(bytes) % 10_000;
        Ok(SecretString::from(format!("{pin:04}")))
    }

    fn challenge(&self) -> ReceiverResult<AuthChallenge> {
        match &self.config.pin_policy {
            PinPolicy::None => Ok(AuthChallenge::default()),
            PinPolicy::RandomPin => {
                let pin = match &self.config.forced_pin {
                    Some(pin) => pin.clone(),
                    None => self.random_pin()?,
                };
                self.delegate.display_pin(&pin);
                Ok(AuthChallenge {
                    pin: Some(pin),
                    password: None,
                })
            }
            PinPolicy::Password(password) => Ok(AuthChallenge {
                pin: None,
                password: Some(password.clone()),
            }),
        }
    }

    fn accept_connection(&mut self, connection: Connection) -> ReceiverResult<()> {
        if !self.started || !self.accepting {
            return Err(ReceiverError::NotReady("server is not accepting connections".to_string()));
        }
        let challenge = self.challenge()?;
        let authenticator = Arc::clone(&self.platform.authenticator);
        let lane = self.lane.clone();
        let accepted_at = Instant::now();

        debug!(
            target: "ar.actor.server",
            peer = %connection.peer,
            transport = connection.transport_type.as_str(),
            "Authenticating connection"
        );

        // Key exchange is slow; keep it off the server queue
        tokio::spawn(async move {
            let result = authenticator.authenticate(&connection, &challenge).await;
            let notice = ServerNotice::AuthCompleted {
                connection,
                result,
                accepted_at,
            };
            if lane.post(notice).is_err() {
                debug!(target: "ar.actor.server", "Server gone before authentication finished");
            }
        });
        Ok(())
    }

    fn auth_completed(
        &mut self,
        connection: Connection,
        result: ReceiverResult<SecurityContext>,
        accepted_at: Instant,
    ) {
        let security = match result {
            Ok(security) => security,
            Err(e) => {
                warn!(target: "ar.actor.server", peer = %connection.peer, error = %e, "Authentication failed");
                self.metrics.session_failed("auth");
                self.delegate.session_failed(&e);
                return;
            }
        };
        if !self.accepting {
            self.metrics.session_failed("shutdown");
            self.delegate
                .session_failed(&ReceiverError::NotReady("server is shutting down".to_string()));
            return;
        }

        let session_id = SessionId::new();
        let info = SessionInfo::for_connection(session_id, &connection);

        let session_delegate = match self.delegate.session_created(&info) {
            Ok(delegate) => delegate,
            Err(e) => {
                warn!(target: "ar.actor.server", session_id = %session_id, error = %e, "Session refused by delegate");
                self.metrics.session_failed("rejected");
                self.delegate.session_failed(&e);
                return;
            }
        };
        if let Err(e) = session_delegate.initialize(&info) {
            warn!(target: "ar.actor.server", session_id = %session_id, error = %e, "Session initialization failed");
            self.metrics.session_failed("initialize");
            self.delegate.session_failed(&e);
            return;
        }

        let key = security.fingerprint();
        let parts = SessionParts {
            info: info.clone(),
            security,
            delegate: session_delegate,
            link: connection.link,
            clock: Arc::clone(&self.platform.clock),
            server: self.lane.clone(),
            config: SessionConfig::from(&self.config),
            timing: PhaseTiming::new(self.advertised_at, accepted_at, Instant::now()),
            metrics: Arc::clone(&self.metrics),
        };
        let (handle, task_handle) = SessionActor::spawn(parts, self.cancel_token.child_token());

        self.sessions.insert(
            session_id,
            ManagedSession {
                handle,
                task_handle,
                info,
            },
        );
        self.metrics.session_created();

        info!(
            target: "ar.actor.server",
            session_id = %session_id,
            peer = %connection.peer,
            key = %key,
            total_sessions = self.sessions.len(),
            "Session created"
        );
    }

    /// Server-initiated teardown of every session. Waits (bounded) for each
    /// to reach `Terminated`; removal follows through `SessionEnded`.
    async fn tear_down_sessions(&mut self, reason: ReceiverError) {
        let mut acks = Vec::with_capacity(self.sessions.len());
        for (session_id, managed) in &self.sessions {
            let (ack, acked) = oneshot::channel();
            let notice = SessionNotice::TearDown {
                reason: reason.clone(),
                ack: Some(ack),
            };
            if managed.handle.notify(notice).is_ok() {
                acks.push((*session_id, acked));
            }
        }

        for (session_id, acked) in acks {
            if tokio::time::timeout(self.config.command_timeout, acked)
                .await
                .is_err()
            {
                warn!(target: "ar.actor.server", session_id = %session_id, "Session teardown not acknowledged in time");
            }
        }
    }

    async fn remove_session(&mut self, session_id: SessionId, reason: Option<ReceiverError>) {
        let Some(managed) = self.sessions.shift_remove(&session_id) else {
            return;
        };
        debug!(
            target: "ar.actor.server",
            session_id = %session_id,
            peer = %managed.info.peer,
            "Removing session actor"
        );

        managed.handle.cancel();

        // Wait for the task in the background; don't block the server queue
        tokio::spawn(async move {
            match tokio::time::timeout(SESSION_CLEANUP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(target: "ar.actor.server", session_id = %session_id, "Session actor task completed cleanly");
                }
                Ok(Err(e)) => {
                    warn!(target: "ar.actor.server", session_id = %session_id, error = ?e, "Session actor task panicked during removal");
                }
                Err(_) => {
                    warn!(target: "ar.actor.server", session_id = %session_id, "Session actor task cleanup timed out");
                }
            }
        });

        self.release_session(session_id, reason.as_ref()).await;
    }

    /// Drop everything the server holds for a session that is gone.
    async fn release_session(&mut self, session_id: SessionId, reason: Option<&ReceiverError>) {
        if self.audio_owner == Some(session_id) {
            self.audio_owner = None;
        }

        let release = self.arbiter.release_holder(Holder::Session(session_id));
        self.deliver_revocations(release.revoked).await;
        for ticket in release.cancelled_tickets {
            if let Some(parked) = self.parked.remove(&ticket) {
                self.complete(parked.holder, parked.change, Err(ReceiverError::Cancelled), parked.reply);
            }
        }
        for promotion in release.promoted {
            self.complete_promotion(promotion);
        }

        self.metrics.session_removed();
        self.delegate.session_ended(session_id, reason);

        info!(
            target: "ar.actor.server",
            session_id = %session_id,
            released_claims = release.released.len(),
            total_sessions = self.sessions.len(),
            "Session removed"
        );
    }

    /// Sessions whose task ended without reporting `SessionEnded`.
    async fn check_session_health(&mut self) {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for session_id in finished {
            let Some(managed) = self.sessions.shift_remove(&session_id) else {
                continue;
            };
            warn!(target: "ar.actor.server", session_id = %session_id, "Session actor task finished unexpectedly");

            let reason = match managed.task_handle.await {
                Ok(()) => ReceiverError::Unknown("session exited".to_string()),
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "ar.actor.server",
                            session_id = %session_id,
                            error = ?join_error,
                            "Session actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Session);
                    }
                    ReceiverError::Unknown("session actor panicked".to_string())
                }
            };
            self.release_session(session_id, Some(&reason)).await;
        }
    }

    // ------------------------------------------------------------------
    // Single-audio policy
    // ------------------------------------------------------------------

    async fn claim_audio(&mut self, session_id: SessionId) {
        let result = match (self.config.single_audio, self.audio_owner) {
            (SingleAudioPolicy::Off, _) => Ok(()),
            (_, None) => {
                self.audio_owner = Some(session_id);
                Ok(())
            }
            (_, Some(owner)) if owner == session_id => Ok(()),
            (SingleAudioPolicy::Deny, Some(owner)) => Err(ReceiverError::ResourceDenied(format!(
                "audio is owned by session {owner}"
            ))),
            (SingleAudioPolicy::Preempt, Some(owner)) => {
                self.preempt_audio(owner).await;
                self.audio_owner = Some(session_id);
                Ok(())
            }
        };

        let outcome = if result.is_ok() { "granted" } else { "denied" };
        prom::record_resource_decision("audio", outcome);
        debug!(target: "ar.actor.server", session_id = %session_id, outcome, "Audio claim decided");

        let delivered = self
            .sessions
            .get(&session_id)
            .is_some_and(|m| m.handle.notify(SessionNotice::AudioClaimDecided { result }).is_ok());
        if !delivered && self.audio_owner == Some(session_id) {
            self.audio_owner = None;
        }
    }

    async fn preempt_audio(&mut self, owner: SessionId) {
        let (ack, acked) = oneshot::channel();
        let notice = SessionNotice::TearDown {
            reason: ReceiverError::ResourceDenied("audio preempted by another session".to_string()),
            ack: Some(ack),
        };
        let notified = self
            .sessions
            .get(&owner)
            .is_some_and(|m| m.handle.notify(notice).is_ok());
        if !notified {
            return;
        }

        info!(target: "ar.actor.server", session_id = %owner, "Preempting audio session");
        if tokio::time::timeout(self.config.command_timeout, acked)
            .await
            .is_err()
        {
            warn!(target: "ar.actor.server", session_id = %owner, "Preempted session did not acknowledge teardown");
        }
    }

    // ------------------------------------------------------------------
    // Resource arbitration
    // ------------------------------------------------------------------

    async fn arbitrate(&mut self, holder: Holder, change: ResourceChange, issued_at: Instant, reply: Reply) {
        let decision = self.arbiter.apply(holder, &change, issued_at);
        let outcome = decision.outcome();
        prom::record_resource_decision(change.resource.name(), outcome.label());

        match decision {
            Decision::Granted { revoked } => {
                // Displaced holders hear about it before the grant completes
                self.deliver_revocations(revoked).await;
                self.complete(holder, change, Ok(outcome), reply);
            }
            Decision::Queued { ticket, position } => {
                info!(
                    target: "ar.actor.server",
                    holder = %holder,
                    resource = %change.resource,
                    ticket,
                    position,
                    "Take parked"
                );
                self.parked.insert(
                    ticket,
                    ParkedTake {
                        holder,
                        change,
                        reply,
                    },
                );
            }
            Decision::Withdrawn { ticket } => {
                if let Some(parked) = self.parked.remove(&ticket) {
                    self.complete(parked.holder, parked.change, Err(ReceiverError::Cancelled), parked.reply);
                }
                self.complete(holder, change, Ok(outcome), reply);
            }
            Decision::Released { revoked, promoted } => {
                // Borrows riding on a released Take go with it
                self.deliver_revocations(revoked).await;
                self.complete(holder, change, Ok(outcome), reply);
                if let Some(promotion) = promoted {
                    self.complete_promotion(promotion);
                }
            }
            Decision::Denied(_) | Decision::NotHeld => self.complete(holder, change, Ok(outcome), reply),
        }
    }

    async fn deliver_revocations(&mut self, revoked: Vec<Revocation>) {
        for revocation in revoked {
            info!(
                target: "ar.actor.server",
                holder = %revocation.claim.holder,
                resource = %revocation.resource,
                "Claim revoked"
            );
            match revocation.claim.holder {
                Holder::Local => self.delegate.resource_revoked(&revocation),
                Holder::Session(session_id) => {
                    let (ack, acked) = oneshot::channel();
                    let notice = SessionNotice::Revoked {
                        revocation,
                        grace: self.config.revoke_grace,
                        ack: Some(ack),
                    };
                    let notified = self
                        .sessions
                        .get(&session_id)
                        .is_some_and(|m| m.handle.notify(notice).is_ok());
                    if notified
                        && tokio::time::timeout(self.config.command_timeout, acked)
                            .await
                            .is_err()
                    {
                        warn!(target: "ar.actor.server", session_id = %session_id, "Revocation not acknowledged in time");
                    }
                }
            }
        }
    }

    /// Hand an arbitration outcome back to whoever asked. Session outcomes
    /// travel back through the session so its claim mirror stays current.
    fn complete(
        &self,
        holder: Holder,
        change: ResourceChange,
        outcome: ReceiverResult<ResourceOutcome>,
        reply: Reply,
    ) {
        match holder {
            Holder::Local => self.respond(reply, outcome.map(|o| o.to_value())),
            Holder::Session(session_id) => {
                let notice = SessionNotice::ArbitrationDecided {
                    change,
                    outcome,
                    reply,
                };
                let rejected = match self.sessions.get(&session_id) {
                    Some(managed) => managed.handle.notify(notice).err(),
                    None => Some(notice),
                };
                if let Some(SessionNotice::ArbitrationDecided { reply, .. }) = rejected {
                    self.respond(reply, Err(ReceiverError::Cancelled));
                }
            }
        }
    }

    fn complete_promotion(&mut self, promotion: Promotion) {
        let Some(parked) = self.parked.remove(&promotion.ticket) else {
            return;
        };
        info!(
            target: "ar.actor.server",
            holder = %promotion.holder,
            resource = %promotion.resource,
            ticket = promotion.ticket,
            "Parked take granted"
        );
        prom::record_resource_decision(promotion.resource.name(), ResourceOutcome::Granted.label());
        self.complete(parked.holder, parked.change, Ok(ResourceOutcome::Granted), parked.reply);
    }

    // ------------------------------------------------------------------
    // Status and shutdown
    // ------------------------------------------------------------------

    fn status(&self) -> ServerStatus {
        ServerStatus {
            started: self.started,
            accepting: self.accepting,
            session_count: self.sessions.len(),
            audio_owner: self.audio_owner,
            claims: self.arbiter.snapshot(),
            parked_takes: self.parked.len(),
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self, deadline: Duration) {
        info!(
            target: "ar.actor.server",
            device_id = %self.device_id,
            session_count = self.sessions.len(),
            "Performing graceful shutdown"
        );

        self.accepting = false;
        self.stop_listening().await;

        // Cancelling a session runs its teardown before the task exits
        for (session_id, managed) in &self.sessions {
            debug!(target: "ar.actor.server", session_id = %session_id, "Cancelling session actor");
            managed.handle.cancel();
        }

        let until = Instant::now() + deadline;
        let sessions: Vec<(SessionId, ManagedSession)> = self.sessions.drain(..).collect();
        for (session_id, managed) in sessions {
            match tokio::time::timeout_at(until, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(target: "ar.actor.server", session_id = %session_id, "Session actor completed cleanly");
                }
                Ok(Err(e)) => {
                    warn!(target: "ar.actor.server", session_id = %session_id, error = ?e, "Session actor task panicked during shutdown");
                }
                Err(_) => {
                    warn!(target: "ar.actor.server", session_id = %session_id, "Session actor shutdown timed out");
                }
            }
            self.release_session(session_id, Some(&ReceiverError::Cancelled)).await;
        }

        for (_, parked) in self.parked.drain() {
            parked.reply.deliver(Err(ReceiverError::Cancelled), &self.lane);
        }

        info!(target: "ar.actor.server", device_id = %self.device_id, "Graceful shutdown complete");
    }

    /// Answer a message that arrived after the loop stopped.
    fn reject(&self, message: ServerMessage) {
        match message {
            ServerMessage::Dispatch { reply, .. } => {
                self.respond(reply, Err(ReceiverError::NotReady("server stopped".to_string())));
            }
            ServerMessage::AcceptConnection { respond_to, .. } => {
                let _ = respond_to.send(Err(ReceiverError::NotReady("server stopped".to_string())));
            }
            ServerMessage::GetSession { respond_to, .. } => {
                let _ = respond_to.send(None);
            }
            ServerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            ServerMessage::Shutdown { respond_to, .. } => {
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    fn reject_notice(&self, notice: ServerNotice) {
        match notice {
            ServerNotice::Job(job) => run_completion(job),
            ServerNotice::ChangeResource { reply, .. } => {
                self.respond(reply, Err(ReceiverError::Cancelled));
            }
            ServerNotice::AuthCompleted { .. } => {
                self.metrics.session_failed("shutdown");
                self.delegate
                    .session_failed(&ReceiverError::NotReady("server stopped".to_string()));
            }
            ServerNotice::ClaimAudio { .. }
            | ServerNotice::ReleaseAudio { .. }
            | ServerNotice::ModesChanged { .. }
            | ServerNotice::SessionEnded { .. } => {}
        }
    }
}

/// The server's task: owns its inputs and feeds them to the actor in
/// arrival order.
struct ServerLoop {
    device_id: DeviceId,
    actor: Arc<Mutex<ServerActor>>,
    receiver: mpsc::Receiver<ServerMessage>,
    notices: mpsc::UnboundedReceiver<ServerNotice>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    metrics: Arc<ActorMetrics>,
}

impl ServerLoop {
    #[instrument(skip_all, name = "ar.actor.server", fields(device_id = %self.device_id))]
    async fn run(mut self) {
        self.actor.lock().await.log_started();

        loop {
            {
                let mut actor = self.actor.lock().await;
                let checked = AssertUnwindSafe(actor.check_session_health()).catch_unwind().await;
                self.contained("session health check", checked);
            }

            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "ar.actor.server",
                        device_id = %self.device_id,
                        "ServerActor received cancellation signal"
                    );
                    let mut actor = self.actor.lock().await;
                    let stopped = AssertUnwindSafe(actor.shut_down()).catch_unwind().await;
                    self.contained("shutdown", stopped);
                    break;
                }

                Some(notice) = self.notices.recv() => {
                    self.handle_notice(notice).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let last = matches!(message, ServerMessage::Shutdown { .. });
                            let mut actor = self.actor.lock().await;
                            let handled = AssertUnwindSafe(actor.handle_message(message)).catch_unwind().await;
                            drop(actor);
                            self.contained("message", handled);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if last {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "ar.actor.server",
                                device_id = %self.device_id,
                                "ServerActor channel closed, exiting"
                            );
                            let mut actor = self.actor.lock().await;
                            let stopped = AssertUnwindSafe(actor.shut_down()).catch_unwind().await;
                            self.contained("shutdown", stopped);
                            break;
                        }
                    }
                }
            }
        }

        self.drain().await;

        info!(
            target: "ar.actor.server",
            device_id = %self.device_id,
            messages_processed = self.mailbox.messages_processed(),
            "ServerActor stopped"
        );
    }

    async fn handle_notice(&self, notice: ServerNotice) {
        match notice {
            // Runs with the actor unlocked so it can call back in
            ServerNotice::Job(job) => run_completion(job),
            notice => {
                let mut actor = self.actor.lock().await;
                let handled = AssertUnwindSafe(actor.handle_notice(notice)).catch_unwind().await;
                drop(actor);
                self.contained("notice", handled);
            }
        }
    }

    fn contained(&self, what: &'static str, outcome: std::thread::Result<()>) {
        if outcome.is_err() {
            error!(
                target: "ar.actor.server",
                device_id = %self.device_id,
                during = what,
                "Panic contained"
            );
            self.metrics.record_panic(ActorType::Server);
        }
    }

    /// Answer whatever is still queued once the loop has exited.
    async fn drain(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            self.mailbox.record_rejected();
            self.actor.lock().await.reject(message);
        }

        self.notices.close();
        while let Ok(notice) = self.notices.try_recv() {
            match notice {
                ServerNotice::Job(job) => run_completion(job),
                notice => self.actor.lock().await.reject_notice(notice),
            }
        }
    }
}

fn run_completion(job: Job) {
    if let Err(e) = run_job(job) {
        warn!(target: "ar.actor.server", error = %e, "Completion failed");
    }
}
