//! Message types for actor communication.
//!
//! Each actor has two inputs:
//! - a bounded mailbox (`ServerMessage`, `SessionMessage`) for requests from
//!   embedders and the transport, where back-pressure is wanted;
//! - an unbounded lane (`ServerNotice`, `SessionNotice`) for completion jobs
//!   and actor-to-actor notices, which must never wait on the receiver.
//!
//! Sessions only ever talk to the server through its lane, and the server
//! only ever talks to sessions through theirs.

use super::dispatch::{Reply, Request};
use super::queue::Job;
use super::session::SessionState;
use crate::arbiter::{ClaimKind, ClaimSnapshot, ResourceOutcome, Revocation};
use crate::errors::{ReceiverError, ReceiverResult};
use crate::platform::{Connection, SecurityContext};
use crate::protocol::{ModeState, ResourceChange, ResourceId, StreamType};
use crate::value::Dict;
use common::types::SessionId;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Messages sent to the `ServerActor` mailbox.
#[derive(Debug)]
pub enum ServerMessage {
    /// A Control, GetProperty, SetProperty or Event for the server.
    Dispatch { request: Request, reply: Reply },

    /// The listener accepted a connection; authenticate it.
    AcceptConnection {
        connection: Connection,
        /// Answered once authentication has been started, not finished.
        respond_to: oneshot::Sender<ReceiverResult<()>>,
    },

    /// Look up a live session.
    GetSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<super::session::SessionHandle>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<ServerStatus>,
    },

    /// Stop accepting, tear down every session and wait for them.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<ReceiverResult<()>>,
    },
}

/// Internal inputs of the `ServerActor`.
pub(crate) enum ServerNotice {
    /// Completion job targeted at the server's queue.
    Job(Job),

    /// A session's `changeResourceMode`. The outcome goes back to the session
    /// as [`SessionNotice::ArbitrationDecided`] carrying `reply`.
    ChangeResource {
        session: SessionId,
        change: ResourceChange,
        issued_at: Instant,
        reply: Reply,
    },

    /// A session wants to configure audio streams.
    ClaimAudio { session: SessionId },

    /// A session no longer has audio streams.
    ReleaseAudio { session: SessionId },

    /// The controller of `session` reported new modes.
    ModesChanged { session: SessionId, modes: ModeState },

    /// The session reached `Terminated` and may be deleted.
    SessionEnded {
        session: SessionId,
        reason: Option<ReceiverError>,
    },

    /// Authentication of an accepted connection finished off-queue.
    AuthCompleted {
        connection: Connection,
        result: ReceiverResult<SecurityContext>,
        accepted_at: Instant,
    },
}

/// Messages sent to a `SessionActor` mailbox.
#[derive(Debug)]
pub enum SessionMessage {
    Dispatch { request: Request, reply: Reply },

    /// The controller answered an outbound command.
    ControllerReply { transaction: u64, response: Dict },

    /// The transport or security layer failed; forces teardown.
    TransportFailed { error: ReceiverError },

    GetStatus {
        respond_to: oneshot::Sender<SessionStatus>,
    },
}

/// Internal inputs of a `SessionActor`.
pub(crate) enum SessionNotice {
    Job(Job),

    /// Answer to [`ServerNotice::ClaimAudio`].
    AudioClaimDecided { result: ReceiverResult<()> },

    /// Answer to [`ServerNotice::ChangeResource`], possibly much later when
    /// a parked Take is promoted.
    ArbitrationDecided {
        change: ResourceChange,
        outcome: ReceiverResult<ResourceOutcome>,
        reply: Reply,
    },

    /// One of the session's claims was revoked. `ack` fires once the
    /// session has been told.
    Revoked {
        revocation: Revocation,
        grace: Duration,
        ack: Option<oneshot::Sender<()>>,
    },

    /// Server-initiated unplanned teardown. `ack` fires once the session is
    /// `Terminated`.
    TearDown {
        reason: ReceiverError,
        ack: Option<oneshot::Sender<()>>,
    },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Server status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub started: bool,
    pub accepting: bool,
    pub session_count: usize,
    pub audio_owner: Option<SessionId>,
    pub claims: Vec<ClaimSnapshot>,
    pub parked_takes: usize,
    pub mailbox_depth: usize,
}

/// Session status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub state: SessionState,
    pub streams: Vec<StreamType>,
    pub claims: Vec<(ResourceId, ClaimKind)>,
    pub modes: ModeState,
    pub pending_commands: usize,
    pub deferred_requests: usize,
    pub mailbox_depth: usize,
}
