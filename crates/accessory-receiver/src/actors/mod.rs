//! Actor model implementation for the accessory receiver.
//!
//! ```text
//! ServerActor (one per receiver)
//! ├── owns advertisement, listener and the resource arbiter
//! ├── enforces the single-audio policy
//! └── supervises N SessionActors
//!     └── SessionActor (one per authenticated controller connection)
//!         ├── owns the session lifecycle and audio streams
//!         └── tracks outbound commands until their reply or deadline
//! ```
//!
//! # Key Design Decisions
//!
//! - **One serial queue per actor**: every request, completion and notice for
//!   an actor runs on its task, in order
//! - **Two inputs**: a bounded mailbox for outside requests, an unbounded lane
//!   for actor-to-actor notices, so the server and a session never block on
//!   each other
//! - **CancellationToken propagation**: sessions get child tokens of the server
//! - **Mailbox monitoring**: depth thresholds with metrics (Server: 100/400,
//!   Session: 25/80)
//!
//! # Modules
//!
//! - [`server`] - `ServerActor`, supervises sessions and arbitrates resources
//! - [`session`] - `SessionActor`, one per controller connection
//! - [`dispatch`] - The four request kinds and how their results are delivered
//! - [`queue`] - Queue identity, lanes and free-standing serial queues
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod dispatch;
pub mod messages;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod session;

// Re-export primary types
pub use dispatch::{Completion, Dispatcher, Reply, Request, RequestKind};
pub use messages::{ServerMessage, ServerStatus, SessionMessage, SessionStatus};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use queue::{current_queue, CompletionQueue, Job, QueueId, SerialQueue};
pub use server::{ServerActor, ServerHandle, ServerPlatform, SOURCE_VERSION};
pub use session::{SessionActor, SessionHandle, SessionState};
