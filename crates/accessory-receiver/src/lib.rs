//! Accessory Receiver Library
//!
//! Control-plane core of an in-vehicle wireless companion protocol
//! receiver. The accessory advertises itself, accepts and authenticates
//! controller connections, and runs one session per controller:
//!
//! - Serial actor queues with re-entrancy detection and completion delivery
//! - Request dispatch (Control, GetProperty, SetProperty, Event)
//! - Session lifecycle from authentication through stream setup to teardown
//! - Resource arbitration (take/borrow of main screen and main audio)
//! - App-state and mode negotiation with the controller
//! - A small status-coded error taxonomy shared with the wire
//!
//! Media, codecs, transport encryption and service discovery are supplied
//! by the embedder through the traits in [`platform`] and [`delegate`].
//!
//! # Architecture
//!
//! ```text
//! ServerActor (one per receiver)
//! └── supervises N SessionActors
//!     └── SessionActor (one per controller connection)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Server and session actors, queues and dispatch
//! - [`arbiter`] - Resource claim table
//! - [`audio`] - Timestamp-addressed audio buffers
//! - [`config`] - Receiver configuration from environment
//! - [`delegate`] - Embedder callbacks
//! - [`errors`] - Error types with wire status codes
//! - [`observability`] - Metrics
//! - [`platform`] - External collaborators (discovery, transport, auth, clock)
//! - [`protocol`] - Command names, payload keys and wire enums
//! - [`value`] - Payload values

pub mod actors;
pub mod arbiter;
pub mod audio;
pub mod config;
pub mod delegate;
pub mod errors;
pub mod observability;
pub mod platform;
pub mod protocol;
pub mod value;
