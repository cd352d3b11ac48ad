//! Embedder callbacks.
//!
//! A [`ServerDelegate`] is supplied when the server is spawned; each session
//! gets the [`SessionDelegate`] returned by
//! [`ServerDelegate::session_created`]. Callbacks run on the owning actor's
//! queue and must return promptly. Every method has a default, so embedders
//! implement only what they care about.

use crate::arbiter::Revocation;
use crate::errors::{ReceiverError, ReceiverResult};
use crate::platform::SessionInfo;
use crate::protocol::{ModeState, StreamType};
use crate::value::{Dict, Value};
use common::secret::SecretString;
use common::types::SessionId;
use std::sync::Arc;
use std::time::Duration;

/// Server-level callbacks.
pub trait ServerDelegate: Send + Sync {
    /// A command the server does not handle itself.
    ///
    /// # Errors
    ///
    /// `UnsupportedCommand` by default.
    fn control(&self, command: &str, _qualifier: Option<&str>, _params: &Dict) -> ReceiverResult<Dict> {
        Err(ReceiverError::UnsupportedCommand(command.to_string()))
    }

    /// # Errors
    ///
    /// `UnsupportedCommand` by default.
    fn copy_property(&self, name: &str, _qualifier: Option<&str>) -> ReceiverResult<Value> {
        Err(ReceiverError::UnsupportedCommand(name.to_string()))
    }

    /// # Errors
    ///
    /// `UnsupportedCommand` by default.
    fn set_property(&self, name: &str, _qualifier: Option<&str>, _value: &Value) -> ReceiverResult<()> {
        Err(ReceiverError::UnsupportedCommand(name.to_string()))
    }

    /// A connection authenticated. Returns the delegate for its session.
    ///
    /// # Errors
    ///
    /// Refusing the session; it is reported back through `session_failed`.
    fn session_created(&self, info: &SessionInfo) -> ReceiverResult<Arc<dyn SessionDelegate>>;

    /// A connection failed before its session existed.
    fn session_failed(&self, _reason: &ReceiverError) {}

    /// A session reached `Terminated` and was removed.
    fn session_ended(&self, _id: SessionId, _reason: Option<&ReceiverError>) {}

    /// A claim made by the local system was revoked.
    fn resource_revoked(&self, _revocation: &Revocation) {}

    /// Show the PIN the user must enter on the controller.
    fn display_pin(&self, _pin: &SecretString) {}
}

/// One stream of a `setUpStreams` request.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSetup {
    pub stream_type: StreamType,
    /// Stream entry as sent by the controller.
    pub params: Dict,
}

/// Per-session callbacks. Media I/O lives behind this.
pub trait SessionDelegate: Send + Sync {
    /// Runs once, before the session accepts any request.
    ///
    /// # Errors
    ///
    /// Refusing the session; the server reports `session_failed`.
    fn initialize(&self, _info: &SessionInfo) -> ReceiverResult<()> {
        Ok(())
    }

    /// Runs exactly once, during teardown to `Terminated`.
    fn finalize(&self, _info: &SessionInfo) {}

    /// The controller signalled media start.
    fn started(&self, _info: &SessionInfo) {}

    /// Configure media for one stream. The returned mapping is merged into
    /// that stream's entry in the setup response.
    ///
    /// # Errors
    ///
    /// Fails the whole setup request.
    fn setup_stream(&self, _stream: &StreamSetup) -> ReceiverResult<Dict> {
        Ok(Dict::new())
    }

    fn teardown_stream(&self, _stream_type: StreamType) {}

    /// # Errors
    ///
    /// `UnsupportedCommand` by default.
    fn control(&self, command: &str, _qualifier: Option<&str>, _params: &Dict) -> ReceiverResult<Dict> {
        Err(ReceiverError::UnsupportedCommand(command.to_string()))
    }

    /// # Errors
    ///
    /// `UnsupportedCommand` by default.
    fn copy_property(&self, name: &str, _qualifier: Option<&str>) -> ReceiverResult<Value> {
        Err(ReceiverError::UnsupportedCommand(name.to_string()))
    }

    /// # Errors
    ///
    /// `UnsupportedCommand` by default.
    fn set_property(&self, name: &str, _qualifier: Option<&str>, _value: &Value) -> ReceiverResult<()> {
        Err(ReceiverError::UnsupportedCommand(name.to_string()))
    }

    fn modes_changed(&self, _modes: &ModeState) {}

    fn request_ui(&self, _url: Option<&str>) {}

    fn duck_audio(&self, _duration: Duration, _volume: f64) {}

    fn unduck_audio(&self, _duration: Duration) {}

    /// One of this session's claims was revoked. Advisory: the claim is
    /// already gone, `grace` is how long the media side has to let go.
    fn resource_revoked(&self, _revocation: &Revocation, _grace: Duration) {}
}
