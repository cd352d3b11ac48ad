//! Receiver error types.
//!
//! Every failure that crosses an actor queue is one of these values. Each
//! variant carries a stable numeric status, which is the form a status takes
//! on the wire (the `status` key of a controller reply, the reason attached
//! to a teardown).

use thiserror::Error;

/// Receiver error type.
///
/// Maps to wire status codes:
/// - `InvalidParameter`: -6705
/// - `UnsupportedCommand`: -6735
/// - `NotReady`: -6745
/// - `AuthFailed`: -6754
/// - `Timeout`: -6722
/// - `Cancelled`: -6723
/// - `ResourceDenied`: -6729
/// - `Unknown`: -6700
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiverError {
    /// Malformed qualifier or params.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Command id or property name not recognised by the target or its delegate.
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    /// The target's lifecycle state forbids this request now.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The authentication collaborator rejected the connection.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// A pending command passed its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The owning session tore down before the request completed.
    #[error("Cancelled")]
    Cancelled,

    /// Global policy refused the request (e.g. another session owns audio).
    #[error("Resource denied: {0}")]
    ResourceDenied(String),

    /// Anything not covered by the other variants.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Result alias used throughout the receiver.
pub type ReceiverResult<T> = Result<T, ReceiverError>;

pub const STATUS_OK: i64 = 0;
pub const STATUS_UNKNOWN: i64 = -6700;
pub const STATUS_INVALID_PARAMETER: i64 = -6705;
pub const STATUS_TIMEOUT: i64 = -6722;
pub const STATUS_CANCELLED: i64 = -6723;
pub const STATUS_RESOURCE_DENIED: i64 = -6729;
pub const STATUS_UNSUPPORTED: i64 = -6735;
pub const STATUS_NOT_READY: i64 = -6745;
pub const STATUS_AUTH_FAILED: i64 = -6754;

impl ReceiverError {
    /// Returns the wire status for this error.
    #[must_use]
    pub fn status(&self) -> i64 {
        match self {
            ReceiverError::InvalidParameter(_) => STATUS_INVALID_PARAMETER,
            ReceiverError::UnsupportedCommand(_) => STATUS_UNSUPPORTED,
            ReceiverError::NotReady(_) => STATUS_NOT_READY,
            ReceiverError::AuthFailed(_) => STATUS_AUTH_FAILED,
            ReceiverError::Timeout(_) => STATUS_TIMEOUT,
            ReceiverError::Cancelled => STATUS_CANCELLED,
            ReceiverError::ResourceDenied(_) => STATUS_RESOURCE_DENIED,
            ReceiverError::Unknown(_) => STATUS_UNKNOWN,
        }
    }

    /// Map a wire status back to an error. `0` is success.
    ///
    /// Codes outside the taxonomy degrade to `Unknown`.
    pub fn from_status(status: i64, context: &str) -> Result<(), ReceiverError> {
        let err = match status {
            STATUS_OK => return Ok(()),
            STATUS_INVALID_PARAMETER => ReceiverError::InvalidParameter(context.to_string()),
            STATUS_UNSUPPORTED => ReceiverError::UnsupportedCommand(context.to_string()),
            STATUS_NOT_READY => ReceiverError::NotReady(context.to_string()),
            STATUS_AUTH_FAILED => ReceiverError::AuthFailed(context.to_string()),
            STATUS_TIMEOUT => ReceiverError::Timeout(context.to_string()),
            STATUS_CANCELLED => ReceiverError::Cancelled,
            STATUS_RESOURCE_DENIED => ReceiverError::ResourceDenied(context.to_string()),
            other => ReceiverError::Unknown(format!("{context} (status {other})")),
        };
        Err(err)
    }

    /// Bounded label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ReceiverError::InvalidParameter(_) => "invalid_parameter",
            ReceiverError::UnsupportedCommand(_) => "unsupported_command",
            ReceiverError::NotReady(_) => "not_ready",
            ReceiverError::AuthFailed(_) => "auth_failed",
            ReceiverError::Timeout(_) => "timeout",
            ReceiverError::Cancelled => "cancelled",
            ReceiverError::ResourceDenied(_) => "resource_denied",
            ReceiverError::Unknown(_) => "unknown",
        }
    }
}
