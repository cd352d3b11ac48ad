//! Receiver configuration.
//!
//! Configuration is loaded from environment variables and handed to the
//! server at construction. Debug-only switches (forced PIN) live here rather
//! than in globals. Secrets are redacted in Debug output.

use common::secret::SecretString;
use common::types::DeviceId;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default advertised receiver name.
pub const DEFAULT_NAME: &str = "Accessory";

/// Default deadline for commands sent to the controller (milliseconds).
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 2000;

/// Default grace period carried in revoke notifications (milliseconds).
pub const DEFAULT_REVOKE_GRACE_MS: u64 = 500;

/// Default server mailbox capacity.
pub const DEFAULT_SERVER_MAILBOX: usize = 500;

/// Default per-session mailbox capacity.
pub const DEFAULT_SESSION_MAILBOX: usize = 100;

/// Default audio ring size in frames.
pub const DEFAULT_AUDIO_RING_FRAMES: usize = 16_384;

/// Default time to wait for session tasks during shutdown (milliseconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// How connections are challenged before a session is created.
#[derive(Clone, Default)]
pub enum PinPolicy {
    /// No PIN or password.
    #[default]
    None,
    /// A fresh 4-digit PIN per connection.
    RandomPin,
    /// Fixed password.
    Password(SecretString),
}

impl fmt::Debug for PinPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinPolicy::None => f.write_str("None"),
            PinPolicy::RandomPin => f.write_str("RandomPin"),
            PinPolicy::Password(_) => f.write_str("Password([REDACTED])"),
        }
    }
}

/// What happens when a second session asks for audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SingleAudioPolicy {
    /// Any number of sessions may stream audio.
    Off,
    /// The newcomer gets `ResourceDenied`.
    #[default]
    Deny,
    /// The current audio session is torn down and the newcomer proceeds.
    Preempt,
}

/// What a Take gets when it loses on priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentionPolicy {
    #[default]
    Deny,
    /// Park the Take until the holder releases.
    Queue,
}

/// Receiver configuration.
#[derive(Clone)]
pub struct ReceiverConfig {
    /// Accessory identity advertised to controllers.
    pub device_id: DeviceId,

    /// Human-readable name in the service record.
    pub name: String,

    /// Advertised capability bitmask.
    pub features: u64,

    /// When false, `startServer` refuses to advertise.
    pub enabled: bool,

    pub pin_policy: PinPolicy,

    /// Debug: use this PIN instead of a random one.
    pub forced_pin: Option<SecretString>,

    pub single_audio: SingleAudioPolicy,

    pub contention: ContentionPolicy,

    /// Deadline for commands sent to the controller.
    pub command_timeout: Duration,

    /// Grace period carried in revoke notifications.
    pub revoke_grace: Duration,

    pub server_mailbox: usize,

    pub session_mailbox: usize,

    /// Frames pre-allocated per audio stream.
    pub audio_ring_frames: usize,

    pub shutdown_timeout: Duration,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for ReceiverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverConfig")
            .field("device_id", &self.device_id.to_string())
            .field("name", &self.name)
            .field("features", &format_args!("{:#x}", self.features))
            .field("enabled", &self.enabled)
            .field("pin_policy", &self.pin_policy)
            .field(
                "forced_pin",
                &self.forced_pin.as_ref().map(|_| "[REDACTED]"),
            )
            .field("single_audio", &self.single_audio)
            .field("contention", &self.contention)
            .field("command_timeout", &self.command_timeout)
            .field("revoke_grace", &self.revoke_grace)
            .field("server_mailbox", &self.server_mailbox)
            .field("session_mailbox", &self.session_mailbox)
            .field("audio_ring_frames", &self.audio_ring_frames)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl ReceiverConfig {
    /// Defaults for everything except the identity.
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            name: DEFAULT_NAME.to_string(),
            features: 0,
            enabled: true,
            pin_policy: PinPolicy::None,
            forced_pin: None,
            single_audio: SingleAudioPolicy::default(),
            contention: ContentionPolicy::default(),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            revoke_grace: Duration::from_millis(DEFAULT_REVOKE_GRACE_MS),
            server_mailbox: DEFAULT_SERVER_MAILBOX,
            session_mailbox: DEFAULT_SESSION_MAILBOX,
            audio_ring_frames: DEFAULT_AUDIO_RING_FRAMES,
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`ReceiverConfig::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `MissingEnvVar` if `RECEIVER_DEVICE_ID` is absent, or the password is
    /// absent in password mode; `InvalidValue` for unparseable values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let device_id = vars
            .get("RECEIVER_DEVICE_ID")
            .ok_or_else(|| ConfigError::MissingEnvVar("RECEIVER_DEVICE_ID".to_string()))?
            .parse::<DeviceId>()
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

        let mut config = Self::new(device_id);

        if let Some(name) = vars.get("RECEIVER_NAME") {
            config.name.clone_from(name);
        }

        if let Some(raw) = vars.get("RECEIVER_FEATURES") {
            config.features = parse_features(raw)?;
        }

        config.enabled = vars
            .get("RECEIVER_ENABLED")
            .and_then(|s| parse_bool(s))
            .unwrap_or(true);

        config.pin_policy = match vars.get("RECEIVER_PIN_MODE").map(String::as_str) {
            None | Some("none") => PinPolicy::None,
            Some("pin") => PinPolicy::RandomPin,
            Some("password") => PinPolicy::Password(SecretString::from(
                vars.get("RECEIVER_PASSWORD")
                    .ok_or_else(|| ConfigError::MissingEnvVar("RECEIVER_PASSWORD".to_string()))?
                    .clone(),
            )),
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "RECEIVER_PIN_MODE must be none, pin or password, got {other:?}"
                )))
            }
        };

        if let Some(pin) = vars.get("RECEIVER_FORCED_PIN") {
            if pin.len() != 4 || !pin.chars().all(|c| c.is_ascii_digit()) {
                return Err(ConfigError::InvalidValue(
                    "RECEIVER_FORCED_PIN must be 4 digits".to_string(),
                ));
            }
            config.forced_pin = Some(SecretString::from(pin.clone()));
        }

        config.single_audio = match vars.get("RECEIVER_SINGLE_AUDIO").map(String::as_str) {
            None | Some("deny") => SingleAudioPolicy::Deny,
            Some("off") => SingleAudioPolicy::Off,
            Some("preempt") => SingleAudioPolicy::Preempt,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "RECEIVER_SINGLE_AUDIO must be off, deny or preempt, got {other:?}"
                )))
            }
        };

        config.contention = match vars.get("RECEIVER_CONTENTION").map(String::as_str) {
            None | Some("deny") => ContentionPolicy::Deny,
            Some("queue") => ContentionPolicy::Queue,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "RECEIVER_CONTENTION must be deny or queue, got {other:?}"
                )))
            }
        };

        config.command_timeout = Duration::from_millis(
            vars.get("RECEIVER_COMMAND_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS),
        );

        config.revoke_grace = Duration::from_millis(
            vars.get("RECEIVER_REVOKE_GRACE_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_REVOKE_GRACE_MS),
        );

        config.server_mailbox = vars
            .get("RECEIVER_SERVER_MAILBOX")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_SERVER_MAILBOX);

        config.session_mailbox = vars
            .get("RECEIVER_SESSION_MAILBOX")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_SESSION_MAILBOX);

        config.audio_ring_frames = vars
            .get("RECEIVER_AUDIO_RING_FRAMES")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_AUDIO_RING_FRAMES);

        config.shutdown_timeout = Duration::from_millis(
            vars.get("RECEIVER_SHUTDOWN_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        );

        Ok(config)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_features(raw: &str) -> Result<u64, ConfigError> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex_digits) => u64::from_str_radix(hex_digits, 16),
        None => raw.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidValue(format!("RECEIVER_FEATURES: {raw:?}")))
}
