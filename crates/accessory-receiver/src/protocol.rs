//! Protocol vocabulary: command and property names, payload keys, and the
//! numeric enums carried inside payloads.
//!
//! Numeric values are fixed by the wire protocol and must not be renumbered.

use crate::errors::ReceiverError;
use crate::value::{Dict, DictExt, Value};
use serde::Serialize;
use std::fmt;

/// Command identifiers.
pub mod commands {
    pub const START_SERVER: &str = "startServer";
    pub const STOP_SERVER: &str = "stopServer";
    pub const SESSION_DIED: &str = "sessionDied";
    pub const UPDATE_ADVERTISING: &str = "updateAdvertising";

    pub const SET_UP_STREAMS: &str = "setUpStreams";
    pub const TEAR_DOWN_STREAMS: &str = "tearDownStreams";
    pub const RECORD: &str = "record";
    pub const START: &str = "start";
    pub const FLUSH_AUDIO: &str = "flushAudio";

    pub const CHANGE_RESOURCE_MODE: &str = "changeResourceMode";
    pub const CHANGE_MODES: &str = "changeModes";
    pub const MODES_CHANGED: &str = "modesChanged";
    pub const DUCK_AUDIO: &str = "duckAudio";
    pub const UNDUCK_AUDIO: &str = "unduckAudio";
    pub const REQUEST_UI: &str = "requestUI";
    pub const SET_NIGHT_MODE: &str = "setNightMode";
    pub const SET_LIMITED_UI: &str = "setLimitedUI";
    pub const SEND_MESSAGE: &str = "iAPSendMessage";
    pub const UPDATE_VEHICLE_INFORMATION: &str = "updateVehicleInformation";
    pub const FORCE_KEY_FRAME: &str = "forceKeyFrame";
    pub const REQUEST_SIRI: &str = "requestSiri";
}

/// Property names.
pub mod properties {
    pub const PLAYING: &str = "playing";
    pub const SOURCE_VERSION: &str = "sourceVersion";
    pub const DEVICE_ID: &str = "deviceID";
    pub const INTERFACE_NAME: &str = "interfaceName";
    pub const MODES: &str = "modes";
    pub const TIMESTAMP_INFO: &str = "timestampInfo";
    pub const TRANSPORT_TYPE: &str = "transportType";
}

/// Payload keys.
pub mod keys {
    pub const STATUS: &str = "status";
    pub const REASON: &str = "reasonStr";
    pub const STREAMS: &str = "streams";
    pub const TYPE: &str = "type";
    pub const DONE: &str = "done";
    pub const TIMEOUT_MS: &str = "timeoutMs";

    pub const RESOURCES: &str = "resources";
    pub const RESOURCE_ID: &str = "resourceID";
    pub const TRANSFER_TYPE: &str = "transferType";
    pub const TRANSFER_PRIORITY: &str = "transferPriority";
    pub const TAKE_CONSTRAINT: &str = "takeConstraint";
    pub const BORROW_CONSTRAINT: &str = "borrowConstraint";
    pub const RESULT: &str = "result";
    pub const HOLDER: &str = "holder";
    pub const GRACE_MS: &str = "graceMs";

    pub const APP_STATES: &str = "appStates";
    pub const APP_STATE_ID: &str = "appStateID";
    pub const ENTITY: &str = "entity";
    pub const STATE: &str = "state";
    pub const SPEECH_MODE: &str = "speechMode";

    pub const URL: &str = "url";
    pub const DURATION_MS: &str = "durationMs";
    pub const VOLUME: &str = "volume";
    pub const NIGHT_MODE: &str = "nightMode";
    pub const LIMITED_UI: &str = "limitedUI";
    pub const MESSAGE: &str = "message";
    pub const VEHICLE_INFORMATION: &str = "vehicleInformation";
    pub const SIRI_ACTION: &str = "siriAction";

    pub const UNTIL_TIMESTAMP: &str = "untilTimestamp";
    pub const UNTIL_SEQUENCE: &str = "untilSequence";
    pub const LAST_TIMESTAMP: &str = "lastTimestamp";
    pub const SAMPLE_RATE: &str = "sampleRate";
    pub const BYTES_PER_FRAME: &str = "bytesPerFrame";
}

/// Declares a wire enum with fixed discriminants, plus lookup from the wire integer.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[must_use]
            pub fn as_i64(self) -> i64 {
                match self {
                    $($name::$variant => $value),+
                }
            }

            /// # Errors
            ///
            /// `InvalidParameter` for a value outside the wire vocabulary.
            pub fn from_i64(value: i64) -> Result<Self, ReceiverError> {
                match value {
                    $(v if v == $value => Ok($name::$variant),)+
                    other => Err(ReceiverError::InvalidParameter(format!(
                        concat!("unknown ", stringify!($name), " {}"),
                        other
                    ))),
                }
            }
        }

        impl From<$name> for Value {
            fn from(v: $name) -> Self {
                Value::Integer(v.as_i64())
            }
        }
    };
}

wire_enum!(
    /// Shared, exclusive hardware resource.
    ResourceId { MainScreen = 1, MainAudio = 2 }
);

wire_enum!(
    TransferType { Take = 1, Untake = 2, Borrow = 3, Unborrow = 4 }
);

wire_enum!(
    AppStateId { Speech = 1, PhoneCall = 2, TurnByTurn = 3 }
);

wire_enum!(
    SpeechMode { None = -1, Speaking = 1, Recognizing = 2 }
);

wire_enum!(
    TriState { False = -1, True = 1 }
);

wire_enum!(
    /// Which side currently owns a resource or app state.
    Entity { Controller = 1, Accessory = 2 }
);

wire_enum!(
    StreamType {
        GeneralAudio = 96,
        MainAudio = 100,
        AltAudio = 101,
        MainHighAudio = 102,
        Screen = 110,
    }
);

impl ResourceId {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ResourceId::MainScreen => "mainScreen",
            ResourceId::MainAudio => "mainAudio",
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<bool> for TriState {
    fn from(v: bool) -> Self {
        if v {
            TriState::True
        } else {
            TriState::False
        }
    }
}

impl StreamType {
    /// Audio-carrying streams count against the single-audio policy.
    #[must_use]
    pub fn is_audio(self) -> bool {
        !matches!(self, StreamType::Screen)
    }
}

/// Priority attached to a Take or Borrow. Higher preempts lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TransferPriority(pub i64);

impl TransferPriority {
    pub const NOT_APPLICABLE: Self = Self(0);
    pub const NICE_TO_HAVE: Self = Self(100);
    pub const USER_INITIATED: Self = Self(500);
}

/// Opaque revocation condition carried with a claim. The arbiter never
/// interprets it; a [`crate::arbiter::ConstraintPolicy`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Constraint(pub i64);

impl Constraint {
    pub const NOT_APPLICABLE: Self = Self(0);
    pub const ANYTIME: Self = Self(100);
    pub const USER_INITIATED: Self = Self(500);
    pub const NEVER: Self = Self(1000);
}

/// One `ChangeResourceMode` request as carried in params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceChange {
    pub resource: ResourceId,
    pub transfer: TransferType,
    pub priority: TransferPriority,
    pub take_constraint: Constraint,
    pub borrow_constraint: Constraint,
    pub reason: Option<String>,
}

impl ResourceChange {
    #[must_use]
    pub fn new(resource: ResourceId, transfer: TransferType) -> Self {
        Self {
            resource,
            transfer,
            priority: TransferPriority::NOT_APPLICABLE,
            take_constraint: Constraint::NOT_APPLICABLE,
            borrow_constraint: Constraint::NOT_APPLICABLE,
            reason: None,
        }
    }

    #[must_use]
    pub fn take(resource: ResourceId, priority: TransferPriority) -> Self {
        Self::new(resource, TransferType::Take).with_priority(priority)
    }

    #[must_use]
    pub fn borrow(resource: ResourceId, priority: TransferPriority) -> Self {
        Self::new(resource, TransferType::Borrow).with_priority(priority)
    }

    #[must_use]
    pub fn untake(resource: ResourceId) -> Self {
        Self::new(resource, TransferType::Untake)
    }

    #[must_use]
    pub fn unborrow(resource: ResourceId) -> Self {
        Self::new(resource, TransferType::Unborrow)
    }

    #[must_use]
    pub fn with_priority(mut self, priority: TransferPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_constraints(mut self, take: Constraint, borrow: Constraint) -> Self {
        self.take_constraint = take;
        self.borrow_constraint = borrow;
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn to_params(&self) -> Dict {
        let mut params = Dict::new();
        params.insert(keys::RESOURCE_ID.to_string(), self.resource.into());
        params.insert(keys::TRANSFER_TYPE.to_string(), self.transfer.into());
        params.insert(
            keys::TRANSFER_PRIORITY.to_string(),
            Value::Integer(self.priority.0),
        );
        params.insert(
            keys::TAKE_CONSTRAINT.to_string(),
            Value::Integer(self.take_constraint.0),
        );
        params.insert(
            keys::BORROW_CONSTRAINT.to_string(),
            Value::Integer(self.borrow_constraint.0),
        );
        if let Some(reason) = &self.reason {
            params.insert(keys::REASON.to_string(), Value::from(reason.as_str()));
        }
        params
    }

    /// # Errors
    ///
    /// `InvalidParameter` if the resource or transfer type is missing or unknown.
    pub fn from_params(params: &Dict) -> Result<Self, ReceiverError> {
        Ok(Self {
            resource: ResourceId::from_i64(params.require_int(keys::RESOURCE_ID)?)?,
            transfer: TransferType::from_i64(params.require_int(keys::TRANSFER_TYPE)?)?,
            priority: TransferPriority(params.int_field(keys::TRANSFER_PRIORITY).unwrap_or(0)),
            take_constraint: Constraint(params.int_field(keys::TAKE_CONSTRAINT).unwrap_or(0)),
            borrow_constraint: Constraint(params.int_field(keys::BORROW_CONSTRAINT).unwrap_or(0)),
            reason: params.str_field(keys::REASON).map(str::to_string),
        })
    }
}

/// Accessory-side app-state change (`ChangeAppState`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppStateChange {
    pub phone_call: Option<TriState>,
    pub speech_mode: Option<SpeechMode>,
    pub turn_by_turn: Option<TriState>,
    pub reason: Option<String>,
}

impl AppStateChange {
    #[must_use]
    pub fn phone_call(active: bool) -> Self {
        Self {
            phone_call: Some(active.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn speech_mode(mode: SpeechMode) -> Self {
        Self {
            speech_mode: Some(mode),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn turn_by_turn(active: bool) -> Self {
        Self {
            turn_by_turn: Some(active.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn to_params(&self) -> Dict {
        let mut states = Vec::new();
        if let Some(state) = self.phone_call {
            states.push(Value::from(Dict::from([
                (keys::APP_STATE_ID.to_string(), AppStateId::PhoneCall.into()),
                (keys::STATE.to_string(), state.into()),
            ])));
        }
        if let Some(mode) = self.speech_mode {
            states.push(Value::from(Dict::from([
                (keys::APP_STATE_ID.to_string(), AppStateId::Speech.into()),
                (keys::SPEECH_MODE.to_string(), mode.into()),
            ])));
        }
        if let Some(state) = self.turn_by_turn {
            states.push(Value::from(Dict::from([
                (keys::APP_STATE_ID.to_string(), AppStateId::TurnByTurn.into()),
                (keys::STATE.to_string(), state.into()),
            ])));
        }

        let mut params = Dict::new();
        params.insert(keys::APP_STATES.to_string(), Value::Array(states));
        if let Some(reason) = &self.reason {
            params.insert(keys::REASON.to_string(), Value::from(reason.as_str()));
        }
        params
    }
}

/// Current owner of each resource and app state as last reported by the
/// controller in `modesChanged`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModeState {
    pub screen: Option<Entity>,
    pub main_audio: Option<Entity>,
    pub phone_call: Option<Entity>,
    pub speech: Option<Entity>,
    pub speech_mode: Option<SpeechMode>,
    pub turn_by_turn: Option<Entity>,
}

impl ModeState {
    /// Apply a `modesChanged` payload. Entries not mentioned keep their
    /// value. The update is all or nothing: on error `self` is unchanged.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if an entry names an unknown resource, app state or entity.
    pub fn apply(&mut self, params: &Dict) -> Result<(), ReceiverError> {
        let mut next = self.clone();
        next.apply_entries(params)?;
        *self = next;
        Ok(())
    }

    fn apply_entries(&mut self, params: &Dict) -> Result<(), ReceiverError> {
        for item in params.array_field(keys::RESOURCES).unwrap_or_default() {
            let entry = item.as_dict().ok_or_else(|| {
                ReceiverError::InvalidParameter("resources entries must be mappings".to_string())
            })?;
            let entity = entity_field(entry)?;
            match ResourceId::from_i64(entry.require_int(keys::RESOURCE_ID)?)? {
                ResourceId::MainScreen => self.screen = entity,
                ResourceId::MainAudio => self.main_audio = entity,
            }
        }

        for item in params.array_field(keys::APP_STATES).unwrap_or_default() {
            let entry = item.as_dict().ok_or_else(|| {
                ReceiverError::InvalidParameter("appStates entries must be mappings".to_string())
            })?;
            let entity = entity_field(entry)?;
            match AppStateId::from_i64(entry.require_int(keys::APP_STATE_ID)?)? {
                AppStateId::PhoneCall => self.phone_call = entity,
                AppStateId::TurnByTurn => self.turn_by_turn = entity,
                AppStateId::Speech => {
                    self.speech = entity;
                    self.speech_mode = entry
                        .int_field(keys::SPEECH_MODE)
                        .map(SpeechMode::from_i64)
                        .transpose()?;
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn to_dict(&self) -> Dict {
        let entity = |e: Option<Entity>| e.map_or(Value::Integer(0), Value::from);
        Dict::from([
            ("screen".to_string(), entity(self.screen)),
            ("mainAudio".to_string(), entity(self.main_audio)),
            ("phoneCall".to_string(), entity(self.phone_call)),
            ("speech".to_string(), entity(self.speech)),
            (
                keys::SPEECH_MODE.to_string(),
                self.speech_mode.map_or(Value::Integer(0), Value::from),
            ),
            ("turnByTurn".to_string(), entity(self.turn_by_turn)),
        ])
    }
}

/// `0` (or absence) means nobody owns it.
fn entity_field(entry: &Dict) -> Result<Option<Entity>, ReceiverError> {
    match entry.int_field(keys::ENTITY) {
        None | Some(0) => Ok(None),
        Some(v) => Entity::from_i64(v).map(Some),
    }
}
