//! Common data types for the accessory receiver.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a receiver session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when a device ID string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid device ID {0:?}: expected 6 hex bytes")]
pub struct DeviceIdParseError(pub String);

/// 48-bit hardware-style device identifier (`AA:BB:CC:DD:EE:FF`).
///
/// Used both for the accessory's own advertised identity and for the
/// client device ID a controller presents when it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; 6]);

impl DeviceId {
    /// The identifier as a big-endian integer.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
            .iter()
            .fold(0_u64, |acc, byte| (acc << 8) | u64::from(*byte))
    }

    /// Build an identifier from the low 48 bits of `value`.
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        let [_, _, a, b, c, d, e, f] = value.to_be_bytes();
        Self([a, b, c, d, e, f])
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| hex::encode_upper([*b])).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let decoded = hex::decode(&compact).map_err(|_| DeviceIdParseError(s.to_string()))?;
        let bytes: [u8; 6] = decoded
            .try_into()
            .map_err(|_| DeviceIdParseError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

/// Session identifier chosen by the controller (distinct from [`SessionId`],
/// which the receiver assigns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientSessionId(pub u64);

impl fmt::Display for ClientSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_parse_with_and_without_separators() {
        let colons: DeviceId = "00:1A:2b:3C:4d:5E".parse().unwrap();
        let bare: DeviceId = "001a2b3c4d5e".parse().unwrap();

        assert_eq!(colons, bare);
        assert_eq!(colons.to_string(), "00:1A:2B:3C:4D:5E");
    }

    #[test]
    fn test_device_id_rejects_wrong_length() {
        assert!("00:11:22".parse::<DeviceId>().is_err());
        assert!("zz:11:22:33:44:55".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_device_id_u64_conversion() {
        let id = DeviceId::from_u64(0x0011_2233_4455);
        assert_eq!(id.0, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(id.as_u64(), 0x0011_2233_4455);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
