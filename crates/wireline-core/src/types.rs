//! Core types for the Wireline client
//!
//! This module defines the fundamental types used throughout the client,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ValidationError, WirelineError};

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// An identity string the daemon uses to address an account: either a phone
/// number (`+` followed by digits) or a UUID. A single contact may be known
/// under both forms; [`crate::registry::ContactRegistry::same_contact`]
/// resolves equality across them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Number(String),
    Uuid(String),
}

impl Serialize for Identity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Identity::parse(&value).map_err(serde::de::Error::custom)
    }
}

impl Identity {
    /// Parse and validate an identity string.
    pub fn parse(value: &str) -> Result<Self, WirelineError> {
        if let Some(digits) = value.strip_prefix('+') {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return Ok(Identity::Number(value.to_string()));
            }
        }
        if Uuid::parse_str(value).is_ok() {
            return Ok(Identity::Uuid(value.to_ascii_lowercase()));
        }
        Err(ValidationError::InvalidIdentity {
            value: value.to_string(),
        }
        .into())
    }

    /// The identity string as the daemon expects it.
    pub fn as_str(&self) -> &str {
        match self {
            Identity::Number(s) => s,
            Identity::Uuid(s) => s,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Identity::Number(_))
    }

    pub fn is_uuid(&self) -> bool {
        matches!(self, Identity::Uuid(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Identity {
    type Err = WirelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identity::parse(s)
    }
}

// ----------------------------------------------------------------------------
// Group Identifier
// ----------------------------------------------------------------------------

/// Opaque group identifier as issued by the daemon (base64 text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Device Identifier
// ----------------------------------------------------------------------------

/// Per-account device number. The primary device is always id 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DeviceId(u64);

impl DeviceId {
    /// The primary (provisioning) device.
    pub const PRIMARY: Self = Self(1);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_primary(&self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch, matching the daemon's wire format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get current timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_parses_numbers() {
        let id = Identity::parse("+15551234567").unwrap();
        assert!(id.is_number());
        assert_eq!(id.as_str(), "+15551234567");
    }

    #[test]
    fn identity_parses_uuids() {
        let id = Identity::parse("C3B8E1B4-2F5C-4F7A-9D3E-0A1B2C3D4E5F").unwrap();
        assert!(id.is_uuid());
        // UUIDs are normalized to lowercase.
        assert_eq!(id.as_str(), "c3b8e1b4-2f5c-4f7a-9d3e-0a1b2c3d4e5f");
    }

    #[test]
    fn identity_rejects_malformed_strings() {
        assert!(Identity::parse("").is_err());
        assert!(Identity::parse("+").is_err());
        assert!(Identity::parse("+555abc").is_err());
        assert!(Identity::parse("15551234567").is_err());
        assert!(Identity::parse("not-a-uuid").is_err());
    }

    #[test]
    fn identity_serializes_as_plain_string() {
        let id = Identity::parse("+15551234567").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"+15551234567\"");
    }

    #[test]
    fn device_id_primary() {
        assert!(DeviceId::PRIMARY.is_primary());
        assert!(!DeviceId::new(2).is_primary());
    }

    #[test]
    fn timestamp_ordering() {
        let a = Timestamp::new(1_000);
        let b = Timestamp::new(2_000);
        assert!(a < b);
        assert_eq!(b.duration_since(a).as_millis(), 1_000);
    }
}
