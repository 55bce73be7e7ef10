//! Grain identity, independent of physical location.

use crate::stable_hash_32;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors related to [`GrainId`] parsing.
#[derive(Debug, Error)]
pub enum GrainIdError {
    /// Invalid GrainId format.
    #[error("invalid grain id format (expected 'namespace::kind/key')")]
    InvalidFormat,

    /// Empty field in GrainId.
    #[error("grain id field cannot be empty: {0}")]
    EmptyField(String),
}

/// Unique identifier for a virtual actor, stable across activations.
///
/// # Structure
///
/// - `namespace`: logical namespace for isolation (e.g. "prod", "staging")
/// - `kind`: grain class (e.g. "Thermostat", "BankAccount")
/// - `key`: unique key within namespace+kind (e.g. "roomA")
///
/// # String Format
///
/// `namespace::kind/key`, e.g. `prod::Thermostat/roomA`.
///
/// # Validation Rules
///
/// - All fields must be non-empty
/// - The identity never changes as the grain activates, deactivates, and
///   reactivates on different silos
///
/// # Hashing
///
/// [`GrainId::uniform_hash`] maps the identity into the same 32-bit space
/// as [`crate::SiloAddress::consistent_hash`]; the directory uses it to pick
/// the partition owner on the ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrainId {
    pub namespace: String,
    pub kind: String,
    pub key: String,
}

impl GrainId {
    /// Create a GrainId from individual parts.
    ///
    /// # Errors
    ///
    /// Returns [`GrainIdError::EmptyField`] if any field is empty.
    pub fn from_parts(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self, GrainIdError> {
        let namespace = namespace.into();
        let kind = kind.into();
        let key = key.into();

        if namespace.is_empty() {
            return Err(GrainIdError::EmptyField("namespace".to_string()));
        }
        if kind.is_empty() {
            return Err(GrainIdError::EmptyField("kind".to_string()));
        }
        if key.is_empty() {
            return Err(GrainIdError::EmptyField("key".to_string()));
        }

        Ok(Self {
            namespace,
            kind,
            key,
        })
    }

    /// Parse a GrainId from the canonical `namespace::kind/key` rendering.
    ///
    /// # Errors
    ///
    /// Returns [`GrainIdError::InvalidFormat`] when separators are missing.
    pub fn parse(s: &str) -> Result<Self, GrainIdError> {
        let (namespace, rest) = s.split_once("::").ok_or(GrainIdError::InvalidFormat)?;
        let (kind, key) = rest.split_once('/').ok_or(GrainIdError::InvalidFormat)?;
        Self::from_parts(namespace, kind, key)
    }

    /// Stable 32-bit hash used for partition-owner selection.
    ///
    /// Uniform over the same space as silo consistent hashes.
    pub fn uniform_hash(&self) -> u32 {
        stable_hash_32(self.to_string().as_str())
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}/{}", self.namespace, self.kind, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_and_display() {
        let id = GrainId::from_parts("prod", "Thermostat", "roomA").unwrap();
        assert_eq!(id.to_string(), "prod::Thermostat/roomA");
    }

    #[test]
    fn test_parse_roundtrip() {
        let id = GrainId::parse("prod::Thermostat/roomA").unwrap();
        assert_eq!(id.namespace, "prod");
        assert_eq!(id.kind, "Thermostat");
        assert_eq!(id.key, "roomA");
        assert_eq!(GrainId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            GrainId::parse("no-separator"),
            Err(GrainIdError::InvalidFormat)
        ));
        assert!(matches!(
            GrainId::parse("prod::missing-slash"),
            Err(GrainIdError::InvalidFormat)
        ));
        assert!(matches!(
            GrainId::parse("::Thermostat/roomA"),
            Err(GrainIdError::EmptyField(_))
        ));
    }

    #[test]
    fn test_empty_fields_rejected() {
        assert!(GrainId::from_parts("", "Kind", "key").is_err());
        assert!(GrainId::from_parts("ns", "", "key").is_err());
        assert!(GrainId::from_parts("ns", "Kind", "").is_err());
    }

    #[test]
    fn test_uniform_hash_stability() {
        let a = GrainId::from_parts("prod", "Thermostat", "roomA").unwrap();
        let b = GrainId::parse("prod::Thermostat/roomA").unwrap();
        assert_eq!(a.uniform_hash(), b.uniform_hash());

        let c = GrainId::from_parts("prod", "Thermostat", "roomB").unwrap();
        assert_ne!(a.uniform_hash(), c.uniform_hash());
    }
}
