//! Silo addressing: endpoint plus startup generation.

use crate::stable_hash_32;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors related to [`SiloAddress`] parsing.
#[derive(Debug, Error)]
pub enum SiloAddressError {
    /// Invalid address format.
    #[error("invalid silo address format (expected 'host:port@generation')")]
    InvalidFormat,

    /// Invalid network endpoint.
    #[error("invalid network endpoint: {0}")]
    InvalidEndpoint(String),

    /// Invalid generation number.
    #[error("invalid generation: {0}")]
    InvalidGeneration(String),
}

/// Identity of one silo process: a network endpoint and a generation.
///
/// # Structure
///
/// - `endpoint`: the socket address the silo listens on
/// - `generation`: monotonically increasing integer chosen at startup
///
/// Two silos at the same endpoint with different generations are distinct,
/// non-equivalent members: a restarted process never impersonates its
/// predecessor.
///
/// # String Format
///
/// `host:port@generation`, e.g. `127.0.0.1:5000@3`.
///
/// # Invariants
///
/// - Equality and hashing cover both endpoint and generation
/// - `consistent_hash()` is stable across processes and releases
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiloAddress {
    /// Network endpoint the silo listens on.
    pub endpoint: SocketAddr,
    /// Startup generation; higher generations supersede lower ones at the
    /// same endpoint.
    pub generation: u64,
}

impl SiloAddress {
    /// Create a new silo address.
    pub fn new(endpoint: SocketAddr, generation: u64) -> Self {
        Self {
            endpoint,
            generation,
        }
    }

    /// Parse from the canonical `host:port@generation` rendering.
    ///
    /// # Errors
    ///
    /// Returns [`SiloAddressError`] when the separator is missing or either
    /// half fails to parse.
    pub fn parse(s: &str) -> Result<Self, SiloAddressError> {
        let (endpoint, generation) = s.split_once('@').ok_or(SiloAddressError::InvalidFormat)?;
        let endpoint: SocketAddr = endpoint
            .parse()
            .map_err(|_| SiloAddressError::InvalidEndpoint(endpoint.to_string()))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| SiloAddressError::InvalidGeneration(generation.to_string()))?;
        Ok(Self {
            endpoint,
            generation,
        })
    }

    /// Stable 32-bit hash used for consistent-hash ring placement.
    ///
    /// Computed over the canonical string rendering so that every member of
    /// the cluster derives the same ring position for this address.
    pub fn consistent_hash(&self) -> u32 {
        stable_hash_32(self.to_string().as_str())
    }

    /// True when `other` is the same endpoint at a different generation.
    ///
    /// Used by membership to detect a restarted silo superseding its
    /// previous incarnation.
    pub fn is_successor_of(&self, other: &SiloAddress) -> bool {
        self.endpoint == other.endpoint && self.generation > other.generation
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn silo(port: u16, generation: u64) -> SiloAddress {
        SiloAddress::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            generation,
        )
    }

    #[test]
    fn test_display_roundtrip() {
        let addr = silo(5000, 3);
        let rendered = addr.to_string();
        assert_eq!(rendered, "127.0.0.1:5000@3");
        assert_eq!(SiloAddress::parse(&rendered).unwrap(), addr);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            SiloAddress::parse("127.0.0.1:5000"),
            Err(SiloAddressError::InvalidFormat)
        ));
        assert!(matches!(
            SiloAddress::parse("not-an-addr@1"),
            Err(SiloAddressError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            SiloAddress::parse("127.0.0.1:5000@banana"),
            Err(SiloAddressError::InvalidGeneration(_))
        ));
    }

    #[test]
    fn test_generations_are_distinct_silos() {
        let old = silo(5000, 1);
        let new = silo(5000, 2);
        assert_ne!(old, new);
        assert!(new.is_successor_of(&old));
        assert!(!old.is_successor_of(&new));
        assert!(!new.is_successor_of(&new));
    }

    #[test]
    fn test_consistent_hash_is_stable() {
        let a = silo(5000, 1);
        let b = silo(5000, 1);
        assert_eq!(a.consistent_hash(), b.consistent_hash());

        // Different generation lands elsewhere on the ring.
        let c = silo(5000, 2);
        assert_ne!(a.consistent_hash(), c.consistent_hash());
    }

    #[test]
    fn test_serde_roundtrip() {
        let addr = silo(5000, 7);
        let json = serde_json::to_string(&addr).unwrap();
        let back: SiloAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(addr, back);
    }
}
