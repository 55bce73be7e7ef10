//! Correlation ids for request/response matching.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier matching a response to its originating request.
///
/// Unique per sending silo; the pair (sender silo, correlation id) is unique
/// cluster-wide.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corr-{}", self.0)
    }
}
