//! Error types for the grainyard runtime.

use crate::catalog::ActivationState;
use crate::messaging::RejectionKind;
use grainyard_core::{GrainId, SiloAddress};
use thiserror::Error;

/// Errors surfaced to grain callers.
///
/// This is the error type a [`crate::grain::GrainRef`] call resolves to.
/// Routing-internal conditions (stale caches, transient network faults,
/// membership churn) are retried inside the runtime and never appear here;
/// what does appear is the taxonomy a caller can meaningfully react to.
#[derive(Debug, Error)]
pub enum CallError {
    /// The request deadline elapsed before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The grain method returned an error; delivered as the response body.
    #[error("application error: {0}")]
    Application(String),

    /// The target silo is shedding load or application turns are stopped.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// No method registered under the requested id.
    #[error("unknown method {method} on interface {interface}")]
    UnknownMethod { interface: u32, method: u32 },

    /// Definite routing failure; retrying will not help.
    #[error("routing failed: {0}")]
    Routing(#[from] DirectoryError),

    /// The target activation refused the work item (deactivating silo or
    /// activation).
    #[error("rejected: {0}")]
    Rejected(String),

    /// Request/response encoding failed.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Remote silo answered with a rejection the retry layer could not
    /// absorb.
    #[error("{kind:?} rejection: {reason}")]
    RemoteRejection { kind: RejectionKind, reason: String },

    /// Activation lifecycle failure (user initialization failed).
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Errors from directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// A request was forwarded more than the configured hop limit.
    #[error("directory hop limit exceeded after {hops} hops")]
    HopLimitExceeded { hops: u8 },

    /// No active silo owns the partition (empty ring).
    #[error("no active silo owns the partition")]
    NoOwner,

    /// The remote owner could not be reached; retried internally, surfaced
    /// only when retries are exhausted.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// A remote directory reply could not be decoded.
    #[error("malformed directory reply: {0}")]
    MalformedReply(String),

    /// Transient transport fault talking to the owner silo.
    #[error(transparent)]
    Transport(#[from] MessageError),
}

/// Errors from the local activation catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// `on_activate` failed; the reserved slot was torn down.
    #[error("activation failed: {0}")]
    ActivationFailed(String),

    /// Invalid lifecycle transition.
    #[error("invalid activation state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: ActivationState,
        to: ActivationState,
    },

    /// No grain class registered under this kind.
    #[error("unknown grain kind: {0}")]
    UnknownGrainKind(String),

    /// The activation is draining and accepts no new work.
    #[error("activation is deactivating: {0}")]
    Deactivating(GrainId),

    /// Directory registration failed while creating the activation.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Errors from message encoding and transport.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("frame decoding failed: {0}")]
    Decode(String),

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The destination silo is not reachable right now.
    #[error("silo unreachable: {0}")]
    Unreachable(SiloAddress),

    #[error("network i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from membership operations.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// The silo was not found in the membership table.
    #[error("silo not registered: {0}")]
    NotFound(SiloAddress),

    /// The provider stopped publishing updates.
    #[error("membership service closed")]
    Closed,
}

/// Errors from the per-activation scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Application turns are stopped silo-wide; system items still run.
    #[error("application turns stopped")]
    ApplicationTurnsStopped,

    /// The activation's queue is closed (deactivating or invalid).
    #[error("work queue closed")]
    QueueClosed,
}

/// Errors from silo lifecycle operations.
#[derive(Debug, Error)]
pub enum SiloError {
    #[error("invalid silo configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the client-facing gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown client: {0}")]
    UnknownClient(GrainId),

    #[error("client handshake failed: {0}")]
    HandshakeFailed(String),

    #[error(transparent)]
    Message(#[from] MessageError),
}
