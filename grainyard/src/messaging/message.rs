//! Message types for grain communication.

use bitflags::bitflags;
use bytes::Bytes;
use grainyard_core::{CorrelationId, GrainId, SiloAddress};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Message flow semantics and response expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Expects a response matched by correlation id; carries a deadline.
    Request,
    /// Completes the pending request with the same correlation id.
    Response,
    /// Fire-and-forget; no correlation tracking, best-effort delivery.
    OneWay,
    /// Negative response: the runtime refused or failed to route.
    Rejection,
}

/// Why a message was rejected.
///
/// `CacheInvalidation` is the only kind the sending runtime absorbs and
/// retries; the rest surface to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionKind {
    /// Worth retrying after a membership refresh.
    Transient,
    /// Definite failure; retrying will not help.
    Unrecoverable,
    /// Load shedding or stopped application turns.
    Overloaded,
    /// The sender's cached activation address is stale; evict and retry.
    CacheInvalidation,
}

bitflags! {
    /// Control flags for message processing behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u16 {
        /// Does not mutate grain state; interleavable with other read-only
        /// turns.
        const READ_ONLY = 1 << 0;

        /// May interleave with any turn, even on non-reentrant grains.
        const ALWAYS_INTERLEAVE = 1 << 1;

        /// Must not be forwarded to another silo.
        const IS_LOCAL_ONLY = 1 << 2;

        /// Does not extend the activation's idle clock.
        const SUPPRESS_KEEP_ALIVE = 1 << 3;
    }
}

impl Serialize for MessageFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(MessageFlags::from_bits_truncate(u16::deserialize(
            deserializer,
        )?))
    }
}

/// Rejection payload attached to `Direction::Rejection` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionInfo {
    pub kind: RejectionKind,
    pub reason: String,
}

/// Unit of communication between grains, silos, and clients.
///
/// # Structure
///
/// Addressing (`sender_silo`/`sender_grain`, `target_silo`/`target_grain`),
/// dispatch (`interface_id`, `method_id`), correlation, routing bookkeeping
/// (`hop_count`, `retry_count`, `cache_etag`), and an opaque `body`
/// produced by the serialization collaborator.
///
/// # Invariants
///
/// - A `Request` always has `time_to_expiry` on the sending silo
/// - A `Response`/`Rejection` swaps target and sender from the request and
///   copies its correlation id
/// - `target_silo` may be `None` only until the dispatcher resolves it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub correlation_id: CorrelationId,
    pub direction: Direction,

    pub sender_silo: SiloAddress,
    pub sender_grain: GrainId,
    /// Unset on the first hop, resolved by the dispatcher.
    pub target_silo: Option<SiloAddress>,
    pub target_grain: GrainId,

    pub interface_id: u32,
    pub method_id: u32,
    pub flags: MessageFlags,

    /// Directory forwarding hops consumed so far.
    pub hop_count: u8,
    /// Cache-invalidation retries consumed so far.
    pub retry_count: u8,
    /// Etag of the cached resolution this message was routed by.
    pub cache_etag: Option<u64>,

    /// Present on `Rejection` frames.
    pub rejection: Option<RejectionInfo>,

    /// Opaque application payload.
    #[serde(with = "body_bytes")]
    pub body: Bytes,

    /// Deadline, computed on the sending silo; never serialized.
    #[serde(skip)]
    pub time_to_expiry: Option<Instant>,
}

mod body_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        Ok(Bytes::from(Vec::<u8>::deserialize(deserializer)?))
    }
}

impl Message {
    /// Create a request message.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        correlation_id: CorrelationId,
        sender_silo: SiloAddress,
        sender_grain: GrainId,
        target_grain: GrainId,
        interface_id: u32,
        method_id: u32,
        body: Bytes,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            correlation_id,
            direction: Direction::Request,
            sender_silo,
            sender_grain,
            target_silo: None,
            target_grain,
            interface_id,
            method_id,
            flags: MessageFlags::empty(),
            hop_count: 0,
            retry_count: 0,
            cache_etag: None,
            rejection: None,
            body,
            time_to_expiry: Some(Instant::now() + timeout),
        }
    }

    /// Create a one-way message (fire-and-forget).
    pub fn oneway(
        sender_silo: SiloAddress,
        sender_grain: GrainId,
        target_grain: GrainId,
        interface_id: u32,
        method_id: u32,
        body: Bytes,
    ) -> Self {
        Self {
            correlation_id: CorrelationId::default(),
            direction: Direction::OneWay,
            sender_silo,
            sender_grain,
            target_silo: None,
            target_grain,
            interface_id,
            method_id,
            flags: MessageFlags::empty(),
            hop_count: 0,
            retry_count: 0,
            cache_etag: None,
            rejection: None,
            body,
            time_to_expiry: None,
        }
    }

    /// Create the response to a request, swapping target and sender.
    pub fn response(request: &Message, body: Bytes) -> Self {
        Self {
            correlation_id: request.correlation_id,
            direction: Direction::Response,
            sender_silo: request
                .target_silo
                .clone()
                .unwrap_or_else(|| request.sender_silo.clone()),
            sender_grain: request.target_grain.clone(),
            target_silo: Some(request.sender_silo.clone()),
            target_grain: request.sender_grain.clone(),
            interface_id: request.interface_id,
            method_id: request.method_id,
            flags: MessageFlags::empty(),
            hop_count: 0,
            retry_count: 0,
            cache_etag: None,
            rejection: None,
            body,
            time_to_expiry: None,
        }
    }

    /// Create a rejection for a request.
    ///
    /// Copies the request's `cache_etag` so the sender can evict exactly
    /// the cached resolution that led it here.
    pub fn rejection(request: &Message, kind: RejectionKind, reason: impl Into<String>) -> Self {
        let mut rejection = Self::response(request, Bytes::new());
        rejection.direction = Direction::Rejection;
        rejection.cache_etag = request.cache_etag;
        rejection.rejection = Some(RejectionInfo {
            kind,
            reason: reason.into(),
        });
        rejection
    }

    /// True when this frame expects a response.
    pub fn expects_response(&self) -> bool {
        self.direction == Direction::Request
    }

    /// True when the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.time_to_expiry
            .map(|expiry| Instant::now() > expiry)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grainyard_core::GrainId;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            1,
        )
    }

    fn grain(key: &str) -> GrainId {
        GrainId::from_parts("test", "Counter", key).unwrap()
    }

    fn request() -> Message {
        let mut msg = Message::request(
            CorrelationId::new(7),
            silo(5000),
            grain("caller"),
            grain("callee"),
            10,
            2,
            Bytes::from_static(b"{}"),
            Duration::from_secs(30),
        );
        msg.target_silo = Some(silo(5001));
        msg
    }

    #[test]
    fn test_request_has_deadline() {
        let msg = request();
        assert_eq!(msg.direction, Direction::Request);
        assert!(msg.time_to_expiry.is_some());
        assert!(!msg.is_expired());
        assert!(msg.expects_response());
    }

    #[test]
    fn test_response_swaps_addressing() {
        let req = request();
        let resp = Message::response(&req, Bytes::from_static(b"ok"));

        assert_eq!(resp.direction, Direction::Response);
        assert_eq!(resp.correlation_id, req.correlation_id);
        assert_eq!(resp.target_silo, Some(req.sender_silo.clone()));
        assert_eq!(resp.target_grain, req.sender_grain);
        assert_eq!(resp.sender_grain, req.target_grain);
        assert_eq!(resp.sender_silo, silo(5001));
    }

    #[test]
    fn test_rejection_copies_cache_etag() {
        let mut req = request();
        req.cache_etag = Some(42);

        let rejection = Message::rejection(&req, RejectionKind::CacheInvalidation, "stale");
        assert_eq!(rejection.direction, Direction::Rejection);
        assert_eq!(rejection.cache_etag, Some(42));
        let info = rejection.rejection.unwrap();
        assert_eq!(info.kind, RejectionKind::CacheInvalidation);
        assert_eq!(info.reason, "stale");
    }

    #[test]
    fn test_oneway_has_no_deadline() {
        let msg = Message::oneway(
            silo(5000),
            grain("caller"),
            grain("callee"),
            10,
            3,
            Bytes::new(),
        );
        assert_eq!(msg.direction, Direction::OneWay);
        assert!(msg.time_to_expiry.is_none());
        assert!(!msg.expects_response());
    }

    #[test]
    fn test_flags_roundtrip_bits() {
        let flags = MessageFlags::READ_ONLY | MessageFlags::ALWAYS_INTERLEAVE;
        assert!(flags.contains(MessageFlags::READ_ONLY));
        assert_eq!(MessageFlags::from_bits_truncate(flags.bits()), flags);
    }
}
