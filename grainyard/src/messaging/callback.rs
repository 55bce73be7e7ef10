//! Callback data for request-response correlation.
//!
//! A pending request is tracked by a [`CallbackData`] holding the oneshot
//! sender that completes the caller's future. Responses, rejections,
//! timeouts, and transport errors all funnel through `complete()`, which is
//! idempotent: the first completion wins, later ones are dropped (the late
//! response after a timeout, the timeout after a response).

use crate::error::CallError;
use crate::messaging::Message;
use grainyard_core::CorrelationId;
use std::cell::Cell;
use std::time::Instant;
use tokio::sync::oneshot;

/// State of one pending request awaiting its response.
pub struct CallbackData {
    /// Target grain of the original request, for diagnostics.
    target: String,
    sender: Cell<Option<oneshot::Sender<Result<Message, CallError>>>>,
    issued_at: Instant,
    completed: Cell<bool>,
}

impl CallbackData {
    pub fn new(request: &Message, sender: oneshot::Sender<Result<Message, CallError>>) -> Self {
        Self {
            target: request.target_grain.to_string(),
            sender: Cell::new(Some(sender)),
            issued_at: Instant::now(),
            completed: Cell::new(false),
        }
    }

    /// Time since the request was issued.
    pub fn elapsed(&self) -> std::time::Duration {
        self.issued_at.elapsed()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.get()
    }

    /// Complete the pending request. Idempotent; only the first completion
    /// reaches the caller.
    pub fn complete(&self, result: Result<Message, CallError>) {
        if self.completed.replace(true) {
            return;
        }
        if let Some(sender) = self.sender.take() {
            if sender.send(result).is_err() {
                // Caller gave up (dropped the receiver); nothing to deliver.
                tracing::debug!(target_grain = %self.target, "response receiver dropped");
            }
        }
    }

    /// Complete with a timeout error.
    pub fn on_timeout(&self) {
        self.complete(Err(CallError::Timeout));
    }

    /// Complete with an arbitrary error.
    pub fn on_error(&self, error: CallError) {
        self.complete(Err(error));
    }
}

/// Monotonic correlation-id source, one per silo.
#[derive(Debug)]
pub struct CorrelationIdFactory {
    next_id: Cell<u64>,
}

impl CorrelationIdFactory {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
        }
    }

    pub fn next(&self) -> CorrelationId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        CorrelationId::new(id)
    }
}

impl Default for CorrelationIdFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use grainyard_core::{GrainId, SiloAddress};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    fn sample_request() -> Message {
        Message::request(
            CorrelationId::new(1),
            SiloAddress::new(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000),
                1,
            ),
            GrainId::from_parts("test", "Caller", "a").unwrap(),
            GrainId::from_parts("test", "Callee", "b").unwrap(),
            1,
            1,
            Bytes::new(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_complete_delivers_response() {
        let (tx, rx) = oneshot::channel();
        let request = sample_request();
        let callback = CallbackData::new(&request, tx);

        callback.complete(Ok(Message::response(&request, Bytes::from_static(b"ok"))));
        assert!(callback.is_completed());

        let result = rx.await.unwrap();
        assert_eq!(&result.unwrap().body[..], b"ok");
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let (tx, rx) = oneshot::channel();
        let request = sample_request();
        let callback = CallbackData::new(&request, tx);

        callback.complete(Ok(Message::response(&request, Bytes::from_static(b"first"))));
        callback.on_timeout();
        callback.on_error(CallError::Rejected("late".into()));

        let result = rx.await.unwrap();
        assert_eq!(&result.unwrap().body[..], b"first");
    }

    #[tokio::test]
    async fn test_timeout_completion() {
        let (tx, rx) = oneshot::channel();
        let callback = CallbackData::new(&sample_request(), tx);

        callback.on_timeout();
        assert!(matches!(rx.await.unwrap(), Err(CallError::Timeout)));
    }

    #[test]
    fn test_correlation_ids_are_monotonic() {
        let factory = CorrelationIdFactory::new();
        let a = factory.next();
        let b = factory.next();
        let c = factory.next();
        assert!(a < b && b < c);
        assert_eq!(a, CorrelationId::new(1));
    }
}
