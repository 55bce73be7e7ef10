//! Messaging: message types, wire envelope, correlation, dispatch,
//! transport.

mod callback;
mod center;
mod envelope;
mod message;
mod transport;

pub use callback::{CallbackData, CorrelationIdFactory};
pub use center::{ClientRouter, MessageCenter};
pub use envelope::{Envelope, MAX_FRAME_SIZE};
pub use message::{Direction, Message, MessageFlags, RejectionInfo, RejectionKind};
pub use transport::{InProcessNetwork, SiloTransport, TcpTransport};

use crate::error::CallError;
use bytes::Bytes;

/// Encode a turn outcome as a response body.
///
/// Application errors travel inside the body; the caller observes them as
/// a normal failed call, not a transport fault.
pub fn encode_turn_body(outcome: &Result<serde_json::Value, String>) -> Bytes {
    match serde_json::to_vec(outcome) {
        Ok(bytes) => Bytes::from(bytes),
        Err(error) => {
            // Value-to-bytes can only fail on pathological map keys; fall
            // back to an error body rather than dropping the response.
            let fallback: Result<serde_json::Value, String> =
                Err(format!("response encoding failed: {error}"));
            Bytes::from(serde_json::to_vec(&fallback).unwrap_or_default())
        }
    }
}

/// Decode a response body produced by [`encode_turn_body`].
pub fn decode_turn_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, CallError> {
    let outcome: Result<serde_json::Value, String> = serde_json::from_slice(body)
        .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e)))?;
    match outcome {
        Ok(value) => serde_json::from_value(value)
            .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e))),
        Err(message) => Err(CallError::Application(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_body_ok_roundtrip() {
        let body = encode_turn_body(&Ok(serde_json::json!({"reading": 22})));
        #[derive(serde::Deserialize)]
        struct Reading {
            reading: i32,
        }
        let decoded: Reading = decode_turn_body(&body).unwrap();
        assert_eq!(decoded.reading, 22);
    }

    #[test]
    fn test_turn_body_error_surfaces_as_application() {
        let body = encode_turn_body(&Err("thermostat offline".to_string()));
        let result: Result<i32, CallError> = decode_turn_body(&body);
        match result {
            Err(CallError::Application(message)) => assert_eq!(message, "thermostat offline"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
