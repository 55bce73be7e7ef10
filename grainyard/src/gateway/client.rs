//! Client-side connection to a gateway.

use crate::error::{CallError, GatewayError};
use crate::gateway::{gateway_target, GATEWAY_INTERFACE_ID, HANDSHAKE_METHOD_ID};
use crate::messaging::{decode_turn_body, Direction, Envelope, Message};
use grainyard_core::{CorrelationId, GrainId, SiloAddress};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// A client process's connection to one gateway.
///
/// Connects, handshakes with a client grain identity, then multiplexes
/// request/response traffic over the socket. Frames are identical in
/// structure to silo-to-silo frames; the gateway fills in the
/// silo-internal routing fields.
pub struct ClientConnection {
    client_id: GrainId,
    gateway: SiloAddress,
    outbound: mpsc::Sender<Message>,
    pending: Rc<RefCell<HashMap<CorrelationId, oneshot::Sender<Message>>>>,
    next_correlation: Cell<u64>,
    response_timeout: Duration,
}

impl ClientConnection {
    /// Connect and perform the identity handshake.
    pub async fn connect(
        endpoint: SocketAddr,
        client_id: GrainId,
        response_timeout: Duration,
    ) -> Result<Rc<Self>, GatewayError> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(crate::error::MessageError::Io)?;
        let (mut read_half, mut write_half) = stream.into_split();

        // The handshake declares who we are; a placeholder silo address
        // stands in until the gateway advertises its own.
        let placeholder = SiloAddress::new(endpoint, 0);
        let handshake = Message::request(
            CorrelationId::new(0),
            placeholder,
            client_id.clone(),
            gateway_target(),
            GATEWAY_INTERFACE_ID,
            HANDSHAKE_METHOD_ID,
            bytes::Bytes::new(),
            response_timeout,
        );
        Envelope::write_frame(&mut write_half, &handshake)
            .await
            .map_err(GatewayError::Message)?;

        let reply = Envelope::read_frame(&mut read_half)
            .await
            .map_err(GatewayError::Message)?;
        let advertised: String = decode_turn_body(&reply.body)
            .map_err(|e| GatewayError::HandshakeFailed(e.to_string()))?;
        let gateway = SiloAddress::parse(&advertised)
            .map_err(|e| GatewayError::HandshakeFailed(e.to_string()))?;

        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(64);
        let pending: Rc<RefCell<HashMap<CorrelationId, oneshot::Sender<Message>>>> =
            Rc::new(RefCell::new(HashMap::new()));

        // Writer task.
        tokio::task::spawn_local(async move {
            while let Some(message) = outbound_rx.recv().await {
                if Envelope::write_frame(&mut write_half, &message).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: complete pending calls by correlation id.
        let reader_pending = pending.clone();
        tokio::task::spawn_local(async move {
            loop {
                match Envelope::read_frame(&mut read_half).await {
                    Ok(message) => {
                        let waiter = reader_pending.borrow_mut().remove(&message.correlation_id);
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(message);
                            }
                            None => tracing::debug!(
                                correlation = %message.correlation_id,
                                "unsolicited frame from gateway"
                            ),
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Rc::new(Self {
            client_id,
            gateway,
            outbound,
            pending,
            next_correlation: Cell::new(1),
            response_timeout,
        }))
    }

    /// The gateway's advertised silo address.
    pub fn gateway_address(&self) -> &SiloAddress {
        &self.gateway
    }

    pub fn client_id(&self) -> &GrainId {
        &self.client_id
    }

    fn correlation(&self) -> CorrelationId {
        let id = self.next_correlation.get();
        self.next_correlation.set(id + 1);
        CorrelationId::new(id)
    }

    /// Invoke a grain method through the gateway and await the response.
    pub async fn call<Req, Res>(
        &self,
        target: GrainId,
        interface_id: u32,
        method_id: u32,
        request: &Req,
    ) -> Result<Res, CallError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)
            .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e)))?;
        let mut message = Message::request(
            self.correlation(),
            self.gateway.clone(),
            self.client_id.clone(),
            target,
            interface_id,
            method_id,
            body.into(),
            self.response_timeout,
        );
        message.time_to_expiry = None;

        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(message.correlation_id, tx);
        let correlation = message.correlation_id;

        if self.outbound.send(message).await.is_err() {
            self.pending.borrow_mut().remove(&correlation);
            return Err(CallError::Rejected("gateway connection closed".into()));
        }

        let reply = match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(CallError::Rejected("connection reader gone".into())),
            Err(_) => {
                self.pending.borrow_mut().remove(&correlation);
                return Err(CallError::Timeout);
            }
        };
        match reply.direction {
            Direction::Response => decode_turn_body(&reply.body),
            Direction::Rejection => {
                let info = reply
                    .rejection
                    .unwrap_or_else(|| crate::messaging::RejectionInfo {
                        kind: crate::messaging::RejectionKind::Unrecoverable,
                        reason: "rejection without info".into(),
                    });
                Err(CallError::RemoteRejection {
                    kind: info.kind,
                    reason: info.reason,
                })
            }
            other => Err(CallError::Rejected(format!(
                "unexpected frame direction {other:?}"
            ))),
        }
    }

    /// Fire-and-forget invocation through the gateway.
    pub async fn send<Req: Serialize>(
        &self,
        target: GrainId,
        interface_id: u32,
        method_id: u32,
        request: &Req,
    ) -> Result<(), CallError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e)))?;
        let mut message = Message::oneway(
            self.gateway.clone(),
            self.client_id.clone(),
            target,
            interface_id,
            method_id,
            body.into(),
        );
        message.correlation_id = self.correlation();
        self.outbound
            .send(message)
            .await
            .map_err(|_| CallError::Rejected("gateway connection closed".into()))
    }
}
