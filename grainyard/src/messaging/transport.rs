//! Silo-to-silo links: in-process for simulation, TCP for deployment.

use crate::error::MessageError;
use crate::messaging::{Envelope, Message, MessageCenter};
use async_trait::async_trait;
use grainyard_core::SiloAddress;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Outbound half of a silo link.
///
/// Inbound delivery goes straight into the message center the transport
/// was started with.
#[async_trait(?Send)]
pub trait SiloTransport {
    /// Send one message toward a destination silo.
    ///
    /// `Err(MessageError::Unreachable)` is the transient "can't talk to it
    /// right now" signal the routing layer retries on.
    async fn send(&self, destination: &SiloAddress, message: Message) -> Result<(), MessageError>;
}

/// Shared in-process network connecting every silo in one process.
///
/// The multi-silo simulation fabric: all message centers register here,
/// and `send` hops messages between them on the local executor. Links can
/// be cut per-silo to exercise transient-fault paths.
#[derive(Default)]
pub struct InProcessNetwork {
    centers: RefCell<HashMap<SiloAddress, Rc<MessageCenter>>>,
    unreachable: RefCell<HashSet<SiloAddress>>,
}

impl InProcessNetwork {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Attach a silo's message center to the fabric.
    pub fn attach(&self, silo: SiloAddress, center: Rc<MessageCenter>) {
        self.centers.borrow_mut().insert(silo, center);
    }

    /// Detach a silo (process death).
    pub fn detach(&self, silo: &SiloAddress) {
        self.centers.borrow_mut().remove(silo);
    }

    /// Cut every link to a silo.
    pub fn isolate(&self, silo: &SiloAddress) {
        self.unreachable.borrow_mut().insert(silo.clone());
    }

    /// Restore links to a silo.
    pub fn heal(&self, silo: &SiloAddress) {
        self.unreachable.borrow_mut().remove(silo);
    }
}

#[async_trait(?Send)]
impl SiloTransport for InProcessNetwork {
    async fn send(&self, destination: &SiloAddress, message: Message) -> Result<(), MessageError> {
        if self.unreachable.borrow().contains(destination) {
            return Err(MessageError::Unreachable(destination.clone()));
        }
        let center = self
            .centers
            .borrow()
            .get(destination)
            .cloned()
            .ok_or_else(|| MessageError::Unreachable(destination.clone()))?;

        // Frames cross a codec boundary even in-process, so wire-format
        // bugs surface in simulation and deadlines stay sender-local.
        let frame = Envelope::encode(&message)?;
        tokio::task::spawn_local(async move {
            match Envelope::decode(&frame) {
                Ok(message) => center.deliver(message).await,
                Err(error) => tracing::error!(%error, "in-process frame decode failed"),
            }
        });
        Ok(())
    }
}

/// TCP transport: one outbound connection per peer, length-prefixed
/// envelope frames.
pub struct TcpTransport {
    local: SiloAddress,
    connections: RefCell<HashMap<SiloAddress, mpsc::Sender<Message>>>,
    center: RefCell<Option<Rc<MessageCenter>>>,
}

impl TcpTransport {
    pub fn new(local: SiloAddress) -> Rc<Self> {
        Rc::new(Self {
            local,
            connections: RefCell::new(HashMap::new()),
            center: RefCell::new(None),
        })
    }

    /// Wire the inbound sink (runtime startup).
    pub fn set_center(&self, center: Rc<MessageCenter>) {
        *self.center.borrow_mut() = Some(center);
    }

    /// Accept inbound silo connections on `listener`.
    pub fn start_listener(self: &Rc<Self>, listener: TcpListener) {
        let transport = self.clone();
        tokio::task::spawn_local(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "inbound silo connection");
                        transport.clone().spawn_reader(stream);
                    }
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_reader(self: Rc<Self>, stream: TcpStream) {
        tokio::task::spawn_local(async move {
            let mut reader = stream;
            loop {
                match Envelope::read_frame(&mut reader).await {
                    Ok(message) => {
                        let Some(center) = self.center.borrow().clone() else {
                            tracing::error!("inbound frame before center wired");
                            continue;
                        };
                        tokio::task::spawn_local(async move {
                            center.deliver(message).await;
                        });
                    }
                    Err(MessageError::Io(error))
                        if error.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "silo link read failed");
                        break;
                    }
                }
            }
        });
    }

    /// Get or open the outbound pipe to a peer.
    async fn pipe_to(&self, destination: &SiloAddress) -> Result<mpsc::Sender<Message>, MessageError> {
        if let Some(sender) = self.connections.borrow().get(destination) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }

        let stream = TcpStream::connect(destination.endpoint)
            .await
            .map_err(|_| MessageError::Unreachable(destination.clone()))?;
        let (sender, mut receiver) = mpsc::channel::<Message>(256);
        self.connections
            .borrow_mut()
            .insert(destination.clone(), sender.clone());

        let peer = destination.clone();
        tokio::task::spawn_local(async move {
            let mut writer = stream;
            while let Some(message) = receiver.recv().await {
                if let Err(error) = Envelope::write_frame(&mut writer, &message).await {
                    tracing::warn!(peer = %peer, %error, "silo link write failed");
                    break;
                }
            }
        });

        tracing::debug!(local = %self.local, peer = %destination, "outbound silo connection opened");
        Ok(sender)
    }
}

#[async_trait(?Send)]
impl SiloTransport for TcpTransport {
    async fn send(&self, destination: &SiloAddress, message: Message) -> Result<(), MessageError> {
        let pipe = self.pipe_to(destination).await?;
        pipe.send(message).await.map_err(|_| {
            self.connections.borrow_mut().remove(destination);
            MessageError::Unreachable(destination.clone())
        })
    }
}
