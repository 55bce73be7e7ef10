//! The client-facing gateway: terminates client connections and proxies
//! their traffic into the cluster.

use crate::config::SiloConfig;
use crate::messaging::{
    encode_turn_body, ClientRouter, Direction, Envelope, Message, MessageCenter,
};
use grainyard_core::{GrainId, SiloAddress};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Interface id of the gateway system target.
pub const GATEWAY_INTERFACE_ID: u32 = 2;

/// Method id of the client handshake.
pub const HANDSHAKE_METHOD_ID: u32 = 1;

/// Grain kind conventionally naming externally-connected clients.
pub const CLIENT_KIND: &str = "Client";

/// Grain identity clients address their handshake to.
pub fn gateway_target() -> GrainId {
    GrainId {
        namespace: "sys".to_string(),
        kind: "Gateway".to_string(),
        key: "handshake".to_string(),
    }
}

/// Cap on messages parked for a disconnected client.
const PENDING_LIMIT: usize = 1024;

/// State retained per connected (or recently-disconnected) client.
pub struct ClientState {
    pub client_id: GrainId,
    connection: RefCell<Option<mpsc::Sender<Message>>>,
    pending: RefCell<VecDeque<Message>>,
    disconnected_at: Cell<Option<Instant>>,
}

impl ClientState {
    fn new(client_id: GrainId) -> Rc<Self> {
        Rc::new(Self {
            client_id,
            connection: RefCell::new(None),
            pending: RefCell::new(VecDeque::new()),
            disconnected_at: Cell::new(None),
        })
    }

    fn attach(&self, sender: mpsc::Sender<Message>) {
        *self.connection.borrow_mut() = Some(sender);
        self.disconnected_at.set(None);
    }

    fn detach(&self) {
        *self.connection.borrow_mut() = None;
        self.disconnected_at.set(Some(Instant::now()));
    }

    pub fn is_connected(&self) -> bool {
        self.connection.borrow().is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Queue or send one message toward the client.
    fn push(&self, message: Message) {
        let sender = self.connection.borrow().clone();
        match sender {
            Some(sender) => {
                if sender.try_send(message).is_err() {
                    tracing::warn!(client = %self.client_id, "client send queue full; dropping");
                }
            }
            None => {
                let mut pending = self.pending.borrow_mut();
                if pending.len() >= PENDING_LIMIT {
                    tracing::warn!(client = %self.client_id, "pending overflow; dropping oldest");
                    pending.pop_front();
                }
                pending.push_back(message);
            }
        }
    }

    /// Flush parked messages after a reconnect.
    fn flush(&self) {
        let parked: Vec<Message> = self.pending.borrow_mut().drain(..).collect();
        for message in parked {
            self.push(message);
        }
    }
}

/// Connection multiplexer between external clients and the silo mesh.
///
/// Two indexes: client identity → state, and connection → state. Replies
/// from anywhere in the cluster land here (the gateway rewrites
/// `sender_silo` on client requests to its own address) and leave through
/// the client's connection — or its pending queue across reconnects.
pub struct Gateway {
    local: SiloAddress,
    config: Rc<SiloConfig>,
    center: Rc<MessageCenter>,
    clients: RefCell<HashMap<GrainId, Rc<ClientState>>>,
    by_connection: RefCell<HashMap<u64, Rc<ClientState>>>,
    next_connection: Cell<u64>,
    /// Reply routes to clients of other gateways, with learn time.
    reply_routes: RefCell<HashMap<GrainId, (SiloAddress, Instant)>>,
}

impl Gateway {
    pub fn new(local: SiloAddress, config: Rc<SiloConfig>, center: Rc<MessageCenter>) -> Rc<Self> {
        Rc::new(Self {
            local,
            config,
            center,
            clients: RefCell::new(HashMap::new()),
            by_connection: RefCell::new(HashMap::new()),
            next_connection: Cell::new(1),
            reply_routes: RefCell::new(HashMap::new()),
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.borrow().len()
    }

    pub fn client_state(&self, client: &GrainId) -> Option<Rc<ClientState>> {
        self.clients.borrow().get(client).cloned()
    }

    /// Accept client connections and run the periodic cleanup agent.
    pub fn start(self: &Rc<Self>, listener: TcpListener) {
        let gateway = self.clone();
        tokio::task::spawn_local(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "client connected");
                        gateway.clone().spawn_connection(stream);
                    }
                    Err(error) => {
                        tracing::warn!(%error, "gateway accept failed");
                        break;
                    }
                }
            }
        });

        let gateway = self.clone();
        let sweep_every = (self.config.client_drop_timeout / 4)
            .max(std::time::Duration::from_millis(100));
        tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(sweep_every).await;
                gateway.cleanup_sweep();
            }
        });
    }

    fn spawn_connection(self: Rc<Self>, stream: TcpStream) {
        tokio::task::spawn_local(async move {
            let connection_id = self.next_connection.get();
            self.next_connection.set(connection_id + 1);

            let (mut read_half, mut write_half) = stream.into_split();

            // First frame must be the handshake declaring the client id.
            let handshake = match Envelope::read_frame(&mut read_half).await {
                Ok(frame)
                    if frame.interface_id == GATEWAY_INTERFACE_ID
                        && frame.method_id == HANDSHAKE_METHOD_ID =>
                {
                    frame
                }
                Ok(_) => {
                    tracing::warn!("first client frame was not a handshake; closing");
                    return;
                }
                Err(error) => {
                    tracing::debug!(%error, "client hung up before handshake");
                    return;
                }
            };
            let client_id = handshake.sender_grain.clone();

            let (sender, mut outbound) = mpsc::channel::<Message>(256);
            let state = self.register_client(client_id.clone(), connection_id, sender);

            // Handshake reply advertises the gateway's silo address for
            // client replies.
            let mut reply = Message::response(
                &handshake,
                encode_turn_body(&Ok(serde_json::json!(self.local.to_string()))),
            );
            reply.sender_silo = self.local.clone();
            state.push(reply);
            state.flush();

            // Writer: drain the client's outbound queue onto the socket.
            let writer_client = client_id.clone();
            tokio::task::spawn_local(async move {
                while let Some(message) = outbound.recv().await {
                    if let Err(error) = Envelope::write_frame(&mut write_half, &message).await {
                        tracing::debug!(client = %writer_client, %error, "client write failed");
                        break;
                    }
                }
            });

            // Reader: proxy client frames into the cluster.
            loop {
                match Envelope::read_frame(&mut read_half).await {
                    Ok(message) => self.route_from_client(&client_id, message),
                    Err(_) => break,
                }
            }
            self.disconnect(connection_id);
        });
    }

    fn register_client(
        self: &Rc<Self>,
        client_id: GrainId,
        connection_id: u64,
        sender: mpsc::Sender<Message>,
    ) -> Rc<ClientState> {
        let state = self
            .clients
            .borrow_mut()
            .entry(client_id.clone())
            .or_insert_with(|| ClientState::new(client_id.clone()))
            .clone();
        state.attach(sender);
        self.by_connection
            .borrow_mut()
            .insert(connection_id, state.clone());
        tracing::info!(client = %client_id, "client registered");
        state
    }

    /// Drop the connection but retain client state for
    /// `client_drop_timeout` so a reconnect resumes it.
    fn disconnect(&self, connection_id: u64) {
        if let Some(state) = self.by_connection.borrow_mut().remove(&connection_id) {
            state.detach();
            tracing::info!(client = %state.client_id, "client disconnected");
        }
    }

    /// Route one frame arriving from a connected client.
    fn route_from_client(self: &Rc<Self>, client_id: &GrainId, mut message: Message) {
        // Replies must come back to this gateway.
        message.sender_silo = self.local.clone();
        message.sender_grain = client_id.clone();
        message.time_to_expiry = Some(Instant::now() + self.config.response_timeout);

        // System targets with an explicit silo forward directly.
        if message.target_grain.namespace == "sys" {
            match &message.target_silo {
                Some(silo) if *silo == self.local => {
                    let center = self.center.clone();
                    tokio::task::spawn_local(async move {
                        center.deliver(message).await;
                    });
                }
                Some(_) => {
                    let center = self.center.clone();
                    tokio::task::spawn_local(async move {
                        if let Err(error) = center.transmit(message).await {
                            tracing::warn!(%error, "system forward failed");
                        }
                    });
                }
                None => tracing::warn!("system-target frame without silo; dropped"),
            }
            return;
        }

        // Client-to-client traffic rides the reply-route cache; a client
        // identity nobody knows is dropped, never dispatched as a grain.
        if message.target_grain.kind == CLIENT_KIND
            || self.is_client_target(&message.target_grain)
        {
            self.deliver_to_client_target(message);
            return;
        }

        // Regular grain call: dispatch as if originated locally, ferrying
        // the eventual response back to this client.
        let gateway = self.clone();
        let client_id = client_id.clone();
        tokio::task::spawn_local(async move {
            match message.direction {
                Direction::Request => {
                    // The cluster correlates by its own ids; the client
                    // matches by the one it chose. Swap on the way in,
                    // restore on the way out.
                    let client_correlation = message.correlation_id;
                    let mut message = message;
                    message.correlation_id = gateway.center.next_correlation();

                    let mut response = match gateway.center.invoke(message.clone()).await {
                        Ok(response) => response,
                        Err(error) => {
                            let mut failure = Message::response(
                                &message,
                                encode_turn_body(&Err(error.to_string())),
                            );
                            failure.sender_silo = gateway.local.clone();
                            failure
                        }
                    };
                    response.correlation_id = client_correlation;
                    gateway.deliver_to_local_client(&client_id, response);
                }
                Direction::OneWay => {
                    if let Err(error) = gateway.center.send_oneway(message).await {
                        tracing::warn!(client = %client_id, %error, "one-way send failed");
                    }
                }
                other => {
                    tracing::warn!(direction = ?other, "unexpected client frame; dropped");
                }
            }
        });
    }

    fn is_client_target(&self, target: &GrainId) -> bool {
        self.clients.borrow().contains_key(target) || self.reply_routes.borrow().contains_key(target)
    }

    fn deliver_to_local_client(&self, client: &GrainId, message: Message) {
        match self.clients.borrow().get(client) {
            Some(state) => state.push(message),
            None => tracing::debug!(client = %client, "client gone; reply dropped"),
        }
    }

    /// Deliver a client-addressed message: locally when the client is
    /// ours, via the reply-route cache when it belongs to another
    /// gateway, dropped when unknown.
    fn deliver_to_client_target(&self, message: Message) {
        let target = message.target_grain.clone();
        if self.clients.borrow().contains_key(&target) {
            self.deliver_to_local_client(&target, message);
            return;
        }
        let route = self.reply_routes.borrow().get(&target).cloned();
        match route {
            Some((gateway_silo, learned_at))
                if learned_at.elapsed() < self.config.reply_route_ttl() =>
            {
                let center = self.center.clone();
                let mut forwarded = message;
                forwarded.target_silo = Some(gateway_silo);
                tokio::task::spawn_local(async move {
                    if let Err(error) = center.transmit(forwarded).await {
                        tracing::warn!(%error, "client reply forward failed");
                    }
                });
            }
            _ => {
                tracing::debug!(client = %target, "no reply route; dropped");
            }
        }
    }

    /// Advance disconnections to drops and expire stale reply routes.
    pub fn cleanup_sweep(&self) {
        let now = Instant::now();
        let drop_after = self.config.client_drop_timeout;
        let doomed: Vec<GrainId> = self
            .clients
            .borrow()
            .iter()
            .filter(|(_, state)| {
                state
                    .disconnected_at
                    .get()
                    .map(|at| now.duration_since(at) >= drop_after)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for client in doomed {
            if let Some(state) = self.clients.borrow_mut().remove(&client) {
                let aborted = state.pending.borrow().len();
                tracing::info!(client = %client, aborted, "client dropped");
            }
        }

        let ttl = self.config.reply_route_ttl();
        self.reply_routes
            .borrow_mut()
            .retain(|_, (_, learned_at)| now.duration_since(*learned_at) < ttl);
    }

    /// Test/embedding hook: register a client without a socket.
    pub fn register_local_client(
        self: &Rc<Self>,
        client_id: GrainId,
    ) -> (Rc<ClientState>, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(256);
        let connection_id = self.next_connection.get();
        self.next_connection.set(connection_id + 1);
        let state = self.register_client(client_id, connection_id, sender);
        (state, receiver)
    }

    /// Test/embedding hook: simulate a connection loss.
    pub fn drop_connection_of(&self, client: &GrainId) {
        let connection: Option<u64> = self
            .by_connection
            .borrow()
            .iter()
            .find(|(_, state)| &state.client_id == client)
            .map(|(id, _)| *id);
        if let Some(connection) = connection {
            self.disconnect(connection);
        }
    }

    /// Test/embedding hook: route a frame as if it arrived from `client`.
    pub fn inject_from_client(self: &Rc<Self>, client: &GrainId, message: Message) {
        self.route_from_client(client, message);
    }
}

impl ClientRouter for Gateway {
    fn try_deliver_to_client(&self, message: &Message) -> bool {
        // Learn reply routes from frames whose sender is a client of some
        // other gateway.
        if message.sender_grain.kind == CLIENT_KIND && message.sender_silo != self.local {
            self.reply_routes.borrow_mut().insert(
                message.sender_grain.clone(),
                (message.sender_silo.clone(), Instant::now()),
            );
        }

        let target = &message.target_grain;
        if self.clients.borrow().contains_key(target) {
            self.deliver_to_local_client(target, message.clone());
            return true;
        }
        if self.reply_routes.borrow().contains_key(target) {
            self.deliver_to_client_target(message.clone());
            return true;
        }
        false
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("local", &self.local)
            .field("clients", &self.clients.borrow().len())
            .field("reply_routes", &self.reply_routes.borrow().len())
            .finish()
    }
}
