//! Message center: assembles, routes, retries, and rejects messages.

use crate::catalog::{Catalog, CreateOutcome};
use crate::config::SiloConfig;
use crate::directory::{
    directory_target, DirectoryRequest, DirectoryResponse, DirectoryTransport, LocalGrainDirectory,
    DIRECTORY_INTERFACE_ID,
};
use crate::error::{CallError, CatalogError, DirectoryError, MessageError};
use crate::messaging::{
    decode_turn_body, CallbackData, CorrelationIdFactory, Direction, Message, RejectionKind,
    SiloTransport,
};
use crate::scheduler::{SiloScheduler, WorkItem, WorkItemKind};
use async_trait::async_trait;
use grainyard_core::{CorrelationId, SiloAddress};
use rand::seq::SliceRandom;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::oneshot;

/// Hook the gateway installs so client-bound frames leave the silo mesh.
pub trait ClientRouter {
    /// Deliver `message` to a connected client if its target grain is a
    /// known client identity. Returns `false` when the target is not a
    /// client of this gateway.
    fn try_deliver_to_client(&self, message: &Message) -> bool;
}

/// The silo's dispatcher: one per silo, between grain code and the wire.
///
/// Outbound: resolves unset targets through the directory (cache first),
/// stamps cache etags, tracks request callbacks, enforces deadlines, and
/// absorbs cache-invalidation rejections with bounded retries. Inbound:
/// materializes target activations through the catalog and enqueues work
/// items, or answers with rejections the sender can act on.
pub struct MessageCenter {
    local: SiloAddress,
    config: Rc<SiloConfig>,
    correlation: CorrelationIdFactory,
    pending: RefCell<HashMap<CorrelationId, Rc<CallbackData>>>,
    pending_targets: RefCell<HashMap<CorrelationId, SiloAddress>>,
    transport: Rc<dyn SiloTransport>,
    scheduler: Rc<SiloScheduler>,
    membership: Rc<dyn crate::membership::MembershipService>,
    catalog: RefCell<Option<Rc<Catalog>>>,
    directory: RefCell<Option<Rc<LocalGrainDirectory>>>,
    client_router: RefCell<Option<Rc<dyn ClientRouter>>>,
}

impl MessageCenter {
    pub fn new(
        local: SiloAddress,
        config: Rc<SiloConfig>,
        transport: Rc<dyn SiloTransport>,
        scheduler: Rc<SiloScheduler>,
        membership: Rc<dyn crate::membership::MembershipService>,
    ) -> Rc<Self> {
        Rc::new(Self {
            local,
            config,
            correlation: CorrelationIdFactory::new(),
            pending: RefCell::new(HashMap::new()),
            pending_targets: RefCell::new(HashMap::new()),
            transport,
            scheduler,
            membership,
            catalog: RefCell::new(None),
            directory: RefCell::new(None),
            client_router: RefCell::new(None),
        })
    }

    pub fn set_catalog(&self, catalog: Rc<Catalog>) {
        *self.catalog.borrow_mut() = Some(catalog);
    }

    pub fn set_directory(&self, directory: Rc<LocalGrainDirectory>) {
        *self.directory.borrow_mut() = Some(directory);
    }

    pub fn set_client_router(&self, router: Rc<dyn ClientRouter>) {
        *self.client_router.borrow_mut() = Some(router);
    }

    pub fn local_silo(&self) -> &SiloAddress {
        &self.local
    }

    pub fn default_timeout(&self) -> std::time::Duration {
        self.config.response_timeout
    }

    pub fn next_correlation(&self) -> CorrelationId {
        self.correlation.next()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.borrow().len()
    }

    fn catalog(&self) -> Result<Rc<Catalog>, CallError> {
        self.catalog
            .borrow()
            .clone()
            .ok_or_else(|| CallError::Rejected("catalog not wired".into()))
    }

    fn directory(&self) -> Result<Rc<LocalGrainDirectory>, CallError> {
        self.directory
            .borrow()
            .clone()
            .ok_or_else(|| CallError::Rejected("directory not wired".into()))
    }

    // ---------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------

    /// Send a request and await its response.
    ///
    /// Cache-invalidation rejections evict the stale entry and re-resolve
    /// from scratch, at most `max_forward_count` times; transient
    /// rejections retry after a short backoff. Everything else surfaces.
    pub async fn invoke(&self, mut message: Message) -> Result<Message, CallError> {
        let deadline = message
            .time_to_expiry
            .unwrap_or_else(|| std::time::Instant::now() + self.config.response_timeout);
        // A message born with an explicit target (system targets) keeps it
        // across retries; resolution-born targets are recomputed.
        let explicit_target = message.target_silo.clone();

        let mut retries: u8 = 0;
        loop {
            message.retry_count = retries;
            let correlation = message.correlation_id;
            let (tx, rx) = oneshot::channel();
            let callback = Rc::new(CallbackData::new(&message, tx));
            self.pending.borrow_mut().insert(correlation, callback);

            if let Err(error) = self.route_outbound(message.clone()).await {
                self.forget(correlation);
                if retries < self.config.max_forward_count && is_transient(&error) {
                    retries += 1;
                    tokio::time::sleep(self.config.retry_backoff).await;
                    message.target_silo = explicit_target.clone();
                    message.correlation_id = self.next_correlation();
                    continue;
                }
                return Err(error);
            }

            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let outcome = tokio::time::timeout(remaining, rx).await;
            self.forget(correlation);

            let reply = match outcome {
                Err(_) => return Err(CallError::Timeout),
                Ok(Err(_)) => return Err(CallError::Rejected("callback dropped".into())),
                Ok(Ok(Err(error))) => {
                    // Cancelled in flight (target silo died). Transient from
                    // the caller's point of view: re-resolve and retry.
                    if retries < self.config.max_forward_count && is_transient(&error) {
                        retries += 1;
                        tokio::time::sleep(self.config.retry_backoff).await;
                        message.target_silo = explicit_target.clone();
                        message.cache_etag = None;
                        message.correlation_id = self.next_correlation();
                        continue;
                    }
                    return Err(error);
                }
                Ok(Ok(Ok(reply))) => reply,
            };

            match reply.direction {
                Direction::Response => return Ok(reply),
                Direction::Rejection => {
                    let info = reply.rejection.clone().unwrap_or_else(|| {
                        crate::messaging::RejectionInfo {
                            kind: RejectionKind::Unrecoverable,
                            reason: "rejection without info".into(),
                        }
                    });
                    let retryable = match info.kind {
                        RejectionKind::CacheInvalidation => {
                            if let Ok(directory) = self.directory() {
                                directory
                                    .invalidate_cache(&message.target_grain, reply.cache_etag);
                            }
                            true
                        }
                        RejectionKind::Transient => true,
                        _ => false,
                    };
                    if retryable && retries < self.config.max_forward_count {
                        retries += 1;
                        tracing::debug!(
                            target = %message.target_grain,
                            kind = ?info.kind,
                            retry = retries,
                            "retrying after rejection"
                        );
                        tokio::time::sleep(self.config.retry_backoff).await;
                        message.target_silo = explicit_target.clone();
                        message.cache_etag = None;
                        message.correlation_id = self.next_correlation();
                        continue;
                    }
                    return Err(CallError::RemoteRejection {
                        kind: info.kind,
                        reason: info.reason,
                    });
                }
                other => {
                    return Err(CallError::Rejected(format!(
                        "unexpected reply direction {other:?}"
                    )))
                }
            }
        }
    }

    /// Fire-and-forget send. Routing failures surface; delivery does not.
    pub async fn send_oneway(&self, message: Message) -> Result<(), CallError> {
        self.route_outbound(message).await
    }

    fn forget(&self, correlation: CorrelationId) {
        self.pending.borrow_mut().remove(&correlation);
        self.pending_targets.borrow_mut().remove(&correlation);
    }

    /// Resolve the target silo if unset, then transmit.
    async fn route_outbound(&self, mut message: Message) -> Result<(), CallError> {
        if message.target_silo.is_none() {
            let directory = self.directory()?;
            if let Some((address, etag)) = directory.lookup_cached(&message.target_grain) {
                message.target_silo = Some(address.silo);
                message.cache_etag = Some(etag);
            } else {
                match directory.lookup(&message.target_grain).await? {
                    Some((addresses, etag)) => {
                        let first = addresses
                            .first()
                            .ok_or_else(|| CallError::Rejected("empty lookup result".into()))?;
                        message.target_silo = Some(first.silo.clone());
                        message.cache_etag = Some(etag);
                    }
                    None => {
                        // No activation anywhere: ship to a placement silo
                        // whose catalog will register one on arrival.
                        message.target_silo = Some(self.choose_placement()?);
                        message.cache_etag = None;
                    }
                }
            }
        }
        if message.expects_response() {
            if let Some(target) = &message.target_silo {
                self.pending_targets
                    .borrow_mut()
                    .insert(message.correlation_id, target.clone());
            }
        }
        self.transmit(message).await
    }

    /// Random placement among active silos.
    fn choose_placement(&self) -> Result<SiloAddress, CallError> {
        let active = self.membership.current().active_silos();
        active
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(CallError::Routing(DirectoryError::NoOwner))
    }

    /// Send an already-resolved message toward its target silo.
    pub async fn transmit(&self, message: Message) -> Result<(), CallError> {
        let target = message
            .target_silo
            .clone()
            .ok_or_else(|| CallError::Rejected("transmit without target silo".into()))?;
        if target == self.local {
            // Local loopback skips the wire but not the dispatch logic.
            Box::pin(self.deliver(message)).await;
            Ok(())
        } else {
            self.transport
                .send(&target, message)
                .await
                .map_err(CallError::Message)
        }
    }

    // ---------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------

    /// Entry point for every message arriving at this silo.
    pub async fn deliver(&self, message: Message) {
        match message.direction {
            Direction::Response | Direction::Rejection => self.complete_pending(message),
            Direction::Request | Direction::OneWay => {
                if let Err(error) = self.dispatch_incoming(message).await {
                    tracing::warn!(%error, "inbound dispatch failed");
                }
            }
        }
    }

    fn complete_pending(&self, message: Message) {
        // One-way senders keep no callback; their cache-invalidation
        // rejections still fix the cache so the next call lands.
        if message.direction == Direction::Rejection {
            if let Some(info) = &message.rejection {
                if info.kind == RejectionKind::CacheInvalidation {
                    if let Ok(directory) = self.directory() {
                        directory.invalidate_cache(&message.sender_grain, message.cache_etag);
                    }
                }
            }
        }

        let callback = self.pending.borrow_mut().remove(&message.correlation_id);
        self.pending_targets
            .borrow_mut()
            .remove(&message.correlation_id);
        match callback {
            Some(callback) => callback.complete(Ok(message)),
            None => {
                // Late response after timeout, or a one-way rejection.
                tracing::debug!(
                    correlation = %message.correlation_id,
                    direction = ?message.direction,
                    "no pending request; reply dropped"
                );
            }
        }
    }

    async fn dispatch_incoming(&self, message: Message) -> Result<(), CallError> {
        // Client-bound frames leave the mesh at the gateway.
        if let Some(router) = self.client_router.borrow().clone() {
            if router.try_deliver_to_client(&message) {
                return Ok(());
            }
        }

        let catalog = self.catalog()?;

        // A sender that routed by cache or directory believed this
        // activation exists; if it does not, answer with the rejection
        // that fixes their cache. Placement traffic (no etag) creates.
        if message.cache_etag.is_some() && catalog.get(&message.target_grain).is_none() {
            tracing::debug!(grain = %message.target_grain, "nonexistent activation");
            return self
                .reject(
                    &message,
                    RejectionKind::CacheInvalidation,
                    "nonexistent activation",
                )
                .await;
        }

        let kind = if message.interface_id == DIRECTORY_INTERFACE_ID
            || message.target_grain.namespace == "sys"
        {
            WorkItemKind::SystemPriority
        } else {
            WorkItemKind::Invocation
        };

        if kind == WorkItemKind::Invocation && self.scheduler.is_application_stopped() {
            return self
                .reject(&message, RejectionKind::Overloaded, "application turns stopped")
                .await;
        }

        match catalog.get_or_create_activation(message.target_grain.clone()).await {
            Ok(CreateOutcome::Local(activation)) => {
                let item = WorkItem::new(kind, message.clone());
                if activation.enqueue(item).is_err() {
                    return self
                        .reject(&message, RejectionKind::Transient, "activation deactivating")
                        .await;
                }
                Ok(())
            }
            Ok(CreateOutcome::Remote(winner)) => {
                // Lost the single-activation race: forward to the winner.
                let mut forwarded = message.clone();
                forwarded.target_silo = Some(winner.silo.clone());
                forwarded.hop_count = forwarded.hop_count.saturating_add(1);
                if forwarded.hop_count > self.config.hop_limit {
                    return self
                        .reject(&message, RejectionKind::Unrecoverable, "hop limit exceeded")
                        .await;
                }
                Box::pin(self.transmit(forwarded)).await
            }
            Err(CatalogError::Deactivating(_)) => {
                self.reject(&message, RejectionKind::Transient, "activation deactivating")
                    .await
            }
            Err(CatalogError::UnknownGrainKind(kind)) => {
                self.reject(
                    &message,
                    RejectionKind::Unrecoverable,
                    format!("unknown grain kind: {kind}"),
                )
                .await
            }
            Err(CatalogError::Directory(DirectoryError::HopLimitExceeded { hops })) => {
                self.reject(
                    &message,
                    RejectionKind::Unrecoverable,
                    format!("directory hop limit exceeded ({hops})"),
                )
                .await
            }
            Err(CatalogError::Directory(error)) => {
                self.reject(&message, RejectionKind::Transient, error.to_string())
                    .await
            }
            Err(error) => {
                self.reject(&message, RejectionKind::Unrecoverable, error.to_string())
                    .await
            }
        }
    }

    async fn reject(
        &self,
        message: &Message,
        kind: RejectionKind,
        reason: impl Into<String>,
    ) -> Result<(), CallError> {
        let rejection = Message::rejection(message, kind, reason);
        // A response whose destination is gone is dropped after logging.
        if let Err(error) = Box::pin(self.transmit(rejection)).await {
            tracing::warn!(%error, "failed to deliver rejection");
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Membership integration
    // ---------------------------------------------------------------

    /// Cancel outstanding requests aimed at a silo that died.
    pub fn on_silo_dead(&self, silo: &SiloAddress) {
        let doomed: Vec<CorrelationId> = self
            .pending_targets
            .borrow()
            .iter()
            .filter(|(_, target)| *target == silo)
            .map(|(correlation, _)| *correlation)
            .collect();
        for correlation in doomed {
            if let Some(callback) = self.pending.borrow_mut().remove(&correlation) {
                callback.on_error(CallError::Message(MessageError::Unreachable(silo.clone())));
            }
            self.pending_targets.borrow_mut().remove(&correlation);
        }
    }
}

/// Routing faults worth an automatic local retry.
fn is_transient(error: &CallError) -> bool {
    matches!(
        error,
        CallError::Message(MessageError::Unreachable(_))
            | CallError::Routing(DirectoryError::Unavailable(_))
            | CallError::Routing(DirectoryError::Transport(_))
    )
}

#[async_trait(?Send)]
impl DirectoryTransport for MessageCenter {
    async fn send_request(
        &self,
        owner: &SiloAddress,
        request: DirectoryRequest,
    ) -> Result<DirectoryResponse, DirectoryError> {
        let body = serde_json::to_vec(&request)
            .map_err(|e| DirectoryError::MalformedReply(e.to_string()))?;
        let mut message = Message::request(
            self.next_correlation(),
            self.local.clone(),
            directory_target(&self.local),
            directory_target(owner),
            DIRECTORY_INTERFACE_ID,
            request.method_id(),
            body.into(),
            self.config.response_timeout,
        );
        message.target_silo = Some(owner.clone());

        let response = self.invoke(message).await.map_err(|error| match error {
            CallError::Message(inner) => DirectoryError::Transport(inner),
            CallError::Timeout => DirectoryError::Unavailable("directory call timed out".into()),
            other => DirectoryError::Unavailable(other.to_string()),
        })?;
        decode_turn_body::<DirectoryResponse>(&response.body)
            .map_err(|error| DirectoryError::MalformedReply(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::UnregistrationCause;
    use crate::grain::{Grain, GrainRegistry, MethodTable};
    use crate::membership::{MembershipService, SharedMembership, SiloStatus};
    use crate::messaging::InProcessNetwork;
    use grainyard_core::{ActivationId, GrainAddress, GrainId};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    struct Echo;

    impl Grain for Echo {
        const KIND: &'static str = "Echo";
        const INTERFACE_ID: u32 = 700;

        fn create(_id: &GrainId) -> Self {
            Self
        }

        fn register_methods(table: &mut MethodTable<Self>) {
            table.register(1, |_cell, n: i64, _ctx| async move { Ok(n + 1) });
        }
    }

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            1,
        )
    }

    fn grain(key: &str) -> GrainId {
        GrainId::from_parts("test", "Echo", key).unwrap()
    }

    async fn wired(port: u16) -> (Rc<MessageCenter>, Rc<Catalog>, Rc<LocalGrainDirectory>) {
        let local = silo(port);
        let membership = SharedMembership::new();
        membership
            .register_silo(local.clone(), SiloStatus::Active)
            .await
            .unwrap();

        let mut config = SiloConfig::default();
        config.retry_backoff = Duration::from_millis(1);
        config.response_timeout = Duration::from_secs(1);
        let config = Rc::new(config);

        let scheduler = SiloScheduler::new();
        let network = InProcessNetwork::new();
        let mut registry = GrainRegistry::new();
        registry.register::<Echo>();

        let directory =
            LocalGrainDirectory::new(local.clone(), config.clone(), membership.clone());
        let center = MessageCenter::new(
            local.clone(),
            config.clone(),
            network.clone(),
            scheduler.clone(),
            membership,
        );
        let catalog = Catalog::new(local.clone(), config, registry, scheduler);

        catalog.set_center(center.clone());
        catalog.set_directory(directory.clone());
        center.set_catalog(catalog.clone());
        center.set_directory(directory.clone());
        directory.set_transport(center.clone());
        network.attach(local, center.clone());
        directory.mark_ready();
        directory.sync_membership_now();
        (center, catalog, directory)
    }

    fn echo_request(center: &MessageCenter, target: GrainId) -> Message {
        Message::request(
            center.next_correlation(),
            center.local_silo().clone(),
            GrainId::from_parts("test", "Caller", "c").unwrap(),
            target,
            Echo::INTERFACE_ID,
            1,
            serde_json::to_vec(&41i64).unwrap().into(),
            Duration::from_secs(1),
        )
    }

    fn run_in_local(future: impl std::future::Future<Output = ()>) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, future);
    }

    /// Remove the partition entry behind the cache's back, leaving a stale
    /// cached resolution pointing at an activation that no longer exists.
    async fn strand_cache_entry(
        directory: &Rc<LocalGrainDirectory>,
        target: &GrainId,
        local: SiloAddress,
    ) {
        let ghost = GrainAddress::new(local, target.clone(), ActivationId::random());
        directory.register_single(ghost.clone()).await.unwrap();
        let _ = directory
            .handle_request(DirectoryRequest::Unregister {
                address: ghost,
                cause: UnregistrationCause::Forced,
                hop_count: 0,
            })
            .await;
        assert!(directory.lookup_cached(target).is_some());
    }

    #[test]
    fn test_invoke_activates_target_and_round_trips() {
        run_in_local(async {
            let (center, catalog, _directory) = wired(5400).await;

            let response = center
                .invoke(echo_request(&center, grain("a")))
                .await
                .unwrap();
            let value: i64 = decode_turn_body(&response.body).unwrap();
            assert_eq!(value, 42);
            assert_eq!(catalog.activation_count(), 1);
            assert_eq!(center.pending_requests(), 0);
        });
    }

    #[test]
    fn test_stale_cache_corrected_by_one_rejection_round_trip() {
        run_in_local(async {
            let (center, catalog, directory) = wired(5410).await;
            let target = grain("stale");
            strand_cache_entry(&directory, &target, center.local_silo().clone()).await;

            // The stale hit costs one NonexistentActivation rejection; the
            // retry evicts the entry, re-resolves, and lands on a fresh
            // activation.
            let response = center
                .invoke(echo_request(&center, target.clone()))
                .await
                .unwrap();
            let value: i64 = decode_turn_body(&response.body).unwrap();
            assert_eq!(value, 42);
            assert!(catalog.get(&target).is_some());
        });
    }

    #[tokio::test]
    async fn test_oneway_rejection_fixes_cache_without_retrying() {
        let (center, catalog, directory) = wired(5420).await;
        let target = grain("fire-and-forget");
        strand_cache_entry(&directory, &target, center.local_silo().clone()).await;

        let message = Message::oneway(
            center.local_silo().clone(),
            GrainId::from_parts("test", "Caller", "c").unwrap(),
            target.clone(),
            Echo::INTERFACE_ID,
            1,
            serde_json::to_vec(&1i64).unwrap().into(),
        );
        center.send_oneway(message).await.unwrap();

        // The rejection evicted the stale entry, but the one-way itself is
        // never retried: no activation was created for it.
        assert!(directory.lookup_cached(&target).is_none());
        assert!(catalog.get(&target).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_target_surfaces_after_bounded_retries() {
        let (center, _catalog, _directory) = wired(5430).await;
        let mut message = echo_request(&center, grain("nowhere"));
        message.target_silo = Some(silo(5999));

        match center.invoke(message).await {
            Err(CallError::Message(MessageError::Unreachable(dead))) => {
                assert_eq!(dead, silo(5999));
            }
            other => panic!("expected unreachable, got {other:?}"),
        }
        assert_eq!(center.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_reply_without_pending_request_is_dropped() {
        let (center, _catalog, _directory) = wired(5440).await;
        let request = echo_request(&center, grain("gone"));
        let late = Message::response(&request, bytes::Bytes::from_static(b"null"));

        // No callback registered under this correlation: dropped quietly.
        center.deliver(late).await;
        assert_eq!(center.pending_requests(), 0);
    }
}
