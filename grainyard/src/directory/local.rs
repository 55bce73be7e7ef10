//! The local grain directory: partition owner, cache, routing, handoff.

use crate::config::SiloConfig;
use crate::directory::cache::DirectoryCache;
use crate::directory::messages::{
    DirectoryRejectionKind, DirectoryRequest, DirectoryResponse, LookupOutcome, UnregistrationCause,
};
use crate::directory::partition::{GrainDirectoryPartition, RegistrationResult};
use crate::directory::ring::DirectoryRing;
use crate::error::DirectoryError;
use crate::membership::{
    ClusterMembershipSnapshot, MembershipDelta, MembershipService, MembershipVersion,
};
use async_trait::async_trait;
use grainyard_core::{GrainAddress, GrainId, SiloAddress};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// How directory requests reach a remote owner.
///
/// Implemented by the message center over system-target frames; tests plug
/// in fakes to exercise routing without a cluster.
#[async_trait(?Send)]
pub trait DirectoryTransport {
    async fn send_request(
        &self,
        owner: &SiloAddress,
        request: DirectoryRequest,
    ) -> Result<DirectoryResponse, DirectoryError>;
}

/// Transient-fault retries before a directory call gives up.
const TRANSIENT_RETRIES: u32 = 3;

/// Owner of this silo's directory partition, read-through cache, and the
/// routing protocol between them.
///
/// For any grain-identity operation the algorithm is: compute the
/// partition owner from the current ring; execute locally when the owner
/// is this silo; otherwise forward to the owner carrying an incremented
/// hop count, failing definitely past the hop limit. Handoff on
/// membership churn moves entries to their new owners with
/// acknowledgement before local removal.
pub struct LocalGrainDirectory {
    local: SiloAddress,
    config: Rc<SiloConfig>,
    membership: Rc<dyn MembershipService>,

    partition: RefCell<GrainDirectoryPartition>,
    cache: RefCell<DirectoryCache>,
    ring: RefCell<DirectoryRing>,
    last_snapshot: RefCell<ClusterMembershipSnapshot>,

    transport: RefCell<Option<Rc<dyn DirectoryTransport>>>,

    /// Set once this silo's shutdown handoff completed; later operations
    /// route to the new owners.
    handed_off: Cell<bool>,
    /// Set when the first handoff split arrived after joining.
    received_first_split: Cell<bool>,
    /// Set after initial stabilization; incoming reads wait for it.
    ready: Cell<bool>,
    /// Entries accepted via handoff, by source silo.
    handoff_sources: RefCell<HashMap<SiloAddress, Vec<GrainAddress>>>,
}

impl LocalGrainDirectory {
    pub fn new(
        local: SiloAddress,
        config: Rc<SiloConfig>,
        membership: Rc<dyn MembershipService>,
    ) -> Rc<Self> {
        let snapshot = membership.current();
        Rc::new(Self {
            local,
            cache: RefCell::new(DirectoryCache::new(config.directory_cache_capacity)),
            config,
            membership,
            partition: RefCell::new(GrainDirectoryPartition::new()),
            ring: RefCell::new(DirectoryRing::from_snapshot(&snapshot)),
            last_snapshot: RefCell::new(snapshot),
            transport: RefCell::new(None),
            handed_off: Cell::new(false),
            received_first_split: Cell::new(false),
            ready: Cell::new(false),
            handoff_sources: RefCell::new(HashMap::new()),
        })
    }

    /// Wire the transport (runtime startup).
    pub fn set_transport(&self, transport: Rc<dyn DirectoryTransport>) {
        *self.transport.borrow_mut() = Some(transport);
    }

    fn transport(&self) -> Result<Rc<dyn DirectoryTransport>, DirectoryError> {
        self.transport
            .borrow()
            .clone()
            .ok_or_else(|| DirectoryError::Unavailable("directory transport not wired".into()))
    }

    pub fn local_silo(&self) -> &SiloAddress {
        &self.local
    }

    /// Partition owner for a grain under the current ring (for tests and
    /// diagnostics).
    pub fn owner_of(&self, grain: &GrainId) -> Option<SiloAddress> {
        self.ring.borrow().partition_owner(grain).cloned()
    }

    /// All addresses currently registered in the local partition.
    pub fn partition_items(&self) -> Vec<GrainAddress> {
        self.partition.borrow().get_items()
    }

    /// Mark the silo ready to serve directory reads (after stabilization).
    pub fn mark_ready(&self) {
        self.ready.set(true);
    }

    // ---------------------------------------------------------------
    // Client operations
    // ---------------------------------------------------------------

    /// Register a single-activation address; returns the winning address
    /// and etag. Losing callers must garbage-collect their activation.
    pub async fn register_single(
        self: &Rc<Self>,
        address: GrainAddress,
    ) -> Result<RegistrationResult, DirectoryError> {
        let request = DirectoryRequest::Register {
            address,
            single_activation: true,
            hop_count: 0,
        };
        match self.execute(request).await? {
            DirectoryResponse::Registered { address, etag } => {
                self.cache.borrow_mut().insert(address.clone(), etag);
                Ok(RegistrationResult { address, etag })
            }
            other => Err(malformed(&other)),
        }
    }

    /// Authoritative lookup; caches the result on success.
    pub async fn lookup(
        self: &Rc<Self>,
        grain: &GrainId,
    ) -> Result<Option<(Vec<GrainAddress>, u64)>, DirectoryError> {
        let request = DirectoryRequest::Lookup {
            grain: grain.clone(),
            hop_count: 0,
        };
        match self.execute(request).await? {
            DirectoryResponse::Found { addresses, etag } => {
                if let Some(first) = addresses.first() {
                    self.cache.borrow_mut().insert(first.clone(), etag);
                }
                Ok(Some((addresses, etag)))
            }
            DirectoryResponse::NotFound => Ok(None),
            other => Err(malformed(&other)),
        }
    }

    /// Cache-only lookup; a miss is never an error.
    pub fn lookup_cached(&self, grain: &GrainId) -> Option<(GrainAddress, u64)> {
        self.cache.borrow_mut().get(grain)
    }

    /// Remove one registration.
    pub async fn unregister(
        self: &Rc<Self>,
        address: GrainAddress,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        self.cache.borrow_mut().invalidate(&address.grain);
        let request = DirectoryRequest::Unregister {
            address,
            cause,
            hop_count: 0,
        };
        match self.execute(request).await? {
            DirectoryResponse::Done => Ok(()),
            other => Err(malformed(&other)),
        }
    }

    /// Remove a batch of registrations sharing one owner path.
    ///
    /// Addresses are grouped by partition owner; each group travels as a
    /// single `UnregisterMany`.
    pub async fn unregister_many(
        &self,
        addresses: Vec<GrainAddress>,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        let mut by_owner: HashMap<SiloAddress, Vec<GrainAddress>> = HashMap::new();
        for address in addresses {
            self.cache.borrow_mut().invalidate(&address.grain);
            let owner = self.effective_owner(&address.grain)?;
            by_owner.entry(owner).or_default().push(address);
        }
        for (owner, batch) in by_owner {
            let request = DirectoryRequest::UnregisterMany {
                addresses: batch,
                cause,
                hop_count: 0,
            };
            let response = if owner == self.local {
                self.apply_local(&request)
            } else {
                self.transport()?.send_request(&owner, request).await?
            };
            match response {
                DirectoryResponse::Done => {}
                other => return Err(malformed(&other)),
            }
        }
        Ok(())
    }

    /// Remove all registrations for a grain.
    pub async fn delete(self: &Rc<Self>, grain: &GrainId) -> Result<(), DirectoryError> {
        self.cache.borrow_mut().invalidate(grain);
        let request = DirectoryRequest::Delete {
            grain: grain.clone(),
            hop_count: 0,
        };
        match self.execute(request).await? {
            DirectoryResponse::Done => Ok(()),
            other => Err(malformed(&other)),
        }
    }

    /// Evict a cache entry, optionally only when the etag matches.
    pub fn invalidate_cache(&self, grain: &GrainId, etag: Option<u64>) {
        let mut cache = self.cache.borrow_mut();
        // With an etag, evict exactly the resolution that was rejected; a
        // newer cached entry survives. Without one, evict whatever is there.
        let evicted = match etag {
            Some(etag) => cache.invalidate_etag(grain, etag),
            None => cache.invalidate(grain),
        };
        if evicted {
            tracing::debug!(grain = %grain, "directory cache entry evicted");
        }
    }

    // ---------------------------------------------------------------
    // Routing core
    // ---------------------------------------------------------------

    /// Execute a routed request, retrying transient transport faults after
    /// a membership refresh.
    async fn execute(self: &Rc<Self>, request: DirectoryRequest) -> Result<DirectoryResponse, DirectoryError> {
        let mut attempts = 0u32;
        loop {
            match self.execute_once(request.clone()).await {
                Err(DirectoryError::Transport(error)) if attempts < TRANSIENT_RETRIES => {
                    attempts += 1;
                    tracing::debug!(
                        %error,
                        attempt = attempts,
                        "transient directory fault; refreshing membership"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                    // Wait (bounded) for a snapshot newer than the one we
                    // routed by; churn that caused the fault usually means
                    // one is coming.
                    let routed_by = self.ring.borrow().version();
                    let _ = tokio::time::timeout(
                        self.config.retry_backoff * 4,
                        self.membership
                            .refresh_at_least(MembershipVersion(routed_by.0 + 1)),
                    )
                    .await;
                    self.sync_membership_now();
                }
                outcome => return self.finish_client_call(outcome),
            }
        }
    }

    /// Map definite rejections carried in-band onto errors.
    fn finish_client_call(
        &self,
        outcome: Result<DirectoryResponse, DirectoryError>,
    ) -> Result<DirectoryResponse, DirectoryError> {
        match outcome? {
            DirectoryResponse::Rejected { kind, reason } => match kind {
                DirectoryRejectionKind::HopLimitExceeded => Err(DirectoryError::HopLimitExceeded {
                    hops: self.config.hop_limit,
                }),
                DirectoryRejectionKind::NoOwner => Err(DirectoryError::NoOwner),
                DirectoryRejectionKind::Unavailable => Err(DirectoryError::Unavailable(reason)),
            },
            response => Ok(response),
        }
    }

    async fn execute_once(
        &self,
        request: DirectoryRequest,
    ) -> Result<DirectoryResponse, DirectoryError> {
        let Some(grain) = request.routing_grain().cloned() else {
            // Handoff messages are addressed to silos, not partitions.
            return Ok(self.apply_local(&request));
        };
        let owner = self.effective_owner(&grain)?;
        if owner == self.local {
            Ok(self.apply_local(&request))
        } else {
            self.transport()?.send_request(&owner, request).await
        }
    }

    /// The silo that should execute an operation for `grain` right now.
    ///
    /// Three rules on top of the plain ring lookup: a silo that accepted
    /// handoff from the apparent owner treats itself as owner; a silo that
    /// performed its own handoff never self-executes; an empty ring has no
    /// owner.
    fn effective_owner(&self, grain: &GrainId) -> Result<SiloAddress, DirectoryError> {
        let ring = self.ring.borrow();
        let owner = ring
            .partition_owner(grain)
            .cloned()
            .ok_or(DirectoryError::NoOwner)?;
        drop(ring);

        if owner == self.local {
            if self.handed_off.get() {
                // Shutdown handoff done: the ring that still names us is
                // stale; route to our successor-by-ring, the new owner.
                let snapshot = self.membership.current();
                let mut members = snapshot.members.clone();
                members.remove(&self.local);
                let ring = DirectoryRing::from_snapshot(&ClusterMembershipSnapshot {
                    members,
                    version: snapshot.version,
                });
                return ring
                    .partition_owner(grain)
                    .cloned()
                    .ok_or(DirectoryError::NoOwner);
            }
            return Ok(owner);
        }
        if self.handoff_sources.borrow().contains_key(&owner) {
            // The apparent owner split this range to us already.
            return Ok(self.local.clone());
        }
        Ok(owner)
    }

    // ---------------------------------------------------------------
    // Server side (directory system target)
    // ---------------------------------------------------------------

    /// Execute a request arriving from a peer silo.
    ///
    /// Re-checks ownership under the receiver's ring: if the ring moved,
    /// the request forwards onward with an incremented hop count, and dies
    /// with a definite rejection past the hop limit.
    pub async fn handle_request(self: &Rc<Self>, request: DirectoryRequest) -> DirectoryResponse {
        match &request {
            DirectoryRequest::AcceptSplit { source, addresses } => {
                self.accept_split(source.clone(), addresses.clone())
            }
            DirectoryRequest::RemoveHandoffPartition { source } => {
                self.remove_handoff_partition(source)
            }
            _ => {
                if request.hop_count() > self.config.hop_limit {
                    return DirectoryResponse::Rejected {
                        kind: DirectoryRejectionKind::HopLimitExceeded,
                        reason: format!(
                            "request exceeded {} directory hops",
                            self.config.hop_limit
                        ),
                    };
                }
                self.wait_until_ready().await;

                let Some(grain) = request.routing_grain().cloned() else {
                    return self.apply_local(&request);
                };
                let owner = match self.effective_owner(&grain) {
                    Ok(owner) => owner,
                    Err(DirectoryError::NoOwner) => {
                        return DirectoryResponse::Rejected {
                            kind: DirectoryRejectionKind::NoOwner,
                            reason: "no active silo owns the partition".into(),
                        }
                    }
                    Err(error) => {
                        return DirectoryResponse::Rejected {
                            kind: DirectoryRejectionKind::Unavailable,
                            reason: error.to_string(),
                        }
                    }
                };

                if owner == self.local {
                    self.apply_local(&request)
                } else {
                    tracing::debug!(
                        grain = %grain,
                        new_owner = %owner,
                        hops = request.hop_count(),
                        "forwarding directory request"
                    );
                    let forwarded = request.forwarded();
                    match self.transport() {
                        Ok(transport) => match transport.send_request(&owner, forwarded).await {
                            Ok(response) => response,
                            Err(error) => DirectoryResponse::Rejected {
                                kind: DirectoryRejectionKind::Unavailable,
                                reason: error.to_string(),
                            },
                        },
                        Err(error) => DirectoryResponse::Rejected {
                            kind: DirectoryRejectionKind::Unavailable,
                            reason: error.to_string(),
                        },
                    }
                }
            }
        }
    }

    /// Apply a request against the local partition.
    ///
    /// Synchronous on purpose: partition mutation happens in one
    /// uninterrupted segment of a directory-target turn, keeping the
    /// partition single-writer even though those turns interleave.
    fn apply_local(&self, request: &DirectoryRequest) -> DirectoryResponse {
        let mut partition = self.partition.borrow_mut();
        match request {
            DirectoryRequest::Register {
                address,
                single_activation,
                ..
            } => {
                if *single_activation {
                    let result = partition.add_single_activation(address.clone());
                    DirectoryResponse::Registered {
                        address: result.address,
                        etag: result.etag,
                    }
                } else {
                    let etag = partition.add_activation(address.clone());
                    DirectoryResponse::Registered {
                        address: address.clone(),
                        etag,
                    }
                }
            }
            DirectoryRequest::Unregister { address, cause, .. } => {
                let removed = partition.remove_activation(&address.grain, address.activation);
                if removed {
                    tracing::debug!(address = %address, ?cause, "activation unregistered");
                }
                DirectoryResponse::Done
            }
            DirectoryRequest::UnregisterMany {
                addresses, cause, ..
            } => {
                for address in addresses {
                    partition.remove_activation(&address.grain, address.activation);
                }
                tracing::debug!(count = addresses.len(), ?cause, "bulk unregister");
                DirectoryResponse::Done
            }
            DirectoryRequest::Lookup { grain, .. } => match partition.lookup(grain) {
                Some((addresses, etag)) => DirectoryResponse::Found { addresses, etag },
                None => DirectoryResponse::NotFound,
            },
            DirectoryRequest::LookupMany { queries, .. } => {
                let results = queries
                    .iter()
                    .map(|(grain, cached_etag)| match partition.lookup(grain) {
                        Some((_, etag)) if etag == *cached_etag => LookupOutcome::NotChanged,
                        Some((addresses, etag)) => LookupOutcome::Found { addresses, etag },
                        None => LookupOutcome::NotFound,
                    })
                    .collect();
                DirectoryResponse::LookupManyResults { results }
            }
            DirectoryRequest::Delete { grain, .. } => {
                partition.delete(grain);
                DirectoryResponse::Done
            }
            DirectoryRequest::AcceptSplit { .. } | DirectoryRequest::RemoveHandoffPartition { .. } => {
                // Routed separately in handle_request; unreachable via
                // apply_local's callers.
                DirectoryResponse::Done
            }
        }
    }

    fn accept_split(&self, source: SiloAddress, addresses: Vec<GrainAddress>) -> DirectoryResponse {
        tracing::info!(
            source = %source,
            entries = addresses.len(),
            "accepting directory split"
        );
        {
            let mut partition = self.partition.borrow_mut();
            for address in &addresses {
                partition.add_activation(address.clone());
            }
        }
        self.handoff_sources
            .borrow_mut()
            .entry(source)
            .or_default()
            .extend(addresses);
        self.received_first_split.set(true);
        DirectoryResponse::Done
    }

    fn remove_handoff_partition(&self, source: &SiloAddress) -> DirectoryResponse {
        if let Some(addresses) = self.handoff_sources.borrow_mut().remove(source) {
            self.partition.borrow_mut().remove_many(&addresses);
            tracing::info!(source = %source, entries = addresses.len(), "handoff partition removed");
        }
        DirectoryResponse::Done
    }

    // ---------------------------------------------------------------
    // Membership integration
    // ---------------------------------------------------------------

    /// Re-read the membership table and apply any newer snapshot.
    pub fn sync_membership_now(self: &Rc<Self>) {
        let snapshot = self.membership.current();
        self.on_membership_update(snapshot);
    }

    /// Apply a membership snapshot: rebuild the ring, scrub dead silos,
    /// maintain the cache, and split entries whose owner moved.
    pub fn on_membership_update(self: &Rc<Self>, snapshot: ClusterMembershipSnapshot) {
        let previous = self.last_snapshot.borrow().clone();
        if snapshot.version <= previous.version {
            return;
        }
        *self.last_snapshot.borrow_mut() = snapshot.clone();

        let delta = MembershipDelta::between(&previous, &snapshot);
        let old_ring = self.ring.replace(DirectoryRing::from_snapshot(&snapshot));
        let new_ring = self.ring.borrow().clone();

        // Entries referencing dead silos are gone with them.
        for departed in &delta.removed {
            let scrubbed = self.partition.borrow_mut().scrub_silo(departed);
            if scrubbed > 0 {
                tracing::info!(silo = %departed, entries = scrubbed, "scrubbed dead silo");
            }
            self.handoff_sources.borrow_mut().remove(departed);
        }

        // Cache rule: drop entries pointing at departed silos and entries
        // whose partition owner moved — they may be owned elsewhere now.
        self.cache.borrow_mut().retain(|grain, address| {
            snapshot.can_host_activations(&address.silo)
                && old_ring.partition_owner(grain) == new_ring.partition_owner(grain)
        });

        // Split entries the new ring assigns to someone else (a joiner
        // landing between us and our predecessor takes part of our range).
        if !self.handed_off.get() && new_ring.contains(&self.local) {
            let moved = self
                .partition
                .borrow()
                .collect_where(|grain| new_ring.partition_owner(grain) != Some(&self.local));
            if !moved.is_empty() {
                let directory = self.clone();
                tokio::task::spawn_local(async move {
                    directory.send_splits(moved).await;
                });
            }
        }
    }

    /// Send previously-collected entries to their new owners; remove each
    /// batch locally only after acknowledgement.
    async fn send_splits(self: Rc<Self>, addresses: Vec<GrainAddress>) {
        let mut by_owner: HashMap<SiloAddress, Vec<GrainAddress>> = HashMap::new();
        {
            let ring = self.ring.borrow();
            for address in addresses {
                match ring.partition_owner(&address.grain) {
                    Some(owner) if *owner != self.local => {
                        by_owner.entry(owner.clone()).or_default().push(address);
                    }
                    _ => {}
                }
            }
        }

        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(error) => {
                tracing::warn!(%error, "cannot split: no transport");
                return;
            }
        };
        for (owner, batch) in by_owner {
            let request = DirectoryRequest::AcceptSplit {
                source: self.local.clone(),
                addresses: batch.clone(),
            };
            match transport.send_request(&owner, request).await {
                Ok(DirectoryResponse::Done) => {
                    self.partition.borrow_mut().remove_many(&batch);
                    tracing::info!(owner = %owner, entries = batch.len(), "split acknowledged");
                }
                Ok(other) => {
                    tracing::warn!(owner = %owner, ?other, "unexpected split reply; keeping entries");
                }
                Err(error) => {
                    // Entries stay local; the next membership change (or
                    // shutdown handoff) retries.
                    tracing::warn!(owner = %owner, %error, "split failed; keeping entries");
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Bounded wait, at join time, for a predecessor to split our range to
    /// us. Proceeds regardless once the window expires; alone-on-the-ring
    /// silos skip the wait entirely.
    pub async fn wait_for_startup_stabilization(self: &Rc<Self>) {
        for _ in 0..self.config.initial_stabilization_delays {
            self.sync_membership_now();
            if self.received_first_split.get() || self.ring.borrow().len() <= 1 {
                break;
            }
            tokio::time::sleep(self.config.initial_stabilization_step).await;
        }
        self.ready.set(true);
    }

    /// Incoming reads wait for stabilization, bounded by the same window.
    async fn wait_until_ready(&self) {
        let mut waited = 0;
        while !self.ready.get() && waited < self.config.initial_stabilization_delays {
            tokio::time::sleep(self.config.initial_stabilization_step).await;
            waited += 1;
        }
    }

    /// Shutdown handoff: split the whole partition to its new owners, then
    /// route every later operation away from this silo.
    ///
    /// Call after the membership status moved to ShuttingDown, so the ring
    /// already excludes this silo.
    pub async fn perform_handoff(self: &Rc<Self>) -> Result<(), DirectoryError> {
        self.sync_membership_now();
        let items = self.partition.borrow().get_items();
        if !items.is_empty() {
            if self.ring.borrow().is_empty() {
                tracing::warn!(
                    entries = items.len(),
                    "last silo stopping; directory entries discarded"
                );
            } else {
                self.clone().send_splits(items).await;
            }
        }
        let leftover = self.partition.borrow().len();
        if leftover > 0 {
            tracing::warn!(entries = leftover, "unacknowledged entries dropped at shutdown");
        }
        self.partition.borrow_mut().clear();
        self.handed_off.set(true);
        tracing::info!("directory handoff complete");
        Ok(())
    }

    pub fn has_handed_off(&self) -> bool {
        self.handed_off.get()
    }
}

fn malformed(response: &DirectoryResponse) -> DirectoryError {
    DirectoryError::MalformedReply(format!("{response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{SharedMembership, SiloStatus};
    use grainyard_core::{ActivationId, GrainId};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            1,
        )
    }

    fn grain(key: &str) -> GrainId {
        GrainId::from_parts("test", "Counter", key).unwrap()
    }

    fn address(port: u16, key: &str) -> GrainAddress {
        GrainAddress::new(silo(port), grain(key), ActivationId::random())
    }

    /// Transport that delivers requests straight into peer directories.
    #[derive(Default)]
    struct Loopback {
        peers: RefCell<HashMap<SiloAddress, Rc<LocalGrainDirectory>>>,
    }

    impl Loopback {
        fn attach(&self, directory: Rc<LocalGrainDirectory>) {
            self.peers
                .borrow_mut()
                .insert(directory.local_silo().clone(), directory);
        }
    }

    #[async_trait(?Send)]
    impl DirectoryTransport for Loopback {
        async fn send_request(
            &self,
            owner: &SiloAddress,
            request: DirectoryRequest,
        ) -> Result<DirectoryResponse, DirectoryError> {
            let peer = self.peers.borrow().get(owner).cloned().ok_or_else(|| {
                DirectoryError::Transport(crate::error::MessageError::Unreachable(owner.clone()))
            })?;
            // Boxed so the forwarding chain may recurse through us.
            let future: futures::future::LocalBoxFuture<'_, DirectoryResponse> =
                Box::pin(async move { peer.handle_request(request).await });
            Ok(future.await)
        }
    }

    async fn single_silo_directory() -> (Rc<LocalGrainDirectory>, Rc<Loopback>) {
        let local = silo(5000);
        let membership = SharedMembership::new();
        membership
            .register_silo(local.clone(), SiloStatus::Active)
            .await
            .unwrap();
        let directory = LocalGrainDirectory::new(
            local,
            Rc::new(crate::config::SiloConfig::default()),
            membership,
        );
        let transport = Rc::new(Loopback::default());
        transport.attach(directory.clone());
        directory.set_transport(transport.clone());
        directory.mark_ready();
        directory.sync_membership_now();
        (directory, transport)
    }

    #[tokio::test]
    async fn test_local_register_lookup_unregister() {
        let (directory, _transport) = single_silo_directory().await;
        let addr = address(5000, "alice");

        let result = directory.register_single(addr.clone()).await.unwrap();
        assert_eq!(result.address, addr);

        let (found, etag) = directory.lookup(&grain("alice")).await.unwrap().unwrap();
        assert_eq!(found, vec![addr.clone()]);
        assert_eq!(etag, result.etag);

        directory
            .unregister(addr, UnregistrationCause::DeactivationCompleted)
            .await
            .unwrap();
        assert!(directory.lookup(&grain("alice")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_race_returns_winner() {
        let (directory, _transport) = single_silo_directory().await;
        let winner = address(5000, "alice");
        let loser = address(5000, "alice");

        let first = directory.register_single(winner.clone()).await.unwrap();
        let second = directory.register_single(loser.clone()).await.unwrap();

        assert_eq!(first.address, winner);
        assert_eq!(second.address, winner);
        assert_ne!(second.address.activation, loser.activation);
    }

    #[tokio::test]
    async fn test_lookup_populates_cache() {
        let (directory, _transport) = single_silo_directory().await;
        let addr = address(5000, "alice");
        directory.register_single(addr.clone()).await.unwrap();

        let (cached, _etag) = directory.lookup_cached(&grain("alice")).unwrap();
        assert_eq!(cached, addr);

        // Etag-checked invalidation leaves a newer entry alone.
        directory.invalidate_cache(&grain("alice"), Some(9999));
        assert!(directory.lookup_cached(&grain("alice")).is_some());

        directory.invalidate_cache(&grain("alice"), None);
        assert!(directory.lookup_cached(&grain("alice")).is_none());
    }

    /// Two silos with consistent views: requests for grains owned by the
    /// peer forward to it.
    #[tokio::test]
    async fn test_forwarding_to_remote_owner() {
        let a = silo(5000);
        let b = silo(5001);
        let membership = SharedMembership::new();
        membership
            .register_silo(a.clone(), SiloStatus::Active)
            .await
            .unwrap();
        membership
            .register_silo(b.clone(), SiloStatus::Active)
            .await
            .unwrap();

        let config = Rc::new(crate::config::SiloConfig::default());
        let dir_a = LocalGrainDirectory::new(a.clone(), config.clone(), membership.clone());
        let dir_b = LocalGrainDirectory::new(b.clone(), config, membership);
        let transport = Rc::new(Loopback::default());
        transport.attach(dir_a.clone());
        transport.attach(dir_b.clone());
        for directory in [&dir_a, &dir_b] {
            directory.set_transport(transport.clone());
            directory.mark_ready();
            directory.sync_membership_now();
        }

        // Find a grain owned by B and register it through A.
        let owned_by_b = (0..1000)
            .map(|i| format!("key-{i}"))
            .find(|key| dir_a.owner_of(&grain(key)) == Some(b.clone()))
            .expect("some key hashes to B");
        let addr = GrainAddress::new(a.clone(), grain(&owned_by_b), ActivationId::random());

        let result = dir_a.register_single(addr.clone()).await.unwrap();
        assert_eq!(result.address, addr);

        // The entry lives in B's partition, not A's.
        assert!(dir_b
            .partition_items()
            .iter()
            .any(|item| item.grain == addr.grain));
        assert!(!dir_a
            .partition_items()
            .iter()
            .any(|item| item.grain == addr.grain));

        // And B answers lookups issued through A.
        let (found, _) = dir_a.lookup(&grain(&owned_by_b)).await.unwrap().unwrap();
        assert_eq!(found, vec![addr]);
    }

    /// Scenario: adversarially inconsistent membership views bounce a
    /// request between two silos until the hop limit kills it.
    #[tokio::test]
    async fn test_hop_limit_stops_oscillation() {
        let a = silo(5000);
        let b = silo(5001);

        // A believes only B is active; B believes only A is active.
        let membership_a = SharedMembership::new();
        membership_a
            .register_silo(b.clone(), SiloStatus::Active)
            .await
            .unwrap();
        let membership_b = SharedMembership::new();
        membership_b
            .register_silo(a.clone(), SiloStatus::Active)
            .await
            .unwrap();

        let config = Rc::new(crate::config::SiloConfig::default());
        let dir_a = LocalGrainDirectory::new(a.clone(), config.clone(), membership_a);
        let dir_b = LocalGrainDirectory::new(b.clone(), config.clone(), membership_b);
        let transport = Rc::new(Loopback::default());
        transport.attach(dir_a.clone());
        transport.attach(dir_b.clone());
        for directory in [&dir_a, &dir_b] {
            directory.set_transport(transport.clone());
            directory.mark_ready();
            directory.sync_membership_now();
        }

        let result = dir_a.lookup(&grain("anything")).await;
        match result {
            Err(DirectoryError::HopLimitExceeded { hops }) => {
                assert_eq!(hops, config.hop_limit);
            }
            other => panic!("expected hop-limit failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handle_request_rejects_past_hop_limit() {
        let (directory, _transport) = single_silo_directory().await;
        let response = directory
            .handle_request(DirectoryRequest::Lookup {
                grain: grain("alice"),
                hop_count: directory.config.hop_limit + 1,
            })
            .await;
        assert!(matches!(
            response,
            DirectoryResponse::Rejected {
                kind: DirectoryRejectionKind::HopLimitExceeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_accept_split_and_remove_handoff() {
        let (directory, _transport) = single_silo_directory().await;
        let source = silo(5009);
        let incoming = vec![address(5003, "moved-1"), address(5003, "moved-2")];

        let response = directory
            .handle_request(DirectoryRequest::AcceptSplit {
                source: source.clone(),
                addresses: incoming.clone(),
            })
            .await;
        assert!(matches!(response, DirectoryResponse::Done));
        assert_eq!(directory.partition_items().len(), 2);

        let response = directory
            .handle_request(DirectoryRequest::RemoveHandoffPartition {
                source: source.clone(),
            })
            .await;
        assert!(matches!(response, DirectoryResponse::Done));
        assert!(directory.partition_items().is_empty());
    }

    #[tokio::test]
    async fn test_membership_death_scrubs_partition_and_cache() {
        let a = silo(5000);
        let b = silo(5001);
        let membership = SharedMembership::new();
        membership
            .register_silo(a.clone(), SiloStatus::Active)
            .await
            .unwrap();
        membership
            .register_silo(b.clone(), SiloStatus::Active)
            .await
            .unwrap();

        let directory = LocalGrainDirectory::new(
            a.clone(),
            Rc::new(crate::config::SiloConfig::default()),
            membership.clone(),
        );
        let transport = Rc::new(Loopback::default());
        transport.attach(directory.clone());
        directory.set_transport(transport.clone());
        directory.mark_ready();
        directory.sync_membership_now();

        // Seed an entry hosted on B into A's partition directly, plus a
        // cached resolution pointing at B.
        let key = (0..1000)
            .map(|i| format!("key-{i}"))
            .find(|key| directory.owner_of(&grain(key)) == Some(a.clone()))
            .expect("some key hashes to A");
        let hosted_on_b = GrainAddress::new(b.clone(), grain(&key), ActivationId::random());
        directory
            .register_single(hosted_on_b.clone())
            .await
            .unwrap();
        assert_eq!(directory.partition_items().len(), 1);
        assert!(directory.lookup_cached(&grain(&key)).is_some());

        membership
            .update_status(&b, SiloStatus::Dead)
            .await
            .unwrap();
        directory.sync_membership_now();

        assert!(directory.partition_items().is_empty());
        assert!(directory.lookup_cached(&grain(&key)).is_none());
    }

    #[tokio::test]
    async fn test_unregister_many_clears_batch() {
        let (directory, _transport) = single_silo_directory().await;
        let alice = address(5000, "alice");
        let bob = address(5000, "bob");
        directory.register_single(alice.clone()).await.unwrap();
        directory.register_single(bob.clone()).await.unwrap();
        assert_eq!(directory.partition_items().len(), 2);

        directory
            .unregister_many(vec![alice.clone(), bob], UnregistrationCause::Forced)
            .await
            .unwrap();
        assert!(directory.partition_items().is_empty());
        assert!(directory.lookup_cached(&alice.grain).is_none());
    }

    #[tokio::test]
    async fn test_lookup_many_etags() {
        let (directory, _transport) = single_silo_directory().await;
        let addr = address(5000, "alice");
        let result = directory.register_single(addr.clone()).await.unwrap();

        let response = directory
            .handle_request(DirectoryRequest::LookupMany {
                queries: vec![
                    (grain("alice"), result.etag),
                    (grain("alice"), result.etag + 100),
                    (grain("ghost"), 0),
                ],
                hop_count: 0,
            })
            .await;
        match response {
            DirectoryResponse::LookupManyResults { results } => {
                assert!(matches!(results[0], LookupOutcome::NotChanged));
                assert!(matches!(results[1], LookupOutcome::Found { .. }));
                assert!(matches!(results[2], LookupOutcome::NotFound));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// Join handoff: a new silo between the owner and its range takes the
    /// moved entries via a split, acknowledged before removal.
    #[test]
    fn test_join_triggers_split_to_new_owner() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, async {
            let a = silo(5000);
            let membership = SharedMembership::new();
            membership
                .register_silo(a.clone(), SiloStatus::Active)
                .await
                .unwrap();

            let config = Rc::new(crate::config::SiloConfig::default());
            let dir_a = LocalGrainDirectory::new(a.clone(), config.clone(), membership.clone());
            let transport = Rc::new(Loopback::default());
            transport.attach(dir_a.clone());
            dir_a.set_transport(transport.clone());
            dir_a.mark_ready();
            dir_a.sync_membership_now();

            // Alone on the ring, A owns everything.
            for i in 0..50 {
                let addr = GrainAddress::new(
                    a.clone(),
                    grain(&format!("key-{i}")),
                    ActivationId::random(),
                );
                dir_a.register_single(addr).await.unwrap();
            }
            assert_eq!(dir_a.partition_items().len(), 50);

            // B joins; entries B now owns must move there.
            let b = silo(5001);
            let dir_b = LocalGrainDirectory::new(b.clone(), config, membership.clone());
            transport.attach(dir_b.clone());
            dir_b.set_transport(transport.clone());
            dir_b.mark_ready();
            membership
                .register_silo(b.clone(), SiloStatus::Active)
                .await
                .unwrap();
            dir_b.sync_membership_now();
            dir_a.sync_membership_now();

            // Let the spawned split task run.
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;

            let moved = dir_b.partition_items().len();
            let kept = dir_a.partition_items().len();
            assert_eq!(moved + kept, 50);
            assert!(
                dir_a
                    .partition_items()
                    .iter()
                    .all(|item| dir_a.owner_of(&item.grain) == Some(a.clone())),
                "every kept entry is still owned by A"
            );
            assert!(
                dir_b
                    .partition_items()
                    .iter()
                    .all(|item| dir_b.owner_of(&item.grain) == Some(b.clone())),
                "every moved entry is owned by B"
            );
        });
    }

    /// Shutdown handoff: all entries split to the successor, and later
    /// requests reaching the stopped silo route to the new owner.
    #[test]
    fn test_shutdown_handoff_to_successor() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, async {
            let a = silo(5000);
            let b = silo(5001);
            let membership = SharedMembership::new();
            for s in [&a, &b] {
                membership
                    .register_silo(s.clone(), SiloStatus::Active)
                    .await
                    .unwrap();
            }

            let config = Rc::new(crate::config::SiloConfig::default());
            let dir_a = LocalGrainDirectory::new(a.clone(), config.clone(), membership.clone());
            let dir_b = LocalGrainDirectory::new(b.clone(), config, membership.clone());
            let transport = Rc::new(Loopback::default());
            transport.attach(dir_a.clone());
            transport.attach(dir_b.clone());
            for directory in [&dir_a, &dir_b] {
                directory.set_transport(transport.clone());
                directory.mark_ready();
                directory.sync_membership_now();
            }

            // Register entries owned by A.
            let mut registered = Vec::new();
            for i in 0..200 {
                let key = format!("key-{i}");
                if dir_a.owner_of(&grain(&key)) == Some(a.clone()) {
                    let addr =
                        GrainAddress::new(b.clone(), grain(&key), ActivationId::random());
                    dir_a.register_single(addr.clone()).await.unwrap();
                    registered.push(addr);
                }
            }
            assert!(!registered.is_empty());

            // A shuts down: status change, then handoff.
            membership
                .update_status(&a, SiloStatus::ShuttingDown)
                .await
                .unwrap();
            dir_a.sync_membership_now();
            dir_a.perform_handoff().await.unwrap();
            assert!(dir_a.has_handed_off());
            assert!(dir_a.partition_items().is_empty());

            // B holds everything now.
            assert_eq!(dir_b.partition_items().len(), registered.len());

            // A request that still reaches A comes back with B's answer.
            let sample = &registered[0];
            let response = dir_a
                .handle_request(DirectoryRequest::Lookup {
                    grain: sample.grain.clone(),
                    hop_count: 0,
                })
                .await;
            match response {
                DirectoryResponse::Found { addresses, .. } => {
                    assert_eq!(addresses, vec![sample.clone()]);
                }
                other => panic!("unexpected: {other:?}"),
            }
        });
    }
}
