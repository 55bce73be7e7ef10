//! One silo: the wired-together runtime.

use crate::catalog::Catalog;
use crate::config::SiloConfig;
use crate::directory::{directory_target, LocalGrainDirectory};
use crate::error::SiloError;
use crate::gateway::Gateway;
use crate::grain::{DeactivationReason, Grain, GrainRef};
use crate::membership::{
    ClusterMembershipSnapshot, MembershipDelta, MembershipService, SiloStatus,
};
use crate::messaging::MessageCenter;
use crate::scheduler::SiloScheduler;
use grainyard_core::{GrainId, SiloAddress};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Bound on waiting for in-flight turns at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A server process hosting grains.
///
/// Wires membership, directory, catalog, scheduler, and message center;
/// drives the silo lifecycle `Joining → Active → ShuttingDown → Stopping
/// → Dead` through the membership service and the directory handoff
/// protocol. Construct through [`crate::runtime::SiloBuilder`].
pub struct Silo {
    address: SiloAddress,
    config: Rc<SiloConfig>,
    membership: Rc<dyn MembershipService>,
    scheduler: Rc<SiloScheduler>,
    catalog: Rc<Catalog>,
    directory: Rc<LocalGrainDirectory>,
    center: Rc<MessageCenter>,
    gateway: RefCell<Option<Rc<Gateway>>>,
    started: Cell<bool>,
}

impl Silo {
    pub(crate) fn wire(
        address: SiloAddress,
        config: Rc<SiloConfig>,
        membership: Rc<dyn MembershipService>,
        scheduler: Rc<SiloScheduler>,
        catalog: Rc<Catalog>,
        directory: Rc<LocalGrainDirectory>,
        center: Rc<MessageCenter>,
    ) -> Rc<Self> {
        Rc::new(Self {
            address,
            config,
            membership,
            scheduler,
            catalog,
            directory,
            center,
            gateway: RefCell::new(None),
            started: Cell::new(false),
        })
    }

    pub fn address(&self) -> &SiloAddress {
        &self.address
    }

    pub fn config(&self) -> &Rc<SiloConfig> {
        &self.config
    }

    pub fn catalog(&self) -> &Rc<Catalog> {
        &self.catalog
    }

    pub fn directory(&self) -> &Rc<LocalGrainDirectory> {
        &self.directory
    }

    pub fn center(&self) -> &Rc<MessageCenter> {
        &self.center
    }

    pub fn scheduler(&self) -> &Rc<SiloScheduler> {
        &self.scheduler
    }

    /// Join the cluster: register as Joining, create the directory system
    /// target, wait for initial stabilization, then go Active.
    pub async fn start(self: &Rc<Self>) -> Result<(), SiloError> {
        if self.started.replace(true) {
            return Ok(());
        }
        tracing::info!(silo = %self.address, "silo starting");
        self.membership
            .register_silo(self.address.clone(), SiloStatus::Joining)
            .await?;

        self.spawn_membership_watch();

        self.catalog
            .ensure_system_target(directory_target(&self.address))
            .await?;

        self.membership
            .update_status(&self.address, SiloStatus::Active)
            .await?;
        self.directory.sync_membership_now();

        // Now on the ring: give predecessors a bounded window to split our
        // range to us before serving directory reads.
        self.directory.wait_for_startup_stabilization().await;

        self.spawn_collection_sweep();
        tracing::info!(silo = %self.address, "silo active");
        Ok(())
    }

    /// Graceful shutdown: hand off the directory partition, drain turns,
    /// report Dead.
    pub async fn shutdown(self: &Rc<Self>) -> Result<(), SiloError> {
        tracing::info!(silo = %self.address, "silo shutting down");
        self.membership
            .update_status(&self.address, SiloStatus::ShuttingDown)
            .await?;
        self.directory.sync_membership_now();

        // Split the partition to its new owners before reporting Stopping.
        self.directory.perform_handoff().await?;

        self.membership
            .update_status(&self.address, SiloStatus::Stopping)
            .await?;

        // Application turns stop; the system pool drains.
        self.scheduler.stop_application_turns();
        self.catalog.deactivate_all(DeactivationReason::SiloShutdown);
        self.scheduler.begin_shutdown();
        if !self.scheduler.drain(DRAIN_TIMEOUT).await {
            tracing::warn!(silo = %self.address, "drain timeout; stopping anyway");
        }

        self.membership
            .update_status(&self.address, SiloStatus::Dead)
            .await?;
        tracing::info!(silo = %self.address, "silo stopped");
        Ok(())
    }

    /// Typed reference to a grain of class `G`, originated by this silo's
    /// runtime identity.
    pub fn grain_ref<G: Grain>(&self, key: impl Into<String>) -> GrainRef<G> {
        GrainRef::new(
            GrainId {
                namespace: self.config.namespace.clone(),
                kind: G::KIND.to_string(),
                key: key.into(),
            },
            self.runtime_id(),
            self.center.clone(),
        )
    }

    /// The grain identity runtime-originated calls carry as their sender.
    pub fn runtime_id(&self) -> GrainId {
        GrainId {
            namespace: "sys".to_string(),
            kind: "Runtime".to_string(),
            key: self.address.to_string(),
        }
    }

    /// Start serving external clients on `listener`.
    pub fn serve_gateway(self: &Rc<Self>, listener: TcpListener) -> Rc<Gateway> {
        let gateway = Gateway::new(self.address.clone(), self.config.clone(), self.center.clone());
        self.center.set_client_router(gateway.clone());
        gateway.start(listener);
        *self.gateway.borrow_mut() = Some(gateway.clone());
        tracing::info!(silo = %self.address, "gateway serving");
        gateway
    }

    /// Attach a gateway without a listener (in-process clients, tests).
    pub fn attach_gateway(self: &Rc<Self>) -> Rc<Gateway> {
        let gateway = Gateway::new(self.address.clone(), self.config.clone(), self.center.clone());
        self.center.set_client_router(gateway.clone());
        *self.gateway.borrow_mut() = Some(gateway.clone());
        gateway
    }

    pub fn gateway(&self) -> Option<Rc<Gateway>> {
        self.gateway.borrow().clone()
    }

    /// Watch membership, feeding deltas to the directory, catalog, and
    /// message center.
    fn spawn_membership_watch(self: &Rc<Self>) {
        let silo = self.clone();
        tokio::task::spawn_local(async move {
            let mut receiver = silo.membership.subscribe();
            let mut previous: ClusterMembershipSnapshot = receiver.borrow().clone();
            silo.directory.on_membership_update(previous.clone());

            while receiver.changed().await.is_ok() {
                let snapshot = receiver.borrow().clone();
                let delta = MembershipDelta::between(&previous, &snapshot);
                previous = snapshot.clone();
                if delta.is_empty() {
                    continue;
                }
                tracing::debug!(
                    silo = %silo.address,
                    version = %snapshot.version,
                    added = delta.added.len(),
                    removed = delta.removed.len(),
                    changed = delta.status_changed.len(),
                    "membership update"
                );

                silo.directory.on_membership_update(snapshot.clone());
                for departed in &delta.removed {
                    silo.center.on_silo_dead(departed);
                    silo.catalog.on_silo_status_change(departed, true);
                }
                for (changed, status) in &delta.status_changed {
                    silo.catalog
                        .on_silo_status_change(changed, status.is_terminating());
                }
                if silo.scheduler.is_shutting_down() {
                    break;
                }
            }
        });
    }

    /// Periodic collection sweep; collected activations drain and tear
    /// themselves down on their own pumps.
    fn spawn_collection_sweep(self: &Rc<Self>) {
        let silo = self.clone();
        let period = (self.config.collection_quantum / 2).max(Duration::from_millis(10));
        tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(period).await;
                if silo.scheduler.is_shutting_down() {
                    break;
                }
                let collected = silo.catalog.collector().scan_stale();
                if !collected.is_empty() {
                    tracing::debug!(
                        silo = %silo.address,
                        count = collected.len(),
                        "collection sweep"
                    );
                }
            }
        });
    }
}

impl std::fmt::Debug for Silo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Silo")
            .field("address", &self.address)
            .field("activations", &self.catalog.activation_count())
            .finish()
    }
}
