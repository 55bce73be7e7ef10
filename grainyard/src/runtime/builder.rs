//! Silo construction.

use crate::catalog::Catalog;
use crate::config::SiloConfig;
use crate::directory::{DirectoryTarget, LocalGrainDirectory, DIRECTORY_INTERFACE_ID};
use crate::error::SiloError;
use crate::grain::{Grain, GrainRegistry};
use crate::membership::MembershipService;
use crate::messaging::{InProcessNetwork, MessageCenter, SiloTransport, TcpTransport};
use crate::runtime::Silo;
use crate::scheduler::SiloScheduler;
use grainyard_core::SiloAddress;
use std::rc::Rc;

enum TransportChoice {
    InProcess(Rc<InProcessNetwork>),
    Tcp(Rc<TcpTransport>),
}

/// Builder wiring a [`Silo`] from its collaborators.
///
/// # Example
///
/// ```rust,ignore
/// let membership = SharedMembership::new();
/// let network = InProcessNetwork::new();
///
/// let silo = SiloBuilder::new(address)
///     .config(SiloConfig::default())
///     .membership(membership.clone())
///     .network(network.clone())
///     .register_grain::<Thermostat>()
///     .build()?;
/// silo.start().await?;
/// ```
pub struct SiloBuilder {
    address: SiloAddress,
    config: SiloConfig,
    membership: Option<Rc<dyn MembershipService>>,
    transport: Option<TransportChoice>,
    registry: GrainRegistry,
}

impl SiloBuilder {
    pub fn new(address: SiloAddress) -> Self {
        Self {
            address,
            config: SiloConfig::default(),
            membership: None,
            transport: None,
            registry: GrainRegistry::new(),
        }
    }

    /// Replace the default configuration.
    pub fn config(mut self, config: SiloConfig) -> Self {
        self.config = config;
        self
    }

    /// Membership provider this silo reads the cluster through.
    pub fn membership(mut self, membership: Rc<dyn MembershipService>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Join an in-process network (simulation and tests).
    pub fn network(mut self, network: Rc<InProcessNetwork>) -> Self {
        self.transport = Some(TransportChoice::InProcess(network));
        self
    }

    /// Use a TCP transport for silo-to-silo links.
    pub fn tcp_transport(mut self, transport: Rc<TcpTransport>) -> Self {
        self.transport = Some(TransportChoice::Tcp(transport));
        self
    }

    /// Host a grain class on this silo.
    pub fn register_grain<G: Grain>(mut self) -> Self {
        self.registry.register::<G>();
        self
    }

    /// Wire everything. The silo is inert until [`Silo::start`].
    pub fn build(self) -> Result<Rc<Silo>, SiloError> {
        let membership = self
            .membership
            .ok_or_else(|| SiloError::Config("membership provider required".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| SiloError::Config("transport required".into()))?;
        let config = Rc::new(self.config);
        let mut registry = self.registry;

        let scheduler = SiloScheduler::new();
        let directory =
            LocalGrainDirectory::new(self.address.clone(), config.clone(), membership.clone());

        // The directory system target serves peer requests through the
        // regular catalog/scheduler path.
        {
            let directory = directory.clone();
            registry.register_system_target("Directory", DIRECTORY_INTERFACE_ID, move |_id| {
                Rc::new(DirectoryTarget::new(directory.clone())) as Rc<dyn crate::grain::GrainRuntime>
            });
        }

        let transport_handle: Rc<dyn SiloTransport> = match &transport {
            TransportChoice::InProcess(network) => network.clone() as Rc<dyn SiloTransport>,
            TransportChoice::Tcp(tcp) => tcp.clone() as Rc<dyn SiloTransport>,
        };
        let center = MessageCenter::new(
            self.address.clone(),
            config.clone(),
            transport_handle,
            scheduler.clone(),
            membership.clone(),
        );
        let catalog = Catalog::new(
            self.address.clone(),
            config.clone(),
            registry,
            scheduler.clone(),
        );

        catalog.set_center(center.clone());
        catalog.set_directory(directory.clone());
        center.set_catalog(catalog.clone());
        center.set_directory(directory.clone());
        directory.set_transport(center.clone());

        match transport {
            TransportChoice::InProcess(network) => {
                network.attach(self.address.clone(), center.clone());
            }
            TransportChoice::Tcp(tcp) => {
                tcp.set_center(center.clone());
            }
        }

        Ok(Silo::wire(
            self.address,
            config,
            membership,
            scheduler,
            catalog,
            directory,
            center,
        ))
    }
}
