//! Shared harness for multi-silo integration tests.

use grainyard::error::CallError;
use grainyard::grain::{GrainContext, MethodTable};
use grainyard::prelude::*;
use std::cell::RefCell;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

thread_local! {
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    static ACTIVATIONS: RefCell<usize> = const { RefCell::new(0) };
}

pub fn record(event: impl Into<String>) {
    EVENTS.with(|events| events.borrow_mut().push(event.into()));
}

pub fn take_events() -> Vec<String> {
    EVENTS.with(|events| events.borrow_mut().drain(..).collect())
}

pub fn activation_count() -> usize {
    ACTIVATIONS.with(|count| *count.borrow())
}

pub fn reset_probes() {
    EVENTS.with(|events| events.borrow_mut().clear());
    ACTIVATIONS.with(|count| *count.borrow_mut() = 0);
}

/// Run a future on a current-thread runtime with a `LocalSet`, the way a
/// silo process would.
pub fn run_local<F: Future<Output = ()>>(future: F) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, future);
}

/// Configuration tuned so churn-sensitive paths run in milliseconds.
pub fn test_config() -> SiloConfig {
    let mut config = SiloConfig::default();
    config.response_timeout = Duration::from_secs(2);
    config.retry_backoff = Duration::from_millis(5);
    config.initial_stabilization_delays = 4;
    config.initial_stabilization_step = Duration::from_millis(10);
    config.collection_quantum = Duration::from_millis(20);
    config.collection_age_default = Duration::from_secs(60);
    config.client_drop_timeout = Duration::from_millis(200);
    config
}

pub fn silo_address(port: u16) -> SiloAddress {
    SiloAddress::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), 1)
}

/// An in-process cluster sharing one membership table and network fabric.
pub struct TestCluster {
    pub membership: Rc<SharedMembership>,
    pub network: Rc<InProcessNetwork>,
    pub silos: Vec<Rc<Silo>>,
}

impl TestCluster {
    /// Start `count` silos, customizing each builder through `configure`.
    pub async fn start(
        count: usize,
        base_port: u16,
        configure: impl Fn(grainyard::runtime::SiloBuilder) -> grainyard::runtime::SiloBuilder,
    ) -> Self {
        let membership = SharedMembership::new();
        let network = InProcessNetwork::new();
        let mut silos = Vec::new();
        for i in 0..count {
            let builder = grainyard::runtime::SiloBuilder::new(silo_address(base_port + i as u16))
                .config(test_config())
                .membership(membership.clone())
                .network(network.clone());
            let silo = configure(builder).build().expect("silo builds");
            silo.start().await.expect("silo starts");
            silos.push(silo);
        }
        Self {
            membership,
            network,
            silos,
        }
    }

    /// The silo currently hosting a Valid activation of `grain`, if any.
    pub fn host_of(&self, grain: &GrainId) -> Option<Rc<Silo>> {
        self.silos
            .iter()
            .find(|silo| {
                silo.catalog()
                    .get(grain)
                    .map(|activation| activation.is_valid())
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// Number of silos holding any record for `grain`.
    pub fn activation_records(&self, grain: &GrainId) -> usize {
        self.silos
            .iter()
            .filter(|silo| silo.catalog().get(grain).is_some())
            .count()
    }
}

// ---------------------------------------------------------------
// Test grains
// ---------------------------------------------------------------

pub mod counter_methods {
    pub const ADD: u32 = 1;
    pub const GET: u32 = 2;
    pub const LOG: u32 = 3;
    pub const WHOAMI: u32 = 4;
    pub const FAIL: u32 = 5;
    pub const SLOW_GET: u32 = 6;
}

/// Single-activation counter with probes for activation and event order.
pub struct Counter {
    value: i64,
}

#[async_trait::async_trait(?Send)]
impl Grain for Counter {
    const KIND: &'static str = "Counter";
    const INTERFACE_ID: u32 = 100;

    fn create(_id: &GrainId) -> Self {
        Self { value: 0 }
    }

    async fn on_activate(&mut self, _ctx: &GrainContext) -> Result<(), CallError> {
        ACTIVATIONS.with(|count| *count.borrow_mut() += 1);
        Ok(())
    }

    fn register_methods(table: &mut MethodTable<Self>) {
        table.register(
            counter_methods::ADD,
            |cell, delta: i64, _ctx| async move {
                Ok(cell.with_mut(|g| {
                    g.value += delta;
                    g.value
                }))
            },
        );
        table.register_read_only(counter_methods::GET, |cell, _: (), _ctx| async move {
            Ok(cell.with(|g| g.value))
        });
        table.register(counter_methods::LOG, |_cell, tag: String, _ctx| async move {
            record(format!("log:{tag}"));
            Ok(())
        });
        table.register(
            counter_methods::WHOAMI,
            |_cell, _: (), ctx: GrainContext| async move {
                Ok(ctx.address().activation.to_string())
            },
        );
        table.register(counter_methods::FAIL, |_cell, _: (), _ctx| async move {
            Err::<i64, _>(CallError::Application("deliberate failure".into()))
        });
        table.register_with_flags(
            counter_methods::SLOW_GET,
            MessageFlags::READ_ONLY,
            |cell, tag: String, ctx: GrainContext| async move {
                record(format!("slow-start:{tag}"));
                ctx.delay(std::time::Duration::from_millis(40)).await;
                record(format!("slow-end:{tag}"));
                Ok(cell.with(|g| g.value))
            },
        );
    }
}

pub mod chat_methods {
    pub const SLOW: u32 = 1;
    pub const PING: u32 = 2;
}

/// Reentrant grain: suspended turns interleave with new ones.
pub struct Chat;

impl Grain for Chat {
    const KIND: &'static str = "Chat";
    const INTERFACE_ID: u32 = 101;

    fn reentrant() -> bool {
        true
    }

    fn create(_id: &GrainId) -> Self {
        Self
    }

    fn register_methods(table: &mut MethodTable<Self>) {
        table.register(chat_methods::SLOW, |_cell, tag: String, ctx: GrainContext| {
            async move {
                record(format!("start:{tag}"));
                ctx.delay(std::time::Duration::from_millis(40)).await;
                record(format!("end:{tag}"));
                Ok(tag)
            }
        });
        table.register(chat_methods::PING, |_cell, tag: String, _ctx| async move {
            record(format!("ping:{tag}"));
            Ok(())
        });
    }
}

/// Non-reentrant twin of [`Chat`]: turns run strictly one at a time.
pub struct Journal;

impl Grain for Journal {
    const KIND: &'static str = "Journal";
    const INTERFACE_ID: u32 = 102;

    fn create(_id: &GrainId) -> Self {
        Self
    }

    fn register_methods(table: &mut MethodTable<Self>) {
        table.register(chat_methods::SLOW, |_cell, tag: String, ctx: GrainContext| {
            async move {
                record(format!("start:{tag}"));
                ctx.delay(std::time::Duration::from_millis(40)).await;
                record(format!("end:{tag}"));
                Ok(tag)
            }
        });
        table.register(chat_methods::PING, |_cell, tag: String, _ctx| async move {
            record(format!("ping:{tag}"));
            Ok(())
        });
    }
}

/// Grain whose initialization always fails.
pub struct Flaky;

#[async_trait::async_trait(?Send)]
impl Grain for Flaky {
    const KIND: &'static str = "Flaky";
    const INTERFACE_ID: u32 = 103;

    fn create(_id: &GrainId) -> Self {
        Self
    }

    fn register_methods(table: &mut MethodTable<Self>) {
        table.register(1, |_cell, _: (), _ctx| async move { Ok(0i64) });
    }

    async fn on_activate(&mut self, _ctx: &GrainContext) -> Result<(), CallError> {
        Err(CallError::Application("refuses to start".into()))
    }
}

/// Grain type never registered on any silo.
pub struct Ghost;

impl Grain for Ghost {
    const KIND: &'static str = "Ghost";
    const INTERFACE_ID: u32 = 104;

    fn create(_id: &GrainId) -> Self {
        Self
    }

    fn register_methods(_table: &mut MethodTable<Self>) {}
}
