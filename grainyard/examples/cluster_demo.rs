//! Three silos in one process, a counter grain, and a burst of calls.
//!
//! Run with: `cargo run --example cluster_demo`

use grainyard::grain::MethodTable;
use grainyard::prelude::*;
use grainyard::runtime::SiloBuilder;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

struct Counter {
    value: i64,
}

impl Grain for Counter {
    const KIND: &'static str = "Counter";
    const INTERFACE_ID: u32 = 100;

    fn create(_id: &GrainId) -> Self {
        Self { value: 0 }
    }

    fn register_methods(table: &mut MethodTable<Self>) {
        table.register(1, |cell, delta: i64, _ctx| async move {
            Ok(cell.with_mut(|g| {
                g.value += delta;
                g.value
            }))
        });
        table.register_read_only(2, |cell, _: (), _ctx| async move {
            Ok(cell.with(|g| g.value))
        });
    }
}

fn address(port: u16) -> SiloAddress {
    SiloAddress::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), 1)
}

async fn demo() -> Result<(), Box<dyn std::error::Error>> {
    let membership = SharedMembership::new();
    let network = InProcessNetwork::new();

    let mut silos: Vec<Rc<Silo>> = Vec::new();
    for port in [5000u16, 5001, 5002] {
        let silo = SiloBuilder::new(address(port))
            .membership(membership.clone())
            .network(network.clone())
            .register_grain::<Counter>()
            .build()?;
        silo.start().await?;
        silos.push(silo);
    }

    // Calls from any silo land on the same single activation.
    for (i, silo) in silos.iter().enumerate() {
        let counter = silo.grain_ref::<Counter>("shared");
        let value: i64 = counter.call(1, &1i64).await?;
        println!("call {} from {} -> {}", i + 1, silo.address(), value);
    }

    let total: i64 = silos[0]
        .grain_ref::<Counter>("shared")
        .call(2, &())
        .await?;
    println!("final value: {total}");

    for silo in &silos {
        silo.shutdown().await?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, demo())
}
