//! Grainyard: a distributed virtual-actor runtime in the Orleans mold.
//!
//! A cluster of cooperating server processes ("silos") hosts large numbers
//! of fine-grained, individually-addressable, stateful, single-threaded
//! logical entities ("grains"). Callers invoke grains through typed
//! references whose identity is independent of physical location; the
//! runtime activates a grain on some silo at first call, routes messages
//! to it, keeps it alive while busy, and collects it when idle. Grains are
//! never accessed concurrently: execution is single-threaded per
//! activation even across re-entrant async calls.
//!
//! # Core Concepts
//!
//! - **Location transparency**: grains addressed by [`prelude::GrainId`],
//!   never by silo
//! - **Distributed directory**: a consistent-hash partitioned registry of
//!   activation locations with a read-through cache, hop-limited
//!   forwarding, and handoff during membership churn
//! - **On-demand activation**: first message creates the activation;
//!   the single-activation guarantee is enforced through directory
//!   registration races
//! - **Cooperative scheduling**: strict-FIFO turns per activation, with
//!   opt-in reentrancy and read-only interleaving
//! - **Gateway**: external clients connect to any silo's gateway and call
//!   grains as if they were local
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use grainyard::prelude::*;
//!
//! struct Counter {
//!     value: i64,
//! }
//!
//! impl Grain for Counter {
//!     const KIND: &'static str = "Counter";
//!     const INTERFACE_ID: u32 = 100;
//!
//!     fn create(_id: &GrainId) -> Self {
//!         Self { value: 0 }
//!     }
//!
//!     fn register_methods(table: &mut MethodTable<Self>) {
//!         table.register(1, |cell, delta: i64, _ctx| async move {
//!             Ok(cell.with_mut(|g| {
//!                 g.value += delta;
//!                 g.value
//!             }))
//!         });
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let membership = SharedMembership::new();
//! let network = InProcessNetwork::new();
//! let silo = SiloBuilder::new(SiloAddress::parse("127.0.0.1:5000@1")?)
//!     .membership(membership)
//!     .network(network)
//!     .register_grain::<Counter>()
//!     .build()?;
//! silo.start().await?;
//!
//! let counter = silo.grain_ref::<Counter>("hits");
//! let value: i64 = counter.call(1, &1i64).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       Silo                             │
//! │  (address, config, membership view)                    │
//! └──────┬──────────────┬───────────────┬──────────────────┘
//!        │              │               │
//!        ▼              ▼               ▼
//!  ┌──────────┐  ┌─────────────┐  ┌───────────────────┐
//!  │ Catalog  │  │ MessageCenter│  │ LocalGrainDirectory│
//!  │ (records,│  │ (routing,   │  │ (partition, ring, │
//!  │  pumps,  │  │  correlation,│  │  cache, handoff)  │
//!  │  collector)│ │  retries)   │  │                   │
//!  └──────────┘  └─────────────┘  └───────────────────┘
//! ```

pub mod catalog;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod grain;
pub mod membership;
pub mod messaging;
pub mod runtime;
pub mod scheduler;

pub mod prelude;
