//! The grain capability surface: lifecycle hooks plus a method table.

use crate::error::CallError;
use crate::grain::{GrainContext, MethodTable};
use async_trait::async_trait;
use grainyard_core::GrainId;
use serde::{Deserialize, Serialize};

/// What flavor of grain a class is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrainKind {
    /// Ordinary stateful grain: single activation, directory-registered,
    /// idle-collected.
    Stateful,
    /// Stateless worker: multiple activations allowed, placed locally.
    StatelessWorker,
    /// Runtime-internal target: one per silo, never registered in the
    /// directory, never collected.
    SystemTarget,
}

/// Why an activation is being torn down, passed to `on_deactivate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeactivationReason {
    /// Idle longer than the collection age limit.
    IdleCollection,
    /// Explicit request (application or operator).
    ExplicitRequest,
    /// The hosting silo is shutting down.
    SiloShutdown,
    /// `on_activate` failed.
    ActivationFailed,
    /// Lost the single-activation registration race; user code never ran.
    LostRegistrationRace,
}

impl DeactivationReason {
    /// True when the activation is being removed without having served.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            DeactivationReason::ActivationFailed | DeactivationReason::LostRegistrationRace
        )
    }
}

/// A virtual actor implementation.
///
/// Grains are values: the runtime instantiates one with [`Grain::create`]
/// when the first message arrives, drives its lifecycle hooks, and routes
/// invocations through the [`MethodTable`] the class registers. The
/// instance lives behind a shared cell so that reentrant classes can
/// interleave suspended turns; see [`crate::grain::GrainCell`].
///
/// # Example
///
/// ```rust,ignore
/// struct Thermostat {
///     last_reading: i32,
/// }
///
/// impl Grain for Thermostat {
///     const KIND: &'static str = "Thermostat";
///     const INTERFACE_ID: u32 = 100;
///
///     fn create(_id: &GrainId) -> Self {
///         Self { last_reading: 0 }
///     }
///
///     fn register_methods(table: &mut MethodTable<Self>) {
///         table.register(1, |cell, update: i32, _ctx| async move {
///             cell.with_mut(|g| g.last_reading = update);
///             Ok(())
///         });
///         table.register_read_only(2, |cell, _: (), _ctx| async move {
///             Ok(cell.with(|g| g.last_reading))
///         });
///     }
/// }
/// ```
#[async_trait(?Send)]
pub trait Grain: Sized + 'static {
    /// Grain class name; the `kind` component of every [`GrainId`] of this
    /// class.
    const KIND: &'static str;

    /// Interface id stamped on every frame addressed to this class.
    const INTERFACE_ID: u32;

    /// Flavor of this class.
    fn grain_kind() -> GrainKind {
        GrainKind::Stateful
    }

    /// Whether suspended turns on this class may interleave.
    ///
    /// The `reentrancy` configuration option can additionally opt a kind
    /// in at runtime.
    fn reentrant() -> bool {
        false
    }

    /// Instantiate the grain for an identity (state loading is the
    /// implementation's business, typically in `on_activate`).
    fn create(id: &GrainId) -> Self;

    /// Register invocable methods.
    fn register_methods(table: &mut MethodTable<Self>);

    /// Runs after instantiation, before the first turn. Failure tears the
    /// slot down and surfaces to the caller as unrecoverable.
    async fn on_activate(&mut self, _ctx: &GrainContext) -> Result<(), CallError> {
        Ok(())
    }

    /// Runs after the queue drained, before the activation is removed.
    async fn on_deactivate(&mut self, _reason: DeactivationReason) -> Result<(), CallError> {
        Ok(())
    }
}
