//! Method dispatch: from `(interface_id, method_id)` to typed handlers.
//!
//! Rust has no runtime reflection, so each grain class registers its
//! methods as type-erased closures that decode the request body, run the
//! typed handler, and encode the result. The registry replaces what a stub
//! generator would emit.

use crate::error::CallError;
use crate::grain::{DeactivationReason, Grain, GrainContext, GrainKind};
use crate::messaging::{Message, MessageFlags};
use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use grainyard_core::GrainId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

/// Shared handle to a grain instance.
///
/// Turns access state through this cell. A borrow must not be held across
/// an await on a reentrant class — take it, read or write, release, then
/// suspend; the scheduler interleaves other turns only at those suspension
/// points, so segment-wise borrows never collide. Non-reentrant classes
/// run one turn at a time and may hold a borrow as long as they like.
pub struct GrainCell<G>(Rc<RefCell<G>>);

impl<G> GrainCell<G> {
    pub fn new(grain: G) -> Self {
        Self(Rc::new(RefCell::new(grain)))
    }

    /// Run a closure over the grain immutably.
    pub fn with<R>(&self, f: impl FnOnce(&G) -> R) -> R {
        f(&self.0.borrow())
    }

    /// Run a closure over the grain mutably.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut G) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    /// Direct borrow for multi-statement synchronous segments.
    pub fn borrow(&self) -> Ref<'_, G> {
        self.0.borrow()
    }

    /// Direct mutable borrow for multi-statement synchronous segments.
    pub fn borrow_mut(&self) -> RefMut<'_, G> {
        self.0.borrow_mut()
    }
}

impl<G> Clone for GrainCell<G> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// A running turn: decode, execute, encode.
///
/// Resolves to the JSON value the response body carries, or the error the
/// caller observes as a failed call.
pub type TurnFuture = LocalBoxFuture<'static, Result<serde_json::Value, CallError>>;

type MethodFn<G> = Box<dyn Fn(GrainCell<G>, bytes::Bytes, GrainContext) -> TurnFuture>;

struct MethodEntry<G> {
    handler: MethodFn<G>,
    flags: MessageFlags,
}

/// Registry mapping method ids to type-erased handlers for one grain class.
pub struct MethodTable<G> {
    methods: HashMap<u32, MethodEntry<G>>,
}

impl<G: Grain> MethodTable<G> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a handler with explicit message flags.
    ///
    /// The handler receives the grain cell (cloneable into the turn), the
    /// decoded request, and the invocation context for sub-calls.
    pub fn register_with_flags<Req, Res, F, Fut>(&mut self, method_id: u32, flags: MessageFlags, f: F)
    where
        Req: DeserializeOwned + 'static,
        Res: Serialize + 'static,
        F: Fn(GrainCell<G>, Req, GrainContext) -> Fut + 'static,
        Fut: std::future::Future<Output = Result<Res, CallError>> + 'static,
    {
        let f = Rc::new(f);
        let handler: MethodFn<G> = Box::new(move |cell, body, ctx| {
            let f = f.clone();
            Box::pin(async move {
                let request: Req = serde_json::from_slice(&body)
                    .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e)))?;
                let response = f(cell, request, ctx).await?;
                serde_json::to_value(response)
                    .map_err(|e| CallError::Message(crate::error::MessageError::Serialization(e)))
            })
        });
        self.methods.insert(method_id, MethodEntry { handler, flags });
    }

    /// Register an ordinary (exclusive) method.
    pub fn register<Req, Res, F, Fut>(&mut self, method_id: u32, f: F)
    where
        Req: DeserializeOwned + 'static,
        Res: Serialize + 'static,
        F: Fn(GrainCell<G>, Req, GrainContext) -> Fut + 'static,
        Fut: std::future::Future<Output = Result<Res, CallError>> + 'static,
    {
        self.register_with_flags(method_id, MessageFlags::empty(), f);
    }

    /// Register a read-only method, interleavable with other read-only
    /// turns.
    pub fn register_read_only<Req, Res, F, Fut>(&mut self, method_id: u32, f: F)
    where
        Req: DeserializeOwned + 'static,
        Res: Serialize + 'static,
        F: Fn(GrainCell<G>, Req, GrainContext) -> Fut + 'static,
        Fut: std::future::Future<Output = Result<Res, CallError>> + 'static,
    {
        self.register_with_flags(method_id, MessageFlags::READ_ONLY, f);
    }

    pub fn method_flags(&self, method_id: u32) -> MessageFlags {
        self.methods
            .get(&method_id)
            .map(|entry| entry.flags)
            .unwrap_or(MessageFlags::empty())
    }

    pub fn has_method(&self, method_id: u32) -> bool {
        self.methods.contains_key(&method_id)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<G: Grain> Default for MethodTable<G> {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased host the runtime holds an activation's grain behind.
///
/// The catalog never sees concrete grain types; it drives lifecycle and
/// turn creation through this handle.
#[async_trait(?Send)]
pub trait GrainRuntime {
    fn interface_id(&self) -> u32;
    fn grain_kind(&self) -> GrainKind;
    async fn activate(&self, ctx: &GrainContext) -> Result<(), CallError>;
    async fn deactivate(&self, reason: DeactivationReason) -> Result<(), CallError>;
    /// Build the turn future for an incoming invocation.
    fn create_turn(&self, message: &Message, ctx: GrainContext) -> Result<TurnFuture, CallError>;
    /// Interleaving flags of a method, consulted on dequeue.
    fn method_flags(&self, method_id: u32) -> MessageFlags;
}

/// Concrete host binding a grain instance to its class method table.
pub struct GrainHost<G: Grain> {
    cell: GrainCell<G>,
    table: Rc<MethodTable<G>>,
}

impl<G: Grain> GrainHost<G> {
    pub fn new(cell: GrainCell<G>, table: Rc<MethodTable<G>>) -> Self {
        Self { cell, table }
    }
}

#[async_trait(?Send)]
impl<G: Grain> GrainRuntime for GrainHost<G> {
    fn interface_id(&self) -> u32 {
        G::INTERFACE_ID
    }

    fn grain_kind(&self) -> GrainKind {
        G::grain_kind()
    }

    async fn activate(&self, ctx: &GrainContext) -> Result<(), CallError> {
        // Exclusive phase: no turns run during activation, so holding the
        // borrow across the await cannot collide.
        self.cell.0.borrow_mut().on_activate(ctx).await
    }

    async fn deactivate(&self, reason: DeactivationReason) -> Result<(), CallError> {
        self.cell.0.borrow_mut().on_deactivate(reason).await
    }

    fn create_turn(&self, message: &Message, ctx: GrainContext) -> Result<TurnFuture, CallError> {
        if message.interface_id != G::INTERFACE_ID {
            return Err(CallError::UnknownMethod {
                interface: message.interface_id,
                method: message.method_id,
            });
        }
        let entry = self
            .table
            .methods
            .get(&message.method_id)
            .ok_or(CallError::UnknownMethod {
                interface: message.interface_id,
                method: message.method_id,
            })?;
        Ok((entry.handler)(self.cell.clone(), message.body.clone(), ctx))
    }

    fn method_flags(&self, method_id: u32) -> MessageFlags {
        self.table.method_flags(method_id)
    }
}

/// Per-class registration record in the grain registry.
pub struct GrainClass {
    pub interface_id: u32,
    pub grain_kind: GrainKind,
    pub reentrant: bool,
    pub age_limit: Option<Duration>,
    factory: Box<dyn Fn(&GrainId) -> Rc<dyn GrainRuntime>>,
}

impl GrainClass {
    pub fn instantiate(&self, id: &GrainId) -> Rc<dyn GrainRuntime> {
        (self.factory)(id)
    }
}

/// All grain classes a silo can host, keyed by kind name.
#[derive(Default)]
pub struct GrainRegistry {
    classes: HashMap<String, GrainClass>,
}

impl GrainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a grain class; its method table is built once and shared
    /// by every activation.
    pub fn register<G: Grain>(&mut self) {
        let mut table = MethodTable::new();
        G::register_methods(&mut table);
        let table = Rc::new(table);
        tracing::debug!(
            kind = G::KIND,
            interface = G::INTERFACE_ID,
            methods = table.len(),
            "grain class registered"
        );
        self.classes.insert(
            G::KIND.to_string(),
            GrainClass {
                interface_id: G::INTERFACE_ID,
                grain_kind: G::grain_kind(),
                reentrant: G::reentrant(),
                age_limit: None,
                factory: Box::new(move |id| {
                    Rc::new(GrainHost::new(GrainCell::new(G::create(id)), table.clone()))
                        as Rc<dyn GrainRuntime>
                }),
            },
        );
    }

    /// Register a pre-built system target instance under a kind name.
    pub fn register_system_target(
        &mut self,
        kind: impl Into<String>,
        interface_id: u32,
        factory: impl Fn(&GrainId) -> Rc<dyn GrainRuntime> + 'static,
    ) {
        self.classes.insert(
            kind.into(),
            GrainClass {
                interface_id,
                grain_kind: GrainKind::SystemTarget,
                // System targets interleave: a forwarded request awaiting a
                // peer must not block the next incoming one.
                reentrant: true,
                age_limit: None,
                factory: Box::new(factory),
            },
        );
    }

    pub fn get(&self, kind: &str) -> Option<&GrainClass> {
        self.classes.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.classes.contains_key(kind)
    }
}
