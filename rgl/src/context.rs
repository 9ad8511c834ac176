//! The single-owner session object ([`Context`]).
//!
//! `Context` centralises all per-context state: the driver adapter, the
//! handle [`Registry`], the [`BindingState`], outstanding buffer mappings,
//! and the share counts of framebuffer attachments. Every operation in the
//! crate is a method on `Context` (or takes one), so the wrong-context check
//! is structural rather than advisory.
//!
//! `Context` is `Send` but `!Sync`: a graphics context is not reentrant, and
//! being `!Sync` rules out shared access from two threads without a lock.

use std::cell::Cell;
use std::collections::HashMap;
use std::marker::PhantomData;

use crate::binding::{BindError, BindingState, BindingTarget};
use crate::buffer::MapAccess;
use crate::driver::{Driver, DriverError, Limits};
use crate::handle::{
    ContextId, Handle, HandleError, Registry, ResourceHandle, ResourceKind,
};

/// Host-side staging for one mapped buffer.
#[derive(Debug)]
pub(crate) struct Mapping {
    pub(crate) access: MapAccess,
    pub(crate) bytes: Vec<u8>,
}

pub struct Context<D: Driver> {
    pub(crate) id: ContextId,
    pub(crate) driver: D,
    pub(crate) limits: Limits,
    pub(crate) registry: Registry,
    pub(crate) bindings: BindingState,
    pub(crate) mappings: HashMap<Handle, Mapping>,
    /// Number of live framebuffers sharing each owned attachment resource.
    pub(crate) shares: HashMap<Handle, usize>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<D: Driver> std::fmt::Debug for Context<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> Context<D> {
    /// Start a session on `driver`. Nothing is bound initially; both
    /// framebuffer targets refer to the default framebuffer.
    pub fn new(driver: D) -> Result<Self, DriverError> {
        let limits = driver.limits()?;
        let id = ContextId::next();
        tracing::debug!("Creating context {id} with {limits:?}");
        Ok(Self {
            id,
            driver,
            limits,
            registry: Registry::new(id),
            bindings: BindingState::new(),
            mappings: HashMap::new(),
            shares: HashMap::new(),
            _not_sync: PhantomData,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Direct adapter access. Calls made through it bypass every check in
    /// this crate.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn bindings(&self) -> &BindingState {
        &self.bindings
    }

    pub fn check_live(
        &self,
        resource: &impl ResourceHandle,
    ) -> Result<(), HandleError> {
        self.registry.check_live(resource.handle())
    }

    pub fn is_live(&self, resource: &impl ResourceHandle) -> bool {
        self.registry.is_live(resource.handle())
    }

    /// Null handle of `kind` owned by this context.
    pub fn null_handle(&self, kind: ResourceKind) -> Handle {
        Handle::null(kind, self.id)
    }

    pub(crate) fn register(
        &mut self,
        kind: ResourceKind,
        raw: u32,
    ) -> Result<Handle, DriverError> {
        let handle = self
            .registry
            .allocate(kind, raw)
            .ok_or(DriverError::InvalidName(raw))?;
        tracing::debug!("Allocated {handle}");
        Ok(handle)
    }

    /// Mark `handle` deleted and drop it from every binding target.
    pub(crate) fn release(&mut self, handle: Handle) -> Result<(), HandleError> {
        self.registry.delete(handle)?;
        self.bindings.forget(handle);
        tracing::debug!("Released {handle}");
        Ok(())
    }

    /// Validate and record `handle` on `target`, then let `issue` make the
    /// driver call. A driver failure rolls the recorded binding back.
    pub(crate) fn bind_target(
        &mut self,
        target: BindingTarget,
        handle: Handle,
        issue: impl FnOnce(&mut D) -> Result<(), DriverError>,
    ) -> Result<(), BindError> {
        let previous = self.bindings.bind(&self.registry, target, handle)?;
        if let Err(e) = issue(&mut self.driver) {
            self.bindings.restore(target, previous);
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn unbind_target(
        &mut self,
        target: BindingTarget,
        issue: impl FnOnce(&mut D) -> Result<(), DriverError>,
    ) -> Result<(), DriverError> {
        issue(&mut self.driver)?;
        self.bindings.unbind(target);
        Ok(())
    }

    /// Whether `handle` is bound to `target`. Fails on dead handles rather
    /// than answering `false`.
    pub(crate) fn target_is_bound(
        &self,
        target: BindingTarget,
        handle: Handle,
    ) -> Result<bool, HandleError> {
        self.registry.check_live(handle)?;
        Ok(self.bindings.is_bound(target, handle))
    }

    pub(crate) fn is_mapped(&self, handle: Handle) -> bool {
        self.mappings.contains_key(&handle)
    }

    pub(crate) fn share_count(&self, handle: Handle) -> usize {
        self.shares.get(&handle).copied().unwrap_or(0)
    }
}

// Verified at compile time: Context is Send (and !Sync through the
// PhantomData<Cell<()>> marker) whenever its driver is Send.
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for Context<crate::fake::FakeDriver> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeDriver;

    #[test]
    fn contexts_get_distinct_ids() {
        let a = Context::new(FakeDriver::new()).unwrap();
        let b = Context::new(FakeDriver::new()).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.limits(), FakeDriver::new().limits().unwrap());
    }

    #[test]
    fn null_handles_are_never_live() {
        let ctx = Context::new(FakeDriver::new()).unwrap();
        let null = ctx.null_handle(ResourceKind::Program);

        assert!(!ctx.is_live(&null));
        assert_eq!(
            ctx.check_live(&null),
            Err(HandleError::Null {
                kind: ResourceKind::Program
            })
        );
    }
}
