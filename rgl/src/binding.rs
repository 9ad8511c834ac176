//! Binding-state machine: which handle is bound to which target.
//!
//! [`BindingState`] is a pure record. It never calls the driver; the typed
//! `*_bind` methods on [`Context`](crate::context::Context) validate with it
//! first and issue the driver bind only once validation succeeds.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::driver::DriverError;
use crate::handle::{Handle, HandleError, Registry, ResourceKind};

/// A named slot that holds at most one bound handle.
///
/// Draw and read framebuffer targets are independent. Nothing bound means
/// the default framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingTarget {
    ArrayBuffer,
    IndexBuffer,
    TextureUnit(u32),
    DrawFramebuffer,
    ReadFramebuffer,
    Program,
}

impl BindingTarget {
    /// Whether a handle of `kind` may be bound to this target.
    pub fn accepts(self, kind: ResourceKind) -> bool {
        match self {
            BindingTarget::ArrayBuffer => kind == ResourceKind::ArrayBuffer,
            BindingTarget::IndexBuffer => kind == ResourceKind::IndexBuffer,
            BindingTarget::TextureUnit(_) => matches!(
                kind,
                ResourceKind::Texture2D | ResourceKind::TextureCube
            ),
            BindingTarget::DrawFramebuffer
            | BindingTarget::ReadFramebuffer => {
                kind == ResourceKind::Framebuffer
            }
            BindingTarget::Program => kind == ResourceKind::Program,
        }
    }
}

impl fmt::Display for BindingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingTarget::ArrayBuffer => f.write_str("array buffer"),
            BindingTarget::IndexBuffer => f.write_str("index buffer"),
            BindingTarget::TextureUnit(unit) => {
                write!(f, "texture unit {unit}")
            }
            BindingTarget::DrawFramebuffer => f.write_str("draw framebuffer"),
            BindingTarget::ReadFramebuffer => f.write_str("read framebuffer"),
            BindingTarget::Program => f.write_str("program"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("A {kind} cannot be bound to the {target} target")]
    IncompatibleTarget {
        target: BindingTarget,
        kind: ResourceKind,
    },

    #[error("Texture unit {unit} does not exist (the driver exposes {available})")]
    NoSuchTextureUnit { unit: u32, available: u32 },

    #[error("Driver error while binding: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Default)]
pub struct BindingState {
    bound: HashMap<BindingTarget, Handle>,
}

impl BindingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `handle` as bound to `target`, returning whatever was bound
    /// before.
    ///
    /// Fails if `handle` is null, deleted, from another context, or of a
    /// kind `target` does not accept.
    pub fn bind(
        &mut self,
        registry: &Registry,
        target: BindingTarget,
        handle: Handle,
    ) -> Result<Option<Handle>, BindError> {
        registry.check_live(handle)?;
        if !target.accepts(handle.kind()) {
            return Err(BindError::IncompatibleTarget {
                target,
                kind: handle.kind(),
            });
        }
        tracing::trace!("Binding {handle} to {target}");
        Ok(self.bound.insert(target, handle))
    }

    pub fn unbind(&mut self, target: BindingTarget) -> Option<Handle> {
        tracing::trace!("Unbinding {target}");
        self.bound.remove(&target)
    }

    pub fn is_bound(&self, target: BindingTarget, handle: Handle) -> bool {
        self.bound.get(&target) == Some(&handle)
    }

    pub fn any_bound(&self, target: BindingTarget) -> bool {
        self.bound.contains_key(&target)
    }

    pub fn bound(&self, target: BindingTarget) -> Option<Handle> {
        self.bound.get(&target).copied()
    }

    /// Record a binding the caller has already validated.
    pub(crate) fn record(&mut self, target: BindingTarget, handle: Handle) {
        self.bound.insert(target, handle);
    }

    /// Put back whatever [`bind`](Self::bind) displaced.
    pub(crate) fn restore(
        &mut self,
        target: BindingTarget,
        previous: Option<Handle>,
    ) {
        match previous {
            Some(handle) => self.record(target, handle),
            None => {
                self.bound.remove(&target);
            }
        }
    }

    /// Drop `handle` from every target it is bound to. Deleting a bound
    /// object reverts the target to nothing bound.
    pub fn forget(&mut self, handle: Handle) -> Vec<BindingTarget> {
        let targets: Vec<BindingTarget> = self
            .bound
            .iter()
            .filter(|(_, bound)| **bound == handle)
            .map(|(target, _)| *target)
            .collect();
        for target in &targets {
            self.bound.remove(target);
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ContextId;

    fn registry_with(kinds: &[ResourceKind]) -> (Registry, Vec<Handle>) {
        let mut registry = Registry::new(ContextId::next());
        let handles = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| registry.allocate(*kind, i as u32 + 1).unwrap())
            .collect();
        (registry, handles)
    }

    #[test]
    fn draw_and_read_framebuffer_targets_are_independent() {
        let (registry, handles) = registry_with(&[ResourceKind::Framebuffer]);
        let mut state = BindingState::new();

        assert!(!state.any_bound(BindingTarget::DrawFramebuffer));
        assert!(!state.any_bound(BindingTarget::ReadFramebuffer));

        state
            .bind(&registry, BindingTarget::DrawFramebuffer, handles[0])
            .unwrap();

        assert!(state.is_bound(BindingTarget::DrawFramebuffer, handles[0]));
        assert!(!state.is_bound(BindingTarget::ReadFramebuffer, handles[0]));
        assert!(!state.any_bound(BindingTarget::ReadFramebuffer));
    }

    #[test]
    fn binding_deleted_handle_fails() {
        let (mut registry, handles) =
            registry_with(&[ResourceKind::ArrayBuffer]);
        registry.delete(handles[0]).unwrap();
        let mut state = BindingState::new();

        let result =
            state.bind(&registry, BindingTarget::ArrayBuffer, handles[0]);

        assert!(matches!(
            result,
            Err(BindError::Handle(HandleError::Deleted { .. }))
        ));
        assert!(!state.any_bound(BindingTarget::ArrayBuffer));
    }

    #[test]
    fn binding_null_handle_fails() {
        let (registry, _) = registry_with(&[]);
        let mut state = BindingState::new();
        let null = Handle::null(ResourceKind::IndexBuffer, registry.context());

        assert!(matches!(
            state.bind(&registry, BindingTarget::IndexBuffer, null),
            Err(BindError::Handle(HandleError::Null { .. }))
        ));
    }

    #[test]
    fn binding_to_incompatible_target_fails() {
        let (registry, handles) = registry_with(&[ResourceKind::Texture2D]);
        let mut state = BindingState::new();

        assert!(matches!(
            state.bind(&registry, BindingTarget::ArrayBuffer, handles[0]),
            Err(BindError::IncompatibleTarget {
                target: BindingTarget::ArrayBuffer,
                kind: ResourceKind::Texture2D,
            })
        ));
        assert!(
            state
                .bind(&registry, BindingTarget::TextureUnit(3), handles[0])
                .is_ok()
        );
    }

    #[test]
    fn rebinding_returns_previous_and_forget_clears_all_targets() {
        let (registry, handles) = registry_with(&[
            ResourceKind::Framebuffer,
            ResourceKind::Framebuffer,
        ]);
        let mut state = BindingState::new();

        state
            .bind(&registry, BindingTarget::DrawFramebuffer, handles[0])
            .unwrap();
        state
            .bind(&registry, BindingTarget::ReadFramebuffer, handles[0])
            .unwrap();
        let previous = state
            .bind(&registry, BindingTarget::DrawFramebuffer, handles[1])
            .unwrap();
        assert_eq!(previous, Some(handles[0]));

        let cleared = state.forget(handles[0]);
        assert_eq!(cleared, vec![BindingTarget::ReadFramebuffer]);
        assert!(state.is_bound(BindingTarget::DrawFramebuffer, handles[1]));
        assert_eq!(state.unbind(BindingTarget::DrawFramebuffer), Some(handles[1]));
        assert!(!state.any_bound(BindingTarget::DrawFramebuffer));
    }
}
