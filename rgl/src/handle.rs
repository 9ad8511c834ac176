//! Resource identities and the per-context liveness [`Registry`].
//!
//! A [`Handle`] is a plain `Copy` value: the driver's raw name, the kind of
//! object it names, a generation, and the [`ContextId`] of the context that
//! created it. Live/deleted status is not stored in the handle but in the
//! owning context's [`Registry`], so every copy of a handle observes a
//! deletion.
//!
//! Drivers are free to hand out a deleted name again. The registry bumps
//! the generation of a name each time it is reissued, so a stale copy of
//! the old handle keeps failing with [`HandleError::Deleted`] instead of
//! silently aliasing the new object.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Process-unique identity of a [`Context`](crate::context::Context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ArrayBuffer,
    IndexBuffer,
    Texture2D,
    TextureCube,
    Renderbuffer,
    Framebuffer,
    Shader,
    Program,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::ArrayBuffer => "array buffer",
            ResourceKind::IndexBuffer => "index buffer",
            ResourceKind::Texture2D => "2D texture",
            ResourceKind::TextureCube => "cube texture",
            ResourceKind::Renderbuffer => "renderbuffer",
            ResourceKind::Framebuffer => "framebuffer",
            ResourceKind::Shader => "shader",
            ResourceKind::Program => "program",
        };
        f.write_str(name)
    }
}

/// Opaque identity of a driver-side object.
///
/// The raw name `0` is the null handle, as in GL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    raw: u32,
    generation: u32,
    kind: ResourceKind,
    context: ContextId,
}

impl Handle {
    /// The null handle of `kind`. Every operation given it fails with
    /// [`HandleError::Null`].
    pub fn null(kind: ResourceKind, context: ContextId) -> Self {
        Self {
            raw: 0,
            generation: 0,
            kind,
            context,
        }
    }

    /// The driver name of the object.
    pub fn raw(self) -> u32 {
        self.raw
    }

    pub fn kind(self) -> ResourceKind {
        self.kind
    }

    /// The context that created the object.
    pub fn context(self) -> ContextId {
        self.context
    }

    pub fn is_null(self) -> bool {
        self.raw == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (context {})", self.kind, self.raw, self.context)
    }
}

/// Trait for types that name a driver-side object.
///
/// Blanket impls cover `&T`, so both owned wrappers and borrows of them
/// satisfy the bound.
pub trait ResourceHandle {
    fn handle(&self) -> Handle;
}

impl ResourceHandle for Handle {
    fn handle(&self) -> Handle {
        *self
    }
}

impl<T> ResourceHandle for &T
where
    T: ResourceHandle + ?Sized,
{
    fn handle(&self) -> Handle {
        (*self).handle()
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    #[error("Null {kind} handle")]
    Null { kind: ResourceKind },

    #[error(
        "{kind} {raw} belongs to context {owner}, not the current context \
         {current}"
    )]
    WrongContext {
        kind: ResourceKind,
        raw: u32,
        owner: ContextId,
        current: ContextId,
    },

    #[error("{kind} {raw} has already been deleted")]
    Deleted { kind: ResourceKind, raw: u32 },
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    live: bool,
}

/// Live/deleted status of every handle issued by one context.
#[derive(Debug)]
pub struct Registry {
    context: ContextId,
    entries: HashMap<(ResourceKind, u32), Entry>,
}

impl Registry {
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            entries: HashMap::new(),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Record a freshly generated driver name as a live handle.
    ///
    /// Returns `None` if `raw` is the null name or is already live, both of
    /// which mean the driver broke its naming contract.
    pub fn allocate(&mut self, kind: ResourceKind, raw: u32) -> Option<Handle> {
        if raw == 0 {
            return None;
        }
        let entry = self.entries.entry((kind, raw)).or_insert(Entry {
            generation: 0,
            live: false,
        });
        if entry.live {
            return None;
        }
        entry.generation = entry.generation.wrapping_add(1);
        entry.live = true;
        Some(Handle {
            raw,
            generation: entry.generation,
            kind,
            context: self.context,
        })
    }

    pub fn check_live(&self, handle: Handle) -> Result<(), HandleError> {
        if handle.is_null() {
            return Err(HandleError::Null { kind: handle.kind });
        }
        if handle.context != self.context {
            return Err(HandleError::WrongContext {
                kind: handle.kind,
                raw: handle.raw,
                owner: handle.context,
                current: self.context,
            });
        }
        match self.entries.get(&(handle.kind, handle.raw)) {
            Some(entry) if entry.live && entry.generation == handle.generation => {
                Ok(())
            }
            _ => Err(HandleError::Deleted {
                kind: handle.kind,
                raw: handle.raw,
            }),
        }
    }

    /// Mark `handle` deleted. Irreversible.
    pub fn delete(&mut self, handle: Handle) -> Result<(), HandleError> {
        self.check_live(handle)?;
        if let Some(entry) = self.entries.get_mut(&(handle.kind, handle.raw)) {
            entry.live = false;
        }
        Ok(())
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.check_live(handle).is_ok()
    }

    pub fn live_count(&self, kind: ResourceKind) -> usize {
        self.entries
            .iter()
            .filter(|((k, _), entry)| *k == kind && entry.live)
            .count()
    }
}
