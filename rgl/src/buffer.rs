//! Array buffers, plus the mapping and update machinery shared with index
//! buffers.
//!
//! A buffer's contents are reached in one of two ways:
//!
//! - Mapping: [`Context::array_buffer_map_write`] stages the buffer's bytes
//!   on the host and returns a view handing out typed cursors. The mapping
//!   stays outstanding until [`Context::array_buffer_unmap`] is called,
//!   which uploads the staged bytes for write mappings. A buffer has at
//!   most one outstanding mapping.
//! - Update: [`ArrayBufferWritableData`] owns host bytes for a range of
//!   elements and is uploaded with [`Context::array_buffer_update`].
//!
//! Both require the buffer to be bound to its target.

use std::cell::Cell;
use std::collections::hash_map::Entry;
use std::fmt;

use thiserror::Error;

use crate::array::{
    ArrayCursorReadable, ArrayCursorWritable, ArrayDescriptor, AttributeError,
    AttributeValue,
};
use crate::binding::{BindError, BindingTarget};
use crate::context::{Context, Mapping};
use crate::cursor::read_cells;
use crate::driver::{Driver, DriverError};
use crate::handle::{Handle, HandleError, ResourceHandle, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    Array,
    Index,
}

impl BufferTarget {
    pub fn binding_target(self) -> BindingTarget {
        match self {
            BufferTarget::Array => BindingTarget::ArrayBuffer,
            BufferTarget::Index => BindingTarget::IndexBuffer,
        }
    }
}

/// Driver hint for how the buffer's contents will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageHint {
    StreamDraw,
    StreamRead,
    StreamCopy,
    StaticDraw,
    StaticRead,
    StaticCopy,
    DynamicDraw,
    DynamicRead,
    DynamicCopy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    Read,
    Write,
}

// ---- Error types ----

#[derive(Debug, Error)]
pub enum CreateArrayBufferError {
    #[error("Array buffers need at least one element")]
    ZeroElements,

    #[error("{elements} elements of {element_size} bytes overflow the address space")]
    TooLarge { elements: u64, element_size: u64 },

    #[error("Driver error allocating array buffer: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("{kind} {raw} is not bound")]
    NotBound { kind: ResourceKind, raw: u32 },

    #[error("{kind} {raw} is already mapped")]
    MappedMultiple { kind: ResourceKind, raw: u32 },

    #[error("{kind} {raw} is not mapped")]
    MappedNot { kind: ResourceKind, raw: u32 },

    #[error("{kind} {raw} is still mapped")]
    StillMapped { kind: ResourceKind, raw: u32 },

    #[error(
        "Data size ({data_bytes} bytes at offset {offset}) exceeds buffer size \
         ({buffer_bytes} bytes)"
    )]
    DataTooLarge {
        data_bytes: u64,
        offset: u64,
        buffer_bytes: u64,
    },

    #[error("Element range {first}..={last} is outside 0..{count}")]
    RangeOutOfBounds { first: u64, last: u64, count: u64 },

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

// ---- Array buffers ----

#[derive(Debug, Clone)]
pub struct ArrayBuffer {
    handle: Handle,
    descriptor: ArrayDescriptor,
    element_count: u64,
    usage: UsageHint,
}

impl ResourceHandle for ArrayBuffer {
    fn handle(&self) -> Handle {
        self.handle
    }
}

impl ArrayBuffer {
    pub fn descriptor(&self) -> &ArrayDescriptor {
        &self.descriptor
    }

    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    pub fn element_size_bytes(&self) -> u64 {
        self.descriptor.element_size_bytes()
    }

    pub fn size_bytes(&self) -> u64 {
        self.element_count * self.descriptor.element_size_bytes()
    }

    pub fn usage(&self) -> UsageHint {
        self.usage
    }
}

/// Host-side contents for the elements `first..=last` of an array buffer.
pub struct ArrayBufferWritableData<'a> {
    buffer: &'a ArrayBuffer,
    first: u64,
    count: u64,
    cells: Vec<Cell<u8>>,
}

impl fmt::Debug for ArrayBufferWritableData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayBufferWritableData")
            .field("buffer", &self.buffer.handle)
            .field("first", &self.first)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl<'a> ArrayBufferWritableData<'a> {
    /// Data covering every element of `buffer`.
    pub fn new(buffer: &'a ArrayBuffer) -> Self {
        Self::zeroed(buffer, 0, buffer.element_count)
    }

    pub fn with_range(
        buffer: &'a ArrayBuffer,
        first: u64,
        last: u64,
    ) -> Result<Self, BufferError> {
        if first > last || last >= buffer.element_count {
            return Err(BufferError::RangeOutOfBounds {
                first,
                last,
                count: buffer.element_count,
            });
        }
        Ok(Self::zeroed(buffer, first, last - first + 1))
    }

    fn zeroed(buffer: &'a ArrayBuffer, first: u64, count: u64) -> Self {
        let len = (count * buffer.element_size_bytes()) as usize;
        Self {
            buffer,
            first,
            count,
            cells: vec![Cell::new(0); len],
        }
    }

    pub fn buffer(&self) -> &ArrayBuffer {
        self.buffer
    }

    /// Cursor over `name` for the elements of this range. Position `0` is
    /// element `first` of the buffer.
    pub fn get_cursor<T: AttributeValue>(
        &self,
        name: &str,
    ) -> Result<ArrayCursorWritable<'_, T>, AttributeError> {
        ArrayCursorWritable::new(
            &self.cells,
            &self.buffer.descriptor,
            name,
            self.count,
        )
    }

    pub fn target_offset(&self) -> u64 {
        self.first * self.buffer.element_size_bytes()
    }

    pub fn bytes(&self) -> Vec<u8> {
        read_cells(&self.cells)
    }
}

/// Write view of a mapped array buffer.
pub struct ArrayBufferWritableMap<'a> {
    buffer: &'a ArrayBuffer,
    cells: &'a [Cell<u8>],
}

impl fmt::Debug for ArrayBufferWritableMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayBufferWritableMap")
            .field("buffer", &self.buffer.handle)
            .field("len", &self.cells.len())
            .finish()
    }
}

impl ArrayBufferWritableMap<'_> {
    pub fn get_cursor<T: AttributeValue>(
        &self,
        name: &str,
    ) -> Result<ArrayCursorWritable<'_, T>, AttributeError> {
        ArrayCursorWritable::new(
            self.cells,
            &self.buffer.descriptor,
            name,
            self.buffer.element_count,
        )
    }
}

/// Read view of a mapped array buffer.
pub struct ArrayBufferReadableMap<'a> {
    buffer: &'a ArrayBuffer,
    bytes: &'a [u8],
}

impl fmt::Debug for ArrayBufferReadableMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayBufferReadableMap")
            .field("buffer", &self.buffer.handle)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ArrayBufferReadableMap<'_> {
    pub fn get_cursor<T: AttributeValue>(
        &self,
        name: &str,
    ) -> Result<ArrayCursorReadable<'_, T>, AttributeError> {
        ArrayCursorReadable::new(
            self.bytes,
            &self.buffer.descriptor,
            name,
            self.buffer.element_count,
        )
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }
}

impl<D: Driver> Context<D> {
    /// Allocate storage for `elements` elements laid out by `descriptor`.
    /// The new buffer is left bound to the array target.
    pub fn array_buffer_allocate(
        &mut self,
        elements: u64,
        descriptor: &ArrayDescriptor,
        usage: UsageHint,
    ) -> Result<ArrayBuffer, CreateArrayBufferError> {
        if elements == 0 {
            return Err(CreateArrayBufferError::ZeroElements);
        }
        let element_size = descriptor.element_size_bytes();
        let size = elements.checked_mul(element_size).ok_or(
            CreateArrayBufferError::TooLarge {
                elements,
                element_size,
            },
        )?;

        let handle = self.allocate_buffer(
            ResourceKind::ArrayBuffer,
            BufferTarget::Array,
            size,
            usage,
        )?;
        Ok(ArrayBuffer {
            handle,
            descriptor: descriptor.clone(),
            element_count: elements,
            usage,
        })
    }

    pub fn array_buffer_bind(&mut self, buffer: &ArrayBuffer) -> Result<(), BindError> {
        let raw = buffer.handle.raw();
        self.bind_target(BindingTarget::ArrayBuffer, buffer.handle, |driver| {
            driver.bind_buffer(BufferTarget::Array, Some(raw))
        })
    }

    pub fn array_buffer_unbind(&mut self) -> Result<(), DriverError> {
        self.unbind_target(BindingTarget::ArrayBuffer, |driver| {
            driver.bind_buffer(BufferTarget::Array, None)
        })
    }

    pub fn array_buffer_is_bound(&self, buffer: &ArrayBuffer) -> Result<bool, HandleError> {
        self.target_is_bound(BindingTarget::ArrayBuffer, buffer.handle)
    }

    pub fn array_buffer_any_bound(&self) -> bool {
        self.bindings.any_bound(BindingTarget::ArrayBuffer)
    }

    pub fn array_buffer_delete(&mut self, buffer: &ArrayBuffer) -> Result<(), BufferError> {
        self.delete_buffer(buffer.handle)
    }

    /// Upload `data` to its element range. The buffer must be bound and
    /// not mapped.
    pub fn array_buffer_update(
        &mut self,
        data: &ArrayBufferWritableData<'_>,
    ) -> Result<(), BufferError> {
        self.update_buffer(
            data.buffer.handle,
            BufferTarget::Array,
            data.target_offset(),
            &data.bytes(),
            data.buffer.size_bytes(),
        )
    }

    pub fn array_buffer_map_read<'a>(
        &'a mut self,
        buffer: &'a ArrayBuffer,
    ) -> Result<ArrayBufferReadableMap<'a>, BufferError> {
        let bytes = self.map_buffer(
            buffer.handle,
            BufferTarget::Array,
            buffer.size_bytes(),
            MapAccess::Read,
        )?;
        Ok(ArrayBufferReadableMap {
            buffer,
            bytes: &*bytes,
        })
    }

    pub fn array_buffer_map_write<'a>(
        &'a mut self,
        buffer: &'a ArrayBuffer,
    ) -> Result<ArrayBufferWritableMap<'a>, BufferError> {
        let bytes = self.map_buffer(
            buffer.handle,
            BufferTarget::Array,
            buffer.size_bytes(),
            MapAccess::Write,
        )?;
        Ok(ArrayBufferWritableMap {
            buffer,
            cells: Cell::from_mut(bytes).as_slice_of_cells(),
        })
    }

    pub fn array_buffer_unmap(&mut self, buffer: &ArrayBuffer) -> Result<(), BufferError> {
        self.unmap_buffer(buffer.handle, BufferTarget::Array)
    }

    // ---- Shared with index buffers ----

    /// Generate, register, bind, and size a new buffer. Everything created
    /// so far is released again if a later step fails.
    pub(crate) fn allocate_buffer(
        &mut self,
        kind: ResourceKind,
        target: BufferTarget,
        size: u64,
        usage: UsageHint,
    ) -> Result<Handle, DriverError> {
        let raw = self.driver.gen_buffer()?;
        // A rejected name is null or already live; neither may be deleted.
        let handle = self.register(kind, raw)?;

        let result = self
            .driver
            .bind_buffer(target, Some(raw))
            .and_then(|()| self.driver.buffer_allocate(target, size, usage));
        if let Err(e) = result {
            self.discard_buffer_name(raw);
            if let Err(release) = self.release(handle) {
                tracing::warn!("Failed to release {handle} after error: {release}");
            }
            return Err(e);
        }

        self.bindings.record(target.binding_target(), handle);
        tracing::debug!("Allocated {size} bytes for {handle}");
        Ok(handle)
    }

    fn discard_buffer_name(&mut self, raw: u32) {
        if let Err(e) = self.driver.delete_buffer(raw) {
            tracing::warn!("Failed to delete buffer {raw}: {e}");
        }
    }

    pub(crate) fn require_buffer_bound(
        &self,
        handle: Handle,
        target: BufferTarget,
    ) -> Result<(), BufferError> {
        self.registry.check_live(handle)?;
        if !self.bindings.is_bound(target.binding_target(), handle) {
            return Err(BufferError::NotBound {
                kind: handle.kind(),
                raw: handle.raw(),
            });
        }
        Ok(())
    }

    pub(crate) fn require_unmapped(&self, handle: Handle) -> Result<(), BufferError> {
        if self.is_mapped(handle) {
            return Err(BufferError::StillMapped {
                kind: handle.kind(),
                raw: handle.raw(),
            });
        }
        Ok(())
    }

    pub(crate) fn delete_buffer(&mut self, handle: Handle) -> Result<(), BufferError> {
        self.registry.check_live(handle)?;
        self.require_unmapped(handle)?;
        tracing::debug!("Deleting {handle}");
        self.driver.delete_buffer(handle.raw())?;
        self.release(handle)?;
        Ok(())
    }

    pub(crate) fn update_buffer(
        &mut self,
        handle: Handle,
        target: BufferTarget,
        offset: u64,
        data: &[u8],
        buffer_bytes: u64,
    ) -> Result<(), BufferError> {
        self.require_buffer_bound(handle, target)?;
        self.require_unmapped(handle)?;
        let data_bytes = data.len() as u64;
        if offset.saturating_add(data_bytes) > buffer_bytes {
            return Err(BufferError::DataTooLarge {
                data_bytes,
                offset,
                buffer_bytes,
            });
        }
        tracing::trace!("Updating {data_bytes} bytes of {handle} at offset {offset}");
        self.driver.buffer_write(target, offset, data)?;
        Ok(())
    }

    /// Stage the buffer's current contents on the host and record the
    /// mapping.
    pub(crate) fn map_buffer(
        &mut self,
        handle: Handle,
        target: BufferTarget,
        size: u64,
        access: MapAccess,
    ) -> Result<&mut [u8], BufferError> {
        self.require_buffer_bound(handle, target)?;
        let Entry::Vacant(slot) = self.mappings.entry(handle) else {
            return Err(BufferError::MappedMultiple {
                kind: handle.kind(),
                raw: handle.raw(),
            });
        };

        let mut bytes = vec![0; size as usize];
        self.driver.buffer_read(target, 0, &mut bytes)?;
        tracing::trace!("Mapped {handle} for {access:?}");
        let mapping = slot.insert(Mapping { access, bytes });
        Ok(&mut mapping.bytes)
    }

    /// End the mapping of `handle`, uploading staged bytes if it was mapped
    /// for writing.
    pub(crate) fn unmap_buffer(
        &mut self,
        handle: Handle,
        target: BufferTarget,
    ) -> Result<(), BufferError> {
        self.registry.check_live(handle)?;
        if !self.is_mapped(handle) {
            return Err(BufferError::MappedNot {
                kind: handle.kind(),
                raw: handle.raw(),
            });
        }
        self.require_buffer_bound(handle, target)?;

        let Some(mapping) = self.mappings.remove(&handle) else {
            return Err(BufferError::MappedNot {
                kind: handle.kind(),
                raw: handle.raw(),
            });
        };
        tracing::trace!("Unmapping {handle}");
        if mapping.access == MapAccess::Write {
            self.driver.buffer_write(target, 0, &mapping.bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ScalarType;
    use crate::cursor::CursorError;
    use crate::fake::FakeDriver;

    fn context() -> Context<FakeDriver> {
        Context::new(FakeDriver::new()).unwrap()
    }

    fn descriptor() -> ArrayDescriptor {
        ArrayDescriptor::builder()
            .attribute("position", ScalarType::F32, 3)
            .attribute("uv", ScalarType::F32, 2)
            .build()
            .unwrap()
    }

    #[test]
    fn allocation_sizes_and_binds_buffer() {
        let mut ctx = context();

        let buffer = ctx
            .array_buffer_allocate(10, &descriptor(), UsageHint::StaticDraw)
            .unwrap();

        assert_eq!(buffer.size_bytes(), 10 * 20);
        assert!(ctx.array_buffer_is_bound(&buffer).unwrap());
        assert!(ctx.array_buffer_any_bound());
        assert_eq!(
            ctx.driver().buffer_len(buffer.handle().raw()),
            Some(200)
        );
    }

    #[test]
    fn zero_elements_are_rejected() {
        let mut ctx = context();

        assert!(matches!(
            ctx.array_buffer_allocate(0, &descriptor(), UsageHint::StaticDraw),
            Err(CreateArrayBufferError::ZeroElements)
        ));
        assert!(!ctx.array_buffer_any_bound());
    }

    #[test]
    fn double_delete_fails_and_use_after_delete_fails() {
        let mut ctx = context();
        let buffer = ctx
            .array_buffer_allocate(4, &descriptor(), UsageHint::StaticDraw)
            .unwrap();

        ctx.array_buffer_delete(&buffer).unwrap();

        assert!(!ctx.array_buffer_any_bound());
        assert!(matches!(
            ctx.array_buffer_delete(&buffer),
            Err(BufferError::Handle(HandleError::Deleted { .. }))
        ));
        assert!(matches!(
            ctx.array_buffer_bind(&buffer),
            Err(BindError::Handle(HandleError::Deleted { .. }))
        ));
        assert!(matches!(
            ctx.array_buffer_map_write(&buffer),
            Err(BufferError::Handle(HandleError::Deleted { .. }))
        ));
        assert!(ctx.array_buffer_is_bound(&buffer).is_err());
    }

    #[test]
    fn mapping_twice_fails_and_unmapping_twice_fails() {
        let mut ctx = context();
        let buffer = ctx
            .array_buffer_allocate(4, &descriptor(), UsageHint::DynamicDraw)
            .unwrap();

        ctx.array_buffer_map_write(&buffer).unwrap();
        assert!(matches!(
            ctx.array_buffer_map_read(&buffer),
            Err(BufferError::MappedMultiple { .. })
        ));
        assert!(matches!(
            ctx.array_buffer_map_write(&buffer),
            Err(BufferError::MappedMultiple { .. })
        ));

        ctx.array_buffer_unmap(&buffer).unwrap();
        assert!(matches!(
            ctx.array_buffer_unmap(&buffer),
            Err(BufferError::MappedNot { .. })
        ));
    }

    #[test]
    fn mapped_buffer_blocks_update_and_delete() {
        let mut ctx = context();
        let buffer = ctx
            .array_buffer_allocate(2, &descriptor(), UsageHint::DynamicDraw)
            .unwrap();
        let data = ArrayBufferWritableData::new(&buffer);

        ctx.array_buffer_map_read(&buffer).unwrap();

        assert!(matches!(
            ctx.array_buffer_update(&data),
            Err(BufferError::StillMapped { .. })
        ));
        assert!(matches!(
            ctx.array_buffer_delete(&buffer),
            Err(BufferError::StillMapped { .. })
        ));
        ctx.array_buffer_unmap(&buffer).unwrap();
        ctx.array_buffer_delete(&buffer).unwrap();
    }

    #[test]
    fn unbound_buffer_cannot_be_mapped_or_updated() {
        let mut ctx = context();
        let buffer = ctx
            .array_buffer_allocate(2, &descriptor(), UsageHint::StaticDraw)
            .unwrap();
        ctx.array_buffer_unbind().unwrap();

        assert!(matches!(
            ctx.array_buffer_map_write(&buffer),
            Err(BufferError::NotBound {
                kind: ResourceKind::ArrayBuffer,
                ..
            })
        ));
        let data = ArrayBufferWritableData::new(&buffer);
        assert!(matches!(
            ctx.array_buffer_update(&data),
            Err(BufferError::NotBound { .. })
        ));
    }

    #[test]
    fn write_map_round_trips_through_driver() {
        let mut ctx = context();
        let buffer = ctx
            .array_buffer_allocate(3, &descriptor(), UsageHint::DynamicDraw)
            .unwrap();

        {
            let map = ctx.array_buffer_map_write(&buffer).unwrap();
            let mut positions = map.get_cursor::<[f32; 3]>("position").unwrap();
            let mut uvs = map.get_cursor::<[f32; 2]>("uv").unwrap();
            for i in 0..3 {
                let f = i as f32;
                positions.put([f, -f, 2.0 * f]).unwrap();
                uvs.put([f, 1.0]).unwrap();
            }
            assert!(matches!(
                positions.put([0.0; 3]),
                Err(CursorError::OutOfBounds { index: 3, .. })
            ));
        }
        ctx.array_buffer_unmap(&buffer).unwrap();

        let map = ctx.array_buffer_map_read(&buffer).unwrap();
        let mut uvs = map.get_cursor::<[f32; 2]>("uv").unwrap();
        uvs.seek_to(2).unwrap();
        assert_eq!(uvs.get().unwrap(), [2.0, 1.0]);
        assert!(matches!(
            map.get_cursor::<[f32; 3]>("uv"),
            Err(AttributeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn range_update_writes_only_its_elements() {
        let mut ctx = context();
        let buffer = ctx
            .array_buffer_allocate(4, &descriptor(), UsageHint::DynamicDraw)
            .unwrap();

        let data = ArrayBufferWritableData::with_range(&buffer, 2, 3).unwrap();
        {
            let mut positions = data.get_cursor::<[f32; 3]>("position").unwrap();
            positions.put([1.0, 2.0, 3.0]).unwrap();
            positions.put([4.0, 5.0, 6.0]).unwrap();
        }
        assert_eq!(data.target_offset(), 40);
        ctx.array_buffer_update(&data).unwrap();

        let map = ctx.array_buffer_map_read(&buffer).unwrap();
        let mut positions = map.get_cursor::<[f32; 3]>("position").unwrap();
        assert_eq!(positions.get().unwrap(), [0.0; 3]);
        positions.seek_to(3).unwrap();
        assert_eq!(positions.get().unwrap(), [4.0, 5.0, 6.0]);

        assert!(matches!(
            ArrayBufferWritableData::with_range(&buffer, 3, 4),
            Err(BufferError::RangeOutOfBounds { count: 4, .. })
        ));
    }
}
