//! Index buffers and the index width selector.
//!
//! An index buffer that indexes an array buffer of `n` elements only needs
//! indices wide enough to name element `n - 1`, so the width is picked from
//! the element count (see [`IndexType::for_element_count`]). Cursors widen
//! every stored index to `u32` on read and narrow it on write.

use std::cell::Cell;
use std::fmt;

use thiserror::Error;

use crate::binding::{BindError, BindingTarget};
use crate::buffer::{ArrayBuffer, BufferError, BufferTarget, MapAccess, UsageHint};
use crate::context::Context;
use crate::cursor::{CursorError, ElementCursor, read_cells, write_cells};
use crate::driver::{Driver, DriverError};
use crate::handle::{Handle, HandleError, ResourceHandle, ResourceKind};

/// Unsigned width of the indices in an index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    U8,
    U16,
    U32,
}

impl IndexType {
    /// Narrowest width able to index `count` elements: byte up to 256,
    /// short up to 65536, int beyond.
    pub fn for_element_count(count: u64) -> Self {
        if count <= 256 {
            IndexType::U8
        } else if count <= 65536 {
            IndexType::U16
        } else {
            IndexType::U32
        }
    }

    pub fn size_bytes(self) -> u64 {
        match self {
            IndexType::U8 => 1,
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }

    pub fn max_value(self) -> u32 {
        match self {
            IndexType::U8 => u8::MAX.into(),
            IndexType::U16 => u16::MAX.into(),
            IndexType::U32 => u32::MAX,
        }
    }

    fn encode(self, value: u32, out: &[Cell<u8>]) {
        debug_assert!(
            value <= self.max_value(),
            "index {value} does not fit in {self:?}"
        );
        match self {
            IndexType::U8 => write_cells(out, &[value as u8]),
            IndexType::U16 => write_cells(out, &(value as u16).to_ne_bytes()),
            IndexType::U32 => write_cells(out, &value.to_ne_bytes()),
        }
    }

    fn decode(self, bytes: &[u8]) -> u32 {
        match self {
            IndexType::U8 => bytes[0].into(),
            IndexType::U16 => u16::from_ne_bytes([bytes[0], bytes[1]]).into(),
            IndexType::U32 => {
                u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CreateIndexBufferError {
    #[error("Index buffers need at least one index")]
    ZeroIndices,

    #[error("{indices} indices of type {ty:?} overflow the address space")]
    TooLarge { indices: u64, ty: IndexType },

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("Driver error allocating index buffer: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Clone)]
pub struct IndexBuffer {
    handle: Handle,
    ty: IndexType,
    indices: u64,
    usage: UsageHint,
}

impl ResourceHandle for IndexBuffer {
    fn handle(&self) -> Handle {
        self.handle
    }
}

impl IndexBuffer {
    pub fn index_type(&self) -> IndexType {
        self.ty
    }

    /// Number of indices the buffer holds.
    pub fn indices(&self) -> u64 {
        self.indices
    }

    pub fn size_bytes(&self) -> u64 {
        self.indices * self.ty.size_bytes()
    }

    pub fn usage(&self) -> UsageHint {
        self.usage
    }
}

// ---- Cursors ----

pub struct IndexCursorWritable<'a> {
    cells: &'a [Cell<u8>],
    ty: IndexType,
    cursor: ElementCursor,
}

impl fmt::Debug for IndexCursorWritable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexCursorWritable")
            .field("ty", &self.ty)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl<'a> IndexCursorWritable<'a> {
    fn new(cells: &'a [Cell<u8>], ty: IndexType, count: u64) -> Self {
        let width = ty.size_bytes();
        Self {
            cells,
            ty,
            cursor: ElementCursor::new(0, width, width, count),
        }
    }

    /// Store `index` at the current position, narrowed to the buffer's
    /// width, and advance.
    pub fn put_index(&mut self, index: u32) -> Result<(), CursorError> {
        let range = self.cursor.current_range(self.cells.len())?;
        self.ty.encode(index, &self.cells[range]);
        self.cursor.advance();
        Ok(())
    }

    pub fn seek_to(&mut self, index: u64) -> Result<(), CursorError> {
        self.cursor.seek_to(index)
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn has_next(&self) -> bool {
        self.cursor.has_next()
    }
}

pub struct IndexCursorReadable<'a> {
    bytes: &'a [u8],
    ty: IndexType,
    cursor: ElementCursor,
}

impl fmt::Debug for IndexCursorReadable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexCursorReadable")
            .field("ty", &self.ty)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl<'a> IndexCursorReadable<'a> {
    fn new(bytes: &'a [u8], ty: IndexType, count: u64) -> Self {
        let width = ty.size_bytes();
        Self {
            bytes,
            ty,
            cursor: ElementCursor::new(0, width, width, count),
        }
    }

    pub fn get_index(&mut self) -> Result<u32, CursorError> {
        let range = self.cursor.current_range(self.bytes.len())?;
        let value = self.ty.decode(&self.bytes[range]);
        self.cursor.advance();
        Ok(value)
    }

    pub fn seek_to(&mut self, index: u64) -> Result<(), CursorError> {
        self.cursor.seek_to(index)
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn has_next(&self) -> bool {
        self.cursor.has_next()
    }
}

// ---- Host data and mapped views ----

/// Host-side indices `first..=last` of an index buffer.
#[derive(Debug)]
pub struct IndexBufferWritableData<'a> {
    buffer: &'a IndexBuffer,
    first: u64,
    count: u64,
    cells: Vec<Cell<u8>>,
}

impl<'a> IndexBufferWritableData<'a> {
    pub fn new(buffer: &'a IndexBuffer) -> Self {
        Self::zeroed(buffer, 0, buffer.indices)
    }

    pub fn with_range(
        buffer: &'a IndexBuffer,
        first: u64,
        last: u64,
    ) -> Result<Self, BufferError> {
        if first > last || last >= buffer.indices {
            return Err(BufferError::RangeOutOfBounds {
                first,
                last,
                count: buffer.indices,
            });
        }
        Ok(Self::zeroed(buffer, first, last - first + 1))
    }

    fn zeroed(buffer: &'a IndexBuffer, first: u64, count: u64) -> Self {
        Self {
            buffer,
            first,
            count,
            cells: vec![Cell::new(0); (count * buffer.ty.size_bytes()) as usize],
        }
    }

    pub fn get_cursor(&self) -> IndexCursorWritable<'_> {
        IndexCursorWritable::new(&self.cells, self.buffer.ty, self.count)
    }

    pub fn target_offset(&self) -> u64 {
        self.first * self.buffer.ty.size_bytes()
    }

    pub fn bytes(&self) -> Vec<u8> {
        read_cells(&self.cells)
    }
}

#[derive(Debug)]
pub struct IndexBufferWritableMap<'a> {
    buffer: &'a IndexBuffer,
    cells: &'a [Cell<u8>],
}

impl IndexBufferWritableMap<'_> {
    pub fn get_cursor(&self) -> IndexCursorWritable<'_> {
        IndexCursorWritable::new(self.cells, self.buffer.ty, self.buffer.indices)
    }
}

#[derive(Debug)]
pub struct IndexBufferReadableMap<'a> {
    buffer: &'a IndexBuffer,
    bytes: &'a [u8],
}

impl IndexBufferReadableMap<'_> {
    pub fn get_cursor(&self) -> IndexCursorReadable<'_> {
        IndexCursorReadable::new(self.bytes, self.buffer.ty, self.buffer.indices)
    }
}

impl<D: Driver> Context<D> {
    /// Allocate `indices` indices wide enough to address every element of
    /// `array`. The new buffer is left bound to the index target.
    pub fn index_buffer_allocate(
        &mut self,
        array: &ArrayBuffer,
        indices: u64,
        usage: UsageHint,
    ) -> Result<IndexBuffer, CreateIndexBufferError> {
        self.check_live(array)?;
        let ty = IndexType::for_element_count(array.element_count());
        self.index_buffer_allocate_type(ty, indices, usage)
    }

    pub fn index_buffer_allocate_type(
        &mut self,
        ty: IndexType,
        indices: u64,
        usage: UsageHint,
    ) -> Result<IndexBuffer, CreateIndexBufferError> {
        if indices == 0 {
            return Err(CreateIndexBufferError::ZeroIndices);
        }
        let size = indices
            .checked_mul(ty.size_bytes())
            .ok_or(CreateIndexBufferError::TooLarge { indices, ty })?;
        let handle = self.allocate_buffer(
            ResourceKind::IndexBuffer,
            BufferTarget::Index,
            size,
            usage,
        )?;
        Ok(IndexBuffer {
            handle,
            ty,
            indices,
            usage,
        })
    }

    pub fn index_buffer_bind(&mut self, buffer: &IndexBuffer) -> Result<(), BindError> {
        let raw = buffer.handle.raw();
        self.bind_target(BindingTarget::IndexBuffer, buffer.handle, |driver| {
            driver.bind_buffer(BufferTarget::Index, Some(raw))
        })
    }

    pub fn index_buffer_unbind(&mut self) -> Result<(), DriverError> {
        self.unbind_target(BindingTarget::IndexBuffer, |driver| {
            driver.bind_buffer(BufferTarget::Index, None)
        })
    }

    pub fn index_buffer_is_bound(&self, buffer: &IndexBuffer) -> Result<bool, HandleError> {
        self.target_is_bound(BindingTarget::IndexBuffer, buffer.handle)
    }

    pub fn index_buffer_any_bound(&self) -> bool {
        self.bindings.any_bound(BindingTarget::IndexBuffer)
    }

    pub fn index_buffer_delete(&mut self, buffer: &IndexBuffer) -> Result<(), BufferError> {
        self.delete_buffer(buffer.handle)
    }

    pub fn index_buffer_update(
        &mut self,
        data: &IndexBufferWritableData<'_>,
    ) -> Result<(), BufferError> {
        self.update_buffer(
            data.buffer.handle,
            BufferTarget::Index,
            data.target_offset(),
            &data.bytes(),
            data.buffer.size_bytes(),
        )
    }

    pub fn index_buffer_map_read<'a>(
        &'a mut self,
        buffer: &'a IndexBuffer,
    ) -> Result<IndexBufferReadableMap<'a>, BufferError> {
        let bytes = self.map_buffer(
            buffer.handle,
            BufferTarget::Index,
            buffer.size_bytes(),
            MapAccess::Read,
        )?;
        Ok(IndexBufferReadableMap {
            buffer,
            bytes: &*bytes,
        })
    }

    pub fn index_buffer_map_write<'a>(
        &'a mut self,
        buffer: &'a IndexBuffer,
    ) -> Result<IndexBufferWritableMap<'a>, BufferError> {
        let bytes = self.map_buffer(
            buffer.handle,
            BufferTarget::Index,
            buffer.size_bytes(),
            MapAccess::Write,
        )?;
        Ok(IndexBufferWritableMap {
            buffer,
            cells: Cell::from_mut(bytes).as_slice_of_cells(),
        })
    }

    pub fn index_buffer_unmap(&mut self, buffer: &IndexBuffer) -> Result<(), BufferError> {
        self.unmap_buffer(buffer.handle, BufferTarget::Index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayDescriptor, ScalarType};
    use crate::fake::FakeDriver;

    #[test]
    fn width_thresholds_are_exact() {
        assert_eq!(IndexType::for_element_count(1), IndexType::U8);
        assert_eq!(IndexType::for_element_count(256), IndexType::U8);
        assert_eq!(IndexType::for_element_count(257), IndexType::U16);
        assert_eq!(IndexType::for_element_count(65536), IndexType::U16);
        assert_eq!(IndexType::for_element_count(65537), IndexType::U32);
    }

    #[test]
    fn width_follows_array_element_count() {
        let mut ctx = Context::new(FakeDriver::new()).unwrap();
        let descriptor = ArrayDescriptor::builder()
            .attribute("position", ScalarType::F32, 3)
            .build()
            .unwrap();
        let array = ctx
            .array_buffer_allocate(300, &descriptor, UsageHint::StaticDraw)
            .unwrap();

        let indices = ctx
            .index_buffer_allocate(&array, 6, UsageHint::StaticDraw)
            .unwrap();

        assert_eq!(indices.index_type(), IndexType::U16);
        assert_eq!(indices.size_bytes(), 12);
        assert!(ctx.index_buffer_is_bound(&indices).unwrap());
        // Allocating an index buffer leaves the array binding alone.
        assert!(ctx.array_buffer_is_bound(&array).unwrap());
    }

    #[test]
    fn sequential_indices_round_trip_for_every_width() {
        let mut ctx = Context::new(FakeDriver::new()).unwrap();

        for ty in [IndexType::U8, IndexType::U16, IndexType::U32] {
            let count = 200;
            let buffer = ctx
                .index_buffer_allocate_type(ty, count, UsageHint::DynamicDraw)
                .unwrap();
            {
                let map = ctx.index_buffer_map_write(&buffer).unwrap();
                let mut cursor = map.get_cursor();
                for i in 0..count as u32 {
                    cursor.put_index(i).unwrap();
                }
                assert!(!cursor.has_next());
            }
            ctx.index_buffer_unmap(&buffer).unwrap();

            let map = ctx.index_buffer_map_read(&buffer).unwrap();
            let mut cursor = map.get_cursor();
            let read: Vec<u32> = (0..count).map(|_| cursor.get_index().unwrap()).collect();
            assert_eq!(read, (0..count as u32).collect::<Vec<_>>(), "{ty:?}");
            assert!(matches!(
                cursor.get_index(),
                Err(CursorError::OutOfBounds { index: 200, count: 200 })
            ));
        }
    }

    #[test]
    fn wide_values_survive_the_matching_width() {
        let mut ctx = Context::new(FakeDriver::new()).unwrap();
        let buffer = ctx
            .index_buffer_allocate_type(IndexType::U32, 2, UsageHint::StaticDraw)
            .unwrap();

        let data = IndexBufferWritableData::with_range(&buffer, 1, 1).unwrap();
        data.get_cursor().put_index(70_000).unwrap();
        ctx.index_buffer_update(&data).unwrap();

        let map = ctx.index_buffer_map_read(&buffer).unwrap();
        let mut cursor = map.get_cursor();
        cursor.seek_to(1).unwrap();
        assert_eq!(cursor.get_index(), Ok(70_000));
    }

    #[test]
    fn deleted_array_cannot_seed_an_index_buffer() {
        let mut ctx = Context::new(FakeDriver::new()).unwrap();
        let descriptor = ArrayDescriptor::builder()
            .attribute("position", ScalarType::F32, 2)
            .build()
            .unwrap();
        let array = ctx
            .array_buffer_allocate(3, &descriptor, UsageHint::StaticDraw)
            .unwrap();
        ctx.array_buffer_delete(&array).unwrap();

        assert!(matches!(
            ctx.index_buffer_allocate(&array, 3, UsageHint::StaticDraw),
            Err(CreateIndexBufferError::Handle(HandleError::Deleted { .. }))
        ));
        assert!(matches!(
            ctx.index_buffer_allocate_type(IndexType::U8, 0, UsageHint::StaticDraw),
            Err(CreateIndexBufferError::ZeroIndices)
        ));
    }

    #[test]
    fn oversized_index_counts_fail_without_allocating() {
        let mut ctx = Context::new(FakeDriver::new()).unwrap();

        assert!(matches!(
            ctx.index_buffer_allocate_type(IndexType::U32, u64::MAX / 2, UsageHint::StaticDraw),
            Err(CreateIndexBufferError::TooLarge {
                ty: IndexType::U32,
                ..
            })
        ));
        // Representable, but more than the driver will hand out.
        assert!(matches!(
            ctx.index_buffer_allocate_type(IndexType::U32, u64::MAX / 8, UsageHint::StaticDraw),
            Err(CreateIndexBufferError::Driver(DriverError::OutOfMemory))
        ));
        assert_eq!(ctx.registry().live_count(ResourceKind::IndexBuffer), 0);
        assert_eq!(ctx.driver().live_object_count(), 0);
        assert!(!ctx.index_buffer_any_bound());
    }
}
