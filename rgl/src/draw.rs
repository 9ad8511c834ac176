//! Clearing and indexed drawing.
//!
//! A draw needs the index buffer bound, a program active, and no mapping
//! outstanding on the bound index or array buffer.

use std::fmt;

use thiserror::Error;

use crate::binding::BindingTarget;
use crate::buffer::{BufferError, BufferTarget};
use crate::context::Context;
use crate::driver::{Driver, DriverError};
use crate::handle::{HandleError, ResourceHandle};
use crate::index::IndexBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Points,
    Lines,
    LineStrip,
    LineLoop,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Primitive::Points => "points",
            Primitive::Lines => "lines",
            Primitive::LineStrip => "line strip",
            Primitive::LineLoop => "line loop",
            Primitive::Triangles => "triangles",
            Primitive::TriangleStrip => "triangle strip",
            Primitive::TriangleFan => "triangle fan",
        };
        f.write_str(name)
    }
}

// ---- Error types ----

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClearSpecificationError {
    #[error("Clear specification clears nothing")]
    Empty,

    #[error("Clear depth {0} is outside 0.0..=1.0")]
    DepthOutOfRange(f32),
}

#[derive(Debug, Error)]
pub enum DrawError {
    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("No program is active")]
    NoActiveProgram,

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

// ---- Clearing ----

/// Which buffers of the draw framebuffer to clear, and to what.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearSpecification {
    pub color: Option<[f32; 4]>,
    pub depth: Option<f32>,
    pub stencil: Option<i32>,
}

impl ClearSpecification {
    pub fn builder() -> ClearSpecificationBuilder {
        ClearSpecificationBuilder::default()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClearSpecificationBuilder {
    color: Option<[f32; 4]>,
    depth: Option<f32>,
    stencil: Option<i32>,
}

impl ClearSpecificationBuilder {
    pub fn color(mut self, rgba: [f32; 4]) -> Self {
        self.color = Some(rgba);
        self
    }

    pub fn depth(mut self, depth: f32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn stencil(mut self, stencil: i32) -> Self {
        self.stencil = Some(stencil);
        self
    }

    pub fn build(self) -> Result<ClearSpecification, ClearSpecificationError> {
        if self.color.is_none() && self.depth.is_none() && self.stencil.is_none() {
            return Err(ClearSpecificationError::Empty);
        }
        if let Some(depth) = self.depth
            && !(0.0..=1.0).contains(&depth)
        {
            return Err(ClearSpecificationError::DepthOutOfRange(depth));
        }
        Ok(ClearSpecification {
            color: self.color,
            depth: self.depth,
            stencil: self.stencil,
        })
    }
}

impl<D: Driver> Context<D> {
    /// Clear the currently bound draw framebuffer, or the default one.
    pub fn clear(&mut self, clear: &ClearSpecification) -> Result<(), DriverError> {
        tracing::trace!("Clearing {clear:?}");
        self.driver.clear(clear)
    }

    /// Draw every index of `indices` with the active program.
    pub fn draw_elements(
        &mut self,
        primitive: Primitive,
        indices: &IndexBuffer,
    ) -> Result<(), DrawError> {
        let handle = indices.handle();
        self.require_buffer_bound(handle, BufferTarget::Index)?;
        self.require_unmapped(handle)?;
        if let Some(array) = self.bindings.bound(BindingTarget::ArrayBuffer) {
            self.require_unmapped(array)?;
        }
        if !self.bindings.any_bound(BindingTarget::Program) {
            return Err(DrawError::NoActiveProgram);
        }
        tracing::trace!("Drawing {} {primitive} from {handle}", indices.indices());
        self.driver
            .draw_elements(primitive, indices.indices(), indices.index_type())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayDescriptor, ScalarType};
    use crate::buffer::UsageHint;
    use crate::fake::{FakeCommand, FakeDriver};
    use crate::index::IndexType;
    use crate::program::Program;
    use crate::source::MemorySources;

    #[test]
    fn empty_clear_is_rejected() {
        assert_eq!(
            ClearSpecification::builder().build(),
            Err(ClearSpecificationError::Empty)
        );
        assert!(matches!(
            ClearSpecification::builder().depth(1.5).build(),
            Err(ClearSpecificationError::DepthOutOfRange(_))
        ));

        let clear = ClearSpecification::builder()
            .color([0.0, 0.0, 0.0, 1.0])
            .stencil(0)
            .build()
            .unwrap();
        assert_eq!(clear.depth, None);

        let mut ctx = Context::new(FakeDriver::new()).unwrap();
        ctx.clear(&clear).unwrap();
        assert!(
            ctx.driver()
                .commands()
                .iter()
                .any(|command| matches!(command, FakeCommand::Clear(c) if *c == clear))
        );
    }

    #[test]
    fn draw_requires_bound_indices_and_active_program() {
        let mut ctx = Context::new(FakeDriver::new()).unwrap();
        let descriptor = ArrayDescriptor::builder()
            .attribute("position", ScalarType::F32, 3)
            .build()
            .unwrap();
        let array = ctx
            .array_buffer_allocate(3, &descriptor, UsageHint::StaticDraw)
            .unwrap();
        let indices = ctx
            .index_buffer_allocate(&array, 3, UsageHint::StaticDraw)
            .unwrap();
        assert_eq!(indices.index_type(), IndexType::U8);

        assert!(matches!(
            ctx.draw_elements(Primitive::Triangles, &indices),
            Err(DrawError::NoActiveProgram)
        ));

        let mut sources = MemorySources::new();
        sources.mount("flat.vert", "in vec3 position;\n");
        let mut program = Program::new("flat");
        program.add_vertex_shader("flat.vert");
        program.compile(&mut ctx, &sources).unwrap();
        program.activate(&mut ctx).unwrap();

        ctx.array_buffer_map_write(&array).unwrap();
        assert!(matches!(
            ctx.draw_elements(Primitive::Triangles, &indices),
            Err(DrawError::Buffer(BufferError::StillMapped { .. }))
        ));
        ctx.array_buffer_unmap(&array).unwrap();

        ctx.draw_elements(Primitive::Triangles, &indices).unwrap();
        assert!(ctx.driver().commands().iter().any(|command| matches!(
            command,
            FakeCommand::DrawElements {
                primitive: Primitive::Triangles,
                count: 3,
                index_type: IndexType::U8,
            }
        )));

        ctx.index_buffer_unbind().unwrap();
        assert!(matches!(
            ctx.draw_elements(Primitive::Triangles, &indices),
            Err(DrawError::Buffer(BufferError::NotBound { .. }))
        ));

        ctx.index_buffer_bind(&indices).unwrap();
        ctx.index_buffer_delete(&indices).unwrap();
        assert!(matches!(
            ctx.draw_elements(Primitive::Triangles, &indices),
            Err(DrawError::Buffer(BufferError::Handle(HandleError::Deleted { .. })))
        ));
    }
}
