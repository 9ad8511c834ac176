//! The native driver seam.
//!
//! [`Driver`] is the complete command surface this crate issues. Every call
//! arrives pre-validated: names are live and belong to the calling context,
//! bindings the command depends on are in place, and mapped buffers are not
//! touched. Adapters translate each call into the real API and report
//! failures as [`DriverError`], never as raw status codes.
//!
//! [`FakeDriver`](crate::fake::FakeDriver) is an in-memory implementation.

use thiserror::Error;

use crate::array::ScalarType;
use crate::buffer::{BufferTarget, UsageHint};
use crate::draw::{ClearSpecification, Primitive};
use crate::framebuffer::{
    AttachmentSlot, AttachmentSource, BlitSpecification, FramebufferStatus,
    FramebufferTarget,
};
use crate::index::IndexType;
use crate::program::{ActiveVariable, ShaderStage, UniformValue};
use crate::texture::{
    CubeFace, RenderbufferFormat, TextureFormat, TextureParameters,
    TextureTarget,
};

/// Capability limits queried once at context creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub texture_units: u32,
    pub color_attachments: u32,
    pub draw_buffers: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Driver reported an invalid enumeration value")]
    InvalidEnum,

    #[error("Driver reported an invalid value")]
    InvalidValue,

    #[error("Driver reported an invalid operation")]
    InvalidOperation,

    #[error("Driver reported an invalid framebuffer operation")]
    InvalidFramebufferOperation,

    #[error("Driver is out of memory")]
    OutOfMemory,

    #[error("Unsupported by this driver: {0}")]
    Unsupported(String),

    #[error("Shader compilation failed: {log}")]
    ShaderCompile { log: String },

    #[error("Program link failed: {log}")]
    ProgramLink { log: String },

    #[error("Driver returned an unusable object name {0}")]
    InvalidName(u32),

    #[error("Unknown driver error code {0:#06x}")]
    Unknown(u32),
}

impl DriverError {
    /// Map a raw GL error code to a typed error. `GL_NO_ERROR` maps to
    /// `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            0x0500 => Some(DriverError::InvalidEnum),
            0x0501 => Some(DriverError::InvalidValue),
            0x0502 => Some(DriverError::InvalidOperation),
            0x0505 => Some(DriverError::OutOfMemory),
            0x0506 => Some(DriverError::InvalidFramebufferOperation),
            other => Some(DriverError::Unknown(other)),
        }
    }
}

/// Layout of one vertex attribute inside a bound array buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttribPointer {
    pub scalar: ScalarType,
    pub components: u32,
    pub stride: u64,
    pub offset: u64,
}

pub trait Driver {
    fn limits(&self) -> Result<Limits, DriverError>;

    // Buffers

    fn gen_buffer(&mut self) -> Result<u32, DriverError>;
    fn delete_buffer(&mut self, name: u32) -> Result<(), DriverError>;
    fn bind_buffer(
        &mut self,
        target: BufferTarget,
        name: Option<u32>,
    ) -> Result<(), DriverError>;
    /// (Re)allocate storage for the buffer bound to `target`.
    fn buffer_allocate(
        &mut self,
        target: BufferTarget,
        size: u64,
        usage: UsageHint,
    ) -> Result<(), DriverError>;
    fn buffer_write(
        &mut self,
        target: BufferTarget,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DriverError>;
    fn buffer_read(
        &mut self,
        target: BufferTarget,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), DriverError>;

    // Textures and renderbuffers

    fn gen_texture(&mut self) -> Result<u32, DriverError>;
    fn delete_texture(&mut self, name: u32) -> Result<(), DriverError>;
    fn bind_texture(
        &mut self,
        unit: u32,
        target: TextureTarget,
        name: Option<u32>,
    ) -> Result<(), DriverError>;
    fn texture_2d_storage(
        &mut self,
        name: u32,
        width: u32,
        height: u32,
        format: TextureFormat,
        parameters: &TextureParameters,
    ) -> Result<(), DriverError>;
    fn texture_cube_storage(
        &mut self,
        name: u32,
        size: u32,
        format: TextureFormat,
        parameters: &TextureParameters,
    ) -> Result<(), DriverError>;

    fn gen_renderbuffer(&mut self) -> Result<u32, DriverError>;
    fn delete_renderbuffer(&mut self, name: u32) -> Result<(), DriverError>;
    fn renderbuffer_storage(
        &mut self,
        name: u32,
        format: RenderbufferFormat,
        width: u32,
        height: u32,
    ) -> Result<(), DriverError>;

    // Framebuffers

    fn gen_framebuffer(&mut self) -> Result<u32, DriverError>;
    fn delete_framebuffer(&mut self, name: u32) -> Result<(), DriverError>;
    /// `None` binds the default framebuffer.
    fn bind_framebuffer(
        &mut self,
        target: FramebufferTarget,
        name: Option<u32>,
    ) -> Result<(), DriverError>;
    fn framebuffer_attach(
        &mut self,
        framebuffer: u32,
        slot: AttachmentSlot,
        source: AttachmentSource,
    ) -> Result<(), DriverError>;
    fn framebuffer_status(
        &mut self,
        framebuffer: u32,
    ) -> Result<FramebufferStatus, DriverError>;
    /// `buffers[i]` is the color attachment index written by draw buffer
    /// `i`, or `None` to discard it.
    fn framebuffer_draw_buffers(
        &mut self,
        framebuffer: u32,
        buffers: &[Option<u32>],
    ) -> Result<(), DriverError>;
    fn blit_framebuffer(
        &mut self,
        blit: &BlitSpecification,
    ) -> Result<(), DriverError>;

    // Shaders and programs

    /// Compile a single shader. Syntax errors are reported as
    /// [`DriverError::ShaderCompile`].
    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        label: &str,
        source: &str,
    ) -> Result<u32, DriverError>;
    fn delete_shader(&mut self, name: u32) -> Result<(), DriverError>;
    fn create_program(&mut self, label: &str) -> Result<u32, DriverError>;
    fn attach_shader(
        &mut self,
        program: u32,
        shader: u32,
    ) -> Result<(), DriverError>;
    /// Link failures are reported as [`DriverError::ProgramLink`].
    fn link_program(&mut self, program: u32) -> Result<(), DriverError>;
    fn active_attributes(
        &mut self,
        program: u32,
    ) -> Result<Vec<ActiveVariable>, DriverError>;
    fn active_uniforms(
        &mut self,
        program: u32,
    ) -> Result<Vec<ActiveVariable>, DriverError>;
    fn delete_program(&mut self, program: u32) -> Result<(), DriverError>;
    fn use_program(&mut self, program: Option<u32>) -> Result<(), DriverError>;
    /// Set uniform `location` of the program in use.
    fn program_uniform(
        &mut self,
        location: i32,
        value: &UniformValue,
    ) -> Result<(), DriverError>;

    // Drawing

    /// Source attribute `location` from the bound array buffer.
    fn vertex_attrib_pointer(
        &mut self,
        location: u32,
        pointer: &AttribPointer,
    ) -> Result<(), DriverError>;
    fn disable_vertex_attrib(&mut self, location: u32)
    -> Result<(), DriverError>;
    fn draw_elements(
        &mut self,
        primitive: Primitive,
        count: u64,
        index_type: IndexType,
    ) -> Result<(), DriverError>;
    fn clear(&mut self, clear: &ClearSpecification) -> Result<(), DriverError>;
}

/// Cube face helper shared by adapters: GL enumerates faces in this order.
pub fn cube_face_index(face: CubeFace) -> u32 {
    match face {
        CubeFace::PositiveX => 0,
        CubeFace::NegativeX => 1,
        CubeFace::PositiveY => 2,
        CubeFace::NegativeY => 3,
        CubeFace::PositiveZ => 4,
        CubeFace::NegativeZ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_map_to_typed_errors() {
        assert_eq!(DriverError::from_code(0), None);
        assert_eq!(
            DriverError::from_code(0x0502),
            Some(DriverError::InvalidOperation)
        );
        assert_eq!(
            DriverError::from_code(0x0506),
            Some(DriverError::InvalidFramebufferOperation)
        );
        assert_eq!(
            DriverError::from_code(0x9999),
            Some(DriverError::Unknown(0x9999))
        );
    }

    #[test]
    fn cube_faces_follow_gl_order() {
        assert_eq!(cube_face_index(CubeFace::PositiveX), 0);
        assert_eq!(cube_face_index(CubeFace::NegativeZ), 5);
    }
}
