//! Textures, renderbuffers, and texture unit bindings.
//!
//! Textures and renderbuffers are the images a framebuffer renders into;
//! textures can also be bound to numbered texture units for sampling. Unit
//! numbers are checked against [`Limits::texture_units`](crate::driver::Limits).

use std::fmt;

use thiserror::Error;

use crate::binding::{BindError, BindingTarget};
use crate::context::Context;
use crate::driver::{Driver, DriverError};
use crate::handle::{Handle, HandleError, ResourceHandle, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
    Rgb8,
    Rg8,
    R8,
    Rgba16f,
    Rgba32f,
    Depth16,
    Depth24,
    Depth32f,
    Depth24Stencil8,
}

impl TextureFormat {
    pub fn is_color_renderable(self) -> bool {
        !self.is_depth_renderable()
    }

    pub fn is_depth_renderable(self) -> bool {
        matches!(
            self,
            TextureFormat::Depth16
                | TextureFormat::Depth24
                | TextureFormat::Depth32f
                | TextureFormat::Depth24Stencil8
        )
    }

    pub fn is_stencil_renderable(self) -> bool {
        self == TextureFormat::Depth24Stencil8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderbufferFormat {
    Rgba8,
    Rgb8,
    Depth16,
    Depth24,
    Depth32f,
    Depth24Stencil8,
    Stencil8,
}

impl RenderbufferFormat {
    pub fn is_color_renderable(self) -> bool {
        matches!(self, RenderbufferFormat::Rgba8 | RenderbufferFormat::Rgb8)
    }

    pub fn is_depth_renderable(self) -> bool {
        matches!(
            self,
            RenderbufferFormat::Depth16
                | RenderbufferFormat::Depth24
                | RenderbufferFormat::Depth32f
                | RenderbufferFormat::Depth24Stencil8
        )
    }

    pub fn is_stencil_renderable(self) -> bool {
        matches!(
            self,
            RenderbufferFormat::Depth24Stencil8 | RenderbufferFormat::Stencil8
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureWrap {
    #[default]
    ClampToEdge,
    Repeat,
    MirroredRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFilter {
    Nearest,
    #[default]
    Linear,
}

/// Sampling state applied when a texture is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureParameters {
    pub wrap_s: TextureWrap,
    pub wrap_t: TextureWrap,
    /// Only meaningful for cube textures.
    pub wrap_r: TextureWrap,
    pub min_filter: TextureFilter,
    pub mag_filter: TextureFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeFace {
    PositiveX,
    NegativeX,
    PositiveY,
    NegativeY,
    PositiveZ,
    NegativeZ,
}

impl CubeFace {
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PositiveX,
        CubeFace::NegativeX,
        CubeFace::PositiveY,
        CubeFace::NegativeY,
        CubeFace::PositiveZ,
        CubeFace::NegativeZ,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    Texture2D,
    TextureCube,
}

#[derive(Debug, Error)]
pub enum CreateTextureError {
    #[error("Invalid texture size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("Driver error creating texture: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Error)]
pub enum DeleteTextureError {
    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("{resource} is attached to {sharers} framebuffer(s) that share it")]
    Shared { resource: Handle, sharers: usize },

    #[error("Driver error deleting texture: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texture2D {
    handle: Handle,
    width: u32,
    height: u32,
    format: TextureFormat,
    parameters: TextureParameters,
}

impl Texture2D {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn parameters(&self) -> &TextureParameters {
        &self.parameters
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureCube {
    handle: Handle,
    size: u32,
    format: TextureFormat,
    parameters: TextureParameters,
}

impl TextureCube {
    /// Edge length of every face.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn parameters(&self) -> &TextureParameters {
        &self.parameters
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renderbuffer {
    handle: Handle,
    width: u32,
    height: u32,
    format: RenderbufferFormat,
}

impl Renderbuffer {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> RenderbufferFormat {
        self.format
    }
}

impl ResourceHandle for Texture2D {
    fn handle(&self) -> Handle {
        self.handle
    }
}

impl ResourceHandle for TextureCube {
    fn handle(&self) -> Handle {
        self.handle
    }
}

impl ResourceHandle for Renderbuffer {
    fn handle(&self) -> Handle {
        self.handle
    }
}

impl fmt::Display for Texture2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}x{} {:?})", self.handle, self.width, self.height, self.format)
    }
}

impl fmt::Display for Renderbuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}x{} {:?})", self.handle, self.width, self.height, self.format)
    }
}

/// Textures that can be bound to a texture unit.
pub trait BindableTexture: ResourceHandle {
    fn texture_target(&self) -> TextureTarget;
}

impl BindableTexture for Texture2D {
    fn texture_target(&self) -> TextureTarget {
        TextureTarget::Texture2D
    }
}

impl BindableTexture for TextureCube {
    fn texture_target(&self) -> TextureTarget {
        TextureTarget::TextureCube
    }
}

fn target_for_kind(kind: ResourceKind) -> TextureTarget {
    match kind {
        ResourceKind::TextureCube => TextureTarget::TextureCube,
        _ => TextureTarget::Texture2D,
    }
}

impl<D: Driver> Context<D> {
    pub fn texture_2d_allocate(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        parameters: &TextureParameters,
    ) -> Result<Texture2D, CreateTextureError> {
        if width == 0 || height == 0 {
            return Err(CreateTextureError::InvalidSize { width, height });
        }
        let handle = self.create_image(ResourceKind::Texture2D, |driver, raw| {
            driver.texture_2d_storage(raw, width, height, format, parameters)
        })?;
        Ok(Texture2D {
            handle,
            width,
            height,
            format,
            parameters: *parameters,
        })
    }

    pub fn texture_cube_allocate(
        &mut self,
        size: u32,
        format: TextureFormat,
        parameters: &TextureParameters,
    ) -> Result<TextureCube, CreateTextureError> {
        if size == 0 {
            return Err(CreateTextureError::InvalidSize {
                width: size,
                height: size,
            });
        }
        let handle = self.create_image(ResourceKind::TextureCube, |driver, raw| {
            driver.texture_cube_storage(raw, size, format, parameters)
        })?;
        Ok(TextureCube {
            handle,
            size,
            format,
            parameters: *parameters,
        })
    }

    pub fn renderbuffer_allocate(
        &mut self,
        width: u32,
        height: u32,
        format: RenderbufferFormat,
    ) -> Result<Renderbuffer, CreateTextureError> {
        if width == 0 || height == 0 {
            return Err(CreateTextureError::InvalidSize { width, height });
        }
        let handle = self.create_image(ResourceKind::Renderbuffer, |driver, raw| {
            driver.renderbuffer_storage(raw, format, width, height)
        })?;
        Ok(Renderbuffer {
            handle,
            width,
            height,
            format,
        })
    }

    pub fn texture_2d_delete(&mut self, texture: &Texture2D) -> Result<(), DeleteTextureError> {
        self.delete_image(texture.handle)
    }

    pub fn texture_cube_delete(
        &mut self,
        texture: &TextureCube,
    ) -> Result<(), DeleteTextureError> {
        self.delete_image(texture.handle)
    }

    pub fn renderbuffer_delete(
        &mut self,
        renderbuffer: &Renderbuffer,
    ) -> Result<(), DeleteTextureError> {
        self.delete_image(renderbuffer.handle)
    }

    pub fn texture_unit_bind(
        &mut self,
        unit: u32,
        texture: &impl BindableTexture,
    ) -> Result<(), BindError> {
        self.check_texture_unit(unit)?;
        let target = texture.texture_target();
        let handle = texture.handle();
        self.bind_target(BindingTarget::TextureUnit(unit), handle, |driver| {
            driver.bind_texture(unit, target, Some(handle.raw()))
        })
    }

    /// Unbind whatever texture is bound to `unit`. Unbinding an empty unit
    /// is not an error.
    pub fn texture_unit_unbind(&mut self, unit: u32) -> Result<(), BindError> {
        self.check_texture_unit(unit)?;
        let binding = BindingTarget::TextureUnit(unit);
        let Some(bound) = self.bindings.bound(binding) else {
            return Ok(());
        };
        let target = target_for_kind(bound.kind());
        self.unbind_target(binding, |driver| driver.bind_texture(unit, target, None))?;
        Ok(())
    }

    pub fn texture_unit_is_bound(
        &self,
        unit: u32,
        texture: &impl BindableTexture,
    ) -> Result<bool, BindError> {
        self.check_texture_unit(unit)?;
        Ok(self.target_is_bound(BindingTarget::TextureUnit(unit), texture.handle())?)
    }

    fn check_texture_unit(&self, unit: u32) -> Result<(), BindError> {
        let available = self.limits.texture_units;
        if unit >= available {
            return Err(BindError::NoSuchTextureUnit { unit, available });
        }
        Ok(())
    }

    /// Generate a texture or renderbuffer name of `kind` and give it
    /// storage, releasing the name again if the storage call fails.
    fn create_image(
        &mut self,
        kind: ResourceKind,
        storage: impl FnOnce(&mut D, u32) -> Result<(), DriverError>,
    ) -> Result<Handle, DriverError> {
        let raw = match kind {
            ResourceKind::Renderbuffer => self.driver.gen_renderbuffer()?,
            _ => self.driver.gen_texture()?,
        };
        let handle = self.register(kind, raw)?;
        if let Err(e) = storage(&mut self.driver, raw) {
            if let Err(e) = self.delete_image_name(kind, raw) {
                tracing::warn!("Failed to delete {kind} {raw}: {e}");
            }
            if let Err(e) = self.release(handle) {
                tracing::warn!("Failed to release {handle}: {e}");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Fails with [`DeleteTextureError::Shared`] while another framebuffer
    /// shares the image as an attachment.
    pub(crate) fn delete_image(&mut self, handle: Handle) -> Result<(), DeleteTextureError> {
        self.registry.check_live(handle)?;
        let sharers = self.share_count(handle);
        if sharers > 0 {
            return Err(DeleteTextureError::Shared {
                resource: handle,
                sharers,
            });
        }
        tracing::debug!("Deleting {handle}");
        self.delete_image_name(handle.kind(), handle.raw())?;
        self.release(handle)?;
        Ok(())
    }

    fn delete_image_name(&mut self, kind: ResourceKind, raw: u32) -> Result<(), DriverError> {
        match kind {
            ResourceKind::Renderbuffer => self.driver.delete_renderbuffer(raw),
            _ => self.driver.delete_texture(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeDriver;

    fn context() -> Context<FakeDriver> {
        Context::new(FakeDriver::new()).unwrap()
    }

    #[test]
    fn format_classification() {
        assert!(TextureFormat::Rgba16f.is_color_renderable());
        assert!(!TextureFormat::Depth24.is_color_renderable());
        assert!(TextureFormat::Depth24Stencil8.is_stencil_renderable());
        assert!(!TextureFormat::Depth32f.is_stencil_renderable());

        assert!(RenderbufferFormat::Stencil8.is_stencil_renderable());
        assert!(!RenderbufferFormat::Stencil8.is_depth_renderable());
        assert!(!RenderbufferFormat::Stencil8.is_color_renderable());
        assert!(RenderbufferFormat::Depth24Stencil8.is_depth_renderable());
    }

    #[test]
    fn zero_sized_images_are_rejected() {
        let mut ctx = context();

        assert!(matches!(
            ctx.texture_2d_allocate(0, 4, TextureFormat::Rgba8, &TextureParameters::default()),
            Err(CreateTextureError::InvalidSize { width: 0, height: 4 })
        ));
        assert!(matches!(
            ctx.renderbuffer_allocate(4, 0, RenderbufferFormat::Depth16),
            Err(CreateTextureError::InvalidSize { .. })
        ));
        assert_eq!(ctx.registry().live_count(ResourceKind::Texture2D), 0);
    }

    #[test]
    fn texture_units_are_checked_against_limits() {
        let mut ctx = context();
        let texture = ctx
            .texture_2d_allocate(8, 8, TextureFormat::Rgba8, &TextureParameters::default())
            .unwrap();
        let units = ctx.limits().texture_units;

        assert!(matches!(
            ctx.texture_unit_bind(units, &texture),
            Err(BindError::NoSuchTextureUnit { .. })
        ));

        ctx.texture_unit_bind(units - 1, &texture).unwrap();
        assert!(ctx.texture_unit_is_bound(units - 1, &texture).unwrap());
        assert!(!ctx.texture_unit_is_bound(0, &texture).unwrap());

        ctx.texture_unit_unbind(units - 1).unwrap();
        assert!(!ctx.texture_unit_is_bound(units - 1, &texture).unwrap());
        // Already empty.
        ctx.texture_unit_unbind(units - 1).unwrap();
    }

    #[test]
    fn deleting_a_bound_texture_clears_its_unit() {
        let mut ctx = context();
        let cube = ctx
            .texture_cube_allocate(16, TextureFormat::Rgba8, &TextureParameters::default())
            .unwrap();
        ctx.texture_unit_bind(2, &cube).unwrap();

        ctx.texture_cube_delete(&cube).unwrap();

        assert!(!ctx.bindings().any_bound(BindingTarget::TextureUnit(2)));
        assert!(matches!(
            ctx.texture_cube_delete(&cube),
            Err(DeleteTextureError::Handle(HandleError::Deleted { .. }))
        ));
        assert!(matches!(
            ctx.texture_unit_is_bound(2, &cube),
            Err(BindError::Handle(HandleError::Deleted { .. }))
        ));
    }

    #[test]
    fn renderbuffers_cannot_be_bound_to_texture_units() {
        let mut ctx = context();
        let renderbuffer = ctx
            .renderbuffer_allocate(4, 4, RenderbufferFormat::Rgba8)
            .unwrap();

        // Not a BindableTexture, so only the raw state machine can try it.
        let result = ctx.bindings.bind(
            &ctx.registry,
            BindingTarget::TextureUnit(0),
            renderbuffer.handle(),
        );
        assert!(matches!(result, Err(BindError::IncompatibleTarget { .. })));
        ctx.renderbuffer_delete(&renderbuffer).unwrap();
    }
}
