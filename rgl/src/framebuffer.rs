//! Framebuffers: attachment configuration, sharing, construction, and the
//! draw/read binding targets.
//!
//! A [`FramebufferConfiguration`] collects attachment requests. Owned
//! requests (`request_color_*`, `request_depth_*`, `request_stencil_*`) ask
//! [`make`](FramebufferConfiguration::make) to allocate a new renderbuffer
//! or texture. Shared requests (`request_shared_*`) reuse an attachment of
//! an existing framebuffer instead.
//!
//! Sharing is resolved when requested: sharing an attachment that is itself
//! shared yields a reference to the framebuffer that owns the resource, so
//! a [`Shared`] attachment is always exactly one hop from its owner. The
//! owner keeps its resources alive; a sharer holds copies of their handles
//! and contributes to a per-resource share count in the
//! [`Context`]. [`Context::framebuffer_delete`] refuses to delete an owner
//! while any live framebuffer still shares one of its resources.
//!
//! [`make`](FramebufferConfiguration::make) allocates every owned resource,
//! attaches everything, and asks the driver whether the result is complete.
//! On any failure it deletes everything it allocated before returning, so a
//! failed `make` leaks nothing.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::binding::{BindError, BindingTarget};
use crate::context::Context;
use crate::driver::{Driver, DriverError};
use crate::handle::{Handle, HandleError, ResourceHandle, ResourceKind};
use crate::texture::{
    CreateTextureError, CubeFace, DeleteTextureError, Renderbuffer, RenderbufferFormat, Texture2D,
    TextureCube, TextureFilter, TextureFormat, TextureParameters,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColorAttachmentPoint(u32);

impl ColorAttachmentPoint {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ColorAttachmentPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "color attachment {}", self.0)
    }
}

/// A fragment shader output slot routed to a color attachment point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrawBuffer(u32);

impl DrawBuffer {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DrawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "draw buffer {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramebufferTarget {
    Draw,
    Read,
}

impl FramebufferTarget {
    pub fn binding_target(self) -> BindingTarget {
        match self {
            FramebufferTarget::Draw => BindingTarget::DrawFramebuffer,
            FramebufferTarget::Read => BindingTarget::ReadFramebuffer,
        }
    }
}

/// Completeness as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramebufferStatus {
    Complete,
    IncompleteAttachment,
    MissingAttachment,
    IncompleteDrawBuffer,
    IncompleteReadBuffer,
    Unsupported,
    Unknown,
}

impl fmt::Display for FramebufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FramebufferStatus::Complete => "complete",
            FramebufferStatus::IncompleteAttachment => "incomplete attachment",
            FramebufferStatus::MissingAttachment => "missing image attachment",
            FramebufferStatus::IncompleteDrawBuffer => "incomplete draw buffer",
            FramebufferStatus::IncompleteReadBuffer => "incomplete read buffer",
            FramebufferStatus::Unsupported => "unsupported attachment combination",
            FramebufferStatus::Unknown => "unknown status",
        };
        f.write_str(text)
    }
}

/// Where on a framebuffer an image is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttachmentSlot {
    Color(u32),
    Depth,
    Stencil,
    DepthStencil,
}

impl fmt::Display for AttachmentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentSlot::Color(index) => write!(f, "color attachment {index}"),
            AttachmentSlot::Depth => f.write_str("depth attachment"),
            AttachmentSlot::Stencil => f.write_str("stencil attachment"),
            AttachmentSlot::DepthStencil => f.write_str("depth/stencil attachment"),
        }
    }
}

/// The driver-level image behind an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentSource {
    Renderbuffer(u32),
    Texture2D(u32),
    TextureCubeFace(u32, CubeFace),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitArea {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl BlitArea {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }
}

/// Copy from the bound read framebuffer to the bound draw framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitSpecification {
    pub source: BlitArea,
    pub target: BlitArea,
    pub color: bool,
    pub depth: bool,
    pub stencil: bool,
    pub filter: TextureFilter,
}

// ---- Attachments ----

/// An attachment resource owned by another framebuffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shared<T> {
    owner: Handle,
    resource: T,
}

impl<T> Shared<T> {
    /// The framebuffer that owns the resource.
    pub fn owner(&self) -> Handle {
        self.owner
    }

    pub fn resource(&self) -> &T {
        &self.resource
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubeFaceTexture {
    pub texture: TextureCube,
    pub face: CubeFace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorAttachment {
    Renderbuffer(Renderbuffer),
    Texture2D(Texture2D),
    TextureCubeFace(CubeFaceTexture),
    SharedRenderbuffer(Shared<Renderbuffer>),
    SharedTexture2D(Shared<Texture2D>),
    SharedTextureCubeFace(Shared<CubeFaceTexture>),
}

impl ColorAttachment {
    pub fn is_shared(&self) -> bool {
        matches!(
            self,
            ColorAttachment::SharedRenderbuffer(_)
                | ColorAttachment::SharedTexture2D(_)
                | ColorAttachment::SharedTextureCubeFace(_)
        )
    }

    /// Handle of the renderbuffer or texture behind this attachment.
    pub fn resource_handle(&self) -> Handle {
        match self {
            ColorAttachment::Renderbuffer(r) => r.handle(),
            ColorAttachment::Texture2D(t) => t.handle(),
            ColorAttachment::TextureCubeFace(c) => c.texture.handle(),
            ColorAttachment::SharedRenderbuffer(s) => s.resource.handle(),
            ColorAttachment::SharedTexture2D(s) => s.resource.handle(),
            ColorAttachment::SharedTextureCubeFace(s) => s.resource.texture.handle(),
        }
    }

    /// The owning framebuffer, for shared attachments.
    pub fn owner(&self) -> Option<Handle> {
        match self {
            ColorAttachment::SharedRenderbuffer(s) => Some(s.owner),
            ColorAttachment::SharedTexture2D(s) => Some(s.owner),
            ColorAttachment::SharedTextureCubeFace(s) => Some(s.owner),
            _ => None,
        }
    }

    pub fn source(&self) -> AttachmentSource {
        match self {
            ColorAttachment::Renderbuffer(r) => AttachmentSource::Renderbuffer(r.handle().raw()),
            ColorAttachment::SharedRenderbuffer(s) => {
                AttachmentSource::Renderbuffer(s.resource.handle().raw())
            }
            ColorAttachment::Texture2D(t) => AttachmentSource::Texture2D(t.handle().raw()),
            ColorAttachment::SharedTexture2D(s) => {
                AttachmentSource::Texture2D(s.resource.handle().raw())
            }
            ColorAttachment::TextureCubeFace(c) => {
                AttachmentSource::TextureCubeFace(c.texture.handle().raw(), c.face)
            }
            ColorAttachment::SharedTextureCubeFace(s) => AttachmentSource::TextureCubeFace(
                s.resource.texture.handle().raw(),
                s.resource.face,
            ),
        }
    }

    /// The attachment a framebuffer gets when it shares this one from
    /// `holder`. Owned attachments become shared with `holder` as owner;
    /// shared attachments keep pointing at their original owner.
    fn share_from(&self, holder: Handle) -> ColorAttachment {
        match self {
            ColorAttachment::Renderbuffer(r) => ColorAttachment::SharedRenderbuffer(Shared {
                owner: holder,
                resource: r.clone(),
            }),
            ColorAttachment::Texture2D(t) => ColorAttachment::SharedTexture2D(Shared {
                owner: holder,
                resource: t.clone(),
            }),
            ColorAttachment::TextureCubeFace(c) => {
                ColorAttachment::SharedTextureCubeFace(Shared {
                    owner: holder,
                    resource: c.clone(),
                })
            }
            shared => shared.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepthAttachment {
    Renderbuffer(Renderbuffer),
    SharedRenderbuffer(Shared<Renderbuffer>),
}

impl DepthAttachment {
    pub fn renderbuffer(&self) -> &Renderbuffer {
        match self {
            DepthAttachment::Renderbuffer(r) => r,
            DepthAttachment::SharedRenderbuffer(s) => &s.resource,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, DepthAttachment::SharedRenderbuffer(_))
    }

    fn share_from(&self, holder: Handle) -> Shared<Renderbuffer> {
        match self {
            DepthAttachment::Renderbuffer(r) => Shared {
                owner: holder,
                resource: r.clone(),
            },
            DepthAttachment::SharedRenderbuffer(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StencilAttachment {
    Renderbuffer(Renderbuffer),
    SharedRenderbuffer(Shared<Renderbuffer>),
    /// Stencil comes from the packed depth/stencil depth attachment.
    PackedWithDepth,
}

// ---- Error types ----

/// The part of a configuration a request tried to claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTarget {
    Point(ColorAttachmentPoint),
    DrawBuffer(DrawBuffer),
    Depth,
    Stencil,
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestTarget::Point(point) => point.fmt(f),
            RequestTarget::DrawBuffer(buffer) => buffer.fmt(f),
            RequestTarget::Depth => f.write_str("depth attachment"),
            RequestTarget::Stencil => f.write_str("stencil attachment"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramebufferConfigError {
    #[error("{0} has already been requested")]
    AttachmentAlreadyRequested(RequestTarget),

    #[error("Framebuffer {framebuffer} has no {slot}")]
    NoSuchAttachment {
        framebuffer: Handle,
        slot: AttachmentSlot,
    },

    #[error("Cube faces must be square, not {width}x{height}")]
    CubeNotSquare { width: u32, height: u32 },

    #[error("Invalid framebuffer size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("Format {format} cannot be used as a {slot}")]
    UnsuitableFormat { format: String, slot: AttachmentSlot },
}

#[derive(Debug, Error)]
pub enum MakeFramebufferError {
    #[error("Framebuffer configuration requests no attachments")]
    EmptyConfiguration,

    #[error("Framebuffer is incomplete: {0}")]
    Incomplete(FramebufferStatus),

    #[error("Unsupported framebuffer configuration: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("Error allocating attachment: {0}")]
    Allocate(#[from] CreateTextureError),

    #[error("Driver error assembling framebuffer: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Error)]
pub enum FramebufferError {
    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("No framebuffer is bound to the {0} target")]
    NotBound(BindingTarget),

    #[error("{resource} is still shared by {sharers} other framebuffer(s)")]
    AttachmentShared { resource: Handle, sharers: usize },

    #[error("Depth and stencil blits must use nearest filtering")]
    LinearDepthStencilBlit,

    #[error("Error deleting attachment: {0}")]
    Attachment(#[from] DeleteTextureError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

// ---- Framebuffers ----

#[derive(Debug, Clone)]
pub struct Framebuffer {
    handle: Handle,
    width: u32,
    height: u32,
    color: BTreeMap<ColorAttachmentPoint, ColorAttachment>,
    draw_buffers: BTreeMap<DrawBuffer, ColorAttachmentPoint>,
    depth: Option<DepthAttachment>,
    stencil: Option<StencilAttachment>,
}

impl ResourceHandle for Framebuffer {
    fn handle(&self) -> Handle {
        self.handle
    }
}

impl Framebuffer {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_attachment(&self, point: ColorAttachmentPoint) -> Option<&ColorAttachment> {
        self.color.get(&point)
    }

    pub fn color_attachments(
        &self,
    ) -> impl Iterator<Item = (ColorAttachmentPoint, &ColorAttachment)> {
        self.color.iter().map(|(point, attachment)| (*point, attachment))
    }

    pub fn draw_buffers(&self) -> &BTreeMap<DrawBuffer, ColorAttachmentPoint> {
        &self.draw_buffers
    }

    pub fn depth_attachment(&self) -> Option<&DepthAttachment> {
        self.depth.as_ref()
    }

    pub fn stencil_attachment(&self) -> Option<&StencilAttachment> {
        self.stencil.as_ref()
    }

    /// Resources this framebuffer created and must delete.
    fn owned_resources(&self) -> Vec<Handle> {
        let mut owned: Vec<Handle> = self
            .color
            .values()
            .filter(|attachment| !attachment.is_shared())
            .map(ColorAttachment::resource_handle)
            .collect();
        if let Some(DepthAttachment::Renderbuffer(r)) = &self.depth {
            owned.push(r.handle());
        }
        if let Some(StencilAttachment::Renderbuffer(r)) = &self.stencil {
            owned.push(r.handle());
        }
        owned
    }

    /// Resources this framebuffer borrows from other framebuffers.
    fn shared_resources(&self) -> Vec<Handle> {
        let mut shared: Vec<Handle> = self
            .color
            .values()
            .filter(|attachment| attachment.is_shared())
            .map(ColorAttachment::resource_handle)
            .collect();
        if let Some(DepthAttachment::SharedRenderbuffer(s)) = &self.depth {
            shared.push(s.resource.handle());
        }
        if let Some(StencilAttachment::SharedRenderbuffer(s)) = &self.stencil {
            shared.push(s.resource.handle());
        }
        shared
    }
}

// ---- Configuration ----

#[derive(Debug, Clone, PartialEq, Eq)]
enum ColorRequest {
    Renderbuffer(RenderbufferFormat),
    Texture2D {
        format: TextureFormat,
        parameters: TextureParameters,
    },
    TextureCubeFace {
        face: CubeFace,
        format: TextureFormat,
        parameters: TextureParameters,
    },
    /// `via` is the framebuffer the request named; the attachment itself
    /// is already resolved to the ultimate owner.
    Shared {
        via: Handle,
        attachment: ColorAttachment,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DepthRequest {
    Renderbuffer(RenderbufferFormat),
    PackedDepthStencil,
    Shared { via: Handle, shared: Shared<Renderbuffer> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StencilRequest {
    Renderbuffer,
    PackedWithDepth,
    Shared { via: Handle, shared: Shared<Renderbuffer> },
}

/// Builder for a [`Framebuffer`]. Reusable: `make` does not consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferConfiguration {
    width: u32,
    height: u32,
    color: BTreeMap<ColorAttachmentPoint, ColorRequest>,
    draw_buffers: BTreeMap<DrawBuffer, ColorAttachmentPoint>,
    depth: Option<DepthRequest>,
    stencil: Option<StencilRequest>,
}

impl FramebufferConfiguration {
    pub fn new(width: u32, height: u32) -> Result<Self, FramebufferConfigError> {
        if width == 0 || height == 0 {
            return Err(FramebufferConfigError::InvalidSize { width, height });
        }
        Ok(Self {
            width,
            height,
            color: BTreeMap::new(),
            draw_buffers: BTreeMap::new(),
            depth: None,
            stencil: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.color.is_empty() && self.depth.is_none() && self.stencil.is_none()
    }

    pub fn request_color_rgba_renderbuffer(
        &mut self,
        point: ColorAttachmentPoint,
        buffer: DrawBuffer,
    ) -> Result<(), FramebufferConfigError> {
        self.request_color_renderbuffer(point, buffer, RenderbufferFormat::Rgba8)
    }

    pub fn request_color_rgb_renderbuffer(
        &mut self,
        point: ColorAttachmentPoint,
        buffer: DrawBuffer,
    ) -> Result<(), FramebufferConfigError> {
        self.request_color_renderbuffer(point, buffer, RenderbufferFormat::Rgb8)
    }

    pub fn request_color_renderbuffer(
        &mut self,
        point: ColorAttachmentPoint,
        buffer: DrawBuffer,
        format: RenderbufferFormat,
    ) -> Result<(), FramebufferConfigError> {
        if !format.is_color_renderable() {
            return Err(FramebufferConfigError::UnsuitableFormat {
                format: format!("{format:?}"),
                slot: AttachmentSlot::Color(point.index()),
            });
        }
        self.claim_color(point, buffer, ColorRequest::Renderbuffer(format))
    }

    pub fn request_color_texture_2d(
        &mut self,
        point: ColorAttachmentPoint,
        buffer: DrawBuffer,
        format: TextureFormat,
        parameters: &TextureParameters,
    ) -> Result<(), FramebufferConfigError> {
        Self::check_color_texture(point, format)?;
        self.claim_color(
            point,
            buffer,
            ColorRequest::Texture2D {
                format,
                parameters: *parameters,
            },
        )
    }

    /// Render into one face of a new cube texture. The configuration must be
    /// square.
    pub fn request_color_texture_cube_face(
        &mut self,
        point: ColorAttachmentPoint,
        buffer: DrawBuffer,
        face: CubeFace,
        format: TextureFormat,
        parameters: &TextureParameters,
    ) -> Result<(), FramebufferConfigError> {
        if self.width != self.height {
            return Err(FramebufferConfigError::CubeNotSquare {
                width: self.width,
                height: self.height,
            });
        }
        Self::check_color_texture(point, format)?;
        self.claim_color(
            point,
            buffer,
            ColorRequest::TextureCubeFace {
                face,
                format,
                parameters: *parameters,
            },
        )
    }

    /// Attach whatever `source` has at `source_point` to `point`, without
    /// allocating anything.
    pub fn request_shared_color(
        &mut self,
        point: ColorAttachmentPoint,
        buffer: DrawBuffer,
        source: &Framebuffer,
        source_point: ColorAttachmentPoint,
    ) -> Result<(), FramebufferConfigError> {
        let attachment = source.color_attachment(source_point).ok_or(
            FramebufferConfigError::NoSuchAttachment {
                framebuffer: source.handle,
                slot: AttachmentSlot::Color(source_point.index()),
            },
        )?;
        let request = ColorRequest::Shared {
            via: source.handle,
            attachment: attachment.share_from(source.handle),
        };
        self.claim_color(point, buffer, request)
    }

    pub fn request_depth_renderbuffer(
        &mut self,
        format: RenderbufferFormat,
    ) -> Result<(), FramebufferConfigError> {
        if !format.is_depth_renderable() {
            return Err(FramebufferConfigError::UnsuitableFormat {
                format: format!("{format:?}"),
                slot: AttachmentSlot::Depth,
            });
        }
        self.claim_depth(DepthRequest::Renderbuffer(format))
    }

    /// One packed renderbuffer serving as both depth and stencil.
    pub fn request_depth_stencil_renderbuffer(&mut self) -> Result<(), FramebufferConfigError> {
        if self.depth.is_some() {
            return Err(FramebufferConfigError::AttachmentAlreadyRequested(
                RequestTarget::Depth,
            ));
        }
        if self.stencil.is_some() {
            return Err(FramebufferConfigError::AttachmentAlreadyRequested(
                RequestTarget::Stencil,
            ));
        }
        self.depth = Some(DepthRequest::PackedDepthStencil);
        self.stencil = Some(StencilRequest::PackedWithDepth);
        Ok(())
    }

    pub fn request_stencil_renderbuffer(&mut self) -> Result<(), FramebufferConfigError> {
        self.claim_stencil(StencilRequest::Renderbuffer)
    }

    pub fn request_shared_depth(
        &mut self,
        source: &Framebuffer,
    ) -> Result<(), FramebufferConfigError> {
        let depth = source
            .depth_attachment()
            .ok_or(FramebufferConfigError::NoSuchAttachment {
                framebuffer: source.handle,
                slot: AttachmentSlot::Depth,
            })?;
        self.claim_depth(DepthRequest::Shared {
            via: source.handle,
            shared: depth.share_from(source.handle),
        })
    }

    /// Share the stencil attachment of `source`. If `source` packs stencil
    /// with depth, its depth/stencil renderbuffer is shared for both.
    pub fn request_shared_stencil(
        &mut self,
        source: &Framebuffer,
    ) -> Result<(), FramebufferConfigError> {
        let missing = FramebufferConfigError::NoSuchAttachment {
            framebuffer: source.handle,
            slot: AttachmentSlot::Stencil,
        };
        match source.stencil_attachment() {
            None => Err(missing),
            Some(StencilAttachment::Renderbuffer(r)) => {
                self.claim_stencil(StencilRequest::Shared {
                    via: source.handle,
                    shared: Shared {
                        owner: source.handle,
                        resource: r.clone(),
                    },
                })
            }
            Some(StencilAttachment::SharedRenderbuffer(s)) => {
                self.claim_stencil(StencilRequest::Shared {
                    via: source.handle,
                    shared: s.clone(),
                })
            }
            Some(StencilAttachment::PackedWithDepth) => {
                if self.stencil.is_some() {
                    return Err(FramebufferConfigError::AttachmentAlreadyRequested(
                        RequestTarget::Stencil,
                    ));
                }
                self.request_shared_depth(source)?;
                self.stencil = Some(StencilRequest::PackedWithDepth);
                Ok(())
            }
        }
    }

    /// Withdraw the request at `point` and any draw buffer routed to it.
    pub fn request_no_color_at(&mut self, point: ColorAttachmentPoint) {
        self.color.remove(&point);
        self.draw_buffers.retain(|_, routed| *routed != point);
    }

    pub fn request_no_color(&mut self) {
        self.color.clear();
        self.draw_buffers.clear();
    }

    /// Withdraw the depth request. A packed depth/stencil request is
    /// withdrawn as a whole.
    pub fn request_no_depth(&mut self) {
        self.depth = None;
        if self.stencil == Some(StencilRequest::PackedWithDepth) {
            self.stencil = None;
        }
    }

    /// Withdraw the stencil request. A packed depth/stencil request is
    /// withdrawn as a whole.
    pub fn request_no_stencil(&mut self) {
        if self.stencil.take() == Some(StencilRequest::PackedWithDepth) {
            self.depth = None;
        }
    }

    fn check_color_texture(
        point: ColorAttachmentPoint,
        format: TextureFormat,
    ) -> Result<(), FramebufferConfigError> {
        if !format.is_color_renderable() {
            return Err(FramebufferConfigError::UnsuitableFormat {
                format: format!("{format:?}"),
                slot: AttachmentSlot::Color(point.index()),
            });
        }
        Ok(())
    }

    fn claim_color(
        &mut self,
        point: ColorAttachmentPoint,
        buffer: DrawBuffer,
        request: ColorRequest,
    ) -> Result<(), FramebufferConfigError> {
        if self.color.contains_key(&point) {
            return Err(FramebufferConfigError::AttachmentAlreadyRequested(
                RequestTarget::Point(point),
            ));
        }
        if self.draw_buffers.contains_key(&buffer) {
            return Err(FramebufferConfigError::AttachmentAlreadyRequested(
                RequestTarget::DrawBuffer(buffer),
            ));
        }
        self.color.insert(point, request);
        self.draw_buffers.insert(buffer, point);
        Ok(())
    }

    fn claim_depth(&mut self, request: DepthRequest) -> Result<(), FramebufferConfigError> {
        if self.depth.is_some() {
            return Err(FramebufferConfigError::AttachmentAlreadyRequested(
                RequestTarget::Depth,
            ));
        }
        self.depth = Some(request);
        Ok(())
    }

    fn claim_stencil(&mut self, request: StencilRequest) -> Result<(), FramebufferConfigError> {
        if self.stencil.is_some() {
            return Err(FramebufferConfigError::AttachmentAlreadyRequested(
                RequestTarget::Stencil,
            ));
        }
        self.stencil = Some(request);
        Ok(())
    }

    /// Allocate, attach, and validate a framebuffer from this
    /// configuration.
    ///
    /// The draw framebuffer binding is left as it was found. If the driver
    /// reports the result incomplete, everything allocated here is deleted
    /// and [`MakeFramebufferError::Incomplete`] carries the status.
    pub fn make<D: Driver>(
        &self,
        ctx: &mut Context<D>,
    ) -> Result<Framebuffer, MakeFramebufferError> {
        if self.is_empty() {
            return Err(MakeFramebufferError::EmptyConfiguration);
        }
        self.check_limits(ctx)?;
        self.check_shared_live(ctx)?;

        let raw = ctx.driver.gen_framebuffer()?;
        let handle = ctx.register(ResourceKind::Framebuffer, raw)?;
        let previous = ctx.bindings.bound(BindingTarget::DrawFramebuffer);
        let mut working = Vec::new();

        let result = self.assemble(ctx, handle, &mut working);
        if result.is_err() {
            emergency_cleanup(ctx, handle, &working);
        }
        restore_draw_binding(ctx, previous);
        let framebuffer = result?;

        for resource in framebuffer.shared_resources() {
            *ctx.shares.entry(resource).or_insert(0) += 1;
        }
        Ok(framebuffer)
    }

    fn check_limits<D: Driver>(&self, ctx: &Context<D>) -> Result<(), MakeFramebufferError> {
        let limits = ctx.limits();
        if let Some(point) = self.color.keys().find(|p| p.index() >= limits.color_attachments) {
            return Err(MakeFramebufferError::Unsupported(format!(
                "{point} exceeds the {} color attachments available",
                limits.color_attachments
            )));
        }
        if let Some(buffer) = self.draw_buffers.keys().find(|b| b.index() >= limits.draw_buffers) {
            return Err(MakeFramebufferError::Unsupported(format!(
                "{buffer} exceeds the {} draw buffers available",
                limits.draw_buffers
            )));
        }
        Ok(())
    }

    /// Shared resources and the framebuffers they were taken from must
    /// still be live.
    fn check_shared_live<D: Driver>(&self, ctx: &Context<D>) -> Result<(), HandleError> {
        for request in self.color.values() {
            if let ColorRequest::Shared { via, attachment } = request {
                ctx.registry.check_live(*via)?;
                if let Some(owner) = attachment.owner() {
                    ctx.registry.check_live(owner)?;
                }
                ctx.registry.check_live(attachment.resource_handle())?;
            }
        }
        let depth = match &self.depth {
            Some(DepthRequest::Shared { via, shared }) => Some((via, shared)),
            _ => None,
        };
        let stencil = match &self.stencil {
            Some(StencilRequest::Shared { via, shared }) => Some((via, shared)),
            _ => None,
        };
        for (via, shared) in depth.into_iter().chain(stencil) {
            ctx.registry.check_live(*via)?;
            ctx.registry.check_live(shared.owner)?;
            ctx.registry.check_live(shared.resource.handle())?;
        }
        Ok(())
    }

    fn assemble<D: Driver>(
        &self,
        ctx: &mut Context<D>,
        handle: Handle,
        working: &mut Vec<Handle>,
    ) -> Result<Framebuffer, MakeFramebufferError> {
        let (width, height) = (self.width, self.height);

        let mut color = BTreeMap::new();
        for (point, request) in &self.color {
            let attachment = match request {
                ColorRequest::Renderbuffer(format) => {
                    let r = ctx.renderbuffer_allocate(width, height, *format)?;
                    working.push(r.handle());
                    ColorAttachment::Renderbuffer(r)
                }
                ColorRequest::Texture2D { format, parameters } => {
                    let t = ctx.texture_2d_allocate(width, height, *format, parameters)?;
                    working.push(t.handle());
                    ColorAttachment::Texture2D(t)
                }
                ColorRequest::TextureCubeFace {
                    face,
                    format,
                    parameters,
                } => {
                    let texture = ctx.texture_cube_allocate(width, *format, parameters)?;
                    working.push(texture.handle());
                    ColorAttachment::TextureCubeFace(CubeFaceTexture {
                        texture,
                        face: *face,
                    })
                }
                ColorRequest::Shared { attachment, .. } => attachment.clone(),
            };
            color.insert(*point, attachment);
        }

        let depth = match &self.depth {
            None => None,
            Some(DepthRequest::Renderbuffer(format)) => {
                let r = ctx.renderbuffer_allocate(width, height, *format)?;
                working.push(r.handle());
                Some(DepthAttachment::Renderbuffer(r))
            }
            Some(DepthRequest::PackedDepthStencil) => {
                let r =
                    ctx.renderbuffer_allocate(width, height, RenderbufferFormat::Depth24Stencil8)?;
                working.push(r.handle());
                Some(DepthAttachment::Renderbuffer(r))
            }
            Some(DepthRequest::Shared { shared, .. }) => {
                Some(DepthAttachment::SharedRenderbuffer(shared.clone()))
            }
        };

        let stencil = match &self.stencil {
            None => None,
            Some(StencilRequest::Renderbuffer) => {
                let r = ctx.renderbuffer_allocate(width, height, RenderbufferFormat::Stencil8)?;
                working.push(r.handle());
                Some(StencilAttachment::Renderbuffer(r))
            }
            Some(StencilRequest::PackedWithDepth) => Some(StencilAttachment::PackedWithDepth),
            Some(StencilRequest::Shared { shared, .. }) => {
                Some(StencilAttachment::SharedRenderbuffer(shared.clone()))
            }
        };

        let raw = handle.raw();
        ctx.driver.bind_framebuffer(FramebufferTarget::Draw, Some(raw))?;
        ctx.bindings.record(BindingTarget::DrawFramebuffer, handle);

        for (point, attachment) in &color {
            ctx.driver
                .framebuffer_attach(raw, AttachmentSlot::Color(point.index()), attachment.source())?;
        }
        if let Some(depth) = &depth {
            let slot = if stencil == Some(StencilAttachment::PackedWithDepth) {
                AttachmentSlot::DepthStencil
            } else {
                AttachmentSlot::Depth
            };
            let source = AttachmentSource::Renderbuffer(depth.renderbuffer().handle().raw());
            ctx.driver.framebuffer_attach(raw, slot, source)?;
        }
        match &stencil {
            Some(StencilAttachment::Renderbuffer(r)) => {
                let source = AttachmentSource::Renderbuffer(r.handle().raw());
                ctx.driver.framebuffer_attach(raw, AttachmentSlot::Stencil, source)?;
            }
            Some(StencilAttachment::SharedRenderbuffer(s)) => {
                let source = AttachmentSource::Renderbuffer(s.resource.handle().raw());
                ctx.driver.framebuffer_attach(raw, AttachmentSlot::Stencil, source)?;
            }
            Some(StencilAttachment::PackedWithDepth) | None => {}
        }

        let status = ctx.driver.framebuffer_status(raw)?;
        if status != FramebufferStatus::Complete {
            tracing::debug!("{handle} is incomplete: {status}");
            return Err(MakeFramebufferError::Incomplete(status));
        }

        let buffers = draw_buffer_list(&self.draw_buffers);
        ctx.driver.framebuffer_draw_buffers(raw, &buffers)?;

        tracing::debug!("Created {handle} ({width}x{height}) with {} color attachment(s)", color.len());
        Ok(Framebuffer {
            handle,
            width,
            height,
            color,
            draw_buffers: self.draw_buffers.clone(),
            depth,
            stencil,
        })
    }
}

/// `list[i]` is the attachment index draw buffer `i` writes, if any.
fn draw_buffer_list(mapping: &BTreeMap<DrawBuffer, ColorAttachmentPoint>) -> Vec<Option<u32>> {
    let len = mapping.keys().last().map_or(0, |buffer| buffer.index() as usize + 1);
    let mut list = vec![None; len];
    for (buffer, point) in mapping {
        list[buffer.index() as usize] = Some(point.index());
    }
    list
}

/// Delete everything a failed `make` allocated, including the framebuffer.
fn emergency_cleanup<D: Driver>(ctx: &mut Context<D>, handle: Handle, working: &[Handle]) {
    tracing::debug!("Cleaning up after failed construction of {handle}");
    for resource in working.iter().rev() {
        if let Err(e) = ctx.delete_image(*resource) {
            tracing::warn!("Failed to delete {resource} during cleanup: {e}");
        }
    }
    if let Err(e) = ctx.driver.delete_framebuffer(handle.raw()) {
        tracing::warn!("Failed to delete {handle} during cleanup: {e}");
    }
    if let Err(e) = ctx.release(handle) {
        tracing::warn!("Failed to release {handle} during cleanup: {e}");
    }
}

fn restore_draw_binding<D: Driver>(ctx: &mut Context<D>, previous: Option<Handle>) {
    let previous = previous.filter(|handle| ctx.registry.is_live(*handle));
    let result = ctx
        .driver
        .bind_framebuffer(FramebufferTarget::Draw, previous.map(Handle::raw));
    match result {
        Ok(()) => ctx.bindings.restore(BindingTarget::DrawFramebuffer, previous),
        Err(e) => tracing::warn!("Failed to restore draw framebuffer binding: {e}"),
    }
}

impl<D: Driver> Context<D> {
    pub fn framebuffer_draw_bind(&mut self, framebuffer: &Framebuffer) -> Result<(), BindError> {
        self.framebuffer_bind(FramebufferTarget::Draw, framebuffer)
    }

    /// Revert the draw target to the default framebuffer.
    pub fn framebuffer_draw_unbind(&mut self) -> Result<(), DriverError> {
        self.framebuffer_unbind(FramebufferTarget::Draw)
    }

    pub fn framebuffer_draw_is_bound(&self, framebuffer: &Framebuffer) -> Result<bool, HandleError> {
        self.target_is_bound(BindingTarget::DrawFramebuffer, framebuffer.handle)
    }

    pub fn framebuffer_draw_any_is_bound(&self) -> bool {
        self.bindings.any_bound(BindingTarget::DrawFramebuffer)
    }

    pub fn framebuffer_read_bind(&mut self, framebuffer: &Framebuffer) -> Result<(), BindError> {
        self.framebuffer_bind(FramebufferTarget::Read, framebuffer)
    }

    pub fn framebuffer_read_unbind(&mut self) -> Result<(), DriverError> {
        self.framebuffer_unbind(FramebufferTarget::Read)
    }

    pub fn framebuffer_read_is_bound(&self, framebuffer: &Framebuffer) -> Result<bool, HandleError> {
        self.target_is_bound(BindingTarget::ReadFramebuffer, framebuffer.handle)
    }

    pub fn framebuffer_read_any_is_bound(&self) -> bool {
        self.bindings.any_bound(BindingTarget::ReadFramebuffer)
    }

    fn framebuffer_bind(
        &mut self,
        target: FramebufferTarget,
        framebuffer: &Framebuffer,
    ) -> Result<(), BindError> {
        let raw = framebuffer.handle.raw();
        self.bind_target(target.binding_target(), framebuffer.handle, |driver| {
            driver.bind_framebuffer(target, Some(raw))
        })
    }

    fn framebuffer_unbind(&mut self, target: FramebufferTarget) -> Result<(), DriverError> {
        self.unbind_target(target.binding_target(), |driver| {
            driver.bind_framebuffer(target, None)
        })
    }

    /// Copy between the bound read and draw framebuffers.
    pub fn framebuffer_blit(&mut self, blit: &BlitSpecification) -> Result<(), FramebufferError> {
        for target in [BindingTarget::ReadFramebuffer, BindingTarget::DrawFramebuffer] {
            if !self.bindings.any_bound(target) {
                return Err(FramebufferError::NotBound(target));
            }
        }
        if (blit.depth || blit.stencil) && blit.filter == TextureFilter::Linear {
            return Err(FramebufferError::LinearDepthStencilBlit);
        }
        self.driver.blit_framebuffer(blit)?;
        Ok(())
    }

    /// Delete `framebuffer` and the resources it owns.
    ///
    /// Fails with [`FramebufferError::AttachmentShared`] while another live
    /// framebuffer shares one of the owned resources; delete the sharers
    /// first. Deleting a sharer leaves the shared resources untouched.
    pub fn framebuffer_delete(&mut self, framebuffer: &Framebuffer) -> Result<(), FramebufferError> {
        self.registry.check_live(framebuffer.handle)?;
        let owned = framebuffer.owned_resources();
        for resource in &owned {
            let sharers = self.share_count(*resource);
            if sharers > 0 {
                return Err(FramebufferError::AttachmentShared {
                    resource: *resource,
                    sharers,
                });
            }
        }

        tracing::debug!("Deleting {}", framebuffer.handle);
        self.driver.delete_framebuffer(framebuffer.handle.raw())?;
        self.release(framebuffer.handle)?;

        for resource in framebuffer.shared_resources() {
            if let Some(count) = self.shares.get_mut(&resource) {
                *count -= 1;
                if *count == 0 {
                    self.shares.remove(&resource);
                }
            }
        }

        // Every owned image gets a delete attempt; the first failure is
        // reported once the rest are gone.
        let mut first_error = None;
        for resource in owned {
            // Owned resources deleted directly by the caller are skipped.
            if !self.registry.is_live(resource) {
                continue;
            }
            if let Err(e) = self.delete_image(resource) {
                tracing::warn!("Failed to delete attachment {resource}: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
