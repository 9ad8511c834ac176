//! An in-memory [`Driver`].
//!
//! `FakeDriver` keeps enough state to behave like a strict native API:
//! buffers hold real bytes, framebuffers evaluate completeness from their
//! attachments, and shaders are scanned for `in`/`attribute`/`uniform`
//! declarations so linked programs can answer reflection queries. A line
//! starting with `#error` fails compilation. Conflicting uniform
//! declarations fail linking.
//!
//! Every state-changing call is appended to a command log that tests can
//! inspect through [`FakeDriver::commands`].

use std::collections::{BTreeMap, BTreeSet};

use crate::buffer::{BufferTarget, UsageHint};
use crate::draw::{ClearSpecification, Primitive};
use crate::driver::{AttribPointer, Driver, DriverError, Limits, cube_face_index};
use crate::framebuffer::{
    AttachmentSlot, AttachmentSource, BlitSpecification, FramebufferStatus,
    FramebufferTarget,
};
use crate::index::IndexType;
use crate::program::{ActiveVariable, GlslType, ShaderStage, UniformValue};
use crate::texture::{
    RenderbufferFormat, TextureFormat, TextureParameters, TextureTarget,
};

const LIMITS: Limits = Limits {
    texture_units: 16,
    color_attachments: 8,
    draw_buffers: 8,
};

const MAX_VERTEX_ATTRIBS: u32 = 16;
const MAX_BUFFER_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq)]
pub enum FakeCommand {
    BufferAllocate {
        target: BufferTarget,
        size: u64,
        usage: UsageHint,
    },
    BufferWrite {
        target: BufferTarget,
        offset: u64,
        len: usize,
    },
    BindTexture {
        unit: u32,
        target: TextureTarget,
        name: Option<u32>,
    },
    Attach {
        framebuffer: u32,
        slot: AttachmentSlot,
        name: u32,
        layer: u32,
    },
    Blit(BlitSpecification),
    CompileShader {
        stage: ShaderStage,
        label: String,
    },
    LinkProgram {
        program: u32,
    },
    UseProgram(Option<u32>),
    Uniform {
        program: u32,
        location: i32,
        value: UniformValue,
    },
    VertexAttribPointer {
        location: u32,
        pointer: AttribPointer,
    },
    DisableVertexAttrib {
        location: u32,
    },
    DrawElements {
        primitive: Primitive,
        count: u64,
        index_type: IndexType,
    },
    Clear(ClearSpecification),
}

#[derive(Debug, Clone, Copy)]
enum ImageFormat {
    Texture(TextureFormat),
    Renderbuffer(RenderbufferFormat),
}

impl ImageFormat {
    fn is_color_renderable(self) -> bool {
        match self {
            ImageFormat::Texture(format) => format.is_color_renderable(),
            ImageFormat::Renderbuffer(format) => format.is_color_renderable(),
        }
    }

    fn is_depth_renderable(self) -> bool {
        match self {
            ImageFormat::Texture(format) => format.is_depth_renderable(),
            ImageFormat::Renderbuffer(format) => format.is_depth_renderable(),
        }
    }

    fn is_stencil_renderable(self) -> bool {
        match self {
            ImageFormat::Texture(format) => format.is_stencil_renderable(),
            ImageFormat::Renderbuffer(format) => format.is_stencil_renderable(),
        }
    }
}

#[derive(Debug, Default)]
struct FakeTexture {
    target: Option<TextureTarget>,
    format: Option<TextureFormat>,
    parameters: TextureParameters,
}

#[derive(Debug, Default)]
struct FakeFramebuffer {
    attachments: BTreeMap<AttachmentSlot, AttachmentSource>,
    draw_buffers: Vec<Option<u32>>,
}

#[derive(Debug)]
struct FakeShader {
    stage: ShaderStage,
    attributes: Vec<(String, GlslType)>,
    uniforms: Vec<(String, GlslType)>,
}

#[derive(Debug, Default)]
struct FakeProgram {
    shaders: Vec<u32>,
    linked: Option<Reflection>,
    uniform_values: BTreeMap<i32, UniformValue>,
}

#[derive(Debug, Clone)]
struct Reflection {
    attributes: Vec<ActiveVariable>,
    uniforms: Vec<ActiveVariable>,
}

#[derive(Debug)]
enum FakeObject {
    Buffer(Vec<u8>),
    Texture(FakeTexture),
    Renderbuffer(Option<RenderbufferFormat>),
    Framebuffer(FakeFramebuffer),
    Shader(FakeShader),
    Program(FakeProgram),
}

#[derive(Debug)]
pub struct FakeDriver {
    objects: BTreeMap<u32, FakeObject>,
    next_name: u32,
    array_buffer: Option<u32>,
    index_buffer: Option<u32>,
    texture_units: BTreeMap<u32, u32>,
    draw_framebuffer: Option<u32>,
    read_framebuffer: Option<u32>,
    program: Option<u32>,
    forced_status: Option<FramebufferStatus>,
    failing_deletes: BTreeSet<u32>,
    commands: Vec<FakeCommand>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_name: 1,
            array_buffer: None,
            index_buffer: None,
            texture_units: BTreeMap::new(),
            draw_framebuffer: None,
            read_framebuffer: None,
            program: None,
            forced_status: None,
            failing_deletes: BTreeSet::new(),
            commands: Vec::new(),
        }
    }

    /// Make every completeness query report `status` instead of evaluating
    /// the attachments. `None` restores evaluation.
    pub fn force_framebuffer_status(&mut self, status: Option<FramebufferStatus>) {
        self.forced_status = status;
    }

    /// Make the next delete of object `name` fail with
    /// [`DriverError::InvalidOperation`], leaving the object alive.
    pub fn fail_next_delete(&mut self, name: u32) {
        self.failing_deletes.insert(name);
    }

    pub fn commands(&self) -> &[FakeCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Objects of any kind that have been generated and not deleted.
    pub fn live_object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn buffer_len(&self, name: u32) -> Option<u64> {
        match self.objects.get(&name) {
            Some(FakeObject::Buffer(bytes)) => Some(bytes.len() as u64),
            _ => None,
        }
    }

    pub fn buffer_contents(&self, name: u32) -> Option<&[u8]> {
        match self.objects.get(&name) {
            Some(FakeObject::Buffer(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn draw_buffers_of(&self, framebuffer: u32) -> Option<&[Option<u32>]> {
        match self.objects.get(&framebuffer) {
            Some(FakeObject::Framebuffer(fb)) => Some(&fb.draw_buffers),
            _ => None,
        }
    }

    pub fn bound_program(&self) -> Option<u32> {
        self.program
    }

    /// Last value written to uniform `location` of `program`.
    pub fn uniform_value(&self, program: u32, location: i32) -> Option<UniformValue> {
        match self.objects.get(&program) {
            Some(FakeObject::Program(p)) => p.uniform_values.get(&location).copied(),
            _ => None,
        }
    }

    fn generate(&mut self, object: FakeObject) -> u32 {
        let name = self.next_name;
        self.next_name += 1;
        self.objects.insert(name, object);
        name
    }

    fn remove(
        &mut self,
        name: u32,
        is_kind: impl Fn(&FakeObject) -> bool,
    ) -> Result<FakeObject, DriverError> {
        if self.failing_deletes.remove(&name) {
            return Err(DriverError::InvalidOperation);
        }
        match self.objects.get(&name) {
            Some(object) if is_kind(object) => {}
            _ => return Err(DriverError::InvalidValue),
        }
        self.objects.remove(&name).ok_or(DriverError::InvalidValue)
    }

    fn buffer_slot(&mut self, target: BufferTarget) -> &mut Option<u32> {
        match target {
            BufferTarget::Array => &mut self.array_buffer,
            BufferTarget::Index => &mut self.index_buffer,
        }
    }

    fn bound_buffer(&mut self, target: BufferTarget) -> Result<&mut Vec<u8>, DriverError> {
        let name = (*self.buffer_slot(target)).ok_or(DriverError::InvalidOperation)?;
        match self.objects.get_mut(&name) {
            Some(FakeObject::Buffer(bytes)) => Ok(bytes),
            _ => Err(DriverError::InvalidOperation),
        }
    }

    fn texture_mut(&mut self, name: u32) -> Result<&mut FakeTexture, DriverError> {
        match self.objects.get_mut(&name) {
            Some(FakeObject::Texture(texture)) => Ok(texture),
            _ => Err(DriverError::InvalidOperation),
        }
    }

    fn framebuffer_mut(&mut self, name: u32) -> Result<&mut FakeFramebuffer, DriverError> {
        match self.objects.get_mut(&name) {
            Some(FakeObject::Framebuffer(fb)) => Ok(fb),
            _ => Err(DriverError::InvalidOperation),
        }
    }

    fn program_mut(&mut self, name: u32) -> Result<&mut FakeProgram, DriverError> {
        match self.objects.get_mut(&name) {
            Some(FakeObject::Program(program)) => Ok(program),
            _ => Err(DriverError::InvalidOperation),
        }
    }

    /// The format behind `source`, or `None` if it names nothing usable.
    fn attachment_format(&self, source: AttachmentSource) -> Option<ImageFormat> {
        match source {
            AttachmentSource::Renderbuffer(name) => match self.objects.get(&name) {
                Some(FakeObject::Renderbuffer(Some(format))) => {
                    Some(ImageFormat::Renderbuffer(*format))
                }
                _ => None,
            },
            AttachmentSource::Texture2D(name) => match self.objects.get(&name) {
                Some(FakeObject::Texture(FakeTexture {
                    target: Some(TextureTarget::Texture2D),
                    format: Some(format),
                    ..
                })) => Some(ImageFormat::Texture(*format)),
                _ => None,
            },
            AttachmentSource::TextureCubeFace(name, _) => match self.objects.get(&name) {
                Some(FakeObject::Texture(FakeTexture {
                    target: Some(TextureTarget::TextureCube),
                    format: Some(format),
                    ..
                })) => Some(ImageFormat::Texture(*format)),
                _ => None,
            },
        }
    }

    fn evaluate_status(&self, framebuffer: &FakeFramebuffer) -> FramebufferStatus {
        if framebuffer.attachments.is_empty() {
            return FramebufferStatus::MissingAttachment;
        }
        for (slot, source) in &framebuffer.attachments {
            let Some(format) = self.attachment_format(*source) else {
                return FramebufferStatus::IncompleteAttachment;
            };
            let renderable = match slot {
                AttachmentSlot::Color(_) => format.is_color_renderable(),
                AttachmentSlot::Depth => format.is_depth_renderable(),
                AttachmentSlot::Stencil => format.is_stencil_renderable(),
                AttachmentSlot::DepthStencil => {
                    format.is_depth_renderable() && format.is_stencil_renderable()
                }
            };
            if !renderable {
                return FramebufferStatus::IncompleteAttachment;
            }
        }
        FramebufferStatus::Complete
    }
}

impl Driver for FakeDriver {
    fn limits(&self) -> Result<Limits, DriverError> {
        Ok(LIMITS)
    }

    fn gen_buffer(&mut self) -> Result<u32, DriverError> {
        Ok(self.generate(FakeObject::Buffer(Vec::new())))
    }

    fn delete_buffer(&mut self, name: u32) -> Result<(), DriverError> {
        self.remove(name, |object| matches!(object, FakeObject::Buffer(_)))?;
        for slot in [&mut self.array_buffer, &mut self.index_buffer] {
            if *slot == Some(name) {
                *slot = None;
            }
        }
        Ok(())
    }

    fn bind_buffer(
        &mut self,
        target: BufferTarget,
        name: Option<u32>,
    ) -> Result<(), DriverError> {
        if let Some(name) = name
            && !matches!(self.objects.get(&name), Some(FakeObject::Buffer(_)))
        {
            return Err(DriverError::InvalidOperation);
        }
        *self.buffer_slot(target) = name;
        Ok(())
    }

    fn buffer_allocate(
        &mut self,
        target: BufferTarget,
        size: u64,
        usage: UsageHint,
    ) -> Result<(), DriverError> {
        if size > MAX_BUFFER_BYTES {
            return Err(DriverError::OutOfMemory);
        }
        let size_bytes = usize::try_from(size).map_err(|_| DriverError::OutOfMemory)?;
        let bytes = self.bound_buffer(target)?;
        *bytes = vec![0; size_bytes];
        self.commands.push(FakeCommand::BufferAllocate {
            target,
            size,
            usage,
        });
        Ok(())
    }

    fn buffer_write(
        &mut self,
        target: BufferTarget,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let bytes = self.bound_buffer(target)?;
        let start = usize::try_from(offset).map_err(|_| DriverError::InvalidValue)?;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= bytes.len())
            .ok_or(DriverError::InvalidValue)?;
        bytes[start..end].copy_from_slice(data);
        self.commands.push(FakeCommand::BufferWrite {
            target,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn buffer_read(
        &mut self,
        target: BufferTarget,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), DriverError> {
        let bytes = self.bound_buffer(target)?;
        let start = usize::try_from(offset).map_err(|_| DriverError::InvalidValue)?;
        let end = start
            .checked_add(out.len())
            .filter(|end| *end <= bytes.len())
            .ok_or(DriverError::InvalidValue)?;
        out.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn gen_texture(&mut self) -> Result<u32, DriverError> {
        Ok(self.generate(FakeObject::Texture(FakeTexture::default())))
    }

    fn delete_texture(&mut self, name: u32) -> Result<(), DriverError> {
        self.remove(name, |object| matches!(object, FakeObject::Texture(_)))?;
        self.texture_units.retain(|_, bound| *bound != name);
        Ok(())
    }

    fn bind_texture(
        &mut self,
        unit: u32,
        target: TextureTarget,
        name: Option<u32>,
    ) -> Result<(), DriverError> {
        if unit >= LIMITS.texture_units {
            return Err(DriverError::InvalidEnum);
        }
        match name {
            Some(name) => {
                let texture = self.texture_mut(name)?;
                if texture.target.is_some_and(|existing| existing != target) {
                    return Err(DriverError::InvalidOperation);
                }
                texture.target = Some(target);
                self.texture_units.insert(unit, name);
            }
            None => {
                self.texture_units.remove(&unit);
            }
        }
        self.commands
            .push(FakeCommand::BindTexture { unit, target, name });
        Ok(())
    }

    fn texture_2d_storage(
        &mut self,
        name: u32,
        width: u32,
        height: u32,
        format: TextureFormat,
        parameters: &TextureParameters,
    ) -> Result<(), DriverError> {
        if width == 0 || height == 0 {
            return Err(DriverError::InvalidValue);
        }
        let texture = self.texture_mut(name)?;
        if texture.format.is_some() {
            return Err(DriverError::InvalidOperation);
        }
        texture.target = Some(TextureTarget::Texture2D);
        texture.format = Some(format);
        texture.parameters = *parameters;
        Ok(())
    }

    fn texture_cube_storage(
        &mut self,
        name: u32,
        size: u32,
        format: TextureFormat,
        parameters: &TextureParameters,
    ) -> Result<(), DriverError> {
        if size == 0 {
            return Err(DriverError::InvalidValue);
        }
        let texture = self.texture_mut(name)?;
        if texture.format.is_some() {
            return Err(DriverError::InvalidOperation);
        }
        texture.target = Some(TextureTarget::TextureCube);
        texture.format = Some(format);
        texture.parameters = *parameters;
        Ok(())
    }

    fn gen_renderbuffer(&mut self) -> Result<u32, DriverError> {
        Ok(self.generate(FakeObject::Renderbuffer(None)))
    }

    fn delete_renderbuffer(&mut self, name: u32) -> Result<(), DriverError> {
        self.remove(name, |object| matches!(object, FakeObject::Renderbuffer(_)))?;
        Ok(())
    }

    fn renderbuffer_storage(
        &mut self,
        name: u32,
        format: RenderbufferFormat,
        width: u32,
        height: u32,
    ) -> Result<(), DriverError> {
        if width == 0 || height == 0 {
            return Err(DriverError::InvalidValue);
        }
        match self.objects.get_mut(&name) {
            Some(FakeObject::Renderbuffer(storage)) => {
                *storage = Some(format);
                Ok(())
            }
            _ => Err(DriverError::InvalidOperation),
        }
    }

    fn gen_framebuffer(&mut self) -> Result<u32, DriverError> {
        Ok(self.generate(FakeObject::Framebuffer(FakeFramebuffer::default())))
    }

    fn delete_framebuffer(&mut self, name: u32) -> Result<(), DriverError> {
        self.remove(name, |object| matches!(object, FakeObject::Framebuffer(_)))?;
        for slot in [&mut self.draw_framebuffer, &mut self.read_framebuffer] {
            if *slot == Some(name) {
                *slot = None;
            }
        }
        Ok(())
    }

    fn bind_framebuffer(
        &mut self,
        target: FramebufferTarget,
        name: Option<u32>,
    ) -> Result<(), DriverError> {
        if let Some(name) = name {
            self.framebuffer_mut(name)?;
        }
        match target {
            FramebufferTarget::Draw => self.draw_framebuffer = name,
            FramebufferTarget::Read => self.read_framebuffer = name,
        }
        Ok(())
    }

    fn framebuffer_attach(
        &mut self,
        framebuffer: u32,
        slot: AttachmentSlot,
        source: AttachmentSource,
    ) -> Result<(), DriverError> {
        if let AttachmentSlot::Color(index) = slot
            && index >= LIMITS.color_attachments
        {
            return Err(DriverError::InvalidValue);
        }
        let (name, layer) = match source {
            AttachmentSource::Renderbuffer(name) | AttachmentSource::Texture2D(name) => {
                (name, 0)
            }
            AttachmentSource::TextureCubeFace(name, face) => (name, cube_face_index(face)),
        };
        if !self.objects.contains_key(&name) {
            return Err(DriverError::InvalidOperation);
        }
        self.framebuffer_mut(framebuffer)?
            .attachments
            .insert(slot, source);
        self.commands.push(FakeCommand::Attach {
            framebuffer,
            slot,
            name,
            layer,
        });
        Ok(())
    }

    fn framebuffer_status(
        &mut self,
        framebuffer: u32,
    ) -> Result<FramebufferStatus, DriverError> {
        let fb = match self.objects.get(&framebuffer) {
            Some(FakeObject::Framebuffer(fb)) => fb,
            _ => return Err(DriverError::InvalidOperation),
        };
        if let Some(status) = self.forced_status {
            return Ok(status);
        }
        Ok(self.evaluate_status(fb))
    }

    fn framebuffer_draw_buffers(
        &mut self,
        framebuffer: u32,
        buffers: &[Option<u32>],
    ) -> Result<(), DriverError> {
        if buffers.len() > LIMITS.draw_buffers as usize {
            return Err(DriverError::InvalidValue);
        }
        if buffers
            .iter()
            .flatten()
            .any(|point| *point >= LIMITS.color_attachments)
        {
            return Err(DriverError::InvalidEnum);
        }
        self.framebuffer_mut(framebuffer)?.draw_buffers = buffers.to_vec();
        Ok(())
    }

    fn blit_framebuffer(&mut self, blit: &BlitSpecification) -> Result<(), DriverError> {
        if self.draw_framebuffer.is_none() || self.read_framebuffer.is_none() {
            return Err(DriverError::InvalidFramebufferOperation);
        }
        self.commands.push(FakeCommand::Blit(*blit));
        Ok(())
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        label: &str,
        source: &str,
    ) -> Result<u32, DriverError> {
        self.commands.push(FakeCommand::CompileShader {
            stage,
            label: label.to_owned(),
        });
        let shader = scan_shader(stage, label, source)?;
        Ok(self.generate(FakeObject::Shader(shader)))
    }

    fn delete_shader(&mut self, name: u32) -> Result<(), DriverError> {
        self.remove(name, |object| matches!(object, FakeObject::Shader(_)))?;
        Ok(())
    }

    fn create_program(&mut self, _label: &str) -> Result<u32, DriverError> {
        Ok(self.generate(FakeObject::Program(FakeProgram::default())))
    }

    fn attach_shader(&mut self, program: u32, shader: u32) -> Result<(), DriverError> {
        if !matches!(self.objects.get(&shader), Some(FakeObject::Shader(_))) {
            return Err(DriverError::InvalidOperation);
        }
        let program = self.program_mut(program)?;
        if program.shaders.contains(&shader) {
            return Err(DriverError::InvalidOperation);
        }
        program.shaders.push(shader);
        Ok(())
    }

    fn link_program(&mut self, program: u32) -> Result<(), DriverError> {
        self.commands.push(FakeCommand::LinkProgram { program });
        let shaders = match self.objects.get(&program) {
            Some(FakeObject::Program(p)) => p.shaders.clone(),
            _ => return Err(DriverError::InvalidOperation),
        };
        let reflection = {
            let mut stages = Vec::with_capacity(shaders.len());
            for name in &shaders {
                match self.objects.get(name) {
                    Some(FakeObject::Shader(shader)) => stages.push(shader),
                    _ => return Err(DriverError::InvalidOperation),
                }
            }
            link(&stages)
        };
        let program = self.program_mut(program)?;
        program.uniform_values.clear();
        match reflection {
            Ok(reflection) => {
                program.linked = Some(reflection);
                Ok(())
            }
            Err(e) => {
                program.linked = None;
                Err(e)
            }
        }
    }

    fn active_attributes(&mut self, program: u32) -> Result<Vec<ActiveVariable>, DriverError> {
        let linked = self.program_mut(program)?.linked.as_ref();
        let reflection = linked.ok_or(DriverError::InvalidOperation)?;
        Ok(reflection.attributes.clone())
    }

    fn active_uniforms(&mut self, program: u32) -> Result<Vec<ActiveVariable>, DriverError> {
        let linked = self.program_mut(program)?.linked.as_ref();
        let reflection = linked.ok_or(DriverError::InvalidOperation)?;
        Ok(reflection.uniforms.clone())
    }

    fn delete_program(&mut self, program: u32) -> Result<(), DriverError> {
        self.remove(program, |object| matches!(object, FakeObject::Program(_)))?;
        if self.program == Some(program) {
            self.program = None;
        }
        Ok(())
    }

    fn use_program(&mut self, program: Option<u32>) -> Result<(), DriverError> {
        if let Some(name) = program
            && self.program_mut(name)?.linked.is_none()
        {
            return Err(DriverError::InvalidOperation);
        }
        self.program = program;
        self.commands.push(FakeCommand::UseProgram(program));
        Ok(())
    }

    fn program_uniform(
        &mut self,
        location: i32,
        value: &UniformValue,
    ) -> Result<(), DriverError> {
        let name = self.program.ok_or(DriverError::InvalidOperation)?;
        let program = self.program_mut(name)?;
        let reflection = program.linked.as_ref().ok_or(DriverError::InvalidOperation)?;
        let declared = reflection
            .uniforms
            .iter()
            .find(|uniform| uniform.location == location)
            .ok_or(DriverError::InvalidOperation)?;
        if !value.fits(declared.ty) {
            return Err(DriverError::InvalidOperation);
        }
        program.uniform_values.insert(location, *value);
        self.commands.push(FakeCommand::Uniform {
            program: name,
            location,
            value: *value,
        });
        Ok(())
    }

    fn vertex_attrib_pointer(
        &mut self,
        location: u32,
        pointer: &AttribPointer,
    ) -> Result<(), DriverError> {
        if location >= MAX_VERTEX_ATTRIBS {
            return Err(DriverError::InvalidValue);
        }
        if self.array_buffer.is_none() {
            return Err(DriverError::InvalidOperation);
        }
        self.commands.push(FakeCommand::VertexAttribPointer {
            location,
            pointer: *pointer,
        });
        Ok(())
    }

    fn disable_vertex_attrib(&mut self, location: u32) -> Result<(), DriverError> {
        if location >= MAX_VERTEX_ATTRIBS {
            return Err(DriverError::InvalidValue);
        }
        self.commands
            .push(FakeCommand::DisableVertexAttrib { location });
        Ok(())
    }

    fn draw_elements(
        &mut self,
        primitive: Primitive,
        count: u64,
        index_type: IndexType,
    ) -> Result<(), DriverError> {
        if self.program.is_none() {
            return Err(DriverError::InvalidOperation);
        }
        let available = self.bound_buffer(BufferTarget::Index)?.len() as u64;
        if count.saturating_mul(index_type.size_bytes()) > available {
            return Err(DriverError::InvalidOperation);
        }
        self.commands.push(FakeCommand::DrawElements {
            primitive,
            count,
            index_type,
        });
        Ok(())
    }

    fn clear(&mut self, clear: &ClearSpecification) -> Result<(), DriverError> {
        self.commands.push(FakeCommand::Clear(*clear));
        Ok(())
    }
}

/// Scan `source` for the declarations a real compiler would reflect.
fn scan_shader(stage: ShaderStage, label: &str, source: &str) -> Result<FakeShader, DriverError> {
    let mut shader = FakeShader {
        stage,
        attributes: Vec::new(),
        uniforms: Vec::new(),
    };
    for (number, line) in source.lines().enumerate() {
        let line = line.split("//").next().unwrap_or_default().trim();
        if let Some(message) = line.strip_prefix("#error") {
            return Err(DriverError::ShaderCompile {
                log: format!("{label}:{}: error: {}", number + 1, message.trim()),
            });
        }
        let line = strip_layout(line);
        let mut tokens = line.split_whitespace();
        let qualifier = match tokens.next() {
            Some(q @ ("in" | "attribute")) if stage == ShaderStage::Vertex => q,
            Some(q @ "uniform") => q,
            _ => continue,
        };
        let mut tokens = tokens.skip_while(|token| {
            matches!(*token, "lowp" | "mediump" | "highp" | "flat" | "smooth")
        });
        let (Some(type_name), Some(name)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        let Some(ty) = GlslType::from_glsl_name(type_name) else {
            return Err(DriverError::ShaderCompile {
                log: format!("{label}:{}: error: unknown type '{type_name}'", number + 1),
            });
        };
        let name = name.trim_end_matches(';').to_owned();
        if qualifier == "uniform" {
            shader.uniforms.push((name, ty));
        } else {
            shader.attributes.push((name, ty));
        }
    }
    Ok(shader)
}

fn strip_layout(line: &str) -> &str {
    match line.strip_prefix("layout") {
        Some(rest) => match rest.find(')') {
            Some(end) => rest[end + 1..].trim_start(),
            None => line,
        },
        None => line,
    }
}

fn link(shaders: &[&FakeShader]) -> Result<Reflection, DriverError> {
    if shaders.is_empty() {
        return Err(DriverError::ProgramLink {
            log: "no shaders attached".to_owned(),
        });
    }
    let mut attributes: Vec<ActiveVariable> = Vec::new();
    let mut uniforms: Vec<ActiveVariable> = Vec::new();
    for shader in shaders {
        if shader.stage == ShaderStage::Vertex {
            for (name, ty) in &shader.attributes {
                if attributes.iter().any(|a| &a.name == name) {
                    continue;
                }
                attributes.push(ActiveVariable {
                    name: name.clone(),
                    location: attributes.len() as i32,
                    ty: *ty,
                });
            }
        }
        for (name, ty) in &shader.uniforms {
            match uniforms.iter().find(|u| &u.name == name) {
                Some(existing) if existing.ty != *ty => {
                    return Err(DriverError::ProgramLink {
                        log: format!(
                            "uniform '{name}' declared as both {:?} and {ty:?}",
                            existing.ty
                        ),
                    });
                }
                Some(_) => {}
                None => uniforms.push(ActiveVariable {
                    name: name.clone(),
                    location: uniforms.len() as i32,
                    ty: *ty,
                }),
            }
        }
    }
    Ok(Reflection {
        attributes,
        uniforms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_reads_declarations_per_stage() {
        let source = "\
#version 330 core
layout(location = 0) in vec3 position; // model space
uniform highp mat4 transform;
out vec4 tint;
";
        let vertex = scan_shader(ShaderStage::Vertex, "a.vert", source).unwrap();
        assert_eq!(vertex.attributes, vec![("position".to_owned(), GlslType::Vec3)]);
        assert_eq!(vertex.uniforms, vec![("transform".to_owned(), GlslType::Mat4)]);

        let fragment = scan_shader(ShaderStage::Fragment, "a.frag", "in vec4 tint;\n").unwrap();
        assert!(fragment.attributes.is_empty());
    }

    #[test]
    fn error_directive_fails_with_a_located_log() {
        let err = scan_shader(ShaderStage::Fragment, "bad.frag", "void main() {}\n#error nope\n")
            .unwrap_err();
        assert_eq!(
            err,
            DriverError::ShaderCompile {
                log: "bad.frag:2: error: nope".to_owned()
            }
        );
    }

    #[test]
    fn unattached_framebuffers_are_missing_attachments() {
        let mut driver = FakeDriver::new();
        let fb = driver.gen_framebuffer().unwrap();
        assert_eq!(
            driver.framebuffer_status(fb).unwrap(),
            FramebufferStatus::MissingAttachment
        );

        let rb = driver.gen_renderbuffer().unwrap();
        driver
            .renderbuffer_storage(rb, RenderbufferFormat::Depth24, 4, 4)
            .unwrap();
        driver
            .framebuffer_attach(fb, AttachmentSlot::Color(0), AttachmentSource::Renderbuffer(rb))
            .unwrap();
        assert_eq!(
            driver.framebuffer_status(fb).unwrap(),
            FramebufferStatus::IncompleteAttachment
        );

        driver
            .framebuffer_attach(fb, AttachmentSlot::Color(0), AttachmentSource::Renderbuffer(rb))
            .unwrap();
        driver.delete_renderbuffer(rb).unwrap();
        assert_eq!(
            driver.framebuffer_status(fb).unwrap(),
            FramebufferStatus::IncompleteAttachment
        );
        driver.delete_framebuffer(fb).unwrap();
        assert_eq!(driver.live_object_count(), 0);
    }

    #[test]
    fn buffer_writes_are_bounds_checked() {
        let mut driver = FakeDriver::new();
        let name = driver.gen_buffer().unwrap();
        driver.bind_buffer(BufferTarget::Array, Some(name)).unwrap();
        driver
            .buffer_allocate(BufferTarget::Array, 4, UsageHint::DynamicDraw)
            .unwrap();

        driver.buffer_write(BufferTarget::Array, 2, &[7, 9]).unwrap();
        assert_eq!(driver.buffer_contents(name), Some(&[0, 0, 7, 9][..]));
        assert_eq!(
            driver.buffer_write(BufferTarget::Array, 3, &[1, 2]),
            Err(DriverError::InvalidValue)
        );
    }
}
