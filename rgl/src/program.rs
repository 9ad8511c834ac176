//! Shader programs and the recompilation decision.
//!
//! A [`Program`] names its vertex and fragment sources by virtual path and
//! decides for itself when it needs compiling:
//!
//! - it has never compiled successfully;
//! - its set of sources changed since the last successful compile;
//! - a source's modification time differs from the one it was compiled at,
//!   or is newer than the last successful compile.
//!
//! Compiled shaders are cached per source, so a recompile only resubmits
//! sources that changed. The previous program object is replaced only once
//! the new one links; a failed recompile leaves the last good program
//! usable.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::SystemTime;

use thiserror::Error;

use crate::array::{AttributeError, ScalarType};
use crate::binding::{BindError, BindingTarget};
use crate::buffer::{ArrayBuffer, BufferError, BufferTarget};
use crate::context::Context;
use crate::driver::{AttribPointer, Driver, DriverError};
use crate::handle::{ContextId, Handle, HandleError, ResourceHandle, ResourceKind};
use crate::source::{SourceError, SourceProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// GLSL types a program can expose through reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlslType {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Int,
    IVec2,
    IVec3,
    IVec4,
    UInt,
    UVec2,
    UVec3,
    UVec4,
    Mat2,
    Mat3,
    Mat4,
    Sampler2D,
    SamplerCube,
}

impl GlslType {
    pub fn from_glsl_name(name: &str) -> Option<Self> {
        let ty = match name {
            "float" => GlslType::Float,
            "vec2" => GlslType::Vec2,
            "vec3" => GlslType::Vec3,
            "vec4" => GlslType::Vec4,
            "int" => GlslType::Int,
            "ivec2" => GlslType::IVec2,
            "ivec3" => GlslType::IVec3,
            "ivec4" => GlslType::IVec4,
            "uint" => GlslType::UInt,
            "uvec2" => GlslType::UVec2,
            "uvec3" => GlslType::UVec3,
            "uvec4" => GlslType::UVec4,
            "mat2" => GlslType::Mat2,
            "mat3" => GlslType::Mat3,
            "mat4" => GlslType::Mat4,
            "sampler2D" => GlslType::Sampler2D,
            "samplerCube" => GlslType::SamplerCube,
            _ => return None,
        };
        Some(ty)
    }

    /// Scalar type and component count an array attribute must have to feed
    /// a vertex input of this type. `None` for types that cannot be fed
    /// from a single attribute.
    pub fn attribute_layout(self) -> Option<(ScalarType, u32)> {
        let layout = match self {
            GlslType::Float => (ScalarType::F32, 1),
            GlslType::Vec2 => (ScalarType::F32, 2),
            GlslType::Vec3 => (ScalarType::F32, 3),
            GlslType::Vec4 => (ScalarType::F32, 4),
            GlslType::Int => (ScalarType::I32, 1),
            GlslType::IVec2 => (ScalarType::I32, 2),
            GlslType::IVec3 => (ScalarType::I32, 3),
            GlslType::IVec4 => (ScalarType::I32, 4),
            GlslType::UInt => (ScalarType::U32, 1),
            GlslType::UVec2 => (ScalarType::U32, 2),
            GlslType::UVec3 => (ScalarType::U32, 3),
            GlslType::UVec4 => (ScalarType::U32, 4),
            GlslType::Mat2
            | GlslType::Mat3
            | GlslType::Mat4
            | GlslType::Sampler2D
            | GlslType::SamplerCube => return None,
        };
        Some(layout)
    }
}

/// One entry of a linked program's reflection data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveVariable {
    pub name: String,
    pub location: i32,
    pub ty: GlslType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramAttribute {
    program: Handle,
    name: String,
    location: u32,
    ty: GlslType,
}

impl ProgramAttribute {
    pub fn program(&self) -> Handle {
        self.program
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> u32 {
        self.location
    }

    pub fn ty(&self) -> GlslType {
        self.ty
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramUniform {
    program: Handle,
    name: String,
    location: i32,
    ty: GlslType,
}

impl ProgramUniform {
    pub fn program(&self) -> Handle {
        self.program
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> i32 {
        self.location
    }

    pub fn ty(&self) -> GlslType {
        self.ty
    }
}

/// A value for [`Context::program_uniform_put`]. Matrices are column-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Int(i32),
    IVec2([i32; 2]),
    IVec3([i32; 3]),
    IVec4([i32; 4]),
    UInt(u32),
    UVec2([u32; 2]),
    UVec3([u32; 3]),
    UVec4([u32; 4]),
    Mat2([f32; 4]),
    Mat3([f32; 9]),
    Mat4([f32; 16]),
    /// Texture unit a sampler reads from.
    TextureUnit(u32),
}

impl UniformValue {
    /// Whether a uniform declared as `ty` accepts this value.
    pub fn fits(self, ty: GlslType) -> bool {
        matches!(
            (self, ty),
            (UniformValue::Float(_), GlslType::Float)
                | (UniformValue::Vec2(_), GlslType::Vec2)
                | (UniformValue::Vec3(_), GlslType::Vec3)
                | (UniformValue::Vec4(_), GlslType::Vec4)
                | (UniformValue::Int(_), GlslType::Int)
                | (UniformValue::IVec2(_), GlslType::IVec2)
                | (UniformValue::IVec3(_), GlslType::IVec3)
                | (UniformValue::IVec4(_), GlslType::IVec4)
                | (UniformValue::UInt(_), GlslType::UInt)
                | (UniformValue::UVec2(_), GlslType::UVec2)
                | (UniformValue::UVec3(_), GlslType::UVec3)
                | (UniformValue::UVec4(_), GlslType::UVec4)
                | (UniformValue::Mat2(_), GlslType::Mat2)
                | (UniformValue::Mat3(_), GlslType::Mat3)
                | (UniformValue::Mat4(_), GlslType::Mat4)
                | (
                    UniformValue::TextureUnit(_),
                    GlslType::Sampler2D | GlslType::SamplerCube
                )
        )
    }

    pub fn type_name(self) -> &'static str {
        match self {
            UniformValue::Float(_) => "float",
            UniformValue::Vec2(_) => "vec2",
            UniformValue::Vec3(_) => "vec3",
            UniformValue::Vec4(_) => "vec4",
            UniformValue::Int(_) => "int",
            UniformValue::IVec2(_) => "ivec2",
            UniformValue::IVec3(_) => "ivec3",
            UniformValue::IVec4(_) => "ivec4",
            UniformValue::UInt(_) => "uint",
            UniformValue::UVec2(_) => "uvec2",
            UniformValue::UVec3(_) => "uvec3",
            UniformValue::UVec4(_) => "uvec4",
            UniformValue::Mat2(_) => "mat2",
            UniformValue::Mat3(_) => "mat3",
            UniformValue::Mat4(_) => "mat4",
            UniformValue::TextureUnit(_) => "texture unit",
        }
    }
}

// ---- Error types ----

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{program}: empty program")]
    EmptyProgram { program: String },

    #[error("{program}: file not found '{path}'")]
    FileNotFound { program: String, path: String },

    #[error("{program}: error reading '{path}': {source}")]
    Source {
        program: String,
        path: String,
        #[source]
        source: SourceError,
    },

    #[error("{program}: {path}: {log}")]
    Shader {
        program: String,
        path: String,
        log: String,
    },

    #[error("{program}: link failed: {log}")]
    Link { program: String, log: String },

    #[error("{program}: program has been deleted")]
    Deleted { program: String },

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("Failed to rebind recompiled program: {0}")]
    Bind(#[from] BindError),

    #[error("Driver error compiling program: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("Program {0} has not been compiled")]
    NotCompiled(String),

    #[error("Program {0} has been deleted")]
    Deleted(String),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Error)]
pub enum AttributeBindError {
    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Attribute(#[from] AttributeError),

    #[error("Program attribute '{name}' has type {ty:?}, which no array attribute can feed")]
    UnsupportedType { name: String, ty: GlslType },

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Error)]
pub enum UniformError {
    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("Uniform '{name}' belongs to {program}, which is not the active program")]
    ProgramNotActive { name: String, program: Handle },

    #[error("Uniform '{name}' has type {expected:?} but was given a {actual}")]
    TypeMismatch {
        name: String,
        expected: GlslType,
        actual: &'static str,
    },

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

// ---- Programs ----

#[derive(Debug, Default)]
struct ShaderEntry {
    shader: Option<Handle>,
    /// Modification time of the source `shader` was compiled from.
    last_modified: Option<SystemTime>,
}

#[derive(Debug)]
pub struct Program {
    name: String,
    /// Context of the first compile. Every later call must use the same one.
    context: Option<ContextId>,
    vertex: BTreeMap<String, ShaderEntry>,
    fragment: BTreeMap<String, ShaderEntry>,
    handle: Option<Handle>,
    last_compile: Option<SystemTime>,
    compiled_sources: Option<(BTreeSet<String>, BTreeSet<String>)>,
    /// Cached shaders of removed sources, deleted on the next compile.
    retired: Vec<Handle>,
    attributes: BTreeMap<String, ProgramAttribute>,
    uniforms: BTreeMap<String, ProgramUniform>,
    deleted: bool,
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: None,
            vertex: BTreeMap::new(),
            fragment: BTreeMap::new(),
            handle: None,
            last_compile: None,
            compiled_sources: None,
            retired: Vec::new(),
            attributes: BTreeMap::new(),
            uniforms: BTreeMap::new(),
            deleted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The driver program of the last successful compile.
    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    pub fn last_compile_time(&self) -> Option<SystemTime> {
        self.last_compile
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns `false` if `path` was already a vertex source.
    pub fn add_vertex_shader(&mut self, path: impl Into<String>) -> bool {
        Self::add_source(&mut self.vertex, path.into())
    }

    /// Returns `false` if `path` was already a fragment source.
    pub fn add_fragment_shader(&mut self, path: impl Into<String>) -> bool {
        Self::add_source(&mut self.fragment, path.into())
    }

    pub fn remove_vertex_shader(&mut self, path: &str) -> bool {
        Self::remove_source(&mut self.vertex, &mut self.retired, path)
    }

    pub fn remove_fragment_shader(&mut self, path: &str) -> bool {
        Self::remove_source(&mut self.fragment, &mut self.retired, path)
    }

    pub fn vertex_shaders(&self) -> impl Iterator<Item = &str> {
        self.vertex.keys().map(String::as_str)
    }

    pub fn fragment_shaders(&self) -> impl Iterator<Item = &str> {
        self.fragment.keys().map(String::as_str)
    }

    fn add_source(sources: &mut BTreeMap<String, ShaderEntry>, path: String) -> bool {
        if sources.contains_key(&path) {
            return false;
        }
        sources.insert(path, ShaderEntry::default());
        true
    }

    fn remove_source(
        sources: &mut BTreeMap<String, ShaderEntry>,
        retired: &mut Vec<Handle>,
        path: &str,
    ) -> bool {
        match sources.remove(path) {
            Some(entry) => {
                retired.extend(entry.shader);
                true
            }
            None => false,
        }
    }

    fn current_sources(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        (
            self.vertex.keys().cloned().collect(),
            self.fragment.keys().cloned().collect(),
        )
    }

    fn entries(&self) -> impl Iterator<Item = (ShaderStage, &String, &ShaderEntry)> {
        let vertex = self
            .vertex
            .iter()
            .map(|(path, entry)| (ShaderStage::Vertex, path, entry));
        let fragment = self
            .fragment
            .iter()
            .map(|(path, entry)| (ShaderStage::Fragment, path, entry));
        vertex.chain(fragment)
    }

    /// Whether [`compile`](Self::compile) would resubmit anything. A source
    /// whose modification time cannot be read counts as modified.
    pub fn requires_compilation(&self, sources: &impl SourceProvider) -> bool {
        if self.handle.is_none() {
            return true;
        }
        if self.compiled_sources.as_ref() != Some(&self.current_sources()) {
            return true;
        }
        self.entries().any(|(_, path, entry)| {
            match sources.modification_time(path) {
                Ok(time) => {
                    entry.last_modified != Some(time)
                        || self.last_compile.is_none_or(|compiled| time > compiled)
                }
                Err(_) => true,
            }
        })
    }

    /// Compile and link the program if anything changed since the last
    /// successful compile.
    pub fn compile<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        sources: &impl SourceProvider,
    ) -> Result<(), CompileError> {
        if self.deleted {
            return Err(CompileError::Deleted {
                program: self.name.clone(),
            });
        }
        if self.vertex.is_empty() && self.fragment.is_empty() {
            return Err(CompileError::EmptyProgram {
                program: self.name.clone(),
            });
        }
        self.check_context(ctx)?;
        self.context = Some(ctx.id());
        if !self.requires_compilation(sources) {
            tracing::debug!("{} program component(s) not modified - not recompiling", self.name);
            return Ok(());
        }
        tracing::debug!("{} program component(s) modified - recompiling", self.name);

        let mut times = BTreeMap::new();
        for (_, path, _) in self.entries() {
            let time = sources
                .modification_time(path)
                .map_err(|e| self.source_error(path, e))?;
            times.insert(path.clone(), time);
        }

        let raw = ctx.driver.create_program(&self.name)?;
        let program = ctx.register(ResourceKind::Program, raw)?;
        if let Err(e) = self.build(ctx, sources, program, &times) {
            discard_program(ctx, program);
            return Err(e);
        }

        let was_active = self
            .handle
            .is_some_and(|old| ctx.bindings.is_bound(BindingTarget::Program, old));
        if let Some(old) = self.handle.replace(program) {
            discard_program(ctx, old);
        }
        if was_active {
            ctx.bind_target(BindingTarget::Program, program, |driver| {
                driver.use_program(Some(raw))
            })?;
        }

        for shader in std::mem::take(&mut self.retired) {
            discard_shader(ctx, shader);
        }

        let newest = times.values().max().copied();
        let now = SystemTime::now();
        self.last_compile = Some(newest.map_or(now, |newest| newest.max(now)));
        self.compiled_sources = Some(self.current_sources());
        Ok(())
    }

    /// Compile changed shaders, attach everything to `program`, link, and
    /// refresh reflection.
    fn build<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        sources: &impl SourceProvider,
        program: Handle,
        times: &BTreeMap<String, SystemTime>,
    ) -> Result<(), CompileError> {
        let name = self.name.clone();
        for (stage, entries) in [
            (ShaderStage::Vertex, &mut self.vertex),
            (ShaderStage::Fragment, &mut self.fragment),
        ] {
            for (path, entry) in entries.iter_mut() {
                let time = times.get(path).copied();
                let cached = match entry.shader {
                    Some(shader) if entry.last_modified == time => {
                        ctx.registry.check_live(shader)?;
                        Some(shader)
                    }
                    _ => None,
                };
                let shader = match cached {
                    Some(shader) => shader,
                    None => {
                        let shader = compile_shader(ctx, sources, &name, stage, path)?;
                        if let Some(old) = entry.shader.replace(shader) {
                            discard_shader(ctx, old);
                        }
                        entry.last_modified = time;
                        shader
                    }
                };
                ctx.driver.attach_shader(program.raw(), shader.raw())?;
            }
        }

        ctx.driver
            .link_program(program.raw())
            .map_err(|e| match e {
                DriverError::ProgramLink { log } => CompileError::Link {
                    program: name.clone(),
                    log,
                },
                other => CompileError::Driver(other),
            })?;

        let attributes = ctx.driver.active_attributes(program.raw())?;
        let uniforms = ctx.driver.active_uniforms(program.raw())?;

        self.attributes.clear();
        for variable in attributes {
            let Ok(location) = u32::try_from(variable.location) else {
                continue;
            };
            tracing::debug!("{name} attribute {} {:?} at {location}", variable.name, variable.ty);
            self.attributes.insert(
                variable.name.clone(),
                ProgramAttribute {
                    program,
                    name: variable.name,
                    location,
                    ty: variable.ty,
                },
            );
        }
        self.uniforms.clear();
        for variable in uniforms {
            tracing::debug!(
                "{name} uniform {} {:?} at {}",
                variable.name,
                variable.ty,
                variable.location
            );
            self.uniforms.insert(
                variable.name.clone(),
                ProgramUniform {
                    program,
                    name: variable.name,
                    location: variable.location,
                    ty: variable.ty,
                },
            );
        }
        Ok(())
    }

    fn source_error(&self, path: &str, e: SourceError) -> CompileError {
        match e {
            SourceError::NotFound(_) => CompileError::FileNotFound {
                program: self.name.clone(),
                path: path.to_owned(),
            },
            other => CompileError::Source {
                program: self.name.clone(),
                path: path.to_owned(),
                source: other,
            },
        }
    }

    /// Attribute `name` of the last successful compile.
    pub fn attribute(&self, name: &str) -> Option<&ProgramAttribute> {
        self.attributes.get(name)
    }

    pub fn uniform(&self, name: &str) -> Option<&ProgramUniform> {
        self.uniforms.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &ProgramAttribute> {
        self.attributes.values()
    }

    pub fn uniforms(&self) -> impl Iterator<Item = &ProgramUniform> {
        self.uniforms.values()
    }

    pub fn activate<D: Driver>(&self, ctx: &mut Context<D>) -> Result<(), ProgramError> {
        let handle = self.live_handle()?;
        ctx.bind_target(BindingTarget::Program, handle, |driver| {
            driver.use_program(Some(handle.raw()))
        })?;
        Ok(())
    }

    /// Deactivate whatever program is active.
    pub fn deactivate<D: Driver>(&self, ctx: &mut Context<D>) -> Result<(), DriverError> {
        ctx.unbind_target(BindingTarget::Program, |driver| driver.use_program(None))
    }

    pub fn is_active<D: Driver>(&self, ctx: &Context<D>) -> bool {
        self.handle
            .is_some_and(|handle| ctx.bindings.is_bound(BindingTarget::Program, handle))
    }

    /// Release the driver program and every cached shader. Deleting a
    /// program that never compiled only marks it deleted.
    pub fn delete<D: Driver>(&mut self, ctx: &mut Context<D>) -> Result<(), ProgramError> {
        if self.deleted {
            return Err(ProgramError::Deleted(self.name.clone()));
        }
        self.check_context(ctx)?;
        tracing::debug!("Deleting program {}", self.name);
        if let Some(handle) = self.handle {
            ctx.registry.check_live(handle)?;
            ctx.driver.delete_program(handle.raw())?;
            ctx.release(handle)?;
            self.handle = None;
        }
        let cached = self
            .vertex
            .values_mut()
            .chain(self.fragment.values_mut())
            .filter_map(|entry| entry.shader.take());
        let shaders: Vec<Handle> = cached.chain(self.retired.drain(..)).collect();
        for shader in shaders {
            discard_shader(ctx, shader);
        }
        self.attributes.clear();
        self.uniforms.clear();
        self.compiled_sources = None;
        self.deleted = true;
        Ok(())
    }

    /// Fails with [`HandleError::WrongContext`] once the program has been
    /// compiled in a context other than `ctx`.
    fn check_context<D: Driver>(&self, ctx: &Context<D>) -> Result<(), HandleError> {
        match self.context {
            Some(owner) if owner != ctx.id() => Err(HandleError::WrongContext {
                kind: ResourceKind::Program,
                raw: self.handle.map_or(0, Handle::raw),
                owner,
                current: ctx.id(),
            }),
            _ => Ok(()),
        }
    }

    fn live_handle(&self) -> Result<Handle, ProgramError> {
        if self.deleted {
            return Err(ProgramError::Deleted(self.name.clone()));
        }
        self.handle
            .ok_or_else(|| ProgramError::NotCompiled(self.name.clone()))
    }
}

fn compile_shader<D: Driver>(
    ctx: &mut Context<D>,
    sources: &impl SourceProvider,
    program: &str,
    stage: ShaderStage,
    path: &str,
) -> Result<Handle, CompileError> {
    let text = sources.open_file(path).map_err(|e| match e {
        SourceError::NotFound(_) => CompileError::FileNotFound {
            program: program.to_owned(),
            path: path.to_owned(),
        },
        other => CompileError::Source {
            program: program.to_owned(),
            path: path.to_owned(),
            source: other,
        },
    })?;
    tracing::debug!("{program}: compiling {stage} shader {path}");
    let raw = ctx
        .driver
        .compile_shader(stage, path, &text)
        .map_err(|e| match e {
            DriverError::ShaderCompile { log } => CompileError::Shader {
                program: program.to_owned(),
                path: path.to_owned(),
                log,
            },
            other => CompileError::Driver(other),
        })?;
    Ok(ctx.register(ResourceKind::Shader, raw)?)
}

fn discard_shader<D: Driver>(ctx: &mut Context<D>, shader: Handle) {
    if !ctx.registry.is_live(shader) {
        return;
    }
    if let Err(e) = ctx.driver.delete_shader(shader.raw()) {
        tracing::warn!("Failed to delete {shader}: {e}");
    }
    if let Err(e) = ctx.release(shader) {
        tracing::warn!("Failed to release {shader}: {e}");
    }
}

fn discard_program<D: Driver>(ctx: &mut Context<D>, program: Handle) {
    if !ctx.registry.is_live(program) {
        return;
    }
    if let Err(e) = ctx.driver.delete_program(program.raw()) {
        tracing::warn!("Failed to delete {program}: {e}");
    }
    if let Err(e) = ctx.release(program) {
        tracing::warn!("Failed to release {program}: {e}");
    }
}

impl<D: Driver> Context<D> {
    /// Feed program attribute `attribute` from array attribute `name` of the
    /// bound array buffer `array`.
    pub fn attribute_array_bind(
        &mut self,
        attribute: &ProgramAttribute,
        array: &ArrayBuffer,
        name: &str,
    ) -> Result<(), AttributeBindError> {
        self.registry.check_live(attribute.program)?;
        self.require_buffer_bound(array.handle(), BufferTarget::Array)?;

        let descriptor = array.descriptor();
        let source = descriptor.attribute(name)?;
        let Some((scalar, components)) = attribute.ty.attribute_layout() else {
            return Err(AttributeBindError::UnsupportedType {
                name: attribute.name.clone(),
                ty: attribute.ty,
            });
        };
        if source.scalar() != scalar || source.components() != components {
            return Err(AttributeError::TypeMismatch {
                name: name.to_owned(),
                expected: source.scalar(),
                expected_components: source.components(),
                actual: scalar,
                actual_components: components,
            }
            .into());
        }

        let pointer = AttribPointer {
            scalar,
            components,
            stride: descriptor.element_size_bytes(),
            offset: descriptor.attribute_offset(name)?,
        };
        tracing::trace!(
            "Feeding attribute {} (location {}) from '{name}' of {}",
            attribute.name,
            attribute.location,
            array.handle()
        );
        self.driver.vertex_attrib_pointer(attribute.location, &pointer)?;
        Ok(())
    }

    pub fn attribute_array_unbind(
        &mut self,
        attribute: &ProgramAttribute,
    ) -> Result<(), AttributeBindError> {
        self.registry.check_live(attribute.program)?;
        self.driver.disable_vertex_attrib(attribute.location)?;
        Ok(())
    }

    /// Write `value` to `uniform`. Its program must be the active one and
    /// the value must match the declared type; texture units are checked
    /// against the context limits.
    pub fn program_uniform_put(
        &mut self,
        uniform: &ProgramUniform,
        value: UniformValue,
    ) -> Result<(), UniformError> {
        self.registry.check_live(uniform.program)?;
        if !self.bindings.is_bound(BindingTarget::Program, uniform.program) {
            return Err(UniformError::ProgramNotActive {
                name: uniform.name.clone(),
                program: uniform.program,
            });
        }
        if !value.fits(uniform.ty) {
            return Err(UniformError::TypeMismatch {
                name: uniform.name.clone(),
                expected: uniform.ty,
                actual: value.type_name(),
            });
        }
        if let UniformValue::TextureUnit(unit) = value {
            let available = self.limits.texture_units;
            if unit >= available {
                return Err(BindError::NoSuchTextureUnit { unit, available }.into());
            }
        }
        tracing::trace!(
            "Setting uniform {} (location {}) of {}",
            uniform.name,
            uniform.location,
            uniform.program
        );
        self.driver.program_uniform(uniform.location, &value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayDescriptor;
    use crate::buffer::UsageHint;
    use crate::fake::{FakeCommand, FakeDriver};
    use crate::source::MemorySources;

    const VERTEX: &str = "\
#version 330 core
in vec3 position;
in vec2 uv;
uniform mat4 transform;
out vec2 frag_uv;
void main() { frag_uv = uv; gl_Position = transform * vec4(position, 1.0); }
";

    const FRAGMENT: &str = "\
#version 330 core
in vec2 frag_uv;
uniform sampler2D albedo;
out vec4 color;
void main() { color = texture(albedo, frag_uv); }
";

    fn setup() -> (Context<FakeDriver>, MemorySources) {
        let mut sources = MemorySources::new();
        sources.mount("basic.vert", VERTEX);
        sources.mount("basic.frag", FRAGMENT);
        (Context::new(FakeDriver::new()).unwrap(), sources)
    }

    fn shader_compiles(ctx: &Context<FakeDriver>) -> usize {
        ctx.driver()
            .commands()
            .iter()
            .filter(|command| matches!(command, FakeCommand::CompileShader { .. }))
            .count()
    }

    #[test]
    fn empty_program_requires_compilation_and_fails() {
        let (mut ctx, sources) = setup();
        let mut program = Program::new("empty");

        assert!(program.requires_compilation(&sources));
        let err = program.compile(&mut ctx, &sources).unwrap_err();
        assert!(matches!(err, CompileError::EmptyProgram { .. }));
        assert!(err.to_string().ends_with("empty program"));
    }

    #[test]
    fn missing_source_fails_with_file_not_found() {
        let (mut ctx, sources) = setup();
        let mut program = Program::new("missing");
        program.add_vertex_shader("basic.vert");
        program.add_fragment_shader("nope.frag");

        let err = program.compile(&mut ctx, &sources).unwrap_err();
        assert!(err.to_string().ends_with("file not found 'nope.frag'"));
        assert!(program.handle().is_none());
        assert!(program.attribute("position").is_none());
        assert_eq!(ctx.registry().live_count(ResourceKind::Program), 0);
    }

    #[test]
    fn successful_compile_exposes_reflection() {
        let (mut ctx, sources) = setup();
        let mut program = Program::new("basic");
        program.add_vertex_shader("basic.vert");
        program.add_fragment_shader("basic.frag");

        program.compile(&mut ctx, &sources).unwrap();

        assert!(!program.requires_compilation(&sources));
        assert_eq!(program.attribute("position").unwrap().ty(), GlslType::Vec3);
        assert_eq!(program.attribute("uv").unwrap().ty(), GlslType::Vec2);
        assert_eq!(program.uniform("transform").unwrap().ty(), GlslType::Mat4);
        assert_eq!(program.uniform("albedo").unwrap().ty(), GlslType::Sampler2D);
        assert!(program.uniform("missing").is_none());
        assert_eq!(program.attributes().count(), 2);

        // Nothing changed: compiling again does no work.
        let before = shader_compiles(&ctx);
        program.compile(&mut ctx, &sources).unwrap();
        assert_eq!(shader_compiles(&ctx), before);
    }

    #[test]
    fn source_set_and_time_changes_require_compilation() {
        let (mut ctx, mut sources) = setup();
        let mut program = Program::new("basic");
        program.add_vertex_shader("basic.vert");
        program.add_fragment_shader("basic.frag");
        program.compile(&mut ctx, &sources).unwrap();

        assert!(!program.add_vertex_shader("basic.vert"));
        assert!(!program.requires_compilation(&sources));

        sources.mount("extra.frag", "uniform float exposure;\n");
        assert!(program.add_fragment_shader("extra.frag"));
        assert!(program.requires_compilation(&sources));
        program.compile(&mut ctx, &sources).unwrap();
        assert!(!program.requires_compilation(&sources));
        assert!(program.uniform("exposure").is_some());

        sources.mount("basic.frag", FRAGMENT);
        assert!(program.requires_compilation(&sources));
        let before = shader_compiles(&ctx);
        program.compile(&mut ctx, &sources).unwrap();
        // Only the remounted source is resubmitted.
        assert_eq!(shader_compiles(&ctx), before + 1);
        assert_eq!(ctx.registry().live_count(ResourceKind::Shader), 3);
        assert_eq!(ctx.registry().live_count(ResourceKind::Program), 1);
    }

    #[test]
    fn failed_recompile_keeps_the_last_good_program() {
        let (mut ctx, mut sources) = setup();
        let mut program = Program::new("basic");
        program.add_vertex_shader("basic.vert");
        program.add_fragment_shader("basic.frag");
        program.compile(&mut ctx, &sources).unwrap();
        program.activate(&mut ctx).unwrap();
        let good = program.handle().unwrap();

        sources.mount("basic.frag", "#error broken on purpose\n");
        let err = program.compile(&mut ctx, &sources).unwrap_err();

        assert!(matches!(err, CompileError::Shader { ref path, .. } if path == "basic.frag"));
        assert_eq!(program.handle(), Some(good));
        assert!(ctx.is_live(&good));
        assert!(program.is_active(&ctx));
        assert!(program.attribute("position").is_some());
        assert_eq!(ctx.registry().live_count(ResourceKind::Program), 1);
        assert!(program.requires_compilation(&sources));

        sources.mount("basic.frag", FRAGMENT);
        program.compile(&mut ctx, &sources).unwrap();
        assert_ne!(program.handle(), Some(good));
        assert!(!ctx.is_live(&good));
        // The replacement inherits the active binding.
        assert!(program.is_active(&ctx));
    }

    #[test]
    fn link_failures_are_reported() {
        let (mut ctx, mut sources) = setup();
        sources.mount("conflict.frag", "uniform vec4 transform;\n");
        let mut program = Program::new("conflict");
        program.add_vertex_shader("basic.vert");
        program.add_fragment_shader("conflict.frag");

        assert!(matches!(
            program.compile(&mut ctx, &sources),
            Err(CompileError::Link { .. })
        ));
        assert_eq!(ctx.registry().live_count(ResourceKind::Program), 0);
    }

    #[test]
    fn removing_a_source_retires_its_shader() {
        let (mut ctx, sources) = setup();
        let mut program = Program::new("basic");
        program.add_vertex_shader("basic.vert");
        program.add_fragment_shader("basic.frag");
        program.compile(&mut ctx, &sources).unwrap();

        assert!(!program.remove_vertex_shader("never-added.vert"));
        assert!(program.remove_fragment_shader("basic.frag"));
        assert!(program.requires_compilation(&sources));

        program.compile(&mut ctx, &sources).unwrap();
        assert_eq!(ctx.registry().live_count(ResourceKind::Shader), 1);
        assert!(program.attribute("position").is_some());
        assert!(program.uniform("albedo").is_none());
    }

    #[test]
    fn activation_requires_a_compiled_program() {
        let (mut ctx, sources) = setup();
        let mut program = Program::new("basic");
        program.add_vertex_shader("basic.vert");

        assert!(matches!(
            program.activate(&mut ctx),
            Err(ProgramError::NotCompiled(_))
        ));

        program.compile(&mut ctx, &sources).unwrap();
        program.activate(&mut ctx).unwrap();
        assert!(program.is_active(&ctx));
        program.deactivate(&mut ctx).unwrap();
        assert!(!program.is_active(&ctx));
    }

    #[test]
    fn delete_releases_everything_once() {
        let (mut ctx, sources) = setup();
        let mut never_compiled = Program::new("idle");
        never_compiled.delete(&mut ctx).unwrap();
        assert!(never_compiled.is_deleted());

        let mut program = Program::new("basic");
        program.add_vertex_shader("basic.vert");
        program.add_fragment_shader("basic.frag");
        program.compile(&mut ctx, &sources).unwrap();
        program.activate(&mut ctx).unwrap();

        program.delete(&mut ctx).unwrap();

        assert!(!ctx.bindings().any_bound(BindingTarget::Program));
        assert_eq!(ctx.registry().live_count(ResourceKind::Program), 0);
        assert_eq!(ctx.registry().live_count(ResourceKind::Shader), 0);
        assert!(program.attribute("position").is_none());
        assert!(matches!(
            program.delete(&mut ctx),
            Err(ProgramError::Deleted(_))
        ));
        assert!(matches!(
            program.compile(&mut ctx, &sources),
            Err(CompileError::Deleted { .. })
        ));
    }

    #[test]
    fn programs_stay_in_the_context_that_compiled_them() {
        let (mut a, mut sources) = setup();
        let mut b = Context::new(FakeDriver::new()).unwrap();
        let mut program = Program::new("basic");
        program.add_vertex_shader("basic.vert");
        program.add_fragment_shader("basic.frag");
        program.compile(&mut a, &sources).unwrap();
        let handle = program.handle().unwrap();

        sources.touch("basic.frag");
        assert!(matches!(
            program.compile(&mut b, &sources),
            Err(CompileError::Handle(HandleError::WrongContext { .. }))
        ));
        assert_eq!(b.driver().live_object_count(), 0);
        assert_eq!(program.handle(), Some(handle));

        assert!(matches!(
            program.delete(&mut b),
            Err(ProgramError::Handle(HandleError::WrongContext { .. }))
        ));
        assert_eq!(program.handle(), Some(handle));
        assert!(!program.is_deleted());

        program.delete(&mut a).unwrap();
        assert_eq!(a.registry().live_count(ResourceKind::Program), 0);
        assert_eq!(a.registry().live_count(ResourceKind::Shader), 0);
        assert_eq!(a.driver().live_object_count(), 0);
    }

    #[test]
    fn failed_delete_keeps_the_program() {
        let (mut ctx, sources) = setup();
        let mut program = Program::new("basic");
        program.add_vertex_shader("basic.vert");
        program.compile(&mut ctx, &sources).unwrap();
        let handle = program.handle().unwrap();

        ctx.driver_mut().fail_next_delete(handle.raw());
        assert!(matches!(
            program.delete(&mut ctx),
            Err(ProgramError::Driver(DriverError::InvalidOperation))
        ));
        assert_eq!(program.handle(), Some(handle));
        assert!(ctx.is_live(&handle));

        program.delete(&mut ctx).unwrap();
        assert!(program.handle().is_none());
        assert_eq!(ctx.driver().live_object_count(), 0);
    }

    #[test]
    fn uniform_writes_check_activity_and_type() {
        let (mut ctx, sources) = setup();
        let mut program = Program::new("basic");
        program.add_vertex_shader("basic.vert");
        program.add_fragment_shader("basic.frag");
        program.compile(&mut ctx, &sources).unwrap();
        let transform = program.uniform("transform").unwrap().clone();
        let albedo = program.uniform("albedo").unwrap().clone();
        let mut identity = [0.0; 16];
        for i in 0..4 {
            identity[i * 5] = 1.0;
        }

        assert!(matches!(
            ctx.program_uniform_put(&transform, UniformValue::Mat4(identity)),
            Err(UniformError::ProgramNotActive { .. })
        ));

        program.activate(&mut ctx).unwrap();
        assert!(matches!(
            ctx.program_uniform_put(&transform, UniformValue::Vec4([1.0; 4])),
            Err(UniformError::TypeMismatch { expected: GlslType::Mat4, actual: "vec4", .. })
        ));
        assert!(matches!(
            ctx.program_uniform_put(&albedo, UniformValue::Int(0)),
            Err(UniformError::TypeMismatch { .. })
        ));
        let units = ctx.limits().texture_units;
        assert!(matches!(
            ctx.program_uniform_put(&albedo, UniformValue::TextureUnit(units)),
            Err(UniformError::Bind(BindError::NoSuchTextureUnit { .. }))
        ));

        ctx.program_uniform_put(&transform, UniformValue::Mat4(identity))
            .unwrap();
        ctx.program_uniform_put(&albedo, UniformValue::TextureUnit(3))
            .unwrap();
        let raw = program.handle().unwrap().raw();
        assert_eq!(
            ctx.driver().uniform_value(raw, transform.location()),
            Some(UniformValue::Mat4(identity))
        );
        assert_eq!(
            ctx.driver().uniform_value(raw, albedo.location()),
            Some(UniformValue::TextureUnit(3))
        );

        program.delete(&mut ctx).unwrap();
        assert!(matches!(
            ctx.program_uniform_put(&albedo, UniformValue::TextureUnit(0)),
            Err(UniformError::Handle(HandleError::Deleted { .. }))
        ));
    }

    #[test]
    fn attribute_binding_checks_type_and_binding() {
        let (mut ctx, sources) = setup();
        let mut program = Program::new("basic");
        program.add_vertex_shader("basic.vert");
        program.compile(&mut ctx, &sources).unwrap();
        let position = program.attribute("position").unwrap().clone();

        let descriptor = ArrayDescriptor::builder()
            .attribute("position", ScalarType::F32, 3)
            .attribute("uv", ScalarType::F32, 2)
            .build()
            .unwrap();
        let array = ctx
            .array_buffer_allocate(4, &descriptor, UsageHint::StaticDraw)
            .unwrap();

        assert!(matches!(
            ctx.attribute_array_bind(&position, &array, "uv"),
            Err(AttributeBindError::Attribute(AttributeError::TypeMismatch { .. }))
        ));
        assert!(matches!(
            ctx.attribute_array_bind(&position, &array, "normal"),
            Err(AttributeBindError::Attribute(AttributeError::UnknownAttribute(_)))
        ));

        ctx.attribute_array_bind(&position, &array, "position").unwrap();
        assert!(ctx.driver().commands().iter().any(|command| matches!(
            command,
            FakeCommand::VertexAttribPointer { pointer, .. }
                if pointer.stride == 20 && pointer.offset == 0
        )));
        ctx.attribute_array_unbind(&position).unwrap();

        ctx.array_buffer_unbind().unwrap();
        assert!(matches!(
            ctx.attribute_array_bind(&position, &array, "position"),
            Err(AttributeBindError::Buffer(BufferError::NotBound { .. }))
        ));
    }
}
