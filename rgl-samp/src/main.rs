#![forbid(unsafe_code)]

use std::{
    fs::{self, File},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use program_manifest::ProgramManifest;
use rgl::{
    array::{ArrayDescriptor, ScalarType},
    buffer::{ArrayBuffer, ArrayBufferWritableData, UsageHint},
    context::Context,
    draw::{ClearSpecification, Primitive},
    driver::Driver,
    fake::FakeDriver,
    framebuffer::{
        BlitArea, BlitSpecification, ColorAttachmentPoint, DrawBuffer, Framebuffer,
        FramebufferConfiguration,
    },
    handle::ResourceKind,
    index::{IndexBuffer, IndexBufferWritableData},
    program::{Program, UniformValue},
    source::{DirectorySources, SourceProvider},
    texture::{Texture2D, TextureFilter, TextureFormat, TextureParameters},
};
use tracing_subscriber::{
    Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            // Off never installs a subscriber, so any level will do here.
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    /// TOML file naming the programs to build.
    #[arg(short, long, default_value = concat!(env!("CARGO_MANIFEST_DIR"), "/programs.toml"))]
    manifest: PathBuf,
    /// Overrides the manifest's shader root.
    #[arg(long)]
    shader_root: Option<PathBuf>,
    /// Number of times to check the sources for changes after the first frame.
    #[arg(long, default_value_t = 0)]
    poll_count: u32,
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,
}

const FRAME_SIZE: u32 = 256;
const P0: ColorAttachmentPoint = ColorAttachmentPoint::new(0);
const B0: DrawBuffer = DrawBuffer::new(0);
const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

fn main() -> eyre::Result<()> {
    let cli_args = CliArgs::parse();
    if cli_args.tracing_log_level != TracingLogLevel::Off {
        let log_path = init_tracing(cli_args.tracing_log_level)?;
        println!("Logging to {}", log_path.display());
        tracing::debug!("{cli_args:#?}");
    }

    let manifest = ProgramManifest::load(&cli_args.manifest)?;
    let shader_root = cli_args
        .shader_root
        .clone()
        .unwrap_or_else(|| manifest.resolve_shader_root(&cli_args.manifest));
    tracing::info!("Reading shaders from {}", shader_root.display());
    let sources = DirectorySources::new(shader_root);

    let mut ctx = Context::new(FakeDriver::new())?;
    tracing::debug!("Created context {} with {:?}", ctx.id(), ctx.limits());

    let mut programs: Vec<Program> = manifest
        .program
        .iter()
        .map(|entry| {
            let mut program = Program::new(entry.name.clone());
            for path in &entry.vertex {
                program.add_vertex_shader(path.clone());
            }
            for path in &entry.fragment {
                program.add_fragment_shader(path.clone());
            }
            program
        })
        .collect();
    compile_all(&mut ctx, &mut programs, &sources);

    let mesh = Mesh::new(&mut ctx)?;
    let targets = Targets::new(&mut ctx)?;

    let _frame_span = tracing::trace_span!("frames").entered();
    render_frame(&mut ctx, &programs, &mesh, &targets)?;
    for poll in 0..cli_args.poll_count {
        std::thread::sleep(Duration::from_millis(cli_args.poll_interval_ms));
        tracing::trace!("Polling shader sources ({}/{})", poll + 1, cli_args.poll_count);
        if programs.iter().any(|p| p.requires_compilation(&sources)) {
            compile_all(&mut ctx, &mut programs, &sources);
        }
        render_frame(&mut ctx, &programs, &mesh, &targets)?;
    }
    drop(_frame_span);

    targets.delete(&mut ctx)?;
    mesh.delete(&mut ctx)?;
    for program in &mut programs {
        program.delete(&mut ctx)?;
    }

    tracing::info!(
        "Session finished: {} program(s) and {} framebuffer(s) still live",
        ctx.registry().live_count(ResourceKind::Program),
        ctx.registry().live_count(ResourceKind::Framebuffer),
    );
    let driver = ctx.into_driver();
    println!("{} driver command(s) issued", driver.commands().len());
    Ok(())
}

/// Install a pretty stdout layer filtered to `level` plus an unfiltered
/// plain-text layer writing to the returned file.
fn init_tracing(level: TracingLogLevel) -> eyre::Result<PathBuf> {
    let log_dir = match directories::ProjectDirs::from("", "parengus", "rgl-samp") {
        Some(dirs) => dirs
            .runtime_dir()
            .unwrap_or_else(|| dirs.data_dir())
            .to_owned(),
        None => std::env::current_dir()?,
    };
    fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join("rgl-samp.log");
    let file_log = tracing_subscriber::fmt::layer()
        .with_writer(File::create(&log_path)?)
        .with_ansi(false);

    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_filter(LevelFilter::from_level(level.into()));
    tracing_subscriber::registry()
        .with(stdout_log.and_then(file_log))
        .init();
    Ok(log_path)
}

/// A failed compile keeps whatever program last compiled, so it is only
/// reported.
fn compile_all<D: Driver>(
    ctx: &mut Context<D>,
    programs: &mut [Program],
    sources: &impl SourceProvider,
) {
    for program in programs {
        if let Err(e) = program.compile(ctx, sources) {
            tracing::error!("{e}");
        }
    }
}

fn render_frame<D: Driver>(
    ctx: &mut Context<D>,
    programs: &[Program],
    mesh: &Mesh,
    targets: &Targets,
) -> eyre::Result<()> {
    ctx.framebuffer_draw_bind(&targets.scene)?;
    ctx.clear(
        &ClearSpecification::builder()
            .color([0.1, 0.1, 0.1, 1.0])
            .depth(1.0)
            .stencil(0)
            .build()?,
    )?;

    ctx.array_buffer_bind(&mesh.vertices)?;
    ctx.index_buffer_bind(&mesh.indices)?;
    ctx.texture_unit_bind(0, &targets.albedo)?;
    for program in programs.iter().filter(|p| p.handle().is_some()) {
        program.activate(ctx)?;
        for uniform in program.uniforms() {
            let value = match uniform.name() {
                "transform" => UniformValue::Mat4(IDENTITY),
                "albedo" => UniformValue::TextureUnit(0),
                "tint" => UniformValue::Vec4([1.0, 0.8, 0.6, 1.0]),
                other => {
                    tracing::warn!("{}: no value for uniform {other}", program.name());
                    continue;
                }
            };
            ctx.program_uniform_put(uniform, value)?;
        }
        let mut fed = Vec::new();
        for attribute in program.attributes() {
            if mesh.vertices.descriptor().has_attribute(attribute.name()) {
                ctx.attribute_array_bind(attribute, &mesh.vertices, attribute.name())?;
                fed.push(attribute);
            } else {
                tracing::warn!(
                    "{}: attribute {} has no source in the mesh",
                    program.name(),
                    attribute.name()
                );
            }
        }
        ctx.draw_elements(Primitive::Triangles, &mesh.indices)?;
        for attribute in fed {
            ctx.attribute_array_unbind(attribute)?;
        }
        program.deactivate(ctx)?;
    }

    ctx.framebuffer_read_bind(&targets.scene)?;
    ctx.framebuffer_draw_bind(&targets.overlay)?;
    let full = BlitArea::new(0, 0, FRAME_SIZE as i32, FRAME_SIZE as i32);
    ctx.framebuffer_blit(&BlitSpecification {
        source: full,
        target: full,
        color: true,
        depth: false,
        stencil: false,
        filter: TextureFilter::Nearest,
    })?;
    ctx.framebuffer_read_unbind()?;
    ctx.framebuffer_draw_unbind()?;
    Ok(())
}

/// A unit quad with interleaved positions and texture coordinates.
struct Mesh {
    vertices: ArrayBuffer,
    indices: IndexBuffer,
}

impl Mesh {
    const POSITIONS: [[f32; 3]; 4] = [
        [-1.0, -1.0, 0.0],
        [1.0, -1.0, 0.0],
        [1.0, 1.0, 0.0],
        [-1.0, 1.0, 0.0],
    ];
    const UVS: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
    const INDICES: [u32; 6] = [0, 1, 2, 0, 2, 3];

    fn new<D: Driver>(ctx: &mut Context<D>) -> eyre::Result<Self> {
        let descriptor = ArrayDescriptor::builder()
            .attribute("position", ScalarType::F32, 3)
            .attribute("uv", ScalarType::F32, 2)
            .build()?;
        let vertices = ctx.array_buffer_allocate(
            Self::POSITIONS.len() as u64,
            &descriptor,
            UsageHint::StaticDraw,
        )?;
        let data = ArrayBufferWritableData::new(&vertices);
        let mut positions = data.get_cursor::<[f32; 3]>("position")?;
        let mut uvs = data.get_cursor::<[f32; 2]>("uv")?;
        for (position, uv) in Self::POSITIONS.into_iter().zip(Self::UVS) {
            positions.put(position)?;
            uvs.put(uv)?;
        }
        ctx.array_buffer_update(&data)?;

        let indices = ctx.index_buffer_allocate(
            &vertices,
            Self::INDICES.len() as u64,
            UsageHint::StaticDraw,
        )?;
        let data = IndexBufferWritableData::new(&indices);
        let mut cursor = data.get_cursor();
        for index in Self::INDICES {
            cursor.put_index(index)?;
        }
        ctx.index_buffer_update(&data)?;
        tracing::debug!(
            "Mesh uses {} bytes of vertices and {:?} indices",
            vertices.size_bytes(),
            indices.index_type()
        );
        Ok(Self { vertices, indices })
    }

    fn delete<D: Driver>(self, ctx: &mut Context<D>) -> eyre::Result<()> {
        ctx.index_buffer_delete(&self.indices)?;
        ctx.array_buffer_delete(&self.vertices)?;
        Ok(())
    }
}

/// An HDR scene target and an overlay that shares its depth and stencil.
struct Targets {
    albedo: Texture2D,
    scene: Framebuffer,
    overlay: Framebuffer,
}

impl Targets {
    fn new<D: Driver>(ctx: &mut Context<D>) -> eyre::Result<Self> {
        let parameters = TextureParameters::default();
        let albedo = ctx.texture_2d_allocate(64, 64, TextureFormat::Rgba8, &parameters)?;

        let mut config = FramebufferConfiguration::new(FRAME_SIZE, FRAME_SIZE)?;
        config.request_color_texture_2d(P0, B0, TextureFormat::Rgba16f, &parameters)?;
        config.request_depth_stencil_renderbuffer()?;
        let scene = config.make(ctx)?;

        let mut config = FramebufferConfiguration::new(FRAME_SIZE, FRAME_SIZE)?;
        config.request_color_rgba_renderbuffer(P0, B0)?;
        config.request_shared_stencil(&scene)?;
        let overlay = config.make(ctx)?;

        Ok(Self {
            albedo,
            scene,
            overlay,
        })
    }

    /// Sharers go first: the scene owns the depth-stencil buffer.
    fn delete<D: Driver>(self, ctx: &mut Context<D>) -> eyre::Result<()> {
        ctx.framebuffer_delete(&self.overlay)?;
        ctx.framebuffer_delete(&self.scene)?;
        ctx.texture_2d_delete(&self.albedo)?;
        Ok(())
    }
}
