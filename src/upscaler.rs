//! Spatial upscalers and the registry that selects between them.

mod fsr;

pub use fsr::FsrUpscaler;

use crate::{
    device::*,
    eye::Eye,
    resources::ResourceBuilder,
    shaders,
    state_guard::StateGuard,
    submission::Viewport,
};
use bytemuck::{Pod, Zeroable};
use glam::{UVec2, Vec2};
use serde::Deserialize;
use std::{fmt, str::FromStr};
use wgpu::{CompareFunction, PrimitiveTopology};

/// Available upscaling algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum UpscaleMethod {
    /// Edge-adaptive upsampling followed by contrast-adaptive sharpening, in two passes.
    Fsr,
    /// Directional scaling and sharpening in one pass.
    Nis,
    /// Contrast-adaptive sharpening with bilinear scaling.
    Cas,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown upscaling method {0:?}")]
pub struct UnknownUpscaleMethod(pub String);

impl FromStr for UpscaleMethod {
    type Err = UnknownUpscaleMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fsr" => Ok(UpscaleMethod::Fsr),
            "nis" => Ok(UpscaleMethod::Nis),
            "cas" => Ok(UpscaleMethod::Cas),
            _ => Err(UnknownUpscaleMethod(s.to_owned())),
        }
    }
}

impl From<String> for UpscaleMethod {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|err| {
            tracing::info!("{err}, using NIS");
            UpscaleMethod::Nis
        })
    }
}

impl fmt::Display for UpscaleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpscaleMethod::Fsr => "FSR",
            UpscaleMethod::Nis => "NIS",
            UpscaleMethod::Cas => "CAS",
        })
    }
}

/// Error returned by [`Upscaler::upscale`] and [`create_upscaler`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UpscaleError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("unknown output texture {0:?}")]
    MissingOutput(TextureId),
    #[error("{which} viewport {viewport} is empty or exceeds its {size} texture")]
    InvalidViewport {
        which: &'static str,
        viewport: Viewport,
        size: UVec2,
    },
    #[error("{size} exceeds the device limit of {max} texels per side")]
    TooLarge { size: UVec2, max: u32 },
}

/// Per-eye inputs of an upscale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpscaleInput {
    /// Shader-resource view of the image to upscale.
    pub view: ViewId,
    /// Full size of the texture behind `view`.
    pub texture_size: UVec2,
    /// Region of that texture holding the eye.
    pub viewport: Viewport,
    pub output_texture: TextureId,
    /// Render-target view of `output_texture`.
    pub output_view: ViewId,
    pub eye: Eye,
    pub projection_center: Vec2,
    pub sharpness: f32,
    /// Beyond this normalized distance from the projection center only a bilinear fetch is done.
    pub radius: f32,
}

/// A spatial upscaling algorithm.
///
/// Implementations own their programs and intermediate textures, and accept any input and output
/// viewport within the device's texture limits.
pub trait Upscaler {
    fn method(&self) -> UpscaleMethod;

    /// Upscales `input` into `output_viewport` of the input's output texture.
    fn upscale(
        &mut self,
        ctx: &mut dyn DeviceContext,
        input: &UpscaleInput,
        output_viewport: Viewport,
    ) -> Result<(), UpscaleError>;

    /// Releases everything the upscaler created.
    fn release(&mut self, ctx: &mut dyn DeviceContext);
}

type UpscalerFactory = fn(&mut dyn DeviceContext) -> Result<Box<dyn Upscaler>, UpscaleError>;

const UPSCALERS: [(UpscaleMethod, UpscalerFactory); 3] = [
    (UpscaleMethod::Fsr, FsrUpscaler::create),
    (UpscaleMethod::Nis, SinglePassUpscaler::create_nis),
    (UpscaleMethod::Cas, SinglePassUpscaler::create_cas),
];

/// Instantiates the upscaler registered for `method`.
pub fn create_upscaler(
    ctx: &mut dyn DeviceContext,
    method: UpscaleMethod,
) -> Result<Box<dyn Upscaler>, UpscaleError> {
    let (_, factory) = UPSCALERS
        .iter()
        .find(|(registered, _)| *registered == method)
        .ok_or(UpscaleError::Device(DeviceError::Unsupported("upscaling method")))?;
    tracing::info!(%method, "creating upscaler");
    factory(ctx)
}

/// Render resolution for an output resolution and a per-axis render factor.
pub fn render_resolution(output: UVec2, render_factor: f32) -> UVec2 {
    (output.as_vec2() * render_factor)
        .round()
        .as_uvec2()
        .max(UVec2::ONE)
}

/// Checks both viewports against their textures and the device limit. Returns the output's description.
pub(crate) fn validate(
    ctx: &dyn DeviceContext,
    input: &UpscaleInput,
    output_viewport: Viewport,
) -> Result<TextureDesc, UpscaleError> {
    let output = ctx
        .texture_desc(input.output_texture)
        .ok_or(UpscaleError::MissingOutput(input.output_texture))?;
    let max = ctx.max_texture_dimension();
    for size in [input.texture_size, output.extent()] {
        if size.max_element() > max {
            return Err(UpscaleError::TooLarge { size, max });
        }
    }
    let checks = [
        ("input", input.viewport, input.texture_size),
        ("output", output_viewport, output.extent()),
    ];
    for (which, viewport, size) in checks {
        if viewport.is_empty() || !viewport.fits(size.x, size.y) {
            return Err(UpscaleError::InvalidViewport {
                which,
                viewport,
                size,
            });
        }
    }
    Ok(output)
}

/// Constant buffer layout shared by every upscaling program.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UpscaleConstants {
    pub input_offset: [f32; 2],
    pub input_size: [f32; 2],
    pub inv_input_texture: [f32; 2],
    pub output_offset: [f32; 2],
    pub output_size: [f32; 2],
    pub projection_center: [f32; 2],
    pub sharpness: f32,
    pub radius: f32,
    pub _padding: [f32; 2],
}

impl UpscaleConstants {
    pub fn new(
        input: &UpscaleInput,
        source: Viewport,
        source_texture: UVec2,
        output: Viewport,
    ) -> Self {
        Self {
            input_offset: source.offset().as_vec2().to_array(),
            input_size: source.size().as_vec2().to_array(),
            inv_input_texture: source_texture.as_vec2().recip().to_array(),
            output_offset: output.offset().as_vec2().to_array(),
            output_size: output.size().as_vec2().to_array(),
            projection_center: input.projection_center.to_array(),
            sharpness: input.sharpness,
            radius: input.radius,
            _padding: [0.0; 2],
        }
    }
}

impl UpscaleConstants {
    /// Same-size copy of `viewport` out of a `texture`-sized source.
    pub fn blit(viewport: Viewport, texture: UVec2) -> Self {
        let offset = viewport.offset().as_vec2().to_array();
        let size = viewport.size().as_vec2().to_array();
        Self {
            input_offset: offset,
            input_size: size,
            inv_input_texture: texture.as_vec2().recip().to_array(),
            output_offset: offset,
            output_size: size,
            projection_center: [0.0; 2],
            sharpness: 0.0,
            radius: 0.0,
            _padding: [0.0; 2],
        }
    }
}

/// A full-screen triangle running one upscaling program into a viewport of a render target.
#[derive(Debug)]
pub(crate) struct FullscreenPass {
    vertex_program: ProgramId,
    pixel_program: ProgramId,
    rasterizer_state: RasterizerStateId,
    depth_stencil_state: DepthStencilStateId,
    sampler: SamplerId,
    constants: [BufferId; 2],
    owned: Vec<Resource>,
}

impl FullscreenPass {
    pub(crate) fn new(
        ctx: &mut dyn DeviceContext,
        pixel: ProgramDesc,
    ) -> Result<Self, DeviceError> {
        let mut builder = ResourceBuilder::new(ctx);
        match Self::build(&mut builder, pixel) {
            Ok(mut pass) => {
                pass.owned = builder.finish();
                Ok(pass)
            }
            Err(err) => {
                builder.abort();
                Err(err)
            }
        }
    }

    fn build(builder: &mut ResourceBuilder<'_>, pixel: ProgramDesc) -> Result<Self, DeviceError> {
        let size = size_of::<UpscaleConstants>() as u64;
        Ok(Self {
            vertex_program: builder.create(|ctx| ctx.create_program(&shaders::fullscreen_vertex()))?,
            pixel_program: builder.create(|ctx| ctx.create_program(&pixel))?,
            rasterizer_state: builder.create(|ctx| {
                ctx.create_rasterizer_state(&RasterizerDesc {
                    cull_mode: None,
                    ..Default::default()
                })
            })?,
            depth_stencil_state: builder.create(|ctx| {
                ctx.create_depth_stencil_state(&DepthStencilDesc {
                    depth_write: false,
                    depth_compare: CompareFunction::Always,
                    ..Default::default()
                })
            })?,
            sampler: builder.create(|ctx| ctx.create_sampler(&SamplerDesc::LINEAR_CLAMP))?,
            constants: [
                builder.create(|ctx| {
                    ctx.create_buffer(&BufferDesc::uniform("upscale_constants_left", size))
                })?,
                builder.create(|ctx| {
                    ctx.create_buffer(&BufferDesc::uniform("upscale_constants_right", size))
                })?,
            ],
            owned: Vec::new(),
        })
    }

    /// Draws `source` into `viewport` of `target`, leaving the host's bindings as they were.
    pub(crate) fn run(
        &self,
        ctx: &mut dyn DeviceContext,
        eye: Eye,
        constants: &UpscaleConstants,
        source: ViewId,
        target: ViewId,
        viewport: Viewport,
    ) -> Result<(), DeviceError> {
        let buffer = self.constants[eye.index()];
        let mut ctx = StateGuard::new(ctx);
        ctx.write_buffer(buffer, bytemuck::bytes_of(constants))?;

        let bindings = ctx.bindings_mut();
        *bindings = PipelineBindings {
            vertex_program: Some(self.vertex_program),
            pixel_program: Some(self.pixel_program),
            topology: PrimitiveTopology::TriangleList,
            rasterizer_state: Some(self.rasterizer_state),
            depth_stencil_state: Some(self.depth_stencil_state),
            viewports: vec![RasterViewport::new(
                viewport.x,
                viewport.y,
                viewport.width,
                viewport.height,
            )],
            ..Default::default()
        };
        bindings.render_targets[0] = Some(target);
        bindings.pixel.constant_buffers[0] = Some(buffer);
        bindings.pixel.resources[0] = Some(source);
        bindings.pixel.samplers[0] = Some(self.sampler);
        ctx.draw(3, 0)
    }

    pub(crate) fn release(&mut self, ctx: &mut dyn DeviceContext) {
        for resource in self.owned.drain(..).rev() {
            ctx.release(resource);
        }
    }
}

/// Upscalers that scale and sharpen in a single pass.
#[derive(Debug)]
pub struct SinglePassUpscaler {
    method: UpscaleMethod,
    pass: FullscreenPass,
}

impl SinglePassUpscaler {
    fn create(
        ctx: &mut dyn DeviceContext,
        method: UpscaleMethod,
        program: ProgramDesc,
    ) -> Result<Box<dyn Upscaler>, UpscaleError> {
        Ok(Box::new(Self {
            method,
            pass: FullscreenPass::new(ctx, program)?,
        }))
    }

    fn create_nis(ctx: &mut dyn DeviceContext) -> Result<Box<dyn Upscaler>, UpscaleError> {
        Self::create(ctx, UpscaleMethod::Nis, shaders::nis())
    }

    fn create_cas(ctx: &mut dyn DeviceContext) -> Result<Box<dyn Upscaler>, UpscaleError> {
        Self::create(ctx, UpscaleMethod::Cas, shaders::cas())
    }
}

impl Upscaler for SinglePassUpscaler {
    fn method(&self) -> UpscaleMethod {
        self.method
    }

    fn upscale(
        &mut self,
        ctx: &mut dyn DeviceContext,
        input: &UpscaleInput,
        output_viewport: Viewport,
    ) -> Result<(), UpscaleError> {
        validate(ctx, input, output_viewport)?;
        let constants =
            UpscaleConstants::new(input, input.viewport, input.texture_size, output_viewport);
        self.pass.run(
            ctx,
            input.eye,
            &constants,
            input.view,
            input.output_view,
            output_viewport,
        )?;
        Ok(())
    }

    fn release(&mut self, ctx: &mut dyn DeviceContext) {
        self.pass.release(ctx);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mock::MockContext;
    use wgpu::{TextureFormat, TextureUsages};

    /// Host input and output textures for an upscale from `input` to `output` pixels.
    pub(crate) fn upscale_input(ctx: &mut MockContext, input: UVec2, output: UVec2) -> UpscaleInput {
        let source = ctx.add_host_texture(TextureDesc::new_2d(
            "eye",
            input.x,
            input.y,
            TextureFormat::Rgba8Unorm,
            TextureUsages::TEXTURE_BINDING,
        ));
        let output_texture = ctx.add_host_texture(TextureDesc::new_2d(
            "output",
            output.x,
            output.y,
            TextureFormat::Rgba8UnormSrgb,
            TextureUsages::RENDER_ATTACHMENT,
        ));
        UpscaleInput {
            view: ctx.add_host_view(source, ViewDesc::new(ViewKind::ShaderResource)),
            texture_size: input,
            viewport: Viewport::new(0, 0, input.x, input.y),
            output_texture,
            output_view: ctx.add_host_view(output_texture, ViewDesc::new(ViewKind::RenderTarget)),
            eye: Eye::Left,
            projection_center: Vec2::splat(0.5),
            sharpness: 0.3,
            radius: 0.95,
        }
    }

    #[test]
    fn registry_creates_every_method() {
        let mut ctx = MockContext::new();
        for method in [UpscaleMethod::Fsr, UpscaleMethod::Nis, UpscaleMethod::Cas] {
            let mut upscaler = create_upscaler(&mut ctx, method).unwrap();
            assert_eq!(upscaler.method(), method);
            upscaler.release(&mut ctx);
        }
        assert!(ctx.programs.is_empty());
    }

    #[test]
    fn method_names_parse_case_insensitively() {
        assert_eq!("fsr".parse::<UpscaleMethod>(), Ok(UpscaleMethod::Fsr));
        assert_eq!("CaS".parse::<UpscaleMethod>(), Ok(UpscaleMethod::Cas));
        assert_eq!(UpscaleMethod::from("dlss".to_owned()), UpscaleMethod::Nis);
        assert_eq!(UpscaleMethod::Fsr.to_string(), "FSR");
    }

    #[test]
    fn render_resolution_scales_per_axis() {
        assert_eq!(render_resolution(UVec2::new(2000, 1000), 0.5), UVec2::new(1000, 500));
        assert_eq!(render_resolution(UVec2::new(1, 1), 0.1), UVec2::ONE);
    }

    #[test]
    fn single_pass_draws_into_output_viewport() {
        let mut ctx = MockContext::new();
        let input = upscale_input(&mut ctx, UVec2::new(800, 800), UVec2::new(2000, 1000));
        let mut upscaler = create_upscaler(&mut ctx, UpscaleMethod::Cas).unwrap();
        let host = ctx.bindings.clone();

        let viewport = Viewport::new(1000, 0, 1000, 1000);
        upscaler.upscale(&mut ctx, &input, viewport).unwrap();

        let draw = ctx.draws().next().unwrap();
        assert_eq!(draw.render_targets[0], Some(input.output_view));
        assert_eq!(draw.pixel.resources[0], Some(input.view));
        assert_eq!(draw.viewports, vec![RasterViewport::new(1000, 0, 1000, 1000)]);
        let constants: &UpscaleConstants = bytemuck::from_bytes(
            ctx.buffer_writes(draw.pixel.constant_buffers[0].unwrap())[0],
        );
        assert_eq!(constants.output_offset, [1000.0, 0.0]);
        assert_eq!(constants.input_size, [800.0, 800.0]);
        assert_eq!(ctx.bindings, host);
    }

    #[test]
    fn rejects_oversized_and_out_of_bounds_viewports() {
        let mut ctx = MockContext::new();
        ctx.max_texture_dimension = 1024;
        let input = upscale_input(&mut ctx, UVec2::new(800, 800), UVec2::new(2000, 1000));
        let mut upscaler = create_upscaler(&mut ctx, UpscaleMethod::Nis).unwrap();
        assert!(matches!(
            upscaler.upscale(&mut ctx, &input, Viewport::new(0, 0, 1000, 1000)),
            Err(UpscaleError::TooLarge { max: 1024, .. })
        ));

        ctx.max_texture_dimension = 8192;
        assert!(matches!(
            upscaler.upscale(&mut ctx, &input, Viewport::new(1500, 0, 1000, 1000)),
            Err(UpscaleError::InvalidViewport { which: "output", .. })
        ));
        assert_eq!(ctx.draws().count(), 0);
    }
}
