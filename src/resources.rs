use crate::{
    config::MaskingMethod, device::*, masking::MaskConstants,
    reconstruction::ReconstructConstants, shaders,
};
use wgpu::{CompareFunction, StencilOperation, TextureFormat, TextureUsages};

/// Size and format of the submitted eye texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameDimensions {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl FrameDimensions {
    pub fn of(desc: &TextureDesc) -> Self {
        Self {
            width: desc.width,
            height: desc.height,
            format: desc.format,
        }
    }
}

/// Format of the pipeline's own color textures for a given input format.
///
/// 10-bit input gets a matching 10-bit target so the compositor applies the same color conversion.
pub fn cache_format(input: TextureFormat) -> TextureFormat {
    match input {
        TextureFormat::Rgb10a2Unorm | TextureFormat::Rgb10a2Uint => TextureFormat::Rgb10a2Unorm,
        _ => TextureFormat::Rgba8Unorm,
    }
}

/// Format of the reconstruction target: the [`cache_format`] of the input when it can be written
/// as a storage texture, otherwise the first of [`shaders::STORAGE_FORMATS`] that can.
pub fn reconstruction_format(
    input: TextureFormat,
    supports_storage: impl Fn(TextureFormat) -> bool,
) -> Option<TextureFormat> {
    std::iter::once(cache_format(input))
        .chain(shaders::STORAGE_FORMATS)
        .find(|format| supports_storage(*format))
}

/// Whether the input must be copied before it can be sampled.
pub fn requires_copy(desc: &TextureDesc) -> bool {
    !desc.usage.contains(TextureUsages::TEXTURE_BINDING)
        || desc.sample_count > 1
        || desc.format.is_srgb()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    dimensions: FrameDimensions,
    method: Option<MaskingMethod>,
    copy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyTarget {
    pub texture: TextureId,
    pub view: ViewId,
}

/// Fixed state of the masking draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskResources {
    pub vertex_program: ProgramId,
    pub pixel_program: ProgramId,
    pub rasterizer_state: RasterizerStateId,
    pub depth_stencil_state: DepthStencilStateId,
    /// One constant buffer per eye.
    pub constants: [BufferId; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconstructionResources {
    pub program: ProgramId,
    pub texture: TextureId,
    pub format: TextureFormat,
    pub storage_view: ViewId,
    pub sampled_view: ViewId,
    pub constants: [BufferId; 2],
}

/// Everything sized or specialized for one [`FrameDimensions`].
#[derive(Debug)]
pub struct FrameResources {
    pub dimensions: FrameDimensions,
    pub sampler: SamplerId,
    pub copy: Option<CopyTarget>,
    pub mask: Option<MaskResources>,
    pub reconstruction: Option<ReconstructionResources>,
    key: CacheKey,
    owned: Vec<Resource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preparation {
    Reused,
    Rebuilt,
}

/// Lazily builds [`FrameResources`] and rebuilds them only when the submission's dimensions,
/// format or masking variant change.
#[derive(Debug, Default)]
pub struct ResourceCache {
    current: Option<FrameResources>,
    rebuilds: u32,
}

impl ResourceCache {
    pub fn current(&self) -> Option<&FrameResources> {
        self.current.as_ref()
    }

    /// Number of times resources have been (re)built.
    pub fn rebuilds(&self) -> u32 {
        self.rebuilds
    }

    pub fn prepare(
        &mut self,
        ctx: &mut dyn DeviceContext,
        input: &TextureDesc,
        method: Option<MaskingMethod>,
    ) -> Result<Preparation, DeviceError> {
        let key = CacheKey {
            dimensions: FrameDimensions::of(input),
            method,
            copy: requires_copy(input),
        };
        if self.current.as_ref().is_some_and(|current| current.key == key) {
            return Ok(Preparation::Reused);
        }

        self.release(ctx);
        tracing::info!(
            width = key.dimensions.width,
            height = key.dimensions.height,
            format = ?key.dimensions.format,
            ?method,
            "creating post-processing resources"
        );
        let mut builder = ResourceBuilder::new(ctx);
        match builder.build(key) {
            Ok(mut resources) => {
                resources.owned = builder.finish();
                self.current = Some(resources);
                self.rebuilds += 1;
                Ok(Preparation::Rebuilt)
            }
            Err(err) => {
                builder.abort();
                Err(err)
            }
        }
    }

    pub fn release(&mut self, ctx: &mut dyn DeviceContext) {
        if let Some(resources) = self.current.take() {
            for resource in resources.owned.into_iter().rev() {
                ctx.release(resource);
            }
        }
    }
}

/// Tracks everything created so a failed build leaves nothing behind.
pub(crate) struct ResourceBuilder<'a> {
    ctx: &'a mut dyn DeviceContext,
    owned: Vec<Resource>,
}

impl<'a> ResourceBuilder<'a> {
    pub(crate) fn new(ctx: &'a mut dyn DeviceContext) -> Self {
        Self {
            ctx,
            owned: Vec::new(),
        }
    }

    /// Everything created so far, in creation order.
    pub(crate) fn finish(self) -> Vec<Resource> {
        self.owned
    }

    pub(crate) fn create<T: Into<Resource> + Copy>(
        &mut self,
        create: impl FnOnce(&mut dyn DeviceContext) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let id = create(&mut *self.ctx)?;
        self.owned.push(id.into());
        Ok(id)
    }

    pub(crate) fn abort(mut self) {
        self.rollback(0);
    }

    /// Releases everything created after the first `keep` resources.
    fn rollback(&mut self, keep: usize) {
        for resource in self.owned.drain(keep..).rev() {
            self.ctx.release(resource);
        }
    }

    fn build(&mut self, key: CacheKey) -> Result<FrameResources, DeviceError> {
        let FrameDimensions {
            width,
            height,
            format,
        } = key.dimensions;

        let sampler = self.create(|ctx| ctx.create_sampler(&SamplerDesc::LINEAR_CLAMP))?;

        let copy = if key.copy {
            tracing::info!(width, height, "input texture can't be sampled directly, creating copy target");
            let desc = TextureDesc::new_2d(
                "foveated_wgpu_copy",
                width,
                height,
                format.remove_srgb_suffix(),
                TextureUsages::TEXTURE_BINDING
                    | TextureUsages::COPY_DST
                    | TextureUsages::RENDER_ATTACHMENT,
            );
            let texture = self.create(|ctx| ctx.create_texture(&desc))?;
            let view = self.create(|ctx| {
                ctx.create_view(texture, &ViewDesc::new(ViewKind::ShaderResource))
            })?;
            Some(CopyTarget { texture, view })
        } else {
            None
        };

        let mask = match key.method {
            Some(method) => Some(self.build_mask(method)?),
            None => None,
        };

        // Masking and upscaling still work without a reconstruction target.
        let reconstruction = match key.method {
            Some(MaskingMethod::RadialDensity) => {
                let keep = self.owned.len();
                match self.build_reconstruction(key.dimensions) {
                    Ok(resources) => Some(resources),
                    Err(err) => {
                        tracing::error!("reconstruction resources unavailable: {err}");
                        self.rollback(keep);
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(FrameResources {
            dimensions: key.dimensions,
            sampler,
            copy,
            mask,
            reconstruction,
            key,
            owned: Vec::new(),
        })
    }

    fn build_mask(&mut self, method: MaskingMethod) -> Result<MaskResources, DeviceError> {
        let vertex_program = self.create(|ctx| ctx.create_program(&shaders::fullscreen_vertex()))?;
        let pixel_desc = match method {
            MaskingMethod::HiddenArea => shaders::hidden_area_mask(),
            MaskingMethod::RadialDensity => shaders::radial_density_mask(),
        };
        let pixel_program = self.create(|ctx| ctx.create_program(&pixel_desc))?;
        let rasterizer_state = self.create(|ctx| {
            ctx.create_rasterizer_state(&RasterizerDesc {
                cull_mode: None,
                ..Default::default()
            })
        })?;
        // Depth is left alone; every surviving fragment replaces the stencil value.
        let depth_stencil_state = self.create(|ctx| {
            ctx.create_depth_stencil_state(&DepthStencilDesc {
                depth_write: false,
                depth_compare: CompareFunction::Always,
                stencil_enable: true,
                stencil_read_mask: 0xff,
                stencil_write_mask: 0xff,
                stencil_compare: CompareFunction::Always,
                stencil_pass_op: StencilOperation::Replace,
                stencil_fail_op: StencilOperation::Keep,
                stencil_depth_fail_op: StencilOperation::Keep,
            })
        })?;
        let size = size_of::<MaskConstants>() as u64;
        let constants = [
            self.create(|ctx| ctx.create_buffer(&BufferDesc::uniform("mask_constants_left", size)))?,
            self.create(|ctx| ctx.create_buffer(&BufferDesc::uniform("mask_constants_right", size)))?,
        ];
        Ok(MaskResources {
            vertex_program,
            pixel_program,
            rasterizer_state,
            depth_stencil_state,
            constants,
        })
    }

    fn build_reconstruction(
        &mut self,
        dimensions: FrameDimensions,
    ) -> Result<ReconstructionResources, DeviceError> {
        let preferred = cache_format(dimensions.format);
        let format = reconstruction_format(dimensions.format, |format| {
            self.ctx.supports_storage_format(format)
        })
        .ok_or(DeviceError::UnsupportedFormat(preferred))?;
        if format != preferred {
            tracing::info!(
                ?preferred,
                ?format,
                "preferred reconstruction format can't be used for storage, falling back"
            );
        }
        let storage_format =
            shaders::storage_format_name(format).ok_or(DeviceError::UnsupportedFormat(format))?;
        let program = self.create(|ctx| {
            ctx.create_program(&shaders::radial_density_reconstruct(storage_format))
        })?;
        let desc = TextureDesc::new_2d(
            "foveated_wgpu_reconstructed",
            dimensions.width,
            dimensions.height,
            format,
            TextureUsages::STORAGE_BINDING | TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_SRC,
        );
        let texture = self.create(|ctx| ctx.create_texture(&desc))?;
        let storage_view =
            self.create(|ctx| ctx.create_view(texture, &ViewDesc::new(ViewKind::Storage)))?;
        let sampled_view =
            self.create(|ctx| ctx.create_view(texture, &ViewDesc::new(ViewKind::ShaderResource)))?;
        let size = size_of::<ReconstructConstants>() as u64;
        let constants = [
            self.create(|ctx| {
                ctx.create_buffer(&BufferDesc::uniform("reconstruct_constants_left", size))
            })?,
            self.create(|ctx| {
                ctx.create_buffer(&BufferDesc::uniform("reconstruct_constants_right", size))
            })?,
        ];
        Ok(ReconstructionResources {
            program,
            texture,
            format,
            storage_view,
            sampled_view,
            constants,
        })
    }
}
