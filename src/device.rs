use bitflags::bitflags;
use glam::UVec2;
use std::borrow::Cow;
use wgpu::{
    AddressMode, BufferUsages, CompareFunction, Face, FilterMode, FrontFace, IndexFormat,
    PrimitiveTopology, StencilOperation, TextureFormat, TextureUsages, VertexAttribute,
    VertexStepMode,
};

macro_rules! handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )*
    };
}

handles! {
    /// A 2D texture. Doubles as the stable identity of host resources.
    TextureId,
    /// A typed view onto a texture.
    ViewId,
    BufferId,
    SamplerId,
    /// A compiled shader entry point.
    ProgramId,
    InputLayoutId,
    RasterizerStateId,
    DepthStencilStateId,
    /// A start/end timestamp pair.
    QueryId,
}

pub const VERTEX_BUFFER_SLOTS: usize = 8;
pub const RENDER_TARGET_SLOTS: usize = 8;
pub const CONSTANT_BUFFER_SLOTS: usize = 4;
pub const RESOURCE_SLOTS: usize = 4;
pub const SAMPLER_SLOTS: usize = 4;
pub const STORAGE_SLOTS: usize = 4;

/// Description of a texture, as created by the pipeline or reported for a host resource.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsages,
    pub array_layers: u32,
    pub sample_count: u32,
}

impl TextureDesc {
    pub fn new_2d(
        label: impl Into<String>,
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsages,
    ) -> Self {
        Self {
            label: Some(label.into()),
            width,
            height,
            format,
            usage,
            array_layers: 1,
            sample_count: 1,
        }
    }

    pub fn extent(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    /// Stereo renders into a two-layer array keep one eye per layer.
    pub fn is_stereo_array(&self) -> bool {
        self.array_layers == 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    ShaderResource,
    RenderTarget,
    DepthStencil,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewDesc {
    pub kind: ViewKind,
    /// Reinterpretation format; `None` keeps the texture's own format.
    pub format: Option<TextureFormat>,
    /// Restricts the view to a single array layer.
    pub array_layer: Option<u32>,
}

impl ViewDesc {
    pub const fn new(kind: ViewKind) -> Self {
        Self {
            kind,
            format: None,
            array_layer: None,
        }
    }

    pub const fn layer(kind: ViewKind, layer: u32) -> Self {
        Self {
            kind,
            format: None,
            array_layer: Some(layer),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsages,
}

impl BufferDesc {
    pub const fn uniform(label: &'static str, size: u64) -> Self {
        Self {
            label,
            size,
            usage: BufferUsages::UNIFORM.union(BufferUsages::COPY_DST),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u16,
    pub compare: Option<CompareFunction>,
    pub lod_min_clamp: f32,
    pub lod_max_clamp: f32,
}

impl SamplerDesc {
    pub const LINEAR_CLAMP: Self = Self {
        min_filter: FilterMode::Linear,
        mag_filter: FilterMode::Linear,
        mipmap_filter: FilterMode::Linear,
        address_mode_u: AddressMode::ClampToEdge,
        address_mode_v: AddressMode::ClampToEdge,
        address_mode_w: AddressMode::ClampToEdge,
        mip_lod_bias: 0.0,
        max_anisotropy: 1,
        compare: None,
        lod_min_clamp: 0.0,
        lod_max_clamp: 0.0,
    };
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self::LINEAR_CLAMP
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Compute,
}

bitflags! {
    /// Bind slots a program reads. Every declared slot must be bound when it runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProgramSlots: u8 {
        /// Uniform buffer from constant-buffer slot 0.
        const CONSTANTS = 1 << 0;
        /// Sampled texture from resource slot 0.
        const TEXTURE = 1 << 1;
        /// Sampler from sampler slot 0.
        const SAMPLER = 1 << 2;
        /// Writable storage texture from storage slot 0.
        const STORAGE = 1 << 3;
    }
}

bitflags! {
    /// Which aspects of a depth-stencil surface a host clear resets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const DEPTH = 1 << 0;
        const STENCIL = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDesc {
    pub label: &'static str,
    pub stage: ShaderStage,
    /// WGSL source.
    pub source: Cow<'static, str>,
    pub entry_point: &'static str,
    pub slots: ProgramSlots,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexBufferLayoutDesc {
    pub stride: u64,
    pub step_mode: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputLayoutDesc {
    pub buffers: Vec<VertexBufferLayoutDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterizerDesc {
    pub cull_mode: Option<Face>,
    pub front_face: FrontFace,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self {
            cull_mode: Some(Face::Back),
            front_face: FrontFace::Cw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    pub depth_write: bool,
    pub depth_compare: CompareFunction,
    pub stencil_enable: bool,
    pub stencil_read_mask: u32,
    pub stencil_write_mask: u32,
    pub stencil_compare: CompareFunction,
    pub stencil_pass_op: StencilOperation,
    pub stencil_fail_op: StencilOperation,
    pub stencil_depth_fail_op: StencilOperation,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_write: true,
            depth_compare: CompareFunction::Less,
            stencil_enable: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            stencil_compare: CompareFunction::Always,
            stencil_pass_op: StencilOperation::Keep,
            stencil_fail_op: StencilOperation::Keep,
            stencil_depth_fail_op: StencilOperation::Keep,
        }
    }
}

/// Rasterizer viewport in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterViewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl RasterViewport {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x: x as f32,
            y: y as f32,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: BufferId,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferBinding {
    pub buffer: BufferId,
    pub format: IndexFormat,
    pub offset: u64,
}

/// Per-stage resource bindings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageBindings {
    pub constant_buffers: [Option<BufferId>; CONSTANT_BUFFER_SLOTS],
    pub resources: [Option<ViewId>; RESOURCE_SLOTS],
    pub samplers: [Option<SamplerId>; SAMPLER_SLOTS],
    pub storage: [Option<ViewId>; STORAGE_SLOTS],
}

/// Complete binding state of a command context. Draws and dispatches consume whatever is bound here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineBindings {
    pub vertex_program: Option<ProgramId>,
    pub pixel_program: Option<ProgramId>,
    pub compute_program: Option<ProgramId>,
    pub input_layout: Option<InputLayoutId>,
    pub topology: PrimitiveTopology,
    pub vertex_buffers: [Option<VertexBufferBinding>; VERTEX_BUFFER_SLOTS],
    pub index_buffer: Option<IndexBufferBinding>,
    pub render_targets: [Option<ViewId>; RENDER_TARGET_SLOTS],
    pub depth_stencil_view: Option<ViewId>,
    pub rasterizer_state: Option<RasterizerStateId>,
    pub depth_stencil_state: Option<DepthStencilStateId>,
    pub stencil_ref: u32,
    pub viewports: Vec<RasterViewport>,
    pub vertex: StageBindings,
    pub pixel: StageBindings,
    pub compute: StageBindings,
}

impl PipelineBindings {
    pub fn stage(&self, stage: ShaderStage) -> &StageBindings {
        match stage {
            ShaderStage::Vertex => &self.vertex,
            ShaderStage::Pixel => &self.pixel,
            ShaderStage::Compute => &self.compute,
        }
    }

    pub fn stage_mut(&mut self, stage: ShaderStage) -> &mut StageBindings {
        match stage {
            ShaderStage::Vertex => &mut self.vertex,
            ShaderStage::Pixel => &mut self.pixel,
            ShaderStage::Compute => &mut self.compute,
        }
    }

    /// Unbinds every render target and the depth-stencil view.
    pub fn clear_output_merger(&mut self) {
        self.render_targets = Default::default();
        self.depth_stencil_view = None;
    }
}

/// Anything the pipeline may hand back to [`DeviceContext::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Texture(TextureId),
    View(ViewId),
    Buffer(BufferId),
    Sampler(SamplerId),
    Program(ProgramId),
    InputLayout(InputLayoutId),
    RasterizerState(RasterizerStateId),
    DepthStencilState(DepthStencilStateId),
    Query(QueryId),
}

macro_rules! resource_from {
    ($($id:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$id> for Resource {
                fn from(id: $id) -> Self {
                    Resource::$variant(id)
                }
            }
        )*
    };
}

resource_from! {
    TextureId => Texture,
    ViewId => View,
    BufferId => Buffer,
    SamplerId => Sampler,
    ProgramId => Program,
    InputLayoutId => InputLayout,
    RasterizerStateId => RasterizerState,
    DepthStencilStateId => DepthStencilState,
    QueryId => Query,
}

/// Raw GPU timestamps of one sample, in device ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampPair {
    pub begin: u64,
    pub end: u64,
    /// Ticks per second.
    pub frequency: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    /// The timestamps are not comparable (clock domain changed, query lost, never ended).
    Disjoint,
    Ready(TimestampPair),
}

/// Error returned by every fallible [`DeviceContext`] operation.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("device is out of memory")]
    OutOfMemory,
    #[error("texture format {0:?} is not supported for this use")]
    UnsupportedFormat(TextureFormat),
    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),
    #[error("unknown {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u32 },
    #[error("{0}")]
    Validation(String),
}

/// Checks that `src` can be copied into `dst` as a whole: same extent, layer count and sample
/// count, and formats that differ at most in sRGB-ness.
pub fn check_copy(dst: &TextureDesc, src: &TextureDesc) -> Result<(), DeviceError> {
    check_shape(dst, src)?;
    if dst.sample_count != src.sample_count {
        return Err(DeviceError::Validation(format!(
            "copy from {} samples into {} samples",
            src.sample_count, dst.sample_count
        )));
    }
    Ok(())
}

/// Checks that multisampled `src` can be resolved into single-sampled `dst`.
pub fn check_resolve(dst: &TextureDesc, src: &TextureDesc) -> Result<(), DeviceError> {
    check_shape(dst, src)?;
    if src.sample_count == 1 || dst.sample_count != 1 {
        return Err(DeviceError::Validation(format!(
            "resolve from {} samples into {} samples",
            src.sample_count, dst.sample_count
        )));
    }
    if src.array_layers != 1 {
        return Err(DeviceError::Unsupported("resolving array textures"));
    }
    Ok(())
}

fn check_shape(dst: &TextureDesc, src: &TextureDesc) -> Result<(), DeviceError> {
    if dst.extent() != src.extent() || dst.array_layers != src.array_layers {
        return Err(DeviceError::Validation(format!(
            "{}x{}x{} texture does not match {}x{}x{} texture",
            src.width, src.height, src.array_layers, dst.width, dst.height, dst.array_layers
        )));
    }
    if dst.format.remove_srgb_suffix() != src.format.remove_srgb_suffix() {
        return Err(DeviceError::UnsupportedFormat(src.format));
    }
    Ok(())
}

/// The host's immediate-mode command context.
///
/// The pipeline runs synchronously inside intercepted host calls and issues all of its work through
/// this trait. Binding state is plain data: injected passes rewrite [`PipelineBindings`] and the
/// [`crate::StateGuard`] puts the host's copy back afterwards.
pub trait DeviceContext {
    fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc>;
    fn max_texture_dimension(&self) -> u32;
    /// Whether samplers created with a non-zero [`SamplerDesc::mip_lod_bias`] honor it.
    fn supports_sampler_mip_bias(&self) -> bool;
    /// Whether textures of `format` can be written through a write-only storage binding.
    fn supports_storage_format(&self, format: TextureFormat) -> bool;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError>;
    fn create_view(&mut self, texture: TextureId, desc: &ViewDesc) -> Result<ViewId, DeviceError>;
    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId, DeviceError>;
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, DeviceError>;
    fn sampler_desc(&self, sampler: SamplerId) -> Option<SamplerDesc>;
    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, DeviceError>;
    fn create_input_layout(&mut self, desc: &InputLayoutDesc)
    -> Result<InputLayoutId, DeviceError>;
    fn create_rasterizer_state(
        &mut self,
        desc: &RasterizerDesc,
    ) -> Result<RasterizerStateId, DeviceError>;
    fn create_depth_stencil_state(
        &mut self,
        desc: &DepthStencilDesc,
    ) -> Result<DepthStencilStateId, DeviceError>;
    fn create_timestamp_query(&mut self) -> Result<QueryId, DeviceError>;
    fn release(&mut self, resource: Resource);

    fn write_buffer(&mut self, buffer: BufferId, data: &[u8]) -> Result<(), DeviceError>;
    /// Copies the whole of `src` into `dst`. Extents must match and formats may differ only in sRGB-ness.
    fn copy_texture(&mut self, dst: TextureId, src: TextureId) -> Result<(), DeviceError>;
    /// Resolves multisampled `src` into single-sampled `dst`, under the same format rules as
    /// [`DeviceContext::copy_texture`].
    fn resolve_texture(&mut self, dst: TextureId, src: TextureId) -> Result<(), DeviceError>;

    fn bindings(&self) -> &PipelineBindings;
    fn bindings_mut(&mut self) -> &mut PipelineBindings;
    fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<(), DeviceError>;
    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DeviceError>;

    fn begin_timestamp(&mut self, query: QueryId) -> Result<(), DeviceError>;
    fn end_timestamp(&mut self, query: QueryId) -> Result<(), DeviceError>;
    /// Non-blocking; returns [`QueryStatus::Pending`] until the GPU has produced both timestamps.
    fn read_timestamp(&mut self, query: QueryId) -> QueryStatus;

    /// Submits recorded work. Contexts without deferred recording need not override this.
    fn flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color(format: TextureFormat, samples: u32) -> TextureDesc {
        TextureDesc {
            sample_count: samples,
            ..TextureDesc::new_2d("color", 64, 32, format, TextureUsages::RENDER_ATTACHMENT)
        }
    }

    #[test]
    fn copies_ignore_srgb_but_not_format_class() {
        let linear = color(TextureFormat::Rgba8Unorm, 1);
        assert_eq!(check_copy(&linear, &color(TextureFormat::Rgba8UnormSrgb, 1)), Ok(()));
        assert_eq!(
            check_copy(&linear, &color(TextureFormat::Bgra8Unorm, 1)),
            Err(DeviceError::UnsupportedFormat(TextureFormat::Bgra8Unorm))
        );
        assert!(check_copy(&linear, &color(TextureFormat::Rgba8Unorm, 4)).is_err());
        let layered = TextureDesc {
            array_layers: 2,
            ..color(TextureFormat::Rgba8Unorm, 1)
        };
        assert!(check_copy(&linear, &layered).is_err());
    }

    #[test]
    fn resolves_need_multisampled_source() {
        let single = color(TextureFormat::Rgba8Unorm, 1);
        let multi = color(TextureFormat::Rgba8UnormSrgb, 4);
        assert_eq!(check_resolve(&single, &multi), Ok(()));
        assert!(check_resolve(&single, &single).is_err());
        assert!(check_resolve(&multi, &multi).is_err());
    }
}
