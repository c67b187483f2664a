//! [`DeviceContext`] implemented on a wgpu [`Device`] and [`Queue`].
//!
//! Every draw, dispatch and copy is recorded into its own command encoder and submitted right away,
//! so work lands on the queue in the order the host would have issued it. Validation and
//! out-of-memory errors are caught with error scopes and surface as [`DeviceError`]s.

use crate::{device::*, shaders};
use std::{
    collections::HashMap,
    sync::mpsc::{self, Receiver, TryRecvError},
};
use wgpu::{
    Adapter, BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, BindingResource, BindingType, Buffer, BufferAsyncError,
    BufferBindingType, BufferDescriptor, ColorTargetState, ColorWrites, CommandEncoder,
    CommandEncoderDescriptor, ComputePassDescriptor, ComputePassTimestampWrites, ComputePipeline,
    ComputePipelineDescriptor, DepthStencilState, Device, ErrorFilter, Extent3d, Features,
    FragmentState, LoadOp, MapMode, MultisampleState, Operations, Origin3d, PipelineLayout,
    PipelineLayoutDescriptor, PollType, PrimitiveState, PrimitiveTopology, QuerySet,
    QuerySetDescriptor, QueryType, Queue, RenderPassColorAttachment,
    RenderPassDepthStencilAttachment, RenderPassDescriptor, RenderPipeline,
    RenderPipelineDescriptor, Sampler, SamplerBindingType, SamplerDescriptor, ShaderModule,
    ShaderModuleDescriptor, ShaderSource, ShaderStages, StencilFaceState, StencilState,
    StorageTextureAccess, StoreOp, TexelCopyTextureInfo, Texture, TextureAspect, TextureDescriptor,
    TextureDimension, TextureFormat, TextureSampleType, TextureUsages, TextureView, TextureViewDescriptor,
    TextureViewDimension, VertexBufferLayout, VertexState,
};

/// Append-only handle table. Handles start at 1 and are never reused.
#[derive(Debug)]
struct Slab<T> {
    entries: Vec<Option<T>>,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> Slab<T> {
    fn insert(&mut self, value: T) -> u32 {
        self.entries.push(Some(value));
        self.entries.len() as u32
    }

    fn get(&self, id: u32) -> Option<&T> {
        let index = id.checked_sub(1)? as usize;
        self.entries.get(index)?.as_ref()
    }

    fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let index = id.checked_sub(1)? as usize;
        self.entries.get_mut(index)?.as_mut()
    }

    fn remove(&mut self, id: u32) -> Option<T> {
        let index = id.checked_sub(1)? as usize;
        self.entries.get_mut(index)?.take()
    }
}

fn invalid(kind: &'static str, id: u32) -> DeviceError {
    DeviceError::InvalidHandle { kind, id }
}

#[derive(Debug)]
struct TextureEntry {
    texture: Texture,
    desc: TextureDesc,
}

#[derive(Debug)]
struct ViewEntry {
    view: TextureView,
    format: TextureFormat,
    sample_count: u32,
}

#[derive(Debug)]
struct ProgramEntry {
    module: ShaderModule,
    desc: ProgramDesc,
}

#[derive(Debug)]
struct TimestampQuery {
    set: QuerySet,
    resolve: Buffer,
    readback: Buffer,
    /// Completion of the readback mapping, once the end timestamp has been resolved.
    mapping: Option<Receiver<Result<(), BufferAsyncError>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RenderPipelineKey {
    vertex: ProgramId,
    pixel: Option<ProgramId>,
    input_layout: Option<InputLayoutId>,
    topology: PrimitiveTopology,
    rasterizer: Option<RasterizerStateId>,
    depth_stencil: Option<DepthStencilStateId>,
    color_formats: Vec<Option<TextureFormat>>,
    depth_format: Option<TextureFormat>,
    sample_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ComputePipelineKey {
    program: ProgramId,
    storage_format: Option<TextureFormat>,
}

#[derive(Debug)]
struct CachedPipeline<P> {
    pipeline: P,
    bind_group_layout: BindGroupLayout,
    slots: ProgramSlots,
}

/// Bind group layout entries for the slots a program declares.
///
/// Slot `n` of [`ProgramSlots`] maps to `@group(0) @binding(n)`.
fn layout_entries(
    slots: ProgramSlots,
    visibility: ShaderStages,
    storage_format: Option<TextureFormat>,
) -> Result<Vec<BindGroupLayoutEntry>, DeviceError> {
    let mut entries = Vec::new();
    let mut entry = |binding, ty| {
        entries.push(BindGroupLayoutEntry {
            binding,
            visibility,
            ty,
            count: None,
        })
    };
    if slots.contains(ProgramSlots::CONSTANTS) {
        entry(
            0,
            BindingType::Buffer {
                ty: BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
        );
    }
    if slots.contains(ProgramSlots::TEXTURE) {
        entry(
            1,
            BindingType::Texture {
                sample_type: TextureSampleType::Float { filterable: true },
                view_dimension: TextureViewDimension::D2,
                multisampled: false,
            },
        );
    }
    if slots.contains(ProgramSlots::SAMPLER) {
        entry(2, BindingType::Sampler(SamplerBindingType::Filtering));
    }
    if slots.contains(ProgramSlots::STORAGE) {
        let format = storage_format.ok_or(DeviceError::Validation(
            "program declares a storage slot but no storage view is bound".into(),
        ))?;
        entry(
            3,
            BindingType::StorageTexture {
                access: StorageTextureAccess::WriteOnly,
                format,
                view_dimension: TextureViewDimension::D2,
            },
        );
    }
    Ok(entries)
}

/// Bound render targets up to the last occupied slot.
fn color_targets(targets: &[Option<ViewId>]) -> &[Option<ViewId>] {
    let len = targets
        .iter()
        .rposition(Option::is_some)
        .map_or(0, |last| last + 1);
    &targets[..len]
}

fn stencil_face(desc: &DepthStencilDesc) -> StencilFaceState {
    StencilFaceState {
        compare: desc.stencil_compare,
        fail_op: desc.stencil_fail_op,
        depth_fail_op: desc.stencil_depth_fail_op,
        pass_op: desc.stencil_pass_op,
    }
}

/// A [`DeviceContext`] over a wgpu device.
///
/// Host textures and views are registered with [`WgpuDeviceContext::import_texture`] and
/// [`WgpuDeviceContext::import_view`]; their handles then stand in for them in every call.
#[derive(Debug)]
pub struct WgpuDeviceContext {
    device: Device,
    queue: Queue,
    timestamp_period: f32,
    /// Storage formats the adapter reports beyond the guaranteed ones.
    adapter_storage_formats: Vec<TextureFormat>,
    textures: Slab<TextureEntry>,
    views: Slab<ViewEntry>,
    buffers: Slab<Buffer>,
    samplers: Slab<(Sampler, SamplerDesc)>,
    programs: Slab<ProgramEntry>,
    input_layouts: Slab<InputLayoutDesc>,
    rasterizer_states: Slab<RasterizerDesc>,
    depth_stencil_states: Slab<DepthStencilDesc>,
    queries: Slab<TimestampQuery>,
    render_pipelines: HashMap<RenderPipelineKey, CachedPipeline<RenderPipeline>>,
    compute_pipelines: HashMap<ComputePipelineKey, CachedPipeline<ComputePipeline>>,
    bindings: PipelineBindings,
}

impl WgpuDeviceContext {
    pub fn new(device: Device, queue: Queue) -> Self {
        Self {
            timestamp_period: queue.get_timestamp_period(),
            adapter_storage_formats: Vec::new(),
            device,
            queue,
            textures: Slab::default(),
            views: Slab::default(),
            buffers: Slab::default(),
            samplers: Slab::default(),
            programs: Slab::default(),
            input_layouts: Slab::default(),
            rasterizer_states: Slab::default(),
            depth_stencil_states: Slab::default(),
            queries: Slab::default(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            bindings: PipelineBindings::default(),
        }
    }

    /// Picks up the adapter's format-specific storage support. Only takes effect when the device
    /// was created with [`Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES`], which
    /// [`crate::request_device`] requests when available.
    pub fn with_adapter_format_features(mut self, adapter: &Adapter) -> Self {
        if !self
            .device
            .features()
            .contains(Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES)
        {
            return self;
        }
        self.adapter_storage_formats = shaders::STORAGE_FORMATS
            .into_iter()
            .filter(|format| {
                adapter
                    .get_texture_format_features(*format)
                    .allowed_usages
                    .contains(TextureUsages::STORAGE_BINDING)
            })
            .collect();
        tracing::info!(formats = ?self.adapter_storage_formats, "adapter storage formats");
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Registers a host texture.
    pub fn import_texture(&mut self, texture: Texture, label: Option<&str>) -> TextureId {
        let desc = TextureDesc {
            label: label.map(str::to_owned),
            width: texture.width(),
            height: texture.height(),
            format: texture.format(),
            usage: texture.usage(),
            array_layers: texture.depth_or_array_layers(),
            sample_count: texture.sample_count(),
        };
        TextureId(self.textures.insert(TextureEntry { texture, desc }))
    }

    /// Registers a host view onto an imported texture.
    pub fn import_view(
        &mut self,
        texture: TextureId,
        view: TextureView,
        format: Option<TextureFormat>,
    ) -> Result<ViewId, DeviceError> {
        let entry = self
            .textures
            .get(texture.0)
            .ok_or(invalid("texture", texture.0))?;
        let entry = ViewEntry {
            view,
            format: format.unwrap_or(entry.desc.format),
            sample_count: entry.desc.sample_count,
        };
        Ok(ViewId(self.views.insert(entry)))
    }

    /// Registers a host sampler. `desc` must describe how it was created.
    pub fn import_sampler(&mut self, sampler: Sampler, desc: SamplerDesc) -> SamplerId {
        SamplerId(self.samplers.insert((sampler, desc)))
    }

    pub fn texture(&self, texture: TextureId) -> Option<&Texture> {
        self.textures.get(texture.0).map(|entry| &entry.texture)
    }

    pub fn sampler(&self, sampler: SamplerId) -> Option<&Sampler> {
        self.samplers.get(sampler.0).map(|(sampler, _)| sampler)
    }

    /// Runs `f` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> Result<T, DeviceError> {
        self.device.push_error_scope(ErrorFilter::OutOfMemory);
        self.device.push_error_scope(ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if out_of_memory.is_some() {
            return Err(DeviceError::OutOfMemory);
        }
        if let Some(err) = validation {
            return Err(DeviceError::Validation(err.to_string()));
        }
        Ok(value)
    }

    /// Records into a fresh encoder and submits it.
    fn submit(
        &self,
        label: &str,
        record: impl FnOnce(&mut CommandEncoder) -> Result<(), DeviceError>,
    ) -> Result<(), DeviceError> {
        self.scoped(|| {
            let mut encoder = self
                .device
                .create_command_encoder(&CommandEncoderDescriptor { label: Some(label) });
            record(&mut encoder)?;
            self.queue.submit([encoder.finish()]);
            Ok(())
        })?
    }

    fn view(&self, view: ViewId) -> Result<&ViewEntry, DeviceError> {
        self.views.get(view.0).ok_or(invalid("view", view.0))
    }

    fn program(&self, program: ProgramId) -> Result<&ProgramEntry, DeviceError> {
        self.programs
            .get(program.0)
            .ok_or(invalid("program", program.0))
    }

    fn bind_group(
        &self,
        label: &str,
        layout: &BindGroupLayout,
        slots: ProgramSlots,
        stage: &StageBindings,
    ) -> Result<Option<BindGroup>, DeviceError> {
        if slots.is_empty() {
            return Ok(None);
        }
        let unbound = |slot: &str| DeviceError::Validation(format!("{label}: {slot} slot 0 is unbound"));
        let mut entries = Vec::new();
        if slots.contains(ProgramSlots::CONSTANTS) {
            let id = stage.constant_buffers[0].ok_or_else(|| unbound("constant buffer"))?;
            let buffer = self.buffers.get(id.0).ok_or(invalid("buffer", id.0))?;
            entries.push(BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            });
        }
        if slots.contains(ProgramSlots::TEXTURE) {
            let id = stage.resources[0].ok_or_else(|| unbound("resource"))?;
            entries.push(BindGroupEntry {
                binding: 1,
                resource: BindingResource::TextureView(&self.view(id)?.view),
            });
        }
        if slots.contains(ProgramSlots::SAMPLER) {
            let id = stage.samplers[0].ok_or_else(|| unbound("sampler"))?;
            let (sampler, _) = self.samplers.get(id.0).ok_or(invalid("sampler", id.0))?;
            entries.push(BindGroupEntry {
                binding: 2,
                resource: BindingResource::Sampler(sampler),
            });
        }
        if slots.contains(ProgramSlots::STORAGE) {
            let id = stage.storage[0].ok_or_else(|| unbound("storage"))?;
            entries.push(BindGroupEntry {
                binding: 3,
                resource: BindingResource::TextureView(&self.view(id)?.view),
            });
        }
        Ok(Some(self.device.create_bind_group(&BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &entries,
        })))
    }

    fn pipeline_layout(
        &self,
        label: &str,
        entries: &[BindGroupLayoutEntry],
    ) -> (BindGroupLayout, PipelineLayout) {
        let bind_group_layout = self
            .device
            .create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: Some(label),
                entries,
            });
        let layout = self
            .device
            .create_pipeline_layout(&PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        (bind_group_layout, layout)
    }

    fn render_pipeline_key(&self) -> Result<RenderPipelineKey, DeviceError> {
        let bindings = &self.bindings;
        let vertex = bindings
            .vertex_program
            .ok_or(DeviceError::Validation("draw without a vertex program".into()))?;
        let mut sample_count = 1;
        let mut color_formats = Vec::new();
        for target in color_targets(&bindings.render_targets) {
            color_formats.push(match target {
                Some(view) => {
                    let view = self.view(*view)?;
                    sample_count = view.sample_count;
                    Some(view.format)
                }
                None => None,
            });
        }
        let depth_format = match bindings.depth_stencil_view {
            Some(view) => {
                let view = self.view(view)?;
                sample_count = view.sample_count;
                Some(view.format)
            }
            None => None,
        };
        Ok(RenderPipelineKey {
            vertex,
            pixel: bindings.pixel_program,
            input_layout: bindings.input_layout,
            topology: bindings.topology,
            rasterizer: bindings.rasterizer_state,
            depth_stencil: bindings.depth_stencil_state,
            color_formats,
            depth_format,
            sample_count,
        })
    }

    fn create_render_pipeline(
        &self,
        key: &RenderPipelineKey,
    ) -> Result<CachedPipeline<RenderPipeline>, DeviceError> {
        let vertex = self.program(key.vertex)?;
        let pixel = key.pixel.map(|id| self.program(id)).transpose()?;
        let slots = vertex.desc.slots | pixel.map_or(ProgramSlots::empty(), |p| p.desc.slots);
        let label = pixel.map_or(vertex.desc.label, |p| p.desc.label);
        let entries = layout_entries(slots, ShaderStages::VERTEX_FRAGMENT, None)?;
        let (bind_group_layout, layout) = self.pipeline_layout(label, &entries);

        let input_layout = match key.input_layout {
            Some(id) => Some(
                self.input_layouts
                    .get(id.0)
                    .ok_or(invalid("input layout", id.0))?,
            ),
            None => None,
        };
        let buffers: Vec<_> = input_layout
            .map(|layout| {
                layout
                    .buffers
                    .iter()
                    .map(|buffer| VertexBufferLayout {
                        array_stride: buffer.stride,
                        step_mode: buffer.step_mode,
                        attributes: &buffer.attributes,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let rasterizer = match key.rasterizer {
            Some(id) => *self
                .rasterizer_states
                .get(id.0)
                .ok_or(invalid("rasterizer state", id.0))?,
            None => RasterizerDesc::default(),
        };
        let depth_stencil_desc = match key.depth_stencil {
            Some(id) => *self
                .depth_stencil_states
                .get(id.0)
                .ok_or(invalid("depth-stencil state", id.0))?,
            None => DepthStencilDesc::default(),
        };
        let depth_stencil = key.depth_format.map(|format| {
            let (read_mask, write_mask, face) = if depth_stencil_desc.stencil_enable {
                (
                    depth_stencil_desc.stencil_read_mask,
                    depth_stencil_desc.stencil_write_mask,
                    stencil_face(&depth_stencil_desc),
                )
            } else {
                (0, 0, StencilFaceState::IGNORE)
            };
            DepthStencilState {
                format,
                depth_write_enabled: depth_stencil_desc.depth_write && format.has_depth_aspect(),
                depth_compare: depth_stencil_desc.depth_compare,
                stencil: StencilState {
                    front: face,
                    back: face,
                    read_mask,
                    write_mask,
                },
                bias: Default::default(),
            }
        });

        let targets: Vec<_> = key
            .color_formats
            .iter()
            .map(|format| {
                format.map(|format| ColorTargetState {
                    format,
                    blend: None,
                    write_mask: ColorWrites::ALL,
                })
            })
            .collect();

        tracing::debug!(label, ?key, "creating render pipeline");
        let pipeline = self.scoped(|| {
            self.device
                .create_render_pipeline(&RenderPipelineDescriptor {
                    label: Some(label),
                    layout: Some(&layout),
                    vertex: VertexState {
                        module: &vertex.module,
                        entry_point: Some(vertex.desc.entry_point),
                        compilation_options: Default::default(),
                        buffers: &buffers,
                    },
                    primitive: PrimitiveState {
                        topology: key.topology,
                        front_face: rasterizer.front_face,
                        cull_mode: rasterizer.cull_mode,
                        ..Default::default()
                    },
                    depth_stencil,
                    multisample: MultisampleState {
                        count: key.sample_count,
                        ..Default::default()
                    },
                    fragment: pixel.map(|pixel| FragmentState {
                        module: &pixel.module,
                        entry_point: Some(pixel.desc.entry_point),
                        compilation_options: Default::default(),
                        targets: &targets,
                    }),
                    multiview: None,
                    cache: None,
                })
        })?;
        Ok(CachedPipeline {
            pipeline,
            bind_group_layout,
            slots,
        })
    }

    fn create_compute_pipeline(
        &self,
        key: &ComputePipelineKey,
    ) -> Result<CachedPipeline<ComputePipeline>, DeviceError> {
        let program = self.program(key.program)?;
        let slots = program.desc.slots;
        let entries = layout_entries(slots, ShaderStages::COMPUTE, key.storage_format)?;
        let (bind_group_layout, layout) = self.pipeline_layout(program.desc.label, &entries);
        tracing::debug!(label = program.desc.label, "creating compute pipeline");
        let pipeline = self.scoped(|| {
            self.device
                .create_compute_pipeline(&ComputePipelineDescriptor {
                    label: Some(program.desc.label),
                    layout: Some(&layout),
                    module: &program.module,
                    entry_point: Some(program.desc.entry_point),
                    compilation_options: Default::default(),
                    cache: None,
                })
        })?;
        Ok(CachedPipeline {
            pipeline,
            bind_group_layout,
            slots,
        })
    }

    /// Records an empty compute pass that writes one timestamp of `query`.
    fn write_timestamp(&self, query: QueryId, index: u32) -> Result<(), DeviceError> {
        let entry = self.queries.get(query.0).ok_or(invalid("query", query.0))?;
        self.submit("foveated_wgpu_timestamp", |encoder| {
            let (beginning, end) = if index == 0 {
                (Some(0), None)
            } else {
                (None, Some(1))
            };
            encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some("foveated_wgpu_timestamp"),
                timestamp_writes: Some(ComputePassTimestampWrites {
                    query_set: &entry.set,
                    beginning_of_pass_write_index: beginning,
                    end_of_pass_write_index: end,
                }),
            });
            if index == 1 {
                encoder.resolve_query_set(&entry.set, 0..2, &entry.resolve, 0);
                encoder.copy_buffer_to_buffer(&entry.resolve, 0, &entry.readback, 0, 16);
            }
            Ok(())
        })
    }
}

impl DeviceContext for WgpuDeviceContext {
    fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        self.textures.get(texture.0).map(|entry| entry.desc.clone())
    }

    fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    fn supports_sampler_mip_bias(&self) -> bool {
        false
    }

    fn supports_storage_format(&self, format: TextureFormat) -> bool {
        format
            .guaranteed_format_features(self.device.features())
            .allowed_usages
            .contains(TextureUsages::STORAGE_BINDING)
            || self.adapter_storage_formats.contains(&format)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError> {
        // Lets resolves write sRGB sources into a linear texture.
        let srgb = [desc.format.add_srgb_suffix()];
        let view_formats: &[TextureFormat] = if srgb[0] != desc.format { &srgb } else { &[] };
        let texture = self.scoped(|| {
            self.device.create_texture(&TextureDescriptor {
                label: desc.label.as_deref(),
                size: Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: desc.array_layers,
                },
                mip_level_count: 1,
                sample_count: desc.sample_count,
                dimension: TextureDimension::D2,
                format: desc.format,
                usage: desc.usage,
                view_formats,
            })
        })?;
        Ok(TextureId(self.textures.insert(TextureEntry {
            texture,
            desc: desc.clone(),
        })))
    }

    fn create_view(&mut self, texture: TextureId, desc: &ViewDesc) -> Result<ViewId, DeviceError> {
        let entry = self
            .textures
            .get(texture.0)
            .ok_or(invalid("texture", texture.0))?;
        let dimension = if desc.array_layer.is_some() || entry.desc.array_layers == 1 {
            TextureViewDimension::D2
        } else {
            TextureViewDimension::D2Array
        };
        let format = desc.format.unwrap_or(entry.desc.format);
        let view = self.scoped(|| {
            entry.texture.create_view(&TextureViewDescriptor {
                format: Some(format),
                dimension: Some(dimension),
                aspect: TextureAspect::All,
                base_array_layer: desc.array_layer.unwrap_or(0),
                array_layer_count: desc.array_layer.map(|_| 1),
                ..Default::default()
            })
        })?;
        let entry = ViewEntry {
            view,
            format,
            sample_count: entry.desc.sample_count,
        };
        Ok(ViewId(self.views.insert(entry)))
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId, DeviceError> {
        let buffer = self.scoped(|| {
            self.device.create_buffer(&BufferDescriptor {
                label: Some(desc.label),
                size: desc.size,
                usage: desc.usage,
                mapped_at_creation: false,
            })
        })?;
        Ok(BufferId(self.buffers.insert(buffer)))
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, DeviceError> {
        let sampler = self.scoped(|| {
            self.device.create_sampler(&SamplerDescriptor {
                label: Some("foveated_wgpu_sampler"),
                address_mode_u: desc.address_mode_u,
                address_mode_v: desc.address_mode_v,
                address_mode_w: desc.address_mode_w,
                mag_filter: desc.mag_filter,
                min_filter: desc.min_filter,
                mipmap_filter: desc.mipmap_filter,
                lod_min_clamp: desc.lod_min_clamp,
                lod_max_clamp: desc.lod_max_clamp,
                compare: desc.compare,
                anisotropy_clamp: desc.max_anisotropy.max(1),
                border_color: None,
            })
        })?;
        Ok(SamplerId(self.samplers.insert((sampler, *desc))))
    }

    fn sampler_desc(&self, sampler: SamplerId) -> Option<SamplerDesc> {
        self.samplers.get(sampler.0).map(|(_, desc)| *desc)
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, DeviceError> {
        let module = self.scoped(|| {
            self.device.create_shader_module(ShaderModuleDescriptor {
                label: Some(desc.label),
                source: ShaderSource::Wgsl(desc.source.clone()),
            })
        })?;
        Ok(ProgramId(self.programs.insert(ProgramEntry {
            module,
            desc: desc.clone(),
        })))
    }

    fn create_input_layout(
        &mut self,
        desc: &InputLayoutDesc,
    ) -> Result<InputLayoutId, DeviceError> {
        Ok(InputLayoutId(self.input_layouts.insert(desc.clone())))
    }

    fn create_rasterizer_state(
        &mut self,
        desc: &RasterizerDesc,
    ) -> Result<RasterizerStateId, DeviceError> {
        Ok(RasterizerStateId(self.rasterizer_states.insert(*desc)))
    }

    fn create_depth_stencil_state(
        &mut self,
        desc: &DepthStencilDesc,
    ) -> Result<DepthStencilStateId, DeviceError> {
        Ok(DepthStencilStateId(self.depth_stencil_states.insert(*desc)))
    }

    fn create_timestamp_query(&mut self) -> Result<QueryId, DeviceError> {
        if !self.device.features().contains(Features::TIMESTAMP_QUERY) {
            return Err(DeviceError::Unsupported("timestamp queries"));
        }
        let query = self.scoped(|| TimestampQuery {
            set: self.device.create_query_set(&QuerySetDescriptor {
                label: Some("foveated_wgpu_frame_time"),
                ty: QueryType::Timestamp,
                count: 2,
            }),
            resolve: self.device.create_buffer(&BufferDescriptor {
                label: Some("foveated_wgpu_frame_time_resolve"),
                size: 16,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            readback: self.device.create_buffer(&BufferDescriptor {
                label: Some("foveated_wgpu_frame_time_readback"),
                size: 16,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            mapping: None,
        })?;
        Ok(QueryId(self.queries.insert(query)))
    }

    fn release(&mut self, resource: Resource) {
        match resource {
            Resource::Texture(id) => {
                self.textures.remove(id.0);
            }
            Resource::View(id) => {
                self.views.remove(id.0);
            }
            Resource::Buffer(id) => {
                self.buffers.remove(id.0);
            }
            Resource::Sampler(id) => {
                self.samplers.remove(id.0);
            }
            Resource::Program(id) => {
                self.programs.remove(id.0);
                self.render_pipelines
                    .retain(|key, _| key.vertex != id && key.pixel != Some(id));
                self.compute_pipelines.retain(|key, _| key.program != id);
            }
            Resource::InputLayout(id) => {
                self.input_layouts.remove(id.0);
                self.render_pipelines
                    .retain(|key, _| key.input_layout != Some(id));
            }
            Resource::RasterizerState(id) => {
                self.rasterizer_states.remove(id.0);
                self.render_pipelines
                    .retain(|key, _| key.rasterizer != Some(id));
            }
            Resource::DepthStencilState(id) => {
                self.depth_stencil_states.remove(id.0);
                self.render_pipelines
                    .retain(|key, _| key.depth_stencil != Some(id));
            }
            Resource::Query(id) => {
                self.queries.remove(id.0);
            }
        }
    }

    fn write_buffer(&mut self, buffer: BufferId, data: &[u8]) -> Result<(), DeviceError> {
        let target = self
            .buffers
            .get(buffer.0)
            .ok_or(invalid("buffer", buffer.0))?;
        self.scoped(|| self.queue.write_buffer(target, 0, data))
    }

    fn copy_texture(&mut self, dst: TextureId, src: TextureId) -> Result<(), DeviceError> {
        let dst = self.textures.get(dst.0).ok_or(invalid("texture", dst.0))?;
        let src = self.textures.get(src.0).ok_or(invalid("texture", src.0))?;
        check_copy(&dst.desc, &src.desc)?;
        self.submit("foveated_wgpu_copy", |encoder| {
            let info = |texture| TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            };
            encoder.copy_texture_to_texture(
                info(&src.texture),
                info(&dst.texture),
                Extent3d {
                    width: src.desc.width,
                    height: src.desc.height,
                    depth_or_array_layers: src.desc.array_layers,
                },
            );
            Ok(())
        })
    }

    fn resolve_texture(&mut self, dst: TextureId, src: TextureId) -> Result<(), DeviceError> {
        let dst = self.textures.get(dst.0).ok_or(invalid("texture", dst.0))?;
        let src = self.textures.get(src.0).ok_or(invalid("texture", src.0))?;
        check_resolve(&dst.desc, &src.desc)?;
        self.submit("foveated_wgpu_resolve", |encoder| {
            let view = |texture: &Texture| {
                texture.create_view(&TextureViewDescriptor {
                    format: Some(src.desc.format),
                    dimension: Some(TextureViewDimension::D2),
                    ..Default::default()
                })
            };
            let source = view(&src.texture);
            let target = view(&dst.texture);
            // An empty pass: loading and storing the source resolves it into the target.
            drop(encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("foveated_wgpu_resolve"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &source,
                    depth_slice: None,
                    resolve_target: Some(&target),
                    ops: Operations {
                        load: LoadOp::Load,
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            }));
            Ok(())
        })
    }

    fn bindings(&self) -> &PipelineBindings {
        &self.bindings
    }

    fn bindings_mut(&mut self) -> &mut PipelineBindings {
        &mut self.bindings
    }

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<(), DeviceError> {
        let key = self.render_pipeline_key()?;
        if !self.render_pipelines.contains_key(&key) {
            let pipeline = self.create_render_pipeline(&key)?;
            self.render_pipelines.insert(key.clone(), pipeline);
        }
        let cached = self
            .render_pipelines
            .get(&key)
            .ok_or(DeviceError::Validation("render pipeline missing".into()))?;
        let bindings = &self.bindings;
        let bind_group = self.bind_group(
            "foveated_wgpu_draw",
            &cached.bind_group_layout,
            cached.slots,
            &bindings.pixel,
        )?;

        let mut color_attachments = Vec::new();
        for target in color_targets(&bindings.render_targets) {
            color_attachments.push(match target {
                Some(view) => Some(RenderPassColorAttachment {
                    view: &self.view(*view)?.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Load,
                        store: StoreOp::Store,
                    },
                }),
                None => None,
            });
        }
        let depth_stencil_attachment = match (bindings.depth_stencil_view, key.depth_format) {
            (Some(view), Some(format)) => Some(RenderPassDepthStencilAttachment {
                view: &self.view(view)?.view,
                depth_ops: format.has_depth_aspect().then_some(Operations {
                    load: LoadOp::Load,
                    store: StoreOp::Store,
                }),
                stencil_ops: format.has_stencil_aspect().then_some(Operations {
                    load: LoadOp::Load,
                    store: StoreOp::Store,
                }),
            }),
            _ => None,
        };
        let mut vertex_buffers = Vec::new();
        for (slot, binding) in bindings.vertex_buffers.iter().enumerate() {
            if let Some(binding) = binding {
                let buffer = self
                    .buffers
                    .get(binding.buffer.0)
                    .ok_or(invalid("buffer", binding.buffer.0))?;
                vertex_buffers.push((slot as u32, buffer.slice(binding.offset..)));
            }
        }

        self.submit("foveated_wgpu_draw", |encoder| {
            let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("foveated_wgpu_draw"),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&cached.pipeline);
            if let Some(group) = &bind_group {
                pass.set_bind_group(0, group, &[]);
            }
            for (slot, slice) in vertex_buffers {
                pass.set_vertex_buffer(slot, slice);
            }
            if let Some(viewport) = bindings.viewports.first() {
                pass.set_viewport(
                    viewport.x,
                    viewport.y,
                    viewport.width,
                    viewport.height,
                    viewport.min_depth,
                    viewport.max_depth,
                );
            }
            pass.set_stencil_reference(bindings.stencil_ref);
            pass.draw(first_vertex..first_vertex + vertex_count, 0..1);
            Ok(())
        })
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DeviceError> {
        let program = self
            .bindings
            .compute_program
            .ok_or(DeviceError::Validation("dispatch without a compute program".into()))?;
        let storage_format = match self.bindings.compute.storage[0] {
            Some(view) => Some(self.view(view)?.format),
            None => None,
        };
        let key = ComputePipelineKey {
            program,
            storage_format,
        };
        if !self.compute_pipelines.contains_key(&key) {
            let pipeline = self.create_compute_pipeline(&key)?;
            self.compute_pipelines.insert(key, pipeline);
        }
        let cached = self
            .compute_pipelines
            .get(&key)
            .ok_or(DeviceError::Validation("compute pipeline missing".into()))?;
        let bind_group = self.bind_group(
            "foveated_wgpu_dispatch",
            &cached.bind_group_layout,
            cached.slots,
            &self.bindings.compute,
        )?;

        self.submit("foveated_wgpu_dispatch", |encoder| {
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some("foveated_wgpu_dispatch"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&cached.pipeline);
            if let Some(group) = &bind_group {
                pass.set_bind_group(0, group, &[]);
            }
            pass.dispatch_workgroups(x, y, z);
            Ok(())
        })
    }

    fn begin_timestamp(&mut self, query: QueryId) -> Result<(), DeviceError> {
        let entry = self
            .queries
            .get_mut(query.0)
            .ok_or(invalid("query", query.0))?;
        // A sample that was never read leaves the readback mapped.
        if entry.mapping.take().is_some() {
            entry.readback.unmap();
        }
        self.write_timestamp(query, 0)
    }

    fn end_timestamp(&mut self, query: QueryId) -> Result<(), DeviceError> {
        self.write_timestamp(query, 1)?;
        let entry = self
            .queries
            .get_mut(query.0)
            .ok_or(invalid("query", query.0))?;
        let (sender, receiver) = mpsc::channel();
        entry
            .readback
            .slice(..)
            .map_async(MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        entry.mapping = Some(receiver);
        Ok(())
    }

    fn read_timestamp(&mut self, query: QueryId) -> QueryStatus {
        if let Err(err) = self.device.poll(PollType::Poll) {
            tracing::warn!("device poll failed: {err}");
            return QueryStatus::Disjoint;
        }
        let Some(entry) = self.queries.get_mut(query.0) else {
            return QueryStatus::Disjoint;
        };
        let Some(mapping) = &entry.mapping else {
            return QueryStatus::Disjoint;
        };
        match mapping.try_recv() {
            Err(TryRecvError::Empty) => return QueryStatus::Pending,
            Err(TryRecvError::Disconnected) | Ok(Err(_)) => {
                entry.mapping = None;
                return QueryStatus::Disjoint;
            }
            Ok(Ok(())) => {}
        }
        if !(self.timestamp_period.is_finite() && self.timestamp_period > 0.0) {
            tracing::warn!(period = self.timestamp_period, "invalid timestamp period");
            entry.readback.unmap();
            entry.mapping = None;
            return QueryStatus::Disjoint;
        }
        let ticks: [u64; 2] = {
            let data = entry.readback.slice(..).get_mapped_range();
            bytemuck::pod_read_unaligned(&data[..16])
        };
        entry.readback.unmap();
        entry.mapping = None;
        QueryStatus::Ready(TimestampPair {
            begin: ticks[0],
            end: ticks[1],
            frequency: timestamp_frequency(self.timestamp_period),
        })
    }
}

/// Ticks per second for a timestamp period in nanoseconds per tick. Never zero.
fn timestamp_frequency(period: f32) -> u64 {
    ((1.0e9 / f64::from(period)) as u64).max(1)
}
