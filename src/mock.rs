//! A recording [`DeviceContext`] that executes nothing.

use crate::device::*;
use std::collections::{HashMap, VecDeque};
use wgpu::{Features, TextureFormat, TextureUsages};

/// A command recorded by [`MockContext`], together with the bindings it consumed.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Draw {
        vertex_count: u32,
        first_vertex: u32,
        bindings: PipelineBindings,
    },
    Dispatch {
        groups: [u32; 3],
        bindings: PipelineBindings,
    },
    Copy {
        dst: TextureId,
        src: TextureId,
    },
    Resolve {
        dst: TextureId,
        src: TextureId,
    },
    WriteBuffer {
        buffer: BufferId,
        data: Vec<u8>,
    },
    BeginTimestamp(QueryId),
    EndTimestamp(QueryId),
}

/// In-memory device context for tests and for interception layers that want to assert on the
/// pipeline's output without a GPU.
#[derive(Debug)]
pub struct MockContext {
    pub bindings: PipelineBindings,
    pub commands: Vec<Command>,
    pub released: Vec<Resource>,
    pub textures: HashMap<TextureId, TextureDesc>,
    pub samplers: HashMap<SamplerId, SamplerDesc>,
    pub programs: HashMap<ProgramId, ProgramDesc>,
    pub views: HashMap<ViewId, (TextureId, ViewDesc)>,
    /// Results handed out by [`DeviceContext::read_timestamp`], front first. Empty means `Disjoint`.
    pub timestamp_results: VecDeque<QueryStatus>,
    pub max_texture_dimension: u32,
    pub supports_mip_bias: bool,
    /// Formats usable as storage textures, as an adapter with format-specific features would
    /// report them. `None` means the formats wgpu guarantees.
    pub storage_formats: Option<Vec<TextureFormat>>,
    /// Every `create_*` call fails while set.
    pub fail_creation: bool,
    /// Every draw and dispatch fails while set.
    pub fail_submission: bool,
    pub textures_created: usize,
    next_id: u32,
}

impl Default for MockContext {
    fn default() -> Self {
        Self {
            bindings: PipelineBindings::default(),
            commands: Vec::new(),
            released: Vec::new(),
            textures: HashMap::new(),
            samplers: HashMap::new(),
            programs: HashMap::new(),
            views: HashMap::new(),
            timestamp_results: VecDeque::new(),
            max_texture_dimension: 8192,
            supports_mip_bias: true,
            storage_formats: None,
            fail_creation: false,
            fail_submission: false,
            textures_created: 0,
            next_id: 1,
        }
    }
}

impl MockContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host-owned texture. Not counted in [`MockContext::textures_created`].
    pub fn add_host_texture(&mut self, desc: TextureDesc) -> TextureId {
        let id = TextureId(self.next());
        self.textures.insert(id, desc);
        id
    }

    /// Registers a host-owned view onto `texture`.
    pub fn add_host_view(&mut self, texture: TextureId, desc: ViewDesc) -> ViewId {
        let id = ViewId(self.next());
        self.views.insert(id, (texture, desc));
        id
    }

    pub fn draws(&self) -> impl Iterator<Item = &PipelineBindings> {
        self.commands.iter().filter_map(|command| match command {
            Command::Draw { bindings, .. } => Some(bindings),
            _ => None,
        })
    }

    pub fn dispatches(&self) -> impl Iterator<Item = (&[u32; 3], &PipelineBindings)> {
        self.commands.iter().filter_map(|command| match command {
            Command::Dispatch { groups, bindings } => Some((groups, bindings)),
            _ => None,
        })
    }

    pub fn copies(&self) -> impl Iterator<Item = (TextureId, TextureId)> + '_ {
        self.commands.iter().filter_map(|command| match command {
            Command::Copy { dst, src } => Some((*dst, *src)),
            _ => None,
        })
    }

    pub fn resolves(&self) -> impl Iterator<Item = (TextureId, TextureId)> + '_ {
        self.commands.iter().filter_map(|command| match command {
            Command::Resolve { dst, src } => Some((*dst, *src)),
            _ => None,
        })
    }

    /// Data of every write to `buffer`, oldest first.
    pub fn buffer_writes(&self, buffer: BufferId) -> Vec<&[u8]> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                Command::WriteBuffer { buffer: b, data } if *b == buffer => Some(data.as_slice()),
                _ => None,
            })
            .collect()
    }

    pub fn view_texture(&self, view: ViewId) -> Option<TextureId> {
        self.views.get(&view).map(|(texture, _)| *texture)
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create(&mut self) -> Result<u32, DeviceError> {
        if self.fail_creation {
            return Err(DeviceError::OutOfMemory);
        }
        Ok(self.next())
    }

    fn desc(&self, texture: TextureId) -> Result<&TextureDesc, DeviceError> {
        self.textures.get(&texture).ok_or(DeviceError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })
    }

    fn submit(&mut self) -> Result<(), DeviceError> {
        if self.fail_submission {
            return Err(DeviceError::Validation("submission rejected".into()));
        }
        Ok(())
    }
}

impl DeviceContext for MockContext {
    fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        self.textures.get(&texture).cloned()
    }

    fn max_texture_dimension(&self) -> u32 {
        self.max_texture_dimension
    }

    fn supports_sampler_mip_bias(&self) -> bool {
        self.supports_mip_bias
    }

    fn supports_storage_format(&self, format: TextureFormat) -> bool {
        match &self.storage_formats {
            Some(formats) => formats.contains(&format),
            None => format
                .guaranteed_format_features(Features::empty())
                .allowed_usages
                .contains(TextureUsages::STORAGE_BINDING),
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError> {
        if desc.usage.contains(TextureUsages::STORAGE_BINDING)
            && !self.supports_storage_format(desc.format)
        {
            return Err(DeviceError::UnsupportedFormat(desc.format));
        }
        let id = TextureId(self.create()?);
        self.textures.insert(id, desc.clone());
        self.textures_created += 1;
        Ok(id)
    }

    fn create_view(&mut self, texture: TextureId, desc: &ViewDesc) -> Result<ViewId, DeviceError> {
        if !self.textures.contains_key(&texture) {
            return Err(DeviceError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            });
        }
        let id = ViewId(self.create()?);
        self.views.insert(id, (texture, *desc));
        Ok(id)
    }

    fn create_buffer(&mut self, _desc: &BufferDesc) -> Result<BufferId, DeviceError> {
        Ok(BufferId(self.create()?))
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, DeviceError> {
        let id = SamplerId(self.create()?);
        self.samplers.insert(id, *desc);
        Ok(id)
    }

    fn sampler_desc(&self, sampler: SamplerId) -> Option<SamplerDesc> {
        self.samplers.get(&sampler).copied()
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, DeviceError> {
        let id = ProgramId(self.create()?);
        self.programs.insert(id, desc.clone());
        Ok(id)
    }

    fn create_input_layout(
        &mut self,
        _desc: &InputLayoutDesc,
    ) -> Result<InputLayoutId, DeviceError> {
        Ok(InputLayoutId(self.create()?))
    }

    fn create_rasterizer_state(
        &mut self,
        _desc: &RasterizerDesc,
    ) -> Result<RasterizerStateId, DeviceError> {
        Ok(RasterizerStateId(self.create()?))
    }

    fn create_depth_stencil_state(
        &mut self,
        _desc: &DepthStencilDesc,
    ) -> Result<DepthStencilStateId, DeviceError> {
        Ok(DepthStencilStateId(self.create()?))
    }

    fn create_timestamp_query(&mut self) -> Result<QueryId, DeviceError> {
        Ok(QueryId(self.create()?))
    }

    fn release(&mut self, resource: Resource) {
        match resource {
            Resource::Texture(id) => {
                self.textures.remove(&id);
            }
            Resource::View(id) => {
                self.views.remove(&id);
            }
            Resource::Sampler(id) => {
                self.samplers.remove(&id);
            }
            Resource::Program(id) => {
                self.programs.remove(&id);
            }
            _ => {}
        }
        self.released.push(resource);
    }

    fn write_buffer(&mut self, buffer: BufferId, data: &[u8]) -> Result<(), DeviceError> {
        self.commands.push(Command::WriteBuffer {
            buffer,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn copy_texture(&mut self, dst: TextureId, src: TextureId) -> Result<(), DeviceError> {
        check_copy(self.desc(dst)?, self.desc(src)?)?;
        self.submit()?;
        self.commands.push(Command::Copy { dst, src });
        Ok(())
    }

    fn resolve_texture(&mut self, dst: TextureId, src: TextureId) -> Result<(), DeviceError> {
        check_resolve(self.desc(dst)?, self.desc(src)?)?;
        self.submit()?;
        self.commands.push(Command::Resolve { dst, src });
        Ok(())
    }

    fn bindings(&self) -> &PipelineBindings {
        &self.bindings
    }

    fn bindings_mut(&mut self) -> &mut PipelineBindings {
        &mut self.bindings
    }

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<(), DeviceError> {
        self.submit()?;
        self.commands.push(Command::Draw {
            vertex_count,
            first_vertex,
            bindings: self.bindings.clone(),
        });
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DeviceError> {
        self.submit()?;
        self.commands.push(Command::Dispatch {
            groups: [x, y, z],
            bindings: self.bindings.clone(),
        });
        Ok(())
    }

    fn begin_timestamp(&mut self, query: QueryId) -> Result<(), DeviceError> {
        self.commands.push(Command::BeginTimestamp(query));
        Ok(())
    }

    fn end_timestamp(&mut self, query: QueryId) -> Result<(), DeviceError> {
        self.commands.push(Command::EndTimestamp(query));
        Ok(())
    }

    fn read_timestamp(&mut self, _query: QueryId) -> QueryStatus {
        self.timestamp_results
            .pop_front()
            .unwrap_or(QueryStatus::Disjoint)
    }
}
