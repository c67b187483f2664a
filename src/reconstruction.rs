use crate::{
    device::{DeviceContext, DeviceError, SamplerId, ViewId},
    eye::Eye,
    resources::ReconstructionResources,
    runtime::RuntimeState,
    state_guard::StateGuard,
    submission::Viewport,
};
use bytemuck::{Pod, Zeroable};
use glam::{UVec2, Vec2};

/// Constant buffer layout of the reconstruction program.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ReconstructConstants {
    /// Top-left of the eye's viewport in texels.
    pub offset: [i32; 2],
    pub projection_center: [f32; 2],
    pub inv_cluster_resolution: [f32; 2],
    pub inv_resolution: [f32; 2],
    /// Inner, mid and outer foveation rings, then the edge radius.
    pub radius: [f32; 4],
}

impl ReconstructConstants {
    /// `texture` is the size of the whole compressed texture; `viewport` the eye inside it.
    pub fn new(runtime: &RuntimeState, eye: Eye, viewport: Viewport, texture: UVec2) -> Self {
        let size = viewport.size().as_vec2();
        let offset = viewport.offset().as_vec2();
        // Eyes packed side by side see the second eye one viewport over.
        let center = runtime.projection_centers[eye.index()] + offset / size;
        Self {
            offset: viewport.offset().as_ivec2().to_array(),
            projection_center: center.to_array(),
            inv_cluster_resolution: (Vec2::splat(8.0) / size).to_array(),
            inv_resolution: texture.as_vec2().recip().to_array(),
            radius: [
                runtime.foveation.inner,
                runtime.foveation.mid,
                runtime.foveation.outer,
                runtime.edge_radius,
            ],
        }
    }
}

/// Compressed-render input of one eye.
#[derive(Debug, Clone, Copy)]
pub struct ReconstructionInput {
    pub view: ViewId,
    pub texture_size: UVec2,
    pub viewport: Viewport,
    pub eye: Eye,
}

/// Number of 8x8 workgroups covering `viewport`.
pub fn workgroups(viewport: Viewport) -> UVec2 {
    (viewport.size() + UVec2::splat(7)) / 8
}

/// Expands the radially compressed eye into the reconstruction target.
///
/// Returns the view the upscaler should sample from instead of the host's input.
pub fn reconstruct(
    ctx: &mut dyn DeviceContext,
    resources: &ReconstructionResources,
    sampler: SamplerId,
    input: &ReconstructionInput,
    runtime: &RuntimeState,
) -> Result<ViewId, DeviceError> {
    let constants = ReconstructConstants::new(runtime, input.eye, input.viewport, input.texture_size);
    let buffer = resources.constants[input.eye.index()];

    let mut ctx = StateGuard::new(ctx);
    ctx.write_buffer(buffer, bytemuck::bytes_of(&constants))?;
    let bindings = ctx.bindings_mut();
    // The input may still be bound as a render target.
    bindings.clear_output_merger();
    bindings.compute_program = Some(resources.program);
    bindings.compute.constant_buffers[0] = Some(buffer);
    bindings.compute.resources[0] = Some(input.view);
    bindings.compute.samplers[0] = Some(sampler);
    bindings.compute.storage[0] = Some(resources.storage_view);
    let groups = workgroups(input.viewport);
    ctx.dispatch(groups.x, groups.y, 1)?;
    Ok(resources.sampled_view)
}
