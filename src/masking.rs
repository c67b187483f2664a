use crate::{
    config::MaskingMethod,
    depth_views::DepthViews,
    device::{DeviceContext, DeviceError, RasterViewport, ShaderStage, TextureDesc},
    eye::{DepthGeometry, Eye, EyePlan},
    resources::MaskResources,
    runtime::RuntimeState,
    state_guard::StateGuard,
};
use bytemuck::{Pod, Zeroable};
use glam::{UVec2, Vec2};
use wgpu::PrimitiveTopology;

/// Constant buffer layout shared by both mask programs.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaskConstants {
    /// Inner, mid and outer foveation rings, then the edge radius.
    pub radius: [f32; 4],
    pub inv_cluster_resolution: [f32; 2],
    pub projection_center: [f32; 2],
    /// `y * y_fix[0] + y_fix[1]`; flips array renders that are drawn upside down.
    pub y_fix: [f32; 2],
    pub _padding: [f32; 2],
}

/// A depth clear selected for masking.
#[derive(Debug, Clone, Copy)]
pub struct MaskTarget<'a> {
    pub desc: &'a TextureDesc,
    pub views: DepthViews,
    pub geometry: DepthGeometry,
    pub plan: EyePlan,
    pub stencil_ref: u32,
}

/// Per-eye extent the mask covers inside `desc`.
fn render_extent(desc: &TextureDesc, geometry: DepthGeometry) -> UVec2 {
    let width = if geometry.side_by_side {
        desc.width / 2
    } else {
        desc.width
    };
    UVec2::new(width, desc.height)
}

fn mask_constants(
    method: MaskingMethod,
    runtime: &RuntimeState,
    eye: Eye,
    extent: UVec2,
    geometry: DepthGeometry,
) -> MaskConstants {
    let radius = match method {
        MaskingMethod::HiddenArea => [0.0, 0.0, 0.0, runtime.edge_radius],
        MaskingMethod::RadialDensity => [
            runtime.foveation.inner,
            runtime.foveation.mid,
            runtime.foveation.outer,
            runtime.edge_radius,
        ],
    };
    let mut center = runtime.projection_centers[eye.index()];
    if geometry.side_by_side && eye == Eye::Right {
        center.x += 1.0;
    }
    let y_fix = if geometry.array {
        [-1.0, extent.y as f32]
    } else {
        [1.0, 0.0]
    };
    MaskConstants {
        radius,
        inv_cluster_resolution: (Vec2::splat(8.0) / extent.as_vec2()).to_array(),
        projection_center: center.to_array(),
        y_fix,
        _padding: [0.0; 2],
    }
}

/// Full-screen stencil draw marking everything outside the edge radius.
#[derive(Debug)]
pub struct MaskingPass {
    method: MaskingMethod,
    uploaded: [Option<MaskConstants>; 2],
}

impl MaskingPass {
    pub fn new(method: MaskingMethod) -> Self {
        Self {
            method,
            uploaded: [None; 2],
        }
    }

    pub fn method(&self) -> MaskingMethod {
        self.method
    }

    /// Draws the mask for every eye of `target.plan`. Host bindings are restored on every exit path.
    pub fn draw(
        &mut self,
        ctx: &mut dyn DeviceContext,
        resources: &MaskResources,
        target: &MaskTarget<'_>,
        runtime: &mut RuntimeState,
    ) -> Result<(), DeviceError> {
        let mut ctx = StateGuard::new(ctx);
        let extent = render_extent(target.desc, target.geometry);

        let bindings = ctx.bindings_mut();
        bindings.vertex_program = Some(resources.vertex_program);
        bindings.pixel_program = Some(resources.pixel_program);
        bindings.compute_program = None;
        bindings.input_layout = None;
        bindings.topology = PrimitiveTopology::TriangleList;
        bindings.vertex_buffers = Default::default();
        bindings.index_buffer = None;
        bindings.render_targets = Default::default();
        bindings.rasterizer_state = Some(resources.rasterizer_state);
        bindings.depth_stencil_state = Some(resources.depth_stencil_state);
        bindings.stencil_ref = target.stencil_ref;

        for &eye in target.plan.eyes() {
            let constants = mask_constants(self.method, runtime, eye, extent, target.geometry);
            let buffer = resources.constants[eye.index()];
            let changed = runtime.radius_changed.take(eye);
            if changed || self.uploaded[eye.index()] != Some(constants) {
                ctx.write_buffer(buffer, bytemuck::bytes_of(&constants))?;
                self.uploaded[eye.index()] = Some(constants);
            }

            let x = if target.geometry.side_by_side && eye == Eye::Right {
                extent.x
            } else {
                0
            };
            let bindings = ctx.bindings_mut();
            bindings.depth_stencil_view = Some(target.views.view(eye));
            bindings.viewports = vec![RasterViewport::new(x, 0, extent.x, extent.y)];
            for stage in [ShaderStage::Vertex, ShaderStage::Pixel] {
                bindings.stage_mut(stage).constant_buffers[0] = Some(buffer);
            }
            ctx.draw(3, 0)?;
        }
        Ok(())
    }
}
