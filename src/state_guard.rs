use crate::device::{DeviceContext, PipelineBindings};
use std::ops::{Deref, DerefMut};

/// Captures the host's binding state on construction and restores it, bit-identical, when dropped.
///
/// Every injected draw or dispatch runs through a guard, so the host never observes pipeline state
/// it did not set itself. Restoration also runs when a pass bails out early with an error.
pub struct StateGuard<'a, C: DeviceContext + ?Sized> {
    context: &'a mut C,
    saved: PipelineBindings,
}

impl<'a, C: DeviceContext + ?Sized> StateGuard<'a, C> {
    pub fn new(context: &'a mut C) -> Self {
        let saved = context.bindings().clone();
        Self { context, saved }
    }

    /// The host state that will be restored.
    pub fn saved(&self) -> &PipelineBindings {
        &self.saved
    }
}

impl<C: DeviceContext + ?Sized> Deref for StateGuard<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.context
    }
}

impl<C: DeviceContext + ?Sized> DerefMut for StateGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.context
    }
}

impl<C: DeviceContext + ?Sized> Drop for StateGuard<'_, C> {
    fn drop(&mut self) {
        *self.context.bindings_mut() = std::mem::take(&mut self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::*,
        mock::MockContext,
    };
    use wgpu::{IndexFormat, PrimitiveTopology};

    fn host_state(ctx: &mut MockContext) -> PipelineBindings {
        let vertex_program = ctx
            .create_program(&ProgramDesc {
                label: "host_vs",
                stage: ShaderStage::Vertex,
                source: "".into(),
                entry_point: "main",
                slots: ProgramSlots::empty(),
            })
            .unwrap();
        let input_layout = ctx.create_input_layout(&InputLayoutDesc::default()).unwrap();
        let buffer = ctx.create_buffer(&BufferDesc::uniform("host", 64)).unwrap();
        let bindings = ctx.bindings_mut();
        bindings.vertex_program = Some(vertex_program);
        bindings.input_layout = Some(input_layout);
        bindings.topology = PrimitiveTopology::TriangleStrip;
        bindings.vertex_buffers[1] = Some(VertexBufferBinding { buffer, offset: 16 });
        bindings.index_buffer = Some(IndexBufferBinding {
            buffer,
            format: IndexFormat::Uint16,
            offset: 0,
        });
        bindings.render_targets[0] = Some(ViewId(900));
        bindings.render_targets[3] = Some(ViewId(901));
        bindings.depth_stencil_view = Some(ViewId(902));
        bindings.stencil_ref = 7;
        bindings.viewports = vec![RasterViewport::new(0, 0, 1024, 1024)];
        bindings.vertex.constant_buffers[2] = Some(buffer);
        bindings.pixel.samplers[3] = Some(SamplerId(77));
        bindings.compute.storage[1] = Some(ViewId(903));
        bindings.clone()
    }

    #[test]
    fn restores_host_state_bit_identical() {
        let mut ctx = MockContext::new();
        let before = host_state(&mut ctx);

        {
            let mut guard = StateGuard::new(&mut ctx);
            let bindings = guard.bindings_mut();
            *bindings = PipelineBindings::default();
            bindings.pixel_program = Some(ProgramId(5));
            bindings.stencil_ref = 0xfe;
            guard.draw(3, 0).unwrap();
        }

        assert_eq!(ctx.bindings, before);
        assert_eq!(ctx.draws().count(), 1);
    }

    #[test]
    fn restores_on_early_error() {
        let mut ctx = MockContext::new();
        let before = host_state(&mut ctx);
        ctx.fail_submission = true;

        let result = (|| {
            let mut guard = StateGuard::new(&mut ctx);
            guard.bindings_mut().clear_output_merger();
            guard.draw(3, 0)
        })();

        assert!(result.is_err());
        assert_eq!(ctx.bindings, before);
    }
}
