use super::{FullscreenPass, UpscaleConstants, UpscaleError, UpscaleInput, UpscaleMethod, Upscaler};
use crate::{
    device::{DeviceContext, DeviceError, Resource, TextureDesc, TextureId, ViewDesc, ViewId, ViewKind},
    shaders,
    submission::Viewport,
};
use wgpu::{TextureFormat, TextureUsages};

/// Output-sized target of the upsampling pass, read back by the sharpening pass.
#[derive(Debug)]
struct Intermediate {
    width: u32,
    height: u32,
    format: TextureFormat,
    texture: TextureId,
    render_view: ViewId,
    sampled_view: ViewId,
}

impl Intermediate {
    fn matches(&self, output: &TextureDesc) -> bool {
        self.width == output.width
            && self.height == output.height
            && self.format == output.format.remove_srgb_suffix()
    }

    fn create(ctx: &mut dyn DeviceContext, output: &TextureDesc) -> Result<Self, DeviceError> {
        let format = output.format.remove_srgb_suffix();
        tracing::info!(
            width = output.width,
            height = output.height,
            ?format,
            "creating FSR intermediate texture"
        );
        let texture = ctx.create_texture(&TextureDesc::new_2d(
            "fsr_intermediate",
            output.width,
            output.height,
            format,
            TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING,
        ))?;
        let views = ctx
            .create_view(texture, &ViewDesc::new(ViewKind::RenderTarget))
            .and_then(|render_view| {
                match ctx.create_view(texture, &ViewDesc::new(ViewKind::ShaderResource)) {
                    Ok(sampled_view) => Ok((render_view, sampled_view)),
                    Err(err) => {
                        ctx.release(Resource::View(render_view));
                        Err(err)
                    }
                }
            });
        let (render_view, sampled_view) = match views {
            Ok(views) => views,
            Err(err) => {
                ctx.release(Resource::Texture(texture));
                return Err(err);
            }
        };
        Ok(Self {
            width: output.width,
            height: output.height,
            format,
            texture,
            render_view,
            sampled_view,
        })
    }

    fn release(self, ctx: &mut dyn DeviceContext) {
        ctx.release(Resource::View(self.sampled_view));
        ctx.release(Resource::View(self.render_view));
        ctx.release(Resource::Texture(self.texture));
    }
}

/// Two-pass FSR: edge-adaptive upsampling into an intermediate, then sharpening into the output.
#[derive(Debug)]
pub struct FsrUpscaler {
    easu: FullscreenPass,
    rcas: FullscreenPass,
    intermediate: Option<Intermediate>,
}

impl FsrUpscaler {
    pub(super) fn create(ctx: &mut dyn DeviceContext) -> Result<Box<dyn Upscaler>, UpscaleError> {
        let mut easu = FullscreenPass::new(ctx, shaders::fsr_easu())?;
        let rcas = match FullscreenPass::new(ctx, shaders::fsr_rcas()) {
            Ok(pass) => pass,
            Err(err) => {
                easu.release(ctx);
                return Err(err.into());
            }
        };
        Ok(Box::new(Self {
            easu,
            rcas,
            intermediate: None,
        }))
    }

    fn intermediate(
        &mut self,
        ctx: &mut dyn DeviceContext,
        output: &TextureDesc,
    ) -> Result<&Intermediate, DeviceError> {
        if let Some(stale) = self.intermediate.take_if(|current| !current.matches(output)) {
            stale.release(ctx);
        }
        if self.intermediate.is_none() {
            self.intermediate = Some(Intermediate::create(ctx, output)?);
        }
        self.intermediate
            .as_ref()
            .ok_or(DeviceError::Unsupported("FSR intermediate texture"))
    }
}

impl Upscaler for FsrUpscaler {
    fn method(&self) -> UpscaleMethod {
        UpscaleMethod::Fsr
    }

    fn upscale(
        &mut self,
        ctx: &mut dyn DeviceContext,
        input: &UpscaleInput,
        output_viewport: Viewport,
    ) -> Result<(), UpscaleError> {
        let output = super::validate(ctx, input, output_viewport)?;
        let (render_view, sampled_view) = {
            let intermediate = self.intermediate(ctx, &output)?;
            (intermediate.render_view, intermediate.sampled_view)
        };

        let upsample =
            UpscaleConstants::new(input, input.viewport, input.texture_size, output_viewport);
        self.easu.run(
            ctx,
            input.eye,
            &upsample,
            input.view,
            render_view,
            output_viewport,
        )?;

        let sharpen = UpscaleConstants::new(input, output_viewport, output.extent(), output_viewport);
        self.rcas.run(
            ctx,
            input.eye,
            &sharpen,
            sampled_view,
            input.output_view,
            output_viewport,
        )?;
        Ok(())
    }

    fn release(&mut self, ctx: &mut dyn DeviceContext) {
        if let Some(intermediate) = self.intermediate.take() {
            intermediate.release(ctx);
        }
        self.rcas.release(ctx);
        self.easu.release(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockContext, upscaler::tests::upscale_input};
    use glam::UVec2;

    #[test]
    fn upsamples_then_sharpens_through_intermediate() {
        let mut ctx = MockContext::new();
        let input = upscale_input(&mut ctx, UVec2::new(800, 800), UVec2::new(1000, 1000));
        let mut upscaler = FsrUpscaler::create(&mut ctx).unwrap();
        let viewport = Viewport::new(0, 0, 1000, 1000);

        upscaler.upscale(&mut ctx, &input, viewport).unwrap();

        let draws: Vec<_> = ctx.draws().cloned().collect();
        assert_eq!(draws.len(), 2);
        let intermediate = ctx.view_texture(draws[0].render_targets[0].unwrap()).unwrap();
        assert_eq!(ctx.textures[&intermediate].format, TextureFormat::Rgba8Unorm);
        assert_eq!(ctx.view_texture(draws[1].pixel.resources[0].unwrap()), Some(intermediate));
        assert_eq!(draws[1].render_targets[0], Some(input.output_view));
    }

    #[test]
    fn intermediate_follows_output_size() {
        let mut ctx = MockContext::new();
        let small = upscale_input(&mut ctx, UVec2::new(800, 800), UVec2::new(1000, 1000));
        let large = upscale_input(&mut ctx, UVec2::new(800, 800), UVec2::new(1200, 1200));
        let mut upscaler = FsrUpscaler::create(&mut ctx).unwrap();

        upscaler.upscale(&mut ctx, &small, Viewport::new(0, 0, 1000, 1000)).unwrap();
        upscaler.upscale(&mut ctx, &small, Viewport::new(0, 0, 1000, 1000)).unwrap();
        assert_eq!(ctx.textures_created, 1);

        upscaler.upscale(&mut ctx, &large, Viewport::new(0, 0, 1200, 1200)).unwrap();
        assert_eq!(ctx.textures_created, 2);
        assert!(
            ctx.released
                .iter()
                .any(|resource| matches!(resource, Resource::Texture(_)))
        );
    }
}
