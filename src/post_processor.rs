use crate::{
    adaptation::AdaptationController,
    config::{Config, MaskingMethod},
    depth_views::DepthViewCache,
    device::{
        ClearFlags, DeviceContext, DeviceError, Resource, SamplerId, TextureDesc, TextureId,
        ViewDesc, ViewId, ViewKind,
    },
    eye::{DepthGeometry, GameMode, resolve_eye},
    masking::{MaskTarget, MaskingPass},
    reconstruction::{ReconstructionInput, reconstruct},
    resources::{FrameResources, Preparation, ReconstructionResources, ResourceCache},
    runtime::RuntimeState,
    sampler_remap::{SamplerRemap, mip_lod_bias},
    selection::matches_tracked,
    shaders,
    submission::{EyeSubmission, SubmitOutcome, Viewport},
    upscaler::{
        self, FullscreenPass, UpscaleConstants, UpscaleError, UpscaleInput, Upscaler,
        create_upscaler,
    },
};
use glam::{UVec2, Vec2};
use std::borrow::Cow;

/// Depth textures known to be unrelated to the eye render.
const IGNORED_DEPTH_LABELS: &[&str] = &["Camera DepthTexture"];

/// Result of [`PostProcessor::on_depth_clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    /// The depth target does not belong to the eye render.
    Ignored,
    /// An eye-render clear that was counted but not masked.
    Skipped,
    /// The mask was drawn.
    Masked,
}

impl ClearOutcome {
    /// Whether the clear matched the tracked eye render.
    pub fn is_handled(self) -> bool {
        self != ClearOutcome::Ignored
    }
}

/// Image the upscaler reads for one submission.
#[derive(Debug, Clone, Copy)]
struct Source {
    view: ViewId,
    size: UVec2,
}

/// Entry point for the interception layer.
///
/// Owns every piece of per-process state: the configuration snapshot, the runtime state the
/// adaptation controller mutates, and all GPU resources. All methods are called from the host's
/// render thread, synchronously with its own commands, and never fail: errors disable the
/// affected feature and the host's frame passes through untouched.
pub struct PostProcessor {
    config: Config,
    config_version: u64,
    runtime: RuntimeState,
    /// Size of the last submitted eye texture. Depth clears are matched against it.
    tracked: Option<UVec2>,
    resources: ResourceCache,
    resources_failed: bool,
    depth_views: DepthViewCache,
    masking: Option<MaskingPass>,
    masking_disabled: bool,
    reconstruction_disabled: bool,
    /// Writes the reconstruction back when its format can't be copied into the input.
    blit: Option<FullscreenPass>,
    upscaler: Option<Box<dyn Upscaler>>,
    samplers: SamplerRemap,
    adaptation: AdaptationController,
}

impl PostProcessor {
    pub fn new(mut config: Config) -> Self {
        config.normalize();
        config.log_summary();
        Self {
            runtime: RuntimeState::new(&config),
            config,
            config_version: 0,
            tracked: None,
            resources: ResourceCache::default(),
            resources_failed: false,
            depth_views: DepthViewCache::default(),
            masking: None,
            masking_disabled: false,
            reconstruction_disabled: false,
            blit: None,
            upscaler: None,
            samplers: SamplerRemap::default(),
            adaptation: AdaptationController::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Incremented by every [`PostProcessor::apply_config`].
    pub fn config_version(&self) -> u64 {
        self.config_version
    }

    pub fn runtime(&self) -> &RuntimeState {
        &self.runtime
    }

    /// Whether foveated rendering should currently be engaged by external consumers.
    pub fn foveation_active(&self) -> bool {
        self.config.fixed_foveated.enabled && self.runtime.foveation_apply
    }

    /// Installs a new configuration snapshot. Radii and apply flags restart from it; the upscaler
    /// and resources follow on the next submission.
    pub fn apply_config(&mut self, mut config: Config) {
        config.normalize();
        config.log_summary();
        self.config = config;
        self.config_version += 1;
        self.runtime.reset_effects(&self.config);
    }

    /// Per-eye projection centers in normalized eye coordinates, as reported by the compositor.
    pub fn set_projection_centers(&mut self, left: Vec2, right: Vec2) {
        self.runtime.projection_centers = [left, right];
    }

    /// Resolution the host should render at for a given output resolution.
    pub fn render_resolution(&self, output: UVec2) -> UVec2 {
        if self.runtime.upscaling_active(&self.config) {
            upscaler::render_resolution(output, self.config.upscaling.render_scale)
        } else {
            output
        }
    }

    /// Called for every host depth-stencil clear, after the clear itself.
    pub fn on_depth_clear(
        &mut self,
        ctx: &mut dyn DeviceContext,
        depth: TextureId,
        flags: ClearFlags,
        depth_value: f32,
        stencil: u8,
    ) -> ClearOutcome {
        let Some((precise, selection)) = self.config.mask_targeting() else {
            return ClearOutcome::Ignored;
        };
        let (Some(tracked), Some(desc)) = (self.tracked, ctx.texture_desc(depth)) else {
            return ClearOutcome::Ignored;
        };
        if !matches_tracked(&desc, tracked, precise) {
            return ClearOutcome::Ignored;
        }
        if desc
            .label
            .as_deref()
            .is_some_and(|label| IGNORED_DEPTH_LABELS.contains(&label))
        {
            return ClearOutcome::Ignored;
        }

        let index = self.runtime.counters.next();
        let previous_max = self.runtime.counters.previous_max();
        if !self.mask_enabled() {
            return ClearOutcome::Skipped;
        }
        if !selection.is_target(index, previous_max) {
            tracing::debug!(index, previous_max, "depth clear not selected for masking");
            return ClearOutcome::Skipped;
        }
        if !desc.format.has_stencil_aspect() {
            tracing::debug!(format = ?desc.format, "depth target has no stencil, not masking");
            return ClearOutcome::Skipped;
        }
        tracing::debug!(index, depth_value, stencil, "masking depth clear");

        match self.draw_mask(ctx, depth, &desc, tracked, flags, stencil) {
            Ok(true) => ClearOutcome::Masked,
            Ok(false) => ClearOutcome::Skipped,
            Err(err) => {
                tracing::error!("masking failed, disabling: {err}");
                self.masking_disabled = true;
                ClearOutcome::Skipped
            }
        }
    }

    fn mask_enabled(&self) -> bool {
        if self.masking_disabled || self.resources_failed {
            return false;
        }
        match self.config.masking_method() {
            Some(MaskingMethod::HiddenArea) => self.runtime.mask_apply,
            Some(MaskingMethod::RadialDensity) => {
                self.runtime.mask_apply && self.runtime.foveation_apply
            }
            None => false,
        }
    }

    /// Returns `Ok(false)` when resources for the current method don't exist yet.
    fn draw_mask(
        &mut self,
        ctx: &mut dyn DeviceContext,
        depth: TextureId,
        desc: &TextureDesc,
        tracked: UVec2,
        flags: ClearFlags,
        stencil: u8,
    ) -> Result<bool, DeviceError> {
        let method = self.config.masking_method();
        let (Some(pass), Some(resources)) = (
            self.masking.as_mut().filter(|pass| Some(pass.method()) == method),
            self.resources.current().and_then(|frame| frame.mask),
        ) else {
            return Ok(false);
        };

        let geometry = DepthGeometry::classify(self.config.game_mode, desc, tracked.x);
        let plan = resolve_eye(
            self.config.game_mode,
            self.runtime.rendering_second_eye,
            geometry,
        );
        let views = self.depth_views.get_or_create(ctx, depth, desc)?;
        // Masked pixels must differ from whatever the host cleared the stencil to.
        let stencil_ref = if flags.contains(ClearFlags::STENCIL) {
            u32::from(!stencil)
        } else {
            0xff
        };
        let target = MaskTarget {
            desc,
            views,
            geometry,
            plan,
            stencil_ref,
        };
        pass.draw(ctx, &resources, &target, &mut self.runtime)?;
        Ok(true)
    }

    /// Called when the host binds pixel-shader samplers. Returns the samplers to bind instead.
    pub fn on_sampler_bind<'a>(
        &mut self,
        ctx: &mut dyn DeviceContext,
        start_slot: u32,
        samplers: &'a [Option<SamplerId>],
    ) -> Cow<'a, [Option<SamplerId>]> {
        if !self.config.upscaling.apply_mip_bias || !self.runtime.upscaling_active(&self.config) {
            if self.samplers.replacements() > 0 {
                self.samplers.clear(ctx);
            }
            return Cow::Borrowed(samplers);
        }
        let remapped = self.samplers.remap(ctx, samplers);
        if let Cow::Owned(_) = remapped {
            tracing::trace!(start_slot, "sampler bind remapped");
        }
        remapped
    }

    /// Called once per eye right before the host hands it to the compositor.
    pub fn on_eye_submit(
        &mut self,
        ctx: &mut dyn DeviceContext,
        submission: &EyeSubmission,
    ) -> SubmitOutcome {
        let outcome = self.process(ctx, submission);
        self.finish_submission(ctx);
        outcome
    }

    fn process(&mut self, ctx: &mut dyn DeviceContext, submission: &EyeSubmission) -> SubmitOutcome {
        let passthrough = SubmitOutcome::passthrough(submission);
        let Some(input) = ctx.texture_desc(submission.input_texture) else {
            tracing::warn!(texture = ?submission.input_texture, "unknown eye texture submitted");
            return passthrough;
        };
        if let Err(err) = submission.validate(&input) {
            tracing::warn!("ignoring eye submission: {err}");
            return passthrough;
        }
        self.tracked = Some(input.extent());

        let method = self.config.masking_method();
        let upscaling = self.runtime.upscaling_active(&self.config);
        if method.is_none() && !upscaling {
            return passthrough;
        }
        if !self.prepare_resources(ctx, &input, method) {
            return passthrough;
        }
        let Some(frame) = self.resources.current() else {
            return passthrough;
        };

        let mut source = Source {
            view: submission.input_view,
            size: input.extent(),
        };
        let reconstruct_active = method == Some(MaskingMethod::RadialDensity)
            && !self.reconstruction_disabled
            && frame.reconstruction.is_some();

        if let Some(copy) = frame.copy.filter(|_| upscaling || reconstruct_active) {
            let copied = if input.sample_count > 1 {
                ctx.resolve_texture(copy.texture, submission.input_texture)
            } else {
                ctx.copy_texture(copy.texture, submission.input_texture)
            };
            if let Err(err) = copied {
                tracing::error!("copying eye texture failed, disabling post-processing: {err}");
                self.resources_failed = true;
                return passthrough;
            }
            source.view = copy.view;
        }

        let mut reconstructed = None;
        if reconstruct_active {
            match self.reconstruct(ctx, frame, submission, source) {
                Ok(resources) => {
                    source.view = resources.sampled_view;
                    reconstructed = Some(resources);
                }
                Err(err) => {
                    tracing::error!("reconstruction failed, disabling: {err}");
                    self.reconstruction_disabled = true;
                }
            }
        }

        if upscaling {
            match self.upscale(ctx, submission, source) {
                Ok(viewport) => {
                    return SubmitOutcome {
                        viewport,
                        upscaled: true,
                    };
                }
                Err(err) => {
                    tracing::error!("upscaling failed, disabling: {err}");
                    self.runtime.upscaling_disabled = true;
                    if let Some(mut upscaler) = self.upscaler.take() {
                        upscaler.release(ctx);
                    }
                    self.samplers.clear(ctx);
                }
            }
        }

        // Without an upscaler to consume it, the reconstructed image replaces the host's.
        if let Some(resources) = reconstructed {
            if let Err(err) = self.write_back(ctx, submission, &input, &resources) {
                tracing::error!("writing back reconstruction failed, disabling: {err}");
                self.reconstruction_disabled = true;
            }
        }
        passthrough
    }

    /// Builds or reuses the frame resources. Returns whether they are usable.
    fn prepare_resources(
        &mut self,
        ctx: &mut dyn DeviceContext,
        input: &TextureDesc,
        method: Option<MaskingMethod>,
    ) -> bool {
        if self.resources_failed {
            return false;
        }
        match self.resources.prepare(ctx, input, method) {
            Ok(Preparation::Reused) => true,
            Ok(Preparation::Rebuilt) => {
                self.masking = method.map(MaskingPass::new);
                let reconstruction_missing = self
                    .resources
                    .current()
                    .is_some_and(|frame| frame.reconstruction.is_none());
                if method == Some(MaskingMethod::RadialDensity) && reconstruction_missing {
                    tracing::error!("no reconstruction target, disabling reconstruction");
                    self.reconstruction_disabled = true;
                }
                true
            }
            Err(err) => {
                tracing::error!("resource creation failed, disabling post-processing: {err}");
                self.resources_failed = true;
                self.masking = None;
                false
            }
        }
    }

    fn reconstruct(
        &self,
        ctx: &mut dyn DeviceContext,
        frame: &FrameResources,
        submission: &EyeSubmission,
        source: Source,
    ) -> Result<ReconstructionResources, DeviceError> {
        let Some(resources) = frame.reconstruction else {
            return Err(DeviceError::Unsupported("reconstruction"));
        };
        reconstruct(
            ctx,
            &resources,
            frame.sampler,
            &ReconstructionInput {
                view: source.view,
                texture_size: source.size,
                viewport: submission.input_viewport,
                eye: submission.eye,
            },
            &self.runtime,
        )?;
        Ok(resources)
    }

    /// Replaces the host's eye with the reconstructed image. A plain copy when the formats allow
    /// it, otherwise a draw into the input.
    fn write_back(
        &mut self,
        ctx: &mut dyn DeviceContext,
        submission: &EyeSubmission,
        input: &TextureDesc,
        resources: &ReconstructionResources,
    ) -> Result<(), DeviceError> {
        if resources.format == input.format.remove_srgb_suffix() {
            return ctx.copy_texture(submission.input_texture, resources.texture);
        }
        let pass = match &mut self.blit {
            Some(pass) => pass,
            slot => slot.insert(FullscreenPass::new(ctx, shaders::blit())?),
        };
        let target =
            ctx.create_view(submission.input_texture, &ViewDesc::new(ViewKind::RenderTarget))?;
        let viewport = submission.input_viewport;
        let constants = UpscaleConstants::blit(viewport, input.extent());
        let drawn = pass.run(
            ctx,
            submission.eye,
            &constants,
            resources.sampled_view,
            target,
            viewport,
        );
        ctx.release(Resource::View(target));
        drawn
    }

    fn upscale(
        &mut self,
        ctx: &mut dyn DeviceContext,
        submission: &EyeSubmission,
        source: Source,
    ) -> Result<Viewport, UpscaleError> {
        let output = ctx
            .texture_desc(submission.output_texture)
            .ok_or(UpscaleError::MissingOutput(submission.output_texture))?;
        let output_viewport = submission.output_viewport(&output);

        let method = self.config.upscaling.method;
        let upscaler = match &mut self.upscaler {
            Some(upscaler) if upscaler.method() == method => upscaler,
            current => {
                if let Some(mut previous) = current.take() {
                    tracing::info!(from = %previous.method(), to = %method, "switching upscaler");
                    previous.release(ctx);
                }
                // Sampler behavior may differ between upscalers.
                self.samplers.clear(ctx);
                current.insert(create_upscaler(ctx, method)?)
            }
        };

        let input = UpscaleInput {
            view: source.view,
            texture_size: source.size,
            viewport: submission.input_viewport,
            output_texture: submission.output_texture,
            output_view: submission.output_view,
            eye: submission.eye,
            projection_center: self.runtime.projection_centers[submission.eye.index()],
            sharpness: self.config.upscaling.sharpness,
            radius: self.config.upscaling.radius,
        };
        upscaler.upscale(ctx, &input, output_viewport)?;

        let bias = mip_lod_bias(output_viewport.width, submission.input_viewport.width);
        self.samplers.set_bias(ctx, bias);
        Ok(output_viewport)
    }

    /// Eye toggling, counter reset and the adaptation tick.
    fn finish_submission(&mut self, ctx: &mut dyn DeviceContext) {
        let frame_complete = self.runtime.rendering_second_eye
            || self.config.game_mode == GameMode::Single;
        self.runtime.rendering_second_eye = !self.runtime.rendering_second_eye;
        if !frame_complete {
            return;
        }
        self.runtime.counters.complete_frame();
        if self.config.dynamic_enabled() {
            let targets = self.config.adaptation_targets();
            self.adaptation.on_frame_complete(
                ctx,
                self.config.dynamic_frames_check,
                &targets,
                &mut self.runtime,
            );
        }
    }

    /// Host resource destruction. Drops any views the pipeline holds on `texture`.
    pub fn on_resource_destroyed(&mut self, ctx: &mut dyn DeviceContext, texture: TextureId) {
        self.depth_views.evict(ctx, texture);
    }

    /// Releases every GPU resource the pipeline created.
    pub fn release(&mut self, ctx: &mut dyn DeviceContext) {
        if let Some(mut upscaler) = self.upscaler.take() {
            upscaler.release(ctx);
        }
        if let Some(mut blit) = self.blit.take() {
            blit.release(ctx);
        }
        self.samplers.clear(ctx);
        self.depth_views.release(ctx);
        self.adaptation.release(ctx);
        self.resources.release(ctx);
        self.masking = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{QueryStatus, RasterViewport, SamplerDesc, TimestampPair, ViewDesc, ViewKind},
        eye::{Eye, TextureLayout},
        mock::MockContext,
        upscaler::UpscaleMethod,
    };
    use wgpu::{TextureFormat, TextureUsages};

    const EYE: u32 = 1000;

    struct Host {
        ctx: MockContext,
        input: TextureId,
        input_view: ViewId,
        output: TextureId,
        output_view: ViewId,
    }

    fn eye_texture() -> TextureDesc {
        TextureDesc::new_2d(
            "eye",
            EYE,
            EYE * 4 / 5,
            TextureFormat::Rgba8Unorm,
            TextureUsages::TEXTURE_BINDING
                | TextureUsages::RENDER_ATTACHMENT
                | TextureUsages::COPY_DST,
        )
    }

    impl Host {
        fn new(output_width: u32) -> Self {
            Self::with_input(output_width, eye_texture())
        }

        fn with_input(output_width: u32, input: TextureDesc) -> Self {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
            let mut ctx = MockContext::new();
            let input = ctx.add_host_texture(input);
            let output = ctx.add_host_texture(TextureDesc::new_2d(
                "output",
                output_width,
                output_width * 4 / 5,
                TextureFormat::Rgba8Unorm,
                TextureUsages::RENDER_ATTACHMENT,
            ));
            Self {
                input_view: ctx.add_host_view(input, ViewDesc::new(ViewKind::ShaderResource)),
                output_view: ctx.add_host_view(output, ViewDesc::new(ViewKind::RenderTarget)),
                ctx,
                input,
                output,
            }
        }

        fn depth(&mut self, label: &str) -> TextureId {
            self.ctx.add_host_texture(TextureDesc::new_2d(
                label,
                EYE,
                EYE * 4 / 5,
                TextureFormat::Depth24PlusStencil8,
                TextureUsages::RENDER_ATTACHMENT,
            ))
        }

        fn submission(&self, eye: Eye) -> EyeSubmission {
            EyeSubmission {
                input_texture: self.input,
                input_view: self.input_view,
                output_texture: self.output,
                output_view: self.output_view,
                input_viewport: Viewport::new(0, 0, EYE, EYE * 4 / 5),
                eye,
                layout: TextureLayout::Separate,
            }
        }

        fn submit(&mut self, processor: &mut PostProcessor, eye: Eye) -> SubmitOutcome {
            let submission = self.submission(eye);
            processor.on_eye_submit(&mut self.ctx, &submission)
        }

        fn clear(&mut self, processor: &mut PostProcessor, depth: TextureId) -> ClearOutcome {
            processor.on_depth_clear(&mut self.ctx, depth, ClearFlags::all(), 1.0, 0)
        }

        /// Mask draws recorded so far, as the depth-stencil view each one targeted.
        fn masked_views(&self) -> Vec<ViewId> {
            self.ctx
                .draws()
                .filter_map(|draw| draw.depth_stencil_view)
                .collect()
        }
    }

    fn hidden_mask(render_only_target: i32) -> Config {
        let mut config = Config::default();
        config.game_mode = GameMode::LeftFirst;
        config.hidden_mask.enabled = true;
        config.hidden_mask.render_only_target = render_only_target;
        config
    }

    fn radial_density() -> Config {
        let mut config = Config::default();
        config.game_mode = GameMode::LeftFirst;
        config.fixed_foveated.enabled = true;
        config
    }

    fn upscaling(method: UpscaleMethod) -> Config {
        let mut config = Config::default();
        config.upscaling.enabled = true;
        config.upscaling.method = method;
        config
    }

    fn anisotropic_sampler(ctx: &mut MockContext) -> SamplerId {
        ctx.create_sampler(&SamplerDesc {
            max_anisotropy: 16,
            lod_max_clamp: 32.0,
            ..SamplerDesc::LINEAR_CLAMP
        })
        .unwrap()
    }

    /// One full frame: `clears` depth clears per eye, left then right.
    fn frame(
        host: &mut Host,
        processor: &mut PostProcessor,
        depth: TextureId,
        clears: u32,
    ) -> Vec<ClearOutcome> {
        let mut outcomes = Vec::new();
        for eye in Eye::BOTH {
            for _ in 0..clears {
                outcomes.push(host.clear(processor, depth));
            }
            host.submit(processor, eye);
        }
        outcomes
    }

    #[test]
    fn clears_before_first_submission_are_ignored() {
        let mut host = Host::new(EYE);
        let mut processor = PostProcessor::new(hidden_mask(0));
        let depth = host.depth("depth");
        assert_eq!(host.clear(&mut processor, depth), ClearOutcome::Ignored);
        assert!(!ClearOutcome::Ignored.is_handled());
    }

    #[test]
    fn render_only_second_clear() {
        let mut host = Host::new(EYE);
        let mut processor = PostProcessor::new(hidden_mask(2));
        let depth = host.depth("depth");
        host.submit(&mut processor, Eye::Left);
        host.submit(&mut processor, Eye::Right);

        for _ in 0..2 {
            let mut outcomes = Vec::new();
            for _ in 0..3 {
                outcomes.push(host.clear(&mut processor, depth));
            }
            host.submit(&mut processor, Eye::Left);
            host.submit(&mut processor, Eye::Right);
            assert_eq!(
                outcomes,
                vec![ClearOutcome::Skipped, ClearOutcome::Masked, ClearOutcome::Skipped]
            );
        }
    }

    #[test]
    fn negative_render_only_targets_last_clear_of_previous_frame() {
        let mut host = Host::new(EYE);
        let mut processor = PostProcessor::new(hidden_mask(-1));
        let depth = host.depth("depth");
        host.submit(&mut processor, Eye::Left);
        host.submit(&mut processor, Eye::Right);

        for _ in 0..3 {
            host.clear(&mut processor, depth);
        }
        host.submit(&mut processor, Eye::Left);
        host.submit(&mut processor, Eye::Right);
        assert_eq!(processor.runtime().counters.previous_max(), 3);

        let outcomes: Vec<_> = (0..3).map(|_| host.clear(&mut processor, depth)).collect();
        assert_eq!(
            outcomes,
            vec![ClearOutcome::Skipped, ClearOutcome::Skipped, ClearOutcome::Masked]
        );
    }

    #[test]
    fn left_first_masks_left_then_right() {
        let mut host = Host::new(EYE);
        let mut processor = PostProcessor::new(hidden_mask(0));
        let depth = host.depth("depth");
        host.submit(&mut processor, Eye::Left);
        host.submit(&mut processor, Eye::Right);

        let outcomes = frame(&mut host, &mut processor, depth, 1);
        assert_eq!(outcomes, vec![ClearOutcome::Masked, ClearOutcome::Masked]);

        let draws: Vec<_> = host.ctx.draws().cloned().collect();
        let buffers: Vec<_> = draws
            .iter()
            .map(|draw| draw.pixel.constant_buffers[0])
            .collect();
        let mask = processor.resources.current().unwrap().mask.unwrap();
        assert_eq!(
            buffers,
            vec![Some(mask.constants[0]), Some(mask.constants[1])]
        );
        assert_eq!(host.masked_views().len(), 2);
        assert_eq!(draws[0].stencil_ref, 0xff);
    }

    #[test]
    fn mismatched_and_blacklisted_depth_targets_are_not_counted() {
        let mut host = Host::new(EYE);
        let mut processor = PostProcessor::new(hidden_mask(0));
        host.submit(&mut processor, Eye::Left);

        let shadow = host.ctx.add_host_texture(TextureDesc::new_2d(
            "shadow",
            2048,
            2048,
            TextureFormat::Depth32Float,
            TextureUsages::RENDER_ATTACHMENT,
        ));
        let unity = host.depth("Camera DepthTexture");
        assert_eq!(host.clear(&mut processor, shadow), ClearOutcome::Ignored);
        assert_eq!(host.clear(&mut processor, unity), ClearOutcome::Ignored);
        assert_eq!(processor.runtime().counters.current(), 0);
    }

    #[test]
    fn depth_without_stencil_is_skipped() {
        let mut host = Host::new(EYE);
        let mut processor = PostProcessor::new(hidden_mask(0));
        host.submit(&mut processor, Eye::Left);
        let depth = host.ctx.add_host_texture(TextureDesc::new_2d(
            "depth",
            EYE,
            EYE * 4 / 5,
            TextureFormat::Depth32Float,
            TextureUsages::RENDER_ATTACHMENT,
        ));
        assert_eq!(host.clear(&mut processor, depth), ClearOutcome::Skipped);
        assert!(host.masked_views().is_empty());
    }

    #[test]
    fn stencil_reference_inverts_cleared_value() {
        let mut host = Host::new(EYE);
        let mut processor = PostProcessor::new(hidden_mask(0));
        host.submit(&mut processor, Eye::Left);
        let depth = host.depth("depth");
        let outcome =
            processor.on_depth_clear(&mut host.ctx, depth, ClearFlags::all(), 1.0, 0x0f);
        assert_eq!(outcome, ClearOutcome::Masked);
        assert_eq!(host.ctx.draws().next().unwrap().stencil_ref, 0xf0);
    }

    #[test]
    fn upscales_combined_layout_and_sets_mip_bias() {
        let mut host = Host::new(2 * EYE);
        let mut config = Config::default();
        config.upscaling.enabled = true;
        config.upscaling.method = UpscaleMethod::Cas;
        let mut processor = PostProcessor::new(config);

        let mut submission = host.submission(Eye::Right);
        submission.layout = TextureLayout::Combined;
        submission.input_viewport = Viewport::new(0, 0, EYE / 2, EYE * 4 / 5);
        let outcome = processor.on_eye_submit(&mut host.ctx, &submission);

        assert!(outcome.upscaled);
        assert_eq!(outcome.viewport, Viewport::new(EYE, 0, EYE, 2 * EYE * 4 / 5));
        assert_eq!(host.ctx.draws().count(), 1);

        let bound = [Some(anisotropic_sampler(&mut host.ctx))];
        let remapped = processor.on_sampler_bind(&mut host.ctx, 0, &bound).into_owned();
        let replacement = remapped[0].unwrap();
        assert_eq!(host.ctx.samplers[&replacement].mip_lod_bias, -1.0);
    }

    #[test]
    fn upscaler_failure_disables_upscaling_and_passes_through() {
        let mut host = Host::new(2 * EYE);
        let mut config = Config::default();
        config.upscaling.enabled = true;
        let mut processor = PostProcessor::new(config);
        host.ctx.bindings.stencil_ref = 3;
        let before = host.ctx.bindings.clone();
        host.ctx.fail_submission = true;

        let outcome = host.submit(&mut processor, Eye::Left);
        assert!(!outcome.upscaled);
        assert_eq!(outcome.viewport, host.submission(Eye::Left).input_viewport);
        assert!(processor.runtime().upscaling_disabled);
        assert_eq!(host.ctx.bindings, before);
        assert_eq!(processor.render_resolution(UVec2::new(2000, 1600)), UVec2::new(2000, 1600));

        host.ctx.fail_submission = false;
        assert!(!host.submit(&mut processor, Eye::Right).upscaled);
    }

    #[test]
    fn resource_failure_is_not_retried() {
        let mut host = Host::new(EYE);
        let mut processor = PostProcessor::new(hidden_mask(0));
        host.ctx.fail_creation = true;
        host.submit(&mut processor, Eye::Left);

        host.ctx.fail_creation = false;
        host.submit(&mut processor, Eye::Right);
        let depth = host.depth("depth");
        assert_eq!(host.clear(&mut processor, depth), ClearOutcome::Skipped);
        assert_eq!(host.ctx.textures_created, 0);
        assert!(processor.resources.current().is_none());
    }

    #[test]
    fn method_change_swaps_upscaler_lazily() {
        let mut host = Host::new(2 * EYE);
        let mut config = Config::default();
        config.upscaling.enabled = true;
        config.upscaling.method = UpscaleMethod::Nis;
        let mut processor = PostProcessor::new(config.clone());
        host.submit(&mut processor, Eye::Left);
        let programs = host.ctx.programs.len();

        config.upscaling.method = UpscaleMethod::Fsr;
        processor.apply_config(config);
        assert_eq!(processor.config_version(), 1);
        assert_eq!(processor.upscaler.as_ref().unwrap().method(), UpscaleMethod::Nis);

        host.submit(&mut processor, Eye::Right);
        assert_eq!(processor.upscaler.as_ref().unwrap().method(), UpscaleMethod::Fsr);
        // Two passes with two programs each replace the single NIS pass.
        assert_eq!(host.ctx.programs.len(), programs + 2);
    }

    #[test]
    fn radial_density_reconstructs_before_upscaling() {
        let mut host = Host::new(2 * EYE);
        let mut config = Config::default();
        config.fixed_foveated.enabled = true;
        config.upscaling.enabled = true;
        config.upscaling.method = UpscaleMethod::Cas;
        let mut processor = PostProcessor::new(config);

        assert!(host.submit(&mut processor, Eye::Left).upscaled);
        let reconstruction = processor.resources.current().unwrap().reconstruction.unwrap();
        assert_eq!(host.ctx.dispatches().count(), 1);
        let draw = host.ctx.draws().last().unwrap();
        assert_eq!(draw.pixel.resources[0], Some(reconstruction.sampled_view));
    }

    #[test]
    fn reconstruction_without_upscaling_writes_back() {
        let mut host = Host::new(EYE);
        let mut config = Config::default();
        config.fixed_foveated.enabled = true;
        let mut processor = PostProcessor::new(config);

        let outcome = host.submit(&mut processor, Eye::Left);
        assert!(!outcome.upscaled);
        let reconstruction = processor.resources.current().unwrap().reconstruction.unwrap();
        assert_eq!(
            host.ctx.copies().collect::<Vec<_>>(),
            vec![(host.input, reconstruction.texture)]
        );
    }

    #[test]
    fn adaptation_runs_on_frame_completion() {
        let mut host = Host::new(EYE);
        let mut config = hidden_mask(0);
        config.hidden_mask.dynamic = true;
        config.hidden_mask.dynamic_change_radius = true;
        config.dynamic_frames_check = 1;
        let mut processor = PostProcessor::new(config);
        host.ctx.timestamp_results = [QueryStatus::Ready(TimestampPair {
            begin: 0,
            end: 20_000_000,
            frequency: 1_000_000_000,
        })]
        .into();

        // First frame starts a sample, second frame ends it.
        let depth = host.depth("depth");
        frame(&mut host, &mut processor, depth, 0);
        frame(&mut host, &mut processor, depth, 0);

        let radius = processor.runtime().edge_radius;
        assert!((radius - (1.15 - 0.01)).abs() < 1e-6, "radius {radius}");
    }

    #[test]
    fn destroyed_depth_textures_drop_their_views() {
        let mut host = Host::new(EYE);
        let mut processor = PostProcessor::new(hidden_mask(0));
        host.submit(&mut processor, Eye::Left);
        let depth = host.depth("depth");
        host.clear(&mut processor, depth);
        assert!(processor.depth_views.contains(depth));

        processor.on_resource_destroyed(&mut host.ctx, depth);
        assert!(!processor.depth_views.contains(depth));
        processor.release(&mut host.ctx);
        assert!(host.ctx.programs.is_empty());
    }

    #[test]
    fn disabling_mip_bias_restores_host_samplers() {
        let mut host = Host::new(2 * EYE);
        let mut config = upscaling(UpscaleMethod::Cas);
        let mut processor = PostProcessor::new(config.clone());
        host.submit(&mut processor, Eye::Left);

        let bound = [Some(anisotropic_sampler(&mut host.ctx)), None];
        let replacement = processor.on_sampler_bind(&mut host.ctx, 0, &bound)[0].unwrap();
        assert_ne!(Some(replacement), bound[0]);

        config.upscaling.apply_mip_bias = false;
        processor.apply_config(config);
        let remapped = processor.on_sampler_bind(&mut host.ctx, 0, &bound);
        assert!(matches!(remapped, Cow::Borrowed(_)));
        assert_eq!(&*remapped, &bound[..]);
        assert!(host.ctx.released.contains(&Resource::Sampler(replacement)));
    }

    #[test]
    fn disabled_upscaling_restores_host_samplers() {
        let mut host = Host::new(2 * EYE);
        let mut processor = PostProcessor::new(upscaling(UpscaleMethod::Cas));
        host.submit(&mut processor, Eye::Left);
        let bound = [Some(anisotropic_sampler(&mut host.ctx))];
        let replacement = processor.on_sampler_bind(&mut host.ctx, 3, &bound)[0].unwrap();

        host.ctx.fail_submission = true;
        host.submit(&mut processor, Eye::Right);
        assert!(processor.runtime().upscaling_disabled);

        let remapped = processor.on_sampler_bind(&mut host.ctx, 3, &bound);
        assert!(matches!(remapped, Cow::Borrowed(_)));
        assert_eq!(&*remapped, &bound[..]);
        assert!(host.ctx.released.contains(&Resource::Sampler(replacement)));
    }

    #[test]
    fn ten_bit_reconstruction_is_drawn_back_into_the_input() {
        let mut host = Host::with_input(
            EYE,
            TextureDesc {
                format: TextureFormat::Rgb10a2Unorm,
                ..eye_texture()
            },
        );
        let mut processor = PostProcessor::new(radial_density());

        assert!(!host.submit(&mut processor, Eye::Left).upscaled);
        assert!(!processor.resources_failed);
        assert!(!processor.reconstruction_disabled);
        let reconstruction = processor.resources.current().unwrap().reconstruction.unwrap();
        assert_eq!(reconstruction.format, TextureFormat::Rgba16Float);
        assert_eq!(host.ctx.dispatches().count(), 1);
        assert_eq!(host.ctx.copies().count(), 0);

        let draw = host.ctx.draws().last().unwrap();
        assert_eq!(draw.pixel.resources[0], Some(reconstruction.sampled_view));
        assert_eq!(draw.viewports, vec![RasterViewport::new(0, 0, EYE, EYE * 4 / 5)]);
        let target = draw.render_targets[0].unwrap();
        assert!(host.ctx.released.contains(&Resource::View(target)));

        let depth = host.depth("depth");
        assert_eq!(host.clear(&mut processor, depth), ClearOutcome::Masked);
    }

    #[test]
    fn missing_reconstruction_target_keeps_masking_and_upscaling() {
        let mut host = Host::new(2 * EYE);
        host.ctx.storage_formats = Some(Vec::new());
        let mut config = radial_density();
        config.upscaling.enabled = true;
        config.upscaling.method = UpscaleMethod::Cas;
        let mut processor = PostProcessor::new(config);

        assert!(host.submit(&mut processor, Eye::Left).upscaled);
        assert!(processor.reconstruction_disabled);
        assert!(!processor.resources_failed);
        assert_eq!(host.ctx.dispatches().count(), 0);
        let depth = host.depth("depth");
        assert_eq!(host.clear(&mut processor, depth), ClearOutcome::Masked);
    }

    #[test]
    fn failed_write_back_disables_only_reconstruction() {
        let mut host = Host::with_input(
            2 * EYE,
            TextureDesc {
                array_layers: 2,
                ..eye_texture()
            },
        );
        let mut processor = PostProcessor::new(radial_density());

        assert!(!host.submit(&mut processor, Eye::Left).upscaled);
        assert!(processor.reconstruction_disabled);
        assert!(!processor.resources_failed);
        assert_eq!(host.ctx.copies().count(), 0);
        let depth = host.depth("depth");
        assert_eq!(host.clear(&mut processor, depth), ClearOutcome::Masked);

        let mut config = radial_density();
        config.upscaling.enabled = true;
        config.upscaling.method = UpscaleMethod::Cas;
        processor.apply_config(config);
        let dispatches = host.ctx.dispatches().count();
        assert!(host.submit(&mut processor, Eye::Right).upscaled);
        assert_eq!(host.ctx.dispatches().count(), dispatches);
    }

    #[test]
    fn multisampled_input_is_resolved_before_upscaling() {
        let mut host = Host::with_input(
            2 * EYE,
            TextureDesc {
                sample_count: 4,
                ..eye_texture()
            },
        );
        let mut processor = PostProcessor::new(upscaling(UpscaleMethod::Cas));

        assert!(host.submit(&mut processor, Eye::Left).upscaled);
        assert!(!processor.resources_failed);
        let copy = processor.resources.current().unwrap().copy.unwrap();
        assert_eq!(host.ctx.resolves().collect::<Vec<_>>(), vec![(copy.texture, host.input)]);
        assert_eq!(host.ctx.copies().count(), 0);
        assert_eq!(host.ctx.draws().last().unwrap().pixel.resources[0], Some(copy.view));
    }
}
