//! # foveated_wgpu
//!
//! Post-processing that an interception layer injects into a host application's render loop:
//! radial stencil masking of the periphery, reconstruction of radially compressed renders, and
//! spatial upscaling (FSR, NIS, CAS), with frame-time driven adjustment of the mask radii.
//!
//! The pipeline never owns the host's command stream. The interception layer forwards three host
//! events (depth-stencil clears, pixel-shader sampler binds and per-eye submissions) to a
//! [`PostProcessor`], which issues its work through a [`DeviceContext`] and restores every binding
//! it touched before returning.
//!
//! ## wgpu backend
//! [`WgpuDeviceContext`] reports `supports_sampler_mip_bias() == false`: wgpu samplers carry no
//! LOD bias, so the MIP-bias sampler remap hands the host's samplers back unchanged on that
//! backend. Call [`WgpuDeviceContext::with_adapter_format_features`] to let the reconstruction
//! target use adapter-specific storage formats such as 10-bit `Rgb10a2Unorm`; without it
//! 10-bit input is reconstructed into a 16-bit float target and drawn back.
//!
//! ## API Usage
//! ```rust,ignore
//! use foveated_wgpu::{Config, EyeSubmission, PostProcessor, WgpuDeviceContext};
//!
//! let mut feature_support = foveated_wgpu::FeatureSupport::default();
//! let (device, queue) =
//!     foveated_wgpu::request_device(&adapter, &device_descriptor, &mut feature_support).unwrap();
//! let mut ctx = WgpuDeviceContext::new(device, queue).with_adapter_format_features(&adapter);
//!
//! // Load the configuration once per process
//! let config = Config::load("foveated.json").expect("Failed to load config");
//! let mut post = PostProcessor::new(config);
//!
//! // Render at the reduced resolution while upscaling is on
//! let render_size = post.render_resolution(output_size);
//!
//! // Forward host events
//! post.on_depth_clear(&mut ctx, depth, flags, depth_value, stencil);
//! let samplers = post.on_sampler_bind(&mut ctx, start_slot, &samplers);
//! let outcome = post.on_eye_submit(&mut ctx, &EyeSubmission { ... });
//! // Hand `outcome.viewport` of the output texture to the compositor
//! ```

mod adaptation;
mod config;
mod depth_views;
mod device;
mod eye;
mod initialization;
mod masking;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod post_processor;
mod reconstruction;
mod resources;
mod runtime;
mod sampler_remap;
mod selection;
mod shaders;
mod state_guard;
mod submission;
mod upscaler;
mod wgpu_device;

pub use adaptation::{
    AdaptationController, AdaptationTargets, Adjustment, ControllerState, DynamicTuning,
    FrameBudget, Pressure, RadiusBounds, adjust,
};
pub use config::{
    Config, ConfigError, DynamicConfig, FoveationConfig, HiddenMaskConfig, MaskingMethod,
    UpscaleConfig,
};
pub use depth_views::{DepthViewCache, DepthViews};
pub use device::*;
pub use eye::{DepthGeometry, Eye, EyePlan, GameMode, TextureLayout, UnknownGameMode, resolve_eye};
pub use initialization::{FeatureSupport, InitializationError, request_device};
pub use masking::{MaskConstants, MaskTarget, MaskingPass};
pub use post_processor::{ClearOutcome, PostProcessor};
pub use reconstruction::{ReconstructConstants, ReconstructionInput, reconstruct, workgroups};
pub use resources::{
    CopyTarget, FrameDimensions, FrameResources, MaskResources, Preparation,
    ReconstructionResources, ResourceCache, cache_format, requires_copy,
};
pub use runtime::{FoveationRadii, RadiusChangeFlags, RuntimeState};
pub use sampler_remap::{SamplerRemap, mip_lod_bias};
pub use selection::{DepthClearCounters, TargetSelection, matches_tracked};
pub use state_guard::StateGuard;
pub use submission::{EyeSubmission, SubmissionError, SubmitOutcome, Viewport};
pub use upscaler::{
    FsrUpscaler, UnknownUpscaleMethod, UpscaleError, UpscaleInput, UpscaleMethod, Upscaler,
    create_upscaler, render_resolution,
};
pub use wgpu_device::WgpuDeviceContext;
