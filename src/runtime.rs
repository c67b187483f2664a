use crate::{
    config::{Config, MaskingMethod},
    eye::Eye,
    selection::DepthClearCounters,
};
use glam::Vec2;

/// Foveation ring radii, normalized so that 1.0 reaches the middle of the view edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FoveationRadii {
    pub inner: f32,
    pub mid: f32,
    pub outer: f32,
}

impl FoveationRadii {
    /// Moves all three rings together.
    pub fn shift(&mut self, delta: f32) {
        self.inner += delta;
        self.mid += delta;
        self.outer += delta;
    }
}

/// Per-eye "constants are stale" markers, set by radius changes and consumed by the next mask draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadiusChangeFlags([bool; 2]);

impl Default for RadiusChangeFlags {
    fn default() -> Self {
        Self([true; 2])
    }
}

impl RadiusChangeFlags {
    pub fn mark_all(&mut self) {
        self.0 = [true; 2];
    }

    pub fn is_set(&self, eye: Eye) -> bool {
        self.0[eye.index()]
    }

    /// Returns whether `eye` was marked and clears the mark.
    pub fn take(&mut self, eye: Eye) -> bool {
        std::mem::replace(&mut self.0[eye.index()], false)
    }
}

/// Mutable state shared by the orchestrator, masking and the adaptation controller.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeState {
    pub rendering_second_eye: bool,
    pub counters: DepthClearCounters,
    /// Radius beyond which the mask covers everything.
    pub edge_radius: f32,
    /// Whether masking currently draws at all.
    pub mask_apply: bool,
    pub foveation: FoveationRadii,
    /// Whether the foveation effect is currently engaged.
    pub foveation_apply: bool,
    pub radius_changed: RadiusChangeFlags,
    /// Per-eye projection centers in normalized eye coordinates.
    pub projection_centers: [Vec2; 2],
    /// Set after an upscaler failure; wins over the configured enable flag.
    pub upscaling_disabled: bool,
}

impl RuntimeState {
    pub fn new(config: &Config) -> Self {
        let mut state = Self {
            rendering_second_eye: false,
            counters: DepthClearCounters::default(),
            edge_radius: 0.0,
            mask_apply: false,
            foveation: FoveationRadii {
                inner: 0.0,
                mid: 0.0,
                outer: 0.0,
            },
            foveation_apply: false,
            radius_changed: RadiusChangeFlags::default(),
            projection_centers: [Vec2::splat(0.5); 2],
            upscaling_disabled: false,
        };
        state.reset_effects(config);
        state
    }

    /// Re-derives radii and apply flags from a new snapshot. Frame bookkeeping is kept.
    pub fn reset_effects(&mut self, config: &Config) {
        let ffr = &config.fixed_foveated;
        self.foveation = FoveationRadii {
            inner: ffr.inner_radius,
            mid: ffr.mid_radius,
            outer: ffr.outer_radius,
        };
        self.foveation_apply = ffr.enabled;
        match config.masking_method() {
            Some(MaskingMethod::RadialDensity) => {
                self.edge_radius = ffr.edge_radius;
                self.mask_apply = true;
            }
            Some(MaskingMethod::HiddenArea) => {
                self.edge_radius = config.hidden_mask.radius;
                self.mask_apply = true;
            }
            None => {
                self.edge_radius = config.hidden_mask.radius;
                self.mask_apply = false;
            }
        }
        self.radius_changed.mark_all();
    }

    /// Whether the configured upscaler should run this frame.
    pub fn upscaling_active(&self, config: &Config) -> bool {
        config.upscaling.enabled && !self.upscaling_disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_flags_are_consumed_per_eye() {
        let mut flags = RadiusChangeFlags::default();
        assert!(flags.take(Eye::Left));
        assert!(!flags.take(Eye::Left));
        assert!(flags.is_set(Eye::Right));
        flags.mark_all();
        assert!(flags.is_set(Eye::Left));
    }

    #[test]
    fn radial_density_uses_foveation_edge() {
        let mut config = Config::default();
        config.fixed_foveated.enabled = true;
        config.fixed_foveated.edge_radius = 1.3;
        let state = RuntimeState::new(&config);
        assert_eq!(state.edge_radius, 1.3);
        assert!(state.mask_apply && state.foveation_apply);
    }
}
