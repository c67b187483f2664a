use crate::{
    adaptation::{AdaptationTargets, DynamicTuning, FrameBudget, RadiusBounds},
    eye::GameMode,
    selection::TargetSelection,
    upscaler::UpscaleMethod,
};
use serde::{Deserialize, Deserializer};
use std::{fs, io, path::Path};

/// Lowest accepted render factor (25 % of the output pixel count).
pub const MIN_RENDER_FACTOR: f32 = 0.5;

/// Immutable configuration snapshot.
///
/// Loaded from camelCase JSON. Fields absent from the file keep their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub upscaling: UpscaleConfig,
    pub hidden_mask: HiddenMaskConfig,
    pub fixed_foveated: FoveationConfig,
    pub game_mode: GameMode,
    /// Completed frames between two GPU time samples.
    pub dynamic_frames_check: u32,
    pub debug_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upscaling: UpscaleConfig::default(),
            hidden_mask: HiddenMaskConfig::default(),
            fixed_foveated: FoveationConfig::default(),
            game_mode: GameMode::Auto,
            dynamic_frames_check: 1,
            debug_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpscaleConfig {
    pub enabled: bool,
    pub method: UpscaleMethod,
    /// Per-axis render factor. The file gives the percentage of output pixels instead.
    #[serde(deserialize_with = "percent_to_factor")]
    pub render_scale: f32,
    pub sharpness: f32,
    /// Normalized distance from the projection center inside which the full upscaler runs.
    pub radius: f32,
    pub apply_mip_bias: bool,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: UpscaleMethod::Nis,
            render_scale: 0.83667,
            sharpness: 0.3,
            radius: 0.95,
            apply_mip_bias: true,
        }
    }
}

/// Frame-time driven adjustment of one subsystem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicConfig {
    pub enabled: bool,
    /// Step the radius when set, otherwise toggle the subsystem's apply flag.
    pub change_radius: bool,
    /// Seconds. Zero disables tightening.
    pub target_frame_time: f32,
    /// Seconds. Zero disables relaxation.
    pub margin_frame_time: f32,
    pub min_radius: f32,
    pub increase_radius_step: f32,
    pub decrease_radius_step: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HiddenMaskConfig {
    pub enabled: bool,
    /// Edge radius; also the upper bound for dynamic adjustment.
    pub radius: f32,
    pub precise_resolution: bool,
    pub ignore_first_target_renders: u32,
    pub ignore_last_target_renders: u32,
    pub render_only_target: i32,
    pub dynamic: bool,
    pub dynamic_change_radius: bool,
    #[serde(rename = "targetFPS", deserialize_with = "fps_to_frame_time")]
    pub target_frame_time: f32,
    #[serde(rename = "marginFPS", deserialize_with = "fps_to_frame_time")]
    pub margin_frame_time: f32,
    pub min_radius: f32,
    pub increase_radius_step: f32,
    pub decrease_radius_step: f32,
}

impl Default for HiddenMaskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            radius: 1.15,
            precise_resolution: true,
            ignore_first_target_renders: 0,
            ignore_last_target_renders: 0,
            render_only_target: 0,
            dynamic: false,
            dynamic_change_radius: false,
            target_frame_time: 1.0 / 60.0,
            margin_frame_time: 0.0,
            min_radius: 0.8,
            increase_radius_step: 0.03,
            decrease_radius_step: 0.01,
        }
    }
}

impl HiddenMaskConfig {
    pub fn max_radius(&self) -> f32 {
        self.radius
    }

    pub fn selection(&self) -> TargetSelection {
        TargetSelection {
            render_only_target: self.render_only_target,
            ignore_first_target_renders: self.ignore_first_target_renders,
            ignore_last_target_renders: self.ignore_last_target_renders,
        }
    }

    pub fn dynamic(&self) -> DynamicConfig {
        DynamicConfig {
            enabled: self.dynamic,
            change_radius: self.dynamic_change_radius,
            target_frame_time: self.target_frame_time,
            margin_frame_time: self.margin_frame_time,
            min_radius: self.min_radius,
            increase_radius_step: self.increase_radius_step,
            decrease_radius_step: self.decrease_radius_step,
        }
    }

    pub fn tuning(&self) -> DynamicTuning {
        tuning(&self.dynamic(), self.max_radius())
    }
}

/// Radial-density masking with reconstruction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FoveationConfig {
    pub enabled: bool,
    pub inner_radius: f32,
    pub mid_radius: f32,
    pub outer_radius: f32,
    /// Beyond this radius everything is masked.
    pub edge_radius: f32,
    pub precise_resolution: bool,
    pub ignore_first_target_renders: u32,
    pub ignore_last_target_renders: u32,
    pub render_only_target: i32,
    pub dynamic: bool,
    pub dynamic_change_radius: bool,
    #[serde(rename = "targetFPS", deserialize_with = "fps_to_frame_time")]
    pub target_frame_time: f32,
    #[serde(rename = "marginFPS", deserialize_with = "fps_to_frame_time")]
    pub margin_frame_time: f32,
    pub min_radius: f32,
    pub increase_radius_step: f32,
    pub decrease_radius_step: f32,
}

impl Default for FoveationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            inner_radius: 0.5,
            mid_radius: 0.65,
            outer_radius: 0.8,
            edge_radius: 1.15,
            precise_resolution: true,
            ignore_first_target_renders: 0,
            ignore_last_target_renders: 0,
            render_only_target: 0,
            dynamic: false,
            dynamic_change_radius: false,
            target_frame_time: 1.0 / 60.0,
            margin_frame_time: 0.0,
            min_radius: 0.3,
            increase_radius_step: 0.03,
            decrease_radius_step: 0.01,
        }
    }
}

impl FoveationConfig {
    /// Upper bound of the inner radius under dynamic adjustment.
    pub fn max_radius(&self) -> f32 {
        self.inner_radius
    }

    pub fn selection(&self) -> TargetSelection {
        TargetSelection {
            render_only_target: self.render_only_target,
            ignore_first_target_renders: self.ignore_first_target_renders,
            ignore_last_target_renders: self.ignore_last_target_renders,
        }
    }

    pub fn dynamic(&self) -> DynamicConfig {
        DynamicConfig {
            enabled: self.dynamic,
            change_radius: self.dynamic_change_radius,
            target_frame_time: self.target_frame_time,
            margin_frame_time: self.margin_frame_time,
            min_radius: self.min_radius,
            increase_radius_step: self.increase_radius_step,
            decrease_radius_step: self.decrease_radius_step,
        }
    }

    pub fn tuning(&self) -> DynamicTuning {
        tuning(&self.dynamic(), self.max_radius())
    }
}

fn tuning(dynamic: &DynamicConfig, max_radius: f32) -> DynamicTuning {
    DynamicTuning {
        enabled: dynamic.enabled,
        change_radius: dynamic.change_radius,
        budget: FrameBudget {
            target_frame_time: dynamic.target_frame_time,
            margin_frame_time: dynamic.margin_frame_time,
        },
        bounds: RadiusBounds {
            min: dynamic.min_radius,
            max: max_radius,
            increase_step: dynamic.increase_radius_step,
            decrease_step: dynamic.decrease_radius_step,
        },
    }
}

/// Which masking variant the configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskingMethod {
    /// Stencil out everything beyond the edge radius.
    HiddenArea,
    /// Stencil out a growing fraction of pixels per ring, then reconstruct.
    RadialDensity,
}

/// Error returned by [`Config::from_json_str`] and [`Config::load`].
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(json)?;
        config.normalize();
        Ok(config)
    }

    /// Loads and normalizes a configuration file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => Self::from_json_str(&json),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::error!(path = %path.display(), "config file not found, falling back to defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Brings values into their valid ranges. Idempotent.
    pub fn normalize(&mut self) {
        let upscaling = &mut self.upscaling;
        if upscaling.render_scale < MIN_RENDER_FACTOR {
            tracing::info!("setting render scale to minimum value of 25%");
            upscaling.render_scale = MIN_RENDER_FACTOR;
        }
        upscaling.sharpness = upscaling.sharpness.max(0.0);
        upscaling.radius = upscaling.radius.max(0.0);

        self.hidden_mask.radius = self.hidden_mask.radius.max(0.0);
        if !self.hidden_mask.enabled {
            self.hidden_mask.dynamic = false;
        }
        if !self.fixed_foveated.enabled {
            self.fixed_foveated.dynamic = false;
        }
        if self.hidden_mask.min_radius > self.hidden_mask.max_radius() {
            tracing::warn!(
                min = self.hidden_mask.min_radius,
                max = self.hidden_mask.max_radius(),
                "hidden mask radius bounds out of order, swapping"
            );
            std::mem::swap(&mut self.hidden_mask.min_radius, &mut self.hidden_mask.radius);
        }
        if self.fixed_foveated.min_radius > self.fixed_foveated.max_radius() {
            tracing::warn!(
                min = self.fixed_foveated.min_radius,
                max = self.fixed_foveated.max_radius(),
                "foveation radius bounds out of order, swapping"
            );
            std::mem::swap(
                &mut self.fixed_foveated.min_radius,
                &mut self.fixed_foveated.inner_radius,
            );
        }

        if self.dynamic_frames_check < 1 {
            self.dynamic_frames_check = 1;
        }
    }

    pub fn masking_method(&self) -> Option<MaskingMethod> {
        if self.fixed_foveated.enabled {
            Some(MaskingMethod::RadialDensity)
        } else if self.hidden_mask.enabled {
            Some(MaskingMethod::HiddenArea)
        } else {
            None
        }
    }

    pub fn dynamic_enabled(&self) -> bool {
        self.hidden_mask.dynamic || self.fixed_foveated.dynamic
    }

    pub fn adaptation_targets(&self) -> AdaptationTargets {
        AdaptationTargets {
            mask: self.hidden_mask.tuning(),
            foveation: self.fixed_foveated.tuning(),
        }
    }

    /// Precise-resolution flag and selection rules of the active masking variant.
    pub fn mask_targeting(&self) -> Option<(bool, TargetSelection)> {
        match self.masking_method()? {
            MaskingMethod::RadialDensity => Some((
                self.fixed_foveated.precise_resolution,
                self.fixed_foveated.selection(),
            )),
            MaskingMethod::HiddenArea => Some((
                self.hidden_mask.precise_resolution,
                self.hidden_mask.selection(),
            )),
        }
    }

    pub fn log_summary(&self) {
        let toggle = |on: bool| if on { "enabled" } else { "disabled" };
        let upscaling = &self.upscaling;
        tracing::info!("upscaling is {}", toggle(upscaling.enabled));
        if upscaling.enabled {
            tracing::info!(
                method = %upscaling.method,
                render_scale_percent = upscaling.render_scale * upscaling.render_scale * 100.0,
                render_factor = upscaling.render_scale,
                sharpness = upscaling.sharpness,
                radius = upscaling.radius,
                mip_bias = toggle(upscaling.apply_mip_bias),
            );
        }
        tracing::info!(game_mode = %self.game_mode);
        if self.dynamic_enabled() {
            tracing::info!(dynamic_frames_check = self.dynamic_frames_check);
        }

        let ffr = &self.fixed_foveated;
        tracing::info!("fixed foveated rendering is {}", toggle(ffr.enabled));
        if ffr.enabled {
            tracing::info!(
                inner = ffr.inner_radius,
                mid = ffr.mid_radius,
                outer = ffr.outer_radius,
                edge = ffr.edge_radius,
                precise_resolution = ffr.precise_resolution,
                ignore_first = ffr.ignore_first_target_renders,
                ignore_last = ffr.ignore_last_target_renders,
                render_only = ffr.render_only_target,
            );
            log_dynamic(&ffr.dynamic());
        }

        let mask = &self.hidden_mask;
        tracing::info!("hidden radial mask is {}", toggle(mask.enabled));
        if mask.enabled {
            tracing::info!(
                radius = mask.radius,
                precise_resolution = mask.precise_resolution,
                ignore_first = mask.ignore_first_target_renders,
                ignore_last = mask.ignore_last_target_renders,
                render_only = mask.render_only_target,
            );
            log_dynamic(&mask.dynamic());
        }
        tracing::info!("debug mode is {}", toggle(self.debug_mode));
    }
}

fn log_dynamic(dynamic: &DynamicConfig) {
    if !dynamic.enabled {
        return;
    }
    let fps = |frame_time: f32| {
        if frame_time > 0.0 {
            1.0 / frame_time
        } else {
            0.0
        }
    };
    tracing::info!(
        target_fps = fps(dynamic.target_frame_time),
        margin_fps = fps(dynamic.margin_frame_time),
        change_radius = dynamic.change_radius,
        min_radius = dynamic.min_radius,
        increase_step = dynamic.increase_radius_step,
        decrease_step = dynamic.decrease_radius_step,
        "dynamic adjustment"
    );
}

fn percent_to_factor<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    let percent = f32::deserialize(deserializer)?;
    Ok((percent.max(0.0) / 100.0).sqrt())
}

fn fps_to_frame_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    let fps = f32::deserialize(deserializer)?;
    Ok(if fps > 0.0 { 1.0 / fps } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_json_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.masking_method(), None);
    }

    #[test]
    fn file_units_are_converted() {
        let config = Config::from_json_str(
            r#"{
                "upscaling": { "enabled": true, "method": "FSR", "renderScale": 49, "sharpness": -1 },
                "hiddenMask": { "enabled": true, "dynamic": true, "targetFPS": 90, "marginFPS": 0 },
                "gameMode": "right",
                "dynamicFramesCheck": 0
            }"#,
        )
        .unwrap();
        assert_eq!(config.upscaling.method, UpscaleMethod::Fsr);
        assert!((config.upscaling.render_scale - 0.7).abs() < 1e-6);
        assert_eq!(config.upscaling.sharpness, 0.0);
        assert!((config.hidden_mask.target_frame_time - 1.0 / 90.0).abs() < 1e-6);
        assert_eq!(config.hidden_mask.margin_frame_time, 0.0);
        assert_eq!(config.game_mode, GameMode::RightFirst);
        assert_eq!(config.dynamic_frames_check, 1);
        assert_eq!(config.masking_method(), Some(MaskingMethod::HiddenArea));
    }

    #[test]
    fn render_scale_is_clamped() {
        let config = Config::from_json_str(r#"{ "upscaling": { "renderScale": 10 } }"#).unwrap();
        assert_eq!(config.upscaling.render_scale, MIN_RENDER_FACTOR);
    }

    #[test]
    fn unknown_strings_fall_back() {
        let config =
            Config::from_json_str(r#"{ "upscaling": { "method": "dlss" }, "gameMode": "?" }"#)
                .unwrap();
        assert_eq!(config.upscaling.method, UpscaleMethod::Nis);
        assert_eq!(config.game_mode, GameMode::Auto);
    }

    #[test]
    fn foveation_selects_radial_density_and_swaps_bounds() {
        let config = Config::from_json_str(
            r#"{
                "hiddenMask": { "enabled": true },
                "fixedFoveated": { "enabled": true, "dynamic": true, "innerRadius": 0.2, "minRadius": 0.4 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.masking_method(), Some(MaskingMethod::RadialDensity));
        assert_eq!(config.fixed_foveated.min_radius, 0.2);
        assert_eq!(config.fixed_foveated.max_radius(), 0.4);
        assert!(config.dynamic_enabled());
    }

    #[test]
    fn dynamic_requires_enabled_section() {
        let config =
            Config::from_json_str(r#"{ "hiddenMask": { "enabled": false, "dynamic": true } }"#)
                .unwrap();
        assert!(!config.dynamic_enabled());
    }

    #[test]
    fn parse_errors_surface() {
        assert!(matches!(
            Config::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load("/nonexistent/foveated_wgpu.json").unwrap();
        assert_eq!(config, Config::default());
    }
}
