//! Programs injected by the pipeline.

use crate::device::{ProgramDesc, ProgramSlots, ShaderStage};
use wgpu::TextureFormat;

const UPSCALE_COMMON: &str = include_str!("shaders/upscale_common.wgsl");

pub fn fullscreen_vertex() -> ProgramDesc {
    ProgramDesc {
        label: "fullscreen_triangle",
        stage: ShaderStage::Vertex,
        source: include_str!("shaders/fullscreen.wgsl").into(),
        entry_point: "vs_main",
        slots: ProgramSlots::empty(),
    }
}

pub fn hidden_area_mask() -> ProgramDesc {
    ProgramDesc {
        label: "hidden_area_mask",
        stage: ShaderStage::Pixel,
        source: include_str!("shaders/hidden_area_mask.wgsl").into(),
        entry_point: "fs_main",
        slots: ProgramSlots::CONSTANTS,
    }
}

pub fn radial_density_mask() -> ProgramDesc {
    ProgramDesc {
        label: "radial_density_mask",
        stage: ShaderStage::Pixel,
        source: include_str!("shaders/radial_density_mask.wgsl").into(),
        entry_point: "fs_main",
        slots: ProgramSlots::CONSTANTS,
    }
}

/// Formats the reconstruction target may use, in order of preference after the input's own.
pub const STORAGE_FORMATS: [TextureFormat; 3] = [
    TextureFormat::Rgb10a2Unorm,
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba8Unorm,
];

/// WGSL name of a storage texture format, for the formats the reconstruction target may use.
pub fn storage_format_name(format: TextureFormat) -> Option<&'static str> {
    match format {
        TextureFormat::Rgba8Unorm => Some("rgba8unorm"),
        TextureFormat::Rgb10a2Unorm => Some("rgb10a2unorm"),
        TextureFormat::Rgba16Float => Some("rgba16float"),
        _ => None,
    }
}

/// Reconstruction compute program writing into a storage texture of `format`.
pub fn radial_density_reconstruct(storage_format: &str) -> ProgramDesc {
    ProgramDesc {
        label: "radial_density_reconstruct",
        stage: ShaderStage::Compute,
        source: include_str!("shaders/radial_density_reconstruct.wgsl")
            .replace("{{STORAGE_FORMAT}}", storage_format)
            .into(),
        entry_point: "cs_main",
        slots: ProgramSlots::all(),
    }
}

fn upscale_pass(label: &'static str, body: &str) -> ProgramDesc {
    ProgramDesc {
        label,
        stage: ShaderStage::Pixel,
        source: format!("{UPSCALE_COMMON}\n{body}").into(),
        entry_point: "fs_main",
        slots: ProgramSlots::CONSTANTS | ProgramSlots::TEXTURE | ProgramSlots::SAMPLER,
    }
}

pub fn fsr_easu() -> ProgramDesc {
    upscale_pass("fsr_easu", include_str!("shaders/fsr_easu.wgsl"))
}

pub fn fsr_rcas() -> ProgramDesc {
    upscale_pass("fsr_rcas", include_str!("shaders/fsr_rcas.wgsl"))
}

pub fn nis() -> ProgramDesc {
    upscale_pass("nis", include_str!("shaders/nis.wgsl"))
}

pub fn cas() -> ProgramDesc {
    upscale_pass("cas", include_str!("shaders/cas.wgsl"))
}

pub fn blit() -> ProgramDesc {
    upscale_pass("blit", include_str!("shaders/blit.wgsl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstruction_template_is_filled() {
        let program = radial_density_reconstruct("rgb10a2unorm");
        assert!(program.source.contains("texture_storage_2d<rgb10a2unorm, write>"));
        assert!(!program.source.contains("{{"));
        for format in STORAGE_FORMATS {
            assert!(storage_format_name(format).is_some());
        }
    }

    #[test]
    fn upscale_passes_share_bindings() {
        for program in [fsr_easu(), fsr_rcas(), nis(), cas(), blit()] {
            assert!(program.source.contains("struct UpscaleConstants"));
            assert!(program.source.contains("fn fs_main"));
        }
    }
}
