use crate::device::{DeviceContext, Resource, SamplerId};
use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
};

/// MIP LOD bias matching an upscale from `input_width` to `output_width`.
pub fn mip_lod_bias(output_width: u32, input_width: u32) -> f32 {
    -(output_width as f32 / input_width as f32).log2()
}

/// Substitutes host samplers with copies carrying the current MIP LOD bias, so textures rendered at
/// reduced resolution keep the sharpness of the output resolution.
///
/// Replacements are created once per host sampler and bias. Samplers that already carry a bias or
/// do not filter anisotropically are left alone.
#[derive(Debug, Default)]
pub struct SamplerRemap {
    bias: f32,
    pass_through: HashSet<SamplerId>,
    mapped: HashMap<SamplerId, SamplerId>,
}

impl SamplerRemap {
    pub fn bias(&self) -> f32 {
        self.bias
    }

    /// Number of replacement samplers currently alive.
    pub fn replacements(&self) -> usize {
        self.mapped.len()
    }

    /// Installs a new bias. Replacements built for the old one are released.
    pub fn set_bias(&mut self, ctx: &mut dyn DeviceContext, bias: f32) -> bool {
        if bias == self.bias {
            return false;
        }
        tracing::debug!(from = self.bias, to = bias, "MIP LOD bias changed, recreating samplers");
        self.clear(ctx);
        self.bias = bias;
        true
    }

    /// Forgets every decision and releases the replacements.
    pub fn clear(&mut self, ctx: &mut dyn DeviceContext) {
        for (_, replacement) in self.mapped.drain() {
            ctx.release(Resource::Sampler(replacement));
        }
        self.pass_through.clear();
    }

    /// Maps a bind of `samplers` to the samplers that should actually be bound.
    pub fn remap<'a>(
        &mut self,
        ctx: &mut dyn DeviceContext,
        samplers: &'a [Option<SamplerId>],
    ) -> Cow<'a, [Option<SamplerId>]> {
        if self.bias == 0.0 || !ctx.supports_sampler_mip_bias() {
            return Cow::Borrowed(samplers);
        }

        let mut remapped = Cow::Borrowed(samplers);
        for (slot, sampler) in samplers.iter().enumerate() {
            let Some(original) = *sampler else {
                continue;
            };
            if let Some(replacement) = self.replacement(ctx, original) {
                remapped.to_mut()[slot] = Some(replacement);
            }
        }
        remapped
    }

    fn replacement(&mut self, ctx: &mut dyn DeviceContext, original: SamplerId) -> Option<SamplerId> {
        if self.pass_through.contains(&original) {
            return None;
        }
        if let Some(replacement) = self.mapped.get(&original) {
            return Some(*replacement);
        }

        let mut desc = match ctx.sampler_desc(original) {
            Some(desc) if desc.mip_lod_bias == 0.0 && desc.max_anisotropy > 1 => desc,
            _ => {
                self.pass_through.insert(original);
                return None;
            }
        };
        desc.mip_lod_bias = self.bias;
        match ctx.create_sampler(&desc) {
            Ok(replacement) => {
                tracing::info!(
                    original = original.0,
                    bias = self.bias,
                    "creating replacement sampler"
                );
                self.mapped.insert(original, replacement);
                self.pass_through.insert(replacement);
                Some(replacement)
            }
            Err(err) => {
                tracing::warn!(original = original.0, "failed to create replacement sampler: {err}");
                self.pass_through.insert(original);
                None
            }
        }
    }
}
