use crate::{
    device::{DeviceContext, DeviceError, Resource, TextureDesc, TextureId, ViewDesc, ViewId, ViewKind},
    eye::Eye,
};
use std::collections::HashMap;

/// Depth-stencil views of one host depth texture, one per eye.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthViews {
    views: [ViewId; 2],
    /// Non-array textures use the same view for both eyes.
    shared: bool,
}

impl DepthViews {
    pub fn view(&self, eye: Eye) -> ViewId {
        self.views[eye.index()]
    }

    fn owned(&self) -> &[ViewId] {
        if self.shared {
            &self.views[..1]
        } else {
            &self.views
        }
    }
}

/// Side table from host depth textures to the views the masking pass renders through.
///
/// Keyed by [`TextureId`] only: an entry never keeps the host texture alive. The host reports
/// destruction through [`DepthViewCache::evict`], which releases the views.
#[derive(Debug, Default)]
pub struct DepthViewCache {
    entries: HashMap<TextureId, DepthViews>,
}

impl DepthViewCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, texture: TextureId) -> bool {
        self.entries.contains_key(&texture)
    }

    /// Returns the views of `texture`, creating them on first sight.
    pub fn get_or_create(
        &mut self,
        ctx: &mut dyn DeviceContext,
        texture: TextureId,
        desc: &TextureDesc,
    ) -> Result<DepthViews, DeviceError> {
        if let Some(views) = self.entries.get(&texture) {
            return Ok(*views);
        }

        tracing::info!(
            texture = texture.0,
            format = ?desc.format,
            array_layers = desc.array_layers,
            sample_count = desc.sample_count,
            "creating depth stencil views"
        );
        let views = if desc.is_stereo_array() {
            let left = ctx.create_view(texture, &ViewDesc::layer(ViewKind::DepthStencil, 0))?;
            let right = match ctx.create_view(texture, &ViewDesc::layer(ViewKind::DepthStencil, 1)) {
                Ok(view) => view,
                Err(err) => {
                    ctx.release(Resource::View(left));
                    return Err(err);
                }
            };
            DepthViews {
                views: [left, right],
                shared: false,
            }
        } else {
            let view = ctx.create_view(texture, &ViewDesc::new(ViewKind::DepthStencil))?;
            DepthViews {
                views: [view; 2],
                shared: true,
            }
        };
        self.entries.insert(texture, views);
        Ok(views)
    }

    /// Drops the entry for a destroyed host texture. Returns whether one existed.
    pub fn evict(&mut self, ctx: &mut dyn DeviceContext, texture: TextureId) -> bool {
        match self.entries.remove(&texture) {
            Some(views) => {
                tracing::debug!(texture = texture.0, "releasing depth stencil views");
                for view in views.owned() {
                    ctx.release(Resource::View(*view));
                }
                true
            }
            None => false,
        }
    }

    pub fn release(&mut self, ctx: &mut dyn DeviceContext) {
        for (_, views) in self.entries.drain() {
            for view in views.owned() {
                ctx.release(Resource::View(*view));
            }
        }
    }
}
