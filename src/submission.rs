use crate::{
    device::{TextureDesc, TextureId, ViewId},
    eye::{Eye, TextureLayout},
};
use glam::UVec2;
use std::fmt;

/// A pixel rectangle inside a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole of a texture.
    pub fn full(desc: &TextureDesc) -> Self {
        Self::new(0, 0, desc.width, desc.height)
    }

    pub fn offset(&self) -> UVec2 {
        UVec2::new(self.x, self.y)
    }

    pub fn size(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the rectangle lies inside a `width` x `height` texture.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        u64::from(self.x) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(height)
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} at ({}, {})",
            self.width, self.height, self.x, self.y
        )
    }
}

/// One eye (or both, for [`TextureLayout::Combined`]) handed to the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EyeSubmission {
    /// Color texture the host rendered.
    pub input_texture: TextureId,
    /// Shader-resource view of `input_texture`.
    pub input_view: ViewId,
    /// Texture the upscaled image is written to.
    pub output_texture: TextureId,
    /// Render-target view of `output_texture`.
    pub output_view: ViewId,
    /// Region of `input_texture` holding this eye.
    pub input_viewport: Viewport,
    pub eye: Eye,
    pub layout: TextureLayout,
}

/// What the pipeline did with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// Region of the texture the host should submit.
    pub viewport: Viewport,
    /// `true` when the output texture holds the upscaled image; otherwise submit the input unchanged.
    pub upscaled: bool,
}

impl SubmitOutcome {
    pub fn passthrough(submission: &EyeSubmission) -> Self {
        Self {
            viewport: submission.input_viewport,
            upscaled: false,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("unknown texture {0:?}")]
    MissingTexture(TextureId),
    #[error("input viewport is empty")]
    EmptyViewport,
    #[error("input viewport {viewport} exceeds the {width}x{height} input texture")]
    ViewportOutOfBounds {
        viewport: Viewport,
        width: u32,
        height: u32,
    },
}

impl EyeSubmission {
    pub(crate) fn validate(&self, input: &TextureDesc) -> Result<(), SubmissionError> {
        if self.input_viewport.is_empty() {
            return Err(SubmissionError::EmptyViewport);
        }
        if !self.input_viewport.fits(input.width, input.height) {
            return Err(SubmissionError::ViewportOutOfBounds {
                viewport: self.input_viewport,
                width: input.width,
                height: input.height,
            });
        }
        Ok(())
    }

    /// Region of the output texture this eye is upscaled into.
    pub fn output_viewport(&self, output: &TextureDesc) -> Viewport {
        let mut viewport = Viewport::full(output);
        if self.layout == TextureLayout::Combined {
            viewport.width /= 2;
            if self.eye == Eye::Right {
                viewport.x += viewport.width;
            }
        }
        viewport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpu::{TextureFormat, TextureUsages};

    fn submission(eye: Eye, layout: TextureLayout, input_viewport: Viewport) -> EyeSubmission {
        EyeSubmission {
            input_texture: TextureId(1),
            input_view: ViewId(2),
            output_texture: TextureId(3),
            output_view: ViewId(4),
            input_viewport,
            eye,
            layout,
        }
    }

    fn texture(width: u32, height: u32) -> TextureDesc {
        TextureDesc::new_2d(
            "color",
            width,
            height,
            TextureFormat::Rgba8Unorm,
            TextureUsages::RENDER_ATTACHMENT,
        )
    }

    #[test]
    fn combined_layout_splits_output() {
        let output = texture(4000, 2000);
        let right = submission(Eye::Right, TextureLayout::Combined, Viewport::new(1600, 0, 1600, 1600));
        assert_eq!(right.output_viewport(&output), Viewport::new(2000, 0, 2000, 2000));
        let left = submission(Eye::Left, TextureLayout::Combined, Viewport::new(0, 0, 1600, 1600));
        assert_eq!(left.output_viewport(&output), Viewport::new(0, 0, 2000, 2000));
        let separate = submission(Eye::Right, TextureLayout::Separate, Viewport::new(0, 0, 1600, 1600));
        assert_eq!(separate.output_viewport(&output), Viewport::full(&output));
    }

    #[test]
    fn rejects_viewports_outside_the_input() {
        let input = texture(1600, 1600);
        let inside = submission(Eye::Left, TextureLayout::Separate, Viewport::new(0, 0, 1600, 1600));
        assert_eq!(inside.validate(&input), Ok(()));
        let outside = submission(Eye::Left, TextureLayout::Separate, Viewport::new(10, 0, 1600, 1600));
        assert!(matches!(
            outside.validate(&input),
            Err(SubmissionError::ViewportOutOfBounds { .. })
        ));
        let empty = submission(Eye::Left, TextureLayout::Separate, Viewport::new(0, 0, 0, 1600));
        assert_eq!(empty.validate(&input), Err(SubmissionError::EmptyViewport));
    }
}
