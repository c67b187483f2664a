use crate::device::TextureDesc;
use serde::Deserialize;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eye {
    Left = 0,
    Right = 1,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn other(self) -> Eye {
        match self {
            Eye::Left => Eye::Right,
            Eye::Right => Eye::Left,
        }
    }
}

/// How the host renders its two eyes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(from = "String")]
pub enum GameMode {
    /// Infer from render order and depth-buffer geometry.
    #[default]
    Auto,
    /// Both eyes share one side-by-side depth buffer, one clear per frame.
    Single,
    /// Separate per-eye renders, left eye first.
    LeftFirst,
    /// Separate per-eye renders, right eye first.
    RightFirst,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown game mode {0:?}")]
pub struct UnknownGameMode(pub String);

impl FromStr for GameMode {
    type Err = UnknownGameMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(GameMode::Auto),
            "single" => Ok(GameMode::Single),
            "left" => Ok(GameMode::LeftFirst),
            "right" => Ok(GameMode::RightFirst),
            _ => Err(UnknownGameMode(s.to_owned())),
        }
    }
}

impl From<String> for GameMode {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|err| {
            tracing::warn!("{err}, falling back to auto");
            GameMode::Auto
        })
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GameMode::Auto => "auto",
            GameMode::Single => "single",
            GameMode::LeftFirst => "left",
            GameMode::RightFirst => "right",
        })
    }
}

/// Whether both eyes of a submission live in one texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureLayout {
    #[default]
    Separate,
    /// Side by side, left eye in the left half.
    Combined,
}

/// Shape of a depth target relative to the tracked per-eye resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepthGeometry {
    /// Both eyes share the texture horizontally.
    pub side_by_side: bool,
    /// One eye per array layer.
    pub array: bool,
}

impl DepthGeometry {
    pub fn classify(mode: GameMode, depth: &TextureDesc, tracked_width: u32) -> Self {
        Self {
            side_by_side: mode == GameMode::Single
                || depth.width >= tracked_width.saturating_mul(2),
            array: depth.is_stereo_array(),
        }
    }

    pub fn is_stereo(&self) -> bool {
        self.side_by_side || self.array
    }
}

/// Which eye (or eyes) a depth clear belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EyePlan {
    Single(Eye),
    /// Draw left then right into the same target.
    Both,
}

impl EyePlan {
    pub fn eyes(self) -> &'static [Eye] {
        match self {
            EyePlan::Single(Eye::Left) => &[Eye::Left],
            EyePlan::Single(Eye::Right) => &[Eye::Right],
            EyePlan::Both => &Eye::BOTH,
        }
    }
}

/// Derives the current eye from the game mode, the second-eye flag and the depth target's geometry.
///
/// Stereo geometry always means both eyes. Otherwise exactly one rule applies per mode.
pub fn resolve_eye(mode: GameMode, rendering_second_eye: bool, geometry: DepthGeometry) -> EyePlan {
    if geometry.is_stereo() {
        return EyePlan::Both;
    }
    let first = match mode {
        GameMode::RightFirst => Eye::Right,
        GameMode::Auto | GameMode::Single | GameMode::LeftFirst => Eye::Left,
    };
    EyePlan::Single(if rendering_second_eye {
        first.other()
    } else {
        first
    })
}
