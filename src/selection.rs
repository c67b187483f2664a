use crate::device::TextureDesc;
use glam::UVec2;

/// Rules picking which depth clear of a frame receives the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetSelection {
    /// `> 0` masks only that clear (1-based), `< 0` counts back from the previous frame's last clear, `0` masks all.
    pub render_only_target: i32,
    pub ignore_first_target_renders: u32,
    pub ignore_last_target_renders: u32,
}

impl TargetSelection {
    /// Whether clear number `index` (1-based) of the current frame is a mask target.
    ///
    /// `previous_max` is the number of matching clears seen in the previous frame.
    pub fn is_target(&self, index: u32, previous_max: u32) -> bool {
        let index = i64::from(index);
        let previous_max = i64::from(previous_max);
        let only = i64::from(self.render_only_target);

        if only > 0 && index != only {
            return false;
        }
        if only < 0 && previous_max + 1 + only != index {
            return false;
        }
        if index <= i64::from(self.ignore_first_target_renders) {
            return false;
        }
        let ignore_last = i64::from(self.ignore_last_target_renders);
        if ignore_last > 0 && index > previous_max - ignore_last {
            return false;
        }
        true
    }
}

/// Number of matching depth clears in the current frame, and the final count of the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepthClearCounters {
    current: u32,
    previous_max: u32,
}

impl DepthClearCounters {
    /// Counts one more matching clear and returns its 1-based index.
    pub fn next(&mut self) -> u32 {
        self.current += 1;
        self.current
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn previous_max(&self) -> u32 {
        self.previous_max
    }

    pub fn complete_frame(&mut self) {
        self.previous_max = self.current;
        self.current = 0;
    }
}

/// Whether a depth target has the geometry of the tracked per-eye color resolution.
///
/// Precise matching requires the exact size. Otherwise anything at least as large passes, except
/// square targets, which are typically shadow maps.
pub fn matches_tracked(depth: &TextureDesc, tracked: UVec2, precise: bool) -> bool {
    let (width, height) = (depth.width, depth.height);
    if precise {
        return width == tracked.x && height == tracked.y;
    }
    !(width < tracked.x || height < tracked.y || width == height)
}
