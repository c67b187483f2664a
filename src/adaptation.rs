//! Frame-time driven adjustment of mask and foveation radii.
//!
//! Every `dynamicFramesCheck` completed frames the controller brackets one frame with a pair of GPU
//! timestamps, waits for the result, and nudges each dynamically configured subsystem one step
//! toward the frame budget.

use crate::{
    device::{DeviceContext, QueryId, QueryStatus},
    runtime::RuntimeState,
};
use std::{thread, time::Duration};

/// Target and margin frame times in seconds. Between the two nothing changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameBudget {
    /// Zero disables tightening.
    pub target_frame_time: f32,
    /// Zero disables relaxation.
    pub margin_frame_time: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    OverBudget,
    DeadBand,
    UnderMargin,
}

impl FrameBudget {
    pub fn classify(&self, frame_time: f32) -> Pressure {
        if self.target_frame_time > 0.0 && frame_time > self.target_frame_time {
            Pressure::OverBudget
        } else if frame_time < self.margin_frame_time {
            Pressure::UnderMargin
        } else {
            Pressure::DeadBand
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusBounds {
    pub min: f32,
    pub max: f32,
    pub increase_step: f32,
    pub decrease_step: f32,
}

impl RadiusBounds {
    /// One step toward `min`, never past it. A radius already below `min` stays put.
    pub fn shrink(&self, radius: f32) -> f32 {
        if radius <= self.min {
            radius
        } else {
            (radius - self.decrease_step.max(0.0)).max(self.min)
        }
    }

    /// One step toward `max`, never past it. A radius already above `max` stays put.
    pub fn grow(&self, radius: f32) -> f32 {
        if radius >= self.max {
            radius
        } else {
            (radius + self.increase_step.max(0.0)).min(self.max)
        }
    }
}

/// Dynamic settings of one subsystem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicTuning {
    pub enabled: bool,
    pub change_radius: bool,
    pub budget: FrameBudget,
    pub bounds: RadiusBounds,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    None,
    Radius(f32),
    /// New value of the subsystem's apply flag.
    Apply(bool),
}

/// Decides how one subsystem reacts to a measured frame time.
pub fn adjust(tuning: &DynamicTuning, radius: f32, frame_time: f32) -> Adjustment {
    if !tuning.enabled {
        return Adjustment::None;
    }
    let adjustment = match (tuning.budget.classify(frame_time), tuning.change_radius) {
        (Pressure::DeadBand, _) => return Adjustment::None,
        (Pressure::OverBudget, true) => Adjustment::Radius(tuning.bounds.shrink(radius)),
        (Pressure::UnderMargin, true) => Adjustment::Radius(tuning.bounds.grow(radius)),
        (Pressure::OverBudget, false) => Adjustment::Apply(true),
        (Pressure::UnderMargin, false) => Adjustment::Apply(false),
    };
    match adjustment {
        Adjustment::Radius(new) if new == radius => Adjustment::None,
        other => other,
    }
}

/// Dynamic settings of both subsystems, taken from the current configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptationTargets {
    /// Drives the mask edge radius and mask apply flag.
    pub mask: DynamicTuning,
    /// Drives the foveation radii and foveation apply flag.
    pub foveation: DynamicTuning,
}

impl AdaptationTargets {
    /// Applies one GPU frame-time sample to the runtime state.
    pub fn apply(&self, frame_time: f32, state: &mut RuntimeState) {
        match adjust(&self.mask, state.edge_radius, frame_time) {
            Adjustment::Radius(radius) => {
                tracing::debug!(from = state.edge_radius, to = radius, frame_time, "mask edge radius");
                state.edge_radius = radius;
                state.radius_changed.mark_all();
            }
            Adjustment::Apply(apply) => state.mask_apply = apply,
            Adjustment::None => {}
        }

        match adjust(&self.foveation, state.foveation.inner, frame_time) {
            Adjustment::Radius(inner) => {
                tracing::debug!(from = state.foveation.inner, to = inner, frame_time, "foveation radii");
                state.foveation.shift(inner - state.foveation.inner);
                state.radius_changed.mark_all();
            }
            Adjustment::Apply(apply) => state.foveation_apply = apply,
            Adjustment::None => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Counting completed frames until the next sample.
    Idle { frames: u32 },
    /// Start timestamp issued; the end goes in at the next frame completion.
    Sampling(QueryId),
}

/// Runs the sampling cycle. Ticked once per completed frame.
#[derive(Debug)]
pub struct AdaptationController {
    state: ControllerState,
    query: Option<QueryId>,
    failed: bool,
    poll_interval: Duration,
}

impl Default for AdaptationController {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl AdaptationController {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: ControllerState::Idle { frames: 0 },
            query: None,
            failed: false,
            poll_interval,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Ends a running sample, applies its result, then starts the next one once `frames_check`
    /// frames have completed since the last.
    pub fn on_frame_complete(
        &mut self,
        ctx: &mut dyn DeviceContext,
        frames_check: u32,
        targets: &AdaptationTargets,
        state: &mut RuntimeState,
    ) {
        if self.failed {
            return;
        }

        if let ControllerState::Sampling(query) = self.state {
            self.state = ControllerState::Idle { frames: 0 };
            match ctx.end_timestamp(query) {
                Ok(()) => {
                    if let Some(frame_time) = self.wait_for_sample(ctx, query) {
                        targets.apply(frame_time, state);
                    }
                }
                Err(err) => tracing::warn!("failed to end frame timing: {err}"),
            }
        }

        if let ControllerState::Idle { frames } = &mut self.state {
            *frames += 1;
            if *frames >= frames_check.max(1) {
                self.start_sample(ctx);
            }
        }
    }

    fn start_sample(&mut self, ctx: &mut dyn DeviceContext) {
        let query = match self.query {
            Some(query) => query,
            None => match ctx.create_timestamp_query() {
                Ok(query) => *self.query.insert(query),
                Err(err) => {
                    tracing::error!("failed to create timestamp query, dynamic adjustment disabled: {err}");
                    self.failed = true;
                    return;
                }
            },
        };
        match ctx.begin_timestamp(query) {
            Ok(()) => self.state = ControllerState::Sampling(query),
            Err(err) => tracing::warn!("failed to begin frame timing: {err}"),
        }
    }

    /// Blocks until the sample resolves. Returns the frame time in seconds, or `None` for a
    /// disjoint sample.
    fn wait_for_sample(&self, ctx: &mut dyn DeviceContext, query: QueryId) -> Option<f32> {
        ctx.flush();
        loop {
            match ctx.read_timestamp(query) {
                QueryStatus::Pending => thread::sleep(self.poll_interval),
                QueryStatus::Disjoint => {
                    tracing::warn!("disjoint timestamp sample discarded");
                    return None;
                }
                QueryStatus::Ready(pair) => {
                    if pair.frequency == 0 || pair.end < pair.begin {
                        tracing::warn!(?pair, "invalid timestamp sample discarded");
                        return None;
                    }
                    return Some((pair.end - pair.begin) as f32 / pair.frequency as f32);
                }
            }
        }
    }

    pub fn release(&mut self, ctx: &mut dyn DeviceContext) {
        if let Some(query) = self.query.take() {
            ctx.release(query.into());
        }
        self.state = ControllerState::Idle { frames: 0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        device::TimestampPair,
        eye::Eye,
        mock::{Command, MockContext},
    };
    use proptest::prelude::*;

    fn tuning(change_radius: bool) -> DynamicTuning {
        DynamicTuning {
            enabled: true,
            change_radius,
            budget: FrameBudget {
                target_frame_time: 1.0 / 90.0,
                margin_frame_time: 1.0 / 100.0,
            },
            bounds: RadiusBounds {
                min: 0.8,
                max: 1.15,
                increase_step: 0.03,
                decrease_step: 0.01,
            },
        }
    }

    fn ready(seconds: f64) -> QueryStatus {
        QueryStatus::Ready(TimestampPair {
            begin: 1_000,
            end: 1_000 + (seconds * 1e9) as u64,
            frequency: 1_000_000_000,
        })
    }

    #[test]
    fn dead_band_changes_nothing() {
        assert_eq!(adjust(&tuning(true), 1.0, 1.0 / 95.0), Adjustment::None);
    }

    #[test]
    fn radius_and_apply_modes() {
        assert_eq!(adjust(&tuning(true), 1.0, 0.02), Adjustment::Radius(0.99));
        assert_eq!(adjust(&tuning(true), 0.8, 0.02), Adjustment::None);
        assert_eq!(adjust(&tuning(false), 1.0, 0.02), Adjustment::Apply(true));
        assert_eq!(adjust(&tuning(false), 1.0, 0.005), Adjustment::Apply(false));
    }

    #[test]
    fn zero_margin_never_relaxes() {
        let mut tuning = tuning(true);
        tuning.budget.margin_frame_time = 0.0;
        assert_eq!(adjust(&tuning, 1.0, 0.0001), Adjustment::None);
    }

    #[test]
    fn samples_every_nth_frame_and_applies_result() {
        let mut config = Config::default();
        config.hidden_mask.enabled = true;
        config.hidden_mask.dynamic = true;
        config.hidden_mask.dynamic_change_radius = true;
        let targets = AdaptationTargets {
            mask: config.hidden_mask.tuning(),
            foveation: config.fixed_foveated.tuning(),
        };
        let mut state = RuntimeState::new(&config);
        state.radius_changed.take(Eye::Left);
        state.radius_changed.take(Eye::Right);

        let mut ctx = MockContext::new();
        ctx.timestamp_results = [QueryStatus::Pending, QueryStatus::Pending, ready(0.02)].into();
        let mut controller = AdaptationController::new(Duration::ZERO);

        controller.on_frame_complete(&mut ctx, 2, &targets, &mut state);
        assert_eq!(controller.state(), ControllerState::Idle { frames: 1 });
        controller.on_frame_complete(&mut ctx, 2, &targets, &mut state);
        assert!(matches!(controller.state(), ControllerState::Sampling(_)));
        controller.on_frame_complete(&mut ctx, 2, &targets, &mut state);

        assert!((state.edge_radius - 1.14).abs() < 1e-6);
        assert!(state.radius_changed.is_set(Eye::Left));
        assert!(state.radius_changed.is_set(Eye::Right));
        assert!(ctx.timestamp_results.is_empty());
        assert_eq!(controller.state(), ControllerState::Idle { frames: 1 });
        let ends = ctx
            .commands
            .iter()
            .filter(|command| matches!(command, Command::EndTimestamp(_)))
            .count();
        assert_eq!(ends, 1);
    }

    #[test]
    fn disjoint_sample_is_discarded() {
        let mut config = Config::default();
        config.fixed_foveated.enabled = true;
        config.fixed_foveated.dynamic = true;
        let targets = AdaptationTargets {
            mask: config.hidden_mask.tuning(),
            foveation: config.fixed_foveated.tuning(),
        };
        let mut state = RuntimeState::new(&config);
        state.foveation_apply = false;
        let mut ctx = MockContext::new();
        ctx.timestamp_results = [QueryStatus::Disjoint].into();
        let mut controller = AdaptationController::new(Duration::ZERO);

        controller.on_frame_complete(&mut ctx, 1, &targets, &mut state);
        controller.on_frame_complete(&mut ctx, 1, &targets, &mut state);
        assert!(!state.foveation_apply);
        assert!(matches!(controller.state(), ControllerState::Sampling(_)));
    }

    #[test]
    fn zero_frequency_sample_is_discarded() {
        let mut config = Config::default();
        config.hidden_mask.enabled = true;
        config.hidden_mask.dynamic = true;
        config.hidden_mask.dynamic_change_radius = true;
        let targets = AdaptationTargets {
            mask: config.hidden_mask.tuning(),
            foveation: config.fixed_foveated.tuning(),
        };
        let mut state = RuntimeState::new(&config);
        let radius = state.edge_radius;
        let mut ctx = MockContext::new();
        ctx.timestamp_results = [QueryStatus::Ready(TimestampPair {
            begin: 0,
            end: 20_000_000,
            frequency: 0,
        })]
        .into();
        let mut controller = AdaptationController::new(Duration::ZERO);

        controller.on_frame_complete(&mut ctx, 1, &targets, &mut state);
        controller.on_frame_complete(&mut ctx, 1, &targets, &mut state);
        assert_eq!(state.edge_radius, radius);
    }

    #[test]
    fn query_creation_failure_disables_controller() {
        let targets = AdaptationTargets {
            mask: tuning(true),
            foveation: tuning(true),
        };
        let mut state = RuntimeState::new(&Config::default());
        let mut ctx = MockContext::new();
        ctx.fail_creation = true;
        let mut controller = AdaptationController::new(Duration::ZERO);
        controller.on_frame_complete(&mut ctx, 1, &targets, &mut state);
        ctx.fail_creation = false;
        controller.on_frame_complete(&mut ctx, 1, &targets, &mut state);
        assert!(ctx.commands.is_empty());
    }

    #[test]
    fn foveation_radii_move_together() {
        let mut config = Config::default();
        config.fixed_foveated.enabled = true;
        config.fixed_foveated.dynamic = true;
        config.fixed_foveated.dynamic_change_radius = true;
        let targets = AdaptationTargets {
            mask: config.hidden_mask.tuning(),
            foveation: config.fixed_foveated.tuning(),
        };
        let mut state = RuntimeState::new(&config);
        targets.apply(0.05, &mut state);
        assert!((state.foveation.inner - 0.49).abs() < 1e-6);
        assert!((state.foveation.mid - 0.64).abs() < 1e-6);
        assert!((state.foveation.outer - 0.79).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn radius_stays_in_bounds_and_steps_are_bounded(
            samples in prop::collection::vec(0.0f32..0.05, 1..64),
            start in 0.8f32..=1.15,
        ) {
            let tuning = tuning(true);
            let mut radius = start;
            for frame_time in samples {
                let next = match adjust(&tuning, radius, frame_time) {
                    Adjustment::Radius(next) => next,
                    _ => radius,
                };
                prop_assert!(next >= tuning.bounds.min && next <= tuning.bounds.max);
                let step = tuning.bounds.increase_step.max(tuning.bounds.decrease_step);
                prop_assert!((next - radius).abs() <= step + 1e-6);
                radius = next;
            }
        }
    }
}
