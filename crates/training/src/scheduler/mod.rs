use std::f64::consts::PI;

use crate::config::{ScheduleKind, TrainingConfig};

/// Learning rate as a pure function of the update index.
///
/// The only state a schedule has is the step count, which the training state
/// already carries, so resuming needs nothing beyond the restored step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    kind: ScheduleKind,
    base_lr: f64,
    min_lr: f64,
    warmup_steps: u64,
    total_steps: u64,
    power: f64,
}

impl LearningRateSchedule {
    pub fn new(
        kind: ScheduleKind,
        base_lr: f64,
        min_lr: f64,
        warmup_steps: u64,
        total_steps: u64,
        power: f64,
    ) -> Self {
        Self {
            kind,
            base_lr,
            min_lr,
            warmup_steps,
            total_steps: total_steps.max(1),
            power,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.scheduler.strategy,
            config.optimizer.learning_rate,
            config.scheduler.min_lr,
            config.scheduler.warmup_steps,
            config.scheduler_total_steps(),
            config.scheduler.power,
        )
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    /// Rate for the update that takes the model from `step` to `step + 1`.
    pub fn lr_at(&self, step: u64) -> f64 {
        let warms_up = !matches!(self.kind, ScheduleKind::Constant);
        if warms_up && step < self.warmup_steps {
            return self.base_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress =
            (step.saturating_sub(self.warmup_steps) as f64 / decay_steps as f64).clamp(0.0, 1.0);
        let span = self.base_lr - self.min_lr;

        match self.kind {
            ScheduleKind::Constant | ScheduleKind::ConstantWithWarmup => self.base_lr,
            ScheduleKind::LinearWithWarmup => self.min_lr + span * (1.0 - progress),
            ScheduleKind::CosineWithWarmup => {
                self.min_lr + span * 0.5 * (1.0 + (PI * progress).cos())
            }
            ScheduleKind::Polynomial => self.min_lr + span * (1.0 - progress).powf(self.power),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(kind: ScheduleKind) -> LearningRateSchedule {
        LearningRateSchedule::new(kind, 1.0, 0.1, 4, 14, 2.0)
    }

    #[test]
    fn warmup_ramps_linearly_to_base() {
        let sched = schedule(ScheduleKind::LinearWithWarmup);
        assert!((sched.lr_at(0) - 0.25).abs() < 1e-12);
        assert!((sched.lr_at(3) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn decays_reach_min_lr_at_total_steps() {
        for kind in [
            ScheduleKind::LinearWithWarmup,
            ScheduleKind::CosineWithWarmup,
            ScheduleKind::Polynomial,
        ] {
            let sched = schedule(kind);
            assert!((sched.lr_at(4) - 1.0).abs() < 1e-12, "{kind:?}");
            assert!((sched.lr_at(14) - 0.1).abs() < 1e-12, "{kind:?}");
            assert!((sched.lr_at(1_000) - 0.1).abs() < 1e-12, "{kind:?}");
        }
    }

    #[test]
    fn cosine_midpoint_is_halfway() {
        let sched = schedule(ScheduleKind::CosineWithWarmup);
        assert!((sched.lr_at(9) - 0.55).abs() < 1e-12);
    }

    #[test]
    fn constant_ignores_warmup() {
        let sched = schedule(ScheduleKind::Constant);
        assert_eq!(sched.lr_at(0), 1.0);
        assert_eq!(schedule(ScheduleKind::ConstantWithWarmup).lr_at(100), 1.0);
    }

    #[test]
    fn lr_is_a_function_of_step_only() {
        let a = schedule(ScheduleKind::Polynomial);
        let b = schedule(ScheduleKind::Polynomial);
        let forward: Vec<f64> = (0..20).map(|s| a.lr_at(s)).collect();
        let backward: Vec<f64> = (0..20).rev().map(|s| b.lr_at(s)).collect();
        assert!(forward.iter().eq(backward.iter().rev()));
    }
}
