//! Learning rate schedule.

use kto_common::{SchedulerType, TrainingArgs};

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Learning rate schedule: warmup → cosine / linear / constant decay.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    step: usize,
    lr: f64,
    lr_min: f64,
    warmup_steps: usize,
    max_steps: usize,
    decay: LrDecay,
}

/// Decay mode after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    Cosine,
    Linear,
    None,
}

impl From<SchedulerType> for LrDecay {
    fn from(kind: SchedulerType) -> Self {
        match kind {
            SchedulerType::Cosine => Self::Cosine,
            SchedulerType::Linear => Self::Linear,
            SchedulerType::Constant => Self::None,
        }
    }
}

impl LrScheduler {
    pub fn new(
        lr: f64,
        lr_min: f64,
        warmup_steps: usize,
        max_steps: usize,
        decay: LrDecay,
    ) -> Self {
        Self {
            step: 0,
            lr,
            lr_min,
            warmup_steps,
            max_steps,
            decay,
        }
    }

    /// Schedule for a run of `max_steps` optimiser updates.
    ///
    /// `warmup_steps` wins over `warmup_ratio` when both are set.
    pub fn from_training_args(args: &TrainingArgs, max_steps: usize) -> Self {
        let warmup = if args.warmup_steps > 0 {
            args.warmup_steps
        } else {
            (args.warmup_ratio * max_steps as f64).ceil() as usize
        };
        Self::new(
            args.learning_rate,
            args.min_lr,
            warmup,
            max_steps,
            args.lr_scheduler_type.into(),
        )
    }

    /// Current learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        let step = self.step;

        // Warmup phase: linear ramp from 0 to lr.
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.lr * (step as f64 + 1.0) / self.warmup_steps as f64;
        }

        if self.max_steps == 0 || self.decay == LrDecay::None {
            return self.lr;
        }

        let step = step.min(self.max_steps);
        if step <= self.warmup_steps {
            return self.lr;
        }

        let decay_steps = (self.max_steps - self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;

        match self.decay {
            LrDecay::Cosine => {
                let cos = (std::f64::consts::PI * progress).cos();
                self.lr_min + 0.5 * (self.lr - self.lr_min) * (1.0 + cos)
            }
            LrDecay::Linear => self.lr - (self.lr - self.lr_min) * progress,
            LrDecay::None => self.lr,
        }
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// Jump to `step`, e.g. after resuming from a checkpoint.
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
