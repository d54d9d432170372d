//! Learning-rate and pruning cadence schedules.

use std::str::FromStr;

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Decay mode after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LrDecay {
    #[default]
    Cosine,
    Linear,
    Constant,
}

impl FromStr for LrDecay {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "linear" => Ok(Self::Linear),
            "constant" | "none" => Ok(Self::Constant),
            other => anyhow::bail!("unknown lr decay '{other}' (cosine | linear | constant)"),
        }
    }
}

/// Learning rate as a function of the optimizer step: linear warmup, then
/// the configured decay towards `lr_min` over the remaining steps.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    lr: f64,
    lr_min: f64,
    warmup_steps: usize,
    max_steps: usize,
    decay: LrDecay,
}

impl LrScheduler {
    pub fn new(lr: f64, lr_min: f64, warmup_steps: usize, max_steps: usize, decay: LrDecay) -> Self {
        Self {
            lr,
            lr_min,
            warmup_steps,
            max_steps,
            decay,
        }
    }

    /// Learning rate for `step` (0-based).
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        if self.max_steps <= self.warmup_steps || self.decay == LrDecay::Constant {
            return self.lr;
        }

        let span = (self.max_steps - self.warmup_steps) as f64;
        let progress = ((step - self.warmup_steps) as f64 / span).min(1.0);
        match self.decay {
            LrDecay::Cosine => {
                let cos = (std::f64::consts::PI * progress).cos();
                self.lr_min + 0.5 * (self.lr - self.lr_min) * (1.0 + cos)
            }
            LrDecay::Linear => self.lr - (self.lr - self.lr_min) * progress,
            LrDecay::Constant => self.lr,
        }
    }
}

// ── Prune Schedule ──────────────────────────────────────────────────────────

/// When DeepLight magnitude pruning runs. The prune *rate* itself ramps
/// inside the layer; this only decides on which steps a prune happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneSchedule {
    /// First step that prunes.
    pub start: usize,
    /// Prune every `every` steps from `start` on; 0 disables pruning.
    pub every: usize,
}

impl Default for PruneSchedule {
    fn default() -> Self {
        Self { start: 0, every: 1 }
    }
}

impl PruneSchedule {
    pub fn should_prune(&self, step: usize) -> bool {
        self.every > 0 && step >= self.start && (step - self.start) % self.every == 0
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
