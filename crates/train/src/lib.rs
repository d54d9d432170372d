//! # embedmem-train — Training Driver
//!
//! A thin loop around one [`embedmem_core::EmbeddingLayer`]:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`scheme`] | `SchemeKind → TrainerBehavior` table |
//! | [`scheduler`] | learning-rate warmup/decay, DeepLight prune cadence |
//! | [`trainer`] | `Trainer`: step, evaluate, AutoDim search and retrain, save |
//!
//! Per-scheme effects (code commits, pruning, requantization) run only after
//! the optimizer step, in a fixed order.

pub mod scheduler;
pub mod scheme;
pub mod trainer;

pub use scheduler::{LrDecay, LrScheduler, PruneSchedule};
pub use scheme::TrainerBehavior;
pub use trainer::{roc_auc, EvalMetrics, StepMetrics, Trainer, TrainerConfig};
