//! What the training loop does differently for each scheme.

use embedmem_common::SchemeKind;

/// Trainer-side behaviour of a scheme. Resolved once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainerBehavior {
    /// The layer emits an auxiliary loss that is weighted into the objective.
    pub aux_loss_weight_applies: bool,
    /// Forward passes produce code writes committed after the optimizer step.
    pub commits_codes: bool,
    /// Magnitude pruning runs on the prune schedule.
    pub prunes: bool,
    /// The packed low-bit table is refreshed after every step.
    pub requantizes: bool,
    /// Architecture parameters are optimised by a bilevel search step.
    pub arch_search: bool,
    /// Evaluation can switch to a compressed inference path.
    pub has_compressed_inference: bool,
}

impl TrainerBehavior {
    pub fn for_kind(kind: SchemeKind) -> Self {
        let none = Self::default();
        match kind {
            SchemeKind::Full
            | SchemeKind::Hash
            | SchemeKind::Compositional
            | SchemeKind::Learning
            | SchemeKind::Robe => none,
            SchemeKind::Dpq => Self {
                aux_loss_weight_applies: true,
                commits_codes: true,
                has_compressed_inference: true,
                ..none
            },
            SchemeKind::AutoDim => Self {
                arch_search: true,
                ..none
            },
            SchemeKind::DeepLight => Self {
                prunes: true,
                has_compressed_inference: true,
                ..none
            },
            SchemeKind::Quantized | SchemeKind::Alpt => Self {
                requantizes: true,
                has_compressed_inference: true,
                ..none
            },
        }
    }
}
