//! Trainer: one embedding layer, a logistic CTR head and the optimiser.
//!
//! The compute graph (layer forward, head, loss) is kept apart from the
//! optimisation step (backward, clipping, AdamW) and from the per-scheme
//! side effects that must only happen after the weights have moved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{loss, ops, AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use embedmem_common::{batch_to_tensors, CtrBatch, EmbeddingConfig, SchemeConfig};
use embedmem_core::{compression_stats, perturb, AutoDimEmbedding, CodeUpdate, EmbeddingLayer};

use crate::scheduler::{LrDecay, LrScheduler, PruneSchedule};
use crate::scheme::TrainerBehavior;

const EMBED_PREFIX: &str = "embed";
const HEAD_PREFIX: &str = "head";

// ── Config ──────────────────────────────────────────────────────────────────

/// Optimisation hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub max_steps: usize,
    pub lr: f64,
    pub lr_min: f64,
    pub lr_warmup_steps: usize,
    pub lr_decay: LrDecay,
    pub weight_decay: f64,
    /// Global L2 clipping threshold; 0 disables clipping.
    pub grad_clip_max_norm: f64,
    pub prune: PruneSchedule,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            max_steps: 1000,
            lr: 1e-3,
            lr_min: 1e-5,
            lr_warmup_steps: 0,
            lr_decay: LrDecay::Constant,
            weight_decay: 0.0,
            grad_clip_max_norm: 0.0,
            prune: PruneSchedule::default(),
            output_dir: PathBuf::from("checkpoints"),
        }
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    /// Total objective, auxiliary term included.
    pub loss: f32,
    pub aux_loss: Option<f32>,
    pub lr: f64,
    /// Gradient norm before clipping.
    pub grad_norm: f64,
}

/// Averages over an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub auc: f64,
    pub examples: usize,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct Trainer {
    layer: EmbeddingLayer,
    head: Linear,
    varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    behavior: TrainerBehavior,
    embed_config: EmbeddingConfig,
    pub config: TrainerConfig,
    pub global_step: usize,
    device: Device,
}

impl Trainer {
    pub fn new(
        embed_config: EmbeddingConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = EmbeddingLayer::new(&embed_config, vb.pp(EMBED_PREFIX))?;
        let in_dim = embed_config.num_slot * embed_config.output_dim();
        let head = candle_nn::linear(in_dim, 1, vb.pp(HEAD_PREFIX))?;

        let stats = compression_stats(&embed_config);
        tracing::info!(
            scheme = %stats.kind,
            train_params = stats.train_params,
            inference_bytes = stats.inference_bytes,
            compression = format!("{:.2}x", stats.compression_ratio),
            "embedding compression stats"
        );

        let vars = optimised_vars(&varmap, &layer)?;
        let optimizer = build_optimizer(vars.clone(), &trainer_config)?;
        let lr_scheduler = LrScheduler::new(
            trainer_config.lr,
            trainer_config.lr_min,
            trainer_config.lr_warmup_steps,
            trainer_config.max_steps,
            trainer_config.lr_decay,
        );

        Ok(Self {
            behavior: TrainerBehavior::for_kind(embed_config.kind()),
            layer,
            head,
            varmap,
            vars,
            optimizer,
            lr_scheduler,
            embed_config,
            config: trainer_config,
            global_step: 0,
            device,
        })
    }

    pub fn layer(&self) -> &EmbeddingLayer {
        &self.layer
    }

    pub fn behavior(&self) -> TrainerBehavior {
        self.behavior
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Hand per-row frequencies to the layer (frequency-aware DPQ).
    pub fn set_frequencies(&mut self, freqs: &[u32]) -> anyhow::Result<()> {
        self.layer.set_frequencies(&self.embed_config, freqs)?;
        Ok(())
    }

    /// One optimiser step on `batch`, then the scheme's side effects.
    pub fn step(&mut self, batch: &CtrBatch) -> anyhow::Result<StepMetrics> {
        let (ids, labels) = batch_to_tensors(batch, &self.device)?;
        let out = self.layer.forward_t(&ids, self.global_step, true)?;
        let logits = self.head_logits(&out.embedding)?;
        let bce = loss::binary_cross_entropy_with_logit(&logits, &labels)?;

        let (total, aux_loss) = match &out.aux_loss {
            Some(aux) if self.behavior.aux_loss_weight_applies => {
                let aux = aux.mean_all()?;
                let total = (&bce + aux.affine(self.aux_loss_weight(), 0.0)?)?;
                (total, Some(aux.to_scalar::<f32>()?))
            }
            _ => (bce, None),
        };

        let lr = self.lr_scheduler.lr_at(self.global_step);
        self.optimizer.set_learning_rate(lr);
        let mut grads = total.backward()?;
        let grad_norm = clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip_max_norm)?;
        self.optimizer.step(&grads)?;

        self.apply_side_effects(out.code_update.as_ref())?;

        let step = self.global_step;
        self.global_step += 1;
        Ok(StepMetrics {
            step,
            loss: total.to_scalar::<f32>()?,
            aux_loss,
            lr,
            grad_norm,
        })
    }

    /// Code commits, then pruning or requantization, in that order.
    fn apply_side_effects(&self, update: Option<&CodeUpdate>) -> anyhow::Result<()> {
        let step = self.global_step;
        if self.behavior.commits_codes {
            if let Some(update) = update {
                self.layer.commit(update)?;
            }
        }
        let prune_now = self.behavior.prunes && self.config.prune.should_prune(step);
        if prune_now || self.behavior.requantizes {
            self.layer.post_step(step)?;
        }
        Ok(())
    }

    /// Loss, accuracy and AUC over `batches`. With `inference` set, schemes
    /// that have one go through their compressed lookup path.
    pub fn evaluate<'a, I>(&self, batches: I, inference: bool) -> anyhow::Result<EvalMetrics>
    where
        I: IntoIterator<Item = &'a CtrBatch>,
    {
        let mut loss_sum = 0.0f64;
        let mut labels_all = Vec::new();
        let mut scores_all = Vec::new();

        for batch in batches {
            let (ids, labels) = batch_to_tensors(batch, &self.device)?;
            let embedding = if inference {
                self.layer.forward_inference(&ids)?
            } else {
                self.layer.forward_t(&ids, self.global_step, false)?.embedding
            };
            let logits = self.head_logits(&embedding)?;
            let l = loss::binary_cross_entropy_with_logit(&logits, &labels)?;
            loss_sum += l.to_scalar::<f32>()? as f64 * batch.batch_size as f64;
            let probs: Vec<f32> = ops::sigmoid(&logits)?.flatten_all()?.to_vec1()?;
            scores_all.extend(probs);
            labels_all.extend_from_slice(&batch.labels);
        }

        let n = labels_all.len();
        if n == 0 {
            return Ok(EvalMetrics {
                loss: f64::MAX,
                accuracy: 0.0,
                auc: 0.5,
                examples: 0,
            });
        }
        let correct = labels_all
            .iter()
            .zip(&scores_all)
            .filter(|(&y, &p)| (y > 0.5) == (p > 0.5))
            .count();
        Ok(EvalMetrics {
            loss: loss_sum / n as f64,
            accuracy: correct as f64 / n as f64,
            auc: roc_auc(&labels_all, &scores_all),
            examples: n,
        })
    }

    /// Bilevel AutoDim step: update `alpha` from the validation batch with a
    /// finite-difference second-order correction, then take a normal weight
    /// step on `train`.
    pub fn arch_step(&mut self, train: &CtrBatch, valid: &CtrBatch) -> anyhow::Result<StepMetrics> {
        let (arch_lr, arch_r) = match &self.embed_config.scheme {
            SchemeConfig::AutoDim {
                arch_lr, arch_r, ..
            } => (*arch_lr, *arch_r),
            _ => anyhow::bail!("arch_step needs an AutoDim layer"),
        };
        anyhow::ensure!(
            train.batch_size == valid.batch_size,
            "arch_step needs equal batch sizes, got {} and {}",
            train.batch_size,
            valid.batch_size
        );
        let auto = self
            .layer
            .autodim()
            .ok_or_else(|| anyhow::anyhow!("AutoDim layer was already retrained"))?;
        let lr = self.lr_scheduler.lr_at(self.global_step);
        let alpha = auto.alpha().clone();

        let mut weights = auto.weight_vars()?;
        weights.push(Var::from_tensor(self.head.weight())?);
        if let Some(b) = self.head.bias() {
            weights.push(Var::from_tensor(b)?);
        }
        let snapshot: Vec<Tensor> = weights
            .iter()
            .map(|w| w.as_tensor().copy())
            .collect::<candle_core::Result<_>>()?;

        let (train_ids, train_labels) = batch_to_tensors(train, &self.device)?;
        let (valid_ids, valid_labels) = batch_to_tensors(valid, &self.device)?;
        let train_lookups = auto
            .lookups(&train_ids)?
            .iter()
            .map(Var::from_tensor)
            .collect::<candle_core::Result<Vec<_>>>()?;
        let train_lookups: Vec<Tensor> = train_lookups.iter().map(|v| v.as_tensor().clone()).collect();

        // Virtual weight step w' = w − lr · ∇w L_train.
        let g_train = self.autodim_grads(auto, &train_lookups, &train_labels)?;
        let dirs = grads_for(&g_train, &weights)?;
        perturb(&weights, &dirs, -lr)?;

        // Validation gradients at w'.
        let valid_lookups = auto
            .lookups(&valid_ids)?
            .iter()
            .map(Var::from_tensor)
            .collect::<candle_core::Result<Vec<_>>>()?;
        let valid_tensors: Vec<Tensor> = valid_lookups.iter().map(|v| v.as_tensor().clone()).collect();
        let g_valid = self.autodim_grads(auto, &valid_tensors, &valid_labels)?;
        let dalpha_valid = grad_of(&g_valid, alpha.as_tensor(), "alpha")?;
        let dw = grads_for(&g_valid, &weights)?;
        let dl = grads_for(&g_valid, &valid_lookups)?;

        let mut sq = 0.0f64;
        for g in dw.iter().chain(&dl) {
            sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        let eps = arch_r / sq.sqrt().max(1e-12);

        // ∇α L_train at w ± eps·dw, lookups ± eps·dl.
        restore(&weights, &snapshot)?;
        let alpha_grad_at = |sign: f64| -> anyhow::Result<Tensor> {
            perturb(&weights, &dw, sign * eps)?;
            let moved = train_lookups
                .iter()
                .zip(&dl)
                .map(|(l, g)| l + (g * (sign * eps))?)
                .collect::<candle_core::Result<Vec<_>>>()?;
            let grads = self.autodim_grads(auto, &moved, &train_labels)?;
            restore(&weights, &snapshot)?;
            grad_of(&grads, alpha.as_tensor(), "alpha")
        };
        let g_pos = alpha_grad_at(1.0)?;
        let g_neg = alpha_grad_at(-1.0)?;

        let hessian = ((g_pos - g_neg)? * (lr / (2.0 * eps)))?;
        let dalpha = (dalpha_valid - hessian)?;
        alpha.set(&(alpha.as_tensor() - (dalpha * arch_lr)?)?)?;
        tracing::debug!(step = self.global_step, eps, "autodim architecture step");

        self.step(train)
    }

    /// Replace the searched AutoDim layer by its fixed-dimension form and
    /// rebuild the optimiser over the retrained parameters and the head.
    pub fn retrain(&mut self, per_slot_num_embeds: &[usize]) -> anyhow::Result<Vec<usize>> {
        self.layer.retrain_autodim(per_slot_num_embeds)?;
        self.behavior.arch_search = false;
        self.vars = optimised_vars(&self.varmap, &self.layer)?;
        self.optimizer = build_optimizer(self.vars.clone(), &self.config)?;
        let dims = match &self.layer {
            EmbeddingLayer::AutoDimRetrained(r) => r.slot_dims(),
            _ => Vec::new(),
        };
        tracing::info!(?dims, params = self.vars.len(), "autodim retrain");
        Ok(dims)
    }

    /// Write `model.safetensors` and `config.json` under `dir`.
    pub fn save(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("model.safetensors");
        self.varmap.save(&path)?;
        let detached = self.layer.detached_vars();
        if !detached.is_empty() {
            let tensors: HashMap<String, Tensor> = detached
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("retrained.{i}"), v.as_tensor().clone()))
                .collect();
            candle_core::safetensors::save(&tensors, dir.join("retrained.safetensors"))?;
        }
        self.embed_config.save(&dir.join("config.json"))?;
        Ok(path)
    }

    fn aux_loss_weight(&self) -> f64 {
        match &self.embed_config.scheme {
            SchemeConfig::Dpq { reg_weight, .. } => *reg_weight,
            _ => 0.0,
        }
    }

    fn head_logits(&self, embedding: &Tensor) -> candle_core::Result<Tensor> {
        self.head.forward(&embedding.flatten_from(1)?)
    }

    fn autodim_grads(
        &self,
        auto: &AutoDimEmbedding,
        lookups: &[Tensor],
        labels: &Tensor,
    ) -> candle_core::Result<GradStore> {
        let embedding = auto.embed_from_lookups(lookups, self.global_step, true)?;
        let logits = self.head_logits(&embedding)?;
        loss::binary_cross_entropy_with_logit(&logits, labels)?.backward()
    }
}

// ── Parameter selection ─────────────────────────────────────────────────────

fn is_optimised(name: &str, var: &Var) -> bool {
    var.dtype().is_float()
        && !name.ends_with("running_mean")
        && !name.ends_with("running_var")
        && name != format!("{EMBED_PREFIX}.alpha")
}

/// Vars stepped by AdamW, sorted by name. A retrained layer replaces every
/// `embed.*` var by its detached parameters.
fn optimised_vars(varmap: &VarMap, layer: &EmbeddingLayer) -> anyhow::Result<Vec<Var>> {
    let detached = layer.detached_vars();
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("var map lock poisoned"))?;
    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, var)| is_optimised(name, var))
        .filter(|(name, _)| detached.is_empty() || name.starts_with(HEAD_PREFIX))
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    let mut vars: Vec<Var> = named.into_iter().map(|(_, v)| v.clone()).collect();
    vars.extend(detached);
    Ok(vars)
}

fn build_optimizer(vars: Vec<Var>, config: &TrainerConfig) -> anyhow::Result<AdamW> {
    Ok(AdamW::new(
        vars,
        ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        },
    )?)
}

// ── Gradient utilities ──────────────────────────────────────────────────────

fn grad_of(grads: &GradStore, t: &Tensor, what: &str) -> anyhow::Result<Tensor> {
    grads
        .get(t)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no gradient reached {what}"))
}

/// Gradient per var, zeros where none flowed.
fn grads_for(grads: &GradStore, vars: &[Var]) -> candle_core::Result<Vec<Tensor>> {
    vars.iter()
        .map(|v| match grads.get(v.as_tensor()) {
            Some(g) => Ok(g.clone()),
            None => v.as_tensor().zeros_like(),
        })
        .collect()
}

fn restore(vars: &[Var], snapshot: &[Tensor]) -> candle_core::Result<()> {
    for (v, s) in vars.iter().zip(snapshot) {
        v.set(s)?;
    }
    Ok(())
}

/// Scale gradients so their global L2 norm is at most `max_norm` (0 skips).
/// Returns the norm before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    if max_norm <= 0.0 || norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(norm)
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Area under the ROC curve by rank sum, ties averaged. 0.5 when only one
/// class is present.
pub fn roc_auc(labels: &[f32], scores: &[f32]) -> f64 {
    let mut order: Vec<usize> = (0..scores.len().min(labels.len())).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum = 0.0f64;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based average rank of the tie group.
        let rank = (i + j) as f64 / 2.0 + 1.0;
        rank_sum += order[i..=j].iter().filter(|&&k| labels[k] > 0.5).count() as f64 * rank;
        i = j + 1;
    }

    let pos = order.iter().filter(|&&k| labels[k] > 0.5).count() as f64;
    let neg = order.len() as f64 - pos;
    if pos == 0.0 || neg == 0.0 {
        return 0.5;
    }
    (rank_sum - pos * (pos + 1.0) / 2.0) / (pos * neg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedmem_common::{CtrDataset, DpqMode, FieldLayout};

    fn embed_config(scheme: SchemeConfig) -> EmbeddingConfig {
        EmbeddingConfig {
            num_embeddings: 40,
            embedding_dim: 4,
            num_slot: 2,
            seed: 3,
            scheme,
        }
    }

    fn dataset(examples: usize) -> CtrDataset {
        CtrDataset::synthetic(&FieldLayout::uniform(40, 2), examples, 9)
    }

    fn trainer(scheme: SchemeConfig) -> Trainer {
        let config = TrainerConfig {
            batch_size: 8,
            max_steps: 20,
            lr: 1e-2,
            grad_clip_max_norm: 1.0,
            ..TrainerConfig::default()
        };
        Trainer::new(embed_config(scheme), config, Device::Cpu).unwrap()
    }

    #[test]
    fn auc_by_rank() {
        assert!((roc_auc(&[0.0, 0.0, 1.0, 1.0], &[0.1, 0.2, 0.8, 0.9]) - 1.0).abs() < 1e-12);
        assert!(roc_auc(&[1.0, 1.0, 0.0, 0.0], &[0.1, 0.2, 0.8, 0.9]).abs() < 1e-12);
        assert!((roc_auc(&[0.0, 1.0], &[0.5, 0.5]) - 0.5).abs() < 1e-12);
        assert_eq!(roc_auc(&[1.0, 1.0], &[0.3, 0.4]), 0.5);
    }

    #[test]
    fn alpha_and_running_stats_are_not_optimised() {
        let t = trainer(SchemeConfig::AutoDim {
            dim_candidates: vec![2, 4],
            log_alpha: false,
            temperature_decay: 0.0,
            arch_lr: 1e-2,
            arch_r: 1e-2,
        });
        let alpha = t.layer().autodim().unwrap().alpha().as_tensor().id();
        assert!(t.vars.iter().all(|v| v.as_tensor().id() != alpha));
        // 2 × (table, weight, bias) + head weight and bias
        assert_eq!(t.vars.len(), 8);
    }

    #[test]
    fn full_training_steps_run() {
        let mut t = trainer(SchemeConfig::Full);
        let data = dataset(32);
        for batch in data.batches(8) {
            let m = t.step(&batch).unwrap();
            assert!(m.loss.is_finite());
            assert!(m.aux_loss.is_none());
        }
        assert_eq!(t.global_step, 4);
        let batches: Vec<_> = data.batches(8).collect();
        let eval = t.evaluate(&batches, false).unwrap();
        assert_eq!(eval.examples, 32);
        assert!((0.0..=1.0).contains(&eval.accuracy));
    }

    #[test]
    fn dpq_step_commits_codes() {
        let mut t = trainer(SchemeConfig::Dpq {
            num_choices: 4,
            num_parts: 2,
            share_weights: false,
            mode: DpqMode::Vq,
            low_num_choices: None,
            freq_threshold: None,
            reg_weight: 1e-3,
        });
        let batch = dataset(8).batches(8).next().unwrap();
        let m = t.step(&batch).unwrap();
        assert!(m.aux_loss.is_some());
        let EmbeddingLayer::Dpq(dpq) = t.layer() else {
            panic!("expected a DPQ layer");
        };
        let codes = dpq.codes();
        for &id in &batch.indices {
            assert!(codes.row(id as usize).iter().all(|&c| c < 4));
        }
        let batches = [batch];
        assert!(t.evaluate(&batches, true).unwrap().loss.is_finite());
    }

    #[test]
    fn arch_step_moves_alpha_then_retrains() {
        let mut t = trainer(SchemeConfig::AutoDim {
            dim_candidates: vec![2, 4],
            log_alpha: false,
            temperature_decay: 0.0,
            arch_lr: 0.5,
            arch_r: 1e-2,
        });
        let data = dataset(16);
        let batches: Vec<_> = data.batches(8).collect();
        let before: Vec<f32> = t
            .layer()
            .autodim()
            .unwrap()
            .alpha()
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let m = t.arch_step(&batches[0], &batches[1]).unwrap();
        assert_eq!(m.step, 0);
        let after: Vec<f32> = t
            .layer()
            .autodim()
            .unwrap()
            .alpha()
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_ne!(before, after);

        let dims = t.retrain(&[20, 20]).unwrap();
        assert_eq!(dims.len(), 2);
        assert!(!t.behavior().arch_search);
        assert!(t.step(&batches[0]).unwrap().loss.is_finite());
        assert!(t.arch_step(&batches[0], &batches[1]).is_err());
    }

    #[test]
    fn arch_step_rejects_other_schemes() {
        let mut t = trainer(SchemeConfig::Full);
        let batch = dataset(8).batches(8).next().unwrap();
        assert!(t.arch_step(&batch, &batch).is_err());
    }

    #[test]
    fn deeplight_prunes_on_schedule() {
        let mut t = trainer(SchemeConfig::DeepLight {
            compress_rate: 0.5,
            warm: 1.0,
        });
        let data = dataset(32);
        for batch in data.batches(8) {
            t.step(&batch).unwrap();
        }
        let EmbeddingLayer::DeepLight(dl) = t.layer() else {
            panic!("expected a DeepLight layer");
        };
        let zeros = dl
            .table()
            .eq(0f32)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(zeros > 0.0);
    }

    fn packed_codes(t: &Trainer) -> Vec<i64> {
        let EmbeddingLayer::Quantized(q) = t.layer() else {
            panic!("expected a quantized layer");
        };
        let packed = q.packed();
        let table = packed.read();
        let mut codes = Vec::with_capacity(table.rows() * table.dim());
        for r in 0..table.rows() {
            for c in 0..table.dim() {
                codes.push(table.code(r, c));
            }
        }
        codes
    }

    #[test]
    fn packed_table_refreshes_only_when_requantizing() {
        let config = TrainerConfig {
            batch_size: 8,
            lr: 1.0,
            ..TrainerConfig::default()
        };
        let scheme = SchemeConfig::Quantized {
            digit: 8,
            scale: 0.01,
            zero_point: 0,
            per_row: false,
        };
        let mut t = Trainer::new(embed_config(scheme), config, Device::Cpu).unwrap();
        assert!(t.behavior().requantizes);
        let batch = dataset(8).batches(8).next().unwrap();

        let before = packed_codes(&t);
        t.behavior.requantizes = false;
        t.step(&batch).unwrap();
        assert_eq!(packed_codes(&t), before);

        t.behavior.requantizes = true;
        t.step(&batch).unwrap();
        assert_ne!(packed_codes(&t), before);
    }

    #[test]
    fn save_writes_weights_and_config() {
        let t = trainer(SchemeConfig::Full);
        let dir = std::env::temp_dir().join(format!("embedmem-save-{}", std::process::id()));
        let path = t.save(&dir).unwrap();
        assert!(path.exists());
        let back = EmbeddingConfig::load(&dir.join("config.json")).unwrap();
        assert_eq!(back.num_embeddings, 40);
        std::fs::remove_dir_all(&dir).ok();
    }
}
