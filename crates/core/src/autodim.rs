//! AutoDim: per-slot embedding dimension search.
//!
//! Every candidate dimension `d` owns a table `(n, d)`, a per-slot
//! projection `(num_slot, d, max_dim)` with bias `(num_slot, 1, max_dim)`,
//! and a non-affine batch-norm over `max_dim`. The projected candidates are
//! mixed per slot by `softmax(alpha' · logit_scale(step))`.
//!
//! `alpha` is trained by the bilevel search step in the train crate, not by
//! the weight optimizer. The hooks here (`lookups`, `embed_from_lookups`,
//! `weight_vars`, [`perturb`]) are what that step needs.
//!
//! After search, [`AutoDimEmbedding::retrain`] keeps only the argmax
//! candidate per slot and slices its rows into a [`RetrainedAutoDim`].

use candle_core::{DType, Result, Tensor, Var, D};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, Init, ModuleT, VarBuilder};
use embedmem_common::EmbedError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::embedding::xavier_init;
use crate::lookup::EmbeddingLookupNode;
use crate::node::{ExecPath, LookupNode};

/// Floor of the temperature denominator in [`AutoDimEmbedding::logit_scale`].
const MIN_TEMPERATURE: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct AutoDimConfig {
    pub num_embeddings: usize,
    pub num_slot: usize,
    pub dim_candidates: Vec<usize>,
    pub log_alpha: bool,
    pub temperature_decay: f64,
    pub seed: u64,
}

struct Candidate {
    dim: usize,
    table: Tensor,
    weight: Tensor,
    bias: Tensor,
    bn: BatchNorm,
}

pub struct AutoDimEmbedding {
    config: AutoDimConfig,
    max_dim: usize,
    candidates: Vec<Candidate>,
    alpha: Var,
    /// Fixed Gumbel noise `(num_candidates,)`, only used with `log_alpha`.
    gumbel: Option<Tensor>,
}

impl AutoDimEmbedding {
    pub fn new(config: AutoDimConfig, vb: VarBuilder) -> Result<Self> {
        let ncands = config.dim_candidates.len();
        let max_dim = config.dim_candidates.iter().copied().max().unwrap_or(0);
        if ncands == 0 || max_dim == 0 || config.num_slot == 0 {
            return Err(EmbedError::config(
                "autodim needs at least one positive candidate dimension and one slot",
            )
            .into());
        }
        let n = config.num_embeddings;
        let nslot = config.num_slot;
        let bn_config = BatchNormConfig {
            eps: 1e-5,
            remove_mean: true,
            affine: false,
            momentum: 0.1,
        };
        let mut candidates = Vec::with_capacity(ncands);
        for (i, &dim) in config.dim_candidates.iter().enumerate() {
            let table = vb.get_with_hints((n, dim), &format!("table_{i}"), xavier_init(n, dim))?;
            let weight = vb.get_with_hints(
                (nslot, dim, max_dim),
                &format!("weight_{i}"),
                xavier_init(dim, max_dim),
            )?;
            let bias = vb.get_with_hints((nslot, 1, max_dim), &format!("bias_{i}"), Init::Const(0.0))?;
            let bn = batch_norm(max_dim, bn_config, vb.pp(format!("bn_{i}")))?;
            candidates.push(Candidate {
                dim,
                table,
                weight,
                bias,
                bn,
            });
        }

        let init = if config.log_alpha { 1.0 } else { 0.0 };
        let alpha = Var::from_tensor(&vb.get_with_hints((nslot, ncands), "alpha", Init::Const(init))?)?;
        let gumbel = if config.log_alpha {
            let mut rng = StdRng::seed_from_u64(config.seed);
            let noise: Vec<f32> = (0..ncands)
                .map(|_| {
                    let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                    -(-u.ln()).ln() as f32
                })
                .collect();
            Some(Tensor::from_vec(noise, ncands, vb.device())?)
        } else {
            None
        };
        tracing::info!(
            rows = n,
            slots = nslot,
            candidates = ?config.dim_candidates,
            log_alpha = config.log_alpha,
            "autodim embedding"
        );
        Ok(Self {
            config,
            max_dim,
            candidates,
            alpha,
            gumbel,
        })
    }

    pub fn config(&self) -> &AutoDimConfig {
        &self.config
    }

    pub fn max_dim(&self) -> usize {
        self.max_dim
    }

    /// Architecture parameters `(num_slot, num_candidates)`.
    pub fn alpha(&self) -> &Var {
        &self.alpha
    }

    /// `1 / max(0.01, 1 − decay·step)`.
    pub fn logit_scale(&self, step: usize) -> f64 {
        1.0 / (1.0 - self.config.temperature_decay * step as f64).max(MIN_TEMPERATURE)
    }

    /// Mixing weights `(num_slot, num_candidates)` at `step`.
    pub fn mixing_weights(&self, step: usize) -> Result<Tensor> {
        let alpha = self.alpha.as_tensor();
        let logits = match &self.gumbel {
            Some(g) => alpha.log()?.broadcast_add(&g.unsqueeze(0)?)?,
            None => alpha.clone(),
        };
        candle_nn::ops::softmax(&(logits * self.logit_scale(step))?, D::Minus1)
    }

    /// Per-candidate raw lookups; each `(bs, num_slot, d)`.
    pub fn lookups(&self, ids: &Tensor) -> Result<Vec<Tensor>> {
        let ids = self.check_ids(ids)?;
        self.candidates
            .iter()
            .map(|c| EmbeddingLookupNode.forward(&[&c.table, &ids], ExecPath::Kernel))
            .collect()
    }

    /// Project, normalise and mix lookups into `(bs, num_slot, max_dim)`.
    pub fn embed_from_lookups(&self, lookups: &[Tensor], step: usize, train: bool) -> Result<Tensor> {
        if lookups.len() != self.candidates.len() {
            return Err(EmbedError::shape(
                "AutoDimEmbedding",
                format!("{} lookups for {} candidates", lookups.len(), self.candidates.len()),
            )
            .into());
        }
        let mut projected = Vec::with_capacity(lookups.len());
        for (cand, emb) in self.candidates.iter().zip(lookups) {
            let (bs, nslot, _) = emb.dims3()?;
            let p = emb
                .transpose(0, 1)?
                .contiguous()?
                .matmul(&cand.weight)?
                .broadcast_add(&cand.bias)?
                .transpose(0, 1)?
                .reshape((bs * nslot, self.max_dim))?;
            let p = cand.bn.forward_t(&p, train)?;
            projected.push(p.reshape((bs, nslot, self.max_dim))?);
        }
        // (bs, nslot, max_dim, ncands)
        let stacked = Tensor::stack(&projected, 3)?;
        let w = self.mixing_weights(step)?.unsqueeze(0)?.unsqueeze(2)?;
        stacked.broadcast_mul(&w)?.sum(3)
    }

    pub fn forward_t(&self, ids: &Tensor, step: usize, train: bool) -> Result<Tensor> {
        let lookups = self.lookups(ids)?;
        self.embed_from_lookups(&lookups, step, train)
    }

    /// Dense weights touched by the search perturbation: per-slot
    /// projections and biases. Tables go through `lookups`; batch-norm
    /// running statistics are excluded.
    pub fn weight_vars(&self) -> Result<Vec<Var>> {
        let mut vars = Vec::with_capacity(2 * self.candidates.len());
        for c in &self.candidates {
            vars.push(Var::from_tensor(&c.weight)?);
            vars.push(Var::from_tensor(&c.bias)?);
        }
        Ok(vars)
    }

    /// Argmax candidate per slot.
    pub fn selected_candidates(&self) -> Result<Vec<usize>> {
        let sel: Vec<u32> = self.alpha.as_tensor().argmax(1)?.to_vec1()?;
        Ok(sel.into_iter().map(|s| s as usize).collect())
    }

    /// Slice the searched model into a fixed-dimension one. Slot `k` owns
    /// rows `[offset_k, offset_k + per_slot_num_embeds[k])` of its chosen
    /// candidate's table.
    pub fn retrain(&self, per_slot_num_embeds: &[usize]) -> Result<RetrainedAutoDim> {
        let nslot = self.config.num_slot;
        if per_slot_num_embeds.len() != nslot {
            return Err(EmbedError::config(format!(
                "retrain needs {nslot} per-slot sizes, got {}",
                per_slot_num_embeds.len()
            ))
            .into());
        }
        let total: usize = per_slot_num_embeds.iter().sum();
        if total > self.config.num_embeddings {
            return Err(EmbedError::config(format!(
                "per-slot sizes sum to {total}, table has {} rows",
                self.config.num_embeddings
            ))
            .into());
        }
        let selected = self.selected_candidates()?;
        let mut slots = Vec::with_capacity(nslot);
        let mut offset = 0usize;
        for (slot, (&rows, &cand)) in per_slot_num_embeds.iter().zip(&selected).enumerate() {
            let c = &self.candidates[cand];
            let table = c.table.narrow(0, offset, rows)?.copy()?;
            let weight = c.weight.get(slot)?.copy()?;
            let bias = c.bias.get(slot)?.copy()?;
            tracing::info!(slot, dim = c.dim, rows, "autodim retrain slot");
            slots.push(RetrainedSlot {
                dim: c.dim,
                offset,
                table: Var::from_tensor(&table)?,
                weight: Var::from_tensor(&weight)?,
                bias: Var::from_tensor(&bias)?,
            });
            offset += rows;
        }
        Ok(RetrainedAutoDim {
            max_dim: self.max_dim,
            slots,
        })
    }

    fn check_ids(&self, ids: &Tensor) -> Result<Tensor> {
        let (_, nslot) = ids.dims2()?;
        if nslot != self.config.num_slot {
            return Err(EmbedError::shape(
                "AutoDimEmbedding",
                format!("batch has {nslot} slots, layer has {}", self.config.num_slot),
            )
            .into());
        }
        ids.to_dtype(DType::I64)
    }
}

/// In-place `var += eps · dir` for every pair.
pub fn perturb(vars: &[Var], dirs: &[Tensor], eps: f64) -> Result<()> {
    if vars.len() != dirs.len() {
        return Err(EmbedError::shape(
            "perturb",
            format!("{} vars, {} directions", vars.len(), dirs.len()),
        )
        .into());
    }
    for (var, dir) in vars.iter().zip(dirs) {
        let moved = (var.as_tensor() + (dir * eps)?)?;
        var.set(&moved)?;
    }
    Ok(())
}

// ── Retrained model ─────────────────────────────────────────────────────────

struct RetrainedSlot {
    dim: usize,
    offset: usize,
    table: Var,
    weight: Var,
    bias: Var,
}

/// Fixed per-slot dimensions chosen by search.
pub struct RetrainedAutoDim {
    max_dim: usize,
    slots: Vec<RetrainedSlot>,
}

impl RetrainedAutoDim {
    pub fn num_slot(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_dims(&self) -> Vec<usize> {
        self.slots.iter().map(|s| s.dim).collect()
    }

    pub fn slot_rows(&self) -> Result<Vec<usize>> {
        self.slots.iter().map(|s| s.table.as_tensor().dim(0)).collect()
    }

    pub fn vars(&self) -> Vec<Var> {
        self.slots
            .iter()
            .flat_map(|s| [s.table.clone(), s.weight.clone(), s.bias.clone()])
            .collect()
    }

    /// `local (bs, num_slot)` holds slot-local row ids. Returns `(bs, num_slot, max_dim)`.
    pub fn forward(&self, local: &Tensor) -> Result<Tensor> {
        let (_, nslot) = local.dims2()?;
        if nslot != self.slots.len() {
            return Err(EmbedError::shape(
                "RetrainedAutoDim",
                format!("batch has {nslot} slots, model has {}", self.slots.len()),
            )
            .into());
        }
        let local = local.to_dtype(DType::I64)?;
        let mut outs = Vec::with_capacity(nslot);
        for (k, slot) in self.slots.iter().enumerate() {
            let ids = local.narrow(1, k, 1)?.squeeze(1)?.contiguous()?;
            let emb = EmbeddingLookupNode.forward(&[slot.table.as_tensor(), &ids], ExecPath::Kernel)?;
            let out = emb
                .matmul(slot.weight.as_tensor())?
                .broadcast_add(slot.bias.as_tensor())?;
            outs.push(out);
        }
        Tensor::stack(&outs, 1)
    }

    /// Same as [`RetrainedAutoDim::forward`] but with global row ids.
    pub fn forward_global(&self, global: &Tensor) -> Result<Tensor> {
        let offsets: Vec<i64> = self.slots.iter().map(|s| s.offset as i64).collect();
        let offsets = Tensor::from_vec(offsets, (1, self.slots.len()), global.device())?;
        let local = global.to_dtype(DType::I64)?.broadcast_sub(&offsets)?;
        self.forward(&local)
    }

    pub fn output_dim(&self) -> usize {
        self.max_dim
    }
}
