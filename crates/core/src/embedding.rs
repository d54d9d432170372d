//! Embedding layers, one per compression scheme.
//!
//! [`EmbeddingLayer`] is a closed enum over every scheme; construction
//! dispatches on [`SchemeConfig`] and the rest of the stack only ever sees
//! the common surface:
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`EmbeddingLayer::forward_t`] | training / evaluation forward, returns [`LayerOutput`] |
//! | [`EmbeddingLayer::forward_inference`] | compressed inference path (codes, packed tables, sparse export) |
//! | [`EmbeddingLayer::commit`] | apply a DPQ [`CodeUpdate`] after the optimizer step |
//! | [`EmbeddingLayer::post_step`] | DeepLight pruning, requantisation |
//!
//! Index batches are `(batch, num_slot)` I64 tensors of global row ids.
//! Outputs are `(batch, num_slot, output_dim)`.

use std::sync::Arc;

use candle_core::{DType, Result, Tensor, Var, D};
use candle_nn::{Init, VarBuilder};
use embedmem_common::{Aggregator, EmbedError, EmbeddingConfig, PrimeTable, SchemeConfig, SchemeKind};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::autodim::{AutoDimConfig, AutoDimEmbedding, RetrainedAutoDim};
use crate::deeplight::DeepLightEmbedding;
use crate::dhe::{DheConfig, DheEmbedding};
use crate::dpq::{CodeUpdate, DpqConfig, DpqEmbedding, FrequencyMask};
use crate::hash::{RobeLayout, RobeParams};
use crate::lookup::{
    CompoHashNode, EmbeddingLookupNode, ModHashNode, QuantizedLookupNode, RobeHashNode,
    RobeLookupNode, RobeSignNode,
};
use crate::node::{ExecPath, LookupNode};
use crate::quantize::{alpt_quantize_ste, fake_quantize, Digit, QuantParams, QuantizedTable};

/// Smallest learned ALPT scale kept after an optimizer step.
const MIN_ALPT_SCALE: f64 = 1e-6;

/// Xavier-normal initialisation for a `(fan_in, fan_out)` parameter.
pub(crate) fn xavier_init(fan_in: usize, fan_out: usize) -> Init {
    Init::Randn {
        mean: 0.,
        stdev: (2.0 / (fan_in + fan_out).max(1) as f64).sqrt(),
    }
}

fn with_dim(ids: &Tensor, dim: usize) -> Vec<usize> {
    let mut shape = ids.dims().to_vec();
    shape.push(dim);
    shape
}

// ── Output ──────────────────────────────────────────────────────────────────

/// Result of a forward pass.
#[derive(Debug)]
pub struct LayerOutput {
    pub embedding: Tensor,
    /// Unweighted auxiliary loss (DPQ commitment loss).
    pub aux_loss: Option<Tensor>,
    /// Pending DPQ code write; commit after the optimizer step.
    pub code_update: Option<CodeUpdate>,
}

impl LayerOutput {
    fn plain(embedding: Tensor) -> Self {
        Self {
            embedding,
            aux_loss: None,
            code_update: None,
        }
    }
}

// ── Simple table schemes ────────────────────────────────────────────────────

/// Uncompressed `(num_embeddings, dim)` table.
pub struct FullEmbedding {
    table: Tensor,
}

impl FullEmbedding {
    pub fn new(rows: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let table = vb.get_with_hints((rows, dim), "table", xavier_init(rows, dim))?;
        Ok(Self { table })
    }

    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        EmbeddingLookupNode.forward(&[&self.table, ids], ExecPath::Kernel)
    }
}

/// Modulo hashing into a smaller table.
pub struct HashEmbedding {
    table: Tensor,
    node: ModHashNode,
}

impl HashEmbedding {
    pub fn new(rows: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let node = ModHashNode::new(rows)?;
        let table = vb.get_with_hints((rows, dim), "table", xavier_init(rows, dim))?;
        Ok(Self { table, node })
    }

    pub fn rows(&self) -> usize {
        self.node.nembed as usize
    }

    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let hashed = self.node.forward(&[ids], ExecPath::Kernel)?;
        EmbeddingLookupNode.forward(&[&self.table, &hashed], ExecPath::Kernel)
    }
}

/// Quotient-remainder hashing over `ntable` stacked sub-tables of `rows`
/// rows each. Sub-table `k` occupies rows `[k·rows, (k+1)·rows)`.
pub struct CompositionalEmbedding {
    table: Tensor,
    compo: CompoHashNode,
    wrap: ModHashNode,
    aggregator: Aggregator,
}

impl CompositionalEmbedding {
    pub fn new(
        ntable: usize,
        rows: usize,
        dim: usize,
        aggregator: Aggregator,
        vb: VarBuilder,
    ) -> Result<Self> {
        let compo = CompoHashNode::new(ntable, rows)?;
        let wrap = ModHashNode::new(rows)?;
        let table = vb.get_with_hints((ntable * rows, dim), "table", xavier_init(ntable * rows, dim))?;
        Ok(Self {
            table,
            compo,
            wrap,
            aggregator,
        })
    }

    /// Physical row ids `(..., ntable)`. The last digit is the unreduced
    /// quotient, so it is wrapped into the sub-table before offsetting.
    pub fn physical_rows(&self, ids: &Tensor) -> Result<Tensor> {
        let digits = self.compo.forward(&[ids], ExecPath::Kernel)?;
        let digits = self.wrap.forward(&[&digits], ExecPath::Kernel)?;
        let ntable = self.compo.ntable;
        let base: Vec<i64> = (0..ntable as i64).map(|k| k * self.compo.nembed).collect();
        let base = Tensor::from_vec(base, ntable, ids.device())?;
        digits.broadcast_add(&base)
    }

    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let rows = self.physical_rows(ids)?;
        // (..., ntable, dim)
        let parts = EmbeddingLookupNode.forward(&[&self.table, &rows], ExecPath::Kernel)?;
        match self.aggregator {
            Aggregator::Sum => parts.sum(D::Minus2),
            Aggregator::Mul => {
                let mut acc = parts.narrow(D::Minus2, 0, 1)?;
                for k in 1..self.compo.ntable {
                    acc = (acc * parts.narrow(D::Minus2, k, 1)?)?;
                }
                acc.squeeze(D::Minus2)
            }
            Aggregator::Concat => {
                let dim = self.table.dim(1)?;
                parts.reshape(with_dim(ids, self.compo.ntable * dim))
            }
        }
    }
}

/// ROBE: every row is assembled from `ceil(dim / Z)` wrapped chunks of one
/// shared pool, multiplied by per-element signs.
pub struct RobeEmbedding {
    pool: Tensor,
    hash: RobeHashNode,
    sign: RobeSignNode,
    lookup: RobeLookupNode,
}

impl RobeEmbedding {
    pub fn new(layout: RobeLayout, params: RobeParams, fan: (usize, usize), vb: VarBuilder) -> Result<Self> {
        if layout.z == 0 || layout.z > layout.dim {
            return Err(EmbedError::config(format!(
                "robe: Z ({}) must be in [1, dim = {}]",
                layout.z, layout.dim
            ))
            .into());
        }
        let pool = vb.get_with_hints((layout.size, 1), "pool", xavier_init(fan.0, fan.1))?;
        Ok(Self {
            pool,
            hash: RobeHashNode { params, layout },
            sign: RobeSignNode { params, layout },
            lookup: RobeLookupNode { len: layout.z },
        })
    }

    pub fn layout(&self) -> &RobeLayout {
        &self.hash.layout
    }

    /// `ids (..., nslot)` → `(..., nslot, dim)`.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let layout = self.hash.layout;
        let offsets = self.hash.forward(&[ids], ExecPath::Kernel)?;
        let chunks = self.lookup.forward(&[&self.pool, &offsets], ExecPath::Kernel)?;
        let flat = chunks.reshape(with_dim(ids, layout.num_chunks() * layout.z))?;
        let values = flat.narrow(D::Minus1, 0, layout.dim)?;
        let signs = self.sign.forward(&[ids], ExecPath::Kernel)?;
        values * signs
    }
}

// ── Quantised schemes ───────────────────────────────────────────────────────

/// Full-precision latent table trained with fake quantisation; a packed copy
/// is refreshed after every optimizer step and serves inference.
pub struct QuantizedEmbedding {
    table: Var,
    digit: Digit,
    per_row: bool,
    scale: f32,
    zero_point: i64,
    packed: Arc<RwLock<QuantizedTable>>,
    lookup: QuantizedLookupNode,
}

impl QuantizedEmbedding {
    pub fn new(
        rows: usize,
        dim: usize,
        digit: Digit,
        scale: f32,
        zero_point: i64,
        per_row: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let table = Var::from_tensor(&vb.get_with_hints((rows, dim), "table", xavier_init(rows, dim))?)?;
        let packed = Self::pack(table.as_tensor(), digit, scale, zero_point, per_row)?;
        let packed = Arc::new(RwLock::new(packed));
        Ok(Self {
            table,
            digit,
            per_row,
            scale,
            zero_point,
            lookup: QuantizedLookupNode {
                table: Arc::clone(&packed),
            },
            packed,
        })
    }

    fn pack(table: &Tensor, digit: Digit, scale: f32, zero_point: i64, per_row: bool) -> Result<QuantizedTable> {
        let params = if per_row {
            QuantParams::fit_rows(table, digit)?
        } else {
            QuantParams::PerTable { scale, zero_point }
        };
        QuantizedTable::from_tensor(table, params, digit)
    }

    pub fn packed(&self) -> Arc<RwLock<QuantizedTable>> {
        Arc::clone(&self.packed)
    }

    pub fn forward_t(&self, ids: &Tensor) -> Result<Tensor> {
        let w = EmbeddingLookupNode.forward(&[self.table.as_tensor(), ids], ExecPath::Kernel)?;
        let packed = self.packed.read();
        let (scale, zp) = packed.params().to_tensors(ids.device())?;
        let (scale, zp) = if self.per_row {
            let flat = ids.flatten_all()?;
            (
                scale.index_select(&flat, 0)?.reshape(with_dim(ids, 1))?,
                zp.index_select(&flat, 0)?.reshape(with_dim(ids, 1))?,
            )
        } else {
            (scale, zp)
        };
        fake_quantize(&w, &scale, &zp, self.digit)
    }

    pub fn forward_inference(&self, ids: &Tensor) -> Result<Tensor> {
        self.lookup.forward(&[ids], ExecPath::Kernel)
    }

    /// Rebuild the packed table from the latent weights.
    pub fn requantize(&self) -> Result<()> {
        let packed = Self::pack(self.table.as_tensor(), self.digit, self.scale, self.zero_point, self.per_row)?;
        *self.packed.write() = packed;
        Ok(())
    }
}

/// ALPT: latent table plus a learned scale (per table or per row). The
/// forward rounds `w / s` with LSQ gradients into `s`.
pub struct AlptEmbedding {
    table: Var,
    scale: Var,
    digit: Digit,
    zero_point: i64,
    per_row: bool,
    packed: Arc<RwLock<QuantizedTable>>,
    lookup: QuantizedLookupNode,
}

impl AlptEmbedding {
    pub fn new(
        rows: usize,
        dim: usize,
        digit: Digit,
        init_scale: f32,
        zero_point: i64,
        per_row: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let table = Var::from_tensor(&vb.get_with_hints((rows, dim), "table", xavier_init(rows, dim))?)?;
        let scale_rows = if per_row { rows } else { 1 };
        let scale = Var::from_tensor(&vb.get_with_hints(
            (scale_rows, 1),
            "scale",
            Init::Const(init_scale as f64),
        )?)?;
        let packed = Arc::new(RwLock::new(Self::pack(&table, &scale, digit, zero_point)?));
        Ok(Self {
            table,
            scale,
            digit,
            zero_point,
            per_row,
            lookup: QuantizedLookupNode {
                table: Arc::clone(&packed),
            },
            packed,
        })
    }

    fn pack(table: &Var, scale: &Var, digit: Digit, zero_point: i64) -> Result<QuantizedTable> {
        let scales: Vec<f32> = scale.as_tensor().flatten_all()?.to_vec1()?;
        let params = if scales.len() == 1 {
            QuantParams::PerTable {
                scale: scales[0],
                zero_point,
            }
        } else {
            let n = scales.len();
            QuantParams::PerRow {
                scales,
                zero_points: vec![zero_point; n],
            }
        };
        QuantizedTable::from_tensor(table.as_tensor(), params, digit)
    }

    pub fn scale(&self) -> &Tensor {
        self.scale.as_tensor()
    }

    pub fn forward_t(&self, ids: &Tensor) -> Result<Tensor> {
        let w = EmbeddingLookupNode.forward(&[self.table.as_tensor(), ids], ExecPath::Kernel)?;
        let s = if self.per_row {
            EmbeddingLookupNode.forward(&[self.scale.as_tensor(), ids], ExecPath::Kernel)?
        } else {
            self.scale.as_tensor().clone()
        };
        alpt_quantize_ste(&w, &s, self.zero_point, self.digit)
    }

    pub fn forward_inference(&self, ids: &Tensor) -> Result<Tensor> {
        self.lookup.forward(&[ids], ExecPath::Kernel)
    }

    /// Keep scales positive, then rebuild the packed table.
    pub fn requantize(&self) -> Result<()> {
        let floored = self.scale.as_tensor().maximum(MIN_ALPT_SCALE)?;
        self.scale.set(&floored)?;
        *self.packed.write() = Self::pack(&self.table, &self.scale, self.digit, self.zero_point)?;
        Ok(())
    }
}

// ── EmbeddingLayer ──────────────────────────────────────────────────────────

/// Learned-hash and ROBE constants are drawn from this stream so they never
/// depend on parameter initialisation order.
fn hash_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Embedding layer for any scheme.
pub enum EmbeddingLayer {
    Full(FullEmbedding),
    Hash(HashEmbedding),
    Compositional(CompositionalEmbedding),
    Learning(DheEmbedding),
    Robe(RobeEmbedding),
    Dpq(DpqEmbedding),
    AutoDim(AutoDimEmbedding),
    /// AutoDim after [`EmbeddingLayer::retrain_autodim`].
    AutoDimRetrained(RetrainedAutoDim),
    DeepLight(DeepLightEmbedding),
    Quantized(QuantizedEmbedding),
    Alpt(AlptEmbedding),
}

impl EmbeddingLayer {
    /// Build the layer for `config`. `vb` should be scoped to the layer
    /// prefix (e.g. `vb.pp("embed")`).
    pub fn new(config: &EmbeddingConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let n = config.num_embeddings;
        let dim = config.embedding_dim;
        let layer = match &config.scheme {
            SchemeConfig::Full => Self::Full(FullEmbedding::new(n, dim, vb)?),
            SchemeConfig::Hash { .. } => {
                let rows = config.hash_rows().unwrap_or(n);
                Self::Hash(HashEmbedding::new(rows, dim, vb)?)
            }
            SchemeConfig::Compositional {
                num_tables,
                aggregator,
            } => {
                let rows = config.compositional_rows().unwrap_or(n);
                Self::Compositional(CompositionalEmbedding::new(*num_tables, rows, dim, *aggregator, vb)?)
            }
            SchemeConfig::Learning {
                num_buckets,
                num_hash,
                mlp_dim,
                mlp_layers,
                dist,
                prime_path,
            } => {
                let primes = match prime_path {
                    Some(path) => PrimeTable::load(path).map_err(|e| {
                        candle_core::Error::Msg(format!("loading primes from {}: {e}", path.display()))
                    })?,
                    None => DheEmbedding::default_primes(*num_buckets),
                };
                let dhe = DheConfig {
                    embedding_dim: dim,
                    num_buckets: *num_buckets,
                    num_hash: *num_hash,
                    mlp_dim: *mlp_dim,
                    mlp_layers: *mlp_layers,
                    dist: *dist,
                    seed: config.seed,
                };
                Self::Learning(DheEmbedding::new(dhe, &primes, vb)?)
            }
            SchemeConfig::Robe {
                robe_array_size,
                z,
                use_slot_coef,
            } => {
                let layout = RobeLayout {
                    size: *robe_array_size,
                    z: if *z == 0 { dim } else { *z },
                    dim,
                    use_slot_coef: *use_slot_coef,
                };
                let params = RobeParams::from_rng(&mut hash_rng(config.seed));
                Self::Robe(RobeEmbedding::new(layout, params, (n, dim), vb)?)
            }
            SchemeConfig::Dpq {
                num_choices,
                num_parts,
                share_weights,
                mode,
                ..
            } => {
                let dpq = DpqConfig {
                    num_embeddings: n,
                    embedding_dim: dim,
                    num_choices: *num_choices,
                    num_parts: *num_parts,
                    share_weights: *share_weights,
                    mode: *mode,
                };
                Self::Dpq(DpqEmbedding::new(dpq, vb)?)
            }
            SchemeConfig::AutoDim {
                dim_candidates,
                log_alpha,
                temperature_decay,
                ..
            } => {
                let auto = AutoDimConfig {
                    num_embeddings: n,
                    num_slot: config.num_slot,
                    dim_candidates: dim_candidates.clone(),
                    log_alpha: *log_alpha,
                    temperature_decay: *temperature_decay,
                    seed: config.seed,
                };
                Self::AutoDim(AutoDimEmbedding::new(auto, vb)?)
            }
            SchemeConfig::DeepLight {
                compress_rate,
                warm,
            } => Self::DeepLight(DeepLightEmbedding::new(n, dim, *compress_rate, *warm, vb)?),
            SchemeConfig::Quantized {
                digit,
                scale,
                zero_point,
                per_row,
            } => Self::Quantized(QuantizedEmbedding::new(
                n,
                dim,
                Digit::try_from(*digit)?,
                *scale,
                *zero_point,
                *per_row,
                vb,
            )?),
            SchemeConfig::Alpt {
                digit,
                init_scale,
                zero_point,
                per_row,
            } => Self::Alpt(AlptEmbedding::new(
                n,
                dim,
                Digit::try_from(*digit)?,
                *init_scale,
                *zero_point,
                *per_row,
                vb,
            )?),
        };
        tracing::info!(
            scheme = %config.kind(),
            rows = n,
            dim,
            output_dim = config.output_dim(),
            "embedding layer ready"
        );
        Ok(layer)
    }

    pub fn kind(&self) -> SchemeKind {
        match self {
            Self::Full(_) => SchemeKind::Full,
            Self::Hash(_) => SchemeKind::Hash,
            Self::Compositional(_) => SchemeKind::Compositional,
            Self::Learning(_) => SchemeKind::Learning,
            Self::Robe(_) => SchemeKind::Robe,
            Self::Dpq(_) => SchemeKind::Dpq,
            Self::AutoDim(_) | Self::AutoDimRetrained(_) => SchemeKind::AutoDim,
            Self::DeepLight(_) => SchemeKind::DeepLight,
            Self::Quantized(_) => SchemeKind::Quantized,
            Self::Alpt(_) => SchemeKind::Alpt,
        }
    }

    /// Install the frequency-aware DPQ mask from per-row counts. Other
    /// schemes, and DPQ configs without a threshold, ignore it.
    pub fn set_frequencies(&mut self, config: &EmbeddingConfig, freqs: &[u32]) -> Result<()> {
        if let (
            Self::Dpq(dpq),
            SchemeConfig::Dpq {
                low_num_choices: Some(low),
                freq_threshold: Some(threshold),
                ..
            },
        ) = (self, &config.scheme)
        {
            let device = dpq.value_codebook().device().clone();
            dpq.set_frequency_mask(FrequencyMask::new(freqs, *threshold, *low, &device)?)?;
        }
        Ok(())
    }

    /// Training or evaluation forward pass over `(batch, num_slot)` ids.
    pub fn forward_t(&self, ids: &Tensor, step: usize, train: bool) -> Result<LayerOutput> {
        let ids = ids.to_dtype(DType::I64)?;
        match self {
            Self::Full(l) => l.forward(&ids).map(LayerOutput::plain),
            Self::Hash(l) => l.forward(&ids).map(LayerOutput::plain),
            Self::Compositional(l) => l.forward(&ids).map(LayerOutput::plain),
            Self::Learning(l) => l.forward_t(&ids, train).map(LayerOutput::plain),
            Self::Robe(l) => l.forward(&ids).map(LayerOutput::plain),
            Self::Dpq(l) => {
                let out = l.forward_t(&ids, train)?;
                Ok(LayerOutput {
                    embedding: out.embedding,
                    aux_loss: out.reg_loss,
                    code_update: Some(out.update),
                })
            }
            Self::AutoDim(l) => l.forward_t(&ids, step, train).map(LayerOutput::plain),
            Self::AutoDimRetrained(l) => l.forward_global(&ids).map(LayerOutput::plain),
            Self::DeepLight(l) => l.forward(&ids).map(LayerOutput::plain),
            Self::Quantized(l) => l.forward_t(&ids).map(LayerOutput::plain),
            Self::Alpt(l) => l.forward_t(&ids).map(LayerOutput::plain),
        }
    }

    /// Inference through the compressed representation where one exists.
    /// AutoDim is evaluated at the end of its temperature schedule.
    pub fn forward_inference(&self, ids: &Tensor) -> Result<Tensor> {
        let ids = ids.to_dtype(DType::I64)?;
        match self {
            Self::Dpq(l) => l.forward_inference(&ids),
            Self::DeepLight(l) => l.forward_inference(&ids),
            Self::Quantized(l) => l.forward_inference(&ids),
            Self::Alpt(l) => l.forward_inference(&ids),
            _ => Ok(self.forward_t(&ids, usize::MAX, false)?.embedding),
        }
    }

    /// Commit a pending DPQ code write. No-op for other schemes.
    pub fn commit(&self, update: &CodeUpdate) -> Result<()> {
        match self {
            Self::Dpq(l) => update.commit(&l.codes()),
            _ => Ok(()),
        }
    }

    /// Side effects after the optimizer step at `step`.
    pub fn post_step(&self, step: usize) -> Result<()> {
        match self {
            Self::DeepLight(l) => l.prune(step).map(|_| ()),
            Self::Quantized(l) => l.requantize(),
            Self::Alpt(l) => l.requantize(),
            _ => Ok(()),
        }
    }

    pub fn autodim(&self) -> Option<&AutoDimEmbedding> {
        match self {
            Self::AutoDim(l) => Some(l),
            _ => None,
        }
    }

    /// Replace a searched AutoDim layer by its retrained form.
    pub fn retrain_autodim(&mut self, per_slot_num_embeds: &[usize]) -> Result<()> {
        let retrained = match self {
            Self::AutoDim(l) => l.retrain(per_slot_num_embeds)?,
            _ => {
                return Err(
                    EmbedError::unsupported("EmbeddingLayer", "retrain needs an AutoDim layer").into(),
                )
            }
        };
        *self = Self::AutoDimRetrained(retrained);
        Ok(())
    }

    /// Parameters that live outside the `VarMap` (retrained AutoDim).
    pub fn detached_vars(&self) -> Vec<Var> {
        match self {
            Self::AutoDimRetrained(l) => l.vars(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use embedmem_common::{DpqMode, HashDistribution};

    fn build(scheme: SchemeConfig, n: usize, dim: usize) -> (VarMap, EmbeddingLayer) {
        let config = EmbeddingConfig {
            num_embeddings: n,
            embedding_dim: dim,
            num_slot: 2,
            seed: 5,
            scheme,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = EmbeddingLayer::new(&config, vb.pp("embed")).unwrap();
        (varmap, layer)
    }

    fn ids(rows: &[[i64; 2]]) -> Tensor {
        Tensor::from_vec(rows.concat(), (rows.len(), 2), &Device::Cpu).unwrap()
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn hash_layer_collides_modulo_rows() {
        let (_vm, layer) = build(
            SchemeConfig::Hash {
                compress_rate: Some(0.1),
                size_limit: None,
            },
            1000,
            8,
        );
        let out = layer.forward_t(&ids(&[[0, 100], [999, 99]]), 0, true).unwrap();
        assert_eq!(out.embedding.dims(), &[2, 2, 8]);
        let v = flat(&out.embedding);
        // 0 ≡ 100 and 999 ≡ 99 (mod 100)
        assert_eq!(&v[0..8], &v[8..16]);
        assert_eq!(&v[16..24], &v[24..32]);
        assert!(out.aux_loss.is_none() && out.code_update.is_none());
    }

    #[test]
    fn size_limit_sets_rows() {
        let (_vm, layer) = build(
            SchemeConfig::Hash {
                compress_rate: None,
                size_limit: Some(400),
            },
            1000,
            8,
        );
        match layer {
            EmbeddingLayer::Hash(h) => assert_eq!(h.rows(), 50),
            _ => panic!("expected hash layer"),
        }
    }

    #[test]
    fn compositional_rows_are_unique_per_id() {
        let (_vm, layer) = build(
            SchemeConfig::Compositional {
                num_tables: 2,
                aggregator: Aggregator::Sum,
            },
            100,
            4,
        );
        let EmbeddingLayer::Compositional(c) = &layer else {
            panic!("expected compositional layer");
        };
        let rows: Vec<i64> = c
            .physical_rows(&Tensor::new(&[0i64, 9, 10, 99], &Device::Cpu).unwrap())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        // rows = 10: remainder in [0, 10), quotient offset by 10
        assert_eq!(rows, vec![0, 10, 9, 10, 0, 11, 9, 19]);
    }

    #[test]
    fn compositional_aggregators_shape() {
        for (agg, width) in [(Aggregator::Sum, 4), (Aggregator::Mul, 4), (Aggregator::Concat, 12)] {
            let (_vm, layer) = build(
                SchemeConfig::Compositional {
                    num_tables: 3,
                    aggregator: agg,
                },
                1000,
                4,
            );
            let out = layer.forward_t(&ids(&[[1, 2], [3, 999]]), 0, true).unwrap();
            assert_eq!(out.embedding.dims(), &[2, 2, width]);
        }
    }

    #[test]
    fn robe_layer_shape_and_gradient() {
        let (varmap, layer) = build(
            SchemeConfig::Robe {
                robe_array_size: 37,
                z: 3,
                use_slot_coef: true,
            },
            1000,
            8,
        );
        let out = layer.forward_t(&ids(&[[1, 2], [3, 4]]), 0, true).unwrap();
        assert_eq!(out.embedding.dims(), &[2, 2, 8]);
        let grads = out.embedding.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        let data = varmap.data().lock().unwrap();
        let pool = data.get("embed.pool").unwrap();
        assert!(grads.get(pool.as_tensor()).is_some());
    }

    #[test]
    fn dpq_layer_commits_codes_for_inference() {
        let (_vm, layer) = build(
            SchemeConfig::Dpq {
                num_choices: 4,
                num_parts: 2,
                share_weights: false,
                mode: DpqMode::Vq,
                low_num_choices: None,
                freq_threshold: None,
                reg_weight: 1e-3,
            },
            50,
            8,
        );
        let x = ids(&[[1, 2], [3, 4]]);
        let out = layer.forward_t(&x, 0, true).unwrap();
        assert!(out.aux_loss.is_some());
        layer.commit(out.code_update.as_ref().unwrap()).unwrap();
        let inf = layer.forward_inference(&x).unwrap();
        for (a, b) in flat(&out.embedding).iter().zip(flat(&inf).iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn quantized_inference_matches_fake_quant() {
        let (_vm, layer) = build(
            SchemeConfig::Quantized {
                digit: 8,
                scale: 0.01,
                zero_point: 0,
                per_row: false,
            },
            20,
            4,
        );
        let x = ids(&[[0, 5], [19, 7]]);
        let train = layer.forward_t(&x, 0, true).unwrap().embedding;
        let inf = layer.forward_inference(&x).unwrap();
        for (a, b) in flat(&train).iter().zip(flat(&inf).iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        layer.post_step(1).unwrap();
    }

    #[test]
    fn per_row_quantized_error_is_bounded() {
        let (_vm, layer) = build(
            SchemeConfig::Quantized {
                digit: 16,
                scale: 0.01,
                zero_point: 0,
                per_row: true,
            },
            20,
            4,
        );
        let EmbeddingLayer::Quantized(q) = &layer else {
            panic!("expected quantized layer");
        };
        let x = ids(&[[0, 5], [19, 7]]);
        let exact = EmbeddingLookupNode
            .forward(&[q.table.as_tensor(), &x], ExecPath::Kernel)
            .unwrap();
        let inf = layer.forward_inference(&x).unwrap();
        for (a, b) in flat(&exact).iter().zip(flat(&inf).iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn alpt_scale_receives_gradient() {
        let (_vm, layer) = build(
            SchemeConfig::Alpt {
                digit: 8,
                init_scale: 0.01,
                zero_point: 0,
                per_row: true,
            },
            20,
            4,
        );
        let EmbeddingLayer::Alpt(a) = &layer else {
            panic!("expected alpt layer");
        };
        let out = layer.forward_t(&ids(&[[0, 5], [19, 7]]), 0, true).unwrap();
        let grads = out.embedding.sum_all().unwrap().backward().unwrap();
        assert!(grads.get(a.scale()).is_some());
        layer.post_step(1).unwrap();
        let inf = layer.forward_inference(&ids(&[[0, 5], [19, 7]])).unwrap();
        assert_eq!(inf.dims(), &[2, 2, 4]);
    }

    #[test]
    fn learning_layer_forward() {
        let (_vm, layer) = build(
            SchemeConfig::Learning {
                num_buckets: 100,
                num_hash: 4,
                mlp_dim: 8,
                mlp_layers: 1,
                dist: HashDistribution::Normal,
                prime_path: None,
            },
            1000,
            4,
        );
        let out = layer.forward_t(&ids(&[[1, 2], [3, 4]]), 0, true).unwrap();
        assert_eq!(out.embedding.dims(), &[2, 2, 4]);
        assert_eq!(layer.kind(), SchemeKind::Learning);
    }

    #[test]
    fn autodim_retrain_swaps_variant() {
        let (_vm, mut layer) = build(
            SchemeConfig::AutoDim {
                dim_candidates: vec![2, 4],
                log_alpha: false,
                temperature_decay: 1e-3,
                arch_lr: 1e-3,
                arch_r: 1e-2,
            },
            20,
            4,
        );
        assert!(layer.autodim().is_some());
        assert!(layer.detached_vars().is_empty());
        layer.retrain_autodim(&[10, 10]).unwrap();
        assert!(layer.autodim().is_none());
        assert_eq!(layer.kind(), SchemeKind::AutoDim);
        assert!(!layer.detached_vars().is_empty());
        let out = layer.forward_t(&ids(&[[0, 10], [9, 19]]), 0, true).unwrap();
        assert_eq!(out.embedding.dims(), &[2, 2, 4]);
        assert!(layer.retrain_autodim(&[10, 10]).is_err());
    }

    #[test]
    fn deeplight_post_step_prunes() {
        let (_vm, layer) = build(
            SchemeConfig::DeepLight {
                compress_rate: 0.5,
                warm: 1.0,
            },
            20,
            8,
        );
        layer.post_step(10_000).unwrap();
        let EmbeddingLayer::DeepLight(d) = &layer else {
            panic!("expected deeplight layer");
        };
        let zeros = flat(d.table()).iter().filter(|v| **v == 0.0).count();
        assert!(zeros > 0);
    }

    #[test]
    fn invalid_config_fails_construction() {
        let config = EmbeddingConfig {
            num_embeddings: 10,
            embedding_dim: 4,
            num_slot: 2,
            seed: 0,
            scheme: SchemeConfig::Quantized {
                digit: 4,
                scale: 0.01,
                zero_point: 0,
                per_row: false,
            },
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(EmbeddingLayer::new(&config, vb).is_err());
    }
}
