//! Differentiable product quantization (DPQ).
//!
//! Each logical row owns a full-precision *query* vector during training.
//! The query is split into `num_parts` sub-vectors; each part picks one of
//! `num_choices` codebook entries. At inference only the per-row codes and
//! the *value* codebook are needed, so the query table can be dropped.
//!
//! Two modes, fixed at construction:
//!
//! * **vq**: response is the negative squared distance to each key; the
//!   output is `straight_through(value[code], query)` plus a commitment
//!   loss pulling the chosen values towards the (stopped) queries. Values
//!   are the keys.
//! * **sx**: response is the dot product with each key; the output is
//!   `onehot_st · value` where `onehot_st` carries the softmax gradient.
//!
//! Code writes are not applied during the forward pass. The forward returns
//! a [`CodeUpdate`] and the caller commits it to the shared
//! [`CodeAssignment`] after the optimizer step. Duplicate rows inside one
//! update resolve last-write-wins.

use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, ModuleT, VarBuilder};
use embedmem_common::{DpqMode, EmbedError};
use parking_lot::RwLock;

use crate::embedding::xavier_init;
use crate::lookup::EmbeddingLookupNode;
use crate::node::{ExecPath, LookupNode};
use crate::quantize::straight_through;

/// Response assigned to choices a row may not select.
const MASKED_RESPONSE: f32 = -1e30;

// ── Code assignment ─────────────────────────────────────────────────────────

/// Per-row selected codes, `(num_embeddings, num_parts)`. Non-trainable.
#[derive(Debug)]
pub struct CodeAssignment {
    num_parts: usize,
    codes: RwLock<Vec<u32>>,
}

impl CodeAssignment {
    pub fn new(num_embeddings: usize, num_parts: usize) -> Self {
        Self {
            num_parts,
            codes: RwLock::new(vec![0; num_embeddings * num_parts]),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.codes.read().len() / self.num_parts
    }

    pub fn num_parts(&self) -> usize {
        self.num_parts
    }

    pub fn row(&self, row: usize) -> Vec<u32> {
        let codes = self.codes.read();
        codes[row * self.num_parts..(row + 1) * self.num_parts].to_vec()
    }

    /// Codes for a batch of rows, I64 `(..., num_parts)`.
    pub fn lookup(&self, ids: &Tensor) -> Result<Tensor> {
        let rows: Vec<i64> = ids.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;
        let codes = self.codes.read();
        let n_rows = codes.len() / self.num_parts;
        let mut out = Vec::with_capacity(rows.len() * self.num_parts);
        for &r in &rows {
            if r < 0 || r as usize >= n_rows {
                return Err(EmbedError::shape(
                    "CodeAssignment",
                    format!("row {r} out of range for {n_rows} rows"),
                )
                .into());
            }
            let start = r as usize * self.num_parts;
            out.extend(codes[start..start + self.num_parts].iter().map(|&c| c as i64));
        }
        let mut shape = ids.dims().to_vec();
        shape.push(self.num_parts);
        Tensor::from_vec(out, shape, ids.device())
    }
}

/// Pending sparse write of codes computed by one training forward pass.
#[derive(Debug, Clone, Default)]
pub struct CodeUpdate {
    rows: Vec<i64>,
    codes: Vec<u32>,
    num_parts: usize,
}

impl CodeUpdate {
    pub fn new(rows: Vec<i64>, codes: Vec<u32>, num_parts: usize) -> Result<Self> {
        if codes.len() != rows.len() * num_parts {
            return Err(EmbedError::shape(
                "CodeUpdate",
                format!("{} codes for {} rows x {num_parts} parts", codes.len(), rows.len()),
            )
            .into());
        }
        Ok(Self {
            rows,
            codes,
            num_parts,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write every row in order; later entries overwrite earlier ones.
    pub fn commit(&self, target: &CodeAssignment) -> Result<()> {
        if self.num_parts != target.num_parts {
            return Err(EmbedError::shape(
                "CodeUpdate",
                format!("{} parts vs {} in target", self.num_parts, target.num_parts),
            )
            .into());
        }
        let mut codes = target.codes.write();
        let n_rows = codes.len() / self.num_parts;
        for (i, &r) in self.rows.iter().enumerate() {
            if r < 0 || r as usize >= n_rows {
                return Err(EmbedError::shape(
                    "CodeUpdate",
                    format!("row {r} out of range for {n_rows} rows"),
                )
                .into());
            }
            let dst = r as usize * self.num_parts;
            let src = i * self.num_parts;
            codes[dst..dst + self.num_parts].copy_from_slice(&self.codes[src..src + self.num_parts]);
        }
        Ok(())
    }
}

// ── Frequency mask ──────────────────────────────────────────────────────────

/// Rows seen at least `threshold` times may only pick the first
/// `low_num_choices` codebook entries.
#[derive(Debug, Clone)]
pub struct FrequencyMask {
    /// U8 `(num_embeddings,)`, 1 for restricted rows.
    restricted: Tensor,
    low_num_choices: usize,
}

impl FrequencyMask {
    pub fn new(freqs: &[u32], threshold: u32, low_num_choices: usize, device: &Device) -> Result<Self> {
        let flags: Vec<u8> = freqs.iter().map(|&f| u8::from(f >= threshold)).collect();
        let n = flags.len();
        Ok(Self {
            restricted: Tensor::from_vec(flags, n, device)?,
            low_num_choices,
        })
    }

    pub fn num_restricted(&self) -> Result<usize> {
        Ok(self
            .restricted
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()? as usize)
    }

    /// Replace disallowed responses of `resp (n, parts, choices)` for rows `ids (n,)`.
    fn apply(&self, resp: &Tensor, ids: &Tensor) -> Result<Tensor> {
        let (n, _, choices) = resp.dims3()?;
        let row_flag = self
            .restricted
            .index_select(ids, 0)?
            .to_dtype(DType::F32)?
            .reshape((n, 1, 1))?;
        let beyond = Tensor::arange(0i64, choices as i64, resp.device())?
            .ge(self.low_num_choices as i64)?
            .to_dtype(DType::F32)?
            .reshape((1, 1, choices))?;
        let blocked = row_flag
            .broadcast_mul(&beyond)?
            .broadcast_as(resp.shape())?
            .ne(0f32)?;
        let floor = Tensor::full(MASKED_RESPONSE, resp.shape(), resp.device())?;
        blocked.where_cond(&floor, resp)
    }
}

// ── Layer ───────────────────────────────────────────────────────────────────

/// Hyper-parameters of a [`DpqEmbedding`].
#[derive(Debug, Clone, Copy)]
pub struct DpqConfig {
    pub num_embeddings: usize,
    pub embedding_dim: usize,
    pub num_choices: usize,
    pub num_parts: usize,
    pub share_weights: bool,
    pub mode: DpqMode,
}

/// Result of a training forward pass.
#[derive(Debug)]
pub struct DpqOutput {
    /// `(..., embedding_dim)`.
    pub embedding: Tensor,
    /// Commitment loss (vq only).
    pub reg_loss: Option<Tensor>,
    pub update: CodeUpdate,
}

pub struct DpqEmbedding {
    config: DpqConfig,
    part_dim: usize,
    query: Tensor,
    key: Tensor,
    value: Tensor,
    bn: BatchNorm,
    freq_mask: Option<FrequencyMask>,
    codes: Arc<CodeAssignment>,
}

impl DpqEmbedding {
    pub fn new(config: DpqConfig, vb: VarBuilder) -> Result<Self> {
        let DpqConfig {
            num_embeddings,
            embedding_dim,
            num_choices,
            num_parts,
            share_weights,
            mode,
        } = config;
        if num_parts == 0 || embedding_dim % num_parts != 0 {
            return Err(EmbedError::config(format!(
                "dpq: embedding_dim ({embedding_dim}) must be divisible by num_parts ({num_parts})"
            ))
            .into());
        }
        let part_dim = embedding_dim / num_parts;
        let book_rows = if share_weights {
            num_choices
        } else {
            num_parts * num_choices
        };
        let query = vb.get_with_hints(
            (num_embeddings, embedding_dim),
            "query",
            xavier_init(num_embeddings, embedding_dim),
        )?;
        let key = vb.get_with_hints(
            (book_rows, part_dim),
            "key",
            xavier_init(book_rows, part_dim),
        )?;
        let value = match mode {
            DpqMode::Vq => key.clone(),
            DpqMode::Sx => vb.get_with_hints(
                (book_rows, part_dim),
                "value",
                xavier_init(book_rows, part_dim),
            )?,
        };
        let bn_config = BatchNormConfig {
            eps: 1e-5,
            remove_mean: true,
            affine: false,
            momentum: 0.1,
        };
        let bn = batch_norm(num_choices, bn_config, vb.pp("bn"))?;
        tracing::info!(
            rows = num_embeddings,
            parts = num_parts,
            choices = num_choices,
            shared = share_weights,
            ?mode,
            "dpq embedding"
        );
        Ok(Self {
            config,
            part_dim,
            query,
            key,
            value,
            bn,
            freq_mask: None,
            codes: Arc::new(CodeAssignment::new(num_embeddings, num_parts)),
        })
    }

    pub fn config(&self) -> &DpqConfig {
        &self.config
    }

    /// Shared handle to the code table, for committing updates.
    pub fn codes(&self) -> Arc<CodeAssignment> {
        Arc::clone(&self.codes)
    }

    pub fn value_codebook(&self) -> &Tensor {
        &self.value
    }

    pub fn set_frequency_mask(&mut self, mask: FrequencyMask) -> Result<()> {
        if mask.restricted.dims1()? != self.config.num_embeddings {
            return Err(EmbedError::shape(
                "DpqEmbedding",
                format!(
                    "frequency mask covers {} rows, table has {}",
                    mask.restricted.dims1()?,
                    self.config.num_embeddings
                ),
            )
            .into());
        }
        tracing::info!(
            restricted = mask.num_restricted()?,
            low_choices = mask.low_num_choices,
            "dpq frequency mask"
        );
        self.freq_mask = Some(mask);
        Ok(())
    }

    /// Per-part codebook offsets `(1, parts)`; zeros when weights are shared.
    fn part_base(&self, device: &Device) -> Result<Tensor> {
        let parts = self.config.num_parts as i64;
        let step = if self.config.share_weights {
            0
        } else {
            self.config.num_choices as i64
        };
        let base: Vec<i64> = (0..parts).map(|p| p * step).collect();
        Tensor::from_vec(base, (1, self.config.num_parts), device)
    }

    /// Gather value rows for codes `(n, parts)`, returning `(n, parts, part_dim)`.
    fn gather_values(&self, codes: &Tensor) -> Result<Tensor> {
        let (n, parts) = codes.dims2()?;
        let idx = codes.broadcast_add(&self.part_base(codes.device())?)?;
        self.value
            .index_select(&idx.flatten_all()?, 0)?
            .reshape((n, parts, self.part_dim))
    }

    /// Training (or search) forward pass.
    pub fn forward_t(&self, ids: &Tensor, train: bool) -> Result<DpqOutput> {
        let DpqConfig {
            embedding_dim,
            num_choices,
            num_parts,
            share_weights,
            mode,
            ..
        } = self.config;
        let flat = ids.to_dtype(DType::I64)?.flatten_all()?;
        let n = flat.dims1()?;
        let query = EmbeddingLookupNode.forward(&[&self.query, &flat], ExecPath::Kernel)?;
        let inputs = query.reshape((n, num_parts, self.part_dim))?;

        let key_parts = if share_weights { 1 } else { num_parts };
        let keys = self
            .key
            .reshape((key_parts, num_choices, self.part_dim))?
            .unsqueeze(0)?;
        let q4 = inputs.unsqueeze(2)?;
        let resp = match mode {
            DpqMode::Vq => q4.broadcast_sub(&keys)?.sqr()?.sum(3)?.neg()?,
            DpqMode::Sx => q4.broadcast_mul(&keys)?.sum(3)?,
        };
        // (n, parts, choices)
        let resp = self
            .bn
            .forward_t(&resp.reshape((n * num_parts, num_choices))?, train)?
            .reshape((n, num_parts, num_choices))?;
        let resp = match &self.freq_mask {
            Some(mask) => mask.apply(&resp, &flat)?,
            None => resp,
        };

        let codes = resp.argmax(2)?.to_dtype(DType::I64)?;
        let code_vec: Vec<u32> = codes
            .flatten_all()?
            .to_vec1::<i64>()?
            .into_iter()
            .map(|c| c as u32)
            .collect();
        let update = CodeUpdate::new(flat.to_vec1()?, code_vec, num_parts)?;

        let (out, reg_loss) = match mode {
            DpqMode::Vq => {
                let chosen = self.gather_values(&codes)?;
                let out = straight_through(&chosen, &inputs)?;
                let reg = (&chosen - inputs.detach())?.sqr()?.mean_all()?;
                (out, Some(reg))
            }
            DpqMode::Sx => {
                let prob = candle_nn::ops::softmax(&resp, D::Minus1)?;
                let choice_ids = Tensor::arange(0i64, num_choices as i64, ids.device())?
                    .reshape((1, 1, num_choices))?;
                let onehot = codes
                    .unsqueeze(2)?
                    .broadcast_eq(&choice_ids)?
                    .to_dtype(prob.dtype())?;
                let onehot_st = (&prob - (&prob - onehot)?.detach())?;
                let out = if share_weights {
                    onehot_st
                        .reshape((n * num_parts, num_choices))?
                        .matmul(&self.value)?
                        .reshape((n, num_parts, self.part_dim))?
                } else {
                    let per_part = self
                        .value
                        .reshape((num_parts, num_choices, self.part_dim))?;
                    onehot_st
                        .transpose(0, 1)?
                        .contiguous()?
                        .matmul(&per_part)?
                        .transpose(0, 1)?
                };
                (out, None)
            }
        };
        let mut shape = ids.dims().to_vec();
        shape.push(embedding_dim);
        Ok(DpqOutput {
            embedding: out.reshape(shape)?,
            reg_loss,
            update,
        })
    }

    /// Inference: committed codes → value rows. Never reads the query table.
    pub fn forward_inference(&self, ids: &Tensor) -> Result<Tensor> {
        let flat = ids.to_dtype(DType::I64)?.flatten_all()?;
        let codes = self.codes.lookup(&flat)?;
        let out = self.gather_values(&codes)?;
        let mut shape = ids.dims().to_vec();
        shape.push(self.config.embedding_dim);
        out.reshape(shape)
    }
}
