//! Compressed-lookup graph nodes.
//!
//! | Node | Inputs | Output |
//! |------|--------|--------|
//! | [`EmbeddingLookupNode`] | table `(rows, dim)`, ids `(...)` | `(..., dim)` |
//! | [`ModHashNode`] | ids | ids |
//! | [`CompoHashNode`] | ids | `(..., ntable)` |
//! | [`LearnHashNode`] | ids, slopes, biases, primes | `(..., num_hash)` F32 |
//! | [`RobeHashNode`] | ids `(..., nslot)` | `(..., nslot, chunks)` offsets |
//! | [`RobeSignNode`] | ids `(..., nslot)` | `(..., nslot, dim)` ±1 |
//! | [`RobeLookupNode`] | pool, offsets `(...)` | `(..., len)` |
//! | [`QuantizeNode`] / [`DequantizeNode`] | values / codes | codes / values |
//! | [`QuantizedLookupNode`] | ids | `(..., dim)` |
//! | [`AlptRoundNode`] | `w / s`, scale | rounded values |
//! | [`AlptScaleGradNode`] | `w / s` | scale-gradient indicator |
//! | [`StraightThroughNode`] | `c`, `q` | `c` |
//!
//! Index transforms return [`Gradient::None`] for every input.

use std::sync::Arc;

use candle_core::{DType, Device, Result, Shape, Tensor, D};
use embedmem_common::EmbedError;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::hash::{self, HashDistribution, RobeLayout, RobeParams};
use crate::node::{append_dim, check_arity, sum_to_shape, ExecPath, Gradient, LookupNode, SparseGrad};
use crate::quantize::{self, Digit, QuantParams, QuantizedTable};

fn host_i64(t: &Tensor) -> Result<Vec<i64>> {
    t.to_dtype(DType::I64)?.flatten_all()?.to_vec1()
}

fn host_f32(t: &Tensor) -> Result<Vec<f32>> {
    t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()
}

fn require_rank_at_least(node: &'static str, shape: &Shape, rank: usize) -> Result<()> {
    if shape.rank() < rank {
        return Err(EmbedError::shape(
            node,
            format!("expected rank >= {rank}, got {:?}", shape.dims()),
        )
        .into());
    }
    Ok(())
}

fn same_shape(node: &'static str, a: &Shape, b: &Shape) -> Result<()> {
    if a != b {
        return Err(EmbedError::shape(
            node,
            format!("input shapes differ: {:?} vs {:?}", a.dims(), b.dims()),
        )
        .into());
    }
    Ok(())
}

fn from_host<T: candle_core::WithDType>(data: Vec<T>, shape: Shape, device: &Device) -> Result<Tensor> {
    Tensor::from_vec(data, shape, device)
}

// ── Embedding lookup ────────────────────────────────────────────────────────

/// Plain row gather from a dense table.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingLookupNode;

impl LookupNode for EmbeddingLookupNode {
    fn name(&self) -> &'static str {
        "EmbeddingLookup"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 2)?;
        if inputs[0].rank() != 2 {
            return Err(EmbedError::shape(
                self.name(),
                format!("table must be 2-D, got {:?}", inputs[0].dims()),
            )
            .into());
        }
        Ok(append_dim(&inputs[1], inputs[0].dims()[1]))
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 2)?;
        let (table, ids) = (inputs[0], inputs[1]);
        let (rows, dim) = table.dims2()?;
        let out_shape = append_dim(ids.shape(), dim);
        match path {
            ExecPath::Kernel => table
                .index_select(&ids.flatten_all()?, 0)?
                .reshape(out_shape),
            ExecPath::Host => {
                let data = host_f32(table)?;
                let idx = host_i64(ids)?;
                if let Some(&bad) = idx.iter().find(|&&i| i < 0 || i as usize >= rows) {
                    return Err(EmbedError::shape(
                        self.name(),
                        format!("row {bad} out of range for {rows} rows"),
                    )
                    .into());
                }
                let out: Vec<f32> = idx
                    .par_iter()
                    .flat_map_iter(|&r| {
                        let start = r as usize * dim;
                        data[start..start + dim].iter().copied()
                    })
                    .collect();
                from_host(out, out_shape, ids.device())?.to_dtype(table.dtype())
            }
        }
    }

    fn gradient(&self, output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 2)?;
        let (table, ids) = (inputs[0], inputs[1]);
        let dim = table.dim(1)?;
        let indices = ids.flatten_all()?.to_dtype(DType::I64)?;
        let n = indices.dims1()?;
        let values = output_grad.reshape((n, dim))?;
        let sparse = SparseGrad::new(indices, values, table.shape().clone())?;
        Ok(vec![Gradient::Sparse(sparse), Gradient::None])
    }
}

// ── Modulo / compositional hash ─────────────────────────────────────────────

/// `i mod nembed`.
#[derive(Debug, Clone, Copy)]
pub struct ModHashNode {
    pub nembed: i64,
}

impl ModHashNode {
    pub fn new(nembed: usize) -> Result<Self> {
        if nembed == 0 {
            return Err(EmbedError::config("mod hash needs nembed > 0").into());
        }
        Ok(Self {
            nembed: nembed as i64,
        })
    }
}

impl LookupNode for ModHashNode {
    fn name(&self) -> &'static str {
        "ModHash"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 1)?;
        Ok(inputs[0].clone())
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 1)?;
        let x = inputs[0];
        match path {
            ExecPath::Kernel => hash::mod_hash_kernel(&x.to_dtype(DType::I64)?, self.nembed),
            ExecPath::Host => from_host(
                hash::mod_hash_host(&host_i64(x)?, self.nembed),
                x.shape().clone(),
                x.device(),
            ),
        }
    }

    fn gradient(&self, _output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 1)?;
        Ok(vec![Gradient::None])
    }
}

/// Quotient-remainder split into `ntable` digits of base `nembed`.
#[derive(Debug, Clone, Copy)]
pub struct CompoHashNode {
    pub ntable: usize,
    pub nembed: i64,
}

impl CompoHashNode {
    pub fn new(ntable: usize, nembed: usize) -> Result<Self> {
        if ntable == 0 || nembed == 0 {
            return Err(EmbedError::config("compo hash needs ntable > 0 and nembed > 0").into());
        }
        Ok(Self {
            ntable,
            nembed: nembed as i64,
        })
    }
}

impl LookupNode for CompoHashNode {
    fn name(&self) -> &'static str {
        "CompoHash"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 1)?;
        Ok(append_dim(&inputs[0], self.ntable))
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 1)?;
        let x = inputs[0];
        match path {
            ExecPath::Kernel => {
                hash::compo_hash_kernel(&x.to_dtype(DType::I64)?, self.ntable, self.nembed)
            }
            ExecPath::Host => from_host(
                hash::compo_hash_host(&host_i64(x)?, self.ntable, self.nembed),
                append_dim(x.shape(), self.ntable),
                x.device(),
            ),
        }
    }

    fn gradient(&self, _output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 1)?;
        Ok(vec![Gradient::None])
    }
}

// ── Learned hash ────────────────────────────────────────────────────────────

/// `num_hash` affine-modular hashes rescaled to `[-1, 1]` or Box–Muller
/// normals. Inputs: ids, slopes, biases, primes (all I64).
#[derive(Debug, Clone, Copy)]
pub struct LearnHashNode {
    pub nbucket: i64,
    pub dist: HashDistribution,
}

impl LearnHashNode {
    pub fn new(nbucket: usize, dist: HashDistribution) -> Result<Self> {
        if nbucket < 2 {
            return Err(EmbedError::config("learned hash needs nbucket >= 2").into());
        }
        Ok(Self {
            nbucket: nbucket as i64,
            dist,
        })
    }
}

impl LookupNode for LearnHashNode {
    fn name(&self) -> &'static str {
        "LearnHash"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 4)?;
        same_shape(self.name(), &inputs[1], &inputs[2])?;
        same_shape(self.name(), &inputs[1], &inputs[3])?;
        if inputs[1].rank() != 1 {
            return Err(EmbedError::shape(
                self.name(),
                format!("hash parameters must be 1-D, got {:?}", inputs[1].dims()),
            )
            .into());
        }
        let nh = inputs[1].dims()[0];
        if self.dist == HashDistribution::Normal && nh % 2 != 0 {
            return Err(EmbedError::shape(
                self.name(),
                format!("normal distribution needs an even num_hash, got {nh}"),
            )
            .into());
        }
        Ok(append_dim(&inputs[0], nh))
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 4)?;
        let (x, slopes, biases, primes) = (inputs[0], inputs[1], inputs[2], inputs[3]);
        match path {
            ExecPath::Kernel => hash::learn_hash_kernel(
                &x.to_dtype(DType::I64)?,
                slopes,
                biases,
                primes,
                self.nbucket,
                self.dist,
            ),
            ExecPath::Host => {
                let nh = slopes.dims1()?;
                let out = hash::learn_hash_host(
                    &host_i64(x)?,
                    &host_i64(slopes)?,
                    &host_i64(biases)?,
                    &host_i64(primes)?,
                    self.nbucket,
                    self.dist,
                )?;
                from_host(out, append_dim(x.shape(), nh), x.device())
            }
        }
    }

    fn gradient(&self, _output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 4)?;
        Ok(vec![Gradient::None; 4])
    }
}

// ── ROBE ────────────────────────────────────────────────────────────────────

/// Chunk base offsets into the shared pool.
#[derive(Debug, Clone, Copy)]
pub struct RobeHashNode {
    pub params: RobeParams,
    pub layout: RobeLayout,
}

impl LookupNode for RobeHashNode {
    fn name(&self) -> &'static str {
        "RobeHash"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 1)?;
        require_rank_at_least(self.name(), &inputs[0], 1)?;
        Ok(append_dim(&inputs[0], self.layout.num_chunks()))
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 1)?;
        let x = inputs[0];
        match path {
            ExecPath::Kernel => {
                hash::robe_offsets_kernel(&x.to_dtype(DType::I64)?, &self.params, &self.layout)
            }
            ExecPath::Host => {
                let nslot = x.dim(D::Minus1)?;
                from_host(
                    hash::robe_offsets_host(&host_i64(x)?, nslot, &self.params, &self.layout),
                    append_dim(x.shape(), self.layout.num_chunks()),
                    x.device(),
                )
            }
        }
    }

    fn gradient(&self, _output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 1)?;
        Ok(vec![Gradient::None])
    }
}

/// Per-element ±1 signs.
#[derive(Debug, Clone, Copy)]
pub struct RobeSignNode {
    pub params: RobeParams,
    pub layout: RobeLayout,
}

impl LookupNode for RobeSignNode {
    fn name(&self) -> &'static str {
        "RobeSign"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 1)?;
        require_rank_at_least(self.name(), &inputs[0], 1)?;
        Ok(append_dim(&inputs[0], self.layout.dim))
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 1)?;
        let x = inputs[0];
        match path {
            ExecPath::Kernel => {
                hash::robe_signs_kernel(&x.to_dtype(DType::I64)?, &self.params, &self.layout)
            }
            ExecPath::Host => {
                let nslot = x.dim(D::Minus1)?;
                from_host(
                    hash::robe_signs_host(&host_i64(x)?, nslot, &self.params, &self.layout),
                    append_dim(x.shape(), self.layout.dim),
                    x.device(),
                )
            }
        }
    }

    fn gradient(&self, _output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 1)?;
        Ok(vec![Gradient::None])
    }
}

/// Wrapped slices of length `len` from a `(S,)` or `(S, 1)` pool.
#[derive(Debug, Clone, Copy)]
pub struct RobeLookupNode {
    pub len: usize,
}

impl RobeLookupNode {
    /// Pool addresses `(offset + w) mod S` for `w < len`, shape `(..., len)`.
    fn addresses(&self, offsets: &Tensor, size: usize) -> Result<Tensor> {
        let steps = Tensor::arange(0i64, self.len as i64, offsets.device())?;
        let raw = offsets
            .to_dtype(DType::I64)?
            .unsqueeze(D::Minus1)?
            .broadcast_add(&steps)?;
        hash::floor_mod(&raw, size as i64)
    }
}

impl LookupNode for RobeLookupNode {
    fn name(&self) -> &'static str {
        "RobeLookup"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 2)?;
        let pool = &inputs[0];
        let ok = pool.rank() == 1 || (pool.rank() == 2 && pool.dims()[1] == 1);
        if !ok || pool.elem_count() == 0 {
            return Err(EmbedError::shape(
                self.name(),
                format!("pool must be (S,) or (S, 1), got {:?}", pool.dims()),
            )
            .into());
        }
        Ok(append_dim(&inputs[1], self.len))
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 2)?;
        let (pool, offsets) = (inputs[0], inputs[1]);
        let size = pool.dim(0)?;
        let out_shape = append_dim(offsets.shape(), self.len);
        match path {
            ExecPath::Kernel => {
                let addr = self.addresses(offsets, size)?;
                pool.flatten_all()?
                    .index_select(&addr.flatten_all()?, 0)?
                    .reshape(out_shape)
            }
            ExecPath::Host => {
                let data = host_f32(pool)?;
                let offs = host_i64(offsets)?;
                let out: Vec<f32> = offs
                    .par_iter()
                    .flat_map_iter(|&o| {
                        let start = o.rem_euclid(size as i64) as usize;
                        hash::robe_slice(&data, start, self.len)
                    })
                    .collect();
                from_host(out, out_shape, offsets.device())?.to_dtype(pool.dtype())
            }
        }
    }

    /// Scatter-add of the upstream gradient into the pool at the same wrapped
    /// addresses.
    fn gradient(&self, output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 2)?;
        let (pool, offsets) = (inputs[0], inputs[1]);
        let indices = self
            .addresses(offsets, pool.dim(0)?)?
            .flatten_all()?;
        let n = indices.dims1()?;
        let values = if pool.rank() == 2 {
            output_grad.reshape((n, 1))?
        } else {
            output_grad.reshape(n)?
        };
        let sparse = SparseGrad::new(indices, values, pool.shape().clone())?;
        Ok(vec![Gradient::Sparse(sparse), Gradient::None])
    }
}

// ── Quantisation ────────────────────────────────────────────────────────────

/// Float → I64 codes with a per-table pair.
#[derive(Debug, Clone, Copy)]
pub struct QuantizeNode {
    pub scale: f32,
    pub zero_point: i64,
    pub digit: Digit,
}

impl LookupNode for QuantizeNode {
    fn name(&self) -> &'static str {
        "Quantize"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 1)?;
        Ok(inputs[0].clone())
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 1)?;
        let x = inputs[0];
        match path {
            ExecPath::Kernel => {
                let dev = x.device();
                quantize::quantize_kernel(
                    &x.to_dtype(DType::F32)?,
                    &Tensor::new(self.scale, dev)?,
                    &Tensor::new(self.zero_point, dev)?,
                    self.digit,
                )
            }
            ExecPath::Host => from_host(
                quantize::quantize_host(&host_f32(x)?, self.scale, self.zero_point, self.digit),
                x.shape().clone(),
                x.device(),
            ),
        }
    }

    fn gradient(&self, _output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 1)?;
        Ok(vec![Gradient::None])
    }
}

/// I64 codes → F32 with a per-table pair.
#[derive(Debug, Clone, Copy)]
pub struct DequantizeNode {
    pub scale: f32,
    pub zero_point: i64,
}

impl LookupNode for DequantizeNode {
    fn name(&self) -> &'static str {
        "Dequantize"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 1)?;
        Ok(inputs[0].clone())
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 1)?;
        let q = inputs[0];
        match path {
            ExecPath::Kernel => {
                let dev = q.device();
                quantize::dequantize_kernel(
                    &q.to_dtype(DType::I64)?,
                    &Tensor::new(self.scale, dev)?,
                    &Tensor::new(self.zero_point, dev)?,
                )
            }
            ExecPath::Host => from_host(
                quantize::dequantize_host(&host_i64(q)?, self.scale, self.zero_point),
                q.shape().clone(),
                q.device(),
            ),
        }
    }

    fn gradient(&self, _output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 1)?;
        Ok(vec![Gradient::None])
    }
}

/// Dequantised row gather from a shared packed table.
///
/// The table handle is shared with the owning layer, which requantises it
/// after optimizer steps.
#[derive(Debug, Clone)]
pub struct QuantizedLookupNode {
    pub table: Arc<RwLock<QuantizedTable>>,
}

impl LookupNode for QuantizedLookupNode {
    fn name(&self) -> &'static str {
        "QuantizedLookup"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 1)?;
        Ok(append_dim(&inputs[0], self.table.read().dim()))
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 1)?;
        let ids = inputs[0];
        let table = self.table.read();
        match path {
            ExecPath::Host => table.lookup(&ids.to_dtype(DType::I64)?),
            ExecPath::Kernel => {
                let dev = ids.device();
                let flat = ids.to_dtype(DType::I64)?.flatten_all()?;
                let codes = table.codes_tensor(dev)?.index_select(&flat, 0)?;
                let (scale, zp) = table.params().to_tensors(dev)?;
                let (scale, zp) = match table.params() {
                    QuantParams::PerTable { .. } => (scale, zp),
                    QuantParams::PerRow { .. } => {
                        (scale.index_select(&flat, 0)?, zp.index_select(&flat, 0)?)
                    }
                };
                quantize::dequantize_kernel(&codes, &scale, &zp)?
                    .reshape(append_dim(ids.shape(), table.dim()))
            }
        }
    }

    fn gradient(&self, _output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 1)?;
        Ok(vec![Gradient::None])
    }
}

// ── ALPT ────────────────────────────────────────────────────────────────────

/// `s · clamp(round(v))` over `v = w / s`. Inputs: `v`, scale (broadcastable).
#[derive(Debug, Clone, Copy)]
pub struct AlptRoundNode {
    pub zero_point: i64,
    pub digit: Digit,
}

impl LookupNode for AlptRoundNode {
    fn name(&self) -> &'static str {
        "AlptRound"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 2)?;
        let (v, s) = (&inputs[0], &inputs[1]);
        let broadcastable = s.rank() <= v.rank()
            && s.dims()
                .iter()
                .rev()
                .zip(v.dims().iter().rev())
                .all(|(&a, &b)| a == 1 || a == b);
        if !broadcastable {
            return Err(EmbedError::shape(
                self.name(),
                format!("scale {:?} does not broadcast to {:?}", s.dims(), v.dims()),
            )
            .into());
        }
        Ok(v.clone())
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 2)?;
        let (v, scale) = (inputs[0], inputs[1]);
        match path {
            ExecPath::Kernel => quantize::alpt_round_kernel(v, scale, self.zero_point, self.digit),
            ExecPath::Host => {
                let scales = host_f32(&scale.broadcast_as(v.shape())?.contiguous()?)?;
                from_host(
                    quantize::alpt_round_host(&host_f32(v)?, &scales, self.zero_point, self.digit),
                    v.shape().clone(),
                    v.device(),
                )
            }
        }
    }

    /// `[None, upstream · indicator(v)]`, reduced to the scale's shape.
    fn gradient(&self, output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 2)?;
        let (v, scale) = (inputs[0], inputs[1]);
        let ind = AlptScaleGradNode {
            zero_point: self.zero_point,
            digit: self.digit,
        }
        .compute(&[v], ExecPath::Kernel)?;
        let g = sum_to_shape(&(output_grad * ind)?, scale.shape())?;
        Ok(vec![Gradient::None, Gradient::Dense(g)])
    }
}

/// LSQ scale-gradient indicator. A gradient node: its own gradient is
/// unsupported.
#[derive(Debug, Clone, Copy)]
pub struct AlptScaleGradNode {
    pub zero_point: i64,
    pub digit: Digit,
}

impl LookupNode for AlptScaleGradNode {
    fn name(&self) -> &'static str {
        "AlptScaleGrad"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 1)?;
        Ok(inputs[0].clone())
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 1)?;
        let v = inputs[0];
        match path {
            ExecPath::Kernel => quantize::alpt_scale_grad_kernel(v, self.zero_point, self.digit),
            ExecPath::Host => from_host(
                quantize::alpt_scale_grad_host(&host_f32(v)?, self.zero_point, self.digit),
                v.shape().clone(),
                v.device(),
            ),
        }
    }

    fn gradient(&self, _output_grad: &Tensor, _inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        Err(EmbedError::unsupported(self.name(), "second-order gradient").into())
    }
}

// ── Straight-through ────────────────────────────────────────────────────────

/// Forward `c`, identity gradient into `q`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StraightThroughNode;

impl LookupNode for StraightThroughNode {
    fn name(&self) -> &'static str {
        "StraightThrough"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        check_arity(self.name(), inputs, 2)?;
        same_shape(self.name(), &inputs[0], &inputs[1])?;
        Ok(inputs[0].clone())
    }

    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        check_arity(self.name(), inputs, 2)?;
        let (c, q) = (inputs[0], inputs[1]);
        match path {
            ExecPath::Kernel => quantize::straight_through(c, q),
            ExecPath::Host => from_host(host_f32(c)?, c.shape().clone(), c.device())?.to_dtype(c.dtype()),
        }
    }

    fn gradient(&self, output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>> {
        check_arity(self.name(), inputs, 2)?;
        Ok(vec![Gradient::None, Gradient::Dense(output_grad.clone())])
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn both(node: &dyn LookupNode, inputs: &[&Tensor]) -> (Tensor, Tensor) {
        (
            node.forward(inputs, ExecPath::Host).unwrap(),
            node.forward(inputs, ExecPath::Kernel).unwrap(),
        )
    }

    fn assert_same_i64(a: &Tensor, b: &Tensor) {
        assert_eq!(a.dims(), b.dims());
        let av: Vec<i64> = a.flatten_all().unwrap().to_vec1().unwrap();
        let bv: Vec<i64> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(av, bv);
    }

    fn assert_close_f32(a: &Tensor, b: &Tensor) {
        assert_eq!(a.dims(), b.dims());
        let av: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let bv: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in av.iter().zip(bv.iter()) {
            assert!((x - y).abs() <= 1e-7 * y.abs().max(1.0), "{x} vs {y}");
        }
    }

    #[test]
    fn hash_table_end_to_end() {
        // 1000 logical rows at rate 0.1 → 100 physical rows
        let dev = Device::Cpu;
        let table: Vec<f32> = (0..100 * 8).map(|i| i as f32).collect();
        let table = Tensor::from_vec(table, (100, 8), &dev).unwrap();
        let ids = Tensor::new(&[0i64, 999, 1_000_000], &dev).unwrap();
        let node = ModHashNode::new(100).unwrap();
        let (h, k) = both(&node, &[&ids]);
        assert_same_i64(&h, &k);
        let hv: Vec<i64> = h.to_vec1().unwrap();
        assert_eq!(hv, vec![0, 99, 0]);
        let (eh, ek) = both(&EmbeddingLookupNode, &[&table, &k]);
        assert_close_f32(&eh, &ek);
        let rows: Vec<Vec<f32>> = ek.to_vec2().unwrap();
        assert_eq!(rows[1][0], 99.0 * 8.0);
        assert_eq!(rows[0], rows[2]);
    }

    #[test]
    fn infer_shape_rejects_bad_inputs() {
        let s = |d: &[usize]| Shape::from(d.to_vec());
        assert!(ModHashNode::new(10).unwrap().infer_shape(&[s(&[2]), s(&[2])]).is_err());
        assert!(EmbeddingLookupNode.infer_shape(&[s(&[10]), s(&[3])]).is_err());
        let lh = LearnHashNode::new(100, HashDistribution::Uniform).unwrap();
        assert!(lh.infer_shape(&[s(&[4]), s(&[2]), s(&[3]), s(&[2])]).is_err());
        assert_eq!(
            lh.infer_shape(&[s(&[4, 2]), s(&[6]), s(&[6]), s(&[6])]).unwrap().dims(),
            &[4, 2, 6]
        );
        let normal = LearnHashNode::new(100, HashDistribution::Normal).unwrap();
        assert!(normal.infer_shape(&[s(&[4]), s(&[3]), s(&[3]), s(&[3])]).is_err());
        assert!(RobeLookupNode { len: 4 }.infer_shape(&[s(&[10, 2]), s(&[3])]).is_err());
        assert!(ModHashNode::new(0).is_err());
    }

    #[test]
    fn embedding_lookup_gradient_is_sparse_scatter() {
        let dev = Device::Cpu;
        let table = Var::new(&[[1f32, 2.0], [3.0, 4.0], [5.0, 6.0]], &dev).unwrap();
        let ids = Tensor::new(&[[2i64, 0], [2, 1]], &dev).unwrap();
        let out = EmbeddingLookupNode
            .forward(&[table.as_tensor(), &ids], ExecPath::Kernel)
            .unwrap();
        let upstream = Tensor::arange(0f32, 8.0, &dev).unwrap().reshape((2, 2, 2)).unwrap();
        let grads = EmbeddingLookupNode
            .gradient(&upstream, &[table.as_tensor(), &ids])
            .unwrap();
        assert!(grads[1].is_none());
        let dense = grads[0].to_dense().unwrap().unwrap();
        // autodiff through index_select gives the same scatter-add
        let auto = (out * &upstream).unwrap().sum_all().unwrap().backward().unwrap();
        let expect: Vec<Vec<f32>> = auto.get(table.as_tensor()).unwrap().to_vec2().unwrap();
        let got: Vec<Vec<f32>> = dense.to_vec2().unwrap();
        assert_eq!(got, expect);
        assert_eq!(got[2], vec![4.0, 6.0]);
    }

    #[test]
    fn compo_hash_paths_agree() {
        let ids = Tensor::new(&[[0i64, 5, 99], [123, 4567, 99_999]], &Device::Cpu).unwrap();
        let node = CompoHashNode::new(3, 47).unwrap();
        let (h, k) = both(&node, &[&ids]);
        assert_eq!(k.dims(), &[2, 3, 3]);
        assert_same_i64(&h, &k);
    }

    #[test]
    fn learn_hash_paths_agree() {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(1);
        let primes = [1_000_003u64, 1_000_033, 1_000_037];
        let p = hash::LearnHashParams::from_rng(&mut rng, 6, 1_000_000, &primes);
        let (s, b, pr) = p.to_tensors(&dev).unwrap();
        let ids = Tensor::new(&[[3i64, 17], [123_456_789, 42]], &dev).unwrap();
        for dist in [HashDistribution::Uniform, HashDistribution::Normal] {
            let node = LearnHashNode::new(1_000_000, dist).unwrap();
            let (h, k) = both(&node, &[&ids, &s, &b, &pr]);
            assert_eq!(k.dims(), &[2, 2, 6]);
            assert_close_f32(&h, &k);
            assert!(node.gradient(&k, &[&ids, &s, &b, &pr]).unwrap().iter().all(Gradient::is_none));
        }
    }

    #[test]
    fn robe_nodes_paths_agree_and_wrap() {
        let dev = Device::Cpu;
        let params = RobeParams::from_rng(&mut StdRng::seed_from_u64(2));
        let layout = RobeLayout {
            size: 10,
            z: 5,
            dim: 8,
            use_slot_coef: true,
        };
        let ids = Tensor::new(&[[1i64, 2, 3], [4, 5, 6]], &dev).unwrap();
        let (h, k) = both(&RobeHashNode { params, layout }, &[&ids]);
        assert_eq!(k.dims(), &[2, 3, 2]);
        assert_same_i64(&h, &k);
        let (sh, sk) = both(&RobeSignNode { params, layout }, &[&ids]);
        assert_eq!(sk.dims(), &[2, 3, 8]);
        assert_close_f32(&sh, &sk);

        let pool = Tensor::arange(0f32, 10.0, &dev).unwrap().reshape((10, 1)).unwrap();
        let offs = Tensor::new(&[8i64, 2], &dev).unwrap();
        let node = RobeLookupNode { len: 5 };
        let (lh, lk) = both(&node, &[&pool, &offs]);
        assert_close_f32(&lh, &lk);
        let v: Vec<Vec<f32>> = lk.to_vec2().unwrap();
        assert_eq!(v[0], vec![8.0, 9.0, 0.0, 1.0, 2.0]);
        assert_eq!(v[1], vec![2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn robe_lookup_wraps_out_of_range_offsets_on_both_paths() {
        let dev = Device::Cpu;
        let pool = Tensor::arange(0f32, 10.0, &dev).unwrap();
        let offs = Tensor::new(&[12i64, -1], &dev).unwrap();
        let node = RobeLookupNode { len: 3 };
        let (lh, lk) = both(&node, &[&pool, &offs]);
        assert_close_f32(&lh, &lk);
        let v: Vec<Vec<f32>> = lh.to_vec2().unwrap();
        assert_eq!(v[0], vec![2.0, 3.0, 4.0]);
        assert_eq!(v[1], vec![9.0, 0.0, 1.0]);
    }

    #[test]
    fn robe_lookup_gradient_scatters_into_pool() {
        let dev = Device::Cpu;
        let pool = Var::zeros((10, 1), DType::F32, &dev).unwrap();
        let offs = Tensor::new(&[8i64], &dev).unwrap();
        let node = RobeLookupNode { len: 5 };
        let out = node.forward(&[pool.as_tensor(), &offs], ExecPath::Kernel).unwrap();
        let upstream = Tensor::new(&[[1f32, 2.0, 3.0, 4.0, 5.0]], &dev).unwrap();
        let grads = node.gradient(&upstream, &[pool.as_tensor(), &offs]).unwrap();
        let dense: Vec<f32> = grads[0].to_dense().unwrap().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(dense, vec![3.0, 4.0, 5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);
        let auto = (out * &upstream).unwrap().sum_all().unwrap().backward().unwrap();
        let expect: Vec<f32> = auto.get(pool.as_tensor()).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(dense, expect);
    }

    #[test]
    fn quantize_nodes_paths_agree() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0.035f32, -0.5], [2.0, -0.004]], &dev).unwrap();
        let qn = QuantizeNode {
            scale: 0.01,
            zero_point: 0,
            digit: Digit::Eight,
        };
        let (qh, qk) = both(&qn, &[&x]);
        assert_same_i64(&qh, &qk);
        let qv: Vec<Vec<i64>> = qk.to_vec2().unwrap();
        assert_eq!(qv, vec![vec![4, -50], vec![127, 0]]);
        let dn = DequantizeNode {
            scale: 0.01,
            zero_point: 0,
        };
        let (dh, dk) = both(&dn, &[&qk]);
        assert_close_f32(&dh, &dk);
    }

    #[test]
    fn quantized_lookup_paths_agree() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[[0.1f32, -0.2], [0.3, 0.4], [-0.5, 0.6]], &dev).unwrap();
        for params in [
            QuantParams::PerTable {
                scale: 0.01,
                zero_point: 0,
            },
            QuantParams::fit_rows(&t, Digit::Eight).unwrap(),
        ] {
            let table = QuantizedTable::from_tensor(&t, params, Digit::Eight).unwrap();
            let node = QuantizedLookupNode {
                table: Arc::new(RwLock::new(table)),
            };
            let ids = Tensor::new(&[[2i64, 0], [1, 1]], &dev).unwrap();
            let (h, k) = both(&node, &[&ids]);
            assert_eq!(k.dims(), &[2, 2, 2]);
            assert_close_f32(&h, &k);
        }
    }

    #[test]
    fn alpt_nodes() {
        let dev = Device::Cpu;
        let v = Tensor::new(&[[1.3f32, -2.7], [300.0, 0.2]], &dev).unwrap();
        let scale = Tensor::new(&[[0.1f32], [0.2]], &dev).unwrap();
        let node = AlptRoundNode {
            zero_point: 0,
            digit: Digit::Eight,
        };
        let (h, k) = both(&node, &[&v, &scale]);
        assert_close_f32(&h, &k);
        let upstream = Tensor::ones((2, 2), DType::F32, &dev).unwrap();
        let g = node.gradient(&upstream, &[&v, &scale]).unwrap();
        assert!(g[0].is_none());
        let gs: Vec<Vec<f32>> = g[1].to_dense().unwrap().unwrap().to_vec2().unwrap();
        assert!((gs[0][0] + 0.6).abs() < 1e-5);
        assert!((gs[1][0] - 126.8).abs() < 1e-4);

        let sg = AlptScaleGradNode {
            zero_point: 0,
            digit: Digit::Eight,
        };
        let (ih, ik) = both(&sg, &[&v]);
        assert_close_f32(&ih, &ik);
        let err = sg.gradient(&upstream, &[&v]).unwrap_err();
        assert!(err.to_string().contains("second-order"));
    }

    #[test]
    fn straight_through_node_routes_identity() {
        let dev = Device::Cpu;
        let c = Tensor::new(&[1f32, 2.0], &dev).unwrap();
        let q = Tensor::new(&[0f32, 0.0], &dev).unwrap();
        let (h, k) = both(&StraightThroughNode, &[&c, &q]);
        assert_close_f32(&h, &k);
        let v: Vec<f32> = k.to_vec1().unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
        let up = Tensor::new(&[0.5f32, -1.0], &dev).unwrap();
        let g = StraightThroughNode.gradient(&up, &[&c, &q]).unwrap();
        let gq: Vec<f32> = g[1].to_dense().unwrap().unwrap().to_vec1().unwrap();
        assert_eq!(gq, vec![0.5, -1.0]);
        assert!(StraightThroughNode.infer_shape(&[Shape::from(2), Shape::from(3)]).is_err());
    }
}
