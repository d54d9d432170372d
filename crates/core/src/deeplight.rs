//! DeepLight: magnitude pruning of a full table with sparse export.
//!
//! Training runs on a dense table. After every optimizer step the smallest
//! `prune_rate(step)` fraction of entries (by magnitude) is zeroed, with
//!
//! ```text
//! prune_rate(step) = target · (1 − 0.99^(step / warm))
//! ```
//!
//! so pruning ramps up smoothly towards `target`. For inference the table is
//! exported once as CSR or COO, chosen from the compression rate:
//!
//! | `compress_rate · dim` | form | kept fraction |
//! |-----------------------|------|---------------|
//! | `≥ 3` | CSR | `(compress_rate · dim − 1) / 2 / dim` |
//! | `< 3` | COO | `compress_rate / 3` |
//!
//! CSR stores one value and one column per non-zero plus a row pointer; COO
//! stores a row, a column and a value per non-zero. Both fit the byte budget
//! of `compress_rate` times the dense table.
//!
//! # Thread safety
//!
//! The exported table is cached behind [`parking_lot::RwLock`] and dropped
//! whenever pruning changes the weights.

use candle_core::{DType, Result, Tensor, Var};
use candle_nn::VarBuilder;
use embedmem_common::EmbedError;
use parking_lot::RwLock;

use crate::embedding::xavier_init;
use crate::lookup::EmbeddingLookupNode;
use crate::node::{ExecPath, LookupNode};

/// Per-step decay base of the pruning ramp.
const PRUNE_DECAY: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseForm {
    Csr,
    Coo,
}

impl SparseForm {
    /// Storage form and final prune rate for a target compression rate.
    pub fn for_compress_rate(compress_rate: f64, dim: usize) -> (Self, f64) {
        let real_dim = compress_rate * dim as f64;
        if real_dim >= 3.0 {
            (Self::Csr, 1.0 - (real_dim - 1.0) / 2.0 / dim as f64)
        } else {
            (Self::Coo, 1.0 - compress_rate / 3.0)
        }
    }
}

// ── Sparse tables ───────────────────────────────────────────────────────────

/// Compressed sparse rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrTable {
    pub rows: usize,
    pub dim: usize,
    pub row_ptr: Vec<u32>,
    pub cols: Vec<u32>,
    pub values: Vec<f32>,
}

/// Coordinate list, sorted by `(row, col)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CooTable {
    pub rows: usize,
    pub dim: usize,
    pub row_idx: Vec<u32>,
    pub cols: Vec<u32>,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SparseTable {
    Csr(CsrTable),
    Coo(CooTable),
}

impl SparseTable {
    /// Build from a dense row-major `(rows, dim)` buffer, keeping non-zeros.
    pub fn from_dense(data: &[f32], rows: usize, dim: usize, form: SparseForm) -> Self {
        match form {
            SparseForm::Csr => {
                let mut row_ptr = Vec::with_capacity(rows + 1);
                let mut cols = Vec::new();
                let mut values = Vec::new();
                row_ptr.push(0);
                for r in 0..rows {
                    for (c, &v) in data[r * dim..(r + 1) * dim].iter().enumerate() {
                        if v != 0.0 {
                            cols.push(c as u32);
                            values.push(v);
                        }
                    }
                    row_ptr.push(values.len() as u32);
                }
                Self::Csr(CsrTable {
                    rows,
                    dim,
                    row_ptr,
                    cols,
                    values,
                })
            }
            SparseForm::Coo => {
                let mut row_idx = Vec::new();
                let mut cols = Vec::new();
                let mut values = Vec::new();
                for (i, &v) in data.iter().enumerate() {
                    if v != 0.0 {
                        row_idx.push((i / dim) as u32);
                        cols.push((i % dim) as u32);
                        values.push(v);
                    }
                }
                Self::Coo(CooTable {
                    rows,
                    dim,
                    row_idx,
                    cols,
                    values,
                })
            }
        }
    }

    pub fn form(&self) -> SparseForm {
        match self {
            Self::Csr(_) => SparseForm::Csr,
            Self::Coo(_) => SparseForm::Coo,
        }
    }

    pub fn nnz(&self) -> usize {
        match self {
            Self::Csr(t) => t.values.len(),
            Self::Coo(t) => t.values.len(),
        }
    }

    fn shape(&self) -> (usize, usize) {
        match self {
            Self::Csr(t) => (t.rows, t.dim),
            Self::Coo(t) => (t.rows, t.dim),
        }
    }

    pub fn nbytes(&self) -> usize {
        match self {
            Self::Csr(t) => t.row_ptr.len() * 4 + t.values.len() * 8,
            Self::Coo(t) => t.values.len() * 12,
        }
    }

    /// Write row `row` into `out` (length `dim`, pre-zeroed).
    fn fill_row(&self, row: usize, out: &mut [f32]) {
        match self {
            Self::Csr(t) => {
                let (start, end) = (t.row_ptr[row] as usize, t.row_ptr[row + 1] as usize);
                for k in start..end {
                    out[t.cols[k] as usize] = t.values[k];
                }
            }
            Self::Coo(t) => {
                let start = t.row_idx.partition_point(|&r| (r as usize) < row);
                let end = t.row_idx.partition_point(|&r| (r as usize) <= row);
                for k in start..end {
                    out[t.cols[k] as usize] = t.values[k];
                }
            }
        }
    }

    /// Dense rows for `indices` (any shape), returned as `(..., dim)` F32.
    pub fn lookup(&self, indices: &Tensor) -> Result<Tensor> {
        let (rows, dim) = self.shape();
        let ids: Vec<i64> = indices.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;
        let mut out = vec![0f32; ids.len() * dim];
        for (i, &r) in ids.iter().enumerate() {
            if r < 0 || r as usize >= rows {
                return Err(EmbedError::shape(
                    "SparseTable",
                    format!("row {r} out of range for {rows} rows"),
                )
                .into());
            }
            self.fill_row(r as usize, &mut out[i * dim..(i + 1) * dim]);
        }
        let mut shape = indices.dims().to_vec();
        shape.push(dim);
        Tensor::from_vec(out, shape, indices.device())
    }
}

// ── Layer ───────────────────────────────────────────────────────────────────

pub struct DeepLightEmbedding {
    table: Var,
    form: SparseForm,
    target_rate: f64,
    warm: f64,
    sparse: RwLock<Option<SparseTable>>,
}

impl DeepLightEmbedding {
    pub fn new(
        num_embeddings: usize,
        embedding_dim: usize,
        compress_rate: f64,
        warm: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if !(compress_rate > 0.0 && compress_rate < 1.0) || warm <= 0.0 {
            return Err(EmbedError::config(format!(
                "deeplight: need compress_rate in (0, 1) and warm > 0, got {compress_rate}, {warm}"
            ))
            .into());
        }
        let table = vb.get_with_hints(
            (num_embeddings, embedding_dim),
            "table",
            xavier_init(num_embeddings, embedding_dim),
        )?;
        let (form, target_rate) = SparseForm::for_compress_rate(compress_rate, embedding_dim);
        tracing::info!(
            ?form,
            prune_rate = target_rate,
            compress_rate,
            "deeplight sparse storage"
        );
        Ok(Self {
            table: Var::from_tensor(&table)?,
            form,
            target_rate,
            warm,
            sparse: RwLock::new(None),
        })
    }

    pub fn form(&self) -> SparseForm {
        self.form
    }

    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    pub fn table(&self) -> &Tensor {
        self.table.as_tensor()
    }

    pub fn prune_rate(&self, step: usize) -> f64 {
        self.target_rate * (1.0 - PRUNE_DECAY.powf(step as f64 / self.warm))
    }

    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        EmbeddingLookupNode.forward(&[self.table.as_tensor(), ids], ExecPath::Kernel)
    }

    /// Zero the smallest-magnitude entries for `step`. Returns how many
    /// entries are zero afterwards.
    pub fn prune(&self, step: usize) -> Result<usize> {
        let t = self.table.as_tensor();
        let (rows, dim) = t.dims2()?;
        let mut data: Vec<f32> = t.flatten_all()?.to_vec1()?;
        let k = ((self.prune_rate(step) * data.len() as f64) as usize).min(data.len());
        if k > 0 {
            let mut order: Vec<usize> = (0..data.len()).collect();
            order.select_nth_unstable_by(k - 1, |&a, &b| data[a].abs().total_cmp(&data[b].abs()));
            for &i in &order[..k] {
                data[i] = 0.0;
            }
            self.table.set(&Tensor::from_vec(data.clone(), (rows, dim), t.device())?)?;
            *self.sparse.write() = None;
        }
        let zeros = data.iter().filter(|&&v| v == 0.0).count();
        tracing::debug!(step, k, zeros, "deeplight prune");
        Ok(zeros)
    }

    /// Export the current table in its sparse form.
    pub fn export_sparse(&self) -> Result<SparseTable> {
        let t = self.table.as_tensor();
        let (rows, dim) = t.dims2()?;
        let data: Vec<f32> = t.flatten_all()?.to_vec1()?;
        Ok(SparseTable::from_dense(&data, rows, dim, self.form))
    }

    /// Inference through the cached sparse export.
    pub fn forward_inference(&self, ids: &Tensor) -> Result<Tensor> {
        if let Some(sparse) = self.sparse.read().as_ref() {
            return sparse.lookup(ids);
        }
        let sparse = self.export_sparse()?;
        let out = sparse.lookup(ids)?;
        *self.sparse.write() = Some(sparse);
        Ok(out)
    }
}
