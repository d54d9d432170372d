//! Node contract shared by every compressed-lookup operation.
//!
//! A node has three methods. [`LookupNode::infer_shape`] validates input
//! shapes before any compute runs. [`LookupNode::compute`] produces the
//! output on one of two execution paths. [`LookupNode::gradient`] routes an
//! upstream gradient back to each input as a [`Gradient`].
//!
//! The two paths must agree exactly on integer outputs and within
//! `rtol = 1e-7` on float outputs:
//!
//! * [`ExecPath::Host`] copies inputs to host vectors and runs a scalar,
//!   `rayon`-parallel loop. Always available.
//! * [`ExecPath::Kernel`] composes candle tensor ops and stays on the
//!   inputs' device. Differentiable where the underlying ops are.

use candle_core::{Result, Shape, Tensor};
use embedmem_common::EmbedError;

/// Which implementation of `compute` to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecPath {
    /// Portable scalar fallback over host copies of the inputs.
    Host,
    /// Candle tensor kernels on the inputs' device.
    #[default]
    Kernel,
}

// ── Gradients ───────────────────────────────────────────────────────────────

/// Row-sparse gradient: `values[i]` is added to row `indices[i]` of a dense
/// tensor of shape `dense_shape`. Duplicate indices accumulate.
#[derive(Debug, Clone)]
pub struct SparseGrad {
    /// I64, rank 1.
    pub indices: Tensor,
    /// `(indices.len(), dense_shape[1..])`.
    pub values: Tensor,
    pub dense_shape: Shape,
}

impl SparseGrad {
    pub fn new(indices: Tensor, values: Tensor, dense_shape: Shape) -> Result<Self> {
        let n = indices.dims1()?;
        if values.dim(0)? != n || values.dims()[1..] != dense_shape.dims()[1..] {
            return Err(EmbedError::shape(
                "SparseGrad",
                format!(
                    "values {:?} incompatible with {n} indices into {:?}",
                    values.dims(),
                    dense_shape.dims()
                ),
            )
            .into());
        }
        Ok(Self {
            indices,
            values,
            dense_shape,
        })
    }

    /// Scatter-add into a zero tensor of `dense_shape`.
    pub fn to_dense(&self) -> Result<Tensor> {
        let zeros = Tensor::zeros(
            self.dense_shape.clone(),
            self.values.dtype(),
            self.values.device(),
        )?;
        zeros.index_add(&self.indices, &self.values, 0)
    }
}

/// Gradient with respect to one node input.
#[derive(Debug, Clone)]
pub enum Gradient {
    /// The input is not differentiable (indices, hash parameters).
    None,
    Dense(Tensor),
    Sparse(SparseGrad),
}

impl Gradient {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Materialise as a dense tensor; `None` stays `None`.
    pub fn to_dense(&self) -> Result<Option<Tensor>> {
        match self {
            Self::None => Ok(None),
            Self::Dense(t) => Ok(Some(t.clone())),
            Self::Sparse(s) => s.to_dense().map(Some),
        }
    }
}

// ── Node trait ──────────────────────────────────────────────────────────────

/// A graph node over index batches and embedding tables.
pub trait LookupNode: Send + Sync {
    /// Short name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Output shape for the given input shapes. Fails on wrong arity, rank,
    /// or mismatched multi-input shapes.
    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape>;

    /// Produce the output. Callers normally go through [`LookupNode::forward`].
    fn compute(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor>;

    /// One entry per input, in input order.
    fn gradient(&self, output_grad: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Gradient>>;

    /// Shape-check, then compute.
    fn forward(&self, inputs: &[&Tensor], path: ExecPath) -> Result<Tensor> {
        let shapes: Vec<Shape> = inputs.iter().map(|t| t.shape().clone()).collect();
        let expected = self.infer_shape(&shapes)?;
        let out = self.compute(inputs, path)?;
        if out.shape() != &expected {
            return Err(EmbedError::shape(
                self.name(),
                format!("computed {:?}, inferred {:?}", out.dims(), expected.dims()),
            )
            .into());
        }
        Ok(out)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

pub(crate) fn check_arity<T>(node: &'static str, inputs: &[T], expected: usize) -> Result<()> {
    if inputs.len() != expected {
        return Err(EmbedError::shape(
            node,
            format!("expected {expected} input(s), got {}", inputs.len()),
        )
        .into());
    }
    Ok(())
}

/// `dims ++ [extra]`.
pub(crate) fn append_dim(shape: &Shape, extra: usize) -> Shape {
    let mut dims = shape.dims().to_vec();
    dims.push(extra);
    Shape::from(dims)
}

/// Reduce `grad` by summation until it has `target`'s shape. Leading axes
/// are summed away; axes where `target` is 1 are summed with keepdim.
pub(crate) fn sum_to_shape(grad: &Tensor, target: &Shape) -> Result<Tensor> {
    let mut g = grad.clone();
    while g.rank() > target.rank() {
        g = g.sum(0)?;
    }
    for (axis, &t) in target.dims().iter().enumerate() {
        if t == 1 && g.dim(axis)? != 1 {
            g = g.sum_keepdim(axis)?;
        }
    }
    g.reshape(target.clone())
}
