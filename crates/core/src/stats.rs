//! Memory accounting per scheme.

use embedmem_common::{DpqMode, EmbeddingConfig, SchemeConfig, SchemeKind};

use crate::deeplight::SparseForm;
use crate::quantize::Digit;

const F32_BYTES: usize = 4;

/// Parameter and byte counts for one embedding configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionStats {
    pub kind: SchemeKind,
    /// Trainable scalars held while training.
    pub train_params: usize,
    /// Bytes needed to serve lookups after training.
    pub inference_bytes: usize,
    /// Bytes of the uncompressed F32 `(num_embeddings, embedding_dim)` table.
    pub full_bytes: usize,
    /// `full_bytes / inference_bytes`.
    pub compression_ratio: f64,
}

/// Bits needed to address `n` choices.
fn index_bits(n: usize) -> usize {
    (usize::BITS - n.saturating_sub(1).leading_zeros()).max(1) as usize
}

/// Compute parameter counts and inference bytes from config.
///
/// No layer instance needed; pure arithmetic from hyper-parameters.
pub fn compression_stats(config: &EmbeddingConfig) -> CompressionStats {
    let n = config.num_embeddings;
    let d = config.embedding_dim;
    let full = n * d;

    let (train_params, inference_bytes) = match &config.scheme {
        SchemeConfig::Full => (full, full * F32_BYTES),
        SchemeConfig::Hash { .. } => {
            let p = config.hash_rows().unwrap_or(n) * d;
            (p, p * F32_BYTES)
        }
        SchemeConfig::Compositional { num_tables, .. } => {
            let p = num_tables * config.compositional_rows().unwrap_or(n) * d;
            (p, p * F32_BYTES)
        }
        SchemeConfig::Learning {
            num_hash,
            mlp_dim,
            mlp_layers,
            ..
        } => {
            // Linear (w + b) and affine batch-norm (γ + β) per block.
            let block = |i: usize, o: usize| i * o + o + 2 * o;
            let mut p = block(*num_hash, *mlp_dim);
            p += mlp_layers.saturating_sub(1) * block(*mlp_dim, *mlp_dim);
            p += block(*mlp_dim, d);
            // Slopes, biases and primes are I64 constants.
            (p, p * F32_BYTES + 3 * num_hash * 8)
        }
        SchemeConfig::Robe {
            robe_array_size, ..
        } => (*robe_array_size, robe_array_size * F32_BYTES),
        SchemeConfig::Dpq {
            num_choices,
            num_parts,
            share_weights,
            mode,
            ..
        } => {
            let part_dim = d / (*num_parts).max(1);
            let book = if *share_weights {
                *num_choices
            } else {
                num_parts * num_choices
            } * part_dim;
            let books = match mode {
                DpqMode::Vq => book,
                DpqMode::Sx => 2 * book,
            };
            let code_bytes = (n * num_parts * index_bits(*num_choices)).div_ceil(8);
            (full + books, code_bytes + book * F32_BYTES)
        }
        SchemeConfig::AutoDim { dim_candidates, .. } => {
            let max_dim = dim_candidates.iter().copied().max().unwrap_or(0);
            let p: usize = dim_candidates
                .iter()
                .map(|&c| n * c + config.num_slot * (c * max_dim + max_dim))
                .sum();
            (p + config.num_slot * dim_candidates.len(), p * F32_BYTES)
        }
        SchemeConfig::DeepLight { compress_rate, .. } => {
            let (form, prune) = SparseForm::for_compress_rate(*compress_rate, d);
            let nnz = ((1.0 - prune) * full as f64).round() as usize;
            let bytes = match form {
                SparseForm::Csr => (n + 1) * 4 + nnz * 8,
                SparseForm::Coo => nnz * 12,
            };
            (full, bytes)
        }
        SchemeConfig::Quantized { digit, per_row, .. } => {
            let bytes_per = Digit::try_from(*digit).map(Digit::bytes).unwrap_or(F32_BYTES);
            let params = if *per_row { n * 12 } else { 12 };
            (full, full * bytes_per + params)
        }
        SchemeConfig::Alpt { digit, per_row, .. } => {
            let bytes_per = Digit::try_from(*digit).map(Digit::bytes).unwrap_or(F32_BYTES);
            let scales = if *per_row { n } else { 1 };
            (full + scales, full * bytes_per + scales * 12)
        }
    };

    let full_bytes = full * F32_BYTES;
    CompressionStats {
        kind: config.kind(),
        train_params,
        inference_bytes,
        full_bytes,
        compression_ratio: full_bytes as f64 / inference_bytes.max(1) as f64,
    }
}
