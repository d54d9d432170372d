//! # embedmem-core — Compressed Embedding Engine
//!
//! Every compute primitive needed to store, look up and train compressed
//! embedding tables lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`hash`] | modulo, compositional, ROBE and learned hashes (host + kernel) |
//! | [`quantize`] | fixed-point codec, packed tables, straight-through, ALPT rounding |
//! | [`node`] | `LookupNode` contract, `Gradient` / `SparseGrad` |
//! | [`lookup`] | every compressed-lookup node |
//! | [`dpq`] | differentiable product quantization, code assignment |
//! | [`autodim`] | dimension search and retraining |
//! | [`dhe`] | deep hash embedding (learned hash → MLP) |
//! | [`deeplight`] | magnitude pruning, CSR / COO export |
//! | [`embedding`] | `EmbeddingLayer` over every scheme |
//! | [`stats`] | `compression_stats` per configuration |
//!
//! ## Design principles
//!
//! 1. **Two paths, one answer.** Every node has a host fallback and a candle
//!    kernel path; integer outputs agree exactly.
//! 2. **`Send + Sync`-safe.** Shared auxiliary state (code assignments,
//!    packed tables, sparse exports) sits behind `parking_lot` locks.
//! 3. **Explicit side effects.** Nothing a forward pass computes is written
//!    back until the caller commits it after the optimizer step.

pub mod autodim;
pub mod deeplight;
pub mod dhe;
pub mod dpq;
pub mod embedding;
pub mod hash;
pub mod lookup;
pub mod node;
pub mod quantize;
pub mod stats;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use autodim::{perturb, AutoDimEmbedding, RetrainedAutoDim};
pub use deeplight::{DeepLightEmbedding, SparseForm, SparseTable};
pub use dpq::{CodeAssignment, CodeUpdate, DpqEmbedding};
pub use embedding::{EmbeddingLayer, LayerOutput};
pub use node::{ExecPath, Gradient, LookupNode, SparseGrad};
pub use quantize::{Digit, QuantParams, QuantizedTable};
pub use stats::{compression_stats, CompressionStats};
