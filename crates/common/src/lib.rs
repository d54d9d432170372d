//! # embedmem-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`EmbeddingConfig`]** / **[`SchemeConfig`]**: layer hyper-parameters (serialised as JSON).
//! * **[`EmbedError`]**: error taxonomy, convertible into `candle_core::Error`.
//! * **[`PrimeTable`]**: read-only primes for learned-hash moduli.
//! * **[`CtrDataset`]** / **[`CtrBatch`]**: CTR examples and batching.
//! * **[`batch_to_tensors`]**: raw batch → Candle tensors.

pub mod config;
pub mod data;
pub mod error;
pub mod primes;

pub use config::{
    Aggregator, DpqMode, EmbeddingConfig, HashDistribution, SchemeConfig, SchemeKind,
};
pub use data::{batch_to_tensors, CtrBatch, CtrDataset, FieldLayout};
pub use error::EmbedError;
pub use primes::PrimeTable;
