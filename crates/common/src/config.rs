//! Embedding-scheme configuration.
//!
//! Serialised as JSON next to checkpoints. Scheme-specific knobs live in the
//! internally tagged [`SchemeConfig`] (`"scheme": "hash"` etc.), flattened into
//! the top-level object. Optional fields carry `#[serde(default)]` so older
//! config files keep loading.

use serde::{Deserialize, Serialize};

use crate::error::EmbedError;

/// Embedding layer configuration shared by every scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Logical rows in the uncompressed embedding space.
    pub num_embeddings: usize,
    /// Output width of one embedding row.
    pub embedding_dim: usize,
    /// Number of sparse fields (slots) per example.
    #[serde(default = "default_num_slot")]
    pub num_slot: usize,
    /// Seed for hash constants, Gumbel noise and initialisation.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(flatten)]
    pub scheme: SchemeConfig,
}

/// Scheme-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum SchemeConfig {
    /// Uncompressed table.
    Full,
    /// Modulo hashing into `floor(num_embeddings * compress_rate)` rows,
    /// or `size_limit / embedding_dim` rows when a size limit is given.
    Hash {
        #[serde(default)]
        compress_rate: Option<f64>,
        #[serde(default)]
        size_limit: Option<usize>,
    },
    /// Quotient-remainder hashing across `num_tables` small tables.
    Compositional {
        num_tables: usize,
        #[serde(default)]
        aggregator: Aggregator,
    },
    /// Deep hash embedding: learned hash codes fed to an MLP.
    Learning {
        num_buckets: usize,
        num_hash: usize,
        #[serde(default = "default_mlp_dim")]
        mlp_dim: usize,
        #[serde(default = "default_mlp_layers")]
        mlp_layers: usize,
        #[serde(default)]
        dist: HashDistribution,
        /// Optional JSON prime table; sieved in memory when absent.
        #[serde(default)]
        prime_path: Option<std::path::PathBuf>,
    },
    /// ROBE shared pool with chunked wraparound addressing.
    Robe {
        robe_array_size: usize,
        /// Chunk length; `0` means "whole row" (`Z = embedding_dim`).
        #[serde(default)]
        z: usize,
        #[serde(default = "default_true")]
        use_slot_coef: bool,
    },
    /// Differentiable product quantization.
    Dpq {
        num_choices: usize,
        num_parts: usize,
        #[serde(default)]
        share_weights: bool,
        #[serde(default)]
        mode: DpqMode,
        /// Frequency-aware variant: restricted rows only see this many choices.
        #[serde(default)]
        low_num_choices: Option<usize>,
        /// Rows seen at least this often are restricted.
        #[serde(default)]
        freq_threshold: Option<u32>,
        #[serde(default = "default_reg_weight")]
        reg_weight: f64,
    },
    /// Differentiable search over candidate embedding widths.
    AutoDim {
        dim_candidates: Vec<usize>,
        #[serde(default)]
        log_alpha: bool,
        #[serde(default = "default_temperature_decay")]
        temperature_decay: f64,
        #[serde(default = "default_arch_lr")]
        arch_lr: f64,
        #[serde(default = "default_arch_r")]
        arch_r: f64,
    },
    /// Magnitude pruning with sparse CSR/COO export.
    DeepLight {
        compress_rate: f64,
        #[serde(default = "default_warm")]
        warm: f64,
    },
    /// Fixed-point storage with a fixed per-table or fitted per-row scale.
    Quantized {
        #[serde(default = "default_digit")]
        digit: u32,
        /// Per-table scale; ignored when `per_row` is set.
        #[serde(default = "default_scale")]
        scale: f32,
        #[serde(default)]
        zero_point: i64,
        #[serde(default)]
        per_row: bool,
    },
    /// Adaptive low-precision training with a learned scale.
    Alpt {
        #[serde(default = "default_digit")]
        digit: u32,
        #[serde(default = "default_scale")]
        init_scale: f32,
        #[serde(default)]
        zero_point: i64,
        #[serde(default)]
        per_row: bool,
    },
}

/// Aggregation of compositional partial embeddings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    #[default]
    Sum,
    Mul,
    Concat,
}

/// Target distribution of learned-hash codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashDistribution {
    #[default]
    Uniform,
    Normal,
}

/// DPQ selection mode, fixed for the lifetime of the layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DpqMode {
    /// Vector quantization: euclidean response, straight-through output.
    #[default]
    Vq,
    /// Softmax relaxation: dot-product response.
    Sx,
}

/// Discriminant of [`SchemeConfig`], used for behaviour tables and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemeKind {
    Full,
    Hash,
    Compositional,
    Learning,
    Robe,
    Dpq,
    AutoDim,
    DeepLight,
    Quantized,
    Alpt,
}

impl SchemeKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Hash => "hash",
            Self::Compositional => "compositional",
            Self::Learning => "learning",
            Self::Robe => "robe",
            Self::Dpq => "dpq",
            Self::AutoDim => "autodim",
            Self::DeepLight => "deeplight",
            Self::Quantized => "quantized",
            Self::Alpt => "alpt",
        }
    }
}

impl std::fmt::Display for SchemeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_num_slot() -> usize {
    26
}
fn default_seed() -> u64 {
    42
}
fn default_true() -> bool {
    true
}
fn default_mlp_dim() -> usize {
    1024
}
fn default_mlp_layers() -> usize {
    4
}
fn default_reg_weight() -> f64 {
    1e-3
}
fn default_temperature_decay() -> f64 {
    5e-5
}
fn default_arch_lr() -> f64 {
    1e-3
}
fn default_arch_r() -> f64 {
    1e-2
}
fn default_warm() -> f64 {
    100.0
}
fn default_digit() -> u32 {
    8
}
fn default_scale() -> f32 {
    0.01
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            num_embeddings: 1000,
            embedding_dim: 16,
            num_slot: 26,
            seed: 42,
            scheme: SchemeConfig::Full,
        }
    }
}

impl SchemeConfig {
    pub fn kind(&self) -> SchemeKind {
        match self {
            Self::Full => SchemeKind::Full,
            Self::Hash { .. } => SchemeKind::Hash,
            Self::Compositional { .. } => SchemeKind::Compositional,
            Self::Learning { .. } => SchemeKind::Learning,
            Self::Robe { .. } => SchemeKind::Robe,
            Self::Dpq { .. } => SchemeKind::Dpq,
            Self::AutoDim { .. } => SchemeKind::AutoDim,
            Self::DeepLight { .. } => SchemeKind::DeepLight,
            Self::Quantized { .. } => SchemeKind::Quantized,
            Self::Alpt { .. } => SchemeKind::Alpt,
        }
    }
}

impl EmbeddingConfig {
    pub fn kind(&self) -> SchemeKind {
        self.scheme.kind()
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Output width after aggregation (compositional concat widens rows).
    pub fn output_dim(&self) -> usize {
        match &self.scheme {
            SchemeConfig::Compositional {
                num_tables,
                aggregator: Aggregator::Concat,
            } => self.embedding_dim * num_tables,
            SchemeConfig::AutoDim { dim_candidates, .. } => {
                dim_candidates.iter().copied().max().unwrap_or(0)
            }
            _ => self.embedding_dim,
        }
    }

    /// Physical rows of the modulo-hash table.
    ///
    /// `size_limit / dim` wins over `compress_rate`; with neither set the
    /// table is uncompressed.
    pub fn hash_rows(&self) -> Option<usize> {
        match &self.scheme {
            SchemeConfig::Hash {
                compress_rate,
                size_limit,
            } => Some(match (size_limit, compress_rate) {
                (Some(limit), _) => limit / self.embedding_dim,
                (None, Some(rate)) => (self.num_embeddings as f64 * rate) as usize,
                (None, None) => self.num_embeddings,
            }),
            _ => None,
        }
    }

    /// Rows per compositional sub-table: smallest `r` with `r^num_tables >= num_embeddings`.
    pub fn compositional_rows(&self) -> Option<usize> {
        match &self.scheme {
            SchemeConfig::Compositional { num_tables, .. } => {
                Some(integer_root_ceil(self.num_embeddings, *num_tables))
            }
            _ => None,
        }
    }

    /// Check every construction-time contract. Violations are programmer
    /// errors and callers are expected to fail fast on them.
    pub fn validate(&self) -> Result<(), EmbedError> {
        if self.num_embeddings == 0 {
            return Err(EmbedError::config("num_embeddings must be > 0"));
        }
        if self.embedding_dim == 0 {
            return Err(EmbedError::config("embedding_dim must be > 0"));
        }
        if self.num_slot == 0 {
            return Err(EmbedError::config("num_slot must be > 0"));
        }
        match &self.scheme {
            SchemeConfig::Full => {}
            SchemeConfig::Hash {
                compress_rate,
                size_limit,
            } => {
                if compress_rate.is_some() && size_limit.is_some() {
                    return Err(EmbedError::config(
                        "hash: compress_rate and size_limit are mutually exclusive",
                    ));
                }
                if let Some(rate) = compress_rate {
                    if !(*rate > 0.0 && *rate <= 1.0) {
                        return Err(EmbedError::config(format!(
                            "hash: compress_rate must be in (0, 1], got {rate}"
                        )));
                    }
                }
                if self.hash_rows() == Some(0) {
                    return Err(EmbedError::config("hash: table would have zero rows"));
                }
            }
            SchemeConfig::Compositional { num_tables, .. } => {
                if *num_tables < 2 {
                    return Err(EmbedError::config(format!(
                        "compositional: num_tables must be >= 2, got {num_tables}"
                    )));
                }
            }
            SchemeConfig::Learning {
                num_buckets,
                num_hash,
                mlp_dim,
                mlp_layers,
                dist,
                ..
            } => {
                if *num_buckets < 2 {
                    return Err(EmbedError::config("learning: num_buckets must be >= 2"));
                }
                if *num_hash == 0 || *mlp_dim == 0 || *mlp_layers == 0 {
                    return Err(EmbedError::config(
                        "learning: num_hash, mlp_dim and mlp_layers must be > 0",
                    ));
                }
                if *dist == HashDistribution::Normal && num_hash % 2 != 0 {
                    return Err(EmbedError::config(format!(
                        "learning: num_hash must be even for the normal distribution, got {num_hash}"
                    )));
                }
            }
            SchemeConfig::Robe {
                robe_array_size, z, ..
            } => {
                if *robe_array_size == 0 {
                    return Err(EmbedError::config("robe: robe_array_size must be > 0"));
                }
                if *z > self.embedding_dim {
                    return Err(EmbedError::config(format!(
                        "robe: Z ({z}) must not exceed embedding_dim ({})",
                        self.embedding_dim
                    )));
                }
            }
            SchemeConfig::Dpq {
                num_choices,
                num_parts,
                low_num_choices,
                freq_threshold,
                ..
            } => {
                if *num_choices == 0 || *num_parts == 0 {
                    return Err(EmbedError::config(
                        "dpq: num_choices and num_parts must be > 0",
                    ));
                }
                if self.embedding_dim % num_parts != 0 {
                    return Err(EmbedError::config(format!(
                        "dpq: embedding_dim ({}) must be divisible by num_parts ({num_parts})",
                        self.embedding_dim
                    )));
                }
                match (low_num_choices, freq_threshold) {
                    (Some(low), Some(_)) => {
                        if *low == 0 || low > num_choices {
                            return Err(EmbedError::config(format!(
                                "dpq: low_num_choices must be in [1, {num_choices}], got {low}"
                            )));
                        }
                    }
                    (None, None) => {}
                    _ => {
                        return Err(EmbedError::config(
                            "dpq: low_num_choices and freq_threshold must be set together",
                        ))
                    }
                }
            }
            SchemeConfig::AutoDim {
                dim_candidates,
                temperature_decay,
                ..
            } => {
                if dim_candidates.is_empty() || dim_candidates.contains(&0) {
                    return Err(EmbedError::config(
                        "autodim: dim_candidates must be non-empty and positive",
                    ));
                }
                if *temperature_decay < 0.0 {
                    return Err(EmbedError::config("autodim: temperature_decay must be >= 0"));
                }
            }
            SchemeConfig::DeepLight {
                compress_rate,
                warm,
            } => {
                if !(*compress_rate > 0.0 && *compress_rate < 1.0) {
                    return Err(EmbedError::config(format!(
                        "deeplight: compress_rate must be in (0, 1), got {compress_rate}"
                    )));
                }
                if *warm <= 0.0 {
                    return Err(EmbedError::config("deeplight: warm must be > 0"));
                }
            }
            SchemeConfig::Quantized { digit, scale, .. } => {
                check_digit(*digit)?;
                if !(*scale > 0.0) {
                    return Err(EmbedError::config(format!(
                        "quantized: scale must be > 0, got {scale}"
                    )));
                }
            }
            SchemeConfig::Alpt {
                digit, init_scale, ..
            } => {
                check_digit(*digit)?;
                if !(*init_scale > 0.0) {
                    return Err(EmbedError::config(format!(
                        "alpt: init_scale must be > 0, got {init_scale}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_digit(digit: u32) -> Result<(), EmbedError> {
    if digit == 8 || digit == 16 {
        Ok(())
    } else {
        Err(EmbedError::config(format!(
            "digit must be 8 or 16, got {digit}"
        )))
    }
}

/// Smallest `r` such that `r^k >= n`.
pub fn integer_root_ceil(n: usize, k: usize) -> usize {
    if n <= 1 || k == 0 {
        return n.max(1);
    }
    let guess = (n as f64).powf(1.0 / k as f64).round().max(1.0) as usize;
    let covers = |r: usize| -> bool {
        let mut acc: u128 = 1;
        for _ in 0..k {
            acc = acc.saturating_mul(r as u128);
        }
        acc >= n as u128
    };
    let mut r = guess.saturating_sub(1).max(1);
    while !covers(r) {
        r += 1;
    }
    r
}

// ── Tests ───────────────────────────────────────────────────────────────────
