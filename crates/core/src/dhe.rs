//! Deep hash embedding (DHE).
//!
//! No table at all: each id is encoded by `num_hash` learned hashes into a
//! dense `[-1, 1]` (or Gaussian) code, and an MLP decodes the code into the
//! embedding.
//!
//! ```text
//! code = learn_hash(id)                      (num_hash,)
//! h    = [Linear → BatchNorm → ReLU] × mlp_layers
//! out  =  Linear → BatchNorm → ReLU          (embedding_dim,)
//! ```

use candle_core::{Result, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, BatchNormConfig, Linear, Module, ModuleT, VarBuilder};
use embedmem_common::{EmbedError, HashDistribution, PrimeTable};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::hash::LearnHashParams;
use crate::lookup::LearnHashNode;
use crate::node::{ExecPath, LookupNode};

#[derive(Debug, Clone, Copy)]
pub struct DheConfig {
    pub embedding_dim: usize,
    pub num_buckets: usize,
    pub num_hash: usize,
    pub mlp_dim: usize,
    pub mlp_layers: usize,
    pub dist: HashDistribution,
    pub seed: u64,
}

/// `Linear → BatchNorm → ReLU`.
struct DheBlock {
    linear: Linear,
    bn: BatchNorm,
}

impl DheBlock {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear: linear(in_dim, out_dim, vb.pp("linear"))?,
            bn: batch_norm(out_dim, BatchNormConfig::default(), vb.pp("bn"))?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.linear.forward(xs)?;
        self.bn.forward_t(&h, train)?.relu()
    }
}

pub struct DheEmbedding {
    config: DheConfig,
    node: LearnHashNode,
    params: LearnHashParams,
    /// `(slopes, biases, primes)` on the layer's device.
    hash_tensors: (Tensor, Tensor, Tensor),
    blocks: Vec<DheBlock>,
}

impl DheEmbedding {
    /// `primes` must contain at least one prime `>= num_buckets`.
    pub fn new(config: DheConfig, primes: &PrimeTable, vb: VarBuilder) -> Result<Self> {
        let node = LearnHashNode::new(config.num_buckets, config.dist)?;
        if config.dist == HashDistribution::Normal && config.num_hash % 2 != 0 {
            return Err(EmbedError::config(format!(
                "learning: num_hash must be even for the normal distribution, got {}",
                config.num_hash
            ))
            .into());
        }
        let candidates = primes.at_least(config.num_buckets as u64)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = LearnHashParams::from_rng(&mut rng, config.num_hash, node.nbucket, candidates);
        let hash_tensors = params.to_tensors(vb.device())?;

        let mut blocks = Vec::with_capacity(config.mlp_layers + 1);
        let mut in_dim = config.num_hash;
        for i in 0..config.mlp_layers {
            blocks.push(DheBlock::new(in_dim, config.mlp_dim, vb.pp(format!("block_{i}")))?);
            in_dim = config.mlp_dim;
        }
        blocks.push(DheBlock::new(in_dim, config.embedding_dim, vb.pp("out"))?);
        tracing::info!(
            buckets = config.num_buckets,
            num_hash = config.num_hash,
            mlp_dim = config.mlp_dim,
            mlp_layers = config.mlp_layers,
            dist = ?config.dist,
            "dhe embedding"
        );
        Ok(Self {
            config,
            node,
            params,
            hash_tensors,
            blocks,
        })
    }

    /// Prime table sized for `num_buckets`: sieved up to `2 · num_buckets`,
    /// which always contains a prime `>= num_buckets`.
    pub fn default_primes(num_buckets: usize) -> PrimeTable {
        PrimeTable::sieve(2 * num_buckets.max(2) as u64)
    }

    pub fn hash_params(&self) -> &LearnHashParams {
        &self.params
    }

    /// Hash codes `(..., num_hash)`.
    pub fn encode(&self, ids: &Tensor) -> Result<Tensor> {
        let (s, b, p) = &self.hash_tensors;
        self.node.forward(&[ids, s, b, p], ExecPath::Kernel)
    }

    pub fn forward_t(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let code = self.encode(ids)?;
        let mut h = code.reshape(((), self.config.num_hash))?;
        for block in &self.blocks {
            h = block.forward_t(&h, train)?;
        }
        let mut shape = ids.dims().to_vec();
        shape.push(self.config.embedding_dim);
        h.reshape(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config(dist: HashDistribution, num_hash: usize) -> DheConfig {
        DheConfig {
            embedding_dim: 4,
            num_buckets: 1000,
            num_hash,
            mlp_dim: 8,
            mlp_layers: 2,
            dist,
            seed: 3,
        }
    }

    #[test]
    fn forward_shape_and_non_negative() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let primes = DheEmbedding::default_primes(1000);
        let l = DheEmbedding::new(config(HashDistribution::Uniform, 6), &primes, vb).unwrap();
        let ids = Tensor::new(&[[1i64, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let out = l.forward_t(&ids, true).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);
        let v: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(v.iter().all(|&x| x >= 0.0));
        let code: Vec<f32> = l.encode(&ids).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(code.iter().all(|&c| (-1.0..=1.0).contains(&c)));
        assert!(l.hash_params().primes.iter().all(|&p| p >= 1000));
    }

    #[test]
    fn normal_needs_even_num_hash() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let primes = DheEmbedding::default_primes(1000);
        assert!(DheEmbedding::new(config(HashDistribution::Normal, 5), &primes, vb).is_err());
    }

    #[test]
    fn missing_primes_fail_construction() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let primes = PrimeTable::sieve(100);
        assert!(DheEmbedding::new(config(HashDistribution::Uniform, 4), &primes, vb).is_err());
    }
}
