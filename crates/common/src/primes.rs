//! Read-only prime table used to pick learned-hash moduli.

use std::path::Path;

use crate::error::EmbedError;

/// Sorted ascending list of primes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimeTable {
    primes: Vec<u64>,
}

impl PrimeTable {
    /// Sieve of Eratosthenes over `[2, limit]`.
    pub fn sieve(limit: u64) -> Self {
        let n = limit as usize;
        if n < 2 {
            return Self { primes: Vec::new() };
        }
        let mut composite = vec![false; n + 1];
        let mut primes = Vec::new();
        for i in 2..=n {
            if composite[i] {
                continue;
            }
            primes.push(i as u64);
            let mut j = i * i;
            while j <= n {
                composite[j] = true;
                j += i;
            }
        }
        Self { primes }
    }

    /// Load a JSON array of integers. The array is sorted and deduplicated.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut primes: Vec<u64> = serde_json::from_str(&json)?;
        primes.sort_unstable();
        primes.dedup();
        Ok(Self { primes })
    }

    pub fn from_vec(mut primes: Vec<u64>) -> Self {
        primes.sort_unstable();
        primes.dedup();
        Self { primes }
    }

    pub fn len(&self) -> usize {
        self.primes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primes.is_empty()
    }

    /// All primes `>= n`.
    pub fn at_least(&self, n: u64) -> Result<&[u64], EmbedError> {
        let start = self.primes.partition_point(|&p| p < n);
        if start == self.primes.len() {
            return Err(EmbedError::MissingPrimes(n));
        }
        Ok(&self.primes[start..])
    }
}
