//! Index-transform hash functions.
//!
//! Every function comes in two forms: `*_host` over `&[i64]` (scalar,
//! parallel over the batch with `rayon`) and `*_kernel` over I64 candle
//! tensors. Candle has no integer remainder op, so the kernels build floor
//! modulo from truncating division: `r = x - (x / n) * n`, then `r + n`
//! where `r < 0`.
//!
//! All integer products are reduced modulo their modulus before summing, so
//! intermediates stay below `2^63` for any `i64` input.

use candle_core::{DType, Device, Result, Tensor, D};
use embedmem_common::EmbedError;
use rand::Rng;
use rayon::prelude::*;

/// Prime modulus of the ROBE universal hash.
pub const ROBE_MODULUS: i64 = 2_038_074_743;

// ── Tensor helpers ──────────────────────────────────────────────────────────

fn scalar_i64(v: i64, device: &Device) -> Result<Tensor> {
    Tensor::new(v, device)
}

/// Floor modulo with a broadcastable positive divisor tensor.
pub(crate) fn floor_mod_by(x: &Tensor, n: &Tensor) -> Result<Tensor> {
    let q = x.broadcast_div(n)?;
    let r = x.broadcast_sub(&q.broadcast_mul(n)?)?;
    let neg = r.lt(0i64)?;
    let lifted = r.broadcast_add(n)?;
    neg.where_cond(&lifted, &r)
}

/// Floor modulo by a positive constant.
pub(crate) fn floor_mod(x: &Tensor, n: i64) -> Result<Tensor> {
    floor_mod_by(x, &scalar_i64(n, x.device())?)
}

/// Floor division by a positive constant (exact on the remainder-free part).
fn floor_div(x: &Tensor, n: i64) -> Result<Tensor> {
    let n_t = scalar_i64(n, x.device())?;
    (x - floor_mod(x, n)?)?.broadcast_div(&n_t)
}

// ── Modulo hash ─────────────────────────────────────────────────────────────

pub fn mod_hash_host(x: &[i64], nembed: i64) -> Vec<i64> {
    x.par_iter().map(|&v| v.rem_euclid(nembed)).collect()
}

pub fn mod_hash_kernel(x: &Tensor, nembed: i64) -> Result<Tensor> {
    floor_mod(x, nembed)
}

// ── Compositional hash ──────────────────────────────────────────────────────

/// Digits of `x` in base `nembed`, least significant first. The last of the
/// `ntable` digits is the remaining quotient and is not reduced.
pub fn compo_hash_host(x: &[i64], ntable: usize, nembed: i64) -> Vec<i64> {
    x.par_iter()
        .flat_map_iter(|&v| {
            let mut rest = v;
            let mut digits = Vec::with_capacity(ntable);
            for _ in 0..ntable.saturating_sub(1) {
                digits.push(rest.rem_euclid(nembed));
                rest = rest.div_euclid(nembed);
            }
            digits.push(rest);
            digits
        })
        .collect()
}

/// Output appends a trailing `ntable` axis.
pub fn compo_hash_kernel(x: &Tensor, ntable: usize, nembed: i64) -> Result<Tensor> {
    let mut rest = x.clone();
    let mut digits = Vec::with_capacity(ntable);
    for _ in 0..ntable.saturating_sub(1) {
        digits.push(floor_mod(&rest, nembed)?);
        rest = floor_div(&rest, nembed)?;
    }
    digits.push(rest);
    Tensor::stack(&digits, D::Minus1)
}

// ── ROBE ────────────────────────────────────────────────────────────────────

/// Fixed random constants of the ROBE address and sign hashes.
///
/// `coef[0..4]` drive the chunk base offset, `coef[4..8]` the sign. The two
/// hashes share inputs but not constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobeParams {
    pub coef: [i64; 8],
}

impl RobeParams {
    pub fn from_rng<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut coef = [0i64; 8];
        for c in coef.iter_mut() {
            *c = rng.gen_range(1..ROBE_MODULUS);
        }
        Self { coef }
    }

    /// Chunk base offset `h(k)` for logical row `nid` in slot `slot`.
    pub fn base(&self, nid: i64, slot: i64, chunk: i64, size: i64) -> i64 {
        let c = &self.coef;
        let mo = ROBE_MODULUS;
        let h = ((c[0] * chunk).rem_euclid(mo)
            + (c[1] * nid.rem_euclid(mo)).rem_euclid(mo)
            + (c[2] * slot).rem_euclid(mo)
            + c[3])
            .rem_euclid(mo);
        h.rem_euclid(size)
    }

    /// `+1` or `-1` for element `j` of logical row `nid` in slot `slot`.
    pub fn sign(&self, nid: i64, slot: i64, j: i64) -> f32 {
        let c = &self.coef;
        let mo = ROBE_MODULUS;
        let h = ((c[4] * j).rem_euclid(mo)
            + (c[5] * nid.rem_euclid(mo)).rem_euclid(mo)
            + (c[6] * slot).rem_euclid(mo)
            + c[7])
            .rem_euclid(mo);
        if h % 2 == 0 {
            1.0
        } else {
            -1.0
        }
    }
}

/// Geometry of a ROBE lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobeLayout {
    /// Pool size `S`.
    pub size: usize,
    /// Chunk length `Z`.
    pub z: usize,
    pub dim: usize,
    pub use_slot_coef: bool,
}

impl RobeLayout {
    pub fn num_chunks(&self) -> usize {
        self.dim.div_ceil(self.z)
    }
}

/// Chunk base offsets, `(x.len(), num_chunks)` row-major. The slot of
/// `x[i]` is `i % nslot`.
pub fn robe_offsets_host(
    x: &[i64],
    nslot: usize,
    params: &RobeParams,
    layout: &RobeLayout,
) -> Vec<i64> {
    let nchunks = layout.num_chunks();
    x.par_iter()
        .enumerate()
        .flat_map_iter(|(i, &nid)| {
            let slot = if layout.use_slot_coef {
                (i % nslot) as i64
            } else {
                0
            };
            (0..nchunks)
                .map(move |k| params.base(nid, slot, k as i64, layout.size as i64))
        })
        .collect()
}

/// `(..., nslot)` ids → `(..., nslot, num_chunks)` offsets.
pub fn robe_offsets_kernel(x: &Tensor, params: &RobeParams, layout: &RobeLayout) -> Result<Tensor> {
    let c = &params.coef;
    let dev = x.device();
    let nslot = x.dim(D::Minus1)?;
    let nid = floor_mod(x, ROBE_MODULUS)?.unsqueeze(D::Minus1)?;
    let row_term = floor_mod(&nid.broadcast_mul(&scalar_i64(c[1], dev)?)?, ROBE_MODULUS)?;
    let chunks = Tensor::arange(0i64, layout.num_chunks() as i64, dev)?;
    let chunk_term = floor_mod(&chunks.broadcast_mul(&scalar_i64(c[0], dev)?)?, ROBE_MODULUS)?;
    let mut h = row_term.broadcast_add(&chunk_term)?;
    if layout.use_slot_coef {
        let slots = Tensor::arange(0i64, nslot as i64, dev)?.reshape((nslot, 1))?;
        let slot_term = floor_mod(&slots.broadcast_mul(&scalar_i64(c[2], dev)?)?, ROBE_MODULUS)?;
        h = h.broadcast_add(&slot_term)?;
    }
    let h = floor_mod(&h.broadcast_add(&scalar_i64(c[3], dev)?)?, ROBE_MODULUS)?;
    floor_mod(&h, layout.size as i64)
}

/// Signs, `(x.len(), dim)` row-major.
pub fn robe_signs_host(x: &[i64], nslot: usize, params: &RobeParams, layout: &RobeLayout) -> Vec<f32> {
    let dim = layout.dim;
    x.par_iter()
        .enumerate()
        .flat_map_iter(|(i, &nid)| {
            let slot = if layout.use_slot_coef {
                (i % nslot) as i64
            } else {
                0
            };
            (0..dim).map(move |j| params.sign(nid, slot, j as i64))
        })
        .collect()
}

/// `(..., nslot)` ids → `(..., nslot, dim)` F32 signs.
pub fn robe_signs_kernel(x: &Tensor, params: &RobeParams, layout: &RobeLayout) -> Result<Tensor> {
    let c = &params.coef;
    let dev = x.device();
    let nslot = x.dim(D::Minus1)?;
    let nid = floor_mod(x, ROBE_MODULUS)?.unsqueeze(D::Minus1)?;
    let row_term = floor_mod(&nid.broadcast_mul(&scalar_i64(c[5], dev)?)?, ROBE_MODULUS)?;
    let elems = Tensor::arange(0i64, layout.dim as i64, dev)?;
    let elem_term = floor_mod(&elems.broadcast_mul(&scalar_i64(c[4], dev)?)?, ROBE_MODULUS)?;
    let mut h = row_term.broadcast_add(&elem_term)?;
    if layout.use_slot_coef {
        let slots = Tensor::arange(0i64, nslot as i64, dev)?.reshape((nslot, 1))?;
        let slot_term = floor_mod(&slots.broadcast_mul(&scalar_i64(c[6], dev)?)?, ROBE_MODULUS)?;
        h = h.broadcast_add(&slot_term)?;
    }
    let h = floor_mod(&h.broadcast_add(&scalar_i64(c[7], dev)?)?, ROBE_MODULUS)?;
    let bit = floor_mod(&h, 2)?.to_dtype(DType::F32)?;
    bit.affine(-2.0, 1.0)
}

/// `pool[o..o+len]`, wrapping to the head of the pool when it overruns.
pub fn robe_slice<T: Copy>(pool: &[T], offset: usize, len: usize) -> Vec<T> {
    let size = pool.len();
    if offset + len <= size {
        pool[offset..offset + len].to_vec()
    } else {
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&pool[offset..size]);
        let mut rest = len - (size - offset);
        while rest > 0 {
            let take = rest.min(size);
            out.extend_from_slice(&pool[..take]);
            rest -= take;
        }
        out
    }
}

// ── Learned hash ────────────────────────────────────────────────────────────

/// Shape of the learned-hash output distribution.
pub use embedmem_common::HashDistribution;

/// Non-trainable parameters of `num_hash` affine-modular hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnHashParams {
    pub slopes: Vec<i64>,
    pub biases: Vec<i64>,
    pub primes: Vec<i64>,
}

impl LearnHashParams {
    /// Slopes and biases uniform in `[0, nbucket)`, primes drawn from
    /// `candidates` (all `>= nbucket`).
    pub fn from_rng<R: Rng + ?Sized>(
        rng: &mut R,
        num_hash: usize,
        nbucket: i64,
        candidates: &[u64],
    ) -> Self {
        let slopes = (0..num_hash).map(|_| rng.gen_range(0..nbucket)).collect();
        let biases = (0..num_hash).map(|_| rng.gen_range(0..nbucket)).collect();
        let primes = (0..num_hash)
            .map(|_| candidates[rng.gen_range(0..candidates.len())] as i64)
            .collect();
        Self {
            slopes,
            biases,
            primes,
        }
    }

    pub fn num_hash(&self) -> usize {
        self.slopes.len()
    }

    /// `(slopes, biases, primes)` as rank-1 I64 tensors.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
        Ok((
            Tensor::new(self.slopes.as_slice(), device)?,
            Tensor::new(self.biases.as_slice(), device)?,
            Tensor::new(self.primes.as_slice(), device)?,
        ))
    }
}

/// `((slope * x + bias) mod prime) mod nbucket`, evaluated as
/// `((slope * (x mod prime)) mod prime + bias) mod prime` to avoid overflow.
#[inline]
fn learn_hash_one(x: i64, slope: i64, bias: i64, prime: i64, nbucket: i64) -> i64 {
    let xm = x.rem_euclid(prime);
    ((slope * xm).rem_euclid(prime) + bias).rem_euclid(prime) % nbucket
}

/// Box–Muller consumes hashes in pairs.
fn check_pairs(num_hash: usize, dist: HashDistribution) -> Result<()> {
    if dist == HashDistribution::Normal && num_hash % 2 != 0 {
        return Err(EmbedError::config(format!(
            "normal distribution needs an even num_hash, got {num_hash}"
        ))
        .into());
    }
    Ok(())
}

/// Host learned hash, `(x.len(), num_hash)` row-major F32.
pub fn learn_hash_host(
    x: &[i64],
    slopes: &[i64],
    biases: &[i64],
    primes: &[i64],
    nbucket: i64,
    dist: HashDistribution,
) -> Result<Vec<f32>> {
    let nh = slopes.len();
    check_pairs(nh, dist)?;
    let denom = (nbucket - 1) as f64;
    let out: Vec<f32> = x
        .par_iter()
        .flat_map_iter(|&v| {
            let u: Vec<f64> = (0..nh)
                .map(|j| learn_hash_one(v, slopes[j], biases[j], primes[j], nbucket) as f64 / denom)
                .collect();
            let out: Vec<f32> = match dist {
                HashDistribution::Uniform => u.iter().map(|&u| (u * 2.0 - 1.0) as f32).collect(),
                HashDistribution::Normal => u
                    .chunks_exact(2)
                    .flat_map(|pair| {
                        let r = (pair[0].ln() * -2.0).sqrt();
                        let theta = pair[1] * (2.0 * std::f64::consts::PI);
                        [(r * theta.cos()) as f32, (r * theta.sin()) as f32]
                    })
                    .collect(),
            };
            out
        })
        .collect();
    Ok(out)
}

/// Kernel learned hash: `(...)` ids → `(..., num_hash)` F32.
pub fn learn_hash_kernel(
    x: &Tensor,
    slopes: &Tensor,
    biases: &Tensor,
    primes: &Tensor,
    nbucket: i64,
    dist: HashDistribution,
) -> Result<Tensor> {
    let dev = x.device();
    let nh = slopes.dims1()?;
    check_pairs(nh, dist)?;
    let xe = x.unsqueeze(D::Minus1)?;
    let xm = floor_mod_by(&xe, primes)?;
    let h = floor_mod_by(&xm.broadcast_mul(slopes)?, primes)?;
    let h = floor_mod_by(&h.broadcast_add(biases)?, primes)?;
    let h = floor_mod(&h, nbucket)?;
    let denom = Tensor::new((nbucket - 1) as f64, dev)?;
    let u = h.to_dtype(DType::F64)?.broadcast_div(&denom)?;
    let out = match dist {
        HashDistribution::Uniform => u.affine(2.0, -1.0)?,
        HashDistribution::Normal => {
            let mut pair_shape = u.dims()[..u.rank() - 1].to_vec();
            pair_shape.push(nh / 2);
            pair_shape.push(2);
            let pairs = u.reshape(pair_shape)?;
            let u0 = pairs.narrow(D::Minus1, 0, 1)?;
            let u1 = pairs.narrow(D::Minus1, 1, 1)?;
            let r = u0.log()?.affine(-2.0, 0.0)?.sqrt()?;
            let theta = u1.affine(2.0 * std::f64::consts::PI, 0.0)?;
            let z0 = (&r * theta.cos()?)?;
            let z1 = (&r * theta.sin()?)?;
            Tensor::cat(&[&z0, &z1], D::Minus1)?.reshape(u.shape())?
        }
    };
    out.to_dtype(DType::F32)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn i64s(t: &Tensor) -> Vec<i64> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn mod_hash_paths_agree() {
        let xs = vec![0i64, 5, 999, 1000, 1_000_000, -1, -1001, i64::MAX];
        let host = mod_hash_host(&xs, 100);
        let t = Tensor::new(xs.as_slice(), &Device::Cpu).unwrap();
        assert_eq!(i64s(&mod_hash_kernel(&t, 100).unwrap()), host);
        assert_eq!(&host[..7], &[0, 5, 99, 0, 0, 99, 99]);
    }

    #[test]
    fn mod_hash_is_identity_below_modulus() {
        let xs: Vec<i64> = (0..50).collect();
        assert_eq!(mod_hash_host(&xs, 50), xs);
    }

    #[test]
    fn compo_hash_reconstructs_index() {
        let xs = vec![0i64, 7, 123, 999, 4096];
        let n = 10;
        let digits = compo_hash_host(&xs, 3, n);
        for (i, &x) in xs.iter().enumerate() {
            let d = &digits[i * 3..i * 3 + 3];
            assert_eq!(d[0] + d[1] * n + d[2] * n * n, x);
            assert!(d[0] < n && d[1] < n);
        }
        // last digit keeps the whole quotient
        assert_eq!(&digits[12..15], &[6, 9, 40]);
        let t = Tensor::new(xs.as_slice(), &Device::Cpu).unwrap();
        let k = compo_hash_kernel(&t, 3, n).unwrap();
        assert_eq!(k.dims(), &[5, 3]);
        assert_eq!(i64s(&k), digits);
    }

    #[test]
    fn compo_hash_negative_uses_floor_semantics() {
        let xs = vec![-1i64, -15];
        let host = compo_hash_host(&xs, 2, 10);
        assert_eq!(host, vec![9, -1, 5, -2]);
        let t = Tensor::new(xs.as_slice(), &Device::Cpu).unwrap();
        assert_eq!(i64s(&compo_hash_kernel(&t, 2, 10).unwrap()), host);
    }

    #[test]
    fn robe_slice_wraps() {
        let pool: Vec<i32> = (0..10).collect();
        assert_eq!(robe_slice(&pool, 8, 5), vec![8, 9, 0, 1, 2]);
        assert_eq!(robe_slice(&pool, 2, 5), vec![2, 3, 4, 5, 6]);
        assert_eq!(robe_slice(&pool, 5, 5), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn robe_paths_agree() {
        let mut rng = StdRng::seed_from_u64(3);
        let params = RobeParams::from_rng(&mut rng);
        assert!(params.coef.iter().all(|&c| c >= 1 && c < ROBE_MODULUS));
        let layout = RobeLayout {
            size: 97,
            z: 3,
            dim: 8,
            use_slot_coef: true,
        };
        let xs = vec![0i64, 1, 2, 3_000_000_000, -5, 42];
        let t = Tensor::from_vec(xs.clone(), (2, 3), &Device::Cpu).unwrap();
        let off = robe_offsets_kernel(&t, &params, &layout).unwrap();
        assert_eq!(off.dims(), &[2, 3, 3]);
        assert_eq!(i64s(&off), robe_offsets_host(&xs, 3, &params, &layout));
        assert!(i64s(&off).iter().all(|&o| (0..97).contains(&o)));

        let sig = robe_signs_kernel(&t, &params, &layout).unwrap();
        assert_eq!(sig.dims(), &[2, 3, 8]);
        let sv: Vec<f32> = sig.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(sv, robe_signs_host(&xs, 3, &params, &layout));
    }

    #[test]
    fn robe_slot_coefficient_changes_offsets() {
        let params = RobeParams::from_rng(&mut StdRng::seed_from_u64(11));
        let with = RobeLayout {
            size: 1 << 20,
            z: 4,
            dim: 4,
            use_slot_coef: true,
        };
        let without = RobeLayout {
            use_slot_coef: false,
            ..with
        };
        let xs = vec![17i64, 17];
        let a = robe_offsets_host(&xs, 2, &params, &with);
        let b = robe_offsets_host(&xs, 2, &params, &without);
        assert_ne!(a[0], a[1]);
        assert_eq!(b[0], b[1]);
    }

    #[test]
    fn robe_signs_are_roughly_balanced() {
        let params = RobeParams::from_rng(&mut StdRng::seed_from_u64(5));
        let layout = RobeLayout {
            size: 1000,
            z: 16,
            dim: 16,
            use_slot_coef: false,
        };
        let xs: Vec<i64> = (0..500).collect();
        let signs = robe_signs_host(&xs, 1, &params, &layout);
        let pos = signs.iter().filter(|&&s| s > 0.0).count() as f64 / signs.len() as f64;
        assert!((pos - 0.5).abs() < 0.05, "positive fraction {pos}");
    }

    #[test]
    fn learn_hash_uniform_range_and_paths_agree() {
        let mut rng = StdRng::seed_from_u64(9);
        let primes: Vec<u64> = vec![1009, 1013, 1019, 1021];
        let p = LearnHashParams::from_rng(&mut rng, 4, 1000, &primes);
        let xs = vec![0i64, 1, 77, 123_456_789, 999_999_999_999];
        let host = learn_hash_host(&xs, &p.slopes, &p.biases, &p.primes, 1000, HashDistribution::Uniform).unwrap();
        assert!(host.iter().all(|&v| (-1.0..=1.0).contains(&v)));
        let dev = Device::Cpu;
        let (s, b, pr) = p.to_tensors(&dev).unwrap();
        let t = Tensor::new(xs.as_slice(), &dev).unwrap();
        let k = learn_hash_kernel(&t, &s, &b, &pr, 1000, HashDistribution::Uniform).unwrap();
        assert_eq!(k.dims(), &[5, 4]);
        let kv: Vec<f32> = k.flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in kv.iter().zip(host.iter()) {
            assert!((a - b).abs() <= 1e-7 * b.abs().max(1.0));
        }
    }

    #[test]
    fn learn_hash_formula() {
        // slope 3, bias 4, prime 11, nbucket 10: x=5 → (19 mod 11) mod 10 = 8
        let out = learn_hash_host(&[5], &[3], &[4], &[11], 10, HashDistribution::Uniform).unwrap();
        assert!((out[0] - (8.0 / 9.0 * 2.0 - 1.0)).abs() < 1e-6);
    }

    #[test]
    fn learn_hash_normal_box_muller_and_paths_agree() {
        let slopes = vec![3i64, 5];
        let biases = vec![1i64, 2];
        let primes = vec![13i64, 17];
        let xs = vec![4i64, 9];
        let host = learn_hash_host(&xs, &slopes, &biases, &primes, 12, HashDistribution::Normal).unwrap();
        // x=4: h0 = (13 mod 13) mod 12 = 0 → u0 = 0 → r = inf
        assert!(!host[0].is_finite() || host[0].is_nan());
        // x=9: h0 = 28 mod 13 = 2, h1 = 47 mod 17 = 13 mod 12 = 1
        let u0 = 2.0f64 / 11.0;
        let u1 = 1.0f64 / 11.0;
        let r = (-2.0 * u0.ln()).sqrt();
        let th = 2.0 * std::f64::consts::PI * u1;
        assert!((host[2] as f64 - r * th.cos()).abs() < 1e-6);
        assert!((host[3] as f64 - r * th.sin()).abs() < 1e-6);

        let dev = Device::Cpu;
        let t = Tensor::new(xs.as_slice(), &dev).unwrap();
        let k = learn_hash_kernel(
            &t,
            &Tensor::new(slopes.as_slice(), &dev).unwrap(),
            &Tensor::new(biases.as_slice(), &dev).unwrap(),
            &Tensor::new(primes.as_slice(), &dev).unwrap(),
            12,
            HashDistribution::Normal,
        )
        .unwrap();
        let kv: Vec<f32> = k.flatten_all().unwrap().to_vec1().unwrap();
        assert!((kv[2] - host[2]).abs() <= 1e-6 * host[2].abs().max(1.0));
        assert!((kv[3] - host[3]).abs() <= 1e-6 * host[3].abs().max(1.0));
    }

    #[test]
    fn learn_hash_normal_rejects_odd_num_hash() {
        let host = learn_hash_host(&[1, 2], &[3, 5, 7], &[1, 2, 3], &[13, 17, 19], 12, HashDistribution::Normal);
        assert!(host.is_err());
        let dev = Device::Cpu;
        let three = Tensor::new(&[3i64, 5, 7], &dev).unwrap();
        let primes = Tensor::new(&[13i64, 17, 19], &dev).unwrap();
        let x = Tensor::new(&[1i64, 2], &dev).unwrap();
        assert!(learn_hash_kernel(&x, &three, &three, &primes, 12, HashDistribution::Normal).is_err());
        // Uniform has no pairing constraint.
        assert!(learn_hash_host(&[1], &[3, 5, 7], &[1, 2, 3], &[13, 17, 19], 12, HashDistribution::Uniform).is_ok());
    }
}
