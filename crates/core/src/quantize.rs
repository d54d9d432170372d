//! Quantisation codec: fixed-point rows, straight-through primitives, ALPT.
//!
//! ```text
//! q  = clamp(round(x / scale) + zero_point, qmin, qmax)
//! x' = (q - zero_point) * scale
//! ```
//!
//! `qmin = -2^(d-1)`, `qmax = 2^(d-1) - 1` for digit width `d ∈ {8, 16}`.
//! Rounding is half away from zero on both paths (`f32::round` and candle's
//! `round` share the rule), so `2.5 → 3` and `-2.5 → -3`.
//!
//! # Straight-through routing
//!
//! Forward values are produced by non-differentiable rounding; gradients are
//! routed with the detach trick used throughout this crate:
//! `out.detach() + (x - x.detach())`. In the forward pass the residual is
//! zero; in the backward pass it is the identity.

use candle_core::{DType, Device, Result, Tensor};
use embedmem_common::EmbedError;
use rayon::prelude::*;

/// Smallest per-row scale produced by [`QuantParams::fit_rows`].
const MIN_ROW_SCALE: f32 = 1e-8;

// ── Digit width ─────────────────────────────────────────────────────────────

/// Fixed-point width. Only 8 and 16 bits are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digit {
    Eight,
    Sixteen,
}

impl Digit {
    pub fn bits(self) -> u32 {
        match self {
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }

    pub fn qmin(self) -> i64 {
        -(1i64 << (self.bits() - 1))
    }

    pub fn qmax(self) -> i64 {
        (1i64 << (self.bits() - 1)) - 1
    }

    /// Bytes per stored element.
    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }
}

impl TryFrom<u32> for Digit {
    type Error = EmbedError;

    fn try_from(bits: u32) -> std::result::Result<Self, Self::Error> {
        match bits {
            8 => Ok(Self::Eight),
            16 => Ok(Self::Sixteen),
            other => Err(EmbedError::config(format!(
                "digit must be 8 or 16, got {other}"
            ))),
        }
    }
}

// ── Scalar codec ────────────────────────────────────────────────────────────

#[inline]
pub fn quantize_one(x: f32, scale: f32, zero_point: i64, digit: Digit) -> i64 {
    ((x / scale).round() as i64)
        .saturating_add(zero_point)
        .clamp(digit.qmin(), digit.qmax())
}

#[inline]
pub fn dequantize_one(q: i64, scale: f32, zero_point: i64) -> f32 {
    (q - zero_point) as f32 * scale
}

pub fn quantize_host(x: &[f32], scale: f32, zero_point: i64, digit: Digit) -> Vec<i64> {
    x.par_iter()
        .map(|&v| quantize_one(v, scale, zero_point, digit))
        .collect()
}

pub fn dequantize_host(q: &[i64], scale: f32, zero_point: i64) -> Vec<f32> {
    q.par_iter()
        .map(|&v| dequantize_one(v, scale, zero_point))
        .collect()
}

// ── Tensor codec ────────────────────────────────────────────────────────────

/// Kernel quantise. `scale` (F32) and `zero_point` (I64) broadcast against
/// `x`: rank 0 for a per-table pair, `(rows, 1)` for per-row pairs.
pub fn quantize_kernel(x: &Tensor, scale: &Tensor, zero_point: &Tensor, digit: Digit) -> Result<Tensor> {
    let zp = zero_point.to_dtype(DType::F32)?;
    x.broadcast_div(scale)?
        .round()?
        .broadcast_add(&zp)?
        .clamp(digit.qmin() as f32, digit.qmax() as f32)?
        .to_dtype(DType::I64)
}

/// Kernel dequantise of I64 codes.
pub fn dequantize_kernel(q: &Tensor, scale: &Tensor, zero_point: &Tensor) -> Result<Tensor> {
    q.broadcast_sub(zero_point)?
        .to_dtype(DType::F32)?
        .broadcast_mul(scale)
}

/// Quantise-dequantise with identity gradient into `x`.
pub fn fake_quantize(x: &Tensor, scale: &Tensor, zero_point: &Tensor, digit: Digit) -> Result<Tensor> {
    let q = quantize_kernel(&x.detach(), scale, zero_point, digit)?;
    let dq = dequantize_kernel(&q, scale, zero_point)?;
    dq.detach() + (x - x.detach())?
}

/// Forward `c`, backward identity into `q`: `stop_grad(c - q) + q`.
pub fn straight_through(c: &Tensor, q: &Tensor) -> Result<Tensor> {
    (c - q)?.detach() + q
}

// ── ALPT rounding ───────────────────────────────────────────────────────────
//
// `v = w / s` is the weight in scale units. The representable window in
// those units is `[qmin - zp, qmax - zp]`.

fn alpt_window(zero_point: i64, digit: Digit) -> (f32, f32) {
    (
        (digit.qmin() - zero_point) as f32,
        (digit.qmax() - zero_point) as f32,
    )
}

/// `s * clamp(round(v), lo, hi)`, element-wise. `scales` is per element.
pub fn alpt_round_host(v: &[f32], scales: &[f32], zero_point: i64, digit: Digit) -> Vec<f32> {
    let (lo, hi) = alpt_window(zero_point, digit);
    v.par_iter()
        .zip(scales.par_iter())
        .map(|(&v, &s)| s * v.round().clamp(lo, hi))
        .collect()
}

/// Scale-gradient indicator: `lo` below the window, `hi` above it,
/// `round(v) - v` inside.
pub fn alpt_scale_grad_host(v: &[f32], zero_point: i64, digit: Digit) -> Vec<f32> {
    let (lo, hi) = alpt_window(zero_point, digit);
    v.par_iter()
        .map(|&v| {
            if v < lo {
                lo
            } else if v > hi {
                hi
            } else {
                v.round() - v
            }
        })
        .collect()
}

pub fn alpt_round_kernel(v: &Tensor, scale: &Tensor, zero_point: i64, digit: Digit) -> Result<Tensor> {
    let (lo, hi) = alpt_window(zero_point, digit);
    v.round()?.clamp(lo, hi)?.broadcast_mul(scale)
}

pub fn alpt_scale_grad_kernel(v: &Tensor, zero_point: i64, digit: Digit) -> Result<Tensor> {
    let (lo, hi) = alpt_window(zero_point, digit);
    let inside = (v.round()? - v)?;
    let lo_t = Tensor::full(lo, v.shape(), v.device())?;
    let hi_t = Tensor::full(hi, v.shape(), v.device())?;
    let upper = v.gt(hi as f64)?.where_cond(&hi_t, &inside)?;
    v.lt(lo as f64)?.where_cond(&lo_t, &upper)
}

/// Trainable ALPT forward over looked-up rows `w` with learned `scale`.
///
/// Value: `s · clamp(round(w / s))`. Gradient into `w` is the identity;
/// gradient into `s` is `upstream · indicator(w / s)` (LSQ).
pub fn alpt_quantize_ste(w: &Tensor, scale: &Tensor, zero_point: i64, digit: Digit) -> Result<Tensor> {
    let v = w.broadcast_div(&scale.detach())?.detach();
    let q = alpt_round_kernel(&v, &scale.detach(), zero_point, digit)?;
    let ind = alpt_scale_grad_kernel(&v, zero_point, digit)?;
    let s_ind = ind.broadcast_mul(scale)?;
    let weight_path = ((q - w)?.detach() + w)?;
    weight_path + (s_ind.clone() - s_ind.detach())?
}

// ── Quantisation parameters ─────────────────────────────────────────────────

/// Scale / zero-point policy, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum QuantParams {
    PerTable { scale: f32, zero_point: i64 },
    /// One `(scale, zero_point)` pair per row.
    PerRow { scales: Vec<f32>, zero_points: Vec<i64> },
}

impl QuantParams {
    /// Fit per-row parameters so each row's `[min, max]` spans `[qmin, qmax]`.
    pub fn fit_rows(table: &Tensor, digit: Digit) -> Result<Self> {
        let rows: Vec<Vec<f32>> = table.to_dtype(DType::F32)?.to_vec2()?;
        let levels = (digit.qmax() - digit.qmin()) as f32;
        let (scales, zero_points) = rows
            .par_iter()
            .map(|row| {
                let lo = row.iter().copied().fold(f32::INFINITY, f32::min);
                let hi = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let scale = ((hi - lo) / levels).max(MIN_ROW_SCALE);
                let zp = digit.qmin() - (lo / scale).round() as i64;
                (scale, zp)
            })
            .unzip();
        Ok(Self::PerRow {
            scales,
            zero_points,
        })
    }

    pub fn is_per_row(&self) -> bool {
        matches!(self, Self::PerRow { .. })
    }

    /// `(scale, zero_point)` for one row.
    pub fn row(&self, row: usize) -> (f32, i64) {
        match self {
            Self::PerTable { scale, zero_point } => (*scale, *zero_point),
            Self::PerRow {
                scales,
                zero_points,
            } => (scales[row], zero_points[row]),
        }
    }

    /// `(scale F32, zero_point I64)` tensors broadcastable against
    /// `(rows, dim)`: rank 0 per-table, `(rows, 1)` per-row.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        match self {
            Self::PerTable { scale, zero_point } => Ok((
                Tensor::new(*scale, device)?,
                Tensor::new(*zero_point, device)?,
            )),
            Self::PerRow {
                scales,
                zero_points,
            } => {
                let n = scales.len();
                Ok((
                    Tensor::from_vec(scales.clone(), (n, 1), device)?,
                    Tensor::from_vec(zero_points.clone(), (n, 1), device)?,
                ))
            }
        }
    }

    /// Auxiliary bytes held by the parameters.
    pub fn nbytes(&self) -> usize {
        match self {
            Self::PerTable { .. } => 12,
            Self::PerRow { scales, .. } => scales.len() * 12,
        }
    }
}

// ── Packed table ────────────────────────────────────────────────────────────

/// Packed fixed-point codes.
#[derive(Debug, Clone, PartialEq)]
pub enum QuantStorage {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
}

impl QuantStorage {
    fn get(&self, i: usize) -> i64 {
        match self {
            Self::Int8(v) => v[i] as i64,
            Self::Int16(v) => v[i] as i64,
        }
    }

    fn to_i64(&self) -> Vec<i64> {
        match self {
            Self::Int8(v) => v.iter().map(|&x| x as i64).collect(),
            Self::Int16(v) => v.iter().map(|&x| x as i64).collect(),
        }
    }
}

/// A `(rows, dim)` table stored as fixed-point codes plus parameters.
#[derive(Debug, Clone)]
pub struct QuantizedTable {
    storage: QuantStorage,
    params: QuantParams,
    digit: Digit,
    rows: usize,
    dim: usize,
}

impl QuantizedTable {
    /// Quantise a full-precision `(rows, dim)` table.
    pub fn from_tensor(table: &Tensor, params: QuantParams, digit: Digit) -> Result<Self> {
        let (rows, dim) = table.dims2()?;
        if let QuantParams::PerRow { scales, .. } = &params {
            if scales.len() != rows {
                return Err(EmbedError::shape(
                    "QuantizedTable",
                    format!("{} per-row params for {rows} rows", scales.len()),
                )
                .into());
            }
        }
        let data: Vec<f32> = table.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let codes: Vec<i64> = data
            .par_iter()
            .enumerate()
            .map(|(i, &x)| {
                let (s, zp) = params.row(i / dim);
                quantize_one(x, s, zp, digit)
            })
            .collect();
        let storage = match digit {
            Digit::Eight => QuantStorage::Int8(codes.iter().map(|&q| q as i8).collect()),
            Digit::Sixteen => QuantStorage::Int16(codes.iter().map(|&q| q as i16).collect()),
        };
        Ok(Self {
            storage,
            params,
            digit,
            rows,
            dim,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn digit(&self) -> Digit {
        self.digit
    }

    pub fn params(&self) -> &QuantParams {
        &self.params
    }

    pub fn storage(&self) -> &QuantStorage {
        &self.storage
    }

    /// Stored code at `(row, col)`.
    pub fn code(&self, row: usize, col: usize) -> i64 {
        self.storage.get(row * self.dim + col)
    }

    /// Dequantised rows for a batch of row ids, shape `(..., dim)`.
    /// Ids are taken as-is and must lie in `[0, rows)`.
    pub fn lookup(&self, indices: &Tensor) -> Result<Tensor> {
        let ids: Vec<i64> = indices.flatten_all()?.to_vec1()?;
        if let Some(&bad) = ids.iter().find(|&&i| i < 0 || i as usize >= self.rows) {
            return Err(EmbedError::shape(
                "QuantizedTable",
                format!("row {bad} out of range for {} rows", self.rows),
            )
            .into());
        }
        let dim = self.dim;
        let out: Vec<f32> = ids
            .par_iter()
            .flat_map_iter(|&r| {
                let r = r as usize;
                let (s, zp) = self.params.row(r);
                (0..dim).map(move |c| dequantize_one(self.code(r, c), s, zp))
            })
            .collect();
        let mut shape = indices.dims().to_vec();
        shape.push(dim);
        Tensor::from_vec(out, shape, indices.device())
    }

    /// Codes as an I64 `(rows, dim)` tensor.
    pub fn codes_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(self.storage.to_i64(), (self.rows, self.dim), device)
    }

    /// Dequantised full table.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let (scale, zp) = self.params.to_tensors(device)?;
        dequantize_kernel(&self.codes_tensor(device)?, &scale, &zp)
    }

    /// Bytes for codes plus parameters.
    pub fn nbytes(&self) -> usize {
        self.rows * self.dim * self.digit.bytes() + self.params.nbytes()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    fn scalars(scale: f32, zp: i64) -> (Tensor, Tensor) {
        QuantParams::PerTable {
            scale,
            zero_point: zp,
        }
        .to_tensors(&Device::Cpu)
        .unwrap()
    }

    #[test]
    fn digit_rejects_other_widths() {
        assert_eq!(Digit::try_from(8).unwrap(), Digit::Eight);
        assert_eq!(Digit::try_from(16).unwrap().qmax(), 32767);
        assert!(Digit::try_from(4).is_err());
        assert!(Digit::try_from(32).is_err());
        assert_eq!(Digit::Eight.qmin(), -128);
    }

    #[test]
    fn rounds_half_away_from_zero() {
        let q = quantize_host(&[2.5, -2.5, 0.5, -0.5, 1.5], 1.0, 0, Digit::Eight);
        assert_eq!(q, vec![3, -3, 1, -1, 2]);
        let x = Tensor::new(&[2.5f32, -2.5, 0.5, -0.5, 1.5], &Device::Cpu).unwrap();
        let (s, zp) = scalars(1.0, 0);
        let k: Vec<i64> = quantize_kernel(&x, &s, &zp, Digit::Eight)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(k, q);
    }

    #[test]
    fn quantize_dequantize_reference_value() {
        let q = quantize_one(0.035, 0.01, 0, Digit::Eight);
        assert_eq!(q, 4);
        assert!((dequantize_one(q, 0.01, 0) - 0.04).abs() < 1e-7);
    }

    #[test]
    fn round_trip_error_bounded_by_half_scale() {
        let scale = 0.01f32;
        let xs: Vec<f32> = (-120..120).map(|i| i as f32 * 0.0103).collect();
        let q = quantize_host(&xs, scale, 0, Digit::Eight);
        let back = dequantize_host(&q, scale, 0);
        for (x, y) in xs.iter().zip(back.iter()) {
            assert!((x - y).abs() <= scale / 2.0 + 1e-6, "{x} -> {y}");
        }
    }

    #[test]
    fn saturates_outside_range() {
        let q = quantize_host(&[10.0, -10.0], 0.01, 0, Digit::Eight);
        assert_eq!(q, vec![127, -128]);
        let q = quantize_host(&[0.0], 0.01, 5, Digit::Eight);
        assert_eq!(q, vec![5]);
        assert!((dequantize_host(&[5], 0.01, 5)[0]).abs() < 1e-9);
    }

    #[test]
    fn kernel_matches_host() {
        let xs: Vec<f32> = (0..64).map(|i| (i as f32 - 31.7) * 0.037).collect();
        let x = Tensor::new(xs.as_slice(), &Device::Cpu).unwrap();
        let (s, zp) = scalars(0.013, -3);
        let q = quantize_kernel(&x, &s, &zp, Digit::Eight).unwrap();
        let qv: Vec<i64> = q.to_vec1().unwrap();
        assert_eq!(qv, quantize_host(&xs, 0.013, -3, Digit::Eight));
        let d: Vec<f32> = dequantize_kernel(&q, &s, &zp).unwrap().to_vec1().unwrap();
        assert_eq!(d, dequantize_host(&qv, 0.013, -3));
    }

    #[test]
    fn straight_through_forward_and_backward() {
        let dev = Device::Cpu;
        let c = Tensor::new(&[1.0f32, -2.0, 3.0], &dev).unwrap();
        let q = Var::new(&[0.5f32, 0.5, 0.5], &dev).unwrap();
        let out = straight_through(&c, q.as_tensor()).unwrap();
        let v: Vec<f32> = out.to_vec1().unwrap();
        assert_eq!(v, vec![1.0, -2.0, 3.0]);
        let upstream = Tensor::new(&[0.1f32, 0.2, 0.3], &dev).unwrap();
        let grads = (out * &upstream).unwrap().sum_all().unwrap().backward().unwrap();
        let g: Vec<f32> = grads.get(q.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn fake_quantize_passes_gradient() {
        let dev = Device::Cpu;
        let x = Var::new(&[0.035f32, -0.012], &dev).unwrap();
        let (s, zp) = scalars(0.01, 0);
        let y = fake_quantize(x.as_tensor(), &s, &zp, Digit::Eight).unwrap();
        let v: Vec<f32> = y.to_vec1().unwrap();
        assert!((v[0] - 0.04).abs() < 1e-6 && (v[1] + 0.01).abs() < 1e-6);
        let grads = y.sum_all().unwrap().backward().unwrap();
        let g: Vec<f32> = grads.get(x.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![1.0, 1.0]);
    }

    #[test]
    fn alpt_indicator_and_round() {
        let v = [-200.0f32, -3.4, 0.6, 2.5, 300.0];
        let ind = alpt_scale_grad_host(&v, 0, Digit::Eight);
        assert_eq!(ind[0], -128.0);
        assert!((ind[1] - 0.4).abs() < 1e-6);
        assert!((ind[2] - 0.4).abs() < 1e-6);
        assert!((ind[3] - 0.5).abs() < 1e-6);
        assert_eq!(ind[4], 127.0);
        let r = alpt_round_host(&v, &[0.5; 5], 0, Digit::Eight);
        assert_eq!(r, vec![-64.0, -1.5, 0.5, 1.5, 63.5]);

        let t = Tensor::new(&v, &Device::Cpu).unwrap();
        let k: Vec<f32> = alpt_scale_grad_kernel(&t, 0, Digit::Eight)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(k, ind);
        let s = Tensor::new(0.5f32, &Device::Cpu).unwrap();
        let kr: Vec<f32> = alpt_round_kernel(&t, &s, 0, Digit::Eight)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(kr, r);
    }

    #[test]
    fn alpt_ste_gradients() {
        let dev = Device::Cpu;
        let w = Var::new(&[0.13f32, -0.27, 5.0], &dev).unwrap();
        let s = Var::new(&[0.1f32], &dev).unwrap();
        let out = alpt_quantize_ste(w.as_tensor(), s.as_tensor(), 0, Digit::Eight).unwrap();
        let v: Vec<f32> = out.to_vec1().unwrap();
        assert!((v[0] - 0.1).abs() < 1e-6);
        assert!((v[1] + 0.3).abs() < 1e-6);
        assert!((v[2] - 5.0).abs() < 1e-5);
        let grads = out.sum_all().unwrap().backward().unwrap();
        let gw: Vec<f32> = grads.get(w.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(gw, vec![1.0, 1.0, 1.0]);
        // indicators: round(1.3)-1.3 = -0.3, round(-2.7)+2.7 = -0.3, round(50)-50 = 0
        let gs: Vec<f32> = grads.get(s.as_tensor()).unwrap().to_vec1().unwrap();
        assert!((gs[0] + 0.6).abs() < 1e-4, "{gs:?}");
    }

    #[test]
    fn fit_rows_spans_range() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[[-1.0f32, 0.0, 1.0], [0.0, 0.5, 2.0]], &dev).unwrap();
        let params = QuantParams::fit_rows(&t, Digit::Eight).unwrap();
        assert!(params.is_per_row());
        let table = QuantizedTable::from_tensor(&t, params.clone(), Digit::Eight).unwrap();
        assert_eq!(table.code(0, 0), -128);
        assert_eq!(table.code(0, 2), 127);
        assert_eq!(table.code(1, 0), -128);
        let back: Vec<Vec<f32>> = table.to_tensor(&dev).unwrap().to_vec2().unwrap();
        let orig: Vec<Vec<f32>> = t.to_vec2().unwrap();
        for r in 0..2 {
            let (s, _) = params.row(r);
            for c in 0..3 {
                assert!((back[r][c] - orig[r][c]).abs() <= s / 2.0 + 1e-6);
            }
        }
    }

    #[test]
    fn quantized_table_lookup_and_size() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[[0.01f32, 0.02], [0.03, -0.04], [0.0, 0.05]], &dev).unwrap();
        let params = QuantParams::PerTable {
            scale: 0.01,
            zero_point: 0,
        };
        let table = QuantizedTable::from_tensor(&t, params, Digit::Sixteen).unwrap();
        assert!(matches!(table.storage(), QuantStorage::Int16(_)));
        assert_eq!(table.nbytes(), 3 * 2 * 2 + 12);
        let idx = Tensor::new(&[[2i64, 1]], &dev).unwrap();
        let rows = table.lookup(&idx).unwrap();
        assert_eq!(rows.dims(), &[1, 2, 2]);
        let v: Vec<f32> = rows.flatten_all().unwrap().to_vec1().unwrap();
        let expect = [0.0f32, 0.05, 0.03, -0.04];
        for (a, b) in v.iter().zip(expect.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        let bad = Tensor::new(&[3i64], &dev).unwrap();
        assert!(table.lookup(&bad).is_err());
    }
}
