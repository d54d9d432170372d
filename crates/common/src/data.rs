//! Data pipeline: CTR examples, batching, per-row frequency counts.
//!
//! An example is one binary label plus `num_slot` sparse feature ids. Ids are
//! global: slot `s` owns rows `[offset(s), offset(s) + size(s))` of the
//! logical embedding space, as laid out by a [`FieldLayout`].
//!
//! * **[`CtrDataset`]**: in-memory examples, loaded from text or synthesised.
//! * **[`CtrBatch`]**: one `(batch_size, num_slot)` slice of a dataset.
//! * **[`batch_to_tensors`]**: raw batch → Candle tensors.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ── FieldLayout ─────────────────────────────────────────────────────────────

/// Per-slot vocabulary sizes and their cumulative offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    sizes: Vec<usize>,
    offsets: Vec<usize>,
}

impl FieldLayout {
    pub fn new(sizes: Vec<usize>) -> Self {
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut acc = 0;
        for &s in &sizes {
            offsets.push(acc);
            acc += s;
        }
        Self { sizes, offsets }
    }

    /// Split `num_embeddings` rows as evenly as possible over `num_slot` slots.
    pub fn uniform(num_embeddings: usize, num_slot: usize) -> Self {
        let base = num_embeddings / num_slot;
        let extra = num_embeddings % num_slot;
        let sizes = (0..num_slot)
            .map(|s| base + usize::from(s < extra))
            .collect();
        Self::new(sizes)
    }

    pub fn num_slot(&self) -> usize {
        self.sizes.len()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn offset(&self, slot: usize) -> usize {
        self.offsets[slot]
    }

    pub fn total(&self) -> usize {
        self.sizes.iter().sum()
    }
}

// ── CtrBatch ────────────────────────────────────────────────────────────────

/// Row-major `(batch_size, num_slot)` ids with one label per example.
#[derive(Debug, Clone)]
pub struct CtrBatch {
    pub indices: Vec<i64>,
    pub labels: Vec<f32>,
    pub batch_size: usize,
    pub num_slot: usize,
}

// ── CtrDataset ──────────────────────────────────────────────────────────────

/// In-memory CTR dataset.
#[derive(Debug, Clone)]
pub struct CtrDataset {
    num_slot: usize,
    indices: Vec<i64>,
    labels: Vec<f32>,
}

impl CtrDataset {
    /// Load whitespace-separated lines `label id_0 .. id_{num_slot-1}` from a
    /// file or every `.txt`/`.tsv` file of a directory.
    pub fn load(path: &Path, num_slot: usize) -> AnyhowResult<Self> {
        let mut ds = Self {
            num_slot,
            indices: Vec::new(),
            labels: Vec::new(),
        };
        let files = collect_files(path)?;
        if files.is_empty() {
            anyhow::bail!("no data files under {}", path.display());
        }
        for file in files {
            ds.load_file(&file)?;
        }
        Ok(ds)
    }

    fn load_file(&mut self, path: &Path) -> AnyhowResult<()> {
        let f = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
        for (lineno, line) in BufReader::new(f).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let label: f32 = fields
                .next()
                .context("empty line")?
                .parse()
                .with_context(|| format!("{}:{}: bad label", path.display(), lineno + 1))?;
            let before = self.indices.len();
            for tok in fields {
                let id: i64 = tok
                    .parse()
                    .with_context(|| format!("{}:{}: bad id {tok:?}", path.display(), lineno + 1))?;
                self.indices.push(id);
            }
            let got = self.indices.len() - before;
            if got != self.num_slot {
                anyhow::bail!(
                    "{}:{}: expected {} ids, got {got}",
                    path.display(),
                    lineno + 1,
                    self.num_slot
                );
            }
            self.labels.push(label);
        }
        Ok(())
    }

    /// Synthesise `num_examples` examples over `layout`.
    ///
    /// Ids are skewed towards the low end of each field so that row
    /// frequencies span several orders of magnitude. Labels follow a logistic
    /// model over a fixed per-row effect, so a trained model can beat chance.
    pub fn synthetic(layout: &FieldLayout, num_examples: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let num_slot = layout.num_slot();
        let mut indices = Vec::with_capacity(num_examples * num_slot);
        let mut labels = Vec::with_capacity(num_examples);
        for _ in 0..num_examples {
            let mut logit = 0.0f32;
            for slot in 0..num_slot {
                let size = layout.sizes()[slot].max(1);
                let u: f64 = rng.gen();
                let local = ((u * u * size as f64) as usize).min(size - 1);
                let id = (layout.offset(slot) + local) as i64;
                logit += row_effect(id);
                indices.push(id);
            }
            let p = 1.0 / (1.0 + (-logit).exp());
            labels.push(if rng.gen::<f32>() < p { 1.0 } else { 0.0 });
        }
        Self {
            num_slot,
            indices,
            labels,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_slot(&self) -> usize {
        self.num_slot
    }

    /// Split off the last `fraction` of examples (e.g. for validation).
    pub fn split(&self, fraction: f64) -> (Self, Self) {
        let n_tail = ((self.len() as f64) * fraction.clamp(0.0, 1.0)) as usize;
        let cut = self.len() - n_tail;
        let head = Self {
            num_slot: self.num_slot,
            indices: self.indices[..cut * self.num_slot].to_vec(),
            labels: self.labels[..cut].to_vec(),
        };
        let tail = Self {
            num_slot: self.num_slot,
            indices: self.indices[cut * self.num_slot..].to_vec(),
            labels: self.labels[cut..].to_vec(),
        };
        (head, tail)
    }

    /// Sequential full batches; the trailing partial batch is dropped.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = CtrBatch> + '_ {
        let n = if batch_size == 0 { 0 } else { self.len() / batch_size };
        (0..n).map(move |b| {
            let start = b * batch_size;
            CtrBatch {
                indices: self.indices[start * self.num_slot..(start + batch_size) * self.num_slot]
                    .to_vec(),
                labels: self.labels[start..start + batch_size].to_vec(),
                batch_size,
                num_slot: self.num_slot,
            }
        })
    }

    /// Occurrence count of every row id in `[0, num_embeddings)`.
    /// Out-of-range ids are ignored.
    pub fn frequencies(&self, num_embeddings: usize) -> Vec<u32> {
        let mut freq = vec![0u32; num_embeddings];
        for &id in &self.indices {
            if id >= 0 && (id as usize) < num_embeddings {
                freq[id as usize] = freq[id as usize].saturating_add(1);
            }
        }
        freq
    }

    /// Largest id plus one (0 when empty).
    pub fn max_id(&self) -> usize {
        self.indices
            .iter()
            .copied()
            .max()
            .map(|m| (m.max(-1) + 1) as usize)
            .unwrap_or(0)
    }
}

fn row_effect(id: i64) -> f32 {
    let h = (id as u64).wrapping_mul(2_654_435_761) % 1000;
    h as f32 / 1000.0 - 0.5
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a raw batch to `(indices: I64 (b, num_slot), labels: F32 (b, 1))`.
pub fn batch_to_tensors(batch: &CtrBatch, device: &Device) -> Result<(Tensor, Tensor)> {
    let input = Tensor::from_vec(
        batch.indices.clone(),
        (batch.batch_size, batch.num_slot),
        device,
    )?;
    let labels = Tensor::from_vec(batch.labels.clone(), (batch.batch_size, 1), device)?;
    Ok((input, labels))
}

/// Collect data files from a path (file or directory), sorted.
fn collect_files(path: &Path) -> AnyhowResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    if path.is_file() {
        out.push(path.to_path_buf());
    } else if path.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .map(|e| e == "txt" || e == "tsv")
                        .unwrap_or(false)
            })
            .collect();
        entries.sort();
        out = entries;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_layout_covers_all_rows() {
        let layout = FieldLayout::uniform(10, 3);
        assert_eq!(layout.sizes(), &[4, 3, 3]);
        assert_eq!(layout.offset(2), 7);
        assert_eq!(layout.total(), 10);
    }

    #[test]
    fn synthetic_ids_stay_in_their_field() {
        let layout = FieldLayout::new(vec![5, 50, 500]);
        let ds = CtrDataset::synthetic(&layout, 200, 7);
        assert_eq!(ds.len(), 200);
        for batch in ds.batches(50) {
            for row in batch.indices.chunks(3) {
                assert!((0..5).contains(&row[0]));
                assert!((5..55).contains(&row[1]));
                assert!((55..555).contains(&row[2]));
            }
        }
        assert!(ds.labels.iter().all(|&l| l == 0.0 || l == 1.0));
    }

    #[test]
    fn synthetic_is_deterministic() {
        let layout = FieldLayout::uniform(100, 4);
        let a = CtrDataset::synthetic(&layout, 32, 1);
        let b = CtrDataset::synthetic(&layout, 32, 1);
        assert_eq!(a.indices, b.indices);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn frequencies_count_occurrences() {
        let ds = CtrDataset {
            num_slot: 2,
            indices: vec![0, 3, 0, 2, 3, 3],
            labels: vec![1.0, 0.0, 1.0],
        };
        assert_eq!(ds.frequencies(4), vec![2, 0, 1, 3]);
        assert_eq!(ds.max_id(), 4);
    }

    #[test]
    fn split_and_batches() {
        let layout = FieldLayout::uniform(20, 2);
        let ds = CtrDataset::synthetic(&layout, 10, 3);
        let (train, valid) = ds.split(0.2);
        assert_eq!(train.len(), 8);
        assert_eq!(valid.len(), 2);
        assert_eq!(train.batches(3).count(), 2);
    }

    #[test]
    fn batch_tensors_have_expected_shape() {
        let batch = CtrBatch {
            indices: vec![1, 2, 3, 4, 5, 6],
            labels: vec![0.0, 1.0],
            batch_size: 2,
            num_slot: 3,
        };
        let (x, y) = batch_to_tensors(&batch, &Device::Cpu).unwrap();
        assert_eq!(x.dims(), &[2, 3]);
        assert_eq!(y.dims(), &[2, 1]);
        assert_eq!(x.dtype(), candle_core::DType::I64);
    }

    #[test]
    fn load_parses_text_lines() {
        let dir = std::env::temp_dir().join(format!("embedmem-data-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("part0.txt");
        std::fs::write(&file, "# label ids\n1 0 5\n0 2 7\n").unwrap();
        let ds = CtrDataset::load(&dir, 2).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.indices, vec![0, 5, 2, 7]);
        std::fs::write(&file, "1 0\n").unwrap();
        assert!(CtrDataset::load(&file, 2).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
