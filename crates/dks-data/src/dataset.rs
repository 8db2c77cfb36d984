//! In-memory multimodal sequence dataset.
//!
//! ## Storage format
//!
//! [`MultiseqDataset::save_jsonl`] writes one JSON object per line:
//!
//! ```text
//! {"len":3,"channels":{"spiral-x":[0.1,null,0.3],"spiral-y":[0.0,0.2,0.4]}}
//! ```
//!
//! Unobserved (`NaN`) entries are stored as `null`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use candle_core::Device;
use dks_core::{collate, validate_modalities, DksError, ModalitySpec, PaddedBatch, Sequence};
use dks_model::SequenceBatch;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::corruption::Corruption;

/// Per-modality, per-dimension statistics keyed by modality name.
pub type ChannelStats = BTreeMap<String, (Vec<f32>, Vec<f32>)>;

/// A set of sequences over a fixed list of modalities.
///
/// # Example
///
/// ```
/// use dks_core::{ModalitySpec, Sequence};
/// use dks_data::MultiseqDataset;
///
/// let x = ModalitySpec::new("x", 1);
/// let mut seq = Sequence::new(2);
/// seq.insert(&x, vec![1.0, 3.0]).unwrap();
///
/// let dataset = MultiseqDataset::new(vec![x], vec![seq]).unwrap();
/// let stats = dataset.mean_and_std();
/// assert_eq!(stats["x"].0, vec![2.0]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MultiseqDataset {
    modalities: Vec<ModalitySpec>,
    sequences: Vec<Sequence>,
}

#[derive(Serialize, Deserialize)]
struct SequenceRecord {
    len: usize,
    channels: BTreeMap<String, Vec<Option<f32>>>,
}

impl MultiseqDataset {
    /// Creates a dataset, validating every sequence against `modalities`.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::InvalidConfig`] for a bad modality list and the
    /// error of [`Sequence::validate`] for a malformed sequence.
    pub fn new(modalities: Vec<ModalitySpec>, sequences: Vec<Sequence>) -> Result<Self, DksError> {
        validate_modalities(&modalities)?;
        for seq in &sequences {
            seq.validate(&modalities)?;
        }
        Ok(Self {
            modalities,
            sequences,
        })
    }

    /// Registered modalities.
    pub fn modalities(&self) -> &[ModalitySpec] {
        &self.modalities
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Returns `true` if the dataset holds no sequences.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Sequence at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&Sequence> {
        self.sequences.get(index)
    }

    /// All sequences in storage order.
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    /// Appends a sequence.
    ///
    /// # Errors
    ///
    /// Returns the error of [`Sequence::validate`] if it does not fit the
    /// dataset's modalities.
    pub fn push(&mut self, seq: Sequence) -> Result<(), DksError> {
        seq.validate(&self.modalities)?;
        self.sequences.push(seq);
        Ok(())
    }

    /// Randomly partitions into `(train, test)`, with
    /// `round(len * test_fraction)` sequences in `test`.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::InvalidConfig`] if `test_fraction` is outside
    /// `[0, 1]`.
    pub fn split(&self, test_fraction: f64, seed: u64) -> Result<(Self, Self), DksError> {
        if !(0.0..=1.0).contains(&test_fraction) {
            return Err(DksError::InvalidConfig {
                message: format!("test_fraction must be in [0, 1], got {test_fraction}"),
            });
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let n_test = (self.len() as f64 * test_fraction).round() as usize;

        let pick = |indices: &[usize]| Self {
            modalities: self.modalities.clone(),
            sequences: indices.iter().map(|&i| self.sequences[i].clone()).collect(),
        };
        let (test, train) = order.split_at(n_test);
        Ok((pick(train), pick(test)))
    }

    /// Groups sequences into padded batches of at most `batch_size`.
    ///
    /// With `shuffle_seed` the order is permuted first; otherwise storage
    /// order is kept.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::InvalidConfig`] if `batch_size` is zero and the
    /// error of [`collate`] for a batch containing an empty sequence.
    pub fn batches(
        &self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Result<Vec<PaddedBatch>, DksError> {
        if batch_size == 0 {
            return Err(DksError::InvalidConfig {
                message: "batch_size must be positive".to_string(),
            });
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(seed) = shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        order
            .chunks(batch_size)
            .map(|chunk| {
                let seqs: Vec<Sequence> =
                    chunk.iter().map(|&i| self.sequences[i].clone()).collect();
                collate(&seqs, &self.modalities)
            })
            .collect()
    }

    /// [`MultiseqDataset::batches`] uploaded to `device`.
    ///
    /// # Errors
    ///
    /// As [`MultiseqDataset::batches`], plus [`DksError::Internal`] if a
    /// tensor cannot be created.
    pub fn device_batches(
        &self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
        device: &Device,
    ) -> Result<Vec<SequenceBatch>, DksError> {
        self.batches(batch_size, shuffle_seed)?
            .iter()
            .map(|batch| SequenceBatch::from_padded(batch, device))
            .collect()
    }

    /// Deletes observations in place; returns the number of deleted
    /// (step, modality) pairs.
    ///
    /// # Errors
    ///
    /// Returns the error of [`Corruption::validate`].
    pub fn corrupt(&mut self, corruption: &Corruption, seed: u64) -> Result<usize, DksError> {
        corruption.validate(&self.modalities)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let deleted = self
            .sequences
            .iter_mut()
            .map(|seq| corruption.apply(seq, &self.modalities, &mut rng))
            .sum();
        tracing::debug!(?corruption, deleted, "corrupted dataset");
        Ok(deleted)
    }

    /// Mean and standard deviation of every dimension, over observed
    /// entries of all sequences.
    ///
    /// A dimension with no observations gets mean 0 and std 1.
    pub fn mean_and_std(&self) -> ChannelStats {
        self.fold_channels(|values| {
            if values.is_empty() {
                return (0.0, 1.0);
            }
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            (mean as f32, var.sqrt() as f32)
        })
    }

    /// Maximum and minimum of every dimension, over observed entries.
    ///
    /// A dimension with no observations gets `(NaN, NaN)`.
    pub fn max_and_min(&self) -> ChannelStats {
        self.fold_channels(|values| {
            if values.is_empty() {
                return (f32::NAN, f32::NAN);
            }
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            (max as f32, min as f32)
        })
    }

    /// Standardizes every modality in place with `(x - mean) / std`.
    ///
    /// Modalities missing from `stats` are left as is. A std below `1e-8`
    /// is treated as 1. `NaN` entries stay `NaN`.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::ShapeMismatch`] if a modality's stats do not
    /// have one entry per dimension.
    pub fn normalize(&mut self, stats: &ChannelStats) -> Result<(), DksError> {
        for spec in &self.modalities {
            let Some((mean, std)) = stats.get(&spec.name) else {
                continue;
            };
            if mean.len() != spec.dim || std.len() != spec.dim {
                return Err(DksError::ShapeMismatch {
                    modality: spec.name.clone(),
                    expected: vec![spec.dim],
                    actual: vec![mean.len(), std.len()],
                });
            }
            for seq in &mut self.sequences {
                let Some(data) = seq.channel_mut(&spec.name) else {
                    continue;
                };
                for step in data.chunks_mut(spec.dim) {
                    for ((x, m), s) in step.iter_mut().zip(mean).zip(std) {
                        let s = if *s < 1e-8 { 1.0 } else { *s };
                        *x = (*x - m) / s;
                    }
                }
            }
        }
        Ok(())
    }

    /// Reads sequences stored one JSON object per line.
    ///
    /// Blank lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::Io`] if the file cannot be read,
    /// [`DksError::DataError`] for a malformed line, and the error of
    /// [`Sequence::validate`] for a sequence that does not fit `modalities`.
    pub fn load_jsonl(
        path: impl AsRef<Path>,
        modalities: Vec<ModalitySpec>,
    ) -> Result<Self, DksError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut sequences = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: SequenceRecord =
                serde_json::from_str(&line).map_err(|e| DksError::DataError {
                    message: format!("{}:{}: {e}", path.display(), line_no + 1),
                })?;
            let mut seq = Sequence::new(record.len);
            for (name, values) in record.channels {
                let spec = dks_core::find_modality(&modalities, &name)?;
                let values = values.into_iter().map(|v| v.unwrap_or(f32::NAN)).collect();
                seq.insert(spec, values)?;
            }
            sequences.push(seq);
        }

        tracing::info!(path = %path.display(), sequences = sequences.len(), "loaded dataset");
        Self::new(modalities, sequences)
    }

    /// Writes every sequence as one JSON object per line.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::Io`] if the file cannot be written and
    /// [`DksError::DataError`] if serialization fails.
    pub fn save_jsonl(&self, path: impl AsRef<Path>) -> Result<(), DksError> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        for seq in &self.sequences {
            let record = SequenceRecord {
                len: seq.len(),
                channels: seq
                    .modalities()
                    .filter_map(|name| seq.channel(name).map(|data| (name, data)))
                    .map(|(name, data)| {
                        let values = data
                            .iter()
                            .map(|&x| if x.is_nan() { None } else { Some(x) })
                            .collect();
                        (name.to_string(), values)
                    })
                    .collect(),
            };
            serde_json::to_writer(&mut writer, &record).map_err(|e| DksError::DataError {
                message: format!("{}: {e}", path.display()),
            })?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        tracing::info!(path = %path.display(), sequences = self.len(), "saved dataset");
        Ok(())
    }

    /// Applies `reduce` to the observed values of each (modality, dim).
    fn fold_channels<F>(&self, reduce: F) -> ChannelStats
    where
        F: Fn(&[f64]) -> (f32, f32),
    {
        let mut out = BTreeMap::new();
        for spec in &self.modalities {
            let mut per_dim: Vec<Vec<f64>> = vec![Vec::new(); spec.dim];
            for seq in &self.sequences {
                let Some(data) = seq.channel(&spec.name) else {
                    continue;
                };
                for step in data.chunks(spec.dim) {
                    for (values, &x) in per_dim.iter_mut().zip(step) {
                        if !x.is_nan() {
                            values.push(f64::from(x));
                        }
                    }
                }
            }
            let (first, second): (Vec<f32>, Vec<f32>) =
                per_dim.iter().map(|v| reduce(v)).unzip();
            out.insert(spec.name.clone(), (first, second));
        }
        out
    }
}
