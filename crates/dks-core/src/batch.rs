//! Batch collation: variable-length sequences → time-major padded arrays.
//!
//! Layout of every modality array is `[T, B, D]` flattened row-major, where
//! `T` is the longest sequence in the batch, `B` the number of sequences and
//! `D` the modality dimension. Steps past a sequence's length are zero;
//! a modality missing from one sequence is `NaN` for that sequence; a
//! modality missing from every sequence is left out of the batch.

use std::collections::BTreeMap;

use crate::error::DksError;
use crate::modality::ModalitySpec;
use crate::sequence::Sequence;

/// A time-major padded batch of multimodal sequences.
///
/// # Example
///
/// ```
/// use dks_core::{collate, ModalitySpec, Sequence};
///
/// let x = ModalitySpec::new("x", 1);
/// let mut short = Sequence::new(1);
/// short.insert(&x, vec![1.0]).unwrap();
/// let mut long = Sequence::new(3);
/// long.insert(&x, vec![2.0, 3.0, 4.0]).unwrap();
///
/// let batch = collate(&[short, long], &[x]).unwrap();
/// assert_eq!(batch.max_len(), 3);
/// assert_eq!(batch.lengths(), &[1, 3]);
/// assert_eq!(batch.shape("x"), Some([3, 2, 1]));
/// assert_eq!(batch.mask(), vec![1.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
/// ```
#[derive(Debug, Clone)]
pub struct PaddedBatch {
    modalities: Vec<ModalitySpec>,
    data: BTreeMap<String, Vec<f32>>,
    lengths: Vec<usize>,
    max_len: usize,
}

impl PaddedBatch {
    /// Registered modalities, in registration order.
    pub fn modalities(&self) -> &[ModalitySpec] {
        &self.modalities
    }

    /// Valid length of each sequence.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Time extent `T` of every array in the batch.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Number of sequences `B`.
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Flattened `[T, B, D]` data of a modality, if any sequence had it.
    pub fn data(&self, name: &str) -> Option<&[f32]> {
        self.data.get(name).map(Vec::as_slice)
    }

    /// `[T, B, D]` extents of a present modality.
    pub fn shape(&self, name: &str) -> Option<[usize; 3]> {
        let spec = self.modalities.iter().find(|s| s.name == name)?;
        self.data
            .contains_key(name)
            .then(|| [self.max_len, self.batch_size(), spec.dim])
    }

    /// Iterates over the present modalities and their flattened data.
    pub fn present(&self) -> impl Iterator<Item = (&ModalitySpec, &[f32])> {
        self.modalities
            .iter()
            .filter_map(|spec| self.data.get(&spec.name).map(|d| (spec, d.as_slice())))
    }

    /// `[T, B]` validity mask: 1.0 where `t < lengths[b]`, else 0.0.
    pub fn mask(&self) -> Vec<f32> {
        let b = self.batch_size();
        let mut mask = vec![0.0; self.max_len * b];
        for (j, &len) in self.lengths.iter().enumerate() {
            for t in 0..len {
                mask[t * b + j] = 1.0;
            }
        }
        mask
    }
}

/// Pads a slice of sequences into a [`PaddedBatch`].
///
/// # Errors
///
/// Returns [`DksError::InvalidLengths`] for an empty slice or a zero-length
/// sequence, and propagates [`crate::Sequence::validate`] failures.
pub fn collate(sequences: &[Sequence], specs: &[ModalitySpec]) -> Result<PaddedBatch, DksError> {
    if sequences.is_empty() {
        return Err(DksError::InvalidLengths {
            message: "cannot collate an empty batch".to_string(),
        });
    }
    for (i, seq) in sequences.iter().enumerate() {
        if seq.is_empty() {
            return Err(DksError::InvalidLengths {
                message: format!("sequence {i} has zero length"),
            });
        }
        seq.validate(specs)?;
    }

    let lengths: Vec<usize> = sequences.iter().map(Sequence::len).collect();
    let max_len = lengths.iter().copied().max().unwrap_or(0);
    let batch = sequences.len();

    let mut data = BTreeMap::new();
    for spec in specs {
        if sequences.iter().all(|s| s.channel(&spec.name).is_none()) {
            continue;
        }
        let dim = spec.dim;
        let mut out = vec![0.0f32; max_len * batch * dim];
        for (j, seq) in sequences.iter().enumerate() {
            match seq.channel(&spec.name) {
                Some(src) => {
                    for t in 0..seq.len() {
                        let dst = (t * batch + j) * dim;
                        out[dst..dst + dim].copy_from_slice(&src[t * dim..(t + 1) * dim]);
                    }
                }
                None => {
                    for t in 0..seq.len() {
                        let dst = (t * batch + j) * dim;
                        out[dst..dst + dim].fill(f32::NAN);
                    }
                }
            }
        }
        data.insert(spec.name.clone(), out);
    }

    Ok(PaddedBatch {
        modalities: specs.to_vec(),
        data,
        lengths,
        max_len,
    })
}
