//! Device-side sequence batches.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use dks_core::{DksError, PaddedBatch};

/// A multimodal, time-major batch ready for [`crate::MultiDks::forward`].
///
/// Holds one `[T, B, D]` tensor per present modality and the valid length
/// of every sequence. Modalities may be omitted; entries may be `NaN`.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use dks_model::SequenceBatch;
///
/// let x = Tensor::zeros((4, 2, 1), DType::F32, &Device::Cpu).unwrap();
/// let batch = SequenceBatch::new(vec![4, 2]).with_modality("x", x);
/// assert_eq!(batch.batch_size(), 2);
/// assert!(batch.get("x").is_some());
/// ```
#[derive(Debug, Clone)]
pub struct SequenceBatch {
    inputs: BTreeMap<String, Tensor>,
    lengths: Vec<usize>,
}

impl SequenceBatch {
    /// Creates a batch with the given lengths and no modality data.
    pub fn new(lengths: Vec<usize>) -> Self {
        Self {
            inputs: BTreeMap::new(),
            lengths,
        }
    }

    /// Builder-style [`SequenceBatch::insert`].
    pub fn with_modality(mut self, name: impl Into<String>, data: Tensor) -> Self {
        self.insert(name, data);
        self
    }

    /// Adds or replaces the `[T, B, D]` data of a modality.
    pub fn insert(&mut self, name: impl Into<String>, data: Tensor) {
        self.inputs.insert(name.into(), data);
    }

    /// Removes a modality from the batch.
    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.inputs.remove(name)
    }

    /// Data of a modality, if present.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.inputs.get(name)
    }

    /// Iterates over present modalities.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.inputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Valid length of each sequence.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Number of sequences.
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Longest valid length in the batch.
    pub fn max_len(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    /// Uploads a host-side [`PaddedBatch`] to `device`.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::Internal`] if tensor creation fails.
    pub fn from_padded(batch: &PaddedBatch, device: &Device) -> Result<Self, DksError> {
        let map_err = |e: candle_core::Error| DksError::Internal {
            message: format!("SequenceBatch from_padded: {e}"),
        };
        let mut out = Self::new(batch.lengths().to_vec());
        for (spec, data) in batch.present() {
            let shape = (batch.max_len(), batch.batch_size(), spec.dim);
            let tensor = Tensor::from_slice(data, shape, device).map_err(map_err)?;
            out.insert(spec.name.clone(), tensor);
        }
        Ok(out)
    }

    /// `[T, B]` float mask: 1.0 where `t < lengths[b]`, else 0.0.
    pub fn mask(&self, time_steps: usize, device: &Device) -> candle_core::Result<Tensor> {
        length_mask(&self.lengths, time_steps, device)
    }
}

pub(crate) fn length_mask(
    lengths: &[usize],
    time_steps: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let b = lengths.len();
    let mut mask = vec![0.0f32; time_steps * b];
    for (j, &len) in lengths.iter().enumerate() {
        for t in 0..len.min(time_steps) {
            mask[t * b + j] = 1.0;
        }
    }
    Tensor::from_vec(mask, (time_steps, b), device)?.to_dtype(DType::F32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dks_core::{collate, ModalitySpec, Sequence};

    #[test]
    fn from_padded_keeps_layout() {
        let x = ModalitySpec::new("x", 2);
        let mut a = Sequence::new(2);
        a.insert(&x, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut b = Sequence::new(1);
        b.insert(&x, vec![5.0, 6.0]).unwrap();
        let padded = collate(&[a, b], &[x]).unwrap();

        let batch = SequenceBatch::from_padded(&padded, &Device::Cpu).unwrap();
        let t = batch.get("x").unwrap();
        assert_eq!(t.dims(), &[2, 2, 2]);
        let v = t.to_vec3::<f32>().unwrap();
        assert_eq!(v[0], vec![vec![1.0, 2.0], vec![5.0, 6.0]]);
        assert_eq!(v[1], vec![vec![3.0, 4.0], vec![0.0, 0.0]]);
        assert_eq!(batch.lengths(), &[2, 1]);
    }

    #[test]
    fn mask_marks_valid_steps() {
        let batch = SequenceBatch::new(vec![1, 3]);
        let mask = batch.mask(3, &Device::Cpu).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(mask, vec![vec![1.0, 1.0], vec![0.0, 1.0], vec![0.0, 1.0]]);
    }
}
