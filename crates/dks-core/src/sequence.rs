//! A single variable-length multimodal sequence.
//!
//! Each modality is stored row-major as `len × dim` values. A modality may
//! be omitted entirely, and individual entries may be `NaN` to mark them as
//! unobserved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DksError;
use crate::modality::{find_modality, ModalitySpec};

/// One multimodal sequence of `len` time steps.
///
/// # Example
///
/// ```
/// use dks_core::{ModalitySpec, Sequence};
///
/// let x = ModalitySpec::new("x", 2);
/// let mut seq = Sequence::new(3);
/// seq.insert(&x, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
///
/// assert_eq!(seq.len(), 3);
/// assert_eq!(seq.step("x", 1, 2), Some(&[2.0, 3.0][..]));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SequenceRepr")]
pub struct Sequence {
    len: usize,
    channels: BTreeMap<String, Vec<f32>>,
}

/// Unchecked wire form of [`Sequence`].
#[derive(Deserialize)]
struct SequenceRepr {
    len: usize,
    channels: BTreeMap<String, Vec<f32>>,
}

impl TryFrom<SequenceRepr> for Sequence {
    type Error = DksError;

    /// Each channel must hold a whole, non-zero number of values per step.
    fn try_from(repr: SequenceRepr) -> Result<Self, Self::Error> {
        for (name, data) in &repr.channels {
            let whole_steps = if repr.len == 0 {
                data.is_empty()
            } else {
                data.len() >= repr.len && data.len() % repr.len == 0
            };
            if !whole_steps {
                return Err(DksError::ShapeMismatch {
                    modality: name.clone(),
                    expected: vec![repr.len],
                    actual: vec![data.len()],
                });
            }
        }
        Ok(Self {
            len: repr.len,
            channels: repr.channels,
        })
    }
}

impl Sequence {
    /// Creates an empty sequence with `len` time steps and no modalities.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            channels: BTreeMap::new(),
        }
    }

    /// Number of valid time steps.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the sequence has no time steps.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores the `len × dim` values of one modality.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::ShapeMismatch`] if `data.len() != len * spec.dim`.
    pub fn insert(&mut self, spec: &ModalitySpec, data: Vec<f32>) -> Result<(), DksError> {
        let expected = self.len * spec.dim;
        if data.len() != expected {
            return Err(DksError::ShapeMismatch {
                modality: spec.name.clone(),
                expected: vec![self.len, spec.dim],
                actual: vec![data.len()],
            });
        }
        self.channels.insert(spec.name.clone(), data);
        Ok(())
    }

    /// Removes a modality, returning its data if it was present.
    pub fn remove(&mut self, name: &str) -> Option<Vec<f32>> {
        self.channels.remove(name)
    }

    /// Returns the raw row-major data of a modality.
    pub fn channel(&self, name: &str) -> Option<&[f32]> {
        self.channels.get(name).map(Vec::as_slice)
    }

    /// Mutable access to the raw data of a modality.
    pub fn channel_mut(&mut self, name: &str) -> Option<&mut [f32]> {
        self.channels.get_mut(name).map(Vec::as_mut_slice)
    }

    /// Names of the modalities present in this sequence.
    pub fn modalities(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Returns the features of one modality at time step `t`.
    ///
    /// `None` if `t` is out of range, the modality is absent, or the stored
    /// channel is not `len × dim` values.
    pub fn step(&self, name: &str, t: usize, dim: usize) -> Option<&[f32]> {
        if t >= self.len {
            return None;
        }
        let data = self.channels.get(name)?;
        if data.len() != self.len * dim {
            return None;
        }
        data.get(t * dim..(t + 1) * dim)
    }

    /// Checks every stored modality against the registered specs.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::UnknownModality`] for an unregistered channel and
    /// [`DksError::ShapeMismatch`] for a channel of the wrong size.
    pub fn validate(&self, specs: &[ModalitySpec]) -> Result<(), DksError> {
        for (name, data) in &self.channels {
            let spec = find_modality(specs, name)?;
            if data.len() != self.len * spec.dim {
                return Err(DksError::ShapeMismatch {
                    modality: name.clone(),
                    expected: vec![self.len, spec.dim],
                    actual: vec![data.len()],
                });
            }
        }
        Ok(())
    }

    /// Fraction of stored entries that are observed (not `NaN`).
    ///
    /// Returns 0.0 for a sequence without any stored values.
    pub fn observed_fraction(&self) -> f32 {
        let (total, observed) = self
            .channels
            .values()
            .flat_map(|data| data.iter())
            .fold((0usize, 0usize), |(total, observed), x| {
                (total + 1, observed + usize::from(!x.is_nan()))
            });
        if total == 0 {
            0.0
        } else {
            observed as f32 / total as f32
        }
    }
}
