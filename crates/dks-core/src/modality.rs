//! Modality descriptors.

use serde::{Deserialize, Serialize};

use crate::error::DksError;

/// A named data stream with a fixed per-step feature dimension.
///
/// # Example
///
/// ```
/// use dks_core::ModalitySpec;
///
/// let audio = ModalitySpec::new("audio", 64);
/// assert_eq!(audio.name, "audio");
/// assert_eq!(audio.dim, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModalitySpec {
    /// Modality identifier, e.g. `"audio"` or `"spiral-x"`.
    pub name: String,
    /// Feature dimension of one time step.
    pub dim: usize,
}

impl ModalitySpec {
    /// Creates a new modality spec.
    pub fn new(name: impl Into<String>, dim: usize) -> Self {
        Self {
            name: name.into(),
            dim,
        }
    }
}

/// Checks that a modality list is non-empty, has unique names and
/// non-zero dimensions.
///
/// # Errors
///
/// Returns [`DksError::InvalidConfig`] describing the first problem found.
///
/// # Example
///
/// ```
/// use dks_core::{validate_modalities, ModalitySpec};
///
/// let mods = vec![ModalitySpec::new("a", 1), ModalitySpec::new("b", 1)];
/// assert!(validate_modalities(&mods).is_ok());
///
/// let dup = vec![ModalitySpec::new("a", 1), ModalitySpec::new("a", 2)];
/// assert!(validate_modalities(&dup).is_err());
/// ```
pub fn validate_modalities(specs: &[ModalitySpec]) -> Result<(), DksError> {
    if specs.is_empty() {
        return Err(DksError::InvalidConfig {
            message: "at least one modality is required".to_string(),
        });
    }
    for (i, spec) in specs.iter().enumerate() {
        if spec.name.is_empty() {
            return Err(DksError::InvalidConfig {
                message: format!("modality {i} has an empty name"),
            });
        }
        if spec.dim == 0 {
            return Err(DksError::InvalidConfig {
                message: format!("modality '{}' has zero dimension", spec.name),
            });
        }
        if specs[..i].iter().any(|other| other.name == spec.name) {
            return Err(DksError::InvalidConfig {
                message: format!("modality '{}' is registered twice", spec.name),
            });
        }
    }
    Ok(())
}

/// Looks up a modality by name.
///
/// # Errors
///
/// Returns [`DksError::UnknownModality`] if no spec has that name.
pub fn find_modality<'a>(
    specs: &'a [ModalitySpec],
    name: &str,
) -> Result<&'a ModalitySpec, DksError> {
    specs
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| DksError::UnknownModality {
            name: name.to_string(),
        })
}
