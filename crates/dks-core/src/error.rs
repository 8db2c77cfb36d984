//! Error type for the multimodal DKS workspace.

use thiserror::Error;

/// Errors produced by data handling, model construction and inference.
///
/// Tensor-library failures are wrapped into [`DksError::Internal`] with the
/// name of the operation that failed.
///
/// # Example
///
/// ```
/// use dks_core::DksError;
///
/// let err = DksError::UnknownModality { name: "audio".to_string() };
/// assert!(err.to_string().contains("audio"));
/// ```
#[derive(Debug, Error)]
pub enum DksError {
    /// A tensor operation or other internal step failed.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Construction-time parameters are inconsistent.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A modality array does not have the extents the batch requires.
    #[error("shape mismatch for modality '{modality}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        modality: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Sequence lengths are empty, zero, or exceed the time extent.
    #[error("invalid sequence lengths: {message}")]
    InvalidLengths { message: String },

    /// A modality name is not registered.
    #[error("unknown modality '{name}'")]
    UnknownModality { name: String },

    /// A dataset record is malformed.
    #[error("data error: {message}")]
    DataError { message: String },

    /// Filesystem failure while reading or writing datasets and checkpoints.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
