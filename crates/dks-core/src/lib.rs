//! # dks-core
//!
//! Host-side data types shared by every crate in the multimodal Deep
//! Kalman Smoother workspace.
//!
//! ## Key Components
//!
//! - [`ModalitySpec`]: a named data stream with a fixed feature dimension
//! - [`Sequence`]: one variable-length multimodal sequence, row-major per modality
//! - [`PaddedBatch`]: time-major, zero-padded batch with lengths and a validity mask
//! - [`collate`]: turns a slice of sequences into a [`PaddedBatch`]
//! - [`DksError`]: the error type used across the workspace
//!
//! ## Architecture Rules
//!
//! - No tensor library here. `dks-model` converts [`PaddedBatch`] into
//!   device tensors.
//! - Missing observations are `f32::NAN`, never a malformed shape.

pub mod batch;
pub mod error;
pub mod modality;
pub mod sequence;

pub use batch::{collate, PaddedBatch};
pub use error::DksError;
pub use modality::{find_modality, validate_modalities, ModalitySpec};
pub use sequence::Sequence;
