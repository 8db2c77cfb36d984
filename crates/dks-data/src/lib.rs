//! # dks-data
//!
//! Data side of the multimodal Deep Kalman Smoother:
//!
//! - [`spirals`]: the synthetic noisy-spirals benchmark
//! - [`Corruption`]: synthetic deletion of observations
//! - [`align`]: resampling modalities recorded at different rates
//! - [`MultiseqDataset`]: in-memory datasets with splits, batching,
//!   statistics and JSON-lines storage
//!
//! The `dks-spirals` binary trains and samples a model on spirals.

pub mod align;
pub mod corruption;
pub mod dataset;
pub mod spirals;

pub use corruption::Corruption;
pub use dataset::{ChannelStats, MultiseqDataset};
