//! # dks-model
//!
//! The multimodal Deep Kalman Smoother, built on candle.
//!
//! Given a batch of multimodal, variable-length sequences with missing
//! modalities, the model:
//! - **Encodes** each modality per time step (missing values zero-masked)
//! - **Summarises** the future with a reverse-time GRU over the embeddings
//! - **Smooths** forward in time: prior from `z_{t-1}`, posterior from
//!   `z_{t-1}` and the backward summary, then samples (or takes the mean of)
//!   `z_t`
//! - **Decodes** `z_t` into a Gaussian reconstruction of every modality
//!
//! ## Key Components
//!
//! - [`MultiDks`]: construction, [`MultiDks::forward`], [`MultiDks::sample`]
//! - [`config::DksConfig`] / [`config::DevicePreference`]: construction parameters
//! - [`SequenceBatch`]: device-side input batch
//! - [`loss::elbo_loss`]: masked negative ELBO
//! - [`training::train`] / [`training::evaluate`]: AdamW training loop and metrics
//! - [`checkpoint`]: safetensors save/load
//!
//! ## GPU Support
//!
//! Enable `cuda` or `metal` and request the device in the config; an
//! unavailable accelerator falls back to the CPU:
//! ```bash
//! cargo test -p dks-model --features cuda
//! ```

pub use dks_core;

// Internal shared primitives
mod nn;

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod gaussian;
pub mod loss;
pub mod model;
pub mod training;

pub use batch::SequenceBatch;
pub use config::{DevicePreference, DksConfig};
pub use gaussian::Gaussian;
pub use model::{DksOutput, MultiDks};
