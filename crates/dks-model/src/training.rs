//! Minibatch ELBO training and evaluation.
//!
//! ## Algorithm
//!
//! For each epoch:
//! 1. Shuffle the batch order (seeded)
//! 2. For each batch: sampled forward pass, negative ELBO averaged over
//!    valid steps, backprop + AdamW step
//! 3. The KL weight ramps linearly from 0 to `kld_mult` over the first
//!    `kld_anneal_epochs` epochs
//!
//! Evaluation runs the forward pass in MAP mode and reports the ELBO and
//! the reconstruction MSE over observed, valid entries.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};
use candle_nn::{Optimizer, VarMap};
use dks_core::DksError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::batch::SequenceBatch;
use crate::loss::{elbo_loss, LossWeights};
use crate::model::MultiDks;
use crate::nn::zero_nan;

/// Configuration for [`train`].
///
/// # Example
///
/// ```
/// use dks_model::training::TrainConfig;
///
/// let config = TrainConfig::default();
/// assert_eq!(config.learning_rate, 5e-3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// AdamW learning rate (default: 5e-3).
    pub learning_rate: f64,

    /// AdamW weight decay (default: 0.0).
    pub weight_decay: f64,

    /// Number of passes over the batches (default: 100).
    pub epochs: usize,

    /// Final KL multiplier (default: 1.0).
    pub kld_mult: f64,

    /// Epochs over which the KL multiplier ramps up from 0 (default: 0,
    /// i.e. no annealing).
    pub kld_anneal_epochs: usize,

    /// Per-modality reconstruction multipliers; missing entries are 1.0.
    pub rec_mults: BTreeMap<String, f64>,

    /// Seed for batch shuffling.
    pub seed: u64,

    /// Epochs between progress log lines (default: 10).
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-3,
            weight_decay: 0.0,
            epochs: 100,
            kld_mult: 1.0,
            kld_anneal_epochs: 0,
            rec_mults: BTreeMap::new(),
            seed: 42,
            log_every: 10,
        }
    }
}

impl TrainConfig {
    /// KL multiplier used during `epoch` (0-based).
    ///
    /// # Example
    ///
    /// ```
    /// use dks_model::training::TrainConfig;
    ///
    /// let config = TrainConfig { kld_anneal_epochs: 4, ..TrainConfig::default() };
    /// assert_eq!(config.kld_weight(0), 0.25);
    /// assert_eq!(config.kld_weight(3), 1.0);
    /// assert_eq!(config.kld_weight(10), 1.0);
    /// ```
    pub fn kld_weight(&self, epoch: usize) -> f64 {
        if self.kld_anneal_epochs == 0 {
            return self.kld_mult;
        }
        let ramp = ((epoch + 1) as f64 / self.kld_anneal_epochs as f64).min(1.0);
        self.kld_mult * ramp
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone)]
pub struct TrainResult {
    /// Mean per-step loss of the last epoch.
    pub final_loss: f32,
    /// Mean per-step loss of every epoch.
    pub loss_history: Vec<f32>,
    /// Number of epochs completed.
    pub epochs_completed: usize,
}

/// Evaluation metrics in MAP mode.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalMetrics {
    /// Negative ELBO per valid step, with unit weights.
    pub elbo: f32,
    /// Mean squared reconstruction error per modality over observed entries.
    pub mse: BTreeMap<String, f32>,
}

/// Trains `model` (whose parameters live in `var_map`) on `batches`.
///
/// # Errors
///
/// Returns [`DksError::DataError`] if `batches` is empty and
/// [`DksError::Internal`] if the optimizer fails or the loss diverges.
pub fn train(
    model: &MultiDks,
    var_map: &VarMap,
    batches: &[SequenceBatch],
    config: &TrainConfig,
) -> Result<TrainResult, DksError> {
    if batches.is_empty() {
        return Err(DksError::DataError {
            message: "train: no batches provided".to_string(),
        });
    }
    let map_err = |e: candle_core::Error| DksError::Internal {
        message: format!("train: {e}"),
    };

    let mut optimizer = candle_nn::AdamW::new(
        var_map.all_vars(),
        candle_nn::ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        },
    )
    .map_err(map_err)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut order: Vec<usize> = (0..batches.len()).collect();
    let mut loss_history = Vec::with_capacity(config.epochs);

    for epoch in 0..config.epochs {
        order.shuffle(&mut rng);
        let weights = LossWeights {
            kld_mult: config.kld_weight(epoch),
            rec_mults: config.rec_mults.clone(),
            average: true,
        };

        let mut epoch_loss = 0.0f32;
        for &i in &order {
            let output = model.forward(&batches[i], true)?;
            let loss = elbo_loss(&batches[i], &output, &weights)?;
            let value = loss.value()?;
            if !value.is_finite() {
                return Err(DksError::Internal {
                    message: format!("train: loss diverged at epoch {epoch} ({value})"),
                });
            }
            optimizer.backward_step(&loss.total).map_err(map_err)?;
            tracing::debug!(epoch, batch = i, loss = value, "train step");
            epoch_loss += value;
        }

        let mean_loss = epoch_loss / batches.len() as f32;
        loss_history.push(mean_loss);
        if config.log_every > 0 && (epoch + 1) % config.log_every == 0 {
            tracing::info!(
                epoch = epoch + 1,
                loss = mean_loss,
                kld_mult = weights.kld_mult,
                "training progress"
            );
        }
    }

    Ok(TrainResult {
        final_loss: loss_history.last().copied().unwrap_or(f32::NAN),
        epochs_completed: loss_history.len(),
        loss_history,
    })
}

/// Evaluates `model` on `batches` without sampling.
///
/// # Errors
///
/// Returns [`DksError::DataError`] if `batches` is empty and
/// [`DksError::Internal`] if a tensor operation fails.
pub fn evaluate(model: &MultiDks, batches: &[SequenceBatch]) -> Result<EvalMetrics, DksError> {
    if batches.is_empty() {
        return Err(DksError::DataError {
            message: "evaluate: no batches provided".to_string(),
        });
    }
    let map_err = |e: candle_core::Error| DksError::Internal {
        message: format!("evaluate: {e}"),
    };

    let weights = LossWeights::default();
    let mut elbo_sum = 0.0f64;
    let mut steps = 0.0f64;
    let mut sq_err: BTreeMap<String, (f64, f64)> = BTreeMap::new();

    for batch in batches {
        let output = model.forward(batch, false)?;
        elbo_sum += f64::from(elbo_loss(batch, &output, &weights)?.value()?);
        steps += batch.lengths().iter().sum::<usize>() as f64;

        let mask = batch
            .mask(output.time_steps(), model.device())
            .map_err(map_err)?;
        for (name, x) in batch.iter() {
            let Some(dist) = output.reconstructions.get(name) else {
                continue;
            };
            let (err, count) = masked_sq_error(&dist.mean, x, &mask).map_err(map_err)?;
            let entry = sq_err.entry(name.to_string()).or_insert((0.0, 0.0));
            entry.0 += err;
            entry.1 += count;
        }
    }

    let mse = sq_err
        .into_iter()
        .map(|(name, (err, count))| {
            let mse = if count > 0.0 { err / count } else { 0.0 };
            (name, mse as f32)
        })
        .collect();

    Ok(EvalMetrics {
        elbo: (elbo_sum / steps.max(1.0)) as f32,
        mse,
    })
}

/// Sum of squared errors and number of entries that are both observed and
/// inside a sequence's length.
fn masked_sq_error(
    mean: &Tensor,
    x: &Tensor,
    mask: &Tensor,
) -> candle_core::Result<(f64, f64)> {
    let x = x.to_device(mean.device())?.to_dtype(DType::F32)?;
    let observed = x.eq(&x)?.to_dtype(DType::F32)?;
    let weight = observed.broadcast_mul(&mask.unsqueeze(D::Minus1)?)?;
    let err = (zero_nan(&x)? - mean)?.sqr()?.mul(&weight)?.sum_all()?;
    let count = weight.sum_all()?;
    Ok((
        f64::from(err.to_scalar::<f32>()?),
        f64::from(count.to_scalar::<f32>()?),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn masked_sq_error_ignores_nan_and_padding() {
        let device = Device::Cpu;
        // [T=2, B=1, D=2]
        let mean = Tensor::from_slice(&[1.0f32, 1.0, 1.0, 1.0], (2, 1, 2), &device).unwrap();
        let x = Tensor::from_slice(&[3.0f32, f32::NAN, 100.0, 100.0], (2, 1, 2), &device).unwrap();
        let mask = Tensor::from_slice(&[1.0f32, 0.0], (2, 1), &device).unwrap();
        let (err, count) = masked_sq_error(&mean, &x, &mask).unwrap();
        assert_eq!(count, 1.0);
        assert!((err - 4.0).abs() < 1e-6);
    }

    #[test]
    fn anneal_disabled_uses_full_weight() {
        let config = TrainConfig {
            kld_mult: 0.5,
            ..TrainConfig::default()
        };
        assert_eq!(config.kld_weight(0), 0.5);
    }
}
