//! Evidence lower bound for training the smoother.
//!
//! ```text
//! loss = kld_mult · Σ_t KL(q(z_t) ‖ p(z_t))  +  Σ_m rec_mult_m · Σ_t −log p(x_t^m | z_t)
//! ```
//!
//! Both sums run over valid steps only (the `[T, B]` length mask), and the
//! reconstruction term skips `NaN` (unobserved) entries.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};
use dks_core::DksError;
use serde::{Deserialize, Serialize};

use crate::batch::SequenceBatch;
use crate::model::DksOutput;
use crate::nn::zero_nan;

/// `ln(2π)`.
const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// KL divergence `KL(N(mean_1, std_1²) ‖ N(mean_2, std_2²))` of diagonal
/// Gaussians, summed over the last axis.
pub fn kld_gauss(
    mean_1: &Tensor,
    std_1: &Tensor,
    mean_2: &Tensor,
    std_2: &Tensor,
) -> candle_core::Result<Tensor> {
    let log_ratio = (std_2.log()? - std_1.log()?)?.affine(2.0, 0.0)?;
    let spread = (std_1.sqr()? + (mean_1 - mean_2)?.sqr()?)?.div(&std_2.sqr()?)?;
    (log_ratio + spread)?.affine(0.5, -0.5)?.sum(D::Minus1)
}

/// Gaussian negative log-likelihood of `x`, summed over the last axis.
///
/// `NaN` entries of `x` contribute zero.
pub fn nll_gauss(mean: &Tensor, std: &Tensor, x: &Tensor) -> candle_core::Result<Tensor> {
    let observed = x.eq(x)?;
    let z = (zero_nan(x)? - mean)?.div(std)?;
    let nll = (std.log()? + z.sqr()?.affine(0.5, 0.5 * LN_2PI))?;
    observed.where_cond(&nll, &nll.zeros_like()?)?.sum(D::Minus1)
}

/// Relative weights of the loss terms.
///
/// # Example
///
/// ```
/// use dks_model::loss::LossWeights;
///
/// let weights = LossWeights::default();
/// assert_eq!(weights.kld_mult, 1.0);
/// assert_eq!(weights.rec_mult("audio"), 1.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    /// Multiplier of the KL term (default: 1.0).
    pub kld_mult: f64,

    /// Per-modality reconstruction multipliers; missing entries are 1.0.
    pub rec_mults: BTreeMap<String, f64>,

    /// Divide by the number of valid `(t, b)` steps (default: false).
    pub average: bool,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            kld_mult: 1.0,
            rec_mults: BTreeMap::new(),
            average: false,
        }
    }
}

impl LossWeights {
    /// Reconstruction multiplier of a modality.
    pub fn rec_mult(&self, name: &str) -> f64 {
        self.rec_mults.get(name).copied().unwrap_or(1.0)
    }
}

/// Scalar loss for backpropagation plus its unweighted parts.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Weighted total, a scalar tensor attached to the graph.
    pub total: Tensor,
    /// KL term before `kld_mult`.
    pub kld: f32,
    /// Reconstruction NLL per observed modality, before `rec_mults`.
    pub reconstruction: BTreeMap<String, f32>,
}

impl LossBreakdown {
    /// Value of [`LossBreakdown::total`].
    ///
    /// # Errors
    ///
    /// Returns [`DksError::Internal`] if the tensor cannot be read back.
    pub fn value(&self) -> Result<f32, DksError> {
        self.total.to_scalar::<f32>().map_err(|e| DksError::Internal {
            message: format!("LossBreakdown value: {e}"),
        })
    }
}

/// Negative ELBO of `output` against the observed `batch`.
///
/// Modalities absent from `batch` contribute no reconstruction term.
///
/// # Errors
///
/// Returns [`DksError::Internal`] if a tensor operation fails, e.g. when
/// `batch` and `output` disagree on extents.
pub fn elbo_loss(
    batch: &SequenceBatch,
    output: &DksOutput,
    weights: &LossWeights,
) -> Result<LossBreakdown, DksError> {
    elbo_inner(batch, output, weights).map_err(|e| DksError::Internal {
        message: format!("elbo_loss: {e}"),
    })
}

fn elbo_inner(
    batch: &SequenceBatch,
    output: &DksOutput,
    weights: &LossWeights,
) -> candle_core::Result<LossBreakdown> {
    let device = output.prior.mean.device();
    let mask = batch.mask(output.time_steps(), device)?;
    let norm = if weights.average {
        f64::from(mask.sum_all()?.to_scalar::<f32>()?).max(1.0)
    } else {
        1.0
    };

    let kld = kld_gauss(
        &output.posterior.mean,
        &output.posterior.std,
        &output.prior.mean,
        &output.prior.std,
    )?;
    let kld = (kld * &mask)?.sum_all()?.affine(1.0 / norm, 0.0)?;
    let mut total = kld.affine(weights.kld_mult, 0.0)?;

    let mut reconstruction = BTreeMap::new();
    for (name, x) in batch.iter() {
        let Some(dist) = output.reconstructions.get(name) else {
            continue;
        };
        let x = x.to_device(device)?.to_dtype(DType::F32)?;
        let nll = nll_gauss(&dist.mean, &dist.std, &x)?;
        let nll = (nll * &mask)?.sum_all()?.affine(1.0 / norm, 0.0)?;
        total = (total + nll.affine(weights.rec_mult(name), 0.0)?)?;
        reconstruction.insert(name.to_string(), nll.to_scalar::<f32>()?);
    }

    Ok(LossBreakdown {
        kld: kld.to_scalar::<f32>()?,
        total,
        reconstruction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, (1, values.len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn kld_of_identical_gaussians_is_zero() {
        let m = t(&[0.3, -1.2]);
        let s = t(&[0.5, 2.0]);
        let kld = kld_gauss(&m, &s, &m, &s).unwrap().to_vec1::<f32>().unwrap();
        assert!(kld[0].abs() < 1e-6);
    }

    #[test]
    fn kld_matches_closed_form() {
        // KL(N(1, 1) || N(0, 1)) = 0.5
        let kld = kld_gauss(&t(&[1.0]), &t(&[1.0]), &t(&[0.0]), &t(&[1.0]))
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((kld[0] - 0.5).abs() < 1e-6);

        // KL(N(0, 1) || N(0, 2²)) = ln 2 + 1/8 - 1/2
        let kld = kld_gauss(&t(&[0.0]), &t(&[1.0]), &t(&[0.0]), &t(&[2.0]))
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let expected = std::f32::consts::LN_2 + 0.125 - 0.5;
        assert!((kld[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn nll_of_standard_normal_at_mean() {
        let nll = nll_gauss(&t(&[0.0]), &t(&[1.0]), &t(&[0.0]))
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((nll[0] - 0.5 * LN_2PI as f32).abs() < 1e-6);
    }

    #[test]
    fn nll_skips_nan_targets() {
        let nll = nll_gauss(&t(&[0.0, 0.0]), &t(&[1.0, 1.0]), &t(&[f32::NAN, 0.0]))
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(nll[0].is_finite());
        assert!((nll[0] - 0.5 * LN_2PI as f32).abs() < 1e-6);
    }
}
