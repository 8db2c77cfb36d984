//! Noisy 2-D spirals split into two 1-D modalities.
//!
//! Each sequence traces an Archimedean spiral
//!
//! ```text
//! θ_t = t · angle_step
//! x_t = scale · θ_t · cos(θ_t + phase) + ε      (modality "spiral-x")
//! y_t = scale · θ_t · sin(θ_t + phase) + ε      (modality "spiral-y")
//! ```
//!
//! with per-sequence `scale`, `phase` and winding direction, and Gaussian
//! observation noise `ε`. Observing only one coordinate leaves the other
//! recoverable through the shared latent trajectory.

use std::f64::consts::TAU;

use dks_core::{DksError, ModalitySpec, Sequence};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::corruption::Corruption;
use crate::dataset::MultiseqDataset;

/// Name of the horizontal coordinate modality.
pub const SPIRAL_X: &str = "spiral-x";
/// Name of the vertical coordinate modality.
pub const SPIRAL_Y: &str = "spiral-y";

/// The two spiral modalities, one dimension each.
pub fn modalities() -> Vec<ModalitySpec> {
    vec![ModalitySpec::new(SPIRAL_X, 1), ModalitySpec::new(SPIRAL_Y, 1)]
}

/// Configuration for [`generate`].
///
/// # Example
///
/// ```
/// use dks_data::spirals::SpiralsConfig;
///
/// let config: SpiralsConfig = serde_json::from_str(r#"{"num_sequences": 8}"#).unwrap();
/// assert_eq!(config.num_sequences, 8);
/// assert_eq!(config.min_len, SpiralsConfig::default().min_len);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiralsConfig {
    /// Number of sequences (default: 100).
    pub num_sequences: usize,

    /// Shortest sequence length, inclusive (default: 60).
    pub min_len: usize,

    /// Longest sequence length, inclusive (default: 100).
    pub max_len: usize,

    /// Angle advanced per time step, in radians (default: 0.1).
    pub angle_step: f64,

    /// Range `[lo, hi)` of the per-sequence radial scale
    /// (default: `[0.05, 0.15)`).
    pub scale_range: (f64, f64),

    /// Standard deviation of the observation noise (default: 0.02).
    pub noise_std: f64,

    /// Deletion applied after generation (default: none).
    pub corruption: Corruption,

    /// Seed for the generator.
    pub seed: u64,
}

impl Default for SpiralsConfig {
    fn default() -> Self {
        Self {
            num_sequences: 100,
            min_len: 60,
            max_len: 100,
            angle_step: 0.1,
            scale_range: (0.05, 0.15),
            noise_std: 0.02,
            corruption: Corruption::None,
            seed: 0,
        }
    }
}

impl SpiralsConfig {
    /// Checks sizes and ranges.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::InvalidConfig`] naming the first bad field, and
    /// the error of [`Corruption::validate`].
    pub fn validate(&self) -> Result<(), DksError> {
        let invalid = |message: String| Err(DksError::InvalidConfig { message });
        if self.num_sequences == 0 {
            return invalid("num_sequences must be positive".to_string());
        }
        if self.min_len == 0 || self.min_len > self.max_len {
            return invalid(format!(
                "need 1 <= min_len <= max_len, got {}..={}",
                self.min_len, self.max_len
            ));
        }
        if !self.angle_step.is_finite() || self.angle_step <= 0.0 {
            return invalid(format!("angle_step must be positive, got {}", self.angle_step));
        }
        let (lo, hi) = self.scale_range;
        if !(lo.is_finite() && hi.is_finite() && 0.0 < lo && lo < hi) {
            return invalid(format!("scale_range must satisfy 0 < lo < hi, got ({lo}, {hi})"));
        }
        if !self.noise_std.is_finite() || self.noise_std < 0.0 {
            return invalid(format!("noise_std must be non-negative, got {}", self.noise_std));
        }
        self.corruption.validate(&modalities())
    }
}

/// Generates a spirals dataset.
///
/// The same config always yields the same data.
///
/// # Errors
///
/// Returns the error of [`SpiralsConfig::validate`].
///
/// # Example
///
/// ```
/// use dks_data::spirals::{generate, SpiralsConfig};
///
/// let config = SpiralsConfig { num_sequences: 4, min_len: 5, max_len: 5, ..Default::default() };
/// let dataset = generate(&config).unwrap();
/// assert_eq!(dataset.len(), 4);
/// assert_eq!(dataset.get(0).unwrap().len(), 5);
/// ```
pub fn generate(config: &SpiralsConfig) -> Result<MultiseqDataset, DksError> {
    config.validate()?;
    let specs = modalities();
    let noise = Normal::new(0.0, config.noise_std).map_err(|e| DksError::InvalidConfig {
        message: format!("noise_std: {e}"),
    })?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (scale_lo, scale_hi) = config.scale_range;

    let mut sequences = Vec::with_capacity(config.num_sequences);
    for _ in 0..config.num_sequences {
        let len = rng.gen_range(config.min_len..=config.max_len);
        let scale = rng.gen_range(scale_lo..scale_hi);
        let phase = rng.gen_range(0.0..TAU);
        let direction = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };

        let mut xs = Vec::with_capacity(len);
        let mut ys = Vec::with_capacity(len);
        for t in 0..len {
            let theta = t as f64 * config.angle_step;
            let r = scale * theta;
            let angle = direction * theta + phase;
            xs.push((r * angle.cos() + noise.sample(&mut rng)) as f32);
            ys.push((r * angle.sin() + noise.sample(&mut rng)) as f32);
        }

        let mut seq = Sequence::new(len);
        seq.insert(&specs[0], xs)?;
        seq.insert(&specs[1], ys)?;
        sequences.push(seq);
    }

    let mut dataset = MultiseqDataset::new(specs, sequences)?;
    let deleted = dataset.corrupt(&config.corruption, config.seed.wrapping_add(1))?;
    tracing::debug!(
        sequences = dataset.len(),
        deleted,
        corruption = ?config.corruption,
        "generated spirals"
    );
    Ok(dataset)
}
