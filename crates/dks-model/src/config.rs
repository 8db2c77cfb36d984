//! Model configuration and compute-device selection.

use candle_core::Device;
use dks_core::{validate_modalities, DksError, ModalitySpec};
use serde::{Deserialize, Serialize};

/// Where model parameters and activations live.
///
/// Resolved once, at model construction. A requested accelerator that is
/// not available (or not compiled in) falls back to the CPU.
///
/// # Example
///
/// ```
/// use dks_model::config::DevicePreference;
///
/// assert!(DevicePreference::Cpu.resolve().is_cpu());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// Always run on the CPU.
    Cpu,
    /// CUDA device with the given ordinal.
    Cuda(usize),
    /// Metal device with the given ordinal.
    Metal(usize),
}

impl Default for DevicePreference {
    fn default() -> Self {
        Self::Cuda(0)
    }
}

impl DevicePreference {
    /// Resolves the preference to a concrete candle device.
    pub fn resolve(self) -> Device {
        let device = match self {
            Self::Cpu => return Device::Cpu,
            Self::Cuda(ordinal) => Device::cuda_if_available(ordinal),
            Self::Metal(ordinal) => Device::new_metal(ordinal),
        };
        match device {
            Ok(device) if !device.is_cpu() => device,
            Ok(_) => {
                tracing::warn!(requested = ?self, "accelerator unavailable, falling back to CPU");
                Device::Cpu
            }
            Err(e) => {
                tracing::warn!(requested = ?self, error = %e, "accelerator init failed, falling back to CPU");
                Device::Cpu
            }
        }
    }
}

/// Construction-time parameters of a [`crate::MultiDks`].
///
/// # Example
///
/// ```
/// use dks_core::ModalitySpec;
/// use dks_model::config::DksConfig;
///
/// let config = DksConfig::new(vec![
///     ModalitySpec::new("spiral-x", 1),
///     ModalitySpec::new("spiral-y", 1),
/// ]);
/// assert_eq!(config.hidden_dim, 32);
/// assert_eq!(config.latent_dim, 32);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DksConfig {
    /// Registered modalities, in concatenation order.
    pub modalities: Vec<ModalitySpec>,

    /// Size of every intermediate layer and of the GRU hidden state (default: 32).
    pub hidden_dim: usize,

    /// Number of latent dimensions (default: 32).
    pub latent_dim: usize,

    /// Mean of the `t = 0` prior, per latent dimension (default: 0.0).
    pub z0_mean: f32,

    /// Standard deviation of the `t = 0` prior (default: 1.0).
    pub z0_std: f32,

    /// Number of stacked GRU layers in the backward pass (default: 1).
    pub num_layers: usize,

    /// Whether the GRU learns bias terms (default: true).
    pub rnn_bias: bool,

    /// Compute device (default: CUDA 0, with CPU fallback).
    pub device: DevicePreference,

    /// Register the `t = 0` prior as trainable parameters (default: false).
    pub learn_initial_prior: bool,

    /// Seed of the Gaussian noise used for reparameterized sampling.
    pub seed: u64,
}

impl Default for DksConfig {
    fn default() -> Self {
        Self {
            modalities: Vec::new(),
            hidden_dim: 32,
            latent_dim: 32,
            z0_mean: 0.0,
            z0_std: 1.0,
            num_layers: 1,
            rnn_bias: true,
            device: DevicePreference::default(),
            learn_initial_prior: false,
            seed: 0,
        }
    }
}

impl DksConfig {
    /// Default configuration for the given modalities.
    pub fn new(modalities: Vec<ModalitySpec>) -> Self {
        Self {
            modalities,
            ..Self::default()
        }
    }

    /// Checks that the configuration describes a buildable model.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::InvalidConfig`] for an invalid modality list, a
    /// zero-sized layer, no GRU layers or a non-positive initial std.
    pub fn validate(&self) -> Result<(), DksError> {
        validate_modalities(&self.modalities)?;
        if self.hidden_dim == 0 || self.latent_dim == 0 {
            return Err(DksError::InvalidConfig {
                message: format!(
                    "hidden_dim ({}) and latent_dim ({}) must be non-zero",
                    self.hidden_dim, self.latent_dim
                ),
            });
        }
        if self.num_layers == 0 {
            return Err(DksError::InvalidConfig {
                message: "num_layers must be at least 1".to_string(),
            });
        }
        if !self.z0_mean.is_finite() {
            return Err(DksError::InvalidConfig {
                message: format!("z0_mean must be finite, got {}", self.z0_mean),
            });
        }
        if !(self.z0_std.is_finite() && self.z0_std > 0.0) {
            return Err(DksError::InvalidConfig {
                message: format!("z0_std must be finite and positive, got {}", self.z0_std),
            });
        }
        Ok(())
    }

    /// Total number of trainable parameters the model will allocate.
    ///
    /// # Example
    ///
    /// ```
    /// use dks_core::ModalitySpec;
    /// use dks_model::config::DksConfig;
    ///
    /// let config = DksConfig {
    ///     hidden_dim: 4,
    ///     latent_dim: 2,
    ///     ..DksConfig::new(vec![ModalitySpec::new("a", 1)])
    /// };
    /// assert_eq!(config.param_count(), 214);
    /// ```
    pub fn param_count(&self) -> usize {
        let h = self.hidden_dim;
        let z = self.latent_dim;
        let dense = |i: usize, o: usize| i * o + o;

        let per_modality: usize = self
            .modalities
            .iter()
            .map(|m| dense(m.dim, h) + dense(z, h) + 2 * dense(h, m.dim))
            .sum();
        let transition = dense(z, h) + 2 * dense(h, z);
        let combiner = dense(z, h) + 2 * dense(h, z);

        let rnn: usize = (0..self.num_layers)
            .map(|layer| {
                let input = if layer == 0 {
                    self.modalities.len() * h
                } else {
                    h
                };
                let bias = if self.rnn_bias { 6 * h } else { 0 };
                3 * h * input + 3 * h * h + bias
            })
            .sum();

        let z0 = if self.learn_initial_prior { 2 * z } else { 0 };
        per_modality + transition + combiner + rnn + z0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mods() -> Vec<ModalitySpec> {
        vec![ModalitySpec::new("a", 1), ModalitySpec::new("b", 1)]
    }

    #[test]
    fn defaults_match_reference_sizes() {
        let config = DksConfig::new(mods());
        assert_eq!(config.hidden_dim, 32);
        assert_eq!(config.latent_dim, 32);
        assert_eq!(config.num_layers, 1);
        assert!(config.rnn_bias);
        assert_eq!(config.z0_mean, 0.0);
        assert_eq!(config.z0_std, 1.0);
        assert_eq!(config.device, DevicePreference::Cuda(0));
    }

    #[test]
    fn invalid_configs_rejected() {
        let base = DksConfig::new(mods());
        assert!(DksConfig { hidden_dim: 0, ..base.clone() }.validate().is_err());
        assert!(DksConfig { latent_dim: 0, ..base.clone() }.validate().is_err());
        assert!(DksConfig { num_layers: 0, ..base.clone() }.validate().is_err());
        assert!(DksConfig { z0_std: 0.0, ..base.clone() }.validate().is_err());
        assert!(DksConfig { z0_std: f32::NAN, ..base.clone() }.validate().is_err());
        assert!(DksConfig { z0_mean: f32::INFINITY, ..base.clone() }.validate().is_err());
        assert!(DksConfig::new(vec![]).validate().is_err());
        assert!(base.validate().is_ok());
    }

    #[test]
    fn param_count_grows_with_layers_and_bias() {
        let one = DksConfig::new(mods());
        let two = DksConfig { num_layers: 2, ..one.clone() };
        let no_bias = DksConfig { rnn_bias: false, ..one.clone() };
        let learned = DksConfig { learn_initial_prior: true, ..one.clone() };
        assert!(two.param_count() > one.param_count());
        assert_eq!(one.param_count() - no_bias.param_count(), 6 * 32);
        assert_eq!(learned.param_count() - one.param_count(), 2 * 32);
    }

    #[test]
    fn cpu_preference_resolves_to_cpu() {
        assert!(DevicePreference::Cpu.resolve().is_cpu());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn cuda_falls_back_to_cpu_without_feature() {
        assert!(DevicePreference::Cuda(0).resolve().is_cpu());
        assert!(DevicePreference::default().resolve().is_cpu());
    }

    #[cfg(not(feature = "metal"))]
    #[test]
    fn metal_falls_back_to_cpu_without_feature() {
        assert!(DevicePreference::Metal(0).resolve().is_cpu());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{"modalities":[{"name":"a","dim":3}],"latent_dim":8,"device":"cpu"}"#;
        let config: DksConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.latent_dim, 8);
        assert_eq!(config.hidden_dim, 32);
        assert_eq!(config.device, DevicePreference::Cpu);

        let json = r#"{"device":{"cuda":1}}"#;
        let config: DksConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device, DevicePreference::Cuda(1));
    }
}
