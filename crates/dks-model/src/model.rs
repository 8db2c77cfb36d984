//! The multimodal Deep Kalman Smoother.
//!
//! A recurrent state-space model over multimodal, variable-length sequences
//! with missing data:
//!
//! ```text
//! x_t ──phi_m──▶ e_t = [e_t^a ‖ e_t^b ‖ …]
//! e_{T..1} ──GRU (reverse time)──▶ h_t
//! z_{t-1} ──transition──▶ p(z_t | z_{t-1})                      prior
//! ½·(tanh(W z_{t-1}) + h_t) ──heads──▶ q(z_t | z_{t-1}, x_{t..T})  posterior
//! z_t ──dec_m──▶ p(x_t^m | z_t)                                  reconstruction
//! ```
//!
//! Missing modalities are zero-masked before encoding. Outputs are computed
//! for every step up to the batch's time extent; steps past a sequence's
//! length are left for the caller to mask (see [`crate::loss`]).

use std::collections::BTreeMap;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::rnn::{gru, GRUConfig, GRUState, GRU, RNN};
use candle_nn::{Init, VarBuilder, VarMap};
use dks_core::{DksError, ModalitySpec};

use crate::batch::{length_mask, SequenceBatch};
use crate::config::DksConfig;
use crate::gaussian::Gaussian;
use crate::nn::{zero_nan, Activation, Dense, GaussianHead, NoiseSource};

/// Result of [`MultiDks::forward`]. All tensors are time-major.
#[derive(Debug, Clone)]
pub struct DksOutput {
    /// Inferred `q(z_t | z_{t-1}, x_{t..T})`, each `[T, B, latent_dim]`.
    pub posterior: Gaussian,
    /// Prior `p(z_t | z_{t-1})`, each `[T, B, latent_dim]`.
    pub prior: Gaussian,
    /// Per-modality `p(x_t | z_t)`, each `[T, B, dim]`.
    pub reconstructions: BTreeMap<String, Gaussian>,
}

impl DksOutput {
    /// Number of time steps in every output sequence.
    pub fn time_steps(&self) -> usize {
        self.prior.dims().first().copied().unwrap_or(0)
    }
}

/// Encoder, decoder and reconstruction heads of one modality.
struct ModalityNet {
    spec: ModalitySpec,
    encoder: Dense,
    decoder: Dense,
    head: GaussianHead,
}

enum InitialPrior {
    Fixed { mean: Tensor, std: Tensor },
    Learned { mean: Tensor, log_std: Tensor },
}

impl InitialPrior {
    /// `(mean, std)` broadcast to `[batch, latent_dim]`.
    fn for_batch(&self, batch: usize) -> candle_core::Result<Gaussian> {
        let (mean, std) = match self {
            Self::Fixed { mean, std } => (mean.clone(), std.clone()),
            Self::Learned { mean, log_std } => (mean.clone(), log_std.exp()?),
        };
        Ok(Gaussian {
            mean: mean.repeat((batch, 1))?,
            std: std.repeat((batch, 1))?,
        })
    }
}

/// Multimodal Deep Kalman Smoother.
///
/// Parameters live in the [`VarMap`] passed to [`MultiDks::new`]; the model
/// itself keeps no state between calls besides its noise generator.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Tensor};
/// use candle_nn::VarMap;
/// use dks_core::ModalitySpec;
/// use dks_model::config::{DevicePreference, DksConfig};
/// use dks_model::{MultiDks, SequenceBatch};
///
/// let config = DksConfig {
///     device: DevicePreference::Cpu,
///     ..DksConfig::new(vec![ModalitySpec::new("a", 1), ModalitySpec::new("b", 1)])
/// };
/// let var_map = VarMap::new();
/// let model = MultiDks::new(&var_map, &config).unwrap();
///
/// let zeros = Tensor::zeros((3, 2, 1), DType::F32, model.device()).unwrap();
/// let batch = SequenceBatch::new(vec![3, 3])
///     .with_modality("a", zeros.clone())
///     .with_modality("b", zeros);
/// let out = model.forward(&batch, false).unwrap();
/// assert_eq!(out.reconstructions["a"].mean.dims(), &[3, 2, 1]);
/// ```
pub struct MultiDks {
    config: DksConfig,
    device: Device,
    modalities: Vec<ModalityNet>,
    transition: Dense,
    transition_head: GaussianHead,
    rnn: Vec<GRU>,
    combiner: Dense,
    combiner_head: GaussianHead,
    initial_prior: InitialPrior,
    noise: NoiseSource,
}

impl std::fmt::Debug for MultiDks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mods: Vec<String> = self
            .modalities
            .iter()
            .map(|m| format!("{}:{}", m.spec.name, m.spec.dim))
            .collect();
        write!(
            f,
            "MultiDks([{}], h={}, z={}, layers={}, device={:?})",
            mods.join(", "),
            self.config.hidden_dim,
            self.config.latent_dim,
            self.config.num_layers,
            self.device
        )
    }
}

impl MultiDks {
    /// Allocates every network of the model in `var_map`.
    ///
    /// The device is resolved once from `config.device`.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::InvalidConfig`] if `config` fails validation and
    /// [`DksError::Internal`] if parameter allocation fails.
    pub fn new(var_map: &VarMap, config: &DksConfig) -> Result<Self, DksError> {
        config.validate()?;
        let map_err = |e: candle_core::Error| DksError::Internal {
            message: format!("MultiDks new: {e}"),
        };

        let device = config.device.resolve();
        let vb = VarBuilder::from_varmap(var_map, DType::F32, &device);
        let h = config.hidden_dim;
        let z = config.latent_dim;

        let mut modalities = Vec::with_capacity(config.modalities.len());
        for spec in &config.modalities {
            let name = &spec.name;
            let net = ModalityNet {
                encoder: Dense::new(spec.dim, h, Activation::Relu, vb.pp(format!("phi.{name}")))
                    .map_err(map_err)?,
                decoder: Dense::new(z, h, Activation::Relu, vb.pp(format!("dec.{name}")))
                    .map_err(map_err)?,
                head: GaussianHead::new(h, spec.dim, vb.pp(format!("dec_head.{name}")))
                    .map_err(map_err)?,
                spec: spec.clone(),
            };
            modalities.push(net);
        }

        let transition = Dense::new(z, h, Activation::Relu, vb.pp("fwd")).map_err(map_err)?;
        let transition_head = GaussianHead::new(h, z, vb.pp("fwd_head")).map_err(map_err)?;

        let gru_config = || {
            if config.rnn_bias {
                GRUConfig::default()
            } else {
                GRUConfig::default_no_bias()
            }
        };
        let mut rnn = Vec::with_capacity(config.num_layers);
        for layer in 0..config.num_layers {
            let in_dim = if layer == 0 {
                config.modalities.len() * h
            } else {
                h
            };
            rnn.push(
                gru(in_dim, h, gru_config(), vb.pp(format!("rnn.l{layer}"))).map_err(map_err)?,
            );
        }

        let combiner = Dense::new(z, h, Activation::Tanh, vb.pp("z_to_comb")).map_err(map_err)?;
        let combiner_head = GaussianHead::new(h, z, vb.pp("comb_head")).map_err(map_err)?;

        let initial_prior = if config.learn_initial_prior {
            let vb = vb.pp("z0");
            InitialPrior::Learned {
                mean: vb
                    .get_with_hints((1, z), "mean", Init::Const(f64::from(config.z0_mean)))
                    .map_err(map_err)?,
                log_std: vb
                    .get_with_hints((1, z), "log_std", Init::Const(f64::from(config.z0_std.ln())))
                    .map_err(map_err)?,
            }
        } else {
            InitialPrior::Fixed {
                mean: Tensor::full(config.z0_mean, (1, z), &device).map_err(map_err)?,
                std: Tensor::full(config.z0_std, (1, z), &device).map_err(map_err)?,
            }
        };

        tracing::debug!(
            modalities = config.modalities.len(),
            hidden_dim = h,
            latent_dim = z,
            params = config.param_count(),
            device = ?device,
            "built MultiDks"
        );

        Ok(Self {
            config: config.clone(),
            device,
            modalities,
            transition,
            transition_head,
            rnn,
            combiner,
            combiner_head,
            initial_prior,
            noise: NoiseSource::new(config.seed),
        })
    }

    /// Device holding the parameters.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Configuration the model was built with.
    pub fn config(&self) -> &DksConfig {
        &self.config
    }

    /// Registered modalities, in concatenation order.
    pub fn modalities(&self) -> impl Iterator<Item = &ModalitySpec> {
        self.modalities.iter().map(|m| &m.spec)
    }

    /// Restarts the sampling noise from `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::Internal`] if the noise generator lock is poisoned.
    pub fn reseed(&self, seed: u64) -> Result<(), DksError> {
        self.noise.reseed(seed).map_err(|e| DksError::Internal {
            message: format!("MultiDks reseed: {e}"),
        })
    }

    /// Infers latent states for a batch and reconstructs every modality.
    ///
    /// With `sample = true` each `z_t` is a reparameterized draw from the
    /// posterior; otherwise it is the posterior mean, and the call is
    /// deterministic.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::InvalidLengths`] for empty, zero or too-long
    /// lengths, [`DksError::ShapeMismatch`] for a modality tensor whose
    /// extents differ from `[T, B, dim]`, and [`DksError::Internal`] if a
    /// tensor operation fails.
    pub fn forward(&self, batch: &SequenceBatch, sample: bool) -> Result<DksOutput, DksError> {
        let time_steps = self.check_batch(batch)?;
        let map_err = |e: candle_core::Error| DksError::Internal {
            message: format!("MultiDks forward: {e}"),
        };

        let features = self.encode(batch, time_steps).map_err(map_err)?;
        let summary = self
            .backward_summary(&features, batch.lengths())
            .map_err(map_err)?;
        self.smooth(&summary, sample).map_err(map_err)
    }

    /// Generates sequences from the prior alone, with no observed data.
    ///
    /// Returns the per-modality reconstruction means, each
    /// `[seq_len, batch_size, dim]`.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::InvalidLengths`] if either size is zero and
    /// [`DksError::Internal`] if a tensor operation fails.
    pub fn sample(
        &self,
        batch_size: usize,
        seq_len: usize,
    ) -> Result<BTreeMap<String, Tensor>, DksError> {
        if batch_size == 0 || seq_len == 0 {
            return Err(DksError::InvalidLengths {
                message: format!(
                    "sample needs non-zero sizes, got batch_size={batch_size}, seq_len={seq_len}"
                ),
            });
        }
        self.generate(batch_size, seq_len)
            .map_err(|e| DksError::Internal {
                message: format!("MultiDks sample: {e}"),
            })
    }

    /// Validates lengths and modality shapes; returns the time extent `T`.
    fn check_batch(&self, batch: &SequenceBatch) -> Result<usize, DksError> {
        let lengths = batch.lengths();
        if lengths.is_empty() {
            return Err(DksError::InvalidLengths {
                message: "batch has no sequences".to_string(),
            });
        }
        let b = lengths.len();

        let mut time_steps = None;
        for net in &self.modalities {
            let Some(data) = batch.get(&net.spec.name) else {
                continue;
            };
            let t = match data.dims() {
                [t, _, _] => *t,
                _ => 0,
            };
            let t = *time_steps.get_or_insert(t);
            let expected = [t, b, net.spec.dim];
            if data.dims() != expected {
                return Err(DksError::ShapeMismatch {
                    modality: net.spec.name.clone(),
                    expected: expected.to_vec(),
                    actual: data.dims().to_vec(),
                });
            }
        }
        for (name, _) in batch.iter() {
            if !self.modalities.iter().any(|m| m.spec.name == name) {
                tracing::debug!(modality = name, "ignoring unregistered modality");
            }
        }

        let time_steps = time_steps.unwrap_or_else(|| batch.max_len());
        if let Some((i, &len)) = lengths
            .iter()
            .enumerate()
            .find(|(_, &len)| len == 0 || len > time_steps)
        {
            return Err(DksError::InvalidLengths {
                message: format!("sequence {i} has length {len}, expected 1..={time_steps}"),
            });
        }
        Ok(time_steps)
    }

    /// Zero-masks and encodes every modality, concatenating the embeddings
    /// into `[T, B, num_modalities * hidden_dim]`.
    fn encode(&self, batch: &SequenceBatch, time_steps: usize) -> candle_core::Result<Tensor> {
        let b = batch.batch_size();
        let h = self.config.hidden_dim;
        let mut phi = Vec::with_capacity(self.modalities.len());
        for net in &self.modalities {
            let dim = net.spec.dim;
            let input = match batch.get(&net.spec.name) {
                Some(data) => zero_nan(&data.to_device(&self.device)?.to_dtype(DType::F32)?)?,
                None => Tensor::zeros((time_steps, b, dim), DType::F32, &self.device)?,
            };
            let flat = input.reshape((time_steps * b, dim))?;
            phi.push(net.encoder.forward(&flat)?.reshape((time_steps, b, h))?);
        }
        Tensor::cat(&phi, 2)
    }

    /// Runs the GRU stack over each sequence in reverse order.
    ///
    /// A sequence's state only advances on its own valid steps, so its
    /// scan starts at `lengths[b] - 1`. Positions past a length are zero.
    fn backward_summary(&self, features: &Tensor, lengths: &[usize]) -> candle_core::Result<Tensor> {
        let (time_steps, b, _) = features.dims3()?;
        let valid = length_mask(lengths, time_steps, &self.device)?.unsqueeze(2)?;

        let mut states = self
            .rnn
            .iter()
            .map(|layer| layer.zero_state(b))
            .collect::<candle_core::Result<Vec<GRUState>>>()?;
        let mut summary = vec![None; time_steps];

        for t in (0..time_steps).rev() {
            let keep_new = valid.get(t)?;
            let keep_old = keep_new.affine(-1.0, 1.0)?;
            let mut input = features.get(t)?;
            for (layer, state) in self.rnn.iter().zip(states.iter_mut()) {
                let next = layer.step(&input, state)?;
                let h = (next.h.broadcast_mul(&keep_new)? + state.h.broadcast_mul(&keep_old)?)?;
                *state = GRUState { h: h.clone() };
                input = h;
            }
            summary[t] = Some(input.broadcast_mul(&keep_new)?);
        }

        let summary: Vec<Tensor> = summary.into_iter().flatten().collect();
        Tensor::stack(&summary, 0)
    }

    /// Prior `p(z_t | z_{t-1})` for `t > 0`.
    fn transition(&self, z_prev: &Tensor) -> candle_core::Result<Gaussian> {
        self.transition_head.forward(&self.transition.forward(z_prev)?)
    }

    /// The forward filtering/smoothing recursion, carrying `z_t` from step
    /// to step.
    fn smooth(&self, summary: &Tensor, sample: bool) -> candle_core::Result<DksOutput> {
        let (time_steps, b, _) = summary.dims3()?;
        let z0 = self.initial_prior.for_batch(b)?;

        let mut priors = Vec::with_capacity(time_steps);
        let mut posteriors = Vec::with_capacity(time_steps);
        let mut recons: Vec<Vec<Gaussian>> = self
            .modalities
            .iter()
            .map(|_| Vec::with_capacity(time_steps))
            .collect();

        let mut z_t = z0.mean.clone();
        for t in 0..time_steps {
            let prior = if t == 0 {
                z0.clone()
            } else {
                self.transition(&z_t)?
            };

            let h_comb = (self.combiner.forward(&z_t)? + summary.get(t)?)?.affine(0.5, 0.0)?;
            let posterior = self.combiner_head.forward(&h_comb)?;

            z_t = if sample {
                self.noise.reparameterize(&posterior)?
            } else {
                posterior.mean.clone()
            };

            for (net, out) in self.modalities.iter().zip(recons.iter_mut()) {
                out.push(net.head.forward(&net.decoder.forward(&z_t)?)?);
            }
            priors.push(prior);
            posteriors.push(posterior);
        }

        let mut reconstructions = BTreeMap::new();
        for (net, steps) in self.modalities.iter().zip(recons) {
            reconstructions.insert(net.spec.name.clone(), Gaussian::stack(&steps)?);
        }

        Ok(DksOutput {
            posterior: Gaussian::stack(&posteriors)?,
            prior: Gaussian::stack(&priors)?,
            reconstructions,
        })
    }

    fn generate(
        &self,
        batch_size: usize,
        seq_len: usize,
    ) -> candle_core::Result<BTreeMap<String, Tensor>> {
        let z0 = self.initial_prior.for_batch(batch_size)?;
        let mut means: Vec<Vec<Tensor>> = self
            .modalities
            .iter()
            .map(|_| Vec::with_capacity(seq_len))
            .collect();

        let mut z_t: Option<Tensor> = None;
        for _ in 0..seq_len {
            let prior = match &z_t {
                None => z0.clone(),
                Some(z_prev) => self.transition(z_prev)?,
            };
            let z = self.noise.reparameterize(&prior)?;
            for (net, out) in self.modalities.iter().zip(means.iter_mut()) {
                out.push(net.head.mean(&net.decoder.forward(&z)?)?);
            }
            z_t = Some(z);
        }

        let mut out = BTreeMap::new();
        for (net, steps) in self.modalities.iter().zip(means) {
            out.insert(net.spec.name.clone(), Tensor::stack(&steps, 0)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevicePreference;

    fn small_config() -> DksConfig {
        DksConfig {
            hidden_dim: 8,
            latent_dim: 4,
            device: DevicePreference::Cpu,
            seed: 3,
            ..DksConfig::new(vec![ModalitySpec::new("a", 2), ModalitySpec::new("b", 3)])
        }
    }

    fn ramp(t: usize, b: usize, d: usize) -> Tensor {
        let data: Vec<f32> = (0..t * b * d).map(|i| (i as f32 * 0.37).sin()).collect();
        Tensor::from_vec(data, (t, b, d), &Device::Cpu).unwrap()
    }

    #[test]
    fn debug_format_readable() {
        let var_map = VarMap::new();
        let model = MultiDks::new(&var_map, &small_config()).unwrap();
        let debug = format!("{model:?}");
        assert!(debug.contains("MultiDks([a:2, b:3], h=8, z=4"));
    }

    #[test]
    fn var_map_holds_every_parameter() {
        let var_map = VarMap::new();
        let config = small_config();
        let _model = MultiDks::new(&var_map, &config).unwrap();
        let total: usize = var_map.all_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(total, config.param_count());
    }

    #[test]
    fn learned_initial_prior_starts_at_configured_values() {
        let var_map = VarMap::new();
        let config = DksConfig {
            learn_initial_prior: true,
            z0_mean: 0.25,
            z0_std: 2.0,
            ..small_config()
        };
        let model = MultiDks::new(&var_map, &config).unwrap();
        let z0 = model.initial_prior.for_batch(3).unwrap();
        for row in z0.mean.to_vec2::<f32>().unwrap() {
            assert!(row.iter().all(|&m| (m - 0.25).abs() < 1e-6));
        }
        for row in z0.std.to_vec2::<f32>().unwrap() {
            assert!(row.iter().all(|&s| (s - 2.0).abs() < 1e-5));
        }
        let total: usize = var_map.all_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(total, config.param_count());
    }

    #[test]
    fn backward_summary_ignores_padding() {
        let var_map = VarMap::new();
        let model = MultiDks::new(&var_map, &small_config()).unwrap();
        let h = model.config.hidden_dim * 2;

        // Sequence 0 has 2 valid steps; its padding differs between the two runs.
        let clean = ramp(4, 2, h);
        let mut noisy = clean.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for t in 2..4 {
            let start = (t * 2) * h;
            noisy[start..start + h].fill(9.0);
        }
        let noisy = Tensor::from_vec(noisy, (4, 2, h), &Device::Cpu).unwrap();

        let a = model.backward_summary(&clean, &[2, 4]).unwrap();
        let b = model.backward_summary(&noisy, &[2, 4]).unwrap();
        let a = a.to_vec3::<f32>().unwrap();
        let b = b.to_vec3::<f32>().unwrap();
        for t in 0..2 {
            assert_eq!(a[t][0], b[t][0], "valid step {t} changed with padding");
        }
        for t in 2..4 {
            assert!(a[t][0].iter().all(|&x| x == 0.0));
        }
    }

    #[test]
    fn backward_summary_matches_trimmed_sequence() {
        let var_map = VarMap::new();
        let model = MultiDks::new(&var_map, &small_config()).unwrap();
        let h = model.config.hidden_dim * 2;

        let full = ramp(5, 1, h);
        let trimmed = full.narrow(0, 0, 3).unwrap();
        let a = model.backward_summary(&full, &[3]).unwrap();
        let b = model.backward_summary(&trimmed, &[3]).unwrap();
        let a = a.narrow(0, 0, 3).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn sampled_forward_is_reproducible_after_reseed() {
        let var_map = VarMap::new();
        let model = MultiDks::new(&var_map, &small_config()).unwrap();
        let batch = SequenceBatch::new(vec![3, 2]).with_modality("a", ramp(3, 2, 2));

        model.reseed(11).unwrap();
        let first = model.forward(&batch, true).unwrap();
        model.reseed(11).unwrap();
        let second = model.forward(&batch, true).unwrap();
        let a = first.posterior.mean.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = second.posterior.mean.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
