//! Shared layer primitives for the DKS networks.

use std::sync::Mutex;

use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::gaussian::Gaussian;

/// Lower bound applied after softplus so std outputs stay strictly positive.
pub(crate) const MIN_STD: f64 = 1e-6;

/// Numerically stable `ln(1 + exp(x))`.
pub(crate) fn softplus(x: &Tensor) -> candle_core::Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.relu()? + tail
}

/// Softplus floored at [`MIN_STD`].
pub(crate) fn positive(x: &Tensor) -> candle_core::Result<Tensor> {
    softplus(x)?.maximum(MIN_STD)
}

/// Replaces every `NaN` entry with zero.
pub(crate) fn zero_nan(x: &Tensor) -> candle_core::Result<Tensor> {
    let is_nan = x.ne(x)?;
    is_nan.where_cond(&x.zeros_like()?, x)
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Activation {
    Relu,
    Tanh,
}

/// Linear layer followed by a fixed non-linearity.
#[derive(Debug, Clone)]
pub(crate) struct Dense {
    linear: Linear,
    activation: Activation,
}

impl Dense {
    pub(crate) fn new(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            linear: linear(in_dim, out_dim, vb)?,
            activation,
        })
    }
}

impl Module for Dense {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = self.linear.forward(xs)?;
        match self.activation {
            Activation::Relu => ys.relu(),
            Activation::Tanh => ys.tanh(),
        }
    }
}

/// Pair of linear heads producing a diagonal Gaussian: an unconstrained
/// mean and a softplus std.
#[derive(Debug, Clone)]
pub(crate) struct GaussianHead {
    mean: Linear,
    std: Linear,
}

impl GaussianHead {
    pub(crate) fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            mean: linear(in_dim, out_dim, vb.pp("mean"))?,
            std: linear(in_dim, out_dim, vb.pp("std"))?,
        })
    }

    pub(crate) fn forward(&self, h: &Tensor) -> candle_core::Result<Gaussian> {
        Ok(Gaussian {
            mean: self.mean.forward(h)?,
            std: positive(&self.std.forward(h)?)?,
        })
    }

    pub(crate) fn mean(&self, h: &Tensor) -> candle_core::Result<Tensor> {
        self.mean.forward(h)
    }
}

/// Seeded standard-normal noise for reparameterized sampling.
///
/// Guarded by a mutex so sampling can run through `&self`.
pub(crate) struct NoiseSource {
    rng: Mutex<StdRng>,
}

impl NoiseSource {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub(crate) fn reseed(&self, seed: u64) -> candle_core::Result<()> {
        let mut rng = self.lock()?;
        *rng = StdRng::seed_from_u64(seed);
        Ok(())
    }

    /// Draws `mean + std * eps` with `eps ~ N(0, I)`.
    pub(crate) fn reparameterize(&self, dist: &Gaussian) -> candle_core::Result<Tensor> {
        let eps = self.standard_normal(&dist.mean)?;
        dist.std.mul(&eps)?.add(&dist.mean)
    }

    fn standard_normal(&self, like: &Tensor) -> candle_core::Result<Tensor> {
        let n = like.elem_count();
        let data: Vec<f32> = {
            let mut rng = self.lock()?;
            (0..n).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
        };
        Tensor::from_vec(data, like.dims(), like.device())
    }

    fn lock(&self) -> candle_core::Result<std::sync::MutexGuard<'_, StdRng>> {
        self.rng
            .lock()
            .map_err(|_| candle_core::Error::Msg("noise source lock poisoned".to_string()))
    }
}
