//! Diagonal Gaussian parameter pairs.

use candle_core::Tensor;

/// A diagonal Gaussian given by its mean and (positive) standard deviation.
///
/// Used both per time step (`[B, D]`) and stacked over time (`[T, B, D]`).
#[derive(Debug, Clone)]
pub struct Gaussian {
    /// Mean, unconstrained.
    pub mean: Tensor,
    /// Standard deviation, strictly positive.
    pub std: Tensor,
}

impl Gaussian {
    /// Stacks per-step distributions along a new leading time axis.
    pub fn stack(steps: &[Gaussian]) -> candle_core::Result<Self> {
        let means: Vec<&Tensor> = steps.iter().map(|g| &g.mean).collect();
        let stds: Vec<&Tensor> = steps.iter().map(|g| &g.std).collect();
        Ok(Self {
            mean: Tensor::stack(&means, 0)?,
            std: Tensor::stack(&stds, 0)?,
        })
    }

    /// Extents of the mean (and std) tensor.
    pub fn dims(&self) -> &[usize] {
        self.mean.dims()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn stack_adds_time_axis() {
        let step = Gaussian {
            mean: Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
            std: Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap(),
        };
        let seq = Gaussian::stack(&[step.clone(), step.clone(), step]).unwrap();
        assert_eq!(seq.dims(), &[3, 2, 3]);
        assert_eq!(seq.std.dims(), &[3, 2, 3]);
    }
}
