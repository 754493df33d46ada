//! Layer normalization
//!
//! Per-token normalization over the last dimension, used by the pre-norms
//! of the transformer blocks.

use burn::prelude::*;

/// Layer normalization module
///
/// # Formula
///
/// For input x with last dimension of size D:
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
/// ```
///
/// `var` is the population (biased) variance.
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    /// Scale parameter
    pub weight: Tensor<B, 1>,
    /// Shift parameter
    pub bias: Tensor<B, 1>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    /// Creates an identity-initialized layer norm over a last dimension of `size`
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self {
            weight: Tensor::ones([size], device),
            bias: Tensor::zeros([size], device),
            eps: 1e-5,
        }
    }

    /// Creates layer norm from pre-loaded weight and bias
    pub fn from_weight_bias(weight: Tensor<B, 1>, bias: Tensor<B, 1>) -> Self {
        Self {
            weight,
            bias,
            eps: 1e-5,
        }
    }

    /// Normalizes over the last dimension of `x`
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        let var = x.clone().var_bias(last_dim);

        let x_norm = (x - mean) / (var + self.eps).sqrt();

        x_norm * self.weight.clone().unsqueeze() + self.bias.clone().unsqueeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_layer_norm_uses_population_variance() {
        let device = Default::default();
        let norm = LayerNorm::<TestBackend>::new(4, &device);

        let x = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0, 4.0], &device)
            .reshape([1, 1, 4]);
        let out = norm.forward(x).into_data().to_vec::<f32>().unwrap();

        // mean 2.5, population variance 1.25
        let expected = [-1.5, -0.5, 0.5, 1.5].map(|v: f32| v / (1.25f32 + 1e-5).sqrt());
        for (o, e) in out.iter().zip(expected.iter()) {
            assert!((o - e).abs() < 1e-4, "{o} vs {e}");
        }
    }

    #[test]
    fn test_layer_norm_shape() {
        let device = Default::default();
        let norm = LayerNorm::<TestBackend>::new(32, &device);
        let x = Tensor::<TestBackend, 3>::zeros([2, 7, 32], &device);
        assert_eq!(norm.forward(x).dims(), [2, 7, 32]);
    }
}
