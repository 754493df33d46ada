//! Group normalization
//!
//! Channels are split into groups and each group is normalized over its
//! channels and spatial positions. Every normalization in the U-Net's
//! convolutional path uses 32 groups and eps 1e-5.

use burn::prelude::*;
use burn::tensor::DType;

/// Default group count used throughout the denoising network
pub const DEFAULT_GROUPS: usize = 32;

/// Group normalization over `[batch, channels, height, width]` tensors
///
/// # Formula
///
/// ```text
/// y = (x - mean(x_group)) / sqrt(var(x_group) + eps) * weight + bias
/// ```
///
/// Statistics use the biased variance and are accumulated in f32 even when
/// the backend runs in half precision.
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    /// Number of channel groups
    pub num_groups: usize,
    /// Per-channel scale (gamma)
    pub weight: Tensor<B, 1>,
    /// Per-channel shift (beta)
    pub bias: Tensor<B, 1>,
    /// Added to the variance before the square root
    pub eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    /// Creates an identity-initialized group norm
    ///
    /// # Arguments
    ///
    /// * `num_groups` - Number of groups (must divide `num_channels`)
    /// * `num_channels` - Channel count of the normalized input
    /// * `device` - Device to create tensors on
    pub fn new(num_groups: usize, num_channels: usize, device: &B::Device) -> Self {
        Self {
            num_groups,
            weight: Tensor::ones([num_channels], device),
            bias: Tensor::zeros([num_channels], device),
            eps: 1e-5,
        }
    }

    /// Creates a group norm from pre-loaded affine parameters
    pub fn from_weight_bias(num_groups: usize, weight: Tensor<B, 1>, bias: Tensor<B, 1>) -> Self {
        Self {
            num_groups,
            weight,
            bias,
            eps: 1e-5,
        }
    }

    /// Number of channels this norm was built for
    pub fn num_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Normalizes a `[batch, channels, height, width]` tensor
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let group_size = channels / self.num_groups;

        let dtype = x.dtype();
        let grouped = x
            .reshape([batch, self.num_groups, group_size * height * width])
            .cast(DType::F32);

        let mean = grouped.clone().mean_dim(2);
        let centered = grouped - mean;
        let var = (centered.clone() * centered.clone()).mean_dim(2);
        let normed = centered / (var + self.eps).sqrt();

        let normed = normed.cast(dtype).reshape([batch, channels, height, width]);

        let weight = self.weight.clone().reshape([1, channels, 1, 1]);
        let bias = self.bias.clone().reshape([1, channels, 1, 1]);

        normed * weight + bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_group_norm_shape() {
        let device = Default::default();
        let norm = GroupNorm::<TestBackend>::new(32, 64, &device);

        let x = Tensor::random([2, 64, 4, 4], burn::tensor::Distribution::Default, &device);
        let y = norm.forward(x);

        assert_eq!(y.dims(), [2, 64, 4, 4]);
        assert_eq!(norm.num_channels(), 64);
    }

    #[test]
    fn test_group_norm_zero_mean_unit_variance() {
        let device = Default::default();
        let norm = GroupNorm::<TestBackend>::new(2, 4, &device);

        let values: Vec<f32> = (0..32).map(|i| i as f32 * 0.5 - 3.0).collect();
        let x = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([1, 4, 2, 4]);
        let y = norm.forward(x);

        let out = y.into_data().to_vec::<f32>().unwrap();
        // Each group spans 2 channels * 8 positions = 16 values
        for group in out.chunks(16) {
            let mean: f32 = group.iter().sum::<f32>() / 16.0;
            let var: f32 = group.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 16.0;
            assert!(mean.abs() < 1e-4, "mean {mean}");
            assert!((var - 1.0).abs() < 1e-3, "var {var}");
        }
    }

    #[test]
    fn test_group_norm_affine() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 1>::from_floats([2.0, 2.0], &device);
        let bias = Tensor::<TestBackend, 1>::from_floats([1.0, 1.0], &device);
        let norm = GroupNorm::from_weight_bias(1, weight, bias);

        let x = Tensor::<TestBackend, 1>::from_floats([-1.0, 1.0, -1.0, 1.0], &device)
            .reshape([1, 2, 1, 2]);
        let out = norm.forward(x).into_data().to_vec::<f32>().unwrap();

        // normalized values are +-1 (up to eps), scaled by 2 and shifted by 1
        assert!((out[0] + 1.0).abs() < 1e-3);
        assert!((out[1] - 3.0).abs() < 1e-3);
    }
}
