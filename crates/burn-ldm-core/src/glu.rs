//! GEGLU gated projection
//!
//! The feed-forward gate of the U-Net transformer blocks. The input is
//! projected to twice the output width and split in half; the second half
//! gates the first through the tanh approximation of GELU.
//!
//! The constants are part of the pretrained model's behavior and must stay
//! exactly as written.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// `sqrt(2 / pi)` rounded the way the pretrained checkpoints were computed
pub const GELU_TANH_COEFF: f64 = 0.797_884_560_8;
/// Cubic coefficient of the tanh GELU approximation
pub const GELU_CUBIC_COEFF: f64 = 0.044715;

/// GEGLU projection
///
/// # Architecture
///
/// ```text
/// h            = proj(x)                      // width 2 * output_dim
/// linear, gate = h[.., :output_dim], h[.., output_dim:]
/// out          = linear * 0.5 * gate * (1 + tanh(0.7978845608 * gate * (1 + 0.044715 * gate^2)))
/// ```
#[derive(Module, Debug)]
pub struct Geglu<B: Backend> {
    /// Projection to `2 * output_dim`
    pub proj: Linear<B>,
    /// Width of each half
    pub output_dim: usize,
}

/// Configuration for [`Geglu`]
#[derive(Debug, Clone)]
pub struct GegluConfig {
    /// Input width
    pub input_dim: usize,
    /// Output width (half the projection width)
    pub output_dim: usize,
}

impl GegluConfig {
    /// Creates a new config
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
        }
    }

    /// Initializes the Geglu module
    pub fn init<B: Backend>(&self, device: &B::Device) -> Geglu<B> {
        Geglu {
            proj: LinearConfig::new(self.input_dim, self.output_dim * 2).init(device),
            output_dim: self.output_dim,
        }
    }
}

impl<B: Backend> Geglu<B> {
    /// Applies the projection and gate
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor whose last dimension is `input_dim`
    ///
    /// # Returns
    ///
    /// Tensor whose last dimension is `output_dim`
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let hidden = self.proj.forward(x);
        let (linear, gate) = split_last_dim(hidden, self.output_dim);
        tanh_gelu_gate(linear, gate)
    }
}

/// Gates `linear` by the tanh-approximated GELU of `gate`
///
/// Both tensors must have the same shape.
pub fn tanh_gelu_gate<B: Backend, const D: usize>(
    linear: Tensor<B, D>,
    gate: Tensor<B, D>,
) -> Tensor<B, D> {
    let inner = gate.clone() * GELU_TANH_COEFF * ((gate.clone() * gate.clone()) * GELU_CUBIC_COEFF + 1.0);
    let tanh_res = inner.tanh();
    linear * 0.5 * gate * (tanh_res + 1.0)
}

/// Splits a tensor along its last dimension at `split_at`
fn split_last_dim<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    split_at: usize,
) -> (Tensor<B, D>, Tensor<B, D>) {
    let last_dim = x.dims()[D - 1];

    let first = x.clone().narrow(D - 1, 0, split_at);
    let second = x.narrow(D - 1, split_at, last_dim - split_at);

    (first, second)
}
