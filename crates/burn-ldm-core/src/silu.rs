use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// Swish / SiLU activation: `x * sigmoid(x)`
pub fn silu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * sigmoid(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_silu_values() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0, -1.0], &device);
        let out = silu(x).into_data().to_vec::<f32>().unwrap();

        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 0.731_058_6).abs() < 1e-5);
        assert!((out[2] + 0.268_941_4).abs() < 1e-5);
    }
}
