use burn::prelude::*;

/// Scaled dot-product attention over split heads
///
/// `q` is `[batch, heads, q_len, head_dim]`, `k` and `v` are
/// `[batch, heads, kv_len, head_dim]`. Scores are `q · kᵀ * head_dim^-0.5`,
/// softmaxed over the key axis, then applied to `v`.
pub fn scaled_dot_product<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let [_batch, _heads, _q_len, head_dim] = q.dims();
    let scale = (head_dim as f64).powf(-0.5);

    // [batch, heads, q_len, kv_len]
    let scores = q.matmul(k.transpose()) * scale;
    let weights = burn::tensor::activation::softmax(scores, 3);

    weights.matmul(v)
}

/// Splits `[batch, tokens, heads * head_dim]` into `[batch, heads, tokens, head_dim]`
pub fn split_heads<B: Backend>(x: Tensor<B, 3>, num_heads: usize, head_dim: usize) -> Tensor<B, 4> {
    let [batch, tokens, _] = x.dims();
    x.reshape([batch, tokens, num_heads, head_dim]).swap_dims(1, 2)
}

/// Inverse of [`split_heads`]
pub fn merge_heads<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, heads, tokens, head_dim] = x.dims();
    x.swap_dims(1, 2).reshape([batch, tokens, heads * head_dim])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_uniform_scores_average_values() {
        let device = Default::default();
        // Zero queries give equal scores, so every output row is the mean of v
        let q = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 4], &device);
        let k = Tensor::<TestBackend, 4>::ones([1, 1, 3, 4], &device);
        let v = Tensor::<TestBackend, 1>::from_floats(
            [0.0, 0.0, 0.0, 0.0, 3.0, 3.0, 3.0, 3.0, 6.0, 6.0, 6.0, 6.0],
            &device,
        )
        .reshape([1, 1, 3, 4]);

        let out = scaled_dot_product(q, k, v);
        assert_eq!(out.dims(), [1, 1, 2, 4]);
        for value in out.into_data().to_vec::<f32>().unwrap() {
            assert!((value - 3.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_scores_are_scaled_before_softmax() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([2.0, 0.0, 0.0, 2.0], &device).reshape([1, 1, 2, 2]);

        let out = scaled_dot_product(x.clone(), x.clone(), x);
        let values = out.into_data().to_vec::<f32>().unwrap();

        // scores are [[4, 0], [0, 4]] / sqrt(2)
        let p = 1.0 / (1.0 + (-4.0f32 / 2.0f32.sqrt()).exp());
        let expected = [2.0 * p, 2.0 * (1.0 - p), 2.0 * (1.0 - p), 2.0 * p];
        for (value, expected) in values.iter().zip(expected) {
            assert!((value - expected).abs() < 1e-5, "{value} != {expected}");
        }
    }

    #[test]
    fn test_split_merge_heads_inverse() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::random([2, 5, 12], burn::tensor::Distribution::Default, &device);

        let split = split_heads(x.clone(), 3, 4);
        assert_eq!(split.dims(), [2, 3, 5, 4]);

        let merged = merge_heads(split);
        let a = x.into_data().to_vec::<f32>().unwrap();
        let b = merged.into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
