//! U-Net building blocks: timestep projection, residual blocks, attention
//! blocks, down/up sampling

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;

use burn_ldm_core::attention::{merge_heads, scaled_dot_product, split_heads};
use burn_ldm_core::glu::{Geglu, GegluConfig};
use burn_ldm_core::groupnorm::GroupNorm;
use burn_ldm_core::layernorm::LayerNorm;
use burn_ldm_core::silu::silu;

/// Sinusoidal encoding of diffusion timesteps
///
/// Produces the raw `[batch, dim]` vector that [`TimestepProjection`]
/// consumes: cosines of `t * freqs` followed by sines, with
/// `freqs[i] = exp(-ln(max_period) * i / (dim / 2))`. An odd `dim` gets a
/// trailing zero column.
pub fn timestep_embedding<B: Backend>(
    timesteps: Tensor<B, 1>,
    dim: usize,
    max_period: f64,
    device: &B::Device,
) -> Tensor<B, 2> {
    let half_dim = dim / 2;
    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| (-max_period.ln() * i as f64 / half_dim as f64).exp() as f32)
        .collect();
    let freqs = Tensor::<B, 1>::from_data(TensorData::new(freqs, [half_dim]), device);

    let [batch] = timesteps.dims();
    let args = timesteps.reshape([batch, 1]) * freqs.reshape([1, half_dim]);

    let mut parts = vec![args.clone().cos(), args.sin()];
    if dim % 2 == 1 {
        parts.push(Tensor::zeros([batch, 1], device));
    }
    Tensor::cat(parts, 1)
}

/// Projects the raw timestep vector to the embedding every ResBlock receives
///
/// `Linear -> swish -> Linear`.
#[derive(Module, Debug)]
pub struct TimestepProjection<B: Backend> {
    /// First linear layer
    pub linear_1: Linear<B>,
    /// Second linear layer
    pub linear_2: Linear<B>,
}

impl<B: Backend> TimestepProjection<B> {
    /// Creates a projection from `input_dim` to `embed_dim`
    pub fn new(input_dim: usize, embed_dim: usize, device: &B::Device) -> Self {
        Self {
            linear_1: LinearConfig::new(input_dim, embed_dim).init(device),
            linear_2: LinearConfig::new(embed_dim, embed_dim).init(device),
        }
    }

    /// Maps `[batch, input_dim]` to `[batch, embed_dim]`
    pub fn forward(&self, t: Tensor<B, 2>) -> Tensor<B, 2> {
        let t = self.linear_1.forward(t);
        self.linear_2.forward(silu(t))
    }
}

/// Residual block with timestep conditioning
///
/// ```text
/// h   = conv1(swish(norm1(x)))
/// h   = h + time_emb_proj(swish(t))      // broadcast over space
/// h   = conv2(swish(norm2(h)))
/// out = h + residual(x)
/// ```
///
/// The residual path is a 1x1 convolution when the block changes the channel
/// count and the identity otherwise. The choice is fixed when the block is
/// built.
#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    /// Entry normalization
    pub norm1: GroupNorm<B>,
    /// Entry convolution
    pub conv1: Conv2d<B>,
    /// Timestep embedding projection
    pub time_emb_proj: Linear<B>,
    /// Exit normalization
    pub norm2: GroupNorm<B>,
    /// Exit convolution
    pub conv2: Conv2d<B>,
    /// Residual projection; `None` means identity
    pub skip_conv: Option<Conv2d<B>>,
}

impl<B: Backend> ResBlock<B> {
    /// Creates a new residual block
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output channels
    /// * `time_emb_dim` - Dimension of the timestep embedding
    /// * `norm_groups` - Group count of both normalizations
    /// * `device` - Device to create tensors on
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        time_emb_dim: usize,
        norm_groups: usize,
        device: &B::Device,
    ) -> Self {
        let skip_conv = (in_channels != out_channels)
            .then(|| Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device));

        Self {
            norm1: GroupNorm::new(norm_groups, in_channels, device),
            conv1: conv3x3(in_channels, out_channels, device),
            time_emb_proj: LinearConfig::new(time_emb_dim, out_channels).init(device),
            norm2: GroupNorm::new(norm_groups, out_channels, device),
            conv2: conv3x3(out_channels, out_channels, device),
            skip_conv,
        }
    }

    /// Whether the residual path carries a learned projection
    pub fn has_residual_projection(&self) -> bool {
        self.skip_conv.is_some()
    }

    /// Forward pass through the residual block
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, in_channels, height, width]`
    /// * `time_emb` - Timestep embedding of shape `[batch, time_emb_dim]`
    ///
    /// # Returns
    ///
    /// Output tensor of shape `[batch, out_channels, height, width]`
    pub fn forward(&self, x: Tensor<B, 4>, time_emb: Tensor<B, 2>) -> Tensor<B, 4> {
        let residual = match &self.skip_conv {
            Some(conv) => conv.forward(x.clone()),
            None => x.clone(),
        };

        let hidden = self.conv1.forward(silu(self.norm1.forward(x)));

        let emb = self.time_emb_proj.forward(silu(time_emb));
        let [b, emb_dim] = emb.dims();
        let hidden = hidden + emb.reshape([b, emb_dim, 1, 1]);

        let hidden = self.conv2.forward(silu(self.norm2.forward(hidden)));

        hidden + residual
    }
}

/// Channel projection at the sequence boundaries of a [`SpatialTransformer`]
#[derive(Module, Debug)]
pub enum ChannelProjection<B: Backend> {
    /// 1x1 convolution on the feature map
    Conv(Conv2d<B>),
    /// Fully-connected layer on the token sequence
    Dense(Linear<B>),
}

impl<B: Backend> ChannelProjection<B> {
    /// Creates a projection from `in_channels` to `out_channels`
    pub fn new(in_channels: usize, out_channels: usize, dense: bool, device: &B::Device) -> Self {
        if dense {
            Self::Dense(LinearConfig::new(in_channels, out_channels).init(device))
        } else {
            Self::Conv(Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device))
        }
    }

    /// Whether this is the fully-connected variant
    pub fn is_dense(&self) -> bool {
        matches!(self, Self::Dense(_))
    }

    /// Projects a feature map and flattens it to `[batch, height * width, channels]`
    pub fn to_tokens(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        match self {
            Self::Conv(conv) => flatten_tokens(conv.forward(x)),
            Self::Dense(linear) => linear.forward(flatten_tokens(x)),
        }
    }

    /// Projects a token sequence and folds it back to `[batch, channels, height, width]`
    pub fn from_tokens(&self, tokens: Tensor<B, 3>, height: usize, width: usize) -> Tensor<B, 4> {
        match self {
            Self::Conv(conv) => conv.forward(fold_tokens(tokens, height, width)),
            Self::Dense(linear) => fold_tokens(linear.forward(tokens), height, width),
        }
    }
}

/// `[b, c, h, w]` -> `[b, h * w, c]`
fn flatten_tokens<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [b, c, h, w] = x.dims();
    x.reshape([b, c, h * w]).swap_dims(1, 2)
}

/// `[b, h * w, c]` -> `[b, c, h, w]`
fn fold_tokens<B: Backend>(x: Tensor<B, 3>, height: usize, width: usize) -> Tensor<B, 4> {
    let [b, _, c] = x.dims();
    x.swap_dims(1, 2).reshape([b, c, height, width])
}

/// Spatial transformer: cross-attention from image positions to the context
#[derive(Module, Debug)]
pub struct SpatialTransformer<B: Backend> {
    /// Input normalization
    pub norm: GroupNorm<B>,
    /// Input projection
    pub proj_in: ChannelProjection<B>,
    /// Transformer block run on the flattened positions
    pub transformer_block: TransformerBlock<B>,
    /// Output projection
    pub proj_out: ChannelProjection<B>,
}

impl<B: Backend> SpatialTransformer<B> {
    /// Creates a new spatial transformer block
    ///
    /// # Arguments
    ///
    /// * `channels` - Number of input/output channels
    /// * `num_heads` - Number of attention heads
    /// * `head_dim` - Dimension per attention head
    /// * `context_dim` - Width of the cross-attention context
    /// * `norm_groups` - Group count of the input normalization
    /// * `dense_projection` - Project with fully-connected layers instead of 1x1 convolutions
    /// * `device` - Device to create tensors on
    pub fn new(
        channels: usize,
        num_heads: usize,
        head_dim: usize,
        context_dim: usize,
        norm_groups: usize,
        dense_projection: bool,
        device: &B::Device,
    ) -> Self {
        let inner_dim = num_heads * head_dim;

        Self {
            norm: GroupNorm::new(norm_groups, channels, device),
            proj_in: ChannelProjection::new(channels, inner_dim, dense_projection, device),
            transformer_block: TransformerBlock::new(inner_dim, num_heads, head_dim, context_dim, device),
            proj_out: ChannelProjection::new(inner_dim, channels, dense_projection, device),
        }
    }

    /// Forward pass with cross-attention to the context
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, channels, height, width]`
    /// * `context` - Context of shape `[batch, ctx_len, context_dim]`
    ///
    /// # Returns
    ///
    /// Output tensor with same shape as input
    pub fn forward(&self, x: Tensor<B, 4>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let [_, _, h, w] = x.dims();
        let residual = x.clone();

        let tokens = self.proj_in.to_tokens(self.norm.forward(x));
        let tokens = self.transformer_block.forward(tokens, context);
        let x = self.proj_out.from_tokens(tokens, h, w);

        x + residual
    }
}

/// Transformer block with self-attention, cross-attention, and FFN
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    /// Self-attention layer norm
    pub norm1: LayerNorm<B>,
    /// Self-attention
    pub attn1: CrossAttention<B>,
    /// Cross-attention layer norm
    pub norm2: LayerNorm<B>,
    /// Cross-attention
    pub attn2: CrossAttention<B>,
    /// FFN layer norm
    pub norm3: LayerNorm<B>,
    /// Feed-forward network
    pub ff: FeedForward<B>,
}

impl<B: Backend> TransformerBlock<B> {
    /// Creates a new transformer block
    ///
    /// # Arguments
    ///
    /// * `dim` - Hidden dimension
    /// * `num_heads` - Number of attention heads
    /// * `head_dim` - Dimension per attention head
    /// * `context_dim` - Dimension of cross-attention context
    /// * `device` - Device to create tensors on
    pub fn new(
        dim: usize,
        num_heads: usize,
        head_dim: usize,
        context_dim: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            norm1: LayerNorm::new(dim, device),
            attn1: CrossAttention::new(dim, num_heads, head_dim, None, device),
            norm2: LayerNorm::new(dim, device),
            attn2: CrossAttention::new(dim, num_heads, head_dim, Some(context_dim), device),
            norm3: LayerNorm::new(dim, device),
            ff: FeedForward::new(dim, dim * 4, device),
        }
    }

    /// Forward pass through self-attention, cross-attention, and FFN
    ///
    /// # Arguments
    ///
    /// * `x` - Input sequence of shape `[batch, seq_len, dim]`
    /// * `context` - Cross-attention context of shape `[batch, ctx_len, context_dim]`
    pub fn forward(&self, x: Tensor<B, 3>, context: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.attn1.forward(self.norm1.forward(x.clone()), None) + x;
        let x = self.attn2.forward(self.norm2.forward(x.clone()), Some(context)) + x;
        self.ff.forward(self.norm3.forward(x.clone())) + x
    }
}

/// Cross-attention (or self-attention if context is None)
///
/// Query, key and value projections are bias-free; the output projection
/// has a bias. No residual is added here.
#[derive(Module, Debug)]
pub struct CrossAttention<B: Backend> {
    /// Query projection
    pub to_q: Linear<B>,
    /// Key projection
    pub to_k: Linear<B>,
    /// Value projection
    pub to_v: Linear<B>,
    /// Output projection
    pub to_out: Linear<B>,
    /// Number of attention heads
    pub num_heads: usize,
    /// Dimension per head
    pub head_dim: usize,
}

impl<B: Backend> CrossAttention<B> {
    /// Creates a new cross-attention (or self-attention) module
    ///
    /// # Arguments
    ///
    /// * `query_dim` - Dimension of query input
    /// * `num_heads` - Number of attention heads
    /// * `head_dim` - Dimension per attention head
    /// * `context_dim` - Dimension of key/value context (None for self-attention)
    /// * `device` - Device to create tensors on
    pub fn new(
        query_dim: usize,
        num_heads: usize,
        head_dim: usize,
        context_dim: Option<usize>,
        device: &B::Device,
    ) -> Self {
        let inner_dim = num_heads * head_dim;
        let context_dim = context_dim.unwrap_or(query_dim);

        Self {
            to_q: LinearConfig::new(query_dim, inner_dim).with_bias(false).init(device),
            to_k: LinearConfig::new(context_dim, inner_dim).with_bias(false).init(device),
            to_v: LinearConfig::new(context_dim, inner_dim).with_bias(false).init(device),
            to_out: LinearConfig::new(inner_dim, inner_dim).init(device),
            num_heads,
            head_dim,
        }
    }

    /// Computes multi-head attention
    ///
    /// # Arguments
    ///
    /// * `x` - Query input of shape `[batch, seq_len, query_dim]`
    /// * `context` - Key/value context (None attends to `x` itself)
    ///
    /// # Returns
    ///
    /// Attention output of shape `[batch, seq_len, num_heads * head_dim]`
    pub fn forward(&self, x: Tensor<B, 3>, context: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        let context = context.unwrap_or_else(|| x.clone());

        let q = split_heads(self.to_q.forward(x), self.num_heads, self.head_dim);
        let k = split_heads(self.to_k.forward(context.clone()), self.num_heads, self.head_dim);
        let v = split_heads(self.to_v.forward(context), self.num_heads, self.head_dim);

        let out = merge_heads(scaled_dot_product(q, k, v));

        self.to_out.forward(out)
    }
}

/// Feed-forward network: GEGLU to `4 * dim`, then a dense layer back to `dim`
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    /// Gated projection
    pub geglu: Geglu<B>,
    /// Projection back to the model width
    pub dense: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    /// Creates a new feed-forward network
    ///
    /// # Arguments
    ///
    /// * `dim` - Input and output dimension
    /// * `hidden_dim` - GEGLU output dimension
    /// * `device` - Device to create tensors on
    pub fn new(dim: usize, hidden_dim: usize, device: &B::Device) -> Self {
        Self {
            geglu: GegluConfig::new(dim, hidden_dim).init(device),
            dense: LinearConfig::new(hidden_dim, dim).init(device),
        }
    }

    /// Applies the FFN to `[batch, seq_len, dim]`
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.dense.forward(self.geglu.forward(x))
    }
}

/// Downsample block (strided conv)
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    /// 3x3 convolution with stride 2
    pub conv: Conv2d<B>,
}

impl<B: Backend> Downsample<B> {
    /// Creates a 2x downsample keeping `channels`
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([channels, channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        Self { conv }
    }

    /// `[b, c, h, w]` -> `[b, c, h/2, w/2]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(x)
    }
}

/// Upsample block using nearest neighbor interpolation followed by convolution
#[derive(Module, Debug)]
pub struct Upsample<B: Backend> {
    /// Convolution after nearest-neighbor upsample
    pub conv: Conv2d<B>,
}

impl<B: Backend> Upsample<B> {
    /// Creates a 2x upsample keeping `channels`
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv: conv3x3(channels, channels, device),
        }
    }

    /// `[b, c, h, w]` -> `[b, c, 2h, 2w]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(upsample_nearest_2x(x))
    }
}

/// Nearest-neighbor 2x spatial upsample
pub fn upsample_nearest_2x<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();

    x.reshape([b, c, h, 1, w, 1])
        .repeat_dim(3, 2)
        .repeat_dim(5, 2)
        .reshape([b, c, h * 2, w * 2])
}

/// 3x3 convolution with padding 1
pub(crate) fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::Param;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn max_abs_diff<const D: usize>(a: Tensor<TestBackend, D>, b: Tensor<TestBackend, D>) -> f32 {
        let a = a.into_data().to_vec::<f32>().unwrap();
        let b = b.into_data().to_vec::<f32>().unwrap();
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_timestep_embedding_cos_then_sin() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([0.0, 10.0], &device);
        let emb = timestep_embedding(t, 8, 10000.0, &device);
        assert_eq!(emb.dims(), [2, 8]);

        let values = emb.into_data().to_vec::<f32>().unwrap();
        // t = 0: cos half is 1, sin half is 0
        assert_eq!(&values[..4], &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(&values[4..8], &[0.0, 0.0, 0.0, 0.0]);
        // t = 10, first frequency is 1
        assert!((values[8] - 10.0f32.cos()).abs() < 1e-5);
        assert!((values[12] - 10.0f32.sin()).abs() < 1e-5);
    }

    #[test]
    fn test_timestep_embedding_odd_width_pads_zero() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([3.0, 250.0], &device);
        let emb = timestep_embedding(t, 7, 10000.0, &device);
        assert_eq!(emb.dims(), [2, 7]);

        let values = emb.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values[6], 0.0);
        assert_eq!(values[13], 0.0);
        assert!((values[0] - 3.0f32.cos()).abs() < 1e-5);
        assert!((values[3] - 3.0f32.sin()).abs() < 1e-5);
    }

    #[test]
    fn test_timestep_projection_shape() {
        let device = Default::default();
        let proj = TimestepProjection::<TestBackend>::new(320, 1280, &device);
        let t = Tensor::zeros([2, 320], &device);
        assert_eq!(proj.forward(t).dims(), [2, 1280]);
    }

    #[test]
    fn test_res_block_projection_only_when_channels_change() {
        let device = Default::default();

        let same = ResBlock::<TestBackend>::new(64, 64, 128, 32, &device);
        assert!(!same.has_residual_projection());

        let widen = ResBlock::<TestBackend>::new(64, 128, 128, 32, &device);
        assert!(widen.has_residual_projection());
        let conv = widen.skip_conv.as_ref().unwrap();
        assert_eq!(conv.weight.dims(), [128, 64, 1, 1]);
    }

    #[test]
    fn test_res_block_shapes() {
        let device = Default::default();
        let block = ResBlock::<TestBackend>::new(64, 96, 128, 32, &device);

        let x = Tensor::random([2, 64, 8, 8], Distribution::Default, &device);
        let t = Tensor::random([2, 128], Distribution::Default, &device);
        assert_eq!(block.forward(x, t).dims(), [2, 96, 8, 8]);
    }

    #[test]
    fn test_res_block_identity_residual_passes_input() {
        let device = Default::default();
        let mut block = ResBlock::<TestBackend>::new(32, 32, 16, 32, &device);
        // Zero the exit conv so only the residual path reaches the output
        block.conv2.weight = burn::module::Param::from_tensor(Tensor::zeros([32, 32, 3, 3], &device));
        block.conv2.bias = Some(burn::module::Param::from_tensor(Tensor::zeros([32], &device)));

        let x = Tensor::<TestBackend, 4>::random([1, 32, 4, 4], Distribution::Default, &device);
        let t = Tensor::random([1, 16], Distribution::Default, &device);
        let out = block.forward(x.clone(), t);

        assert!(max_abs_diff(out, x) < 1e-6);
    }

    #[test]
    fn test_self_attention_matches_explicit_context() {
        let device = Default::default();
        let attn = CrossAttention::<TestBackend>::new(32, 4, 8, None, &device);

        let x = Tensor::<TestBackend, 3>::random([2, 6, 32], Distribution::Default, &device);
        let implicit = attn.forward(x.clone(), None);
        let explicit = attn.forward(x.clone(), Some(x));

        assert_eq!(implicit.dims(), [2, 6, 32]);
        assert!(max_abs_diff(implicit, explicit) < 1e-6);
    }

    fn identity_linear(n: usize, device: &<TestBackend as Backend>::Device) -> Linear<TestBackend> {
        let eye: Vec<f32> = (0..n * n).map(|i| if i / n == i % n { 1.0 } else { 0.0 }).collect();
        let mut linear = LinearConfig::new(n, n).init(device);
        linear.weight = Param::from_tensor(Tensor::from_data(TensorData::new(eye, [n, n]), device));
        linear.bias = Some(Param::from_tensor(Tensor::zeros([n], device)));
        linear
    }

    fn zero_linear(n: usize, m: usize, device: &<TestBackend as Backend>::Device) -> Linear<TestBackend> {
        let mut linear = LinearConfig::new(n, m).init(device);
        linear.weight = Param::from_tensor(Tensor::zeros([n, m], device));
        linear.bias = Some(Param::from_tensor(Tensor::zeros([m], device)));
        linear
    }

    fn identity_attention(num_heads: usize, head_dim: usize) -> CrossAttention<TestBackend> {
        let device = Default::default();
        let dim = num_heads * head_dim;
        let mut attn = CrossAttention::new(dim, num_heads, head_dim, None, &device);
        attn.to_q.weight = identity_linear(dim, &device).weight;
        attn.to_k.weight = identity_linear(dim, &device).weight;
        attn.to_v.weight = identity_linear(dim, &device).weight;
        attn.to_out = identity_linear(dim, &device);
        attn
    }

    #[test]
    fn test_attention_weights_follow_scaled_scores() {
        let device = Default::default();
        let attn = identity_attention(1, 2);
        let x = Tensor::<TestBackend, 1>::from_floats([2.0, 0.0, 0.0, 2.0], &device).reshape([1, 2, 2]);

        let values = attn.forward(x, None).into_data().to_vec::<f32>().unwrap();

        // row 0 scores [4, 0] / sqrt(2)
        let p = 1.0 / (1.0 + (-4.0f32 / 2.0f32.sqrt()).exp());
        let expected = [2.0 * p, 2.0 * (1.0 - p), 2.0 * (1.0 - p), 2.0 * p];
        for (value, expected) in values.iter().zip(expected) {
            assert!((value - expected).abs() < 1e-5, "{value} != {expected}");
        }
    }

    #[test]
    fn test_attention_heads_attend_independently() {
        let device = Default::default();
        let attn = identity_attention(2, 2);
        // head 0 sees only the first token, head 1 only the second
        let x = Tensor::<TestBackend, 1>::from_floats([2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 3.0, 0.0], &device)
            .reshape([1, 2, 4]);

        let values = attn.forward(x, None).into_data().to_vec::<f32>().unwrap();

        let sigmoid = |s: f32| 1.0 / (1.0 + (-s).exp());
        let p0 = sigmoid(4.0 / 2.0f32.sqrt());
        let p1 = sigmoid(9.0 / 2.0f32.sqrt());
        let expected = [2.0 * p0, 0.0, 1.5, 0.0, 1.0, 0.0, 3.0 * p1, 0.0];
        for (value, expected) in values.iter().zip(expected) {
            assert!((value - expected).abs() < 1e-5, "{value} != {expected}");
        }
    }

    #[test]
    fn test_transformer_block_zero_outputs_is_identity() {
        let device = Default::default();
        let mut block = TransformerBlock::<TestBackend>::new(32, 4, 8, 24, &device);
        block.attn1.to_out = zero_linear(32, 32, &device);
        block.attn2.to_out = zero_linear(32, 32, &device);
        block.ff.dense = zero_linear(128, 32, &device);

        let x = Tensor::<TestBackend, 3>::random([2, 6, 32], Distribution::Default, &device);
        let context = Tensor::random([2, 3, 24], Distribution::Default, &device);
        let out = block.forward(x.clone(), context);

        assert!(max_abs_diff(out, x) < 1e-6);
    }

    #[test]
    fn test_spatial_transformer_zero_projection_keeps_input() {
        let device = Default::default();
        let mut block = SpatialTransformer::<TestBackend>::new(64, 4, 16, 24, 32, false, &device);
        let mut conv = Conv2dConfig::new([64, 64], [1, 1]).init(&device);
        conv.weight = Param::from_tensor(Tensor::zeros([64, 64, 1, 1], &device));
        conv.bias = Some(Param::from_tensor(Tensor::zeros([64], &device)));
        block.proj_out = ChannelProjection::Conv(conv);

        let x = Tensor::<TestBackend, 4>::random([1, 64, 4, 6], Distribution::Default, &device);
        let context = Tensor::random([1, 7, 24], Distribution::Default, &device);
        let out = block.forward(x.clone(), context);

        assert!(max_abs_diff(out, x) < 1e-6);
    }

    #[test]
    fn test_cross_attention_context_width() {
        let device = Default::default();
        let attn = CrossAttention::<TestBackend>::new(32, 2, 16, Some(24), &device);

        let x = Tensor::zeros([1, 9, 32], &device);
        let context = Tensor::random([1, 5, 24], Distribution::Default, &device);
        assert_eq!(attn.forward(x, Some(context)).dims(), [1, 9, 32]);
        assert!(attn.to_q.bias.is_none());
        assert!(attn.to_out.bias.is_some());
    }

    #[test]
    fn test_transformer_block_shape() {
        let device = Default::default();
        let block = TransformerBlock::<TestBackend>::new(32, 4, 8, 24, &device);
        assert_eq!(block.ff.geglu.output_dim, 128);

        let x = Tensor::random([1, 16, 32], Distribution::Default, &device);
        let context = Tensor::random([1, 3, 24], Distribution::Default, &device);
        assert_eq!(block.forward(x, context).dims(), [1, 16, 32]);
    }

    #[test]
    fn test_spatial_transformer_projection_variants() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([1, 64, 4, 6], Distribution::Default, &device);
        let context = Tensor::<TestBackend, 3>::random([1, 7, 24], Distribution::Default, &device);

        let conv = SpatialTransformer::<TestBackend>::new(64, 4, 16, 24, 32, false, &device);
        let dense = SpatialTransformer::<TestBackend>::new(64, 4, 16, 24, 32, true, &device);
        assert!(!conv.proj_in.is_dense());
        assert!(dense.proj_in.is_dense() && dense.proj_out.is_dense());

        let a = conv.forward(x.clone(), context.clone());
        let b = dense.forward(x, context);
        assert_eq!(a.dims(), [1, 64, 4, 6]);
        assert_eq!(a.dims(), b.dims());
    }

    #[test]
    fn test_conv_and_dense_projection_agree_on_shared_weights() {
        let device = Default::default();
        let linear = LinearConfig::new(8, 4).init::<TestBackend>(&device);
        let mut conv = Conv2dConfig::new([8, 4], [1, 1]).init::<TestBackend>(&device);
        // Linear stores [in, out]; a 1x1 conv stores [out, in, 1, 1]
        conv.weight = burn::module::Param::from_tensor(
            linear.weight.val().transpose().reshape([4, 8, 1, 1]),
        );
        conv.bias = linear.bias.clone();

        let x = Tensor::<TestBackend, 4>::random([1, 8, 3, 5], Distribution::Default, &device);
        let dense_tokens = ChannelProjection::Dense(linear).to_tokens(x.clone());
        let conv_tokens = ChannelProjection::Conv(conv).to_tokens(x);

        assert_eq!(dense_tokens.dims(), [1, 15, 4]);
        assert!(max_abs_diff(dense_tokens, conv_tokens) < 1e-5);
    }

    #[test]
    fn test_downsample_halves_resolution() {
        let device = Default::default();
        let down = Downsample::<TestBackend>::new(32, &device);
        let x = Tensor::zeros([1, 32, 8, 6], &device);
        assert_eq!(down.forward(x).dims(), [1, 32, 4, 3]);
    }

    #[test]
    fn test_nearest_upsample_repeats_pixels() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0, 4.0], &device).reshape([1, 1, 2, 2]);
        let up = upsample_nearest_2x(x);
        assert_eq!(up.dims(), [1, 1, 4, 4]);

        let values = up.into_data().to_vec::<f32>().unwrap();
        assert_eq!(
            values,
            vec![
                1.0, 1.0, 2.0, 2.0, //
                1.0, 1.0, 2.0, 2.0, //
                3.0, 3.0, 4.0, 4.0, //
                3.0, 3.0, 4.0, 4.0,
            ]
        );

        let block = Upsample::<TestBackend>::new(32, &device);
        assert_eq!(block.forward(Tensor::zeros([2, 32, 3, 5], &device)).dims(), [2, 32, 6, 10]);
    }
}
