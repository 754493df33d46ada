//! Diffusion U-Net weight loading
//!
//! Maps CompVis-style checkpoint names onto [`DiffusionModel`] fields. The
//! network is assembled from the same [`Topology`] the randomly initialized
//! model uses, so every slot is visited in plan order:
//!
//! ```text
//! time_embed.{0,2}                  timestep projection
//! input_blocks.0.0                  conv_in
//! input_blocks.{i}.0 / .1           ResBlock / SpatialTransformer
//! input_blocks.{i}.0.op             Downsample
//! middle_block.{0,1,2}              ResBlock, SpatialTransformer, ResBlock
//! output_blocks.{i}.0 / .1          ResBlock / SpatialTransformer
//! output_blocks.{i}.{1|2}.conv      Upsample (last step of a level)
//! out.0 / out.2                     exit norm / conv
//! ```

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use thiserror::Error;

use burn_ldm_core::glu::Geglu;
use burn_ldm_core::groupnorm::GroupNorm;
use burn_ldm_core::layernorm::LayerNorm;
use burn_ldm_unet::{
    AttentionPlan, ChannelProjection, ConfigError, CrossAttention, DiffusionConfig, DiffusionModel,
    DownLevel, Downsample, FeedForward, MidBlock, ResBlock, SpatialTransformer, Step, StepPlan,
    TimestepProjection, Topology, TransformerBlock, UpLevel, Upsample, WeightSource,
};

use crate::loader::{LoadError, SafeTensorFile, TensorSource};

/// Prefix of the U-Net inside a full latent-diffusion checkpoint
pub const DEFAULT_PREFIX: &str = "model.diffusion_model";

/// Error type for diffusion model loading
#[derive(Error, Debug)]
pub enum DiffusionLoadError {
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Remote weight origin {0} must be fetched before loading")]
    RemoteOrigin(String),

    #[error("Configuration names no weight source")]
    NoWeightSource,

    #[error("Weight file hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

/// Opens the local file a [`WeightSource`] points to
///
/// Accepts plain paths and `file://` URLs. When the source carries a
/// `file_hash`, the file's SHA-256 must match it (hex, case-insensitive).
pub fn open_weight_source(source: &WeightSource) -> Result<SafeTensorFile, DiffusionLoadError> {
    let origin = source.origin.as_str();
    if origin.contains("://") && !origin.starts_with("file://") {
        return Err(DiffusionLoadError::RemoteOrigin(origin.to_string()));
    }
    let path = origin.strip_prefix("file://").unwrap_or(origin);

    tracing::info!(path, file_hash = ?source.file_hash, "opening weights");
    let file = SafeTensorFile::open(path)?;

    if let Some(expected) = &source.file_hash {
        let actual = file.sha256_hex();
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(DiffusionLoadError::HashMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        tracing::debug!(path, "weight hash verified");
    }
    Ok(file)
}

/// Loads the model named by `config.weights`
pub fn load_diffusion_model<B: Backend>(
    config: &DiffusionConfig,
    device: &B::Device,
) -> Result<DiffusionModel<B>, DiffusionLoadError> {
    let source = config.weights.as_ref().ok_or(DiffusionLoadError::NoWeightSource)?;
    let file = open_weight_source(source)?;
    DiffusionWeightLoader::new(&file).load(config, device)
}

/// Loads a [`DiffusionModel`] from any [`TensorSource`]
pub struct DiffusionWeightLoader<'a, S: TensorSource> {
    source: &'a S,
    prefix: String,
}

impl<'a, S: TensorSource> DiffusionWeightLoader<'a, S> {
    /// Creates a loader using [`DEFAULT_PREFIX`]
    pub fn new(source: &'a S) -> Self {
        Self::with_prefix(source, DEFAULT_PREFIX)
    }

    /// Creates a loader for tensors under `prefix` (empty for bare U-Net files)
    pub fn with_prefix(source: &'a S, prefix: impl Into<String>) -> Self {
        Self {
            source,
            prefix: prefix.into(),
        }
    }

    /// Builds the network described by `config` from the source's tensors
    pub fn load<B: Backend>(
        &self,
        config: &DiffusionConfig,
        device: &B::Device,
    ) -> Result<DiffusionModel<B>, DiffusionLoadError> {
        let topology = Topology::new(config)?;
        let blocks: BlockLoader<'_, '_, S, B> = BlockLoader {
            source: self.source,
            time_embed_dim: config.time_embed_dim,
            context_dim: config.context_length,
            norm_groups: config.norm_groups,
            dense_projection: config.dense_projection,
            device,
        };

        let time_embed = TimestepProjection {
            linear_1: blocks.linear(
                &self.key("time_embed.0"),
                config.time_embed_input_dim,
                config.time_embed_dim,
                true,
            )?,
            linear_2: blocks.linear(&self.key("time_embed.2"), config.time_embed_dim, config.time_embed_dim, true)?,
        };

        let conv_in = blocks.conv2d(
            &self.key("input_blocks.0.0"),
            topology.latent_channels,
            topology.conv_in_channels,
            3,
            1,
        )?;

        let mut block = 1;
        let mut down_levels = Vec::with_capacity(topology.down.len());
        for plan in &topology.down {
            let mut steps = Vec::with_capacity(plan.steps.len());
            for step in &plan.steps {
                steps.push(blocks.step(&self.key(&format!("input_blocks.{block}")), step)?);
                block += 1;
            }
            let downsample = match plan.downsample {
                Some(channels) => {
                    let name = self.key(&format!("input_blocks.{block}.0.op"));
                    block += 1;
                    Some(Downsample {
                        conv: blocks.conv2d(&name, channels, channels, 3, 2)?,
                    })
                }
                None => None,
            };
            tracing::debug!(level = plan.level, steps = steps.len(), "loaded encoder level");
            down_levels.push(DownLevel { steps, downsample });
        }

        let middle = &topology.middle;
        let mid_block = MidBlock {
            res1: blocks.res_block(&self.key("middle_block.0"), middle.channels, middle.channels)?,
            attn: blocks.spatial_transformer(&self.key("middle_block.1"), middle.channels, middle.attention)?,
            res2: blocks.res_block(&self.key("middle_block.2"), middle.channels, middle.channels)?,
        };
        tracing::debug!(channels = middle.channels, "loaded middle block");

        let mut block = 0;
        let mut up_levels = Vec::with_capacity(topology.up.len());
        for plan in &topology.up {
            let mut steps = Vec::with_capacity(plan.steps.len());
            let mut last = String::new();
            let mut last_has_attention = false;
            for step in &plan.steps {
                last = self.key(&format!("output_blocks.{block}"));
                last_has_attention = step.attention.is_some();
                steps.push(blocks.step(&last, step)?);
                block += 1;
            }
            let upsample = match plan.upsample {
                Some(channels) => {
                    let slot = if last_has_attention { 2 } else { 1 };
                    Some(Upsample {
                        conv: blocks.conv2d(&format!("{last}.{slot}.conv"), channels, channels, 3, 1)?,
                    })
                }
                None => None,
            };
            tracing::debug!(level = plan.level, steps = steps.len(), "loaded decoder level");
            up_levels.push(UpLevel { steps, upsample });
        }

        let norm_out = blocks.group_norm(&self.key("out.0"), topology.out_channels)?;
        let conv_out = blocks.conv2d(
            &self.key("out.2"),
            topology.out_channels,
            topology.latent_channels,
            3,
            1,
        )?;

        tracing::info!(
            levels = topology.levels.len(),
            input_blocks = topology.skip_pushes(),
            output_blocks = topology.skip_pops(),
            "loaded diffusion model"
        );

        Ok(DiffusionModel {
            time_embed,
            conv_in,
            down_levels,
            mid_block,
            up_levels,
            norm_out,
            conv_out,
            latent_channels: config.latent_channels,
            time_embed_input_dim: config.time_embed_input_dim,
            max_length: config.max_length,
            context_length: config.context_length,
        })
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }
}

/// Per-block loading helpers sharing the network-wide settings
struct BlockLoader<'a, 'd, S: TensorSource, B: Backend> {
    source: &'a S,
    time_embed_dim: usize,
    context_dim: usize,
    norm_groups: usize,
    dense_projection: bool,
    device: &'d B::Device,
}

impl<S: TensorSource, B: Backend> BlockLoader<'_, '_, S, B> {
    fn step(&self, prefix: &str, plan: &StepPlan) -> Result<Step<B>, DiffusionLoadError> {
        let res = self.res_block(&format!("{prefix}.0"), plan.in_channels, plan.out_channels)?;
        let attn = match plan.attention {
            Some(attention) => Some(self.spatial_transformer(&format!("{prefix}.1"), plan.out_channels, attention)?),
            None => None,
        };
        Ok(Step { res, attn })
    }

    fn res_block(&self, prefix: &str, in_channels: usize, out_channels: usize) -> Result<ResBlock<B>, DiffusionLoadError> {
        let skip_conv = if in_channels != out_channels {
            Some(self.conv2d(&format!("{prefix}.skip_connection"), in_channels, out_channels, 1, 1)?)
        } else {
            None
        };

        Ok(ResBlock {
            norm1: self.group_norm(&format!("{prefix}.in_layers.0"), in_channels)?,
            conv1: self.conv2d(&format!("{prefix}.in_layers.2"), in_channels, out_channels, 3, 1)?,
            time_emb_proj: self.linear(&format!("{prefix}.emb_layers.1"), self.time_embed_dim, out_channels, true)?,
            norm2: self.group_norm(&format!("{prefix}.out_layers.0"), out_channels)?,
            conv2: self.conv2d(&format!("{prefix}.out_layers.3"), out_channels, out_channels, 3, 1)?,
            skip_conv,
        })
    }

    fn spatial_transformer(
        &self,
        prefix: &str,
        channels: usize,
        attention: AttentionPlan,
    ) -> Result<SpatialTransformer<B>, DiffusionLoadError> {
        let inner_dim = attention.num_heads * attention.head_dim;
        let block = format!("{prefix}.transformer_blocks.0");

        let transformer_block = TransformerBlock {
            norm1: self.layer_norm(&format!("{block}.norm1"), inner_dim)?,
            attn1: self.cross_attention(&format!("{block}.attn1"), inner_dim, inner_dim, attention)?,
            norm2: self.layer_norm(&format!("{block}.norm2"), inner_dim)?,
            attn2: self.cross_attention(&format!("{block}.attn2"), inner_dim, self.context_dim, attention)?,
            norm3: self.layer_norm(&format!("{block}.norm3"), inner_dim)?,
            ff: self.feed_forward(&format!("{block}.ff"), inner_dim)?,
        };

        Ok(SpatialTransformer {
            norm: self.group_norm(&format!("{prefix}.norm"), channels)?,
            proj_in: self.projection(&format!("{prefix}.proj_in"), channels, inner_dim)?,
            transformer_block,
            proj_out: self.projection(&format!("{prefix}.proj_out"), inner_dim, channels)?,
        })
    }

    fn cross_attention(
        &self,
        prefix: &str,
        query_dim: usize,
        context_dim: usize,
        attention: AttentionPlan,
    ) -> Result<CrossAttention<B>, DiffusionLoadError> {
        let inner_dim = attention.num_heads * attention.head_dim;
        Ok(CrossAttention {
            to_q: self.linear(&format!("{prefix}.to_q"), query_dim, inner_dim, false)?,
            to_k: self.linear(&format!("{prefix}.to_k"), context_dim, inner_dim, false)?,
            to_v: self.linear(&format!("{prefix}.to_v"), context_dim, inner_dim, false)?,
            to_out: self.linear(&format!("{prefix}.to_out.0"), inner_dim, inner_dim, true)?,
            num_heads: attention.num_heads,
            head_dim: attention.head_dim,
        })
    }

    fn feed_forward(&self, prefix: &str, dim: usize) -> Result<FeedForward<B>, DiffusionLoadError> {
        let hidden = dim * 4;
        Ok(FeedForward {
            geglu: Geglu {
                proj: self.linear(&format!("{prefix}.net.0.proj"), dim, hidden * 2, true)?,
                output_dim: hidden,
            },
            dense: self.linear(&format!("{prefix}.net.2"), hidden, dim, true)?,
        })
    }

    fn projection(&self, prefix: &str, in_channels: usize, out_channels: usize) -> Result<ChannelProjection<B>, DiffusionLoadError> {
        if self.dense_projection {
            Ok(ChannelProjection::Dense(self.linear(prefix, in_channels, out_channels, true)?))
        } else {
            Ok(ChannelProjection::Conv(self.conv2d(prefix, in_channels, out_channels, 1, 1)?))
        }
    }

    /// Checkpoint stores `[out, in]`; burn's `Linear` holds `[in, out]`
    fn linear(&self, prefix: &str, in_features: usize, out_features: usize, bias: bool) -> Result<Linear<B>, DiffusionLoadError> {
        let weight: Tensor<B, 2> =
            self.source
                .load_tensor(&format!("{prefix}.weight"), [out_features, in_features], self.device)?;

        let mut linear = LinearConfig::new(in_features, out_features)
            .with_bias(bias)
            .init(self.device);
        linear.weight = Param::from_tensor(weight.transpose());
        if bias {
            let bias: Tensor<B, 1> = self.source.load_tensor(&format!("{prefix}.bias"), [out_features], self.device)?;
            linear.bias = Some(Param::from_tensor(bias));
        }

        Ok(linear)
    }

    /// Square kernel, padding `kernel / 2`, with bias
    fn conv2d(
        &self,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
    ) -> Result<Conv2d<B>, DiffusionLoadError> {
        let weight: Tensor<B, 4> = self.source.load_tensor(
            &format!("{prefix}.weight"),
            [out_channels, in_channels, kernel, kernel],
            self.device,
        )?;
        let bias: Tensor<B, 1> = self.source.load_tensor(&format!("{prefix}.bias"), [out_channels], self.device)?;

        let padding = kernel / 2;
        let mut conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init(self.device);
        conv.weight = Param::from_tensor(weight);
        conv.bias = Some(Param::from_tensor(bias));

        Ok(conv)
    }

    fn group_norm(&self, prefix: &str, channels: usize) -> Result<GroupNorm<B>, DiffusionLoadError> {
        let (weight, bias) = self.affine(prefix, channels)?;
        Ok(GroupNorm::from_weight_bias(self.norm_groups, weight, bias))
    }

    fn layer_norm(&self, prefix: &str, size: usize) -> Result<LayerNorm<B>, DiffusionLoadError> {
        let (weight, bias) = self.affine(prefix, size)?;
        Ok(LayerNorm::from_weight_bias(weight, bias))
    }

    fn affine(&self, prefix: &str, size: usize) -> Result<(Tensor<B, 1>, Tensor<B, 1>), DiffusionLoadError> {
        let weight = self.source.load_tensor(&format!("{prefix}.weight"), [size], self.device)?;
        let bias = self.source.load_tensor(&format!("{prefix}.bias"), [size], self.device)?;
        Ok((weight, bias))
    }
}
