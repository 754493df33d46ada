//! Latent diffusion U-Net
//!
//! The denoising backbone: timestep projection, encoder with skip
//! connections, middle block, decoder, exit projection. The public interface
//! is channels-last (`[batch, height, width, channels]`); the network runs
//! channels-first internally.

use burn::nn::conv::Conv2d;
use burn::prelude::*;

use burn_ldm_core::groupnorm::GroupNorm;
use burn_ldm_core::silu::silu;

use crate::blocks::{conv3x3, Downsample, ResBlock, SpatialTransformer, TimestepProjection, Upsample};
use crate::config::DiffusionConfig;
use crate::error::{ConfigError, DiffusionError, ShapeError};
use crate::skip::SkipStack;
use crate::topology::{AttentionPlan, StepPlan, Topology};

/// Shared construction parameters of every step
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    /// Width of the projected timestep embedding
    pub time_embed_dim: usize,
    /// Width of the cross-attention context
    pub context_dim: usize,
    /// Group count of every group normalization
    pub norm_groups: usize,
    /// Fully-connected instead of 1x1 convolution transformer projections
    pub dense_projection: bool,
}

impl StepContext {
    /// Extracts the step parameters from a config
    pub fn from_config(config: &DiffusionConfig) -> Self {
        Self {
            time_embed_dim: config.time_embed_dim,
            context_dim: config.context_length,
            norm_groups: config.norm_groups,
            dense_projection: config.dense_projection,
        }
    }

    fn spatial_transformer<B: Backend>(
        &self,
        channels: usize,
        attention: AttentionPlan,
        device: &B::Device,
    ) -> SpatialTransformer<B> {
        SpatialTransformer::new(
            channels,
            attention.num_heads,
            attention.head_dim,
            self.context_dim,
            self.norm_groups,
            self.dense_projection,
            device,
        )
    }
}

/// ResBlock followed by an optional spatial transformer
#[derive(Module, Debug)]
pub struct Step<B: Backend> {
    /// Residual block
    pub res: ResBlock<B>,
    /// Attention block (None at the coarsest level)
    pub attn: Option<SpatialTransformer<B>>,
}

impl<B: Backend> Step<B> {
    /// Builds a step from its plan
    pub fn new(plan: &StepPlan, ctx: &StepContext, device: &B::Device) -> Self {
        Self {
            res: ResBlock::new(
                plan.in_channels,
                plan.out_channels,
                ctx.time_embed_dim,
                ctx.norm_groups,
                device,
            ),
            attn: plan
                .attention
                .map(|attention| ctx.spatial_transformer(plan.out_channels, attention, device)),
        }
    }

    /// Runs the ResBlock then the attention block, if any
    pub fn forward(&self, x: Tensor<B, 4>, t_emb: Tensor<B, 2>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let h = self.res.forward(x, t_emb);
        match &self.attn {
            Some(attn) => attn.forward(h, context),
            None => h,
        }
    }
}

/// Encoder level: residual steps and an optional downsample
#[derive(Module, Debug)]
pub struct DownLevel<B: Backend> {
    /// Residual steps
    pub steps: Vec<Step<B>>,
    /// Strided convolution closing the level (None at the coarsest level)
    pub downsample: Option<Downsample<B>>,
}

/// Decoder level: residual steps consuming skips and an optional upsample
#[derive(Module, Debug)]
pub struct UpLevel<B: Backend> {
    /// Residual steps, each preceded by a skip concatenation
    pub steps: Vec<Step<B>>,
    /// Upsample closing the level (None at the finest level)
    pub upsample: Option<Upsample<B>>,
}

/// Mid block: ResBlock + Attention + ResBlock
#[derive(Module, Debug)]
pub struct MidBlock<B: Backend> {
    /// First residual block
    pub res1: ResBlock<B>,
    /// Attention block
    pub attn: SpatialTransformer<B>,
    /// Second residual block
    pub res2: ResBlock<B>,
}

impl<B: Backend> MidBlock<B> {
    /// Forward pass through the mid block
    pub fn forward(&self, x: Tensor<B, 4>, t_emb: Tensor<B, 2>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let h = self.res1.forward(x, t_emb.clone());
        let h = self.attn.forward(h, context);
        self.res2.forward(h, t_emb)
    }
}

/// Conditional denoising U-Net
#[derive(Module, Debug)]
pub struct DiffusionModel<B: Backend> {
    /// Timestep embedding projection
    pub time_embed: TimestepProjection<B>,
    /// Input convolution
    pub conv_in: Conv2d<B>,
    /// Encoder levels, finest first
    pub down_levels: Vec<DownLevel<B>>,
    /// Middle block
    pub mid_block: MidBlock<B>,
    /// Decoder levels, coarsest first
    pub up_levels: Vec<UpLevel<B>>,
    /// Output group normalization
    pub norm_out: GroupNorm<B>,
    /// Output convolution
    pub conv_out: Conv2d<B>,
    /// Latent channel count
    pub latent_channels: usize,
    /// Width of the raw timestep vector
    pub time_embed_input_dim: usize,
    /// Context sequence length
    pub max_length: usize,
    /// Context feature width
    pub context_length: usize,
}

impl<B: Backend> DiffusionModel<B> {
    /// Creates a randomly initialized network
    ///
    /// Fails if the configuration cannot be resolved; nothing is allocated
    /// in that case.
    pub fn new(config: &DiffusionConfig, device: &B::Device) -> Result<Self, ConfigError> {
        let topology = Topology::new(config)?;
        Ok(Self::from_topology(config, &topology, device))
    }

    /// Creates a randomly initialized network from an already planned topology
    pub fn from_topology(config: &DiffusionConfig, topology: &Topology, device: &B::Device) -> Self {
        let ctx = StepContext::from_config(config);

        for (level, spec) in topology.levels.iter().enumerate() {
            tracing::debug!(
                level,
                channels = spec.channels,
                num_heads = spec.num_heads,
                head_dim = spec.head_dim,
                "building level"
            );
        }

        let down_levels = topology
            .down
            .iter()
            .map(|plan| DownLevel {
                steps: plan.steps.iter().map(|step| Step::new(step, &ctx, device)).collect(),
                downsample: plan.downsample.map(|channels| Downsample::new(channels, device)),
            })
            .collect();

        let middle = &topology.middle;
        let mid_block = MidBlock {
            res1: ResBlock::new(middle.channels, middle.channels, ctx.time_embed_dim, ctx.norm_groups, device),
            attn: ctx.spatial_transformer(middle.channels, middle.attention, device),
            res2: ResBlock::new(middle.channels, middle.channels, ctx.time_embed_dim, ctx.norm_groups, device),
        };

        let up_levels = topology
            .up
            .iter()
            .map(|plan| UpLevel {
                steps: plan.steps.iter().map(|step| Step::new(step, &ctx, device)).collect(),
                upsample: plan.upsample.map(|channels| Upsample::new(channels, device)),
            })
            .collect();

        Self {
            time_embed: TimestepProjection::new(config.time_embed_input_dim, config.time_embed_dim, device),
            conv_in: conv3x3(topology.latent_channels, topology.conv_in_channels, device),
            down_levels,
            mid_block,
            up_levels,
            norm_out: GroupNorm::new(config.norm_groups, topology.out_channels, device),
            conv_out: conv3x3(topology.out_channels, topology.latent_channels, device),
            latent_channels: config.latent_channels,
            time_embed_input_dim: config.time_embed_input_dim,
            max_length: config.max_length,
            context_length: config.context_length,
        }
    }

    /// Spatial reduction between the latent and the coarsest level
    pub fn spatial_factor(&self) -> usize {
        1 << self.down_levels.iter().filter(|level| level.downsample.is_some()).count()
    }

    /// Predicts noise for a latent
    ///
    /// # Arguments
    /// * `latent` - Noisy latent `[batch, height, width, latent_channels]`
    /// * `timestep` - Raw timestep vector `[batch, time_embed_input_dim]`
    /// * `context` - Conditioning sequence `[batch, max_length, context_length]`
    ///
    /// # Returns
    /// Predicted noise with the latent's shape
    ///
    /// Shapes are not validated up front; a mismatch panics in the first
    /// primitive whose contract it violates. Use [`Self::try_forward`] to
    /// validate first.
    pub fn forward(&self, latent: Tensor<B, 4>, timestep: Tensor<B, 2>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let t_emb = self.time_embed.forward(timestep);

        let x = latent.permute([0, 3, 1, 2]);
        let (h, skips) = self.encode(x, t_emb.clone(), context.clone());
        let h = self.mid_block.forward(h, t_emb.clone(), context.clone());
        let h = self.decode(h, skips, t_emb, context);

        let h = self.conv_out.forward(silu(self.norm_out.forward(h)));
        h.permute([0, 2, 3, 1])
    }

    /// Validates input shapes, then runs [`Self::forward`]
    pub fn try_forward(
        &self,
        latent: Tensor<B, 4>,
        timestep: Tensor<B, 2>,
        context: Tensor<B, 3>,
    ) -> Result<Tensor<B, 4>, DiffusionError> {
        self.check_inputs(&latent, &timestep, &context)?;
        Ok(self.forward(latent, timestep, context))
    }

    /// Checks input shapes against the configured contract
    pub fn check_inputs(
        &self,
        latent: &Tensor<B, 4>,
        timestep: &Tensor<B, 2>,
        context: &Tensor<B, 3>,
    ) -> Result<(), ShapeError> {
        let [batch, height, width, channels] = latent.dims();
        let factor = self.spatial_factor();
        if channels != self.latent_channels || height % factor != 0 || width % factor != 0 || height == 0 || width == 0 {
            return Err(ShapeError {
                input: "latent",
                expected: format!(
                    "[batch, h, w, {}] with h and w non-zero multiples of {}",
                    self.latent_channels, factor
                ),
                actual: latent.dims().to_vec(),
            });
        }

        if timestep.dims() != [batch, self.time_embed_input_dim] {
            return Err(ShapeError {
                input: "timestep",
                expected: format!("[{}, {}]", batch, self.time_embed_input_dim),
                actual: timestep.dims().to_vec(),
            });
        }

        if context.dims() != [batch, self.max_length, self.context_length] {
            return Err(ShapeError {
                input: "context",
                expected: format!("[{}, {}, {}]", batch, self.max_length, self.context_length),
                actual: context.dims().to_vec(),
            });
        }

        Ok(())
    }

    /// Encoder pass over a channels-first input
    ///
    /// Returns the coarsest activation and the skip stack the decoder consumes.
    pub fn encode(
        &self,
        x: Tensor<B, 4>,
        t_emb: Tensor<B, 2>,
        context: Tensor<B, 3>,
    ) -> (Tensor<B, 4>, SkipStack<Tensor<B, 4>>) {
        let mut skips = SkipStack::with_capacity(self.skip_count());

        let mut h = self.conv_in.forward(x);
        skips.push(h.clone());

        for level in &self.down_levels {
            for step in &level.steps {
                h = step.forward(h, t_emb.clone(), context.clone());
                skips.push(h.clone());
            }
            if let Some(downsample) = &level.downsample {
                h = downsample.forward(h);
                skips.push(h.clone());
            }
        }

        (h, skips)
    }

    /// Decoder pass, consuming every skip produced by [`Self::encode`]
    ///
    /// # Panics
    ///
    /// Panics if the stack runs out early or is not empty at the end.
    pub fn decode(
        &self,
        x: Tensor<B, 4>,
        mut skips: SkipStack<Tensor<B, 4>>,
        t_emb: Tensor<B, 2>,
        context: Tensor<B, 3>,
    ) -> Tensor<B, 4> {
        let mut h = x;

        for level in &self.up_levels {
            for step in &level.steps {
                let skip = skips.pop();
                h = Tensor::cat(vec![h, skip], 1);
                h = step.forward(h, t_emb.clone(), context.clone());
            }
            if let Some(upsample) = &level.upsample {
                h = upsample.forward(h);
            }
        }

        skips.finish();
        h
    }

    fn skip_count(&self) -> usize {
        self.up_levels.iter().map(|level| level.steps.len()).sum()
    }
}
