//! Latent Diffusion U-Net
//!
//! The conditional denoising network of a latent image-diffusion model:
//! given a noisy latent, a timestep vector and a text-conditioning sequence,
//! it predicts the noise in the latent.
//!
//! # Model
//!
//! - [`DiffusionModel`] - Encoder / middle / decoder with skip connections
//! - [`DiffusionConfig`] - Widths, head layout and projection style
//! - [`Topology`] - Static block plan shared with the weight loader
//!
//! # Building Blocks
//!
//! - [`ResBlock`] - Residual convolution block with timestep conditioning
//! - [`SpatialTransformer`] - Cross-attention from image positions to text
//! - [`TransformerBlock`] - Self-attention, cross-attention, GEGLU FFN
//! - [`CrossAttention`] - Multi-head scaled dot-product attention
//! - [`Downsample`], [`Upsample`] - Resolution scaling
//!
//! # Example
//!
//! ```ignore
//! use burn_ldm_unet::{DiffusionConfig, DiffusionModel};
//!
//! let config = DiffusionConfig::sd_v1();
//! let unet = DiffusionModel::<Backend>::new(&config, &device)?;
//!
//! // latent: [b, h/8, w/8, 4], timestep: [b, 320], context: [b, 77, 768]
//! let noise_pred = unet.forward(latent, timestep, context);
//! ```

pub mod blocks;
pub mod config;
pub mod error;
pub mod skip;
pub mod topology;
pub mod unet;

pub use blocks::{
    timestep_embedding, upsample_nearest_2x, ChannelProjection, CrossAttention, Downsample,
    FeedForward, ResBlock, SpatialTransformer, TimestepProjection, TransformerBlock, Upsample,
};
pub use config::{DiffusionConfig, HeadLayout, LevelSpec, WeightSource};
pub use error::{ConfigError, DiffusionError, ShapeError};
pub use skip::SkipStack;
pub use topology::{AttentionPlan, DownLevelPlan, MiddlePlan, StepPlan, Topology, UpLevelPlan};
pub use unet::{DiffusionModel, DownLevel, MidBlock, Step, StepContext, UpLevel};
