//! Network configuration and channel/head resolution
//!
//! Configuration files use the flat JSON layout of the original checkpoints'
//! model configs, including the `-1` sentinel that selects between a fixed
//! head count and a fixed head dimension. The sentinel is parsed into
//! [`HeadLayout`] at load time and never seen past this module.

use std::path::Path;

use serde::{Deserialize, Serialize};

use burn_ldm_core::groupnorm::DEFAULT_GROUPS;

use crate::error::ConfigError;

/// Sentinel marking the unused head option in config files
const UNSET: i64 = -1;

/// How attention heads are derived at each resolution level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadLayout {
    /// Fixed number of heads; head dimension is `channels / count`
    Count(usize),
    /// Fixed head dimension; head count is `channels / dim`
    Dim(usize),
}

impl HeadLayout {
    /// Parses the `num_heads` / `head_dim` pair, exactly one of which must be -1
    pub fn from_sentinel(num_heads: i64, head_dim: i64) -> Result<Self, ConfigError> {
        match (num_heads, head_dim) {
            (UNSET, UNSET) => Err(ConfigError::NoHeadLayout),
            (UNSET, dim) => Ok(Self::Dim(positive("head_dim", dim)?)),
            (count, UNSET) => Ok(Self::Count(positive("num_heads", count)?)),
            (num_heads, head_dim) => Err(ConfigError::AmbiguousHeadLayout { num_heads, head_dim }),
        }
    }

    /// Inverse of [`HeadLayout::from_sentinel`]
    pub fn to_sentinel(self) -> (i64, i64) {
        match self {
            Self::Count(count) => (count as i64, UNSET),
            Self::Dim(dim) => (UNSET, dim as i64),
        }
    }

    /// Splits `channels` into `(num_heads, head_dim)` for one level
    pub fn split(self, level: usize, channels: usize) -> Result<(usize, usize), ConfigError> {
        let (divisor, what) = match self {
            Self::Count(count) => (count, "num_heads"),
            Self::Dim(dim) => (dim, "head_dim"),
        };
        if divisor == 0 {
            return Err(ConfigError::ZeroValue { field: what });
        }
        if channels % divisor != 0 {
            return Err(ConfigError::NotDivisible {
                level,
                channels,
                what,
                divisor,
            });
        }
        Ok(match self {
            Self::Count(count) => (count, channels / count),
            Self::Dim(dim) => (channels / dim, dim),
        })
    }
}

fn positive(field: &'static str, value: i64) -> Result<usize, ConfigError> {
    if value > 0 {
        Ok(value as usize)
    } else {
        Err(ConfigError::InvalidHeadValue { field, value })
    }
}

/// Where pretrained parameters come from
///
/// Fetching is the caller's concern; the loader opens local origins only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSource {
    /// Path or URL of the parameter file
    pub origin: String,
    /// Expected content hash of the file, as published with the checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
}

/// Resolved widths of one resolution level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSpec {
    /// Feature channels at this level
    pub channels: usize,
    /// Attention heads used by this level's spatial transformers
    pub num_heads: usize,
    /// Width of each head
    pub head_dim: usize,
}

/// Denoising network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDiffusionConfig", into = "RawDiffusionConfig")]
pub struct DiffusionConfig {
    /// Context sequence length (text tokens)
    pub max_length: usize,
    /// Context feature width (text encoder hidden size)
    pub context_length: usize,
    /// Base channel count
    pub model_channels: usize,
    /// Channel multiplier per resolution level, finest first
    pub channel_mult: Vec<usize>,
    /// Attention head layout
    pub heads: HeadLayout,
    /// Use fully-connected instead of 1x1 convolution projections in the
    /// spatial transformers (`f_c` in config files)
    pub dense_projection: bool,
    /// Residual blocks per level on the way down (the way up uses one more)
    pub num_res_blocks: usize,
    /// Latent channel count (input and output)
    pub latent_channels: usize,
    /// Group count of every group normalization
    pub norm_groups: usize,
    /// Width of the raw timestep vector
    pub time_embed_input_dim: usize,
    /// Width of the projected timestep embedding
    pub time_embed_dim: usize,
    /// Optional pretrained parameter source
    pub weights: Option<WeightSource>,
}

impl DiffusionConfig {
    /// Stable Diffusion 1.x: 8 heads, CLIP ViT-L context, convolution projections
    pub fn sd_v1() -> Self {
        Self {
            max_length: 77,
            context_length: 768,
            model_channels: 320,
            channel_mult: vec![1, 2, 4, 4],
            heads: HeadLayout::Count(8),
            dense_projection: false,
            num_res_blocks: 2,
            latent_channels: 4,
            norm_groups: DEFAULT_GROUPS,
            time_embed_input_dim: 320,
            time_embed_dim: 1280,
            weights: None,
        }
    }

    /// Stable Diffusion 2.x: 64-wide heads, OpenCLIP context, dense projections
    pub fn sd_v2() -> Self {
        Self {
            context_length: 1024,
            heads: HeadLayout::Dim(64),
            dense_projection: true,
            ..Self::sd_v1()
        }
    }

    /// Parses a JSON config
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Sets the pretrained parameter source
    pub fn with_weights(mut self, weights: WeightSource) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Number of resolution levels
    pub fn num_levels(&self) -> usize {
        self.channel_mult.len()
    }

    /// Resolves per-level channel and head widths
    ///
    /// Fails if any width is zero or overflows, or if a level's channel count is not
    /// divisible by the head layout or the normalization group count.
    pub fn resolve(&self) -> Result<Vec<LevelSpec>, ConfigError> {
        for (field, value) in [
            ("max_length", self.max_length),
            ("context_length", self.context_length),
            ("model_channels", self.model_channels),
            ("num_res_blocks", self.num_res_blocks),
            ("latent_channels", self.latent_channels),
            ("norm_groups", self.norm_groups),
            ("time_embed_input_dim", self.time_embed_input_dim),
            ("time_embed_dim", self.time_embed_dim),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue { field });
            }
        }
        if self.channel_mult.is_empty() {
            return Err(ConfigError::EmptyChannelMult);
        }

        self.channel_mult
            .iter()
            .enumerate()
            .map(|(level, &mult)| {
                if mult == 0 {
                    return Err(ConfigError::ZeroValue {
                        field: "channel_mult",
                    });
                }
                let channels = self
                    .model_channels
                    .checked_mul(mult)
                    .ok_or(ConfigError::ChannelOverflow { level })?;
                if channels % self.norm_groups != 0 {
                    return Err(ConfigError::NotDivisible {
                        level,
                        channels,
                        what: "norm_groups",
                        divisor: self.norm_groups,
                    });
                }
                let (num_heads, head_dim) = self.heads.split(level, channels)?;
                Ok(LevelSpec {
                    channels,
                    num_heads,
                    head_dim,
                })
            })
            .collect()
    }
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self::sd_v1()
    }
}

fn default_num_res_blocks() -> usize {
    2
}

fn default_latent_channels() -> usize {
    4
}

fn default_norm_groups() -> usize {
    DEFAULT_GROUPS
}

fn default_time_embed_input_dim() -> usize {
    320
}

fn default_time_embed_dim() -> usize {
    1280
}

fn unset() -> i64 {
    UNSET
}

/// On-disk layout, sentinel included
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDiffusionConfig {
    max_length: usize,
    context_length: usize,
    model_channels: usize,
    channel_mult: Vec<usize>,
    #[serde(default = "unset")]
    num_heads: i64,
    #[serde(default = "unset")]
    head_dim: i64,
    #[serde(default)]
    f_c: bool,
    #[serde(default = "default_num_res_blocks")]
    num_res_blocks: usize,
    #[serde(default = "default_latent_channels")]
    latent_channels: usize,
    #[serde(default = "default_norm_groups")]
    norm_groups: usize,
    #[serde(default = "default_time_embed_input_dim")]
    time_embed_input_dim: usize,
    #[serde(default = "default_time_embed_dim")]
    time_embed_dim: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    weights: Option<WeightSource>,
}

impl TryFrom<RawDiffusionConfig> for DiffusionConfig {
    type Error = ConfigError;

    fn try_from(raw: RawDiffusionConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            max_length: raw.max_length,
            context_length: raw.context_length,
            model_channels: raw.model_channels,
            channel_mult: raw.channel_mult,
            heads: HeadLayout::from_sentinel(raw.num_heads, raw.head_dim)?,
            dense_projection: raw.f_c,
            num_res_blocks: raw.num_res_blocks,
            latent_channels: raw.latent_channels,
            norm_groups: raw.norm_groups,
            time_embed_input_dim: raw.time_embed_input_dim,
            time_embed_dim: raw.time_embed_dim,
            weights: raw.weights,
        })
    }
}

impl From<DiffusionConfig> for RawDiffusionConfig {
    fn from(config: DiffusionConfig) -> Self {
        let (num_heads, head_dim) = config.heads.to_sentinel();
        Self {
            max_length: config.max_length,
            context_length: config.context_length,
            model_channels: config.model_channels,
            channel_mult: config.channel_mult,
            num_heads,
            head_dim,
            f_c: config.dense_projection,
            num_res_blocks: config.num_res_blocks,
            latent_channels: config.latent_channels,
            norm_groups: config.norm_groups,
            time_embed_input_dim: config.time_embed_input_dim,
            time_embed_dim: config.time_embed_dim,
            weights: config.weights,
        }
    }
}
