//! Static plan of the encoder/decoder graph
//!
//! A [`Topology`] lists every block of the network with its input and output
//! widths, derived from a [`DiffusionConfig`] without allocating tensors. The
//! model and the weight loader are both assembled from it, so they agree on
//! block order and skip widths by construction.
//!
//! Layout for `L` levels and `R` residual blocks per level:
//!
//! ```text
//! down   conv_in                                         push
//!        level 0..L-1:  R x (ResBlock [-> Attention])    push each
//!                       Downsample (not at L-1)          push
//! middle ResBlock -> Attention -> ResBlock
//! up     level L-1..0:  R+1 x (pop, concat, ResBlock [-> Attention])
//!                       Upsample (not at level 0)
//! ```
//!
//! Attention runs at every level except the coarsest.

use crate::config::{DiffusionConfig, LevelSpec};
use crate::error::ConfigError;
use crate::skip::SkipStack;

/// Attention shape of a spatial transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionPlan {
    /// Number of heads
    pub num_heads: usize,
    /// Width of each head
    pub head_dim: usize,
}

/// One ResBlock, optionally followed by a spatial transformer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    /// Channels entering the ResBlock (after skip concatenation on the way up)
    pub in_channels: usize,
    /// Channels leaving the step
    pub out_channels: usize,
    /// Skip channels concatenated before the ResBlock (up path only)
    pub skip_channels: Option<usize>,
    /// Spatial transformer after the ResBlock
    pub attention: Option<AttentionPlan>,
}

/// One encoder level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownLevelPlan {
    /// Level index, finest first
    pub level: usize,
    /// Residual steps
    pub steps: Vec<StepPlan>,
    /// Channels of the strided convolution closing this level
    pub downsample: Option<usize>,
}

/// One decoder level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpLevelPlan {
    /// Level index, finest first
    pub level: usize,
    /// Residual steps, each consuming one skip
    pub steps: Vec<StepPlan>,
    /// Channels of the upsample closing this level
    pub upsample: Option<usize>,
}

/// Middle block widths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiddlePlan {
    /// Channels through the whole middle block
    pub channels: usize,
    /// Attention shape of the middle transformer
    pub attention: AttentionPlan,
}

/// Full network plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Resolved per-level widths
    pub levels: Vec<LevelSpec>,
    /// Latent channel count
    pub latent_channels: usize,
    /// Channels produced by the input convolution
    pub conv_in_channels: usize,
    /// Encoder levels, finest first
    pub down: Vec<DownLevelPlan>,
    /// Middle block
    pub middle: MiddlePlan,
    /// Decoder levels, coarsest first
    pub up: Vec<UpLevelPlan>,
    /// Channels entering the exit normalization
    pub out_channels: usize,
}

impl Topology {
    /// Plans the network described by `config`
    ///
    /// Fails with the resolver's error if the configuration is invalid.
    pub fn new(config: &DiffusionConfig) -> Result<Self, ConfigError> {
        let levels = config.resolve()?;
        let last = levels.len() - 1;
        let attention_at = |level: usize| {
            (level != last).then(|| AttentionPlan {
                num_heads: levels[level].num_heads,
                head_dim: levels[level].head_dim,
            })
        };

        let mut skips = SkipStack::with_capacity(config.num_levels() * (config.num_res_blocks + 1));
        let conv_in_channels = levels[0].channels;
        skips.push(conv_in_channels);

        let mut current = conv_in_channels;
        let mut down = Vec::with_capacity(levels.len());
        for (level, spec) in levels.iter().enumerate() {
            let mut steps = Vec::with_capacity(config.num_res_blocks);
            for _ in 0..config.num_res_blocks {
                steps.push(StepPlan {
                    in_channels: current,
                    out_channels: spec.channels,
                    skip_channels: None,
                    attention: attention_at(level),
                });
                current = spec.channels;
                skips.push(current);
            }
            let downsample = (level != last).then_some(current);
            if downsample.is_some() {
                skips.push(current);
            }
            down.push(DownLevelPlan {
                level,
                steps,
                downsample,
            });
        }

        let middle = MiddlePlan {
            channels: current,
            attention: AttentionPlan {
                num_heads: levels[last].num_heads,
                head_dim: levels[last].head_dim,
            },
        };

        let mut up = Vec::with_capacity(levels.len());
        for (level, spec) in levels.iter().enumerate().rev() {
            let mut steps = Vec::with_capacity(config.num_res_blocks + 1);
            for _ in 0..=config.num_res_blocks {
                let skip = skips.pop();
                steps.push(StepPlan {
                    in_channels: current + skip,
                    out_channels: spec.channels,
                    skip_channels: Some(skip),
                    attention: attention_at(level),
                });
                current = spec.channels;
            }
            up.push(UpLevelPlan {
                level,
                steps,
                upsample: (level != 0).then_some(current),
            });
        }
        skips.finish();

        Ok(Self {
            latent_channels: config.latent_channels,
            conv_in_channels,
            down,
            middle,
            up,
            out_channels: current,
            levels,
        })
    }

    /// Skip tensors pushed by the encoder
    pub fn skip_pushes(&self) -> usize {
        1 + self
            .down
            .iter()
            .map(|level| level.steps.len() + usize::from(level.downsample.is_some()))
            .sum::<usize>()
    }

    /// Skip tensors popped by the decoder
    pub fn skip_pops(&self) -> usize {
        self.up.iter().map(|level| level.steps.len()).sum()
    }

    /// Spatial reduction between the latent and the coarsest level
    pub fn spatial_factor(&self) -> usize {
        1 << self.down.iter().filter(|level| level.downsample.is_some()).count()
    }
}
