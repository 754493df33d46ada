//! Error types for configuration and forward-pass validation

use thiserror::Error;

/// Invalid network configuration, reported at construction time
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("channel_mult must list at least one resolution level")]
    EmptyChannelMult,

    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },

    #[error("either num_heads or head_dim must be set (the other one -1)")]
    NoHeadLayout,

    #[error("num_heads ({num_heads}) and head_dim ({head_dim}) are both set; set the unused one to -1")]
    AmbiguousHeadLayout { num_heads: i64, head_dim: i64 },

    #[error("{field} has invalid value {value}; expected a positive integer or -1")]
    InvalidHeadValue { field: &'static str, value: i64 },

    #[error("level {level}: {channels} channels are not divisible by {what} {divisor}")]
    NotDivisible {
        level: usize,
        channels: usize,
        what: &'static str,
        divisor: usize,
    },

    #[error("level {level}: channel count overflows (model_channels * channel_mult)")]
    ChannelOverflow { level: usize },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An input tensor that does not match the configured contract
#[derive(Error, Debug, PartialEq, Eq)]
#[error("{input}: expected {expected}, got {actual:?}")]
pub struct ShapeError {
    /// Which input was rejected
    pub input: &'static str,
    /// Human-readable description of the expected shape
    pub expected: String,
    /// Actual dimensions of the tensor
    pub actual: Vec<usize>,
}

/// Errors surfaced by [`crate::DiffusionModel`]
#[derive(Error, Debug)]
pub enum DiffusionError {
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::NotDivisible {
            level: 2,
            channels: 1280,
            what: "head_dim",
            divisor: 96,
        };
        let msg = err.to_string();
        assert!(msg.contains("1280"));
        assert!(msg.contains("head_dim"));

        let err = DiffusionError::from(ShapeError {
            input: "latent",
            expected: "[b, h, w, 4]".to_string(),
            actual: vec![1, 64, 64, 3],
        });
        assert!(err.to_string().contains("latent"));
    }
}
