//! Core Building Blocks for the Latent Diffusion U-Net
//!
//! Primitives shared by the denoising network and its weight loader.
//!
//! # Modules
//!
//! ## Normalization Layers
//!
//! - [`groupnorm`] - Group normalization (convolutional path)
//! - [`layernorm`] - Layer normalization (transformer pre-norms)
//!
//! ## Activations and Feed-Forward
//!
//! - [`silu`] - SiLU/Swish activation
//! - [`glu`] - GEGLU with the tanh GELU approximation
//!
//! ## Attention
//!
//! - [`attention`] - Scaled dot-product attention and head reshaping
//!
//! # Example
//!
//! ```ignore
//! use burn_ldm_core::glu::GegluConfig;
//!
//! let ff = GegluConfig::new(320, 1280).init::<Backend>(&device);
//! let hidden = ff.forward(tokens); // [b, seq, 1280]
//! ```

pub mod attention;
pub mod glu;
pub mod groupnorm;
pub mod layernorm;
pub mod silu;
