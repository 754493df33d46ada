//! Weight Loading
//!
//! Builds a [`burn_ldm_unet::DiffusionModel`] from pretrained safetensors
//! checkpoints that use the CompVis parameter naming.
//!
//! # Weight Loading
//!
//! ```ignore
//! use burn_ldm_convert::{DiffusionWeightLoader, SafeTensorFile};
//!
//! let file = SafeTensorFile::open("sd-v1-5.safetensors")?;
//! let unet = DiffusionWeightLoader::new(&file).load::<Backend>(&config, &device)?;
//! ```
//!
//! # Parameter Slots
//!
//! Any [`TensorSource`] can feed the loader. [`SlotRecorder`] records the
//! `(name, shape)` of every parameter a configuration needs without reading
//! a file:
//!
//! ```ignore
//! let slots = burn_ldm_convert::parameter_slots::<Backend>(&config, "", &device)?;
//! ```

pub mod diffusion_loader;
pub mod loader;
pub mod slots;

pub use diffusion_loader::{
    load_diffusion_model, open_weight_source, DiffusionLoadError, DiffusionWeightLoader, DEFAULT_PREFIX,
};
pub use loader::{LoadError, SafeTensorFile, TensorSource};
pub use slots::{parameter_slots, ParamSlot, SlotRecorder};
