//! Parameter slot enumeration
//!
//! [`SlotRecorder`] is a [`TensorSource`] that answers every request with
//! zeros and remembers what was asked for. Running the weight loader against
//! it lists every named parameter of a configuration, in load order, with
//! its checkpoint shape.

use std::cell::RefCell;

use burn::prelude::*;
use burn_ldm_unet::DiffusionConfig;

use crate::diffusion_loader::{DiffusionLoadError, DiffusionWeightLoader};
use crate::loader::{LoadError, TensorSource};

/// One named parameter and its checkpoint-layout shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSlot {
    /// Full checkpoint name, prefix included
    pub name: String,
    /// Shape in checkpoint layout (linear weights are `[out, in]`)
    pub shape: Vec<usize>,
}

/// Records requested tensors and returns zeros
#[derive(Debug, Default)]
pub struct SlotRecorder {
    slots: RefCell<Vec<ParamSlot>>,
}

impl SlotRecorder {
    /// Creates an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots requested so far, in request order
    pub fn slots(&self) -> Vec<ParamSlot> {
        self.slots.borrow().clone()
    }

    /// Names requested so far
    pub fn names(&self) -> Vec<String> {
        self.slots.borrow().iter().map(|slot| slot.name.clone()).collect()
    }

    /// Total scalar count of all requested slots
    pub fn num_params(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .map(|slot| slot.shape.iter().product::<usize>())
            .sum()
    }

    /// Consumes the recorder and returns every slot in request order
    pub fn into_slots(self) -> Vec<ParamSlot> {
        self.slots.into_inner()
    }
}

impl TensorSource for SlotRecorder {
    fn contains(&self, _name: &str) -> bool {
        true
    }

    fn load_tensor<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        self.slots.borrow_mut().push(ParamSlot {
            name: name.to_string(),
            shape: expected.to_vec(),
        });
        Ok(Tensor::zeros(expected, device))
    }
}

/// Lists every parameter slot of `config` under `prefix`
pub fn parameter_slots<B: Backend>(
    config: &DiffusionConfig,
    prefix: &str,
    device: &B::Device,
) -> Result<Vec<ParamSlot>, DiffusionLoadError> {
    let recorder = SlotRecorder::new();
    DiffusionWeightLoader::with_prefix(&recorder, prefix).load::<B>(config, device)?;
    Ok(recorder.into_slots())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion_loader::DEFAULT_PREFIX;
    use burn_ldm_unet::HeadLayout;
    use burn_ndarray::NdArray;
    use std::collections::HashSet;

    type TestBackend = NdArray<f32>;

    fn small_config() -> DiffusionConfig {
        DiffusionConfig {
            max_length: 4,
            context_length: 24,
            model_channels: 32,
            channel_mult: vec![1, 2, 4],
            heads: HeadLayout::Count(2),
            num_res_blocks: 2,
            time_embed_input_dim: 32,
            time_embed_dim: 64,
            ..DiffusionConfig::sd_v1()
        }
    }

    #[test]
    fn test_slot_names_are_unique() {
        let device = Default::default();
        let slots = parameter_slots::<TestBackend>(&small_config(), DEFAULT_PREFIX, &device).unwrap();
        let unique: HashSet<&str> = slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(unique.len(), slots.len());
        assert!(slots.iter().all(|s| s.name.starts_with("model.diffusion_model.")));
    }

    #[test]
    fn test_recorded_shapes() {
        let device = Default::default();
        let recorder = SlotRecorder::new();
        DiffusionWeightLoader::with_prefix(&recorder, "")
            .load::<TestBackend>(&small_config(), &device)
            .unwrap();
        let slots = recorder.slots();
        let shape = |name: &str| slots.iter().find(|s| s.name == name).map(|s| s.shape.clone());

        assert_eq!(shape("time_embed.0.weight"), Some(vec![64, 32]));
        assert_eq!(shape("input_blocks.0.0.weight"), Some(vec![32, 4, 3, 3]));
        assert_eq!(shape("input_blocks.1.1.proj_in.weight"), Some(vec![32, 32, 1, 1]));
        assert_eq!(
            shape("input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight"),
            Some(vec![32, 24])
        );
        assert_eq!(
            shape("input_blocks.1.1.transformer_blocks.0.ff.net.0.proj.weight"),
            Some(vec![256, 32])
        );
        assert_eq!(shape("out.2.weight"), Some(vec![4, 32, 3, 3]));

        let total: usize = slots.iter().map(|s| s.shape.iter().product::<usize>()).sum();
        assert_eq!(recorder.num_params(), total);
    }

    #[test]
    fn test_sd_block_counts() {
        let device = Default::default();
        let config = DiffusionConfig {
            model_channels: 64,
            time_embed_input_dim: 64,
            time_embed_dim: 64,
            context_length: 32,
            heads: HeadLayout::Dim(32),
            ..DiffusionConfig::sd_v1()
        };
        let names: Vec<String> = parameter_slots::<TestBackend>(&config, "", &device)
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();

        let blocks = |prefix: &str| {
            names
                .iter()
                .filter_map(|n| n.strip_prefix(prefix))
                .filter_map(|rest| rest.split('.').next())
                .collect::<HashSet<_>>()
                .len()
        };
        assert_eq!(blocks("input_blocks."), 12);
        assert_eq!(blocks("output_blocks."), 12);
        assert!(names.iter().any(|n| n == "output_blocks.2.1.conv.weight"));
        assert!(names.iter().any(|n| n == "output_blocks.5.2.conv.weight"));
        assert!(names.iter().any(|n| n == "output_blocks.8.2.conv.weight"));
    }
}
