//! Load tensors from .safetensors files

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use burn::prelude::*;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Anything that can hand out named parameter tensors
///
/// Shapes are in checkpoint layout (PyTorch convention: linear weights are
/// `[out, in]`, convolution weights `[out, in, kh, kw]`). Implementations
/// must reject tensors whose shape differs from `expected`.
pub trait TensorSource {
    /// Whether a tensor with this name exists
    fn contains(&self, name: &str) -> bool;

    /// Loads a tensor as f32, checking its shape
    fn load_tensor<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError>;
}

#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => mmap,
            Self::Owned(bytes) => bytes,
        }
    }
}

#[derive(Debug)]
struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// A parsed safetensors file, memory-mapped or held in memory
#[derive(Debug)]
pub struct SafeTensorFile {
    backing: Backing,
    tensors: HashMap<String, TensorInfo>,
}

impl SafeTensorFile {
    /// Memory-maps and indexes a safetensors file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and owned by the returned value
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Self::index(Backing::Mapped(mmap))
    }

    /// Indexes safetensors data already in memory
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, LoadError> {
        Self::index(Backing::Owned(bytes))
    }

    fn index(backing: Backing) -> Result<Self, LoadError> {
        let bytes = backing.bytes();
        let base = bytes.as_ptr() as usize;
        let st = SafeTensors::deserialize(bytes)?;

        let mut tensors = HashMap::new();
        for (name, view) in st.tensors() {
            let start = view.data().as_ptr() as usize - base;
            tensors.insert(
                name.to_string(),
                TensorInfo {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                    start,
                    end: start + view.data().len(),
                },
            );
        }

        Ok(Self { backing, tensors })
    }

    /// Lowercase hex SHA-256 of the raw file bytes
    pub fn sha256_hex(&self) -> String {
        format!("{:x}", Sha256::digest(self.backing.bytes()))
    }

    /// Number of tensors in the file
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the file holds no tensors
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Get tensor shape
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// Load a tensor as f32, converting from fp16/bf16 if needed
    pub fn load_f32<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        let shape: [usize; D] = info.shape.clone().try_into().map_err(|actual| LoadError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![0; D],
            actual,
        })?;

        let data = &self.backing.bytes()[info.start..info.end];

        // mmap data may be unaligned, so decode from byte chunks
        let floats: Vec<f32> = match info.dtype {
            Dtype::F32 => data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
            Dtype::F16 => data
                .chunks_exact(2)
                .map(|chunk| f16::from_bits(u16::from_le_bytes([chunk[0], chunk[1]])).to_f32())
                .collect(),
            Dtype::BF16 => data
                .chunks_exact(2)
                .map(|chunk| bf16::from_bits(u16::from_le_bytes([chunk[0], chunk[1]])).to_f32())
                .collect(),
            dtype => {
                return Err(LoadError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype,
                })
            }
        };

        Ok(Tensor::from_data(TensorData::new(floats, shape), device))
    }
}

impl TensorSource for SafeTensorFile {
    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn load_tensor<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let actual = self
            .shape(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        if actual != expected.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            });
        }

        self.load_f32::<B, D>(name, device)
    }
}
