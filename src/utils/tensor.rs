//! Tensor buffers and safetensors helpers
//!
//! This module provides utilities for:
//! - Owned safetensors buffers that can be written back without re-encoding
//! - Dtype mapping between safetensors and candle
//! - Reading and writing safetensors files
//! - Human readable size parsing for shard limits

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::View;
use safetensors::{Dtype, SafeTensors};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::{MergeError, Result};

/// A tensor held as raw little-endian bytes, exactly as stored in a safetensors file
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
    /// Element type
    pub dtype: Dtype,
    /// Dimensions
    pub shape: Vec<usize>,
    /// Raw data
    pub data: Vec<u8>,
}

impl RawTensor {
    /// Create a tensor, checking that the buffer matches shape and dtype
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(MergeError::invalid_input(format!(
                "buffer of {} bytes does not fit {:?} tensor of shape {:?} ({} bytes)",
                data.len(),
                dtype,
                shape,
                expected
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build an F32 tensor from values
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        Self::new(Dtype::F32, shape, bytemuck::cast_slice(values).to_vec())
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the data in bytes
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Load into a candle tensor on the given device, keeping the stored dtype
    pub fn to_candle(&self, name: &str, device: &Device) -> Result<Tensor> {
        let dtype = candle_dtype(name, self.dtype)?;
        Ok(Tensor::from_raw_buffer(&self.data, dtype, &self.shape, device)?)
    }

    /// Load into a candle tensor on the given device as f32
    pub fn to_candle_f32(&self, name: &str, device: &Device) -> Result<Tensor> {
        Ok(self.to_candle(name, device)?.to_dtype(DType::F32)?)
    }

    /// Convert a candle tensor back into raw bytes of the requested dtype
    pub fn from_candle(name: &str, tensor: &Tensor, dtype: Dtype) -> Result<Self> {
        let target = candle_dtype(name, dtype)?;
        let flat = tensor.to_dtype(target)?.flatten_all()?;
        let data = match dtype {
            Dtype::F32 => bytemuck::cast_slice(&flat.to_vec1::<f32>()?).to_vec(),
            Dtype::F16 => bytemuck::cast_slice(&flat.to_vec1::<half::f16>()?).to_vec(),
            Dtype::BF16 => bytemuck::cast_slice(&flat.to_vec1::<half::bf16>()?).to_vec(),
            Dtype::F64 => bytemuck::cast_slice(&flat.to_vec1::<f64>()?).to_vec(),
            other => {
                return Err(MergeError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: format!("{:?}", other),
                })
            }
        };
        Self::new(dtype, tensor.dims().to_vec(), data)
    }

    /// Read the values as f32 (floating point dtypes only)
    pub fn to_f32_vec(&self, name: &str) -> Result<Vec<f32>> {
        let values = self
            .to_candle_f32(name, &Device::Cpu)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(values)
    }
}

impl View for &RawTensor {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Map a safetensors dtype onto the candle dtype used for arithmetic
pub fn candle_dtype(name: &str, dtype: Dtype) -> Result<DType> {
    match dtype {
        Dtype::F32 => Ok(DType::F32),
        Dtype::F16 => Ok(DType::F16),
        Dtype::BF16 => Ok(DType::BF16),
        Dtype::F64 => Ok(DType::F64),
        other => Err(MergeError::UnsupportedDtype {
            name: name.to_string(),
            dtype: format!("{:?}", other),
        }),
    }
}

/// Whether a dtype can take part in merge arithmetic
pub fn is_float(dtype: Dtype) -> bool {
    matches!(dtype, Dtype::F32 | Dtype::F16 | Dtype::BF16 | Dtype::F64)
}

/// Read every tensor of a safetensors file
pub fn read_safetensors(path: &Path) -> Result<Vec<(String, RawTensor)>> {
    let file = std::fs::File::open(path)?;
    // SAFETY: the mapping is read-only and dropped before this function returns.
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let st = SafeTensors::deserialize(&mmap)?;

    let mut tensors = Vec::new();
    for (name, view) in st.tensors() {
        let tensor = RawTensor::new(view.dtype(), view.shape().to_vec(), view.data().to_vec())?;
        tensors.push((name, tensor));
    }
    debug!("Read {} tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}

/// Write tensors to a safetensors file
pub fn write_safetensors<'a, I>(
    path: &Path,
    tensors: I,
    metadata: Option<HashMap<String, String>>,
) -> Result<()>
where
    I: IntoIterator<Item = (&'a String, &'a RawTensor)>,
{
    safetensors::serialize_to_file(tensors, &metadata, path)?;
    Ok(())
}

/// Parse a shard size such as `5GB`, `500MiB` or `1048576` into bytes
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| MergeError::invalid_input(format!("invalid size: '{}'", input)))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        "KIB" => 1 << 10,
        "MIB" => 1 << 20,
        "GIB" => 1 << 30,
        "TIB" => 1 << 40,
        other => {
            return Err(MergeError::invalid_input(format!(
                "unknown size unit '{}' in '{}'",
                other, input
            )))
        }
    };

    let bytes = (value * multiplier as f64).round() as u64;
    if bytes == 0 {
        return Err(MergeError::invalid_input(format!(
            "size must be greater than zero: '{}'",
            input
        )));
    }
    Ok(bytes)
}
