//! Utility modules shared by the loader, merger and saver
//!
//! - Raw tensor buffers and dtype mapping
//! - SafeTensors read/write helpers
//! - Size parsing for shard limits

pub mod tensor;

pub use tensor::{parse_size, read_safetensors, write_safetensors, RawTensor};
