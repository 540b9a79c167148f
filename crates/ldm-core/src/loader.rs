//! Checkpoint loading from disk
//!
//! Parsing is delegated to candle: memory-mapped safetensors, and PyTorch
//! pickle archives (`.ckpt`, `.pt`, `.pth`, `.bin`). In header-only mode only
//! names, shapes and dtypes are read, which is enough to check a checkpoint
//! against a model tree without loading gigabytes of weights.

use candle_core::pickle::PthTensors;
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, Entry};

/// Largest safetensors header we accept
const MAX_HEADER_BYTES: u64 = 100 * 1024 * 1024;

/// Loader errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported checkpoint format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Checkpoint too large: {size} > {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// On-disk checkpoint formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Safetensors,
    Pickle,
}

impl CheckpointFormat {
    /// Detect the format from the file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "safetensors" => Some(Self::Safetensors),
            "ckpt" | "pt" | "pth" | "bin" => Some(Self::Pickle),
            _ => None,
        }
    }
}

/// Loader configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Read shapes and dtypes only
    pub header_only: bool,
    /// Expected blake3 hash of the file (hex)
    pub expected_hash: Option<String>,
    /// Maximum file size in bytes
    pub max_file_size: u64,
    /// Key the state dict is nested under in pickle archives
    pub pickle_key: Option<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            header_only: false,
            expected_hash: None,
            max_file_size: 16 * 1024 * 1024 * 1024, // 16GB
            pickle_key: Some("state_dict".to_string()),
        }
    }
}

impl LoaderConfig {
    /// Config that reads headers only
    pub fn header_only() -> Self {
        Self {
            header_only: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct TensorHeader {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

/// Checkpoint loader
pub struct CheckpointLoader {
    config: LoaderConfig,
    device: Device,
}

impl CheckpointLoader {
    /// Create a new loader placing tensors on `device`
    pub fn new(config: LoaderConfig, device: Device) -> Self {
        Self { config, device }
    }

    /// Load a checkpoint file
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Checkpoint, CheckpointError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }

        let format = CheckpointFormat::from_path(path)
            .ok_or_else(|| CheckpointError::UnsupportedFormat(path.to_path_buf()))?;

        let size = std::fs::metadata(path)?.len();
        if size > self.config.max_file_size {
            return Err(CheckpointError::TooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }

        if let Some(expected) = &self.config.expected_hash {
            verify_hash(path, expected)?;
        }

        let checkpoint = match (format, self.config.header_only) {
            (CheckpointFormat::Safetensors, true) => self.safetensors_header(path)?,
            (CheckpointFormat::Safetensors, false) => self.safetensors(path)?,
            (CheckpointFormat::Pickle, header_only) => self.pickle(path, header_only)?,
        };

        info!(
            path = %path.display(),
            entries = checkpoint.len(),
            header_only = self.config.header_only,
            "Loaded checkpoint"
        );

        Ok(checkpoint)
    }

    fn safetensors_header(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        read_safetensors_header(path)?
            .into_iter()
            .map(|(name, header)| {
                let dtype = parse_dtype(&header.dtype)?;
                Ok(Entry::header(name, header.shape, dtype))
            })
            .collect()
    }

    fn safetensors(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let names = read_safetensors_header(path)?;

        // The file must not change while it is mapped.
        let tensors = unsafe { MmapedSafetensors::new(path)? };

        let mut checkpoint = Checkpoint::new();
        for (name, _) in names {
            let tensor = tensors.load(&name, &self.device)?;
            debug!(key = %name, shape = ?tensor.shape(), "Loaded tensor");
            checkpoint.push(name, tensor);
        }
        Ok(checkpoint)
    }

    fn pickle(&self, path: &Path, header_only: bool) -> Result<Checkpoint, CheckpointError> {
        let tensors = self.pickle_tensors(path)?;

        // Pickle archives expose no stable entry order; sort for determinism.
        let mut names: Vec<&String> = tensors.tensor_infos().keys().collect();
        names.sort();

        let mut checkpoint = Checkpoint::new();
        for name in names {
            if header_only {
                let info = &tensors.tensor_infos()[name];
                checkpoint.push_entry(Entry::header(
                    name.clone(),
                    info.layout.shape().clone(),
                    info.dtype,
                ));
            } else if let Some(tensor) = tensors.get(name)? {
                checkpoint.push(name.clone(), tensor.to_device(&self.device)?);
            }
        }
        Ok(checkpoint)
    }

    /// Open a pickle archive, falling back to a flat state dict when the
    /// nesting key is absent
    fn pickle_tensors(&self, path: &Path) -> Result<PthTensors, CheckpointError> {
        let Some(key) = self.config.pickle_key.as_deref() else {
            return Ok(PthTensors::new(path, None)?);
        };

        match PthTensors::new(path, Some(key)) {
            Ok(tensors) => Ok(tensors),
            Err(e) => {
                debug!(key, error = %e, "Nesting key not usable, reading flat state dict");
                Ok(PthTensors::new(path, None)?)
            }
        }
    }
}

impl Default for CheckpointLoader {
    fn default() -> Self {
        Self::new(LoaderConfig::default(), Device::Cpu)
    }
}

/// Tensor headers of a safetensors file, in stored (data offset) order
fn read_safetensors_header(path: &Path) -> Result<Vec<(String, TensorHeader)>, CheckpointError> {
    let mut file = File::open(path)?;

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_HEADER_BYTES {
        return Err(CheckpointError::InvalidHeader(format!(
            "header length {} exceeds {}",
            len, MAX_HEADER_BYTES
        )));
    }

    let mut header = vec![0u8; len as usize];
    file.read_exact(&mut header)?;

    let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(&header)
        .map_err(|e| CheckpointError::InvalidHeader(e.to_string()))?;

    let mut entries = raw
        .into_iter()
        .filter(|(name, _)| name != "__metadata__")
        .map(|(name, value)| {
            serde_json::from_value::<TensorHeader>(value)
                .map(|header| (name.clone(), header))
                .map_err(|e| CheckpointError::InvalidHeader(format!("{}: {}", name, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    entries.sort_by_key(|(_, header)| header.data_offsets);
    Ok(entries)
}

fn parse_dtype(dtype: &str) -> Result<DType, CheckpointError> {
    match dtype {
        "U8" => Ok(DType::U8),
        "U32" => Ok(DType::U32),
        "I64" => Ok(DType::I64),
        "BF16" => Ok(DType::BF16),
        "F16" => Ok(DType::F16),
        "F32" => Ok(DType::F32),
        "F64" => Ok(DType::F64),
        other => Err(CheckpointError::InvalidHeader(format!(
            "unsupported dtype {}",
            other
        ))),
    }
}

/// Check the blake3 hash of a file against a hex string
fn verify_hash(path: &Path, expected: &str) -> Result<(), CheckpointError> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;

    let actual = hex_encode(hasher.finalize().as_bytes());
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(CheckpointError::HashMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Encode bytes as hex string
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
