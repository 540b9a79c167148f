//! Run configuration
//!
//! Everything a command needs is carried explicitly in [`RunConfig`]. It is
//! read from a JSON file when `--config` is given, then overridden by flags.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use ldm_core::LoaderConfig;
use ldm_models::{Components, StableDiffusionConfig};
use serde::{Deserialize, Serialize};

/// Architecture sizes to assemble
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelPreset {
    /// Latent-diffusion v1 checkpoint layout
    #[default]
    V1,
    /// Small sizes for smoke tests
    Tiny,
}

/// Explicit configuration for one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Checkpoint to bind
    pub checkpoint_path: Option<PathBuf>,
    /// Copy tensor data into the tree; otherwise only names and shapes are checked
    pub load_real_weights: bool,
    /// Expected blake3 hash of the checkpoint file (hex)
    pub expected_hash: Option<String>,
    /// Fail on checkpoint keys with no destination
    pub strict: bool,
    /// Components to assemble
    pub components: Components,
    /// Architecture sizes
    pub preset: ModelPreset,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: None,
            load_real_weights: false,
            expected_hash: None,
            strict: false,
            components: Components::all(),
            preset: ModelPreset::V1,
        }
    }
}

impl RunConfig {
    /// Read a JSON configuration; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn Error>> {
        let json = fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    pub fn model_config(&self) -> StableDiffusionConfig {
        match self.preset {
            ModelPreset::V1 => StableDiffusionConfig::v1(),
            ModelPreset::Tiny => StableDiffusionConfig::tiny(),
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            header_only: !self.load_real_weights,
            expected_hash: self.expected_hash.clone(),
            ..Default::default()
        }
    }
}
