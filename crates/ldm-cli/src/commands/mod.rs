//! Subcommands

pub mod bind;
pub mod decode;
pub mod encode_text;
pub mod inspect;

use std::error::Error;
use std::path::Path;

use candle_core::Device;
use ldm_core::{materialize, Binder, Checkpoint, CheckpointLoader, Init};
use ldm_models::StableDiffusion;
use tracing::{info, warn};

use crate::config::RunConfig;

pub(crate) fn assemble(config: &RunConfig) -> Result<StableDiffusion, Box<dyn Error>> {
    let model = StableDiffusion::new(&config.model_config(), config.components)?;
    Ok(model)
}

pub(crate) fn load_checkpoint(
    config: &RunConfig,
    path: &Path,
    device: &Device,
) -> Result<Checkpoint, Box<dyn Error>> {
    let loader = CheckpointLoader::new(config.loader_config(), device.clone());
    Ok(loader.load(path)?)
}

pub(crate) fn binder(config: &RunConfig) -> Binder {
    Binder::new().strict(config.strict)
}

/// Assemble the model, bind the configured checkpoint (if any) and fill
/// whatever is still unbound with zeros so a forward pass can run.
pub(crate) fn prepare(
    config: &RunConfig,
    device: &Device,
) -> Result<StableDiffusion, Box<dyn Error>> {
    let mut model = assemble(config)?;

    if let Some(path) = &config.checkpoint_path {
        let checkpoint = load_checkpoint(config, path, device)?;
        let report = binder(config).bind(&mut model, &checkpoint)?;
        info!(
            bound = report.bound(),
            skipped = report.skipped(),
            "Checkpoint bound from {}",
            path.display()
        );
    }

    let filled = materialize(&mut model, Init::Zeros, device)?;
    if filled > 0 {
        warn!(filled, "Parameters without checkpoint data are zero-filled");
    }

    Ok(model)
}

/// Human-readable byte count
pub(crate) fn format_size(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ModelPreset;
    use candle_core::Tensor;
    use ldm_core::parameters;
    use ldm_models::{Components, StableDiffusionConfig};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Write a safetensors checkpoint holding every parameter of a tiny
    /// model, filled with small random values.
    pub fn tiny_checkpoint(dir: &TempDir, components: Components) -> PathBuf {
        let mut model = StableDiffusion::new(&StableDiffusionConfig::tiny(), components).unwrap();
        materialize(&mut model, Init::Normal { std: 0.05 }, &Device::Cpu).unwrap();

        let tensors: HashMap<String, Tensor> = parameters(&model)
            .into_iter()
            .filter_map(|(path, param)| param.value().map(|v| (path.to_string(), v.clone())))
            .collect();

        let path = dir.path().join("tiny.safetensors");
        candle_core::safetensors::save(&tensors, &path).unwrap();
        path
    }

    pub fn tiny_config(checkpoint: Option<PathBuf>) -> RunConfig {
        RunConfig {
            checkpoint_path: checkpoint,
            load_real_weights: true,
            preset: ModelPreset::Tiny,
            ..Default::default()
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_prepare_without_checkpoint_fills_everything() {
        let config = tiny_config(None);
        let model = prepare(&config, &Device::Cpu).unwrap();
        assert!(ldm_core::unbound_parameters(&model).is_empty());
    }

    #[test]
    fn test_prepare_binds_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = tiny_checkpoint(&dir, Components::TEXT_ENCODER);
        let config = tiny_config(Some(path.clone()));

        let model = prepare(&config, &Device::Cpu).unwrap();

        let checkpoint = load_checkpoint(&config, &path, &Device::Cpu).unwrap();
        let entry = checkpoint
            .get("cond_stage_model.transformer.text_model.final_layer_norm.weight")
            .unwrap();
        let (_, param) = parameters(&model)
            .into_iter()
            .find(|(p, _)| {
                p.to_string() == "cond_stage_model.transformer.text_model.final_layer_norm.weight"
            })
            .unwrap();
        assert_eq!(
            param.value().unwrap().to_vec1::<f32>().unwrap(),
            entry.tensor().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}
