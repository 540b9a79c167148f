//! Inspect command

use std::error::Error;

use candle_core::Device;
use ldm_core::{parameter_count, parameters, CheckpointLoader, LoaderConfig};

use super::{assemble, format_size};
use crate::config::RunConfig;

/// List tree parameters in declaration order
pub fn tree(config: &RunConfig, filter: Option<&str>) -> Result<(), Box<dyn Error>> {
    let model = assemble(config)?;

    println!("Model: {:?} preset, components {}", config.preset, model.components());
    println!("==============================");

    let mut shown = 0;
    for (path, param) in parameters(&model) {
        let path = path.to_string();
        if filter.map_or(true, |prefix| path.starts_with(prefix)) {
            println!(
                "{:<24} {:<5} {}",
                format!("{:?}", param.shape().dims()),
                format!("{:?}", param.dtype()),
                path
            );
            shown += 1;
        }
    }

    println!();
    println!("Parameters shown: {}", shown);
    println!("Total elements:   {}", parameter_count(&model));

    Ok(())
}

/// List checkpoint entries in stored order, header only
pub fn entries(config: &RunConfig, filter: Option<&str>) -> Result<(), Box<dyn Error>> {
    let path = config
        .checkpoint_path
        .as_ref()
        .ok_or("no checkpoint given (use --checkpoint or checkpoint_path)")?;

    let loader_config = LoaderConfig {
        header_only: true,
        ..config.loader_config()
    };
    let checkpoint = CheckpointLoader::new(loader_config, Device::Cpu).load(path)?;

    println!("Checkpoint: {}", path.display());
    println!("==============================");

    for entry in checkpoint.iter() {
        if filter.map_or(true, |prefix| entry.key().starts_with(prefix)) {
            println!(
                "{:<24} {:<5} {}",
                format!("{:?}", entry.shape().dims()),
                format!("{:?}", entry.dtype()),
                entry.key()
            );
        }
    }

    println!();
    println!("Entries: {}", checkpoint.len());
    println!("Size:    {}", format_size(checkpoint.size_bytes()));

    Ok(())
}
