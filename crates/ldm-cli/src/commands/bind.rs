//! Bind command

use std::error::Error;

use candle_core::Device;
use ldm_core::{unbound_parameters, BindReport, Checkpoint};

use super::{assemble, binder, format_size, load_checkpoint};
use crate::config::RunConfig;

pub fn run(config: &RunConfig, quiet: bool, show_unbound: bool) -> Result<(), Box<dyn Error>> {
    let path = config
        .checkpoint_path
        .as_ref()
        .ok_or("no checkpoint given (use --checkpoint or checkpoint_path)")?;

    let checkpoint = load_checkpoint(config, path, &Device::Cpu)?;
    println!(
        "Checkpoint: {} ({} entries, {}{})",
        path.display(),
        checkpoint.len(),
        format_size(checkpoint.size_bytes()),
        if checkpoint.is_header_only() { ", header only" } else { "" }
    );

    let mut model = assemble(config)?;
    println!("Components: {}", model.components());
    println!();

    let report = match binder(config).bind(&mut model, &checkpoint) {
        Ok(report) => report,
        Err(failure) => {
            if !quiet {
                print_records(&failure.report, &checkpoint);
            }
            print_summary(&failure.report);
            println!();
            println!("✗ {}", failure.error);
            return Err(failure.into());
        }
    };

    if !quiet {
        print_records(&report, &checkpoint);
    }
    print_summary(&report);

    let unbound = unbound_parameters(&model);
    if !checkpoint.is_header_only() {
        println!("  Unbound:  {}", unbound.len());
        if show_unbound {
            for path in &unbound {
                println!("    - {}", path);
            }
        }
    }

    Ok(())
}

/// One line per entry: checkpoint shape, destination shape, key
fn print_records(report: &BindReport, checkpoint: &Checkpoint) {
    for (record, entry) in report.records().iter().zip(checkpoint.iter()) {
        let destination = match &record.destination {
            Some(shape) => format!("{:?}", shape.dims()),
            None => "-".to_string(),
        };
        println!(
            "{:<20} {:<20} {}",
            format!("{:?}", entry.shape().dims()),
            destination,
            record.key
        );
    }
    if !report.records().is_empty() {
        println!();
    }
}

fn print_summary(report: &BindReport) {
    println!("Summary:");
    println!("  Bound:    {}", report.bound());
    println!("  Assigned: {}", report.assigned());
    println!("  Skipped:  {}", report.skipped());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{tiny_checkpoint, tiny_config};
    use ldm_core::BindFailure;
    use ldm_models::Components;
    use tempfile::TempDir;

    #[test]
    fn test_bind_full_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = tiny_checkpoint(&dir, Components::all());
        assert!(run(&tiny_config(Some(path)), true, false).is_ok());
    }

    #[test]
    fn test_bind_requires_checkpoint() {
        assert!(run(&tiny_config(None), true, false).is_err());
    }

    #[test]
    fn test_strict_fails_on_absent_component() {
        let dir = TempDir::new().unwrap();
        let path = tiny_checkpoint(&dir, Components::all());

        let mut config = tiny_config(Some(path.clone()));
        config.components = Components::AUTOENCODER;
        assert!(run(&config, true, false).is_ok());

        config.strict = true;
        let err = run(&config, true, false).unwrap_err();
        let failure = err.downcast_ref::<BindFailure>().unwrap();
        assert!(matches!(failure.error, ldm_core::BindError::Unbound { .. }));
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = tiny_checkpoint(&dir, Components::all());

        // v1 tree against tiny weights
        let mut config = tiny_config(Some(path));
        config.preset = crate::config::ModelPreset::V1;
        config.components = Components::TEXT_ENCODER;
        config.load_real_weights = false;

        let err = run(&config, true, false).unwrap_err();
        let failure = err.downcast_ref::<BindFailure>().unwrap();
        assert!(matches!(
            failure.error,
            ldm_core::BindError::ShapeMismatch { .. }
        ));
    }
}
