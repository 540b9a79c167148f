//! ldm - latent-diffusion model tree and checkpoint binder
//!
//! Assembles the model tree, binds a checkpoint onto it by name path and
//! runs the text encoder or the image decoder.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ldm_models::Components;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;
mod config;

use config::{ModelPreset, RunConfig};

/// ldm - latent-diffusion model tree and checkpoint binder
#[derive(Parser)]
#[command(name = "ldm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (one line per bound key)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// JSON run configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Checkpoint file (.safetensors, .ckpt, .pt, .pth, .bin)
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,

    /// Load tensor data, not just names and shapes
    #[arg(long, global = true)]
    real: bool,

    /// Expected blake3 hash of the checkpoint
    #[arg(long, global = true)]
    hash: Option<String>,

    /// Components to assemble, comma separated (unet,autoencoder,text_encoder)
    #[arg(long, global = true)]
    components: Option<Components>,

    /// Architecture sizes
    #[arg(long, value_enum, global = true)]
    preset: Option<ModelPreset>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the parameters of the model tree or of a checkpoint
    Inspect {
        /// List checkpoint entries instead of tree parameters
        #[arg(long)]
        entries: bool,

        /// Only show paths starting with this prefix
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Bind a checkpoint onto the model tree and report the outcome
    Bind {
        /// Fail on checkpoint keys with no destination
        #[arg(long)]
        strict: bool,

        /// Only print the summary
        #[arg(short, long)]
        quiet: bool,

        /// Also list parameters no entry populated
        #[arg(long)]
        unbound: bool,
    },

    /// Run the text encoder on token ids
    EncodeText {
        /// Token ids
        #[arg(default_values_t = [1u32, 2, 3])]
        tokens: Vec<u32>,
    },

    /// Decode a latent (.npy) to a PNG image
    Decode {
        /// Latent tensor, (4, h, w) or (1, 4, h, w)
        input: PathBuf,

        /// Output image
        #[arg(short, long, default_value = "decoded.png")]
        output: PathBuf,

        /// Input is the raw encoder latent; by default it is expected to be
        /// multiplied by the latent scale factor (0.18215)
        #[arg(long)]
        unscaled: bool,
    },
}

impl Cli {
    /// File configuration, then flag overrides
    fn run_config(&self) -> Result<RunConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };

        if let Some(checkpoint) = &self.checkpoint {
            config.checkpoint_path = Some(checkpoint.clone());
        }
        if self.real {
            config.load_real_weights = true;
        }
        if let Some(hash) = &self.hash {
            config.expected_hash = Some(hash.clone());
        }
        if let Some(components) = self.components {
            config.components = components;
        }
        if let Some(preset) = self.preset {
            config.preset = preset;
        }

        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(!cli.no_color)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = cli.run_config()?;

    match cli.command {
        Commands::Inspect { entries, filter } => {
            if entries {
                commands::inspect::entries(&config, filter.as_deref())?;
            } else {
                commands::inspect::tree(&config, filter.as_deref())?;
            }
        }

        Commands::Bind {
            strict,
            quiet,
            unbound,
        } => {
            config.strict |= strict;
            commands::bind::run(&config, quiet, unbound)?;
        }

        Commands::EncodeText { tokens } => {
            commands::encode_text::run(&config, &tokens)?;
        }

        Commands::Decode {
            input,
            output,
            unscaled,
        } => {
            commands::decode::run(&config, &input, &output, unscaled)?;
        }
    }

    Ok(())
}
