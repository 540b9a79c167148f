//! Latent-diffusion architectures
//!
//! The three published components of latent-diffusion v1, built as
//! [`ldm_core`] model trees whose paths match the checkpoint keys:
//!
//! - [`AutoencoderKL`]: image to latent and back
//! - [`UNetModel`]: noise prediction conditioned on time and text
//! - [`ClipTextModel`]: token ids to text conditioning
//!
//! [`StableDiffusion`] assembles any subset of them. Trees are declared
//! without storage; bind a checkpoint or call [`ldm_core::materialize`]
//! before running a forward pass.
//!
//! ```rust,ignore
//! use ldm_models::{Components, StableDiffusion, StableDiffusionConfig};
//!
//! let mut sd = StableDiffusion::new(&StableDiffusionConfig::v1(), Components::all())?;
//! let report = ldm_core::bind(&mut sd, &checkpoint)?;
//! let hidden = sd.encode_text(&[49406, 320, 49407], &device)?;
//! ```

pub mod autoencoder;
pub mod clip;
pub mod error;
pub mod layers;
pub mod stable_diffusion;
pub mod unet;

pub use autoencoder::{AutoencoderConfig, AutoencoderKL};
pub use clip::{ClipConfig, ClipTextModel, ClipTextTransformer};
pub use error::{ModelError, Result};
pub use layers::{Conditioning, Layer};
pub use stable_diffusion::{Components, StableDiffusion, StableDiffusionConfig, LATENT_SCALE};
pub use unet::{UNetConfig, UNetModel};
