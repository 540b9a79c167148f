//! Stable Diffusion root
//!
//! Assembles any subset of the three components under their checkpoint
//! prefixes:
//!
//! ```text
//! model.diffusion_model.*                     UNet
//! first_stage_model.*                         AutoencoderKL
//! cond_stage_model.transformer.text_model.*   CLIP text encoder
//! ```
//!
//! Absent components are absent sub-trees, so their keys skip on bind.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::autoencoder::{AutoencoderConfig, AutoencoderKL};
use crate::clip::{ClipConfig, ClipTextModel, ClipTextTransformer};
use crate::error::{ModelError, Result};
use crate::unet::{UNetConfig, UNetModel};

/// Latents are stored scaled by this factor
pub const LATENT_SCALE: f64 = 0.18215;

bitflags! {
    /// Components to assemble
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Components: u32 {
        /// Denoising UNet
        const UNET         = 0b0001;
        /// Image autoencoder
        const AUTOENCODER  = 0b0010;
        /// CLIP text encoder
        const TEXT_ENCODER = 0b0100;
    }
}

impl Components {
    const NAMES: [(&'static str, Components); 3] = [
        ("unet", Components::UNET),
        ("autoencoder", Components::AUTOENCODER),
        ("text_encoder", Components::TEXT_ENCODER),
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "vae" => Some(Self::AUTOENCODER),
            "clip" => Some(Self::TEXT_ENCODER),
            "all" => Some(Self::all()),
            _ => Self::NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, flag)| *flag),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl fmt::Display for Components {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

/// Comma-separated names: `unet,autoencoder`
impl FromStr for Components {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .try_fold(Components::empty(), |acc, part| {
                Components::from_name(part)
                    .map(|flag| acc | flag)
                    .ok_or_else(|| format!("unknown component: {}", part.trim()))
            })
    }
}

impl Serialize for Components {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Components {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let names = Vec::<String>::deserialize(deserializer)?;
        names.iter().try_fold(Components::empty(), |acc, name| {
            Components::from_name(name)
                .map(|flag| acc | flag)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown component: {}", name)))
        })
    }
}

/// Sizes of all three components
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StableDiffusionConfig {
    pub unet: UNetConfig,
    pub autoencoder: AutoencoderConfig,
    pub clip: ClipConfig,
}

impl StableDiffusionConfig {
    /// Latent-diffusion v1 (the default)
    pub fn v1() -> Self {
        Self::default()
    }

    /// Small sizes for tests, with matching context width
    pub fn tiny() -> Self {
        Self {
            unet: UNetConfig::tiny(),
            autoencoder: AutoencoderConfig::tiny(),
            clip: ClipConfig::tiny(),
        }
    }
}

/// `model` wrapper
#[derive(Debug, Clone)]
pub struct DiffusionWrapper {
    diffusion_model: UNetModel,
}

ldm_core::composite!(DiffusionWrapper { diffusion_model });

/// `cond_stage_model` wrapper
#[derive(Debug, Clone)]
pub struct CondStage {
    transformer: ClipTextTransformer,
}

ldm_core::composite!(CondStage { transformer });

/// Root of the model tree
#[derive(Debug, Clone)]
pub struct StableDiffusion {
    model: Option<DiffusionWrapper>,
    first_stage_model: Option<AutoencoderKL>,
    cond_stage_model: Option<CondStage>,
}

ldm_core::composite!(StableDiffusion {
    model,
    first_stage_model,
    cond_stage_model,
});

impl StableDiffusion {
    pub fn new(config: &StableDiffusionConfig, components: Components) -> Result<Self> {
        let model = if components.contains(Components::UNET) {
            Some(DiffusionWrapper {
                diffusion_model: UNetModel::new(&config.unet)?,
            })
        } else {
            None
        };

        let first_stage_model = if components.contains(Components::AUTOENCODER) {
            Some(AutoencoderKL::new(&config.autoencoder)?)
        } else {
            None
        };

        let cond_stage_model = if components.contains(Components::TEXT_ENCODER) {
            Some(CondStage {
                transformer: ClipTextTransformer::new(&config.clip)?,
            })
        } else {
            None
        };

        tracing::debug!(%components, "stable diffusion assembled");

        Ok(Self {
            model,
            first_stage_model,
            cond_stage_model,
        })
    }

    /// Components present in the tree
    pub fn components(&self) -> Components {
        let mut components = Components::empty();
        components.set(Components::UNET, self.model.is_some());
        components.set(Components::AUTOENCODER, self.first_stage_model.is_some());
        components.set(Components::TEXT_ENCODER, self.cond_stage_model.is_some());
        components
    }

    pub fn unet(&self) -> Result<&UNetModel> {
        self.model
            .as_ref()
            .map(|m| &m.diffusion_model)
            .ok_or(ModelError::MissingComponent("unet"))
    }

    pub fn autoencoder(&self) -> Result<&AutoencoderKL> {
        self.first_stage_model
            .as_ref()
            .ok_or(ModelError::MissingComponent("autoencoder"))
    }

    pub fn text_model(&self) -> Result<&ClipTextModel> {
        self.cond_stage_model
            .as_ref()
            .map(|c| c.transformer.text_model())
            .ok_or(ModelError::MissingComponent("text_encoder"))
    }

    /// Encode one token sequence to `(1, seq, hidden)`
    pub fn encode_text(&self, tokens: &[u32], device: &Device) -> Result<Tensor> {
        Ok(self.text_model()?.encode_tokens(tokens, device)?)
    }

    /// Scaled latent `(b, 4, h, w)` to an RGB image `(b, 8h, 8w, 3)` of `u8`
    pub fn decode_latents(&self, latent: &Tensor) -> Result<Tensor> {
        self.decode_unscaled_latents(&(latent / LATENT_SCALE)?)
    }

    /// Like [`decode_latents`](Self::decode_latents) for a latent taken
    /// straight from the encoder posterior, without `LATENT_SCALE` applied
    pub fn decode_unscaled_latents(&self, latent: &Tensor) -> Result<Tensor> {
        let vae = self.autoencoder()?;
        let image = vae.decode(latent)?;
        let image = image
            .affine(127.5, 127.5)?
            .clamp(0f32, 255f32)?
            .to_dtype(DType::U8)?
            .permute((0, 2, 3, 1))?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldm_core::{bind, materialize, parameter_count, parameters, Checkpoint, Init};

    fn shape_of(root: &dyn ldm_core::Composite, key: &str) -> Option<Vec<usize>> {
        parameters(root)
            .into_iter()
            .find(|(p, _)| p.to_string() == key)
            .map(|(_, param)| param.shape().dims().to_vec())
    }

    /// Checkpoint holding every value of a materialized tree
    fn snapshot(root: &dyn ldm_core::Composite) -> Checkpoint {
        parameters(root)
            .into_iter()
            .filter_map(|(path, param)| param.value().map(|v| (path.to_string(), v.clone())))
            .collect()
    }

    #[test]
    fn test_full_v1_tree() {
        let sd = StableDiffusion::new(&StableDiffusionConfig::v1(), Components::all()).unwrap();
        assert_eq!(parameter_count(&sd), 859_520_964 + 83_653_863 + 123_060_557);

        assert_eq!(
            shape_of(
                &sd,
                "model.diffusion_model.input_blocks.1.1.transformer_blocks.0.attn1.to_q.weight"
            ),
            Some(vec![320, 320])
        );
        assert_eq!(
            shape_of(&sd, "model.diffusion_model.output_blocks.2.1.conv.weight"),
            Some(vec![1280, 1280, 3, 3])
        );
        assert_eq!(
            shape_of(&sd, "first_stage_model.encoder.down.0.downsample.conv.weight"),
            Some(vec![128, 128, 3, 3])
        );
        assert_eq!(
            shape_of(
                &sd,
                "cond_stage_model.transformer.text_model.embeddings.token_embedding.weight"
            ),
            Some(vec![49408, 768])
        );
    }

    #[test]
    fn test_partial_assembly() {
        let sd = StableDiffusion::new(
            &StableDiffusionConfig::tiny(),
            Components::AUTOENCODER | Components::TEXT_ENCODER,
        )
        .unwrap();

        assert_eq!(
            sd.components(),
            Components::AUTOENCODER | Components::TEXT_ENCODER
        );
        assert!(matches!(sd.unet(), Err(ModelError::MissingComponent("unet"))));
        assert!(sd.autoencoder().is_ok());
        assert!(parameters(&sd)
            .iter()
            .all(|(p, _)| !p.to_string().starts_with("model.")));
    }

    #[test]
    fn test_partial_tree_skips_absent_keys() {
        let config = StableDiffusionConfig::tiny();
        let mut source = StableDiffusion::new(&config, Components::all()).unwrap();
        materialize(&mut source, Init::Normal { std: 0.05 }, &Device::Cpu).unwrap();
        let checkpoint = snapshot(&source);

        let mut vae_only = StableDiffusion::new(&config, Components::AUTOENCODER).unwrap();
        let report = bind(&mut vae_only, &checkpoint).unwrap();

        let vae_keys = checkpoint
            .keys()
            .filter(|k| k.starts_with("first_stage_model."))
            .count();
        assert_eq!(report.bound(), vae_keys);
        assert_eq!(report.skipped(), checkpoint.len() - vae_keys);
        assert!(ldm_core::unbound_parameters(&vae_only).is_empty());
    }

    #[test]
    fn test_bind_then_forward_matches_source() {
        let config = StableDiffusionConfig::tiny();
        let mut source = StableDiffusion::new(&config, Components::all()).unwrap();
        materialize(&mut source, Init::Normal { std: 0.05 }, &Device::Cpu).unwrap();

        let mut target = StableDiffusion::new(&config, Components::all()).unwrap();
        let report = bind(&mut target, &snapshot(&source)).unwrap();
        assert_eq!(report.skipped(), 0);
        assert_eq!(report.bound(), parameters(&source).len());

        let a = source.encode_text(&[1, 2, 3], &Device::Cpu).unwrap();
        let b = target.encode_text(&[1, 2, 3], &Device::Cpu).unwrap();
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );

        let latent = Tensor::randn(0f32, 1f32, (1, 4, 4, 4), &Device::Cpu).unwrap();
        let image = target.decode_latents(&latent).unwrap();
        assert_eq!(image.dims(), &[1, 8, 8, 3]);
        assert_eq!(image.dtype(), DType::U8);

        let unscaled = target
            .decode_unscaled_latents(&(&latent / LATENT_SCALE).unwrap())
            .unwrap();
        assert_eq!(
            unscaled.flatten_all().unwrap().to_vec1::<u8>().unwrap(),
            image.flatten_all().unwrap().to_vec1::<u8>().unwrap()
        );

        let t_emb = Tensor::zeros((1, config.unet.model_channels), DType::F32, &Device::Cpu)
            .unwrap();
        let context = target.encode_text(&[4, 5], &Device::Cpu).unwrap();
        let noise = target
            .unet()
            .unwrap()
            .forward(&latent, &t_emb, &context)
            .unwrap();
        assert_eq!(noise.dims(), &[1, 4, 4, 4]);
    }

    #[test]
    fn test_components_parse() {
        assert_eq!(
            "unet, vae".parse::<Components>().unwrap(),
            Components::UNET | Components::AUTOENCODER
        );
        assert_eq!("all".parse::<Components>().unwrap(), Components::all());
        assert!("unet,lora".parse::<Components>().is_err());
        assert_eq!(Components::all().to_string(), "unet,autoencoder,text_encoder");
    }

    #[test]
    fn test_components_serde() {
        let json = serde_json::to_string(&(Components::UNET | Components::TEXT_ENCODER)).unwrap();
        assert_eq!(json, r#"["unet","text_encoder"]"#);

        let parsed: Components = serde_json::from_str(r#"["clip","autoencoder"]"#).unwrap();
        assert_eq!(parsed, Components::TEXT_ENCODER | Components::AUTOENCODER);
        assert!(serde_json::from_str::<Components>(r#"["nope"]"#).is_err());
    }
}
