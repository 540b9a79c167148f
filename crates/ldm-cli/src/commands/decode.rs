//! Latent decoding command

use std::error::Error;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use super::prepare;
use crate::config::RunConfig;

pub fn run(
    config: &RunConfig,
    input: &Path,
    output: &Path,
    unscaled: bool,
) -> Result<(), Box<dyn Error>> {
    let device = Device::Cpu;

    let latent = Tensor::read_npy(input)?.to_dtype(DType::F32)?;
    let latent = match latent.rank() {
        3 => latent.unsqueeze(0)?,
        4 => latent,
        rank => return Err(format!("expected a latent of rank 3 or 4, got {}", rank).into()),
    };
    info!(unscaled, "Decoding latent {:?}", latent.dims());

    let model = prepare(config, &device)?;
    let image = if unscaled {
        model.decode_unscaled_latents(&latent)?
    } else {
        model.decode_latents(&latent)?
    };
    let image = image.get(0)?;
    let (height, width, _) = image.dims3()?;

    let data = image.flatten_all()?.to_vec1::<u8>()?;
    image::save_buffer(
        output,
        &data,
        width as u32,
        height as u32,
        image::ColorType::Rgb8,
    )?;

    println!("Image written to {} ({}x{})", output.display(), width, height);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::tiny_config;
    use tempfile::TempDir;

    #[test]
    fn test_decode_to_png() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("latent.npy");
        let output = dir.path().join("out.png");

        Tensor::randn(0f32, 1f32, (4, 4, 4), &Device::Cpu)
            .unwrap()
            .write_npy(&input)
            .unwrap();

        run(&tiny_config(None), &input, &output, false).unwrap();

        let decoded = image::open(&output).unwrap();
        assert_eq!(decoded.width(), 8);
        assert_eq!(decoded.height(), 8);
    }

    #[test]
    fn test_decode_unscaled_latent() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("posterior.npy");
        let output = dir.path().join("out.png");

        Tensor::randn(0f32, 1f32, (1, 4, 8, 4), &Device::Cpu)
            .unwrap()
            .write_npy(&input)
            .unwrap();

        run(&tiny_config(None), &input, &output, true).unwrap();

        let decoded = image::open(&output).unwrap();
        assert_eq!(decoded.width(), 8);
        assert_eq!(decoded.height(), 16);
    }

    #[test]
    fn test_decode_rejects_bad_rank() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("latent.npy");
        Tensor::zeros(4, DType::F32, &Device::Cpu)
            .unwrap()
            .write_npy(&input)
            .unwrap();

        assert!(run(&tiny_config(None), &input, &dir.path().join("x.png"), false).is_err());
    }
}
