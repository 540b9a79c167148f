//! Text encoding command

use std::error::Error;

use candle_core::Device;
use tracing::info;

use super::prepare;
use crate::config::RunConfig;

pub fn run(config: &RunConfig, tokens: &[u32]) -> Result<(), Box<dyn Error>> {
    let device = Device::Cpu;
    let model = prepare(config, &device)?;

    info!("Encoding {} tokens", tokens.len());
    let hidden = model.encode_text(tokens, &device)?;

    println!("Tokens: {:?}", tokens);
    println!("Output: {:?}", hidden.dims());

    // First few values of each position
    let rows = hidden.squeeze(0)?.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
    for (position, row) in rows.iter().enumerate() {
        let head: Vec<String> = row.iter().take(6).map(|v| format!("{:+.4}", v)).collect();
        println!("  [{}] {} ...", position, head.join(" "));
    }

    Ok(())
}
