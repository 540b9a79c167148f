//! Building blocks shared by the autoencoder, UNet and text encoder

mod attention;
mod conv;
mod layer;
mod linear;
mod norm;
mod resnet;
mod sampling;
mod transformer;

pub use attention::{AttnBlock, CrossAttention};
pub use conv::{Conv2d, Padding};
pub use layer::{sequential, Conditioning, Layer};
pub use linear::{Embedding, Linear};
pub use norm::{GroupNorm, LayerNorm};
pub use resnet::{ResBlock, ResnetBlock};
pub use sampling::{Downsample, Upsample};
pub use transformer::{BasicTransformerBlock, FeedForward, GeGlu, SpatialTransformer};
