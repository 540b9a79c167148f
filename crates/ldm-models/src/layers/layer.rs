//! Heterogeneous layer sequences
//!
//! Checkpoints address sequential containers by position, including
//! positions that hold no parameters (activations, dropout). [`Layer`] keeps
//! those positions in place so indices line up.

use candle_core::{bail, Module, Result, Tensor};
use ldm_core::{Child, Composite, Node, NodeRef, Segment};

use super::conv::Conv2d;
use super::linear::Linear;
use super::norm::{GroupNorm, LayerNorm};
use super::resnet::ResBlock;
use super::sampling::{Downsample, Upsample};
use super::transformer::{GeGlu, SpatialTransformer};

/// Side inputs threaded through a sequence
#[derive(Debug, Clone, Copy, Default)]
pub struct Conditioning<'a> {
    /// Time embedding, `(batch, emb_channels)`
    pub emb: Option<&'a Tensor>,
    /// Cross-attention context, `(batch, tokens, context_dim)`
    pub context: Option<&'a Tensor>,
}

impl<'a> Conditioning<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(emb: &'a Tensor, context: Option<&'a Tensor>) -> Self {
        Self {
            emb: Some(emb),
            context,
        }
    }
}

/// One position in a sequential container
#[derive(Debug, Clone)]
pub enum Layer {
    Normalize(GroupNorm),
    LayerNorm(LayerNorm),
    Conv(Conv2d),
    Linear(Linear),
    GeGlu(GeGlu),
    ResBlock(ResBlock),
    Transformer(SpatialTransformer),
    Upsample(Upsample),
    Downsample(Downsample),
    Silu,
    /// Parameter-free placeholder (dropout at inference)
    Identity,
}

impl Layer {
    pub fn apply(&self, xs: &Tensor, cond: &Conditioning<'_>) -> Result<Tensor> {
        match self {
            Self::Normalize(l) => l.forward(xs),
            Self::LayerNorm(l) => l.forward(xs),
            Self::Conv(l) => l.forward(xs),
            Self::Linear(l) => l.forward(xs),
            Self::GeGlu(l) => l.forward(xs),
            Self::ResBlock(l) => match cond.emb {
                Some(emb) => l.forward(xs, emb),
                None => bail!("residual block needs a time embedding"),
            },
            Self::Transformer(l) => l.forward(xs, cond.context),
            Self::Upsample(l) => l.forward(xs),
            Self::Downsample(l) => l.forward(xs),
            Self::Silu => candle_nn::ops::silu(xs),
            Self::Identity => Ok(xs.clone()),
        }
    }

    fn inner(&self) -> Option<&dyn Composite> {
        match self {
            Self::Normalize(l) => Some(l),
            Self::LayerNorm(l) => Some(l),
            Self::Conv(l) => Some(l),
            Self::Linear(l) => Some(l),
            Self::GeGlu(l) => Some(l),
            Self::ResBlock(l) => Some(l),
            Self::Transformer(l) => Some(l),
            Self::Upsample(l) => Some(l),
            Self::Downsample(l) => Some(l),
            Self::Silu | Self::Identity => None,
        }
    }

    fn inner_mut(&mut self) -> Option<&mut dyn Composite> {
        match self {
            Self::Normalize(l) => Some(l),
            Self::LayerNorm(l) => Some(l),
            Self::Conv(l) => Some(l),
            Self::Linear(l) => Some(l),
            Self::GeGlu(l) => Some(l),
            Self::ResBlock(l) => Some(l),
            Self::Transformer(l) => Some(l),
            Self::Upsample(l) => Some(l),
            Self::Downsample(l) => Some(l),
            Self::Silu | Self::Identity => None,
        }
    }
}

// Parameter-free positions are empty composites, so a key pointing into
// one resolves to "not found" rather than failing the walk.
impl Composite for Layer {
    fn child_mut(&mut self, segment: &Segment) -> Option<Node<'_>> {
        self.inner_mut()?.child_mut(segment)
    }

    fn children(&self) -> Vec<(Segment, NodeRef<'_>)> {
        self.inner().map(|inner| inner.children()).unwrap_or_default()
    }
}

impl Child for Layer {
    fn as_node_mut(&mut self) -> Option<Node<'_>> {
        Some(Node::Composite(self))
    }

    fn as_node(&self) -> Option<NodeRef<'_>> {
        Some(NodeRef::Composite(self))
    }
}

macro_rules! layer_from {
    ($($variant:ident($ty:ty)),+ $(,)?) => {
        $(
            impl From<$ty> for Layer {
                fn from(layer: $ty) -> Self {
                    Self::$variant(layer)
                }
            }
        )+
    };
}

layer_from!(
    Normalize(GroupNorm),
    LayerNorm(LayerNorm),
    Conv(Conv2d),
    Linear(Linear),
    GeGlu(GeGlu),
    ResBlock(ResBlock),
    Transformer(SpatialTransformer),
    Upsample(Upsample),
    Downsample(Downsample),
);

/// Run `xs` through `layers` in order
pub fn sequential(layers: &[Layer], xs: &Tensor, cond: &Conditioning<'_>) -> Result<Tensor> {
    layers
        .iter()
        .try_fold(xs.clone(), |h, layer| layer.apply(&h, cond))
}
