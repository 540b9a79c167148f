//! Parameter leaves
//!
//! A [`Param`] declares the shape and dtype of one learnable tensor. It owns
//! no storage until a value is bound, so assembling a full model is free.

use candle_core::{bail, DType, Device, Result, Shape, Tensor};

/// Placeholder initialization for unbound parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// All zeros
    Zeros,
    /// All ones
    Ones,
    /// Normal distribution with mean 0
    Normal { std: f32 },
}

/// A model-tree leaf holding one tensor parameter
#[derive(Debug, Clone)]
pub struct Param {
    shape: Shape,
    dtype: DType,
    value: Option<Tensor>,
}

impl Param {
    /// Declare an f32 parameter
    pub fn new<S: Into<Shape>>(shape: S) -> Self {
        Self {
            shape: shape.into(),
            dtype: DType::F32,
            value: None,
        }
    }

    /// Set the declared dtype
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Declared shape
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Declared dtype
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of elements
    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Whether a value has been bound
    pub fn is_bound(&self) -> bool {
        self.value.is_some()
    }

    /// The bound value, if any
    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    /// The bound value, or an error naming the declared shape
    pub fn get(&self) -> Result<&Tensor> {
        match &self.value {
            Some(value) => Ok(value),
            None => bail!("parameter of shape {:?} used before binding", self.shape),
        }
    }

    /// Replace the value with `tensor`, cast to the declared dtype.
    ///
    /// The shape must match exactly; no reshape or broadcast is applied.
    pub fn assign(&mut self, tensor: &Tensor) -> Result<()> {
        if tensor.shape() != &self.shape {
            bail!(
                "cannot assign tensor of shape {:?} to parameter of shape {:?}",
                tensor.shape(),
                self.shape
            );
        }
        self.value = Some(tensor.to_dtype(self.dtype)?);
        Ok(())
    }

    /// Fill an unbound parameter with a placeholder value.
    ///
    /// Returns `true` if a value was created.
    pub fn materialize(&mut self, init: Init, device: &Device) -> Result<bool> {
        if self.value.is_some() {
            return Ok(false);
        }

        let value = match init {
            Init::Zeros => Tensor::zeros(&self.shape, self.dtype, device)?,
            Init::Ones => Tensor::ones(&self.shape, self.dtype, device)?,
            Init::Normal { std } => {
                Tensor::randn(0f32, std, &self.shape, device)?.to_dtype(self.dtype)?
            }
        };
        self.value = Some(value);
        Ok(true)
    }

    /// Drop the bound value
    pub fn clear(&mut self) {
        self.value = None;
    }
}
