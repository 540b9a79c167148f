//! Resolution changes

use candle_core::{Module, Result, Tensor};

use super::conv::Conv2d;

/// Nearest-neighbour ×2 upsampling followed by a 3×3 conv
#[derive(Debug, Clone)]
pub struct Upsample {
    conv: Conv2d,
}

ldm_core::composite!(Upsample { conv });

impl Upsample {
    pub fn new(channels: usize) -> Self {
        Self {
            conv: Conv2d::new(channels, channels, 3).with_padding(1),
        }
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        self.conv.forward(&xs.upsample_nearest2d(h * 2, w * 2)?)
    }
}

/// Strided 3×3 conv halving the resolution
#[derive(Debug, Clone)]
pub struct Downsample {
    op: Conv2d,
}

ldm_core::composite!(Downsample { op });

impl Downsample {
    pub fn new(channels: usize) -> Self {
        Self {
            op: Conv2d::new(channels, channels, 3)
                .with_stride(2)
                .with_padding(1),
        }
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.op.forward(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use ldm_core::{materialize, Init};

    #[test]
    fn test_resolution_round_trip() {
        let mut up = Upsample::new(4);
        let mut down = Downsample::new(4);
        materialize(&mut up, Init::Zeros, &Device::Cpu).unwrap();
        materialize(&mut down, Init::Zeros, &Device::Cpu).unwrap();

        let x = Tensor::zeros((1, 4, 6, 6), DType::F32, &Device::Cpu).unwrap();
        let upsampled = up.forward(&x).unwrap();
        assert_eq!(upsampled.dims(), &[1, 4, 12, 12]);
        assert_eq!(down.forward(&upsampled).unwrap().dims(), &[1, 4, 6, 6]);
    }
}
