use candle_core::{DType, Module, ModuleT, Tensor, D};
use candle_nn::{Init, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Errors for layer normalization.
#[derive(Debug, Snafu)]
pub enum LayerNormError {
    #[snafu(display("Cannot construct layer norm parameters"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Layer norm needs a width of at least 2, was {width}"))]
    WidthTooSmall { width: usize },
}

/// Layer norm configuration.
#[derive(Clone, Debug)]
pub struct LayerNormConfig {
    pub eps: f64,
    pub size: usize,
}

impl LayerNormConfig {
    /// Epsilon value, added to the standard deviation.
    ///
    /// Default: `1e-6`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Dimensionality of the layer.
    ///
    /// Default: `512`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            eps: 1e-6,
            size: 512,
        }
    }
}

impl BuildModule for LayerNormConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(LayerNorm::new(vb, self.size, self.eps)?))
    }
}

/// Layer normalization (Ba et al., 2016).
///
/// Computes `gain * (x - mean) / (std + eps) + bias` over the last
/// dimension, where `std` is the unbiased standard deviation. Note that
/// `eps` is added to the standard deviation rather than to the variance.
///
/// See [Ba et al., 2016](https://arxiv.org/abs/1607.06450).
#[derive(Debug)]
pub struct LayerNorm {
    bias: Tensor,
    eps: f64,
    gain: Tensor,
}

impl LayerNorm {
    /// Construct a layer normalization module.
    ///
    /// * `vb` - Variable store.
    /// * `width` - The (hidden) width of the representations that
    ///   normalization will be applied to.
    /// * `eps` - Epsilon to avoid division by zero.
    pub fn new(vb: VarBuilder, width: usize, eps: f64) -> Result<Self, LayerNormError> {
        ensure!(width >= 2, WidthTooSmallSnafu { width });
        let gain = vb
            .get_with_hints((width,), "weight", Init::Const(1.0))
            .context(ConstructionSnafu)?;
        let bias = vb
            .get_with_hints((width,), "bias", Init::Const(0.0))
            .context(ConstructionSnafu)?;
        Ok(Self { bias, eps, gain })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // Statistics are computed in float32, narrower types lose too much
        // precision when squaring and averaging.
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let width = xs.dim(D::Minus1)?;

        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let std = centered
            .sqr()?
            .sum_keepdim(D::Minus1)?
            .affine(1.0 / (width - 1) as f64, 0.0)?
            .sqrt()?
            .affine(1.0, self.eps)?;

        centered
            .broadcast_div(&std)?
            .to_dtype(dtype)?
            .broadcast_mul(&self.gain)?
            .broadcast_add(&self.bias)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Module, Tensor};
    use candle_nn::VarBuilder;
    use ndarray::array;

    use crate::layers::layer_norm::LayerNorm;
    use crate::util::device::tests::test_devices;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn layer_norm_uses_unbiased_std() {
        for device in test_devices() {
            let vb = VarBuilder::zeros(DType::F32, &device);
            let layer_norm = LayerNorm::new(vb, 4, 0.0).unwrap();
            // Zero-initialized variable builder, so set the parameters by hand.
            let layer_norm = LayerNorm {
                gain: Tensor::ones(4, DType::F32, &device).unwrap(),
                ..layer_norm
            };

            // Mean 2.5, unbiased std sqrt(5/3).
            let xs = Tensor::new(&[[1f32, 2., 3., 4.], [2., 2., 2., 6.]], &device).unwrap();
            let std = (5f32 / 3.).sqrt();
            assert_tensor_eq!(
                layer_norm.forward(&xs).unwrap(),
                array![
                    [-1.5 / std, -0.5 / std, 0.5 / std, 1.5 / std],
                    [-1. / 2., -1. / 2., -1. / 2., 3. / 2.]
                ],
                epsilon = 1e-5f32,
            );
        }
    }

    #[test]
    fn layer_norm_applies_gain_and_bias() {
        let device = Device::Cpu;
        let layer_norm = LayerNorm {
            bias: Tensor::new(&[1f32, -1.], &device).unwrap(),
            eps: 1e-6,
            gain: Tensor::new(&[2f32, 3.], &device).unwrap(),
        };

        // Mean 1, unbiased std sqrt(2).
        let xs = Tensor::new(&[[0f32, 2.]], &device).unwrap();
        let std = 2f32.sqrt() + 1e-6;
        assert_tensor_eq!(
            layer_norm.forward(&xs).unwrap(),
            array![[1. - 2. / std, -1. + 3. / std]],
            epsilon = 1e-5f32,
        );
    }

    #[test]
    fn layer_norm_rejects_width_one() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(LayerNorm::new(vb, 1, 1e-6).is_err());
    }
}
