use candle_core::ModuleT;
use candle_nn::{Dropout, VarBuilder};
use snafu::{ensure, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;

/// Errors for dropout configuration.
#[derive(Debug, Snafu)]
pub enum DropoutError {
    #[snafu(display("Dropout probability must be in [0, 1), was {p}"))]
    InvalidProbability { p: f32 },
}

/// Dropout configuration.
#[derive(Clone, Debug)]
pub struct DropoutConfig {
    p: f32,
}

impl DropoutConfig {
    /// Dropout probability.
    ///
    /// Default: `0.0`
    pub fn p(mut self, p: f32) -> Self {
        self.p = p;
        self
    }
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self { p: 0.0 }
    }
}

impl BuildModule for DropoutConfig {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        ensure!(
            (0.0..1.0).contains(&self.p),
            InvalidProbabilitySnafu { p: self.p }
        );

        // Dropout with p = 0 is a no-op in both modes.
        if self.p == 0.0 {
            return Ok(Box::new(Identity));
        }

        Ok(Box::new(Dropout::new(self.p)))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::VarBuilder;
    use rstest::rstest;

    use crate::layers::build_module::BuildModule;
    use crate::layers::dropout::DropoutConfig;

    #[rstest]
    #[case(-0.1)]
    #[case(1.0)]
    #[case(1.5)]
    fn dropout_rejects_invalid_probability(#[case] p: f32) {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(DropoutConfig::default().p(p).build(vb).is_err());
    }

    #[test]
    fn dropout_is_identity_during_inference() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let dropout = DropoutConfig::default().p(0.5).build(vb).unwrap();
        let xs = Tensor::arange(1f32, 7f32, &Device::Cpu)
            .unwrap()
            .reshape((2, 3))
            .unwrap();
        let ys = dropout.forward_t(&xs, false).unwrap();
        assert_eq!(
            ys.to_vec2::<f32>().unwrap(),
            xs.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn dropout_zeroes_or_rescales_during_training() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let dropout = DropoutConfig::default().p(0.5).build(vb).unwrap();
        let xs = Tensor::ones((4, 16), DType::F32, &Device::Cpu).unwrap();
        let ys = dropout.forward_t(&xs, true).unwrap();
        for row in ys.to_vec2::<f32>().unwrap() {
            for y in row {
                assert!(y == 0.0 || (y - 2.0).abs() < 1e-6, "unexpected value {y}");
            }
        }
    }
}
