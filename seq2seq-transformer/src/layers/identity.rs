use candle_core::{Module, ModuleT, Tensor};
use candle_nn::VarBuilder;

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Module that returns its input unchanged.
///
/// Stands in for disabled dropout.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl BuildModule for Identity {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(*self))
    }
}

impl Module for Identity {
    fn forward(&self, input: &Tensor) -> Result<Tensor, candle_core::Error> {
        Ok(input.clone())
    }
}
