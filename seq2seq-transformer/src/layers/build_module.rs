use std::fmt::Debug;

use candle_core::ModuleT;
use candle_nn::VarBuilder;

use crate::error::BoxedError;

/// Configurations that construct a module with a train/inference forward
/// pass, such as dropout, activations, and layer normalization.
pub trait BuildModule: Debug {
    /// Construct the module, creating its parameters in `vb`.
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError>;
}
