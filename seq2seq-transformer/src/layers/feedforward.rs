use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{Linear, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;
use crate::layers::init::xavier_linear;

/// Point-wise feed-forward layer configuration.
#[derive(Debug)]
pub struct PointwiseFeedForwardConfig {
    activation: Box<dyn BuildModule>,
    dropout: Box<dyn BuildModule>,
    hidden_width: usize,
    intermediate_width: usize,
}

impl PointwiseFeedForwardConfig {
    /// Activation function.
    ///
    /// Default: `Activation::Relu`
    pub fn activation(mut self, activation: Box<dyn BuildModule>) -> Self {
        self.activation = activation;
        self
    }

    /// Dropout applied to the output of the activation.
    ///
    /// Default: `Identity`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Hidden width, dimensionality of the layer input and output.
    ///
    /// Default: `512`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Intermediate width inside the feed-forward layer.
    ///
    /// Default: `2048`
    pub fn intermediate_width(mut self, intermediate_width: usize) -> Self {
        self.intermediate_width = intermediate_width;
        self
    }

    /// Build a point-wise feed-forward layer.
    pub fn build(&self, vb: VarBuilder) -> Result<PointwiseFeedForward, PointwiseFeedForwardError> {
        Ok(PointwiseFeedForward {
            activation: self
                .activation
                .build(vb.clone())
                .context(BuildActivationSnafu)?,
            dropout: self
                .dropout
                .build(vb.clone())
                .context(BuildDropoutSnafu)?,
            intermediate: xavier_linear(
                self.hidden_width,
                self.intermediate_width,
                vb.push_prefix("intermediate"),
            )
            .context(ConstructionSnafu)?,
            output: xavier_linear(
                self.intermediate_width,
                self.hidden_width,
                vb.push_prefix("output"),
            )
            .context(ConstructionSnafu)?,
        })
    }
}

impl Default for PointwiseFeedForwardConfig {
    fn default() -> Self {
        Self {
            activation: Box::new(Activation::Relu),
            dropout: Box::new(Identity),
            hidden_width: 512,
            intermediate_width: 2048,
        }
    }
}

/// Errors for point-wise feed-forward layers.
#[derive(Debug, Snafu)]
pub enum PointwiseFeedForwardError {
    #[snafu(display("Cannot build activation"))]
    BuildActivation { source: BoxedError },

    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot construct linear layers"))]
    Construction { source: candle_core::Error },
}

/// Point-wise feed-forward layer (_Vaswani et al., 2017_).
///
/// This layer is applied pointwise, meaning that the same
/// transformation is applied to each sequence element. This
/// transformation is:
///
/// `dropout(g(xW_1 + b_1))W_2 + b_2`
///
/// `W_1` and `b_1` transform the input to an intermediate width, `g` is a
/// non-linear activation function and `W_2` and `b_2` transform the
/// output of the activation back to the input width.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
pub struct PointwiseFeedForward {
    activation: Box<dyn ModuleT>,
    dropout: Box<dyn ModuleT>,
    intermediate: Linear,
    output: Linear,
}

impl ModuleT for PointwiseFeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let hidden = self.intermediate.forward(xs)?;
        let hidden = self.activation.forward_t(&hidden, train)?;
        let hidden = self.dropout.forward_t(&hidden, train)?;
        self.output.forward(&hidden)
    }
}
