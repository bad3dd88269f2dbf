use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;
use crate::layers::layer_norm::LayerNormConfig;

/// Residual connection configuration.
#[derive(Debug)]
pub struct SublayerConnectionConfig {
    dropout: Box<dyn BuildModule>,
    layer_norm: LayerNormConfig,
}

impl SublayerConnectionConfig {
    /// Dropout applied to the sublayer output before the residual is added.
    ///
    /// Default: `Identity`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Layer normalization applied to the sublayer input.
    ///
    /// Default: `LayerNormConfig::default()`
    pub fn layer_norm(mut self, layer_norm: LayerNormConfig) -> Self {
        self.layer_norm = layer_norm;
        self
    }

    /// Build a residual connection.
    pub fn build(&self, vb: VarBuilder) -> Result<SublayerConnection, SublayerConnectionError> {
        Ok(SublayerConnection {
            dropout: self
                .dropout
                .build(vb.clone())
                .context(BuildDropoutSnafu)?,
            layer_norm: self
                .layer_norm
                .build(vb.push_prefix("layer_norm"))
                .context(BuildLayerNormSnafu)?,
        })
    }
}

impl Default for SublayerConnectionConfig {
    fn default() -> Self {
        Self {
            dropout: Box::new(Identity),
            layer_norm: LayerNormConfig::default(),
        }
    }
}

/// Errors for residual connections.
#[derive(Debug, Snafu)]
pub enum SublayerConnectionError {
    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot build layer norm"))]
    BuildLayerNorm { source: BoxedError },

    #[snafu(display("Cannot apply layer norm"))]
    LayerNorm { source: candle_core::Error },

    #[snafu(display("Cannot add residual"))]
    Residual { source: candle_core::Error },

    #[snafu(display("Cannot apply sublayer"))]
    Sublayer { source: BoxedError },
}

/// Residual connection around a sublayer with pre-normalization.
///
/// Computes `x + dropout(sublayer(norm(x)))`. The input is normalized
/// *before* it is passed to the sublayer, so the residual stream itself is
/// never normalized inside a layer.
pub struct SublayerConnection {
    dropout: Box<dyn ModuleT>,
    layer_norm: Box<dyn ModuleT>,
}

impl SublayerConnection {
    /// Apply the sublayer with a residual connection.
    ///
    /// * `input` - Input representations.
    ///   *Shape:* `(batch_size, seq_len, width)`
    /// * `sublayer` - The sublayer, receives the normalized input.
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: *Shape:* `(batch_size, seq_len, width)`
    pub fn forward_t<F>(
        &self,
        input: &Tensor,
        sublayer: F,
        train: bool,
    ) -> Result<Tensor, SublayerConnectionError>
    where
        F: FnOnce(&Tensor) -> Result<Tensor, BoxedError>,
    {
        self.forward_with_output(input, |xs| Ok((sublayer(xs)?, ())), train)
            .map(|(output, ())| output)
    }

    /// Apply a sublayer that returns an additional output.
    ///
    /// Works like [`SublayerConnection::forward_t`], the second element of
    /// the sublayer's result is passed through unchanged.
    pub fn forward_with_output<F, T>(
        &self,
        input: &Tensor,
        sublayer: F,
        train: bool,
    ) -> Result<(Tensor, T), SublayerConnectionError>
    where
        F: FnOnce(&Tensor) -> Result<(Tensor, T), BoxedError>,
    {
        let normalized = self
            .layer_norm
            .forward_t(input, train)
            .context(LayerNormSnafu)?;
        let (output, extra) = sublayer(&normalized).context(SublayerSnafu)?;
        let output = self
            .dropout
            .forward_t(&output, train)
            .and_then(|output| input + output)
            .context(ResidualSnafu)?;
        Ok((output, extra))
    }
}
