use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::layers::init::xavier_linear;

/// Generator configuration.
#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    hidden_width: usize,
    n_pieces: usize,
}

impl GeneratorConfig {
    /// Hidden width of the decoder output.
    ///
    /// Default: `512`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Number of pieces in the target vocabulary.
    ///
    /// Default: `30000`
    pub fn n_pieces(mut self, n_pieces: usize) -> Self {
        self.n_pieces = n_pieces;
        self
    }

    /// Build a generator.
    pub fn build(&self, vb: VarBuilder) -> Result<Generator, GeneratorError> {
        Ok(Generator {
            projection: xavier_linear(
                self.hidden_width,
                self.n_pieces,
                vb.push_prefix("projection"),
            )
            .context(ConstructionSnafu)?,
        })
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            hidden_width: 512,
            n_pieces: 30000,
        }
    }
}

/// Generator errors.
#[derive(Debug, Snafu)]
pub enum GeneratorError {
    #[snafu(display("Cannot construct generator projection"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot compute log-probabilities"))]
    LogProbs { source: candle_core::Error },
}

/// Projection of decoder states to log-probabilities over the target
/// vocabulary.
pub struct Generator {
    projection: Linear,
}

impl Generator {
    /// Compute log-probabilities of the next piece.
    ///
    /// * `hidden` - Decoder output.
    ///   *Shape:* `(batch_size, seq_len, hidden_width)` or
    ///   `(batch_size, hidden_width)`
    ///
    /// Returns: *Shape:* `(batch_size, seq_len, n_pieces)` or
    /// `(batch_size, n_pieces)`
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor, GeneratorError> {
        self.projection
            .forward(hidden)
            .and_then(|logits| candle_nn::ops::log_softmax(&logits, D::Minus1))
            .context(LogProbsSnafu)
    }
}
