use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::architectures::{BuildEmbeddings, Embeddings};
use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::embeddings::{
    ScaledEmbeddings, ScaledEmbeddingsError, SinusoidalPositionalEncoding,
    SinusoidalPositionalEncodingConfig, SinusoidalPositionalEncodingError,
};
use crate::layers::identity::Identity;

/// Transformer embeddings configuration.
#[derive(Debug)]
pub struct TransformerEmbeddingsConfig {
    dropout: Box<dyn BuildModule>,
    hidden_width: usize,
    max_len: usize,
    n_pieces: usize,
}

impl TransformerEmbeddingsConfig {
    /// Dropout applied to the sum of piece embeddings and positional
    /// encodings.
    ///
    /// Default: `Identity`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Hidden width of the transformer.
    ///
    /// Default: `512`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Maximum sequence length.
    ///
    /// Default: `5000`
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Number of pieces in the vocabulary.
    ///
    /// Default: `30000`
    pub fn n_pieces(mut self, n_pieces: usize) -> Self {
        self.n_pieces = n_pieces;
        self
    }
}

impl Default for TransformerEmbeddingsConfig {
    fn default() -> Self {
        Self {
            dropout: Box::new(Identity),
            hidden_width: 512,
            max_len: 5000,
            n_pieces: 30000,
        }
    }
}

impl BuildEmbeddings for TransformerEmbeddingsConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Embeddings>, BoxedError> {
        let positional_encoding = SinusoidalPositionalEncodingConfig::default()
            .max_len(self.max_len)
            .width(self.hidden_width)
            .build(vb.device())
            .context(BuildPositionalEncodingSnafu)?;

        Ok(Box::new(TransformerEmbeddings {
            dropout: self
                .dropout
                .build(vb.clone())
                .context(BuildDropoutSnafu)?,
            piece_embeddings: ScaledEmbeddings::new(
                vb.push_prefix("piece_embeddings"),
                self.n_pieces,
                self.hidden_width,
            )
            .context(PieceEmbeddingsSnafu)?,
            positional_encoding,
        }))
    }
}

/// Errors for transformer embeddings.
#[derive(Debug, Snafu)]
pub enum TransformerEmbeddingsError {
    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot build positional encodings"))]
    BuildPositionalEncoding {
        source: SinusoidalPositionalEncodingError,
    },

    #[snafu(display("Cannot apply dropout"))]
    Dropout { source: candle_core::Error },

    #[snafu(display("Cannot look up piece embeddings"))]
    PieceEmbeddings { source: ScaledEmbeddingsError },

    #[snafu(display("Cannot add positional encodings"))]
    PositionalEncoding {
        source: SinusoidalPositionalEncodingError,
    },
}

/// Transformer embeddings layer.
///
/// Piece embeddings are scaled by `√hidden_width`, summed with fixed
/// sinusoidal positional encodings and passed through dropout.
pub struct TransformerEmbeddings {
    dropout: Box<dyn ModuleT>,
    piece_embeddings: ScaledEmbeddings,
    positional_encoding: SinusoidalPositionalEncoding,
}

impl Embeddings for TransformerEmbeddings {
    fn forward(&self, piece_ids: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        let embeddings = self
            .piece_embeddings
            .forward(piece_ids)
            .context(PieceEmbeddingsSnafu)?;
        let embeddings = self
            .positional_encoding
            .forward(&embeddings)
            .context(PositionalEncodingSnafu)?;
        Ok(self
            .dropout
            .forward_t(&embeddings, train)
            .context(DropoutSnafu)?)
    }
}
