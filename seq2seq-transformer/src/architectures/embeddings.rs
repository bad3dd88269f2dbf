use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::error::BoxedError;

/// Maps piece identifiers to the input representations of a stack.
pub trait Embeddings {
    /// Embed a batch of piece sequences.
    ///
    /// * `piece_ids` - Piece identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether dropout is active.
    ///
    /// Returns: *Shape:* `(batch_size, seq_len, hidden_width)`
    fn forward(&self, piece_ids: &Tensor, train: bool) -> Result<Tensor, BoxedError>;
}

/// Configurations that construct an embedding layer.
pub trait BuildEmbeddings: Debug {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Embeddings>, BoxedError>;
}
