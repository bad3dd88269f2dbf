use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

mod mask;
pub use mask::{
    AttentionMask, AttentionMaskError, QueryKeyAttentionMask, QueryKeyMask, QueryKeyMaskError,
};

mod multi_head;
pub use multi_head::{MultiHeadAttention, MultiHeadAttentionConfig, MultiHeadAttentionError};

mod sdpa;
pub use sdpa::{SDPAConfig, SDPAError, SDPA};

use crate::error::BoxedError;

/// Output of an attention module.
#[derive(Clone, Debug)]
pub struct AttentionOutput {
    output: Tensor,
    probabilities: Tensor,
}

impl AttentionOutput {
    /// Create an attention output.
    pub fn new(output: Tensor, probabilities: Tensor) -> Self {
        Self {
            output,
            probabilities,
        }
    }

    /// Attention output.
    ///
    /// *Shape:* `(batch_size, heads, query_len, width)` for attention
    /// scorers, `(batch_size, query_len, hidden_width)` for multi-head
    /// attention.
    pub fn output(&self) -> &Tensor {
        &self.output
    }

    /// Attention probabilities.
    ///
    /// These are the probabilities after dropout, so rows are only
    /// guaranteed to sum to one when the model is not trained.
    ///
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn probabilities(&self) -> &Tensor {
        &self.probabilities
    }

    /// Consume the output, returning the attention output tensor.
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Consume the output, returning the output and probabilities.
    pub fn into_parts(self) -> (Tensor, Tensor) {
        (self.output, self.probabilities)
    }
}

/// Trait implemented by modules that perform attention scoring.
pub trait AttentionScorer {
    /// Apply attention scores to the given key, query and value.
    /// Sequence elements that are marked with `false` in the attention mask
    /// are ignored by the attention mechanism (if a mask is provided).
    ///
    /// * `query` - Query tensor.
    ///   *Shape:* `(batch_size, heads, query_len, width)`
    /// * `key` - Key tensor.
    ///   *Shape:* `(batch_size, heads, key_len, width)`
    /// * `value` - Value tensor.
    ///   *Shape:* `(batch_size, heads, key_len, width)`
    /// * `attention_mask` - Attention mask. Sequence elements for which
    ///   the corresponding mask element is set to `false` are ignored in attention.
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: Attention values and probabilities.
    /// *Shape:* `(batch_size, heads, query_len, width)`
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&QueryKeyAttentionMask>,
        train: bool,
    ) -> Result<AttentionOutput, BoxedError>;
}

/// Build an attention scorer module.
pub trait BuildAttentionScorer: Debug {
    /// Build an attention scorer module.
    ///
    /// * `vb` - Variable builder used for attention parameters.
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn AttentionScorer>, BoxedError>;
}
