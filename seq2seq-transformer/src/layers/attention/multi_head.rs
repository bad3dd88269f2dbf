use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{
    AttentionOutput, AttentionScorer, BuildAttentionScorer, QueryKeyMask, QueryKeyMaskError,
    SDPAConfig,
};
use crate::layers::init::xavier_linear;

/// Multi-head attention configuration.
#[derive(Debug)]
pub struct MultiHeadAttentionConfig {
    attention_scorer: Box<dyn BuildAttentionScorer>,
    hidden_width: usize,
    n_heads: usize,
}

impl MultiHeadAttentionConfig {
    /// Attention scorer.
    ///
    /// Default: `SDPAConfig::default()`
    pub fn attention_scorer(mut self, attention_scorer: Box<dyn BuildAttentionScorer>) -> Self {
        self.attention_scorer = attention_scorer;
        self
    }

    /// Hidden width of the transformer.
    ///
    /// Default: `512`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Number of attention heads.
    ///
    /// Must evenly divide the hidden width.
    ///
    /// Default: `8`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Build a multi-head attention layer.
    pub fn build(&self, vb: VarBuilder) -> Result<MultiHeadAttention, MultiHeadAttentionError> {
        ensure!(
            self.n_heads > 0 && self.hidden_width % self.n_heads == 0,
            IncorrectNHeadsSnafu {
                n_heads: self.n_heads,
                hidden_width: self.hidden_width,
            }
        );

        let projection = |name: &str| {
            xavier_linear(self.hidden_width, self.hidden_width, vb.push_prefix(name))
                .context(ConstructionSnafu)
        };

        Ok(MultiHeadAttention {
            attention_scorer: self
                .attention_scorer
                .build(vb.clone())
                .context(BuildAttentionScorerSnafu)?,
            n_heads: self.n_heads,
            query: projection("query")?,
            key: projection("key")?,
            value: projection("value")?,
            output: projection("output")?,
        })
    }
}

impl Default for MultiHeadAttentionConfig {
    fn default() -> Self {
        Self {
            attention_scorer: Box::<SDPAConfig>::default(),
            hidden_width: 512,
            n_heads: 8,
        }
    }
}

/// Errors for multi-head attention.
#[derive(Debug, Snafu)]
pub enum MultiHeadAttentionError {
    #[snafu(display("Cannot apply attention scorer"))]
    AttentionScorer { source: BoxedError },

    #[snafu(display("Cannot build attention scorer"))]
    BuildAttentionScorer { source: BoxedError },

    #[snafu(display("Cannot combine heads"))]
    CombineHeads { source: candle_core::Error },

    #[snafu(display("Cannot construct layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot add head dimension to attention mask"))]
    ExpandMask { source: QueryKeyMaskError },

    #[snafu(display(
        "Hidden width ({hidden_width}) must be a multiple of the number of heads ({n_heads})"
    ))]
    IncorrectNHeads { n_heads: usize, hidden_width: usize },

    #[snafu(display("Cannot apply output layer"))]
    Output { source: candle_core::Error },

    #[snafu(display("Cannot calculate key, query, or value"))]
    Qkv { source: candle_core::Error },

    #[snafu(display("Cannot split heads"))]
    SplitHeads { source: candle_core::Error },
}

/// Multi-head attention.
///
/// Queries, keys, and values are projected separately, split into heads,
/// scored by the attention scorer and combined again. The same layer is
/// used for self-attention (query, key, and value are the same tensor) and
/// for encoder-decoder attention (key and value are the encoder output).
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct MultiHeadAttention {
    attention_scorer: Box<dyn AttentionScorer>,
    n_heads: usize,
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
}

impl MultiHeadAttention {
    /// Apply multi-head attention.
    ///
    /// * `query` - Query representations.
    ///   *Shape:* `(batch_size, query_len, hidden_width)`
    /// * `key` - Key representations.
    ///   *Shape:* `(batch_size, key_len, hidden_width)`
    /// * `value` - Value representations.
    ///   *Shape:* `(batch_size, key_len, hidden_width)`
    /// * `attention_mask` - Query-key mask, broadcast over heads.
    ///   *Shape:* `(batch_size, query_len, key_len)`
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: *Shape:* `(batch_size, query_len, hidden_width)`
    pub fn forward_t(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&QueryKeyMask>,
        train: bool,
    ) -> Result<Tensor, MultiHeadAttentionError> {
        self.forward_with_probs(query, key, value, attention_mask, train)
            .map(AttentionOutput::into_output)
    }

    /// Apply multi-head attention, also returning the attention probabilities.
    ///
    /// See [`MultiHeadAttention::forward_t`]. The probabilities have shape
    /// `(batch_size, n_heads, query_len, key_len)`.
    pub fn forward_with_probs(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&QueryKeyMask>,
        train: bool,
    ) -> Result<AttentionOutput, MultiHeadAttentionError> {
        let attention_mask = attention_mask
            .map(QueryKeyMask::expand_heads)
            .transpose()
            .context(ExpandMaskSnafu)?;

        let query = self
            .query
            .forward(query)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;
        let key = self
            .key
            .forward(key)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;
        let value = self
            .value
            .forward(value)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;

        let attn = self
            .attention_scorer
            .forward(&query, &key, &value, attention_mask.as_ref(), train)
            .context(AttentionScorerSnafu)?;

        let output = attn
            .output()
            .combine_heads()?
            .apply(&self.output)
            .context(OutputSnafu)?;

        Ok(AttentionOutput::new(output, attn.probabilities().clone()))
    }
}

trait CombineHeads {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadAttentionError>;
}

impl CombineHeads for Tensor {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadAttentionError> {
        let (batch_size, n_heads, seq_len, head_width) =
            self.dims4().context(CombineHeadsSnafu)?;
        self.transpose(1, 2)
            .and_then(|heads| heads.reshape((batch_size, seq_len, n_heads * head_width)))
            .context(CombineHeadsSnafu)
    }
}

trait SplitHeads {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadAttentionError>;
}

impl SplitHeads for Tensor {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadAttentionError> {
        let (batch_size, seq_len, model_width) = self.dims3().context(SplitHeadsSnafu)?;
        let head_width = model_width / n_heads;
        self.reshape((batch_size, seq_len, n_heads, head_width))
            .and_then(|heads| heads.transpose(1, 2))
            .context(SplitHeadsSnafu)
    }
}
