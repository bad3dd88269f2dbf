use candle_core::Tensor;

/// Attention probabilities of a single encoder or decoder layer.
#[derive(Clone, Debug)]
pub struct LayerAttention {
    self_attention: Tensor,
    cross_attention: Option<Tensor>,
}

impl LayerAttention {
    /// Attention probabilities of an encoder layer.
    pub fn encoder(self_attention: Tensor) -> Self {
        Self {
            self_attention,
            cross_attention: None,
        }
    }

    /// Attention probabilities of a decoder layer.
    pub fn decoder(self_attention: Tensor, cross_attention: Tensor) -> Self {
        Self {
            self_attention,
            cross_attention: Some(cross_attention),
        }
    }

    /// Self-attention probabilities.
    ///
    /// *Shape:* `(batch_size, n_heads, seq_len, seq_len)`
    pub fn self_attention(&self) -> &Tensor {
        &self.self_attention
    }

    /// Encoder-decoder attention probabilities, `None` for encoder layers.
    ///
    /// *Shape:* `(batch_size, n_heads, tgt_len, src_len)`
    pub fn cross_attention(&self) -> Option<&Tensor> {
        self.cross_attention.as_ref()
    }
}

/// Hidden representations produced by a stack of layers.
pub trait LayerOutputs {
    /// The input of the stack followed by the output of every layer.
    ///
    /// These are the representations before the final normalization of
    /// the stack.
    fn layer_outputs(&self) -> &[Tensor];

    /// Attention probabilities of every layer, in layer order.
    fn layer_attention(&self) -> &[LayerAttention];

    /// Output of the stack, the normalized output of its last layer.
    fn output(&self) -> &Tensor;
}
