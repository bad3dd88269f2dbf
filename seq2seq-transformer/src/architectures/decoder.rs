use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::architectures::output::{LayerAttention, LayerOutputs};
use crate::architectures::BuildArchitecture;
use crate::error::BoxedError;
use crate::layers::attention::QueryKeyMask;

/// Output of a decoder stack.
pub struct DecoderOutput {
    layer_attention: Vec<LayerAttention>,
    layer_outputs: Vec<Tensor>,
    output: Tensor,
}

impl DecoderOutput {
    /// * `layer_outputs` - Stack input and the output of every layer.
    /// * `layer_attention` - Attention probabilities of every layer.
    /// * `output` - Normalized output of the last layer.
    pub fn new(
        layer_outputs: Vec<Tensor>,
        layer_attention: Vec<LayerAttention>,
        output: Tensor,
    ) -> Self {
        Self {
            layer_attention,
            layer_outputs,
            output,
        }
    }

    /// Decoder states that are passed to the generator.
    ///
    /// *Shape:* `(batch_size, tgt_len, hidden_width)`
    pub fn last_hidden(&self) -> &Tensor {
        &self.output
    }
}

impl LayerOutputs for DecoderOutput {
    fn layer_outputs(&self) -> &[Tensor] {
        &self.layer_outputs
    }

    fn layer_attention(&self) -> &[LayerAttention] {
        &self.layer_attention
    }

    fn output(&self) -> &Tensor {
        &self.output
    }
}

/// Stack of decoder layers that attend to an encoder memory.
pub trait Decoder {
    /// Decode embedded target sequences.
    ///
    /// * `input` - Embedded target pieces.
    ///   *Shape:* `(batch_size, tgt_len, hidden_width)`
    /// * `memory` - Encoder memory.
    ///   *Shape:* `(batch_size, src_len, hidden_width)`
    /// * `src_mask` - Source mask for encoder-decoder attention.
    ///   *Shape:* `(batch_size, 1, src_len)`
    /// * `tgt_mask` - Target mask for self-attention, normally hides both
    ///   padding and succeeding pieces.
    ///   *Shape:* `(batch_size, tgt_len, tgt_len)`
    /// * `train` - Whether dropout is active.
    fn forward_t(
        &self,
        input: &Tensor,
        memory: &Tensor,
        src_mask: &QueryKeyMask,
        tgt_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<DecoderOutput, BoxedError>;
}

/// Configurations that construct a decoder.
pub trait BuildDecoder: Debug {
    type Decoder: Decoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Decoder, BoxedError>;
}

impl<C> BuildDecoder for C
where
    C: BuildArchitecture + Debug,
    C::Architecture: Decoder,
{
    type Decoder = C::Architecture;

    fn build(&self, vb: VarBuilder) -> Result<Self::Decoder, BoxedError> {
        BuildArchitecture::build(self, vb)
    }
}

/// A single layer of a decoder stack.
pub trait DecoderLayer {
    /// Apply the layer.
    ///
    /// Arguments are the same as for [`Decoder::forward_t`], `input` is the
    /// output of the previous layer.
    ///
    /// Returns: the layer output and its attention probabilities.
    /// *Shape:* `(batch_size, tgt_len, hidden_width)`
    fn forward_t(
        &self,
        input: &Tensor,
        memory: &Tensor,
        src_mask: &QueryKeyMask,
        tgt_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<(Tensor, LayerAttention), BoxedError>;
}

/// Configurations that construct decoder layers.
pub trait BuildDecoderLayer: Debug {
    fn build_decoder_layer(&self, vb: VarBuilder) -> Result<Box<dyn DecoderLayer>, BoxedError>;
}
