use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::architectures::output::{LayerAttention, LayerOutputs};
use crate::architectures::BuildArchitecture;
use crate::error::BoxedError;
use crate::layers::attention::QueryKeyMask;

/// Output of an encoder stack.
pub struct EncoderOutput {
    layer_attention: Vec<LayerAttention>,
    layer_outputs: Vec<Tensor>,
    output: Tensor,
}

impl EncoderOutput {
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

    /// The memory that a decoder attends to.
    ///
    /// *Shape:* `(batch_size, src_len, hidden_width)`
    pub fn memory(&self) -> &Tensor {
        &self.output
    }
}

impl LayerOutputs for EncoderOutput {
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

/// Stack of encoder layers.
pub trait Encoder {
    /// Encode embedded source sequences.
    ///
    /// * `input` - Embedded source pieces.
    ///   *Shape:* `(batch_size, src_len, hidden_width)`
    /// * `attention_mask` - Source mask, pieces for which the mask is zero
    ///   are not attended to.
    ///   *Shape:* `(batch_size, 1, src_len)`
    /// * `train` - Whether dropout is active.
    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<EncoderOutput, BoxedError>;
}

/// Configurations that construct an encoder.
pub trait BuildEncoder: Debug {
    type Encoder: Encoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Encoder, BoxedError>;
}

impl<C> BuildEncoder for C
where
    C: BuildArchitecture + Debug,
    C::Architecture: Encoder,
{
    type Encoder = C::Architecture;

    fn build(&self, vb: VarBuilder) -> Result<Self::Encoder, BoxedError> {
        BuildArchitecture::build(self, vb)
    }
}

/// A single layer of an encoder stack.
pub trait EncoderLayer {
    /// Apply the layer.
    ///
    /// * `input` - Output of the previous layer.
    ///   *Shape:* `(batch_size, src_len, hidden_width)`
    /// * `attention_mask` - Source mask.
    ///   *Shape:* `(batch_size, 1, src_len)`
    /// * `train` - Whether dropout is active.
    ///
    /// Returns: the layer output and its attention probabilities.
    /// *Shape:* `(batch_size, src_len, hidden_width)`
    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<(Tensor, LayerAttention), BoxedError>;
}

/// Configurations that construct encoder layers.
///
/// An encoder stack calls the builder once per layer, every layer gets its
/// own parameters.
pub trait BuildEncoderLayer: Debug {
    fn build_encoder_layer(&self, vb: VarBuilder) -> Result<Box<dyn EncoderLayer>, BoxedError>;
}
