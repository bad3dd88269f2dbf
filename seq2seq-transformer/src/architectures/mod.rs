//! Traits at the seams between model components.
use candle_nn::VarBuilder;

mod decoder;
pub use decoder::{BuildDecoder, BuildDecoderLayer, Decoder, DecoderLayer, DecoderOutput};

mod embeddings;
pub use embeddings::{BuildEmbeddings, Embeddings};

mod encoder;
pub use encoder::{BuildEncoder, BuildEncoderLayer, Encoder, EncoderLayer, EncoderOutput};

mod output;
pub use output::{LayerAttention, LayerOutputs};

use crate::error::BoxedError;

/// Configurations that construct a model component.
pub trait BuildArchitecture {
    type Architecture;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError>;
}
