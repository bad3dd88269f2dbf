use candle_core::{IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use snafu::{ensure, ResultExt, Snafu};

use crate::architectures::{
    BuildArchitecture, BuildDecoder, BuildEmbeddings, BuildEncoder, Decoder, DecoderOutput,
    Embeddings, Encoder, EncoderOutput,
};
use crate::error::BoxedError;
use crate::layers::attention::{QueryKeyMask, QueryKeyMaskError};
use crate::layers::transformer::TransformerEmbeddingsConfig;
use crate::models::transformer::{
    Generator, GeneratorConfig, GeneratorError, TransformerDecoder, TransformerDecoderConfig,
    TransformerEncoder, TransformerEncoderConfig,
};

/// Encoder-decoder configuration.
#[derive(Debug)]
pub struct EncoderDecoderConfig {
    decoder: Box<dyn BuildDecoder<Decoder = TransformerDecoder>>,
    encoder: Box<dyn BuildEncoder<Encoder = TransformerEncoder>>,
    generator: GeneratorConfig,
    src_embeddings: Box<dyn BuildEmbeddings>,
    tgt_embeddings: Box<dyn BuildEmbeddings>,
}

impl EncoderDecoderConfig {
    /// Decoder.
    ///
    /// Default: `TransformerDecoderConfig::default()`
    pub fn decoder(mut self, decoder: Box<dyn BuildDecoder<Decoder = TransformerDecoder>>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Encoder.
    ///
    /// Default: `TransformerEncoderConfig::default()`
    pub fn encoder(mut self, encoder: Box<dyn BuildEncoder<Encoder = TransformerEncoder>>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Generator.
    ///
    /// Default: `GeneratorConfig::default()`
    pub fn generator(mut self, generator: GeneratorConfig) -> Self {
        self.generator = generator;
        self
    }

    /// Source piece embeddings.
    ///
    /// Default: `TransformerEmbeddingsConfig::default()`
    pub fn src_embeddings(mut self, src_embeddings: Box<dyn BuildEmbeddings>) -> Self {
        self.src_embeddings = src_embeddings;
        self
    }

    /// Target piece embeddings.
    ///
    /// Default: `TransformerEmbeddingsConfig::default()`
    pub fn tgt_embeddings(mut self, tgt_embeddings: Box<dyn BuildEmbeddings>) -> Self {
        self.tgt_embeddings = tgt_embeddings;
        self
    }
}

impl Default for EncoderDecoderConfig {
    fn default() -> Self {
        Self {
            decoder: Box::<TransformerDecoderConfig>::default(),
            encoder: Box::<TransformerEncoderConfig>::default(),
            generator: GeneratorConfig::default(),
            src_embeddings: Box::<TransformerEmbeddingsConfig>::default(),
            tgt_embeddings: Box::<TransformerEmbeddingsConfig>::default(),
        }
    }
}

impl BuildArchitecture for EncoderDecoderConfig {
    type Architecture = EncoderDecoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        Ok(EncoderDecoder {
            decoder: Box::new(
                self.decoder
                    .build(vb.push_prefix("decoder"))
                    .context(BuildDecoderSnafu)?,
            ),
            encoder: Box::new(
                self.encoder
                    .build(vb.push_prefix("encoder"))
                    .context(BuildEncoderSnafu)?,
            ),
            generator: self
                .generator
                .build(vb.push_prefix("generator"))
                .context(BuildGeneratorSnafu)?,
            src_embeddings: self
                .src_embeddings
                .build(vb.push_prefix("src_embeddings"))
                .context(BuildEmbeddingsSnafu)?,
            tgt_embeddings: self
                .tgt_embeddings
                .build(vb.push_prefix("tgt_embeddings"))
                .context(BuildEmbeddingsSnafu)?,
        })
    }
}

/// `EncoderDecoder` errors.
#[derive(Debug, Snafu)]
pub enum EncoderDecoderError {
    #[snafu(display("Cannot build decoder"))]
    BuildDecoder { source: BoxedError },

    #[snafu(display("Cannot build embeddings"))]
    BuildEmbeddings { source: BoxedError },

    #[snafu(display("Cannot build encoder"))]
    BuildEncoder { source: BoxedError },

    #[snafu(display("Cannot build generator"))]
    BuildGenerator { source: GeneratorError },

    #[snafu(display("Cannot create causal mask"))]
    CausalMask { source: QueryKeyMaskError },

    #[snafu(display("Cannot decode target sequence"))]
    Decode { source: BoxedError },

    #[snafu(display("Cannot encode source sequence"))]
    Encode { source: BoxedError },

    #[snafu(display("Cannot apply generator"))]
    Generator { source: GeneratorError },

    #[snafu(display("Cannot select next piece"))]
    GreedyDecode { source: candle_core::Error },

    #[snafu(display("Decoding length must be at least 1"))]
    MaxLen,
}

/// Transformer encoder-decoder model (Vaswani et al., 2017).
///
/// The encoder maps the embedded source pieces to a memory. The decoder
/// attends to that memory while processing the embedded target pieces. The
/// generator maps decoder outputs to log-probabilities over the target
/// vocabulary.
///
/// See [Attention Is All You Need](https://arxiv.org/abs/1706.03762).
pub struct EncoderDecoder {
    decoder: Box<dyn Decoder>,
    encoder: Box<dyn Encoder>,
    generator: Generator,
    src_embeddings: Box<dyn Embeddings>,
    tgt_embeddings: Box<dyn Embeddings>,
}

impl EncoderDecoder {
    /// Encode a source sequence.
    ///
    /// * `src` - Source piece identifiers.
    ///   *Shape:* `(batch_size, src_len)`
    /// * `src_mask` - Source mask.
    ///   *Shape:* `(batch_size, 1, src_len)`
    /// * `train` - Whether to train the model.
    ///
    /// Returns: the encoder memory.
    /// *Shape:* `(batch_size, src_len, hidden_width)`
    pub fn encode(
        &self,
        src: &Tensor,
        src_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<Tensor, EncoderDecoderError> {
        self.encode_with_attention(src, src_mask, train)
            .map(|output| output.memory().clone())
    }

    /// Encode a source sequence, keeping the output and attention
    /// probabilities of every encoder layer.
    ///
    /// Arguments are the same as for [`EncoderDecoder::encode`].
    pub fn encode_with_attention(
        &self,
        src: &Tensor,
        src_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<EncoderOutput, EncoderDecoderError> {
        let embeddings = self
            .src_embeddings
            .forward(src, train)
            .context(EncodeSnafu)?;
        self.encoder
            .forward_t(&embeddings, src_mask, train)
            .context(EncodeSnafu)
    }

    /// Decode a target sequence given the encoder memory.
    ///
    /// * `memory` - Encoder memory.
    ///   *Shape:* `(batch_size, src_len, hidden_width)`
    /// * `src_mask` - Source mask.
    ///   *Shape:* `(batch_size, 1, src_len)`
    /// * `tgt` - Target piece identifiers.
    ///   *Shape:* `(batch_size, tgt_len)`
    /// * `tgt_mask` - Target mask, hides padding and succeeding pieces.
    ///   *Shape:* `(batch_size, tgt_len, tgt_len)`
    /// * `train` - Whether to train the model.
    ///
    /// Returns: *Shape:* `(batch_size, tgt_len, hidden_width)`
    pub fn decode(
        &self,
        memory: &Tensor,
        src_mask: &QueryKeyMask,
        tgt: &Tensor,
        tgt_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<Tensor, EncoderDecoderError> {
        self.decode_with_attention(memory, src_mask, tgt, tgt_mask, train)
            .map(|output| output.last_hidden().clone())
    }

    /// Decode a target sequence, keeping the output and the self-attention
    /// and encoder-decoder attention probabilities of every decoder layer.
    ///
    /// Arguments are the same as for [`EncoderDecoder::decode`].
    pub fn decode_with_attention(
        &self,
        memory: &Tensor,
        src_mask: &QueryKeyMask,
        tgt: &Tensor,
        tgt_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<DecoderOutput, EncoderDecoderError> {
        let embeddings = self
            .tgt_embeddings
            .forward(tgt, train)
            .context(DecodeSnafu)?;
        self.decoder
            .forward_t(&embeddings, memory, src_mask, tgt_mask, train)
            .context(DecodeSnafu)
    }

    /// Encode the source and decode the target sequence.
    ///
    /// Returns the decoder output, apply the [`Generator`] to get
    /// log-probabilities (see [`EncoderDecoder::log_probs`]).
    ///
    /// Returns: *Shape:* `(batch_size, tgt_len, hidden_width)`
    pub fn forward_t(
        &self,
        src: &Tensor,
        tgt: &Tensor,
        src_mask: &QueryKeyMask,
        tgt_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<Tensor, EncoderDecoderError> {
        let memory = self.encode(src, src_mask, train)?;
        self.decode(&memory, src_mask, tgt, tgt_mask, train)
    }

    /// Log-probabilities of the target vocabulary for every target position.
    ///
    /// Returns: *Shape:* `(batch_size, tgt_len, n_tgt_pieces)`
    pub fn log_probs(
        &self,
        src: &Tensor,
        tgt: &Tensor,
        src_mask: &QueryKeyMask,
        tgt_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<Tensor, EncoderDecoderError> {
        let hidden = self.forward_t(src, tgt, src_mask, tgt_mask, train)?;
        self.generator.forward(&hidden).context(GeneratorSnafu)
    }

    /// Get the generator.
    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Decode greedily, picking the most probable piece at every step.
    ///
    /// * `src` - Source piece identifiers.
    ///   *Shape:* `(batch_size, src_len)`
    /// * `src_mask` - Source mask.
    ///   *Shape:* `(batch_size, 1, src_len)`
    /// * `max_len` - Length of the decoded sequences, including the start
    ///   piece.
    /// * `start_id` - Piece identifier that starts every target sequence.
    ///
    /// Returns: the decoded piece identifiers.
    /// *Shape:* `(batch_size, max_len)`
    pub fn greedy_decode(
        &self,
        src: &Tensor,
        src_mask: &QueryKeyMask,
        max_len: usize,
        start_id: u32,
    ) -> Result<Tensor, EncoderDecoderError> {
        ensure!(max_len > 0, MaxLenSnafu);

        let memory = self.encode(src, src_mask, false)?;
        let batch_size = src.dim(0).context(GreedyDecodeSnafu)?;
        let mut output =
            Tensor::full(start_id, (batch_size, 1), src.device()).context(GreedyDecodeSnafu)?;

        for len in 1..max_len {
            let tgt_mask = QueryKeyMask::causal(len, src.device()).context(CausalMaskSnafu)?;
            let hidden = self.decode(&memory, src_mask, &output, &tgt_mask, false)?;
            let last = hidden.i((.., len - 1)).context(GreedyDecodeSnafu)?;
            let next = self
                .generator
                .forward(&last)
                .context(GeneratorSnafu)?
                .argmax_keepdim(D::Minus1)
                .context(GreedyDecodeSnafu)?;
            output = Tensor::cat(&[&output, &next], 1).context(GreedyDecodeSnafu)?;
        }

        Ok(output)
    }
}
