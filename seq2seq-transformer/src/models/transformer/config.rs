use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::architectures::BuildArchitecture;
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::attention::{MultiHeadAttentionConfig, SDPAConfig};
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;
use crate::layers::feedforward::PointwiseFeedForwardConfig;
use crate::layers::layer_norm::LayerNormConfig;
use crate::layers::sublayer::SublayerConnectionConfig;
use crate::layers::transformer::{TransformerEmbeddingsConfig, TransformerLayerConfig};
use crate::models::transformer::{
    EncoderDecoder, EncoderDecoderConfig, GeneratorConfig, TransformerDecoderConfig,
    TransformerEncoderConfig,
};

/// Transformer model hyperparameters.
///
/// This is the flat configuration of a complete encoder-decoder model. It
/// can be deserialized from JSON, missing fields take the defaults of the
/// base model in Vaswani et al. (2017).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TransformerConfig {
    /// Source vocabulary size.
    pub n_src_pieces: usize,

    /// Target vocabulary size.
    pub n_tgt_pieces: usize,

    /// Number of encoder and decoder layers.
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,

    /// Hidden width of the model.
    #[serde(default = "default_hidden_width")]
    pub hidden_width: usize,

    /// Width of the feed-forward layers.
    #[serde(default = "default_intermediate_width")]
    pub intermediate_width: usize,

    /// Number of attention heads.
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,

    /// Dropout probability.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Maximum sequence length supported by the positional encodings.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// Layer norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// Activation of the feed-forward layers.
    #[serde(default)]
    pub activation: Activation,
}

fn default_n_layers() -> usize {
    6
}

fn default_hidden_width() -> usize {
    512
}

fn default_intermediate_width() -> usize {
    2048
}

fn default_n_heads() -> usize {
    8
}

fn default_dropout() -> f32 {
    0.1
}

fn default_max_seq_len() -> usize {
    5000
}

fn default_layer_norm_eps() -> f64 {
    1e-6
}

/// Errors for transformer model configuration.
#[derive(Debug, Snafu)]
pub enum TransformerConfigError {
    #[snafu(display("Cannot build model"))]
    BuildModel { source: BoxedError },

    #[snafu(display("Cannot parse model configuration"))]
    FromJson { source: serde_json::Error },

    #[snafu(display("The {vocab} vocabulary must not be empty"))]
    EmptyVocab { vocab: &'static str },
}

impl TransformerConfig {
    /// Configuration with the given vocabulary sizes and default
    /// hyperparameters.
    pub fn new(n_src_pieces: usize, n_tgt_pieces: usize) -> Self {
        Self {
            n_src_pieces,
            n_tgt_pieces,
            n_layers: default_n_layers(),
            hidden_width: default_hidden_width(),
            intermediate_width: default_intermediate_width(),
            n_heads: default_n_heads(),
            dropout: default_dropout(),
            max_seq_len: default_max_seq_len(),
            layer_norm_eps: default_layer_norm_eps(),
            activation: Activation::default(),
        }
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, TransformerConfigError> {
        serde_json::from_str(json).context(FromJsonSnafu)
    }

    /// Build a randomly initialized model.
    ///
    /// Parameters are created in `vb`. When `vb` is backed by a
    /// [`VarMap`], the parameters are trainable.
    pub fn build(&self, vb: VarBuilder) -> Result<EncoderDecoder, TransformerConfigError> {
        log::debug!(
            "Building transformer: {} layers, hidden width {}, intermediate width {}, {} heads, \
             dropout {}, source vocab {}, target vocab {}",
            self.n_layers,
            self.hidden_width,
            self.intermediate_width,
            self.n_heads,
            self.dropout,
            self.n_src_pieces,
            self.n_tgt_pieces
        );

        let config = EncoderDecoderConfig::try_from(self)?;
        BuildArchitecture::build(&config, vb).context(BuildModelSnafu)
    }

    fn dropout_module(&self) -> Box<dyn BuildModule> {
        Box::new(DropoutConfig::default().p(self.dropout))
    }

    fn layer_norm(&self) -> LayerNormConfig {
        LayerNormConfig::default()
            .eps(self.layer_norm_eps)
            .size(self.hidden_width)
    }

    fn embeddings(&self, n_pieces: usize) -> TransformerEmbeddingsConfig {
        TransformerEmbeddingsConfig::default()
            .dropout(self.dropout_module())
            .hidden_width(self.hidden_width)
            .max_len(self.max_seq_len)
            .n_pieces(n_pieces)
    }

    fn layer(&self) -> TransformerLayerConfig {
        let attention = MultiHeadAttentionConfig::default()
            .attention_scorer(Box::new(SDPAConfig::default().dropout(self.dropout_module())))
            .hidden_width(self.hidden_width)
            .n_heads(self.n_heads);

        let feedforward = PointwiseFeedForwardConfig::default()
            .activation(Box::new(self.activation))
            .dropout(self.dropout_module())
            .hidden_width(self.hidden_width)
            .intermediate_width(self.intermediate_width);

        let residual = SublayerConnectionConfig::default()
            .dropout(self.dropout_module())
            .layer_norm(self.layer_norm());

        TransformerLayerConfig::default()
            .attention(attention)
            .feedforward(feedforward)
            .residual(residual)
    }
}

impl TryFrom<&TransformerConfig> for EncoderDecoderConfig {
    type Error = TransformerConfigError;

    fn try_from(config: &TransformerConfig) -> Result<Self, Self::Error> {
        ensure!(config.n_src_pieces > 0, EmptyVocabSnafu { vocab: "source" });
        ensure!(config.n_tgt_pieces > 0, EmptyVocabSnafu { vocab: "target" });

        let encoder = TransformerEncoderConfig::default()
            .layer(Box::new(config.layer()))
            .n_hidden_layers(config.n_layers)
            .output_layer_norm(Box::new(config.layer_norm()));

        let decoder = TransformerDecoderConfig::default()
            .layer(Box::new(config.layer()))
            .n_hidden_layers(config.n_layers)
            .output_layer_norm(Box::new(config.layer_norm()));

        let generator = GeneratorConfig::default()
            .hidden_width(config.hidden_width)
            .n_pieces(config.n_tgt_pieces);

        Ok(Self::default()
            .decoder(Box::new(decoder))
            .encoder(Box::new(encoder))
            .generator(generator)
            .src_embeddings(Box::new(config.embeddings(config.n_src_pieces)))
            .tgt_embeddings(Box::new(config.embeddings(config.n_tgt_pieces))))
    }
}

/// Construct a randomly initialized encoder-decoder model.
///
/// Returns the model together with the [`VarMap`] that owns its
/// parameters, so that an optimizer can update them.
///
/// * `config` - Model hyperparameters.
/// * `device` - Device to allocate the parameters on.
pub fn make_model(
    config: &TransformerConfig,
    device: &Device,
) -> Result<(EncoderDecoder, VarMap), TransformerConfigError> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = config.build(vb)?;
    Ok((model, varmap))
}
