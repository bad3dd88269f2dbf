/// Transformer decoder.
use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::architectures::BuildArchitecture;
use crate::architectures::{BuildDecoderLayer, Decoder, DecoderLayer, DecoderOutput};
use crate::error::BoxedError;
use crate::layers::attention::QueryKeyMask;
use crate::layers::build_module::BuildModule;
use crate::layers::layer_norm::LayerNormConfig;
use crate::layers::transformer::TransformerLayerConfig;

/// Transformer decoder configuration.
#[derive(Debug)]
pub struct TransformerDecoderConfig {
    layer: Box<dyn BuildDecoderLayer>,
    n_hidden_layers: usize,
    output_layer_norm: Box<dyn BuildModule>,
}

impl TransformerDecoderConfig {
    /// Decoder layer.
    ///
    /// Default: `TransformerLayerConfig::default()`
    pub fn layer(mut self, layer: Box<dyn BuildDecoderLayer>) -> Self {
        self.layer = layer;
        self
    }

    /// Number of hidden layers.
    ///
    /// Default: `6`
    pub fn n_hidden_layers(mut self, n_hidden_layers: usize) -> Self {
        self.n_hidden_layers = n_hidden_layers;
        self
    }

    /// Output layer normalization module.
    ///
    /// Default: `LayerNormConfig::default()`
    pub fn output_layer_norm(mut self, output_layer_norm: Box<dyn BuildModule>) -> Self {
        self.output_layer_norm = output_layer_norm;
        self
    }
}

impl BuildArchitecture for TransformerDecoderConfig {
    type Architecture = TransformerDecoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        log::trace!("Building decoder with {} layers", self.n_hidden_layers);

        let layers = (0..self.n_hidden_layers)
            .map(|layer| {
                self.layer
                    .build_decoder_layer(vb.push_prefix(format!("layer_{layer}")))
                    .context(BuildLayerSnafu { layer })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TransformerDecoder {
            layers,
            output_layer_norm: self
                .output_layer_norm
                .build(vb.push_prefix("output_layer_norm"))
                .context(BuildOutputLayerNormSnafu)?,
        })
    }
}

impl Default for TransformerDecoderConfig {
    fn default() -> Self {
        Self {
            layer: Box::<TransformerLayerConfig>::default(),
            n_hidden_layers: 6,
            output_layer_norm: Box::<LayerNormConfig>::default(),
        }
    }
}

/// Transformer decoder errors.
#[derive(Debug, Snafu)]
pub enum TransformerDecoderError {
    #[snafu(display("Cannot build decoder layer {layer}"))]
    BuildLayer { layer: usize, source: BoxedError },

    #[snafu(display("Cannot build decoder output normalization"))]
    BuildOutputLayerNorm { source: BoxedError },

    #[snafu(display("Cannot apply decoder layer {layer}"))]
    Layer { layer: usize, source: BoxedError },

    #[snafu(display("Cannot normalize decoder output"))]
    OutputLayerNorm { source: candle_core::Error },
}

/// Decoder using the transformer architecture.
pub struct TransformerDecoder {
    layers: Vec<Box<dyn DecoderLayer>>,
    output_layer_norm: Box<dyn ModuleT>,
}

impl Decoder for TransformerDecoder {
    fn forward_t(
        &self,
        input: &Tensor,
        memory: &Tensor,
        src_mask: &QueryKeyMask,
        tgt_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<DecoderOutput, BoxedError> {
        let mut hidden = input.clone();
        let mut layer_outputs = Vec::with_capacity(self.layers.len() + 1);
        let mut layer_attention = Vec::with_capacity(self.layers.len());
        for (idx, layer) in self.layers.iter().enumerate() {
            let (output, attention) = layer
                .forward_t(&hidden, memory, src_mask, tgt_mask, train)
                .context(LayerSnafu { layer: idx })?;
            layer_outputs.push(std::mem::replace(&mut hidden, output));
            layer_attention.push(attention);
        }

        let output = self
            .output_layer_norm
            .forward_t(&hidden, train)
            .context(OutputLayerNormSnafu)?;
        layer_outputs.push(hidden);

        Ok(DecoderOutput::new(layer_outputs, layer_attention, output))
    }
}
