//! Transformer encoder.
use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::architectures::BuildArchitecture;
use crate::architectures::{BuildEncoderLayer, Encoder, EncoderLayer, EncoderOutput};
use crate::error::BoxedError;
use crate::layers::attention::QueryKeyMask;
use crate::layers::build_module::BuildModule;
use crate::layers::layer_norm::LayerNormConfig;
use crate::layers::transformer::TransformerLayerConfig;

/// Transformer encoder configuration.
#[derive(Debug)]
pub struct TransformerEncoderConfig {
    layer: Box<dyn BuildEncoderLayer>,
    n_hidden_layers: usize,
    output_layer_norm: Box<dyn BuildModule>,
}

impl TransformerEncoderConfig {
    /// Encoder layer.
    ///
    /// Default: `TransformerLayerConfig::default()`
    pub fn layer(mut self, layer: Box<dyn BuildEncoderLayer>) -> Self {
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

impl BuildArchitecture for TransformerEncoderConfig {
    type Architecture = TransformerEncoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        log::trace!("Building encoder with {} layers", self.n_hidden_layers);

        let layers = (0..self.n_hidden_layers)
            .map(|layer| {
                self.layer
                    .build_encoder_layer(vb.push_prefix(format!("layer_{layer}")))
                    .context(BuildLayerSnafu { layer })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TransformerEncoder {
            layers,
            output_layer_norm: self
                .output_layer_norm
                .build(vb.push_prefix("output_layer_norm"))
                .context(BuildOutputLayerNormSnafu)?,
        })
    }
}

impl Default for TransformerEncoderConfig {
    fn default() -> Self {
        Self {
            layer: Box::<TransformerLayerConfig>::default(),
            n_hidden_layers: 6,
            output_layer_norm: Box::<LayerNormConfig>::default(),
        }
    }
}

/// Transformer encoder errors.
#[derive(Debug, Snafu)]
pub enum TransformerEncoderError {
    #[snafu(display("Cannot build encoder layer {layer}"))]
    BuildLayer { layer: usize, source: BoxedError },

    #[snafu(display("Cannot build encoder output normalization"))]
    BuildOutputLayerNorm { source: BoxedError },

    #[snafu(display("Cannot apply encoder layer {layer}"))]
    Layer { layer: usize, source: BoxedError },

    #[snafu(display("Cannot normalize encoder output"))]
    OutputLayerNorm { source: candle_core::Error },
}

/// Encoder using the transformer architecture.
///
/// A stack of identically configured, independently parametrized layers
/// followed by a layer normalization of the last layer's output.
pub struct TransformerEncoder {
    layers: Vec<Box<dyn EncoderLayer>>,
    output_layer_norm: Box<dyn ModuleT>,
}

impl Encoder for TransformerEncoder {
    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<EncoderOutput, BoxedError> {
        let mut hidden = input.clone();
        let mut layer_outputs = Vec::with_capacity(self.layers.len() + 1);
        let mut layer_attention = Vec::with_capacity(self.layers.len());
        for (idx, layer) in self.layers.iter().enumerate() {
            let (output, attention) = layer
                .forward_t(&hidden, attention_mask, train)
                .context(LayerSnafu { layer: idx })?;
            layer_outputs.push(std::mem::replace(&mut hidden, output));
            layer_attention.push(attention);
        }

        let output = self
            .output_layer_norm
            .forward_t(&hidden, train)
            .context(OutputLayerNormSnafu)?;
        layer_outputs.push(hidden);

        Ok(EncoderOutput::new(layer_outputs, layer_attention, output))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor, D};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, ResultExt, Whatever};

    use super::TransformerEncoderConfig;
    use crate::architectures::{BuildEncoder, Encoder, LayerOutputs};
    use crate::layers::attention::{AttentionMask, MultiHeadAttentionConfig, QueryKeyMask};
    use crate::layers::feedforward::PointwiseFeedForwardConfig;
    use crate::layers::layer_norm::LayerNormConfig;
    use crate::layers::sublayer::SublayerConnectionConfig;
    use crate::layers::transformer::TransformerLayerConfig;
    use crate::util::tests::PseudoRandom;

    fn small_encoder(n_layers: usize) -> TransformerEncoderConfig {
        let layer = TransformerLayerConfig::default()
            .attention(MultiHeadAttentionConfig::default().hidden_width(8).n_heads(2))
            .feedforward(
                PointwiseFeedForwardConfig::default()
                    .hidden_width(8)
                    .intermediate_width(32),
            )
            .residual(
                SublayerConnectionConfig::default().layer_norm(LayerNormConfig::default().size(8)),
            );
        TransformerEncoderConfig::default()
            .layer(Box::new(layer))
            .n_hidden_layers(n_layers)
            .output_layer_norm(Box::new(LayerNormConfig::default().size(8)))
    }

    #[test]
    #[report]
    fn encoder_outputs_every_layer() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = BuildEncoder::build(&small_encoder(3), vb)
            .whatever_context("Cannot build encoder")?;

        let input = Tensor::pseudo_random(&[2, 4, 8], &device);
        let mask = QueryKeyMask::try_from(
            AttentionMask::new(
                Tensor::new(&[[1u8, 1, 1, 1], [1, 1, 0, 0]], &device)
                    .whatever_context("Cannot create mask tensor")?,
            )
            .whatever_context("Cannot create attention mask")?,
        )
        .whatever_context("Cannot create query-key mask")?;

        let output = encoder
            .forward_t(&input, &mask, false)
            .whatever_context("Cannot encode")?;
        assert_eq!(output.layer_outputs().len(), 4);
        assert_eq!(output.layer_attention().len(), 3);
        for attention in output.layer_attention() {
            assert_eq!(attention.self_attention().dims(), &[2, 2, 4, 4]);
        }

        let memory = output.memory();
        assert_eq!(memory.dims(), &[2, 4, 8]);

        // Memory is normalized: zero mean over the hidden dimension.
        let max_mean = memory
            .mean_keepdim(D::Minus1)
            .and_then(|mean| mean.abs())
            .and_then(|mean| mean.flatten_all())
            .and_then(|mean| mean.max(0))
            .and_then(|mean| mean.to_scalar::<f32>())
            .whatever_context("Cannot compute mean")?;
        assert!(max_mean < 1e-5);

        Ok(())
    }

    #[test]
    fn layers_are_independently_parametrized() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        BuildEncoder::build(&small_encoder(2), vb).unwrap();

        let data = varmap.data().lock().unwrap();
        let first = data["layer_0.self_attention.query.weight"]
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap();
        let second = data["layer_1.self_attention.query.weight"]
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap();
        assert_ne!(first, second);
        assert!(data.contains_key("output_layer_norm.weight"));
    }
}
