/// Transformer building blocks.
use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::architectures::{
    BuildDecoderLayer, BuildEncoderLayer, DecoderLayer, EncoderLayer, LayerAttention,
};
use crate::error::BoxedError;
use crate::layers::attention::{
    MultiHeadAttention, MultiHeadAttentionConfig, MultiHeadAttentionError, QueryKeyMask,
};
use crate::layers::feedforward::{
    PointwiseFeedForward, PointwiseFeedForwardConfig, PointwiseFeedForwardError,
};
use crate::layers::sublayer::{
    SublayerConnection, SublayerConnectionConfig, SublayerConnectionError,
};

/// Transformer layer configuration.
///
/// The same configuration builds encoder layers (self-attention and
/// feed-forward) and decoder layers (self-attention, encoder-decoder
/// attention, and feed-forward). Every sublayer is wrapped in a pre-norm
/// residual connection.
#[derive(Debug, Default)]
pub struct TransformerLayerConfig {
    attention: MultiHeadAttentionConfig,
    feedforward: PointwiseFeedForwardConfig,
    residual: SublayerConnectionConfig,
}

impl TransformerLayerConfig {
    /// Attention layer configuration.
    ///
    /// Used for self-attention and for encoder-decoder attention.
    ///
    /// Default: `MultiHeadAttentionConfig::default()`
    pub fn attention(mut self, attention: MultiHeadAttentionConfig) -> Self {
        self.attention = attention;
        self
    }

    /// Feed-forward layer configuration.
    ///
    /// Default: `PointwiseFeedForwardConfig::default()`
    pub fn feedforward(mut self, feedforward: PointwiseFeedForwardConfig) -> Self {
        self.feedforward = feedforward;
        self
    }

    /// Residual connection configuration.
    ///
    /// Default: `SublayerConnectionConfig::default()`
    pub fn residual(mut self, residual: SublayerConnectionConfig) -> Self {
        self.residual = residual;
        self
    }

    fn build_residual(
        &self,
        vb: VarBuilder,
        name: &str,
    ) -> Result<SublayerConnection, TransformerLayerError> {
        self.residual
            .build(vb.push_prefix(name))
            .context(BuildResidualSnafu)
    }
}

impl BuildEncoderLayer for TransformerLayerConfig {
    fn build_encoder_layer(&self, vb: VarBuilder) -> Result<Box<dyn EncoderLayer>, BoxedError> {
        Ok(Box::new(TransformerEncoderLayer {
            self_attention: self
                .attention
                .build(vb.push_prefix("self_attention"))
                .context(BuildAttentionSnafu)?,
            self_attention_residual: self.build_residual(vb.clone(), "self_attention_residual")?,
            ffn: self
                .feedforward
                .build(vb.push_prefix("ffn"))
                .context(BuildFeedForwardSnafu)?,
            ffn_residual: self.build_residual(vb, "ffn_residual")?,
        }))
    }
}

impl BuildDecoderLayer for TransformerLayerConfig {
    fn build_decoder_layer(&self, vb: VarBuilder) -> Result<Box<dyn DecoderLayer>, BoxedError> {
        Ok(Box::new(TransformerDecoderLayer {
            self_attention: self
                .attention
                .build(vb.push_prefix("self_attention"))
                .context(BuildAttentionSnafu)?,
            self_attention_residual: self.build_residual(vb.clone(), "self_attention_residual")?,
            cross_attention: self
                .attention
                .build(vb.push_prefix("cross_attention"))
                .context(BuildAttentionSnafu)?,
            cross_attention_residual: self
                .build_residual(vb.clone(), "cross_attention_residual")?,
            ffn: self
                .feedforward
                .build(vb.push_prefix("ffn"))
                .context(BuildFeedForwardSnafu)?,
            ffn_residual: self.build_residual(vb, "ffn_residual")?,
        }))
    }
}

/// Errors for transformer layers.
#[derive(Debug, Snafu)]
pub enum TransformerLayerError {
    #[snafu(display("Cannot build attention layer"))]
    BuildAttention { source: MultiHeadAttentionError },

    #[snafu(display("Cannot build point-wise feed-forward layer"))]
    BuildFeedForward { source: PointwiseFeedForwardError },

    #[snafu(display("Cannot build residual connection"))]
    BuildResidual { source: SublayerConnectionError },

    #[snafu(display("Cannot apply encoder-decoder attention"))]
    CrossAttention { source: SublayerConnectionError },

    #[snafu(display("Cannot apply point-wise feed-forward layer"))]
    FeedForward { source: SublayerConnectionError },

    #[snafu(display("Cannot apply self-attention"))]
    SelfAttention { source: SublayerConnectionError },
}

/// Apply the feed-forward sublayer with its residual connection.
fn feedforward_block(
    ffn: &PointwiseFeedForward,
    residual: &SublayerConnection,
    input: &Tensor,
    train: bool,
) -> Result<Tensor, TransformerLayerError> {
    residual
        .forward_t(input, |xs| Ok(ffn.forward_t(xs, train)?), train)
        .context(FeedForwardSnafu)
}

/// Transformer encoder layer.
///
/// See [Vaswani et al. (2017)](https://arxiv.org/abs/1706.03762).
pub struct TransformerEncoderLayer {
    self_attention: MultiHeadAttention,
    self_attention_residual: SublayerConnection,
    ffn: PointwiseFeedForward,
    ffn_residual: SublayerConnection,
}

impl EncoderLayer for TransformerEncoderLayer {
    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<(Tensor, LayerAttention), BoxedError> {
        let (hidden, self_attention) = self
            .self_attention_residual
            .forward_with_output(
                input,
                |xs| {
                    Ok(self
                        .self_attention
                        .forward_with_probs(xs, xs, xs, Some(attention_mask), train)?
                        .into_parts())
                },
                train,
            )
            .context(SelfAttentionSnafu)?;

        let output = feedforward_block(&self.ffn, &self.ffn_residual, &hidden, train)?;

        Ok((output, LayerAttention::encoder(self_attention)))
    }
}

/// Transformer decoder layer.
///
/// In addition to the sublayers of the encoder layer, the decoder layer
/// attends to the encoder output between self-attention and the
/// feed-forward layer.
///
/// See [Vaswani et al. (2017)](https://arxiv.org/abs/1706.03762).
pub struct TransformerDecoderLayer {
    self_attention: MultiHeadAttention,
    self_attention_residual: SublayerConnection,
    cross_attention: MultiHeadAttention,
    cross_attention_residual: SublayerConnection,
    ffn: PointwiseFeedForward,
    ffn_residual: SublayerConnection,
}

impl DecoderLayer for TransformerDecoderLayer {
    fn forward_t(
        &self,
        input: &Tensor,
        memory: &Tensor,
        src_mask: &QueryKeyMask,
        tgt_mask: &QueryKeyMask,
        train: bool,
    ) -> Result<(Tensor, LayerAttention), BoxedError> {
        let (hidden, self_attention) = self
            .self_attention_residual
            .forward_with_output(
                input,
                |xs| {
                    Ok(self
                        .self_attention
                        .forward_with_probs(xs, xs, xs, Some(tgt_mask), train)?
                        .into_parts())
                },
                train,
            )
            .context(SelfAttentionSnafu)?;

        // The encoder memory is used as-is for keys and values, only the
        // decoder state is normalized.
        let (hidden, cross_attention) = self
            .cross_attention_residual
            .forward_with_output(
                &hidden,
                |xs| {
                    Ok(self
                        .cross_attention
                        .forward_with_probs(xs, memory, memory, Some(src_mask), train)?
                        .into_parts())
                },
                train,
            )
            .context(CrossAttentionSnafu)?;

        let output = feedforward_block(&self.ffn, &self.ffn_residual, &hidden, train)?;

        Ok((output, LayerAttention::decoder(self_attention, cross_attention)))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor, D};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, OptionExt, ResultExt, Whatever};

    use super::TransformerLayerConfig;
    use crate::architectures::{BuildDecoderLayer, BuildEncoderLayer};
    use crate::layers::attention::{AttentionMask, MultiHeadAttentionConfig, QueryKeyMask};
    use crate::layers::feedforward::PointwiseFeedForwardConfig;
    use crate::layers::layer_norm::LayerNormConfig;
    use crate::layers::sublayer::SublayerConnectionConfig;
    use crate::util::device::tests::test_devices;
    use crate::util::tests::{assert_tensor_eq, PseudoRandom};

    fn small_layer() -> TransformerLayerConfig {
        TransformerLayerConfig::default()
            .attention(MultiHeadAttentionConfig::default().hidden_width(8).n_heads(2))
            .feedforward(
                PointwiseFeedForwardConfig::default()
                    .hidden_width(8)
                    .intermediate_width(16),
            )
            .residual(
                SublayerConnectionConfig::default().layer_norm(LayerNormConfig::default().size(8)),
            )
    }

    #[test]
    fn encoder_layer_preserves_shape() {
        for device in test_devices() {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let layer = small_layer().build_encoder_layer(vb).unwrap();

            let input = Tensor::pseudo_random(&[2, 5, 8], &device);
            let padding = AttentionMask::new(Tensor::ones((2, 5), DType::U8, &device).unwrap())
                .unwrap();
            let mask = QueryKeyMask::try_from(&padding).unwrap();
            let (output, attention) = layer.forward_t(&input, &mask, false).unwrap();
            assert_eq!(output.dims(), &[2, 5, 8]);
            assert_eq!(attention.self_attention().dims(), &[2, 2, 5, 5]);
            assert!(attention.cross_attention().is_none());
        }
    }

    #[test]
    fn decoder_layer_registers_parameters() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        small_layer().build_decoder_layer(vb).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in [
            "self_attention.query.weight",
            "cross_attention.output.bias",
            "cross_attention_residual.layer_norm.weight",
            "ffn.intermediate.weight",
            "ffn_residual.layer_norm.bias",
        ] {
            assert!(data.contains_key(name), "missing parameter: {name}");
        }
    }

    #[test]
    #[report]
    fn decoder_layer_does_not_look_ahead() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = small_layer()
            .build_decoder_layer(vb)
            .whatever_context("Cannot build decoder layer")?;

        let memory = Tensor::pseudo_random(&[1, 6, 8], &device);
        let src_mask = QueryKeyMask::try_from(
            AttentionMask::new(
                Tensor::ones((1, 6), DType::U8, &device)
                    .whatever_context("Cannot create source mask")?,
            )
            .whatever_context("Cannot create attention mask")?,
        )
        .whatever_context("Cannot create source mask")?;
        let tgt_mask =
            QueryKeyMask::causal(4, &device).whatever_context("Cannot create causal mask")?;

        let input = Tensor::pseudo_random(&[1, 4, 8], &device);
        let (output, _) = layer
            .forward_t(&input, &memory, &src_mask, &tgt_mask, false)
            .whatever_context("Cannot apply decoder layer")?;

        // Replace the last target position, earlier outputs must not change.
        let changed_input = Tensor::cat(
            &[
                &input.narrow(1, 0, 3).whatever_context("Cannot slice input")?,
                &Tensor::ones((1, 1, 8), DType::F32, &device)
                    .whatever_context("Cannot create ones")?,
            ],
            1,
        )
        .whatever_context("Cannot concatenate input")?;
        let (changed_output, _) = layer
            .forward_t(&changed_input, &memory, &src_mask, &tgt_mask, false)
            .whatever_context("Cannot apply decoder layer")?;

        assert_tensor_eq!(
            changed_output
                .narrow(1, 0, 3)
                .whatever_context("Cannot slice output")?,
            output.narrow(1, 0, 3).whatever_context("Cannot slice output")?,
            epsilon = 1e-5f32,
        );

        Ok(())
    }

    #[test]
    #[report]
    fn decoder_layer_returns_attention_probabilities() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = small_layer()
            .build_decoder_layer(vb)
            .whatever_context("Cannot build decoder layer")?;

        let memory = Tensor::pseudo_random(&[2, 6, 8], &device);
        let src_mask = QueryKeyMask::try_from(
            AttentionMask::new(
                Tensor::new(&[[1u8, 1, 1, 1, 0, 0], [1, 1, 1, 1, 1, 1]], &device)
                    .whatever_context("Cannot create source mask")?,
            )
            .whatever_context("Cannot create attention mask")?,
        )
        .whatever_context("Cannot create source mask")?;
        let tgt_mask =
            QueryKeyMask::causal(4, &device).whatever_context("Cannot create causal mask")?;

        let input = Tensor::pseudo_random(&[2, 4, 8], &device);
        let (_, attention) = layer
            .forward_t(&input, &memory, &src_mask, &tgt_mask, false)
            .whatever_context("Cannot apply decoder layer")?;

        let self_attention = attention.self_attention();
        assert_eq!(self_attention.dims(), &[2, 2, 4, 4]);
        let probs = self_attention
            .flatten_to(1)
            .and_then(|probs| probs.to_vec3::<f32>())
            .whatever_context("Cannot get self-attention probabilities")?;
        for matrix in probs {
            for (query, row) in matrix.iter().enumerate() {
                // No attention to succeeding positions.
                assert!(row[query + 1..].iter().all(|&p| p == 0.));
                assert!((row.iter().sum::<f32>() - 1.).abs() < 1e-5);
            }
        }

        let cross_attention = attention
            .cross_attention()
            .whatever_context("Decoder layer has no cross-attention probabilities")?;
        assert_eq!(cross_attention.dims(), &[2, 2, 4, 6]);
        // No attention to the padding of the first source sequence.
        let padding_mass = cross_attention
            .get(0)
            .and_then(|probs| probs.narrow(D::Minus1, 4, 2))
            .and_then(|probs| probs.sum_all())
            .and_then(|sum| sum.to_scalar::<f32>())
            .whatever_context("Cannot sum padding probabilities")?;
        assert_eq!(padding_mass, 0.);

        Ok(())
    }
}
