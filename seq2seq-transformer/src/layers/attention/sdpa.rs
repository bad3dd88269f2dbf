use candle_core::{ModuleT, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{
    AttentionOutput, AttentionScorer, BuildAttentionScorer, QueryKeyAttentionMask,
    QueryKeyMaskError,
};
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;

/// Configuration for scaled dot-product attention.
#[derive(Debug)]
pub struct SDPAConfig {
    dropout: Box<dyn BuildModule>,
}

impl SDPAConfig {
    /// Dropout to apply to the attention probabilities.
    ///
    /// Default: `Identity`.
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }
}

impl Default for SDPAConfig {
    fn default() -> Self {
        Self {
            dropout: Box::new(Identity),
        }
    }
}

impl BuildAttentionScorer for SDPAConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn AttentionScorer>, BoxedError> {
        Ok(Box::new(SDPA {
            dropout: self.dropout.build(vb).context(BuildDropoutSnafu)?,
        }))
    }
}

/// Errors for scaled dot-product attention.
#[derive(Debug, Snafu)]
pub enum SDPAError {
    #[snafu(display("Cannot apply attention mask"))]
    AttentionMask { source: QueryKeyMaskError },

    #[snafu(display("Cannot calculate attention scores"))]
    AttentionScores { source: candle_core::Error },

    #[snafu(display("Cannot weigh representations using attention mask"))]
    AttentionWeight { source: candle_core::Error },

    #[snafu(display("Cannot build dropout module"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot apply dropout"))]
    Dropout { source: candle_core::Error },

    #[snafu(display("Cannot scale attention scores"))]
    Temperature { source: candle_core::Error },
}

/// Scaled dot-product attention.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct SDPA {
    dropout: Box<dyn ModuleT>,
}

impl SDPA {
    /// Compute scaled attention scores `QKᵀ/√d_k`.
    fn attention_scores(query: &Tensor, key: &Tensor) -> Result<Tensor, SDPAError> {
        let query = query.contiguous().context(AttentionScoresSnafu)?;
        let attn_scores = key
            .contiguous()
            .and_then(|key| key.transpose(D::Minus2, D::Minus1))
            .and_then(|key| query.broadcast_matmul(&key))
            .context(AttentionScoresSnafu)?;

        let head_width = key.dim(D::Minus1).context(TemperatureSnafu)?;
        let temperature = (head_width as f64).sqrt();
        (attn_scores / temperature).context(TemperatureSnafu)
    }
}

impl AttentionScorer for SDPA {
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&QueryKeyAttentionMask>,
        train: bool,
    ) -> Result<AttentionOutput, BoxedError> {
        let mut attn_scores = Self::attention_scores(query, key)?;

        if let Some(attention_mask) = attention_mask {
            attn_scores = attention_mask
                .apply_logit_mask(&attn_scores)
                .context(AttentionMaskSnafu)?;
        }

        // When all keys of a query are masked, every logit is the same
        // sentinel and softmax gives a uniform distribution.
        let attn_probs = softmax(&attn_scores, D::Minus1)
            .and_then(|probs| self.dropout.forward_t(&probs, train))
            .context(DropoutSnafu)?;

        let output = value
            .contiguous()
            .and_then(|value| attn_probs.broadcast_matmul(&value))
            .context(AttentionWeightSnafu)?;

        Ok(AttentionOutput::new(output, attn_probs))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor, D};
    use candle_nn::VarBuilder;
    use ndarray::array;
    use snafu::{report, ResultExt, Whatever};

    use crate::layers::attention::{
        AttentionMask, BuildAttentionScorer, QueryKeyMask, SDPAConfig, SDPA,
    };
    use crate::util::device::tests::test_devices;
    use crate::util::tests::{assert_tensor_eq, PseudoRandom};

    #[test]
    fn scores_are_scaled_by_sqrt_head_width() {
        let device = Device::Cpu;
        // d_k = 4, so the scale is 1/2.
        let query = Tensor::new(&[1f32, 2., 3., 4.], &device)
            .unwrap()
            .reshape((1, 1, 1, 4))
            .unwrap();
        let key = Tensor::new(&[[1f32, 0., 1., 0.], [2., 2., 2., 2.]], &device)
            .unwrap()
            .reshape((1, 1, 2, 4))
            .unwrap();

        let unscaled = [1. + 3., 2. * (1. + 2. + 3. + 4.)];
        assert_tensor_eq!(
            SDPA::attention_scores(&query, &key).unwrap(),
            array![[[[unscaled[0] / 2f32, unscaled[1] / 2.]]]],
            epsilon = 1e-6f32,
        );
    }

    #[test]
    #[report]
    fn probabilities_are_a_distribution() -> Result<(), Whatever> {
        for device in test_devices() {
            let sdpa = SDPAConfig::default()
                .build(VarBuilder::zeros(DType::F32, &device))
                .whatever_context("Cannot build attention scorer")?;
            let query = Tensor::pseudo_random(&[2, 3, 5, 4], &device);
            let key = Tensor::pseudo_random(&[2, 3, 6, 4], &device);
            let value = Tensor::pseudo_random(&[2, 3, 6, 8], &device);

            let output = sdpa
                .forward(&query, &key, &value, None, false)
                .whatever_context("Cannot apply attention")?;
            assert_eq!(output.output().dims(), &[2, 3, 5, 8]);
            assert_eq!(output.probabilities().dims(), &[2, 3, 5, 6]);

            let probs = output
                .probabilities()
                .flatten_all()
                .and_then(|probs| probs.to_vec1::<f32>())
                .whatever_context("Cannot get probabilities")?;
            assert!(probs.iter().all(|&p| p >= 0.));

            let row_sums = output
                .probabilities()
                .sum(D::Minus1)
                .whatever_context("Cannot sum probabilities")?;
            assert_tensor_eq!(
                row_sums,
                Tensor::ones((2, 3, 5), DType::F32, &device)
                    .whatever_context("Cannot create ones")?,
                epsilon = 1e-5f32,
            );
        }

        Ok(())
    }

    #[test]
    #[report]
    fn causal_mask_hides_future_positions() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let sdpa = SDPAConfig::default()
            .build(VarBuilder::zeros(DType::F32, &device))
            .whatever_context("Cannot build attention scorer")?;
        let query = Tensor::pseudo_random(&[1, 2, 4, 4], &device);
        let key = Tensor::pseudo_random(&[1, 2, 4, 4], &device);
        let mask = QueryKeyMask::causal(4, &device)
            .and_then(|mask| mask.expand_heads())
            .whatever_context("Cannot create causal mask")?;

        let output = sdpa
            .forward(&query, &key, &key, Some(&mask), false)
            .whatever_context("Cannot apply attention")?;

        let probs = output
            .probabilities()
            .reshape((2, 4, 4))
            .and_then(|probs| probs.to_vec3::<f32>())
            .whatever_context("Cannot get probabilities")?;
        for head in probs {
            for (i, row) in head.iter().enumerate() {
                for &p in &row[i + 1..] {
                    assert_eq!(p, 0.);
                }
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.).abs() < 1e-5);
            }
        }

        // The first position can only attend to itself.
        assert_tensor_eq!(
            output
                .output()
                .narrow(2, 0, 1)
                .whatever_context("Cannot slice output")?,
            key.narrow(2, 0, 1).whatever_context("Cannot slice key")?,
            epsilon = 1e-6f32,
        );

        Ok(())
    }

    #[test]
    #[report]
    fn fully_masked_row_is_uniform() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let sdpa = SDPAConfig::default()
            .build(VarBuilder::zeros(DType::F32, &device))
            .whatever_context("Cannot build attention scorer")?;
        let query = Tensor::pseudo_random(&[2, 1, 2, 4], &device);
        let key = Tensor::pseudo_random(&[2, 1, 3, 4], &device);
        let value = Tensor::new(&[[1f32], [2.], [6.]], &device)
            .and_then(|value| value.reshape((1, 1, 3, 1)))
            .and_then(|value| value.repeat((2, 1, 1, 1)))
            .whatever_context("Cannot create value")?;

        // The second sequence is fully masked.
        let mask = AttentionMask::new(
            Tensor::new(&[[1u8, 0, 0], [0, 0, 0]], &device)
                .whatever_context("Cannot create mask tensor")?,
        )
        .whatever_context("Cannot create attention mask")?;
        let mask = QueryKeyMask::try_from(&mask)
            .and_then(|mask| mask.expand_heads())
            .whatever_context("Cannot expand mask")?;

        let output = sdpa
            .forward(&query, &key, &value, Some(&mask), false)
            .whatever_context("Cannot apply attention")?;

        assert_tensor_eq!(
            output.probabilities(),
            array![
                [[[1f32, 0., 0.], [1., 0., 0.]]],
                [[[1. / 3., 1. / 3., 1. / 3.], [1. / 3., 1. / 3., 1. / 3.]]]
            ],
            epsilon = 1e-6f32,
        );
        assert_tensor_eq!(
            output.output(),
            array![[[[1f32], [1.]]], [[[3.], [3.]]]],
            epsilon = 1e-5f32,
        );

        Ok(())
    }
}
