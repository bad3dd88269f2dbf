use candle_core::{Module, Tensor};
use candle_nn::{Embedding, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::layers::init::xavier_embedding;

/// Errors for scaled embeddings.
#[derive(Debug, Snafu)]
pub enum ScaledEmbeddingsError {
    #[snafu(display("Cannot construct embedding table"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot look up piece embeddings"))]
    Lookup { source: candle_core::Error },
}

/// Piece embeddings scaled by `√width`.
///
/// Scaling keeps the embedding magnitudes comparable to the sinusoidal
/// positional encodings that are added to them.
#[derive(Debug)]
pub struct ScaledEmbeddings {
    embeddings: Embedding,
    scale: f64,
}

impl ScaledEmbeddings {
    /// Construct scaled embeddings.
    ///
    /// * `vb` - Variable store.
    /// * `n_pieces` - Vocabulary size.
    /// * `width` - Embedding width.
    pub fn new(
        vb: VarBuilder,
        n_pieces: usize,
        width: usize,
    ) -> Result<Self, ScaledEmbeddingsError> {
        Ok(Self {
            embeddings: xavier_embedding(n_pieces, width, vb).context(ConstructionSnafu)?,
            scale: (width as f64).sqrt(),
        })
    }

    /// Look up the scaled embeddings of the given pieces.
    ///
    /// * `piece_ids` - Piece identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    ///
    /// Returns: *Shape:* `(batch_size, seq_len, width)`
    pub fn forward(&self, piece_ids: &Tensor) -> Result<Tensor, ScaledEmbeddingsError> {
        self.embeddings
            .forward(piece_ids)
            .and_then(|xs| xs.affine(self.scale, 0.0))
            .context(LookupSnafu)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Embedding, VarBuilder};
    use ndarray::array;

    use super::ScaledEmbeddings;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn embeddings_are_scaled_by_sqrt_width() {
        let device = Device::Cpu;
        let mut embeddings =
            ScaledEmbeddings::new(VarBuilder::zeros(DType::F32, &device), 3, 4).unwrap();
        embeddings.embeddings = Embedding::new(
            Tensor::arange(0f32, 12., &device)
                .unwrap()
                .reshape((3, 4))
                .unwrap(),
            4,
        );

        let piece_ids = Tensor::new(&[[2u32, 0]], &device).unwrap();
        assert_tensor_eq!(
            embeddings.forward(&piece_ids).unwrap(),
            array![[[16f32, 18., 20., 22.], [0., 2., 4., 6.]]],
            epsilon = 1e-6f32,
        );
    }
}
