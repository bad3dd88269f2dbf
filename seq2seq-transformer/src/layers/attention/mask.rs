use candle_core::{DType, Device, Tensor};
use snafu::{ensure, ResultExt, Snafu};

use crate::util::tensor_ext::MaskedFill;

/// Errors for attention masks.
#[derive(Debug, Snafu)]
pub enum AttentionMaskError {
    #[snafu(display("Cannot create mask from piece identifiers"))]
    FromPieceIds { source: candle_core::Error },

    #[snafu(display("Attention mask must be 2D, was {}D", n_dims))]
    InvalidDims { n_dims: usize },
}

/// Attention mask.
///
/// Sequence elements for which the corresponding mask element is set to
/// `false` are ignored during attention calculation. This is typically
/// used to mask out padding. Guaranteed to be a 2D array.
#[derive(Clone, Debug)]
pub struct AttentionMask {
    bool_mask: Tensor,
}

impl AttentionMask {
    /// Create an input attention mask.
    ///
    /// * `bool_mask` - Boolean mask tensor.
    ///   *Shape:* `(batch_size, seq_len)`
    pub fn new(bool_mask: Tensor) -> Result<Self, AttentionMaskError> {
        let n_dims = bool_mask.dims().len();
        ensure!(n_dims == 2, InvalidDimsSnafu { n_dims });
        Ok(AttentionMask { bool_mask })
    }

    /// Create a mask that masks out padding pieces.
    ///
    /// * `piece_ids` - Piece identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `padding_id` - Piece identifier of the padding piece.
    pub fn from_piece_ids(piece_ids: &Tensor, padding_id: u32) -> Result<Self, AttentionMaskError> {
        let bool_mask = piece_ids.ne(padding_id).context(FromPieceIdsSnafu)?;
        Self::new(bool_mask)
    }

    /// Get the boolean mask.
    ///
    /// *Shape:* `(batch_size, seq_len)`
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }
}

/// Errors for query-key masks.
#[derive(Debug, Snafu)]
pub enum QueryKeyMaskError {
    #[snafu(display("Cannot apply logits mask"))]
    ApplyLogitsMask { source: candle_core::Error },

    #[snafu(display("Cannot create causal mask"))]
    CreateCausalMask { source: candle_core::Error },

    #[snafu(display("Cannot add head dimension to mask"))]
    ExpandHeads { source: candle_core::Error },

    #[snafu(display("Cannot convert attention mask to query-key mask"))]
    FromAttentionMask { source: candle_core::Error },

    #[snafu(display("Cannot intersect masks"))]
    IntersectMasks { source: candle_core::Error },

    #[snafu(display("Query-key mask must be 3D, was {}D", n_dims))]
    InvalidQueryKeyDims { n_dims: usize },
}

/// Query-key mask.
///
/// A 3D mask with shape `(batch_size, query_len, key_len)`. The batch and
/// query dimensions can have size 1, in which case they are broadcast.
/// This is the form in which masks are passed to encoders and decoders:
///
/// * Padding masks have shape `(batch_size, 1, key_len)`.
/// * Causal masks have shape `(1, seq_len, seq_len)`.
#[derive(Clone, Debug)]
pub struct QueryKeyMask {
    bool_mask: Tensor,
}

impl QueryKeyMask {
    /// Create a query-key mask.
    ///
    /// * `bool_mask` - Boolean mask tensor.
    ///   *Shape:* `(batch_size, query_len, key_len)`
    pub fn new(bool_mask: Tensor) -> Result<Self, QueryKeyMaskError> {
        let n_dims = bool_mask.dims().len();
        ensure!(n_dims == 3, InvalidQueryKeyDimsSnafu { n_dims });
        Ok(QueryKeyMask { bool_mask })
    }

    /// Create a causal mask.
    ///
    /// A causal mask ensures that a sequence element cannot attend to
    /// succeeding elements: position `i` can only attend to positions
    /// `j <= i`.
    ///
    /// * `seq_len` - Sequence length.
    /// * `device` - Device to allocate the mask on.
    ///
    /// Returns: *Shape:* `(1, seq_len, seq_len)`
    pub fn causal(seq_len: usize, device: &Device) -> Result<Self, QueryKeyMaskError> {
        let bool_mask = Tensor::tril2(seq_len, DType::U8, device)
            .and_then(|mask| mask.reshape((1, seq_len, seq_len)))
            .context(CreateCausalMaskSnafu)?;
        Ok(QueryKeyMask { bool_mask })
    }

    /// Create a target mask for a decoder.
    ///
    /// The target mask hides both padding and succeeding positions.
    ///
    /// * `padding_mask` - Target padding mask.
    ///   *Shape:* `(batch_size, seq_len)`
    ///
    /// Returns: *Shape:* `(batch_size, seq_len, seq_len)`
    pub fn target(padding_mask: &AttentionMask) -> Result<Self, QueryKeyMaskError> {
        let (_, seq_len) = padding_mask
            .bool_mask
            .dims2()
            .context(FromAttentionMaskSnafu)?;
        let causal_mask = Self::causal(seq_len, padding_mask.bool_mask.device())?;
        Self::try_from(padding_mask)?.intersect(&causal_mask)
    }

    /// Get the boolean mask.
    ///
    /// *Shape:* `(batch_size, query_len, key_len)`
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }

    /// Add a head dimension, so that the mask broadcasts over attention heads.
    ///
    /// Returns: *Shape:* `(batch_size, 1, query_len, key_len)`
    pub fn expand_heads(&self) -> Result<QueryKeyAttentionMask, QueryKeyMaskError> {
        Ok(QueryKeyAttentionMask {
            bool_mask: self.bool_mask.unsqueeze(1).context(ExpandHeadsSnafu)?,
        })
    }

    /// Merge this mask with another mask.
    ///
    /// A query-key pair is only attended to if it is allowed by both masks.
    pub fn intersect(&self, other: &QueryKeyMask) -> Result<QueryKeyMask, QueryKeyMaskError> {
        Ok(QueryKeyMask {
            bool_mask: self
                .bool_mask
                .to_dtype(DType::U8)
                .and_then(|mask| mask.broadcast_mul(&other.bool_mask.to_dtype(DType::U8)?))
                .context(IntersectMasksSnafu)?,
        })
    }
}

impl TryFrom<&AttentionMask> for QueryKeyMask {
    type Error = QueryKeyMaskError;

    fn try_from(attention_mask: &AttentionMask) -> Result<Self, Self::Error> {
        let (batch_size, key_len) = attention_mask
            .bool_mask
            .dims2()
            .context(FromAttentionMaskSnafu)?;
        Ok(QueryKeyMask {
            bool_mask: attention_mask
                .bool_mask
                .reshape((batch_size, 1, key_len))
                .context(FromAttentionMaskSnafu)?,
        })
    }
}

impl TryFrom<AttentionMask> for QueryKeyMask {
    type Error = QueryKeyMaskError;

    fn try_from(attention_mask: AttentionMask) -> Result<Self, Self::Error> {
        QueryKeyMask::try_from(&attention_mask)
    }
}

/// Query-key mask with a head dimension.
///
/// A 4D attention mask with shape `(batch_size, heads, query_len,
/// key_len)`, where every dimension except `key_len` may be broadcast.
/// Elements for which the corresponding mask element is set to `false`
/// are ignored during attention calculation.
#[derive(Clone, Debug)]
pub struct QueryKeyAttentionMask {
    bool_mask: Tensor,
}

impl QueryKeyAttentionMask {
    /// Get the boolean mask.
    ///
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }

    /// Use the attention mask to mask logits.
    ///
    /// Masked logits are set to the smallest value of the logits' data
    /// type.
    ///
    /// * input - Tensor to which the mask is applied.
    ///   *Shape:* `(batch_size, heads, query_len, key_len)`
    ///
    /// Returns: Logits with the attention mask applied.
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn apply_logit_mask(&self, input: &Tensor) -> Result<Tensor, QueryKeyMaskError> {
        input
            .masked_fill_min(&self.bool_mask)
            .context(ApplyLogitsMaskSnafu)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use ndarray::array;

    use crate::layers::attention::{AttentionMask, QueryKeyMask};
    use crate::util::device::tests::test_devices;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn attention_mask_must_be_2d() {
        let mask = Tensor::ones((1, 2, 3), candle_core::DType::U8, &Device::Cpu).unwrap();
        assert!(AttentionMask::new(mask).is_err());
    }

    #[test]
    fn attention_mask_from_piece_ids_masks_padding() {
        let piece_ids = Tensor::new(&[[5u32, 3, 0, 0], [1, 2, 3, 4]], &Device::Cpu).unwrap();
        let mask = AttentionMask::from_piece_ids(&piece_ids, 0).unwrap();
        assert_eq!(
            mask.bool_mask().to_vec2::<u8>().unwrap(),
            vec![vec![1, 1, 0, 0], vec![1, 1, 1, 1]]
        );
    }

    #[test]
    fn causal_mask_is_lower_triangular() {
        for device in test_devices() {
            let mask = QueryKeyMask::causal(4, &device).unwrap();
            assert_eq!(
                mask.bool_mask().to_vec3::<u8>().unwrap(),
                vec![vec![
                    vec![1, 0, 0, 0],
                    vec![1, 1, 0, 0],
                    vec![1, 1, 1, 0],
                    vec![1, 1, 1, 1]
                ]]
            );
        }
    }

    #[test]
    fn target_mask_combines_padding_and_causal_masks() {
        let device = Device::Cpu;
        let padding =
            AttentionMask::new(Tensor::new(&[[1u8, 1, 0], [1, 1, 1]], &device).unwrap()).unwrap();
        let mask = QueryKeyMask::target(&padding).unwrap();
        assert_eq!(
            mask.bool_mask().to_vec3::<u8>().unwrap(),
            vec![
                vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 0]],
                vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]
            ]
        );
    }

    #[test]
    fn expanded_mask_blocks_logits() {
        let device = Device::Cpu;
        let padding =
            AttentionMask::new(Tensor::new(&[[1u8, 0, 1]], &device).unwrap()).unwrap();
        let mask = QueryKeyMask::try_from(&padding)
            .unwrap()
            .expand_heads()
            .unwrap();
        assert_eq!(mask.bool_mask().dims(), &[1, 1, 1, 3]);

        let logits = Tensor::ones((1, 2, 2, 3), candle_core::DType::F32, &device).unwrap();
        let masked = mask.apply_logit_mask(&logits).unwrap();
        assert_tensor_eq!(
            masked,
            array![[
                [[1f32, f32::MIN, 1.], [1., f32::MIN, 1.]],
                [[1., f32::MIN, 1.], [1., f32::MIN, 1.]]
            ]],
            epsilon = 0f32,
        );
    }
}
