//! Tensor extension traits.
use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

/// Replace masked elements of a tensor.
pub trait MaskedFill: Sized {
    /// Set every element for which `mask` is zero to the smallest value of
    /// the tensor's data type.
    ///
    /// Softmax maps such elements to zero probability, unless all elements
    /// of a row are masked. In that case, every element has the same value
    /// and softmax gives a uniform distribution.
    ///
    /// * `mask` - Mask that is broadcast to the shape of `self`.
    fn masked_fill_min(&self, mask: &Tensor) -> Result<Self, candle_core::Error>;
}

impl MaskedFill for Tensor {
    fn masked_fill_min(&self, mask: &Tensor) -> Result<Self, candle_core::Error> {
        let blocked_value = dtype_min(self.dtype(), self.device())?.broadcast_as(self.shape())?;
        mask.broadcast_as(self.shape())?.where_cond(self, &blocked_value)
    }
}

/// Scalar tensor with the smallest value of a data type.
fn dtype_min(dtype: DType, device: &Device) -> Result<Tensor, candle_core::Error> {
    match dtype {
        DType::BF16 => Tensor::new(bf16::MIN, device),
        DType::F16 => Tensor::new(f16::MIN, device),
        DType::F32 => Tensor::new(f32::MIN, device),
        DType::F64 => Tensor::new(f64::MIN, device),
        DType::U8 => Tensor::new(u8::MIN, device),
        DType::U32 => Tensor::new(u32::MIN, device),
        DType::I64 => Tensor::new(i64::MIN, device),
    }
}
