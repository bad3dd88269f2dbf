use candle_core::{DType, Device, IndexOp, Tensor, D};
use snafu::{ensure, ResultExt, Snafu};

/// Configuration for sinusoidal positional encodings.
#[derive(Clone, Debug)]
pub struct SinusoidalPositionalEncodingConfig {
    base: f32,
    max_len: usize,
    width: usize,
}

impl SinusoidalPositionalEncodingConfig {
    /// Base of the wavelengths.
    ///
    /// The wavelengths form a geometric progression from `2π` to
    /// `base · 2π`.
    ///
    /// Default: `10_000`
    pub fn base(mut self, base: f32) -> Self {
        self.base = base;
        self
    }

    /// Number of positions to precompute encodings for.
    ///
    /// Default: `5000`
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Encoding width. Must be even.
    ///
    /// Default: `512`
    pub fn width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Build the positional encoding.
    ///
    /// * `device` - Device on which the encodings are stored.
    pub fn build(
        &self,
        device: &Device,
    ) -> Result<SinusoidalPositionalEncoding, SinusoidalPositionalEncodingError> {
        SinusoidalPositionalEncoding::new(self.width, self.max_len, self.base, device)
    }
}

impl Default for SinusoidalPositionalEncodingConfig {
    fn default() -> Self {
        Self {
            base: 10_000.,
            max_len: 5000,
            width: 512,
        }
    }
}

/// Errors for sinusoidal positional encodings.
#[derive(Debug, Snafu)]
pub enum SinusoidalPositionalEncodingError {
    #[snafu(display("Cannot add positional encodings to input"))]
    ApplyEncodings { source: candle_core::Error },

    #[snafu(display("Cannot create positional encodings"))]
    CreateEncodings { source: candle_core::Error },

    #[snafu(display("Invalid input rank, expected 3, got {got}"))]
    InvalidRank {
        got: usize,
        source: candle_core::Error,
    },

    #[snafu(display(
        "Sequence length {seq_len} exceeds the maximum length {max_len} of the positional encodings"
    ))]
    SequenceTooLong { max_len: usize, seq_len: usize },

    #[snafu(display("Positional encoding width must be even, was {width}"))]
    WidthNotEven { width: usize },
}

/// Sinusoidal positional encodings (Vaswani et al., 2017).
///
/// The encodings are precomputed once for `max_len` positions:
///
/// * `PE(pos, 2i) = sin(pos / base^(2i/width))`
/// * `PE(pos, 2i + 1) = cos(pos / base^(2i/width))`
///
/// The encodings are not trainable.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
#[derive(Debug)]
pub struct SinusoidalPositionalEncoding {
    encodings: Tensor,
}

impl SinusoidalPositionalEncoding {
    /// Construct sinusoidal positional encodings.
    ///
    /// * `width` - Encoding width. Must be even.
    /// * `max_len` - Number of positions to precompute.
    /// * `base` - Base of the wavelengths (normally 10_000).
    /// * `device` - Device on which the encodings are stored.
    pub fn new(
        width: usize,
        max_len: usize,
        base: f32,
        device: &Device,
    ) -> Result<Self, SinusoidalPositionalEncodingError> {
        ensure!(width % 2 == 0, WidthNotEvenSnafu { width });

        // 1 / base^(2i/width)
        let inv_freq: Vec<_> = (0..width)
            .step_by(2)
            .map(|i| base.powf(-(i as f32 / width as f32)))
            .collect();

        let encodings = Self::create_encodings(inv_freq, max_len, device)
            .context(CreateEncodingsSnafu)?;

        Ok(SinusoidalPositionalEncoding { encodings })
    }

    fn create_encodings(
        inv_freq: Vec<f32>,
        max_len: usize,
        device: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        let half_width = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_width), device)?;
        let position = Tensor::arange(0u32, max_len as u32, device)?
            .to_dtype(DType::F32)?
            .unsqueeze(1)?;
        let angles = position.broadcast_mul(&inv_freq)?;

        // Interleave, so that sin ends up at even and cos at odd indices.
        Tensor::stack(&[angles.sin()?, angles.cos()?], D::Minus1)?
            .reshape((max_len, half_width * 2))
    }

    /// Get the precomputed encodings.
    ///
    /// *Shape:* `(max_len, width)`
    pub fn encodings(&self) -> &Tensor {
        &self.encodings
    }

    /// Add positional encodings to the input.
    ///
    /// * `input` - Input representations.
    ///   *Shape:* `(batch_size, seq_len, width)`
    ///
    /// Returns: Input with positional encodings added.
    /// *Shape:* `(batch_size, seq_len, width)`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, SinusoidalPositionalEncodingError> {
        let (_, seq_len, _) = input
            .dims3()
            .context(InvalidRankSnafu { got: input.rank() })?;
        let (max_len, _) = self
            .encodings
            .dims2()
            .context(CreateEncodingsSnafu)?;
        ensure!(
            seq_len <= max_len,
            SequenceTooLongSnafu { max_len, seq_len }
        );

        self.encodings
            .i(..seq_len)
            .and_then(|encodings| encodings.to_dtype(input.dtype()))
            .and_then(|encodings| input.broadcast_add(&encodings))
            .context(ApplyEncodingsSnafu)
    }
}
