//! Transformer encoder-decoder (Vaswani et al., 2017) built on candle.
//!
//! See [Attention Is All You Need](https://arxiv.org/abs/1706.03762).
pub mod architectures;
pub mod error;
pub mod layers;
pub mod models;
pub mod util;
