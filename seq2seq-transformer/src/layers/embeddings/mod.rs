/// Embedding layers.
mod scaled_embeddings;
pub use scaled_embeddings::{ScaledEmbeddings, ScaledEmbeddingsError};

mod sinusoidal_embeddings;
pub use sinusoidal_embeddings::{
    SinusoidalPositionalEncoding, SinusoidalPositionalEncodingConfig,
    SinusoidalPositionalEncodingError,
};
