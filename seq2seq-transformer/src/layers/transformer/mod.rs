mod embeddings;
pub use embeddings::{
    TransformerEmbeddings, TransformerEmbeddingsConfig, TransformerEmbeddingsError,
};

mod layer;
pub use layer::{
    TransformerDecoderLayer, TransformerEncoderLayer, TransformerLayerConfig, TransformerLayerError,
};
