/// Transformer encoder-decoder implementation.
mod config;
pub use config::{make_model, TransformerConfig, TransformerConfigError};

mod decoder;
pub use decoder::{TransformerDecoder, TransformerDecoderConfig, TransformerDecoderError};

mod encoder;
pub use encoder::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderError};

mod encoder_decoder;
pub use encoder_decoder::{EncoderDecoder, EncoderDecoderConfig, EncoderDecoderError};

mod generator;
pub use generator::{Generator, GeneratorConfig, GeneratorError};
