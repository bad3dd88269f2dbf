//! Parameter initialization.
//!
//! Parameters with more than one dimension use Xavier/Glorot uniform
//! initialization (Glorot and Bengio, 2010). Biases use the uniform
//! `±1/√fan_in` initialization that is common for linear layers.
use candle_core::Tensor;
use candle_nn::{Embedding, Init, Linear, VarBuilder};

/// Xavier uniform initialization for a parameter of shape `(fan_out, fan_in)`.
pub fn xavier_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Get a Xavier-initialized weight matrix.
///
/// * `vb` - Variable builder.
/// * `fan_in` - Input width.
/// * `fan_out` - Output width.
/// * `name` - Name of the parameter.
pub fn xavier_weight(
    vb: &VarBuilder,
    fan_in: usize,
    fan_out: usize,
    name: &str,
) -> Result<Tensor, candle_core::Error> {
    vb.get_with_hints((fan_out, fan_in), name, xavier_uniform(fan_in, fan_out))
}

/// Construct a linear layer with a Xavier-initialized weight and a bias.
pub fn xavier_linear(
    in_width: usize,
    out_width: usize,
    vb: VarBuilder,
) -> Result<Linear, candle_core::Error> {
    let weight = xavier_weight(&vb, in_width, out_width, "weight")?;
    let bound = 1.0 / (in_width as f64).sqrt();
    let bias = vb.get_with_hints(
        (out_width,),
        "bias",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Construct an embedding table with Xavier initialization.
pub fn xavier_embedding(
    n_pieces: usize,
    width: usize,
    vb: VarBuilder,
) -> Result<Embedding, candle_core::Error> {
    let embeddings = xavier_weight(&vb, width, n_pieces, "weight")?;
    Ok(Embedding::new(embeddings, width))
}
