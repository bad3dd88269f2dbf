pub mod activation;

pub mod attention;

pub mod build_module;

pub mod dropout;

pub mod embeddings;

pub mod feedforward;

pub mod identity;

pub mod init;

pub mod layer_norm;

pub mod sublayer;

pub mod transformer;
