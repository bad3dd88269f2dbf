use std::error::Error;

/// Type-erased error returned at trait boundaries, such as encoders,
/// decoders, and module builders.
pub type BoxedError = Box<dyn Error + Send + Sync>;
