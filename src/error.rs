// sph - error taxonomy

/// Errors surfaced by hierarchy construction, stepping, and serialization.
///
/// Configuration and shape errors are caller bugs and are reported as soon
/// as they can be detected; the per-column kernels themselves never fail at
/// run time (byte weights saturate, float math clamps).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io channel {0} has no decoder or actor attached")]
    ChannelUnused(usize),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;
