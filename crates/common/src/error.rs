//! Error taxonomy shared by every crate in the workspace.
//!
//! Compute code returns [`candle_core::Result`]; an [`EmbedError`] converts
//! into a candle error through `Error::wrap`, so callers can still use `?`.

/// Failures raised by construction, shape inference, or unsupported paths.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// A construction-time contract was violated (programmer error).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `infer_shape` or `compute` got the wrong arity, rank, or shapes.
    #[error("shape mismatch in {node}: {reason}")]
    ShapeMismatch { node: &'static str, reason: String },

    /// The requested execution path or derivative is not implemented.
    #[error("unsupported operation in {node}: {reason}")]
    Unsupported { node: &'static str, reason: String },

    /// The prime table has no entry large enough for the requested modulus.
    #[error("prime table has no prime >= {0}")]
    MissingPrimes(u64),
}

impl EmbedError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn shape(node: &'static str, reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            node,
            reason: reason.into(),
        }
    }

    pub fn unsupported(node: &'static str, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            node,
            reason: reason.into(),
        }
    }
}

impl From<EmbedError> for candle_core::Error {
    fn from(err: EmbedError) -> Self {
        candle_core::Error::wrap(err)
    }
}
