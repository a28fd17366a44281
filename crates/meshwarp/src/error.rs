use meshwarp_tensor::TensorError;

/// An error type for the mesh warping operations.
#[derive(thiserror::Error, Debug)]
pub enum MeshWarpError {
    /// An input tensor does not have the rank or dimensions an operation requires.
    #[error("Shape mismatch for {name}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Name of the offending input
        name: &'static str,
        /// Expected shape description
        expected: String,
        /// Actual shape description
        actual: String,
    },

    /// The static warp configuration is not usable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error raised by a tensor or backend operation.
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl MeshWarpError {
    pub(crate) fn shape_mismatch(name: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            name,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}
