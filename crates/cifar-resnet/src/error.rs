use std::path::PathBuf;

use cifar_resnet_core::TensorError;
use thiserror::Error;

/// Errors raised while configuring or building a network.
///
/// Failures inside the layer primitives pass through unchanged as
/// [`ModelError::Tensor`].
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("Invalid model config: {0}")]
    InvalidConfig(String),

    #[error("Failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ModelResult<T> = Result<T, ModelError>;
