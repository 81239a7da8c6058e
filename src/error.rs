//! Error types for Cuantizar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing calibration statistics for tensor '{0}'. Check that the correct calibration results are passed into the params generator")]
    MissingStatistics(String),

    #[error("Ambiguous propagation: {0}")]
    AmbiguousPropagation(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("No output activation override registered for {num_bits}-bit activations on op {op}")]
    UnsupportedOverride { op: String, num_bits: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;
