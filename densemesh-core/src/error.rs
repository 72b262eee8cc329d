//! Error types for densemesh

use thiserror::Error;

/// Main error type for densemesh operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Insufficient points: {required} required, {available} available")]
    InsufficientPoints { required: usize, available: usize },

    #[error("Reconstruction failed: {0}")]
    Reconstruction(String),

    #[error("Empty mesh: {0}")]
    EmptyMesh(String),

    #[error("Algorithm error: {0}")]
    Algorithm(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidParameter`]
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Result type alias for densemesh operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::InsufficientPoints {
            required: 10,
            available: 3,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient points: 10 required, 3 available"
        );

        let err = Error::invalid_parameter("voxel_size", "must be positive");
        assert_eq!(err.to_string(), "Invalid parameter `voxel_size`: must be positive");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
