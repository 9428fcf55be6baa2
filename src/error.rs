//! Error types for the deeper-darts search framework

use thiserror::Error;

/// Result type alias for search operations
pub type Result<T> = std::result::Result<T, DartsError>;

/// Main error type for architecture search
#[derive(Error, Debug)]
pub enum DartsError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Parameter count mismatch: model has {expected} weights, flat vector has {actual}")]
    ParameterCount { expected: usize, actual: usize },

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Unknown primitive: {0}")]
    UnknownPrimitive(String),

    #[error("Genotype parse error: {0}")]
    GenotypeParse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl DartsError {
    pub(crate) fn shape(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        DartsError::ShapeError {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<serde_json::Error> for DartsError {
    fn from(err: serde_json::Error) -> Self {
        DartsError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for DartsError {
    fn from(err: ndarray::ShapeError) -> Self {
        DartsError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DartsError::ParameterCount { expected: 10, actual: 9 };
        assert_eq!(
            err.to_string(),
            "Parameter count mismatch: model has 10 weights, flat vector has 9"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DartsError = io_err.into();
        assert!(matches!(err, DartsError::IoError(_)));
    }

    #[test]
    fn test_error_from_shape() {
        let err: DartsError = ndarray::Array1::<f64>::zeros(6)
            .into_shape_with_order((4, 2))
            .unwrap_err()
            .into();
        assert!(matches!(err, DartsError::ShapeError { .. }));
    }
}
