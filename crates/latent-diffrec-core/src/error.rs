//! Error types for latent diffusion recommendation.
//!
//! Three failure classes matter to callers:
//!
//! - **Configuration**: rejected at construction time, nothing is built
//!   partially (unknown schedule, unknown mean type, bad layer dims).
//! - **Shape**: batch/latent/condition mismatches detected at call time.
//! - **DataIntegrity**: category maps that are not bijections, item indices
//!   outside the configured item count, labels outside the class range.
//!
//! Tensor backend failures are wrapped with the name of the operation that
//! failed so a stack of `?` still tells you where things went wrong.

use std::fmt::Display;

use thiserror::Error;

/// Errors raised by the recommender core.
#[derive(Debug, Error)]
pub enum DiffRecError {
    /// Invalid configuration detected while building a component.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Tensor or batch dimensions disagree.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    Shape {
        context: String,
        expected: String,
        actual: String,
    },

    /// Input data violates an invariant (bijection, index bounds, labels).
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// A candle tensor operation failed.
    #[error("Tensor operation '{operation}' failed: {source}")]
    Tensor {
        operation: &'static str,
        #[source]
        source: candle_core::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing or serializing a config, artifact or data file failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DiffRecError {
    /// Build a [`DiffRecError::Shape`] from displayable parts.
    pub fn shape(context: impl Into<String>, expected: impl Display, actual: impl Display) -> Self {
        Self::Shape {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<toml::de::Error> for DiffRecError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<toml::ser::Error> for DiffRecError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<::config::ConfigError> for DiffRecError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type alias for recommender operations.
pub type DiffRecResult<T> = Result<T, DiffRecError>;

/// Attaches an operation name to candle results.
pub(crate) trait TensorContext<T> {
    fn op(self, operation: &'static str) -> DiffRecResult<T>;
}

impl<T> TensorContext<T> for candle_core::Result<T> {
    #[inline]
    fn op(self, operation: &'static str) -> DiffRecResult<T> {
        self.map_err(|source| DiffRecError::Tensor { operation, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_display() {
        let err = DiffRecError::shape("p_sample condition", "(3,)", "(4,)");
        let msg = err.to_string();
        assert!(msg.contains("p_sample condition"));
        assert!(msg.contains("(3,)"));
        assert!(msg.contains("(4,)"));
    }

    #[test]
    fn test_tensor_context_names_operation() {
        let failed: candle_core::Result<()> = Err(candle_core::Error::Msg("boom".into()));
        let err = failed.op("decode concat").unwrap_err();
        assert!(err.to_string().contains("decode concat"));
        assert!(matches!(err, DiffRecError::Tensor { .. }));
    }

    #[test]
    fn test_toml_error_is_configuration() {
        let parsed: Result<toml::Value, _> = toml::from_str("= broken");
        let err: DiffRecError = parsed.unwrap_err().into();
        assert!(matches!(err, DiffRecError::Configuration(_)));
    }
}
