use thiserror::Error;

/// Errors returned by fitting and transforming.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UmapError {
  /// A configuration value is outside its valid range.
  #[error("invalid parameter: {0}")]
  InvalidParameter(String),

  /// The input matrix contains NaN or infinite values.
  #[error("input contains non-finite values")]
  NonFiniteInput,

  /// Array dimensions don't line up (e.g. target length vs. sample count).
  #[error("shape mismatch: {0}")]
  ShapeMismatch(String),

  /// `metric_by_name` was given a name it doesn't know.
  #[error("unknown metric: {0}")]
  UnknownMetric(String),

  /// The requested operation isn't available for this model or configuration.
  #[error("unsupported: {0}")]
  Unsupported(String),

  /// The worker pool could not be created.
  #[error("failed to build thread pool: {0}")]
  ThreadPool(String),
}

pub type Result<T> = std::result::Result<T, UmapError>;
