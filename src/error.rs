//! Error taxonomy for the gateway.
//!
//! Every failure the gateway can surface is a variant of [`GatewayError`].
//! Validation, engine and storage failures keep their own structured types so
//! callers can inspect the violated rule or the engine's classification hint.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::execution::TimeoutError;
pub use crate::storage::StorageError;

/// Structural rule a query violated before it was scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum ValidationRule {
    /// Query text is empty or whitespace only
    EmptyQuery,
    /// Query text exceeds the configured maximum length
    TooLong { length: usize, max: usize },
    /// A bracket is unmatched (`position` is a byte offset)
    Unbalanced { bracket: char, position: usize },
    /// A string literal is never closed
    UnterminatedLiteral { position: usize },
    /// The query uses a construct the downstream engine cannot execute
    DeniedConstruct { construct: String },
    /// Placeholder count does not match the bound parameters
    ParameterMismatch { expected: usize, got: usize },
    /// Requested timeout is not usable
    InvalidTimeout { seconds: u64 },
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationRule::EmptyQuery => write!(f, "query text is empty"),
            ValidationRule::TooLong { length, max } => {
                write!(f, "query is {length} bytes, maximum is {max}")
            }
            ValidationRule::Unbalanced { bracket, position } => {
                write!(f, "unbalanced '{bracket}' at byte {position}")
            }
            ValidationRule::UnterminatedLiteral { position } => {
                write!(f, "string literal starting at byte {position} is never closed")
            }
            ValidationRule::DeniedConstruct { construct } => {
                write!(f, "unsupported construct '{construct}'")
            }
            ValidationRule::ParameterMismatch { expected, got } => {
                write!(f, "query expects {expected} parameter(s), got {got}")
            }
            ValidationRule::InvalidTimeout { seconds } => {
                write!(f, "timeout of {seconds}s is not allowed")
            }
        }
    }
}

/// Malformed or unsupported query, rejected before scheduling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Validation failed: {rule}")]
pub struct ValidationError {
    pub rule: ValidationRule,
}

impl ValidationError {
    pub fn new(rule: ValidationRule) -> Self {
        Self { rule }
    }
}

impl From<ValidationRule> for ValidationError {
    fn from(rule: ValidationRule) -> Self {
        Self::new(rule)
    }
}

/// Classification hint attached to engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineErrorKind {
    /// The engine rejected the query text
    Syntax,
    /// The engine could not be reached
    Connection,
    /// The engine gave up on its own
    Timeout,
    /// The engine answered with something that is not a valid result
    Protocol,
    /// Anything else
    Other,
}

impl EngineErrorKind {
    /// Guess a classification from an engine message.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("syntax") || lower.contains("parse") || lower.contains("unexpected") {
            EngineErrorKind::Syntax
        } else if lower.contains("connect") || lower.contains("refused") || lower.contains("dns") {
            EngineErrorKind::Connection
        } else if lower.contains("timeout") || lower.contains("timed out") {
            EngineErrorKind::Timeout
        } else {
            EngineErrorKind::Other
        }
    }
}

/// Failure raised or returned by the external query engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Engine error ({kind:?}): {message}")]
pub struct EngineError {
    /// Verbatim engine message
    pub message: String,
    pub kind: EngineErrorKind,
}

impl EngineError {
    /// Wrap a message, classifying it from its text.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = EngineErrorKind::classify(&message);
        Self { message, kind }
    }

    pub fn with_kind(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::with_kind(EngineErrorKind::Protocol, message)
    }
}

/// Stable, serialisable error category for callers mapping errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Timeout,
    Engine,
    AggregationFallbackTimeout,
    Storage,
    NotFound,
}

/// Gateway error type.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Query timeout: {0}")]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The corrective re-execution could not finish within the remaining budget
    #[error("Aggregation fallback could not complete within the remaining {remaining:?}")]
    AggregationFallbackTimeout { remaining: Duration },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache entry not found: {id}")]
    NotFound { id: String },
}

impl GatewayError {
    pub fn not_found(id: impl Into<String>) -> Self {
        GatewayError::NotFound { id: id.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::Timeout(_) => ErrorKind::Timeout,
            GatewayError::Engine(_) => ErrorKind::Engine,
            GatewayError::AggregationFallbackTimeout { .. } => ErrorKind::AggregationFallbackTimeout,
            GatewayError::Storage(_) => ErrorKind::Storage,
            GatewayError::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    /// HTTP-equivalent status for the outer service layer.
    pub fn status_hint(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::Engine => 400,
            ErrorKind::Timeout | ErrorKind::AggregationFallbackTimeout => 408,
            ErrorKind::NotFound => 404,
            ErrorKind::Storage => 503,
        }
    }

    /// Suggestion a consumer can show next to the error, if any.
    pub fn hint(&self) -> Option<&'static str> {
        match self.kind() {
            ErrorKind::Timeout | ErrorKind::AggregationFallbackTimeout => {
                Some("retry with a narrower query (add filters or a LIMIT)")
            }
            _ => None,
        }
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Rate limiter errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// A single acquisition asks for more tokens than the bucket can ever hold
    #[error("Requested cost {cost} exceeds bucket capacity {capacity}")]
    CostExceedsCapacity { cost: u32, capacity: u32 },
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}
