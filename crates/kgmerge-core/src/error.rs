//! Error types for kgmerge operations.
//!
//! Errors carry a structured [`ErrorCode`] and, where one exists, a suggestion
//! for resolving them. The engine decides retry and degradation policy from the
//! variant alone: [`KgError::is_retryable`] is the only retry predicate.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for kgmerge operations.
pub type KgResult<T> = Result<T, KgError>;

/// Main error type for all kgmerge operations.
#[derive(Error, Debug)]
pub enum KgError {
    /// An extracted record is missing an identifying field.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        code: ErrorCode,
        details: HashMap<String, String>,
        suggestion: Option<String>,
    },

    /// A rule references a storage field absent from the schema.
    #[error("Config mismatch for {entity_type}.{field}: {message}")]
    ConfigMismatch {
        entity_type: String,
        field: String,
        message: String,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network failure, timeout or 5xx from the store. Retried.
    #[error("Transient store error: {message}")]
    TransientStore {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Payload too large, schema violation or other non-retryable store failure.
    #[error("Store error: {message}")]
    FatalStore {
        message: String,
        code: ErrorCode,
        suggestion: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested record does not exist.
    #[error("Not found: {message}")]
    NotFound { message: String, code: ErrorCode },

    /// Embedding generation failed.
    #[error("Embedding error: {message}")]
    Embedding {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A single external call exceeded its deadline.
    #[error("Operation '{operation}' timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    /// The batch was cancelled while the call was in flight.
    #[error("Operation '{operation}' cancelled")]
    Cancelled { operation: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Validation (VAL_xxx)
    ValMissingType,
    ValMissingName,
    ValInvalidFormat,
    ValInvalidIdentifier,

    // Configuration (CFG_xxx)
    CfgFieldNotInSchema,

    // Store (STORE_xxx)
    StoreUnavailable,
    StoreServerError,
    StorePayloadTooLarge,
    StoreSchemaViolation,
    StoreRejected,
    StoreNotFound,

    // Embedding (EMB_xxx)
    EmbConnectionFailed,
    EmbGenerationFailed,

    // Network (NET_xxx)
    NetTimeout,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValMissingType => "VAL_001",
            ErrorCode::ValMissingName => "VAL_002",
            ErrorCode::ValInvalidFormat => "VAL_003",
            ErrorCode::ValInvalidIdentifier => "VAL_004",
            ErrorCode::CfgFieldNotInSchema => "CFG_001",
            ErrorCode::StoreUnavailable => "STORE_001",
            ErrorCode::StoreServerError => "STORE_002",
            ErrorCode::StorePayloadTooLarge => "STORE_003",
            ErrorCode::StoreSchemaViolation => "STORE_004",
            ErrorCode::StoreRejected => "STORE_005",
            ErrorCode::StoreNotFound => "STORE_006",
            ErrorCode::EmbConnectionFailed => "EMB_001",
            ErrorCode::EmbGenerationFailed => "EMB_002",
            ErrorCode::NetTimeout => "NET_001",
            ErrorCode::Internal => "INT_001",
        }
    }
}

impl KgError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code: ErrorCode::ValInvalidFormat,
            details: HashMap::new(),
            suggestion: None,
        }
    }

    /// Create a validation error for a record missing a required field.
    pub fn missing_field(field: &str, code: ErrorCode) -> Self {
        let mut details = HashMap::new();
        details.insert("field".to_string(), field.to_string());
        Self::Validation {
            message: format!("extracted record has no '{}'", field),
            code,
            details,
            suggestion: Some(format!(
                "Ensure the extractor emits a non-empty '{}' for every record",
                field
            )),
        }
    }

    /// Create a config mismatch error.
    pub fn config_mismatch(
        entity_type: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ConfigMismatch {
            entity_type: entity_type.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a transient store error.
    pub fn transient_store(message: impl Into<String>) -> Self {
        Self::TransientStore {
            message: message.into(),
            code: ErrorCode::StoreUnavailable,
            source: None,
        }
    }

    /// Create a fatal store error.
    pub fn fatal_store(message: impl Into<String>) -> Self {
        Self::FatalStore {
            message: message.into(),
            code: ErrorCode::StoreRejected,
            suggestion: None,
            source: None,
        }
    }

    /// Create a schema violation error.
    pub fn schema_violation(message: impl Into<String>) -> Self {
        Self::FatalStore {
            message: message.into(),
            code: ErrorCode::StoreSchemaViolation,
            suggestion: Some("Check the entity schema against the store's live tables".to_string()),
            source: None,
        }
    }

    /// Create a payload-too-large error.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::FatalStore {
            message: message.into(),
            code: ErrorCode::StorePayloadTooLarge,
            suggestion: Some(
                "The write exceeds the store's request limit and is never retried; \
                 reduce the embedding dimension, trim array fields, or split the group"
                    .to_string(),
            ),
            source: None,
        }
    }

    /// Create an embedding error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding {
            message: message.into(),
            code: ErrorCode::EmbGenerationFailed,
            source: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { code, .. } => *code,
            Self::ConfigMismatch { .. } => ErrorCode::CfgFieldNotInSchema,
            Self::TransientStore { code, .. } => *code,
            Self::FatalStore { code, .. } => *code,
            Self::NotFound { code, .. } => *code,
            Self::Embedding { code, .. } => *code,
            Self::Timeout { .. } => ErrorCode::NetTimeout,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether the failed call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore { .. } | Self::Timeout { .. })
    }

    /// Whether this is a payload-too-large rejection.
    pub fn is_payload_too_large(&self) -> bool {
        self.code() == ErrorCode::StorePayloadTooLarge
    }

    /// Get a user-friendly suggestion for resolving this error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Validation { suggestion, .. } => suggestion.as_deref(),
            Self::FatalStore { suggestion, .. } => suggestion.as_deref(),
            Self::TransientStore { .. } => Some("Check that the graph store is reachable"),
            Self::Timeout { .. } => Some("Raise store_timeout_ms or check store latency"),
            Self::Embedding { .. } => Some("Please check your embedding provider configuration"),
            Self::ConfigMismatch { .. } => {
                Some("Align the matching rules with the entity schema")
            }
            _ => None,
        }
    }

    /// Prefix the message with the group or relation it concerns.
    pub fn in_context(self, context: &str) -> Self {
        match self {
            Self::FatalStore {
                message,
                code,
                suggestion,
                source,
            } => Self::FatalStore {
                message: format!("{}: {}", context, message),
                code,
                suggestion,
                source,
            },
            Self::TransientStore {
                message,
                code,
                source,
            } => Self::TransientStore {
                message: format!("{}: {}", context, message),
                code,
                source,
            },
            other => other,
        }
    }

    /// Convert from an HTTP status code returned by a store endpoint.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        match status {
            413 => Self::payload_too_large(format!("HTTP 413: {}", body)),
            400 | 422 => Self::schema_violation(format!("HTTP {}: {}", status, body)),
            404 => Self::NotFound {
                message: body.to_string(),
                code: ErrorCode::StoreNotFound,
            },
            408 | 429 => Self::TransientStore {
                message: format!("HTTP {}: {}", status, body),
                code: ErrorCode::StoreUnavailable,
                source: None,
            },
            500..=599 => Self::TransientStore {
                message: format!("HTTP {}: {}", status, body),
                code: ErrorCode::StoreServerError,
                source: None,
            },
            _ => Self::fatal_store(format!("HTTP {}: {}", status, body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error() {
        let err = KgError::missing_field("name", ErrorCode::ValMissingName);
        assert_eq!(err.code(), ErrorCode::ValMissingName);
        assert!(err.to_string().contains("name"));
        assert!(err.suggestion().is_some());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_http_status_classification() {
        assert!(KgError::from_http_status(503, "busy").is_retryable());
        assert!(KgError::from_http_status(500, "boom").is_retryable());
        assert!(KgError::from_http_status(429, "slow down").is_retryable());

        let too_large = KgError::from_http_status(413, "request entity too large");
        assert!(!too_large.is_retryable());
        assert!(too_large.is_payload_too_large());
        assert!(too_large.suggestion().unwrap().contains("never retried"));

        let schema = KgError::from_http_status(400, "unknown property");
        assert_eq!(schema.code(), ErrorCode::StoreSchemaViolation);
        assert!(!schema.is_retryable());

        assert!(matches!(
            KgError::from_http_status(404, "missing"),
            KgError::NotFound { .. }
        ));
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = KgError::timeout("get_entity", Duration::from_millis(50));
        assert!(err.is_retryable());
        assert_eq!(err.code(), ErrorCode::NetTimeout);
        assert!(!KgError::cancelled("get_entity").is_retryable());
    }

    #[test]
    fn test_in_context_prefixes_store_errors() {
        let err = KgError::payload_too_large("HTTP 413").in_context("group_Person_0");
        assert!(err.to_string().contains("group_Person_0: HTTP 413"));
        assert!(err.is_payload_too_large());
    }

    #[test]
    fn test_error_code_as_str() {
        assert_eq!(ErrorCode::StorePayloadTooLarge.as_str(), "STORE_003");
        assert_eq!(ErrorCode::ValMissingType.as_str(), "VAL_001");
    }
}
