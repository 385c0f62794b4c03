use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Meta-generation error: {0}")]
    MetaGeneration(#[from] MetaGenerationError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Generation provider (HTTP) errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {message} (attempts: {attempts})")]
    Unavailable { message: String, attempts: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProviderError {
    /// Whether the failure is worth another attempt (transport, 5xx, 429, timeout).
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Api { status, .. } => *status >= 500 || *status == 429,
            ProviderError::Timeout { .. } | ProviderError::Http(_) => true,
            ProviderError::Unavailable { .. } => true,
            ProviderError::InvalidResponse { .. } => false,
        }
    }
}

/// Failure of a single structured-generation attempt.
///
/// These never escape the generation client: once the attempt budget is
/// spent the caller receives the fallback result instead.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Transient provider failure: {0}")]
    Transient(#[from] ProviderError),

    #[error("Malformed output: {message}")]
    Malformed { message: String },

    #[error("Degenerate output: {period}-char segment repeated")]
    Degenerate { period: usize },

    #[error("Missing required fields: {fields}")]
    MissingFields { fields: String },
}

/// Variant registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Variant not found: {version}")]
    VariantNotFound { version: String },

    #[error("Parent {parent} already has an active candidate: {candidate}")]
    ActiveCandidateExists { parent: String, candidate: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Meta-generation (candidate authoring) errors
#[derive(Debug, Error)]
pub enum MetaGenerationError {
    #[error("Candidate is missing required markers: {markers}")]
    MissingMarkers { markers: String },

    #[error("Candidate too short: {length} chars, need at least {required}")]
    TooShort { length: usize, required: usize },

    #[error("Provider returned no candidate text")]
    EmptyOutput,

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Result type alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Connection {
            message: "failed to connect".to_string(),
        };
        assert_eq!(err.to_string(), "Database connection failed: failed to connect");

        let err = StorageError::NotFound {
            entity: "Variant",
            id: "v2.0".to_string(),
        };
        assert_eq!(err.to_string(), "Variant not found: v2.0");
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::Api {
            status: 503,
            message: "overloaded".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 503 - overloaded");

        let err = ProviderError::Timeout { timeout_ms: 30000 };
        assert_eq!(err.to_string(), "Request timeout after 30000ms");
    }

    #[test]
    fn test_provider_error_transient_classification() {
        assert!(ProviderError::Api {
            status: 500,
            message: String::new()
        }
        .is_transient());
        assert!(ProviderError::Api {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(!ProviderError::Api {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(ProviderError::Timeout { timeout_ms: 1 }.is_transient());
        assert!(!ProviderError::InvalidResponse {
            message: String::new()
        }
        .is_transient());
    }

    #[test]
    fn test_generation_error_display() {
        let err = GenerationError::Degenerate { period: 25 };
        assert_eq!(err.to_string(), "Degenerate output: 25-char segment repeated");

        let err = GenerationError::MissingFields {
            fields: "summary, overallScore".to_string(),
        };
        assert_eq!(err.to_string(), "Missing required fields: summary, overallScore");

        let err: GenerationError = ProviderError::Timeout { timeout_ms: 10 }.into();
        assert!(matches!(err, GenerationError::Transient(_)));
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::ActiveCandidateExists {
            parent: "v2.0".to_string(),
            candidate: "v2.0-auto".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Parent v2.0 already has an active candidate: v2.0-auto"
        );
    }

    #[test]
    fn test_meta_generation_error_display() {
        let err = MetaGenerationError::TooShort {
            length: 100,
            required: 800,
        };
        assert_eq!(
            err.to_string(),
            "Candidate too short: 100 chars, need at least 800"
        );

        let err = MetaGenerationError::MissingMarkers {
            markers: "styleDNA".to_string(),
        };
        assert_eq!(err.to_string(), "Candidate is missing required markers: styleDNA");
    }

    #[test]
    fn test_error_conversion_to_app_error() {
        let err: AppError = StorageError::Query {
            message: "bad".to_string(),
        }
        .into();
        assert!(matches!(err, AppError::Storage(_)));

        let err: AppError = RegistryError::VariantNotFound {
            version: "x".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Registry error: Variant not found: x");
    }
}
