//! Error types for crosspost

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrosspostError>;

#[derive(Error, Debug)]
pub enum CrosspostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Queue error: {0}")]
    Queue(String),
}

impl CrosspostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CrosspostError::InvalidInput(_) => 3,
            CrosspostError::NotFound(_) => 3,
            CrosspostError::Unauthorized(_) => 2,
            CrosspostError::Config(_) => 2,
            CrosspostError::Platform(PlatformError::Authentication(_)) => 2,
            CrosspostError::Platform(_) => 1,
            CrosspostError::Database(_) => 1,
            CrosspostError::Storage(_) => 1,
            CrosspostError::Serialization(_) => 1,
            CrosspostError::Queue(_) => 1,
        }
    }

    /// Whether a retry of the same operation may succeed.
    ///
    /// Only platform network and rate-limit failures qualify; everything else
    /// is treated as permanent by the delivery worker.
    pub fn is_transient(&self) -> bool {
        match self {
            CrosspostError::Platform(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl PlatformError {
    /// Network and rate-limit failures are transient; the rest are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Network(_) | PlatformError::RateLimit(_) => true,
            PlatformError::Authentication(_)
            | PlatformError::Validation(_)
            | PlatformError::Posting(_)
            | PlatformError::NotImplemented(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CrosspostError::InvalidInput("Empty content".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_not_found() {
        let error = CrosspostError::NotFound("job abc".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_unauthorized() {
        let error = CrosspostError::Unauthorized("unknown api key".to_string());
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_authentication_error() {
        let error = CrosspostError::Platform(PlatformError::Authentication("bad token".into()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = CrosspostError::Config(ConfigError::MissingField("database.path".into()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_other_errors() {
        let posting = CrosspostError::Platform(PlatformError::Posting("boom".into()));
        assert_eq!(posting.exit_code(), 1);

        let db = CrosspostError::Database(DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        )));
        assert_eq!(db.exit_code(), 1);

        let storage = CrosspostError::Storage(StorageError::InvalidKey("../x".into()));
        assert_eq!(storage.exit_code(), 1);
    }

    #[test]
    fn test_transient_classification() {
        assert!(PlatformError::Network("reset".into()).is_transient());
        assert!(PlatformError::RateLimit("429".into()).is_transient());
        assert!(!PlatformError::Authentication("401".into()).is_transient());
        assert!(!PlatformError::Validation("too long".into()).is_transient());
        assert!(!PlatformError::Posting("rejected".into()).is_transient());
        assert!(!PlatformError::NotImplemented("media".into()).is_transient());
    }

    #[test]
    fn test_crosspost_error_transient_only_for_platform() {
        let network: CrosspostError = PlatformError::Network("timeout".into()).into();
        assert!(network.is_transient());

        let invalid = CrosspostError::InvalidInput("nope".into());
        assert!(!invalid.is_transient());
    }

    #[test]
    fn test_error_message_formatting() {
        let error = CrosspostError::Platform(PlatformError::RateLimit("Too many requests".into()));
        assert_eq!(
            error.to_string(),
            "Platform error: Rate limit exceeded: Too many requests"
        );

        let error = CrosspostError::Config(ConfigError::InvalidValue {
            field: "queue.max_attempts".into(),
            reason: "must be at least 1".into(),
        });
        assert_eq!(
            error.to_string(),
            "Configuration error: Invalid value for queue.max_attempts: must be at least 1"
        );
    }

    #[test]
    fn test_error_conversion_from_storage_error() {
        let storage_error = StorageError::InvalidKey("a/../b".to_string());
        let error: CrosspostError = storage_error.into();

        match error {
            CrosspostError::Storage(_) => {}
            _ => panic!("Expected CrosspostError::Storage"),
        }
    }

    #[test]
    fn test_platform_error_clone() {
        let original = PlatformError::Network("Connection failed".to_string());
        let cloned = original.clone();

        assert_eq!(format!("{}", original), format!("{}", cloned));
    }
}
