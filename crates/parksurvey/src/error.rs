//! Error types for parksurvey.
//!
//! This module defines all error types used throughout the parksurvey crate,
//! covering local storage, the shared remote mirror, and session control.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for parksurvey operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A local storage operation failed.
    #[error("local storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// A record with the same id is already stored locally.
    #[error("record '{id}' already exists")]
    DuplicateKey {
        /// The colliding record id.
        id: String,
    },

    // === Remote Errors ===
    /// The capability URL does not match the expected scheme.
    #[error("invalid shared endpoint: {url}")]
    InvalidEndpoint {
        /// The rejected URL.
        url: String,
    },

    /// The remote store answered with a non-success HTTP status.
    #[error("remote store returned HTTP {status}")]
    RemoteStatus {
        /// The HTTP status code.
        status: u16,
    },

    /// The remote store could not be reached.
    #[error("remote store unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// A payload did not have the expected shape.
    #[error("unexpected payload: {message}")]
    Parse {
        /// Description of the mismatch.
        message: String,
    },

    // === Session Errors ===
    /// The user declined to overwrite local data.
    #[error("declined by user")]
    UserDeclined,

    /// The operation needs a shared session but none is active.
    #[error("no shared session is active")]
    NotShared,

    /// The session changed mode or endpoint while the operation was in flight.
    #[error("session changed while the operation was in flight")]
    Superseded,

    // === Validation Errors ===
    /// A record field failed validation.
    #[error("invalid record: {message}")]
    InvalidRecord {
        /// Description of the validation failure.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for parksurvey operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new parse error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a new record validation error.
    #[must_use]
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Create an invalid endpoint error for the given URL.
    #[must_use]
    pub fn invalid_endpoint(url: impl Into<String>) -> Self {
        Self::InvalidEndpoint { url: url.into() }
    }

    /// Check if this error came from the remote mirror (status or transport).
    #[must_use]
    pub fn is_remote_error(&self) -> bool {
        matches!(self, Self::RemoteStatus { .. } | Self::Transport(_))
    }

    /// Check if this error came from the local store.
    #[must_use]
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::DatabaseOpen { .. }
                | Self::DatabaseMigration { .. }
                | Self::DuplicateKey { .. }
        )
    }

    /// The HTTP status carried by a remote status error, if any.
    #[must_use]
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            Self::RemoteStatus { status } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UserDeclined;
        assert_eq!(err.to_string(), "declined by user");

        let err = Error::RemoteStatus { status: 503 };
        assert_eq!(err.to_string(), "remote store returned HTTP 503");
    }

    #[test]
    fn test_invalid_endpoint_display() {
        let err = Error::invalid_endpoint("https://evil.example/x");
        let msg = err.to_string();
        assert!(msg.contains("invalid shared endpoint"));
        assert!(msg.contains("evil.example"));
    }

    #[test]
    fn test_is_remote_error() {
        assert!(Error::RemoteStatus { status: 500 }.is_remote_error());
        assert!(!Error::UserDeclined.is_remote_error());
        assert!(!Error::invalid_endpoint("x").is_remote_error());
    }

    #[test]
    fn test_is_storage_error() {
        let err = Error::DuplicateKey {
            id: "a".to_string(),
        };
        assert!(err.is_storage_error());
        assert!(!Error::RemoteStatus { status: 404 }.is_storage_error());
    }

    #[test]
    fn test_remote_status() {
        assert_eq!(Error::RemoteStatus { status: 409 }.remote_status(), Some(409));
        assert_eq!(Error::UserDeclined.remote_status(), None);
    }

    #[test]
    fn test_session_errors_display() {
        assert_eq!(Error::NotShared.to_string(), "no shared session is active");
        assert!(Error::Superseded.to_string().contains("in flight"));
    }

    #[test]
    fn test_duplicate_key_display() {
        let err = Error::DuplicateKey {
            id: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "record 'abc123' already exists");
    }

    #[test]
    fn test_parse_error() {
        let err = Error::parse("expected a JSON array");
        assert_eq!(err.to_string(), "unexpected payload: expected a JSON array");
    }

    #[test]
    fn test_invalid_record_error() {
        let err = Error::invalid_record("negative cost");
        assert!(err.to_string().contains("negative cost"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let result = rusqlite::Connection::open_with_flags(
            "/nonexistent/path/db.sqlite",
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        );
        if let Err(sqlite_err) = result {
            let err: Error = sqlite_err.into();
            assert!(matches!(err, Error::Storage(_)));
            assert!(err.is_storage_error());
        }
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_database_migration_error_display() {
        let err = Error::DatabaseMigration {
            message: "version mismatch".to_string(),
        };
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "invalid interval".to_string(),
        };
        assert!(err.to_string().contains("invalid interval"));
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/forbidden"));
    }
}
