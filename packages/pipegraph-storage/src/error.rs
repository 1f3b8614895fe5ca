//! Error types for pipegraph-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (SQLite)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// File record not found
    FileNotFound,
    /// Input unit not found
    UnitNotFound,
    /// Pipeline instance not found
    InstanceNotFound,
    /// Stage record not found
    RecordNotFound,
    /// I/O errors
    IO,
    /// Configuration errors
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::UnitNotFound => "unit_not_found",
            ErrorKind::InstanceNotFound => "instance_not_found",
            ErrorKind::RecordNotFound => "record_not_found",
            ErrorKind::IO => "io",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn file_not_found(file_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::FileNotFound,
            format!("File not found: {}", file_id),
        )
    }

    pub fn unit_not_found(unit_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::UnitNotFound,
            format!("Input unit not found: {}", unit_id),
        )
    }

    pub fn instance_not_found(instance: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::InstanceNotFound,
            format!("Pipeline instance not found: {}", instance),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::FileNotFound
                | ErrorKind::UnitNotFound
                | ErrorKind::InstanceNotFound
                | ErrorKind::RecordNotFound
        )
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::IO, format!("IO error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
