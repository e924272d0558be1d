// src/error.rs - Structured error handling for the orchestration core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration {
        key: Option<String>,
        validation_errors: Vec<String>,
    },
    Manager {
        manager_name: String,
        operation: ManagerOperation,
    },
    Task {
        task_id: Option<u64>,
        task_name: Option<String>,
        cancelled: bool,
    },
    Pool {
        label: String,
        operation: PoolOperation,
    },
    Event {
        topic: Option<String>,
        operation: EventOperation,
    },
    Application,
    Io,
    Serialization,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerOperation {
    Initialize,
    Shutdown,
    Configure,
    Operation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolOperation {
    Submit,
    Dispatch,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOperation {
    Publish,
    Subscribe,
    Unsubscribe,
    Flush,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    pub severity: ErrorSeverity,
    pub source: String,
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub metadata: crate::types::Metadata,
    pub causes: Vec<String>,
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            severity: ErrorSeverity::Medium,
            source: "unknown".to_string(),
            correlation_id: None,
            timestamp: Utc::now(),
            metadata: std::collections::HashMap::new(),
            causes: Vec::new(),
        }
    }

    /// Sets the error severity
    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the error source
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Sets the correlation ID
    pub fn correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Adds metadata to the error
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Adds a cause to the error chain
    pub fn caused_by(mut self, cause: impl fmt::Display) -> Self {
        self.causes.push(cause.to_string());
        self
    }

    /// Checks if the error is critical
    pub fn is_critical(&self) -> bool {
        matches!(self.severity, ErrorSeverity::Critical)
    }

    /// Creates a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Configuration {
                key: None,
                validation_errors: Vec::new(),
            },
            message,
        )
        .severity(ErrorSeverity::High)
    }

    /// Creates a manager operation error
    pub fn manager(
        manager_name: impl Into<String>,
        operation: ManagerOperation,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Manager {
                manager_name: manager_name.into(),
                operation,
            },
            message,
        )
        .severity(ErrorSeverity::High)
    }

    /// Creates a task error
    pub fn task(
        task_id: Option<u64>,
        task_name: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Task {
                task_id,
                task_name,
                cancelled: false,
            },
            message,
        )
    }

    /// Creates a pool error
    pub fn pool(
        label: impl Into<String>,
        operation: PoolOperation,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Pool {
                label: label.into(),
                operation,
            },
            message,
        )
    }

    /// Creates an event bus error
    pub fn event(
        topic: Option<String>,
        operation: EventOperation,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Event { topic, operation }, message)
    }

    /// Creates a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}): {}",
            self.severity, self.source, self.id, self.message
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let msg = err.to_string();

        let mut error = Error::new(ErrorKind::Io, msg);
        error.source = "std::io::Error".to_string();
        error.severity = ErrorSeverity::High;

        error
    }
}

/// Extension trait for Results to add context
pub trait ResultExt<T> {
    /// Adds context to an error
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Sets the error source
    fn with_source(self, source: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::new(ErrorKind::Application, f()).caused_by(e))
    }

    fn with_source(self, source: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            Error::new(ErrorKind::Application, e.to_string())
                .source(source)
                .caused_by(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = Error::config("debounce window must be positive")
            .source("config")
            .metadata(
                "key",
                serde_json::Value::String("event_bus.debounce_ms".to_string()),
            );

        assert_eq!(error.severity, ErrorSeverity::High);
        assert_eq!(error.source, "config");
        assert!(matches!(error.kind, ErrorKind::Configuration { .. }));
        assert!(error.metadata.contains_key("key"));
    }

    #[test]
    fn test_task_error() {
        let error = Error::task(Some(42), Some("update datasource".to_string()), "body failed");
        assert!(matches!(
            error.kind,
            ErrorKind::Task {
                task_id: Some(42),
                ..
            }
        ));
        assert_eq!(error.severity, ErrorSeverity::Medium);
    }

    #[test]
    fn test_pool_error() {
        let error = Error::pool("download", PoolOperation::Submit, "pool is shut down");
        assert!(matches!(error.kind, ErrorKind::Pool { .. }));
    }

    #[test]
    fn test_result_ext_context() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk unplugged",
        ));

        let error = result
            .with_context(|| "copying artwork".to_string())
            .unwrap_err();
        assert_eq!(error.message, "copying artwork");
        assert_eq!(error.causes.len(), 1);
    }
}
