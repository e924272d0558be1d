// src/logging.rs

//! Structured logging built on tracing
//!
//! Console output in pretty, compact, or JSON form plus an optional
//! non-blocking file appender. The subscriber is installed globally on
//! first initialization; later instances (e.g. in tests) detect the
//! existing subscriber and keep running without error.

use async_trait::async_trait;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};
use uuid::Uuid;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Error, ManagerOperation, Result};
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};

pub struct LoggingManager {
    state: ManagedState,
    config: LoggingConfig,
    // Dropping the guard flushes buffered file output, so it lives as long
    // as the manager.
    file_guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for LoggingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingManager")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("file_output", &self.file_guard.is_some())
            .finish()
    }
}

impl LoggingManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            state: ManagedState::new(Uuid::new_v4(), "logging_manager"),
            config,
            file_guard: None,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.config.level.clone()))
    }

    fn install_subscriber(&mut self) -> Result<()> {
        let console_layer = match self.config.format {
            LogFormat::Json => fmt::layer().json().boxed(),
            LogFormat::Pretty => fmt::layer().pretty().boxed(),
            LogFormat::Compact => fmt::layer().compact().boxed(),
        };

        let file_layer = if let Some(file_config) = &self.config.file {
            let appender = tracing_appender::rolling::daily(
                &file_config.directory,
                &file_config.file_name,
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            self.file_guard = Some(guard);
            Some(fmt::layer().with_ansi(false).with_writer(non_blocking).boxed())
        } else {
            None
        };

        let registry = tracing_subscriber::registry()
            .with(self.env_filter())
            .with(console_layer)
            .with(file_layer);

        // A subscriber may already be installed (another core instance in
        // the same process, or a test harness); that is not a failure.
        if registry.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already installed");
        }

        Ok(())
    }
}

#[async_trait]
impl Manager for LoggingManager {
    fn name(&self) -> &str {
        "logging_manager"
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        self.install_subscriber().map_err(|e| {
            Error::manager(
                "logging_manager",
                ManagerOperation::Initialize,
                format!("Failed to install tracing subscriber: {}", e),
            )
        })?;

        self.state.set_state(ManagerState::Running).await;
        tracing::info!(level = %self.config.level, "Logging initialized");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;

        // Flush any buffered file output.
        self.file_guard.take();

        self.state.set_state(ManagerState::Shutdown).await;
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        status.add_metadata("level", serde_json::Value::from(self.config.level.clone()));
        status.add_metadata(
            "file_output",
            serde_json::Value::from(self.config.file.is_some()),
        );
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileLogConfig;

    #[tokio::test]
    async fn test_logging_manager_lifecycle() {
        let mut manager = LoggingManager::new(LoggingConfig::default());
        manager.initialize().await.unwrap();

        let status = manager.status().await;
        assert_eq!(status.state, ManagerState::Running);

        manager.shutdown().await.unwrap();
        assert_eq!(manager.state.state().await, ManagerState::Shutdown);
    }

    #[tokio::test]
    async fn test_file_output_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Compact,
            file: Some(FileLogConfig {
                directory: dir.path().to_path_buf(),
                file_name: "core.log".to_string(),
            }),
        };

        let mut manager = LoggingManager::new(config);
        manager.initialize().await.unwrap();
        assert!(manager.file_guard.is_some());

        let status = manager.status().await;
        assert_eq!(
            status.metadata.get("file_output"),
            Some(&serde_json::Value::from(true))
        );

        manager.shutdown().await.unwrap();
        assert!(manager.file_guard.is_none());
    }
}
