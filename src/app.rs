// src/app.rs

//! Composition root for the orchestration core
//!
//! [`Core`] owns the long-lived service objects (logging, event bus, task
//! manager), initializes them in dependency order, and shuts them down in
//! reverse. It replaces the original design's process-wide singletons: the
//! embedding application constructs exactly one `Core` and passes
//! references to the components that need them, and tests construct as
//! many isolated instances as they like.

use std::path::Path;

use crate::config::CoreConfig;
use crate::error::Result;
use crate::event::EventBusManager;
use crate::logging::LoggingManager;
use crate::manager::{Manager, ManagerState};
use crate::task::TaskManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Created,
    Running,
    Shutdown,
}

/// Builder for [`Core`].
#[derive(Debug, Default)]
pub struct CoreBuilder {
    config: Option<CoreConfig>,
    env_overrides: bool,
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Loads configuration from a file before building.
    pub async fn with_config_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.config = Some(CoreConfig::load(path).await?);
        Ok(self)
    }

    /// Applies `TASKFORGE_*` environment overrides on top of the chosen
    /// configuration.
    pub fn with_env_overrides(mut self) -> Self {
        self.env_overrides = true;
        self
    }

    pub fn build(self) -> Core {
        let mut config = self.config.unwrap_or_default();
        if self.env_overrides {
            config.apply_env_overrides();
        }

        Core {
            logging: LoggingManager::new(config.logging.clone()),
            event_bus: EventBusManager::new(config.event_bus.clone()),
            tasks: TaskManager::new(config.tasks.clone()),
            config,
            state: CoreState::Created,
        }
    }
}

/// The assembled orchestration core: one instance per process by
/// convention.
#[derive(Debug)]
pub struct Core {
    config: CoreConfig,
    state: CoreState,
    logging: LoggingManager,
    event_bus: EventBusManager,
    tasks: TaskManager,
}

impl Core {
    pub fn builder() -> CoreBuilder {
        CoreBuilder::new()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn state(&self) -> CoreState {
        self.state
    }

    /// The change notification bus.
    pub fn event_bus(&self) -> &EventBusManager {
        &self.event_bus
    }

    /// The task router.
    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Initializes all managers in dependency order: logging first so the
    /// rest can report, then the event bus, then the task pools.
    pub async fn initialize(&mut self) -> Result<()> {
        tracing::debug!(app = %self.config.app.name, "Initializing core");

        self.logging.initialize().await?;
        self.event_bus.initialize().await?;
        self.tasks.initialize().await?;

        self.state = CoreState::Running;
        tracing::info!(
            app = %self.config.app.name,
            version = %self.config.app.version,
            "Core initialized"
        );
        Ok(())
    }

    /// Shuts down in reverse order. Task pools stop first so nothing
    /// publishes into a dead bus.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down core");

        self.tasks.shutdown().await?;
        self.event_bus.shutdown().await?;
        self.logging.shutdown().await?;

        self.state = CoreState::Shutdown;
        Ok(())
    }

    /// True when every manager reports a running state.
    pub async fn is_healthy(&self) -> bool {
        self.logging.status().await.state == ManagerState::Running
            && self.event_bus.status().await.state == ManagerState::Running
            && self.tasks.status().await.state == ManagerState::Running
    }
}
