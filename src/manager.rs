// src/manager.rs - Service lifecycle for the core's long-lived components

//! Explicitly constructed service objects with a uniform lifecycle.
//!
//! The original design relied on process-wide singletons; here every
//! long-lived component (task manager, event bus, logging) is a `Manager`
//! constructed by the composition root and initialized/shut down in
//! dependency order. One instance per process is a documented convention,
//! not an enforced global, so tests can build isolated instances freely.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::types::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerState {
    Created,
    Initializing,
    Running,
    ShuttingDown,
    Shutdown,
    Error,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Running => write!(f, "RUNNING"),
            Self::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Unhealthy => write!(f, "UNHEALTHY"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub id: Uuid,
    pub name: String,
    pub state: ManagerState,
    pub health: HealthStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: Option<Duration>,
    pub last_updated: DateTime<Utc>,
    pub message: Option<String>,
    pub metadata: Metadata,
}

impl ManagerStatus {
    /// Creates a new manager status
    pub fn new(id: Uuid, name: impl Into<String>, state: ManagerState) -> Self {
        Self {
            id,
            name: name.into(),
            state,
            health: HealthStatus::Unknown,
            created_at: Utc::now(),
            started_at: None,
            uptime: None,
            last_updated: Utc::now(),
            message: None,
            metadata: HashMap::new(),
        }
    }

    /// Updates the manager state
    pub fn update_state(&mut self, state: ManagerState) {
        self.state = state;
        self.last_updated = Utc::now();

        if state == ManagerState::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }

        if let Some(started) = self.started_at {
            if state == ManagerState::Running {
                self.uptime = Utc::now().signed_duration_since(started).to_std().ok();
            }
        }
    }

    /// Sets the health status
    pub fn set_health(&mut self, health: HealthStatus) {
        self.health = health;
        self.last_updated = Utc::now();
    }

    /// Sets a status message
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
        self.last_updated = Utc::now();
    }

    /// Adds metadata to the status
    pub fn add_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
        self.last_updated = Utc::now();
    }
}

/// Core trait for all long-lived service components
#[async_trait::async_trait]
pub trait Manager: Send + Sync + fmt::Debug {
    /// Returns the manager name
    fn name(&self) -> &str;

    /// Returns the manager ID
    fn id(&self) -> Uuid;

    /// Initializes the manager
    async fn initialize(&mut self) -> Result<()>;

    /// Shuts down the manager
    async fn shutdown(&mut self) -> Result<()>;

    /// Returns current status
    async fn status(&self) -> ManagerStatus;

    /// Performs health check
    async fn health_check(&self) -> HealthStatus {
        let status = self.status().await;
        match status.state {
            ManagerState::Running => HealthStatus::Healthy,
            ManagerState::Error => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

/// Managed state container for managers
pub struct ManagedState {
    id: Uuid,
    name: String,
    status: Arc<RwLock<ManagerStatus>>,
}

impl ManagedState {
    /// Creates a new managed state
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        let name_str = name.into();
        let status = ManagerStatus::new(id, name_str.clone(), ManagerState::Created);

        Self {
            id,
            name: name_str,
            status: Arc::new(RwLock::new(status)),
        }
    }

    /// Returns the manager ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the manager name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the manager state
    pub async fn set_state(&self, state: ManagerState) {
        let mut status = self.status.write().await;
        status.update_state(state);
    }

    /// Sets the health status
    pub async fn set_health(&self, health: HealthStatus) {
        let mut status = self.status.write().await;
        status.set_health(health);
    }

    /// Sets a status message
    pub async fn set_message(&self, message: impl Into<String>) {
        let mut status = self.status.write().await;
        status.set_message(message);
    }

    /// Adds metadata
    pub async fn add_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        let mut status = self.status.write().await;
        status.add_metadata(key, value);
    }

    /// Returns current status
    pub async fn status(&self) -> ManagerStatus {
        self.status.read().await.clone()
    }

    /// Returns current state
    pub async fn state(&self) -> ManagerState {
        self.status.read().await.state
    }

    /// Returns current health
    pub async fn health(&self) -> HealthStatus {
        self.status.read().await.health
    }
}

impl fmt::Debug for ManagedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedState")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_managed_state_transitions() {
        let state = ManagedState::new(Uuid::new_v4(), "test_manager");
        assert_eq!(state.state().await, ManagerState::Created);

        state.set_state(ManagerState::Initializing).await;
        assert_eq!(state.state().await, ManagerState::Initializing);

        state.set_state(ManagerState::Running).await;
        let status = state.status().await;
        assert_eq!(status.state, ManagerState::Running);
        assert!(status.started_at.is_some());

        state.set_state(ManagerState::Shutdown).await;
        assert_eq!(state.state().await, ManagerState::Shutdown);
    }

    #[tokio::test]
    async fn test_status_metadata() {
        let state = ManagedState::new(Uuid::new_v4(), "test_manager");
        state
            .add_metadata("active_tasks", serde_json::Value::from(3))
            .await;

        let status = state.status().await;
        assert_eq!(status.name, "test_manager");
        assert_eq!(
            status.metadata.get("active_tasks"),
            Some(&serde_json::Value::from(3))
        );
        assert_eq!(status.health, HealthStatus::Unknown);
    }
}
