//! Device repository port
//!
//! The core fetches definitions through this read-only interface and never
//! re-reads one during a poller's lifetime; edits take effect on the next
//! start. Storage is a collaborator concern; the in-memory implementation
//! below serves tests and standalone deployments seeded from a JSON file.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::error::DevSrvError;
use crate::model::DeviceDefinition;

/// Repository-side failures
#[derive(Error, Debug, Clone)]
pub enum RepositoryError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Repository backend error: {0}")]
    Backend(String),
}

impl RepositoryError {
    /// Attach the looked-up id to turn this into a service error
    pub fn into_service_error(self, device_id: &str) -> DevSrvError {
        match self {
            RepositoryError::NotFound(_) => DevSrvError::DeviceNotFound(device_id.to_string()),
            RepositoryError::Backend(message) => DevSrvError::Repository(message),
        }
    }
}

/// Read-only access to device definitions
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn load_device(&self, id: &str) -> Result<DeviceDefinition, RepositoryError>;
}

/// In-memory repository for tests and JSON-seeded deployments
#[derive(Debug, Default)]
pub struct MemoryRepository {
    devices: DashMap<String, Arc<DeviceDefinition>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a definition
    pub fn upsert(&self, device: DeviceDefinition) {
        self.devices.insert(device.id.clone(), Arc::new(device));
    }

    pub fn remove(&self, id: &str) {
        self.devices.remove(id);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Load a JSON array of device definitions
    pub fn load_json_file(&self, path: &Path) -> Result<usize, DevSrvError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DevSrvError::Config(format!("cannot read {}: {e}", path.display())))?;
        let devices: Vec<DeviceDefinition> = serde_json::from_str(&text)
            .map_err(|e| DevSrvError::Config(format!("cannot parse {}: {e}", path.display())))?;

        let count = devices.len();
        for device in devices {
            self.upsert(device);
        }
        info!(count, path = %path.display(), "Loaded device definitions");
        Ok(count)
    }
}

#[async_trait]
impl DeviceRepository for MemoryRepository {
    async fn load_device(&self, id: &str) -> Result<DeviceDefinition, RepositoryError> {
        self.devices
            .get(id)
            .map(|entry| entry.value().as_ref().clone())
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }
}
