//! Polling registry
//!
//! Process-wide collection of pollers behind the HTTP surface. One instance
//! per process, injected into callers; operations on different devices never
//! serialize on a common lock. The registry owns poller lifetimes: start
//! reloads the definition and builds a fresh poller, stop leaves the last
//! snapshot cached in the stopped poller, shutdown stops everything and
//! closes every session before returning.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::poller::{DevicePoller, TestOutcome, WriteReport, WriteRequest};
use super::repository::DeviceRepository;
use super::session::{SessionDiagnostics, SessionManager};
use crate::config::GatewayConfig;
use crate::error::{DevSrvError, Result};
use crate::model::{PollerStatus, Snapshot};

/// Repeated start requests inside this window are acknowledged, not re-run
const START_DEBOUNCE: Duration = Duration::from_secs(3);
/// Repeated stop requests inside this window are acknowledged, not re-run
const STOP_DEBOUNCE: Duration = Duration::from_secs(5);

/// Service-level status for diagnostics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub active_pollers: usize,
    pub known_pollers: usize,
    pub sessions: Vec<SessionDiagnostics>,
}

/// Process-wide poller registry
pub struct PollingRegistry {
    repository: Arc<dyn DeviceRepository>,
    sessions: Arc<SessionManager>,
    pollers: DashMap<String, Arc<DevicePoller>>,
    config: GatewayConfig,
    started_at: DateTime<Utc>,
    reaper_cancel: CancellationToken,
}

impl PollingRegistry {
    /// Build the registry and start the session reaper
    pub fn new(
        repository: Arc<dyn DeviceRepository>,
        sessions: Arc<SessionManager>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        let reaper_cancel = CancellationToken::new();
        Arc::clone(&sessions).spawn_reaper(reaper_cancel.clone());

        Arc::new(Self {
            repository,
            sessions,
            pollers: DashMap::new(),
            config,
            started_at: Utc::now(),
            reaper_cancel,
        })
    }

    /// Start polling a device
    ///
    /// Reloads the definition (edits take effect here), creates a fresh
    /// poller, and runs its first tick synchronously. A second start within
    /// the debounce window, or against an already-active poller, succeeds
    /// without disturbing the loop and only updates the stored interval.
    pub async fn start(&self, device_id: &str, interval: Option<Duration>) -> Result<()> {
        if let Some(poller) = self.poller(device_id) {
            if poller.status().is_polling {
                if let Some(interval) = interval {
                    poller.set_interval(interval);
                }
                let debounced = poller
                    .last_start_request()
                    .map(|at| at.elapsed() < START_DEBOUNCE)
                    .unwrap_or(false);
                debug!(device = device_id, debounced, "Start request on running poller");
                return Ok(());
            }
        }

        if self.active_count() >= self.config.max_concurrent_polls {
            return Err(DevSrvError::PollerLimit(self.config.max_concurrent_polls));
        }

        let device = self
            .repository
            .load_device(device_id)
            .await
            .map_err(|e| e.into_service_error(device_id))?;

        let poller = DevicePoller::new(
            device,
            Arc::clone(&self.sessions),
            self.config.default_timeout_ms,
        );
        self.pollers
            .insert(device_id.to_string(), Arc::clone(&poller));

        poller.start(interval).await
    }

    /// Stop polling; idempotent, debounced
    pub async fn stop(&self, device_id: &str) -> Result<()> {
        let Some(poller) = self.poller(device_id) else {
            return Ok(());
        };

        if !poller.status().is_polling {
            let debounced = poller
                .last_stop_request()
                .map(|at| at.elapsed() < STOP_DEBOUNCE)
                .unwrap_or(false);
            if debounced {
                debug!(device = device_id, "Stop request debounced");
                return Ok(());
            }
        }

        poller.stop().await;
        Ok(())
    }

    /// Poller status; devices without a poller report `Stopped`
    pub fn status(&self, device_id: &str) -> PollerStatus {
        self.poller(device_id)
            .map(|poller| poller.status())
            .unwrap_or_else(|| PollerStatus::stopped(device_id))
    }

    /// Latest snapshot, optionally forced fresh
    ///
    /// With no cached snapshot (or `force_refresh`) a one-shot read happens
    /// even while the poller is stopped; its result is cached and flagged
    /// stale unless the poller is active.
    pub async fn snapshot(&self, device_id: &str, force_refresh: bool) -> Result<Arc<Snapshot>> {
        let poller = self.poller_or_create(device_id).await?;

        if !force_refresh {
            if let Some(snapshot) = poller.latest_snapshot() {
                return Ok(snapshot);
            }
        }

        poller.read_once().await
    }

    /// Always-fresh one-shot read
    pub async fn read_once(&self, device_id: &str) -> Result<Arc<Snapshot>> {
        let poller = self.poller_or_create(device_id).await?;
        poller.read_once().await
    }

    /// One-shot connectivity probe; the poller need not be running
    pub async fn test_connection(&self, device_id: &str) -> Result<TestOutcome> {
        let poller = self.poller_or_create(device_id).await?;
        Ok(poller.test_connection().await)
    }

    /// Best-effort control write
    pub async fn write(&self, device_id: &str, requests: &[WriteRequest]) -> Result<WriteReport> {
        let poller = self.poller_or_create(device_id).await?;
        poller.write(requests).await
    }

    /// Lossy latest-snapshot stream; ends when the poller is replaced
    pub async fn subscribe(
        &self,
        device_id: &str,
    ) -> Result<watch::Receiver<Option<Arc<Snapshot>>>> {
        let poller = self.poller_or_create(device_id).await?;
        Ok(poller.subscribe())
    }

    /// (name, connection type, address) for error payloads; `None` when the
    /// definition cannot be loaded
    pub async fn device_summary(&self, device_id: &str) -> Option<(String, String, String)> {
        let poller = match self.poller(device_id) {
            Some(poller) => poller,
            None => self.poller_or_create(device_id).await.ok()?,
        };
        let device = poller.device();
        Some((
            device.name.clone(),
            device.connection.kind_name().to_string(),
            device.connection.address(),
        ))
    }

    /// Stop all pollers concurrently, then close every session
    ///
    /// Returns the ids of pollers that missed the deadline.
    pub async fn shutdown(&self, deadline: Duration) -> Vec<String> {
        info!(pollers = self.pollers.len(), "Registry shutting down");
        self.reaper_cancel.cancel();

        let pollers: Vec<_> = self
            .pollers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let stops = pollers.into_iter().map(|(id, poller)| async move {
            match tokio::time::timeout(deadline, poller.stop()).await {
                Ok(()) => None,
                Err(_) => Some(id),
            }
        });

        let failed: Vec<String> = futures::future::join_all(stops)
            .await
            .into_iter()
            .flatten()
            .collect();

        for id in &failed {
            warn!(device = %id, "Poller did not stop before the shutdown deadline");
        }

        self.sessions.close_all().await;
        failed
    }

    /// Service status for the diagnostics route
    pub fn registry_status(&self) -> RegistryStatus {
        RegistryStatus {
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            active_pollers: self.active_count(),
            known_pollers: self.pollers.len(),
            sessions: self.sessions.diagnostics(),
        }
    }

    fn poller(&self, device_id: &str) -> Option<Arc<DevicePoller>> {
        self.pollers
            .get(device_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Existing poller, or one built from a freshly loaded definition
    /// (left stopped) to serve one-shot operations and the snapshot cache
    async fn poller_or_create(&self, device_id: &str) -> Result<Arc<DevicePoller>> {
        if let Some(poller) = self.poller(device_id) {
            return Ok(poller);
        }

        let device = self
            .repository
            .load_device(device_id)
            .await
            .map_err(|e| e.into_service_error(device_id))?;

        let poller = DevicePoller::new(
            device,
            Arc::clone(&self.sessions),
            self.config.default_timeout_ms,
        );
        self.pollers
            .insert(device_id.to_string(), Arc::clone(&poller));
        Ok(poller)
    }

    fn active_count(&self) -> usize {
        self.pollers
            .iter()
            .filter(|entry| entry.value().status().is_polling)
            .count()
    }
}

impl Drop for PollingRegistry {
    fn drop(&mut self) {
        self.reaper_cancel.cancel();
    }
}
