use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::server::events::Actor;
use crate::server::lifecycle::LifecycleEngine;
use crate::server::process::ProcessState;
use crate::server::{InstanceId, ServerStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Server health status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHealth {
    /// Running and its process is alive
    Healthy,
    /// Running, but the process could not be checked
    Degraded,
    /// In `Error`
    Unhealthy,
    /// Not running, or not checked yet
    Unknown,
}

struct MonitorCore {
    engine: Arc<LifecycleEngine>,
    config: MonitorConfig,
    health: Mutex<HashMap<InstanceId, ServerHealth>>,
    failure_counts: Mutex<HashMap<InstanceId, u32>>,
    last_checked: Mutex<HashMap<InstanceId, DateTime<Utc>>>,
}

/// Crash watch for running servers
///
/// Periodically polls every `Running` instance. A process found dead moves
/// the instance to `Error`; when both the monitor and the instance allow
/// auto-restart, the instance is recovered, up to `max_consecutive_failures`
/// crashes without being seen alive in between.
pub struct ServerMonitor {
    core: Arc<MonitorCore>,
    monitor_task: Option<JoinHandle<()>>,
    shutdown: Option<CancellationToken>,
}

impl ServerMonitor {
    /// Create a new server monitor
    pub fn new(engine: Arc<LifecycleEngine>, config: MonitorConfig) -> Self {
        Self {
            core: Arc::new(MonitorCore {
                engine,
                config,
                health: Mutex::new(HashMap::new()),
                failure_counts: Mutex::new(HashMap::new()),
                last_checked: Mutex::new(HashMap::new()),
            }),
            monitor_task: None,
            shutdown: None,
        }
    }

    /// Start the monitor loop
    pub fn start(&mut self) -> Result<()> {
        if self.monitor_task.is_some() {
            return Ok(());
        }

        let core = Arc::clone(&self.core);
        let token = CancellationToken::new();
        let child = token.clone();
        let period = Duration::from_secs(self.core.config.check_interval_secs.max(1));

        let task = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => core.check_all().await,
                }
            }
            tracing::debug!("Monitor loop stopped");
        });

        tracing::info!(interval_secs = period.as_secs(), "Monitor started");
        self.monitor_task = Some(task);
        self.shutdown = Some(token);
        Ok(())
    }

    /// Stop the monitor loop and wait for it to finish its current check
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.shutdown.take() {
            token.cancel();
        }
        if let Some(task) = self.monitor_task.take() {
            task.await
                .map_err(|e| Error::Other(format!("Monitor task failed: {}", e)))?;
        }
        Ok(())
    }

    /// Whether the loop is running
    pub fn is_running(&self) -> bool {
        self.monitor_task.is_some()
    }

    /// Last health recorded for an instance
    pub fn get_health(&self, instance_id: &InstanceId) -> Result<ServerHealth> {
        let health = self
            .core
            .health
            .lock()
            .map_err(|_| Error::Other("Failed to lock health statuses".to_string()))?;

        Ok(health.get(instance_id).copied().unwrap_or(ServerHealth::Unknown))
    }

    /// When an instance was last checked
    pub fn last_checked(&self, instance_id: &InstanceId) -> Option<DateTime<Utc>> {
        self.core
            .last_checked
            .lock()
            .ok()
            .and_then(|checked| checked.get(instance_id).copied())
    }

    /// Crashes counted since the instance was last seen alive
    pub fn failure_count(&self, instance_id: &InstanceId) -> u32 {
        self.core
            .failure_counts
            .lock()
            .ok()
            .and_then(|counts| counts.get(instance_id).copied())
            .unwrap_or(0)
    }

    /// Checks every instance once
    pub async fn check_all(&self) {
        self.core.check_all().await;
    }

    /// Force a health check for one instance
    pub async fn check_health(&self, instance_id: &InstanceId) -> Result<ServerHealth> {
        self.core.check_server(instance_id).await
    }
}

impl Drop for ServerMonitor {
    fn drop(&mut self) {
        if let Some(token) = self.shutdown.take() {
            token.cancel();
        }
    }
}

impl MonitorCore {
    async fn check_all(&self) {
        let ids = match self.engine.registry().ids() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list servers for health check");
                return;
            }
        };
        for instance_id in ids {
            if let Err(e) = self.check_server(&instance_id).await {
                tracing::warn!(%instance_id, error = %e, "Health check failed");
            }
        }
    }

    #[tracing::instrument(skip(self), fields(instance_id = %instance_id))]
    async fn check_server(&self, instance_id: &InstanceId) -> Result<ServerHealth> {
        let registry = self.engine.registry();
        let record = registry.get(instance_id)?;

        let mut crashed = false;
        let health = match record.status {
            ServerStatus::Running => match registry.process(instance_id) {
                Some(handle) => match handle.poll().await {
                    ProcessState::Alive => ServerHealth::Healthy,
                    ProcessState::Unknown => ServerHealth::Degraded,
                    ProcessState::Exited { .. } => {
                        crashed = self.engine.mark_crashed(instance_id).await?;
                        if crashed {
                            ServerHealth::Unhealthy
                        } else {
                            ServerHealth::Unknown
                        }
                    }
                },
                None => ServerHealth::Degraded,
            },
            ServerStatus::Error => ServerHealth::Unhealthy,
            _ => ServerHealth::Unknown,
        };

        {
            let mut statuses = self
                .health
                .lock()
                .map_err(|_| Error::Other("Failed to lock health statuses".to_string()))?;
            statuses.insert(instance_id.clone(), health);
        }
        {
            let mut checked = self
                .last_checked
                .lock()
                .map_err(|_| Error::Other("Failed to lock last checked times".to_string()))?;
            checked.insert(instance_id.clone(), Utc::now());
        }

        let failures = {
            let mut counts = self
                .failure_counts
                .lock()
                .map_err(|_| Error::Other("Failed to lock failure counts".to_string()))?;
            let count = counts.entry(instance_id.clone()).or_insert(0);
            if health == ServerHealth::Healthy {
                *count = 0;
            } else if crashed {
                *count += 1;
            }
            *count
        };

        if crashed {
            tracing::warn!(failures, "Server crashed");
            if self.config.auto_restart && record.auto_restart {
                if failures <= self.config.max_consecutive_failures {
                    match self.engine.recover(instance_id, Actor::Monitor).await {
                        Ok(report) => {
                            tracing::info!(status = %report.status_after, "Server recovered after crash");
                            if let Ok(mut statuses) = self.health.lock() {
                                statuses.insert(instance_id.clone(), ServerHealth::Healthy);
                            }
                            return Ok(ServerHealth::Healthy);
                        }
                        Err(e) => tracing::error!(error = %e, "Automatic restart failed"),
                    }
                } else {
                    tracing::error!(
                        max = self.config.max_consecutive_failures,
                        "Too many consecutive crashes, leaving server in Error"
                    );
                }
            }
        }

        Ok(health)
    }
}
