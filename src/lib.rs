/*!
 # GSM Runner

 A Rust library for managing the lifecycle of game server processes on a single host.

 ## Overview

 GSM Runner provides functionality to:
 - Start, stop, restart and update game server processes
 - Serialize every operation per server so manual and automatic requests never race
 - Persist each server's state and reconcile it with the OS after a manager restart
 - Run a daily maintenance timetable (stop, update, restart)
 - Watch running servers for crashes and recover them
 - Back up and restore a server's data directory

 ## Basic Usage

 ```no_run
 use gsm_runner::{GsmRunner, OperationRequest, RequestedOperation, Result};

 #[tokio::main]
 async fn main() -> Result<()> {
     // Create a runner from a config file
     let mut runner = GsmRunner::from_config_file("server_config.json")?;

     // Match persisted state against the processes that are actually running
     runner.recover_state().await?;

     // Run the daily timetable and the crash watch
     runner.start_scheduler();
     runner.start_monitor()?;

     // Handle a request coming from a front-end
     let request = OperationRequest::new(
         "Palworld-main",
         RequestedOperation::Start,
         "alice",
         "admin",
     );
     let response = runner.execute(&request).await;
     println!("{}", response.human_message);

     runner.shutdown().await
 }
 ```

 ## Features

 - **Lifecycle Engine**: One state machine for every server, with per-operation timeouts
 - **Durable Registry**: Atomic JSON state file, startup reconciliation
 - **Scheduler**: Daily stop, deferred update and restart
 - **Crash Watch**: Detection and bounded automatic recovery
 - **Backups**: Zip archives with safe restore
 - **Events**: Broadcast stream of transitions and server output
*/

pub mod backup;
pub mod config;
pub mod credentials;
pub mod error;
pub mod request;
pub mod scheduler;
pub mod server;
pub mod update;

pub use backup::{BackupArchive, BackupCoordinator};
pub use config::Config;
pub use error::{Error, Result};
pub use request::{OperationRequest, OperationResponse, RequestedOperation};
pub use server::{
    Actor, InstanceId, LifecycleEngine, OperationReport, ServerInstance, ServerStatus,
    TransitionEvent,
};

use credentials::CredentialCipher;
use scheduler::{Clock, Scheduler, SchedulerHandle, SystemClock};
use server::registry::{ProcessProbe, ReconcileReport};
use server::{EventBus, OutputLine, ServerHealth, ServerMonitor, ServerRegistry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use update::PackageFetcher;

/// Capacity of the event and output channels
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Configure and run game servers
///
/// This struct is the main entry point. It owns the registry, the lifecycle
/// engine, the backup coordinator and the optional scheduler and monitor
/// loops. All public methods are instrumented with `tracing` spans.
pub struct GsmRunner {
    /// Configuration
    config: Config,
    /// Durable server records
    registry: Arc<ServerRegistry>,
    /// Transition events and output lines
    events: Arc<EventBus>,
    /// State machine
    engine: Arc<LifecycleEngine>,
    /// Backups and restores
    backups: BackupCoordinator,
    /// Clock for the scheduler
    clock: Arc<dyn Clock>,
    /// Scheduler loop (if running)
    scheduler: Option<SchedulerHandle>,
    /// Crash watch (if running)
    monitor: Option<ServerMonitor>,
}

/// Builder for a [`GsmRunner`] with replaced collaborators
pub struct GsmRunnerBuilder {
    config: Config,
    fetcher: Option<Arc<dyn PackageFetcher>>,
    probe: Option<Arc<dyn ProcessProbe>>,
    cipher: Option<Option<CredentialCipher>>,
    clock: Arc<dyn Clock>,
}

impl GsmRunnerBuilder {
    /// Replaces the package fetcher used by updates.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn PackageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replaces the process probe used by reconciliation and reset.
    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Replaces the credential cipher read from the environment.
    pub fn with_cipher(mut self, cipher: Option<CredentialCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Replaces the scheduler's clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens the registry and assembles the runner.
    #[tracing::instrument(skip(self), fields(num_servers = self.config.servers.len()))]
    pub fn build(self) -> Result<GsmRunner> {
        tracing::info!("Creating new GsmRunner");
        let registry = Arc::new(ServerRegistry::open(&self.config)?);
        let events = Arc::new(EventBus::new(EVENT_CHANNEL_CAPACITY));

        let mut engine = LifecycleEngine::new(
            Arc::clone(&registry),
            Arc::clone(&events),
            &self.config.manager,
        );
        if let Some(fetcher) = self.fetcher {
            engine = engine.with_fetcher(fetcher);
        }
        if let Some(probe) = self.probe {
            engine = engine.with_probe(probe);
        }
        if let Some(cipher) = self.cipher {
            engine = engine.with_cipher(cipher);
        }
        let engine = Arc::new(engine);
        let backups = BackupCoordinator::new(Arc::clone(&engine), &self.config.manager.backup_dir);

        Ok(GsmRunner {
            config: self.config,
            registry,
            events,
            engine,
            backups,
            clock: self.clock,
            scheduler: None,
            monitor: None,
        })
    }
}

impl GsmRunner {
    /// Create a new runner from a configuration file path
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        tracing::info!("Loading configuration from file");
        let config = Config::from_file(path)?;
        Self::new(config)
    }

    /// Create a new runner from a configuration string
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(config))]
    pub fn from_config_str(config: &str) -> Result<Self> {
        tracing::info!("Loading configuration from string");
        let config = Config::parse_from_str(config)?;
        Self::new(config)
    }

    /// Create a new runner with the default collaborators
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a runner with replaced collaborators
    pub fn builder(config: Config) -> GsmRunnerBuilder {
        GsmRunnerBuilder {
            config,
            fetcher: None,
            probe: None,
            cipher: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// The configuration the runner was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The lifecycle engine
    pub fn engine(&self) -> &Arc<LifecycleEngine> {
        &self.engine
    }

    /// The backup coordinator
    pub fn backups(&self) -> &BackupCoordinator {
        &self.backups
    }

    /// Reconciles persisted records with the OS
    ///
    /// Call once after construction, before serving requests.
    #[tracing::instrument(skip(self))]
    pub async fn recover_state(&self) -> Result<Vec<ReconcileReport>> {
        let reports = self.engine.reconcile().await?;
        tracing::info!(reconciled = reports.len(), "Startup reconciliation finished");
        Ok(reports)
    }

    /// Runs a front-end request; failures are reported in the response.
    #[tracing::instrument(skip(self, request), fields(instance_id = %request.instance_id, operation = %request.operation, principal = %request.principal))]
    pub async fn execute(&self, request: &OperationRequest) -> OperationResponse {
        use RequestedOperation as Op;

        let id = &request.instance_id;
        let actor = request.actor();
        let outcome: Result<(Option<ServerStatus>, String)> = match &request.operation {
            Op::Start => self.engine.start(id, actor).await.map(from_report),
            Op::Stop => self.engine.stop(id, actor).await.map(from_report),
            Op::Restart => self.engine.restart(id, actor).await.map(from_report),
            Op::Update => self.engine.update(id, actor).await.map(from_report),
            Op::Reset => self.engine.reset(id, actor).await.map(from_report),
            Op::Backup => self.backups.create_backup(id, actor).await.map(|archive| {
                (
                    Some(ServerStatus::Stopped),
                    format!("Backup {} created ({} bytes)", archive.file_name(), archive.size),
                )
            }),
            Op::Restore { archive, overwrite } => self
                .backups
                .restore_backup(id, archive, *overwrite, actor)
                .await
                .map(|archive| {
                    (
                        Some(ServerStatus::Stopped),
                        format!("Backup {} restored", archive.file_name()),
                    )
                }),
            Op::Cancel => self.registry.get(id).map(|record| {
                let message = if self.engine.cancel(id) {
                    "Cancellation requested"
                } else {
                    "No operation in progress"
                };
                (Some(record.status), message.to_string())
            }),
            Op::Status => self.registry.get(id).map(|record| {
                let message = match &record.last_error {
                    Some(error) => format!("'{}' is {}: {}", record.name, record.status, error),
                    None => format!("'{}' is {}", record.name, record.status),
                };
                (Some(record.status), message)
            }),
        };

        match outcome {
            Ok((status_after, message)) => OperationResponse::success(request, status_after, message),
            Err(e) => {
                let status_after = self.registry.get(id).ok().map(|record| record.status);
                OperationResponse::failure(request, status_after, &e)
            }
        }
    }

    /// Start a server
    pub async fn start(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        self.engine.start(instance_id, actor).await
    }

    /// Stop a server
    pub async fn stop(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        self.engine.stop(instance_id, actor).await
    }

    /// Restart a server under a single lock
    pub async fn restart(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        self.engine.restart(instance_id, actor).await
    }

    /// Update a stopped server's files
    pub async fn update(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        self.engine.update(instance_id, actor).await
    }

    /// Clear an error
    pub async fn reset(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        self.engine.reset(instance_id, actor).await
    }

    /// Clear an error and start again
    pub async fn recover(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        self.engine.recover(instance_id, actor).await
    }

    /// Cancel the operation in flight on a server
    pub fn cancel(&self, instance_id: &InstanceId) -> bool {
        self.engine.cancel(instance_id)
    }

    /// Archive a stopped server's data directory
    pub async fn create_backup(&self, instance_id: &InstanceId, actor: Actor) -> Result<BackupArchive> {
        self.backups.create_backup(instance_id, actor).await
    }

    /// Restore a stopped server's data directory
    pub async fn restore_backup(
        &self,
        instance_id: &InstanceId,
        archive: &str,
        overwrite: bool,
        actor: Actor,
    ) -> Result<BackupArchive> {
        self.backups
            .restore_backup(instance_id, archive, overwrite, actor)
            .await
    }

    /// Archives in the backup directory, newest first
    pub fn list_backups(&self, instance_id: Option<&InstanceId>) -> Result<Vec<BackupArchive>> {
        self.backups.list_backups(instance_id)
    }

    /// Current record of a server
    pub fn get(&self, instance_id: &InstanceId) -> Result<ServerInstance> {
        self.registry.get(instance_id)
    }

    /// All server records
    pub fn list(&self) -> Result<Vec<ServerInstance>> {
        self.registry.list()
    }

    /// Subscribe to transition events
    pub fn subscribe_events(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    /// Subscribe to server and update output
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.events.subscribe_output()
    }

    /// Recent events, newest first; all servers when `instance_id` is `None`
    pub fn recent_events(
        &self,
        instance_id: Option<&InstanceId>,
        limit: Option<usize>,
    ) -> Result<Vec<TransitionEvent>> {
        match instance_id {
            Some(id) => self.events.instance_events(id, limit),
            None => self.events.all_events(limit),
        }
    }

    /// Start the scheduler loop
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub fn start_scheduler(&mut self) {
        if self.scheduler.is_some() {
            tracing::debug!("Scheduler already running");
            return;
        }
        let tick = Duration::from_secs(self.config.manager.scheduler.tick_secs);
        let scheduler = Scheduler::new(Arc::clone(&self.engine), tick).with_clock(Arc::clone(&self.clock));
        self.scheduler = Some(Arc::new(scheduler).spawn());
    }

    /// Stop the scheduler loop
    #[tracing::instrument(skip(self))]
    pub async fn stop_scheduler(&mut self) -> Result<()> {
        match self.scheduler.take() {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    /// Start the crash watch
    #[tracing::instrument(skip(self))]
    pub fn start_monitor(&mut self) -> Result<()> {
        let monitor = self.monitor.get_or_insert_with(|| {
            ServerMonitor::new(Arc::clone(&self.engine), self.config.manager.monitor.clone())
        });
        monitor.start()
    }

    /// Stop the crash watch
    #[tracing::instrument(skip(self))]
    pub async fn stop_monitor(&mut self) -> Result<()> {
        match self.monitor.as_mut() {
            Some(monitor) => monitor.stop().await,
            None => Ok(()),
        }
    }

    /// Last health the crash watch recorded for a server
    pub fn health(&self, instance_id: &InstanceId) -> Result<ServerHealth> {
        match &self.monitor {
            Some(monitor) => monitor.get_health(instance_id),
            None => Ok(ServerHealth::Unknown),
        }
    }

    /// Stops the loops, then gracefully stops every running server
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down");
        self.stop_scheduler().await?;
        self.stop_monitor().await?;

        let mut errors = Vec::new();
        for record in self.registry.list()? {
            if record.status != ServerStatus::Running {
                continue;
            }
            if let Err(e) = self.engine.stop(&record.instance_id, Actor::System).await {
                tracing::error!(instance_id = %record.instance_id, error = %e, "Failed to stop server");
                errors.push((record.instance_id, e));
            }
        }

        if errors.is_empty() {
            tracing::info!("All servers stopped");
            return Ok(());
        }
        if errors.len() == 1 {
            return Err(errors.remove(0).1);
        }
        let error_msg = errors
            .iter()
            .map(|(id, e)| format!("{}: {}", id, e))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::Other(format!(
            "Multiple servers failed to stop: {}",
            error_msg
        )))
    }
}

fn from_report(report: OperationReport) -> (Option<ServerStatus>, String) {
    (Some(report.status_after), report.message)
}
