use crate::config::{ManagerSettings, TimeoutConfig};
use crate::credentials::CredentialCipher;
use crate::error::{Error, Result};
use crate::server::events::{
    Actor, EventBus, Operation, OperationOutcome, OutputSource, TransitionEvent,
};
use crate::server::lock::OperationLockTable;
use crate::server::operation::{Cancellations, OperationScope};
use crate::server::process::{ProcessHandle, ProcessState, StopOutcome};
use crate::server::registry::{ProcessProbe, ReconcileReport, ServerRegistry, SystemProbe};
use crate::server::{InstanceId, InstancePatch, ProcessChange, ServerInstance, ServerStatus};
use crate::update::{CommandFetcher, FetchRequest, Login, OutputSink, PackageFetcher};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Lines of server output quoted when a process dies during its startup check
const STARTUP_TAIL_LINES: usize = 10;

/// Result of a completed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    /// Instance the operation ran against
    pub instance_id: InstanceId,
    /// Operation that ran
    pub operation: Operation,
    /// Status once the operation released the lock
    pub status_after: ServerStatus,
    /// Short human-readable summary
    pub message: String,
}

/// Drives the server state machine
///
/// Every operation takes the instance's lock for its whole duration, checks its
/// precondition under the lock, and writes each status change through the
/// registry. Operations on different instances run in parallel.
pub struct LifecycleEngine {
    registry: Arc<ServerRegistry>,
    locks: Arc<OperationLockTable>,
    events: Arc<EventBus>,
    fetcher: Arc<dyn PackageFetcher>,
    probe: Arc<dyn ProcessProbe>,
    cipher: Option<CredentialCipher>,
    timeouts: TimeoutConfig,
    cancellations: Arc<Cancellations>,
}

impl LifecycleEngine {
    /// Creates an engine with the command fetcher, the OS probe and the
    /// cipher named by `settings`.
    pub fn new(registry: Arc<ServerRegistry>, events: Arc<EventBus>, settings: &ManagerSettings) -> Self {
        Self {
            registry,
            locks: Arc::new(OperationLockTable::new()),
            events,
            fetcher: Arc::new(CommandFetcher::new(settings.update_command.clone())),
            probe: Arc::new(SystemProbe),
            cipher: CredentialCipher::from_env(&settings.encryption_key_env),
            timeouts: settings.timeouts.clone(),
            cancellations: Arc::new(Cancellations::default()),
        }
    }

    /// Replaces the package fetcher.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn PackageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Replaces the process probe used by reconciliation and reset.
    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replaces the credential cipher.
    pub fn with_cipher(mut self, cipher: Option<CredentialCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// The registry this engine writes through
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// The per-instance lock table
    pub fn locks(&self) -> &Arc<OperationLockTable> {
        &self.locks
    }

    /// The event bus transitions are published on
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Configured timeouts
    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Takes the instance lock and opens an operation scope.
    pub(crate) async fn open_scope(
        &self,
        instance_id: &InstanceId,
        operation: &str,
        actor: Actor,
    ) -> Result<OperationScope> {
        // Unknown instances are rejected before queueing for a lock
        self.registry.get(instance_id)?;
        let guard = self
            .locks
            .acquire(instance_id, operation, self.timeouts.lock_wait())
            .await?;
        Ok(OperationScope::new(
            guard,
            actor,
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            Arc::clone(&self.cancellations),
        ))
    }

    /// Spawns the server process. Precondition: `Stopped`.
    #[tracing::instrument(skip(self, actor), fields(instance_id = %instance_id))]
    pub async fn start(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        let mut scope = self.open_scope(instance_id, "start", actor).await?;
        let record = self.start_leg(&mut scope).await?;
        Ok(report(&record, Operation::Start, "Server started"))
    }

    /// Stops the server process. Precondition: `Running`.
    #[tracing::instrument(skip(self, actor), fields(instance_id = %instance_id))]
    pub async fn stop(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        let mut scope = self.open_scope(instance_id, "stop", actor).await?;
        let (record, outcome) = self.stop_leg(&mut scope).await?;
        Ok(report(&record, Operation::Stop, stop_message(outcome)))
    }

    /// Stops (when running) and starts again under a single lock.
    #[tracing::instrument(skip(self, actor), fields(instance_id = %instance_id))]
    pub async fn restart(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        let mut scope = self.open_scope(instance_id, "restart", actor).await?;
        let record = scope.require(
            Operation::Restart,
            &[ServerStatus::Running, ServerStatus::Stopped],
        )?;
        if record.status == ServerStatus::Running {
            self.stop_leg(&mut scope).await?;
        }
        let record = self.start_leg(&mut scope).await?;
        Ok(report(&record, Operation::Restart, "Server restarted"))
    }

    /// Runs the package fetch. Precondition: `Stopped`.
    #[tracing::instrument(skip(self, actor), fields(instance_id = %instance_id))]
    pub async fn update(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        let mut scope = self.open_scope(instance_id, "update", actor).await?;
        let record = self.update_leg(&mut scope).await?;
        Ok(report(&record, Operation::Update, "Server files updated"))
    }

    /// Clears an `Error` status back to `Stopped`.
    ///
    /// A leftover process recorded for the instance is terminated first, but
    /// only if it is alive and verified to run the instance's executable.
    #[tracing::instrument(skip(self, actor), fields(instance_id = %instance_id))]
    pub async fn reset(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        let mut scope = self.open_scope(instance_id, "reset", actor).await?;
        let record = self.reset_leg(&mut scope).await?;
        Ok(report(&record, Operation::Reset, "Error cleared"))
    }

    /// Resets and starts again under a single lock.
    #[tracing::instrument(skip(self, actor), fields(instance_id = %instance_id))]
    pub async fn recover(&self, instance_id: &InstanceId, actor: Actor) -> Result<OperationReport> {
        let mut scope = self.open_scope(instance_id, "recover", actor).await?;
        self.reset_leg(&mut scope).await?;
        let record = self.start_leg(&mut scope).await?;
        Ok(report(&record, Operation::Recover, "Server recovered"))
    }

    /// Cancels the operation in flight on `instance_id`.
    ///
    /// Returns `false` when nothing was running.
    pub fn cancel(&self, instance_id: &InstanceId) -> bool {
        let cancelled = self.cancellations.cancel(instance_id);
        if cancelled {
            tracing::info!(%instance_id, "Cancellation requested");
        }
        cancelled
    }

    /// Moves a `Running` instance whose process has exited to `Error`.
    ///
    /// Skipped (returns `Ok(false)`) when another operation holds the lock or
    /// the process turns out to be alive.
    #[tracing::instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn mark_crashed(&self, instance_id: &InstanceId) -> Result<bool> {
        let Some(guard) = self.locks.try_acquire(instance_id, "crash check") else {
            return Ok(false);
        };

        let record = self.registry.get(instance_id)?;
        if record.status != ServerStatus::Running {
            return Ok(false);
        }
        let Some(handle) = self.registry.process(instance_id) else {
            return Ok(false);
        };
        let ProcessState::Exited { code } = handle.poll().await else {
            return Ok(false);
        };

        let message = match code {
            Some(code) => format!("Server process exited unexpectedly with code {}", code),
            None => "Server process exited unexpectedly".to_string(),
        };
        self.registry.upsert(
            instance_id,
            InstancePatch::status(ServerStatus::Error)
                .with_error(message.clone())
                .with_process(ProcessChange::Detach { keep_pid: false }),
        )?;
        self.events.publish(
            TransitionEvent::new(
                instance_id.clone(),
                Operation::CrashDetected,
                OperationOutcome::Failed,
                Actor::Monitor,
                ServerStatus::Running,
                ServerStatus::Error,
            )
            .with_detail(message),
        );
        drop(guard);
        Ok(true)
    }

    /// Reconciles every persisted record against the OS, one lock at a time.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<Vec<ReconcileReport>> {
        let mut reports = Vec::new();
        for instance_id in self.registry.ids()? {
            let scope = self.open_scope(&instance_id, "reconcile", Actor::System).await?;
            let Some(report) = self.registry.reconcile_record(&instance_id, self.probe.as_ref())? else {
                continue;
            };

            let (outcome, detail) = match &report.note {
                Some(note) => (OperationOutcome::Failed, note.clone()),
                None => (
                    OperationOutcome::Succeeded,
                    format!("adopted process {}", report.pid.unwrap_or_default()),
                ),
            };
            scope.publish(
                TransitionEvent::new(
                    instance_id.clone(),
                    Operation::Reconcile,
                    outcome,
                    scope.actor().clone(),
                    report.from,
                    report.to,
                )
                .with_detail(detail),
            );
            reports.push(report);
        }
        Ok(reports)
    }

    async fn start_leg(&self, scope: &mut OperationScope) -> Result<ServerInstance> {
        let record = scope.require(Operation::Start, &[ServerStatus::Stopped])?;
        scope.begin(Operation::Start, ServerStatus::Starting)?;

        let handle = match ProcessHandle::spawn(
            &record.resolved_executable(),
            &record.launch_parameters,
            &record.install_dir,
        ) {
            Ok(handle) => Arc::new(handle),
            Err(e) => return Err(scope.fail(e, Some(ProcessChange::Detach { keep_pid: false }))),
        };
        if let Err(e) = scope.update(
            InstancePatch::default().with_process(ProcessChange::Attach(Arc::clone(&handle))),
        ) {
            self.kill_quietly(&handle).await;
            return Err(scope.fail(e, Some(ProcessChange::Detach { keep_pid: false })));
        }
        self.forward_output(scope.instance_id(), &handle);

        let check_delay = self.timeouts.startup_check().min(self.timeouts.start());
        let check = async {
            tokio::time::sleep(check_delay).await;
            match handle.poll().await {
                ProcessState::Exited { code } => Err(Error::Process(format!(
                    "exited during startup check (code {}){}",
                    code.map_or_else(|| "none".to_string(), |c| c.to_string()),
                    format_tail(&handle.output_tail(STARTUP_TAIL_LINES)),
                ))),
                ProcessState::Alive | ProcessState::Unknown => Ok(()),
            }
        };

        if let Err(e) = scope.bounded("start", Some(self.timeouts.start()), check).await {
            self.kill_quietly(&handle).await;
            return Err(scope.fail(e, Some(ProcessChange::Detach { keep_pid: false })));
        }

        scope.succeed(
            InstancePatch::status(ServerStatus::Running).clear_error(),
            Some(format!("pid {}", handle.pid())),
        )
    }

    async fn stop_leg(&self, scope: &mut OperationScope) -> Result<(ServerInstance, StopOutcome)> {
        scope.require(Operation::Stop, &[ServerStatus::Running])?;

        let handle = self.registry.process(scope.instance_id());
        if handle.as_ref().is_some_and(|h| h.is_orphaned()) {
            return Err(Error::ReconciliationUnknown(format!(
                "'{}' has not been reconciled since the manager restarted",
                scope.instance_id()
            )));
        }

        scope.begin(Operation::Stop, ServerStatus::Stopping)?;
        let outcome = match handle {
            Some(handle) => {
                let grace = self.timeouts.stop_grace();
                let limit = grace + self.timeouts.kill_wait();
                scope
                    .bounded("stop", Some(limit), handle.signal_stop(grace))
                    .await
            }
            None => Ok(StopOutcome::AlreadyExited),
        };

        match outcome {
            Ok(outcome) => {
                let record = scope.succeed(
                    InstancePatch::status(ServerStatus::Stopped)
                        .clear_error()
                        .with_process(ProcessChange::Detach { keep_pid: false }),
                    Some(stop_message(outcome).to_string()),
                )?;
                Ok((record, outcome))
            }
            Err(e) => Err(scope.fail(e, Some(ProcessChange::Detach { keep_pid: true }))),
        }
    }

    async fn update_leg(&self, scope: &mut OperationScope) -> Result<ServerInstance> {
        let record = scope.require(Operation::Update, &[ServerStatus::Stopped])?;
        scope.begin(Operation::Update, ServerStatus::Updating)?;

        let request = match self.fetch_request(&record) {
            Ok(request) => request,
            Err(e) => return Err(scope.fail(e, None)),
        };

        let events = Arc::clone(&self.events);
        let instance_id = record.instance_id.clone();
        let sink: OutputSink = Arc::new(move |line| {
            events.publish_output(&instance_id, OutputSource::Update, line);
        });

        let fetched = scope
            .bounded(
                "update",
                self.timeouts.update(),
                self.fetcher.fetch(&request, sink),
            )
            .await;

        match fetched {
            Ok(outcome) if outcome.succeeded() => scope.succeed(
                InstancePatch::status(ServerStatus::Stopped).clear_error(),
                Some(format!("finished in {}s", outcome.duration.as_secs())),
            ),
            Ok(outcome) => Err(scope.fail(outcome.into_error(), None)),
            Err(e) => Err(scope.fail(e, None)),
        }
    }

    async fn reset_leg(&self, scope: &mut OperationScope) -> Result<ServerInstance> {
        let record = scope.require(Operation::Reset, &[ServerStatus::Error])?;
        scope.begin_in_place(Operation::Reset)?;

        if let Some(pid) = record.pid {
            let executable = record.resolved_executable();
            if self.probe.verify(pid, &executable) {
                tracing::info!(pid, "Terminating leftover process");
                let leftover = ProcessHandle::adopted(pid, executable);
                let grace = self.timeouts.stop_grace();
                let limit = grace + self.timeouts.kill_wait();
                if let Err(e) = scope
                    .bounded("reset", Some(limit), leftover.signal_stop(grace))
                    .await
                {
                    return Err(scope.fail(e, Some(ProcessChange::Detach { keep_pid: true })));
                }
            } else {
                tracing::debug!(pid, "Recorded pid is gone or belongs to another program");
            }
        }

        scope.succeed(
            InstancePatch::status(ServerStatus::Stopped)
                .clear_error()
                .with_process(ProcessChange::Detach { keep_pid: false }),
            None,
        )
    }

    fn fetch_request(&self, record: &ServerInstance) -> Result<FetchRequest> {
        let login = match &record.credentials {
            Some(credentials) => {
                let password = match &credentials.password {
                    Some(stored) => {
                        let cipher = self.cipher.as_ref().ok_or_else(|| {
                            Error::Credentials(
                                "a password is configured but no encryption key is set".to_string(),
                            )
                        })?;
                        Some(cipher.decrypt(stored)?)
                    }
                    None => None,
                };
                Some(Login {
                    username: credentials.username.clone(),
                    password,
                })
            }
            None => None,
        };

        Ok(FetchRequest {
            instance_id: record.instance_id.clone(),
            app_id: record.app_id.clone(),
            install_dir: record.install_dir.clone(),
            login,
        })
    }

    fn forward_output(&self, instance_id: &InstanceId, handle: &ProcessHandle) {
        let Ok(mut output) = handle.stream_output() else {
            return;
        };
        let events = Arc::clone(&self.events);
        let instance_id = instance_id.clone();
        tokio::spawn(async move {
            while let Some(line) = output.next().await {
                events.publish_output(&instance_id, OutputSource::Server, line);
            }
        });
    }

    async fn kill_quietly(&self, handle: &ProcessHandle) {
        let stopped = tokio::time::timeout(
            self.timeouts.kill_wait(),
            handle.signal_stop(Duration::ZERO),
        )
        .await;
        match stopped {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(pid = handle.pid(), error = %e, "Failed to kill process"),
            Err(_) => tracing::warn!(pid = handle.pid(), "Process did not exit after kill"),
        }
    }
}

fn report(record: &ServerInstance, operation: Operation, message: &str) -> OperationReport {
    OperationReport {
        instance_id: record.instance_id.clone(),
        operation,
        status_after: record.status,
        message: message.to_string(),
    }
}

fn stop_message(outcome: StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::GracefulExit => "Server stopped",
        StopOutcome::ForcedKill => "Server stopped (forced kill)",
        StopOutcome::AlreadyExited => "Server was already stopped",
    }
}

fn format_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(":\n{}", lines.join("\n"))
    }
}
