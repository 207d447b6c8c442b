use crate::error::{Error, Result};
use crate::server::events::{Actor, EventBus, Operation, OperationOutcome, TransitionEvent};
use crate::server::lock::OperationGuard;
use crate::server::registry::ServerRegistry;
use crate::server::{InstanceId, InstancePatch, ProcessChange, ServerInstance, ServerStatus};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Message recorded when an operation's scope ends without finishing
pub const INTERRUPTED: &str = "operation interrupted";

/// Cancellation tokens of in-flight operations, one per instance
#[derive(Default)]
pub(crate) struct Cancellations {
    tokens: Mutex<HashMap<InstanceId, CancellationToken>>,
}

impl Cancellations {
    fn register(&self, instance_id: &InstanceId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(instance_id.clone(), token.clone());
        }
        token
    }

    fn release(&self, instance_id: &InstanceId) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(instance_id);
        }
    }

    /// Cancels the in-flight operation on `instance_id`, if any.
    pub(crate) fn cancel(&self, instance_id: &InstanceId) -> bool {
        let Ok(tokens) = self.tokens.lock() else {
            return false;
        };
        match tokens.get(instance_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

struct Leg {
    operation: Operation,
    from: ServerStatus,
}

/// Everything one operation owns while it runs: the instance lock, its
/// cancellation token and the leg currently in progress.
///
/// While a leg is armed the record sits in a transient status. Dropping the
/// scope with an armed leg writes `Error` so no transient status outlives the
/// operation.
pub(crate) struct OperationScope {
    instance_id: InstanceId,
    actor: Actor,
    registry: Arc<ServerRegistry>,
    events: Arc<EventBus>,
    cancellations: Arc<Cancellations>,
    token: CancellationToken,
    leg: Option<Leg>,
    _guard: OperationGuard,
}

impl OperationScope {
    pub(crate) fn new(
        guard: OperationGuard,
        actor: Actor,
        registry: Arc<ServerRegistry>,
        events: Arc<EventBus>,
        cancellations: Arc<Cancellations>,
    ) -> Self {
        let instance_id = guard.instance_id().clone();
        let token = cancellations.register(&instance_id);
        Self {
            instance_id,
            actor,
            registry,
            events,
            cancellations,
            token,
            leg: None,
            _guard: guard,
        }
    }

    pub(crate) fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub(crate) fn actor(&self) -> &Actor {
        &self.actor
    }

    /// Reads the current record under the lock.
    pub(crate) fn record(&self) -> Result<ServerInstance> {
        self.registry.get(&self.instance_id)
    }

    /// Rejects the operation unless the record is in one of `allowed`.
    pub(crate) fn require(
        &self,
        operation: Operation,
        allowed: &[ServerStatus],
    ) -> Result<ServerInstance> {
        let record = self.record()?;
        if allowed.contains(&record.status) {
            return Ok(record);
        }
        tracing::warn!(
            instance_id = %self.instance_id,
            %operation,
            status = %record.status,
            "Operation rejected"
        );
        Err(Error::InvalidState {
            instance_id: self.instance_id.to_string(),
            operation: operation.to_string(),
            status: record.status,
        })
    }

    /// Arms a leg and moves the record into `transient`.
    pub(crate) fn begin(&mut self, operation: Operation, transient: ServerStatus) -> Result<()> {
        let from = self.record()?.status;
        self.registry
            .upsert(&self.instance_id, InstancePatch::status(transient))?;
        self.leg = Some(Leg { operation, from });
        tracing::debug!(instance_id = %self.instance_id, %operation, %from, to = %transient, "Leg started");
        Ok(())
    }

    /// Arms a leg without changing the status.
    pub(crate) fn begin_in_place(&mut self, operation: Operation) -> Result<()> {
        let from = self.record()?.status;
        self.leg = Some(Leg { operation, from });
        Ok(())
    }

    /// Applies an intermediate patch while a leg is armed.
    pub(crate) fn update(&self, patch: InstancePatch) -> Result<ServerInstance> {
        self.registry.upsert(&self.instance_id, patch)
    }

    /// Completes the armed leg with `patch` and publishes its event.
    pub(crate) fn succeed(
        &mut self,
        patch: InstancePatch,
        detail: Option<String>,
    ) -> Result<ServerInstance> {
        let record = match self.registry.upsert(&self.instance_id, patch) {
            Ok(record) => record,
            Err(e) => return Err(self.fail(e, None)),
        };
        if let Some(leg) = self.leg.take() {
            let mut event = TransitionEvent::new(
                self.instance_id.clone(),
                leg.operation,
                OperationOutcome::Succeeded,
                self.actor.clone(),
                leg.from,
                record.status,
            );
            if let Some(detail) = detail {
                event = event.with_detail(detail);
            }
            self.events.publish(event);
        }
        Ok(record)
    }

    /// Fails the armed leg into `Error` and hands the error back.
    pub(crate) fn fail(&mut self, error: Error, process: Option<ProcessChange>) -> Error {
        let Some(leg) = self.leg.take() else {
            return error;
        };

        let mut patch = InstancePatch::status(ServerStatus::Error).with_error(error.to_string());
        patch.process = process;
        if let Err(e) = self.registry.upsert(&self.instance_id, patch) {
            tracing::error!(instance_id = %self.instance_id, error = %e, "Failed to record operation failure");
        }

        let outcome = match error {
            Error::Cancelled(_) => OperationOutcome::Cancelled,
            _ => OperationOutcome::Failed,
        };
        tracing::error!(instance_id = %self.instance_id, operation = %leg.operation, error = %error, "Operation failed");
        self.events.publish(
            TransitionEvent::new(
                self.instance_id.clone(),
                leg.operation,
                outcome,
                self.actor.clone(),
                leg.from,
                ServerStatus::Error,
            )
            .with_detail(error.to_string()),
        );
        error
    }

    /// Publishes an event that did not go through a leg.
    pub(crate) fn publish(&self, event: TransitionEvent) {
        self.events.publish(event);
    }

    /// Runs `fut` until it finishes, the operation is cancelled or `limit`
    /// elapses.
    pub(crate) async fn bounded<F, T>(&self, what: &str, limit: Option<Duration>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let cancelled = self.token.cancelled();
        let limited = async {
            match limit {
                Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                    Error::Timeout(format!(
                        "{} of '{}' exceeded {}s",
                        what,
                        self.instance_id,
                        limit.as_secs_f32()
                    ))
                })?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(Error::Cancelled(format!("{} of '{}' was cancelled", what, self.instance_id))),
            result = limited => result,
        }
    }
}

impl Drop for OperationScope {
    fn drop(&mut self) {
        self.cancellations.release(&self.instance_id);

        let Some(leg) = self.leg.take() else {
            return;
        };
        tracing::warn!(instance_id = %self.instance_id, operation = %leg.operation, "Operation dropped before completion");

        let patch = InstancePatch::status(ServerStatus::Error)
            .with_error(INTERRUPTED)
            .with_process(ProcessChange::Detach { keep_pid: true });
        if let Err(e) = self.registry.upsert(&self.instance_id, patch) {
            tracing::error!(instance_id = %self.instance_id, error = %e, "Failed to record interrupted operation");
        }
        self.events.publish(
            TransitionEvent::new(
                self.instance_id.clone(),
                leg.operation,
                OperationOutcome::Cancelled,
                self.actor.clone(),
                leg.from,
                ServerStatus::Error,
            )
            .with_detail(INTERRUPTED),
        );
    }
}
