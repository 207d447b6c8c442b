//! Daily maintenance timetable.
//!
//! Once per tick the scheduler looks at every instance with a `stop_time`.
//! When the time is due it stops a running instance (if `auto_restart`),
//! queues an update (if `auto_update`), and starts the instance again (if
//! `restart_after_stop`). A queued update only runs while the instance is
//! `Stopped`; otherwise it waits for a later tick. Everything goes through the
//! same [`LifecycleEngine`] entry points and locks as manual requests.
//!
//! Each instance's sequence runs in its own task with at most one in flight
//! per instance, so a slow update on one server never holds up the timetable
//! of another.

use crate::error::{Error, Result};
use crate::server::{Actor, InstanceId, LifecycleEngine, Operation, ServerInstance, ServerStatus};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, Timelike};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Source of local wall-clock time
pub trait Clock: Send + Sync {
    /// Current local time
    fn now(&self) -> NaiveDateTime;
}

/// [`Clock`] reading the system's local time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// One operation the scheduler triggered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAction {
    /// Target instance
    pub instance_id: InstanceId,
    /// Operation that was invoked
    pub operation: Operation,
    /// Status afterwards, or the error text
    pub result: std::result::Result<ServerStatus, String>,
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Operations invoked, in order per instance
    pub actions: Vec<ScheduledAction>,
    /// Instances whose update is waiting for the server to stop
    pub deferred_updates: Vec<InstanceId>,
}

impl TickReport {
    fn merge(&mut self, other: TickReport) {
        self.actions.extend(other.actions);
        self.deferred_updates.extend(other.deferred_updates);
    }
}

type SequenceSet = JoinSet<(InstanceId, Result<TickReport>)>;

/// Wall-clock driven maintenance
pub struct Scheduler {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    tick: Duration,
}

/// State the per-instance tasks share with the scheduler
struct Shared {
    engine: Arc<LifecycleEngine>,
    window: ChronoDuration,
    fired: Mutex<HashMap<InstanceId, NaiveDateTime>>,
    pending_updates: Mutex<HashSet<InstanceId>>,
    in_flight: Mutex<HashSet<InstanceId>>,
}

impl Scheduler {
    /// Creates a scheduler ticking every `tick`.
    pub fn new(engine: Arc<LifecycleEngine>, tick: Duration) -> Self {
        let window = ChronoDuration::from_std(tick).unwrap_or_else(|_| ChronoDuration::minutes(1))
            + ChronoDuration::minutes(1);
        Self {
            shared: Arc::new(Shared {
                engine,
                window,
                fired: Mutex::new(HashMap::new()),
                pending_updates: Mutex::new(HashSet::new()),
                in_flight: Mutex::new(HashSet::new()),
            }),
            clock: Arc::new(SystemClock),
            tick,
        }
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Instances with an update waiting
    pub fn pending_updates(&self) -> Vec<InstanceId> {
        let mut pending: Vec<_> = self
            .shared
            .pending_updates
            .lock()
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        pending.sort();
        pending
    }

    /// Runs one tick at the clock's current time.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(self.clock.now()).await
    }

    /// Runs one tick as if the local time were `now` and waits for every
    /// sequence it started.
    #[tracing::instrument(skip(self))]
    pub async fn tick_at(&self, now: NaiveDateTime) -> Result<TickReport> {
        let mut sequences = JoinSet::new();
        let order = self.dispatch(now, &mut sequences)?;

        let mut finished = HashMap::new();
        let mut first_error = None;
        while let Some(joined) = sequences.join_next().await {
            match joined {
                Ok((id, Ok(report))) => {
                    finished.insert(id, report);
                }
                Ok((_, Err(e))) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(Error::Other(format!("Scheduled task failed: {}", e)));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let mut report = TickReport::default();
        for id in order {
            if let Some(part) = finished.remove(&id) {
                report.merge(part);
            }
        }
        Ok(report)
    }

    /// Starts the sequence of every instance with work due at `now`, skipping
    /// instances whose previous sequence is still running. Returns the
    /// instances started, in registry order.
    fn dispatch(&self, now: NaiveDateTime, sequences: &mut SequenceSet) -> Result<Vec<InstanceId>> {
        let mut started = Vec::new();

        for record in self.shared.engine.registry().list()? {
            let id = record.instance_id.clone();
            let has_work = self.shared.due_occurrence(&record, now)?.is_some()
                || self.shared.pending()?.contains(&id);
            if !has_work {
                continue;
            }

            let Some(slot) = InFlight::claim(&self.shared, &id)? else {
                tracing::debug!(instance_id = %id, "Previous maintenance still running");
                continue;
            };

            let shared = Arc::clone(&self.shared);
            sequences.spawn(async move {
                let _slot = slot;
                let result = shared.run_sequence(&record, now).await;
                (record.instance_id, result)
            });
            started.push(id);
        }

        Ok(started)
    }

    /// Runs the timer loop on the current runtime.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        let period = self.tick.max(Duration::from_secs(1));

        let task = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            let mut sequences = JoinSet::new();
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    Some(joined) = sequences.join_next(), if !sequences.is_empty() => {
                        log_sequence(joined);
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.dispatch(self.clock.now(), &mut sequences) {
                            tracing::error!(error = %e, "Scheduler tick failed");
                        }
                    }
                }
            }

            if !sequences.is_empty() {
                tracing::info!(running = sequences.len(), "Waiting for scheduled maintenance to finish");
            }
            while let Some(joined) = sequences.join_next().await {
                log_sequence(joined);
            }
            tracing::debug!("Scheduler loop stopped");
        });

        tracing::info!(tick_secs = period.as_secs(), "Scheduler started");
        SchedulerHandle { token, task }
    }
}

impl Shared {
    async fn run_sequence(&self, record: &ServerInstance, now: NaiveDateTime) -> Result<TickReport> {
        let mut report = TickReport::default();
        let id = &record.instance_id;
        let mut stopped_here = false;

        if let Some(occurrence) = self.due_occurrence(record, now)? {
            tracing::info!(instance_id = %id, %occurrence, "Daily maintenance due");
            let mut settled = true;

            let status = self.engine.registry().get(id)?.status;
            if record.auto_restart && status == ServerStatus::Running {
                let result = self.engine.stop(id, Actor::Scheduler).await;
                settled = !matches!(&result, Err(e) if e.is_retryable());
                stopped_here = result.is_ok();
                report.actions.push(action(id, Operation::Stop, result.map(|r| r.status_after)));
            }
            if record.auto_update && settled {
                self.pending()?.insert(id.clone());
            }
            if settled {
                self.mark_fired(id, occurrence)?;
            }
        }

        let update_pending = self.pending()?.contains(id);
        if update_pending {
            self.run_pending_update(id, &mut report).await?;
        }

        if stopped_here && record.restart_after_stop {
            let result = self.engine.start(id, Actor::Scheduler).await;
            report.actions.push(action(id, Operation::Start, result.map(|r| r.status_after)));
        }

        Ok(report)
    }

    async fn run_pending_update(&self, id: &InstanceId, report: &mut TickReport) -> Result<()> {
        let status = self.engine.registry().get(id)?.status;
        match status {
            ServerStatus::Stopped => {
                self.pending()?.remove(id);
                let result = self.engine.update(id, Actor::Scheduler).await;
                if matches!(&result, Err(e) if e.is_retryable()) {
                    self.pending()?.insert(id.clone());
                }
                report
                    .actions
                    .push(action(id, Operation::Update, result.map(|r| r.status_after)));
            }
            ServerStatus::Error => {
                tracing::warn!(instance_id = %id, "Dropping scheduled update, server is in Error");
                self.pending()?.remove(id);
            }
            _ => {
                tracing::info!(instance_id = %id, %status, "Update deferred to next tick");
                report.deferred_updates.push(id.clone());
            }
        }
        Ok(())
    }

    /// The stop-time occurrence that is due at `now` and has not fired yet.
    fn due_occurrence(
        &self,
        record: &ServerInstance,
        now: NaiveDateTime,
    ) -> Result<Option<NaiveDateTime>> {
        let Some(stop_time) = record.stop_time else {
            return Ok(None);
        };
        if !record.auto_restart && !record.auto_update {
            return Ok(None);
        }

        let stop_time = stop_time.with_second(0).unwrap_or(stop_time);
        let fired = lock(&self.fired, "scheduler state")?;
        let last = fired.get(&record.instance_id);

        let candidates = [now.date(), now.date() - ChronoDuration::days(1)];
        Ok(candidates
            .into_iter()
            .map(|date| date.and_time(stop_time))
            .find(|occurrence| {
                *occurrence <= now && now - *occurrence < self.window && last != Some(occurrence)
            }))
    }

    fn mark_fired(&self, id: &InstanceId, occurrence: NaiveDateTime) -> Result<()> {
        lock(&self.fired, "scheduler state")?.insert(id.clone(), occurrence);
        Ok(())
    }

    fn pending(&self) -> Result<MutexGuard<'_, HashSet<InstanceId>>> {
        lock(&self.pending_updates, "pending updates")
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Other(format!("Failed to lock {}", what)))
}

/// Marks an instance's sequence as running until dropped
struct InFlight {
    shared: Arc<Shared>,
    instance_id: InstanceId,
}

impl InFlight {
    fn claim(shared: &Arc<Shared>, instance_id: &InstanceId) -> Result<Option<Self>> {
        if !lock(&shared.in_flight, "in-flight set")?.insert(instance_id.clone()) {
            return Ok(None);
        }
        Ok(Some(Self {
            shared: Arc::clone(shared),
            instance_id: instance_id.clone(),
        }))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut running) = self.shared.in_flight.lock() {
            running.remove(&self.instance_id);
        }
    }
}

fn log_sequence(joined: std::result::Result<(InstanceId, Result<TickReport>), tokio::task::JoinError>) {
    match joined {
        Ok((id, Ok(report))) if !report.actions.is_empty() => {
            tracing::info!(instance_id = %id, actions = report.actions.len(), "Scheduled maintenance finished");
        }
        Ok((_, Ok(_))) => {}
        Ok((id, Err(e))) => tracing::error!(instance_id = %id, error = %e, "Scheduled maintenance failed"),
        Err(e) => tracing::error!(error = %e, "Scheduled task failed"),
    }
}

fn action(
    id: &InstanceId,
    operation: Operation,
    result: Result<ServerStatus>,
) -> ScheduledAction {
    if let Err(e) = &result {
        tracing::warn!(instance_id = %id, %operation, error = %e, "Scheduled operation failed");
    }
    ScheduledAction {
        instance_id: id.clone(),
        operation,
        result: result.map_err(|e| e.to_string()),
    }
}

/// Handle to a running scheduler loop
pub struct SchedulerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the loop once the maintenance sequences in progress complete.
    pub async fn shutdown(self) -> Result<()> {
        self.token.cancel();
        self.task
            .await
            .map_err(|e| Error::Other(format!("Scheduler task failed: {}", e)))
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
