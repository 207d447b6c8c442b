/// Server management module for GSM Runner.
///
/// This module holds the data model of a managed game server and the
/// components that drive it: process handles, the per-instance lock table,
/// the durable registry, the lifecycle engine and the crash monitor.
/// All public operations are instrumented with `tracing` spans.
///
/// # Components
///
/// * `instance` - Server records, statuses and field-level patches
/// * `process` - Spawning, signalling and polling OS processes
/// * `lock` - Per-instance mutual exclusion for operations
/// * `registry` - Durable records and startup reconciliation
/// * `events` - Transition events and output lines for subscribers
/// * `lifecycle` - The state machine behind start, stop, restart, update and reset
/// * `monitor` - Crash detection and automatic recovery
///
/// # Examples
///
/// Starting and stopping a configured server:
///
/// ```no_run
/// use gsm_runner::config::Config;
/// use gsm_runner::server::{Actor, EventBus, InstanceId, LifecycleEngine, ServerRegistry};
/// use std::sync::Arc;
///
/// # async fn run() -> gsm_runner::Result<()> {
/// let config = Config::from_file("server_config.json")?;
/// let registry = Arc::new(ServerRegistry::open(&config)?);
/// let events = Arc::new(EventBus::default());
/// let engine = LifecycleEngine::new(registry, events, &config.manager);
///
/// let id = InstanceId::from("Palworld-main");
/// engine.start(&id, Actor::System).await?;
/// engine.stop(&id, Actor::System).await?;
/// # Ok(())
/// # }
/// ```
pub mod events;
mod instance;
pub mod lifecycle;
pub mod lock;
pub mod monitor;
mod operation;
pub mod process;
pub mod registry;

pub use events::{
    Actor, EventBus, Operation, OperationOutcome, OutputLine, OutputSource, TransitionEvent,
};
pub use instance::{
    Credentials, InstanceId, InstancePatch, ProcessChange, ServerInstance, ServerStatus,
};
pub use lifecycle::{LifecycleEngine, OperationReport};
pub use lock::{OperationGuard, OperationLockTable};
pub use monitor::{ServerHealth, ServerMonitor};
pub use operation::INTERRUPTED;
pub(crate) use operation::OperationScope;
pub use process::{LaunchSpec, ProcessHandle, ProcessState, StopOutcome};
pub use registry::{ProcessProbe, ReconcileReport, ServerRegistry, SystemProbe};
