//! Transition events and the bus that publishes them.
//!
//! Every completed leg of a lifecycle, backup or restore operation publishes
//! one [`TransitionEvent`]. Subscribers (a front-end, an audit log) receive
//! events through a broadcast channel; a bounded history is kept for
//! inspection. Output lines of running servers and update commands travel on
//! a second channel.

use crate::error::{Error, Result};
use crate::server::{InstanceId, ServerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Maximum number of events kept in history
const HISTORY_LIMIT: usize = 1000;

/// Operation an event reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Spawn the server process
    Start,
    /// Stop the server process
    Stop,
    /// Stop then start under one lock
    Restart,
    /// Run the package-fetch command
    Update,
    /// Clear an error status
    Reset,
    /// Reset then start under one lock; its legs publish `Reset` and `Start`
    Recover,
    /// Archive the data directory
    Backup,
    /// Repopulate the data directory from an archive
    Restore,
    /// Startup recovery of a persisted record
    Reconcile,
    /// The process died while running
    CrashDetected,
}

impl Operation {
    /// Lowercase name used in messages and lock holders
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Restart => "restart",
            Operation::Update => "update",
            Operation::Reset => "reset",
            Operation::Recover => "recover",
            Operation::Backup => "backup",
            Operation::Restore => "restore",
            Operation::Reconcile => "reconcile",
            Operation::CrashDetected => "crash",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    /// Reached its target status
    Succeeded,
    /// Ended in `Error`
    Failed,
    /// Cancelled or dropped before finishing
    Cancelled,
}

/// Who triggered an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    /// A front-end user; the role was already checked by the front-end
    User {
        /// Invoking principal
        principal: String,
        /// Principal's role
        role: String,
    },
    /// The daily timetable
    Scheduler,
    /// The crash watch
    Monitor,
    /// The manager itself (startup recovery, shutdown)
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User { principal, role } => write!(f, "{} ({})", principal, role),
            Actor::Scheduler => f.write_str("scheduler"),
            Actor::Monitor => f.write_str("monitor"),
            Actor::System => f.write_str("system"),
        }
    }
}

/// One state transition, as published to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// Unique event id
    pub id: Uuid,
    /// When the transition completed
    pub timestamp: DateTime<Utc>,
    /// Instance that transitioned
    pub instance_id: InstanceId,
    /// Operation (leg) that caused it
    pub operation: Operation,
    /// How it ended
    pub outcome: OperationOutcome,
    /// Who asked for it
    pub actor: Actor,
    /// Status before the operation
    pub from: ServerStatus,
    /// Status after the operation
    pub to: ServerStatus,
    /// Error text or other context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TransitionEvent {
    /// Creates an event stamped now.
    pub fn new(
        instance_id: InstanceId,
        operation: Operation,
        outcome: OperationOutcome,
        actor: Actor,
        from: ServerStatus,
        to: ServerStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            instance_id,
            operation,
            outcome,
            actor,
            from,
            to,
            detail: None,
        }
    }

    /// Attaches detail text.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Where an output line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    /// The game server process
    Server,
    /// The package-fetch command
    Update,
}

/// One line printed by a server or an update command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    /// Instance that produced the line
    pub instance_id: InstanceId,
    /// Producer
    pub source: OutputSource,
    /// Line text without the trailing newline
    pub line: String,
}

/// Publishes transition events and output lines
pub struct EventBus {
    events: broadcast::Sender<TransitionEvent>,
    output: broadcast::Sender<OutputLine>,
    history: Mutex<VecDeque<TransitionEvent>>,
}

impl EventBus {
    /// Creates a bus whose channels buffer `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (output, _) = broadcast::channel(capacity);
        Self {
            events,
            output,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Subscribes to transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    /// Subscribes to output lines.
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.output.subscribe()
    }

    /// Publishes an event and records it in history.
    pub fn publish(&self, event: TransitionEvent) {
        tracing::info!(
            instance_id = %event.instance_id,
            operation = %event.operation,
            outcome = ?event.outcome,
            actor = %event.actor,
            from = %event.from,
            to = %event.to,
            "Server transition"
        );

        if let Ok(mut history) = self.history.lock() {
            history.push_back(event.clone());
            if history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }

        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Publishes an output line.
    pub fn publish_output(&self, instance_id: &InstanceId, source: OutputSource, line: String) {
        let _ = self.output.send(OutputLine {
            instance_id: instance_id.clone(),
            source,
            line,
        });
    }

    /// Events for one instance, newest first.
    pub fn instance_events(
        &self,
        instance_id: &InstanceId,
        limit: Option<usize>,
    ) -> Result<Vec<TransitionEvent>> {
        let history = self
            .history
            .lock()
            .map_err(|_| Error::Other("Failed to lock event history".to_string()))?;

        let events = history
            .iter()
            .rev()
            .filter(|e| &e.instance_id == instance_id)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(events)
    }

    /// All events, newest first.
    pub fn all_events(&self, limit: Option<usize>) -> Result<Vec<TransitionEvent>> {
        let history = self
            .history
            .lock()
            .map_err(|_| Error::Other("Failed to lock event history".to_string()))?;

        Ok(history
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, operation: Operation) -> TransitionEvent {
        TransitionEvent::new(
            id.into(),
            operation,
            OperationOutcome::Succeeded,
            Actor::System,
            ServerStatus::Stopped,
            ServerStatus::Running,
        )
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(event("ark", Operation::Start));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.instance_id.as_str(), "ark");
        assert_eq!(received.operation, Operation::Start);
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let bus = EventBus::new(8);
        for _ in 0..(HISTORY_LIMIT + 5) {
            bus.publish(event("ark", Operation::Start));
        }
        bus.publish(event("ark", Operation::Stop));

        let all = bus.all_events(None).unwrap();
        assert_eq!(all.len(), HISTORY_LIMIT);
        assert_eq!(all[0].operation, Operation::Stop);

        let other = bus.instance_events(&"valheim".into(), None).unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn actor_serializes_with_kind_tag() {
        let actor = Actor::User {
            principal: "alice".to_string(),
            role: "admin".to_string(),
        };
        let json = serde_json::to_value(&actor).unwrap();
        assert_eq!(json["kind"], "user");
        assert_eq!(json["role"], "admin");
    }
}
