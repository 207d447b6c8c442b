use crate::error::{Error, Result};
use crate::server::InstanceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
struct Slot {
    gate: Arc<tokio::sync::Mutex<()>>,
    holder: Mutex<Option<String>>,
}

/// Per-instance mutual exclusion for lifecycle and backup operations
///
/// Waiters queue FIFO behind the current holder. Locks for different instances
/// are independent.
#[derive(Default)]
pub struct OperationLockTable {
    slots: Mutex<HashMap<InstanceId, Arc<Slot>>>,
}

/// Scoped ownership of an instance lock; released on drop.
pub struct OperationGuard {
    instance_id: InstanceId,
    operation: String,
    slot: Arc<Slot>,
    _gate: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard")
            .field("instance_id", &self.instance_id)
            .field("operation", &self.operation)
            .finish()
    }
}

impl OperationGuard {
    /// Instance this guard locks
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Operation that holds the lock
    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Ok(mut holder) = self.slot.holder.lock() {
            *holder = None;
        }
        tracing::trace!(instance_id = %self.instance_id, operation = %self.operation, "Lock released");
    }
}

impl OperationLockTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, instance_id: &InstanceId) -> Result<Arc<Slot>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| Error::Other("Failed to lock operation table".to_string()))?;
        Ok(Arc::clone(slots.entry(instance_id.clone()).or_default()))
    }

    /// Waits up to `wait` for the instance lock.
    ///
    /// Fails with [`Error::Busy`] naming the current holder when the wait elapses.
    #[tracing::instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn acquire(
        &self,
        instance_id: &InstanceId,
        operation: &str,
        wait: Duration,
    ) -> Result<OperationGuard> {
        let slot = self.slot(instance_id)?;
        match tokio::time::timeout(wait, Arc::clone(&slot.gate).lock_owned()).await {
            Ok(gate) => Ok(Self::claim(instance_id, operation, slot, gate)),
            Err(_) => {
                let holder = Self::holder_of(&slot).unwrap_or_else(|| "another operation".to_string());
                tracing::warn!(%holder, "Timed out waiting for instance lock");
                Err(Error::Busy {
                    instance_id: instance_id.to_string(),
                    holder,
                })
            }
        }
    }

    /// Takes the lock only if it is free right now.
    pub fn try_acquire(&self, instance_id: &InstanceId, operation: &str) -> Option<OperationGuard> {
        let slot = self.slot(instance_id).ok()?;
        let gate = Arc::clone(&slot.gate).try_lock_owned().ok()?;
        Some(Self::claim(instance_id, operation, slot, gate))
    }

    /// Name of the operation currently holding the instance lock.
    pub fn current_operation(&self, instance_id: &InstanceId) -> Option<String> {
        let slots = self.slots.lock().ok()?;
        slots.get(instance_id).and_then(|slot| Self::holder_of(slot))
    }

    fn holder_of(slot: &Slot) -> Option<String> {
        slot.holder.lock().ok().and_then(|holder| holder.clone())
    }

    fn claim(
        instance_id: &InstanceId,
        operation: &str,
        slot: Arc<Slot>,
        gate: OwnedMutexGuard<()>,
    ) -> OperationGuard {
        if let Ok(mut holder) = slot.holder.lock() {
            *holder = Some(operation.to_string());
        }
        tracing::trace!(%instance_id, operation, "Lock acquired");
        OperationGuard {
            instance_id: instance_id.clone(),
            operation: operation.to_string(),
            slot,
            _gate: gate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_times_out_with_holder_name() {
        let table = OperationLockTable::new();
        let id = InstanceId::from("palworld-main");

        let _guard = table
            .acquire(&id, "update", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(table.current_operation(&id).as_deref(), Some("update"));

        let err = table
            .acquire(&id, "start", Duration::from_millis(20))
            .await
            .unwrap_err();
        match err {
            Error::Busy { holder, .. } => assert_eq!(holder, "update"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn different_instances_do_not_block() {
        let table = OperationLockTable::new();
        let _a = table.try_acquire(&"a".into(), "start").unwrap();
        assert!(table.try_acquire(&"b".into(), "start").is_some());
        assert!(table.try_acquire(&"a".into(), "stop").is_none());
    }

    #[tokio::test]
    async fn drop_releases_lock() {
        let table = OperationLockTable::new();
        let id = InstanceId::from("valheim");
        drop(table.try_acquire(&id, "backup").unwrap());
        assert_eq!(table.current_operation(&id), None);
        assert!(table.try_acquire(&id, "restore").is_some());
    }
}
