use crate::config::Config;
use crate::error::{Error, Result};
use crate::server::process::ProcessHandle;
use crate::server::{InstanceId, InstancePatch, ProcessChange, ServerInstance, ServerStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

/// Version written into the state file
const STATE_VERSION: u32 = 1;

#[derive(Serialize)]
struct StateFileRef<'a> {
    version: u32,
    servers: &'a BTreeMap<InstanceId, ServerInstance>,
}

#[derive(Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    servers: BTreeMap<InstanceId, ServerInstance>,
}

/// Looks up OS processes during reconciliation and reset.
pub trait ProcessProbe: Send + Sync {
    /// Whether `pid` is alive and runs `executable`.
    fn verify(&self, pid: u32, executable: &Path) -> bool;
}

/// [`ProcessProbe`] backed by the OS process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn verify(&self, pid: u32, executable: &Path) -> bool {
        let target = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing()
                .with_exe(UpdateKind::OnlyIfNotSet)
                .with_cmd(UpdateKind::OnlyIfNotSet),
        );

        let Some(process) = system.process(target) else {
            return false;
        };
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return false;
        }
        let Some(wanted) = executable.file_name() else {
            return false;
        };

        if process.exe().and_then(Path::file_name) == Some(wanted) {
            return true;
        }
        if process.name() == wanted {
            return true;
        }
        // Scripts show up as their interpreter; look at the first arguments
        process
            .cmd()
            .iter()
            .take(2)
            .any(|arg| Path::new(arg).file_name() == Some(wanted))
    }
}

/// What reconciliation decided for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Reconciled instance
    pub instance_id: InstanceId,
    /// Persisted status before reconciliation
    pub from: ServerStatus,
    /// Status after reconciliation
    pub to: ServerStatus,
    /// Pid that was adopted or left for cleanup
    pub pid: Option<u32>,
    /// Why the record was moved to `Error`
    pub note: Option<String>,
}

/// Durable record of every configured server instance
///
/// The registry is the single source of truth for `status`. Each
/// [`ServerRegistry::upsert`] writes the whole state file atomically before
/// the in-memory record changes.
pub struct ServerRegistry {
    path: PathBuf,
    records: RwLock<BTreeMap<InstanceId, ServerInstance>>,
    handles: RwLock<HashMap<InstanceId, Arc<ProcessHandle>>>,
}

impl ServerRegistry {
    /// Builds the registry from configuration merged over the persisted state.
    ///
    /// Identity and policy come from `config`; status, pid and last error are
    /// kept from the state file. Records with a live-process status get an
    /// orphaned handle until [`ServerRegistry::reconcile`] runs.
    #[tracing::instrument(skip(config), fields(state_file = %config.manager.state_file.display()))]
    pub fn open(config: &Config) -> Result<Self> {
        let path = config.manager.state_file.clone();
        let persisted = load_state(&path)?;

        let mut records = BTreeMap::new();
        let mut handles = HashMap::new();
        for (name, server) in &config.servers {
            let fresh = ServerInstance::from_config(config, name, server)?;
            let record = match persisted.get(&fresh.instance_id) {
                Some(previous) => fresh.with_runtime_of(previous),
                None => fresh,
            };

            if record.status.implies_process() {
                if let Some(pid) = record.pid {
                    tracing::debug!(instance_id = %record.instance_id, pid, "Orphaned process handle");
                    handles.insert(
                        record.instance_id.clone(),
                        Arc::new(ProcessHandle::orphaned(pid, record.resolved_executable())),
                    );
                }
            }
            records.insert(record.instance_id.clone(), record);
        }

        let dropped = persisted.keys().filter(|id| !records.contains_key(*id)).count();
        if dropped > 0 {
            tracing::info!(dropped, "Dropped persisted records that are no longer configured");
        }

        write_state(&path, &records)?;
        tracing::info!(servers = records.len(), "Registry opened");

        Ok(Self {
            path,
            records: RwLock::new(records),
            handles: RwLock::new(handles),
        })
    }

    /// Path of the durable state file
    pub fn state_file(&self) -> &Path {
        &self.path
    }

    /// Adds a new instance in its given state.
    pub fn register(&self, instance: ServerInstance) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Other("Failed to lock registry".to_string()))?;

        if records.contains_key(&instance.instance_id) {
            return Err(Error::ConfigInvalid(format!(
                "Instance '{}' is already registered",
                instance.instance_id
            )));
        }

        let id = instance.instance_id.clone();
        records.insert(id.clone(), instance);
        if let Err(e) = write_state(&self.path, &records) {
            records.remove(&id);
            return Err(e);
        }
        tracing::info!(instance_id = %id, "Instance registered");
        Ok(())
    }

    /// Current record of an instance.
    pub fn get(&self, instance_id: &InstanceId) -> Result<ServerInstance> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::Other("Failed to lock registry".to_string()))?;

        let mut record = records
            .get(instance_id)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(instance_id.to_string()))?;
        record.process_attached = self.process(instance_id).is_some();
        Ok(record)
    }

    /// All records, ordered by instance id.
    pub fn list(&self) -> Result<Vec<ServerInstance>> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::Other("Failed to lock registry".to_string()))?;
        let handles = self
            .handles
            .read()
            .map_err(|_| Error::Other("Failed to lock process handles".to_string()))?;

        Ok(records
            .values()
            .cloned()
            .map(|mut record| {
                record.process_attached = handles.contains_key(&record.instance_id);
                record
            })
            .collect())
    }

    /// Ids of all records.
    pub fn ids(&self) -> Result<Vec<InstanceId>> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::Other("Failed to lock registry".to_string()))?;
        Ok(records.keys().cloned().collect())
    }

    /// Process handle attached to an instance, if any.
    pub fn process(&self, instance_id: &InstanceId) -> Option<Arc<ProcessHandle>> {
        self.handles
            .read()
            .ok()
            .and_then(|handles| handles.get(instance_id).cloned())
    }

    /// Merges `patch` into a record and persists it before returning.
    ///
    /// Callers hold the instance's operation lock.
    #[tracing::instrument(skip(self, patch), fields(instance_id = %instance_id))]
    pub fn upsert(&self, instance_id: &InstanceId, patch: InstancePatch) -> Result<ServerInstance> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Other("Failed to lock registry".to_string()))?;

        let mut updated = records
            .get(instance_id)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(instance_id.to_string()))?;
        patch.apply(&mut updated, Utc::now());

        let previous = records.insert(instance_id.clone(), updated.clone());
        if let Err(e) = write_state(&self.path, &records) {
            if let Some(previous) = previous {
                records.insert(instance_id.clone(), previous);
            }
            tracing::error!(error = %e, "Failed to persist registry");
            return Err(e);
        }

        let mut handles = self
            .handles
            .write()
            .map_err(|_| Error::Other("Failed to lock process handles".to_string()))?;
        match patch.process {
            Some(ProcessChange::Attach(handle)) => {
                handles.insert(instance_id.clone(), handle);
            }
            Some(ProcessChange::Detach { .. }) => {
                handles.remove(instance_id);
            }
            None => {}
        }
        updated.process_attached = handles.contains_key(instance_id);

        tracing::debug!(status = %updated.status, "Record updated");
        Ok(updated)
    }

    /// Reconciles every record against the OS process table.
    pub fn reconcile(&self, probe: &dyn ProcessProbe) -> Result<Vec<ReconcileReport>> {
        let mut reports = Vec::new();
        for id in self.ids()? {
            if let Some(report) = self.reconcile_record(&id, probe)? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Reconciles one record.
    ///
    /// A live-process status with a verified pid is adopted as `Running`.
    /// Anything else that was in flight when the manager went down becomes
    /// `Error`; the pid is kept so a later reset can clean it up.
    pub fn reconcile_record(
        &self,
        instance_id: &InstanceId,
        probe: &dyn ProcessProbe,
    ) -> Result<Option<ReconcileReport>> {
        let record = self.get(instance_id)?;
        let from = record.status;

        let verdict = match from {
            ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping => {
                match record.pid {
                    Some(pid) if probe.verify(pid, &record.resolved_executable()) => Ok(pid),
                    Some(pid) => Err(format!(
                        "no process {} running {} was found after manager restart",
                        pid, record.executable
                    )),
                    None => Err("no process id was recorded before manager restart".to_string()),
                }
            }
            ServerStatus::Updating | ServerStatus::BackingUp | ServerStatus::Restoring => Err(
                format!("{} was interrupted by a manager restart", from),
            ),
            ServerStatus::Stopped | ServerStatus::Error => return Ok(None),
        };

        let report = match verdict {
            Ok(pid) => {
                let handle = self
                    .process(instance_id)
                    .unwrap_or_else(|| Arc::new(ProcessHandle::orphaned(pid, record.resolved_executable())));
                handle.adopt();
                self.upsert(
                    instance_id,
                    InstancePatch::status(ServerStatus::Running)
                        .with_process(ProcessChange::Attach(handle)),
                )?;
                tracing::info!(%instance_id, pid, "Adopted running process");
                ReconcileReport {
                    instance_id: instance_id.clone(),
                    from,
                    to: ServerStatus::Running,
                    pid: Some(pid),
                    note: None,
                }
            }
            Err(note) => {
                let error = Error::ReconciliationUnknown(note.clone());
                self.upsert(
                    instance_id,
                    InstancePatch::status(ServerStatus::Error)
                        .with_error(error.to_string())
                        .with_process(ProcessChange::Detach { keep_pid: true }),
                )?;
                tracing::warn!(%instance_id, %note, "Reconciliation moved record to Error");
                ReconcileReport {
                    instance_id: instance_id.clone(),
                    from,
                    to: ServerStatus::Error,
                    pid: record.pid,
                    note: Some(note),
                }
            }
        };
        Ok(Some(report))
    }
}

fn load_state(path: &Path) -> Result<BTreeMap<InstanceId, ServerInstance>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            return Err(Error::Io(format!(
                "Failed to read state file {}: {}",
                path.display(),
                e
            )));
        }
    };

    let state: StateFile = serde_json::from_str(&content).map_err(|e| {
        Error::Serialization(format!("State file {} is corrupt: {}", path.display(), e))
    })?;
    if state.version != STATE_VERSION {
        return Err(Error::Serialization(format!(
            "State file {} has unsupported version {}",
            path.display(),
            state.version
        )));
    }
    Ok(state.servers)
}

/// Writes via a temp file, fsync and rename so the file is never half-written.
fn write_state(path: &Path, records: &BTreeMap<InstanceId, ServerInstance>) -> Result<()> {
    let json = serde_json::to_vec_pretty(&StateFileRef {
        version: STATE_VERSION,
        servers: records,
    })
    .map_err(|e| Error::Serialization(format!("Failed to serialize state: {}", e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        Error::Io(format!(
            "Failed to move state file into place at {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.manager.state_file = dir.path().join("state.json");
        config.manager.servers_root = dir.path().join("servers");
        config
            .servers
            .insert("Valheim".to_string(), ServerConfig::new("896660", "valheim_server.x86_64"));
        config
    }

    #[test]
    fn upsert_persists_before_returning() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let registry = ServerRegistry::open(&config).unwrap();
        let id = InstanceId::from("valheim");

        registry
            .upsert(&id, InstancePatch::status(ServerStatus::Error).with_error("boom"))
            .unwrap();

        let reopened = ServerRegistry::open(&config).unwrap();
        let record = reopened.get(&id).unwrap();
        assert_eq!(record.status, ServerStatus::Error);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn upsert_unknown_instance_is_not_found() {
        let dir = TempDir::new().unwrap();
        let registry = ServerRegistry::open(&config_in(&dir)).unwrap();
        let err = registry
            .upsert(&"nope".into(), InstancePatch::status(ServerStatus::Running))
            .unwrap_err();
        assert!(matches!(err, Error::ServerNotFound(_)));
    }

    #[test]
    fn duplicate_register_is_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = ServerRegistry::open(&config_in(&dir)).unwrap();
        let existing = registry.get(&"valheim".into()).unwrap();
        assert!(registry.register(existing).is_err());
    }

    #[test]
    fn corrupt_state_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        fs::write(&config.manager.state_file, "{ not json").unwrap();
        assert!(matches!(
            ServerRegistry::open(&config),
            Err(Error::Serialization(_))
        ));
    }
}
