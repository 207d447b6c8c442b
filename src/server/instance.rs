use crate::config::{Config, ServerConfig, parse_stop_time};
use crate::error::Result;
use crate::server::process::ProcessHandle;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Stable identifier of a managed server instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wraps an already validated identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Status of a server instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Server is not running and no operation is in progress
    Stopped,
    /// Server process is being spawned
    Starting,
    /// Server process is running
    Running,
    /// Server process is being asked to exit
    Stopping,
    /// Server files are being updated by the package-fetch tool
    Updating,
    /// Server data directory is being archived
    BackingUp,
    /// Server data directory is being restored from an archive
    Restoring,
    /// Last operation failed or the process died; needs attention
    Error,
}

impl ServerStatus {
    /// Whether this status implies an OS process should be attached.
    pub fn implies_process(self) -> bool {
        matches!(
            self,
            ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping
        )
    }

    /// Whether this status only exists while an operation is in flight.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ServerStatus::Starting
                | ServerStatus::Stopping
                | ServerStatus::Updating
                | ServerStatus::BackingUp
                | ServerStatus::Restoring
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Login for the package-fetch tool; the password stays encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account name
    pub username: String,
    /// Encrypted password, see [`crate::credentials::CredentialCipher`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// One configured game server and its last known runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInstance {
    /// Unique, stable key
    pub instance_id: InstanceId,
    /// Display name (the configuration key)
    pub name: String,
    /// External package identifier
    pub app_id: String,
    /// Executable, relative to `install_dir` or on the PATH
    pub executable: String,
    /// Install and working directory
    pub install_dir: PathBuf,
    /// Ordered launch parameters
    #[serde(default)]
    pub launch_parameters: Vec<String>,
    /// Package-fetch login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Update during the daily maintenance window
    pub auto_update: bool,
    /// Daily stop at `stop_time`, restart after crashes
    pub auto_restart: bool,
    /// Daily maintenance time
    #[serde(default, with = "hhmm", skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<NaiveTime>,
    /// Start again after the daily stop
    pub restart_after_stop: bool,
    /// Per-game template name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Template passthrough options
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,

    /// Current status
    pub status: ServerStatus,
    /// Last OS process id seen for this instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Reason for the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When `status` last changed
    pub last_transition_time: DateTime<Utc>,
    /// Whether a process handle is attached; filled in by the registry
    #[serde(skip)]
    pub process_attached: bool,
}

impl ServerInstance {
    /// Builds a fresh `Stopped` record from its configuration entry.
    pub fn from_config(config: &Config, name: &str, server: &ServerConfig) -> Result<Self> {
        let id = config.instance_id_of(name, server);
        let stop_time = match server.stop_time.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(parse_stop_time(raw)?),
            _ => None,
        };
        let credentials = server.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: server.password.clone(),
        });

        Ok(Self {
            install_dir: config.install_dir_of(&id, server),
            instance_id: InstanceId::new(id),
            name: name.to_string(),
            app_id: server.app_id.clone(),
            executable: server.executable.clone(),
            launch_parameters: server.parameters.clone(),
            credentials,
            auto_update: server.auto_update,
            auto_restart: server.auto_restart,
            stop_time,
            restart_after_stop: server.restart_after_stop,
            template: server.template.clone(),
            options: server.options.clone(),
            status: ServerStatus::Stopped,
            pid: None,
            last_error: None,
            last_transition_time: Utc::now(),
            process_attached: false,
        })
    }

    /// Keeps the runtime fields of a persisted record, taking everything else
    /// from `self`.
    pub(crate) fn with_runtime_of(mut self, persisted: &ServerInstance) -> Self {
        self.status = persisted.status;
        self.pid = persisted.pid;
        self.last_error = persisted.last_error.clone();
        self.last_transition_time = persisted.last_transition_time;
        self
    }

    /// The directory that backups archive and restores into.
    pub fn data_dir(&self) -> &PathBuf {
        &self.install_dir
    }

    /// Resolves the executable: a file inside `install_dir` wins, a bare name
    /// falls back to a PATH lookup.
    pub fn resolved_executable(&self) -> PathBuf {
        let candidate = self.install_dir.join(&self.executable);
        let bare = PathBuf::from(&self.executable).components().count() == 1;
        if candidate.is_file() || !bare {
            candidate
        } else {
            PathBuf::from(&self.executable)
        }
    }
}

/// Change to the process attachment applied together with a field update.
#[derive(Clone)]
pub enum ProcessChange {
    /// Attach a handle and record its pid
    Attach(Arc<ProcessHandle>),
    /// Drop the handle; optionally remember its pid for later cleanup
    Detach {
        /// Keep `pid` in the record
        keep_pid: bool,
    },
}

impl fmt::Debug for ProcessChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessChange::Attach(handle) => write!(f, "Attach(pid {})", handle.pid()),
            ProcessChange::Detach { keep_pid } => write!(f, "Detach(keep_pid: {})", keep_pid),
        }
    }
}

/// Field-level update merged into a [`ServerInstance`] by the registry.
///
/// Only fields that are `Some` are written. Policy fields (`auto_update`,
/// `auto_restart`, `stop_time`, `restart_after_stop`) are runtime overrides:
/// they are persisted, but [`ServerRegistry::open`](crate::server::ServerRegistry::open)
/// takes policy from the configuration, so an override lasts until the next
/// open. Change the configuration file to make it permanent.
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    /// New status
    pub status: Option<ServerStatus>,
    /// `Some(None)` clears the error
    pub last_error: Option<Option<String>>,
    /// Process attachment change
    pub process: Option<ProcessChange>,
    /// New auto-update policy
    pub auto_update: Option<bool>,
    /// New auto-restart policy
    pub auto_restart: Option<bool>,
    /// New stop time; `Some(None)` disables the daily stop
    pub stop_time: Option<Option<NaiveTime>>,
    /// New restart-after-stop policy
    pub restart_after_stop: Option<bool>,
}

impl InstancePatch {
    /// Patch that only changes the status.
    pub fn status(status: ServerStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Sets `last_error`.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self
    }

    /// Clears `last_error`.
    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    /// Attaches or detaches a process.
    pub fn with_process(mut self, change: ProcessChange) -> Self {
        self.process = Some(change);
        self
    }

    pub(crate) fn apply(&self, record: &mut ServerInstance, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            if status != record.status {
                record.last_transition_time = now;
            }
            record.status = status;
        }
        if let Some(last_error) = &self.last_error {
            record.last_error = last_error.clone();
        }
        match &self.process {
            Some(ProcessChange::Attach(handle)) => record.pid = Some(handle.pid()),
            Some(ProcessChange::Detach { keep_pid: false }) => record.pid = None,
            Some(ProcessChange::Detach { keep_pid: true }) | None => {}
        }
        if let Some(v) = self.auto_update {
            record.auto_update = v;
        }
        if let Some(v) = self.auto_restart {
            record.auto_restart = v;
        }
        if let Some(v) = self.stop_time {
            record.stop_time = v;
        }
        if let Some(v) = self.restart_after_stop {
            record.restart_after_stop = v;
        }
    }
}

/// `HH:MM` serialization for optional times of day.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match time {
            Some(t) => serializer.serialize_str(&t.format("%H:%M").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => NaiveTime::parse_from_str(s, "%H:%M")
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerInstance {
        let mut config = Config::default();
        let mut server = ServerConfig::new("2394010", "PalServer.sh");
        server.instance_id = Some("Palworld-main".to_string());
        server.stop_time = Some("02:09".to_string());
        config.servers.insert("Palworld".to_string(), server.clone());
        ServerInstance::from_config(&config, "Palworld", &server).unwrap()
    }

    #[test]
    fn from_config_starts_stopped() {
        let instance = sample();
        assert_eq!(instance.instance_id.as_str(), "Palworld-main");
        assert_eq!(instance.status, ServerStatus::Stopped);
        assert_eq!(
            instance.stop_time,
            NaiveTime::from_hms_opt(2, 9, 0)
        );
    }

    #[test]
    fn stop_time_serializes_as_hhmm() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["stop_time"], "02:09");
        let back: ServerInstance = serde_json::from_value(json).unwrap();
        assert_eq!(back.stop_time, NaiveTime::from_hms_opt(2, 9, 0));
    }

    #[test]
    fn patch_only_moves_transition_time_on_status_change() {
        let mut instance = sample();
        let before = instance.last_transition_time;
        let later = before + chrono::Duration::seconds(5);

        InstancePatch::default().with_error("x").apply(&mut instance, later);
        assert_eq!(instance.last_transition_time, before);
        assert_eq!(instance.last_error.as_deref(), Some("x"));

        InstancePatch::status(ServerStatus::Error).apply(&mut instance, later);
        assert_eq!(instance.last_transition_time, later);
    }

    #[test]
    fn bare_executable_falls_back_to_path_lookup() {
        let instance = sample();
        assert_eq!(instance.resolved_executable(), PathBuf::from("PalServer.sh"));
    }
}
