use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a single game server instance.
///
/// The known fields form a fixed schema; anything else found in the entry is
/// kept verbatim in [`ServerConfig::options`] so per-game templates can carry
/// their own settings without the runner needing to understand them.
///
/// # Examples
///
/// ```
/// use gsm_runner::config::ServerConfig;
///
/// let server_config: ServerConfig = serde_json::from_str(r#"{
///     "app_id": "2394010",
///     "executable": "PalServer.sh",
///     "parameters": "-port=8211 -players=16",
///     "stop_time": "04:00",
///     "restart_after_stop": true
/// }"#).unwrap();
///
/// assert_eq!(server_config.parameters, vec!["-port=8211", "-players=16"]);
/// assert!(server_config.auto_update);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// External package identifier handed to the package-fetch tool.
    pub app_id: String,

    /// Executable to launch, relative to `install_dir` or found on the PATH.
    pub executable: String,

    /// Stable instance identifier. Defaults to the sanitized server name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Directory the server is installed into and launched from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,

    /// Launch parameters, either a list or a whitespace separated string.
    #[serde(default, deserialize_with = "deserialize_parameters")]
    pub parameters: Vec<String>,

    /// Login for the package-fetch tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Encrypted password for the package-fetch tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Update the server during its daily maintenance window.
    #[serde(default = "default_true")]
    pub auto_update: bool,

    /// Stop the server daily at `stop_time` and restart it after a crash.
    #[serde(default = "default_true")]
    pub auto_restart: bool,

    /// Daily maintenance time, `HH:MM` local time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<String>,

    /// Start the server again once the daily stop has finished.
    #[serde(default)]
    pub restart_after_stop: bool,

    /// Name of the per-game template this entry was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Template-specific passthrough options.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl ServerConfig {
    /// Creates a configuration with defaults for everything except the identity.
    pub fn new(app_id: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            executable: executable.into(),
            instance_id: None,
            install_dir: None,
            parameters: Vec::new(),
            username: None,
            password: None,
            auto_update: true,
            auto_restart: true,
            stop_time: None,
            restart_after_stop: false,
            template: None,
            options: Map::new(),
        }
    }
}

/// Timeouts applied to each kind of operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound for spawning a server and its startup check.
    pub start_secs: u64,
    /// How long a freshly spawned process must survive to count as started.
    pub startup_check_ms: u64,
    /// Grace period between the polite stop request and the forced kill.
    pub stop_grace_secs: u64,
    /// How long to wait for the OS to confirm a forced kill.
    pub kill_wait_secs: u64,
    /// How long an operation waits in line for the instance lock.
    pub lock_wait_secs: u64,
    /// Upper bound for the package-fetch command. `None` means unbounded.
    pub update_secs: Option<u64>,
    /// Upper bound for archiving or extracting a backup. `None` means unbounded.
    pub backup_secs: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start_secs: 30,
            startup_check_ms: 500,
            stop_grace_secs: 30,
            kill_wait_secs: 10,
            lock_wait_secs: 60,
            update_secs: Some(7200),
            backup_secs: None,
        }
    }
}

impl TimeoutConfig {
    /// Start timeout.
    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    /// Startup check delay.
    pub fn startup_check(&self) -> Duration {
        Duration::from_millis(self.startup_check_ms)
    }

    /// Graceful stop period.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Forced kill confirmation bound.
    pub fn kill_wait(&self) -> Duration {
        Duration::from_secs(self.kill_wait_secs)
    }

    /// Lock wait bound.
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    /// Update bound, if any.
    pub fn update(&self) -> Option<Duration> {
        self.update_secs.map(Duration::from_secs)
    }

    /// Backup bound, if any.
    pub fn backup(&self) -> Option<Duration> {
        self.backup_secs.map(Duration::from_secs)
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between timetable checks.
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_secs: 60 }
    }
}

/// Crash watch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between process checks.
    pub check_interval_secs: u64,
    /// Restart crashed servers whose own `auto_restart` is set.
    pub auto_restart: bool,
    /// Crashes in a row, without the server being seen alive, before giving up.
    pub max_consecutive_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            auto_restart: true,
            max_consecutive_failures: 3,
        }
    }
}

/// How to invoke the external package-fetch tool.
///
/// Arguments are a template: `{install_dir}`, `{app_id}` and `{instance_id}`
/// are substituted inside any argument, and an argument that is exactly
/// `{login}` expands to `username password` or to `anonymous`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateCommandConfig {
    /// Program to run.
    pub program: String,
    /// Argument template.
    pub args: Vec<String>,
    /// Working directory for the tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Output lines kept for error reporting.
    pub tail_lines: usize,
}

impl Default for UpdateCommandConfig {
    fn default() -> Self {
        Self {
            program: "steam/steamcmd".to_string(),
            args: [
                "+force_install_dir",
                "{install_dir}",
                "+login",
                "{login}",
                "+app_update",
                "{app_id}",
                "validate",
                "+quit",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            working_dir: None,
            tail_lines: 40,
        }
    }
}

/// Settings for the manager itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Durable registry file.
    pub state_file: PathBuf,
    /// Directory backup archives are written to.
    pub backup_dir: PathBuf,
    /// Root under which default install directories are placed.
    pub servers_root: PathBuf,
    /// Environment variable holding the credential passphrase.
    pub encryption_key_env: String,
    /// Operation timeouts.
    pub timeouts: TimeoutConfig,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Crash watch settings.
    pub monitor: MonitorConfig,
    /// Package-fetch tool invocation.
    pub update_command: UpdateCommandConfig,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("server_state.json"),
            backup_dir: PathBuf::from("steam/backup"),
            servers_root: PathBuf::from("steam/GSM/servers"),
            encryption_key_env: "GSM_ENCRYPTION_KEY".to_string(),
            timeouts: TimeoutConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            update_command: UpdateCommandConfig::default(),
        }
    }
}

/// Main configuration for the GSM Runner.
///
/// # JSON Schema
///
/// ```json
/// {
///   "log_retention_days": 7,
///   "manager": {
///     "state_file": "server_state.json",
///     "backup_dir": "steam/backup",
///     "timeouts": { "stop_grace_secs": 30 }
///   },
///   "server_paths": {
///     "Palworld": {
///       "app_id": "2394010",
///       "instance_id": "palworld-main",
///       "executable": "PalServer.sh",
///       "parameters": ["-port=8211"],
///       "stop_time": "02:09",
///       "restart_after_stop": true
///     }
///   }
/// }
/// ```
///
/// # Examples
///
/// ```
/// use gsm_runner::config::Config;
///
/// let config = Config::parse_from_str(r#"{
///     "server_paths": {
///         "Valheim": { "app_id": "896660", "executable": "valheim_server.x86_64" }
///     }
/// }"#).unwrap();
///
/// let valheim = &config.servers["Valheim"];
/// assert_eq!(config.instance_id_of("Valheim", valheim), "valheim");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Days the audit collaborator keeps its log.
    #[serde(default = "default_retention")]
    pub log_retention_days: u32,

    /// Manager-wide settings.
    #[serde(default)]
    pub manager: ManagerSettings,

    /// Map of server names to their configurations.
    #[serde(rename = "server_paths", default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_retention_days: default_retention(),
            manager: ManagerSettings::default(),
            servers: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON
    /// * The configuration fails validation
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        Self::parse_from_str(&content)
    }

    /// Parses and validates a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))?;
        super::validate_config(&config)?;
        Ok(config)
    }

    /// Effective instance id for a configured server.
    ///
    /// An explicit `instance_id` is used as written; otherwise the id is
    /// derived from the server name.
    pub fn instance_id_of(&self, name: &str, server: &ServerConfig) -> String {
        match server.instance_id.as_deref() {
            Some(explicit) => explicit.trim().to_string(),
            None => sanitize_instance_id(name),
        }
    }

    /// Effective install directory for a configured server.
    pub fn install_dir_of(&self, instance_id: &str, server: &ServerConfig) -> PathBuf {
        server.install_dir.clone().unwrap_or_else(|| {
            self.manager
                .servers_root
                .join(&server.app_id)
                .join(instance_id)
                .join("serverfiles")
        })
    }
}

/// Normalizes a name into an instance id: lowercase ASCII letters, digits,
/// `-` and `_`; every other run of characters becomes a single `-`.
pub fn sanitize_instance_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Whether `id` only uses ASCII letters, digits, `-` and `_`.
pub fn is_valid_instance_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn default_true() -> bool {
    true
}

fn default_retention() -> u32 {
    7
}

fn deserialize_parameters<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Some(other) => vec![other.to_string()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gsm_config() {
        let config_str = r#"{
            "server_paths": {
                "Palworld": {
                    "app_id": "2394010",
                    "instance_id": "Palworld-main",
                    "executable": "PalServer.sh",
                    "parameters": ["-port=8211", 16],
                    "stop_time": "02:09",
                    "restart_after_stop": true,
                    "world_name": "islands"
                }
            }
        }"#;

        let config = Config::parse_from_str(config_str).unwrap();

        assert_eq!(config.servers.len(), 1);
        let palworld = &config.servers["Palworld"];
        assert_eq!(palworld.parameters, vec!["-port=8211", "16"]);
        assert_eq!(config.instance_id_of("Palworld", palworld), "Palworld-main");
        assert_eq!(palworld.options["world_name"], "islands");
        assert_eq!(config.log_retention_days, 7);
        assert_eq!(config.manager.timeouts.stop_grace_secs, 30);
    }

    #[test]
    fn sanitize_collapses_separators() {
        assert_eq!(sanitize_instance_id("  ARK: Survival  "), "ark-survival");
        assert_eq!(sanitize_instance_id("cs2_main"), "cs2_main");
        assert_eq!(sanitize_instance_id("!!"), "");
    }

    #[test]
    fn default_install_dir_is_under_servers_root() {
        let config = Config::default();
        let server = ServerConfig::new("896660", "valheim_server.x86_64");
        assert_eq!(
            config.install_dir_of("valheim", &server),
            PathBuf::from("steam/GSM/servers/896660/valheim/serverfiles")
        );
    }
}
