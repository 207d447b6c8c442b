#![allow(dead_code)]

use gsm_runner::config::Config;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch directory plus a configuration rooted inside it
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    /// Builds a config whose state, backups and installs live in a temp dir.
    ///
    /// `servers` is the `server_paths` object; each server gets an existing
    /// `install_dir` under the temp dir unless it sets one itself.
    pub fn new(servers: Value) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = test_config(dir.path(), servers);
        Self { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn install_dir(&self, name: &str) -> PathBuf {
        self.root().join("servers").join(name)
    }
}

pub fn test_config(root: &Path, mut servers: Value) -> Config {
    if let Some(map) = servers.as_object_mut() {
        for (name, server) in map.iter_mut() {
            let install_dir = root.join("servers").join(name);
            std::fs::create_dir_all(&install_dir).expect("install dir");
            if server.get("install_dir").is_none() {
                server["install_dir"] = json!(install_dir);
            }
        }
    }

    let value = json!({
        "manager": {
            "state_file": root.join("state").join("server_state.json"),
            "backup_dir": root.join("backup"),
            "servers_root": root.join("servers"),
            "encryption_key_env": "GSM_RUNNER_TEST_KEY_UNSET",
            "timeouts": {
                "start_secs": 5,
                "startup_check_ms": 150,
                "stop_grace_secs": 2,
                "kill_wait_secs": 2,
                "lock_wait_secs": 10,
                "update_secs": 5,
                "backup_secs": 10
            },
            "scheduler": { "tick_secs": 60 },
            "monitor": { "check_interval_secs": 1, "max_consecutive_failures": 2 }
        },
        "server_paths": servers
    });
    Config::parse_from_str(&value.to_string()).expect("valid test config")
}

/// A server that stays up until signalled
pub fn sleeper() -> Value {
    json!({
        "app_id": "2394010",
        "executable": "sleep",
        "parameters": ["30"],
        "auto_update": false
    })
}

/// A server that exits with an error right after printing a line
pub fn crasher() -> Value {
    json!({
        "app_id": "896660",
        "executable": "sh",
        "parameters": ["-c", "echo 'bind failed: port in use'; exit 3"],
        "auto_restart": false
    })
}

/// A server that survives the startup check, then exits
pub fn short_lived() -> Value {
    json!({
        "app_id": "376030",
        "executable": "sh",
        "parameters": ["-c", "sleep 0.5; exit 1"],
        "auto_restart": false
    })
}
