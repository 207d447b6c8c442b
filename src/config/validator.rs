use crate::config::{Config, ServerConfig, is_valid_instance_id};
use crate::error::{Error, Result};
use chrono::NaiveTime;
use std::collections::HashMap;

/// Parses a `HH:MM` stop time.
pub fn parse_stop_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| Error::ConfigInvalid(format!("stop_time '{}' is not HH:MM", raw)))
}

/// Validates a server configuration
pub fn validate_server_config(name: &str, config: &ServerConfig) -> Result<()> {
    if config.app_id.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has empty app_id",
            name
        )));
    }

    if config.executable.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has empty executable",
            name
        )));
    }

    if let Some(stop_time) = config.stop_time.as_deref().filter(|s| !s.trim().is_empty()) {
        parse_stop_time(stop_time)
            .map_err(|e| Error::ConfigInvalid(format!("Server '{}': {}", name, e)))?;
    }

    if config.password.is_some() && config.username.is_none() {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has a password but no username",
            name
        )));
    }

    Ok(())
}

/// Validates a map of server configurations, including instance id uniqueness
pub fn validate_server_configs(config: &Config) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::new();

    for (name, server) in &config.servers {
        validate_server_config(name, server)?;

        if let Some(explicit) = server.instance_id.as_deref() {
            if !is_valid_instance_id(explicit.trim()) {
                return Err(Error::ConfigInvalid(format!(
                    "Server '{}' has instance_id '{}'; use letters, digits, '-' or '_'",
                    name, explicit
                )));
            }
        }

        let id = config.instance_id_of(name, server);
        if id.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "Server '{}' has no usable instance id",
                name
            )));
        }
        if let Some(other) = seen.insert(id.clone(), name) {
            return Err(Error::ConfigInvalid(format!(
                "Servers '{}' and '{}' share instance id '{}'",
                other, name, id
            )));
        }
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &Config) -> Result<()> {
    if !(1..=3650).contains(&config.log_retention_days) {
        return Err(Error::ConfigInvalid(format!(
            "log_retention_days must be between 1 and 3650, got {}",
            config.log_retention_days
        )));
    }

    let manager = &config.manager;
    if manager.update_command.program.trim().is_empty() {
        return Err(Error::ConfigInvalid(
            "update_command.program is empty".to_string(),
        ));
    }
    if manager.scheduler.tick_secs == 0 {
        return Err(Error::ConfigInvalid(
            "scheduler.tick_secs must be positive".to_string(),
        ));
    }
    if manager.monitor.check_interval_secs == 0 {
        return Err(Error::ConfigInvalid(
            "monitor.check_interval_secs must be positive".to_string(),
        ));
    }

    validate_server_configs(config)
}
