//! Configuration module for GSM Runner.
//!
//! This module handles parsing, validation, and access to configuration
//! settings for the manager and its game servers. Configuration is loaded once
//! at startup, validated in full, and then handed by reference to the
//! components that need it.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use gsm_runner::config::Config;
//!
//! let config = Config::from_file("server_config.json").unwrap();
//! println!("Loaded configuration with {} servers", config.servers.len());
//! ```
//!
//! Creating a configuration programmatically:
//! ```
//! use gsm_runner::config::{Config, ServerConfig};
//!
//! let mut config = Config::default();
//! let mut server = ServerConfig::new("896660", "valheim_server.x86_64");
//! server.stop_time = Some("05:30".to_string());
//! config.servers.insert("Valheim".to_string(), server);
//!
//! gsm_runner::config::validate_config(&config).unwrap();
//! ```
mod parser;
pub mod validator;

pub use parser::{
    Config, ManagerSettings, MonitorConfig, SchedulerConfig, ServerConfig, TimeoutConfig,
    UpdateCommandConfig, is_valid_instance_id, sanitize_instance_id,
};
pub use validator::{parse_stop_time, validate_config};
