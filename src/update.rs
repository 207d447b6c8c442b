//! Package-fetch seam used by the `update` operation.
//!
//! The lifecycle engine never installs anything itself. It hands a
//! [`FetchRequest`] to a [`PackageFetcher`] and only looks at the exit code and
//! a bounded tail of output. [`CommandFetcher`] runs an external tool
//! (steamcmd by default) described by [`UpdateCommandConfig`].

use crate::config::UpdateCommandConfig;
use crate::error::{Error, Result};
use crate::server::InstanceId;
use crate::server::process::{LaunchSpec, ProcessHandle};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Receives each output line of the fetch command as it arrives.
pub type OutputSink = Arc<dyn Fn(String) + Send + Sync>;

/// Login handed to the fetch tool; the password is already decrypted.
#[derive(Clone)]
pub struct Login {
    /// Account name
    pub username: String,
    /// Plaintext password, if the account needs one
    pub password: Option<String>,
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// What to install and where
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Instance being updated
    pub instance_id: InstanceId,
    /// External package identifier
    pub app_id: String,
    /// Install directory
    pub install_dir: PathBuf,
    /// `None` means anonymous login
    pub login: Option<Login>,
}

/// Result of one fetch run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Exit code; `None` when the tool was killed by a signal
    pub exit_code: Option<i32>,
    /// Last lines of output, oldest first
    pub tail: Vec<String>,
    /// Wall time of the run
    pub duration: Duration,
}

impl FetchOutcome {
    /// Whether the tool reported success
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Converts a failed run into [`Error::UpdateFailed`], prefixing the tail
    /// with a diagnosis when a known failure phrase appears in it.
    pub fn into_error(self) -> Error {
        let output = self.tail.join("\n");
        let tail = match diagnose(&output) {
            Some(diagnosis) => format!("{}\n{}", diagnosis, output),
            None => output,
        };
        Error::UpdateFailed {
            exit_code: self.exit_code,
            tail,
        }
    }
}

/// Installs or updates server files.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Runs one fetch, streaming output lines into `sink`.
    ///
    /// Dropping the returned future must stop the underlying work.
    async fn fetch(&self, request: &FetchRequest, sink: OutputSink) -> Result<FetchOutcome>;
}

const DIAGNOSES: &[(&str, &str)] = &[
    ("No subscription", "Account does not own a license for this app"),
    ("Steam Guard", "Two-factor code required or expired"),
    ("Invalid Password", "Invalid login credentials"),
    ("Not logged in", "Login failed"),
    ("0x202", "Connection problem"),
    ("App not released", "App is not available"),
    ("Invalid platform", "Wrong platform for this app"),
    ("missing dependency", "Missing dependencies"),
    ("Access Denied", "Access denied"),
    ("Disk write failure", "Disk write failure, check free space"),
];

/// Maps a known failure phrase in the tool output to a readable reason.
pub fn diagnose(output: &str) -> Option<&'static str> {
    DIAGNOSES
        .iter()
        .find(|(phrase, _)| output.contains(phrase))
        .map(|(_, reason)| *reason)
}

/// [`PackageFetcher`] that runs an external command
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    config: UpdateCommandConfig,
}

impl CommandFetcher {
    /// Creates a fetcher from the configured invocation.
    pub fn new(config: UpdateCommandConfig) -> Self {
        Self { config }
    }

    /// Expands the argument template for `request`.
    ///
    /// `{install_dir}`, `{app_id}` and `{instance_id}` are replaced anywhere in
    /// an argument; an argument that is exactly `{login}` becomes the username
    /// and password, or `anonymous`.
    pub fn command_args(&self, request: &FetchRequest) -> Vec<String> {
        let install_dir = request.install_dir.display().to_string();
        let mut args = Vec::with_capacity(self.config.args.len() + 1);

        for arg in &self.config.args {
            if arg == "{login}" {
                match &request.login {
                    Some(login) => {
                        args.push(login.username.clone());
                        if let Some(password) = &login.password {
                            args.push(password.clone());
                        }
                    }
                    None => args.push("anonymous".to_string()),
                }
                continue;
            }
            args.push(
                arg.replace("{install_dir}", &install_dir)
                    .replace("{app_id}", &request.app_id)
                    .replace("{instance_id}", request.instance_id.as_str()),
            );
        }
        args
    }

    fn program(&self) -> Result<PathBuf> {
        let program = PathBuf::from(&self.config.program);
        if program.is_relative() && program.components().count() > 1 {
            return Ok(std::env::current_dir()?.join(program));
        }
        Ok(program)
    }
}

#[async_trait]
impl PackageFetcher for CommandFetcher {
    #[tracing::instrument(skip(self, request, sink), fields(instance_id = %request.instance_id, app_id = %request.app_id))]
    async fn fetch(&self, request: &FetchRequest, sink: OutputSink) -> Result<FetchOutcome> {
        let started = Instant::now();
        std::fs::create_dir_all(&request.install_dir).map_err(|e| {
            Error::Io(format!(
                "Failed to create install directory {}: {}",
                request.install_dir.display(),
                e
            ))
        })?;

        let working_dir = match &self.config.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let spec = LaunchSpec {
            program: self.program()?,
            args: self.command_args(request),
            working_dir,
            kill_on_drop: true,
        };
        tracing::info!(program = %spec.program.display(), "Running package fetch");

        let handle = ProcessHandle::spawn_with(spec)?;
        let mut output = handle.stream_output()?;
        let capacity = self.config.tail_lines.max(1);
        let mut tail = VecDeque::with_capacity(capacity);

        while let Some(line) = output.next().await {
            sink(line.clone());
            if tail.len() == capacity {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let exit_code = handle.wait().await?;
        let duration = started.elapsed();
        tracing::info!(?exit_code, duration_secs = duration.as_secs_f32(), "Package fetch finished");

        Ok(FetchOutcome {
            exit_code,
            tail: tail.into(),
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(login: Option<Login>) -> FetchRequest {
        FetchRequest {
            instance_id: "palworld-main".into(),
            app_id: "2394010".to_string(),
            install_dir: PathBuf::from("/srv/palworld"),
            login,
        }
    }

    #[test]
    fn anonymous_login_by_default() {
        let fetcher = CommandFetcher::new(UpdateCommandConfig::default());
        assert_eq!(
            fetcher.command_args(&request(None)),
            vec![
                "+force_install_dir",
                "/srv/palworld",
                "+login",
                "anonymous",
                "+app_update",
                "2394010",
                "validate",
                "+quit"
            ]
        );
    }

    #[test]
    fn login_expands_to_user_and_password() {
        let fetcher = CommandFetcher::new(UpdateCommandConfig::default());
        let args = fetcher.command_args(&request(Some(Login {
            username: "gsm".to_string(),
            password: Some("pw".to_string()),
        })));
        assert_eq!(&args[2..5], ["+login", "gsm", "pw"]);
    }

    #[test]
    fn login_debug_hides_password() {
        let login = Login {
            username: "gsm".to_string(),
            password: Some("hunter2".to_string()),
        };
        assert!(!format!("{:?}", login).contains("hunter2"));
    }

    #[test]
    fn failure_is_diagnosed_from_tail() {
        let outcome = FetchOutcome {
            exit_code: Some(5),
            tail: vec!["Logging in...".to_string(), "FAILED (Invalid Password)".to_string()],
            duration: Duration::from_secs(1),
        };
        match outcome.into_error() {
            Error::UpdateFailed { exit_code, tail } => {
                assert_eq!(exit_code, Some(5));
                assert!(tail.starts_with("Invalid login credentials"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn command_fetcher_streams_output_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpdateCommandConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo fetching {app_id}; echo done; exit 3".to_string(),
            ],
            working_dir: Some(dir.path().to_path_buf()),
            tail_lines: 1,
        };
        let fetcher = CommandFetcher::new(config);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: OutputSink = Arc::new(move |line| sink_seen.lock().unwrap().push(line));

        let mut req = request(None);
        req.install_dir = dir.path().join("files");
        let outcome = fetcher.fetch(&req, sink).await.unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.tail, vec!["done"]);
        assert_eq!(*seen.lock().unwrap(), vec!["fetching 2394010", "done"]);
        assert!(req.install_dir.is_dir());
    }
}
