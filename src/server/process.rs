// src/server/process.rs
use crate::error::{Error, Result, SpawnFailure};
use async_process::{Child, Command, Stdio};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures_lite::io::{AsyncBufReadExt, AsyncRead, BufReader};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

/// Lines of output kept per process for error reporting
const TAIL_CAPACITY: usize = 256;

/// Lines buffered for the output stream before old ones are dropped
const STREAM_CAPACITY: usize = 1024;

/// Interval used when waiting on a process that is not our child
const PID_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Observed state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The process is running
    Alive,
    /// The process is gone; `code` is `None` when it was killed by a signal or
    /// was not our child
    Exited {
        /// Exit code
        code: Option<i32>,
    },
    /// The handle was recovered from a previous manager run and not yet reconciled
    Unknown,
}

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process exited within the grace period
    GracefulExit,
    /// The process had to be killed
    ForcedKill,
    /// The process was already gone
    AlreadyExited,
}

/// Everything needed to launch a process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Program to execute
    pub program: PathBuf,
    /// Arguments, in order
    pub args: Vec<String>,
    /// Working directory; must exist
    pub working_dir: PathBuf,
    /// Kill the process when the handle is dropped
    pub kill_on_drop: bool,
}

impl LaunchSpec {
    /// Creates a spec for a long-running process that outlives its handle.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
            kill_on_drop: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attachment {
    /// Spawned by this manager; we hold the `Child`
    Owned,
    /// Known only by pid from persisted state, not yet verified
    Orphaned,
    /// Known only by pid, verified during reconciliation
    Adopted,
}

/// A handle to one OS process
///
/// Handles are shared behind an `Arc`; every method takes `&self`.
pub struct ProcessHandle {
    pid: u32,
    program: PathBuf,
    started_at: DateTime<Utc>,
    attachment: Mutex<Attachment>,
    child: tokio::sync::Mutex<Option<Child>>,
    output: Mutex<Option<broadcast::Receiver<String>>>,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("attachment", &self.attachment())
            .finish()
    }
}

impl ProcessHandle {
    /// Spawns `executable` with `args` inside `working_dir`.
    pub fn spawn(executable: &Path, args: &[String], working_dir: &Path) -> Result<Self> {
        Self::spawn_with(LaunchSpec::new(executable, args.to_vec(), working_dir))
    }

    /// Spawns a process described by a [`LaunchSpec`].
    ///
    /// Stdout and stderr are drained in the background for the whole life of
    /// the process, so a server nobody listens to never blocks on a full pipe.
    #[tracing::instrument(skip(spec), fields(program = %spec.program.display()))]
    pub fn spawn_with(spec: LaunchSpec) -> Result<Self> {
        if !spec.working_dir.is_dir() {
            return Err(Error::Spawn {
                failure: SpawnFailure::WorkingDirInvalid,
                detail: format!("{} is not a directory", spec.working_dir.display()),
            });
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(spec.kill_on_drop);

        let mut child = command.spawn().map_err(|e| {
            tracing::error!(error = %e, "Failed to spawn process");
            Error::Spawn {
                failure: classify_spawn_error(&e),
                detail: format!("{}: {}", spec.program.display(), e),
            }
        })?;

        let pid = child.id();
        let (tx, rx) = broadcast::channel(STREAM_CAPACITY);
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_CAPACITY)));

        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, tx.clone(), Arc::clone(&tail));
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, tx.clone(), Arc::clone(&tail));
        }
        // The pumps own the only senders, so the stream ends when both pipes close.
        drop(tx);

        tracing::info!(pid, "Process spawned");
        Ok(Self {
            pid,
            program: spec.program,
            started_at: Utc::now(),
            attachment: Mutex::new(Attachment::Owned),
            child: tokio::sync::Mutex::new(Some(child)),
            output: Mutex::new(Some(rx)),
            tail,
        })
    }

    /// A handle for a pid recorded before the manager restarted.
    ///
    /// [`ProcessHandle::poll`] reports [`ProcessState::Unknown`] until the handle
    /// is adopted.
    pub fn orphaned(pid: u32, program: impl Into<PathBuf>) -> Self {
        Self::detached(pid, program.into(), Attachment::Orphaned)
    }

    /// A handle for a pid that was verified to belong to this server.
    pub fn adopted(pid: u32, program: impl Into<PathBuf>) -> Self {
        Self::detached(pid, program.into(), Attachment::Adopted)
    }

    fn detached(pid: u32, program: PathBuf, attachment: Attachment) -> Self {
        let (_, rx) = broadcast::channel(1);
        Self {
            pid,
            program,
            started_at: Utc::now(),
            attachment: Mutex::new(attachment),
            child: tokio::sync::Mutex::new(None),
            output: Mutex::new(Some(rx)),
            tail: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Program the process was started from
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// When this handle was created
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether this handle still waits for reconciliation
    pub fn is_orphaned(&self) -> bool {
        self.attachment() == Attachment::Orphaned
    }

    /// Marks an orphaned handle as verified.
    pub(crate) fn adopt(&self) {
        if let Ok(mut attachment) = self.attachment.lock() {
            if *attachment == Attachment::Orphaned {
                *attachment = Attachment::Adopted;
            }
        }
    }

    fn attachment(&self) -> Attachment {
        self.attachment
            .lock()
            .map(|a| *a)
            .unwrap_or(Attachment::Orphaned)
    }

    /// Checks whether the process is still alive without blocking.
    pub async fn poll(&self) -> ProcessState {
        match self.attachment() {
            Attachment::Orphaned => ProcessState::Unknown,
            Attachment::Adopted => {
                if pid_exists(self.pid) {
                    ProcessState::Alive
                } else {
                    ProcessState::Exited { code: None }
                }
            }
            Attachment::Owned => {
                let mut guard = self.child.lock().await;
                let Some(child) = guard.as_mut() else {
                    return ProcessState::Exited { code: None };
                };
                match child.try_status() {
                    Ok(None) => ProcessState::Alive,
                    Ok(Some(status)) => ProcessState::Exited {
                        code: status.code(),
                    },
                    Err(e) => {
                        tracing::warn!(pid = self.pid, error = %e, "Failed to poll process");
                        ProcessState::Unknown
                    }
                }
            }
        }
    }

    /// Waits for the process to exit and returns its exit code.
    pub async fn wait(&self) -> Result<Option<i32>> {
        if self.attachment() == Attachment::Owned {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                let status = child
                    .status()
                    .await
                    .map_err(|e| Error::Process(format!("Failed to wait for process: {}", e)))?;
                return Ok(status.code());
            }
            return Ok(None);
        }

        while pid_exists(self.pid) {
            time::sleep(PID_POLL_INTERVAL).await;
        }
        Ok(None)
    }

    /// Asks the process to exit, escalating to a forced kill after `grace_period`.
    ///
    /// Resolves only once the process is gone. Callers bound the total wait.
    #[tracing::instrument(skip(self), fields(pid = self.pid))]
    pub async fn signal_stop(&self, grace_period: Duration) -> Result<StopOutcome> {
        let outcome = if self.attachment() == Attachment::Owned {
            self.stop_child(grace_period).await?
        } else {
            self.stop_by_pid(grace_period).await?
        };
        tracing::info!(?outcome, "Process stopped");
        Ok(outcome)
    }

    async fn stop_child(&self, grace_period: Duration) -> Result<StopOutcome> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(StopOutcome::AlreadyExited);
        };

        if let Ok(Some(_)) = child.try_status() {
            return Ok(StopOutcome::AlreadyExited);
        }

        #[cfg(unix)]
        {
            match send_terminate(self.pid) {
                Ok(true) => {
                    if let Ok(status) = time::timeout(grace_period, child.status()).await {
                        status.map_err(|e| {
                            Error::Process(format!("Failed to wait for process: {}", e))
                        })?;
                        return Ok(StopOutcome::GracefulExit);
                    }
                    tracing::warn!("Grace period elapsed, killing process");
                }
                Ok(false) => {
                    if let Err(e) = child.status().await {
                        tracing::debug!(error = %e, "Failed to reap exited process");
                    }
                    return Ok(StopOutcome::AlreadyExited);
                }
                Err(e) => return Err(e),
            }
        }

        #[cfg(not(unix))]
        let _ = grace_period;

        if let Err(e) = child.kill() {
            if let Ok(Some(_)) = child.try_status() {
                return Ok(StopOutcome::GracefulExit);
            }
            return Err(Error::Process(format!("Failed to kill process: {}", e)));
        }
        child
            .status()
            .await
            .map_err(|e| Error::Process(format!("Failed to wait for process: {}", e)))?;
        Ok(StopOutcome::ForcedKill)
    }

    async fn stop_by_pid(&self, grace_period: Duration) -> Result<StopOutcome> {
        if !pid_exists(self.pid) {
            return Ok(StopOutcome::AlreadyExited);
        }

        #[cfg(unix)]
        {
            if !send_terminate(self.pid)? {
                return Ok(StopOutcome::AlreadyExited);
            }
            let deadline = Instant::now() + grace_period;
            while Instant::now() < deadline {
                time::sleep(PID_POLL_INTERVAL).await;
                if !pid_exists(self.pid) {
                    return Ok(StopOutcome::GracefulExit);
                }
            }
            send_kill(self.pid)?;
        }

        #[cfg(not(unix))]
        {
            let _ = (grace_period, Instant::now());
            kill_foreign(self.pid)?;
        }

        while pid_exists(self.pid) {
            time::sleep(PID_POLL_INTERVAL).await;
        }
        Ok(StopOutcome::ForcedKill)
    }

    /// Takes the lazy stream of output lines.
    ///
    /// The stream yields stdout and stderr lines as they arrive and ends when the
    /// process closes its pipes. It can be taken once per handle.
    pub fn stream_output(&self) -> Result<BoxStream<'static, String>> {
        let mut rx = self
            .output
            .lock()
            .map_err(|_| Error::Other("Failed to lock output receiver".to_string()))?
            .take()
            .ok_or_else(|| Error::Process("Output stream already taken".to_string()))?;

        let pid = self.pid;
        Ok(Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(line) => yield line,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(pid, skipped, "Output stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    /// The last `lines` lines of output, oldest first.
    pub fn output_tail(&self, lines: usize) -> Vec<String> {
        let Ok(tail) = self.tail.lock() else {
            return Vec::new();
        };
        let skip = tail.len().saturating_sub(lines);
        tail.iter().skip(skip).cloned().collect()
    }
}

fn pump_lines<R>(reader: R, tx: broadcast::Sender<String>, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() >= TAIL_CAPACITY {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                    }
                    // No receiver is fine: output is also kept in the tail.
                    let _ = tx.send(line);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Output pipe closed with error");
                    break;
                }
            }
        }
    });
}

fn classify_spawn_error(e: &io::Error) -> SpawnFailure {
    match e.kind() {
        io::ErrorKind::NotFound => SpawnFailure::BinaryMissing,
        io::ErrorKind::PermissionDenied => SpawnFailure::PermissionDenied,
        _ => SpawnFailure::Other,
    }
}

/// Sends SIGTERM; `Ok(false)` means the process was already gone.
#[cfg(unix)]
fn send_terminate(pid: u32) -> Result<bool> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn send_kill(pid: u32) -> Result<bool> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<bool> {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| Error::Process(format!("pid {} out of range", pid)))?;
    match nix::sys::signal::kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(Error::Process(format!(
            "Failed to send {} to {}: {}",
            signal, pid, e
        ))),
    }
}

#[cfg(not(unix))]
fn kill_foreign(pid: u32) -> Result<()> {
    let mut system = sysinfo::System::new();
    let target = sysinfo::Pid::from_u32(pid);
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[target]), true);
    if let Some(process) = system.process(target) {
        if !process.kill() {
            return Err(Error::Process(format!("Failed to kill process {}", pid)));
        }
    }
    Ok(())
}

/// Checks whether a pid exists, without verifying what it runs.
#[cfg(unix)]
pub fn pid_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // Exists, but owned by someone else
        Err(_) => true,
    }
}

/// Checks whether a pid exists, without verifying what it runs.
#[cfg(not(unix))]
pub fn pid_exists(pid: u32) -> bool {
    let mut system = sysinfo::System::new();
    let target = sysinfo::Pid::from_u32(pid);
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[target]), true);
    system.process(target).is_some()
}
