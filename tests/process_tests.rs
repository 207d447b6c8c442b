#![cfg(unix)]

use futures::StreamExt;
use gsm_runner::error::{Error, Result, SpawnFailure};
use gsm_runner::server::process::pid_exists;
use gsm_runner::server::{ProcessHandle, ProcessState, StopOutcome};
use std::path::Path;
use std::time::Duration;

fn sh(script: &str, dir: &Path) -> Result<ProcessHandle> {
    ProcessHandle::spawn(
        Path::new("sh"),
        &["-c".to_string(), script.to_string()],
        dir,
    )
}

#[tokio::test]
async fn test_output_and_exit_code() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = sh("echo 'Server listening on 8211'; echo 'warn: low memory' >&2; exit 7", dir.path())?;

    let mut lines: Vec<String> = handle.stream_output()?.collect().await;
    lines.sort();
    assert_eq!(lines, vec!["Server listening on 8211", "warn: low memory"]);

    assert_eq!(handle.wait().await?, Some(7));
    assert_eq!(handle.poll().await, ProcessState::Exited { code: Some(7) });
    assert_eq!(handle.output_tail(1).len(), 1);
    assert_eq!(handle.output_tail(10).len(), 2);

    // The stream can only be taken once
    assert!(matches!(handle.stream_output(), Err(Error::Process(_))));
    Ok(())
}

#[tokio::test]
async fn test_graceful_stop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = ProcessHandle::spawn(Path::new("sleep"), &["30".to_string()], dir.path())?;
    assert_eq!(handle.poll().await, ProcessState::Alive);
    assert!(pid_exists(handle.pid()));

    let outcome = handle.signal_stop(Duration::from_secs(5)).await?;
    assert_eq!(outcome, StopOutcome::GracefulExit);
    assert!(matches!(handle.poll().await, ProcessState::Exited { .. }));

    // Stopping again is harmless
    let again = handle.signal_stop(Duration::from_secs(1)).await?;
    assert_eq!(again, StopOutcome::AlreadyExited);
    Ok(())
}

#[tokio::test]
async fn test_ignored_terminate_escalates_to_kill() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = sh("trap '' TERM; exec sleep 30", dir.path())?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = handle.signal_stop(Duration::from_millis(300)).await?;
    assert_eq!(outcome, StopOutcome::ForcedKill);
    Ok(())
}

#[test]
fn test_missing_binary_is_classified() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let result = ProcessHandle::spawn(&dir.path().join("PalServer.sh"), &[], dir.path());
    assert!(matches!(
        result,
        Err(Error::Spawn {
            failure: SpawnFailure::BinaryMissing,
            ..
        })
    ));
    Ok(())
}

#[test]
fn test_non_executable_is_classified() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = dir.path().join("start.sh");
    std::fs::write(&script, "#!/bin/sh\necho hi\n")?;

    let result = ProcessHandle::spawn(&script, &[], dir.path());
    assert!(matches!(
        result,
        Err(Error::Spawn {
            failure: SpawnFailure::PermissionDenied,
            ..
        })
    ));
    Ok(())
}
