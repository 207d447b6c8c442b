#![cfg(unix)]

mod common;

use common::{TestEnv, crasher, sleeper};
use gsm_runner::config::Config;
use gsm_runner::error::{Error, Result};
use gsm_runner::server::{
    Actor, EventBus, InstanceId, InstancePatch, LifecycleEngine, Operation, OperationOutcome,
    ServerRegistry, ServerStatus,
};
use serde_json::json;
use std::sync::Arc;

fn engine_for(config: &Config) -> Result<Arc<LifecycleEngine>> {
    let registry = Arc::new(ServerRegistry::open(config)?);
    let events = Arc::new(EventBus::default());
    Ok(Arc::new(LifecycleEngine::new(
        registry,
        events,
        &config.manager,
    )))
}

fn user() -> Actor {
    Actor::User {
        principal: "alice".to_string(),
        role: "admin".to_string(),
    }
}

#[tokio::test]
async fn test_start_then_stop() -> Result<()> {
    let env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    let engine = engine_for(&env.config)?;
    let id = InstanceId::from("sleeper");
    let mut events = engine.events().subscribe();

    let started = engine.start(&id, user()).await?;
    assert_eq!(started.status_after, ServerStatus::Running);

    let record = engine.registry().get(&id)?;
    assert_eq!(record.status, ServerStatus::Running);
    assert!(record.process_attached);
    assert!(record.pid.is_some());

    let stopped = engine.stop(&id, user()).await?;
    assert_eq!(stopped.status_after, ServerStatus::Stopped);

    let record = engine.registry().get(&id)?;
    assert_eq!(record.status, ServerStatus::Stopped);
    assert!(!record.process_attached);
    assert!(record.pid.is_none());
    assert!(engine.registry().process(&id).is_none());

    let start_event = events.recv().await.expect("start event");
    assert_eq!(start_event.operation, Operation::Start);
    assert_eq!(start_event.outcome, OperationOutcome::Succeeded);
    assert_eq!(start_event.from, ServerStatus::Stopped);
    assert_eq!(start_event.to, ServerStatus::Running);
    assert_eq!(start_event.actor, user());

    let stop_event = events.recv().await.expect("stop event");
    assert_eq!(stop_event.operation, Operation::Stop);
    assert_eq!(stop_event.to, ServerStatus::Stopped);

    Ok(())
}

#[tokio::test]
async fn test_stop_kills_server_that_ignores_terminate() -> Result<()> {
    let env = TestEnv::new(json!({
        "Stubborn": {
            "app_id": "896660",
            "executable": "sh",
            "parameters": ["-c", "trap '' TERM; exec sleep 30"],
            "auto_restart": false
        }
    }));
    let engine = engine_for(&env.config)?;
    let id = InstanceId::from("stubborn");

    engine.start(&id, user()).await?;
    let pid = engine.registry().get(&id)?.pid.expect("pid recorded");

    let stopped = engine.stop(&id, user()).await?;
    assert_eq!(stopped.status_after, ServerStatus::Stopped);

    let record = engine.registry().get(&id)?;
    assert_eq!(record.status, ServerStatus::Stopped);
    assert!(!record.process_attached);
    assert!(record.pid.is_none());
    assert!(!gsm_runner::server::process::pid_exists(pid));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_starts_run_once() -> Result<()> {
    let env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    let engine = engine_for(&env.config)?;
    let id = InstanceId::from("sleeper");

    let (first, second) = tokio::join!(engine.start(&id, user()), engine.start(&id, user()));

    let results = [first, second];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    let rejected = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one start is rejected");
    assert!(matches!(
        rejected,
        Error::InvalidState {
            status: ServerStatus::Running,
            ..
        }
    ));

    // One successful start leaves exactly one event
    let history = engine.events().instance_events(&id, None)?;
    assert_eq!(history.len(), 1);

    engine.stop(&id, Actor::System).await?;
    Ok(())
}

#[tokio::test]
async fn test_update_rejected_while_running() -> Result<()> {
    let env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    let engine = engine_for(&env.config)?;
    let id = InstanceId::from("sleeper");

    engine.start(&id, user()).await?;
    let result = engine.update(&id, user()).await;

    match result {
        Err(Error::InvalidState {
            operation, status, ..
        }) => {
            assert_eq!(operation, "update");
            assert_eq!(status, ServerStatus::Running);
        }
        other => panic!("Expected InvalidState, got {:?}", other),
    }
    assert_eq!(engine.registry().get(&id)?.status, ServerStatus::Running);

    engine.stop(&id, user()).await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_requires_running() -> Result<()> {
    let env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    let engine = engine_for(&env.config)?;
    let id = InstanceId::from("sleeper");
    let events = engine.events().subscribe();

    let result = engine.stop(&id, user()).await;
    assert!(matches!(result, Err(Error::InvalidState { .. })));
    assert_eq!(engine.registry().get(&id)?.status, ServerStatus::Stopped);

    // Rejections do not publish events
    assert!(events.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() -> Result<()> {
    let env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    let engine = engine_for(&env.config)?;

    let result = engine.start(&InstanceId::from("nope"), user()).await;
    assert!(matches!(result, Err(Error::ServerNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_startup_failure_moves_to_error_and_reset_clears_it() -> Result<()> {
    let env = TestEnv::new(json!({ "Crasher": crasher() }));
    let engine = engine_for(&env.config)?;
    let id = InstanceId::from("crasher");

    let result = engine.start(&id, user()).await;
    assert!(matches!(result, Err(Error::Process(_))));

    let record = engine.registry().get(&id)?;
    assert_eq!(record.status, ServerStatus::Error);
    let last_error = record.last_error.expect("error recorded");
    assert!(last_error.contains("exited during startup check"));
    assert!(!record.process_attached);

    // Error only leaves through reset
    let retry = engine.start(&id, user()).await;
    assert!(matches!(
        retry,
        Err(Error::InvalidState {
            status: ServerStatus::Error,
            ..
        })
    ));

    let reset = engine.reset(&id, user()).await?;
    assert_eq!(reset.status_after, ServerStatus::Stopped);
    let record = engine.registry().get(&id)?;
    assert!(record.last_error.is_none());

    let history = engine.events().instance_events(&id, None)?;
    assert_eq!(history[0].operation, Operation::Reset);
    assert_eq!(history[1].operation, Operation::Start);
    assert_eq!(history[1].outcome, OperationOutcome::Failed);

    Ok(())
}

#[tokio::test]
async fn test_missing_executable_is_a_spawn_error() -> Result<()> {
    let env = TestEnv::new(json!({
        "Broken": { "app_id": "1", "executable": "./does-not-exist.sh" }
    }));
    let engine = engine_for(&env.config)?;
    let id = InstanceId::from("broken");

    let result = engine.start(&id, user()).await;
    assert!(matches!(result, Err(Error::Spawn { .. })));
    assert_eq!(engine.registry().get(&id)?.status, ServerStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_restart_from_running_and_stopped() -> Result<()> {
    let env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    let engine = engine_for(&env.config)?;
    let id = InstanceId::from("sleeper");

    engine.restart(&id, user()).await?;
    let first_pid = engine.registry().get(&id)?.pid;
    assert!(first_pid.is_some());

    let restarted = engine.restart(&id, user()).await?;
    assert_eq!(restarted.status_after, ServerStatus::Running);
    let second_pid = engine.registry().get(&id)?.pid;
    assert_ne!(first_pid, second_pid);

    engine.stop(&id, user()).await?;
    Ok(())
}

#[tokio::test]
async fn test_cancel_without_operation_returns_false() -> Result<()> {
    let env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    let engine = engine_for(&env.config)?;

    assert!(!engine.cancel(&InstanceId::from("sleeper")));
    Ok(())
}

#[tokio::test]
async fn test_servers_run_independently() -> Result<()> {
    let env = TestEnv::new(json!({ "Alpha": sleeper(), "Beta": sleeper() }));
    let engine = engine_for(&env.config)?;
    let alpha = InstanceId::from("alpha");
    let beta = InstanceId::from("beta");

    let (a, b) = tokio::join!(engine.start(&alpha, user()), engine.start(&beta, user()));
    a?;
    b?;
    assert_eq!(engine.registry().get(&alpha)?.status, ServerStatus::Running);
    assert_eq!(engine.registry().get(&beta)?.status, ServerStatus::Running);

    let (a, b) = tokio::join!(engine.stop(&alpha, user()), engine.stop(&beta, user()));
    a?;
    b?;
    Ok(())
}

#[tokio::test]
async fn test_busy_instance_reports_holder() -> Result<()> {
    let mut env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    env.config.manager.timeouts.lock_wait_secs = 1;
    let engine = engine_for(&env.config)?;
    let id = InstanceId::from("sleeper");

    let _held = engine
        .locks()
        .acquire(&id, "backup", std::time::Duration::from_secs(1))
        .await?;

    let result = engine.start(&id, user()).await;
    match result {
        Err(e @ Error::Busy { .. }) => {
            assert!(e.is_retryable());
            assert!(e.to_string().contains("busy with backup"));
        }
        other => panic!("Expected Busy, got {:?}", other),
    }
    assert_eq!(engine.registry().get(&id)?.status, ServerStatus::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_recover_reports_itself_and_publishes_both_legs() -> Result<()> {
    let env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    let engine = engine_for(&env.config)?;
    let id = InstanceId::from("sleeper");
    engine.registry().upsert(
        &id,
        InstancePatch::status(ServerStatus::Error).with_error("bind failed"),
    )?;

    let report = engine.recover(&id, user()).await?;
    assert_eq!(report.operation, Operation::Recover);
    assert_eq!(report.status_after, ServerStatus::Running);
    assert_eq!(report.message, "Server recovered");

    let history = engine.events().instance_events(&id, None)?;
    assert_eq!(history[0].operation, Operation::Start);
    assert_eq!(history[1].operation, Operation::Reset);

    engine.stop(&id, user()).await?;
    Ok(())
}
