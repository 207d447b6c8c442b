#![cfg(unix)]

mod common;

use common::{TestEnv, short_lived, sleeper};
use gsm_runner::error::Result;
use gsm_runner::server::{
    Actor, EventBus, InstanceId, LifecycleEngine, Operation, OperationOutcome, ServerHealth,
    ServerMonitor, ServerRegistry, ServerStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn monitored(env: &TestEnv) -> Result<(Arc<LifecycleEngine>, ServerMonitor)> {
    let registry = Arc::new(ServerRegistry::open(&env.config)?);
    let engine = Arc::new(LifecycleEngine::new(
        registry,
        Arc::new(EventBus::default()),
        &env.config.manager,
    ));
    let monitor = ServerMonitor::new(Arc::clone(&engine), env.config.manager.monitor.clone());
    Ok((engine, monitor))
}

#[tokio::test]
async fn test_running_server_is_healthy() -> Result<()> {
    let env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    let (engine, monitor) = monitored(&env)?;
    let id = InstanceId::from("sleeper");

    assert_eq!(monitor.get_health(&id)?, ServerHealth::Unknown);

    engine.start(&id, Actor::System).await?;
    assert_eq!(monitor.check_health(&id).await?, ServerHealth::Healthy);
    assert!(monitor.last_checked(&id).is_some());
    assert_eq!(monitor.failure_count(&id), 0);

    engine.stop(&id, Actor::System).await?;
    assert_eq!(monitor.check_health(&id).await?, ServerHealth::Unknown);
    Ok(())
}

#[tokio::test]
async fn test_crash_moves_server_to_error() -> Result<()> {
    let env = TestEnv::new(json!({ "Flaky": short_lived() }));
    let (engine, monitor) = monitored(&env)?;
    let id = InstanceId::from("flaky");

    engine.start(&id, Actor::System).await?;
    let mut events = engine.events().subscribe();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(monitor.check_health(&id).await?, ServerHealth::Unhealthy);
    let record = engine.registry().get(&id)?;
    assert_eq!(record.status, ServerStatus::Error);
    assert!(
        record
            .last_error
            .expect("error recorded")
            .contains("exited unexpectedly")
    );
    assert!(!record.process_attached);

    let event = events.recv().await.expect("crash event");
    assert_eq!(event.operation, Operation::CrashDetected);
    assert_eq!(event.outcome, OperationOutcome::Failed);
    assert_eq!(event.actor, Actor::Monitor);
    assert_eq!(event.from, ServerStatus::Running);
    assert_eq!(event.to, ServerStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_crash_with_auto_restart_recovers() -> Result<()> {
    let mut server = short_lived();
    server["auto_restart"] = json!(true);
    let env = TestEnv::new(json!({ "Flaky": server }));
    let (engine, monitor) = monitored(&env)?;
    let id = InstanceId::from("flaky");

    engine.start(&id, Actor::System).await?;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(monitor.check_health(&id).await?, ServerHealth::Healthy);
    assert_eq!(monitor.failure_count(&id), 1);
    assert_eq!(engine.registry().get(&id)?.status, ServerStatus::Running);

    let history = engine.events().instance_events(&id, Some(3))?;
    assert_eq!(history[0].operation, Operation::Start);
    assert_eq!(history[0].actor, Actor::Monitor);
    assert_eq!(history[1].operation, Operation::Reset);
    assert_eq!(history[2].operation, Operation::CrashDetected);
    Ok(())
}

#[tokio::test]
async fn test_monitor_loop_starts_and_stops() -> Result<()> {
    let env = TestEnv::new(json!({ "Sleeper": sleeper() }));
    let (_engine, mut monitor) = monitored(&env)?;

    monitor.start()?;
    assert!(monitor.is_running());
    tokio::time::sleep(Duration::from_millis(50)).await;

    monitor.stop().await?;
    assert!(!monitor.is_running());
    Ok(())
}
