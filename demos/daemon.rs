use gsm_runner::GsmRunner;
use gsm_runner::error::Result;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG selects the level, e.g. RUST_LOG=gsm_runner=debug
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    tracing::info!("Starting daemon example");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/config.json".to_string());
    let mut runner = GsmRunner::from_config_file(&config_path)?;

    // Records left Running by a previous manager are matched against the OS
    for report in runner.recover_state().await? {
        println!(
            "Reconciled {}: {} -> {} ({})",
            report.instance_id,
            report.from,
            report.to,
            report.note.as_deref().unwrap_or("process verified")
        );
    }

    println!("Configured servers:");
    for server in runner.list()? {
        let stop_time = server
            .stop_time
            .map(|t| t.format("%H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "- {} ({}): {} [daily stop {}]",
            server.name, server.instance_id, server.status, stop_time
        );
    }

    runner.start_scheduler();
    runner.start_monitor()?;

    let mut events = runner.subscribe_events();
    let mut output = runner.subscribe_output();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Ctrl-C received, stopping servers...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!(
                    "[{}] {} {} {:?}: {} -> {}",
                    event.timestamp.format("%H:%M:%S"),
                    event.instance_id,
                    event.operation,
                    event.outcome,
                    event.from,
                    event.to
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event subscriber lagged");
                }
                Err(_) => break,
            },
            line = output.recv() => {
                if let Ok(line) = line {
                    println!("{} | {}", line.instance_id, line.line);
                }
            }
        }
    }

    runner.shutdown().await?;
    println!("Daemon stopped");
    Ok(())
}
