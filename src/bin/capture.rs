use anyhow::Result;
use clap::{Parser, Subcommand};
use pg_query_stats::{Config, Monitor};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Captures pg_stat_statements into the query stats history")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture every reset domain once.
    Capture,
    /// Delete history older than the retention period.
    Clean,
    /// Capture on a fixed interval until interrupted.
    Run {
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let monitor = Monitor::new(Config::load()?)?;
    match args.command {
        Command::Capture => capture(&monitor).await,
        Command::Clean => {
            let deleted = monitor.clean_all().await?;
            info!(deleted, "cleaned query stats");
            Ok(())
        }
        Command::Run { interval_secs } => {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = capture(&monitor).await {
                            error!(error = %e, "capture cycle lost data");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
        }
    }
}

/// Fails only when a cycle lost data; skipped cycles are retried on the next run.
async fn capture(monitor: &Monitor) -> Result<()> {
    let mut lost = 0;
    for (id, result) in monitor.capture_all().await {
        match result {
            Ok(outcome) => info!(database = %id, ?outcome, "capture finished"),
            Err(e) if e.is_data_loss() => lost += 1,
            Err(_) => {}
        }
    }
    if lost > 0 {
        anyhow::bail!("{lost} reset domain(s) lost query stats after reset");
    }
    Ok(())
}
