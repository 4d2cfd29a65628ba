mod assets;
mod cli;
mod config;
mod csv_rows;
mod error;
mod handoff;
mod health;
mod logging;
mod matcher;
mod orchestrator;
mod reconcile;
mod stability;
mod staging;
mod state_machine;
mod store;
mod ui;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command};
use config::EngineConfig;
use logging::{LogConfig, init_logging};
use orchestrator::{ScanContext, ScanOrchestrator};
use store::{EventLog, FileJobStore, JobStore, JsonlEventLog, StaticMachines};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;

    init_logging(LogConfig {
        verbose: cli.verbose,
        file: Some(config.log_path()),
    })?;

    let store = Arc::new(
        FileJobStore::open(config.jobs_path())
            .await
            .with_context(|| format!("failed to open job store {}", config.jobs_path().display()))?,
    );
    let events = Arc::new(JsonlEventLog::new(config.events_path()));

    match cli.command {
        Command::Status { status } => {
            let mut jobs = match status {
                Some(s) => store.list_by_status(s).await?,
                None => store.list().await?,
            };
            jobs.sort_by(|a, b| a.key.cmp(&b.key));
            ui::print_jobs(&jobs);
        }
        Command::Events { key } => {
            let history = events.for_job(&key).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Command::Stage { key, machine } => {
            let orch = build(config, store, events);
            let outcome = orch
                .stage_job(&key, machine)
                .await
                .with_context(|| format!("failed to stage {key}"))?;
            ui::print_stage(&key, &outcome);
            ui::print_health(&orch.context().health.snapshot());
        }
        Command::Once => {
            let orch = build(config, store, events);
            let progress = ui::CycleProgress::start("Scanning watched roots...");
            let results = orch.run_once().await;
            progress.finish();
            let results = results?;
            ui::print_cycle_summary(&results);
            ui::print_health(&orch.context().health.snapshot());
        }
        Command::Run => {
            let orch = build(config, store, events);
            let loops = orch.start().await?;
            if loops == 0 {
                anyhow::bail!("nothing to watch: configure processed_jobs_root, status_root or machines");
            }
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            tracing::info!("Shutdown requested");
            orch.shutdown().await;
        }
    }

    Ok(())
}

fn build(config: EngineConfig, store: Arc<dyn JobStore>, events: Arc<dyn EventLog>) -> ScanOrchestrator {
    let machines = Arc::new(StaticMachines::new(config.machines.clone()));
    ScanOrchestrator::new(Arc::new(ScanContext::new(config, store, events, machines)))
}
