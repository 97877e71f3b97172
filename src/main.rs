mod cli;
mod config;
mod dispatch;
mod error;
mod grouping;
mod pipeline;
mod progress;
mod records;
mod render;
mod report;
mod resolver;
mod transport;
mod ui;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use cli::{Cli, Command};
use config::GroupMailConfig;
use dispatch::{DispatchScheduler, RunState};
use progress::{FileProgressStore, ProgressStore};
use records::RecordSet;
use render::Payload;
use transport::Transport;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;

    match cli.command {
        Command::Plan { input } => {
            let set = load_records(&input)?;
            let prepared = pipeline::prepare(&config, &set)?;
            ui::print_plan(&prepared);
        }
        Command::Run {
            input,
            restart,
            report,
        } => {
            run(&config, &input, restart, report.as_deref()).await?;
        }
        Command::Status => {
            let store = FileProgressStore::new(&config.progress_path);
            match store.load()? {
                Some(snapshot) => ui::print_status(&snapshot),
                None => println!("No saved progress at {}", store.path().display()),
            }
        }
        Command::Clear => {
            let store = FileProgressStore::new(&config.progress_path);
            store.clear()?;
            println!("Cleared saved progress at {}", store.path().display());
        }
        Command::Cancel { input } => {
            cancel(&config, &input)?;
        }
        Command::TestSend { input } => {
            test_send(&config, &input).await?;
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise info, or debug with --verbose. Logs go to stderr.
fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<GroupMailConfig> {
    let mut config = GroupMailConfig::load(&cli.config)?;
    if let Some(policy) = cli.policy {
        config.policy = policy.into();
    }
    if let Some(batch_size) = cli.batch_size {
        config.pacing.batch_size = batch_size;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.pacing.max_attempts = max_attempts;
    }
    Ok(config)
}

fn load_records(input: &Path) -> Result<RecordSet> {
    let set = RecordSet::load_json(input)
        .with_context(|| format!("failed to load records from {}", input.display()))?;
    if set.is_empty() {
        bail!("{} contains no records", input.display());
    }
    info!(records = set.len(), columns = set.columns().len(), "Records loaded");
    Ok(set)
}

async fn run(
    config: &GroupMailConfig,
    input: &Path,
    restart: bool,
    report_path: Option<&Path>,
) -> Result<()> {
    let set = load_records(input)?;
    let prepared = pipeline::prepare(config, &set)?;
    if prepared.plan.jobs.is_empty() {
        ui::print_plan(&prepared);
        bail!("nothing to dispatch");
    }

    let store = FileProgressStore::new(&config.progress_path);
    let transport = pipeline::build_transport(&config.transport)?;
    let jobs = prepared.plan.jobs.clone();
    let scheduler = if restart {
        info!(path = %store.path().display(), "Ignoring saved progress");
        DispatchScheduler::new(jobs, config.pacing.to_pacing(), transport, store)?
    } else {
        DispatchScheduler::restore(jobs, config.pacing.to_pacing(), transport, store)?
    };
    let scheduler = Arc::new(scheduler);

    let state = scheduler.run_state();
    if state.is_terminal() {
        info!(%state, "Saved run already finished; use --restart to send again");
    } else {
        let progress = ui::DispatchProgress::start(scheduler.subscribe());

        // Primeiro Ctrl-C pausa, o seguinte cancela; ambos valem na próxima
        // fronteira entre jobs.
        let handle = Arc::clone(&scheduler);
        let interrupt = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                match handle.interrupt() {
                    Ok(dispatch::Command::Pause) => warn!(
                        "Interrupt received, pausing at the next job boundary; press Ctrl-C again to cancel"
                    ),
                    Ok(_) => warn!("Interrupt received again, cancelling at the next job boundary"),
                    Err(e) => warn!(error = %e, "Interrupt ignored"),
                }
            }
        });

        let result = if state == RunState::Idle {
            scheduler.start().await
        } else {
            scheduler.resume().await
        };
        interrupt.abort();
        progress.finish();

        if result? == RunState::Paused {
            println!("Paused. Run the same command again to resume.");
        }
    }

    let report = scheduler.report(&prepared.plan.skipped);
    ui::print_report(&report);
    if report.is_clean() {
        info!(delivered = report.succeeded, "Every job delivered");
    } else {
        warn!(
            failed = report.failed.len(),
            pending = report.pending,
            "Dispatch left failed or pending jobs"
        );
    }

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    Ok(())
}

/// Aborta um envio pausado; o snapshot fica salvo como ABORTED.
fn cancel(config: &GroupMailConfig, input: &Path) -> Result<()> {
    let set = load_records(input)?;
    let prepared = pipeline::prepare(config, &set)?;
    let store = FileProgressStore::new(&config.progress_path);
    if store.load()?.is_none() {
        bail!("no saved progress at {}", store.path().display());
    }

    let transport = pipeline::build_transport(&config.transport)?;
    let scheduler = DispatchScheduler::restore(
        prepared.plan.jobs.clone(),
        config.pacing.to_pacing(),
        transport,
        store,
    )?;
    scheduler.cancel()?;
    println!("Cancelled. Use `run --restart` to send again.");
    ui::print_report(&scheduler.report(&prepared.plan.skipped));
    Ok(())
}

async fn test_send(config: &GroupMailConfig, input: &Path) -> Result<()> {
    let sender = &config.transport.sender;
    if sender.is_empty() {
        bail!(error::GroupMailError::config(
            "transport.sender is required for a test send"
        ));
    }

    let set = load_records(input)?;
    let prepared = pipeline::prepare(config, &set)?;
    let Some(job) = prepared.plan.jobs.first() else {
        ui::print_plan(&prepared);
        bail!("no job to use for a test send");
    };

    let payload = Payload {
        subject: format!("[TEST] {}", job.payload.subject),
        body: job.payload.body.clone(),
    };
    let transport = pipeline::build_transport(&config.transport)?;
    info!(group = %job.group_key, recipient = %sender, "Sending test message");
    let outcome = transport.send(sender, &payload).await;
    ui::print_test_send(sender, &outcome);

    if !outcome.is_success() {
        bail!("test send failed: {outcome}");
    }
    Ok(())
}
