//! # ws-stress - Main Entry Point
//!
//! The same binary plays two roles:
//!
//! - **Controller** (default): parses the run configuration, spawns the
//!   worker fleet, drives the measurement loop and writes the report.
//! - **Worker** (hidden `--internal-run-as-worker` flag): binds a control
//!   endpoint, announces it on stdout and serves control commands until the
//!   controller disconnects.
//!
//! ## Error Handling
//!
//! The application uses `anyhow::Result` at this boundary. Any fatal error
//! ends the run; the orchestrator has already killed every worker by the
//! time it reaches `main`.

use anyhow::Result;
use clap::Parser;
use std::ffi::OsString;
use tracing::info;
use ws_stress::{
    agent::run_worker_process,
    cli::{Args, LoadTestConfig},
    collector::ProcfsCollector,
    handle::WorkerCommand,
    logging,
    orchestrator::Orchestrator,
    report::ReportLog,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(args.verbose, args.internal_run_as_worker);

    if args.internal_run_as_worker {
        return run_worker_process().await;
    }

    let config = LoadTestConfig::from_args(&args)?;
    info!("Starting ws-stress {}", ws_stress::VERSION);
    println!("{}", config);

    let mut command = WorkerCommand::current_binary()?;
    if args.verbose {
        command.args.push(OsString::from("-v"));
    }

    let report = ReportLog::open(&args.report_file)?;
    info!("Appending report to: {:?}", report.path());

    let mut orchestrator =
        Orchestrator::spawn(&command, config, Box::new(ProcfsCollector), report).await?;
    let summary = orchestrator.run().await?;

    if let Some(ref output_file) = args.output_file {
        summary.write_json(output_file)?;
    }

    info!("Load test {} completed", summary.run_id);
    Ok(())
}
