//! # ws-stress Library
//!
//! A distributed WebSocket streaming load test. One controller process
//! spawns a fleet of worker processes, each of which opens a number of
//! WebSocket connections and streams fixed-size binary frames to the server
//! under test. The controller periodically freezes the whole fleet, reads
//! every worker's counters and writes a timestamped report.
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `orchestrator`: Lifecycle driver and measurement barrier
//! - `handle`: Worker process spawn, endpoint handshake and termination
//! - `agent`: The worker side: state machine, traffic generators and sinks
//! - `rpc`: Typed control commands and their length-prefixed TCP transport
//! - `aggregate`: Counter merging, per-window rates and barrier skew
//! - `collector`: Memory and server-side statistics probes
//! - `report`: Timestamped text report and JSON run summary
//! - `cli`: Command-line interface parsing and run configuration
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use ws_stress::{Args, LoadTestConfig, Orchestrator, ProcfsCollector, ReportLog, WorkerCommand};
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = Args::parse_from(["ws-stress", "-i", "3", "-c", "2", "-w", "127.0.0.1:8080"]);
//!     let config = LoadTestConfig::from_args(&args)?;
//!     let report = ReportLog::open(&args.report_file)?;
//!
//!     let command = WorkerCommand::current_binary()?;
//!     let mut orchestrator =
//!         Orchestrator::spawn(&command, config, Box::new(ProcfsCollector), report).await?;
//!     let summary = orchestrator.run().await?;
//!
//!     println!("Iterations measured: {}", summary.iterations.len());
//!     Ok(())
//! }
//! ```

pub mod agent;

/// Counter merging and measurement window statistics
///
/// `merge` is a pure elementwise sum, so the order in which workers answer
/// never changes the total.
pub mod aggregate;

/// Command-line interface and configuration
///
/// Provides argument parsing using clap and converts user-friendly CLI options
/// into a validated `LoadTestConfig`, including:
/// - Duration parsing with human-readable formats (e.g., "300ms", "2s")
/// - Target URL construction from `host[:port]` and request path
pub mod cli;

/// External statistics probes
///
/// Best-effort sources the report compares worker counters against.
pub mod collector;

pub mod error;

/// Worker process management
///
/// Spawns worker processes, discovers their control endpoint through a
/// one-line stdout handshake and guarantees their termination.
pub mod handle;

pub mod logging;

/// Lifecycle driver for the whole fleet
pub mod orchestrator;

/// Report output
///
/// Manages the append-only text report and the structured JSON summary,
/// including system information collection for reproducibility.
pub mod report;

pub mod rpc;

pub mod utils;

/// Command-line interface types
pub use cli::{Args, LoadTestConfig};

/// Worker side of the control protocol
pub use agent::{AgentState, WorkerAgent};

/// Controller side of the control protocol
pub use handle::{WorkerCommand, WorkerHandle};
pub use orchestrator::Orchestrator;
pub use rpc::{Command, InitSettings, Reply, WorkerControl, WorkerStats};

pub use aggregate::{merge, StatSample};
pub use collector::{ProcfsCollector, StatsCollector};
pub use error::{LoadTestError, SpawnError, TransportError};
pub use report::{ReportLog, RunReport};

/// The current version of ws-stress
///
/// This version string is automatically populated from Cargo.toml and used
/// in the run summary for reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// These defaults reproduce a small, local smoke test: three workers with
/// one connection each against a server on the loopback interface.
pub mod defaults {
    /// Default number of connections each worker opens
    pub const CONNECTIONS: usize = 1;

    /// Default number of worker processes
    ///
    /// Several processes rather than one exercise the cross-worker pause
    /// barrier even in the smallest run.
    pub const INSTANCES: usize = 3;

    /// Default frame size in bytes
    pub const PACKET_SIZE: usize = 1000;

    /// Default server under test
    pub const WS_SERVER: &str = "127.0.0.1:8080";

    /// Default request path of the streaming endpoint
    pub const WS_PATH: &str = "/streaming";

    /// Default number of measurement windows
    pub const ITERATIONS: usize = 10;

    /// Default report file name
    ///
    /// The file is appended to, so consecutive runs accumulate in one log.
    pub const REPORT_FILE: &str = "test_report.txt";
}
