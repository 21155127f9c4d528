//! # Run Report
//!
//! Two outputs describe a run:
//!
//! - `ReportLog`: an append-only, timestamped text log. Every entry is also
//!   mirrored to the console through `tracing`.
//! - `RunReport`: the same data as one structured JSON document, written at
//!   the end of the run when an output file is configured.

use crate::aggregate::{SkewSummary, StatSample, WindowDelta};
use crate::cli::LoadTestConfig;
use crate::collector::{total_memory, MemoryUsage, ServerStats};
use crate::utils::{format_bytes, format_duration, format_frame_rate, format_rate};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Append-only, timestamped text report.
pub struct ReportLog {
    path: PathBuf,
    file: File,
}

impl ReportLog {
    /// Open `path` for appending, creating it when missing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open report file {}", path.display()))?;
        debug!("Appending report to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&mut self, message: impl Display) -> Result<()> {
        info!("{}", message);
        self.append(&message)
    }

    pub fn warn(&mut self, message: impl Display) -> Result<()> {
        warn!("{}", message);
        self.append(&message)
    }

    fn append(&mut self, message: &dyn Display) -> Result<()> {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
        writeln!(self.file, "{}: {}", timestamp, message)
            .and_then(|_| self.file.flush())
            .with_context(|| format!("Failed to write report file {}", self.path.display()))
    }

    pub fn log_memory(&mut self, heading: &str, usage: &MemoryUsage) -> Result<()> {
        self.info(heading)?;
        self.info(format!("Total: {}", format_bytes(total_memory(usage))))?;
        self.info(format!("Per process: {}", format_per_process(usage)))
    }

    pub fn log_iteration(&mut self, entry: &IterationReport) -> Result<()> {
        self.info(format!(
            "{} time from last report: {:.1} seconds {}",
            "-".repeat(5),
            entry.elapsed.as_secs_f64(),
            "-".repeat(5)
        ))?;
        self.info(format_totals(&entry.totals))?;
        self.info(format!(
            "Rate: {}, {} (pause barrier skew {})",
            format_frame_rate(entry.window.frames_per_second),
            format_rate(entry.window.bytes_per_second),
            format_duration(Duration::from_nanos(entry.pause_skew_ns))
        ))?;
        self.log_server(entry.server.as_ref(), true)?;
        self.log_memory("Mem usage:", &entry.memory)
    }

    pub fn log_final(&mut self, entry: &FinalReport) -> Result<()> {
        self.info(format!(
            "{}, total time elapsed: {:.1} seconds",
            format_totals(&entry.totals),
            entry.elapsed.as_secs_f64()
        ))?;
        self.log_server(entry.server.as_ref(), false)?;
        self.info(format!(
            "Pause barrier skew over {} windows: p50 {}, p99 {}, max {}",
            entry.skew.windows,
            format_duration(Duration::from_nanos(entry.skew.p50_ns)),
            format_duration(Duration::from_nanos(entry.skew.p99_ns)),
            format_duration(Duration::from_nanos(entry.skew.max_ns))
        ))?;
        self.info("Total memory usage at start:")?;
        self.info(format_bytes(entry.memory_start_total))?;
        self.info("Memory usage now:")?;
        self.info(format_bytes(entry.memory_end_total))
    }

    fn log_server(&mut self, server: Option<&ServerStats>, with_connections: bool) -> Result<()> {
        self.info("Reported:")?;
        match server {
            Some(stats) if with_connections => self.info(format!(
                "{}, WebSocket connections: {}",
                format_totals(&StatSample::new(stats.frames, stats.bytes)),
                stats.connections
            )),
            Some(stats) => self.info(format_totals(&StatSample::new(stats.frames, stats.bytes))),
            None => self.info("unavailable"),
        }
    }
}

fn format_totals(sample: &StatSample) -> String {
    format!(
        "Frames: {}, Bytes: {}({})",
        sample.frames,
        format_bytes(sample.bytes),
        sample.bytes
    )
}

fn format_per_process(usage: &MemoryUsage) -> String {
    let parts: Vec<String> = usage
        .iter()
        .map(|(pid, bytes)| format!("{}={}", pid, format_bytes(*bytes)))
        .collect();
    format!("[{}]", parts.join(", "))
}

/// One measurement window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationReport {
    pub index: usize,
    /// Time since the previous report, sleep included.
    pub elapsed: Duration,
    /// Aggregated cumulative counters at the pause point.
    pub totals: StatSample,
    /// Per-worker counters at the pause point, in worker order.
    pub per_worker: Vec<StatSample>,
    pub window: WindowDelta,
    pub pause_skew_ns: u64,
    /// Connections still streaming across all workers.
    pub connections_alive: u64,
    pub server: Option<ServerStats>,
    pub memory: MemoryUsage,
}

/// Closing entry after `stop_proc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub totals: StatSample,
    pub per_worker: Vec<StatSample>,
    pub elapsed: Duration,
    pub server: Option<ServerStats>,
    pub skew: SkewSummary,
    pub memory_start_total: u64,
    pub memory_end_total: u64,
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub tool_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            tool_version: crate::VERSION.to_string(),
        }
    }
}

/// Structured record of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub config: LoadTestConfig,
    pub worker_pids: Vec<u32>,
    pub initial_memory: MemoryUsage,
    pub iterations: Vec<IterationReport>,
    pub final_report: Option<FinalReport>,
    pub system_info: SystemInfo,
}

impl RunReport {
    pub fn new(config: LoadTestConfig) -> Self {
        Self {
            run_id: crate::utils::generate_run_id(),
            started_at: chrono::Utc::now(),
            config,
            worker_pids: Vec::new(),
            initial_memory: MemoryUsage::new(),
            iterations: Vec::new(),
            final_report: None,
            system_info: SystemInfo::default(),
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run summary {}", path.display()))?;
        info!("Run summary written to: {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_report_log_appends_timestamped_lines() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "previous run\n").unwrap();

        let mut log = ReportLog::open(temp_file.path()).unwrap();
        log.info("Monitoring stats").unwrap();
        log.warn("something odd").unwrap();

        let contents = read(temp_file.path());
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "previous run");
        assert!(lines[1].ends_with(": Monitoring stats"));
        assert!(lines[2].ends_with(": something odd"));
    }

    #[test]
    fn test_iteration_entry_contents() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut log = ReportLog::open(temp_file.path()).unwrap();

        let mut memory = MemoryUsage::new();
        memory.insert(100, 2048);
        memory.insert(101, 1024);
        let totals = StatSample::new(20, 20_000);
        let entry = IterationReport {
            index: 0,
            elapsed: Duration::from_millis(1040),
            totals,
            per_worker: vec![totals],
            window: WindowDelta::between(&StatSample::ZERO, &totals, Duration::from_secs(1)),
            pause_skew_ns: 1_500,
            connections_alive: 2,
            server: None,
            memory,
        };
        log.log_iteration(&entry).unwrap();

        let contents = read(temp_file.path());
        assert!(contents.contains("----- time from last report: 1.0 seconds -----"));
        assert!(contents.contains("Frames: 20, Bytes: 19.53 KB(20000)"));
        assert!(contents.contains("Rate: 20 frames/s, 19.53 KB/s"));
        assert!(contents.contains("Reported:"));
        assert!(contents.contains("unavailable"));
        assert!(contents.contains("Total: 3.00 KB"));
        assert!(contents.contains("Per process: [100=2.00 KB, 101=1.00 KB]"));
    }

    #[test]
    fn test_final_entry_with_server_stats() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut log = ReportLog::open(temp_file.path()).unwrap();

        let entry = FinalReport {
            totals: StatSample::new(100, 100_000),
            per_worker: Vec::new(),
            elapsed: Duration::from_secs(12),
            server: Some(ServerStats {
                connections: 6,
                frames: 99,
                bytes: 99_000,
            }),
            skew: SkewSummary {
                windows: 5,
                p50_ns: 1000,
                p99_ns: 2000,
                max_ns: 2000,
            },
            memory_start_total: 1024,
            memory_end_total: 4096,
        };
        log.log_final(&entry).unwrap();

        let contents = read(temp_file.path());
        assert!(contents.contains("Frames: 100, Bytes: 97.66 KB(100000), total time elapsed: 12.0 seconds"));
        assert!(contents.contains("Frames: 99, Bytes: 96.68 KB(99000)"));
        assert!(contents.contains("Pause barrier skew over 5 windows"));
        assert!(contents.contains("Memory usage now:"));
    }

    #[test]
    fn test_run_report_json() {
        let args = <crate::cli::Args as clap::Parser>::try_parse_from(["ws-stress"]).unwrap();
        let config = LoadTestConfig::from_args(&args).unwrap();
        let report = RunReport::new(config);

        let temp_file = NamedTempFile::new().unwrap();
        report.write_json(temp_file.path()).unwrap();

        let value: serde_json::Value = serde_json::from_str(&read(temp_file.path())).unwrap();
        assert_eq!(value["run_id"], report.run_id.as_str());
        assert_eq!(value["config"]["instances"], 3);
        assert!(value["iterations"].as_array().unwrap().is_empty());
        assert!(value["final_report"].is_null());
    }

    #[test]
    fn test_system_info_default() {
        let info = SystemInfo::default();
        assert!(!info.os.is_empty());
        assert!(!info.architecture.is_empty());
        assert!(info.cpu_cores > 0);
    }
}
