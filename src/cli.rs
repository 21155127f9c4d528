use crate::rpc::InitSettings;
use crate::utils::{
    format_duration, validate_connections, validate_frame_interval, validate_instances,
    validate_packet_size,
};
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// ws-stress - distributed WebSocket streaming load test
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Number of connections per instance
    #[clap(short = 'c', long, default_value_t = crate::defaults::CONNECTIONS)]
    pub connections: usize,

    /// Number of worker instances to spawn
    #[clap(short = 'i', long, default_value_t = crate::defaults::INSTANCES)]
    pub instances: usize,

    /// Delay between measurement probes (e.g. "1", "2s", "500ms")
    #[clap(short = 'd', long, value_parser = parse_duration, default_value = "1")]
    pub delay: Duration,

    /// Size of each WebSocket frame in bytes
    #[clap(short = 's', long, default_value_t = crate::defaults::PACKET_SIZE)]
    pub packet_size: usize,

    /// WebSocket server host[:port]
    #[clap(short = 'w', long, default_value = crate::defaults::WS_SERVER)]
    pub ws_server: String,

    /// Request path on the WebSocket server
    #[clap(long, default_value = crate::defaults::WS_PATH)]
    pub ws_path: String,

    /// Number of measurement iterations
    #[clap(long, default_value_t = crate::defaults::ITERATIONS)]
    pub iterations: usize,

    /// Time between two frames on one connection
    #[clap(long, value_parser = parse_duration, default_value = "300ms")]
    pub frame_interval: Duration,

    /// How long a worker may take to announce its control endpoint
    #[clap(long, value_parser = parse_duration, default_value = "5s")]
    pub startup_timeout: Duration,

    /// Append-only text report
    #[clap(long, default_value = crate::defaults::REPORT_FILE)]
    pub report_file: PathBuf,

    /// Optional JSON summary of the whole run
    #[clap(short = 'o', long)]
    pub output_file: Option<PathBuf>,

    /// Process whose memory usage is reported at every probe (repeatable)
    #[clap(long = "watch-pid")]
    pub watch_pids: Vec<u32>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,

    /// Run as a worker agent. Used internally by the controller.
    #[clap(long, hide = true, default_value_t = false)]
    pub internal_run_as_worker: bool,
}

/// Validated configuration of one load test run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadTestConfig {
    pub instances: usize,
    pub connections: usize,
    pub packet_size: usize,
    pub frame_interval: Duration,
    pub delay: Duration,
    pub iterations: usize,
    /// `host[:port]` of the server under test
    pub ws_server: String,
    /// Full URL every connection targets
    pub url: String,
    pub startup_timeout: Duration,
    pub watch_pids: Vec<u32>,
}

impl LoadTestConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        validate_instances(args.instances)?;
        validate_connections(args.connections)?;
        validate_packet_size(args.packet_size)?;
        validate_frame_interval(args.frame_interval)?;

        let url = build_url(&args.ws_server, &args.ws_path)?;

        Ok(Self {
            instances: args.instances,
            connections: args.connections,
            packet_size: args.packet_size,
            frame_interval: args.frame_interval,
            delay: args.delay,
            iterations: args.iterations,
            ws_server: args.ws_server.clone(),
            url,
            startup_timeout: args.startup_timeout,
            watch_pids: args.watch_pids.clone(),
        })
    }

    /// Arguments of the `init` command sent to every worker.
    pub fn init_settings(&self) -> InitSettings {
        InitSettings {
            connections: self.connections as u32,
            url: self.url.clone(),
            packet_size: self.packet_size as u32,
            frame_interval: self.frame_interval,
        }
    }

    /// Frames the whole fleet should emit per second.
    pub fn expected_frame_rate(&self) -> f64 {
        (self.instances * self.connections) as f64 / self.frame_interval.as_secs_f64()
    }
}

impl std::fmt::Display for LoadTestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting load test against: {}", self.url)?;
        writeln!(f, "  Worker Instances:   {}", self.instances)?;
        writeln!(f, "  Connections/Worker: {}", self.connections)?;
        writeln!(f, "  Packet Size:        {} bytes", self.packet_size)?;
        writeln!(
            f,
            "  Frame Interval:     {}",
            format_duration(self.frame_interval)
        )?;
        writeln!(
            f,
            "  Expected Rate:      {:.1} frames/s",
            self.expected_frame_rate()
        )?;
        writeln!(f, "  Probe Delay:        {}", format_duration(self.delay))?;
        writeln!(f, "  Iterations:         {}", self.iterations)?;
        if !self.watch_pids.is_empty() {
            writeln!(f, "  Watched PIDs:       {:?}", self.watch_pids)?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Build `ws://host[:port]/path` from the server option.
fn build_url(server: &str, path: &str) -> Result<String> {
    let server = server.trim();
    if server.is_empty() {
        anyhow::bail!("WebSocket server address cannot be empty");
    }

    let base = if server.contains("://") {
        server.to_string()
    } else {
        format!("ws://{}", server)
    };
    let mut url = url::Url::parse(&base)
        .with_context(|| format!("Invalid WebSocket server address: {}", server))?;
    url.set_path(path);
    Ok(url.to_string())
}

/// Parse duration from string (e.g., "300ms", "1.5s", "5m", "1h")
///
/// A bare number is taken as seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Invalid duration: {}", s));
    }

    let nanos_per_unit = match unit {
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    // Round to whole nanoseconds so "0.3" is exactly 300ms
    Ok(Duration::from_nanos((num * nanos_per_unit).round() as u64))
}
