//! # External Stats Collection
//!
//! Read-only probes the report compares worker counters against: memory of
//! watched processes and the counters the server under test reports about
//! itself. Both are best effort. A failing probe costs one report line,
//! never the run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A probe could not produce data this time.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("process {pid} is not readable: {source}")]
    Process {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed memory statistics for process {0}")]
    Malformed(u32),

    #[error("{0} is not available on this platform")]
    Unsupported(&'static str),

    #[error("server statistics for {endpoint} unavailable: {reason}")]
    Server { endpoint: String, reason: String },
}

/// Counters reported by the server under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub connections: u64,
    pub frames: u64,
    pub bytes: u64,
}

/// Resident memory per process id, in bytes.
pub type MemoryUsage = BTreeMap<u32, u64>;

/// Source of external measurements taken at each stat point.
pub trait StatsCollector: Send + Sync {
    /// Resident memory of each process in `pids`. Pids that cannot be read
    /// are left out of the map and reported as `CollectorError`s.
    fn memory_usage(&self, pids: &[u32]) -> (MemoryUsage, Vec<CollectorError>);

    /// Counters the server at `endpoint` reports about itself.
    fn server_reported_stats(&self, endpoint: &str) -> Result<ServerStats, CollectorError>;
}

/// Reads resident memory from `/proc/<pid>/statm`.
///
/// Server-side counters are not scraped by this collector; callers get a
/// `CollectorError::Server` and the report marks them unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsCollector;

impl ProcfsCollector {
    #[cfg(target_os = "linux")]
    fn resident_bytes(pid: u32) -> Result<u64, CollectorError> {
        let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid))
            .map_err(|source| CollectorError::Process { pid, source })?;
        let resident_pages = parse_statm_resident(&statm).ok_or(CollectorError::Malformed(pid))?;

        // Safety: sysconf has no preconditions; only the page size is read.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = u64::try_from(page_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(CollectorError::Malformed(pid))?;

        Ok(resident_pages.saturating_mul(page_size))
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_bytes(_pid: u32) -> Result<u64, CollectorError> {
        Err(CollectorError::Unsupported("process memory usage"))
    }
}

impl StatsCollector for ProcfsCollector {
    fn memory_usage(&self, pids: &[u32]) -> (MemoryUsage, Vec<CollectorError>) {
        let mut usage = MemoryUsage::new();
        let mut errors = Vec::new();
        for &pid in pids {
            match Self::resident_bytes(pid) {
                Ok(bytes) => {
                    usage.insert(pid, bytes);
                }
                Err(e) => errors.push(e),
            }
        }
        (usage, errors)
    }

    fn server_reported_stats(&self, endpoint: &str) -> Result<ServerStats, CollectorError> {
        Err(CollectorError::Server {
            endpoint: endpoint.to_string(),
            reason: "no statistics source configured".to_string(),
        })
    }
}

/// Second field of `/proc/<pid>/statm`: resident set size in pages.
fn parse_statm_resident(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

/// Sum of all per-process memory figures.
pub fn total_memory(usage: &MemoryUsage) -> u64 {
    usage.values().fold(0u64, |acc, bytes| acc.saturating_add(*bytes))
}
