//! # Utility Functions and Helper Module
//!
//! Helpers shared by the controller and the report: human-readable
//! formatting of durations, byte counts and rates, validation of run
//! parameters, and run identification.
//!
//! ## Usage Examples
//!
//! ```rust
//! use ws_stress::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_rate(1048576.0), "1.00 MB/s");
//!
//! validate_packet_size(1000)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for a load test run
///
/// The id is written into the JSON run summary so that report files from
/// several runs against the same server can be told apart.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a duration in a human-readable way
///
/// Converts a Duration to a human-readable string, automatically selecting
/// the most appropriate unit based on the magnitude.
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use ws_stress::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_nanos(1250)), "1.25μs");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        // For longer durations, use compound format (hours, minutes, seconds)
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a byte count in a human-readable way
///
/// Uses binary (1024-based) units, matching how process memory is usually
/// reported by the operating system.
///
/// ## Examples
///
/// ```rust
/// # use ws_stress::utils::format_bytes;
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(2621440), "2.50 MB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    format_bytes_f64(bytes as f64)
}

/// Format bytes (as f64) in a human-readable way
///
/// Shared by `format_bytes` and `format_rate` so that counts and rates are
/// scaled and rounded the same way.
pub fn format_bytes_f64(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a rate (bytes per second) in a human-readable way
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes_f64(bytes_per_second))
}

/// Format a frame rate in a human-readable way
///
/// Uses decimal scaling (powers of 1000):
/// - Frames/sec: < 1,000 (e.g., "20 frames/s")
/// - Thousands: < 1,000,000 (e.g., "15.50K frames/s")
/// - Millions: ≥ 1,000,000 (e.g., "2.30M frames/s")
///
/// ## Examples
///
/// ```rust
/// # use ws_stress::utils::format_frame_rate;
/// assert_eq!(format_frame_rate(20.0), "20 frames/s");
/// assert_eq!(format_frame_rate(15500.0), "15.50K frames/s");
/// ```
pub fn format_frame_rate(frames_per_second: f64) -> String {
    if frames_per_second < 1000.0 {
        format!("{:.0} frames/s", frames_per_second)
    } else if frames_per_second < 1_000_000.0 {
        format!("{:.2}K frames/s", frames_per_second / 1000.0)
    } else {
        format!("{:.2}M frames/s", frames_per_second / 1_000_000.0)
    }
}

/// Largest frame a worker will generate, in bytes.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Largest number of connections a single worker will open.
pub const MAX_CONNECTIONS: usize = u16::MAX as usize;

/// Validate that a packet size is reasonable
///
/// ## Validation Rules
///
/// - **Minimum**: 1 byte (a zero-length frame carries no load)
/// - **Maximum**: 16 MB (default frame size limit of common WebSocket servers)
pub fn validate_packet_size(packet_size: usize) -> Result<()> {
    if packet_size == 0 {
        anyhow::bail!("Packet size cannot be zero");
    }
    if packet_size > MAX_PACKET_SIZE {
        anyhow::bail!("Packet size {} is too large (maximum 16MB)", packet_size);
    }
    Ok(())
}

/// Validate the number of connections each worker opens
///
/// ## Validation Rules
///
/// - **Minimum**: 1 connection
/// - **Maximum**: 65,535 connections, the local port range a single worker
///   can use against one server address
pub fn validate_connections(connections: usize) -> Result<()> {
    if connections == 0 {
        anyhow::bail!("Connections per instance cannot be zero");
    }
    if connections > MAX_CONNECTIONS {
        anyhow::bail!(
            "Connections per instance {} is too high (maximum {})",
            connections,
            MAX_CONNECTIONS
        );
    }
    Ok(())
}

/// Validate the number of worker processes
///
/// ## Validation Rules
///
/// - **Minimum**: 1 worker
/// - **Maximum**: 1024 workers (prevent process exhaustion)
pub fn validate_instances(instances: usize) -> Result<()> {
    if instances == 0 {
        anyhow::bail!("Number of instances cannot be zero");
    }
    if instances > 1024 {
        anyhow::bail!("Number of instances {} is too high (maximum 1024)", instances);
    }
    Ok(())
}

/// Validate the time between two frames on one connection
pub fn validate_frame_interval(frame_interval: Duration) -> Result<()> {
    if frame_interval.is_zero() {
        anyhow::bail!("Frame interval must be greater than zero");
    }
    Ok(())
}

/// Get the number of CPU cores available
///
/// Reported in the run summary so results from different load generator
/// hosts can be compared.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test duration formatting with various time scales
    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    /// Test byte formatting with various scales
    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1572864), "1.50 MB");
        assert_eq!(format_bytes(1610612736), "1.50 GB");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(1024.0), "1.00 KB/s");
        assert_eq!(format_rate(1048576.0), "1.00 MB/s");
    }

    #[test]
    fn test_format_frame_rate() {
        assert_eq!(format_frame_rate(20.0), "20 frames/s");
        assert_eq!(format_frame_rate(1500.0), "1.50K frames/s");
        assert_eq!(format_frame_rate(1500000.0), "1.50M frames/s");
    }

    #[test]
    fn test_validate_packet_size() {
        assert!(validate_packet_size(1000).is_ok());
        assert!(validate_packet_size(0).is_err());
        assert!(validate_packet_size(17 * 1024 * 1024).is_err());
    }

    #[test]
    fn test_validate_connections() {
        assert!(validate_connections(1).is_ok());
        assert!(validate_connections(0).is_err());
        assert!(validate_connections(70_000).is_err());
    }

    #[test]
    fn test_validate_instances() {
        assert!(validate_instances(3).is_ok());
        assert!(validate_instances(0).is_err());
        assert!(validate_instances(2048).is_err());
    }

    #[test]
    fn test_validate_frame_interval() {
        assert!(validate_frame_interval(Duration::from_millis(300)).is_ok());
        assert!(validate_frame_interval(Duration::ZERO).is_err());
    }

    #[test]
    fn test_generate_run_id_is_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
    }
}
