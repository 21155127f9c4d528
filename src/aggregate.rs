//! # Counter Aggregation
//!
//! Workers report cumulative `(frames, bytes)` counters. This module merges
//! those samples into a cross-worker total, derives per-window rates from two
//! consecutive totals, and tracks how tightly the pause barrier lined the
//! workers up.

use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::Add;
use std::time::{Duration, Instant};

/// Instantaneous cumulative counters read from one or more workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatSample {
    pub frames: u64,
    pub bytes: u64,
}

impl StatSample {
    pub const ZERO: StatSample = StatSample {
        frames: 0,
        bytes: 0,
    };

    pub fn new(frames: u64, bytes: u64) -> Self {
        Self { frames, bytes }
    }

    /// Difference to an earlier sample of the same counters.
    ///
    /// Counters are cumulative, so a smaller `later` only happens if the
    /// samples came from different runs; the result saturates at zero.
    pub fn since(&self, earlier: &StatSample) -> StatSample {
        StatSample {
            frames: self.frames.saturating_sub(earlier.frames),
            bytes: self.bytes.saturating_sub(earlier.bytes),
        }
    }
}

impl Add for StatSample {
    type Output = StatSample;

    fn add(self, rhs: StatSample) -> StatSample {
        StatSample {
            frames: self.frames.saturating_add(rhs.frames),
            bytes: self.bytes.saturating_add(rhs.bytes),
        }
    }
}

impl Sum for StatSample {
    fn sum<I: Iterator<Item = StatSample>>(iter: I) -> StatSample {
        iter.fold(StatSample::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a StatSample> for StatSample {
    fn sum<I: Iterator<Item = &'a StatSample>>(iter: I) -> StatSample {
        iter.copied().sum()
    }
}

/// Merge per-worker samples into a total. Order of the input does not matter.
pub fn merge<'a, I>(samples: I) -> StatSample
where
    I: IntoIterator<Item = &'a StatSample>,
{
    samples.into_iter().sum()
}

/// Traffic generated between two aggregated samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowDelta {
    pub frames: u64,
    pub bytes: u64,
    pub frames_per_second: f64,
    pub bytes_per_second: f64,
    pub duration_ns: u64,
}

impl WindowDelta {
    pub fn between(earlier: &StatSample, later: &StatSample, elapsed: Duration) -> Self {
        let delta = later.since(earlier);
        let secs = elapsed.as_secs_f64();

        let (frames_per_second, bytes_per_second) = if secs > 0.0 {
            (delta.frames as f64 / secs, delta.bytes as f64 / secs)
        } else {
            (0.0, 0.0)
        };

        Self {
            frames: delta.frames,
            bytes: delta.bytes,
            frames_per_second,
            bytes_per_second,
            duration_ns: elapsed.as_nanos() as u64,
        }
    }
}

/// Spread between the first and the last `pause` acknowledgment of a window.
pub fn barrier_skew(acks: &[Instant]) -> Duration {
    match (acks.iter().min(), acks.iter().max()) {
        (Some(first), Some(last)) => last.duration_since(*first),
        _ => Duration::ZERO,
    }
}

/// Summary of pause-barrier skew over the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkewSummary {
    pub windows: u64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
}

/// Records pause-barrier skew per measurement window in an HDR histogram.
pub struct SkewTracker {
    histogram: Histogram<u64>,
}

impl SkewTracker {
    pub fn new() -> Result<Self> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;
        Ok(Self { histogram })
    }

    pub fn record(&mut self, skew: Duration) -> Result<()> {
        self.histogram.record(skew.as_nanos() as u64)?;
        Ok(())
    }

    pub fn summary(&self) -> SkewSummary {
        SkewSummary {
            windows: self.histogram.len(),
            p50_ns: self.histogram.value_at_percentile(50.0),
            p99_ns: self.histogram.value_at_percentile(99.0),
            max_ns: self.histogram.max(),
        }
    }
}
