//! Per-connection frame generation.
//!
//! Every connection runs as its own task. A frame is sent and counted while
//! holding a read guard on the shared gate, and `pause` flips the gate under
//! the write guard. Once `pause` holds the write guard no frame is in flight,
//! and every frame sent so far has been counted.

use super::sink::FrameSink;
use crate::aggregate::StatSample;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Whether connections may currently emit frames.
pub(crate) type Gate = Arc<RwLock<bool>>;

/// Cumulative counters shared by all connections of one agent.
#[derive(Default)]
pub(crate) struct Counters {
    inner: Mutex<StatSample>,
    alive: AtomicU32,
}

impl Counters {
    /// Register one live connection. It stays counted until the slot drops.
    pub(crate) fn open_slot(self: &Arc<Self>) -> ConnectionSlot {
        self.alive.fetch_add(1, Ordering::SeqCst);
        ConnectionSlot(self.clone())
    }

    pub(crate) fn connections_alive(&self) -> u32 {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn record_frame(&self, bytes: usize) {
        let mut sample = self.inner.lock();
        sample.frames += 1;
        sample.bytes += bytes as u64;
    }

    pub(crate) fn snapshot(&self) -> StatSample {
        *self.inner.lock()
    }
}

/// Liveness token of one connection, released when its task ends or is aborted.
pub(crate) struct ConnectionSlot(Arc<Counters>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct Generator {
    pub(crate) id: usize,
    pub(crate) slot: ConnectionSlot,
    pub(crate) sink: Box<dyn FrameSink>,
    pub(crate) payload: Vec<u8>,
    pub(crate) frame_interval: Duration,
    pub(crate) gate: Gate,
    pub(crate) counters: Arc<Counters>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Generator {
    pub(crate) async fn run(mut self) {
        let mut ticker = interval(self.frame_interval);
        // No catch-up burst after a pause
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let open = self.gate.read().await;
                    if !*open {
                        continue;
                    }
                    if let Err(e) = self.sink.send_frame(&self.payload).await {
                        warn!("Connection {} failed to send frame: {}", self.id, e);
                        break;
                    }
                    self.counters.record_frame(self.payload.len());
                }
            }
        }

        self.sink.close().await;
        debug!("Connection {} closed", self.id);
    }
}
