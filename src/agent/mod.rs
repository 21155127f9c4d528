//! # Worker Agent
//!
//! The agent lives inside a spawned worker process. It owns the traffic
//! connections and the cumulative counters, and answers the six control
//! commands according to this state machine:
//!
//! ```text
//! Idle --init--> Initialized --start--> Running <--pause/unpause--> Paused
//!                                           |                         |
//!                                           +-------stop_proc---------+--> Stopped
//! ```
//!
//! `stat` is valid in every state after `init`, and `stop_proc` is valid in
//! every state. Repeating `stop_proc` returns the frozen final counters.

use crate::error::ControlError;
use crate::rpc::{AgentFault, Command, InitSettings, Reply, WorkerControl, WorkerStats};
use crate::utils::{validate_connections, validate_frame_interval, validate_packet_size};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

pub mod connection;
pub mod process;
pub mod sink;

use connection::{Counters, Gate, Generator};

pub use process::{announce_endpoint, run_worker_process, serve};

/// How long `stop_proc` waits for connections to close before aborting them.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of a worker agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Initialized,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct WorkerAgent {
    state: AgentState,
    counters: Arc<Counters>,
    gate: Gate,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for WorkerAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerAgent {
    pub fn new() -> Self {
        Self {
            state: AgentState::Idle,
            counters: Arc::new(Counters::default()),
            gate: Arc::new(RwLock::new(false)),
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Dispatch one control command.
    pub async fn handle(&mut self, command: Command) -> Result<Reply, AgentFault> {
        match command {
            Command::Init(settings) => self.init_connections(settings).await.map(|_| Reply::Ack),
            Command::Start => self.resume("start", &[AgentState::Initialized, AgentState::Paused]).await.map(|_| Reply::Ack),
            Command::Pause => self.suspend().await.map(|_| Reply::Ack),
            Command::Stat => self.snapshot().map(Reply::Stat),
            Command::Unpause => self.resume("unpause", &[AgentState::Paused]).await.map(|_| Reply::Ack),
            Command::StopProc => {
                self.stop().await;
                Ok(Reply::Stat(self.stats()))
            }
        }
    }

    fn invalid(&self, command: &str) -> AgentFault {
        AgentFault::InvalidState {
            command: command.to_string(),
            state: self.state.to_string(),
        }
    }

    async fn init_connections(&mut self, settings: InitSettings) -> Result<(), AgentFault> {
        if self.state != AgentState::Idle {
            return Err(self.invalid("init"));
        }
        validate_settings(&settings)?;

        let url = Url::parse(&settings.url)
            .map_err(|e| AgentFault::InvalidArgument(format!("bad url {:?}: {}", settings.url, e)))?;

        info!(
            "Opening {} connection(s) to {} ({} byte frames every {:?})",
            settings.connections, url, settings.packet_size, settings.frame_interval
        );

        let sinks = try_join_all((0..settings.connections).map(|_| sink::open_sink(&url))).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let payload = vec![0u8; settings.packet_size as usize];

        for (id, sink) in sinks.into_iter().enumerate() {
            let generator = Generator {
                id,
                slot: self.counters.open_slot(),
                sink,
                payload: payload.clone(),
                frame_interval: settings.frame_interval,
                gate: self.gate.clone(),
                counters: self.counters.clone(),
                shutdown: shutdown_rx.clone(),
            };
            self.tasks.push(tokio::spawn(generator.run()));
        }

        self.shutdown = Some(shutdown_tx);
        self.state = AgentState::Initialized;
        Ok(())
    }

    async fn resume(&mut self, command: &str, from: &[AgentState]) -> Result<(), AgentFault> {
        if !from.contains(&self.state) {
            return Err(self.invalid(command));
        }
        *self.gate.write().await = true;
        self.state = AgentState::Running;
        debug!("Frame generation running");
        Ok(())
    }

    /// Close the gate. Returns only after in-flight frames have been counted.
    async fn suspend(&mut self) -> Result<(), AgentFault> {
        if self.state != AgentState::Running {
            return Err(self.invalid("pause"));
        }
        *self.gate.write().await = false;
        self.state = AgentState::Paused;
        debug!("Frame generation paused at {:?}", self.counters.snapshot());
        Ok(())
    }

    fn snapshot(&self) -> Result<WorkerStats, AgentFault> {
        if self.state == AgentState::Idle {
            return Err(self.invalid("stat"));
        }
        Ok(self.stats())
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            sample: self.counters.snapshot(),
            connections_alive: self.counters.connections_alive(),
        }
    }

    async fn stop(&mut self) {
        if self.state == AgentState::Stopped {
            return;
        }

        *self.gate.write().await = false;
        self.state = AgentState::Stopped;

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }

        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("Connection did not close within {:?}, aborting", STOP_GRACE);
                task.abort();
                let _ = task.await;
            }
        }

        let last = self.counters.snapshot();
        info!("Stopped with {} frames, {} bytes", last.frames, last.bytes);
    }

    fn abort_connections(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shutdown = None;
    }
}

/// Same limits the controller applies to its command line, so a direct
/// `init` cannot ask for an unbounded allocation.
fn validate_settings(settings: &InitSettings) -> Result<(), AgentFault> {
    validate_connections(settings.connections as usize)
        .and_then(|_| validate_packet_size(settings.packet_size as usize))
        .and_then(|_| validate_frame_interval(settings.frame_interval))
        .map_err(|e| AgentFault::InvalidArgument(e.to_string()))
}

impl Drop for WorkerAgent {
    fn drop(&mut self) {
        self.abort_connections();
    }
}

#[async_trait]
impl WorkerControl for WorkerAgent {
    async fn call(&mut self, command: Command) -> Result<Reply, ControlError> {
        Ok(self.handle(command).await?)
    }

    fn kill(&mut self) {
        self.abort_connections();
        self.state = AgentState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::StatSample;

    const TICK: Duration = Duration::from_millis(10);

    fn null_settings(connections: u32) -> InitSettings {
        InitSettings {
            connections,
            url: "null://local".to_string(),
            packet_size: 1000,
            frame_interval: TICK,
        }
    }

    async fn running_agent(connections: u32) -> WorkerAgent {
        let mut agent = WorkerAgent::new();
        agent.init(null_settings(connections)).await.unwrap();
        agent.start().await.unwrap();
        agent
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let mut agent = WorkerAgent::new();
        assert_eq!(agent.state(), AgentState::Idle);

        agent.init(null_settings(2)).await.unwrap();
        assert_eq!(agent.state(), AgentState::Initialized);

        agent.start().await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);

        agent.pause().await.unwrap();
        assert_eq!(agent.state(), AgentState::Paused);

        agent.unpause().await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);

        agent.stop_proc().await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_out_of_order_commands_are_rejected() {
        let mut agent = WorkerAgent::new();

        let err = agent.handle(Command::Stat).await.unwrap_err();
        assert_eq!(
            err,
            AgentFault::InvalidState {
                command: "stat".to_string(),
                state: "Idle".to_string()
            }
        );
        assert!(agent.handle(Command::Start).await.is_err());
        assert!(agent.handle(Command::Pause).await.is_err());

        agent.handle(Command::Init(null_settings(1))).await.unwrap();
        assert!(agent.handle(Command::Init(null_settings(1))).await.is_err());
        assert!(agent.handle(Command::Unpause).await.is_err());

        agent.handle(Command::StopProc).await.unwrap();
        for command in [Command::Start, Command::Pause, Command::Unpause, Command::Init(null_settings(1))] {
            assert!(matches!(
                agent.handle(command).await,
                Err(AgentFault::InvalidState { .. })
            ));
        }
        // stat stays valid after stop
        assert!(agent.handle(Command::Stat).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let mut agent = WorkerAgent::new();
        let mut settings = null_settings(0);
        assert!(matches!(
            agent.handle(Command::Init(settings.clone())).await,
            Err(AgentFault::InvalidArgument(_))
        ));

        settings.connections = 1;
        settings.url = "not a url".to_string();
        assert!(matches!(
            agent.handle(Command::Init(settings)).await,
            Err(AgentFault::InvalidArgument(_))
        ));
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_pause_freezes_counters() {
        let mut agent = running_agent(3).await;
        tokio::time::sleep(TICK * 5).await;

        agent.pause().await.unwrap();
        let first = agent.stat().await.unwrap();
        tokio::time::sleep(TICK * 5).await;
        let second = agent.stat().await.unwrap();

        assert!(first.frames > 0);
        assert_eq!(first, second);
        assert_eq!(first.bytes, first.frames * 1000);
    }

    #[tokio::test]
    async fn test_counters_grow_after_unpause() {
        let mut agent = running_agent(1).await;
        tokio::time::sleep(TICK * 3).await;
        agent.pause().await.unwrap();
        let paused = agent.stat().await.unwrap();

        agent.unpause().await.unwrap();
        let mut previous = agent.stat().await.unwrap();
        assert!(previous >= paused);
        for _ in 0..5 {
            tokio::time::sleep(TICK * 2).await;
            let current = agent.stat().await.unwrap();
            assert!(current.frames >= previous.frames);
            assert!(current.bytes >= previous.bytes);
            previous = current;
        }
        assert!(previous.frames > paused.frames);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut agent = running_agent(2).await;
        tokio::time::sleep(TICK * 3).await;

        let first = agent.stop_proc().await.unwrap();
        tokio::time::sleep(TICK * 3).await;
        let second = agent.stop_proc().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(agent.stat().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_stop_from_idle_reports_zero() {
        let mut agent = WorkerAgent::new();
        assert_eq!(agent.stop_proc().await.unwrap(), StatSample::ZERO);
    }

    #[tokio::test]
    async fn test_oversized_settings_are_rejected() {
        let mut agent = WorkerAgent::new();

        let mut settings = null_settings(1);
        settings.packet_size = u32::MAX;
        assert!(matches!(
            agent.handle(Command::Init(settings)).await,
            Err(AgentFault::InvalidArgument(_))
        ));

        let mut settings = null_settings(u32::from(u16::MAX) + 1);
        settings.packet_size = 1000;
        assert!(matches!(
            agent.handle(Command::Init(settings)).await,
            Err(AgentFault::InvalidArgument(_))
        ));

        assert_eq!(agent.state(), AgentState::Idle);
        agent.init(null_settings(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stat_reports_live_connections() {
        let mut agent = running_agent(3).await;
        let stats = agent.stat_with_health().await.unwrap();
        assert_eq!(stats.connections_alive, 3);

        agent.stop_proc().await.unwrap();
        let stats = agent.stat_with_health().await.unwrap();
        assert_eq!(stats.connections_alive, 0);
    }
}
