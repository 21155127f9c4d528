//! # Worker Control Contract
//!
//! The controller drives every worker through the same six commands. They
//! are defined here once as plain enums so both sides of the process
//! boundary agree on them at compile time:
//!
//! | Command    | Reply             |
//! |------------|-------------------|
//! | `Init`     | `Ack`             |
//! | `Start`    | `Ack`             |
//! | `Pause`    | `Ack`             |
//! | `Stat`     | `Stat(stats)`     |
//! | `Unpause`  | `Ack`             |
//! | `StopProc` | `Stat(stats)`     |
//!
//! `WorkerControl` is the seam the orchestrator talks through. The remote
//! `WorkerHandle` implements it over a TCP control channel and the in-process
//! `WorkerAgent` implements it directly.

use crate::aggregate::StatSample;
use crate::error::{ControlError, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod tcp;

pub use tcp::{read_frame, write_frame, RpcClient, MAX_FRAME_SIZE};

/// Parameters of the `init` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitSettings {
    /// Number of independent traffic generators to open.
    pub connections: u32,
    /// Target of every connection, e.g. `ws://127.0.0.1:8080/streaming`.
    pub url: String,
    /// Size of every frame in bytes.
    pub packet_size: u32,
    /// Time between two frames on one connection.
    pub frame_interval: Duration,
}

/// Request sent from the controller to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Init(InitSettings),
    Start,
    Pause,
    Stat,
    Unpause,
    StopProc,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Init(_) => "init",
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Stat => "stat",
            Command::Unpause => "unpause",
            Command::StopProc => "stop_proc",
        }
    }
}

/// Counters of one worker plus how many of its connections still stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub sample: StatSample,
    pub connections_alive: u32,
}

/// Successful answer to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    Stat(WorkerStats),
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Ack => "ack",
            Reply::Stat(_) => "stat",
        }
    }
}

/// A worker refused or failed to carry out a command.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum AgentFault {
    #[error("{command} is not allowed in state {state}")]
    InvalidState { command: String, state: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
}

/// Wire form of a worker's answer.
pub type Response = Result<Reply, AgentFault>;

/// The command surface of one worker, local or remote.
#[async_trait]
pub trait WorkerControl: Send {
    /// Carry out one command and return its reply.
    async fn call(&mut self, command: Command) -> Result<Reply, ControlError>;

    /// Forcibly tear the worker down. Safe to call any number of times.
    fn kill(&mut self);

    /// OS process id, if the worker lives in its own process.
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn init(&mut self, settings: InitSettings) -> Result<(), ControlError> {
        expect_ack("init", self.call(Command::Init(settings)).await?)
    }

    async fn start(&mut self) -> Result<(), ControlError> {
        expect_ack("start", self.call(Command::Start).await?)
    }

    async fn pause(&mut self) -> Result<(), ControlError> {
        expect_ack("pause", self.call(Command::Pause).await?)
    }

    async fn stat(&mut self) -> Result<StatSample, ControlError> {
        Ok(self.stat_with_health().await?.sample)
    }

    /// `stat`, keeping the live connection count of the reply.
    async fn stat_with_health(&mut self) -> Result<WorkerStats, ControlError> {
        expect_stat("stat", self.call(Command::Stat).await?)
    }

    async fn unpause(&mut self) -> Result<(), ControlError> {
        expect_ack("unpause", self.call(Command::Unpause).await?)
    }

    async fn stop_proc(&mut self) -> Result<StatSample, ControlError> {
        Ok(expect_stat("stop_proc", self.call(Command::StopProc).await?)?.sample)
    }
}

fn expect_ack(command: &'static str, reply: Reply) -> Result<(), ControlError> {
    match reply {
        Reply::Ack => Ok(()),
        other => Err(TransportError::UnexpectedReply {
            command,
            reply: other.name(),
        }
        .into()),
    }
}

fn expect_stat(command: &'static str, reply: Reply) -> Result<WorkerStats, ControlError> {
    match reply {
        Reply::Stat(stats) => Ok(stats),
        other => Err(TransportError::UnexpectedReply {
            command,
            reply: other.name(),
        }
        .into()),
    }
}
