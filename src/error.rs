//! # Error Taxonomy
//!
//! Failures are split by how the controller reacts to them:
//!
//! - **SpawnError**: a worker never came up. Fatal before any traffic flows.
//! - **TransportError**: the control channel to a worker broke. Fatal to the run.
//! - **AgentFault**: the worker answered, but refused the command. An
//!   `InvalidState` fault means the controller sequenced commands wrongly.
//! - **CollectorError** (see `collector`): never fatal, the report just loses
//!   that data point.

use crate::rpc::AgentFault;
use std::time::Duration;
use thiserror::Error;

/// A worker process failed to start or never announced its endpoint.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("could not resolve worker binary: {0}")]
    BinaryNotFound(String),

    #[error("failed to create handshake pipe: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("failed to launch worker process: {0}")]
    Launch(#[source] std::io::Error),

    #[error("worker did not announce its endpoint within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("worker closed its handshake channel without announcing an endpoint")]
    HandshakeClosed,

    #[error("failed to read handshake line: {0}")]
    HandshakeRead(#[source] std::io::Error),

    #[error("handshake line {0:?} is not a socket address")]
    BadEndpoint(String),

    #[error("failed to connect to worker endpoint {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
}

/// The control channel to a worker is unusable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error on control channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("control frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("failed to encode or decode control frame: {0}")]
    Codec(#[from] bincode::Error),

    #[error("control channel closed by peer")]
    Closed,

    #[error("unexpected reply {reply} to {command}")]
    UnexpectedReply {
        command: &'static str,
        reply: &'static str,
    },
}

/// Errors surfaced to the orchestrator, tagged with the worker they came from.
#[derive(Debug, Error)]
pub enum LoadTestError {
    #[error("worker {worker} failed to spawn: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: SpawnError,
    },

    #[error("worker {worker} is unreachable: {source}")]
    Transport {
        worker: usize,
        #[source]
        source: TransportError,
    },

    #[error("worker {worker} rejected {command} in state {state}")]
    ProtocolState {
        worker: usize,
        command: String,
        state: String,
    },

    #[error("worker {worker} failed: {fault}")]
    Agent { worker: usize, fault: AgentFault },
}

/// Error returned by a single `WorkerControl` call, before the orchestrator
/// knows which worker index it belongs to.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Agent(#[from] AgentFault),
}

impl ControlError {
    /// Attach the worker index, promoting state faults to `ProtocolState`.
    pub fn for_worker(self, worker: usize) -> LoadTestError {
        match self {
            ControlError::Transport(source) => LoadTestError::Transport { worker, source },
            ControlError::Agent(AgentFault::InvalidState { command, state }) => {
                LoadTestError::ProtocolState {
                    worker,
                    command,
                    state,
                }
            }
            ControlError::Agent(fault) => LoadTestError::Agent { worker, fault },
        }
    }
}
