//! # Worker Handle
//!
//! Controller-side record of one spawned worker process. Spawning follows a
//! strict handshake:
//!
//! 1. The controller creates an OS pipe and hands its write end to the child
//!    as stdout.
//! 2. The worker binds its control endpoint and writes `host:port\n`.
//! 3. The controller reads exactly one line within the startup timeout,
//!    connects to that endpoint, and from then on talks to the worker only
//!    over the control channel.
//!
//! A worker that produces no line in time is killed and reported as a
//! `SpawnError`.

use crate::error::{ControlError, SpawnError, TransportError};
use crate::rpc::{Command, Reply, RpcClient, WorkerControl};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Name of the binary that doubles as controller and worker.
const EXE_NAME: &str = "ws-stress";

/// Hidden flag that switches the binary into worker mode.
pub const WORKER_FLAG: &str = "--internal-run-as-worker";

/// Program and arguments used to launch a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-run our own binary in worker mode.
    ///
    /// When running tests, `current_exe()` points to the test runner binary,
    /// not the application binary, so resolution falls back to the Cargo
    /// provided path and finally to `target/debug`.
    pub fn current_binary() -> Result<Self, SpawnError> {
        let mut exe_path = None;

        if let Ok(current_exe) = std::env::current_exe() {
            let stem = current_exe.file_stem().and_then(|n| n.to_str());
            if stem == Some(EXE_NAME) {
                exe_path = Some(current_exe);
            }
        }

        if exe_path.is_none() {
            if let Some(p) = std::env::var_os("CARGO_BIN_EXE_ws-stress") {
                let pbuf = PathBuf::from(p);
                if pbuf.exists() {
                    exe_path = Some(pbuf);
                }
            }
        }

        if exe_path.is_none() {
            let p = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("target")
                .join("debug")
                .join(format!("{}{}", EXE_NAME, std::env::consts::EXE_SUFFIX));
            if p.exists() {
                exe_path = Some(p);
            }
        }

        let program = exe_path.ok_or_else(|| {
            SpawnError::BinaryNotFound(format!(
                "build it with `cargo build --bin {}` first",
                EXE_NAME
            ))
        })?;

        Ok(Self::new(program, [WORKER_FLAG]))
    }
}

/// A spawned worker process and its control channel.
pub struct WorkerHandle {
    child: Child,
    endpoint: SocketAddr,
    client: RpcClient,
    terminated: bool,
}

impl WorkerHandle {
    /// Launch a worker and complete the endpoint handshake.
    pub async fn spawn(
        command: &WorkerCommand,
        startup_timeout: Duration,
    ) -> Result<Self, SpawnError> {
        let started = Instant::now();
        let (reader, writer) = os_pipe::pipe().map_err(SpawnError::Pipe)?;

        let mut cmd = std::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(Stdio::inherit());

        debug!("Spawning worker: {}", command.program.display());
        let mut child = cmd.spawn().map_err(SpawnError::Launch)?;
        // Release our copy of the pipe's write end, otherwise a dead child
        // would never produce EOF on the handshake channel.
        drop(cmd);

        let read_line = tokio::task::spawn_blocking(move || {
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).map(|_| line)
        });

        let line = match timeout(startup_timeout, read_line).await {
            Ok(Ok(Ok(line))) => line,
            Ok(Ok(Err(e))) => {
                terminate(&mut child);
                return Err(SpawnError::HandshakeRead(e));
            }
            Ok(Err(join_err)) => {
                terminate(&mut child);
                return Err(SpawnError::HandshakeRead(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    join_err,
                )));
            }
            Err(_) => {
                // Killing the child also unblocks the pending read
                terminate(&mut child);
                return Err(SpawnError::HandshakeTimeout(startup_timeout));
            }
        };

        let endpoint = match parse_endpoint(&line) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                terminate(&mut child);
                return Err(e);
            }
        };

        let remaining = startup_timeout.saturating_sub(started.elapsed());
        let client = match timeout(remaining, RpcClient::connect(endpoint)).await {
            Ok(Ok(client)) => client,
            Ok(Err(source)) => {
                terminate(&mut child);
                return Err(SpawnError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                });
            }
            Err(_) => {
                terminate(&mut child);
                return Err(SpawnError::HandshakeTimeout(startup_timeout));
            }
        };

        debug!(
            "Worker {} ready at {} after {:?}",
            child.id(),
            endpoint,
            started.elapsed()
        );

        Ok(Self {
            child,
            endpoint,
            client,
            terminated: false,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }
}

fn parse_endpoint(line: &str) -> Result<SocketAddr, SpawnError> {
    if line.is_empty() {
        return Err(SpawnError::HandshakeClosed);
    }
    let trimmed = line.trim();
    trimmed
        .parse()
        .map_err(|_| SpawnError::BadEndpoint(trimmed.to_string()))
}

/// Kill and reap a child. A child that already exited is only reaped.
fn terminate(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("Worker {} already exited with {}", child.id(), status);
        }
        _ => {
            if let Err(e) = child.kill() {
                warn!("Failed to kill worker {}: {}", child.id(), e);
            }
            let _ = child.wait();
        }
    }
}

#[async_trait]
impl WorkerControl for WorkerHandle {
    async fn call(&mut self, command: Command) -> Result<Reply, ControlError> {
        if self.terminated {
            return Err(TransportError::Closed.into());
        }
        self.client.call(&command).await
    }

    fn kill(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        terminate(&mut self.child);
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh", ["-c", script])
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("127.0.0.1:4000\n").unwrap(),
            "127.0.0.1:4000".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(parse_endpoint(""), Err(SpawnError::HandshakeClosed)));
        assert!(matches!(
            parse_endpoint("PYRO:obj@localhost\n"),
            Err(SpawnError::BadEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let started = Instant::now();
        let err = WorkerHandle::spawn(&shell("exec sleep 10"), Duration::from_millis(300))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpawnError::HandshakeTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_worker_exiting_before_handshake() {
        let err = WorkerHandle::spawn(&shell("exit 3"), Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpawnError::HandshakeClosed));
    }

    #[tokio::test]
    async fn test_garbage_handshake_line() {
        let err = WorkerHandle::spawn(&shell("echo hello; exec sleep 10"), Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpawnError::BadEndpoint(line) if line == "hello"));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_launch() {
        let command = WorkerCommand::new("/nonexistent/ws-stress-worker", Vec::<OsString>::new());
        let err = WorkerHandle::spawn(&command, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpawnError::Launch(_)));
    }
}
