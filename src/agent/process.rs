//! Worker process entry point: bind, announce, serve.

use super::{AgentState, WorkerAgent};
use crate::error::TransportError;
use crate::rpc::{read_frame, write_frame, Command, Response};
use anyhow::{Context, Result};
use std::io::Write;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Write the endpoint handshake line. This must be the only thing the worker
/// ever writes to its stdout.
pub fn announce_endpoint<W: Write>(out: &mut W, endpoint: SocketAddr) -> std::io::Result<()> {
    writeln!(out, "{}", endpoint)?;
    out.flush()
}

/// Run a worker agent until the controller hangs up.
pub async fn run_worker_process() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to bind worker control endpoint")?;
    let endpoint = listener
        .local_addr()
        .context("Failed to read worker control endpoint")?;

    // The listener is already accepting, so the controller may connect as
    // soon as it reads this line.
    announce_endpoint(&mut std::io::stdout().lock(), endpoint)
        .context("Failed to announce endpoint on stdout")?;
    info!("Worker {} serving on {}", std::process::id(), endpoint);

    let mut agent = WorkerAgent::new();
    serve(listener, &mut agent).await?;

    if agent.state() != AgentState::Stopped {
        agent.handle(Command::StopProc).await.ok();
    }
    info!("Worker {} exiting", std::process::id());
    Ok(())
}

/// Serve commands from a single controller connection, one at a time.
pub async fn serve(listener: TcpListener, agent: &mut WorkerAgent) -> Result<()> {
    let (mut stream, peer) = listener
        .accept()
        .await
        .context("Failed to accept controller connection")?;
    socket2::SockRef::from(&stream)
        .set_nodelay(true)
        .context("Failed to configure control socket")?;
    debug!("Controller connected from {}", peer);

    loop {
        let command: Command = match read_frame(&mut stream).await {
            Ok(command) => command,
            Err(TransportError::Closed) => {
                debug!("Controller {} disconnected", peer);
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to read control command"),
        };

        let name = command.name();
        let response: Response = agent.handle(command).await;
        debug!("{} -> {:?}", name, response);

        write_frame(&mut stream, &response)
            .await
            .with_context(|| format!("Failed to answer {}", name))?;
    }
}
