//! Control channel transport.
//!
//! Every message is a `u32` little-endian length followed by a bincode body
//! of at most `MAX_FRAME_SIZE` bytes. The controller writes one `Command`
//! and reads back one `Response`; there is never more than one request in
//! flight per connection.

use super::{Command, Reply, Response};
use crate::error::{ControlError, TransportError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound for one encoded control frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read one length-prefixed bincode frame.
///
/// A clean EOF before the length prefix is reported as `Closed` so the
/// serve loop can tell a departed controller from a broken one.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    // Read frame length (4 bytes)
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(TransportError::Closed),
        Err(e) => return Err(e.into()),
    }
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(frame_len));
    }

    let mut frame = vec![0u8; frame_len];
    reader.read_exact(&mut frame).await?;

    Ok(bincode::deserialize(&frame)?)
}

/// Write one length-prefixed bincode frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(value)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }

    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Controller side of one worker's control channel.
///
/// Calls are strictly request/response; the worker handles one command at
/// a time.
pub struct RpcClient {
    stream: TcpStream,
    peer: SocketAddr,
}

impl RpcClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;

        // Control frames are tiny and latency sensitive (the pause barrier)
        socket2::SockRef::from(&stream).set_nodelay(true)?;

        debug!("Control channel connected to {}", addr);
        Ok(Self { stream, peer: addr })
    }

    pub async fn call(&mut self, command: &Command) -> Result<Reply, ControlError> {
        write_frame(&mut self.stream, command).await?;
        let response: Response = read_frame(&mut self.stream).await?;
        debug!("{} -> {:?} ({})", command.name(), response, self.peer);
        Ok(response?)
    }
}
