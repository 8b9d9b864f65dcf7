//! Length-prefixed TCP transport for remote commands.

use super::{RemoteCommandRequest, RemoteCommandResponse, RemoteCommandRunner};
use crate::error::{Error, ErrorCode, Result};
use crate::network::rpc::{frame, MAX_FRAME_SIZE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// What travels in a request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Database the command is addressed to.
    pub db_name: String,

    /// Encoded command.
    pub command: Bytes,
}

/// Runs each command over a fresh TCP connection: one request frame out,
/// one reply frame back.
#[derive(Debug, Clone)]
pub struct TcpCommandRunner {
    connect_timeout: Duration,
}

impl Default for TcpCommandRunner {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl TcpCommandRunner {
    /// Create a runner with the default connect timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

fn io_error(context: &str, addr: &str, e: io::Error) -> Error {
    let code = match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrNotAvailable => {
            ErrorCode::HostUnreachable
        }
        io::ErrorKind::TimedOut => ErrorCode::NetworkTimeout,
        _ => ErrorCode::SocketException,
    };
    Error::transport(code, format!("{} {}: {}", context, addr, e))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let framed = frame(payload)?;
    writer
        .write_all(&framed)
        .await
        .map_err(|e| io_error("write to", "peer", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_error("flush to", "peer", e))
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| io_error("read length from", "peer", e))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::transport(
            ErrorCode::SocketException,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| io_error("read frame from", "peer", e))?;
    Ok(buf)
}

#[async_trait::async_trait]
impl RemoteCommandRunner for TcpCommandRunner {
    async fn run_command(&self, request: &RemoteCommandRequest) -> Result<RemoteCommandResponse> {
        let started = Instant::now();
        let addr = request.target.to_string();

        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                Error::transport(
                    ErrorCode::HostUnreachable,
                    format!("connection timeout to {}", addr),
                )
            })?
            .map_err(|e| io_error("connect to", &addr, e))?;

        let payload = bincode::serialize(&RequestFrame {
            db_name: request.db_name.clone(),
            command: request.command.clone(),
        })?;
        write_frame(&mut stream, &payload).await?;
        let reply = read_frame(&mut stream).await?;

        tracing::trace!(target_host = %addr, bytes = reply.len(), "Received command reply");

        Ok(RemoteCommandResponse {
            data: Bytes::from(reply),
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::{decode_command, Command, CommandReply, OpenCursorCommand};
    use crate::types::{HostAndPort, Namespace};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut socket).await.unwrap();
            let request: RequestFrame = bincode::deserialize(&request).unwrap();
            assert_eq!(request.db_name, "test");

            let ns = match decode_command(&request.command).unwrap() {
                Command::OpenCursor(cmd) => Namespace::parse(&cmd.namespace).unwrap(),
                other => panic!("Wrong command type: {:?}", other),
            };
            let reply = CommandReply::cursor(9, &ns, Vec::new()).encode().unwrap();
            write_frame(&mut socket, &reply).await.unwrap();
        });

        let ns = Namespace::parse("test.users").unwrap();
        let command = OpenCursorCommand::new(&ns, Bytes::new()).encode().unwrap();
        let request =
            RemoteCommandRequest::new(HostAndPort::new("127.0.0.1", port), "test", command);

        let response = TcpCommandRunner::new().run_command(&request).await.unwrap();
        assert_eq!(
            crate::network::CursorResponse::parse_from_bytes(&response.data)
                .unwrap()
                .cursor_id,
            9
        );

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_retriable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let request = RemoteCommandRequest::new(
            HostAndPort::new("127.0.0.1", port),
            "test",
            Bytes::from_static(b"x"),
        );
        let err = TcpCommandRunner::new().run_command(&request).await.unwrap_err();
        assert!(err.is_retriable(), "unexpected error: {err}");
    }
}
