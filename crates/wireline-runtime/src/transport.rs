//! Line-framed daemon transport
//!
//! The daemon listens on a TCP port or a Unix socket and speaks
//! newline-delimited JSON-RPC. Each account uses two independent
//! connections: a command channel for request/response calls and an event
//! channel that, once subscribed, streams `receive` notifications.
//!
//! The daemon does not echo request ids back in a correlatable way, so a
//! connection keeps at most one request in flight and reads responses in
//! order.

#[cfg(unix)]
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, trace};

use wireline_core::errors::{Result, TransportError};
use wireline_core::rpc::{RpcRequest, RpcResponse};
use wireline_core::WirelineError;

// ----------------------------------------------------------------------------
// Server Address
// ----------------------------------------------------------------------------

/// Where the daemon is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    /// A `host:port` TCP endpoint.
    Tcp(String),
    /// A Unix domain socket path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerAddress::Tcp(addr) => write!(f, "tcp:{addr}"),
            #[cfg(unix)]
            ServerAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

// ----------------------------------------------------------------------------
// Daemon Connection
// ----------------------------------------------------------------------------

/// One line-framed connection to the daemon.
pub struct DaemonConnection {
    reader: BufReader<Box<dyn AsyncRead + Send + Sync + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    next_id: u64,
}

impl DaemonConnection {
    /// Connect to the daemon at `address`.
    pub async fn connect(address: &ServerAddress) -> Result<Self> {
        match address {
            ServerAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(|e| {
                    WirelineError::connection_failed(address.to_string(), e.to_string())
                })?;
                Ok(Self::from_stream(stream))
            }
            #[cfg(unix)]
            ServerAddress::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    WirelineError::connection_failed(address.to_string(), e.to_string())
                })?;
                Ok(Self::from_stream(stream))
            }
        }
    }

    /// Wrap an already-established stream. Tests use this with an in-memory
    /// duplex pipe.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
            next_id: 0,
        }
    }

    /// Write one newline-terminated frame.
    pub async fn send_frame(&mut self, frame: &str) -> Result<()> {
        trace!(frame = frame.trim_end(), "sending frame");
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(TransportError::NetworkIo)?;
        self.writer.flush().await.map_err(TransportError::NetworkIo)?;
        Ok(())
    }

    /// Read one frame, `None` on a cleanly closed connection.
    pub async fn read_frame(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(TransportError::NetworkIo)?;
        if read == 0 {
            return Ok(None);
        }
        trace!(frame = line.trim_end(), "received frame");
        Ok(Some(line.trim_end().to_string()))
    }

    /// Issue one request and read its response. Single in-flight: callers
    /// hold `&mut self` for the whole exchange.
    pub async fn call(&mut self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        self.next_id += 1;
        debug!(method, id = self.next_id, "rpc call");
        let frame = RpcRequest::new(self.next_id, method, params).to_frame()?;
        self.send_frame(&frame).await?;
        let line = self.read_frame().await?.ok_or_else(|| {
            WirelineError::Transport(TransportError::Closed {
                reason: format!("connection closed awaiting {method} response"),
            })
        })?;
        RpcResponse::parse(&line)?.into_result()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn call_round_trips_over_a_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = DaemonConnection::from_stream(client);

        let server_task = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read);
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request["method"], "listContacts");
            write
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":[]}\n")
                .await
                .unwrap();
        });

        let result = connection
            .call("listContacts", serde_json::json!({"account": "+1555"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!([]));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn daemon_error_surfaces_as_protocol_error() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = DaemonConnection::from_stream(client);

        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read);
            let mut line = String::new();
            lines.read_line(&mut line).await.unwrap();
            write
                .write_all(
                    b"{\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{\"code\":-1,\"message\":\"no\"}}\n",
                )
                .await
                .unwrap();
        });

        let err = connection
            .call("register", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_daemon_error());
    }

    #[test]
    fn connection_moves_between_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DaemonConnection>();
    }

    #[tokio::test]
    async fn closed_connection_reads_none() {
        let (client, server) = tokio::io::duplex(64);
        let mut connection = DaemonConnection::from_stream(client);
        drop(server);
        assert!(connection.read_frame().await.unwrap().is_none());
    }
}
