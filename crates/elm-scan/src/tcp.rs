//! TCP transport for Wi-Fi ELM327 adapters.
//!
//! The adapter terminates every reply with a `>` prompt. Bytes are buffered
//! until the prompt arrives; anything after it stays buffered for the next
//! read.

use std::time::Duration;

use async_trait::async_trait;
use elm_engine::{Transport, TransportFailure, TransportResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const PROMPT: u8 = b'>';
const READ_CHUNK: usize = 256;

pub struct TcpTransport {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl TcpTransport {
    /// Connect to `host:port`, giving up after `connect_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> TransportResult<Self> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                TransportFailure(format!(
                    "connect to {addr} timed out after {}ms",
                    connect_timeout.as_millis()
                ))
            })??;
        stream.set_nodelay(true)?;
        tracing::info!(addr = %addr, "connected to adapter");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            pending: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Pop one prompt-terminated reply off the buffer, if complete.
    fn take_reply(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == PROMPT)?;
        let reply: Vec<u8> = self.pending.drain(..=end).take(end).collect();
        Some(String::from_utf8_lossy(&reply).into_owned())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write_command(&mut self, command: &str) -> TransportResult<()> {
        tracing::trace!(command, "tx");
        let line = format!("{command}\r");
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> TransportResult<String> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(reply) = self.take_reply() {
                tracing::trace!(reply = %reply.escape_debug(), "rx");
                return Ok(reply);
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(TransportFailure(
                    "adapter closed the connection".to_string(),
                ));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal adapter: answers each `\r`-terminated command from a table.
    async fn spawn_adapter(replies: Vec<(&'static str, &'static str)>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 64];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&chunk[..n]);
                while let Some(end) = buf.iter().position(|&b| b == b'\r') {
                    let cmd: Vec<u8> = buf.drain(..=end).take(end).collect();
                    let cmd = String::from_utf8(cmd).unwrap();
                    if cmd == "QUIT" {
                        return;
                    }
                    let reply = replies
                        .iter()
                        .find(|(c, _)| *c == cmd)
                        .map_or("?\r\r", |(_, r)| *r);
                    // Split the write to exercise buffering across reads.
                    let (head, tail) = reply.split_at(reply.len() / 2);
                    socket.write_all(head.as_bytes()).await.unwrap();
                    socket.flush().await.unwrap();
                    socket.write_all(tail.as_bytes()).await.unwrap();
                    socket.write_all(b">").await.unwrap();
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn reads_until_prompt() {
        let port = spawn_adapter(vec![
            ("ATI", "ELM327 v1.5\r\r"),
            ("0100", "41 00 BE 3F A8 13\r\r"),
        ])
        .await;
        let mut transport = TcpTransport::connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(transport.send("ATI").await.unwrap(), "ELM327 v1.5\r\r");
        assert_eq!(
            transport.send("0100").await.unwrap(),
            "41 00 BE 3F A8 13\r\r"
        );
        assert_eq!(transport.send("ATXX").await.unwrap(), "?\r\r");
    }

    #[tokio::test]
    async fn closed_connection_is_a_transport_failure() {
        let port = spawn_adapter(vec![]).await;
        let mut transport = TcpTransport::connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();

        transport.write_command("QUIT").await.unwrap();
        let err = transport.read_reply().await.unwrap_err();
        assert!(err.0.contains("closed"));
    }

    #[tokio::test]
    async fn refused_connection_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpTransport::connect("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(result.is_err());
    }
}
