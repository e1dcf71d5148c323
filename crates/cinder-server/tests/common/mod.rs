//! Test helpers: an in-process server on an ephemeral port and a
//! minimal RESP client speaking raw TCP.

// each test binary uses a different subset of the helpers
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cinder_protocol::{parse_frame, Frame};
use cinder_server::{Server, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A server running inside the test's runtime.
pub struct TestServer {
    pub addr: SocketAddr,
}

impl TestServer {
    /// Boots a server on an ephemeral localhost port.
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::ephemeral()).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let server = Server::bind(config).await.expect("bind test server");
        let addr = server.local_addr().expect("server has a local addr");
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        Self { addr }
    }

    /// Connects a test client to this server.
    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }
}

/// A minimal RESP client for integration testing.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to {addr}: {e}"));
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Writes raw bytes to the socket (for inline commands and
    /// malformed-input tests).
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Sends a command as a RESP array and returns the reply frame.
    pub async fn cmd(&mut self, args: &[&str]) -> Frame {
        let parts: Vec<Frame> = args
            .iter()
            .map(|a| Frame::Bulk(Bytes::copy_from_slice(a.as_bytes())))
            .collect();
        let frame = Frame::Array(parts);

        let mut out = BytesMut::new();
        frame.serialize(&mut out);
        self.stream.write_all(&out).await.unwrap();

        self.read_frame().await
    }

    /// Sends a command and extracts the bulk string value
    /// (None = null bulk).
    pub async fn get_bulk(&mut self, args: &[&str]) -> Option<String> {
        match self.cmd(args).await {
            Frame::Bulk(data) => Some(String::from_utf8_lossy(&data).to_string()),
            Frame::Null => None,
            other => panic!("expected Bulk or Null, got {other:?}"),
        }
    }

    /// Sends a command and extracts the integer value.
    pub async fn get_int(&mut self, args: &[&str]) -> i64 {
        match self.cmd(args).await {
            Frame::Integer(n) => n,
            other => panic!("expected Integer, got {other:?}"),
        }
    }

    /// Sends a command and expects a Simple "OK" response.
    pub async fn ok(&mut self, args: &[&str]) {
        match self.cmd(args).await {
            Frame::Simple(s) if s == "OK" => {}
            other => panic!("expected OK, got {other:?}"),
        }
    }

    /// Sends a command and expects an error. Returns the message.
    pub async fn err(&mut self, args: &[&str]) -> String {
        match self.cmd(args).await {
            Frame::Error(msg) => msg,
            other => panic!("expected Error, got {other:?}"),
        }
    }

    /// Reads the next frame without sending anything first, for
    /// pub/sub pushes and pipelined replies.
    pub async fn read_frame(&mut self) -> Frame {
        loop {
            match parse_frame(&self.buf) {
                Ok(Some((frame, consumed))) => {
                    let _ = self.buf.split_to(consumed);
                    return frame;
                }
                Ok(None) => {
                    let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read_buf(&mut self.buf))
                        .await
                        .expect("timed out waiting for frame")
                        .unwrap();
                    if n == 0 {
                        panic!("server closed connection while waiting for frame");
                    }
                }
                Err(e) => panic!("protocol error: {e}"),
            }
        }
    }

    /// Reads exactly `n` raw bytes, draining any already-buffered
    /// bytes first. For literal wire-shape assertions.
    pub async fn read_raw(&mut self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        let take = self.buf.len().min(n);
        out.extend_from_slice(&self.buf.split_to(take));
        while out.len() < n {
            let mut chunk = vec![0u8; n - out.len()];
            let read = tokio::time::timeout(IO_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for raw bytes")
                .unwrap();
            if read == 0 {
                panic!("server closed connection after {} of {n} bytes", out.len());
            }
            out.extend_from_slice(&chunk[..read]);
        }
        out
    }

    /// True when the server has closed the connection (EOF).
    pub async fn at_eof(&mut self) -> bool {
        if !self.buf.is_empty() {
            return false;
        }
        let mut probe = [0u8; 1];
        match tokio::time::timeout(IO_TIMEOUT, self.stream.read(&mut probe)).await {
            Ok(Ok(0)) => true,
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&probe[..n]);
                false
            }
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }
}
