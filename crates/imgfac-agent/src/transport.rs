//! TCP transport to the management broker.
//!
//! This is not AMQP: the broker end must speak the same framing. Messages
//! are JSON documents framed with a `Content-Length` header:
//!
//! ```text
//! Content-Length: 42\r\n
//! \r\n
//! {"kind":"agent_close","agent":"..."}
//! ```
//!
//! A background reader task parses incoming frames and hands them to the
//! connection owner over a channel.

use crate::types::AgentError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Port used when the connection target names none.
pub const DEFAULT_PORT: u16 = 5672;

/// Largest frame body accepted from the broker.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Inbound frames buffered before the reader task waits.
const INBOUND_CAPACITY: usize = 256;

/// Where the broker listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for ConnectionTarget {
    type Err = AgentError;

    /// Accepts `host`, `host:port`, or `tcp://host[:port]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AgentError::InvalidTarget("empty connection target".to_string()));
        }

        if s.contains("://") {
            let url = Url::parse(s).map_err(|e| AgentError::InvalidTarget(format!("{}: {}", s, e)))?;
            if url.scheme() != "tcp" {
                return Err(AgentError::InvalidTarget(format!(
                    "unsupported scheme '{}' in {} (the agent speaks framed JSON over tcp)",
                    url.scheme(),
                    s
                )));
            }
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| AgentError::InvalidTarget(format!("missing host in {}", s)))?;
            return Ok(Self::new(host, url.port().unwrap_or(DEFAULT_PORT)));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                let port = port
                    .parse()
                    .map_err(|_| AgentError::InvalidTarget(format!("invalid port in {}", s)))?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(AgentError::InvalidTarget(s.to_string())),
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Retry policy for connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of connection attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between attempts (milliseconds).
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum delay between attempts (milliseconds).
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }
}

/// Connection behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Retry failed connection attempts and re-establish lost connections.
    pub reconnect: bool,
    pub retry: RetryPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Encode one message as a frame.
pub fn encode_frame(body: &str) -> String {
    format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
}

/// Read one frame body. Returns `Ok(None)` at end of stream.
///
/// A `Content-Length` above `MAX_FRAME_LEN` is an `InvalidData` error: the
/// stream cannot be resynchronized after it.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        // Read headers until empty line
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let line = line.trim();
            if line.is_empty() {
                if saw_header {
                    break;
                }
                continue;
            }
            saw_header = true;
            if let Some(len) = line.strip_prefix("Content-Length:") {
                content_length = len.trim().parse().ok();
            }
        }

        let content_length = match content_length {
            Some(len) => len,
            None => {
                warn!("Missing Content-Length header");
                continue;
            }
        };

        if content_length > MAX_FRAME_LEN {
            warn!(content_length, max = MAX_FRAME_LEN, "Broker frame too large");
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds {}", content_length, MAX_FRAME_LEN),
            ));
        }

        let mut content = vec![0u8; content_length];
        reader.read_exact(&mut content).await?;

        match String::from_utf8(content) {
            Ok(s) => return Ok(Some(s)),
            Err(e) => {
                warn!(error = %e, "Invalid UTF-8 in broker message");
                continue;
            }
        }
    }
}

/// A framed connection to the broker.
pub struct BrokerConnection {
    target: ConnectionTarget,
    options: ConnectionOptions,
    writer: Option<OwnedWriteHalf>,
    inbound: Option<mpsc::Receiver<Value>>,
    reader_handle: Option<JoinHandle<()>>,
}

impl BrokerConnection {
    pub fn new(target: ConnectionTarget, options: ConnectionOptions) -> Self {
        Self {
            target,
            options,
            writer: None,
            inbound: None,
            reader_handle: None,
        }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Connect to the broker, retrying per the retry policy when reconnect
    /// is enabled.
    pub async fn open(&mut self) -> Result<(), AgentError> {
        self.teardown();

        let attempts = if self.options.reconnect {
            self.options.retry.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect((self.target.host.as_str(), self.target.port)).await {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 < attempts => {
                    let delay = self.options.retry.delay_for_attempt(attempt);
                    warn!(
                        target = %self.target,
                        attempt = attempt + 1,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Broker connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(AgentError::Session(format!(
                        "Failed to connect to {}: {}",
                        self.target, e
                    )));
                }
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle on broker connection");
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        self.reader_handle = Some(tokio::spawn(Self::reader_loop(read_half, tx)));
        self.writer = Some(write_half);
        self.inbound = Some(rx);

        info!(target = %self.target, "Connected to broker");
        Ok(())
    }

    /// Background task that reads frames from the broker.
    async fn reader_loop(read_half: OwnedReadHalf, inbound: mpsc::Sender<Value>) {
        let mut reader = BufReader::new(read_half);

        loop {
            let content = match read_frame(&mut reader).await {
                Ok(Some(content)) => content,
                Ok(None) => {
                    debug!("Broker closed the connection");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Error reading from broker");
                    return;
                }
            };

            trace!(content = %content, "Received broker message");

            let json: Value = match serde_json::from_str(&content) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Invalid JSON in broker message");
                    continue;
                }
            };

            if inbound.send(json).await.is_err() {
                debug!("Inbound channel closed, stopping reader");
                return;
            }
        }
    }

    /// Send one message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), AgentError> {
        let writer = self.writer.as_mut().ok_or(AgentError::SessionClosed)?;
        let body = serde_json::to_string(message)?;
        let frame = encode_frame(&body);

        trace!(len = body.len(), "Sending broker message");
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Next inbound message. `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.as_mut()?.recv().await
    }

    /// Close the connection.
    pub async fn close(&mut self) -> Result<(), AgentError> {
        let writer = self.writer.take();
        self.teardown();

        if let Some(mut writer) = writer {
            writer.shutdown().await?;
            info!(target = %self.target, "Closed broker connection");
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
        self.inbound = None;
        self.writer = None;
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_connection_targets() {
        assert_eq!(
            "broker.example.com".parse::<ConnectionTarget>().unwrap(),
            ConnectionTarget::new("broker.example.com", DEFAULT_PORT)
        );
        assert_eq!(
            "localhost:15672".parse::<ConnectionTarget>().unwrap(),
            ConnectionTarget::new("localhost", 15672)
        );
        assert_eq!(
            "tcp://broker.example.com:5673".parse::<ConnectionTarget>().unwrap(),
            ConnectionTarget::new("broker.example.com", 5673)
        );
        assert_eq!(
            "tcp://broker.example.com".parse::<ConnectionTarget>().unwrap(),
            ConnectionTarget::new("broker.example.com", DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_invalid_targets() {
        assert!("".parse::<ConnectionTarget>().is_err());
        assert!("localhost:http".parse::<ConnectionTarget>().is_err());
        assert!("http://localhost".parse::<ConnectionTarget>().is_err());
        // Framed JSON, not AMQP
        let err = "amqp://localhost".parse::<ConnectionTarget>().unwrap_err();
        assert!(err.to_string().contains("framed JSON"));
        assert!(":5672".parse::<ConnectionTarget>().is_err());
    }

    #[test]
    fn test_retry_delay_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 1000,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_read_frames() {
        let data = format!(
            "{}{}",
            encode_frame(r#"{"kind":"a"}"#),
            encode_frame(r#"{"kind":"b"}"#)
        );
        let mut reader = BufReader::new(data.as_bytes());

        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some(r#"{"kind":"a"}"#));
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some(r#"{"kind":"b"}"#));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_skips_headerless_block() {
        let data = format!("X-Junk: 1\r\n\r\n{}", encode_frame("{}"));
        let mut reader = BufReader::new(data.as_bytes());
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_read_frame_across_partial_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"Content-Len")
            .read(b"gth: 12\r\n\r\n{\"kind\":")
            .read(b"\"a\"}")
            .build();
        let mut reader = BufReader::new(mock);

        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some(r#"{"kind":"a"}"#));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let mock = tokio_test::io::Builder::new()
            .read(b"Content-Length: 18446744073709551615\r\n\r\n{}")
            .build();
        let mut reader = BufReader::new(mock);

        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let data = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_LEN + 1);
        let mut reader = BufReader::new(data.as_bytes());
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);

            // Echo one frame back
            let body = read_frame(&mut reader).await.unwrap().unwrap();
            write_half.write_all(encode_frame(&body).as_bytes()).await.unwrap();
        });

        let mut connection = BrokerConnection::new(
            ConnectionTarget::new("127.0.0.1", port),
            ConnectionOptions::default(),
        );
        connection.open().await.unwrap();
        assert!(connection.is_open());

        connection.send(&json!({"kind": "ping"})).await.unwrap();
        assert_eq!(connection.recv().await, Some(json!({"kind": "ping"})));

        broker.await.unwrap();
        // Broker hung up
        assert_eq!(connection.recv().await, None);

        let _ = connection.close().await;
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_open_without_reconnect_fails_fast() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut connection = BrokerConnection::new(
            ConnectionTarget::new("127.0.0.1", port),
            ConnectionOptions {
                reconnect: false,
                retry: RetryPolicy::default(),
            },
        );
        let err = connection.open().await.unwrap_err();
        assert!(matches!(err, AgentError::Session(_)));
        assert!(matches!(connection.send(&json!({})).await, Err(AgentError::SessionClosed)));
    }
}
