//! A single simulated client.
//!
//! A worker owns one connection for its whole run. It sends `num_messages`
//! pings, either waiting for each reply before the next request (lockstep) or
//! writing every request and reading the replies in order (bulk), and stops
//! at the first failure.

use crate::protocols::framed::codec;
use crate::protocols::framed::message::{Request, Response};
use crate::protocols::line::parser as line_parser;
use crate::protocols::Protocol;
use crate::sink::Status;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Default limit on establishing the connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How requests are paced on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    /// One request in flight at a time.
    #[default]
    Lockstep,
    /// Send everything, then read every reply in order.
    Bulk,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub protocol: Protocol,
    pub pacing: Pacing,
    pub connect_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            pacing: Pacing::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Why a worker stopped early.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("{0}")]
    Connect(String),
    #[error("{0}")]
    Send(String),
    #[error("{0}")]
    Receive(String),
    #[error("{0}")]
    Mismatch(String),
}

impl WorkerError {
    pub fn status(&self) -> Status {
        match self {
            WorkerError::Connect(_) => Status::ConnectError,
            WorkerError::Send(_) => Status::SendError,
            WorkerError::Receive(_) => Status::ReceiveError,
            WorkerError::Mismatch(_) => Status::Mismatch,
        }
    }
}

/// Timing and outcome of one worker run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    pub client_id: u64,
    pub t_start: DateTime<Utc>,
    pub t_end: DateTime<Utc>,
    pub total_elapsed_ms: f64,
    pub status: Status,
    pub error_detail: String,
}

impl WorkerResult {
    fn connect_failed(client_id: u64, error: WorkerError) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            t_start: now,
            t_end: now,
            total_elapsed_ms: 0.0,
            status: error.status(),
            error_detail: error.to_string(),
        }
    }
}

/// Run one worker against `target`.
pub async fn run(
    target: &str,
    num_messages: u64,
    client_id: u64,
    options: &WorkerOptions,
) -> WorkerResult {
    let mut stream = match connect(target, options.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(client_id, addr = %target, error = %e, "Connection failed");
            return WorkerResult::connect_failed(client_id, e);
        }
    };

    let t_start = Utc::now();
    let started = Instant::now();

    let outcome = match options.pacing {
        Pacing::Lockstep => lockstep(&mut stream, options.protocol, client_id, num_messages).await,
        Pacing::Bulk => bulk(&mut stream, options.protocol, client_id, num_messages).await,
    };

    let elapsed = started.elapsed();
    let t_end = Utc::now();

    let (status, error_detail) = match outcome {
        Ok(()) => (Status::Success, String::new()),
        Err(e) => {
            debug!(client_id, status = %e.status(), error = %e, "Worker stopped");
            (e.status(), e.to_string())
        }
    };

    WorkerResult {
        client_id,
        t_start,
        t_end,
        total_elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        status,
        error_detail,
    }
}

async fn connect(target: &str, limit: Duration) -> Result<TcpStream, WorkerError> {
    let stream = tokio::time::timeout(limit, TcpStream::connect(target))
        .await
        .map_err(|_| WorkerError::Connect(format!("connect to {target} timed out after {limit:?}")))?
        .map_err(|e| WorkerError::Connect(e.to_string()))?;

    if let Err(e) = stream.set_nodelay(true) {
        trace!(error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}

async fn lockstep(
    stream: &mut TcpStream,
    protocol: Protocol,
    client_id: u64,
    num_messages: u64,
) -> Result<(), WorkerError> {
    let (reader, writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let id = client_id.to_string();
    let mut line = String::new();

    for sequence in 1..=num_messages {
        send_request(&mut writer, protocol, &id, sequence).await?;
        flush(&mut writer).await?;
        receive_reply(&mut reader, protocol, sequence, &mut line).await?;
    }

    Ok(())
}

async fn bulk(
    stream: &mut TcpStream,
    protocol: Protocol,
    client_id: u64,
    num_messages: u64,
) -> Result<(), WorkerError> {
    let (reader, writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let id = client_id.to_string();

    // Replies are drained while requests are still being written so that a
    // large run cannot fill both socket buffers and stall.
    let send_all = async {
        for sequence in 1..=num_messages {
            send_request(&mut writer, protocol, &id, sequence).await?;
        }
        flush(&mut writer).await
    };
    let receive_all = async {
        let mut line = String::new();
        for sequence in 1..=num_messages {
            receive_reply(&mut reader, protocol, sequence, &mut line).await?;
        }
        Ok::<(), WorkerError>(())
    };

    tokio::try_join!(send_all, receive_all).map(|_| ())
}

async fn send_request<W>(
    writer: &mut W,
    protocol: Protocol,
    client_id: &str,
    sequence: u64,
) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
{
    let result = match protocol {
        Protocol::Framed => codec::write_message(writer, &Request::ping(client_id, sequence))
            .await
            .map_err(|e| e.to_string()),
        Protocol::Line => writer
            .write_all(line_parser::request_ping())
            .await
            .map_err(|e| e.to_string()),
    };
    result.map_err(WorkerError::Send)
}

async fn flush<W>(writer: &mut W) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .flush()
        .await
        .map_err(|e| WorkerError::Send(e.to_string()))
}

async fn receive_reply<R>(
    reader: &mut R,
    protocol: Protocol,
    sequence: u64,
    line: &mut String,
) -> Result<(), WorkerError>
where
    R: AsyncBufRead + Unpin,
{
    match protocol {
        Protocol::Framed => {
            let response: Response = codec::decode(reader)
                .await
                .map_err(|e| WorkerError::Receive(e.to_string()))?;
            check_response(&response, sequence)
        }
        Protocol::Line => {
            line.clear();
            let n = reader
                .read_line(line)
                .await
                .map_err(|e| WorkerError::Receive(e.to_string()))?;
            if n == 0 {
                return Err(WorkerError::Receive(
                    "connection closed by server".to_string(),
                ));
            }

            let reply = line.trim_end_matches(['\r', '\n']);
            if reply.as_bytes() == line_parser::PONG {
                Ok(())
            } else {
                Err(WorkerError::Mismatch(reply.to_string()))
            }
        }
    }
}

/// Check that a framed reply answers request `sequence`.
fn check_response(response: &Response, sequence: u64) -> Result<(), WorkerError> {
    if !response.is_success() {
        return Err(WorkerError::Mismatch(format!(
            "server error: {}",
            response.message
        )));
    }
    match response.sequence {
        Some(got) if got != sequence => Err(WorkerError::Mismatch(format!(
            "expected sequence {sequence}, got {got}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn start_server(protocol: Protocol) -> String {
        let server = Server::bind(&ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            protocol,
            max_connections: None,
        })
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr.to_string()
    }

    fn options(protocol: Protocol, pacing: Pacing) -> WorkerOptions {
        WorkerOptions {
            protocol,
            pacing,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Accept one connection and answer every line with `reply`.
    async fn start_fake_line_server(reply: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 || stream.write_all(reply).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_line_three_pings() {
        let target = start_server(Protocol::Line).await;
        let result = run(&target, 3, 1, &options(Protocol::Line, Pacing::Lockstep)).await;

        assert_eq!(result.status, Status::Success, "{}", result.error_detail);
        assert_eq!(result.client_id, 1);
        assert!(result.total_elapsed_ms >= 0.0);
        assert!(result.t_end >= result.t_start);
    }

    #[tokio::test]
    async fn test_framed_lockstep() {
        let target = start_server(Protocol::Framed).await;
        let result = run(&target, 20, 4, &options(Protocol::Framed, Pacing::Lockstep)).await;
        assert_eq!(result.status, Status::Success, "{}", result.error_detail);
    }

    #[tokio::test]
    async fn test_bulk_preserves_fifo() {
        let target = start_server(Protocol::Line).await;
        let result = run(&target, 2000, 2, &options(Protocol::Line, Pacing::Bulk)).await;
        assert_eq!(result.status, Status::Success, "{}", result.error_detail);

        let target = start_server(Protocol::Framed).await;
        let result = run(&target, 2000, 3, &options(Protocol::Framed, Pacing::Bulk)).await;
        assert_eq!(result.status, Status::Success, "{}", result.error_detail);
    }

    #[tokio::test]
    async fn test_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = run(&target, 3, 9, &options(Protocol::Framed, Pacing::Lockstep)).await;
        assert_eq!(result.status, Status::ConnectError);
        assert_eq!(result.total_elapsed_ms, 0.0);
        assert_eq!(result.t_start, result.t_end);
        assert!(!result.error_detail.is_empty());
    }

    #[tokio::test]
    async fn test_line_mismatch() {
        let target = start_fake_line_server(b"nope\n").await;
        let result = run(&target, 3, 1, &options(Protocol::Line, Pacing::Lockstep)).await;

        assert_eq!(result.status, Status::Mismatch);
        assert_eq!(result.error_detail, "nope");
    }

    #[tokio::test]
    async fn test_receive_error_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let result = run(&target, 3, 1, &options(Protocol::Framed, Pacing::Lockstep)).await;
        // Depending on timing the write may fail too; the read must not hang.
        assert!(
            matches!(result.status, Status::ReceiveError | Status::SendError),
            "unexpected status {:?}",
            result.status
        );
    }

    #[test]
    fn test_check_response() {
        let request = Request::ping("c", 5);
        let pong = Response::reply_to(&request);
        assert!(check_response(&pong, 5).is_ok());
        assert_eq!(
            check_response(&pong, 6),
            Err(WorkerError::Mismatch("expected sequence 6, got 5".to_string()))
        );

        let error = Response::error("bad");
        assert_eq!(check_response(&error, 1).unwrap_err().status(), Status::Mismatch);
    }
}
