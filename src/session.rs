//! Per-connection session handling.
//!
//! A session reads request lines, answers each with one reply line, and
//! closes the stream when the peer goes away, the idle timeout expires, or
//! an I/O error occurs.
//!
//! The first line is sniffed once: load balancers check the same port with
//! plain HTTP, so a first line starting with `GET ` or `HEAD ` is answered
//! with a fixed `200 OK` and the connection is closed. From the first ledger
//! command on, every line (including the first) is a ledger command.
//!
//! Lines are decoded leniently: bytes that are not valid UTF-8 become
//! U+FFFD and the line is still processed.

use bytes::BytesMut;
use std::borrow::Cow;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::time::timeout;
use tracing::{debug, error, trace};

use crate::protocol::{self, CommandError, Response};
use crate::server::Context;

/// Longest accepted request line, terminator included
pub const MAX_LINE_LENGTH: usize = 1024;

/// Upper bound on request bytes discarded after the health reply
const HEALTH_DRAIN_LIMIT: usize = 8 * 1024;

/// How long to wait for the rest of a health check before closing
const HEALTH_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Fixed reply to an HTTP health check. No headers or routes are inspected.
pub const HEALTH_CHECK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 2\r\n\
Connection: close\r\n\
\r\n\
OK";

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing read yet; the next line may be an HTTP request line
    AwaitingFirstLine,
    /// Every line is a ledger command
    Dispatching,
    /// First line was an HTTP request line; answer and close
    HealthCheck,
    Closed,
}

/// Outcome of one line read
#[derive(Debug, PartialEq, Eq)]
enum Incoming {
    Line,
    /// `MAX_LINE_LENGTH` bytes arrived without a line terminator
    TooLong,
    /// End of stream or idle timeout
    Closed,
}

/// Whether a first line looks like an HTTP request line.
pub fn is_http_request_line(line: &[u8]) -> bool {
    line.starts_with(b"GET ") || line.starts_with(b"HEAD ")
}

struct Session<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    line: Vec<u8>,
    state: SessionState,
    context: Context,
}

impl<S: AsyncRead + AsyncWrite> Session<S> {
    fn new(stream: S, context: Context) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            line: Vec::with_capacity(MAX_LINE_LENGTH),
            state: SessionState::AwaitingFirstLine,
            context,
        }
    }

    /// Drive the state machine until it reaches `Closed`.
    async fn run(&mut self) -> io::Result<()> {
        loop {
            self.state = match self.state {
                SessionState::AwaitingFirstLine => match self.read_line().await? {
                    Incoming::Closed => {
                        trace!("Peer closed before sending anything");
                        SessionState::Closed
                    }
                    Incoming::TooLong => {
                        self.reject_oversized().await?;
                        SessionState::Closed
                    }
                    Incoming::Line if is_http_request_line(&self.line) => {
                        SessionState::HealthCheck
                    }
                    Incoming::Line => {
                        self.dispatch().await?;
                        SessionState::Dispatching
                    }
                },
                SessionState::Dispatching => match self.read_line().await? {
                    Incoming::Line => {
                        self.dispatch().await?;
                        SessionState::Dispatching
                    }
                    Incoming::TooLong => {
                        self.reject_oversized().await?;
                        SessionState::Closed
                    }
                    Incoming::Closed => SessionState::Closed,
                },
                SessionState::HealthCheck => {
                    debug!("Answering HTTP health check");
                    self.writer.write_all(HEALTH_CHECK_RESPONSE).await?;
                    self.writer.flush().await?;
                    self.drain_health_request().await;
                    SessionState::Closed
                }
                SessionState::Closed => return Ok(()),
            };
        }
    }

    /// Read the next line, at most `MAX_LINE_LENGTH` bytes, into `self.line`.
    async fn read_line(&mut self) -> io::Result<Incoming> {
        self.line.clear();

        let limit = MAX_LINE_LENGTH as u64;
        let mut limited = (&mut self.reader).take(limit);
        let read = limited.read_until(b'\n', &mut self.line);

        match timeout(self.context.idle_timeout, read).await {
            Ok(Ok(0)) => Ok(Incoming::Closed),
            Ok(Ok(n)) if n as u64 >= limit && !self.line.ends_with(b"\n") => {
                Ok(Incoming::TooLong)
            }
            Ok(Ok(_)) => Ok(Incoming::Line),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!(
                    idle_timeout_secs = self.context.idle_timeout.as_secs_f64(),
                    "Idle timeout, closing connection"
                );
                Ok(Incoming::Closed)
            }
        }
    }

    /// Run the current line through the command processor and write the reply.
    async fn dispatch(&mut self) -> io::Result<()> {
        let decoded = String::from_utf8_lossy(&self.line);
        if let Cow::Owned(_) = decoded {
            debug!("Line was not valid UTF-8, decoded lossily");
        }
        let line = decoded.trim_end_matches(['\r', '\n']).to_string();
        debug!(%line, "Received");

        // Ledger calls block on SQLite; keep them off the async workers
        let store = Arc::clone(&self.context.store);
        let task = tokio::task::spawn_blocking(move || protocol::process(&line, &store));
        let reply = match task.await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "Command execution failed");
                Response::internal_error()
            }
        };

        self.write_reply(&reply).await
    }

    /// The line cannot be resynchronised, so the session ends after the reply.
    async fn reject_oversized(&mut self) -> io::Result<()> {
        debug!(limit = MAX_LINE_LENGTH, "Request line too long, closing connection");
        let reply = Response::error(&CommandError::LineTooLong(MAX_LINE_LENGTH));
        self.write_reply(&reply).await
    }

    async fn write_reply(&mut self, reply: &str) -> io::Result<()> {
        let mut frame = BytesMut::with_capacity(reply.len() + 1);
        frame.extend_from_slice(reply.as_bytes());
        frame.extend_from_slice(b"\n");

        self.writer.write_all(&frame).await?;
        self.writer.flush().await
    }

    /// Discard whatever is left of the health check request so closing with unread
    /// input does not reset the connection. Best effort; nothing is parsed.
    async fn drain_health_request(&mut self) {
        let mut scratch = [0u8; 1024];
        let mut drained = 0;

        let drain = async {
            while drained < HEALTH_DRAIN_LIMIT {
                match self.reader.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => drained += n,
                }
            }
        };
        if timeout(HEALTH_DRAIN_TIMEOUT, drain).await.is_err() {
            trace!("Health check peer still open after drain timeout");
        }
        trace!(drained, "Drained health check request");
    }

    async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            trace!(error = %e, "Shutdown on close failed");
        }
    }
}

/// Handle a single client connection.
///
/// The stream is consumed and closed exactly once, whichever way the session
/// ends. Transport errors are returned after the stream has been closed.
pub async fn handle_connection<S>(stream: S, context: Context) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let mut session = Session::new(stream, context);
    let result = session.run().await;
    session.close().await;
    result
}
