//! Plain-text ping session handler.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::parser::{self, Command, ParseResult, MAX_LINE_LENGTH};
use crate::protocols::SessionStats;

/// Handle a plain-text ping connection.
///
/// Reads newline terminated lines and answers `ping` with `pong`. Any other
/// line is logged and ignored; the connection stays open.
pub async fn handle_session<S>(mut stream: S) -> SessionStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(MAX_LINE_LENGTH);
    let mut stats = SessionStats::default();

    loop {
        match parser::parse(&buffer) {
            ParseResult::Complete(command, consumed) => {
                buffer.advance(consumed);
                match command {
                    Command::Ping => {
                        stats.requests += 1;
                        if let Err(e) = write_flush(&mut stream, parser::response_pong()).await {
                            debug!(error = %e, "Failed to write pong");
                            break;
                        }
                    }
                    Command::Invalid(line) => {
                        stats.errors += 1;
                        warn!(message = %String::from_utf8_lossy(&line), "Invalid message");
                    }
                }
            }

            ParseResult::Overlong => {
                stats.errors += 1;
                warn!(bytes = buffer.len(), "Discarding overlong line");
                buffer.clear();
            }

            ParseResult::Incomplete => match stream.read_buf(&mut buffer).await {
                Ok(0) => {
                    debug!("Connection closed by client");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Session read ended");
                    break;
                }
            },
        }
    }

    stats
}

async fn write_flush<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await
}
