//! Framed protocol session handler.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, trace, warn};

use super::codec::{self, FrameError, FrameReader};
use super::message::{Request, Response};
use crate::protocols::SessionStats;

/// Current state of a framed session.
#[derive(Debug)]
enum SessionState {
    /// Waiting for the next frame.
    AwaitFrame,
    /// A complete payload is ready to parse.
    Decoding(Bytes),
    /// A reply is ready to be written and flushed. With `resync` set the
    /// stream is misaligned and must be realigned before the next frame.
    Responding { response: Response, resync: bool },
    /// Skipping to the next frame start after a malformed length prefix.
    Resyncing,
    /// The peer went away or the stream failed.
    Closed,
}

/// Handle one framed connection until the peer closes it.
///
/// A frame that cannot be decoded is answered with an ERROR response and the
/// session keeps reading. After a malformed length prefix the reader skips to
/// the next frame start. Only a short read or I/O failure ends the session.
pub async fn handle_session<S>(stream: S) -> SessionStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FrameReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut stats = SessionStats::default();
    let mut state = SessionState::AwaitFrame;

    loop {
        state = match state {
            SessionState::AwaitFrame => match reader.read_frame().await {
                Ok(payload) => SessionState::Decoding(payload),
                Err(e @ FrameError::MalformedLength(_)) => {
                    warn!(error = %e, "Rejecting frame");
                    stats.errors += 1;
                    SessionState::Responding {
                        response: Response::error(e.to_string()),
                        resync: true,
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Session read ended");
                    SessionState::Closed
                }
            },

            SessionState::Decoding(payload) => {
                match codec::decode_payload::<Request>(&payload) {
                    Ok(request) => {
                        trace!(
                            client_id = %request.client_id,
                            sequence = request.sequence,
                            kind = ?request.kind,
                            "Processing request"
                        );
                        stats.requests += 1;
                        SessionState::Responding {
                            response: Response::reply_to(&request),
                            resync: false,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to decode request");
                        stats.errors += 1;
                        SessionState::Responding {
                            response: Response::error(format!("failed to decode message: {e}")),
                            resync: false,
                        }
                    }
                }
            }

            SessionState::Responding { response, resync } => {
                match write_response(&mut writer, &response).await {
                    Ok(()) if resync => SessionState::Resyncing,
                    Ok(()) => SessionState::AwaitFrame,
                    Err(e) => {
                        debug!(error = %e, "Failed to write response");
                        SessionState::Closed
                    }
                }
            }

            SessionState::Resyncing => match reader.resync().await {
                Ok(skipped) => {
                    debug!(skipped, "Realigned to next frame");
                    SessionState::AwaitFrame
                }
                Err(e) => {
                    debug!(error = %e, "Session ended while realigning");
                    SessionState::Closed
                }
            },

            SessionState::Closed => break,
        };
    }

    stats
}

async fn write_response<W>(writer: &mut W, response: &Response) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    codec::write_message(writer, response).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::framed::message::{RequestKind, ResponseKind, ResponseStatus};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn spawn_session() -> (DuplexStream, tokio::task::JoinHandle<SessionStats>) {
        let (client, server) = duplex(64 * 1024);
        (client, tokio::spawn(handle_session(server)))
    }

    #[tokio::test]
    async fn test_ping_echoes_sequence_and_timestamp() {
        let (mut client, session) = spawn_session();

        let mut request = Request::ping("client-1", 5);
        request.timestamp = 1_700_000_000_123;
        codec::write_message(&mut client, &request).await.unwrap();

        let response: Response = codec::decode(&mut client).await.unwrap();
        assert_eq!(response.kind, ResponseKind::Pong);
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.original_timestamp, Some(1_700_000_000_123));
        assert_eq!(response.sequence, Some(5));
        assert_eq!(response.client_id.as_deref(), Some("client-1"));

        drop(client);
        let stats = session.await.unwrap();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_corrupt_frame_then_ping() {
        let (mut client, session) = spawn_session();

        client.write_all(b"00000007{broken").await.unwrap();
        codec::write_message(&mut client, &Request::ping("c", 1))
            .await
            .unwrap();

        let first: Response = codec::decode(&mut client).await.unwrap();
        assert_eq!(first.kind, ResponseKind::Error);
        assert_eq!(first.status, ResponseStatus::Error);

        let second: Response = codec::decode(&mut client).await.unwrap();
        assert_eq!(second.kind, ResponseKind::Pong);
        assert_eq!(second.sequence, Some(1));

        // Still open: another request gets an answer.
        codec::write_message(&mut client, &Request::ping("c", 2))
            .await
            .unwrap();
        let third: Response = codec::decode(&mut client).await.unwrap();
        assert_eq!(third.sequence, Some(2));

        drop(client);
        let stats = session.await.unwrap();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_malformed_length_answered() {
        let (mut client, session) = spawn_session();

        client.write_all(b"zzzzzzzz").await.unwrap();
        let response: Response = codec::decode(&mut client).await.unwrap();
        assert_eq!(response.kind, ResponseKind::Error);
        assert!(response.message.contains("length"));

        drop(client);
        assert_eq!(session.await.unwrap().errors, 1);
    }

    #[tokio::test]
    async fn test_bad_prefix_with_payload_then_ping() {
        let (mut client, session) = spawn_session();

        client
            .write_all(b"0000001x{\"type\":\"PING\"}")
            .await
            .unwrap();
        codec::write_message(&mut client, &Request::ping("c", 1))
            .await
            .unwrap();

        let first: Response = codec::decode(&mut client).await.unwrap();
        assert_eq!(first.kind, ResponseKind::Error);

        let second: Response = codec::decode(&mut client).await.unwrap();
        assert_eq!(second.kind, ResponseKind::Pong);
        assert_eq!(second.sequence, Some(1));

        // Nothing else is pending: the next answer is for the next request.
        codec::write_message(&mut client, &Request::ping("c", 2))
            .await
            .unwrap();
        let third: Response = codec::decode(&mut client).await.unwrap();
        assert_eq!(third.kind, ResponseKind::Pong);
        assert_eq!(third.sequence, Some(2));

        drop(client);
        let stats = session.await.unwrap();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_generic_request() {
        let (mut client, _session) = spawn_session();

        let request = Request {
            kind: RequestKind::Generic,
            client_id: "g".to_string(),
            timestamp: 10,
            sequence: 1,
            data: "payload".to_string(),
        };
        codec::write_message(&mut client, &request).await.unwrap();

        let response: Response = codec::decode(&mut client).await.unwrap();
        assert_eq!(response.kind, ResponseKind::GenericResponse);
        assert_eq!(response.message, "Processed: payload");
    }

    #[tokio::test]
    async fn test_peer_close_mid_frame_ends_session() {
        let (mut client, session) = spawn_session();

        client.write_all(b"000000").await.unwrap();
        drop(client);

        let stats = session.await.unwrap();
        assert_eq!(stats.requests, 0);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_pipelined_requests_answered_in_order() {
        let (mut client, _session) = spawn_session();

        for sequence in 1..=10 {
            codec::write_message(&mut client, &Request::ping("p", sequence))
                .await
                .unwrap();
        }
        for sequence in 1..=10 {
            let response: Response = codec::decode(&mut client).await.unwrap();
            assert_eq!(response.sequence, Some(sequence));
        }

        let mut rest = Vec::new();
        client.shutdown().await.unwrap();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
