//! TCP server that dispatches every accepted connection to its own session.
//!
//! There is no connection limit unless `max_connections` is configured; each
//! session runs as an independent task and the accept loop never waits on a
//! previous session.

use crate::config::ServerConfig;
use crate::protocols::{self, Protocol};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    listener: TcpListener,
    protocol: Protocol,
    live_connections: Arc<AtomicUsize>,
    admission: Option<Arc<Semaphore>>,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        let addr = resolve(&config.listen)?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;

        Ok(Server {
            listener,
            protocol: config.protocol,
            live_connections: Arc::new(AtomicUsize::new(0)),
            admission: config
                .max_connections
                .map(|limit| Arc::new(Semaphore::new(limit))),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of sessions currently open.
    #[cfg(test)]
    pub fn live_connections(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live_connections)
    }

    /// Accept connections until the process exits.
    pub async fn run(self) {
        info!(
            address = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            protocol = %self.protocol,
            max_connections = ?self.admission.as_ref().map(|s| s.available_permits()),
            "Server listening"
        );

        loop {
            // Wait for a connection slot when an admission limit is configured
            let permit = match &self.admission {
                Some(limit) => Arc::clone(limit).acquire_owned().await.ok(),
                None => None,
            };

            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let guard = LiveGuard::new(&self.live_connections);
                    debug!(%peer, live = guard.live, "New connection");

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let protocol = self.protocol;
                    tokio::spawn(async move {
                        let stats = protocols::handle_session(protocol, stream).await;
                        debug!(
                            %peer,
                            requests = stats.requests,
                            errors = stats.errors,
                            "Session closed"
                        );
                        drop(guard);
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Keeps the live-connection gauge accurate for the lifetime of a session.
struct LiveGuard {
    counter: Arc<AtomicUsize>,
    live: usize,
}

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        let live = counter.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            counter: Arc::clone(counter),
            live,
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for '{listen}'"),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::framed::codec;
    use crate::protocols::framed::message::{Request, Response, ResponseKind};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    fn config(protocol: Protocol, max_connections: Option<usize>) -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            protocol,
            max_connections,
        }
    }

    async fn wait_for_live(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::Relaxed) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "live connections stuck at {}, expected {expected}",
            counter.load(Ordering::Relaxed)
        );
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = blocker.local_addr().unwrap();
        let result = Server::bind(&ServerConfig {
            listen: busy.to_string(),
            ..config(Protocol::Line, None)
        });
        // SO_REUSEADDR does not allow binding over an active listener.
        assert!(result.is_err(), "bound over {busy}");

        let unresolvable = Server::bind(&ServerConfig {
            listen: "not-an-address".to_string(),
            ..config(Protocol::Line, None)
        });
        assert!(unresolvable.is_err());
    }

    #[tokio::test]
    async fn test_framed_sessions_are_independent() {
        let server = Server::bind(&config(Protocol::Framed, None)).unwrap();
        let addr = server.local_addr().unwrap();
        let live = server.live_connections();
        tokio::spawn(server.run());

        // An idle connection must not hold up a second one.
        let _idle = TcpStream::connect(addr).await.unwrap();
        let mut active = TcpStream::connect(addr).await.unwrap();

        codec::write_message(&mut active, &Request::ping("a", 1))
            .await
            .unwrap();
        let response: Response = codec::decode(&mut active).await.unwrap();
        assert_eq!(response.kind, ResponseKind::Pong);

        wait_for_live(&live, 2).await;
        drop(active);
        wait_for_live(&live, 1).await;
    }

    #[tokio::test]
    async fn test_line_server() {
        let server = Server::bind(&config(Protocol::Line, None)).unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(b"ping\n").await.unwrap();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "pong\n");
    }

    #[tokio::test]
    async fn test_admission_limit_queues_connections() {
        let server = Server::bind(&config(Protocol::Line, Some(1))).unwrap();
        let addr = server.local_addr().unwrap();
        let live = server.live_connections();
        tokio::spawn(server.run());

        let first = TcpStream::connect(addr).await.unwrap();
        wait_for_live(&live, 1).await;

        // Second connection completes the TCP handshake via the backlog but
        // is not dispatched until the first session ends.
        let second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(live.load(Ordering::Relaxed), 1);

        drop(first);
        wait_for_live(&live, 1).await;

        let (reader, mut writer) = second.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        writer.write_all(b"ping\n").await.unwrap();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "pong\n");
    }
}
