//! Protocol implementations.
//!
//! A listener speaks exactly one of these:
//! - `framed`: length-prefixed JSON requests and responses
//! - `line`: bare `ping`/`pong` lines

pub mod framed;
pub mod line;

use clap::ValueEnum;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

/// Wire protocol spoken on a listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Length-prefixed JSON frames.
    #[default]
    Framed,
    /// Newline terminated `ping`/`pong` tokens.
    Line,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Framed => "framed",
            Protocol::Line => "line",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters collected over one session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Requests answered successfully.
    pub requests: u64,
    /// Frames or lines that could not be understood.
    pub errors: u64,
}

/// Run a session on `stream` with the handler for `protocol`.
pub async fn handle_session<S>(protocol: Protocol, stream: S) -> SessionStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match protocol {
        Protocol::Framed => framed::handle_session(stream).await,
        Protocol::Line => line::handle_session(stream).await,
    }
}
