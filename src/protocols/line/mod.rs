//! Plain-text ping protocol.
//!
//! The lightweight liveness variant, kept for compatibility with older
//! clients:
//!
//! ```text
//! Request:  ping\n
//! Response: pong\n
//! ```
//!
//! The match is exact and case-sensitive. Any other line is logged as an
//! invalid message and receives no reply; the connection stays open.

pub mod handler;
pub mod parser;

pub use handler::handle_session;
