//! Framed JSON protocol.
//!
//! Each message is a length-prefixed JSON document:
//!
//! ```text
//! Request:  00000087{"type":"PING","client_id":"1","timestamp":...,"sequence":1,"data":"..."}
//! Response: 00000131{"type":"PONG","status":"success","timestamp":...,"original_timestamp":...}
//! ```
//!
//! PING requests are answered with PONG and echo the client id, sequence and
//! original timestamp so that the client can correlate and time each reply.
//! Any other request type gets a GENERIC_RESPONSE. A frame that fails to
//! decode gets an ERROR response and the connection stays open.

pub mod codec;
pub mod handler;
pub mod message;

pub use handler::handle_session;
