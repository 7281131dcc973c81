//! WebSocket Gateway
//!
//! Single WebSocket connection per client that:
//! - Streams terminal output from every session the client owns
//! - Dispatches typed requests (sessions, execs, probes, profiles)
//! - Survives disconnects through the grace-period broker

mod handler;
pub(crate) mod protocol;

pub use handler::handle_gate_ws;
pub use protocol::{ClientOp, ClientRequest, ErrorCode, ServerMessage};
