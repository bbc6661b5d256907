//! alibi-gateway: WebSocket and HTTP front end for alibi
//!
//! Participants and agents connect over `/ws` and exchange `{event, data}`
//! frames with the message router. Read-only HTTP endpoints expose stored
//! conversations, the suspect roster and router state.

pub mod protocol;
pub mod server;

pub use protocol::{GatewayEvent, Suspect};
pub use server::GatewayServer;
