//! alibi-core - Routing between interrogation participants and suspect agents
//!
//! This crate provides:
//! - Typed inbound/outbound events and the connection handles they travel over
//! - The agent registry binding each suspect to at most one live connection
//! - The fallback responder used when no agent answers
//! - The message router that persists, forwards and correlates replies

pub mod fallback;
pub mod registry;
pub mod router;
pub mod transport;
pub mod types;

pub use fallback::{DEFAULT_REPLIES, FallbackResponder, ScriptedResponder};
pub use registry::{AgentRegistry, Binding, Epoch};
pub use router::{AgentInfo, MessageRouter, RouterConfig, RouterEvent, RouterHandle, RouterStatus};
pub use transport::{ConnectionHandle, ConnectionId};
pub use types::{InboundEvent, OutboundEvent};
