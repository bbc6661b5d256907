//! Gateway WebSocket protocol: `{event, data}` JSON frames

use alibi_core::{InboundEvent, OutboundEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A single text frame in either direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl GatewayEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// A suspect the interrogation can target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspect {
    pub id: String,
    pub name: String,
}

// ── Well-known events ──

/// Events clients send
pub mod inbound {
    pub const CHAT_MESSAGE: &str = "chatMessage";
    pub const REGISTER_AGENT: &str = "registerAgent";
    pub const UNREGISTER_AGENT: &str = "unregisterAgent";
    pub const AGENT_REPLY: &str = "agentReply";

    pub const ALL: &[&str] = &[CHAT_MESSAGE, REGISTER_AGENT, UNREGISTER_AGENT, AGENT_REPLY];
}

/// Events the server sends
pub mod outbound {
    pub const PARTICIPANT_MESSAGE: &str = "participantMessage";
    pub const CHAT_RESPONSE: &str = "chatResponse";

    pub const ALL: &[&str] = &[PARTICIPANT_MESSAGE, CHAT_RESPONSE];
}

/// Parse a client frame. Unknown events and malformed JSON yield `None`.
pub fn decode_inbound(raw: &str) -> Option<InboundEvent> {
    decode(raw, inbound::ALL)
}

/// Parse a server frame, for clients of the gateway
pub fn decode_outbound(raw: &str) -> Option<OutboundEvent> {
    decode(raw, outbound::ALL)
}

pub fn encode_outbound(event: &OutboundEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

pub fn encode_inbound(event: &InboundEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str, known: &[&str]) -> Option<T> {
    let mut frame: GatewayEvent = match serde_json::from_str(raw) {
        Ok(f) => f,
        Err(e) => {
            debug!("Ignoring unparseable frame: {}", e);
            return None;
        }
    };
    if !known.contains(&frame.event.as_str()) {
        debug!("Ignoring unknown event '{}'", frame.event);
        return None;
    }
    // A missing payload decodes as an empty one and is rejected downstream
    if frame.data.is_null() {
        frame.data = Value::Object(Default::default());
    }

    match serde_json::to_value(&frame).and_then(serde_json::from_value) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Ignoring malformed '{}' payload: {}", frame.event, e);
            None
        }
    }
}
