//! Events exchanged between connections and the router
//!
//! Both enums serialize adjacently tagged as `{"event": <name>, "data": {...}}`,
//! the frame shape the gateway speaks. Inbound string fields default to empty
//! so that a payload with missing fields still decodes and is then dropped by
//! the router's validation instead of failing at the transport.

use serde::{Deserialize, Serialize};

/// Event surfaced by a participant or agent connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum InboundEvent {
    /// Participant → suspect
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        #[serde(default)]
        participant_id: String,
        #[serde(default)]
        suspect_id: String,
        #[serde(default)]
        message: String,
    },

    /// Agent claims a suspect identity
    #[serde(rename_all = "camelCase")]
    RegisterAgent {
        #[serde(default)]
        suspect_id: String,
    },

    #[serde(rename_all = "camelCase")]
    UnregisterAgent {
        #[serde(default)]
        suspect_id: String,
    },

    /// Agent answer to a forwarded participant message
    #[serde(rename_all = "camelCase")]
    AgentReply {
        #[serde(default)]
        suspect_id: String,
        #[serde(default)]
        participant_id: String,
        #[serde(default)]
        message: String,
        /// Correlation token from the `participantMessage` being answered.
        /// Agents that omit it are matched to the oldest pending request
        /// for the same (suspect, participant).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl InboundEvent {
    /// Wire name of this event
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatMessage { .. } => "chatMessage",
            Self::RegisterAgent { .. } => "registerAgent",
            Self::UnregisterAgent { .. } => "unregisterAgent",
            Self::AgentReply { .. } => "agentReply",
        }
    }
}

/// Event the router delivers to a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    /// Forwarded to the agent bound for `suspect_id`
    #[serde(rename_all = "camelCase")]
    ParticipantMessage {
        request_id: String,
        participant_id: String,
        suspect_id: String,
        message: String,
    },

    /// Suspect reply delivered to a participant
    #[serde(rename_all = "camelCase")]
    ChatResponse {
        suspect_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ParticipantMessage { .. } => "participantMessage",
            Self::ChatResponse { .. } => "chatResponse",
        }
    }
}
