//! Message router: the single dispatch loop between participants and agents
//!
//! The router owns the agent registry, the connection table and the table of
//! agent round trips in flight. Every `RouterEvent` is handled to completion
//! before the next one is taken off the queue, so handlers never observe each
//! other half-done. Conversation appends are issued from this one task, which
//! makes per-conversation store order equal to issue order.
//!
//! A participant message is always persisted before it is forwarded. When no
//! live agent is bound, the fallback responder answers in the same dispatch.
//! When an agent is bound, the reply is correlated by a request token and
//! delivered only to the connections of the participant who asked. Requests
//! that time out, or whose agent disconnects, are answered by the fallback
//! responder so every accepted message gets exactly one reply.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alibi_store::{ConversationStore, Message};
use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::fallback::{DEFAULT_REPLIES, FallbackResponder};
use crate::registry::{AgentRegistry, Epoch};
use crate::transport::{ConnectionHandle, ConnectionId};
use crate::types::{InboundEvent, OutboundEvent};

/// Router tuning
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long to wait for an agent before answering with the fallback.
    /// `None` waits forever.
    pub agent_timeout: Option<Duration>,
    /// Capacity of the router's inbound queue
    pub event_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Some(Duration::from_secs(30)),
            event_buffer: 256,
        }
    }
}

/// Everything the router reacts to
#[derive(Debug)]
pub enum RouterEvent {
    Connected(ConnectionHandle),
    Inbound {
        connection: ConnectionId,
        event: InboundEvent,
    },
    Disconnected(ConnectionId),
    AgentTimeout {
        request_id: String,
    },
    Status(oneshot::Sender<RouterStatus>),
}

/// Point-in-time view of router state
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub connections: usize,
    pub pending: usize,
    pub agents: Vec<AgentInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub suspect_id: String,
    pub connection: u64,
    pub epoch: Epoch,
}

/// An agent round trip awaiting `agentReply`
#[derive(Debug, Clone)]
struct PendingReply {
    participant_id: String,
    suspect_id: String,
    message: String,
    agent: ConnectionId,
    epoch: Epoch,
    seq: u64,
}

/// Cloneable handle used by transports to feed the router
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterEvent>,
    next_id: Arc<AtomicU64>,
}

impl RouterHandle {
    /// Register a new connection. The receiver yields everything the router
    /// sends to it; dropping the receiver marks the connection closed.
    pub async fn connect(&self) -> Result<(ConnectionId, mpsc::UnboundedReceiver<OutboundEvent>)> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (handle, rx) = ConnectionHandle::new(id);
        self.send(RouterEvent::Connected(handle)).await?;
        Ok((id, rx))
    }

    pub async fn inbound(&self, connection: ConnectionId, event: InboundEvent) -> Result<()> {
        self.send(RouterEvent::Inbound { connection, event }).await
    }

    pub async fn disconnect(&self, connection: ConnectionId) -> Result<()> {
        self.send(RouterEvent::Disconnected(connection)).await
    }

    pub async fn status(&self) -> Result<RouterStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(RouterEvent::Status(tx)).await?;
        rx.await.context("message router dropped status request")
    }

    async fn send(&self, event: RouterEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("message router is not running"))
    }
}

pub struct MessageRouter {
    store: Arc<dyn ConversationStore>,
    fallback: Arc<dyn FallbackResponder>,
    registry: AgentRegistry,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// participant id → connections that have spoken as that participant
    participants: HashMap<String, BTreeSet<ConnectionId>>,
    pending: HashMap<String, PendingReply>,
    next_seq: u64,
    agent_timeout: Option<Duration>,
    events_rx: mpsc::Receiver<RouterEvent>,
    // Weak so the loop ends once every external handle is dropped
    loopback: mpsc::WeakSender<RouterEvent>,
}

impl MessageRouter {
    pub fn new(
        config: RouterConfig,
        store: Arc<dyn ConversationStore>,
        fallback: Arc<dyn FallbackResponder>,
    ) -> (Self, RouterHandle) {
        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
        let router = Self {
            store,
            fallback,
            registry: AgentRegistry::new(),
            connections: HashMap::new(),
            participants: HashMap::new(),
            pending: HashMap::new(),
            next_seq: 0,
            agent_timeout: config.agent_timeout.filter(|t| !t.is_zero()),
            events_rx: rx,
            loopback: tx.downgrade(),
        };
        let handle = RouterHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
        };
        (router, handle)
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Drain events until cancelled or every handle is gone
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Message router started (agent timeout: {:?})",
            self.agent_timeout
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Message router shutting down");
                    break;
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.dispatch(event).await,
                        None => {
                            info!("All router handles dropped, stopping");
                            break;
                        }
                    }
                }
            }
        }
        if !self.pending.is_empty() {
            warn!("{} agent replies still pending at shutdown", self.pending.len());
        }
    }

    /// Handle one event to completion
    pub async fn dispatch(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Connected(handle) => {
                debug!("Connection {} opened", handle.id());
                self.connections.insert(handle.id(), handle);
            }
            RouterEvent::Inbound { connection, event } => self.on_inbound(connection, event).await,
            RouterEvent::Disconnected(connection) => self.on_disconnected(connection).await,
            RouterEvent::AgentTimeout { request_id } => self.on_agent_timeout(&request_id).await,
            RouterEvent::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> RouterStatus {
        RouterStatus {
            connections: self.connections.len(),
            pending: self.pending.len(),
            agents: self
                .registry
                .list()
                .into_iter()
                .map(|(suspect_id, connection, epoch)| AgentInfo {
                    suspect_id,
                    connection: connection.0,
                    epoch,
                })
                .collect(),
        }
    }

    async fn on_inbound(&mut self, connection: ConnectionId, event: InboundEvent) {
        match event {
            InboundEvent::ChatMessage {
                participant_id,
                suspect_id,
                message,
            } => {
                if participant_id.is_empty() || suspect_id.is_empty() || message.is_empty() {
                    debug!("Dropping malformed chatMessage from {}", connection);
                    return;
                }
                self.on_chat_message(connection, participant_id, suspect_id, message)
                    .await;
            }
            InboundEvent::RegisterAgent { suspect_id } => {
                if suspect_id.is_empty() {
                    debug!("Dropping registerAgent without suspectId from {}", connection);
                    return;
                }
                match self.connections.get(&connection) {
                    Some(handle) => {
                        self.registry.register(&suspect_id, handle.clone());
                    }
                    None => warn!(
                        "registerAgent for {} from unknown connection {}",
                        suspect_id, connection
                    ),
                }
            }
            InboundEvent::UnregisterAgent { suspect_id } => {
                if suspect_id.is_empty() {
                    debug!("Dropping unregisterAgent without suspectId from {}", connection);
                    return;
                }
                self.registry.unregister(&suspect_id, connection);
            }
            InboundEvent::AgentReply {
                suspect_id,
                participant_id,
                message,
                request_id,
            } => {
                if suspect_id.is_empty() || participant_id.is_empty() || message.is_empty() {
                    debug!("Dropping malformed agentReply from {}", connection);
                    return;
                }
                self.on_agent_reply(connection, suspect_id, participant_id, message, request_id)
                    .await;
            }
        }
    }

    async fn on_chat_message(
        &mut self,
        origin: ConnectionId,
        participant_id: String,
        suspect_id: String,
        message: String,
    ) {
        debug!(
            "chatMessage {} -> {} via {} ({} chars)",
            participant_id,
            suspect_id,
            origin,
            message.len()
        );
        self.participants
            .entry(participant_id.clone())
            .or_default()
            .insert(origin);

        if let Err(e) = self
            .store
            .append(&participant_id, &suspect_id, Message::new(&participant_id, &message))
            .await
        {
            error!(
                "Failed to store message from {} to {}: {}",
                participant_id, suspect_id, e
            );
            return;
        }

        if let Some(binding) = self.registry.lookup(&suspect_id).cloned() {
            let request_id = Uuid::new_v4().to_string();
            let forwarded = binding.handle.is_open()
                && binding.handle.send(OutboundEvent::ParticipantMessage {
                    request_id: request_id.clone(),
                    participant_id: participant_id.clone(),
                    suspect_id: suspect_id.clone(),
                    message: message.clone(),
                });

            if forwarded {
                debug!(
                    "Forwarded {} to agent {} for {} (epoch {})",
                    request_id,
                    binding.connection(),
                    suspect_id,
                    binding.epoch
                );
                self.next_seq += 1;
                self.pending.insert(
                    request_id.clone(),
                    PendingReply {
                        participant_id,
                        suspect_id,
                        message,
                        agent: binding.connection(),
                        epoch: binding.epoch,
                        seq: self.next_seq,
                    },
                );
                self.arm_timeout(request_id);
                return;
            }

            warn!(
                "Agent for {} on {} is gone, answering with fallback",
                suspect_id,
                binding.connection()
            );
            self.registry.unregister(&suspect_id, binding.connection());
        }

        let event = self
            .fallback_reply(&participant_id, &suspect_id, &message)
            .await;
        if let Some(event) = event {
            self.send_to(origin, event);
        }
    }

    async fn on_agent_reply(
        &mut self,
        from: ConnectionId,
        suspect_id: String,
        participant_id: String,
        message: String,
        request_id: Option<String>,
    ) {
        let id = match request_id {
            Some(id) => match self.pending.get(&id) {
                Some(p) if p.suspect_id == suspect_id && p.participant_id == participant_id => {
                    Some(id)
                }
                Some(p) => {
                    warn!(
                        "agentReply {} names ({}, {}) but was issued for ({}, {}); dropping",
                        id, participant_id, suspect_id, p.participant_id, p.suspect_id
                    );
                    return;
                }
                None => {
                    warn!("Dropping agentReply for unknown or expired request {}", id);
                    return;
                }
            },
            None => self.oldest_pending(&suspect_id, &participant_id),
        };

        // No pending request means it was already answered by a fallback
        // (timeout or agent loss). Storing this reply would give it two.
        let Some(id) = id else {
            warn!(
                "Dropping unsolicited agentReply from {} for ({}, {})",
                from, participant_id, suspect_id
            );
            return;
        };

        // The agent the request went to may still answer it after being
        // displaced. Anyone else must hold a newer registration.
        let Some(pending) = self.pending.get(&id) else {
            return;
        };
        if pending.agent != from && !self.registry.took_over(&suspect_id, pending.epoch, from) {
            warn!(
                "Dropping agentReply for {} from {}: request went to {} (epoch {})",
                suspect_id, from, pending.agent, pending.epoch
            );
            return;
        }
        if pending.agent != from {
            debug!(
                "Reply for {} taken over by {} from {}",
                suspect_id, from, pending.agent
            );
        }
        self.pending.remove(&id);

        if let Err(e) = self
            .store
            .append(&participant_id, &suspect_id, Message::new(&suspect_id, &message))
            .await
        {
            error!(
                "Failed to store reply from {} to {}: {}",
                suspect_id, participant_id, e
            );
            return;
        }

        let delivered = self.send_to_participant(
            &participant_id,
            OutboundEvent::ChatResponse {
                suspect_id,
                message,
                participant_id: Some(participant_id.clone()),
            },
        );
        debug!(
            "Agent reply for {} delivered to {} connection(s)",
            participant_id, delivered
        );
    }

    async fn on_agent_timeout(&mut self, request_id: &str) {
        let Some(pending) = self.pending.remove(request_id) else {
            return;
        };
        warn!(
            "Agent for {} did not answer {} in time, answering with fallback",
            pending.suspect_id, request_id
        );
        self.resolve_with_fallback(pending).await;
    }

    async fn on_disconnected(&mut self, connection: ConnectionId) {
        self.connections.remove(&connection);
        self.registry.remove_connection(connection);
        self.participants.retain(|_, conns| {
            conns.remove(&connection);
            !conns.is_empty()
        });

        let orphaned_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.agent == connection)
            .map(|(id, _)| id.clone())
            .collect();
        let mut orphaned: Vec<PendingReply> = orphaned_ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        orphaned.sort_by_key(|p| p.seq);

        if !orphaned.is_empty() {
            warn!(
                "{} left with {} unanswered message(s), answering with fallback",
                connection,
                orphaned.len()
            );
        }
        for pending in orphaned {
            self.resolve_with_fallback(pending).await;
        }
        debug!("Connection {} closed", connection);
    }

    async fn resolve_with_fallback(&mut self, pending: PendingReply) {
        let event = self
            .fallback_reply(&pending.participant_id, &pending.suspect_id, &pending.message)
            .await;
        if let Some(event) = event {
            self.send_to_participant(&pending.participant_id, event);
        }
    }

    /// Generate, persist and wrap a fallback reply. `None` if it could not
    /// be stored.
    async fn fallback_reply(
        &self,
        participant_id: &str,
        suspect_id: &str,
        participant_message: &str,
    ) -> Option<OutboundEvent> {
        let mut reply = self.fallback.reply(suspect_id, participant_message);
        if reply.trim().is_empty() {
            reply = DEFAULT_REPLIES[0].to_string();
        }

        if let Err(e) = self
            .store
            .append(participant_id, suspect_id, Message::new(suspect_id, &reply))
            .await
        {
            error!(
                "Failed to store fallback reply from {} to {}: {}",
                suspect_id, participant_id, e
            );
            return None;
        }

        Some(OutboundEvent::ChatResponse {
            suspect_id: suspect_id.to_string(),
            message: reply,
            participant_id: Some(participant_id.to_string()),
        })
    }

    fn oldest_pending(&self, suspect_id: &str, participant_id: &str) -> Option<String> {
        self.pending
            .iter()
            .filter(|(_, p)| p.suspect_id == suspect_id && p.participant_id == participant_id)
            .min_by_key(|(_, p)| p.seq)
            .map(|(id, _)| id.clone())
    }

    fn arm_timeout(&self, request_id: String) {
        let Some(timeout) = self.agent_timeout else {
            return;
        };
        let Some(tx) = self.loopback.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(RouterEvent::AgentTimeout { request_id }).await;
        });
    }

    fn send_to(&self, connection: ConnectionId, event: OutboundEvent) -> bool {
        match self.connections.get(&connection) {
            Some(handle) if handle.send(event) => true,
            _ => {
                debug!("{} is closed, dropping outbound event", connection);
                false
            }
        }
    }

    fn send_to_participant(&self, participant_id: &str, event: OutboundEvent) -> usize {
        let Some(connections) = self.participants.get(participant_id) else {
            debug!("{} has no open connection, reply kept in history only", participant_id);
            return 0;
        };
        connections
            .iter()
            .filter(|conn| self.send_to(**conn, event.clone()))
            .count()
    }
}
