//! Agent registry: which live connection answers for each suspect
//!
//! Registration is last-writer-wins: a new `register` for a suspect
//! displaces whatever was bound before, without error. Each registration gets
//! a fresh epoch so a superseded binding can be recognised by comparing
//! epochs. Removal is guarded by connection identity, so a late `unregister`
//! from a displaced connection cannot clobber its successor.

use std::collections::HashMap;
use tracing::{debug, info};

use crate::transport::{ConnectionHandle, ConnectionId};

/// Monotonic registration version
pub type Epoch = u64;

/// A suspect's current agent
#[derive(Debug, Clone)]
pub struct Binding {
    pub handle: ConnectionHandle,
    pub epoch: Epoch,
}

impl Binding {
    pub fn connection(&self) -> ConnectionId {
        self.handle.id()
    }
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    bindings: HashMap<String, Binding>,
    next_epoch: Epoch,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `suspect_id` to `handle`, replacing any previous binding
    pub fn register(&mut self, suspect_id: &str, handle: ConnectionHandle) -> Epoch {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let connection = handle.id();
        let previous = self
            .bindings
            .insert(suspect_id.to_string(), Binding { handle, epoch });

        match previous {
            Some(old) if old.connection() != connection => info!(
                "Agent registered for {} on {} (epoch {}), displacing {}",
                suspect_id,
                connection,
                epoch,
                old.connection()
            ),
            Some(_) => debug!(
                "Agent on {} re-registered for {} (epoch {})",
                connection, suspect_id, epoch
            ),
            None => info!(
                "Agent registered for {} on {} (epoch {})",
                suspect_id, connection, epoch
            ),
        }
        epoch
    }

    /// Remove the binding only if it is held by `connection`
    pub fn unregister(&mut self, suspect_id: &str, connection: ConnectionId) -> bool {
        match self.bindings.get(suspect_id) {
            Some(binding) if binding.connection() == connection => {
                self.bindings.remove(suspect_id);
                info!("Agent unregistered for {} ({})", suspect_id, connection);
                true
            }
            Some(binding) => {
                debug!(
                    "Ignoring unregister for {} from {}: bound to {}",
                    suspect_id,
                    connection,
                    binding.connection()
                );
                false
            }
            None => false,
        }
    }

    /// Current binding, if any. The handle may have closed since it was
    /// registered; check `is_open` before relying on it.
    pub fn lookup(&self, suspect_id: &str) -> Option<&Binding> {
        self.bindings.get(suspect_id)
    }

    /// Drop every binding held by a closed connection. Returns the suspects
    /// that lost their agent.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Vec<String> {
        let mut removed: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.connection() == connection)
            .map(|(suspect, _)| suspect.clone())
            .collect();
        removed.sort();
        for suspect in &removed {
            self.bindings.remove(suspect);
            info!("Agent for {} went away with {}", suspect, connection);
        }
        removed
    }

    /// Whether `connection` holds the live registration for `suspect_id` and
    /// registered after `epoch`
    pub fn took_over(&self, suspect_id: &str, epoch: Epoch, connection: ConnectionId) -> bool {
        self.bindings
            .get(suspect_id)
            .is_some_and(|b| b.epoch > epoch && b.connection() == connection)
    }

    /// Bound suspects, sorted by id
    pub fn list(&self) -> Vec<(String, ConnectionId, Epoch)> {
        let mut list: Vec<_> = self
            .bindings
            .iter()
            .map(|(suspect, b)| (suspect.clone(), b.connection(), b.epoch))
            .collect();
        list.sort();
        list
    }

    pub fn count(&self) -> usize {
        self.bindings.len()
    }
}
