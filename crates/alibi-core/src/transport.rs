//! Protocol-independent connection handles
//!
//! Every participant or agent connection owns the receiving half of an
//! unbounded channel; the router keeps the sending half. Delivery never
//! blocks the router, and a dropped receiver marks the connection closed.

use std::fmt;
use tokio::sync::mpsc;

use crate::types::OutboundEvent;

/// Process-unique identifier for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending side of a connection, held by the router
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver the transport drains into its socket
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// False once the transport side has gone away
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue an event for delivery. Returns false if the connection is closed.
    pub fn send(&self, event: OutboundEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}
