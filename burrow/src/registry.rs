//! Per-multiplexer bookkeeping of live connections.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use crate::id::ConnectionId;
use crate::transport::socket::SocketHandle;

/// Pings already answered by our own WebSocket layer that are kept per
/// connection, so the peer's pong for the same payload can be dropped.
const MAX_ANSWERED_PINGS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Identifier allocated, dial not confirmed yet.
    Pending,
    Open,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub socket: SocketHandle,
    pub state: ConnectionState,
    /// Set before a locally initiated close so the later close event is not
    /// reported back to the peer.
    pub dead: bool,
    answered_pings: VecDeque<Bytes>,
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ConnectionId, socket: SocketHandle, state: ConnectionState) {
        let connection = Connection {
            id: id.clone(),
            socket,
            state,
            dead: false,
            answered_pings: VecDeque::new(),
        };
        self.connections.insert(id, connection);
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Move a pending connection to `Open`.
    pub fn mark_open(&mut self, id: &ConnectionId) -> bool {
        match self.connections.get_mut(id) {
            Some(connection) => {
                connection.state = ConnectionState::Open;
                true
            }
            None => false,
        }
    }

    /// Remember a ping payload that was answered locally and forwarded.
    pub fn note_answered_ping(&mut self, id: &ConnectionId, data: Bytes) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        if connection.answered_pings.len() == MAX_ANSWERED_PINGS {
            connection.answered_pings.pop_front();
        }
        connection.answered_pings.push_back(data);
    }

    /// Whether a pong echoes a ping that was already answered locally.
    /// A match is consumed.
    pub fn take_answered_pong(&mut self, id: &ConnectionId, data: &[u8]) -> bool {
        let Some(connection) = self.connections.get_mut(id) else {
            return false;
        };
        match connection
            .answered_pings
            .iter()
            .position(|ping| ping.as_ref() == data)
        {
            Some(index) => {
                connection.answered_pings.remove(index);
                true
            }
            None => false,
        }
    }

    /// Close a connection on our own initiative and forget it.
    ///
    /// Terminates instead of closing when `code` is not a legal close code.
    pub fn close(&mut self, id: &ConnectionId, code: u16, reason: &str) -> Option<Connection> {
        let mut connection = self.connections.remove(id)?;
        connection.dead = true;
        connection.socket.close(code, reason);
        Some(connection)
    }

    /// Forget a connection whose socket reported closure.
    ///
    /// Returns the record only when the closure still has to be reported to
    /// the peer.
    pub fn observe_close(&mut self, id: &ConnectionId) -> Option<Connection> {
        let mut connection = self.connections.remove(id)?;
        if connection.dead {
            return None;
        }
        connection.dead = true;
        Some(connection)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
