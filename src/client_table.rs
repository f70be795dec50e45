//! # Client Table
//!
//! Secondary index of peers that are connected *to* this node without
//! relaying for the overlay: client nodes and observers. Entries are keyed by
//! transport session, carry no bucket arithmetic, and never appear in routing
//! decisions.
//!
//! A peer id may hold at most `max_clients_per_id` simultaneous sessions. The
//! engine enforces disjointness with the routing table before inserting here.

use std::collections::HashMap;

use tracing::debug;

use crate::id::NodeId;
use crate::node_info::{ConnectionId, NodeInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientTableError {
    ZeroId,
    SelfId,
    /// This transport session is already registered.
    DuplicateConnection,
    /// The peer id is at its session cap.
    IdAtCapacity,
}

pub struct ClientTable {
    self_id: NodeId,
    max_per_id: usize,
    clients: HashMap<ConnectionId, NodeInfo>,
}

impl ClientTable {
    pub fn new(self_id: NodeId, max_per_id: usize) -> Self {
        Self {
            self_id,
            max_per_id,
            clients: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains_id(&self, id: &NodeId) -> bool {
        self.clients.values().any(|n| n.id == *id)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&NodeInfo> {
        self.clients.get(connection_id)
    }

    /// Any one session held by `id`.
    pub fn connection_for_id(&self, id: &NodeId) -> Option<ConnectionId> {
        self.clients
            .values()
            .find(|n| n.id == *id)
            .map(|n| n.connection_id)
    }

    pub fn add(&mut self, node: NodeInfo) -> Result<(), ClientTableError> {
        if node.id.is_zero() || node.connection_id.is_zero() {
            return Err(ClientTableError::ZeroId);
        }
        if node.id == self.self_id {
            return Err(ClientTableError::SelfId);
        }
        if self.clients.contains_key(&node.connection_id) {
            return Err(ClientTableError::DuplicateConnection);
        }
        let sessions = self.clients.values().filter(|n| n.id == node.id).count();
        if sessions >= self.max_per_id {
            return Err(ClientTableError::IdAtCapacity);
        }
        debug!(
            client = %hex::encode(&node.id.as_bytes()[..8]),
            sessions = sessions + 1,
            "client attached"
        );
        self.clients.insert(node.connection_id, node);
        Ok(())
    }

    pub fn drop_connection(&mut self, connection_id: &ConnectionId) -> Option<NodeInfo> {
        self.clients.remove(connection_id)
    }

    /// Remove every session held by `id`. Used when a client id moves into
    /// the routing table.
    pub fn drop_nodes_by_id(&mut self, id: &NodeId) -> Vec<NodeInfo> {
        let connections: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|(_, n)| n.id == *id)
            .map(|(c, _)| *c)
            .collect();
        connections
            .iter()
            .filter_map(|c| self.clients.remove(c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Keypair;

    fn info(id: NodeId, connection_id: ConnectionId) -> NodeInfo {
        use std::sync::OnceLock;
        static KEY: OnceLock<ed25519_dalek::VerifyingKey> = OnceLock::new();
        let key = *KEY.get_or_init(|| Keypair::generate().public_key());
        NodeInfo::new(id, connection_id, key)
    }

    #[test]
    fn add_and_drop_by_connection() {
        let self_id = NodeId::random();
        let mut table = ClientTable::new(self_id, 8);
        let client = NodeId::random();
        let connection = NodeId::random();

        table.add(info(client, connection)).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains_id(&client));

        let dropped = table.drop_connection(&connection).unwrap();
        assert_eq!(dropped.id, client);
        assert!(table.is_empty());
        assert!(table.drop_connection(&connection).is_none());
    }

    #[test]
    fn rejects_self_zero_and_duplicate_sessions() {
        let self_id = NodeId::random();
        let mut table = ClientTable::new(self_id, 8);

        assert_eq!(
            table.add(info(NodeId::ZERO, NodeId::random())).unwrap_err(),
            ClientTableError::ZeroId
        );
        assert_eq!(
            table.add(info(self_id, NodeId::random())).unwrap_err(),
            ClientTableError::SelfId
        );

        let connection = NodeId::random();
        table.add(info(NodeId::random(), connection)).unwrap();
        assert_eq!(
            table.add(info(NodeId::random(), connection)).unwrap_err(),
            ClientTableError::DuplicateConnection
        );
    }

    #[test]
    fn per_id_session_cap() {
        let self_id = NodeId::random();
        let mut table = ClientTable::new(self_id, 2);
        let client = NodeId::random();

        table.add(info(client, NodeId::random())).unwrap();
        table.add(info(client, NodeId::random())).unwrap();
        assert_eq!(
            table.add(info(client, NodeId::random())).unwrap_err(),
            ClientTableError::IdAtCapacity
        );

        let removed = table.drop_nodes_by_id(&client);
        assert_eq!(removed.len(), 2);
        assert!(table.is_empty());
    }
}
