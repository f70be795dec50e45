//! Peer records stored in the routing and client tables.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::id::NodeId;

/// Transport session identifier.
///
/// Distinct from a node's identity: the transport may hand out a relay
/// connection before the peer's identity has been validated, so the two
/// ids only coincide once a session is fully established.
pub type ConnectionId = NodeId;

/// NAT classification reported by the transport during session setup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatKind {
    #[default]
    Unknown,
    Direct,
    Cone,
    Symmetric,
}

/// Local/external endpoint pair exchanged during the transport handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    pub local: SocketAddr,
    pub external: SocketAddr,
}

impl EndpointPair {
    /// Both halves set to the same address, for directly reachable nodes.
    pub fn symmetric(addr: SocketAddr) -> Self {
        Self { local: addr, external: addr }
    }
}

/// A peer known to this node.
///
/// Equality and ordering use `id` only; `connection_id` may be
/// [`NodeId::ZERO`] while the peer is pending validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub connection_id: ConnectionId,
    pub public_key: VerifyingKey,
    pub rank: i32,
    pub nat: NatKind,
}

impl NodeInfo {
    pub fn new(id: NodeId, connection_id: ConnectionId, public_key: VerifyingKey) -> Self {
        Self {
            id,
            connection_id,
            public_key,
            rank: 0,
            nat: NatKind::Unknown,
        }
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeInfo {}

impl PartialOrd for NodeInfo {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeInfo {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}
