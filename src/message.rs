//! # Wire Envelope and Routing Control Messages
//!
//! Serialisable types crossing the transport boundary. Everything is encoded
//! with bincode; decoding is bounded so a hostile peer cannot make the node
//! allocate unbounded memory from a length prefix.
//!
//! | Kind | Payload |
//! |------|---------|
//! | `NodeLevel` | opaque application bytes |
//! | `Routing` | one bincode-encoded [`ControlMessage`] |
//!
//! An envelope's `id` ties responses back to the sender's pending task;
//! id 0 means no reply is expected. `source_id` is the zero sentinel for
//! anonymous senders, which are reachable only through `relay_id` /
//! `relay_connection_id`.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::id::NodeId;
use crate::node_info::{ConnectionId, NodeInfo};

/// Largest payload accepted in a single message (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Decode buffer bound: payload plus envelope framing headroom.
pub const MAX_WIRE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_WIRE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with the size bound enforced. All inbound decoding goes
/// through here.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Application-level traffic, delivered to the embedder.
    NodeLevel,
    /// Overlay maintenance, consumed by the engine itself.
    Routing,
}

/// The unit of transfer between overlay nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Matches responses to the originator's pending task. 0 = no reply
    /// expected.
    pub id: u64,
    /// Zero for anonymous senders.
    pub source_id: NodeId,
    pub destination_id: NodeId,
    pub relay_id: Option<NodeId>,
    pub relay_connection_id: Option<ConnectionId>,
    pub kind: MessageKind,
    pub request: bool,
    pub direct: bool,
    pub cacheable: bool,
    /// Sender is a client node (never self-delivers, never relays).
    pub client_node: bool,
    pub group_claim: Option<NodeId>,
    pub replication: u16,
    pub hops_to_live: u16,
    pub payload: Vec<Vec<u8>>,
}

impl Envelope {
    pub fn new(kind: MessageKind, destination_id: NodeId) -> Self {
        Self {
            id: 0,
            source_id: NodeId::ZERO,
            destination_id,
            relay_id: None,
            relay_connection_id: None,
            kind,
            request: true,
            direct: false,
            cacheable: false,
            client_node: false,
            group_claim: None,
            replication: 1,
            hops_to_live: 0,
            payload: Vec::new(),
        }
    }

    #[inline]
    pub fn has_source_id(&self) -> bool {
        !self.source_id.is_zero()
    }

    #[inline]
    pub fn is_routing(&self) -> bool {
        self.kind == MessageKind::Routing
    }

    /// Total payload bytes across all parts.
    pub fn payload_len(&self) -> usize {
        self.payload.iter().map(Vec::len).sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode_options().serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }

    /// Build the response shell for a request: destination flipped back to
    /// the requester, same id, relay fields echoed so replies to anonymous
    /// senders can travel over their bootstrap session. Relayed requests
    /// carry no source id; the requester is named by `relay_id` instead.
    pub fn to_response(&self, responder: NodeId) -> Envelope {
        let requester = if self.has_source_id() {
            self.source_id
        } else {
            self.relay_id.unwrap_or(NodeId::ZERO)
        };
        let mut response = Envelope::new(self.kind, requester);
        response.id = self.id;
        response.source_id = responder;
        response.request = false;
        response.direct = true;
        response.relay_id = self.relay_id;
        response.relay_connection_id = self.relay_connection_id;
        response.hops_to_live = self.hops_to_live;
        response
    }
}

/// Overlay maintenance messages carried in `Routing` envelopes.
///
/// Data-layer traffic (get/put/post) is application payload and not part of
/// the routing engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Ask a peer for up to `count` of its closest nodes to `target`.
    FindNodes { target: NodeId, count: u16 },
    FindNodesResponse { target: NodeId, nodes: Vec<NodeInfo> },
    /// Request a routing (or client, when `client`) session with a peer.
    Connect { contact: NodeInfo, client: bool },
    ConnectResponse { accepted: bool, contact: NodeInfo },
    /// Ask for the close group of `target`.
    FindGroup { target: NodeId },
    FindGroupResponse { target: NodeId, group: Vec<NodeInfo> },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode_options().serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }

    /// Short tag for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::FindNodes { .. } => "FindNodes",
            ControlMessage::FindNodesResponse { .. } => "FindNodesResponse",
            ControlMessage::Connect { .. } => "Connect",
            ControlMessage::ConnectResponse { .. } => "ConnectResponse",
            ControlMessage::FindGroup { .. } => "FindGroup",
            ControlMessage::FindGroupResponse { .. } => "FindGroupResponse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Keypair;

    #[test]
    fn envelope_round_trip() {
        let keypair = Keypair::generate();
        let mut envelope = Envelope::new(MessageKind::NodeLevel, NodeId::random());
        envelope.id = 42;
        envelope.source_id = keypair.id();
        envelope.group_claim = Some(NodeId::random());
        envelope.replication = 4;
        envelope.hops_to_live = 30;
        envelope.payload = vec![b"hello".to_vec(), b"world".to_vec()];

        let bytes = envelope.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back.id, 42);
        assert_eq!(back.source_id, keypair.id());
        assert_eq!(back.payload, envelope.payload);
        assert_eq!(back.replication, 4);
        assert!(back.has_source_id());
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(Envelope::decode(b"not an envelope").is_err());
        assert!(Envelope::decode(&[]).is_err());
    }

    #[test]
    fn control_round_trip() {
        let keypair = Keypair::generate();
        let node = NodeInfo::new(keypair.id(), NodeId::random(), keypair.public_key());
        let message = ControlMessage::FindNodesResponse {
            target: keypair.id(),
            nodes: vec![node.clone()],
        };
        let bytes = message.encode().unwrap();
        match ControlMessage::decode(&bytes).unwrap() {
            ControlMessage::FindNodesResponse { nodes, .. } => {
                assert_eq!(nodes, vec![node]);
            }
            other => panic!("decoded wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn response_shell_flips_direction() {
        let requester = NodeId::random();
        let responder = NodeId::random();
        let mut request = Envelope::new(MessageKind::Routing, responder);
        request.id = 7;
        request.source_id = requester;
        request.relay_id = Some(NodeId::random());

        let response = request.to_response(responder);
        assert_eq!(response.destination_id, requester);
        assert_eq!(response.source_id, responder);
        assert_eq!(response.id, 7);
        assert!(!response.request);
        assert!(response.direct);
        assert_eq!(response.relay_id, request.relay_id);
    }
}
