//! # Transport Adaptor
//!
//! The engine never touches sockets. Everything below the envelope layer is
//! behind the [`Network`] trait: a reliable-UDP (or test) transport that
//! owns sessions, performs NAT-aware handshakes, and feeds inbound traffic
//! back through an event channel.
//!
//! The trait lives apart from the engine so implementations depend only on
//! wire types, never on engine internals, and so the engine can be driven by
//! an in-memory transport in tests.

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::id::NodeId;
use crate::message::Envelope;
use crate::node_info::{ConnectionId, EndpointPair, NatKind, NodeInfo};

/// Transport-level failures surfaced to the engine.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("no bootstrap endpoint accepted a connection")]
    BootstrapFailed,
    #[error("transport session not found")]
    ConnectionNotFound,
    #[error("bootstrap connection to this peer already exists")]
    BootstrapConnectionAlreadyExists,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport shutting down")]
    ShuttingDown,
}

/// Inbound notifications from the transport.
///
/// Per session, events arrive in transport-delivery order; across sessions
/// the order is unspecified.
#[derive(Debug)]
pub enum NetworkEvent {
    MessageReceived(Vec<u8>),
    ConnectionLost(ConnectionId),
}

/// Result of a successful bootstrap attempt.
#[derive(Clone, Copy, Debug)]
pub struct BootstrapHandle {
    /// Session to the seed that accepted us.
    pub connection: ConnectionId,
    /// Transient session id peers use to reach us before our identity is
    /// validated.
    pub relay_connection: ConnectionId,
    /// The endpoint that accepted, for the embedder's bootstrap cache.
    pub endpoint: SocketAddr,
}

#[async_trait]
pub trait Network: Send + Sync + 'static {
    /// Try each endpoint in turn until one accepts. Inbound messages and
    /// connection losses for every session are pushed into `events`.
    async fn bootstrap(
        &self,
        endpoints: Vec<SocketAddr>,
        events: mpsc::Sender<NetworkEvent>,
        local: Option<SocketAddr>,
    ) -> Result<BootstrapHandle, NetworkError>;

    /// Unicast over an established session.
    async fn send_direct(
        &self,
        message: Envelope,
        connection: ConnectionId,
    ) -> Result<(), NetworkError>;

    /// Deliver along a route the engine resolved from its routing table,
    /// nearest first. The transport picks the first reachable hop.
    async fn send_to_route(
        &self,
        message: Envelope,
        route: &[NodeInfo],
    ) -> Result<(), NetworkError>;

    /// Terminate a session.
    async fn remove(&self, connection: ConnectionId);

    /// Pre-add handshake: negotiate the endpoint pair to use with `peer`.
    async fn get_available_endpoint(
        &self,
        peer: NodeId,
        peer_endpoints: EndpointPair,
    ) -> Result<(EndpointPair, NatKind), NetworkError>;

    /// Finalise a session with `peer` on the negotiated endpoints.
    async fn add(
        &self,
        peer: NodeId,
        endpoints: EndpointPair,
        validation_token: Vec<u8>,
    ) -> Result<(), NetworkError>;
}
