//! # Mantle - Peer-to-Peer Overlay Routing Engine
//!
//! Mantle is the core of a structured-overlay routing node: it maintains an
//! XOR-metric view of the network, bootstraps into it, keeps its
//! neighbourhood populated, and forwards application messages toward their
//! destinations, either to a single node or replicated across the
//! destination's close group.
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for safe concurrent state:
//! the [`Engine`] handle is cheap to clone and callable from any thread,
//! while a private actor owns the routing table, client table and response
//! timer and processes commands sequentially. Timers are spawned sleeps
//! with epoch counters, so cancellation is observable and an aborted tick
//! never reschedules.
//!
//! The transport is not part of this crate. Implement [`Network`] over your
//! reliable-UDP (or in-memory test) transport and hand it to the engine;
//! inbound traffic flows back through an event channel.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `engine` | join/recovery state machine, send dispatch, teardown |
//! | `handler` | receive path: control messages, forwarding, reply matching |
//! | `routing_table` | primary neighbourhood with bucket policy and close set |
//! | `client_table` | attached non-relaying peers, kept out of routing |
//! | `timer` | reply aggregation with replication counts and deadlines |
//! | `message` | wire envelope and routing control messages |
//! | `network` | transport adaptor trait and events |
//! | `id` | 512-bit identifiers, XOR distance, keypairs |
//! | `config` | immutable per-instance parameters, status codes |

mod client_table;
mod config;
mod engine;
mod handler;
mod id;
mod message;
mod network;
mod node_info;
mod routing_table;
mod timer;

pub use client_table::{ClientTable, ClientTableError};
pub use config::{Config, StatusCode};
pub use engine::{
    Engine, EngineError, Functors, IdentityMode, JoinState, KeyHandler, SendOptions,
};
pub use id::{distance_cmp, Keypair, NodeId, ID_LEN};
pub use message::{
    deserialize_bounded, ControlMessage, Envelope, MessageKind, MAX_PAYLOAD_SIZE, MAX_WIRE_SIZE,
};
pub use network::{BootstrapHandle, Network, NetworkError, NetworkEvent};
pub use node_info::{ConnectionId, EndpointPair, NatKind, NodeInfo};
pub use routing_table::{AddError, AddOutcome, DropOutcome, RoutingTable};
pub use timer::{ResponseHandler, ResponseTimer};
