//! # Routing Engine
//!
//! The engine composes the routing table, client table and response timer
//! into a running overlay node. It follows the actor pattern used across
//! this codebase:
//!
//! - [`Engine`] is the public handle: cheap to clone, callable from any
//!   thread, never blocking on I/O.
//! - `EngineActor` owns every piece of mutable state and processes commands
//!   sequentially, so table invariants hold without locks and receive-path
//!   ordering per session is the command queue's ordering.
//!
//! ## Join lifecycle
//!
//! `Idle -> Bootstrapping -> Discovering -> Connected`, with `Recovering`
//! entered when a close peer is lost and `ReBootstrapping` when the table
//! empties or bootstrap fails outright. Interval work (discovery resends,
//! recovery ticks, re-bootstrap retries, reply deadlines) runs as spawned
//! sleeps that report back as commands; each loop carries an epoch counter,
//! and a tick whose epoch is stale was aborted and must not reschedule.
//!
//! ## Send classes
//!
//! Anonymous and partially-joined nodes relay everything through their
//! bootstrap session. Members route to the closest known peers, or
//! self-deliver when they are the destination (clients never self-deliver).
//! Group sends arm the response timer for `group_size` replies; direct
//! sends for exactly one.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use lru::LruCache;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::client_table::ClientTable;
use crate::config::{Config, StatusCode};
use crate::id::{Keypair, NodeId};
use crate::message::{ControlMessage, Envelope, MessageKind};
use crate::network::{BootstrapHandle, Network, NetworkError, NetworkEvent};
use crate::node_info::{ConnectionId, EndpointPair, NodeInfo};
use crate::routing_table::RoutingTable;
use crate::timer::{ResponseHandler, ResponseTimer};

/// Command queue depth; senders back off when the actor falls behind.
const CMD_CHANNEL_CAPACITY: usize = 256;

/// Transport event queue depth.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bound on the recent-source LRU used for random routing probes.
const RECENT_NODES_CAPACITY: usize = 100;

/// Transport settle time between zero-state bootstrap and the endpoint
/// handshake.
const ZERO_STATE_SETTLEMENT: Duration = Duration::from_millis(100);

/// Zero-state polls for the peer to appear in the routing table (50 x 100ms
/// keeps the whole join under five seconds).
const ZERO_STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ZERO_STATE_POLL_LIMIT: u32 = 50;

/// Callback receiving the validated key for a discovered peer, or `None`
/// when the embedder refuses it.
pub type KeyHandler = Box<dyn FnOnce(Option<VerifyingKey>) + Send + 'static>;

/// Callbacks supplied by the embedder. Every field defaults to "absent";
/// absent callbacks are skipped, and none is invoked after the engine
/// stops.
#[derive(Clone, Default)]
pub struct Functors {
    /// Join progress and failures: named [`StatusCode`]s are negative,
    /// non-negative values are routing-table sizes.
    pub network_status: Option<Arc<dyn Fn(i32) + Send + Sync>>,
    /// Application payload addressed to this node.
    pub message_received: Option<Arc<dyn Fn(Vec<u8>) + Send + Sync>>,
    /// Asynchronous key validation for peers learned from discovery.
    pub request_public_key: Option<Arc<dyn Fn(NodeId, KeyHandler) + Send + Sync>>,
    /// The close set changed; delivered with the new close set.
    pub close_node_replaced: Option<Arc<dyn Fn(Vec<NodeInfo>) + Send + Sync>>,
    /// A bootstrap endpoint proved reachable, for the embedder's cache.
    pub new_bootstrap_endpoint: Option<Arc<dyn Fn(SocketAddr) + Send + Sync>>,
}

impl std::fmt::Debug for Functors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Functors")
            .field("network_status", &self.network_status.is_some())
            .field("message_received", &self.message_received.is_some())
            .field("request_public_key", &self.request_public_key.is_some())
            .field("close_node_replaced", &self.close_node_replaced.is_some())
            .field("new_bootstrap_endpoint", &self.new_bootstrap_endpoint.is_some())
            .finish()
    }
}

/// Join/recovery lifecycle of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    Bootstrapping,
    Discovering,
    Connected,
    Recovering,
    ReBootstrapping,
    Stopped,
}

/// How this node participates in the overlay. Every send branches once on
/// this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityMode {
    /// No persistent identity; reachable only through the bootstrap relay.
    Anonymous,
    /// Identified but with an empty routing table; still relay-bound.
    PartiallyJoined,
    /// Fully joined with at least one routing peer.
    Member,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not allowed on an anonymous node")]
    AnonymousNotAllowed,
    #[error("not allowed on a client node")]
    ClientNotAllowed,
    #[error("peer record carries the zero id")]
    InvalidPeer,
    #[error("zero-state handshake did not find the bootstrap session")]
    ZeroStateHandshake,
    #[error("engine stopped")]
    Stopped,
    #[error("failed to join the network")]
    NotJoined,
}

/// Per-send options mirroring the wire flags.
#[derive(Clone, Copy, Debug)]
pub struct SendOptions {
    /// Unicast with replication 1 instead of group delivery.
    pub direct: bool,
    pub cacheable: bool,
    /// Reply deadline; on expiry the completion fires with whatever arrived.
    pub timeout: Duration,
    pub group_claim: Option<NodeId>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            direct: false,
            cacheable: false,
            timeout: Duration::from_secs(10),
            group_claim: None,
        }
    }
}

pub(crate) struct SendRequest {
    pub destination: NodeId,
    pub data: Vec<u8>,
    pub options: SendOptions,
    pub response: Option<ResponseHandler>,
}

pub(crate) enum Command {
    Join(Vec<SocketAddr>),
    Send(SendRequest),
    Event(NetworkEvent),
    BootstrapComplete(Result<BootstrapHandle, NetworkError>),
    ZeroStateReady {
        handle: BootstrapHandle,
        peer: NodeInfo,
        ack: oneshot::Sender<()>,
    },
    DiscoveryTick {
        epoch: u64,
        attempts: u32,
    },
    RecoveryTick {
        epoch: u64,
        lost_close_peer: bool,
    },
    ReBootstrapTick {
        epoch: u64,
    },
    ReplyDeadline(u64),
    OutboundFailed {
        message_id: u64,
    },
    PeerValidated {
        node: NodeInfo,
        key: Option<VerifyingKey>,
    },
    TableSize(oneshot::Sender<usize>),
    ClientCount(oneshot::Sender<usize>),
    ClosestNodes(NodeId, usize, oneshot::Sender<Vec<NodeInfo>>),
    ConfirmGroupMembers(NodeId, NodeId, oneshot::Sender<bool>),
    InRange(NodeId, usize, oneshot::Sender<bool>),
    State(oneshot::Sender<JoinState>),
    RandomRecent(oneshot::Sender<Option<NodeId>>),
    Stop(oneshot::Sender<()>),
}

// ============================================================================
// Public handle
// ============================================================================

pub struct Engine<N: Network> {
    cmd_tx: mpsc::Sender<Command>,
    event_tx: mpsc::Sender<NetworkEvent>,
    id: NodeId,
    anonymous: bool,
    client: bool,
    network: Arc<N>,
}

impl<N: Network> Clone for Engine<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            event_tx: self.event_tx.clone(),
            id: self.id,
            anonymous: self.anonymous,
            client: self.client,
            network: self.network.clone(),
        }
    }
}

impl<N: Network> Engine<N> {
    /// Start an engine. `keys: None` creates an anonymous node with an
    /// ephemeral identity; anonymous nodes are always client-mode.
    pub fn new(config: Config, keys: Option<Keypair>, network: N, functors: Functors) -> Self {
        let anonymous = keys.is_none();
        let keypair = keys.unwrap_or_else(Keypair::generate);
        let id = keypair.id();
        let client = config.client || anonymous;
        let network = Arc::new(network);

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (event_tx, mut event_rx) = mpsc::channel::<NetworkEvent>(EVENT_CHANNEL_CAPACITY);

        // Pump transport events into the command queue so the actor is the
        // single consumer of everything.
        let pump_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if pump_tx.send(Command::Event(event)).await.is_err() {
                    break;
                }
            }
        });

        if anonymous {
            info!(id = %short(&id), "starting anonymous engine");
        }

        let mut config = config;
        config.client = client;

        let actor = EngineActor {
            routing: RoutingTable::new(
                id,
                config.bucket_k,
                config.closest_set_size,
                config.max_routing_table_size,
            ),
            clients: ClientTable::new(id, config.max_clients_per_id),
            timer: ResponseTimer::new(),
            recent_sources: RecentNodes::new(RECENT_NODES_CAPACITY),
            identity_mode: if anonymous {
                IdentityMode::Anonymous
            } else {
                IdentityMode::PartiallyJoined
            },
            join_state: JoinState::Idle,
            running: true,
            anonymous,
            keypair,
            config,
            functors,
            bootstrap_connection: NodeId::ZERO,
            relay_connection: NodeId::ZERO,
            seed_endpoints: Vec::new(),
            setup_epoch: 0,
            recovery_epoch: 0,
            rebootstrap_epoch: 0,
            network: network.clone(),
            cmd_tx: cmd_tx.clone(),
            event_tx: event_tx.clone(),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            event_tx,
            id,
            anonymous,
            client,
            network,
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.client
    }

    /// Bootstrap into the overlay through the given seed endpoints and keep
    /// the neighbourhood populated from there on.
    pub async fn join(&self, seed_endpoints: Vec<SocketAddr>) {
        let _ = self.cmd_tx.send(Command::Join(seed_endpoints)).await;
    }

    /// Send `data` toward `destination`. With a `response` handler the call
    /// registers a pending task that completes with the collected replies;
    /// invalid input completes it immediately with an empty vector.
    pub async fn send(
        &self,
        destination: NodeId,
        data: Vec<u8>,
        options: SendOptions,
        response: Option<ResponseHandler>,
    ) {
        let request = SendRequest {
            destination,
            data,
            options,
            response,
        };
        if let Err(rejected) = self.cmd_tx.send(Command::Send(request)).await {
            // Engine gone: honour completion-once with an empty reply.
            if let Command::Send(request) = rejected.0 {
                if let Some(handler) = request.response {
                    handler(Vec::new());
                }
            }
        }
    }

    /// Bring up a two-node overlay from mutually known endpoints. Kademlia
    /// discovery is undefined with a single peer, so the peer is connected
    /// and inserted directly.
    pub async fn zero_state_join(
        &self,
        local: SocketAddr,
        peer_endpoint: SocketAddr,
        peer: NodeInfo,
    ) -> Result<()> {
        if self.anonymous {
            return Err(EngineError::AnonymousNotAllowed.into());
        }
        if self.client {
            return Err(EngineError::ClientNotAllowed.into());
        }
        if peer.id.is_zero() {
            return Err(EngineError::InvalidPeer.into());
        }

        let handle = self
            .network
            .bootstrap(vec![peer_endpoint], self.event_tx.clone(), Some(local))
            .await
            .context("failed to bootstrap to the zero-state peer")?;
        sleep(ZERO_STATE_SETTLEMENT).await;

        let pair = EndpointPair::symmetric(peer_endpoint);
        match self.network.get_available_endpoint(peer.id, pair).await {
            Err(NetworkError::BootstrapConnectionAlreadyExists) => {}
            Ok(_) | Err(_) => return Err(EngineError::ZeroStateHandshake.into()),
        }
        self.network
            .add(peer.id, pair, b"zero-state".to_vec())
            .await
            .context("failed to add the zero-state peer session")?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ZeroStateReady {
                handle,
                peer,
                ack: ack_tx,
            })
            .await
            .map_err(|_| EngineError::Stopped)?;
        ack_rx.await.map_err(|_| EngineError::Stopped)?;

        for _ in 0..ZERO_STATE_POLL_LIMIT {
            if self.table_size().await > 0 {
                info!(id = %short(&self.id), "zero-state join complete");
                return Ok(());
            }
            sleep(ZERO_STATE_POLL_INTERVAL).await;
        }
        Err(EngineError::NotJoined.into())
    }

    pub async fn table_size(&self) -> usize {
        self.query(Command::TableSize, 0).await
    }

    pub async fn client_count(&self) -> usize {
        self.query(Command::ClientCount, 0).await
    }

    pub async fn closest_nodes(&self, target: NodeId, n: usize) -> Vec<NodeInfo> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ClosestNodes(target, n, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn confirm_group_members(&self, a: NodeId, b: NodeId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ConfirmGroupMembers(a, b, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn is_in_range(&self, target: NodeId, range: usize) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::InRange(target, range, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn state(&self) -> JoinState {
        self.query(Command::State, JoinState::Stopped).await
    }

    /// A random recently-seen source id, for routing probes.
    pub async fn random_recent_node(&self) -> Option<NodeId> {
        self.query(Command::RandomRecent, None).await
    }

    /// Stop the engine: cancel all interval work and complete every pending
    /// task with an empty reply so no caller hangs.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
        fallback: T,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(build(tx)).await.is_err() {
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }
}

// ============================================================================
// Actor
// ============================================================================

/// Bounded LRU of recently seen source ids, kept for random routing probes
/// and pruned when peers disconnect.
pub(crate) struct RecentNodes {
    cache: LruCache<NodeId, ()>,
}

impl RecentNodes {
    fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(
                NonZeroUsize::new(capacity).expect("recent-node capacity is non-zero"),
            ),
        }
    }

    pub(crate) fn add(&mut self, id: NodeId) {
        if !id.is_zero() {
            self.cache.put(id, ());
        }
    }

    pub(crate) fn remove(&mut self, id: &NodeId) {
        self.cache.pop(id);
    }

    pub(crate) fn random(&self) -> Option<NodeId> {
        if self.cache.is_empty() {
            return None;
        }
        let skip = rand::random::<usize>() % self.cache.len();
        self.cache.iter().nth(skip).map(|(id, _)| *id)
    }
}

pub(crate) struct EngineActor<N: Network> {
    pub(crate) routing: RoutingTable,
    pub(crate) clients: ClientTable,
    pub(crate) timer: ResponseTimer,
    pub(crate) recent_sources: RecentNodes,
    pub(crate) identity_mode: IdentityMode,
    pub(crate) join_state: JoinState,
    pub(crate) running: bool,
    pub(crate) anonymous: bool,
    pub(crate) keypair: Keypair,
    pub(crate) config: Config,
    pub(crate) functors: Functors,
    pub(crate) bootstrap_connection: ConnectionId,
    pub(crate) relay_connection: ConnectionId,
    seed_endpoints: Vec<SocketAddr>,
    setup_epoch: u64,
    recovery_epoch: u64,
    rebootstrap_epoch: u64,
    pub(crate) network: Arc<N>,
    pub(crate) cmd_tx: mpsc::Sender<Command>,
    event_tx: mpsc::Sender<NetworkEvent>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl<N: Network> EngineActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                // Queries are answered even after stop; they read state only.
                Command::TableSize(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::ClientCount(reply) => {
                    let _ = reply.send(self.clients.len());
                }
                Command::ClosestNodes(target, n, reply) => {
                    let _ = reply.send(self.routing.closest_nodes(&target, n));
                }
                Command::ConfirmGroupMembers(a, b, reply) => {
                    let _ = reply.send(self.routing.confirm_group_members(&a, &b));
                }
                Command::InRange(target, range, reply) => {
                    let _ = reply.send(self.routing.is_this_node_in_range(&target, range));
                }
                Command::State(reply) => {
                    let _ = reply.send(self.join_state);
                }
                Command::RandomRecent(reply) => {
                    let _ = reply.send(self.recent_sources.random());
                }
                Command::Stop(ack) => {
                    self.shutdown();
                    let _ = ack.send(());
                }
                other if !self.running => {
                    Self::reject_after_stop(other);
                }
                Command::Join(seeds) => self.start_join(seeds),
                Command::Send(request) => self.handle_send(request),
                Command::Event(NetworkEvent::MessageReceived(bytes)) => {
                    self.handle_incoming(&bytes);
                }
                Command::Event(NetworkEvent::ConnectionLost(connection)) => {
                    self.handle_connection_lost(connection);
                }
                Command::BootstrapComplete(result) => self.handle_bootstrap_complete(result),
                Command::ZeroStateReady { handle, peer, ack } => {
                    self.handle_zero_state_ready(handle, peer);
                    let _ = ack.send(());
                }
                Command::DiscoveryTick { epoch, attempts } => {
                    self.handle_discovery_tick(epoch, attempts);
                }
                Command::RecoveryTick {
                    epoch,
                    lost_close_peer,
                } => {
                    self.handle_recovery_tick(epoch, lost_close_peer);
                }
                Command::ReBootstrapTick { epoch } => {
                    self.handle_rebootstrap_tick(epoch);
                }
                Command::ReplyDeadline(message_id) => {
                    self.timer.expire_task(message_id);
                }
                Command::OutboundFailed { message_id } => {
                    self.handle_outbound_failed(message_id);
                }
                Command::PeerValidated { node, key } => {
                    self.handle_peer_validated(node, key);
                }
            }
        }
        // All handles dropped: same quiescence guarantees as stop().
        self.shutdown();
    }

    #[inline]
    pub(crate) fn id(&self) -> NodeId {
        self.routing.self_id()
    }

    /// This node as a peer record, advertised in connect exchanges.
    pub(crate) fn self_info(&self) -> NodeInfo {
        NodeInfo::new(self.id(), self.relay_connection, self.keypair.public_key())
    }

    fn shutdown(&mut self) {
        if !self.running && self.join_state == JoinState::Stopped {
            return;
        }
        debug!(id = %short(&self.id()), "engine stopping");
        self.running = false;
        self.join_state = JoinState::Stopped;
        // Abort every interval loop; in-flight ticks arrive with stale
        // epochs and drop themselves.
        self.setup_epoch += 1;
        self.recovery_epoch += 1;
        self.rebootstrap_epoch += 1;
        self.timer.drain();
    }

    fn reject_after_stop(cmd: Command) {
        match cmd {
            Command::Send(request) => {
                if let Some(handler) = request.response {
                    handler(Vec::new());
                }
            }
            // Dropping the ack makes the zero-state caller observe Stopped.
            Command::ZeroStateReady { .. } => {}
            _ => trace!("command discarded after stop"),
        }
    }

    // --------------------------------------------------------------------
    // Join / bootstrap / recovery
    // --------------------------------------------------------------------

    fn start_join(&mut self, seeds: Vec<SocketAddr>) {
        if seeds.is_empty() {
            warn!("join requested without seed endpoints");
            self.notify_status(StatusCode::NotJoined);
            return;
        }
        self.seed_endpoints = seeds.clone();

        // Re-join: flush the current neighbourhood and their sessions.
        let flushed = self.routing.drain_all();
        if !flushed.is_empty() {
            for peer in &flushed {
                self.spawn_remove(peer.connection_id);
            }
            if !self.anonymous {
                self.identity_mode = IdentityMode::PartiallyJoined;
            }
            self.notify_size();
        }
        if !self.bootstrap_connection.is_zero() {
            debug!(
                connection = %short(&self.bootstrap_connection),
                "removing bootstrap session before re-bootstrap"
            );
            self.spawn_remove(self.bootstrap_connection);
            self.bootstrap_connection = NodeId::ZERO;
        }

        self.join_state = JoinState::Bootstrapping;
        self.setup_epoch += 1;
        self.recovery_epoch += 1;

        let network = self.network.clone();
        let events = self.event_tx.clone();
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = network.bootstrap(seeds, events, None).await;
            let _ = tx.send(Command::BootstrapComplete(result)).await;
        });
    }

    fn handle_bootstrap_complete(&mut self, result: Result<BootstrapHandle, NetworkError>) {
        if self.join_state != JoinState::Bootstrapping {
            debug!(state = ?self.join_state, "late bootstrap result discarded");
            return;
        }
        match result {
            Ok(handle) => {
                self.bootstrap_connection = handle.connection;
                self.relay_connection = handle.relay_connection;
                info!(
                    id = %short(&self.id()),
                    bootstrap = %short(&handle.connection),
                    "bootstrapped"
                );
                if let Some(f) = &self.functors.new_bootstrap_endpoint {
                    f(handle.endpoint);
                }
                self.notify_status(StatusCode::Success);
                if self.anonymous {
                    debug!("anonymous node stays relay-only; skipping discovery");
                    return;
                }
                self.join_state = JoinState::Discovering;
                self.send_find_nodes_to_bootstrap(0);
            }
            Err(err) => {
                warn!(error = %err, "bootstrap failed on all endpoints");
                self.notify_status(StatusCode::NotJoined);
                self.schedule_rebootstrap();
            }
        }
    }

    /// One discovery round: `FindNodes(self, 1)` to the bootstrap peer,
    /// retried every `find_close_node_interval` until a peer is admitted.
    fn send_find_nodes_to_bootstrap(&mut self, attempts: u32) {
        let control = ControlMessage::FindNodes {
            target: self.id(),
            count: 1,
        };
        let mut envelope = self.control_envelope(self.id(), &control);
        envelope.direct = true;
        trace!(attempts, "requesting closest node from bootstrap peer");
        self.spawn_send_direct(envelope, self.bootstrap_connection, None);

        self.setup_epoch += 1;
        let epoch = self.setup_epoch;
        let delay = self.config.find_close_node_interval;
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx
                .send(Command::DiscoveryTick {
                    epoch,
                    attempts: attempts + 1,
                })
                .await;
        });
    }

    fn handle_discovery_tick(&mut self, epoch: u64, attempts: u32) {
        if epoch != self.setup_epoch {
            return; // aborted
        }
        if !self.routing.is_empty() {
            self.enter_connected();
            return;
        }
        if attempts >= self.config.max_find_close_node_failures {
            warn!(
                id = %short(&self.id()),
                attempts,
                "discovery failed to find a closest node; re-bootstrapping"
            );
            self.schedule_rebootstrap();
            return;
        }
        self.send_find_nodes_to_bootstrap(attempts);
    }

    /// First routing peer admitted: discovery is done, the recovery loop
    /// takes over.
    pub(crate) fn enter_connected(&mut self) {
        if self.join_state != JoinState::Connected {
            info!(
                id = %short(&self.id()),
                size = self.routing.len(),
                "connected; starting recovery loop"
            );
        }
        self.join_state = JoinState::Connected;
        self.setup_epoch += 1;
        self.schedule_recovery(self.config.find_node_interval, false);
    }

    pub(crate) fn schedule_recovery(&mut self, delay: Duration, lost_close_peer: bool) {
        self.recovery_epoch += 1;
        let epoch = self.recovery_epoch;
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx
                .send(Command::RecoveryTick {
                    epoch,
                    lost_close_peer,
                })
                .await;
        });
    }

    fn handle_recovery_tick(&mut self, epoch: u64, lost_close_peer: bool) {
        if epoch != self.recovery_epoch {
            return; // aborted
        }
        if self.routing.is_empty() {
            warn!(id = %short(&self.id()), "routing table empty; re-bootstrapping");
            self.schedule_rebootstrap();
            return;
        }

        let size = self.routing.len();
        if lost_close_peer || size < self.config.routing_table_size_threshold {
            // After churn with a healthy table, only the close set needs
            // replenishing; a sparse table asks for a full refill.
            let count = if lost_close_peer && size > self.config.routing_table_size_threshold {
                self.config.closest_set_size
            } else {
                self.config.max_routing_table_size
            };
            debug!(size, count, "recovery requesting more peers");
            let control = ControlMessage::FindNodes {
                target: self.id(),
                count: count as u16,
            };
            let envelope = self.control_envelope(self.id(), &control);
            let route = self.routing.closest_nodes(&self.id(), self.config.group_size);
            self.spawn_send_route(envelope, route, None);
        }
        if size >= self.config.routing_table_size_threshold {
            self.join_state = JoinState::Connected;
        }
        self.schedule_recovery(self.config.find_node_interval, false);
    }

    fn schedule_rebootstrap(&mut self) {
        self.join_state = JoinState::ReBootstrapping;
        self.rebootstrap_epoch += 1;
        let epoch = self.rebootstrap_epoch;
        let delay = self.config.re_bootstrap_lag;
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Command::ReBootstrapTick { epoch }).await;
        });
    }

    fn handle_rebootstrap_tick(&mut self, epoch: u64) {
        if epoch != self.rebootstrap_epoch {
            return; // aborted
        }
        info!(id = %short(&self.id()), "re-bootstrapping");
        let seeds = self.seed_endpoints.clone();
        self.start_join(seeds);
    }

    fn handle_zero_state_ready(&mut self, handle: BootstrapHandle, peer: NodeInfo) {
        self.bootstrap_connection = handle.connection;
        self.relay_connection = handle.relay_connection;
        if let Some(f) = &self.functors.new_bootstrap_endpoint {
            f(handle.endpoint);
        }
        self.admit_peer(peer);
        self.enter_connected();
        self.notify_status(StatusCode::Success);
    }

    // --------------------------------------------------------------------
    // Send path
    // --------------------------------------------------------------------

    fn handle_send(&mut self, request: SendRequest) {
        let SendRequest {
            destination,
            data,
            options,
            response,
        } = request;

        if destination.is_zero() {
            warn!("send aborted: zero destination id");
            if let Some(handler) = response {
                handler(Vec::new());
            }
            return;
        }
        if data.is_empty() || data.len() > self.config.max_payload_size {
            warn!(len = data.len(), "send aborted: payload size not allowed");
            if let Some(handler) = response {
                handler(Vec::new());
            }
            return;
        }

        let replication = if options.direct {
            1
        } else {
            self.config.group_size as u16
        };

        let mut envelope = Envelope::new(MessageKind::NodeLevel, destination);
        envelope.direct = options.direct;
        envelope.cacheable = options.cacheable;
        envelope.client_node = self.config.client;
        envelope.group_claim = options.group_claim;
        envelope.hops_to_live = self.config.hops_to_live;
        envelope.replication = replication;
        envelope.payload = vec![data];

        let message_id = response.map(|handler| {
            let id = self.timer.add_task(replication, handler);
            self.schedule_reply_deadline(id, options.timeout);
            id
        });
        envelope.id = message_id.unwrap_or(0);

        match self.identity_mode {
            IdentityMode::Anonymous | IdentityMode::PartiallyJoined => {
                envelope.relay_id = Some(self.id());
                envelope.relay_connection_id = Some(self.relay_connection);
                if self.bootstrap_connection.is_zero() {
                    // Relay session already gone: fail fast.
                    self.fail_relay_send(message_id);
                    return;
                }
                self.spawn_send_direct(envelope, self.bootstrap_connection, message_id);
            }
            IdentityMode::Member => {
                envelope.source_id = self.id();
                if destination != self.id() {
                    let route = self
                        .routing
                        .closest_nodes(&destination, self.config.group_size);
                    self.spawn_send_route(envelope, route, message_id);
                } else if self.config.client {
                    // Clients never self-deliver.
                    trace!("client sending to own id; forwarding to closest");
                    let route = self
                        .routing
                        .closest_nodes(&destination, self.config.group_size);
                    self.spawn_send_route(envelope, route, message_id);
                } else {
                    debug!("delivering send to self");
                    self.handle_envelope(envelope);
                }
            }
        }
    }

    fn schedule_reply_deadline(&self, message_id: u64, timeout: Duration) {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            sleep(timeout).await;
            let _ = tx.send(Command::ReplyDeadline(message_id)).await;
        });
    }

    /// Relay-path send that can no longer reach the bootstrap session.
    fn fail_relay_send(&mut self, message_id: Option<u64>) {
        if let Some(message_id) = message_id {
            self.timer.cancel_task(message_id);
        }
        match self.identity_mode {
            IdentityMode::Anonymous => {
                warn!("anonymous session ended; send not allowed any more");
                self.notify_status(StatusCode::AnonymousSessionEnded);
            }
            IdentityMode::PartiallyJoined => {
                warn!("partial-join session ended; send not allowed any more");
                self.notify_status(StatusCode::PartialJoinSessionEnded);
            }
            IdentityMode::Member => {}
        }
    }

    fn handle_outbound_failed(&mut self, message_id: u64) {
        match self.identity_mode {
            IdentityMode::Member => self.timer.cancel_task(message_id),
            _ => self.fail_relay_send(Some(message_id)),
        }
    }

    fn handle_peer_validated(&mut self, mut node: NodeInfo, key: Option<VerifyingKey>) {
        match key {
            Some(key) => {
                node.public_key = key;
                self.admit_peer(node);
            }
            None => debug!(peer = %short(&node.id), "embedder refused peer key"),
        }
    }

    // --------------------------------------------------------------------
    // Connection loss
    // --------------------------------------------------------------------

    fn handle_connection_lost(&mut self, lost: ConnectionId) {
        debug!(connection = %short(&lost), "connection lost");

        let mut resend = self
            .routing
            .get_node_info(&lost)
            .map(|n| {
                self.routing
                    .is_this_node_in_range(&n.id, self.config.closest_set_size)
            })
            .unwrap_or(false);

        if let Some(outcome) = self.routing.drop_node_by_connection(&lost) {
            warn!(
                id = %short(&self.id()),
                peer = %short(&outcome.node.id),
                "lost connection to routing peer"
            );
            self.recent_sources.remove(&outcome.node.id);
            self.notify_size();
            if outcome.close_set_changed {
                self.fire_close_node_replaced();
            }
            if self.routing.is_empty() && !self.anonymous {
                self.identity_mode = IdentityMode::PartiallyJoined;
            }
        } else {
            resend = false;
            if let Some(client) = self.clients.drop_connection(&lost) {
                debug!(peer = %short(&client.id), "lost connection to client");
            } else if !self.bootstrap_connection.is_zero() && lost == self.bootstrap_connection {
                warn!("lost bootstrap session");
                self.bootstrap_connection = NodeId::ZERO;
                if self.anonymous {
                    self.notify_status(StatusCode::AnonymousSessionEnded);
                    self.timer.drain();
                    return;
                }
                if self.routing.is_empty() {
                    resend = true; // drives the recovery tick into re-bootstrap
                }
            } else {
                trace!(connection = %short(&lost), "lost unknown connection");
            }
        }

        if resend {
            self.join_state = JoinState::Recovering;
            self.schedule_recovery(self.config.recovery_lag, true);
        }
    }

    // --------------------------------------------------------------------
    // Shared plumbing (also used by the receive path)
    // --------------------------------------------------------------------

    /// Build a routing control envelope. Relay-bound nodes attach their
    /// relay coordinates instead of a source id.
    pub(crate) fn control_envelope(
        &self,
        destination: NodeId,
        control: &ControlMessage,
    ) -> Envelope {
        let mut envelope = Envelope::new(MessageKind::Routing, destination);
        envelope.client_node = self.config.client;
        envelope.hops_to_live = self.config.hops_to_live;
        match self.identity_mode {
            IdentityMode::Anonymous | IdentityMode::PartiallyJoined => {
                envelope.relay_id = Some(self.id());
                envelope.relay_connection_id = Some(self.relay_connection);
            }
            IdentityMode::Member => envelope.source_id = self.id(),
        }
        match control.encode() {
            Ok(bytes) => envelope.payload = vec![bytes],
            Err(err) => warn!(error = %err, "control message failed to encode"),
        }
        envelope
    }

    pub(crate) fn spawn_send_direct(
        &self,
        envelope: Envelope,
        connection: ConnectionId,
        message_id: Option<u64>,
    ) {
        let network = self.network.clone();
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = network.send_direct(envelope, connection).await {
                warn!(error = %err, connection = %short(&connection), "direct send failed");
                if let Some(message_id) = message_id {
                    let _ = tx.send(Command::OutboundFailed { message_id }).await;
                }
            }
        });
    }

    pub(crate) fn spawn_send_route(
        &self,
        envelope: Envelope,
        route: Vec<NodeInfo>,
        message_id: Option<u64>,
    ) {
        if route.is_empty() {
            warn!("no route available for message");
            if let Some(message_id) = message_id {
                let tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(Command::OutboundFailed { message_id }).await;
                });
            }
            return;
        }
        let network = self.network.clone();
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = network.send_to_route(envelope, &route).await {
                warn!(error = %err, "routed send failed");
                if let Some(message_id) = message_id {
                    let _ = tx.send(Command::OutboundFailed { message_id }).await;
                }
            }
        });
    }

    pub(crate) fn spawn_remove(&self, connection: ConnectionId) {
        let network = self.network.clone();
        tokio::spawn(async move {
            network.remove(connection).await;
        });
    }

    pub(crate) fn notify_status(&self, code: StatusCode) {
        self.notify_status_raw(code.into());
    }

    pub(crate) fn notify_size(&self) {
        self.notify_status_raw(self.routing.len() as i32);
    }

    fn notify_status_raw(&self, value: i32) {
        if !self.running {
            return;
        }
        if let Some(f) = &self.functors.network_status {
            f(value);
        }
    }

    pub(crate) fn fire_close_node_replaced(&self) {
        if !self.running {
            return;
        }
        if let Some(f) = &self.functors.close_node_replaced {
            f(self.routing.close_set());
        }
    }
}

pub(crate) fn short(id: &NodeId) -> String {
    hex::encode(&id.as_bytes()[..8])
}
