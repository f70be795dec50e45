//! # Receive Path
//!
//! Everything that happens to bytes coming off the wire: bounded decode,
//! opportunistic source capture, control-message dispatch, reply matching
//! and hop-by-hop forwarding. All of it runs on the engine actor, so
//! processing for a given session is serialised in delivery order.
//!
//! A message is handled locally when it is direct, addressed to this node,
//! or this node is within the destination's close group; otherwise it is
//! forwarded toward the destination with its hop budget decremented and
//! dropped when that budget runs out.

use tracing::{debug, info, trace, warn};

use crate::client_table::ClientTableError;
use crate::engine::{short, Command, EngineActor, IdentityMode, JoinState, KeyHandler};
use crate::id::NodeId;
use crate::message::{ControlMessage, Envelope};
use crate::network::Network;
use crate::node_info::NodeInfo;
use crate::routing_table::AddError;

impl<N: Network> EngineActor<N> {
    /// Entry point for raw transport bytes.
    pub(crate) fn handle_incoming(&mut self, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, len = bytes.len(), "received message failed to parse");
                return;
            }
        };

        let relayed = !envelope.has_source_id();
        let from = if relayed {
            envelope.relay_id.unwrap_or(NodeId::ZERO)
        } else {
            envelope.source_id
        };
        trace!(
            id = %short(&self.id()),
            from = %short(&from),
            message_id = envelope.id,
            relayed,
            "received message"
        );

        // Opportunistic capture for random routing probes: server-node
        // sources, plus any source on group responses.
        if ((self.anonymous || !envelope.client_node) && envelope.has_source_id())
            || (!envelope.direct && !envelope.request)
        {
            self.recent_sources.add(envelope.source_id);
        }

        self.handle_envelope(envelope);
    }

    /// Dispatch a decoded envelope; also the local-delivery path for sends
    /// addressed to this node.
    pub(crate) fn handle_envelope(&mut self, envelope: Envelope) {
        if envelope.destination_id.is_zero() {
            warn!("message without destination dropped");
            return;
        }
        if envelope.is_routing() {
            self.handle_control(envelope);
        } else {
            self.handle_node_level(envelope);
        }
    }

    // --------------------------------------------------------------------
    // Routing control messages
    // --------------------------------------------------------------------

    fn handle_control(&mut self, envelope: Envelope) {
        if !self.handles_locally(&envelope) {
            self.forward(envelope);
            return;
        }
        let Some(first) = envelope.payload.first() else {
            warn!("control message without payload dropped");
            return;
        };
        let control = match ControlMessage::decode(first) {
            Ok(control) => control,
            Err(err) => {
                warn!(error = %err, "control message failed to parse");
                return;
            }
        };
        trace!(name = control.name(), "handling control message");

        match control {
            ControlMessage::FindNodes { target, count } => {
                let count = (count as usize).min(self.config.max_routing_table_size);
                let nodes = self.routing.closest_nodes(&target, count);
                debug!(
                    id = %short(&self.id()),
                    target = %short(&target),
                    returned = nodes.len(),
                    "answering find-nodes"
                );
                let response = envelope.to_response(self.id());
                self.respond(response, &ControlMessage::FindNodesResponse { target, nodes });
            }
            ControlMessage::FindNodesResponse { nodes, .. } => {
                for node in nodes {
                    self.maybe_admit(node);
                }
            }
            ControlMessage::Connect { contact, client } => {
                let accepted = if client {
                    // Client sessions stay out of routing decisions; an id
                    // already routing for us cannot also attach as a client.
                    if self.routing.contains(&contact.id) {
                        false
                    } else {
                        match self.clients.add(contact.clone()) {
                            Ok(()) => true,
                            Err(ClientTableError::DuplicateConnection) => true,
                            Err(reason) => {
                                debug!(?reason, "client attach refused");
                                false
                            }
                        }
                    }
                } else {
                    let plausible = !contact.id.is_zero() && contact.id != self.id();
                    if plausible {
                        self.maybe_admit(contact.clone());
                    }
                    plausible
                };
                let response = envelope.to_response(self.id());
                let contact = self.self_info();
                self.respond(response, &ControlMessage::ConnectResponse { accepted, contact });
            }
            ControlMessage::ConnectResponse { accepted, contact } => {
                if accepted {
                    self.maybe_admit(contact);
                } else {
                    debug!(peer = %short(&contact.id), "connect refused by peer");
                }
            }
            ControlMessage::FindGroup { target } => {
                let group = self.routing.closest_nodes(&target, self.config.group_size);
                let response = envelope.to_response(self.id());
                self.respond(response, &ControlMessage::FindGroupResponse { target, group });
            }
            ControlMessage::FindGroupResponse { group, .. } => {
                for node in group {
                    self.maybe_admit(node);
                }
            }
        }
    }

    // --------------------------------------------------------------------
    // Node-level messages
    // --------------------------------------------------------------------

    fn handle_node_level(&mut self, envelope: Envelope) {
        if !envelope.request {
            // Reply: match against the pending task. Id 0 carries no task,
            // and anything left after completion is a straggler.
            if envelope.id == 0 {
                trace!("response without message id dropped");
                return;
            }
            for part in envelope.payload {
                self.timer.receive_reply(envelope.id, part);
            }
            return;
        }

        let destination = envelope.destination_id;
        let in_group = !envelope.direct
            && self
                .routing
                .is_this_node_in_range(&destination, self.config.group_size);
        if destination == self.id() || (in_group && !self.config.client) {
            debug!(
                id = %short(&self.id()),
                message_id = envelope.id,
                "delivering message to application"
            );
            if let Some(f) = &self.functors.message_received {
                for part in envelope.payload {
                    f(part);
                }
            }
            return;
        }
        self.forward(envelope);
    }

    // --------------------------------------------------------------------
    // Shared receive-path plumbing
    // --------------------------------------------------------------------

    /// Direct messages, messages addressed to us, and messages whose
    /// destination group we belong to stop here.
    fn handles_locally(&self, envelope: &Envelope) -> bool {
        envelope.direct
            || envelope.destination_id == self.id()
            || self
                .routing
                .is_this_node_in_range(&envelope.destination_id, self.config.group_size)
    }

    /// Spend one hop and push the envelope toward its destination.
    fn forward(&mut self, mut envelope: Envelope) {
        if envelope.hops_to_live == 0 {
            warn!(
                destination = %short(&envelope.destination_id),
                "hop budget exhausted; message dropped"
            );
            return;
        }
        envelope.hops_to_live -= 1;
        self.dispatch_outbound(envelope);
    }

    fn respond(&mut self, mut response: Envelope, control: &ControlMessage) {
        match control.encode() {
            Ok(bytes) => response.payload = vec![bytes],
            Err(err) => {
                warn!(error = %err, "control response failed to encode");
                return;
            }
        }
        self.dispatch_outbound(response);
    }

    /// Route an envelope produced on this node: self-delivery, a relay
    /// session, an established session, or the closest-node route, in that
    /// order.
    pub(crate) fn dispatch_outbound(&mut self, envelope: Envelope) {
        let destination = envelope.destination_id;
        if destination.is_zero() {
            warn!("outbound message without destination dropped");
            return;
        }
        if destination == self.id() {
            self.handle_envelope(envelope);
            return;
        }
        // A relay-bound peer is reachable only over its relay session.
        if envelope.relay_id == Some(destination)
            && let Some(relay_connection) = envelope.relay_connection_id
        {
            self.spawn_send_direct(envelope, relay_connection, None);
            return;
        }
        if let Some(node) = self.routing.node_by_id(&destination) {
            let connection = node.connection_id;
            self.spawn_send_direct(envelope, connection, None);
            return;
        }
        if let Some(connection) = self.clients.connection_for_id(&destination) {
            self.spawn_send_direct(envelope, connection, None);
            return;
        }
        if !self.routing.is_empty() {
            let route = self
                .routing
                .closest_nodes(&destination, self.config.group_size);
            self.spawn_send_route(envelope, route, None);
        } else if !self.bootstrap_connection.is_zero() {
            self.spawn_send_direct(envelope, self.bootstrap_connection, None);
        } else {
            warn!(
                destination = %short(&destination),
                "no path for outbound message"
            );
        }
    }

    // --------------------------------------------------------------------
    // Peer admission
    // --------------------------------------------------------------------

    /// Admission front door for peers learned from the wire: filters the
    /// obvious rejects, then validates the key through the embedder when a
    /// validator is supplied.
    pub(crate) fn maybe_admit(&mut self, node: NodeInfo) {
        if self.anonymous {
            return;
        }
        if node.id.is_zero() || node.id == self.id() || self.routing.contains(&node.id) {
            return;
        }
        if let Some(request_key) = &self.functors.request_public_key {
            let tx = self.cmd_tx.clone();
            let pending = node.clone();
            let handler: KeyHandler = Box::new(move |key| {
                // Validation completes back on the actor; a full queue just
                // drops this candidate, discovery will resurface it.
                let _ = tx.try_send(Command::PeerValidated { node: pending, key });
            });
            request_key(node.id, handler);
        } else {
            self.admit_peer(node);
        }
    }

    /// Insert a validated peer and apply every admission side effect.
    pub(crate) fn admit_peer(&mut self, node: NodeInfo) {
        // An id lives in exactly one table; promotion out of the client
        // table closes its sessions first.
        for client in self.clients.drop_nodes_by_id(&node.id) {
            self.spawn_remove(client.connection_id);
        }

        let peer = node.id;
        match self.routing.add_node(node) {
            Ok(outcome) => {
                info!(
                    id = %short(&self.id()),
                    peer = %short(&peer),
                    size = self.routing.len(),
                    "peer admitted to routing table"
                );
                if !self.anonymous {
                    self.identity_mode = IdentityMode::Member;
                }
                self.notify_size();
                if outcome.close_set_changed {
                    self.fire_close_node_replaced();
                }
                if let Some(evicted) = outcome.evicted {
                    self.spawn_remove(evicted.connection_id);
                    // Displacing a close peer leaves the same gap a lost one
                    // would.
                    if self
                        .routing
                        .is_this_node_in_range(&evicted.id, self.config.closest_set_size)
                    {
                        self.join_state = JoinState::Recovering;
                        self.schedule_recovery(self.config.recovery_lag, true);
                    }
                }
                if self.join_state == JoinState::Discovering {
                    self.enter_connected();
                }
            }
            Err(AddError::Full) => {
                debug!(peer = %short(&peer), "routing table rejected peer: full");
            }
            Err(reason) => {
                trace!(peer = %short(&peer), ?reason, "peer not admitted");
            }
        }
    }
}
