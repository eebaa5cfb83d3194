//! The per-process container of virtual nodes.
//!
//! The pool owns every local node and its stabilization task, dispatches
//! inbound requests by `to_id`, and implements the ring-wide
//! `find_node_below_or_equal` search with no global membership state:
//! it seeds from what the local nodes know and then iterates over the
//! network one hop at a time.
//!
//! Datagrams addressed to the reserved all-zero id are answered by the
//! pool itself. Bootstrap entries carry that id, which is how a fresh pool
//! can ask a peer it knows nothing about for a first hop; the pool answers
//! such queries from all local knowledge, including the hosted ids
//! themselves. The pool never initiates calls under the pool id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::seq::IndexedRandom;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::core::identifier::{closest_below, RemoteNode, SwarmId};
use crate::core::timings::{Timings, MAX_SEARCH_HOPS};
use crate::node::VirtualNode;
use crate::protocol::{Envelope, RpcPayload};
use crate::transport::{RpcError, Transport};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    /// The pool has no local candidates and no usable bootstrap; the
    /// caller retries on its next stabilization tick.
    #[error("cannot route: no local candidates and no usable bootstrap")]
    RoutingUnavailable,
}

struct NodeEntry {
    node: Arc<VirtualNode>,
    stabilizer: JoinHandle<()>,
}

pub struct NodePool {
    transport: Arc<Transport>,
    local_address: String,
    timings: Timings,
    /// Routing hints only; never stored in any table.
    bootstraps: Vec<RemoteNode>,
    nodes: RwLock<HashMap<SwarmId, NodeEntry>>,
}

impl NodePool {
    /// Wire a pool to a bound transport and start receiving. Bootstrap
    /// addresses equal to the local bind are dropped up front.
    pub fn new(transport: Arc<Transport>, bootstrap_addrs: Vec<String>, timings: Timings) -> Arc<Self> {
        let local_address = transport.local_address_string();
        let bootstraps = bootstrap_addrs
            .into_iter()
            .filter(|addr| *addr != local_address)
            .map(RemoteNode::pool)
            .collect();
        let pool = Arc::new(Self {
            transport,
            local_address,
            timings,
            bootstraps,
            nodes: RwLock::new(HashMap::new()),
        });
        pool.transport.start(Arc::downgrade(&pool));
        pool
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// The bind address in `host:port` form, as peers will see us.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn get(&self, id: &SwarmId) -> Option<Arc<VirtualNode>> {
        self.nodes
            .read()
            .unwrap()
            .get(id)
            .map(|entry| Arc::clone(&entry.node))
    }

    pub fn nodes(&self) -> Vec<Arc<VirtualNode>> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .map(|entry| Arc::clone(&entry.node))
            .collect()
    }

    /// Insert a node and start stabilizing it. Only the controller calls
    /// this; at most one node per id. Returns false on an occupied id.
    pub(crate) fn insert(self: &Arc<Self>, node: Arc<VirtualNode>) -> bool {
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(&node.id()) {
            return false;
        }
        let weak = Arc::downgrade(self);
        let task_node = Arc::clone(&node);
        let stabilizer = tokio::spawn(async move {
            task_node.run_stabilizer(weak).await;
        });
        debug!("hosting virtual node {}", node.id());
        nodes.insert(node.id(), NodeEntry { node, stabilizer });
        true
    }

    /// Remove a node, cancelling its stabilization task at the next
    /// suspension point.
    pub(crate) fn remove(&self, id: &SwarmId) -> Option<Arc<VirtualNode>> {
        let entry = self.nodes.write().unwrap().remove(id)?;
        entry.stabilizer.abort();
        Some(entry.node)
    }

    /// Tear down every node and the transport. Process-exit only.
    pub fn shutdown(&self) {
        for (_, entry) in self.nodes.write().unwrap().drain() {
            entry.stabilizer.abort();
        }
        self.transport.shutdown();
    }

    // ---- inbound dispatch ------------------------------------------------

    /// Route one inbound request to its addressee. Unknown addressees are
    /// dropped silently; absence is the signal in this protocol.
    pub(crate) fn handle_request(&self, src_address: &str, env: &Envelope) -> Option<Envelope> {
        if env.to_id.is_zero() {
            return self.handle_pool_request(env);
        }
        match self.get(&env.to_id) {
            Some(node) => node.handle_request(src_address, env),
            None => {
                trace!("dropping request for unhosted id {}", env.to_id);
                None
            }
        }
    }

    /// Requests addressed to the pool id. The pool answers pings (pool
    /// liveness) and node queries (first hops for peers that only know
    /// our address); everything else is dropped.
    fn handle_pool_request(&self, env: &Envelope) -> Option<Envelope> {
        match &env.payload {
            RpcPayload::PingRequest => Some(env.reply(RpcPayload::PingResponse)),
            RpcPayload::GetNodeRequest { query_id } => {
                let node = self
                    .pool_candidate(query_id)
                    .unwrap_or_else(|| RemoteNode::new(SwarmId::zero(), ""));
                Some(env.reply(RpcPayload::GetNodeResponse { node }))
            }
            _ => None,
        }
    }

    /// Best answer for a remote query: the closest table candidate from
    /// below across all local nodes, beaten by any hosted id closer to the
    /// query. Hosted ids are named with the empty address; the asker's
    /// decoder fills in our address as it observes it.
    fn pool_candidate(&self, query_id: &SwarmId) -> Option<RemoteNode> {
        let nodes = self.nodes();
        let candidates: Vec<RemoteNode> = nodes
            .iter()
            .filter_map(|node| node.table_candidate(query_id))
            .collect();
        let mut best = closest_below(query_id, candidates.iter()).cloned();
        for node in &nodes {
            let id = node.id();
            let improves = match &best {
                None => true,
                Some(b) => id.in_open_closed(&b.id, query_id),
            };
            if improves {
                best = Some(RemoteNode::new(id, ""));
            }
        }
        best
    }

    // ---- ring-wide search ------------------------------------------------

    /// Seed for a search issued by the local node `caller`: the closest
    /// table candidate across all local nodes, with the other hosted ids
    /// competing as candidates at our own address. The caller itself never
    /// seeds, so a node searching its own id can reach its swarm instead
    /// of short-circuiting on itself.
    fn seed_candidate(&self, caller: &SwarmId, query_id: &SwarmId) -> Option<RemoteNode> {
        let nodes = self.nodes();
        let mut candidates: Vec<RemoteNode> = Vec::with_capacity(nodes.len() * 2);
        for node in &nodes {
            if let Some(candidate) = node.table_candidate(query_id) {
                candidates.push(candidate);
            }
            if node.id() != *caller {
                candidates.push(RemoteNode::new(node.id(), self.local_address.clone()));
            }
        }
        closest_below(query_id, candidates.iter()).cloned()
    }

    /// The ring-wide routing primitive: the known node with id closest to
    /// `query_id` without passing it, found by iterating GetNode hops from
    /// the best local seed (or a configured bootstrap on a fresh pool).
    pub async fn find_node_below_or_equal(
        &self,
        caller: SwarmId,
        query_id: SwarmId,
    ) -> Result<RemoteNode, RoutingError> {
        let mut from_bootstrap = false;
        let mut candidate = match self.seed_candidate(&caller, &query_id) {
            Some(candidate) => candidate,
            None => {
                let bootstrap = self
                    .bootstraps
                    .choose(&mut rand::rng())
                    .cloned()
                    .ok_or(RoutingError::RoutingUnavailable)?;
                from_bootstrap = true;
                bootstrap
            }
        };

        for _ in 0..MAX_SEARCH_HOPS {
            if !from_bootstrap && candidate.id == query_id {
                return Ok(candidate);
            }
            let response = self
                .transport
                .call(
                    caller,
                    &candidate,
                    RpcPayload::GetNodeRequest { query_id },
                    self.timings.rpc_timeout,
                )
                .await;
            let next = match response {
                Ok(env) => match env.payload {
                    RpcPayload::GetNodeResponse { node } => node,
                    // correlation guarantees the kind; treat anything else
                    // as no answer
                    _ => return Self::conclude(candidate, from_bootstrap),
                },
                // unreachable peer: the current candidate is the best known
                Err(_) => return Self::conclude(candidate, from_bootstrap),
            };

            if next.id.is_zero() {
                // "no answer" sentinel from a pool
                return Self::conclude(candidate, from_bootstrap);
            }
            if next.id == query_id {
                return Ok(next);
            }
            // a bootstrap's first hop is taken on faith; afterwards each
            // hop must strictly advance without passing the target
            if from_bootstrap || next.id.in_open_closed(&candidate.id, &query_id) {
                candidate = next;
                from_bootstrap = false;
            } else {
                return Self::conclude(candidate, from_bootstrap);
            }
        }
        Self::conclude(candidate, from_bootstrap)
    }

    /// A search never returns the bootstrap entry itself.
    fn conclude(candidate: RemoteNode, from_bootstrap: bool) -> Result<RemoteNode, RoutingError> {
        if from_bootstrap || candidate.id.is_zero() {
            Err(RoutingError::RoutingUnavailable)
        } else {
            Ok(candidate)
        }
    }

    // ---- rpc helpers for stabilization -----------------------------------

    pub(crate) async fn ping(&self, caller: SwarmId, remote: &RemoteNode) -> Result<(), RpcError> {
        self.transport
            .call(caller, remote, RpcPayload::PingRequest, self.timings.rpc_timeout)
            .await
            .map(|_| ())
    }

    pub(crate) async fn get_swarm(
        &self,
        caller: SwarmId,
        remote: &RemoteNode,
    ) -> Result<Vec<RemoteNode>, RpcError> {
        let env = self
            .transport
            .call(caller, remote, RpcPayload::GetSwarmRequest, self.timings.rpc_timeout)
            .await?;
        match env.payload {
            RpcPayload::GetSwarmResponse { swarm } => Ok(swarm),
            _ => Ok(Vec::new()),
        }
    }

    pub(crate) async fn get_content(
        &self,
        caller: SwarmId,
        remote: &RemoteNode,
    ) -> Result<Vec<u8>, RpcError> {
        let env = self
            .transport
            .call(caller, remote, RpcPayload::GetContentRequest, self.timings.rpc_timeout)
            .await?;
        match env.payload {
            RpcPayload::GetContentResponse { value } => Ok(value),
            _ => Ok(Vec::new()),
        }
    }
}
