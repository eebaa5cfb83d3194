//! A virtual node: one ring participant holding one (id, optional value)
//! binding.
//!
//! State is guarded by a single std mutex per node. Two producers touch it:
//! the node's own stabilization task and transport-dispatched handler
//! calls. Critical sections are short and never span an await; every RPC
//! in the stabilization pass runs with the state unlocked and installs its
//! result afterwards.

use std::sync::Mutex;

use futures::future;
use rand::Rng;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::core::identifier::{RemoteNode, SwarmId, RING_BITS};
use crate::pool::NodePool;
use crate::protocol::{Envelope, RpcPayload};

/// Point-in-time view of a node's routing state, for the shell and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: SwarmId,
    pub has_value: bool,
    pub predecessor: Option<RemoteNode>,
    pub successor: Option<RemoteNode>,
    /// Populated finger entries as (k, node); entry k targets id + 2^k.
    pub fingers: Vec<(usize, RemoteNode)>,
    pub swarm: Vec<RemoteNode>,
}

#[derive(Debug)]
struct NodeState {
    /// Write-once. When present, sha1(value) == id.
    value: Option<Vec<u8>>,
    predecessor: Option<RemoteNode>,
    successor: Option<RemoteNode>,
    /// Entry k is an upper-bound candidate for id + 2^k: a node believed to
    /// be at or before that target and as close to it as currently known.
    fingers: Vec<Option<RemoteNode>>,
    /// Other members of this id's swarm, sorted by address. Never contains
    /// this node itself.
    swarm: Vec<RemoteNode>,
}

#[derive(Debug)]
pub struct VirtualNode {
    id: SwarmId,
    state: Mutex<NodeState>,
}

impl VirtualNode {
    /// Host mode: the value is present from birth and the id is its hash.
    pub fn host(value: Vec<u8>) -> Self {
        let id = SwarmId::from_value(&value);
        Self::with_state(id, Some(value))
    }

    /// Join mode: the id names an existing swarm; stabilization pulls the
    /// value.
    pub fn join(id: SwarmId) -> Self {
        Self::with_state(id, None)
    }

    fn with_state(id: SwarmId, value: Option<Vec<u8>>) -> Self {
        Self {
            id,
            state: Mutex::new(NodeState {
                value,
                predecessor: None,
                successor: None,
                fingers: vec![None; RING_BITS],
                swarm: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> SwarmId {
        self.id
    }

    pub fn has_value(&self) -> bool {
        self.state.lock().unwrap().value.is_some()
    }

    pub fn value(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().value.clone()
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state.lock().unwrap();
        NodeStatus {
            id: self.id,
            has_value: state.value.is_some(),
            predecessor: state.predecessor.clone(),
            successor: state.successor.clone(),
            fingers: state
                .fingers
                .iter()
                .enumerate()
                .filter_map(|(k, f)| f.clone().map(|f| (k, f)))
                .collect(),
            swarm: state.swarm.clone(),
        }
    }

    /// This node as it names itself on the wire: the empty address tells
    /// the receiver to substitute the datagram source, since a pool does
    /// not know its external address.
    fn self_remote(&self) -> RemoteNode {
        RemoteNode::new(self.id, "")
    }

    // ---- server side -----------------------------------------------------

    /// Handle one inbound request addressed to this node, producing the
    /// reply datagram. The sender is also folded into our routing state:
    /// inbound traffic is how knowledge of the ring propagates backwards,
    /// there is no separate notify call in this protocol.
    pub(crate) fn handle_request(&self, src_address: &str, env: &Envelope) -> Option<Envelope> {
        debug_assert_eq!(env.to_id, self.id);
        if !env.from_id.is_zero() {
            self.learn_peer(&RemoteNode::new(env.from_id, src_address));
        }
        match &env.payload {
            RpcPayload::PingRequest => Some(env.reply(RpcPayload::PingResponse)),
            RpcPayload::GetNodeRequest { query_id } => Some(env.reply(RpcPayload::GetNodeResponse {
                node: self.answer_get_node(query_id),
            })),
            RpcPayload::GetSwarmRequest => {
                let mut swarm = self.state.lock().unwrap().swarm.clone();
                swarm.push(self.self_remote());
                Some(env.reply(RpcPayload::GetSwarmResponse { swarm }))
            }
            RpcPayload::GetContentRequest => {
                let value = self.value().unwrap_or_default();
                Some(env.reply(RpcPayload::GetContentResponse { value }))
            }
            // responses are resolved by the transport, never dispatched here
            _ => None,
        }
    }

    /// The closest node with id in `(…, query_id]` known locally:
    /// the predecessor if the query falls between it and us, else the
    /// highest finger not past the query, else this node itself.
    pub(crate) fn answer_get_node(&self, query_id: &SwarmId) -> RemoteNode {
        if *query_id == self.id {
            return self.self_remote();
        }
        self.table_candidate(query_id)
            .unwrap_or_else(|| self.self_remote())
    }

    /// The table-derived part of [`answer_get_node`]: no self fallback.
    /// Ring-wide searches seed from this so a search can never
    /// short-circuit on the node that asked for it.
    pub(crate) fn table_candidate(&self, query_id: &SwarmId) -> Option<RemoteNode> {
        let state = self.state.lock().unwrap();
        if let Some(pred) = &state.predecessor {
            if query_id.in_closed_open(&pred.id, &self.id) {
                return Some(pred.clone());
            }
        }
        for finger in state.fingers.iter().rev().flatten() {
            if query_id.in_closed_open(&finger.id, &self.id) {
                return Some(finger.clone());
            }
        }
        None
    }

    /// Fold an observed live peer into our routing state: it may be a
    /// better predecessor, successor or finger, or a previously unknown
    /// swarm member.
    fn learn_peer(&self, remote: &RemoteNode) {
        let mut state = self.state.lock().unwrap();
        if remote.id == self.id {
            if !state.swarm.iter().any(|m| m.address == remote.address) {
                state.swarm.push(remote.clone());
                state.swarm.sort_by(|a, b| a.address.cmp(&b.address));
                debug!("node {}: learned swarm member {}", self.id, remote.address);
            }
            return;
        }
        match &state.predecessor {
            None => state.predecessor = Some(remote.clone()),
            Some(pred) => {
                if remote.id.in_open_closed(&pred.id, &self.id) {
                    state.predecessor = Some(remote.clone());
                }
            }
        }
        match &state.successor {
            None => state.successor = Some(remote.clone()),
            Some(succ) => {
                if remote.id != succ.id && remote.id.in_open_closed(&self.id, &succ.id) {
                    state.successor = Some(remote.clone());
                }
            }
        }
        for k in 0..RING_BITS {
            let target = self.id.advance_pow2(k);
            let improves = match &state.fingers[k] {
                None => remote.id.in_open_closed(&self.id, &target),
                Some(finger) => remote.id.in_open_closed(&finger.id, &target),
            };
            if improves {
                state.fingers[k] = Some(remote.clone());
            }
        }
    }

    /// Adopt a value candidate pulled from the swarm. Rejects anything
    /// whose hash differs from our id, and never overwrites: a node either
    /// hosts content from birth or acquires it exactly once.
    fn try_adopt_value(&self, value: Vec<u8>) -> bool {
        if value.is_empty() || SwarmId::from_value(&value) != self.id {
            warn!("node {}: rejecting content with wrong hash", self.id);
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if state.value.is_some() {
            return false;
        }
        info!("node {}: got valid content ({} bytes)", self.id, value.len());
        state.value = Some(value);
        true
    }

    // ---- stabilization ---------------------------------------------------

    /// Periodic self-maintenance until the pool goes away. The sleep is
    /// jittered ±20% so co-hosted nodes spread their passes.
    pub(crate) async fn run_stabilizer(&self, pool: std::sync::Weak<NodePool>) {
        loop {
            let Some(pool) = pool.upgrade() else {
                return;
            };
            let interval = pool.timings().stabilize_interval;
            self.stabilize_once(&pool).await;
            drop(pool);

            let jitter = 0.8 + 0.4 * rand::rng().random::<f64>();
            sleep(interval.mul_f64(jitter)).await;
        }
    }

    /// One stabilization pass, steps in strict order. Every step is capped
    /// at the cycle budget so an unreachable stretch of ring cannot stall
    /// the loop; a step cut short leaves its remaining slots at their
    /// previous values.
    pub async fn stabilize_once(&self, pool: &NodePool) {
        let budget = pool.timings().stabilize_interval.max(Duration::from_millis(100));
        let _ = timeout(budget, self.refresh_predecessor(pool)).await;
        let _ = timeout(budget, self.refresh_fingers(pool)).await;
        let _ = timeout(budget, self.refresh_successor(pool)).await;
        let _ = timeout(budget, self.discover_swarm(pool)).await;
        let _ = timeout(budget, self.refresh_swarm(pool)).await;
        let _ = timeout(budget, self.pull_content(pool)).await;
    }

    async fn refresh_predecessor(&self, pool: &NodePool) {
        if let Ok(node) = pool.find_node_below_or_equal(self.id, self.id.prev()).await {
            let pred = (node.id != self.id).then_some(node);
            self.state.lock().unwrap().predecessor = pred;
        }
    }

    async fn refresh_fingers(&self, pool: &NodePool) {
        for k in 0..RING_BITS {
            let target = self.id.advance_pow2(k);
            match pool.find_node_below_or_equal(self.id, target).await {
                Ok(node) => {
                    // a result outside (self, target] means no node is known
                    // in that arc; the entry is cleared rather than kept stale
                    let entry = node.id.in_open_closed(&self.id, &target).then_some(node);
                    self.state.lock().unwrap().fingers[k] = entry;
                }
                // search failed; keep whatever the slot held
                Err(_) => {}
            }
        }
    }

    /// Walk backwards from the nearest known node after us: each hop asks
    /// for the node just below the current candidate, and only a node
    /// strictly between us and the candidate is accepted. When the walk
    /// yields nothing closer (usually because it came back to us), the
    /// candidate is our successor.
    async fn refresh_successor(&self, pool: &NodePool) {
        let start = {
            let state = self.state.lock().unwrap();
            state.fingers.iter().flatten().find(|f| f.id != self.id).cloned()
        };
        let Some(mut candidate) = start else {
            self.state.lock().unwrap().successor = None;
            return;
        };

        for _ in 0..crate::core::timings::MAX_SEARCH_HOPS {
            match pool.find_node_below_or_equal(self.id, candidate.id.prev()).await {
                Ok(next)
                    if next.id != candidate.id
                        && next.id.in_open_closed(&self.id, &candidate.id) =>
                {
                    candidate = next;
                }
                _ => break,
            }
        }
        self.state.lock().unwrap().successor = Some(candidate);
    }

    /// If we know no swarm yet, ask the ring for a node at exactly our id.
    async fn discover_swarm(&self, pool: &NodePool) {
        if !self.state.lock().unwrap().swarm.is_empty() {
            return;
        }
        if let Ok(node) = pool.find_node_below_or_equal(self.id, self.id).await {
            if node.id == self.id && node.address != pool.local_address() {
                debug!("node {}: discovered swarm member {}", self.id, node.address);
                let mut state = self.state.lock().unwrap();
                if state.swarm.is_empty() {
                    state.swarm.push(node);
                }
            }
        }
    }

    /// Merge every member's view of the swarm with ours, then keep only
    /// the members that answer a ping. Calls to distinct members run
    /// concurrently, so a dead member costs one RPC timeout rather than
    /// stalling the whole pass.
    async fn refresh_swarm(&self, pool: &NodePool) {
        let members = self.state.lock().unwrap().swarm.clone();
        if members.is_empty() {
            return;
        }

        let views =
            future::join_all(members.iter().map(|member| pool.get_swarm(self.id, member))).await;
        let mut candidates = members.clone();
        for view in views.into_iter().flatten() {
            for node in view {
                if node.id == self.id
                    && node.address != pool.local_address()
                    && !candidates.iter().any(|c| c.address == node.address)
                {
                    candidates.push(node);
                }
            }
        }

        let pings =
            future::join_all(candidates.iter().map(|c| pool.ping(self.id, c))).await;
        let mut alive: Vec<RemoteNode> = candidates
            .into_iter()
            .zip(pings)
            .filter_map(|(candidate, ping)| ping.ok().map(|_| candidate))
            .collect();
        alive.sort_by(|a, b| a.address.cmp(&b.address));
        self.state.lock().unwrap().swarm = alive;
    }

    /// Poll swarm members for the value until one supplies bytes that hash
    /// to our id.
    async fn pull_content(&self, pool: &NodePool) {
        if self.has_value() {
            return;
        }
        let members = self.state.lock().unwrap().swarm.clone();
        for member in members {
            match pool.get_content(self.id, &member).await {
                Ok(value) if !value.is_empty() => {
                    if self.try_adopt_value(value) {
                        return;
                    }
                    // wrong hash; keep polling the rest of the swarm
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::MessageKind;
    use crate::test_support::test_support::{id_with_first_byte, remote_with_first_byte};

    #[test]
    fn get_node_prefers_predecessor_over_fingers() {
        let node = VirtualNode::join(id_with_first_byte(0x80));
        let pred = remote_with_first_byte(0x70, 7000);
        let finger = remote_with_first_byte(0x72, 7200);
        node.learn_peer(&pred);
        node.learn_peer(&finger);
        // 0x72 displaced 0x70 as the predecessor (closer behind 0x80)
        assert_eq!(node.status().predecessor, Some(remote_with_first_byte(0x72, 7200)));

        // query between predecessor and self resolves through the table
        let query = id_with_first_byte(0x75);
        let answer = node.answer_get_node(&query);
        assert_eq!(answer, remote_with_first_byte(0x72, 7200));
    }

    #[test]
    fn get_node_falls_back_to_self() {
        let node = VirtualNode::join(id_with_first_byte(0x80));
        // empty tables: the only safe answer is ourselves, named by the
        // empty address
        let answer = node.answer_get_node(&id_with_first_byte(0x10));
        assert_eq!(answer.id, node.id());
        assert_eq!(answer.address, "");
        // and the table-only variant reports nothing
        assert!(node.table_candidate(&id_with_first_byte(0x10)).is_none());
    }

    #[test]
    fn get_node_on_own_id_returns_self() {
        let node = VirtualNode::join(id_with_first_byte(0x80));
        node.learn_peer(&remote_with_first_byte(0x70, 7000));
        let answer = node.answer_get_node(&id_with_first_byte(0x80));
        assert_eq!(answer.id, node.id());
    }

    #[test]
    fn get_node_picks_highest_finger_not_past_query() {
        let node = VirtualNode::join(id_with_first_byte(0x10));
        let near = remote_with_first_byte(0x20, 2000);
        let far = remote_with_first_byte(0x80, 8000);
        node.learn_peer(&near);
        node.learn_peer(&far);

        // 0x90 is past both fingers; the higher one wins
        assert_eq!(node.answer_get_node(&id_with_first_byte(0x90)), far);
        // 0x30 is before 0x80, so only the near finger qualifies
        assert_eq!(node.answer_get_node(&id_with_first_byte(0x30)), near);
    }

    #[test]
    fn learning_a_same_id_peer_grows_the_swarm() {
        let node = VirtualNode::join(id_with_first_byte(0x42));
        let mate = RemoteNode::new(id_with_first_byte(0x42), "127.0.0.1:9001");
        node.learn_peer(&mate);
        node.learn_peer(&mate); // idempotent
        assert_eq!(node.status().swarm, vec![mate]);
        // same-id peers never become predecessor or fingers
        let status = node.status();
        assert!(status.predecessor.is_none());
        assert!(status.fingers.is_empty());
    }

    #[test]
    fn learning_updates_successor_and_fingers() {
        let node = VirtualNode::join(id_with_first_byte(0x10));
        let far = remote_with_first_byte(0x90, 9000);
        let near = remote_with_first_byte(0x20, 2000);
        node.learn_peer(&far);
        assert_eq!(node.status().successor, Some(far.clone()));
        node.learn_peer(&near);
        // a closer node after us replaces the successor
        assert_eq!(node.status().successor, Some(near.clone()));

        // finger entries hold the best known node at or before id + 2^k
        let status = node.status();
        assert!(status.fingers.iter().any(|(_, f)| *f == near));
        assert!(status.fingers.iter().any(|(_, f)| *f == far));
    }

    #[test]
    fn adoption_requires_matching_hash() {
        let node = VirtualNode::join(SwarmId::from_value(b"y"));
        assert!(!node.try_adopt_value(b"x".to_vec()));
        assert!(!node.has_value());

        assert!(node.try_adopt_value(b"y".to_vec()));
        assert_eq!(node.value(), Some(b"y".to_vec()));

        // write-once: a second adoption is refused even with a valid hash
        assert!(!node.try_adopt_value(b"y".to_vec()));
    }

    #[test]
    fn handlers_reply_in_kind() {
        let node = VirtualNode::host(b"payload".to_vec());
        let caller = id_with_first_byte(0x0F);
        let src = "127.0.0.1:7777";

        let ping = Envelope::new(caller, node.id(), RpcPayload::PingRequest);
        let reply = node.handle_request(src, &ping).unwrap();
        assert_eq!(reply.payload.kind(), MessageKind::PingResponse);
        assert_eq!(reply.from_id, node.id());
        assert_eq!(reply.to_id, caller);

        let content = Envelope::new(caller, node.id(), RpcPayload::GetContentRequest);
        let reply = node.handle_request(src, &content).unwrap();
        assert_eq!(
            reply.payload,
            RpcPayload::GetContentResponse {
                value: b"payload".to_vec()
            }
        );

        // get_swarm names ourselves with the empty address
        let swarm = Envelope::new(caller, node.id(), RpcPayload::GetSwarmRequest);
        let reply = node.handle_request(src, &swarm).unwrap();
        match reply.payload {
            RpcPayload::GetSwarmResponse { swarm } => {
                assert_eq!(swarm, vec![RemoteNode::new(node.id(), "")]);
            }
            other => panic!("expected GetSwarmResponse, got {other:?}"),
        }

        // the requester itself was learned as a peer
        assert_eq!(
            node.status().predecessor,
            Some(RemoteNode::new(caller, src))
        );
    }

    #[test]
    fn empty_content_reply_when_value_absent() {
        let node = VirtualNode::join(id_with_first_byte(0x42));
        let env = Envelope::new(id_with_first_byte(0x0F), node.id(), RpcPayload::GetContentRequest);
        let reply = node.handle_request("127.0.0.1:7777", &env).unwrap();
        assert_eq!(reply.payload, RpcPayload::GetContentResponse { value: Vec::new() });
    }
}
