//! UDP endpoint shared by every virtual node in the process.
//!
//! One receive task parses inbound datagrams: responses resolve pending
//! call waiters, requests are handed to the pool for dispatch by `to_id`,
//! and everything else (malformed bytes, unknown addressees, late
//! duplicates) is dropped silently — absence is the signal in this
//! protocol. One send task drains an outbound queue so callers never block
//! on the socket.
//!
//! Correlation needs no sequence numbers on the wire: a response is matched
//! by `(peer address, responder id, caller id, response code)`, and at most
//! one request per that key may be outstanding. Starting a second one
//! cancels the first.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

use crate::core::identifier::{RemoteNode, SwarmId};
use crate::core::timings::MAX_DATAGRAM;
use crate::pool::NodePool;
use crate::protocol::{self, Envelope, MessageKind, RpcPayload};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// No response within the deadline. Stabilization recovers by leaving
    /// the affected slot alone and retrying next pass.
    #[error("no response within the deadline")]
    Timeout,
    /// The request was superseded by a newer one with the same correlation
    /// key, or the caller was torn down.
    #[error("request cancelled")]
    Cancelled,
    #[error("transport shut down")]
    TransportClosed,
    /// The peer's address string does not parse; it came off the wire and
    /// is trusted nowhere else.
    #[error("peer address does not parse")]
    BadPeerAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    peer: SocketAddr,
    responder: SwarmId,
    caller: SwarmId,
    kind: MessageKind,
}

struct PendingSlot {
    seq: u64,
    tx: oneshot::Sender<Envelope>,
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    pending: Mutex<HashMap<PendingKey, PendingSlot>>,
    outbound: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    next_seq: AtomicU64,
    closed: AtomicBool,
    decode_errors: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// Bind the process-wide socket and start the send task. The receive
    /// task starts once a pool is attached with [`Transport::start`].
    pub async fn bind(bind_addr: &str) -> anyhow::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<(SocketAddr, Vec<u8>)>();

        let transport = Arc::new(Self {
            socket: Arc::clone(&socket),
            local_addr,
            pending: Mutex::new(HashMap::new()),
            outbound,
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            decode_errors: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let send_task = tokio::spawn(async move {
            while let Some((dest, bytes)) = outbound_rx.recv().await {
                if let Err(e) = socket.send_to(&bytes, dest).await {
                    warn!("failed to send {} bytes to {dest}: {e}", bytes.len());
                }
            }
        });
        transport.tasks.lock().unwrap().push(send_task);

        Ok(transport)
    }

    /// Start the receive task, dispatching inbound requests to `pool`.
    pub fn start(self: &Arc<Self>, pool: Weak<NodePool>) {
        let transport = Arc::clone(self);
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, src) = match transport.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("udp receive error: {e}");
                        continue;
                    }
                };
                let src_address = src.to_string();
                let env = match protocol::decode(&buf[..len], &src_address) {
                    Ok(env) => env,
                    Err(e) => {
                        transport.decode_errors.fetch_add(1, Ordering::Relaxed);
                        debug!("dropping malformed datagram from {src}: {e}");
                        continue;
                    }
                };

                if env.payload.kind().is_response() {
                    transport.resolve_response(src, env);
                } else {
                    let Some(pool) = pool.upgrade() else {
                        break;
                    };
                    if let Some(reply) = pool.handle_request(&src_address, &env) {
                        transport.send_envelope(src, &reply);
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(recv_task);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bind address in the wire's `host:port` form.
    pub fn local_address_string(&self) -> String {
        self.local_addr.to_string()
    }

    /// Datagrams dropped because they did not parse.
    pub fn decode_error_count(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Fire-and-forget a single datagram.
    pub fn send_envelope(&self, dest: SocketAddr, env: &Envelope) {
        let bytes = protocol::encode(env, MAX_DATAGRAM);
        // err means shutdown mid-send; the datagram is lost like any other
        let _ = self.outbound.send((dest, bytes));
    }

    /// Send `payload` from the virtual node `caller` to `remote` and await
    /// the matching response.
    ///
    /// Enforces at most one outstanding request per correlation key: a
    /// concurrent call with the same key cancels the earlier waiter.
    pub async fn call(
        &self,
        caller: SwarmId,
        remote: &RemoteNode,
        payload: RpcPayload,
        deadline: Duration,
    ) -> Result<Envelope, RpcError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(RpcError::TransportClosed);
        }
        let peer: SocketAddr = remote
            .address
            .parse()
            .map_err(|_| RpcError::BadPeerAddress)?;
        let key = PendingKey {
            peer,
            responder: remote.id,
            caller,
            kind: payload.kind().response(),
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(key.clone(), PendingSlot { seq, tx });

        self.send_envelope(peer, &Envelope::new(caller, remote.id, payload));

        match timeout(deadline, rx).await {
            Ok(Ok(env)) => Ok(env),
            Ok(Err(_)) => {
                if self.closed.load(Ordering::Relaxed) {
                    Err(RpcError::TransportClosed)
                } else {
                    Err(RpcError::Cancelled)
                }
            }
            Err(_) => {
                // clear our own slot, not a replacement's
                let mut pending = self.pending.lock().unwrap();
                if pending.get(&key).map(|slot| slot.seq) == Some(seq) {
                    pending.remove(&key);
                }
                Err(RpcError::Timeout)
            }
        }
    }

    fn resolve_response(&self, src: SocketAddr, env: Envelope) {
        let key = PendingKey {
            peer: src,
            responder: env.from_id,
            caller: env.to_id,
            kind: env.payload.kind(),
        };
        let slot = self.pending.lock().unwrap().remove(&key);
        match slot {
            Some(slot) => {
                // waiter may have timed out between removal and here
                let _ = slot.tx.send(env);
            }
            None => trace!("dropping unexpected response from {src}"),
        }
    }

    /// Abort both tasks and fail every pending waiter with
    /// `transport_closed`. Fatal at process scope; only called on exit.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::identifier::RemoteNode;
    use crate::test_support::test_support::id_with_first_byte;

    async fn raw_peer() -> (UdpSocket, RemoteNode, SwarmId) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let responder = id_with_first_byte(0xBB);
        (socket, RemoteNode::new(responder, addr.to_string()), responder)
    }

    #[tokio::test]
    async fn call_resolves_on_matching_response() {
        let transport = Transport::bind("127.0.0.1:0").await.unwrap();
        transport.start(Weak::new());
        let caller = id_with_first_byte(0xAA);
        let (peer, remote, responder) = raw_peer().await;

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (len, src) = peer.recv_from(&mut buf).await.unwrap();
            let env = protocol::decode(&buf[..len], &src.to_string()).unwrap();
            assert_eq!(env.payload, RpcPayload::PingRequest);
            let reply = env.reply(RpcPayload::PingResponse);
            peer.send_to(&protocol::encode(&reply, MAX_DATAGRAM), src)
                .await
                .unwrap();
        });

        let resp = transport
            .call(caller, &remote, RpcPayload::PingRequest, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.from_id, responder);
        assert_eq!(resp.to_id, caller);
        assert_eq!(resp.payload, RpcPayload::PingResponse);
        echo.await.unwrap();
        transport.shutdown();
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let transport = Transport::bind("127.0.0.1:0").await.unwrap();
        transport.start(Weak::new());
        let (_peer, remote, _) = raw_peer().await;

        let err = transport
            .call(
                id_with_first_byte(0xAA),
                &remote,
                RpcPayload::PingRequest,
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Timeout);
        transport.shutdown();
    }

    #[tokio::test]
    async fn second_call_with_same_key_cancels_the_first() {
        let transport = Transport::bind("127.0.0.1:0").await.unwrap();
        transport.start(Weak::new());
        let caller = id_with_first_byte(0xAA);
        let (peer, remote, _) = raw_peer().await;

        let t1 = {
            let transport = Arc::clone(&transport);
            let remote = remote.clone();
            tokio::spawn(async move {
                transport
                    .call(caller, &remote, RpcPayload::PingRequest, Duration::from_secs(3))
                    .await
            })
        };
        // let the first request land before superseding it
        let mut buf = [0u8; 2048];
        let (len, src) = peer.recv_from(&mut buf).await.unwrap();
        let env = protocol::decode(&buf[..len], &src.to_string()).unwrap();

        let t2 = {
            let transport = Arc::clone(&transport);
            let remote = remote.clone();
            tokio::spawn(async move {
                transport
                    .call(caller, &remote, RpcPayload::PingRequest, Duration::from_secs(3))
                    .await
            })
        };
        assert_eq!(t1.await.unwrap(), Err(RpcError::Cancelled));

        // the one response satisfies only the second call
        let reply = env.reply(RpcPayload::PingResponse);
        peer.send_to(&protocol::encode(&reply, MAX_DATAGRAM), src)
            .await
            .unwrap();
        assert!(t2.await.unwrap().is_ok());
        transport.shutdown();
    }

    #[tokio::test]
    async fn malformed_datagrams_are_counted_and_dropped() {
        let transport = Transport::bind("127.0.0.1:0").await.unwrap();
        transport.start(Weak::new());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"not a datagram", transport.local_addr())
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while transport.decode_error_count() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "metric never moved");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        transport.shutdown();
    }
}
