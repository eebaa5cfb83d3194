//! External-facing facade: the only component that mutates the pool's
//! id → node map. The shell and scenario code drive everything through
//! these four operations.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tracing::info;

use crate::core::identifier::SwarmId;
use crate::node::{NodeStatus, VirtualNode};
use crate::pool::NodePool;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    #[error("id {0} is already hosted in this pool")]
    IdCollision(SwarmId),
    #[error("the zero id is reserved for pool addressing")]
    ReservedId,
    #[error("no content for {0} within the deadline")]
    FetchTimeout(SwarmId),
}

pub struct Controller {
    pool: Arc<NodePool>,
}

impl Controller {
    pub fn new(pool: Arc<NodePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// Host a value: id = sha1(value), the node carries the content from
    /// birth and its swarm grows as joiners find it.
    pub fn host(&self, value: Vec<u8>) -> Result<Arc<VirtualNode>, ControllerError> {
        let id = SwarmId::from_value(&value);
        if id.is_zero() {
            return Err(ControllerError::ReservedId);
        }
        let node = Arc::new(VirtualNode::host(value));
        if !self.pool.insert(Arc::clone(&node)) {
            return Err(ControllerError::IdCollision(id));
        }
        info!("hosting {} ({} bytes)", id, node.value().map_or(0, |v| v.len()));
        Ok(node)
    }

    /// Join an existing swarm by id; stabilization pulls the value.
    pub fn join(&self, id: SwarmId) -> Result<Arc<VirtualNode>, ControllerError> {
        if id.is_zero() {
            return Err(ControllerError::ReservedId);
        }
        let node = Arc::new(VirtualNode::join(id));
        if !self.pool.insert(Arc::clone(&node)) {
            return Err(ControllerError::IdCollision(id));
        }
        info!("joined swarm {}", id);
        Ok(node)
    }

    /// Every hosted id with its content flag, sorted by id.
    pub fn list(&self) -> Vec<(SwarmId, bool)> {
        let mut listing: Vec<_> = self
            .pool
            .nodes()
            .iter()
            .map(|node| (node.id(), node.has_value()))
            .collect();
        listing.sort_by_key(|(id, _)| *id);
        listing
    }

    /// Full routing snapshots for the shell's listing, sorted by id.
    pub fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses: Vec<_> = self.pool.nodes().iter().map(|node| node.status()).collect();
        statuses.sort_by_key(|status| status.id);
        statuses
    }

    /// Retrieve the value stored under `id`, joining the swarm transiently
    /// if no local node hosts it. The transient node is removed on every
    /// exit path; an existing local node is consulted (or awaited) instead,
    /// since a second node with its id cannot exist.
    pub async fn fetch(&self, id: SwarmId) -> Result<Vec<u8>, ControllerError> {
        if id.is_zero() {
            return Err(ControllerError::ReservedId);
        }
        let (node, transient) = match self.pool.get(&id) {
            Some(node) => (node, false),
            None => {
                let node = Arc::new(VirtualNode::join(id));
                if !self.pool.insert(Arc::clone(&node)) {
                    return Err(ControllerError::IdCollision(id));
                }
                (node, true)
            }
        };

        let result = timeout(self.pool.timings().fetch_timeout, async {
            loop {
                if let Some(value) = node.value() {
                    return value;
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if transient {
            self.pool.remove(&id);
        }
        result.map_err(|_| ControllerError::FetchTimeout(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::timings::Timings;
    use crate::transport::Transport;

    async fn controller_with_timings(timings: Timings) -> Controller {
        let transport = Transport::bind("127.0.0.1:0").await.unwrap();
        Controller::new(NodePool::new(transport, Vec::new(), timings))
    }

    #[tokio::test]
    async fn hosting_twice_collides() {
        let controller = controller_with_timings(Timings::fast()).await;
        let node = controller.host(b"some content".to_vec()).unwrap();
        assert_eq!(node.id(), SwarmId::from_value(b"some content"));
        assert_eq!(
            controller.host(b"some content".to_vec()).unwrap_err(),
            ControllerError::IdCollision(node.id())
        );
        controller.pool().shutdown();
    }

    #[tokio::test]
    async fn list_reports_content_flags() {
        let controller = controller_with_timings(Timings::fast()).await;
        let hosted = controller.host(b"have".to_vec()).unwrap();
        let joined = controller.join(SwarmId::from_value(b"want")).unwrap();

        let listing = controller.list();
        assert_eq!(listing.len(), 2);
        assert!(listing.contains(&(hosted.id(), true)));
        assert!(listing.contains(&(joined.id(), false)));
        controller.pool().shutdown();
    }

    #[tokio::test]
    async fn fetch_of_locally_hosted_value_returns_immediately() {
        let controller = controller_with_timings(Timings::fast()).await;
        controller.host(b"hello".to_vec()).unwrap();
        let value = controller.fetch(SwarmId::from_value(b"hello")).await.unwrap();
        assert_eq!(value, b"hello".to_vec());
        controller.pool().shutdown();
    }

    #[tokio::test]
    async fn fetch_times_out_and_removes_the_transient_node() {
        let timings = Timings::new(
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_millis(300),
        );
        let controller = controller_with_timings(timings).await;
        let id = SwarmId::from_value(b"nowhere to be found");
        let err = controller.fetch(id).await.unwrap_err();
        assert_eq!(err, ControllerError::FetchTimeout(id));
        assert!(controller.pool().get(&id).is_none());
        controller.pool().shutdown();
    }

    #[tokio::test]
    async fn zero_id_is_reserved() {
        let controller = controller_with_timings(Timings::fast()).await;
        assert_eq!(
            controller.join(SwarmId::zero()).unwrap_err(),
            ControllerError::ReservedId
        );
        controller.pool().shutdown();
    }
}
