//! Node selection policies.
//!
//! Servers are placed first-fit over remaining capacity; containers are
//! placed round-robin without capacity accounting. The asymmetry is
//! deliberate: container leases carry no flavor and are not
//! capacity-tracked in the ledger.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::model::Shape;
use crate::store::{Store, StoreError};

/// Remaining capacity on one node, for the capacity report.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRemaining {
    pub name: String,
    pub remaining: Shape,
}

/// Chooses a node for a new lease.
///
/// Selection is read-only over the ledger. The capacity read here and the
/// lease commit later are not one serializable transaction; see
/// [`crate::config::ConsistencyMode`] for the knob that closes the window.
pub struct NodeSelector {
    store: Arc<dyn Store>,
    round_robin: AtomicUsize,
}

impl NodeSelector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            round_robin: AtomicUsize::new(0),
        }
    }

    /// First node, in catalog order, whose remaining capacity fits the
    /// requested shape. `None` means no node qualifies; that is an
    /// expected rejection, not an error.
    pub async fn select_node(&self, request: &Shape) -> Result<Option<String>, StoreError> {
        for node in self.store.list_nodes().await? {
            let used = self.store.server_usage_on_node(&node.name).await?;
            let remaining = node.capacity.minus(&used);
            debug!(
                node = %node.name,
                vcpus = remaining.vcpus,
                ram_mb = remaining.ram_mb,
                disk_gb = remaining.disk_gb,
                "Computed remaining capacity"
            );
            if remaining.fits(request) {
                return Ok(Some(node.name));
            }
        }
        Ok(None)
    }

    /// Next node in catalog order for a container lease.
    pub async fn next_container_node(&self) -> Result<Option<String>, StoreError> {
        let nodes = self.store.list_nodes().await?;
        if nodes.is_empty() {
            return Ok(None);
        }
        let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Ok(Some(nodes[idx].name.clone()))
    }

    /// Per-node remaining capacity view.
    pub async fn remaining_resources(&self) -> Result<Vec<NodeRemaining>, StoreError> {
        let mut report = Vec::new();
        for node in self.store.list_nodes().await? {
            let used = self.store.server_usage_on_node(&node.name).await?;
            report.push(NodeRemaining {
                remaining: node.capacity.minus(&used),
                name: node.name,
            });
        }
        Ok(report)
    }
}
