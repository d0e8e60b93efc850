//! Persistent store seam.
//!
//! The relational ledger is consumed through the [`Store`]/[`StoreTx`]
//! traits so the orchestrator can run against Postgres in deployment and an
//! in-memory store in tests. Transaction boundaries matter here:
//!
//! - `ensure_*` join-row writes ride the same transaction as the lease
//!   insert, so registrar bookkeeping and lease bookkeeping commit or abort
//!   together.
//! - `release_*` reference counting is computed and acted on inside one
//!   transaction per call, so two concurrent releases cannot both observe
//!   "zero referents".

mod postgres;

pub use postgres::{DbConfig, PgStore};

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::info;

use crate::config::Catalog;
use crate::model::{ComputeNode, Flavor, Lease, Network, NodeFlavor, NodeNetwork, Shape};

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A unique constraint rejected the write.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// The targeted row does not exist.
    #[error("row not found: {0}")]
    NotFound(String),
}

/// Read side of the ledger plus transaction entry point.
#[async_trait]
pub trait Store: Send + Sync {
    /// Begin a transaction. Dropping the handle without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// All compute nodes in catalog order.
    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, StoreError>;

    async fn get_node(&self, name: &str) -> Result<Option<ComputeNode>, StoreError>;

    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError>;

    async fn find_lease(&self, name: &str) -> Result<Option<Lease>, StoreError>;

    async fn find_flavor(&self, name: &str) -> Result<Option<Flavor>, StoreError>;

    /// Sum of flavor shapes over all server leases assigned to the node.
    /// Container leases are not capacity-tracked and do not count.
    async fn server_usage_on_node(&self, node: &str) -> Result<Shape, StoreError>;

    /// Leases whose end date is strictly before `before`.
    async fn expired_leases(&self, before: NaiveDate) -> Result<Vec<Lease>, StoreError>;

    async fn update_lease_end_date(&self, name: &str, end: NaiveDate) -> Result<(), StoreError>;

    /// Bootstrap write: insert the node if absent. Capacities of an
    /// existing node are left untouched.
    async fn upsert_node(&self, node: &ComputeNode) -> Result<(), StoreError>;

    /// Bootstrap write: insert a default flavor and its join row on every
    /// listed node, skipping rows that already exist.
    async fn seed_flavor(&self, flavor: &Flavor, nodes: &[String]) -> Result<(), StoreError>;

    /// Bootstrap write: insert a default network and its join row on every
    /// listed node, skipping rows that already exist.
    async fn seed_network(&self, network: &Network, nodes: &[String]) -> Result<(), StoreError>;
}

/// Write side of the ledger, scoped to one transaction.
#[async_trait]
pub trait StoreTx: Send {
    /// Rejects a second lease with the same name as [`StoreError::Duplicate`]
    /// via the unique constraint; this is the authoritative uniqueness check.
    async fn insert_lease(&mut self, lease: &Lease) -> Result<(), StoreError>;

    async fn delete_lease(&mut self, name: &str) -> Result<(), StoreError>;

    async fn find_flavor(&mut self, name: &str) -> Result<Option<Flavor>, StoreError>;

    async fn insert_flavor(&mut self, flavor: &Flavor) -> Result<(), StoreError>;

    async fn delete_flavor(&mut self, name: &str) -> Result<(), StoreError>;

    async fn node_flavor_exists(&mut self, node: &str, flavor: &str) -> Result<bool, StoreError>;

    async fn insert_node_flavor(&mut self, node: &str, flavor: &str) -> Result<(), StoreError>;

    async fn delete_node_flavor(&mut self, node: &str, flavor: &str) -> Result<(), StoreError>;

    /// Join rows for the flavor across all nodes.
    async fn node_flavors_for(&mut self, flavor: &str) -> Result<Vec<NodeFlavor>, StoreError>;

    /// Global count of leases referencing the flavor by name.
    async fn count_leases_by_flavor(&mut self, name: &str) -> Result<i64, StoreError>;

    async fn find_network(&mut self, name: &str) -> Result<Option<Network>, StoreError>;

    async fn insert_network(&mut self, network: &Network) -> Result<(), StoreError>;

    async fn delete_network(&mut self, name: &str) -> Result<(), StoreError>;

    async fn node_network_exists(&mut self, node: &str, network: &str) -> Result<bool, StoreError>;

    async fn insert_node_network(&mut self, node: &str, network: &str) -> Result<(), StoreError>;

    async fn delete_node_network(&mut self, node: &str, network: &str) -> Result<(), StoreError>;

    /// Join rows for the network across all nodes.
    async fn node_networks_for(&mut self, network: &str) -> Result<Vec<NodeNetwork>, StoreError>;

    /// Global count of leases (both kinds) referencing the network by name.
    async fn count_leases_by_network(&mut self, name: &str) -> Result<i64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Seed the ledger from the catalog: compute nodes in catalog order, then
/// default flavors and networks joined to every node. Idempotent, safe to
/// run on every process start.
pub async fn bootstrap(store: &dyn Store, catalog: &Catalog) -> Result<(), StoreError> {
    let node_names: Vec<String> = catalog.nodes.iter().map(|n| n.name.clone()).collect();

    for (seq, node) in catalog.nodes.iter().enumerate() {
        store
            .upsert_node(&ComputeNode {
                name: node.name.clone(),
                seq: seq as i64,
                capacity: node.capacity(),
            })
            .await?;
    }

    for flavor in &catalog.flavors {
        store
            .seed_flavor(
                &Flavor {
                    name: flavor.name.clone(),
                    shape: flavor.shape(),
                    is_default: true,
                },
                &node_names,
            )
            .await?;
    }

    for network in &catalog.networks {
        store
            .seed_network(
                &Network {
                    name: network.name.clone(),
                    cidr: network.cidr.clone(),
                    is_default: true,
                },
                &node_names,
            )
            .await?;
    }

    info!(
        nodes = catalog.nodes.len(),
        flavors = catalog.flavors.len(),
        networks = catalog.networks.len(),
        "Ledger bootstrap complete"
    );
    Ok(())
}
