//! End-to-end provisioning workflows over the in-memory store and the
//! recording fake provider.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use cirrus_lease_manager::config::ConsistencyMode;
use cirrus_lease_manager::error::LeaseError;
use cirrus_lease_manager::model::{ComputeNode, Flavor, Lease, LeaseKind, Network, Shape};
use cirrus_lease_manager::orchestrator::{FlavorRequest, LeaseManager, NetworkRequest, RentSpec};
use cirrus_lease_manager::provider::CloudProvider;
use cirrus_lease_manager::store::{bootstrap, Store, StoreError, StoreTx};
use cirrus_testing::{container_spec, harness, server_spec, test_catalog, FailureMode, FakeCloud, MemStore};

fn custom_flavor(name: &str) -> FlavorRequest {
    FlavorRequest {
        name: name.to_string(),
        shape: Some(Shape {
            vcpus: 2,
            ram_mb: 2048,
            disk_gb: 20,
        }),
    }
}

#[tokio::test]
async fn first_fit_fills_nodes_in_catalog_order() {
    let h = harness().await;

    // 2-vCPU requests against two 4-vCPU nodes: two fit on each.
    let mut placements = Vec::new();
    for name in ["s1", "s2", "s3", "s4"] {
        let mut spec = server_spec(name);
        spec.flavor = custom_flavor("c1.custom");
        let receipt = h.manager.rent(RentSpec::Server(spec)).await.unwrap();
        placements.push(receipt.lease.node_name);
    }
    assert_eq!(placements, ["node-a", "node-a", "node-b", "node-b"]);

    let mut spec = server_spec("s5");
    spec.flavor = custom_flavor("c1.custom");
    let err = h.manager.rent(RentSpec::Server(spec)).await.unwrap_err();
    assert!(matches!(err, LeaseError::InsufficientCapacity));
    assert_eq!(h.store.lease_count(), 4);
}

#[tokio::test]
async fn remaining_resources_reflect_server_usage() {
    let h = harness().await;

    h.manager
        .rent(RentSpec::Server(server_spec("s1")))
        .await
        .unwrap();

    let remaining = h.manager.remaining_resources().await.unwrap();
    assert_eq!(remaining.len(), 2);
    // m1.small is 1/2048/20 against a 4/8192/100 node.
    assert_eq!(remaining[0].name, "node-a");
    assert_eq!(
        remaining[0].remaining,
        Shape {
            vcpus: 3,
            ram_mb: 6144,
            disk_gb: 80,
        }
    );
    assert_eq!(remaining[1].remaining.vcpus, 4);
}

#[tokio::test]
async fn containers_rotate_nodes_and_skip_capacity_accounting() {
    let h = harness().await;

    let mut placements = Vec::new();
    for name in ["c1", "c2", "c3"] {
        let receipt = h
            .manager
            .rent(RentSpec::Container(container_spec(name)))
            .await
            .unwrap();
        assert_eq!(receipt.lease.kind, LeaseKind::Container);
        assert!(receipt.lease.container_ip.is_some());
        placements.push(receipt.lease.node_name);
    }
    assert_eq!(placements, ["node-a", "node-b", "node-a"]);

    // Container leases never count against node capacity.
    let remaining = h.manager.remaining_resources().await.unwrap();
    assert_eq!(remaining[0].remaining.vcpus, 4);
}

#[tokio::test]
async fn duplicate_name_is_rejected_across_kinds() {
    let h = harness().await;

    h.manager
        .rent(RentSpec::Server(server_spec("web01")))
        .await
        .unwrap();

    let err = h
        .manager
        .rent(RentSpec::Server(server_spec("web01")))
        .await
        .unwrap_err();
    assert!(matches!(err, LeaseError::DuplicateName(_)));

    // The name space is shared between servers and containers.
    let err = h
        .manager
        .rent(RentSpec::Container(container_spec("web01")))
        .await
        .unwrap_err();
    assert!(matches!(err, LeaseError::DuplicateName(_)));
}

#[tokio::test]
async fn container_names_must_be_alphanumeric() {
    let h = harness().await;

    let err = h
        .manager
        .rent(RentSpec::Container(container_spec("app-01")))
        .await
        .unwrap_err();
    assert!(matches!(err, LeaseError::InvalidName(_)));
    assert_eq!(h.store.lease_count(), 0);
    assert_eq!(h.cloud.calls("create_container"), 0);
}

#[tokio::test]
async fn keypair_returned_only_without_password() {
    let h = harness().await;

    let receipt = h
        .manager
        .rent(RentSpec::Server(server_spec("keyed")))
        .await
        .unwrap();
    let keypair = receipt.keypair.expect("keypair credential requested");
    assert_eq!(keypair.name, "keyed_keypair");
    assert!(!keypair.private_key.is_empty());
    assert!(receipt.lease.floating_ip.is_some());

    let mut spec = server_spec("passworded");
    spec.password = Some("s3cret".to_string());
    let receipt = h.manager.rent(RentSpec::Server(spec)).await.unwrap();
    assert!(receipt.keypair.is_none());
}

#[tokio::test]
async fn container_password_is_stored_hashed() {
    let h = harness().await;

    let receipt = h
        .manager
        .rent(RentSpec::Container(container_spec("app01")))
        .await
        .unwrap();
    let hash = receipt.lease.password_hash.expect("containers store a hash");
    assert_ne!(hash, "hunter2");
    assert_eq!(hash.len(), 64);
}

#[tokio::test]
async fn failed_rent_compensates_every_completed_step() {
    let h = harness().await;

    // Everything up to floating IP allocation succeeds, including an
    // isolated network materialized for this lease.
    let mut spec = server_spec("doomed");
    spec.network = Some(NetworkRequest {
        name: "isolated".to_string(),
        cidr: Some("10.9.0.0/24".to_string()),
    });
    h.cloud.fail_once("allocate_floating_ip", FailureMode::Hard);

    let err = h.manager.rent(RentSpec::Server(spec)).await.unwrap_err();
    assert!(matches!(err, LeaseError::ProvisioningFailed { .. }));

    // No ledger rows survive the rollback.
    assert_eq!(h.store.lease_count(), 0);
    assert!(!h.store.has_network("isolated"));
    assert!(!h.store.has_node_network("node-a", "isolated"));

    // Every provider create was matched by a delete.
    assert_eq!(h.cloud.live_servers(), 0);
    assert!(!h.cloud.has_network("node-a", "isolated"));
    assert_eq!(h.cloud.calls("create_server"), h.cloud.calls("delete_server"));
    assert_eq!(
        h.cloud.calls("create_network"),
        h.cloud.calls("delete_network")
    );
    assert_eq!(
        h.cloud.calls("attach_router_interface"),
        h.cloud.calls("detach_router_interface")
    );
}

#[tokio::test]
async fn transient_provider_outage_surfaces_as_unavailable() {
    let h = harness().await;

    h.cloud.fail_once("create_server", FailureMode::Transient);
    let err = h
        .manager
        .rent(RentSpec::Server(server_spec("s1")))
        .await
        .unwrap_err();
    assert!(matches!(err, LeaseError::ProviderUnavailable(_)));
    assert_eq!(h.store.lease_count(), 0);

    // The whole call can simply be retried.
    h.manager
        .rent(RentSpec::Server(server_spec("s1")))
        .await
        .unwrap();
}

#[tokio::test]
async fn new_flavor_requires_a_shape() {
    let h = harness().await;

    let mut spec = server_spec("s1");
    spec.flavor = FlavorRequest {
        name: "no-such-flavor".to_string(),
        shape: None,
    };
    let err = h.manager.rent(RentSpec::Server(spec)).await.unwrap_err();
    assert!(matches!(err, LeaseError::InvalidRequest(_)));
}

/// Store whose lease lookups lag behind commits, standing in for a second
/// process whose pre-check read an older snapshot.
struct LaggingReadStore {
    inner: Arc<MemStore>,
}

#[async_trait]
impl Store for LaggingReadStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        self.inner.begin().await
    }

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, StoreError> {
        self.inner.list_nodes().await
    }

    async fn get_node(&self, name: &str) -> Result<Option<ComputeNode>, StoreError> {
        self.inner.get_node(name).await
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError> {
        self.inner.list_leases().await
    }

    async fn find_lease(&self, _name: &str) -> Result<Option<Lease>, StoreError> {
        // The stale snapshot never shows the committed lease.
        Ok(None)
    }

    async fn find_flavor(&self, name: &str) -> Result<Option<Flavor>, StoreError> {
        self.inner.find_flavor(name).await
    }

    async fn server_usage_on_node(&self, node: &str) -> Result<Shape, StoreError> {
        self.inner.server_usage_on_node(node).await
    }

    async fn expired_leases(&self, before: NaiveDate) -> Result<Vec<Lease>, StoreError> {
        self.inner.expired_leases(before).await
    }

    async fn update_lease_end_date(&self, name: &str, end: NaiveDate) -> Result<(), StoreError> {
        self.inner.update_lease_end_date(name, end).await
    }

    async fn upsert_node(&self, node: &ComputeNode) -> Result<(), StoreError> {
        self.inner.upsert_node(node).await
    }

    async fn seed_flavor(&self, flavor: &Flavor, nodes: &[String]) -> Result<(), StoreError> {
        self.inner.seed_flavor(flavor, nodes).await
    }

    async fn seed_network(&self, network: &Network, nodes: &[String]) -> Result<(), StoreError> {
        self.inner.seed_network(network, nodes).await
    }
}

#[tokio::test]
async fn racing_duplicate_is_reported_as_duplicate_name_and_compensated() {
    let catalog = test_catalog();
    let mem = Arc::new(MemStore::new());
    bootstrap(mem.as_ref(), &catalog).await.unwrap();
    let store = Arc::new(LaggingReadStore {
        inner: Arc::clone(&mem),
    });
    let cloud = Arc::new(FakeCloud::new());
    let manager = LeaseManager::new(
        store as Arc<dyn Store>,
        Arc::clone(&cloud) as Arc<dyn CloudProvider>,
        &catalog,
        ConsistencyMode::Optimistic,
    );

    manager
        .rent(RentSpec::Server(server_spec("web01")))
        .await
        .unwrap();

    // The pre-check misses the first lease; the unique constraint on the
    // insert catches it, and the caller still sees a plain duplicate
    // rejection rather than a wrapped provisioning failure.
    let err = manager
        .rent(RentSpec::Server(server_spec("web01")))
        .await
        .unwrap_err();
    assert!(matches!(err, LeaseError::DuplicateName(_)));

    // The losing attempt's instance was compensated away.
    assert_eq!(mem.lease_count(), 1);
    assert_eq!(cloud.live_servers(), 1);
    assert_eq!(cloud.calls("create_server"), 2);
    assert_eq!(cloud.calls("delete_server"), 1);
}

#[tokio::test]
async fn new_network_requires_a_cidr() {
    let h = harness().await;

    let mut spec = server_spec("s1");
    spec.network = Some(NetworkRequest {
        name: "no-such-network".to_string(),
        cidr: None,
    });
    let err = h.manager.rent(RentSpec::Server(spec)).await.unwrap_err();
    assert!(matches!(err, LeaseError::InvalidRequest(_)));
    assert_eq!(h.cloud.calls("create_network"), 0);
}
