//! Reference-counted lifecycle of shared flavors and networks.

use std::sync::Arc;

use cirrus_lease_manager::model::Shape;
use cirrus_lease_manager::orchestrator::{
    FlavorRequest, NetworkRequest, OwnershipProof, RentSpec,
};
use cirrus_lease_manager::provider::CloudProvider;
use cirrus_lease_manager::registrar::ResourceRegistrar;
use cirrus_testing::{container_spec, harness, server_spec, FailureMode};

fn on_net1(mut spec: cirrus_lease_manager::orchestrator::ServerRentSpec) -> RentSpec {
    spec.network = Some(NetworkRequest {
        name: "net1".to_string(),
        cidr: Some("10.1.0.0/24".to_string()),
    });
    RentSpec::Server(spec)
}

#[tokio::test]
async fn network_survives_until_last_referent_returns() {
    let h = harness().await;

    // Two servers share net1; both land on node-a, so the provider object
    // is materialized exactly once.
    h.manager.rent(on_net1(server_spec("s1"))).await.unwrap();
    h.manager.rent(on_net1(server_spec("s2"))).await.unwrap();
    assert_eq!(h.cloud.calls("create_network"), 1);
    assert!(h.cloud.has_router_interface("node-a", "net1_subnet"));

    h.manager
        .return_lease("s1", OwnershipProof::Verified)
        .await
        .unwrap();
    assert!(h.store.has_network("net1"));
    assert!(h.cloud.has_network("node-a", "net1"));
    assert_eq!(h.cloud.calls("delete_network"), 0);

    h.manager
        .return_lease("s2", OwnershipProof::Verified)
        .await
        .unwrap();
    assert!(!h.store.has_network("net1"));
    assert!(!h.store.has_node_network("node-a", "net1"));
    assert!(!h.cloud.has_network("node-a", "net1"));
    assert!(!h.cloud.has_router_interface("node-a", "net1_subnet"));
    assert_eq!(h.cloud.calls("delete_network"), 1);
    assert_eq!(h.cloud.calls("detach_router_interface"), 1);
}

#[tokio::test]
async fn release_tears_down_every_node_holding_the_network() {
    let h = harness().await;

    // Round-robin spreads the two containers across both nodes, so net1
    // is materialized on each.
    let mut c1 = container_spec("app1");
    c1.network = Some(NetworkRequest {
        name: "net1".to_string(),
        cidr: Some("10.1.0.0/24".to_string()),
    });
    let mut c2 = container_spec("app2");
    c2.network = Some(NetworkRequest {
        name: "net1".to_string(),
        cidr: None,
    });
    let r1 = h.manager.rent(RentSpec::Container(c1)).await.unwrap();
    let r2 = h.manager.rent(RentSpec::Container(c2)).await.unwrap();
    assert_ne!(r1.lease.node_name, r2.lease.node_name);
    assert_eq!(h.cloud.calls("create_network"), 2);

    let password = OwnershipProof::ContainerPassword("hunter2".to_string());
    h.manager.return_lease("app1", password.clone()).await.unwrap();
    assert!(h.store.has_network("net1"));

    h.manager.return_lease("app2", password).await.unwrap();
    assert!(!h.store.has_network("net1"));
    assert!(!h.cloud.has_network("node-a", "net1"));
    assert!(!h.cloud.has_network("node-b", "net1"));
    assert_eq!(h.cloud.calls("delete_network"), 2);
}

#[tokio::test]
async fn default_resources_are_never_torn_down() {
    let h = harness().await;

    // Default flavor, default network.
    h.manager
        .rent(RentSpec::Server(server_spec("s1")))
        .await
        .unwrap();
    h.manager
        .return_lease("s1", OwnershipProof::Verified)
        .await
        .unwrap();

    assert!(h.store.has_network("internal"));
    assert!(h.store.has_flavor("m1.small"));
    assert!(h.store.has_node_network("node-a", "internal"));
    assert_eq!(h.cloud.calls("delete_network"), 0);
    assert_eq!(h.cloud.calls("delete_flavor"), 0);
}

#[tokio::test]
async fn custom_flavor_is_reference_counted() {
    let h = harness().await;

    let mut s1 = server_spec("s1");
    s1.flavor = FlavorRequest {
        name: "c1.custom".to_string(),
        shape: Some(Shape {
            vcpus: 1,
            ram_mb: 1024,
            disk_gb: 10,
        }),
    };
    // The second lease reuses the flavor by name, no shape needed.
    let mut s2 = server_spec("s2");
    s2.flavor = FlavorRequest {
        name: "c1.custom".to_string(),
        shape: None,
    };

    h.manager.rent(RentSpec::Server(s1)).await.unwrap();
    h.manager.rent(RentSpec::Server(s2)).await.unwrap();
    // Both leases landed on node-a, one provider-side flavor.
    assert_eq!(h.cloud.calls("create_flavor"), 1);

    h.manager
        .return_lease("s1", OwnershipProof::Verified)
        .await
        .unwrap();
    assert!(h.store.has_flavor("c1.custom"));
    assert!(h.cloud.has_flavor("node-a", "c1.custom"));

    h.manager
        .return_lease("s2", OwnershipProof::Verified)
        .await
        .unwrap();
    assert!(!h.store.has_flavor("c1.custom"));
    assert!(!h.store.has_node_flavor("node-a", "c1.custom"));
    assert!(!h.cloud.has_flavor("node-a", "c1.custom"));
}

#[tokio::test]
async fn failed_teardown_keeps_the_join_row_for_retry() {
    let h = harness().await;

    let mut c1 = container_spec("app1");
    c1.network = Some(NetworkRequest {
        name: "net1".to_string(),
        cidr: Some("10.1.0.0/24".to_string()),
    });
    let mut c2 = container_spec("app2");
    c2.network = Some(NetworkRequest {
        name: "net1".to_string(),
        cidr: None,
    });
    h.manager.rent(RentSpec::Container(c1)).await.unwrap();
    h.manager.rent(RentSpec::Container(c2)).await.unwrap();

    // node-a's detach fails during the final release; node-b's succeeds.
    h.cloud
        .fail_once("detach_router_interface", FailureMode::Hard);
    let password = OwnershipProof::ContainerPassword("hunter2".to_string());
    h.manager.return_lease("app1", password.clone()).await.unwrap();
    h.manager.return_lease("app2", password).await.unwrap();

    // The network row and node-a's join row survive for a later retry.
    assert!(h.store.has_network("net1"));
    assert!(h.store.has_node_network("node-a", "net1"));
    assert!(!h.store.has_node_network("node-b", "net1"));
    assert!(h.cloud.has_network("node-a", "net1"));

    // A later release pass finishes the teardown.
    let registrar = ResourceRegistrar::new(
        Arc::clone(&h.cloud) as Arc<dyn CloudProvider>,
        "shared-router".to_string(),
    );
    registrar
        .release_network(h.store.as_ref(), "net1", "node-a")
        .await
        .unwrap();
    assert!(!h.store.has_network("net1"));
    assert!(!h.store.has_node_network("node-a", "net1"));
    assert!(!h.cloud.has_network("node-a", "net1"));
}

#[tokio::test]
async fn release_of_an_absent_resource_is_a_no_op() {
    let h = harness().await;

    let registrar = ResourceRegistrar::new(
        Arc::clone(&h.cloud) as Arc<dyn CloudProvider>,
        "shared-router".to_string(),
    );
    registrar
        .release_network(h.store.as_ref(), "never-existed", "node-a")
        .await
        .unwrap();
    registrar
        .release_flavor(h.store.as_ref(), "never-existed", "node-a")
        .await
        .unwrap();
}

#[tokio::test]
async fn mid_sequence_network_failure_leaves_no_provider_state() {
    let h = harness().await;

    h.cloud.fail_once("create_subnet", FailureMode::Hard);
    let err = h
        .manager
        .rent(on_net1(server_spec("s1")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        cirrus_lease_manager::error::LeaseError::ProvisioningFailed { .. }
    ));

    assert!(!h.store.has_network("net1"));
    assert!(!h.cloud.has_network("node-a", "net1"));
    assert_eq!(h.store.lease_count(), 0);
}
