//! Test support for the cirrus lease manager.
//!
//! Provides an in-memory store, a recording fake cloud provider, and a
//! harness that wires both into a [`LeaseManager`] seeded from a small
//! two-node catalog. Integration tests drive the real orchestration code
//! against these fakes; only the Postgres and provider-client bindings are
//! substituted.

mod fake_cloud;
mod mem_store;

pub use fake_cloud::{FailureMode, FakeCloud};
pub use mem_store::MemStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;

use cirrus_lease_manager::config::{Catalog, ConsistencyMode};
use cirrus_lease_manager::orchestrator::{
    ContainerRentSpec, FlavorRequest, LeaseManager, ServerRentSpec,
};
use cirrus_lease_manager::provider::CloudProvider;
use cirrus_lease_manager::store::{bootstrap, Store};

/// A fully wired manager over in-memory fakes.
pub struct Harness {
    pub store: Arc<MemStore>,
    pub cloud: Arc<FakeCloud>,
    pub manager: Arc<LeaseManager>,
}

/// Two equal nodes of 4 vCPUs / 8192 MB / 100 GB, one default flavor
/// `m1.small`, and the default `internal`/`external` networks.
pub fn test_catalog() -> Catalog {
    Catalog::from_toml_str(
        r#"
        router = "shared-router"
        default_server_network = "internal"
        default_container_network = "external"

        [[nodes]]
        name = "node-a"
        vcpus = 4
        ram_mb = 8192
        disk_gb = 100

        [[nodes]]
        name = "node-b"
        vcpus = 4
        ram_mb = 8192
        disk_gb = 100

        [[flavors]]
        name = "m1.small"
        vcpus = 1
        ram_mb = 2048
        disk_gb = 20

        [[networks]]
        name = "internal"
        cidr = "10.0.0.0/24"

        [[networks]]
        name = "external"
        cidr = "192.168.0.0/24"
        "#,
    )
    .expect("test catalog is valid")
}

/// Build a harness over `catalog` with the given consistency mode and run
/// the ledger bootstrap.
pub async fn harness_with(catalog: &Catalog, consistency: ConsistencyMode) -> Harness {
    let store = Arc::new(MemStore::new());
    let cloud = Arc::new(FakeCloud::new());
    bootstrap(store.as_ref(), catalog)
        .await
        .expect("bootstrap against MemStore cannot fail");
    let manager = Arc::new(LeaseManager::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&cloud) as Arc<dyn CloudProvider>,
        catalog,
        consistency,
    ));
    Harness {
        store,
        cloud,
        manager,
    }
}

/// Harness over [`test_catalog`] in the default optimistic mode.
pub async fn harness() -> Harness {
    harness_with(&test_catalog(), ConsistencyMode::Optimistic).await
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid test date")
}

/// Server spec on the default flavor and network, keypair credential,
/// leased for calendar year 2026.
pub fn server_spec(name: &str) -> ServerRentSpec {
    ServerRentSpec {
        owner: "alice".to_string(),
        name: name.to_string(),
        image_name: "ubuntu-24.04".to_string(),
        flavor: FlavorRequest {
            name: "m1.small".to_string(),
            shape: None,
        },
        network: None,
        password: None,
        start_date: date(2026, 1, 1),
        end_date: date(2026, 12, 31),
    }
}

/// Container spec on the default network, leased for calendar year 2026.
pub fn container_spec(name: &str) -> ContainerRentSpec {
    ContainerRentSpec {
        owner: "alice".to_string(),
        name: name.to_string(),
        image_name: "nginx".to_string(),
        network: None,
        password: "hunter2".to_string(),
        env: BTreeMap::new(),
        command: None,
        start_date: date(2026, 1, 1),
        end_date: date(2026, 12, 31),
    }
}
