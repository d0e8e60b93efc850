//! In-memory implementation of the store seam.
//!
//! Transactions snapshot the shared state at `begin`, mutate the copy, and
//! write it back on `commit`, so dropping a transaction is a genuine
//! rollback. Reads outside a transaction see last-committed state, like a
//! pooled connection would.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;

use cirrus_lease_manager::model::{
    ComputeNode, Flavor, Lease, LeaseKind, Network, NodeFlavor, NodeNetwork, Shape,
};
use cirrus_lease_manager::store::{Store, StoreError, StoreTx};

#[derive(Debug, Default, Clone)]
struct State {
    nodes: Vec<ComputeNode>,
    leases: BTreeMap<String, Lease>,
    flavors: BTreeMap<String, Flavor>,
    networks: BTreeMap<String, Network>,
    /// (node_name, flavor_name)
    node_flavors: BTreeSet<(String, String)>,
    /// (node_name, network_name)
    node_networks: BTreeSet<(String, String)>,
}

impl State {
    fn server_usage(&self, node: &str) -> Shape {
        let mut used = Shape::ZERO;
        for lease in self.leases.values() {
            if lease.kind != LeaseKind::Server || lease.node_name != node {
                continue;
            }
            if let Some(flavor) = lease
                .flavor_name
                .as_ref()
                .and_then(|name| self.flavors.get(name))
            {
                used = used.plus(&flavor.shape);
            }
        }
        used
    }
}

/// In-memory [`Store`] for tests.
#[derive(Default)]
pub struct MemStore {
    state: Arc<Mutex<State>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of node/flavor join rows (inspection helper).
    pub fn node_flavor_rows(&self) -> usize {
        self.state.lock().unwrap().node_flavors.len()
    }

    /// Number of node/network join rows (inspection helper).
    pub fn node_network_rows(&self) -> usize {
        self.state.lock().unwrap().node_networks.len()
    }

    pub fn has_node_network(&self, node: &str, network: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .node_networks
            .contains(&(node.to_string(), network.to_string()))
    }

    pub fn has_node_flavor(&self, node: &str, flavor: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .node_flavors
            .contains(&(node.to_string(), flavor.to_string()))
    }

    pub fn has_flavor(&self, name: &str) -> bool {
        self.state.lock().unwrap().flavors.contains_key(name)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state.lock().unwrap().networks.contains_key(name)
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().unwrap().leases.len()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let work = self.state.lock().unwrap().clone();
        Ok(Box::new(MemStoreTx {
            shared: Arc::clone(&self.state),
            work,
        }))
    }

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, StoreError> {
        let mut nodes = self.state.lock().unwrap().nodes.clone();
        nodes.sort_by_key(|n| n.seq);
        Ok(nodes)
    }

    async fn get_node(&self, name: &str) -> Result<Option<ComputeNode>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.name == name)
            .cloned())
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError> {
        Ok(self.state.lock().unwrap().leases.values().cloned().collect())
    }

    async fn find_lease(&self, name: &str) -> Result<Option<Lease>, StoreError> {
        Ok(self.state.lock().unwrap().leases.get(name).cloned())
    }

    async fn find_flavor(&self, name: &str) -> Result<Option<Flavor>, StoreError> {
        Ok(self.state.lock().unwrap().flavors.get(name).cloned())
    }

    async fn server_usage_on_node(&self, node: &str) -> Result<Shape, StoreError> {
        Ok(self.state.lock().unwrap().server_usage(node))
    }

    async fn expired_leases(&self, before: NaiveDate) -> Result<Vec<Lease>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .leases
            .values()
            .filter(|l| l.end_date < before)
            .cloned()
            .collect())
    }

    async fn update_lease_end_date(&self, name: &str, end: NaiveDate) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.leases.get_mut(name) {
            Some(lease) => {
                lease.end_date = end;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("lease {name}"))),
        }
    }

    async fn upsert_node(&self, node: &ComputeNode) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.nodes.iter().any(|n| n.name == node.name) {
            state.nodes.push(node.clone());
        }
        Ok(())
    }

    async fn seed_flavor(&self, flavor: &Flavor, nodes: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .flavors
            .entry(flavor.name.clone())
            .or_insert_with(|| flavor.clone());
        for node in nodes {
            state
                .node_flavors
                .insert((node.clone(), flavor.name.clone()));
        }
        Ok(())
    }

    async fn seed_network(&self, network: &Network, nodes: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .networks
            .entry(network.name.clone())
            .or_insert_with(|| network.clone());
        for node in nodes {
            state
                .node_networks
                .insert((node.clone(), network.name.clone()));
        }
        Ok(())
    }
}

struct MemStoreTx {
    shared: Arc<Mutex<State>>,
    work: State,
}

#[async_trait]
impl StoreTx for MemStoreTx {
    async fn insert_lease(&mut self, lease: &Lease) -> Result<(), StoreError> {
        if self.work.leases.contains_key(&lease.name) {
            return Err(StoreError::Duplicate(lease.name.clone()));
        }
        self.work.leases.insert(lease.name.clone(), lease.clone());
        Ok(())
    }

    async fn delete_lease(&mut self, name: &str) -> Result<(), StoreError> {
        self.work.leases.remove(name);
        Ok(())
    }

    async fn find_flavor(&mut self, name: &str) -> Result<Option<Flavor>, StoreError> {
        Ok(self.work.flavors.get(name).cloned())
    }

    async fn insert_flavor(&mut self, flavor: &Flavor) -> Result<(), StoreError> {
        if self.work.flavors.contains_key(&flavor.name) {
            return Err(StoreError::Duplicate(flavor.name.clone()));
        }
        self.work.flavors.insert(flavor.name.clone(), flavor.clone());
        Ok(())
    }

    async fn delete_flavor(&mut self, name: &str) -> Result<(), StoreError> {
        self.work.flavors.remove(name);
        Ok(())
    }

    async fn node_flavor_exists(&mut self, node: &str, flavor: &str) -> Result<bool, StoreError> {
        Ok(self
            .work
            .node_flavors
            .contains(&(node.to_string(), flavor.to_string())))
    }

    async fn insert_node_flavor(&mut self, node: &str, flavor: &str) -> Result<(), StoreError> {
        let key = (node.to_string(), flavor.to_string());
        if !self.work.node_flavors.insert(key) {
            return Err(StoreError::Duplicate(format!("{node}/{flavor}")));
        }
        Ok(())
    }

    async fn delete_node_flavor(&mut self, node: &str, flavor: &str) -> Result<(), StoreError> {
        self.work
            .node_flavors
            .remove(&(node.to_string(), flavor.to_string()));
        Ok(())
    }

    async fn node_flavors_for(&mut self, flavor: &str) -> Result<Vec<NodeFlavor>, StoreError> {
        Ok(self
            .work
            .node_flavors
            .iter()
            .filter(|(_, f)| f == flavor)
            .map(|(node, f)| NodeFlavor {
                node_name: node.clone(),
                flavor_name: f.clone(),
            })
            .collect())
    }

    async fn count_leases_by_flavor(&mut self, name: &str) -> Result<i64, StoreError> {
        Ok(self
            .work
            .leases
            .values()
            .filter(|l| l.flavor_name.as_deref() == Some(name))
            .count() as i64)
    }

    async fn find_network(&mut self, name: &str) -> Result<Option<Network>, StoreError> {
        Ok(self.work.networks.get(name).cloned())
    }

    async fn insert_network(&mut self, network: &Network) -> Result<(), StoreError> {
        if self.work.networks.contains_key(&network.name) {
            return Err(StoreError::Duplicate(network.name.clone()));
        }
        self.work
            .networks
            .insert(network.name.clone(), network.clone());
        Ok(())
    }

    async fn delete_network(&mut self, name: &str) -> Result<(), StoreError> {
        self.work.networks.remove(name);
        Ok(())
    }

    async fn node_network_exists(&mut self, node: &str, network: &str) -> Result<bool, StoreError> {
        Ok(self
            .work
            .node_networks
            .contains(&(node.to_string(), network.to_string())))
    }

    async fn insert_node_network(&mut self, node: &str, network: &str) -> Result<(), StoreError> {
        let key = (node.to_string(), network.to_string());
        if !self.work.node_networks.insert(key) {
            return Err(StoreError::Duplicate(format!("{node}/{network}")));
        }
        Ok(())
    }

    async fn delete_node_network(&mut self, node: &str, network: &str) -> Result<(), StoreError> {
        self.work
            .node_networks
            .remove(&(node.to_string(), network.to_string()));
        Ok(())
    }

    async fn node_networks_for(&mut self, network: &str) -> Result<Vec<NodeNetwork>, StoreError> {
        Ok(self
            .work
            .node_networks
            .iter()
            .filter(|(_, n)| n == network)
            .map(|(node, n)| NodeNetwork {
                node_name: node.clone(),
                network_name: n.clone(),
            })
            .collect())
    }

    async fn count_leases_by_network(&mut self, name: &str) -> Result<i64, StoreError> {
        Ok(self
            .work
            .leases
            .values()
            .filter(|l| l.network_name == name)
            .count() as i64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        *self.shared.lock().unwrap() = self.work;
        Ok(())
    }
}
