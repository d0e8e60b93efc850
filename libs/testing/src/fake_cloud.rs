//! Recording fake for the cloud provider seam.
//!
//! Tracks live provider-side objects so tests can assert what a workflow
//! left behind, counts calls per operation, and supports scripted one-shot
//! failures to drive compensation paths. Deletes of absent objects succeed
//! without touching the counters, matching the provider contract.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;

use cirrus_lease_manager::model::Shape;
use cirrus_lease_manager::provider::{
    CloudProvider, ContainerCreateRequest, CreatedContainer, CreatedServer, Credential,
    ProviderError, ServerCreateRequest,
};

/// Shape of a scripted failure injected with [`FakeCloud::fail_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Surfaces as [`ProviderError::Unavailable`].
    Transient,
    /// Surfaces as [`ProviderError::Failed`].
    Hard,
}

#[derive(Debug, Default)]
struct CloudState {
    /// (node, name)
    servers: BTreeSet<(String, String)>,
    /// (node, name)
    containers: BTreeSet<(String, String)>,
    /// (node, name)
    flavors: BTreeSet<(String, String)>,
    /// (node, name)
    networks: BTreeSet<(String, String)>,
    /// (node, network) -> subnet name
    subnets: BTreeMap<(String, String), String>,
    /// (node, subnet)
    router_interfaces: BTreeSet<(String, String)>,
    floating_ip_seq: u32,
    container_ip_seq: u32,
    calls: BTreeMap<&'static str, usize>,
    failures: BTreeMap<&'static str, Vec<FailureMode>>,
}

impl CloudState {
    fn count(&mut self, op: &'static str) {
        *self.calls.entry(op).or_insert(0) += 1;
    }

    fn maybe_fail(&mut self, op: &'static str) -> Result<(), ProviderError> {
        let queued = self.failures.get_mut(op).and_then(|q| {
            if q.is_empty() {
                None
            } else {
                Some(q.remove(0))
            }
        });
        match queued {
            Some(FailureMode::Transient) => {
                Err(ProviderError::Unavailable(format!("injected outage in {op}")))
            }
            Some(FailureMode::Hard) => Err(ProviderError::Failed {
                operation: op,
                message: "injected failure".into(),
            }),
            None => Ok(()),
        }
    }
}

/// In-memory [`CloudProvider`] for tests.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next call to `op` (for example
    /// `"create_server"`). Queued failures fire in FIFO order.
    pub fn fail_once(&self, op: &'static str, mode: FailureMode) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push(mode);
    }

    /// Number of calls to `op` that got past failure injection. Deletes of
    /// absent objects are not counted.
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().unwrap().calls.get(op).copied().unwrap_or(0)
    }

    pub fn live_servers(&self) -> usize {
        self.state.lock().unwrap().servers.len()
    }

    pub fn live_containers(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn has_server(&self, node: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .servers
            .contains(&(node.to_string(), name.to_string()))
    }

    pub fn has_container(&self, node: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .contains(&(node.to_string(), name.to_string()))
    }

    pub fn has_flavor(&self, node: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .flavors
            .contains(&(node.to_string(), name.to_string()))
    }

    pub fn has_network(&self, node: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .networks
            .contains(&(node.to_string(), name.to_string()))
    }

    pub fn has_router_interface(&self, node: &str, subnet: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .router_interfaces
            .contains(&(node.to_string(), subnet.to_string()))
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create_server(
        &self,
        req: &ServerCreateRequest,
    ) -> Result<CreatedServer, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("create_server")?;
        state.count("create_server");
        state
            .servers
            .insert((req.node_name.clone(), req.name.clone()));

        let (keypair_name, private_key) = match &req.credential {
            Credential::GeneratedKeypair => (
                Some(format!("{}_keypair", req.name)),
                Some(format!("fake-private-key-{}", req.name)),
            ),
            Credential::Password(_) => (None, None),
        };
        Ok(CreatedServer {
            id: format!("srv-{}", req.name),
            keypair_name,
            private_key,
        })
    }

    async fn delete_server(
        &self,
        node: &str,
        name: &str,
        _floating_ip: Option<&str>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("delete_server")?;
        if state.servers.remove(&(node.to_string(), name.to_string())) {
            state.count("delete_server");
        }
        Ok(())
    }

    async fn allocate_floating_ip(
        &self,
        _node: &str,
        _server: &str,
    ) -> Result<String, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("allocate_floating_ip")?;
        state.count("allocate_floating_ip");
        state.floating_ip_seq += 1;
        Ok(format!("203.0.113.{}", state.floating_ip_seq))
    }

    async fn create_flavor(
        &self,
        node: &str,
        name: &str,
        _shape: &Shape,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("create_flavor")?;
        state.count("create_flavor");
        state.flavors.insert((node.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete_flavor(&self, node: &str, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("delete_flavor")?;
        if state.flavors.remove(&(node.to_string(), name.to_string())) {
            state.count("delete_flavor");
        }
        Ok(())
    }

    async fn create_network(&self, node: &str, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("create_network")?;
        state.count("create_network");
        state.networks.insert((node.to_string(), name.to_string()));
        Ok(())
    }

    async fn create_subnet(
        &self,
        node: &str,
        network: &str,
        subnet: &str,
        _cidr: &str,
        _gateway: Ipv4Addr,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("create_subnet")?;
        state.count("create_subnet");
        state
            .subnets
            .insert((node.to_string(), network.to_string()), subnet.to_string());
        Ok(())
    }

    async fn attach_router_interface(
        &self,
        node: &str,
        _router: &str,
        subnet: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("attach_router_interface")?;
        state.count("attach_router_interface");
        state
            .router_interfaces
            .insert((node.to_string(), subnet.to_string()));
        Ok(())
    }

    async fn detach_router_interface(
        &self,
        node: &str,
        _router: &str,
        subnet: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("detach_router_interface")?;
        if state
            .router_interfaces
            .remove(&(node.to_string(), subnet.to_string()))
        {
            state.count("detach_router_interface");
        }
        Ok(())
    }

    async fn delete_network(&self, node: &str, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("delete_network")?;
        if state.networks.remove(&(node.to_string(), name.to_string())) {
            state.count("delete_network");
        }
        // Subnet deletion cascades with the network.
        state.subnets.remove(&(node.to_string(), name.to_string()));
        Ok(())
    }

    async fn create_container(
        &self,
        req: &ContainerCreateRequest,
    ) -> Result<CreatedContainer, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("create_container")?;
        state.count("create_container");
        state
            .containers
            .insert((req.node_name.clone(), req.name.clone()));
        state.container_ip_seq += 1;
        Ok(CreatedContainer {
            id: format!("ctr-{}", req.name),
            ip: format!("172.17.0.{}", state.container_ip_seq),
            port: Some("32768".to_string()),
        })
    }

    async fn delete_container(&self, node: &str, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.maybe_fail("delete_container")?;
        if state
            .containers
            .remove(&(node.to_string(), name.to_string()))
        {
            state.count("delete_container");
        }
        Ok(())
    }
}
