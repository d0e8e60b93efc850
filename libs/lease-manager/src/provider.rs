//! Cloud provider seam.
//!
//! The orchestrator consumes the provider exclusively through this trait so
//! the workflow can be exercised against a recording fake in tests and a
//! real client in deployment. The contract mirrors what the saga needs:
//!
//! - `create_server`/`create_container` block until the instance is active
//!   (or the client times out and reports `Unavailable`).
//! - Every `delete_*` treats "already absent" as success. Teardown is
//!   retried at-least-once by the reaper, so deletes must be idempotent.
//! - "Not found" is never an error; lookups the workflow does not need are
//!   not part of the contract.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Shape;

/// Provider call failures.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transient failure; callers may retry the whole operation.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider rejected or failed the call.
    #[error("provider {operation} failed: {message}")]
    Failed {
        operation: &'static str,
        message: String,
    },
}

/// How the guest is made reachable at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Embed a password-change directive in the boot configuration.
    Password(String),
    /// Generate a per-lease keypair named `{lease}_keypair`; the private
    /// key is returned exactly once and never persisted.
    GeneratedKeypair,
}

/// Request to create a server instance bound to a node.
#[derive(Debug, Clone)]
pub struct ServerCreateRequest {
    pub name: String,
    pub node_name: String,
    pub image_name: String,
    pub flavor_name: String,
    pub network_name: String,
    pub credential: Credential,
}

/// A created server instance.
#[derive(Debug, Clone)]
pub struct CreatedServer {
    pub id: String,
    /// Present only when the request asked for a generated keypair.
    pub keypair_name: Option<String>,
    /// Present only when the request asked for a generated keypair.
    pub private_key: Option<String>,
}

/// Request to create a container bound to a node.
#[derive(Debug, Clone)]
pub struct ContainerCreateRequest {
    pub name: String,
    pub node_name: String,
    pub image_name: String,
    pub network_name: String,
    pub env: BTreeMap<String, String>,
    pub command: Option<String>,
}

/// A created container and its network-assigned address.
#[derive(Debug, Clone)]
pub struct CreatedContainer {
    pub id: String,
    pub ip: String,
    pub port: Option<String>,
}

/// The cloud provider contract consumed by the orchestrator and reaper.
///
/// Flavor and network objects are per-node: two nodes may each hold their
/// own copy of a same-named custom flavor or network, so every call names
/// the node it targets.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_server(&self, req: &ServerCreateRequest)
        -> Result<CreatedServer, ProviderError>;

    /// Delete a server, its per-lease keypair, and (when given) its
    /// floating IP. Succeeds when the server is already gone.
    async fn delete_server(
        &self,
        node: &str,
        name: &str,
        floating_ip: Option<&str>,
    ) -> Result<(), ProviderError>;

    /// Allocate a floating IP bound to the server.
    async fn allocate_floating_ip(&self, node: &str, server: &str)
        -> Result<String, ProviderError>;

    async fn create_flavor(&self, node: &str, name: &str, shape: &Shape)
        -> Result<(), ProviderError>;

    async fn delete_flavor(&self, node: &str, name: &str) -> Result<(), ProviderError>;

    async fn create_network(&self, node: &str, name: &str) -> Result<(), ProviderError>;

    async fn create_subnet(
        &self,
        node: &str,
        network: &str,
        subnet: &str,
        cidr: &str,
        gateway: Ipv4Addr,
    ) -> Result<(), ProviderError>;

    async fn attach_router_interface(
        &self,
        node: &str,
        router: &str,
        subnet: &str,
    ) -> Result<(), ProviderError>;

    async fn detach_router_interface(
        &self,
        node: &str,
        router: &str,
        subnet: &str,
    ) -> Result<(), ProviderError>;

    /// Delete a network; subnet deletion cascades on the provider side.
    async fn delete_network(&self, node: &str, name: &str) -> Result<(), ProviderError>;

    async fn create_container(
        &self,
        req: &ContainerCreateRequest,
    ) -> Result<CreatedContainer, ProviderError>;

    async fn delete_container(&self, node: &str, name: &str) -> Result<(), ProviderError>;
}
