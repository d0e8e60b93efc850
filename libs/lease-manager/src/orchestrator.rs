//! Provisioning orchestrator.
//!
//! `rent` runs a linear saga: uniqueness check, node selection, shared
//! flavor/network materialization, instance creation, floating IP
//! allocation, then a single ledger transaction holding the lease insert
//! and every join-row write. Any step failure unwinds the completed steps
//! in reverse order and surfaces the triggering cause; either the lease
//! row exists with fully materialized shared resources or nothing does.
//!
//! The uniqueness pre-check and all capacity reads run on pool
//! connections before the transaction opens, so a rent in flight never
//! pins a connection through node selection. The unique constraint on the
//! lease name is the authoritative check; a concurrent duplicate slipping
//! past the pre-check is compensated and reported as `DuplicateName`.
//!
//! `return_lease` and the reaper share the inverse workflow
//! ([`LeaseManager::reclaim`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::{Catalog, ConsistencyMode};
use crate::error::LeaseError;
use crate::model::{Lease, LeaseKind, Shape};
use crate::provider::{
    CloudProvider, ContainerCreateRequest, Credential, ServerCreateRequest,
};
use crate::registrar::{EnsureOutcome, ResourceRegistrar};
use crate::saga::Saga;
use crate::selector::{NodeRemaining, NodeSelector};
use crate::store::{Store, StoreError, StoreTx};

/// Requested flavor: an existing name, or a new custom shape under that name.
#[derive(Debug, Clone)]
pub struct FlavorRequest {
    pub name: String,
    /// Required when the flavor does not exist yet.
    pub shape: Option<Shape>,
}

/// Requested network: an existing name, or a new isolated network with a CIDR.
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub name: String,
    /// Required when the network does not exist yet.
    pub cidr: Option<String>,
}

/// Rent request for a server lease.
#[derive(Debug, Clone)]
pub struct ServerRentSpec {
    pub owner: String,
    pub name: String,
    pub image_name: String,
    pub flavor: FlavorRequest,
    /// `None` selects the default internal network.
    pub network: Option<NetworkRequest>,
    /// `None` requests a generated per-lease keypair.
    pub password: Option<String>,
    pub start_date: chrono::NaiveDate,
    pub end_date: chrono::NaiveDate,
}

/// Rent request for a container lease.
#[derive(Debug, Clone)]
pub struct ContainerRentSpec {
    pub owner: String,
    pub name: String,
    pub image_name: String,
    /// `None` selects the default external network.
    pub network: Option<NetworkRequest>,
    /// Hashed and stored; authorizes later extend/return calls.
    pub password: String,
    pub env: BTreeMap<String, String>,
    pub command: Option<String>,
    pub start_date: chrono::NaiveDate,
    pub end_date: chrono::NaiveDate,
}

/// A rent request for either lease kind.
#[derive(Debug, Clone)]
pub enum RentSpec {
    Server(ServerRentSpec),
    Container(ContainerRentSpec),
}

impl RentSpec {
    pub fn name(&self) -> &str {
        match self {
            RentSpec::Server(s) => &s.name,
            RentSpec::Container(c) => &c.name,
        }
    }
}

/// Keypair material returned exactly once to the caller; never persisted.
#[derive(Debug, Clone)]
pub struct KeypairMaterial {
    pub name: String,
    pub private_key: String,
}

/// Result of a successful rent.
#[derive(Debug, Clone)]
pub struct LeaseReceipt {
    pub lease: Lease,
    pub keypair: Option<KeypairMaterial>,
}

/// Proof that the caller may return or extend a lease. The SSH-based proof
/// for servers happens in the HTTP layer, which passes `Verified`;
/// container leases can be authorized directly by password.
#[derive(Debug, Clone)]
pub enum OwnershipProof {
    Verified,
    ContainerPassword(String),
}

/// Digest used for stored container passwords.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn validate_name(name: &str, kind: LeaseKind) -> Result<(), LeaseError> {
    if name.is_empty() {
        return Err(LeaseError::InvalidName("name is empty".into()));
    }
    if kind == LeaseKind::Container && !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(LeaseError::InvalidName(format!(
            "container name must be ASCII alphanumeric: {name}"
        )));
    }
    Ok(())
}

/// The provisioning and reclamation orchestrator.
pub struct LeaseManager {
    store: Arc<dyn Store>,
    provider: Arc<dyn CloudProvider>,
    registrar: ResourceRegistrar,
    selector: NodeSelector,
    default_server_network: String,
    default_container_network: String,
    consistency: ConsistencyMode,
    /// Held from node selection through commit in serialized mode.
    placement_lock: Mutex<()>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn CloudProvider>,
        catalog: &Catalog,
        consistency: ConsistencyMode,
    ) -> Self {
        Self {
            selector: NodeSelector::new(Arc::clone(&store)),
            registrar: ResourceRegistrar::new(Arc::clone(&provider), catalog.router.clone()),
            store,
            provider,
            default_server_network: catalog.default_server_network.clone(),
            default_container_network: catalog.default_container_network.clone(),
            consistency,
            placement_lock: Mutex::new(()),
        }
    }

    async fn placement_guard(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match self.consistency {
            ConsistencyMode::Serialized => Some(self.placement_lock.lock().await),
            // The capacity read and the lease commit are deliberately not
            // serialized in this mode; see ConsistencyMode.
            ConsistencyMode::Optimistic => None,
        }
    }

    /// Provision a lease. On failure every completed step is compensated
    /// and no partial state remains visible in the ledger.
    #[instrument(skip(self, spec), fields(lease = %spec.name()))]
    pub async fn rent(&self, spec: RentSpec) -> Result<LeaseReceipt, LeaseError> {
        let _guard = self.placement_guard().await;
        let mut saga = Saga::new();

        let outcome = match &spec {
            RentSpec::Server(s) => self.rent_server(&mut saga, s).await,
            RentSpec::Container(c) => self.rent_container(&mut saga, c).await,
        };

        match outcome {
            Ok(receipt) => {
                saga.disarm();
                info!(
                    lease = %receipt.lease.name,
                    node = %receipt.lease.node_name,
                    kind = receipt.lease.kind.as_str(),
                    "Lease provisioned"
                );
                Ok(receipt)
            }
            Err(e) => {
                warn!(lease = %spec.name(), error = %e, "Provisioning step failed, compensating");
                saga.unwind().await;
                Err(e.into_provisioning_failure())
            }
        }
    }

    /// Reject duplicate names as such even when the unique constraint, not
    /// the pre-check, catches them.
    async fn insert_lease_row(
        &self,
        tx: &mut dyn StoreTx,
        lease: &Lease,
    ) -> Result<(), LeaseError> {
        tx.insert_lease(lease).await.map_err(|e| match e {
            StoreError::Duplicate(_) => LeaseError::DuplicateName(lease.name.clone()),
            other => LeaseError::Store(other),
        })
    }

    async fn rent_server(
        &self,
        saga: &mut Saga,
        spec: &ServerRentSpec,
    ) -> Result<LeaseReceipt, LeaseError> {
        validate_name(&spec.name, LeaseKind::Server)?;

        if self.store.find_lease(&spec.name).await?.is_some() {
            return Err(LeaseError::DuplicateName(spec.name.clone()));
        }

        // The requested shape: an existing flavor's shape, or the custom
        // shape the caller supplied for a new flavor.
        let shape = match self.store.find_flavor(&spec.flavor.name).await? {
            Some(flavor) => flavor.shape,
            None => spec.flavor.shape.ok_or_else(|| {
                LeaseError::InvalidRequest(format!(
                    "flavor {} does not exist and no shape was supplied",
                    spec.flavor.name
                ))
            })?,
        };

        let node = self
            .selector
            .select_node(&shape)
            .await?
            .ok_or(LeaseError::InsufficientCapacity)?;
        info!(lease = %spec.name, node = %node, "Selected node");

        // The transaction opens only now, after every pool read, so
        // selection never holds a pooled connection hostage.
        let mut tx = self.store.begin().await?;

        if self
            .registrar
            .ensure_flavor(&mut *tx, &node, &spec.flavor.name, &shape)
            .await?
            == EnsureOutcome::Created
        {
            let registrar = self.registrar.clone();
            let (n, f) = (node.clone(), spec.flavor.name.clone());
            saga.push(
                "flavor",
                Box::pin(async move {
                    registrar.abandon_flavor(&n, &f).await;
                    Ok(())
                }),
            );
        }

        let (network_name, cidr) = match &spec.network {
            Some(req) => (req.name.clone(), req.cidr.clone()),
            None => (self.default_server_network.clone(), None),
        };
        if self
            .registrar
            .ensure_network(&mut *tx, &node, &network_name, cidr.as_deref())
            .await?
            == EnsureOutcome::Created
        {
            let registrar = self.registrar.clone();
            let (n, net) = (node.clone(), network_name.clone());
            saga.push(
                "network",
                Box::pin(async move {
                    registrar.abandon_network(&n, &net).await;
                    Ok(())
                }),
            );
        }

        let credential = match &spec.password {
            Some(password) => Credential::Password(password.clone()),
            None => Credential::GeneratedKeypair,
        };
        let created = self
            .provider
            .create_server(&ServerCreateRequest {
                name: spec.name.clone(),
                node_name: node.clone(),
                image_name: spec.image_name.clone(),
                flavor_name: spec.flavor.name.clone(),
                network_name: network_name.clone(),
                credential,
            })
            .await?;
        {
            let provider = Arc::clone(&self.provider);
            let (n, s) = (node.clone(), spec.name.clone());
            saga.push(
                "instance",
                Box::pin(async move {
                    provider.delete_server(&n, &s, None).await?;
                    Ok(())
                }),
            );
        }

        // Instance deletion also frees the floating IP, so this step needs
        // no compensation of its own.
        let floating_ip = self.provider.allocate_floating_ip(&node, &spec.name).await?;

        let lease = Lease {
            name: spec.name.clone(),
            owner: spec.owner.clone(),
            kind: LeaseKind::Server,
            image_name: spec.image_name.clone(),
            flavor_name: Some(spec.flavor.name.clone()),
            network_name,
            node_name: node,
            start_date: spec.start_date,
            end_date: spec.end_date,
            floating_ip: Some(floating_ip),
            container_ip: None,
            container_port: None,
            password_hash: None,
        };
        self.insert_lease_row(&mut *tx, &lease).await?;
        tx.commit().await?;

        let keypair = match (created.keypair_name, created.private_key) {
            (Some(name), Some(private_key)) => Some(KeypairMaterial { name, private_key }),
            _ => None,
        };
        Ok(LeaseReceipt { lease, keypair })
    }

    async fn rent_container(
        &self,
        saga: &mut Saga,
        spec: &ContainerRentSpec,
    ) -> Result<LeaseReceipt, LeaseError> {
        validate_name(&spec.name, LeaseKind::Container)?;

        if self.store.find_lease(&spec.name).await?.is_some() {
            return Err(LeaseError::DuplicateName(spec.name.clone()));
        }

        let node = self
            .selector
            .next_container_node()
            .await?
            .ok_or(LeaseError::InsufficientCapacity)?;
        info!(lease = %spec.name, node = %node, "Selected node (round-robin)");

        let mut tx = self.store.begin().await?;

        let (network_name, cidr) = match &spec.network {
            Some(req) => (req.name.clone(), req.cidr.clone()),
            None => (self.default_container_network.clone(), None),
        };
        if self
            .registrar
            .ensure_network(&mut *tx, &node, &network_name, cidr.as_deref())
            .await?
            == EnsureOutcome::Created
        {
            let registrar = self.registrar.clone();
            let (n, net) = (node.clone(), network_name.clone());
            saga.push(
                "network",
                Box::pin(async move {
                    registrar.abandon_network(&n, &net).await;
                    Ok(())
                }),
            );
        }

        let created = self
            .provider
            .create_container(&ContainerCreateRequest {
                name: spec.name.clone(),
                node_name: node.clone(),
                image_name: spec.image_name.clone(),
                network_name: network_name.clone(),
                env: spec.env.clone(),
                command: spec.command.clone(),
            })
            .await?;
        {
            let provider = Arc::clone(&self.provider);
            let (n, c) = (node.clone(), spec.name.clone());
            saga.push(
                "instance",
                Box::pin(async move {
                    provider.delete_container(&n, &c).await?;
                    Ok(())
                }),
            );
        }

        let lease = Lease {
            name: spec.name.clone(),
            owner: spec.owner.clone(),
            kind: LeaseKind::Container,
            image_name: spec.image_name.clone(),
            flavor_name: None,
            network_name,
            node_name: node,
            start_date: spec.start_date,
            end_date: spec.end_date,
            floating_ip: None,
            container_ip: Some(created.ip),
            container_port: created.port,
            password_hash: Some(hash_password(&spec.password)),
        };
        self.insert_lease_row(&mut *tx, &lease).await?;
        tx.commit().await?;

        Ok(LeaseReceipt {
            lease,
            keypair: None,
        })
    }

    /// Return a lease before its end date.
    #[instrument(skip(self, proof))]
    pub async fn return_lease(&self, name: &str, proof: OwnershipProof) -> Result<(), LeaseError> {
        let lease = self
            .store
            .find_lease(name)
            .await?
            .ok_or_else(|| LeaseError::NotFound(name.to_string()))?;
        self.verify_ownership(&lease, &proof)?;
        self.reclaim(&lease).await
    }

    /// Extend a lease; the new end date must be strictly later.
    #[instrument(skip(self, proof))]
    pub async fn extend(
        &self,
        name: &str,
        new_end_date: chrono::NaiveDate,
        proof: OwnershipProof,
    ) -> Result<(), LeaseError> {
        let lease = self
            .store
            .find_lease(name)
            .await?
            .ok_or_else(|| LeaseError::NotFound(name.to_string()))?;
        self.verify_ownership(&lease, &proof)?;

        if new_end_date <= lease.end_date {
            return Err(LeaseError::InvalidExtension {
                current: lease.end_date,
                requested: new_end_date,
            });
        }

        self.store.update_lease_end_date(name, new_end_date).await?;
        info!(lease = name, end_date = %new_end_date, "Lease extended");
        Ok(())
    }

    /// Inverse workflow shared by `return_lease` and the reaper: delete the
    /// provider instance, delete the ledger row (committed only after the
    /// provider delete succeeded), then release shared resources. Flavor
    /// release applies to servers only; containers are not flavor-tracked.
    pub(crate) async fn reclaim(&self, lease: &Lease) -> Result<(), LeaseError> {
        match lease.kind {
            LeaseKind::Server => {
                self.provider
                    .delete_server(&lease.node_name, &lease.name, lease.floating_ip.as_deref())
                    .await?
            }
            LeaseKind::Container => {
                self.provider
                    .delete_container(&lease.node_name, &lease.name)
                    .await?
            }
        }

        let mut tx = self.store.begin().await?;
        tx.delete_lease(&lease.name).await?;
        tx.commit().await?;

        if lease.kind == LeaseKind::Server {
            if let Some(flavor) = &lease.flavor_name {
                self.registrar
                    .release_flavor(self.store.as_ref(), flavor, &lease.node_name)
                    .await?;
            }
        }
        self.registrar
            .release_network(self.store.as_ref(), &lease.network_name, &lease.node_name)
            .await?;

        info!(lease = %lease.name, kind = lease.kind.as_str(), "Lease reclaimed");
        Ok(())
    }

    fn verify_ownership(&self, lease: &Lease, proof: &OwnershipProof) -> Result<(), LeaseError> {
        match proof {
            OwnershipProof::Verified => Ok(()),
            OwnershipProof::ContainerPassword(password) => {
                let matches = lease.kind == LeaseKind::Container
                    && lease
                        .password_hash
                        .as_deref()
                        .is_some_and(|hash| hash == hash_password(password));
                if matches {
                    Ok(())
                } else {
                    Err(LeaseError::OwnershipDenied)
                }
            }
        }
    }

    /// All leases in the ledger.
    pub async fn list_leases(&self) -> Result<Vec<Lease>, LeaseError> {
        Ok(self.store.list_leases().await?)
    }

    /// Per-node remaining capacity view.
    pub async fn remaining_resources(&self) -> Result<Vec<NodeRemaining>, LeaseError> {
        Ok(self.selector.remaining_resources().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name_rules() {
        assert!(validate_name("web01", LeaseKind::Server).is_ok());
        assert!(validate_name("", LeaseKind::Server).is_err());
        assert!(validate_name("app01", LeaseKind::Container).is_ok());
        assert!(validate_name("app-01", LeaseKind::Container).is_err());
        // Hyphens are fine for servers.
        assert!(validate_name("app-01", LeaseKind::Server).is_ok());
    }

    #[test]
    fn test_hash_password_is_sha256_hex() {
        let digest = hash_password("secret");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_password("secret"));
        assert_ne!(digest, hash_password("other"));
    }
}
