//! Shared resource registrar.
//!
//! Custom flavors and isolated networks are shared between leases but
//! materialized per node on the provider side. `ensure_*` is idempotent
//! create-or-reuse; `release_*` is reference-counted teardown. Two rules
//! keep the ledger honest:
//!
//! - A join row is written only after the provider call succeeds, and it
//!   rides the caller's open transaction, so registrar bookkeeping commits
//!   or aborts together with the lease insert.
//! - Teardown failure keeps the join row so a later release or reap retries
//!   the provider call instead of losing track of a live object.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::LeaseError;
use crate::model::{Flavor, Network, Shape};
use crate::provider::CloudProvider;
use crate::store::{Store, StoreTx};

/// Whether `ensure_*` materialized a new provider object or found one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyPresent,
}

/// Idempotent materialization and reference-counted teardown of shared
/// flavors and networks.
#[derive(Clone)]
pub struct ResourceRegistrar {
    provider: Arc<dyn CloudProvider>,
    router: String,
}

fn subnet_name(network: &str) -> String {
    format!("{network}_subnet")
}

impl ResourceRegistrar {
    pub fn new(provider: Arc<dyn CloudProvider>, router: String) -> Self {
        Self { provider, router }
    }

    /// Materialize a flavor on the node unless the join row says it is
    /// already there. The join row write rides the caller's transaction.
    pub async fn ensure_flavor(
        &self,
        tx: &mut dyn StoreTx,
        node: &str,
        name: &str,
        shape: &Shape,
    ) -> Result<EnsureOutcome, LeaseError> {
        if tx.find_flavor(name).await?.is_none() {
            tx.insert_flavor(&Flavor {
                name: name.to_string(),
                shape: *shape,
                is_default: false,
            })
            .await?;
        }

        if tx.node_flavor_exists(node, name).await? {
            return Ok(EnsureOutcome::AlreadyPresent);
        }

        info!(flavor = name, node, "Creating custom flavor");
        self.provider.create_flavor(node, name, shape).await?;
        tx.insert_node_flavor(node, name).await?;
        Ok(EnsureOutcome::Created)
    }

    /// Materialize an isolated network on the node unless the join row says
    /// it is already there. New networks need a CIDR; reuse of an existing
    /// network takes the CIDR from its ledger row. Provider sequence:
    /// create network, create subnet with a gateway on the CIDR's first
    /// host, attach the subnet to the shared router.
    pub async fn ensure_network(
        &self,
        tx: &mut dyn StoreTx,
        node: &str,
        name: &str,
        cidr: Option<&str>,
    ) -> Result<EnsureOutcome, LeaseError> {
        let cidr = match tx.find_network(name).await? {
            Some(network) => network.cidr,
            None => {
                let cidr = cidr
                    .ok_or_else(|| {
                        LeaseError::InvalidRequest(format!(
                            "network {name} does not exist and no CIDR was supplied"
                        ))
                    })?
                    .to_string();
                // Reject bad CIDRs before any provider call.
                gateway_for_cidr(&cidr)?;
                tx.insert_network(&Network {
                    name: name.to_string(),
                    cidr: cidr.clone(),
                    is_default: false,
                })
                .await?;
                cidr
            }
        };

        if tx.node_network_exists(node, name).await? {
            return Ok(EnsureOutcome::AlreadyPresent);
        }

        let gateway = gateway_for_cidr(&cidr)?;
        let subnet = subnet_name(name);

        info!(network = name, node, cidr, "Isolating network");
        self.provider.create_network(node, name).await?;
        if let Err(e) = self
            .provider
            .create_subnet(node, name, &subnet, &cidr, gateway)
            .await
        {
            self.abandon_network(node, name).await;
            return Err(e.into());
        }
        if let Err(e) = self
            .provider
            .attach_router_interface(node, &self.router, &subnet)
            .await
        {
            self.abandon_network(node, name).await;
            return Err(e.into());
        }

        tx.insert_node_network(node, name).await?;
        Ok(EnsureOutcome::Created)
    }

    /// Tear down a custom flavor if no lease anywhere still references it.
    /// The refcount check and every row delete happen in one transaction.
    pub async fn release_flavor(
        &self,
        store: &dyn Store,
        name: &str,
        node: &str,
    ) -> Result<(), LeaseError> {
        let mut tx = store.begin().await?;

        let Some(flavor) = tx.find_flavor(name).await? else {
            // Already gone; release is idempotent.
            return Ok(());
        };
        if flavor.is_default {
            return Ok(());
        }
        if tx.count_leases_by_flavor(name).await? > 0 {
            return Ok(());
        }

        info!(flavor = name, requested_node = node, "Last referent gone, deleting custom flavor");
        let mut kept = 0usize;
        for join in tx.node_flavors_for(name).await? {
            match self.provider.delete_flavor(&join.node_name, name).await {
                Ok(()) => tx.delete_node_flavor(&join.node_name, name).await?,
                Err(e) => {
                    warn!(
                        flavor = name,
                        node = %join.node_name,
                        error = %e,
                        "Flavor teardown failed; keeping join row for retry"
                    );
                    kept += 1;
                }
            }
        }
        if kept == 0 {
            tx.delete_flavor(name).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Tear down an isolated network if no lease of either kind still
    /// references it. Per node: detach the router interface, then delete
    /// the network (subnet deletion cascades on the provider side).
    pub async fn release_network(
        &self,
        store: &dyn Store,
        name: &str,
        node: &str,
    ) -> Result<(), LeaseError> {
        let mut tx = store.begin().await?;

        let Some(network) = tx.find_network(name).await? else {
            return Ok(());
        };
        if network.is_default {
            return Ok(());
        }
        if tx.count_leases_by_network(name).await? > 0 {
            return Ok(());
        }

        info!(network = name, requested_node = node, "Last referent gone, deleting network");
        let subnet = subnet_name(name);
        let mut kept = 0usize;
        for join in tx.node_networks_for(name).await? {
            let torn_down = async {
                self.provider
                    .detach_router_interface(&join.node_name, &self.router, &subnet)
                    .await?;
                self.provider.delete_network(&join.node_name, name).await
            }
            .await;

            match torn_down {
                Ok(()) => tx.delete_node_network(&join.node_name, name).await?,
                Err(e) => {
                    warn!(
                        network = name,
                        node = %join.node_name,
                        error = %e,
                        "Network teardown failed; keeping join row for retry"
                    );
                    kept += 1;
                }
            }
        }
        if kept == 0 {
            tx.delete_network(name).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Best-effort provider-only teardown of a flavor this attempt created.
    /// Used by saga compensation after the transaction holding the ledger
    /// rows has rolled back.
    pub async fn abandon_flavor(&self, node: &str, name: &str) {
        if let Err(e) = self.provider.delete_flavor(node, name).await {
            warn!(flavor = name, node, error = %e, "Flavor compensation failed");
        }
    }

    /// Best-effort provider-only teardown of a network this attempt created.
    pub async fn abandon_network(&self, node: &str, name: &str) {
        let subnet = subnet_name(name);
        if let Err(e) = self
            .provider
            .detach_router_interface(node, &self.router, &subnet)
            .await
        {
            warn!(network = name, node, error = %e, "Router detach compensation failed");
        }
        if let Err(e) = self.provider.delete_network(node, name).await {
            warn!(network = name, node, error = %e, "Network compensation failed");
        }
    }
}

/// Gateway address for a subnet: the first host of the CIDR block
/// (`10.0.0.0/24` -> `10.0.0.1`).
pub fn gateway_for_cidr(cidr: &str) -> Result<Ipv4Addr, LeaseError> {
    let invalid = || LeaseError::InvalidRequest(format!("invalid CIDR: {cidr}"));

    let (addr, len) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let len: u32 = len.parse().map_err(|_| invalid())?;
    // /31 and /32 have no room for a gateway and a host.
    if len > 30 {
        return Err(invalid());
    }

    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    let network = u32::from(addr) & mask;
    Ok(Ipv4Addr::from(network + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.0.0.0/24", "10.0.0.1")]
    #[case("10.0.0.37/24", "10.0.0.1")]
    #[case("192.168.128.0/17", "192.168.128.1")]
    #[case("172.16.0.0/12", "172.16.0.1")]
    fn test_gateway_first_host(#[case] cidr: &str, #[case] expected: &str) {
        let gateway = gateway_for_cidr(cidr).unwrap();
        assert_eq!(gateway, expected.parse::<Ipv4Addr>().unwrap());
    }

    #[rstest]
    #[case("10.0.0.0")]
    #[case("10.0.0.0/31")]
    #[case("10.0.0.0/33")]
    #[case("not-an-ip/24")]
    fn test_gateway_rejects_invalid_cidr(#[case] cidr: &str) {
        assert!(matches!(
            gateway_for_cidr(cidr),
            Err(LeaseError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_subnet_name_convention() {
        assert_eq!(subnet_name("net1"), "net1_subnet");
    }
}
