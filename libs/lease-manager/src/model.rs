//! Domain model for the lease ledger.
//!
//! These are the persisted entities: compute nodes, leases, shared flavors
//! and networks, and the per-node join rows that record where a shared
//! resource has been materialized on the provider side.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A resource requirement triple: vcpus, RAM in MB, disk in GB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub vcpus: i64,
    pub ram_mb: i64,
    pub disk_gb: i64,
}

impl Shape {
    pub const ZERO: Shape = Shape {
        vcpus: 0,
        ram_mb: 0,
        disk_gb: 0,
    };

    /// Whether `other` fits inside this shape on every dimension.
    pub fn fits(&self, other: &Shape) -> bool {
        self.vcpus >= other.vcpus && self.ram_mb >= other.ram_mb && self.disk_gb >= other.disk_gb
    }

    /// Remaining shape after subtracting `used`, floored at zero per dimension.
    pub fn minus(&self, used: &Shape) -> Shape {
        Shape {
            vcpus: (self.vcpus - used.vcpus).max(0),
            ram_mb: (self.ram_mb - used.ram_mb).max(0),
            disk_gb: (self.disk_gb - used.disk_gb).max(0),
        }
    }

    pub fn plus(&self, other: &Shape) -> Shape {
        Shape {
            vcpus: self.vcpus + other.vcpus,
            ram_mb: self.ram_mb + other.ram_mb,
            disk_gb: self.disk_gb + other.disk_gb,
        }
    }
}

/// A physical compute node. Seeded from the catalog at bootstrap and never
/// mutated at runtime; `seq` preserves catalog order for stable enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeNode {
    pub name: String,
    pub seq: i64,
    pub capacity: Shape,
}

/// Which kind of resource a lease holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    Server,
    Container,
}

impl LeaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseKind::Server => "server",
            LeaseKind::Container => "container",
        }
    }
}

impl std::str::FromStr for LeaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(LeaseKind::Server),
            "container" => Ok(LeaseKind::Container),
            other => Err(format!("unknown lease kind: {other}")),
        }
    }
}

/// A tenant's claim on a provisioned server or container for a bounded
/// time window.
///
/// Servers carry a `flavor_name` and a `floating_ip`; containers are not
/// capacity-tracked, so they have no flavor, and receive their
/// network-assigned `container_ip`/`container_port` directly. Container
/// leases also store a password digest used to authorize extend/return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner: String,
    pub kind: LeaseKind,
    pub image_name: String,
    pub flavor_name: Option<String>,
    pub network_name: String,
    pub node_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub floating_ip: Option<String>,
    pub container_ip: Option<String>,
    pub container_port: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
}

/// A shared flavor. Default flavors are seeded at bootstrap and never torn
/// down; custom flavors are created on first use and reference-counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flavor {
    pub name: String,
    pub shape: Shape,
    pub is_default: bool,
}

/// A shared isolated network. Default networks are never torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub cidr: String,
    pub is_default: bool,
}

/// Join row: the flavor has a provider-side object on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFlavor {
    pub node_name: String,
    pub flavor_name: String,
}

/// Join row: the network has a provider-side object on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeNetwork {
    pub node_name: String,
    pub network_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_fits() {
        let capacity = Shape {
            vcpus: 4,
            ram_mb: 8192,
            disk_gb: 100,
        };
        let request = Shape {
            vcpus: 2,
            ram_mb: 2048,
            disk_gb: 20,
        };

        assert!(capacity.fits(&request));
        assert!(!request.fits(&capacity));
        assert!(capacity.fits(&capacity));
    }

    #[test]
    fn test_shape_minus_floors_at_zero() {
        let a = Shape {
            vcpus: 2,
            ram_mb: 1024,
            disk_gb: 10,
        };
        let b = Shape {
            vcpus: 4,
            ram_mb: 512,
            disk_gb: 10,
        };

        let remaining = a.minus(&b);
        assert_eq!(remaining.vcpus, 0);
        assert_eq!(remaining.ram_mb, 512);
        assert_eq!(remaining.disk_gb, 0);
    }

    #[test]
    fn test_lease_kind_round_trip() {
        assert_eq!("server".parse::<LeaseKind>().unwrap(), LeaseKind::Server);
        assert_eq!(
            "container".parse::<LeaseKind>().unwrap(),
            LeaseKind::Container
        );
        assert!("vm".parse::<LeaseKind>().is_err());
        assert_eq!(LeaseKind::Server.as_str(), "server");
    }
}
