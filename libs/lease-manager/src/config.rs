//! Service configuration and the static resource catalog.
//!
//! Scalars come from `CIRRUS_*` environment variables; the compute node
//! inventory and pre-seeded default flavors/networks come from a TOML
//! catalog file. Node order in the catalog is the stable enumeration order
//! the node selector uses.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::model::Shape;
use crate::store::DbConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    Invalid { var: String, message: String },

    #[error("failed to read catalog {path}: {source}")]
    CatalogIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    CatalogParse(#[from] toml::de::Error),

    #[error("catalog is invalid: {0}")]
    CatalogInvalid(String),
}

/// How the node-selection race is handled (see the concurrency notes on
/// [`crate::orchestrator::LeaseManager::rent`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyMode {
    /// Capacity read and lease commit are not serialized; two concurrent
    /// rents may overcommit a node. This is the documented default.
    #[default]
    Optimistic,
    /// An in-process lock spans node selection through commit. Closes the
    /// race within a single process only.
    Serialized,
}

impl std::str::FromStr for ConsistencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "optimistic" => Ok(ConsistencyMode::Optimistic),
            "serialized" => Ok(ConsistencyMode::Serialized),
            other => Err(format!("unknown consistency mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub database: DbConfig,
    pub catalog_path: PathBuf,
    pub reap_interval: Duration,
    pub consistency: ConsistencyMode,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let log_level = std::env::var("CIRRUS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let catalog_path = std::env::var("CIRRUS_CATALOG")
            .unwrap_or_else(|_| "catalog.toml".to_string())
            .into();

        let reap_interval_secs = match std::env::var("CIRRUS_REAP_INTERVAL_SECS") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "CIRRUS_REAP_INTERVAL_SECS".into(),
                message: format!("not a number: {raw}"),
            })?,
            // Daily by default, matching the reclamation schedule.
            Err(_) => 86_400,
        };

        let consistency = match std::env::var("CIRRUS_CONSISTENCY") {
            Ok(raw) => raw.parse().map_err(|message| ConfigError::Invalid {
                var: "CIRRUS_CONSISTENCY".into(),
                message,
            })?,
            Err(_) => ConsistencyMode::default(),
        };

        Ok(Self {
            log_level,
            database: DbConfig::from_env(),
            catalog_path,
            reap_interval: Duration::from_secs(reap_interval_secs),
            consistency,
        })
    }
}

/// A compute node declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub vcpus: i64,
    pub ram_mb: i64,
    pub disk_gb: i64,
}

impl NodeEntry {
    pub fn capacity(&self) -> Shape {
        Shape {
            vcpus: self.vcpus,
            ram_mb: self.ram_mb,
            disk_gb: self.disk_gb,
        }
    }
}

/// A default flavor, materialized on every node at bootstrap.
#[derive(Debug, Clone, Deserialize)]
pub struct FlavorEntry {
    pub name: String,
    pub vcpus: i64,
    pub ram_mb: i64,
    pub disk_gb: i64,
}

impl FlavorEntry {
    pub fn shape(&self) -> Shape {
        Shape {
            vcpus: self.vcpus,
            ram_mb: self.ram_mb,
            disk_gb: self.disk_gb,
        }
    }
}

/// A default network, materialized on every node at bootstrap.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkEntry {
    pub name: String,
    pub cidr: String,
}

/// The static resource catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    /// Name of the pre-existing shared router that isolated subnets attach to.
    pub router: String,

    /// Default network for server leases that name no network.
    pub default_server_network: String,

    /// Default network for container leases that name no network.
    pub default_container_network: String,

    #[serde(default)]
    pub nodes: Vec<NodeEntry>,

    #[serde(default)]
    pub flavors: Vec<FlavorEntry>,

    #[serde(default)]
    pub networks: Vec<NetworkEntry>,
}

impl Catalog {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let catalog: Catalog = toml::from_str(raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::CatalogIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::CatalogInvalid(
                "at least one compute node is required".into(),
            ));
        }
        for default in [&self.default_server_network, &self.default_container_network] {
            if !self.networks.iter().any(|n| &n.name == default) {
                return Err(ConfigError::CatalogInvalid(format!(
                    "default network {default} is not declared in [[networks]]"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
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
        vcpus = 8
        ram_mb = 16384
        disk_gb = 200

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
    "#;

    #[test]
    fn test_catalog_parses_in_order() {
        let catalog = Catalog::from_toml_str(CATALOG).unwrap();
        assert_eq!(catalog.router, "shared-router");
        assert_eq!(catalog.nodes[0].name, "node-a");
        assert_eq!(catalog.nodes[1].name, "node-b");
        assert_eq!(catalog.nodes[0].capacity().ram_mb, 8192);
        assert_eq!(catalog.flavors.len(), 1);
    }

    #[test]
    fn test_catalog_rejects_unknown_default_network() {
        let raw = CATALOG.replace("default_server_network = \"internal\"",
            "default_server_network = \"missing\"");
        assert!(matches!(
            Catalog::from_toml_str(&raw),
            Err(ConfigError::CatalogInvalid(_))
        ));
    }

    #[test]
    fn test_catalog_requires_nodes() {
        let raw = r#"
            router = "r"
            default_server_network = "internal"
            default_container_network = "internal"

            [[networks]]
            name = "internal"
            cidr = "10.0.0.0/24"
        "#;
        assert!(matches!(
            Catalog::from_toml_str(raw),
            Err(ConfigError::CatalogInvalid(_))
        ));
    }

    #[test]
    fn test_config_from_env_defaults() {
        // No CIRRUS_* variables are set in the test environment.
        let config = Config::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.catalog_path, PathBuf::from("catalog.toml"));
        assert_eq!(config.reap_interval, Duration::from_secs(86_400));
        assert_eq!(config.consistency, ConsistencyMode::Optimistic);
    }

    #[test]
    fn test_consistency_mode_parse() {
        assert_eq!(
            "optimistic".parse::<ConsistencyMode>().unwrap(),
            ConsistencyMode::Optimistic
        );
        assert_eq!(
            "serialized".parse::<ConsistencyMode>().unwrap(),
            ConsistencyMode::Serialized
        );
        assert!("eventual".parse::<ConsistencyMode>().is_err());
    }
}
