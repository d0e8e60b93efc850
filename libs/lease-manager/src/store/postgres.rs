//! Postgres-backed store.
//!
//! Uses SQLx with runtime-checked queries (macros disabled so builds do not
//! require a live database) and hand-written `FromRow` impls.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use super::{Store, StoreError, StoreTx};
use crate::model::{ComputeNode, Flavor, Lease, Network, NodeFlavor, NodeNetwork, Shape};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/cirrus".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/cirrus".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Postgres-backed implementation of [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new connection pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, embedding services).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations via runtime loading.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        let candidates = [
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("libs/lease-manager/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];

        let mut last_error: Option<sqlx::migrate::MigrateError> = None;
        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error
            .map(StoreError::Migration)
            .unwrap_or_else(|| StoreError::NotFound("migrations directory".into())))
    }
}

fn map_insert_err(key: &str, e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::Duplicate(key.to_string());
        }
    }
    StoreError::Query(e)
}

impl<'r> sqlx::FromRow<'r, PgRow> for ComputeNode {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            seq: row.try_get("seq")?,
            capacity: Shape {
                vcpus: row.try_get("vcpus")?,
                ram_mb: row.try_get("ram_mb")?,
                disk_gb: row.try_get("disk_gb")?,
            },
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Lease {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let kind = kind.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
            index: "kind".into(),
            source: e.into(),
        })?;

        Ok(Self {
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            kind,
            image_name: row.try_get("image_name")?,
            flavor_name: row.try_get("flavor_name")?,
            network_name: row.try_get("network_name")?,
            node_name: row.try_get("node_name")?,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            floating_ip: row.try_get("floating_ip")?,
            container_ip: row.try_get("container_ip")?,
            container_port: row.try_get("container_port")?,
            password_hash: row.try_get("password_hash")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Flavor {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            shape: Shape {
                vcpus: row.try_get("vcpus")?,
                ram_mb: row.try_get("ram_mb")?,
                disk_gb: row.try_get("disk_gb")?,
            },
            is_default: row.try_get("is_default")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Network {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            cidr: row.try_get("cidr")?,
            is_default: row.try_get("is_default")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeFlavor {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            node_name: row.try_get("node_name")?,
            flavor_name: row.try_get("flavor_name")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeNetwork {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            node_name: row.try_get("node_name")?,
            network_name: row.try_get("network_name")?,
        })
    }
}

const LEASE_COLUMNS: &str = "name, owner, kind, image_name, flavor_name, network_name, \
     node_name, start_date, end_date, floating_ip, container_ip, container_port, password_hash";

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(StoreError::Query)?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, StoreError> {
        sqlx::query_as::<_, ComputeNode>(
            "SELECT name, seq, vcpus, ram_mb, disk_gb FROM compute_nodes ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn get_node(&self, name: &str) -> Result<Option<ComputeNode>, StoreError> {
        sqlx::query_as::<_, ComputeNode>(
            "SELECT name, seq, vcpus, ram_mb, disk_gb FROM compute_nodes WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError> {
        sqlx::query_as::<_, Lease>(&format!(
            "SELECT {LEASE_COLUMNS} FROM leases ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn find_lease(&self, name: &str) -> Result<Option<Lease>, StoreError> {
        sqlx::query_as::<_, Lease>(&format!(
            "SELECT {LEASE_COLUMNS} FROM leases WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn find_flavor(&self, name: &str) -> Result<Option<Flavor>, StoreError> {
        sqlx::query_as::<_, Flavor>(
            "SELECT name, vcpus, ram_mb, disk_gb, is_default FROM flavors WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn server_usage_on_node(&self, node: &str) -> Result<Shape, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT CAST(COALESCE(SUM(f.vcpus), 0) AS BIGINT) AS vcpus,
                   CAST(COALESCE(SUM(f.ram_mb), 0) AS BIGINT) AS ram_mb,
                   CAST(COALESCE(SUM(f.disk_gb), 0) AS BIGINT) AS disk_gb
            FROM leases l
            JOIN flavors f ON f.name = l.flavor_name
            WHERE l.node_name = $1 AND l.kind = 'server'
            "#,
        )
        .bind(node)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(Shape {
            vcpus: row.try_get("vcpus").map_err(StoreError::Query)?,
            ram_mb: row.try_get("ram_mb").map_err(StoreError::Query)?,
            disk_gb: row.try_get("disk_gb").map_err(StoreError::Query)?,
        })
    }

    async fn expired_leases(&self, before: NaiveDate) -> Result<Vec<Lease>, StoreError> {
        sqlx::query_as::<_, Lease>(&format!(
            "SELECT {LEASE_COLUMNS} FROM leases WHERE end_date < $1 ORDER BY name"
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)
    }

    async fn update_lease_end_date(&self, name: &str, end: NaiveDate) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE leases SET end_date = $2 WHERE name = $1")
            .bind(name)
            .bind(end)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("lease {name}")));
        }
        Ok(())
    }

    async fn upsert_node(&self, node: &ComputeNode) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO compute_nodes (name, seq, vcpus, ram_mb, disk_gb)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&node.name)
        .bind(node.seq)
        .bind(node.capacity.vcpus)
        .bind(node.capacity.ram_mb)
        .bind(node.capacity.disk_gb)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn seed_flavor(&self, flavor: &Flavor, nodes: &[String]) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flavors (name, vcpus, ram_mb, disk_gb, is_default)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&flavor.name)
        .bind(flavor.shape.vcpus)
        .bind(flavor.shape.ram_mb)
        .bind(flavor.shape.disk_gb)
        .bind(flavor.is_default)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        for node in nodes {
            sqlx::query(
                r#"
                INSERT INTO node_flavors (node_name, flavor_name)
                VALUES ($1, $2)
                ON CONFLICT (node_name, flavor_name) DO NOTHING
                "#,
            )
            .bind(node)
            .bind(&flavor.name)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        }
        Ok(())
    }

    async fn seed_network(&self, network: &Network, nodes: &[String]) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO networks (name, cidr, is_default)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&network.name)
        .bind(&network.cidr)
        .bind(network.is_default)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        for node in nodes {
            sqlx::query(
                r#"
                INSERT INTO node_networks (node_name, network_name)
                VALUES ($1, $2)
                ON CONFLICT (node_name, network_name) DO NOTHING
                "#,
            )
            .bind(node)
            .bind(&network.name)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        }
        Ok(())
    }
}

/// A transaction against the Postgres ledger.
pub struct PgStoreTx {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn insert_lease(&mut self, lease: &Lease) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO leases (name, owner, kind, image_name, flavor_name, network_name,
                                node_name, start_date, end_date, floating_ip,
                                container_ip, container_port, password_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&lease.name)
        .bind(&lease.owner)
        .bind(lease.kind.as_str())
        .bind(&lease.image_name)
        .bind(&lease.flavor_name)
        .bind(&lease.network_name)
        .bind(&lease.node_name)
        .bind(lease.start_date)
        .bind(lease.end_date)
        .bind(&lease.floating_ip)
        .bind(&lease.container_ip)
        .bind(&lease.container_port)
        .bind(&lease.password_hash)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_insert_err(&lease.name, e))?;
        Ok(())
    }

    async fn delete_lease(&mut self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM leases WHERE name = $1")
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn find_flavor(&mut self, name: &str) -> Result<Option<Flavor>, StoreError> {
        sqlx::query_as::<_, Flavor>(
            "SELECT name, vcpus, ram_mb, disk_gb, is_default FROM flavors WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StoreError::Query)
    }

    async fn insert_flavor(&mut self, flavor: &Flavor) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flavors (name, vcpus, ram_mb, disk_gb, is_default)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&flavor.name)
        .bind(flavor.shape.vcpus)
        .bind(flavor.shape.ram_mb)
        .bind(flavor.shape.disk_gb)
        .bind(flavor.is_default)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_insert_err(&flavor.name, e))?;
        Ok(())
    }

    async fn delete_flavor(&mut self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM flavors WHERE name = $1")
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn node_flavor_exists(&mut self, node: &str, flavor: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM node_flavors WHERE node_name = $1 AND flavor_name = $2",
        )
        .bind(node)
        .bind(flavor)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StoreError::Query)?;
        Ok(row.is_some())
    }

    async fn insert_node_flavor(&mut self, node: &str, flavor: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO node_flavors (node_name, flavor_name) VALUES ($1, $2)")
            .bind(node)
            .bind(flavor)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_insert_err(&format!("{node}/{flavor}"), e))?;
        Ok(())
    }

    async fn delete_node_flavor(&mut self, node: &str, flavor: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM node_flavors WHERE node_name = $1 AND flavor_name = $2")
            .bind(node)
            .bind(flavor)
            .execute(&mut *self.tx)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn node_flavors_for(&mut self, flavor: &str) -> Result<Vec<NodeFlavor>, StoreError> {
        sqlx::query_as::<_, NodeFlavor>(
            "SELECT node_name, flavor_name FROM node_flavors WHERE flavor_name = $1 ORDER BY node_name",
        )
        .bind(flavor)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StoreError::Query)
    }

    async fn count_leases_by_flavor(&mut self, name: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM leases WHERE flavor_name = $1")
            .bind(name)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(StoreError::Query)?;
        row.try_get("n").map_err(StoreError::Query)
    }

    async fn find_network(&mut self, name: &str) -> Result<Option<Network>, StoreError> {
        sqlx::query_as::<_, Network>("SELECT name, cidr, is_default FROM networks WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(StoreError::Query)
    }

    async fn insert_network(&mut self, network: &Network) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO networks (name, cidr, is_default) VALUES ($1, $2, $3)")
            .bind(&network.name)
            .bind(&network.cidr)
            .bind(network.is_default)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_insert_err(&network.name, e))?;
        Ok(())
    }

    async fn delete_network(&mut self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM networks WHERE name = $1")
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn node_network_exists(&mut self, node: &str, network: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM node_networks WHERE node_name = $1 AND network_name = $2",
        )
        .bind(node)
        .bind(network)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StoreError::Query)?;
        Ok(row.is_some())
    }

    async fn insert_node_network(&mut self, node: &str, network: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO node_networks (node_name, network_name) VALUES ($1, $2)")
            .bind(node)
            .bind(network)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_insert_err(&format!("{node}/{network}"), e))?;
        Ok(())
    }

    async fn delete_node_network(&mut self, node: &str, network: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM node_networks WHERE node_name = $1 AND network_name = $2")
            .bind(node)
            .bind(network)
            .execute(&mut *self.tx)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn node_networks_for(&mut self, network: &str) -> Result<Vec<NodeNetwork>, StoreError> {
        sqlx::query_as::<_, NodeNetwork>(
            "SELECT node_name, network_name FROM node_networks WHERE network_name = $1 ORDER BY node_name",
        )
        .bind(network)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(StoreError::Query)
    }

    async fn count_leases_by_network(&mut self, name: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM leases WHERE network_name = $1")
            .bind(name)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(StoreError::Query)?;
        row.try_get("n").map_err(StoreError::Query)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(StoreError::Query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
    }
}
