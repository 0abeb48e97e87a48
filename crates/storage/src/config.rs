//! Environment-driven node configuration (§6).
//!
//! `storage-server` reads these at startup; nothing here is reloaded at
//! runtime. Kept in one place so the binary and tests can share defaults.
use crate::hnsw_container::{HnswConfig, Metric};
use crate::store::{StoreConfig, DEFAULT_WAL_CHECKPOINT_BYTES};
use std::net::SocketAddr;
use std::path::PathBuf;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Resolved configuration for one `storage-server` process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub storage_path: PathBuf,
    pub listen_addr: SocketAddr,
    pub dimension: u32,
    pub tenant_mode: bool,
    pub fsync_wal: bool,
    pub wal_checkpoint_bytes: u64,
    pub hnsw_max_neighbors: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_metric: Metric,
    /// `grid-master` endpoint this node registers with, if clustered.
    pub master_endpoint: Option<String>,
    /// `grid-events` endpoint metrics are forwarded to, if configured.
    pub event_storage_addr: Option<String>,
    pub idle_timeout_secs: u64,
    pub tls_enabled: bool,
}

impl NodeConfig {
    /// Build from environment variables, falling back to development
    /// defaults for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        let storage_path = std::env::var("STORAGE_PATH").unwrap_or_else(|_| "/data/storage".to_string());
        let host = std::env::var("STORAGE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = env_or("STORAGE_PORT", 50051);
        let listen_addr: SocketAddr = format!("{host}:{port}").parse()?;

        let metric = match std::env::var("HNSW_METRIC").as_deref() {
            Ok("euclidean") => Metric::Euclidean,
            _ => Metric::Cosine,
        };

        Ok(Self {
            storage_path: PathBuf::from(storage_path),
            listen_addr,
            dimension: env_or("VECTOR_DIMENSION", 768u32),
            tenant_mode: env_or("TENANT_MODE", false),
            fsync_wal: env_or("FSYNC_WAL", true),
            wal_checkpoint_bytes: env_or("WAL_CHECKPOINT_MB", DEFAULT_WAL_CHECKPOINT_BYTES / (1024 * 1024)) * 1024 * 1024,
            hnsw_max_neighbors: env_or("HNSW_M", 16usize),
            hnsw_ef_construction: env_or("HNSW_EF_CONSTRUCTION", 200usize),
            hnsw_metric: metric,
            master_endpoint: std::env::var("MASTER_ENDPOINT").ok(),
            event_storage_addr: std::env::var("EVENT_STORAGE").ok(),
            idle_timeout_secs: env_or("IDLE_TIMEOUT_SECS", 300u64),
            tls_enabled: crate::tls::is_tls_enabled(),
        })
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            dir: self.storage_path.clone(),
            dimension: self.dimension,
            tenant_mode: self.tenant_mode,
            fsync_wal: self.fsync_wal,
            hnsw: HnswConfig {
                dimension: self.dimension as usize,
                max_neighbors: self.hnsw_max_neighbors,
                ef_construction: self.hnsw_ef_construction,
                metric: self.hnsw_metric,
            },
            wal_checkpoint_bytes: self.wal_checkpoint_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        for key in [
            "STORAGE_PATH", "STORAGE_HOST", "STORAGE_PORT", "VECTOR_DIMENSION", "TENANT_MODE", "FSYNC_WAL",
            "WAL_CHECKPOINT_MB", "HNSW_M", "HNSW_EF_CONSTRUCTION", "HNSW_METRIC", "MASTER_ENDPOINT", "EVENT_STORAGE",
            "IDLE_TIMEOUT_SECS", "TLS_ENABLED",
        ] {
            std::env::remove_var(key);
        }
        let config = NodeConfig::from_env().unwrap();
        assert_eq!(config.dimension, 768);
        assert_eq!(config.hnsw_max_neighbors, 16);
        assert!(config.master_endpoint.is_none());
    }
}
