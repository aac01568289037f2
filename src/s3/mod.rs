pub mod listing;
pub mod object;
pub mod pool;
pub mod xml;

use std::sync::Arc;

use crate::config::S3ffsConfig;
use crate::error::Result;

use self::pool::{ClientPool, ConnectionPool};

/// The three connection pools: file reads, file uploads, and everything else
/// (listings, bucket check, directory placeholders).
#[derive(Clone)]
pub struct Pools {
    pub readers: Arc<dyn ConnectionPool>,
    pub writers: Arc<dyn ConnectionPool>,
    pub ops: Arc<dyn ConnectionPool>,
}

impl Pools {
    pub fn new(config: &S3ffsConfig) -> Result<Self> {
        let conn = &config.connections;
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(conn.readers + conn.writers + conn.operations)
            .build()?;
        let make = |name: &'static str, size: usize| -> Arc<dyn ConnectionPool> {
            Arc::new(ClientPool::new(
                name,
                client.clone(),
                config.endpoint.clone(),
                size,
                conn,
            ))
        };
        Ok(Self {
            readers: make("readers", conn.readers),
            writers: make("writers", conn.writers),
            ops: make("ops", conn.operations),
        })
    }

    /// Use one pool for every purpose.
    pub fn shared(pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            readers: Arc::clone(&pool),
            writers: Arc::clone(&pool),
            ops: pool,
        }
    }
}
