//! Per-backend admission control and driver client caching
//!
//! Every backend endpoint (type, host, port) gets a bounded number of
//! concurrent connections. Callers wait for a slot up to a deadline and then
//! fail with `Unreachable` instead of blocking forever.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use moka::sync::Cache;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::ConnectorError;
use crate::model::{ConnectionTarget, PoolKey};

/// Connection pool sizing shared by all connectors
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum concurrent connections per (type, host, port)
    pub max_connections: u32,
    /// How long a caller may wait for a free connection
    pub acquire_timeout: Duration,
    /// Timeout for establishing a new connection
    pub connect_timeout: Duration,
    /// Driver clients unused for this long are dropped
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Bounded admission per backend endpoint
pub struct AdmissionControl {
    limits: DashMap<PoolKey, Arc<Semaphore>>,
    max_connections: usize,
}

impl AdmissionControl {
    pub fn new(max_connections: u32) -> Self {
        Self {
            limits: DashMap::new(),
            max_connections: max_connections.max(1) as usize,
        }
    }

    fn semaphore(&self, key: &PoolKey) -> Arc<Semaphore> {
        if let Some(sem) = self.limits.get(key) {
            return Arc::clone(&sem);
        }
        let sem = self
            .limits
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_connections)));
        Arc::clone(&sem)
    }

    /// Wait up to `wait` for a connection slot on `key`
    pub async fn acquire(
        &self,
        key: &PoolKey,
        wait: Duration,
    ) -> Result<OwnedSemaphorePermit, ConnectorError> {
        let sem = self.semaphore(key);
        match tokio::time::timeout(wait, sem.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ConnectorError::unreachable(format!(
                "connection pool for {} is closed",
                key
            ))),
            Err(_) => {
                tracing::warn!(pool = %key, wait_ms = wait.as_millis() as u64, "Connection pool exhausted");
                Err(ConnectorError::unreachable(format!(
                    "connection pool for {} exhausted after {:?}",
                    key, wait
                )))
            }
        }
    }

    /// Connections currently checked out for `key`
    pub fn in_use(&self, key: &PoolKey) -> usize {
        self.limits
            .get(key)
            .map(|sem| self.max_connections - sem.available_permits())
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

/// Identity of a driver client: endpoint plus everything baked into its connection options
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub pool: PoolKey,
    pub database: String,
    pub credentials_ref: Option<String>,
    pub options: BTreeMap<String, String>,
}

impl From<&ConnectionTarget> for ClientKey {
    fn from(target: &ConnectionTarget) -> Self {
        Self {
            pool: target.pool_key(),
            database: target.database.clone(),
            credentials_ref: target.credentials_ref.clone(),
            options: target.options.clone(),
        }
    }
}

/// Driver clients (sqlx pools, MongoDB clients) reused across evaluations
pub struct ClientCache<V: Clone + Send + Sync + 'static> {
    cache: Cache<ClientKey, V>,
}

impl<V: Clone + Send + Sync + 'static> ClientCache<V> {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(1024)
                .time_to_idle(idle_timeout)
                .build(),
        }
    }

    /// Return the cached client for `target`, building it on first use
    pub fn get_or_try_build<F>(&self, target: &ConnectionTarget, build: F) -> Result<V, ConnectorError>
    where
        F: FnOnce() -> Result<V, ConnectorError>,
    {
        let key = ClientKey::from(target);
        if let Some(client) = self.cache.get(&key) {
            return Ok(client);
        }
        let client = build()?;
        self.cache.insert(key, client.clone());
        Ok(client)
    }

    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorErrorKind;
    use crate::model::DatabaseType;

    fn key() -> PoolKey {
        ConnectionTarget::new(DatabaseType::PostgreSql, "pg", 5432, "app").pool_key()
    }

    #[tokio::test]
    async fn test_exhaustion_yields_unreachable() {
        let admission = AdmissionControl::new(2);
        let key = key();

        let _a = admission.acquire(&key, Duration::from_millis(10)).await.unwrap();
        let _b = admission.acquire(&key, Duration::from_millis(10)).await.unwrap();
        assert_eq!(admission.in_use(&key), 2);

        let err = admission
            .acquire(&key, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn test_permit_release() {
        let admission = AdmissionControl::new(1);
        let key = key();

        let permit = admission.acquire(&key, Duration::from_millis(10)).await.unwrap();
        drop(permit);
        assert_eq!(admission.in_use(&key), 0);
        assert!(admission.acquire(&key, Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_pools_are_per_endpoint() {
        let admission = AdmissionControl::new(1);
        let other = ConnectionTarget::new(DatabaseType::PostgreSql, "pg-2", 5432, "app").pool_key();

        let _a = admission.acquire(&key(), Duration::from_millis(10)).await.unwrap();
        assert!(admission.acquire(&other, Duration::from_millis(10)).await.is_ok());
    }

    #[test]
    fn test_client_cache_reuses() {
        let cache: ClientCache<u32> = ClientCache::new(Duration::from_secs(60));
        let target = ConnectionTarget::new(DatabaseType::MongoDb, "mongo", 27017, "app");

        let mut builds = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_try_build(&target, || {
                    builds += 1;
                    Ok(7)
                })
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(builds, 1);
    }
}
