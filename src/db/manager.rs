use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::auth::RequestContext;
use crate::config::{DatabaseConfig, PoolConfig};
use crate::error::{AppError, AppResult};

/// (token hash, database name). Two principals never share a key, so they
/// never share a pool or observe each other's transactions.
type PoolKey = (String, String);

struct PoolEntry {
    pool: PgPool,
    last_used: Instant,
}

/// Per-principal Postgres pools, created lazily on first use and evicted
/// when the owning credential goes away or the pool idles out.
pub struct ConnectionManager {
    config: PoolConfig,
    pools: Mutex<HashMap<PoolKey, PoolEntry>>,
}

impl ConnectionManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The principal's pool for `db`, created on first use. Stamps
    /// last-used. Pool creation is lazy and unauthenticated failures are
    /// not cached: a bad URL errors here, a down server errors at acquire
    /// time and the next request retries.
    pub fn pool(&self, ctx: &RequestContext, db: &DatabaseConfig) -> AppResult<PgPool> {
        let key = (ctx.token_hash().to_string(), db.name.clone());
        let mut pools = self.pools.lock().unwrap();
        if let Some(entry) = pools.get_mut(&key) {
            entry.last_used = Instant::now();
            return Ok(entry.pool.clone());
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .connect_lazy(&db.url)?;
        tracing::debug!(database = %db.name, "created connection pool");
        pools.insert(
            key,
            PoolEntry {
                pool: pool.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(pool)
    }

    /// Lease a connection from the principal's pool. The returned handle
    /// goes back to its pool on drop, on every exit path including unwind,
    /// and request cancellation propagates into the underlying query.
    pub async fn acquire(
        &self,
        ctx: &RequestContext,
        db: &DatabaseConfig,
    ) -> AppResult<PoolConnection<Postgres>> {
        let pool = self.pool(ctx, db)?;
        pool.acquire().await.map_err(AppError::from)
    }

    /// Close every pool belonging to the given token hash. Called when a
    /// token is removed or expires and when a session ends.
    pub async fn purge_by_hash(&self, hash: &str) -> usize {
        let removed: Vec<PoolEntry> = {
            let mut pools = self.pools.lock().unwrap();
            let keys: Vec<PoolKey> = pools
                .keys()
                .filter(|(h, _)| h == hash)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| pools.remove(&k))
                .collect()
        };
        let count = removed.len();
        for entry in removed {
            entry.pool.close().await;
        }
        if count > 0 {
            tracing::debug!(count, "purged connection pools for revoked credential");
        }
        count
    }

    /// Close pools not used within `threshold`.
    pub async fn purge_idle(&self, threshold: Duration) -> usize {
        let now = Instant::now();
        let removed: Vec<PoolEntry> = {
            let mut pools = self.pools.lock().unwrap();
            let keys: Vec<PoolKey> = pools
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_used) >= threshold)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| pools.remove(&k))
                .collect()
        };
        let count = removed.len();
        for entry in removed {
            entry.pool.close().await;
        }
        count
    }

    /// Close everything. Shutdown teardown.
    pub async fn purge_all(&self) {
        let removed: Vec<PoolEntry> = {
            let mut pools = self.pools.lock().unwrap();
            pools.drain().map(|(_, e)| e).collect()
        };
        for entry in removed {
            entry.pool.close().await;
        }
    }

    pub fn entry_count(&self) -> usize {
        self.pools.lock().unwrap().len()
    }

    /// True when a pool exists for (hash, database). Test and sweeper
    /// introspection; does not stamp last-used.
    pub fn contains(&self, hash: &str, database: &str) -> bool {
        self.pools
            .lock()
            .unwrap()
            .contains_key(&(hash.to_string(), database.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_store::hash_token;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(PoolConfig::default())
    }

    fn db(name: &str) -> DatabaseConfig {
        DatabaseConfig {
            name: name.to_string(),
            url: format!("postgres://localhost/{name}"),
            available_to_users: Vec::new(),
            description: None,
        }
    }

    #[tokio::test]
    async fn pools_are_disjoint_across_token_hashes() {
        let mgr = manager();
        let main = db("main");
        let r1 = RequestContext::service(hash_token("token-one"), "10.0.0.1");
        let r2 = RequestContext::service(hash_token("token-two"), "10.0.0.2");

        mgr.pool(&r1, &main).unwrap();
        mgr.pool(&r2, &main).unwrap();
        assert_eq!(mgr.entry_count(), 2);
        assert!(mgr.contains(r1.token_hash(), "main"));
        assert!(mgr.contains(r2.token_hash(), "main"));
    }

    #[tokio::test]
    async fn repeated_lookup_reuses_the_pool() {
        let mgr = manager();
        let main = db("main");
        let ctx = RequestContext::service(hash_token("token"), "10.0.0.1");

        mgr.pool(&ctx, &main).unwrap();
        mgr.pool(&ctx, &main).unwrap();
        assert_eq!(mgr.entry_count(), 1);
    }

    #[tokio::test]
    async fn purge_by_hash_removes_only_that_principal() {
        let mgr = manager();
        let main = db("main");
        let analytics = db("analytics");
        let r1 = RequestContext::service(hash_token("token-one"), "10.0.0.1");
        let r2 = RequestContext::service(hash_token("token-two"), "10.0.0.2");

        mgr.pool(&r1, &main).unwrap();
        mgr.pool(&r1, &analytics).unwrap();
        mgr.pool(&r2, &main).unwrap();

        let purged = mgr.purge_by_hash(r1.token_hash()).await;
        assert_eq!(purged, 2);
        assert_eq!(mgr.entry_count(), 1);
        assert!(!mgr.contains(r1.token_hash(), "main"));
        assert!(mgr.contains(r2.token_hash(), "main"));
    }

    #[tokio::test]
    async fn purge_idle_with_zero_threshold_closes_everything() {
        let mgr = manager();
        let ctx = RequestContext::service(hash_token("token"), "10.0.0.1");
        mgr.pool(&ctx, &db("main")).unwrap();

        let purged = mgr.purge_idle(Duration::ZERO).await;
        assert_eq!(purged, 1);
        assert_eq!(mgr.entry_count(), 0);
    }

    #[tokio::test]
    async fn purge_idle_spares_recently_used_pools() {
        let mgr = manager();
        let ctx = RequestContext::service(hash_token("token"), "10.0.0.1");
        mgr.pool(&ctx, &db("main")).unwrap();

        let purged = mgr.purge_idle(Duration::from_secs(3600)).await;
        assert_eq!(purged, 0);
        assert_eq!(mgr.entry_count(), 1);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_and_not_cached() {
        let mgr = manager();
        let ctx = RequestContext::service(hash_token("token"), "10.0.0.1");
        let bad = DatabaseConfig {
            name: "bad".to_string(),
            url: "not-a-connection-string".to_string(),
            available_to_users: Vec::new(),
            description: None,
        };
        assert!(mgr.pool(&ctx, &bad).is_err());
        assert_eq!(mgr.entry_count(), 0);
    }
}
