//! Named PostgreSQL connection pools with configured lifecycle and a
//! background health prober.

use crate::error::{CoreError, CoreResult};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// TLS negotiation mode, mirroring Postgres's `sslmode` connection parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Allow,
    Require,
    VerifyCa,
    VerifyFull,
}

fn to_pg_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

/// Per-pool configuration. `validate` rejects empty identity fields before
/// a pool is ever opened.
#[derive(Debug, Clone)]
pub struct DbPoolConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: SslMode,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_root_cert: Option<String>,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Duration,
    pub conn_max_idle_time: Duration,
    pub health_check_interval: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            ssl_mode: SslMode::Disable,
            ssl_cert: None,
            ssl_key: None,
            ssl_root_cert: None,
            max_open_conns: 10,
            max_idle_conns: 2,
            conn_max_lifetime: Duration::from_secs(30 * 60),
            conn_max_idle_time: Duration::from_secs(10 * 60),
            health_check_interval: Duration::from_secs(30),
            max_retries: 3,
            retry_interval: Duration::from_secs(2),
        }
    }
}

/// Raised by [`DbPoolConfig::validate`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pool config missing host")]
    MissingHost,
    #[error("pool config missing user")]
    MissingUser,
    #[error("pool config missing database name")]
    MissingDatabase,
}

impl DbPoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::MissingUser);
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::MissingDatabase);
        }
        Ok(())
    }

    fn connect_options(&self) -> PgConnectOptions {
        let mut opts = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(to_pg_ssl_mode(self.ssl_mode));
        if let Some(root) = &self.ssl_root_cert {
            opts = opts.ssl_root_cert(root);
        }
        opts
    }
}

/// Liveness snapshot updated by the background health prober. Probing
/// never mutates the pool itself — callers decide how to react.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub last_check_millis: u64,
    pub is_healthy: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl HealthRecord {
    fn healthy(now_millis: u64) -> Self {
        Self { last_check_millis: now_millis, is_healthy: true, error_count: 0, last_error: None }
    }
}

/// Point-in-time pool statistics. `wait_count`/`wait_duration` are not
/// exposed by the underlying driver and are always zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub max_open: u32,
    pub open: u32,
    pub in_use: u32,
    pub idle: u32,
}

const PING_DEADLINE: Duration = Duration::from_secs(5);

/// Owns named pools, their configuration, and liveness records.
pub struct DbManager {
    configs: RwLock<HashMap<String, DbPoolConfig>>,
    pools: RwLock<HashMap<String, PgPool>>,
    connect_locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    health: RwLock<HashMap<String, HealthRecord>>,
    clock: Arc<dyn crate::clock::Clock>,
}

impl Default for DbManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DbManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(crate::clock::MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn crate::clock::Clock>) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            connect_locks: std::sync::Mutex::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn add_config(&self, name: &str, config: DbPoolConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.configs.write().unwrap().insert(name.to_string(), config);
        Ok(())
    }

    /// Returns the live pool for `name`, opening it if necessary. Concurrent
    /// callers for the *same* name serialize on a per-name lock; different
    /// names proceed independently.
    pub async fn connect(&self, name: &str) -> CoreResult<PgPool> {
        if let Some(pool) = self.pools.read().unwrap().get(name) {
            return Ok(pool.clone());
        }

        let lock = {
            let mut locks = self.connect_locks.lock().unwrap();
            locks.entry(name.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        let _guard = lock.lock().await;

        if let Some(pool) = self.pools.read().unwrap().get(name) {
            return Ok(pool.clone());
        }

        let config = self
            .configs
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownPool { name: name.to_string() })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns)
            .max_lifetime(config.conn_max_lifetime)
            .idle_timeout(config.conn_max_idle_time)
            .connect_with(config.connect_options())
            .await
            .map_err(|e| CoreError::DbConnect { name: name.to_string(), reason: e.to_string() })?;

        if let Err(e) = ping(&pool).await {
            pool.close().await;
            return Err(CoreError::DbConnect { name: name.to_string(), reason: e.to_string() });
        }

        self.pools.write().unwrap().insert(name.to_string(), pool.clone());
        self.health.write().unwrap().insert(name.to_string(), HealthRecord::healthy(self.clock.now_millis()));
        tracing::info!(event = "db_pool_connected", pool = name);
        Ok(pool)
    }

    pub fn get(&self, name: &str) -> Option<PgPool> {
        self.pools.read().unwrap().get(name).cloned()
    }

    pub async fn close(&self, name: &str) {
        let pool = self.pools.write().unwrap().remove(name);
        if let Some(pool) = pool {
            pool.close().await;
        }
        self.health.write().unwrap().remove(name);
    }

    pub async fn close_all(&self) {
        let names: Vec<String> = self.pools.read().unwrap().keys().cloned().collect();
        for name in names {
            self.close(&name).await;
        }
    }

    pub fn stats(&self) -> HashMap<String, PoolStats> {
        let configs = self.configs.read().unwrap();
        self.pools
            .read()
            .unwrap()
            .iter()
            .map(|(name, pool)| {
                let max_open = configs.get(name).map(|c| c.max_open_conns).unwrap_or(0);
                let open = pool.size();
                let idle = pool.num_idle() as u32;
                (
                    name.clone(),
                    PoolStats { max_open, open, in_use: open.saturating_sub(idle), idle },
                )
            })
            .collect()
    }

    pub fn health(&self) -> HashMap<String, HealthRecord> {
        self.health.read().unwrap().clone()
    }

    /// Probes every registered pool once; does not mutate the pool on failure.
    pub async fn probe_once(&self) {
        let pools: Vec<(String, PgPool)> =
            self.pools.read().unwrap().iter().map(|(n, p)| (n.clone(), p.clone())).collect();
        for (name, pool) in pools {
            let now = self.clock.now_millis();
            match ping(&pool).await {
                Ok(()) => {
                    self.health.write().unwrap().insert(name, HealthRecord::healthy(now));
                }
                Err(e) => {
                    let mut health = self.health.write().unwrap();
                    let entry = health.entry(name.clone()).or_insert_with(|| HealthRecord::healthy(now));
                    entry.last_check_millis = now;
                    entry.is_healthy = false;
                    entry.error_count += 1;
                    entry.last_error = Some(e.to_string());
                    tracing::warn!(event = "db_pool_unhealthy", pool = %name, error = %e);
                }
            }
        }
    }
}

async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    tokio::time::timeout(PING_DEADLINE, sqlx::query("SELECT 1").execute(pool))
        .await
        .map_err(|_| sqlx::Error::PoolTimedOut)??;
    Ok(())
}

/// Spawns the background health prober described in the manager's
/// concurrency discipline. Returns a handle that keeps running until dropped/aborted.
pub fn spawn_health_prober(manager: Arc<DbManager>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            manager.probe_once().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_missing_fields() {
        let cfg = DbPoolConfig::default();
        assert_eq!(cfg.validate(), Err(ConfigError::MissingHost));

        let cfg = DbPoolConfig { host: "localhost".into(), ..DbPoolConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::MissingUser));

        let cfg = DbPoolConfig { host: "localhost".into(), user: "app".into(), ..DbPoolConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::MissingDatabase));
    }

    #[test]
    fn validate_accepts_complete_config() {
        let cfg = DbPoolConfig {
            host: "localhost".into(),
            user: "app".into(),
            database: "campus".into(),
            ..DbPoolConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[tokio::test]
    async fn connect_to_unknown_name_fails() {
        let manager = DbManager::new();
        let err = manager.connect("ghost").await.unwrap_err();
        assert!(err.is_db());
    }

    #[test]
    fn add_config_rejects_invalid() {
        let manager = DbManager::new();
        let err = manager.add_config("primary", DbPoolConfig::default()).unwrap_err();
        assert_eq!(err, ConfigError::MissingHost);
    }
}
