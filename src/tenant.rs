use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::Config;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Settings each tenant's background tasks run with.
#[derive(Debug, Clone, Copy)]
struct Housekeeping {
    compact_threshold: u64,
    retention: Duration,
    sweep_interval: Duration,
}

/// Per-tenant engines, keyed by the database name of the connection.
/// Each tenant owns an Engine, a WAL file, a sweeper and a compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    housekeeping: Housekeeping,
}

/// Keep only characters safe in a file name.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl TenantManager {
    pub fn new(config: &Config) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir: config.data_dir.clone(),
            housekeeping: Housekeeping {
                compact_threshold: config.compact_threshold,
                retention: config.reservation_retention,
                sweep_interval: config.sweep_interval.max(Duration::from_secs(1)),
            },
        }
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }

    /// Get or lazily create the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }
        let safe_name = sanitize(tenant);
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
        }

        // Two connections may race to open the same tenant; only one engine
        // may own its WAL.
        let entry = self.engines.entry(tenant.to_string());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
        tracing::info!(tenant = %safe_name, "tenant loaded");

        let hk = self.housekeeping;
        tokio::spawn(reaper::run_sweeper(engine.clone(), hk.retention, hk.sweep_interval));
        tokio::spawn(reaper::run_compactor(engine.clone(), hk.compact_threshold));

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_manager(name: &str) -> (TenantManager, PathBuf) {
        let dir = std::env::temp_dir().join("slotd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let config = Config {
            data_dir: dir.clone(),
            ..Config::default()
        };
        (TenantManager::new(&config), dir)
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let (tm, _) = test_manager("isolation");
        let a = tm.get_or_create("tenant_a").unwrap();
        let b = tm.get_or_create("tenant_b").unwrap();

        let id = Ulid::new();
        let user = User {
            id,
            username: "grace".into(),
            default_schedule_id: None,
        };
        a.create_user(user.clone()).await.unwrap();

        assert!(a.get_user(id).is_ok());
        assert!(b.get_user(id).is_err());
        // Same username is free in the other tenant.
        b.create_user(user).await.unwrap();
        assert_eq!(tm.tenant_count(), 2);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let (tm, dir) = test_manager("lazy");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let (tm, _) = test_manager("same_engine");
        let first = tm.get_or_create("foo").unwrap();
        let second = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let (tm, dir) = test_manager("sanitize");
        tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let (tm, _) = test_manager("name_too_long");
        let err = tm
            .get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let (tm, _) = test_manager("count_limit");
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn tenant_survives_reload() {
        let (tm, dir) = test_manager("reload");
        let id = Ulid::new();
        tm.get_or_create("acme")
            .unwrap()
            .create_user(User {
                id,
                username: "linus".into(),
                default_schedule_id: None,
            })
            .await
            .unwrap();

        let config = Config {
            data_dir: dir,
            ..Config::default()
        };
        let reloaded = TenantManager::new(&config);
        assert_eq!(reloaded.get_or_create("acme").unwrap().get_user(id).unwrap().username, "linus");
    }
}
