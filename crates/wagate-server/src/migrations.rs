//! One-time schema migrations owned by capability apps.

use anyhow::{Context, Result};
use tracing::info;

use crate::apps::AppName;
use crate::store::audit::{AuditEvent, ACTION_MIGRATION_APPLY};
use crate::store::Store;

/// A named, idempotent change to the store. IDs are global and never reused.
pub struct Migration {
    pub id: &'static str,
    pub app: AppName,
    pub apply: fn(&Store) -> Result<()>,
}

pub struct MigrationRunner {
    store: Store,
}

impl MigrationRunner {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Apply every migration not yet recorded as applied, in the given order.
    /// Returns the IDs applied by this call.
    pub fn run(&self, migrations: &[Migration]) -> Result<Vec<&'static str>> {
        let mut applied = Vec::new();
        for migration in migrations {
            if self.store.is_migration_applied(migration.id)? {
                continue;
            }
            (migration.apply)(&self.store)
                .with_context(|| format!("apply migration {}", migration.id))?;
            self.store.mark_migration_applied(migration.id)?;
            self.store.record_audit(AuditEvent::internal(
                ACTION_MIGRATION_APPLY,
                Some(migration.id.to_owned()),
                Some(format!("app={}", migration.app)),
            ))?;
            info!(app = %migration.app, migration = migration.id, "migration applied");
            applied.push(migration.id);
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::db::tests::make_store;

    static APPLIED: AtomicUsize = AtomicUsize::new(0);

    fn count(_: &Store) -> Result<()> {
        APPLIED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn broken(_: &Store) -> Result<()> {
        anyhow::bail!("disk full")
    }

    #[test]
    fn migrations_apply_once() {
        let (store, _dir) = make_store();
        let runner = MigrationRunner::new(store.clone());
        let migrations = [Migration {
            id: "test_0001_count",
            app: AppName::Calls,
            apply: count,
        }];

        assert_eq!(runner.run(&migrations).unwrap(), vec!["test_0001_count"]);
        assert!(runner.run(&migrations).unwrap().is_empty());
        assert_eq!(APPLIED.load(Ordering::SeqCst), 1);
        assert_eq!(store.applied_migrations().unwrap(), vec!["test_0001_count".to_string()]);
    }

    #[test]
    fn failed_migration_is_not_recorded() {
        let (store, _dir) = make_store();
        let runner = MigrationRunner::new(store.clone());
        let migrations = [Migration {
            id: "test_0002_broken",
            app: AppName::Chatwoot,
            apply: broken,
        }];

        assert!(runner.run(&migrations).is_err());
        assert!(!store.is_migration_applied("test_0002_broken").unwrap());
    }
}
