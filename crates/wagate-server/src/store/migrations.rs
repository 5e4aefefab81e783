use anyhow::Result;
use redb::{ReadableTable, TableDefinition};

use super::db::Store;

/// Migration ID → Unix timestamp it was applied at.
pub(crate) const MIGRATIONS: TableDefinition<&str, i64> = TableDefinition::new("migrations");

impl Store {
    pub fn is_migration_applied(&self, id: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MIGRATIONS)?;
        Ok(table.get(id)?.is_some())
    }

    pub fn mark_migration_applied(&self, id: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(MIGRATIONS)?;
            table.insert(id, Self::now())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// IDs of every applied migration, in key order.
    pub fn applied_migrations(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MIGRATIONS)?;
        let mut ids = Vec::new();
        for item in table.iter()? {
            let (k, _v) = item?;
            ids.push(k.value().to_owned());
        }
        Ok(ids)
    }
}
