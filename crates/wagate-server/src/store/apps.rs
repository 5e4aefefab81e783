use anyhow::{Context, Result};
use redb::{ReadableTable, TableDefinition};

use super::db::{decode, encode, Store};
use super::model::{AppInstance, StoredInstance};
use crate::apps::AppName;

pub(crate) const APP_INSTANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("app_instances");

/// Generate an app instance ID in the format `app_<16 hex chars>`.
pub fn generate_instance_id() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    format!("app_{}", hex::encode(bytes))
}

fn decode_instance(bytes: &[u8]) -> Result<AppInstance> {
    let stored: StoredInstance = decode(bytes).context("decode app instance")?;
    AppInstance::try_from(stored).context("decode app instance config")
}

impl Store {
    /// Insert or overwrite an app instance.
    pub fn put_app_instance(&self, instance: &AppInstance) -> Result<()> {
        let stored = StoredInstance::try_from(instance).context("encode app instance config")?;
        let bytes = encode(&stored)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(APP_INSTANCES)?;
            table.insert(instance.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_app_instance(&self, id: &str) -> Result<Option<AppInstance>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(APP_INSTANCES)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(decode_instance(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List instances of `app`, optionally restricted to one session.
    pub fn list_app_instances(
        &self,
        app: AppName,
        session: Option<&str>,
    ) -> Result<Vec<AppInstance>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(APP_INSTANCES)?;

        let mut instances = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            let instance = decode_instance(v.value())?;
            if instance.app != app {
                continue;
            }
            if session.is_some_and(|s| s != instance.session) {
                continue;
            }
            instances.push(instance);
        }
        Ok(instances)
    }

    /// Delete an app instance by ID. Returns true if it existed.
    pub fn delete_app_instance(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(APP_INSTANCES)?;
            let existed = table.remove(id)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Delete every instance of `app` attached to `session`. Returns the count removed.
    pub fn delete_app_instances_for_session(&self, app: AppName, session: &str) -> Result<usize> {
        let ids: Vec<String> = self
            .list_app_instances(app, Some(session))?
            .into_iter()
            .map(|i| i.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(APP_INSTANCES)?;
            for id in &ids {
                table.remove(id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(ids.len())
    }
}
