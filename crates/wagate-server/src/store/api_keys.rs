use std::collections::BTreeSet;

use anyhow::{Context, Result};
use constant_time_eq::constant_time_eq;
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::crypto::{self, Sealed};
use super::db::{decode, encode, Store};

pub(crate) const API_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_keys");
/// Hex SHA-256 of the raw key → record ID.
pub(crate) const API_KEY_HASHES: TableDefinition<&str, &str> =
    TableDefinition::new("api_key_hashes");

/// A stored API key. The raw key itself is never persisted in the clear.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyRecord {
    pub id: String,
    pub key_hash: Vec<u8>,
    pub is_admin: bool,
    /// Session the key is bound to. Admin keys are not bound to a session.
    pub session: Option<String>,
    /// Cleared on revocation. Records are never physically removed.
    pub active: bool,
    pub created_at: i64,
    /// Raw key sealed with the instance key, kept only when an active app
    /// needs to hand the key back out (e.g. in a callback URL).
    pub plain_key: Option<Sealed>,
}

/// Generate a new API key in the format `wag_key_<32 hex chars>`.
pub fn generate_api_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    format!("wag_key_{}", hex::encode(bytes))
}

/// Generate a short random ID for an API key record.
pub fn generate_key_id() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Hash a key with SHA-256 for storage lookup.
pub fn hash_key(key: &str) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().to_vec()
}

impl Store {
    /// Issue a fresh key. Returns the stored record and the raw key, which is
    /// shown to the caller once.
    pub fn issue_api_key(
        &self,
        session: Option<&str>,
        is_admin: bool,
        keep_plain: bool,
    ) -> Result<(ApiKeyRecord, String)> {
        let raw_key = generate_api_key();
        let plain_key = if keep_plain {
            Some(crypto::seal(&self.key, raw_key.as_bytes()).context("seal plain key")?)
        } else {
            None
        };

        let record = ApiKeyRecord {
            id: generate_key_id(),
            key_hash: hash_key(&raw_key),
            is_admin,
            session: session.map(str::to_owned),
            active: true,
            created_at: Self::now(),
            plain_key,
        };
        self.put_api_key(&record)?;
        Ok((record, raw_key))
    }

    /// Insert or overwrite an API key record and its hash index entry.
    pub fn put_api_key(&self, record: &ApiKeyRecord) -> Result<()> {
        let bytes = encode(record).context("encode api key")?;
        let hash_hex = hex::encode(&record.key_hash);

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(API_KEYS)?;
            table.insert(record.id.as_str(), bytes.as_slice())?;
            let mut index = write_txn.open_table(API_KEY_HASHES)?;
            index.insert(hash_hex.as_str(), record.id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// List all API key records, revoked ones included.
    pub fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(API_KEYS)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            records.push(decode::<ApiKeyRecord>(v.value()).context("decode api key")?);
        }
        Ok(records)
    }

    /// Find an API key record by its SHA-256 hash via the hash index.
    pub fn find_api_key_by_hash(&self, hash: &[u8]) -> Result<Option<ApiKeyRecord>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(API_KEY_HASHES)?;
        let id = match index.get(hex::encode(hash).as_str())? {
            Some(guard) => guard.value().to_owned(),
            None => return Ok(None),
        };

        let table = read_txn.open_table(API_KEYS)?;
        let record = match table.get(id.as_str())? {
            Some(guard) => decode::<ApiKeyRecord>(guard.value()).context("decode api key")?,
            None => return Ok(None),
        };
        if !constant_time_eq(&record.key_hash, hash) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Look up the record for a raw key. Only active records are returned.
    pub fn get_active_key_record(&self, key: &str) -> Result<Option<ApiKeyRecord>> {
        Ok(self
            .find_api_key_by_hash(&hash_key(key))?
            .filter(|record| record.active))
    }

    /// Deactivate a key by ID. Returns false if no such key exists.
    pub fn deactivate_api_key(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let found = {
            let mut table = write_txn.open_table(API_KEYS)?;
            let existing: Option<ApiKeyRecord> = match table.get(id)? {
                Some(guard) => Some(decode(guard.value()).context("decode api key")?),
                None => None,
            };
            match existing {
                Some(mut record) => {
                    record.active = false;
                    record.plain_key = None;
                    let bytes = encode(&record)?;
                    table.insert(id, bytes.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(found)
    }

    /// Deactivate every key bound to `session`. Returns how many were active.
    pub fn deactivate_session_keys(&self, session: &str) -> Result<usize> {
        let ids: Vec<String> = self
            .list_api_keys()?
            .into_iter()
            .filter(|r| r.active && r.session.as_deref() == Some(session))
            .map(|r| r.id)
            .collect();
        for id in &ids {
            self.deactivate_api_key(id)?;
        }
        Ok(ids.len())
    }

    /// Sessions that still hold at least one active key.
    pub fn active_session_names(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .list_api_keys()?
            .into_iter()
            .filter(|r| r.active && !r.is_admin)
            .filter_map(|r| r.session)
            .collect())
    }

    /// Recover the raw key of an active session key kept in sealed form.
    pub fn plain_key_for_session(&self, session: &str) -> Result<Option<String>> {
        let sealed = self
            .list_api_keys()?
            .into_iter()
            .filter(|r| r.active && !r.is_admin && r.session.as_deref() == Some(session))
            .find_map(|r| r.plain_key);

        match sealed {
            Some(sealed) => {
                let bytes = crypto::open(&self.key, &sealed).context("open plain key")?;
                Ok(Some(
                    String::from_utf8(bytes).context("plain key is not valid UTF-8")?,
                ))
            }
            None => Ok(None),
        }
    }

    /// Make sure `raw_key` is a usable admin key. Returns true if a record was created.
    pub fn ensure_admin_key(&self, raw_key: &str) -> Result<bool> {
        let hash = hash_key(raw_key);
        if let Some(existing) = self.find_api_key_by_hash(&hash)? {
            if !existing.active || !existing.is_admin {
                anyhow::bail!("bootstrap admin key matches a revoked or non-admin key");
            }
            return Ok(false);
        }

        self.put_api_key(&ApiKeyRecord {
            id: generate_key_id(),
            key_hash: hash,
            is_admin: true,
            session: None,
            active: true,
            created_at: Self::now(),
            plain_key: None,
        })?;
        Ok(true)
    }
}
