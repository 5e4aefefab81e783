use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time;
use tracing::{info, warn};

use super::audit::{AuditEvent, AuditQuery};
use super::crypto::EncryptionKey;

const AUDIT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_log");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const AUDIT_SEQ_KEY: &str = "audit_seq";

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
    pub(crate) key: Arc<EncryptionKey>,
}

impl Store {
    /// Open (or create) the database at `path`. `key` seals plaintext API keys.
    pub fn open(path: &Path, key: EncryptionKey) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Core tables only; app-owned tables are created by their migrations.
        let write_txn = db.begin_write()?;
        write_txn.open_table(AUDIT_LOG)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.open_table(super::api_keys::API_KEYS)?;
        write_txn.open_table(super::api_keys::API_KEY_HASHES)?;
        write_txn.open_table(super::apps::APP_INSTANCES)?;
        write_txn.open_table(super::migrations::MIGRATIONS)?;
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            key: Arc::new(key),
        })
    }

    pub(crate) fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    // ── Audit log ─────────────────────────────────────────────────────────

    /// Append an audit event under the next sequence number.
    pub fn record_audit(&self, mut event: AuditEvent) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut counters = txn.open_table(COUNTERS)?;
            event.id = counters.get(AUDIT_SEQ_KEY)?.map_or(0, |g| g.value()) + 1;
            counters.insert(AUDIT_SEQ_KEY, event.id)?;

            let bytes = encode(&event).context("encode audit event")?;
            txn.open_table(AUDIT_LOG)?
                .insert(event.id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(AUDIT_LOG)?;

        let mut events = Vec::new();
        for entry in table.iter()?.rev() {
            let event: AuditEvent = decode(entry?.1.value()).context("decode audit event")?;
            // Sequence order is time order, so nothing older can match.
            if query.since.is_some_and(|since| event.timestamp < since) {
                break;
            }
            if query.matches(&event) {
                events.push(event);
                if events.len() >= query.limit {
                    break;
                }
            }
        }
        Ok(events)
    }

    /// Drop events older than `retention_seconds` in one write transaction.
    pub fn prune_audit(&self, retention_seconds: i64) -> Result<usize> {
        let cutoff = Self::now() - retention_seconds;

        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(AUDIT_LOG)?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (id, bytes) = entry?;
                let event: AuditEvent = decode(bytes.value()).context("decode audit event")?;
                if event.timestamp >= cutoff {
                    break;
                }
                stale.push(id.value());
            }
            for id in &stale {
                table.remove(*id)?;
            }
            stale.len()
        };
        txn.commit()?;

        if removed > 0 {
            info!(removed, "pruned audit log");
        }
        Ok(removed)
    }

    /// Prune the audit log every `interval`, starting one interval from now.
    pub fn spawn_audit_sweep(self, interval: Duration, retention_seconds: i64) {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.prune_audit(retention_seconds) {
                    warn!(error = %e, "audit sweep failed");
                }
            }
        });
    }
}

/// Encode a record for storage.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).context("bincode encode")
}

/// Decode a record written by [`encode`].
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(value)
}
