use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ── Action constants ─────────────────────────────────────────────────────────

pub const ACTION_SESSION_CREATE: &str = "session.create";
pub const ACTION_SESSION_DELETE: &str = "session.delete";
pub const ACTION_KEY_CREATE: &str = "key.create";
pub const ACTION_KEY_REVOKE: &str = "key.revoke";
pub const ACTION_APP_UPSERT: &str = "app.upsert";
pub const ACTION_APP_DELETE: &str = "app.delete";
pub const ACTION_MIGRATION_APPLY: &str = "migration.apply";

// ── AuditEvent ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub timestamp: i64,
    pub action: String,
    /// Session name, key ID or app instance ID the action touched.
    pub subject: Option<String>,
    pub source_ip: String,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(
        action: &str,
        subject: Option<String>,
        source_ip: String,
        success: bool,
        detail: Option<String>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        Self {
            id: 0, // allocated by store
            timestamp,
            action: action.to_owned(),
            subject,
            source_ip,
            success,
            detail,
        }
    }

    /// Event raised by the daemon itself rather than an HTTP caller.
    pub fn internal(action: &str, subject: Option<String>, detail: Option<String>) -> Self {
        Self::new(action, subject, "internal".to_owned(), true, detail)
    }
}

// ── AuditQuery ───────────────────────────────────────────────────────────────

/// Filter for [`Store::list_audit`](super::Store::list_audit). Events come
/// back newest first.
pub struct AuditQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action: Option<String>,
    pub subject: Option<String>,
    pub limit: usize,
}

impl AuditQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            since: None,
            until: None,
            action: None,
            subject: None,
            limit,
        }
    }

    /// Every filter except `since` and `limit`, which the store applies
    /// while scanning.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.until.map_or(true, |until| event.timestamp <= until)
            && self.action.as_deref().map_or(true, |a| event.action == a)
            && self
                .subject
                .as_deref()
                .map_or(true, |s| event.subject.as_deref() == Some(s))
    }
}
