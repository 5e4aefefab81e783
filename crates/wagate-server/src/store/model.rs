use serde::{Deserialize, Serialize};

use crate::apps::AppName;

/// One capability app configured for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppInstance {
    pub id: String,
    pub session: String,
    pub app: AppName,
    pub enabled: bool,
    /// App-specific settings; each app validates its own shape.
    pub config: serde_json::Value,
    pub created_at: i64,
}

/// On-disk form. bincode cannot carry a self-describing JSON value, so the
/// config travels as a string.
#[derive(Serialize, Deserialize)]
pub(crate) struct StoredInstance {
    pub id: String,
    pub session: String,
    pub app: AppName,
    pub enabled: bool,
    pub config_json: String,
    pub created_at: i64,
}

impl TryFrom<&AppInstance> for StoredInstance {
    type Error = serde_json::Error;

    fn try_from(instance: &AppInstance) -> Result<Self, Self::Error> {
        Ok(Self {
            id: instance.id.clone(),
            session: instance.session.clone(),
            app: instance.app,
            enabled: instance.enabled,
            config_json: serde_json::to_string(&instance.config)?,
            created_at: instance.created_at,
        })
    }
}

impl TryFrom<StoredInstance> for AppInstance {
    type Error = serde_json::Error;

    fn try_from(stored: StoredInstance) -> Result<Self, Self::Error> {
        Ok(Self {
            config: serde_json::from_str(&stored.config_json)?,
            id: stored.id,
            session: stored.session,
            app: stored.app,
            enabled: stored.enabled,
            created_at: stored.created_at,
        })
    }
}
