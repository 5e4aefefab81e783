//! Capability apps: optional per-session features switched on per deployment.
//!
//! Every app is described by a compiled-in [`AppDefinition`]. Which apps are
//! live is decided once at startup by [`activation::compute_active_set`];
//! [`runtime::CapabilityRuntime`] then hands out either the real service or a
//! [`runtime::DisabledApp`] behind the same [`AppService`] trait.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::session::{SessionError, SessionEvent};
use crate::store::AppInstance;

pub mod activation;
pub mod calls;
pub mod chatwoot;
pub mod runtime;

pub use activation::{compute_active_set, ActivationConfig, ActiveSet};
pub use runtime::{CapabilityRuntime, DisabledApp};

// ── Names and catalog ────────────────────────────────────────────────────────

/// Identifier of a capability app. Adding an app means adding a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppName {
    Calls,
    Chatwoot,
}

impl AppName {
    pub const ALL: [AppName; 2] = [AppName::Calls, AppName::Chatwoot];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calls => "calls",
            Self::Chatwoot => "chatwoot",
        }
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown app '{s}'"))
    }
}

/// Static requirements of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppDefinition {
    pub name: AppName,
    /// Keys issued while the app is active keep a sealed plaintext copy.
    pub requires_plain_key: bool,
    /// A queue consumer is registered when the app is active.
    pub requires_queue: bool,
    /// Migrations run at startup when the app is active.
    pub has_migrations: bool,
}

/// The compiled-in catalog of every known app.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppCatalog;

pub const CATALOG: AppCatalog = AppCatalog;

impl AppCatalog {
    pub const fn definition_of(&self, name: AppName) -> AppDefinition {
        match name {
            AppName::Calls => AppDefinition {
                name: AppName::Calls,
                requires_plain_key: false,
                requires_queue: false,
                has_migrations: false,
            },
            AppName::Chatwoot => AppDefinition {
                name: AppName::Chatwoot,
                requires_plain_key: true,
                requires_queue: true,
                has_migrations: true,
            },
        }
    }

    pub fn definitions(&self) -> impl Iterator<Item = AppDefinition> + '_ {
        AppName::ALL.into_iter().map(|name| self.definition_of(name))
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Raised by every operation of a disabled app.
    #[error("app '{0}' is disabled")]
    AppDisabled(AppName),
    /// An active app has no registered implementation. Fatal at startup.
    #[error("no implementation registered for active app '{0}'")]
    UnknownCapability(AppName),
    #[error("invalid {app} config: {reason}")]
    InvalidConfig { app: AppName, reason: String },
    #[error("app instance '{0}' not found")]
    NotFound(String),
    #[error("app '{0}' does not accept callbacks")]
    CallbackUnsupported(AppName),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub(crate) fn invalid(app: AppName, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            app,
            reason: reason.into(),
        }
    }
}

// ── Service surface ──────────────────────────────────────────────────────────

/// The surface shared by the real and the disabled variant of every app.
#[async_trait]
pub trait AppService: Send + Sync {
    fn name(&self) -> AppName;

    /// Instances of this app attached to `session`.
    async fn list(&self, session: &str) -> Result<Vec<AppInstance>, AppError>;

    /// Validate the instance config and save it.
    async fn upsert(&self, instance: AppInstance) -> Result<AppInstance, AppError>;

    async fn delete(&self, id: &str) -> Result<(), AppError>;

    /// Drop every instance of this app attached to `session`.
    async fn remove_by_session(&self, session: &str) -> Result<usize, AppError>;

    /// React to an inbound event of a session.
    async fn dispatch(&self, event: &SessionEvent) -> Result<(), AppError>;

    /// Inbound call from the app's remote side.
    async fn callback(&self, instance_id: &str, payload: serde_json::Value)
        -> Result<(), AppError>;
}
