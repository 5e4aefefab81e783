//! Calls app: rejects incoming calls and optionally answers with a text.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::runtime::{AppContext, AppRegistration};
use super::{AppError, AppName, AppService};
use crate::session::{run_as_activity, EventPayload, SessionEvent, SessionManager};
use crate::store::{AppInstance, Store};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallsConfig {
    #[serde(default = "default_reject")]
    pub reject: bool,
    /// Sent to the caller after the call is rejected.
    #[serde(default)]
    pub message: Option<String>,
}

fn default_reject() -> bool {
    true
}

impl CallsConfig {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, AppError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| AppError::invalid(AppName::Calls, e.to_string()))?;
        if config.message.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(AppError::invalid(AppName::Calls, "message must not be blank"));
        }
        Ok(config)
    }
}

pub fn registration(ctx: AppContext) -> AppRegistration {
    AppRegistration {
        service: Arc::new(CallsService::new(ctx.store, ctx.sessions)),
        consumer: None,
        migrations: Vec::new(),
    }
}

pub struct CallsService {
    store: Store,
    sessions: SessionManager,
}

impl CallsService {
    pub fn new(store: Store, sessions: SessionManager) -> Self {
        Self { store, sessions }
    }

    async fn on_call(&self, session_name: &str, call_id: &str, from: &str) -> Result<(), AppError> {
        let config = self
            .store
            .list_app_instances(AppName::Calls, Some(session_name))?
            .into_iter()
            .filter(|i| i.enabled)
            .map(|i| CallsConfig::from_value(&i.config))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .find(|c| c.reject);
        let Some(config) = config else {
            return Ok(());
        };

        let session = self.sessions.get(session_name).await?;
        session.reject_call(from, call_id).await?;
        info!(session = %session_name, call = %call_id, "incoming call rejected");

        if let Some(message) = config.message {
            run_as_activity(session.as_ref(), || session.send_text(from, &message)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AppService for CallsService {
    fn name(&self) -> AppName {
        AppName::Calls
    }

    async fn list(&self, session: &str) -> Result<Vec<AppInstance>, AppError> {
        Ok(self.store.list_app_instances(AppName::Calls, Some(session))?)
    }

    async fn upsert(&self, instance: AppInstance) -> Result<AppInstance, AppError> {
        if instance.app != AppName::Calls {
            return Err(AppError::invalid(AppName::Calls, format!("instance is a {} app", instance.app)));
        }
        CallsConfig::from_value(&instance.config)?;
        self.store.put_app_instance(&instance)?;
        Ok(instance)
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        match self.store.get_app_instance(id)? {
            Some(instance) if instance.app == AppName::Calls => {
                self.store.delete_app_instance(id)?;
                Ok(())
            }
            _ => Err(AppError::NotFound(id.to_owned())),
        }
    }

    async fn remove_by_session(&self, session: &str) -> Result<usize, AppError> {
        Ok(self
            .store
            .delete_app_instances_for_session(AppName::Calls, session)?)
    }

    async fn dispatch(&self, event: &SessionEvent) -> Result<(), AppError> {
        match &event.payload {
            EventPayload::CallReceived { id, from } => self.on_call(&event.session, id, from).await,
            EventPayload::MessageReceived { .. } => Ok(()),
        }
    }

    async fn callback(
        &self,
        _instance_id: &str,
        _payload: serde_json::Value,
    ) -> Result<(), AppError> {
        Err(AppError::CallbackUnsupported(AppName::Calls))
    }
}
