//! Chatwoot helpdesk app.
//!
//! Inbound messages of a session are queued and forwarded to a Chatwoot
//! inbox by a background consumer. Agent replies arrive on the gateway's
//! webhook route and are sent back through the session as activities. The
//! webhook URL embeds the session's API key, so this app needs keys to be
//! kept in recoverable form.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::TableDefinition;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::runtime::{AppContext, AppRegistration};
use super::{AppError, AppName, AppService};
use crate::migrations::Migration;
use crate::queue::{Job, JobHandler, JobQueue};
use crate::session::{run_as_activity, EventPayload, SessionEvent, SessionManager};
use crate::store::{AppInstance, Store};

pub mod locales;

pub use locales::{Locale, LOCALES};

/// `{instance_id}/{message_id}` → Chatwoot message ID. Created by migration.
const CHATWOOT_MESSAGES: TableDefinition<&str, u64> = TableDefinition::new("chatwoot_messages");

pub const MIGRATIONS: &[(&str, fn(&Store) -> Result<()>)] =
    &[("chatwoot_0001_messages", create_message_table)];

fn create_message_table(store: &Store) -> Result<()> {
    let write_txn = store.db.begin_write()?;
    write_txn.open_table(CHATWOOT_MESSAGES)?;
    write_txn.commit()?;
    Ok(())
}

fn message_key(instance_id: &str, message_id: &str) -> String {
    format!("{instance_id}/{message_id}")
}

impl Store {
    pub fn put_chatwoot_message(
        &self,
        instance_id: &str,
        message_id: &str,
        chatwoot_id: u64,
    ) -> Result<()> {
        let key = message_key(instance_id, message_id);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHATWOOT_MESSAGES)?;
            table.insert(key.as_str(), chatwoot_id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn chatwoot_message_for(&self, instance_id: &str, message_id: &str) -> Result<Option<u64>> {
        let key = message_key(instance_id, message_id);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHATWOOT_MESSAGES)?;
        Ok(table.get(key.as_str())?.map(|g| g.value()))
    }
}

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatwootConfig {
    pub url: String,
    pub account_id: u64,
    pub account_token: String,
    pub inbox_id: u64,
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Set by the gateway on save; paste into the Chatwoot inbox settings.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_locale() -> String {
    locales::DEFAULT_LOCALE.to_owned()
}

impl ChatwootConfig {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, AppError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| AppError::invalid(AppName::Chatwoot, e.to_string()))?;

        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(AppError::invalid(AppName::Chatwoot, "url must be http(s)"));
        }
        if config.account_token.trim().is_empty() {
            return Err(AppError::invalid(AppName::Chatwoot, "account_token is required"));
        }
        if locales::find(&config.locale).is_none() {
            return Err(AppError::invalid(
                AppName::Chatwoot,
                format!("unsupported locale '{}'", config.locale),
            ));
        }
        Ok(config)
    }

    fn messages_endpoint(&self) -> String {
        format!(
            "{}/api/v1/accounts/{}/inboxes/{}/messages",
            self.url.trim_end_matches('/'),
            self.account_id,
            self.inbox_id
        )
    }
}

// ── Registration ─────────────────────────────────────────────────────────────

const HELPDESK_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).build()
}

pub fn registration(ctx: AppContext) -> AppRegistration {
    let client = http_client(HELPDESK_TIMEOUT).unwrap_or_else(|e| {
        warn!(error = %e, "chatwoot http client unavailable, falling back to defaults without a timeout");
        reqwest::Client::new()
    });

    AppRegistration {
        service: Arc::new(ChatwootService {
            store: ctx.store.clone(),
            sessions: ctx.sessions,
            queue: ctx.queue,
            public_url: ctx.public_url,
        }),
        consumer: Some(Arc::new(ChatwootConsumer {
            store: ctx.store,
            client,
        })),
        migrations: MIGRATIONS
            .iter()
            .map(|&(id, apply)| Migration {
                id,
                app: AppName::Chatwoot,
                apply,
            })
            .collect(),
    }
}

// ── Service ──────────────────────────────────────────────────────────────────

pub struct ChatwootService {
    store: Store,
    sessions: SessionManager,
    queue: JobQueue,
    public_url: String,
}

impl ChatwootService {
    fn instance(&self, id: &str) -> Result<AppInstance, AppError> {
        match self.store.get_app_instance(id)? {
            Some(instance) if instance.app == AppName::Chatwoot => Ok(instance),
            _ => Err(AppError::NotFound(id.to_owned())),
        }
    }

    fn webhook_url(&self, instance: &AppInstance) -> Result<String, AppError> {
        let key = self.store.plain_key_for_session(&instance.session)?.ok_or_else(|| {
            AppError::invalid(
                AppName::Chatwoot,
                format!(
                    "session '{}' has no recoverable API key; issue a new session key",
                    instance.session
                ),
            )
        })?;
        Ok(format!(
            "{}/webhooks/chatwoot/{}?key={}",
            self.public_url.trim_end_matches('/'),
            instance.id,
            key
        ))
    }
}

#[async_trait]
impl AppService for ChatwootService {
    fn name(&self) -> AppName {
        AppName::Chatwoot
    }

    async fn list(&self, session: &str) -> Result<Vec<AppInstance>, AppError> {
        Ok(self.store.list_app_instances(AppName::Chatwoot, Some(session))?)
    }

    async fn upsert(&self, mut instance: AppInstance) -> Result<AppInstance, AppError> {
        if instance.app != AppName::Chatwoot {
            return Err(AppError::invalid(
                AppName::Chatwoot,
                format!("instance is a {} app", instance.app),
            ));
        }
        let mut config = ChatwootConfig::from_value(&instance.config)?;
        config.webhook_url = Some(self.webhook_url(&instance)?);
        instance.config = serde_json::to_value(&config).context("encode chatwoot config")?;

        self.store.put_app_instance(&instance)?;
        Ok(instance)
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.instance(id)?;
        self.store.delete_app_instance(id)?;
        Ok(())
    }

    async fn remove_by_session(&self, session: &str) -> Result<usize, AppError> {
        Ok(self
            .store
            .delete_app_instances_for_session(AppName::Chatwoot, session)?)
    }

    async fn dispatch(&self, event: &SessionEvent) -> Result<(), AppError> {
        let instances = self
            .store
            .list_app_instances(AppName::Chatwoot, Some(&event.session))?;
        for instance in instances.into_iter().filter(|i| i.enabled) {
            self.queue
                .enqueue(Job {
                    app: AppName::Chatwoot,
                    instance_id: instance.id,
                    event: event.clone(),
                })
                .map_err(|e| AppError::Internal(e.into()))?;
        }
        Ok(())
    }

    async fn callback(&self, instance_id: &str, payload: serde_json::Value) -> Result<(), AppError> {
        let instance = self.instance(instance_id)?;
        if !instance.enabled {
            debug!(instance = %instance_id, "callback for disabled instance ignored");
            return Ok(());
        }

        let reply: AgentReply = serde_json::from_value(payload)
            .map_err(|e| AppError::invalid(AppName::Chatwoot, format!("callback payload: {e}")))?;
        let Some((chat_id, content)) = reply.outgoing() else {
            return Ok(());
        };

        let session = self.sessions.get(&instance.session).await?;
        run_as_activity(session.as_ref(), || session.send_text(&chat_id, content)).await?;
        info!(session = %instance.session, instance = %instance_id, "agent reply delivered");
        Ok(())
    }
}

/// The parts of a Chatwoot `message_created` webhook the gateway uses.
#[derive(Debug, Deserialize)]
struct AgentReply {
    message_type: String,
    #[serde(default)]
    private: bool,
    content: Option<String>,
    conversation: Option<Conversation>,
}

#[derive(Debug, Deserialize)]
struct Conversation {
    meta: ConversationMeta,
}

#[derive(Debug, Deserialize)]
struct ConversationMeta {
    sender: Sender,
}

#[derive(Debug, Deserialize)]
struct Sender {
    phone_number: Option<String>,
}

impl AgentReply {
    /// Chat ID and text of a public agent reply; `None` for anything else.
    fn outgoing(&self) -> Option<(String, &str)> {
        if self.message_type != "outgoing" || self.private {
            return None;
        }
        let content = self.content.as_deref().filter(|c| !c.trim().is_empty())?;
        let phone = self
            .conversation
            .as_ref()?
            .meta
            .sender
            .phone_number
            .as_deref()?;
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return None;
        }
        Some((format!("{digits}@c.us"), content))
    }
}

// ── Queue consumer ───────────────────────────────────────────────────────────

pub struct ChatwootConsumer {
    store: Store,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CreatedMessage {
    id: u64,
}

#[async_trait]
impl JobHandler for ChatwootConsumer {
    async fn handle(&self, job: &Job) -> Result<()> {
        let Some(instance) = self.store.get_app_instance(&job.instance_id)? else {
            debug!(instance = %job.instance_id, "instance gone, dropping job");
            return Ok(());
        };
        let config = ChatwootConfig::from_value(&instance.config)?;

        let (message_id, body) = match &job.event.payload {
            EventPayload::MessageReceived { id, from, body } => (
                id.as_str(),
                json!({
                    "source_id": from,
                    "source_message_id": id,
                    "content": body,
                    "message_type": "incoming",
                }),
            ),
            EventPayload::CallReceived { id, from } => {
                let note = locales::find(&config.locale)
                    .map(|l| l.missed_call)
                    .unwrap_or("Missed call");
                (
                    id.as_str(),
                    json!({
                        "source_id": from,
                        "source_message_id": id,
                        "content": note,
                        "message_type": "activity",
                    }),
                )
            }
        };

        let resp = self
            .client
            .post(config.messages_endpoint())
            .header("api_access_token", &config.account_token)
            .json(&body)
            .send()
            .await
            .context("chatwoot request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("chatwoot returned {status}: {text}");
        }

        let created: CreatedMessage = resp.json().await.context("parse chatwoot response")?;
        self.store
            .put_chatwoot_message(&job.instance_id, message_id, created.id)?;
        debug!(message = %message_id, chatwoot_id = created.id, "message forwarded to chatwoot");
        Ok(())
    }
}
