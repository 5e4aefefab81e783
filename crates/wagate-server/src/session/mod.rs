//! Boundary with the protocol engine.
//!
//! An [`Engine`] creates [`Session`]s; the gateway only ever talks to the
//! trait. Outbound actions that make the account look active go through
//! [`run_as_activity`] so presence is refreshed first.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

pub mod loopback;
pub mod manager;

pub use loopback::{LoopbackAction, LoopbackEngine, LoopbackSession};
pub use manager::SessionManager;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session could not confirm its online presence.
    #[error("session '{session}' could not refresh presence: {reason}")]
    PresenceRefreshFailed { session: String, reason: String },
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session '{0}' already exists")]
    AlreadyExists(String),
    #[error("invalid session name '{0}'")]
    InvalidName(String),
    #[error("engine error: {0}")]
    Engine(String),
}

/// Inbound event raised by a running session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    pub session: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    MessageReceived { id: String, from: String, body: String },
    CallReceived { id: String, from: String },
}

/// Where sessions publish their inbound events.
pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

/// A live messaging account.
#[async_trait]
pub trait Session: Send + Sync {
    fn name(&self) -> &str;

    /// Mark the account as online. Idempotent.
    async fn maintain_presence_online(&self) -> Result<(), SessionError>;

    /// Returns the engine's ID of the sent message.
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, SessionError>;

    async fn send_seen(&self, chat_id: &str) -> Result<(), SessionError>;

    async fn start_typing(&self, chat_id: &str) -> Result<(), SessionError>;

    async fn stop_typing(&self, chat_id: &str) -> Result<(), SessionError>;

    async fn react(&self, message_id: &str, reaction: &str) -> Result<(), SessionError>;

    async fn reject_call(&self, from: &str, call_id: &str) -> Result<(), SessionError>;

    async fn stop(&self) -> Result<(), SessionError>;
}

/// Creates sessions for one protocol implementation.
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn start(&self, name: &str, events: EventSink) -> Result<Arc<dyn Session>, SessionError>;
}

/// Run `op` as an activity of `session`.
///
/// Presence is refreshed to completion before `op` starts. If the refresh
/// fails its error is returned and `op` is never called; otherwise `op`'s
/// result is returned as is.
pub async fn run_as_activity<S, F, Fut, T, E>(session: &S, op: F) -> Result<T, E>
where
    S: Session + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<SessionError>,
{
    session.maintain_presence_online().await?;
    debug!(session = %session.name(), "presence refreshed, running activity");
    op().await
}
