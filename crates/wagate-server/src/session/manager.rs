use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::info;

use super::{Engine, EventSink, Session, SessionError, SessionEvent};

const MAX_SESSION_NAME_LEN: usize = 64;

/// Registry of running sessions.
///
/// Every session publishes into one shared event channel; the receiving end
/// is handed out by [`SessionManager::new`] and drained by the app runtime.
#[derive(Clone)]
pub struct SessionManager {
    engine: Arc<dyn Engine>,
    sessions: Arc<RwLock<HashMap<String, Arc<dyn Session>>>>,
    events: EventSink,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn Engine>) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            engine,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
        };
        (manager, rx)
    }

    pub fn engine_kind(&self) -> &'static str {
        self.engine.kind()
    }

    pub async fn start(&self, name: &str) -> Result<Arc<dyn Session>, SessionError> {
        validate_session_name(name)?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(name) {
            return Err(SessionError::AlreadyExists(name.to_owned()));
        }
        let session = self.engine.start(name, self.events.clone()).await?;
        sessions.insert(name.to_owned(), session.clone());
        info!(session = %name, engine = self.engine.kind(), "session started");
        Ok(session)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(name.to_owned()))
    }

    /// Names of running sessions, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn stop(&self, name: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(name)
            .ok_or_else(|| SessionError::NotFound(name.to_owned()))?;
        session.stop().await?;
        info!(session = %name, "session stopped");
        Ok(())
    }
}

/// Session names are path segments and key scopes: 1–64 chars of
/// `[A-Za-z0-9_-]`.
pub fn validate_session_name(name: &str) -> Result<(), SessionError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SESSION_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidName(name.to_owned()))
    }
}
