//! In-memory engine: sessions record what they were asked to do and never
//! touch a network. Used for local runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{Engine, EventPayload, EventSink, Session, SessionError, SessionEvent};

/// One recorded session action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackAction {
    PresenceOnline,
    SendText { chat_id: String, text: String },
    SendSeen { chat_id: String },
    StartTyping { chat_id: String },
    StopTyping { chat_id: String },
    React { message_id: String, reaction: String },
    RejectCall { from: String, call_id: String },
}

#[derive(Default)]
pub struct LoopbackEngine {
    sessions: Mutex<HashMap<String, Arc<LoopbackSession>>>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete session behind `name`, for inspection and event injection.
    pub fn session(&self, name: &str) -> Option<Arc<LoopbackSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl Engine for LoopbackEngine {
    fn kind(&self) -> &'static str {
        "loopback"
    }

    async fn start(&self, name: &str, events: EventSink) -> Result<Arc<dyn Session>, SessionError> {
        let session = Arc::new(LoopbackSession {
            name: name.to_owned(),
            events,
            actions: Mutex::new(Vec::new()),
            online: AtomicBool::new(false),
            presence_fails: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), session.clone());
        Ok(session)
    }
}

pub struct LoopbackSession {
    name: String,
    events: EventSink,
    actions: Mutex<Vec<LoopbackAction>>,
    online: AtomicBool,
    presence_fails: AtomicBool,
    next_id: AtomicU64,
}

impl LoopbackSession {
    pub fn actions(&self) -> Vec<LoopbackAction> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Make subsequent presence refreshes fail.
    pub fn fail_presence(&self, fail: bool) {
        self.presence_fails.store(fail, Ordering::SeqCst);
    }

    /// Publish an inbound event as if it came from the network.
    pub fn inject(&self, payload: EventPayload) -> Result<(), SessionError> {
        self.events
            .send(SessionEvent {
                session: self.name.clone(),
                payload,
            })
            .map_err(|_| SessionError::Engine("event channel closed".into()))
    }

    fn record(&self, action: LoopbackAction) {
        debug!(session = %self.name, ?action, "loopback action");
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
    }
}

#[async_trait]
impl Session for LoopbackSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn maintain_presence_online(&self) -> Result<(), SessionError> {
        if self.presence_fails.load(Ordering::SeqCst) {
            self.online.store(false, Ordering::SeqCst);
            return Err(SessionError::PresenceRefreshFailed {
                session: self.name.clone(),
                reason: "loopback presence disabled".into(),
            });
        }
        self.online.store(true, Ordering::SeqCst);
        self.record(LoopbackAction::PresenceOnline);
        Ok(())
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, SessionError> {
        self.record(LoopbackAction::SendText {
            chat_id: chat_id.to_owned(),
            text: text.to_owned(),
        });
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("true_{chat_id}_LOOPBACK{id:08}"))
    }

    async fn send_seen(&self, chat_id: &str) -> Result<(), SessionError> {
        self.record(LoopbackAction::SendSeen {
            chat_id: chat_id.to_owned(),
        });
        Ok(())
    }

    async fn start_typing(&self, chat_id: &str) -> Result<(), SessionError> {
        self.record(LoopbackAction::StartTyping {
            chat_id: chat_id.to_owned(),
        });
        Ok(())
    }

    async fn stop_typing(&self, chat_id: &str) -> Result<(), SessionError> {
        self.record(LoopbackAction::StopTyping {
            chat_id: chat_id.to_owned(),
        });
        Ok(())
    }

    async fn react(&self, message_id: &str, reaction: &str) -> Result<(), SessionError> {
        self.record(LoopbackAction::React {
            message_id: message_id.to_owned(),
            reaction: reaction.to_owned(),
        });
        Ok(())
    }

    async fn reject_call(&self, from: &str, call_id: &str) -> Result<(), SessionError> {
        self.record(LoopbackAction::RejectCall {
            from: from.to_owned(),
            call_id: call_id.to_owned(),
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), SessionError> {
        self.online.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::session::run_as_activity;

    #[tokio::test]
    async fn records_actions_in_order() {
        let engine = LoopbackEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start("default", tx).await.unwrap();
        let session = engine.session("default").unwrap();

        run_as_activity(session.as_ref(), || session.start_typing("1@c.us"))
            .await
            .unwrap();
        assert!(session.is_online());
        assert_eq!(
            session.actions(),
            vec![
                LoopbackAction::PresenceOnline,
                LoopbackAction::StartTyping {
                    chat_id: "1@c.us".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn failed_presence_goes_offline_and_skips_activity() {
        let engine = LoopbackEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start("default", tx).await.unwrap();
        let session = engine.session("default").unwrap();
        session.fail_presence(true);

        let err = run_as_activity(session.as_ref(), || session.send_text("1@c.us", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::PresenceRefreshFailed { .. }));
        assert!(!session.is_online());
        assert!(session.actions().is_empty());
    }

    #[tokio::test]
    async fn injected_events_reach_the_sink() {
        let engine = LoopbackEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.start("default", tx).await.unwrap();

        engine
            .session("default")
            .unwrap()
            .inject(EventPayload::CallReceived {
                id: "call-1".into(),
                from: "1@c.us".into(),
            })
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session, "default");
        assert!(matches!(event.payload, EventPayload::CallReceived { .. }));
    }
}
