use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{ActiveSet, AppDefinition, AppError, AppName, AppService, CATALOG};
use crate::migrations::{Migration, MigrationRunner};
use crate::queue::{JobHandler, JobQueue};
use crate::session::{SessionEvent, SessionManager};
use crate::store::{AppInstance, Store};

// ── Disabled stand-in ────────────────────────────────────────────────────────

/// Answers every call with [`AppError::AppDisabled`]. Touches nothing.
#[derive(Debug, Clone, Copy)]
pub struct DisabledApp {
    name: AppName,
}

impl DisabledApp {
    pub fn new(name: AppName) -> Self {
        Self { name }
    }

    fn refuse<T>(&self) -> Result<T, AppError> {
        Err(AppError::AppDisabled(self.name))
    }
}

#[async_trait]
impl AppService for DisabledApp {
    fn name(&self) -> AppName {
        self.name
    }

    async fn list(&self, _session: &str) -> Result<Vec<AppInstance>, AppError> {
        self.refuse()
    }

    async fn upsert(&self, _instance: AppInstance) -> Result<AppInstance, AppError> {
        self.refuse()
    }

    async fn delete(&self, _id: &str) -> Result<(), AppError> {
        self.refuse()
    }

    async fn remove_by_session(&self, _session: &str) -> Result<usize, AppError> {
        self.refuse()
    }

    async fn dispatch(&self, _event: &SessionEvent) -> Result<(), AppError> {
        self.refuse()
    }

    async fn callback(
        &self,
        _instance_id: &str,
        _payload: serde_json::Value,
    ) -> Result<(), AppError> {
        self.refuse()
    }
}

// ── Registration ─────────────────────────────────────────────────────────────

/// Shared handles real apps are built from.
#[derive(Clone)]
pub struct AppContext {
    pub store: Store,
    pub sessions: SessionManager,
    pub queue: JobQueue,
    /// Externally reachable base URL of this gateway, without trailing slash.
    pub public_url: String,
}

/// Everything a real app brings with it. The runtime wires the consumer and
/// the migrations only when the app's definition asks for them.
pub struct AppRegistration {
    pub service: Arc<dyn AppService>,
    pub consumer: Option<Arc<dyn JobHandler>>,
    pub migrations: Vec<Migration>,
}

type AppFactory = Box<dyn FnOnce() -> AppRegistration>;

pub struct RuntimeBuilder {
    active: ActiveSet,
    queue: JobQueue,
    runner: MigrationRunner,
    factories: HashMap<AppName, AppFactory>,
}

impl RuntimeBuilder {
    /// Register the real implementation of `name`. The factory only runs if
    /// the app is active.
    pub fn register(
        mut self,
        name: AppName,
        factory: impl FnOnce() -> AppRegistration + 'static,
    ) -> Self {
        self.factories.insert(name, Box::new(factory));
        self
    }

    /// Register every app shipped with the gateway.
    pub fn with_builtin_apps(self, ctx: AppContext) -> Self {
        let calls_ctx = ctx.clone();
        self.register(AppName::Calls, move || super::calls::registration(calls_ctx))
            .register(AppName::Chatwoot, move || super::chatwoot::registration(ctx))
    }

    /// Resolve every app to its real or disabled variant.
    ///
    /// Fails with [`AppError::UnknownCapability`] if an active app has no
    /// registered implementation, and with the migration error if a
    /// migration fails. Both are fatal for startup.
    pub fn build(mut self) -> Result<CapabilityRuntime, AppError> {
        let mut services: BTreeMap<AppName, Arc<dyn AppService>> = BTreeMap::new();
        let mut consumers = Vec::new();

        for name in AppName::ALL {
            let def = CATALOG.definition_of(name);
            if !self.active.contains(name) {
                services.insert(name, Arc::new(DisabledApp::new(name)));
                continue;
            }

            let factory = self
                .factories
                .remove(&name)
                .ok_or(AppError::UnknownCapability(name))?;
            let registration = factory();

            if def.has_migrations {
                self.runner.run(&registration.migrations)?;
            }
            if def.requires_queue {
                let consumer = registration.consumer.ok_or_else(|| {
                    anyhow::anyhow!("app '{name}' requires a queue but provides no consumer")
                })?;
                consumers.push(self.queue.register_consumer(name, consumer));
            }

            info!(app = %name, "app active");
            services.insert(name, registration.service);
        }

        Ok(CapabilityRuntime {
            active: self.active,
            services,
            consumers,
        })
    }
}

// ── Runtime ──────────────────────────────────────────────────────────────────

/// Per-app service binding, fixed for the process lifetime.
pub struct CapabilityRuntime {
    active: ActiveSet,
    services: BTreeMap<AppName, Arc<dyn AppService>>,
    consumers: Vec<JoinHandle<()>>,
}

/// Catalog entry plus its activation state, as reported over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    #[serde(flatten)]
    pub definition: AppDefinition,
    pub active: bool,
}

impl CapabilityRuntime {
    pub fn builder(active: ActiveSet, queue: JobQueue, runner: MigrationRunner) -> RuntimeBuilder {
        RuntimeBuilder {
            active,
            queue,
            runner,
            factories: HashMap::new(),
        }
    }

    pub fn is_active(&self, name: AppName) -> bool {
        self.active.contains(name)
    }

    pub fn active(&self) -> &ActiveSet {
        &self.active
    }

    /// The service bound to `name`: the real one if active, else a stub.
    pub fn service_for(&self, name: AppName) -> Arc<dyn AppService> {
        match self.services.get(&name) {
            Some(service) => service.clone(),
            None => Arc::new(DisabledApp::new(name)),
        }
    }

    /// Whether newly issued keys must keep a sealed plaintext copy.
    pub fn requires_plain_key(&self) -> bool {
        self.active
            .iter()
            .any(|name| CATALOG.definition_of(name).requires_plain_key)
    }

    pub fn statuses(&self) -> Vec<AppStatus> {
        CATALOG
            .definitions()
            .map(|definition| AppStatus {
                active: self.is_active(definition.name),
                definition,
            })
            .collect()
    }

    /// Number of queue consumers started for active apps.
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Hand an inbound event to every active app. Failures are returned per app.
    pub async fn dispatch(&self, event: &SessionEvent) -> Vec<(AppName, AppError)> {
        let mut failures = Vec::new();
        for name in self.active.iter() {
            if let Err(e) = self.service_for(name).dispatch(event).await {
                failures.push((name, e));
            }
        }
        failures
    }

    /// Drop the app instances of a deleted session across all active apps.
    pub async fn remove_session(&self, session: &str) -> Result<usize, AppError> {
        let mut removed = 0;
        for name in self.active.iter() {
            removed += self.service_for(name).remove_by_session(session).await?;
        }
        Ok(removed)
    }

    /// Drain session events into the active apps until the channel closes.
    /// Each event is dispatched on its own task so a slow session never
    /// holds up the others.
    pub fn spawn_event_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let runtime = self.clone();
                tokio::spawn(async move {
                    for (app, e) in runtime.dispatch(&event).await {
                        warn!(app = %app, session = %event.session, error = %e, "app failed to handle event");
                    }
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::apps::{compute_active_set, ActivationConfig};
    use crate::queue::Job;
    use crate::session::EventPayload;
    use crate::store::db::tests::make_store;

    /// Real-variant double that counts what reaches it.
    #[derive(Default)]
    struct Counting {
        dispatched: AtomicUsize,
    }

    #[async_trait]
    impl AppService for Counting {
        fn name(&self) -> AppName {
            AppName::Chatwoot
        }

        async fn list(&self, _session: &str) -> Result<Vec<AppInstance>, AppError> {
            Ok(Vec::new())
        }

        async fn upsert(&self, instance: AppInstance) -> Result<AppInstance, AppError> {
            Ok(instance)
        }

        async fn delete(&self, _id: &str) -> Result<(), AppError> {
            Ok(())
        }

        async fn remove_by_session(&self, _session: &str) -> Result<usize, AppError> {
            Ok(2)
        }

        async fn dispatch(&self, _event: &SessionEvent) -> Result<(), AppError> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn callback(
            &self,
            _instance_id: &str,
            _payload: serde_json::Value,
        ) -> Result<(), AppError> {
            Ok(())
        }
    }

    struct Discard;

    #[async_trait]
    impl JobHandler for Discard {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn mark(store: &Store) -> anyhow::Result<()> {
        store.mark_migration_applied("marker")
    }

    fn event() -> SessionEvent {
        SessionEvent {
            session: "default".into(),
            payload: EventPayload::CallReceived {
                id: "c1".into(),
                from: "1@c.us".into(),
            },
        }
    }

    fn instance(app: AppName) -> AppInstance {
        AppInstance {
            id: "app_1".into(),
            session: "default".into(),
            app,
            enabled: true,
            config: json!({}),
            created_at: 0,
        }
    }

    fn active(allow: &str) -> ActiveSet {
        compute_active_set(
            &ActivationConfig::from_values(Some("true"), Some(allow), None),
            &CATALOG,
        )
    }

    fn counting_registration(service: Arc<Counting>) -> AppRegistration {
        AppRegistration {
            service,
            consumer: Some(Arc::new(Discard)),
            migrations: vec![Migration {
                id: "test_0001_marker",
                app: AppName::Chatwoot,
                apply: mark,
            }],
        }
    }

    #[tokio::test]
    async fn disabled_app_refuses_everything_with_its_name() {
        let stub = DisabledApp::new(AppName::Calls);
        let is_disabled = |e: AppError| matches!(e, AppError::AppDisabled(AppName::Calls));

        assert!(is_disabled(stub.list("default").await.unwrap_err()));
        assert!(is_disabled(stub.upsert(instance(AppName::Calls)).await.unwrap_err()));
        assert!(is_disabled(stub.delete("app_1").await.unwrap_err()));
        assert!(is_disabled(stub.remove_by_session("default").await.unwrap_err()));
        assert!(is_disabled(stub.dispatch(&event()).await.unwrap_err()));
        assert!(is_disabled(stub.callback("app_1", json!({})).await.unwrap_err()));
    }

    #[tokio::test]
    async fn allow_listed_queue_app_is_real_and_other_is_stub() {
        let (store, _dir) = make_store();
        let queue = JobQueue::new();
        let real = Arc::new(Counting::default());

        let runtime = CapabilityRuntime::builder(
            active("chatwoot"),
            queue.clone(),
            MigrationRunner::new(store.clone()),
        )
        .register(AppName::Chatwoot, {
            let real = real.clone();
            move || counting_registration(real)
        })
        .build()
        .unwrap();

        assert!(runtime.is_active(AppName::Chatwoot));
        assert!(!runtime.is_active(AppName::Calls));

        // Real variant: consumer registered, migration ran.
        assert!(queue.has_consumer(AppName::Chatwoot));
        assert_eq!(runtime.consumer_count(), 1);
        assert!(store.is_migration_applied("test_0001_marker").unwrap());
        assert!(store.is_migration_applied("marker").unwrap());

        // Stub variant: no consumer, every call refused with its own name.
        assert!(!queue.has_consumer(AppName::Calls));
        let calls = runtime.service_for(AppName::Calls);
        assert_eq!(calls.name(), AppName::Calls);
        assert!(matches!(
            calls.list("default").await,
            Err(AppError::AppDisabled(AppName::Calls))
        ));

        // Events only reach active apps.
        assert!(runtime.dispatch(&event()).await.is_empty());
        assert_eq!(real.dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.remove_session("default").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn inactive_apps_run_no_factory_consumer_or_migration() {
        let (store, _dir) = make_store();
        let queue = JobQueue::new();
        let built = Arc::new(AtomicUsize::new(0));

        let runtime = CapabilityRuntime::builder(
            ActiveSet::default(),
            queue.clone(),
            MigrationRunner::new(store.clone()),
        )
        .register(AppName::Chatwoot, {
            let built = built.clone();
            move || {
                built.fetch_add(1, Ordering::SeqCst);
                counting_registration(Arc::new(Counting::default()))
            }
        })
        .build()
        .unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.consumer_count(), 0);
        assert!(!queue.has_consumer(AppName::Chatwoot));
        assert!(store.applied_migrations().unwrap().is_empty());
        assert!(!runtime.requires_plain_key());
    }

    #[test]
    fn active_app_without_implementation_is_fatal() {
        let (store, _dir) = make_store();
        let result = CapabilityRuntime::builder(
            active("calls"),
            JobQueue::new(),
            MigrationRunner::new(store),
        )
        .build();
        assert!(matches!(
            result,
            Err(AppError::UnknownCapability(AppName::Calls))
        ));
    }

    #[tokio::test]
    async fn plain_key_requirement_follows_active_set() {
        let (store, _dir) = make_store();
        let runtime = CapabilityRuntime::builder(
            active("chatwoot"),
            JobQueue::new(),
            MigrationRunner::new(store),
        )
        .register(AppName::Chatwoot, || {
            counting_registration(Arc::new(Counting::default()))
        })
        .build()
        .unwrap();

        assert!(runtime.requires_plain_key());
        let statuses = runtime.statuses();
        assert_eq!(statuses.len(), AppName::ALL.len());
        assert!(statuses
            .iter()
            .any(|s| s.definition.name == AppName::Chatwoot && s.active));
        assert!(statuses
            .iter()
            .any(|s| s.definition.name == AppName::Calls && !s.active));
    }

    /// Never finishes dispatching events of session "slow"; reports the rest.
    struct Stalling {
        seen: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl AppService for Stalling {
        fn name(&self) -> AppName {
            AppName::Calls
        }

        async fn list(&self, _session: &str) -> Result<Vec<AppInstance>, AppError> {
            Ok(Vec::new())
        }

        async fn upsert(&self, instance: AppInstance) -> Result<AppInstance, AppError> {
            Ok(instance)
        }

        async fn delete(&self, _id: &str) -> Result<(), AppError> {
            Ok(())
        }

        async fn remove_by_session(&self, _session: &str) -> Result<usize, AppError> {
            Ok(0)
        }

        async fn dispatch(&self, event: &SessionEvent) -> Result<(), AppError> {
            if event.session == "slow" {
                std::future::pending::<()>().await;
            }
            let _ = self.seen.send(event.session.clone());
            Ok(())
        }

        async fn callback(
            &self,
            _instance_id: &str,
            _payload: serde_json::Value,
        ) -> Result<(), AppError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_session_does_not_hold_up_others() {
        let (store, _dir) = make_store();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let runtime = CapabilityRuntime::builder(
            active("calls"),
            JobQueue::new(),
            MigrationRunner::new(store),
        )
        .register(AppName::Calls, move || AppRegistration {
            service: Arc::new(Stalling { seen: seen_tx }),
            consumer: None,
            migrations: Vec::new(),
        })
        .build()
        .unwrap();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(runtime).spawn_event_pump(events_rx);

        let mut slow = event();
        slow.session = "slow".into();
        events_tx.send(slow).unwrap();
        events_tx.send(event()).unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("default"));
    }
}
