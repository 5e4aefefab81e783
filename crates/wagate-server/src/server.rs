use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    apps::{
        compute_active_set, runtime::AppContext, ActivationConfig, AppCatalog, AppName,
        CapabilityRuntime,
    },
    auth::{require_api_key, SessionAuthResolver},
    handlers::{
        apps_available, audit_events, chatwoot_locales, chatwoot_webhook, create_api_key,
        create_app, create_session, delete_api_key, delete_app, delete_session, health,
        list_api_keys, list_apps, list_sessions, send_reaction, send_seen, send_text,
        start_typing, stop_typing, update_app,
    },
    migrations::MigrationRunner,
    queue::JobQueue,
    session::{LoopbackEngine, SessionError, SessionManager},
    store::Store,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bootstrap admin key ($WAGATE_ADMIN_KEY or $WAGATE_ADMIN_KEY_FILE).
    pub admin_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Base URL handed to remote apps for callbacks.
    pub public_url: Option<String>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    pub audit_retention_days: u64,
    pub activation: ActivationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("WAGATE_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("WAGATE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            admin_key: std::env::var("WAGATE_ADMIN_KEY").ok(),
            data_dir: std::env::var("WAGATE_DATA_DIR").ok().map(PathBuf::from),
            public_url: std::env::var("WAGATE_PUBLIC_URL").ok(),
            sweep_interval: Duration::from_secs(300),
            cors_origins: std::env::var("WAGATE_CORS_ORIGINS").ok(),
            audit_retention_days: std::env::var("WAGATE_AUDIT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            activation: ActivationConfig::from_env(),
        }
    }
}

/// Read a key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &std::path::Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the bootstrap admin key from `WAGATE_ADMIN_KEY_FILE` (preferred)
/// or the configured value.
pub fn resolve_admin_key(configured: Option<String>) -> Result<Option<String>> {
    if let Ok(path) = std::env::var("WAGATE_ADMIN_KEY_FILE") {
        let key = read_key_file(std::path::Path::new(&path))?;
        if configured.is_some() {
            warn!("both WAGATE_ADMIN_KEY and WAGATE_ADMIN_KEY_FILE are set; using file");
        }
        return Ok(Some(key));
    }
    Ok(configured.filter(|k| !k.trim().is_empty()))
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = crate::dirs::data_dir(cfg.data_dir.as_deref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let enc_key = load_or_create_key(&data_dir)?;
    let store = Store::open(&data_dir.join("wagate.db"), enc_key).context("open store")?;

    match resolve_admin_key(cfg.admin_key)? {
        Some(key) => {
            if store.ensure_admin_key(&key)? {
                info!("bootstrap admin key registered");
            }
        }
        None => {
            if !store.list_api_keys()?.iter().any(|r| r.is_admin && r.active) {
                warn!("no admin key configured; set WAGATE_ADMIN_KEY to manage sessions");
            }
        }
    }

    let retention_secs = (cfg.audit_retention_days * 86400) as i64;
    store
        .clone()
        .spawn_audit_sweep(cfg.sweep_interval, retention_secs);

    // Activation is decided once and never revisited.
    let active = compute_active_set(&cfg.activation, &AppCatalog);
    info!(
        enabled = cfg.activation.enabled_globally,
        active = ?active.iter().collect::<Vec<_>>(),
        "apps resolved"
    );

    let (sessions, events) = SessionManager::new(Arc::new(LoopbackEngine::new()));
    let queue = JobQueue::new();
    let public_url = cfg
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://localhost:{}", cfg.port));

    let runtime = CapabilityRuntime::builder(
        active,
        queue.clone(),
        MigrationRunner::new(store.clone()),
    )
    .with_builtin_apps(AppContext {
        store: store.clone(),
        sessions: sessions.clone(),
        queue,
        public_url,
    })
    .build()
    .context("resolve apps")?;
    let runtime = Arc::new(runtime);
    runtime.clone().spawn_event_pump(events);

    match restore_sessions(&store, &sessions).await? {
        0 => {}
        n => info!(restored = n, "sessions restored"),
    }

    let state = AppState {
        resolver: SessionAuthResolver::new(Arc::new(store.clone())),
        store,
        sessions,
        runtime,
    };
    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "wagate listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

/// Start every session that still holds an active key, so keys issued
/// before a restart keep addressing a running session.
pub async fn restore_sessions(store: &Store, sessions: &SessionManager) -> Result<usize> {
    let mut restored = 0;
    for name in store.active_session_names()? {
        match sessions.start(&name).await {
            Ok(_) => restored += 1,
            Err(SessionError::AlreadyExists(_)) => {}
            Err(e) => warn!(session = %name, error = %e, "could not restore session"),
        }
    }
    Ok(restored)
}

/// All routes of the gateway. The Chatwoot callback route only exists while
/// the app is active.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    // Public routes (no auth required).
    let mut public = Router::new()
        .route("/health", get(health))
        .route("/api/apps/available", get(apps_available))
        .route("/api/apps/chatwoot/locales", get(chatwoot_locales));
    if state.runtime.is_active(AppName::Chatwoot) {
        // Authenticated by the session key carried in the query string.
        public = public.route("/webhooks/chatwoot/{app_id}", post(chatwoot_webhook));
    }

    // Protected routes (API key required).
    let protected = Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/{session}", delete(delete_session))
        .route("/api/keys", post(create_api_key).get(list_api_keys))
        .route("/api/keys/{id}", delete(delete_api_key))
        .route("/api/apps", get(list_apps).post(create_app))
        .route("/api/apps/{id}", put(update_app).delete(delete_app))
        .route("/api/audit", get(audit_events))
        .route("/api/{session}/send-text", post(send_text))
        .route("/api/{session}/send-seen", post(send_seen))
        .route("/api/{session}/start-typing", post(start_typing))
        .route("/api/{session}/stop-typing", post(stop_typing))
        .route("/api/{session}/reaction", post(send_reaction))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn load_or_create_key(data_dir: &std::path::Path) -> Result<crate::store::crypto::EncryptionKey> {
    let key_path = data_dir.join("wagate.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read wagate.key")?;
        crate::store::crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "wagate.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crate::store::crypto::generate_key();
        std::fs::write(&key_path, key.as_bytes()).context("write wagate.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
