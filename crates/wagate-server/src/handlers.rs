use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    apps::{chatwoot, AppError, AppName},
    auth::{auth_failure, Principal},
    session::{run_as_activity, SessionError},
    store::{
        apps::generate_instance_id,
        audit::{
            AuditEvent, ACTION_APP_DELETE, ACTION_APP_UPSERT, ACTION_KEY_CREATE,
            ACTION_KEY_REVOKE, ACTION_SESSION_CREATE, ACTION_SESSION_DELETE,
        },
        AppInstance, AuditQuery, Store,
    },
    AppState,
};

// ── Permission helpers ───────────────────────────────────────────────────────

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": "insufficient permissions"})),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({"error": message.to_string()}))).into_response()
}

// ── IP extraction ────────────────────────────────────────────────────────────

fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "engine": state.sessions.engine_kind(),
        "apps": state.runtime.active().iter().collect::<Vec<_>>(),
    }))
}

// ── Audit query ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action: Option<String>,
    /// Session name, key ID or app instance ID.
    pub subject: Option<String>,
    pub limit: Option<usize>,
}

pub async fn audit_events(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<AuditQueryParams>,
) -> Response {
    if !principal.is_admin {
        return forbidden();
    }
    let limit = params.limit.unwrap_or(100).min(1000);
    let query = AuditQuery {
        since: params.since,
        until: params.until,
        action: params.action,
        subject: params.subject,
        limit,
    };
    match state.store.list_audit(&query) {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Sessions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
}

/// Start a session and issue the API key bound to it.
pub async fn create_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    if !principal.is_admin {
        return forbidden();
    }
    let ip = extract_ip(&headers, &addr);

    if let Err(e) = state.sessions.start(&body.name).await {
        return session_error(e);
    }

    // Keys and instances left over from an earlier session of the same name
    // must not carry over to this one.
    if let Err(e) = clear_session_leftovers(&state, &body.name).await {
        let _ = state.sessions.stop(&body.name).await;
        return e;
    }

    let keep_plain = state.runtime.requires_plain_key();
    match state.store.issue_api_key(Some(&body.name), false, keep_plain) {
        Ok((record, raw_key)) => {
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_SESSION_CREATE,
                Some(body.name.clone()),
                ip,
                true,
                Some(format!("key_id={}", record.id)),
            ));
            (
                StatusCode::CREATED,
                Json(json!({
                    "session": body.name,
                    "key_id": record.id,
                    "key": raw_key,
                })),
            )
                .into_response()
        }
        Err(e) => {
            let _ = state.sessions.stop(&body.name).await;
            internal_error(e)
        }
    }
}

async fn clear_session_leftovers(state: &AppState, session: &str) -> Result<(), Response> {
    let revoked = state
        .store
        .deactivate_session_keys(session)
        .map_err(internal_error)?;
    let removed = state
        .runtime
        .remove_session(session)
        .await
        .map_err(app_error)?;
    if revoked > 0 || removed > 0 {
        warn!(session = %session, revoked, removed, "cleared leftovers of an earlier session");
    }
    Ok(())
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Response {
    let sessions: Vec<String> = state
        .sessions
        .list()
        .await
        .into_iter()
        .filter(|name| principal.can_access(name))
        .collect();
    Json(json!({ "sessions": sessions })).into_response()
}

/// Stop a session, revoke its keys and drop its app instances.
pub async fn delete_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(session): Path<String>,
) -> Response {
    if !principal.is_admin {
        return forbidden();
    }
    let ip = extract_ip(&headers, &addr);

    // A session that is no longer running (e.g. after a restart) may still
    // own keys and app instances; those are cleaned up all the same.
    let stopped = match state.sessions.stop(&session).await {
        Ok(()) => true,
        Err(SessionError::NotFound(_)) => false,
        Err(e) => {
            warn!(session = %session, error = %e, "session did not stop cleanly");
            true
        }
    };
    let revoked = match state.store.deactivate_session_keys(&session) {
        Ok(n) => n,
        Err(e) => return internal_error(e),
    };
    let removed = match state.runtime.remove_session(&session).await {
        Ok(n) => n,
        Err(e) => return app_error(e),
    };
    if !stopped && revoked == 0 && removed == 0 {
        return session_error(SessionError::NotFound(session));
    }

    info!(session = %session, revoked, removed, "session deleted");
    let _ = state.store.record_audit(AuditEvent::new(
        ACTION_SESSION_DELETE,
        Some(session),
        ip,
        true,
        Some(format!("keys_revoked={revoked} apps_removed={removed}")),
    ));
    Json(json!({"deleted": true, "keys_revoked": revoked, "apps_removed": removed}))
        .into_response()
}

// ── API keys ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub session: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Response {
    if !principal.is_admin {
        return forbidden();
    }
    let ip = extract_ip(&headers, &addr);

    match (&body.session, body.is_admin) {
        (None, false) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "a non-admin key must be bound to a session",
            )
        }
        (Some(session), _) => {
            if let Err(e) = state.sessions.get(session).await {
                return session_error(e);
            }
        }
        (None, true) => {}
    }

    let keep_plain = body.session.is_some() && state.runtime.requires_plain_key();
    match state
        .store
        .issue_api_key(body.session.as_deref(), body.is_admin, keep_plain)
    {
        Ok((record, raw_key)) => {
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_KEY_CREATE,
                Some(record.id.clone()),
                ip,
                true,
                record.session.as_ref().map(|s| format!("session={s}")),
            ));
            (
                StatusCode::CREATED,
                Json(json!({
                    "id": record.id,
                    "key": raw_key,
                    "session": record.session,
                    "is_admin": record.is_admin,
                })),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Response {
    if !principal.is_admin {
        return forbidden();
    }
    match state.store.list_api_keys() {
        Ok(records) => {
            let keys: Vec<_> = records
                .iter()
                .map(|r| {
                    json!({
                        "id": r.id,
                        "session": r.session,
                        "is_admin": r.is_admin,
                        "active": r.active,
                        "created_at": r.created_at,
                    })
                })
                .collect();
            Json(json!({"keys": keys})).into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn delete_api_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Response {
    if !principal.is_admin {
        return forbidden();
    }
    let ip = extract_ip(&headers, &addr);
    match state.store.deactivate_api_key(&id) {
        Ok(true) => {
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_KEY_REVOKE,
                Some(id),
                ip,
                true,
                None,
            ));
            Json(json!({"revoked": true})).into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "api key not found"),
        Err(e) => internal_error(e),
    }
}

// ── Apps ─────────────────────────────────────────────────────────────────────

pub async fn apps_available(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "apps": state.runtime.statuses() }))
}

/// Served whether or not the Chatwoot app is active.
pub async fn chatwoot_locales() -> impl IntoResponse {
    Json(json!({
        "default": chatwoot::locales::DEFAULT_LOCALE,
        "locales": chatwoot::LOCALES,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListAppsParams {
    pub session: String,
    pub app: Option<AppName>,
}

pub async fn list_apps(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<ListAppsParams>,
) -> Response {
    if !principal.can_access(&params.session) {
        return forbidden();
    }

    // An explicit app goes through its binding even when disabled, so the
    // caller learns why it has no instances.
    let names: Vec<AppName> = match params.app {
        Some(app) => vec![app],
        None => state.runtime.active().iter().collect(),
    };

    let mut instances = Vec::new();
    for name in names {
        match state.runtime.service_for(name).list(&params.session).await {
            Ok(found) => instances.extend(found),
            Err(e) => return app_error(e),
        }
    }
    Json(json!({ "apps": instances })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateAppRequest {
    pub session: String,
    pub app: AppName,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

pub async fn create_app(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<CreateAppRequest>,
) -> Response {
    if !principal.can_access(&body.session) {
        return forbidden();
    }
    let ip = extract_ip(&headers, &addr);

    if let Err(e) = state.sessions.get(&body.session).await {
        return session_error(e);
    }

    let instance = AppInstance {
        id: generate_instance_id(),
        session: body.session,
        app: body.app,
        enabled: body.enabled,
        config: normalize_config(body.config),
        created_at: Store::now(),
    };
    upsert_instance(&state, instance, ip, StatusCode::CREATED).await
}

#[derive(Debug, Deserialize)]
pub struct UpdateAppRequest {
    pub enabled: Option<bool>,
    pub config: Option<serde_json::Value>,
}

pub async fn update_app(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    Json(body): Json<UpdateAppRequest>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    let mut instance = match owned_instance(&state, &principal, &id) {
        Ok(instance) => instance,
        Err(response) => return response,
    };

    if let Some(enabled) = body.enabled {
        instance.enabled = enabled;
    }
    if let Some(config) = body.config {
        instance.config = normalize_config(config);
    }
    upsert_instance(&state, instance, ip, StatusCode::OK).await
}

pub async fn delete_app(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    let instance = match owned_instance(&state, &principal, &id) {
        Ok(instance) => instance,
        Err(response) => return response,
    };

    match state.runtime.service_for(instance.app).delete(&id).await {
        Ok(()) => {
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_APP_DELETE,
                Some(id),
                ip,
                true,
                Some(format!("app={} session={}", instance.app, instance.session)),
            ));
            Json(json!({"deleted": true})).into_response()
        }
        Err(e) => app_error(e),
    }
}

async fn upsert_instance(
    state: &AppState,
    instance: AppInstance,
    ip: String,
    status: StatusCode,
) -> Response {
    let app = instance.app;
    match state.runtime.service_for(app).upsert(instance).await {
        Ok(saved) => {
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_APP_UPSERT,
                Some(saved.id.clone()),
                ip,
                true,
                Some(format!("app={app} session={}", saved.session)),
            ));
            (status, Json(json!(saved))).into_response()
        }
        Err(e) => {
            let _ = state.store.record_audit(AuditEvent::new(
                ACTION_APP_UPSERT,
                None,
                ip,
                false,
                Some(format!("app={app} error={e}")),
            ));
            app_error(e)
        }
    }
}

/// Load an instance the caller may manage, or the response to send instead.
fn owned_instance(state: &AppState, principal: &Principal, id: &str) -> Result<AppInstance, Response> {
    match state.store.get_app_instance(id) {
        Ok(Some(instance)) if principal.can_access(&instance.session) => Ok(instance),
        Ok(Some(_)) => Err(forbidden()),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "app instance not found")),
        Err(e) => Err(internal_error(e)),
    }
}

fn normalize_config(config: serde_json::Value) -> serde_json::Value {
    if config.is_null() {
        json!({})
    } else {
        config
    }
}

// ── App callbacks ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub key: Option<String>,
}

/// Agent replies from Chatwoot. The key in the query string is the session
/// key embedded in the webhook URL handed out on save.
pub async fn chatwoot_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CallbackParams>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let principal = match auth_failure(state.resolver.resolve(params.key.as_deref()).await) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    if let Err(response) = owned_instance(&state, &principal, &id) {
        return response;
    }

    match state
        .runtime
        .service_for(AppName::Chatwoot)
        .callback(&id, payload)
        .await
    {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => app_error(e),
    }
}

// ── Activities ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SendTextRequest {
    pub chat_id: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub chat_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub message_id: String,
    /// Empty string removes the reaction.
    #[serde(default)]
    pub reaction: String,
}

/// Look up a session the caller may act for.
async fn session_for(
    state: &AppState,
    principal: &Principal,
    session: &str,
) -> Result<std::sync::Arc<dyn crate::session::Session>, Response> {
    if !principal.can_access(session) {
        return Err(forbidden());
    }
    state.sessions.get(session).await.map_err(session_error)
}

pub async fn send_text(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session): Path<String>,
    Json(body): Json<SendTextRequest>,
) -> Response {
    let s = match session_for(&state, &principal, &session).await {
        Ok(s) => s,
        Err(response) => return response,
    };
    match run_as_activity(s.as_ref(), || s.send_text(&body.chat_id, &body.text)).await {
        Ok(id) => Json(json!({"id": id})).into_response(),
        Err(e) => session_error(e),
    }
}

pub async fn send_seen(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session): Path<String>,
    Json(body): Json<ChatRequest>,
) -> Response {
    let s = match session_for(&state, &principal, &session).await {
        Ok(s) => s,
        Err(response) => return response,
    };
    activity_done(run_as_activity(s.as_ref(), || s.send_seen(&body.chat_id)).await)
}

pub async fn start_typing(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session): Path<String>,
    Json(body): Json<ChatRequest>,
) -> Response {
    let s = match session_for(&state, &principal, &session).await {
        Ok(s) => s,
        Err(response) => return response,
    };
    activity_done(run_as_activity(s.as_ref(), || s.start_typing(&body.chat_id)).await)
}

pub async fn stop_typing(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session): Path<String>,
    Json(body): Json<ChatRequest>,
) -> Response {
    let s = match session_for(&state, &principal, &session).await {
        Ok(s) => s,
        Err(response) => return response,
    };
    activity_done(run_as_activity(s.as_ref(), || s.stop_typing(&body.chat_id)).await)
}

pub async fn send_reaction(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session): Path<String>,
    Json(body): Json<ReactionRequest>,
) -> Response {
    let s = match session_for(&state, &principal, &session).await {
        Ok(s) => s,
        Err(response) => return response,
    };
    activity_done(
        run_as_activity(s.as_ref(), || s.react(&body.message_id, &body.reaction)).await,
    )
}

fn activity_done(result: Result<(), SessionError>) -> Response {
    match result {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => session_error(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn session_error(e: SessionError) -> Response {
    let status = match &e {
        SessionError::PresenceRefreshFailed { .. } | SessionError::Engine(_) => {
            StatusCode::BAD_GATEWAY
        }
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::AlreadyExists(_) => StatusCode::CONFLICT,
        SessionError::InvalidName(_) => StatusCode::BAD_REQUEST,
    };
    error_response(status, e)
}

fn app_error(e: AppError) -> Response {
    match e {
        AppError::AppDisabled(_) => error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
        AppError::InvalidConfig { .. } | AppError::CallbackUnsupported(_) => {
            error_response(StatusCode::BAD_REQUEST, e)
        }
        AppError::NotFound(_) => error_response(StatusCode::NOT_FOUND, e),
        AppError::Session(e) => session_error(e),
        AppError::UnknownCapability(_) => internal_error(anyhow::Error::new(e)),
        AppError::Internal(e) => internal_error(e),
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use axum::body::to_bytes;

    use super::*;
    use crate::apps::{compute_active_set, ActivationConfig, AppCatalog, CapabilityRuntime};
    use crate::apps::runtime::{AppContext, AppRegistration};
    use crate::auth::SessionAuthResolver;
    use crate::migrations::MigrationRunner;
    use crate::queue::JobQueue;
    use crate::session::{LoopbackEngine, SessionManager};
    use crate::store::db::tests::make_store;

    struct Fixture {
        state: AppState,
        engine: Arc<LoopbackEngine>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(apps_on: Option<&str>) -> Fixture {
        let (store, dir) = make_store();
        let engine = Arc::new(LoopbackEngine::new());
        Fixture {
            state: state_over(store, engine.clone(), apps_on),
            engine,
            _dir: dir,
        }
    }

    /// A fresh gateway over `store`, as after a restart.
    pub(crate) fn state_over(
        store: Store,
        engine: Arc<LoopbackEngine>,
        apps_on: Option<&str>,
    ) -> AppState {
        let (sessions, _rx) = SessionManager::new(engine);
        let queue = JobQueue::new();

        let active = compute_active_set(
            &ActivationConfig::from_values(Some("true"), apps_on, None),
            &AppCatalog,
        );
        let runtime = CapabilityRuntime::builder(
            active,
            queue.clone(),
            MigrationRunner::new(store.clone()),
        )
        .with_builtin_apps(AppContext {
            store: store.clone(),
            sessions: sessions.clone(),
            queue,
            public_url: "http://localhost:3000".into(),
        })
        .build()
        .unwrap();

        AppState {
            resolver: SessionAuthResolver::new(Arc::new(store.clone())),
            store,
            sessions,
            runtime: Arc::new(runtime),
        }
    }

    fn admin() -> Principal {
        Principal {
            is_admin: true,
            session: None,
        }
    }

    fn bound(session: &str) -> Principal {
        Principal {
            is_admin: false,
            session: Some(session.into()),
        }
    }

    fn addr() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000)))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(f: &Fixture, name: &str) -> serde_json::Value {
        let response = create_session(
            State(f.state.clone()),
            Extension(admin()),
            HeaderMap::new(),
            addr(),
            Json(CreateSessionRequest { name: name.into() }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await
    }

    #[tokio::test]
    async fn disabled_app_answers_422() {
        let f = fixture(Some("calls")).await;
        create(&f, "default").await;

        let response = create_app(
            State(f.state.clone()),
            Extension(admin()),
            HeaderMap::new(),
            addr(),
            Json(CreateAppRequest {
                session: "default".into(),
                app: AppName::Chatwoot,
                enabled: true,
                config: json!({}),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            body_json(response).await,
            json!({"error": "app 'chatwoot' is disabled"})
        );
    }

    #[tokio::test]
    async fn session_key_is_scoped_to_its_session() {
        let f = fixture(Some("calls")).await;
        create(&f, "s1").await;
        create(&f, "s2").await;

        let response = send_text(
            State(f.state.clone()),
            Extension(bound("s1")),
            Path("s2".into()),
            Json(SendTextRequest {
                chat_id: "1@c.us".into(),
                text: "hi".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = list_sessions(State(f.state.clone()), Extension(bound("s1"))).await;
        assert_eq!(body_json(response).await, json!({"sessions": ["s1"]}));
    }

    #[tokio::test]
    async fn presence_failure_is_bad_gateway_and_nothing_is_sent() {
        let f = fixture(None).await;
        create(&f, "default").await;
        let session = f.engine.session("default").unwrap();
        session.fail_presence(true);

        let response = send_text(
            State(f.state.clone()),
            Extension(bound("default")),
            Path("default".into()),
            Json(SendTextRequest {
                chat_id: "1@c.us".into(),
                text: "hi".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(session.actions().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_session_revokes_its_key() {
        let f = fixture(Some("calls")).await;
        let created = create(&f, "default").await;
        let key = created["key"].as_str().unwrap().to_owned();
        assert!(f.state.resolver.resolve(Some(&key)).await.unwrap().is_some());

        let response = delete_session(
            State(f.state.clone()),
            Extension(admin()),
            HeaderMap::new(),
            addr(),
            Path("default".into()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.state.resolver.resolve(Some(&key)).await.unwrap(), None);

        let response = delete_session(
            State(f.state.clone()),
            Extension(admin()),
            HeaderMap::new(),
            addr(),
            Path("default".into()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chatwoot_webhook_requires_the_session_key() {
        let f = fixture(Some("chatwoot")).await;
        let created = create(&f, "default").await;
        let key = created["key"].as_str().unwrap().to_owned();

        let response = create_app(
            State(f.state.clone()),
            Extension(bound("default")),
            HeaderMap::new(),
            addr(),
            Json(CreateAppRequest {
                session: "default".into(),
                app: AppName::Chatwoot,
                enabled: true,
                config: json!({
                    "url": "https://cw.example.com",
                    "account_id": 1,
                    "account_token": "tok",
                    "inbox_id": 2,
                }),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let saved = body_json(response).await;
        let id = saved["id"].as_str().unwrap().to_owned();
        assert!(saved["config"]["webhook_url"]
            .as_str()
            .unwrap()
            .ends_with(&format!("/webhooks/chatwoot/{id}?key={key}")));

        let reply = json!({
            "message_type": "outgoing",
            "content": "hello",
            "conversation": {"meta": {"sender": {"phone_number": "+15550001"}}},
        });
        let response = chatwoot_webhook(
            State(f.state.clone()),
            Path(id.clone()),
            Query(CallbackParams { key: None }),
            Json(reply.clone()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = chatwoot_webhook(
            State(f.state.clone()),
            Path(id),
            Query(CallbackParams { key: Some(key) }),
            Json(reply),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.engine.session("default").unwrap().actions().len(), 2);
    }

    #[tokio::test]
    async fn admin_routes_reject_session_keys() {
        let f = fixture(None).await;
        let response = list_api_keys(State(f.state.clone()), Extension(bound("s1"))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = create_api_key(
            State(f.state.clone()),
            Extension(admin()),
            HeaderMap::new(),
            addr(),
            Json(CreateApiKeyRequest {
                session: None,
                is_admin: false,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
    async fn delete(state: &AppState, name: &str) -> Response {
        delete_session(
            State(state.clone()),
            Extension(admin()),
            HeaderMap::new(),
            addr(),
            Path(name.into()),
        )
        .await
    }

    #[tokio::test]
    async fn keys_of_a_session_lost_in_a_restart_can_still_be_revoked() {
        let f = fixture(Some("calls")).await;
        let old_key = create(&f, "s1").await["key"].as_str().unwrap().to_owned();

        let restarted = state_over(f.state.store.clone(), f.engine.clone(), Some("calls"));
        assert!(restarted.sessions.list().await.is_empty());

        let response = delete(&restarted, "s1").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["keys_revoked"], json!(1));
        assert_eq!(restarted.resolver.resolve(Some(&old_key)).await.unwrap(), None);

        let response = create_session(
            State(restarted.clone()),
            Extension(admin()),
            HeaderMap::new(),
            addr(),
            Json(CreateSessionRequest { name: "s1".into() }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(restarted.resolver.resolve(Some(&old_key)).await.unwrap(), None);

        let response = delete(&restarted, "never-existed").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recreated_session_does_not_inherit_old_keys() {
        let f = fixture(Some("calls")).await;
        let old_key = create(&f, "s1").await["key"].as_str().unwrap().to_owned();

        let restarted = state_over(f.state.store.clone(), f.engine.clone(), Some("calls"));
        let response = create_session(
            State(restarted.clone()),
            Extension(admin()),
            HeaderMap::new(),
            addr(),
            Json(CreateSessionRequest { name: "s1".into() }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let new_key = body_json(response).await["key"].as_str().unwrap().to_owned();

        assert_eq!(restarted.resolver.resolve(Some(&old_key)).await.unwrap(), None);
        assert!(restarted.resolver.resolve(Some(&new_key)).await.unwrap().is_some());

        let response = send_text(
            State(restarted.clone()),
            Extension(bound("s1")),
            Path("s1".into()),
            Json(SendTextRequest {
                chat_id: "1@c.us".into(),
                text: "hi".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    /// Calls service whose instance cleanup always fails.
    struct BrokenCleanup;

    #[async_trait::async_trait]
    impl crate::apps::AppService for BrokenCleanup {
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
            Err(AppError::Internal(anyhow::anyhow!("disk full")))
        }

        async fn dispatch(&self, _event: &crate::session::SessionEvent) -> Result<(), AppError> {
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
    async fn failed_create_leaves_no_running_session() {
        let (store, _dir) = make_store();
        let engine = Arc::new(LoopbackEngine::new());
        let (sessions, _rx) = SessionManager::new(engine);
        let active = compute_active_set(
            &ActivationConfig::from_values(Some("true"), Some("calls"), None),
            &AppCatalog,
        );
        let runtime = CapabilityRuntime::builder(
            active,
            JobQueue::new(),
            MigrationRunner::new(store.clone()),
        )
        .register(AppName::Calls, || AppRegistration {
            service: Arc::new(BrokenCleanup),
            consumer: None,
            migrations: Vec::new(),
        })
        .build()
        .unwrap();
        let state = AppState {
            resolver: SessionAuthResolver::new(Arc::new(store.clone())),
            store,
            sessions,
            runtime: Arc::new(runtime),
        };

        let response = create_session(
            State(state.clone()),
            Extension(admin()),
            HeaderMap::new(),
            addr(),
            Json(CreateSessionRequest { name: "s1".into() }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(state.sessions.list().await.is_empty());
        assert!(state.store.list_api_keys().unwrap().is_empty());
    }
}
