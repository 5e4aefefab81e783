use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::store::{ApiKeyRecord, Store};
use crate::AppState;

/// The caller behind an API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub is_admin: bool,
    /// The one session a non-admin key is bound to.
    pub session: Option<String>,
}

impl Principal {
    pub fn can_access(&self, session: &str) -> bool {
        self.is_admin || self.session.as_deref() == Some(session)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("key store unavailable: {0}")]
    KeyStoreUnavailable(String),
}

/// Read access to API key records.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get_active_key_record(&self, key: &str) -> anyhow::Result<Option<ApiKeyRecord>>;
}

#[async_trait]
impl KeyStore for Store {
    async fn get_active_key_record(&self, key: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        Store::get_active_key_record(self, key)
    }
}

/// Maps an opaque API key to a [`Principal`].
#[derive(Clone)]
pub struct SessionAuthResolver {
    keys: Arc<dyn KeyStore>,
}

impl SessionAuthResolver {
    pub fn new(keys: Arc<dyn KeyStore>) -> Self {
        Self { keys }
    }

    /// `Ok(None)` means unauthenticated. A key store failure is an error,
    /// never a fallback to unauthenticated.
    pub async fn resolve(&self, api_key: Option<&str>) -> Result<Option<Principal>, AuthError> {
        let Some(key) = api_key.filter(|k| !k.is_empty()) else {
            return Ok(None);
        };

        let record = self
            .keys
            .get_active_key_record(key)
            .await
            .map_err(|e| AuthError::KeyStoreUnavailable(format!("{e:#}")))?;

        Ok(record.filter(|r| r.active).map(|r| Principal {
            is_admin: r.is_admin,
            session: r.session,
        }))
    }
}

/// Key from `X-Api-Key`, falling back to `Authorization: Bearer`. Empty
/// values count as absent. Keys are matched exactly, so nothing is trimmed.
fn api_key_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .filter(|k| !k.is_empty())
        })
}

pub(crate) fn auth_failure(result: Result<Option<Principal>, AuthError>) -> Result<Principal, Response> {
    match result {
        Ok(Some(principal)) => Ok(principal),
        Ok(None) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response()),
        Err(e) => {
            error!(error = %e, "api key lookup failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "authentication unavailable"})),
            )
                .into_response())
        }
    }
}

/// Axum middleware that resolves the caller and stores the [`Principal`]
/// as a request extension.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let resolved = state
        .resolver
        .resolve(api_key_from_headers(request.headers()))
        .await;
    match auth_failure(resolved) {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(response) => response,
    }
}
