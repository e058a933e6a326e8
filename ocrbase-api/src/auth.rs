//! Authentication/authorization is treated as an external collaborator;
//! this module defines the hook point `add_routes` wires in, not a real
//! identity provider. `AuthContext` carries just enough to scope every
//! downstream Job Store/Blob Store/Queue call to the caller's tenant.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub tenant_id: String,
    pub submitter_id: String,
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<AuthContext, ApiError>;
}

/// Treats the bearer credential itself as `{tenantId}:{submitterId}` (or, if
/// there's no colon, as a bare tenant id with an anonymous submitter). A
/// real deployment swaps this for a lookup against its identity provider;
/// the pipeline only ever depends on the `AuthService` trait above.
pub struct StaticAuthService;

#[async_trait]
impl AuthService for StaticAuthService {
    async fn authenticate(&self, credential: &str) -> Result<AuthContext, ApiError> {
        if credential.is_empty() {
            return Err(ApiError::Unauthorized);
        }
        let (tenant_id, submitter_id) = match credential.split_once(':') {
            Some((tenant, submitter)) if !tenant.is_empty() && !submitter.is_empty() => {
                (tenant.to_owned(), submitter.to_owned())
            }
            _ => (credential.to_owned(), "anonymous".to_owned()),
        };
        Ok(AuthContext {
            tenant_id,
            submitter_id,
        })
    }
}

/// Extracts a bearer credential from the `Authorization` header or a
/// `ocrbase_session` cookie.
pub fn credential_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_owned());
        }
    }
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == "ocrbase_session").then(|| value.to_owned())
            })
        })
}

/// Applied to every Submission API route. The Realtime Gateway does its own
/// extraction since it additionally accepts `api_key` as a query parameter
/// for clients that can't set headers (e.g. `EventSource`).
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let credential = credential_from_headers(request.headers()).ok_or(ApiError::Unauthorized)?;
    let auth = state.auth.authenticate(&credential).await?;
    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn credential_from_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok123"));
        assert_eq!(credential_from_headers(&headers).as_deref(), Some("tok123"));
    }

    #[test]
    fn credential_from_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("other=1; ocrbase_session=sess456"),
        );
        assert_eq!(
            credential_from_headers(&headers).as_deref(),
            Some("sess456")
        );
    }

    #[tokio::test]
    async fn static_auth_splits_tenant_and_submitter() {
        let auth = StaticAuthService;
        let context = auth.authenticate("tenant_1:user_9").await.unwrap();
        assert_eq!(context.tenant_id, "tenant_1");
        assert_eq!(context.submitter_id, "user_9");
    }

    #[tokio::test]
    async fn static_auth_rejects_empty_credential() {
        let auth = StaticAuthService;
        assert!(auth.authenticate("").await.is_err());
    }
}
