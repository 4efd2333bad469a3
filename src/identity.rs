//! Identity resolution for inbound requests.
//!
//! Authentication itself belongs to an external collaborator. The gateway
//! only needs `(user id, email)` for each upgrade or API request and
//! supports two ways of getting it:
//!
//! - [`IdentityResolver::SessionToken`]: a bearer token (header or `token`
//!   query parameter, since browsers cannot set headers on WebSocket
//!   upgrades) looked up through a [`SessionStore`].
//! - [`IdentityResolver::TrustedHeaders`]: `X-User-Id` / `X-User-Email`
//!   set by an authenticating reverse proxy.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Query};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::domain::UserId;
use crate::error::GatewayError;
use crate::persistence::SessionStore;

/// Header carrying the user id in trusted-header mode.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the user email in trusted-header mode.
pub const USER_EMAIL_HEADER: &str = "x-user-email";

/// A resolved caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Identity {
    /// Numeric user id.
    pub user_id: UserId,
    /// Contact identifier.
    pub email: String,
}

/// Query string accepted on upgrades and REST calls, `?token=...`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenQuery {
    /// Percent-decoded session token.
    pub token: Option<String>,
}

/// Strategy for turning request credentials into an [`Identity`].
#[derive(Debug, Clone)]
pub enum IdentityResolver {
    /// Look the bearer token up as an unexpired session.
    SessionToken(Arc<dyn SessionStore>),
    /// Trust identity headers injected by an upstream proxy.
    TrustedHeaders,
}

impl IdentityResolver {
    /// Resolves the caller from request headers, falling back to a token
    /// taken from the decoded query string.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unauthorized`] when credentials are missing,
    /// malformed or unknown, and [`GatewayError::PersistenceError`] when
    /// the session lookup itself fails.
    pub async fn resolve(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<Identity, GatewayError> {
        match self {
            Self::SessionToken(store) => {
                let token = bearer_token(headers)
                    .or_else(|| query_token.filter(|t| !t.is_empty()).map(str::to_string))
                    .ok_or_else(|| GatewayError::Unauthorized("missing token".to_string()))?;
                store
                    .find_by_session(&token, Utc::now())
                    .await?
                    .ok_or_else(|| {
                        GatewayError::Unauthorized("unknown or expired session".to_string())
                    })
            }
            Self::TrustedHeaders => {
                let user_id = header_str(headers, USER_ID_HEADER)
                    .ok_or_else(|| {
                        GatewayError::Unauthorized(format!("missing {USER_ID_HEADER} header"))
                    })?
                    .parse::<UserId>()
                    .map_err(|e| GatewayError::Unauthorized(e.to_string()))?;
                let email = header_str(headers, USER_EMAIL_HEADER)
                    .unwrap_or_default()
                    .to_string();
                Ok(Identity { user_id, email })
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Extractor yielding the authenticated caller of a REST handler.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let query = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        state
            .identity
            .resolve(&parts.headers, query.token.as_deref())
            .await
            .map(Self)
    }
}
