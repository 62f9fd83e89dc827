//! Authenticated principal plumbing.
//!
//! Session and credential handling live in the upstream gateway; by the time a
//! request reaches this process the caller has already been authenticated and
//! identified by the `x-club-user` header. This module resolves that identity
//! to a user row once per request and hands it to handlers as an extractor.

use axum::{
    extract::{Request, State},
    http::request::Parts,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use diesel::prelude::*;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::shared::schema::users;
use crate::shared::state::AppState;

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub username: String,
    pub is_admin: bool,
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<AuthUser>().cloned().ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Not authenticated" })),
            )
                .into_response()
        })
    }
}

/// Resolve the gateway-asserted identity into an [`AuthUser`] extension.
/// Requests without a valid identity pass through; routes that need a
/// principal reject them via the extractor.
pub async fn principal_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let asserted = req
        .headers()
        .get("x-club-user")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok());

    if let Some(user_id) = asserted {
        let pool = state.conn.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().ok()?;
            users::table
                .filter(users::id.eq(user_id))
                .select((users::id, users::username, users::is_admin))
                .first::<(Uuid, String, bool)>(&mut conn)
                .ok()
        })
        .await
        .unwrap_or_default();

        match loaded {
            Some((id, username, is_admin)) => {
                req.extensions_mut().insert(AuthUser {
                    id,
                    username,
                    is_admin,
                });
            }
            None => warn!(%user_id, "asserted principal has no user row"),
        }
    }

    next.run(req).await
}
