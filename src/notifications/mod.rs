//! Derived interaction notifications.
//!
//! Nothing here is stored: every request recomputes "who interacted with my
//! stuff" from the like, comment, and follow tables. The post-related
//! sources are optional — their tables are provisioned lazily — so they are
//! queried separately and merged in process rather than unioned in SQL.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::feed::item_id::FeedItemKind;
use crate::shared::principal::AuthUser;
use crate::shared::schema::{comments, favorites, likes, users};
use crate::shared::state::AppState;
use crate::shared::utils::truncate_preview;

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Like,
    Comment,
    NewFollower,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub actor_id: Uuid,
    pub actor_name: String,
    pub item_kind: Option<FeedItemKind>,
    pub item_id: Option<String>,
    pub preview: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    pub last_seen: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct NotificationsResponse {
    pub notifications: Vec<Notification>,
    pub unseen_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Database(msg) | Self::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Final ordering happens here, not in SQL: the optional sources cannot be
/// unioned at the query level since their tables may be absent.
pub fn merge_notifications(mut notifications: Vec<Notification>, limit: i64) -> Vec<Notification> {
    notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    notifications.truncate(limit as usize);
    notifications
}

/// Everything strictly after `last_seen` is unseen; without a marker the
/// whole returned list counts.
pub fn unseen_count(
    notifications: &[Notification],
    last_seen: Option<DateTime<Utc>>,
) -> usize {
    match last_seen {
        Some(marker) => notifications
            .iter()
            .filter(|n| n.created_at > marker)
            .count(),
        None => notifications.len(),
    }
}

fn like_notifications(
    conn: &mut PgConnection,
    viewer: Uuid,
    kinds: &[&str],
    fetch: i64,
) -> QueryResult<Vec<Notification>> {
    let rows: Vec<(Uuid, String, String, DateTime<Utc>)> = likes::table
        .filter(likes::owner_id.eq(viewer))
        .filter(likes::user_id.ne(viewer))
        .filter(likes::item_kind.eq_any(kinds.to_vec()))
        .order(likes::created_at.desc())
        .limit(fetch)
        .select((likes::user_id, likes::item_kind, likes::item_id, likes::created_at))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(actor_id, item_kind, item_id, created_at)| Notification {
            kind: NotificationKind::Like,
            actor_id,
            actor_name: String::new(),
            item_kind: FeedItemKind::parse(&item_kind),
            item_id: Some(item_id),
            preview: None,
            created_at,
        })
        .collect())
}

fn comment_notifications(
    conn: &mut PgConnection,
    viewer: Uuid,
    kinds: &[&str],
    fetch: i64,
) -> QueryResult<Vec<Notification>> {
    let rows: Vec<(Uuid, String, String, String, DateTime<Utc>)> = comments::table
        .filter(comments::owner_id.eq(viewer))
        .filter(comments::user_id.ne(viewer))
        .filter(comments::item_kind.eq_any(kinds.to_vec()))
        .order(comments::created_at.desc())
        .limit(fetch)
        .select((
            comments::user_id,
            comments::item_kind,
            comments::item_id,
            comments::content,
            comments::created_at,
        ))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(
            |(actor_id, item_kind, item_id, content, created_at)| Notification {
                kind: NotificationKind::Comment,
                actor_id,
                actor_name: String::new(),
                item_kind: FeedItemKind::parse(&item_kind),
                item_id: Some(item_id),
                preview: Some(truncate_preview(&content, PREVIEW_CHARS)),
                created_at,
            },
        )
        .collect())
}

fn follower_notifications(
    conn: &mut PgConnection,
    viewer: Uuid,
    fetch: i64,
) -> QueryResult<Vec<Notification>> {
    let rows: Vec<(Uuid, DateTime<Utc>)> = favorites::table
        .filter(favorites::fav_kind.eq("user"))
        .filter(favorites::fav_id.eq(viewer))
        .filter(favorites::user_id.ne(viewer))
        .order(favorites::created_at.desc())
        .limit(fetch)
        .select((favorites::user_id, favorites::created_at))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(actor_id, created_at)| Notification {
            kind: NotificationKind::NewFollower,
            actor_id,
            actor_name: String::new(),
            item_kind: None,
            item_id: None,
            preview: None,
            created_at,
        })
        .collect())
}

fn resolve_actor_names(
    conn: &mut PgConnection,
    notifications: &mut [Notification],
) -> QueryResult<()> {
    let actor_ids: Vec<Uuid> = notifications.iter().map(|n| n.actor_id).collect();
    let names: HashMap<Uuid, String> = users::table
        .filter(users::id.eq_any(actor_ids))
        .select((users::id, users::username))
        .load::<(Uuid, String)>(conn)?
        .into_iter()
        .collect();
    for notification in notifications.iter_mut() {
        notification.actor_name = names
            .get(&notification.actor_id)
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string());
    }
    Ok(())
}

pub async fn handle_get_notifications(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<NotificationsResponse>, NotificationError> {
    let limit = query.limit.unwrap_or(20);
    if !(1..=state.config.max_page_size).contains(&limit) {
        return Err(NotificationError::Validation(format!(
            "limit must be between 1 and {}",
            state.config.max_page_size
        )));
    }

    let pool = state.conn.clone();
    let capabilities = state.capabilities;
    let viewer = user.id;
    let last_seen = query.last_seen;

    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| NotificationError::Database(e.to_string()))?;

        // Core sources; their tables always exist, so failures propagate.
        let mut notifications =
            like_notifications(&mut conn, viewer, &["trick", "achievement"], limit)
                .map_err(|e| NotificationError::Database(e.to_string()))?;
        notifications.extend(
            comment_notifications(&mut conn, viewer, &["trick", "achievement"], limit)
                .map_err(|e| NotificationError::Database(e.to_string()))?,
        );
        notifications.extend(
            follower_notifications(&mut conn, viewer, limit)
                .map_err(|e| NotificationError::Database(e.to_string()))?,
        );

        // Optional post sources: isolated, a failure contributes nothing.
        if capabilities.posts {
            match like_notifications(&mut conn, viewer, &["post"], limit) {
                Ok(more) => notifications.extend(more),
                Err(e) => warn!(%viewer, error = %e, "post like source unavailable"),
            }
            match comment_notifications(&mut conn, viewer, &["post"], limit) {
                Ok(more) => notifications.extend(more),
                Err(e) => warn!(%viewer, error = %e, "post comment source unavailable"),
            }
        }

        let mut notifications = merge_notifications(notifications, limit);
        resolve_actor_names(&mut conn, &mut notifications)
            .map_err(|e| NotificationError::Database(e.to_string()))?;
        let unseen = unseen_count(&notifications, last_seen);

        Ok::<_, NotificationError>(NotificationsResponse {
            notifications,
            unseen_count: unseen,
        })
    })
    .await
    .map_err(|e| NotificationError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub fn configure_notification_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/notifications", get(handle_get_notifications))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn notification(kind: NotificationKind, minutes_ago: i64) -> Notification {
        Notification {
            kind,
            actor_id: Uuid::new_v4(),
            actor_name: String::new(),
            item_kind: None,
            item_id: None,
            preview: None,
            created_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn merge_sorts_newest_first_and_truncates_after_merging() {
        let merged = merge_notifications(
            vec![
                notification(NotificationKind::Like, 30),
                notification(NotificationKind::NewFollower, 5),
                notification(NotificationKind::Comment, 10),
                notification(NotificationKind::Like, 60),
            ],
            3,
        );
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].kind, NotificationKind::NewFollower);
        assert_eq!(merged[1].kind, NotificationKind::Comment);
        assert!(merged.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[test]
    fn unseen_counts_strictly_after_the_marker() {
        let marker = Utc::now() - Duration::minutes(10);
        let at_marker = Notification {
            created_at: marker,
            ..notification(NotificationKind::Like, 0)
        };
        let newer = notification(NotificationKind::Comment, 5);
        let older = notification(NotificationKind::Like, 30);

        let all = vec![newer, at_marker, older];
        assert_eq!(unseen_count(&all, Some(marker)), 1);
    }

    #[test]
    fn without_a_marker_everything_counts_as_unseen() {
        let all = vec![
            notification(NotificationKind::Like, 1),
            notification(NotificationKind::Comment, 2),
        ];
        assert_eq!(unseen_count(&all, None), 2);
    }
}
