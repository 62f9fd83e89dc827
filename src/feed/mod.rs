pub mod item_id;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::achievements::definitions::{definition, Tier};
use crate::shared::principal::AuthUser;
use crate::shared::schema::{
    comments, event_attendance, events, favorites, likes, posts, trick_progress, tricks,
    user_achievements,
};
use crate::shared::schema::manual_achievements;
use crate::shared::state::{AppState, Capabilities};
use crate::shared::utils::truncate_preview;
use item_id::{FeedItemId, FeedItemKind};

const COMMENT_PREVIEW_CHARS: usize = 80;
const MAX_COMMENT_CHARS: usize = 2000;
const MAX_FEED_OFFSET: i64 = 10_000;

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = likes)]
pub struct DbLike {
    pub id: Uuid,
    pub user_id: Uuid,
    pub item_kind: String,
    pub item_id: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = comments)]
pub struct DbComment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub item_kind: String,
    pub item_id: String,
    pub owner_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
struct TrickProgressRow {
    user_id: Uuid,
    trick_id: Uuid,
    status: String,
    stance: String,
    like_count: i32,
    comment_count: i32,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable)]
struct PostRow {
    id: Uuid,
    user_id: Uuid,
    content: String,
    like_count: i32,
    comment_count: i32,
    created_at: DateTime<Utc>,
}

/// Per-type payload of a feed item. The closed set of variants keeps the
/// merge and pagination code free of per-source branching.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedPayload {
    Trick {
        trick_id: Uuid,
        trick_name: String,
        category: String,
        status: String,
        stance: String,
    },
    Event {
        event_id: Uuid,
        title: String,
        location: Option<String>,
        starts_at: DateTime<Utc>,
        attendee_count: i64,
    },
    Achievement {
        achievement_id: String,
        name: &'static str,
        icon: &'static str,
        tier: Option<Tier>,
    },
    Post {
        post_id: Uuid,
        content: String,
    },
}

/// One synthesized timeline entry. Never stored; rebuilt per request with a
/// stable identity so reaction and comment calls can address it later.
#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    pub id: String,
    #[serde(skip)]
    identity: FeedItemId,
    pub owner_id: Uuid,
    pub owner_name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub like_count: i64,
    pub comment_count: i64,
    pub viewer_liked: bool,
    pub latest_comment: Option<String>,
    pub payload: FeedPayload,
}

impl FeedItem {
    fn new(identity: FeedItemId, timestamp: Option<DateTime<Utc>>, payload: FeedPayload) -> Self {
        Self {
            id: identity.to_string(),
            owner_id: identity.owner_id,
            identity,
            owner_name: String::new(),
            timestamp,
            like_count: 0,
            comment_count: 0,
            viewer_liked: false,
            latest_comment: None,
            payload,
        }
    }

    pub fn kind(&self) -> FeedItemKind {
        self.identity.kind
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Comma-separated feed item kinds.
    pub types: Option<String>,
    pub mine: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct FeedResponse {
    pub items: Vec<FeedItem>,
    pub has_more: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for FeedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            Self::Database(msg) | Self::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<diesel::result::Error> for FeedError {
    fn from(e: diesel::result::Error) -> Self {
        FeedError::Database(e.to_string())
    }
}

/// Whose activity the viewer sees: everyone they follow plus themself, so a
/// member with zero follows still gets their own recent activity.
pub fn audience(viewer: Uuid, mut follows: Vec<Uuid>) -> Vec<Uuid> {
    if !follows.contains(&viewer) {
        follows.push(viewer);
    }
    follows
}

fn parse_type_filter(raw: &str) -> Result<Vec<FeedItemKind>, FeedError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            FeedItemKind::parse(s)
                .ok_or_else(|| FeedError::Validation(format!("Unknown feed type '{s}'")))
        })
        .collect()
}

/// How much of one source a request sees. Filters must be resolved per
/// source before the fetch window is applied: filtering loaded rows
/// afterwards would let a busy followee fill the window and push the
/// viewer's own matching rows out of it entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceScope {
    /// Everyone the viewer follows, plus the viewer.
    Audience,
    /// Only the viewer's own rows.
    ViewerOnly,
    /// Nothing from this source.
    Skip,
}

/// Filter semantics as shipped: when both a type filter and `mine` are given
/// they combine with OR, not AND. Per source the OR collapses to a constant
/// scope, so the predicate pushes straight into the query.
fn source_scope(
    kind: FeedItemKind,
    type_filter: Option<&[FeedItemKind]>,
    mine_only: bool,
) -> SourceScope {
    match (type_filter, mine_only) {
        (None, false) => SourceScope::Audience,
        (None, true) => SourceScope::ViewerOnly,
        (Some(kinds), false) if kinds.contains(&kind) => SourceScope::Audience,
        (Some(_), false) => SourceScope::Skip,
        (Some(kinds), true) if kinds.contains(&kind) => SourceScope::Audience,
        (Some(_), true) => SourceScope::ViewerOnly,
    }
}

fn scoped_ids<'a>(
    scope: SourceScope,
    audience_ids: &'a [Uuid],
    own: &'a [Uuid],
) -> Option<&'a [Uuid]> {
    match scope {
        SourceScope::Audience => Some(audience_ids),
        SourceScope::ViewerOnly => Some(own),
        SourceScope::Skip => None,
    }
}

/// Merge the typed sources into one timeline page. Newest first; items with
/// no timestamp sort last so incomplete rows never surface at the top. One
/// extra row decides `has_more` without a count query.
pub fn merge_and_page(
    mut items: Vec<FeedItem>,
    limit: i64,
    offset: i64,
) -> (Vec<FeedItem>, bool) {
    items.sort_by(|a, b| match (a.timestamp, b.timestamp) {
        (Some(a_ts), Some(b_ts)) => b_ts.cmp(&a_ts),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    let rest = items.split_off((offset as usize).min(items.len()));
    let has_more = rest.len() > limit as usize;
    let page: Vec<FeedItem> = rest.into_iter().take(limit as usize).collect();
    (page, has_more)
}

fn trick_items(
    conn: &mut PgConnection,
    audience_ids: &[Uuid],
    fetch: i64,
) -> QueryResult<Vec<FeedItem>> {
    let rows: Vec<TrickProgressRow> = trick_progress::table
        .filter(trick_progress::user_id.eq_any(audience_ids.to_vec()))
        .filter(trick_progress::status.eq_any(["mastered", "in_progress"]))
        .order(trick_progress::updated_at.desc().nulls_last())
        .limit(fetch)
        .select((
            trick_progress::user_id,
            trick_progress::trick_id,
            trick_progress::status,
            trick_progress::stance,
            trick_progress::like_count,
            trick_progress::comment_count,
            trick_progress::updated_at,
        ))
        .load(conn)?;

    let trick_ids: Vec<Uuid> = rows.iter().map(|r| r.trick_id).collect();
    let trick_meta: HashMap<Uuid, (String, String)> = tricks::table
        .filter(tricks::id.eq_any(trick_ids))
        .select((tricks::id, tricks::name, tricks::category))
        .load::<(Uuid, String, String)>(conn)?
        .into_iter()
        .map(|(id, name, category)| (id, (name, category)))
        .collect();

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let (name, category) = trick_meta.get(&row.trick_id)?.clone();
            let identity = FeedItemId::new(
                FeedItemKind::Trick,
                row.user_id,
                row.trick_id.to_string(),
            );
            let mut item = FeedItem::new(
                identity,
                row.updated_at,
                FeedPayload::Trick {
                    trick_id: row.trick_id,
                    trick_name: name,
                    category,
                    status: row.status,
                    stance: row.stance,
                },
            );
            item.like_count = i64::from(row.like_count);
            item.comment_count = i64::from(row.comment_count);
            Some(item)
        })
        .collect())
}

fn event_items(
    conn: &mut PgConnection,
    audience_ids: &[Uuid],
    fetch: i64,
) -> QueryResult<Vec<FeedItem>> {
    let rows: Vec<(Uuid, Uuid, DateTime<Utc>)> = event_attendance::table
        .filter(event_attendance::user_id.eq_any(audience_ids.to_vec()))
        .order(event_attendance::created_at.desc())
        .limit(fetch)
        .select((
            event_attendance::event_id,
            event_attendance::user_id,
            event_attendance::created_at,
        ))
        .load(conn)?;

    let event_ids: Vec<Uuid> = rows.iter().map(|(event_id, _, _)| *event_id).collect();
    let meta: HashMap<Uuid, (String, Option<String>, DateTime<Utc>)> = events::table
        .filter(events::id.eq_any(event_ids.clone()))
        .select((events::id, events::title, events::location, events::starts_at))
        .load::<(Uuid, String, Option<String>, DateTime<Utc>)>(conn)?
        .into_iter()
        .map(|(id, title, location, starts_at)| (id, (title, location, starts_at)))
        .collect();

    // Live attendee counts for the events on this page.
    let mut attendee_counts: HashMap<Uuid, i64> = HashMap::new();
    let attendance: Vec<Uuid> = event_attendance::table
        .filter(event_attendance::event_id.eq_any(event_ids))
        .select(event_attendance::event_id)
        .load(conn)?;
    for event_id in attendance {
        *attendee_counts.entry(event_id).or_insert(0) += 1;
    }

    Ok(rows
        .into_iter()
        .filter_map(|(event_id, user_id, joined_at)| {
            let (title, location, starts_at) = meta.get(&event_id)?.clone();
            let identity =
                FeedItemId::new(FeedItemKind::Event, user_id, event_id.to_string());
            Some(FeedItem::new(
                identity,
                Some(joined_at),
                FeedPayload::Event {
                    event_id,
                    title,
                    location,
                    starts_at,
                    attendee_count: attendee_counts.get(&event_id).copied().unwrap_or(0),
                },
            ))
        })
        .collect())
}

fn achievement_items(
    conn: &mut PgConnection,
    audience_ids: &[Uuid],
    fetch: i64,
) -> QueryResult<Vec<FeedItem>> {
    let mut items = Vec::new();

    let earned: Vec<(Uuid, String, String, DateTime<Utc>)> = user_achievements::table
        .filter(user_achievements::user_id.eq_any(audience_ids.to_vec()))
        .order(user_achievements::achieved_at.desc())
        .limit(fetch)
        .select((
            user_achievements::user_id,
            user_achievements::achievement_id,
            user_achievements::tier,
            user_achievements::achieved_at,
        ))
        .load(conn)?;

    for (user_id, achievement_id, tier, achieved_at) in earned {
        // Rows for retired catalog entries are skipped, not surfaced bare.
        let Some(def) = definition(&achievement_id) else {
            continue;
        };
        let identity =
            FeedItemId::new(FeedItemKind::Achievement, user_id, achievement_id.clone());
        items.push(FeedItem::new(
            identity,
            Some(achieved_at),
            FeedPayload::Achievement {
                achievement_id,
                name: def.name,
                icon: def.icon,
                tier: Tier::parse(&tier),
            },
        ));
    }

    let granted: Vec<(Uuid, String, DateTime<Utc>)> = manual_achievements::table
        .filter(manual_achievements::user_id.eq_any(audience_ids.to_vec()))
        .order(manual_achievements::awarded_at.desc())
        .limit(fetch)
        .select((
            manual_achievements::user_id,
            manual_achievements::achievement_id,
            manual_achievements::awarded_at,
        ))
        .load(conn)?;

    for (user_id, achievement_id, awarded_at) in granted {
        let Some(def) = definition(&achievement_id) else {
            continue;
        };
        let identity =
            FeedItemId::new(FeedItemKind::Achievement, user_id, achievement_id.clone());
        items.push(FeedItem::new(
            identity,
            Some(awarded_at),
            FeedPayload::Achievement {
                achievement_id,
                name: def.name,
                icon: def.icon,
                tier: Some(Tier::Special),
            },
        ));
    }

    Ok(items)
}

fn post_items(
    conn: &mut PgConnection,
    audience_ids: &[Uuid],
    fetch: i64,
) -> QueryResult<Vec<FeedItem>> {
    let rows: Vec<PostRow> = posts::table
        .filter(posts::user_id.eq_any(audience_ids.to_vec()))
        .order(posts::created_at.desc())
        .limit(fetch)
        .select((
            posts::id,
            posts::user_id,
            posts::content,
            posts::like_count,
            posts::comment_count,
            posts::created_at,
        ))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let identity = FeedItemId::new(FeedItemKind::Post, row.user_id, row.id.to_string());
            let mut item = FeedItem::new(
                identity,
                Some(row.created_at),
                FeedPayload::Post {
                    post_id: row.id,
                    content: row.content,
                },
            );
            item.like_count = i64::from(row.like_count);
            item.comment_count = i64::from(row.comment_count);
            item
        })
        .collect())
}

/// Whether a like/comment row addresses this item. Legacy rows carry a nil
/// owner for event and achievement items and still count toward them.
fn addresses(item: &FeedItem, kind: &str, entity: &str, owner: Uuid) -> bool {
    if kind != item.kind().as_str() || entity != item.identity.entity_id {
        return false;
    }
    owner == item.owner_id
        || (owner.is_nil()
            && matches!(
                item.kind(),
                FeedItemKind::Event | FeedItemKind::Achievement
            ))
}

/// The owner ids a like/comment query has to match; the SQL counterpart of
/// [`addresses`]. Keeping both in step means a legacy row that is counted on
/// an item also shows up when that item's reactions are read back.
fn reaction_owner_scope(item: &FeedItemId) -> Vec<Uuid> {
    match item.kind {
        FeedItemKind::Event | FeedItemKind::Achievement => vec![item.owner_id, Uuid::nil()],
        FeedItemKind::Trick | FeedItemKind::Post => vec![item.owner_id],
    }
}

/// Annotate one page of items: the viewer's own reaction state for every
/// item, counted reactions for the kinds without denormalized counters, and
/// a latest-comment preview for tricks and posts.
fn annotate_page(
    conn: &mut PgConnection,
    viewer: Uuid,
    items: &mut [FeedItem],
) -> QueryResult<()> {
    if items.is_empty() {
        return Ok(());
    }
    let entity_ids: Vec<String> = items
        .iter()
        .map(|i| i.identity.entity_id.clone())
        .collect();

    let viewer_likes: Vec<(String, String, Uuid)> = likes::table
        .filter(likes::user_id.eq(viewer))
        .filter(likes::item_id.eq_any(entity_ids.clone()))
        .select((likes::item_kind, likes::item_id, likes::owner_id))
        .load(conn)?;
    for item in items.iter_mut() {
        item.viewer_liked = viewer_likes
            .iter()
            .any(|(kind, entity, owner)| addresses(item, kind, entity, *owner));
    }

    // Event and achievement items have no denormalized counters; count their
    // reaction rows directly.
    let counted_ids: Vec<String> = items
        .iter()
        .filter(|i| matches!(i.kind(), FeedItemKind::Event | FeedItemKind::Achievement))
        .map(|i| i.identity.entity_id.clone())
        .collect();
    if !counted_ids.is_empty() {
        let like_rows: Vec<(String, String, Uuid)> = likes::table
            .filter(likes::item_kind.eq_any(["event", "achievement"]))
            .filter(likes::item_id.eq_any(counted_ids.clone()))
            .select((likes::item_kind, likes::item_id, likes::owner_id))
            .load(conn)?;
        let comment_rows: Vec<(String, String, Uuid)> = comments::table
            .filter(comments::item_kind.eq_any(["event", "achievement"]))
            .filter(comments::item_id.eq_any(counted_ids))
            .select((comments::item_kind, comments::item_id, comments::owner_id))
            .load(conn)?;
        for item in items.iter_mut() {
            if !matches!(item.kind(), FeedItemKind::Event | FeedItemKind::Achievement) {
                continue;
            }
            item.like_count = like_rows
                .iter()
                .filter(|(kind, entity, owner)| addresses(item, kind, entity, *owner))
                .count() as i64;
            item.comment_count = comment_rows
                .iter()
                .filter(|(kind, entity, owner)| addresses(item, kind, entity, *owner))
                .count() as i64;
        }
    }

    // Latest-comment preview for tricks and posts, newest row per item.
    let previewed_ids: Vec<String> = items
        .iter()
        .filter(|i| matches!(i.kind(), FeedItemKind::Trick | FeedItemKind::Post))
        .map(|i| i.identity.entity_id.clone())
        .collect();
    if !previewed_ids.is_empty() {
        let comment_rows: Vec<(String, String, Uuid, String)> = comments::table
            .filter(comments::item_kind.eq_any(["trick", "post"]))
            .filter(comments::item_id.eq_any(previewed_ids))
            .order(comments::created_at.desc())
            .select((
                comments::item_kind,
                comments::item_id,
                comments::owner_id,
                comments::content,
            ))
            .load(conn)?;
        for item in items.iter_mut() {
            if !matches!(item.kind(), FeedItemKind::Trick | FeedItemKind::Post) {
                continue;
            }
            item.latest_comment = comment_rows
                .iter()
                .find(|(kind, entity, owner, _)| addresses(item, kind, entity, *owner))
                .map(|(_, _, _, content)| truncate_preview(content, COMMENT_PREVIEW_CHARS));
        }
    }

    // Display names for every owner on the page.
    let owner_ids: Vec<Uuid> = items
        .iter()
        .map(|i| i.owner_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let names: HashMap<Uuid, String> = crate::shared::schema::users::table
        .filter(crate::shared::schema::users::id.eq_any(owner_ids))
        .select((
            crate::shared::schema::users::id,
            crate::shared::schema::users::username,
        ))
        .load::<(Uuid, String)>(conn)?
        .into_iter()
        .collect();
    for item in items.iter_mut() {
        item.owner_name = names
            .get(&item.owner_id)
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string());
    }

    Ok(())
}

fn followed_ids(conn: &mut PgConnection, viewer: Uuid) -> QueryResult<Vec<Uuid>> {
    favorites::table
        .filter(favorites::user_id.eq(viewer))
        .filter(favorites::fav_kind.eq("user"))
        .select(favorites::fav_id)
        .load(conn)
}

/// Bound and default the paging parameters. The offset cap keeps
/// `offset + limit + 1` well inside `i64` before it reaches the queries.
fn validate_paging(query: &FeedQuery, max_page_size: i64) -> Result<(i64, i64), FeedError> {
    let limit = query.limit.unwrap_or(20);
    if !(1..=max_page_size).contains(&limit) {
        return Err(FeedError::Validation(format!(
            "limit must be between 1 and {max_page_size}"
        )));
    }
    let offset = query.offset.unwrap_or(0);
    if !(0..=MAX_FEED_OFFSET).contains(&offset) {
        return Err(FeedError::Validation(format!(
            "offset must be between 0 and {MAX_FEED_OFFSET}"
        )));
    }
    Ok((limit, offset))
}

type SourceFn = fn(&mut PgConnection, &[Uuid], i64) -> QueryResult<Vec<FeedItem>>;

pub async fn handle_get_feed(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<FeedQuery>,
) -> Result<Json<FeedResponse>, FeedError> {
    let (limit, offset) = validate_paging(&query, state.config.max_page_size)?;
    let type_filter = query.types.as_deref().map(parse_type_filter).transpose()?;
    let mine_only = query.mine.unwrap_or(false);

    let pool = state.conn.clone();
    let capabilities = state.capabilities;
    let viewer = user.id;

    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| FeedError::Database(e.to_string()))?;

        let audience_ids = audience(viewer, followed_ids(&mut conn, viewer)?);
        let own = [viewer];
        let fetch = offset + limit + 1;

        let sources: [(FeedItemKind, SourceFn); 4] = [
            (FeedItemKind::Trick, trick_items),
            (FeedItemKind::Event, event_items),
            (FeedItemKind::Achievement, achievement_items),
            (FeedItemKind::Post, post_items),
        ];

        let mut items = Vec::new();
        for (kind, source) in sources {
            if kind == FeedItemKind::Post && !capabilities.posts {
                continue;
            }
            let scope = source_scope(kind, type_filter.as_deref(), mine_only);
            if let Some(ids) = scoped_ids(scope, &audience_ids, &own) {
                items.extend(source(&mut conn, ids, fetch)?);
            }
        }

        let (mut page, has_more) = merge_and_page(items, limit, offset);
        annotate_page(&mut conn, viewer, &mut page)?;

        Ok::<_, FeedError>(FeedResponse {
            items: page,
            has_more,
        })
    })
    .await
    .map_err(|e| FeedError::Internal(e.to_string()))??;

    Ok(Json(result))
}

/// Check the referenced entity exists, so reactions cannot attach to made-up
/// identities.
fn verify_target(
    conn: &mut PgConnection,
    capabilities: Capabilities,
    item: &FeedItemId,
) -> Result<(), FeedError> {
    let entity_uuid = || {
        Uuid::parse_str(&item.entity_id)
            .map_err(|_| FeedError::Validation(format!("Invalid entity id '{}'", item.entity_id)))
    };
    match item.kind {
        FeedItemKind::Trick => {
            let trick_id = entity_uuid()?;
            let found: i64 = trick_progress::table
                .filter(trick_progress::user_id.eq(item.owner_id))
                .filter(trick_progress::trick_id.eq(trick_id))
                .count()
                .get_result(conn)?;
            (found > 0)
                .then_some(())
                .ok_or_else(|| FeedError::NotFound("Trick activity not found".into()))
        }
        FeedItemKind::Post => {
            if !capabilities.posts {
                return Err(FeedError::NotFound("Posts are not enabled".into()));
            }
            let post_id = entity_uuid()?;
            let found: i64 = posts::table
                .filter(posts::id.eq(post_id))
                .count()
                .get_result(conn)?;
            (found > 0)
                .then_some(())
                .ok_or_else(|| FeedError::NotFound("Post not found".into()))
        }
        FeedItemKind::Event => {
            let event_id = entity_uuid()?;
            let found: i64 = events::table
                .filter(events::id.eq(event_id))
                .count()
                .get_result(conn)?;
            (found > 0)
                .then_some(())
                .ok_or_else(|| FeedError::NotFound("Event not found".into()))
        }
        FeedItemKind::Achievement => definition(&item.entity_id)
            .map(|_| ())
            .ok_or_else(|| FeedError::NotFound("Achievement not found".into())),
    }
}

fn adjust_denormalized_likes(
    conn: &mut PgConnection,
    item: &FeedItemId,
    delta: i32,
) -> QueryResult<()> {
    match item.kind {
        FeedItemKind::Trick => {
            if let Ok(trick_id) = Uuid::parse_str(&item.entity_id) {
                diesel::update(
                    trick_progress::table
                        .filter(trick_progress::user_id.eq(item.owner_id))
                        .filter(trick_progress::trick_id.eq(trick_id)),
                )
                .set(trick_progress::like_count.eq(trick_progress::like_count + delta))
                .execute(conn)?;
            }
        }
        FeedItemKind::Post => {
            if let Ok(post_id) = Uuid::parse_str(&item.entity_id) {
                diesel::update(posts::table.filter(posts::id.eq(post_id)))
                    .set(posts::like_count.eq(posts::like_count + delta))
                    .execute(conn)?;
            }
        }
        FeedItemKind::Event | FeedItemKind::Achievement => {}
    }
    Ok(())
}

fn adjust_denormalized_comments(
    conn: &mut PgConnection,
    item: &FeedItemId,
    delta: i32,
) -> QueryResult<()> {
    match item.kind {
        FeedItemKind::Trick => {
            if let Ok(trick_id) = Uuid::parse_str(&item.entity_id) {
                diesel::update(
                    trick_progress::table
                        .filter(trick_progress::user_id.eq(item.owner_id))
                        .filter(trick_progress::trick_id.eq(trick_id)),
                )
                .set(trick_progress::comment_count.eq(trick_progress::comment_count + delta))
                .execute(conn)?;
            }
        }
        FeedItemKind::Post => {
            if let Ok(post_id) = Uuid::parse_str(&item.entity_id) {
                diesel::update(posts::table.filter(posts::id.eq(post_id)))
                    .set(posts::comment_count.eq(posts::comment_count + delta))
                    .execute(conn)?;
            }
        }
        FeedItemKind::Event | FeedItemKind::Achievement => {}
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ReactionResponse {
    pub liked: bool,
    pub like_count: i64,
}

fn current_like_count(conn: &mut PgConnection, item: &FeedItemId) -> QueryResult<i64> {
    match item.kind {
        FeedItemKind::Trick => {
            let trick_id = Uuid::parse_str(&item.entity_id).unwrap_or_default();
            trick_progress::table
                .filter(trick_progress::user_id.eq(item.owner_id))
                .filter(trick_progress::trick_id.eq(trick_id))
                .select(trick_progress::like_count)
                .first::<i32>(conn)
                .map(i64::from)
        }
        FeedItemKind::Post => {
            let post_id = Uuid::parse_str(&item.entity_id).unwrap_or_default();
            posts::table
                .filter(posts::id.eq(post_id))
                .select(posts::like_count)
                .first::<i32>(conn)
                .map(i64::from)
        }
        FeedItemKind::Event | FeedItemKind::Achievement => likes::table
            .filter(likes::item_kind.eq(item.kind.as_str()))
            .filter(likes::item_id.eq(&item.entity_id))
            .filter(likes::owner_id.eq_any(reaction_owner_scope(item)))
            .count()
            .get_result(conn),
    }
}

pub async fn handle_toggle_reaction(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(raw_id): Path<String>,
) -> Result<Json<ReactionResponse>, FeedError> {
    let item: FeedItemId = raw_id
        .parse()
        .map_err(|e: item_id::ParseFeedItemIdError| FeedError::Validation(e.to_string()))?;

    let pool = state.conn.clone();
    let capabilities = state.capabilities;
    let viewer = user.id;

    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| FeedError::Database(e.to_string()))?;
        verify_target(&mut conn, capabilities, &item)?;

        // Legacy scope here too, so un-liking removes a pre-migration row
        // instead of stacking a second canonical one next to it.
        let existing: Option<Uuid> = likes::table
            .filter(likes::user_id.eq(viewer))
            .filter(likes::item_kind.eq(item.kind.as_str()))
            .filter(likes::item_id.eq(&item.entity_id))
            .filter(likes::owner_id.eq_any(reaction_owner_scope(&item)))
            .select(likes::id)
            .first(&mut conn)
            .optional()?;

        let liked = match existing {
            Some(like_id) => {
                diesel::delete(likes::table.filter(likes::id.eq(like_id))).execute(&mut conn)?;
                adjust_denormalized_likes(&mut conn, &item, -1)?;
                false
            }
            None => {
                diesel::insert_into(likes::table)
                    .values(DbLike {
                        id: Uuid::new_v4(),
                        user_id: viewer,
                        item_kind: item.kind.as_str().to_string(),
                        item_id: item.entity_id.clone(),
                        owner_id: item.owner_id,
                        created_at: Utc::now(),
                    })
                    .execute(&mut conn)?;
                adjust_denormalized_likes(&mut conn, &item, 1)?;
                true
            }
        };

        let like_count = current_like_count(&mut conn, &item)?;
        Ok::<_, FeedError>(ReactionResponse { liked, like_count })
    })
    .await
    .map_err(|e| FeedError::Internal(e.to_string()))??;

    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct CommentView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct CommentListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn handle_list_comments(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Path(raw_id): Path<String>,
    Query(query): Query<CommentListQuery>,
) -> Result<Json<Vec<CommentView>>, FeedError> {
    let item: FeedItemId = raw_id
        .parse()
        .map_err(|e: item_id::ParseFeedItemIdError| FeedError::Validation(e.to_string()))?;
    let limit = query.limit.unwrap_or(20).clamp(1, state.config.max_page_size);
    let offset = query.offset.unwrap_or(0).max(0);

    let pool = state.conn.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| FeedError::Database(e.to_string()))?;

        let rows: Vec<DbComment> = comments::table
            .filter(comments::item_kind.eq(item.kind.as_str()))
            .filter(comments::item_id.eq(&item.entity_id))
            .filter(comments::owner_id.eq_any(reaction_owner_scope(&item)))
            .order(comments::created_at.asc())
            .offset(offset)
            .limit(limit)
            .load(&mut conn)?;

        let author_ids: Vec<Uuid> = rows.iter().map(|r| r.user_id).collect();
        let names: HashMap<Uuid, String> = crate::shared::schema::users::table
            .filter(crate::shared::schema::users::id.eq_any(author_ids))
            .select((
                crate::shared::schema::users::id,
                crate::shared::schema::users::username,
            ))
            .load::<(Uuid, String)>(&mut conn)?
            .into_iter()
            .collect();

        Ok::<_, FeedError>(
            rows.into_iter()
                .map(|row| CommentView {
                    id: row.id,
                    user_id: row.user_id,
                    username: names
                        .get(&row.user_id)
                        .cloned()
                        .unwrap_or_else(|| "Unknown".to_string()),
                    content: row.content,
                    created_at: row.created_at,
                })
                .collect(),
        )
    })
    .await
    .map_err(|e| FeedError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn handle_add_comment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(raw_id): Path<String>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<Json<CommentView>, FeedError> {
    let item: FeedItemId = raw_id
        .parse()
        .map_err(|e: item_id::ParseFeedItemIdError| FeedError::Validation(e.to_string()))?;
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(FeedError::Validation("Comment must not be empty".into()));
    }
    if content.chars().count() > MAX_COMMENT_CHARS {
        return Err(FeedError::Validation(format!(
            "Comment exceeds {MAX_COMMENT_CHARS} characters"
        )));
    }

    let pool = state.conn.clone();
    let capabilities = state.capabilities;

    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| FeedError::Database(e.to_string()))?;
        verify_target(&mut conn, capabilities, &item)?;

        let row = DbComment {
            id: Uuid::new_v4(),
            user_id: user.id,
            item_kind: item.kind.as_str().to_string(),
            item_id: item.entity_id.clone(),
            owner_id: item.owner_id,
            content,
            created_at: Utc::now(),
        };
        diesel::insert_into(comments::table)
            .values(&row)
            .execute(&mut conn)?;
        adjust_denormalized_comments(&mut conn, &item, 1)?;

        Ok::<_, FeedError>(CommentView {
            id: row.id,
            user_id: row.user_id,
            username: user.username,
            content: row.content,
            created_at: row.created_at,
        })
    })
    .await
    .map_err(|e| FeedError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn handle_delete_comment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(comment_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, FeedError> {
    let pool = state.conn.clone();

    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| FeedError::Database(e.to_string()))?;

        let row: DbComment = comments::table
            .filter(comments::id.eq(comment_id))
            .first(&mut conn)
            .optional()?
            .ok_or_else(|| FeedError::NotFound("Comment not found".into()))?;
        if row.user_id != user.id {
            return Err(FeedError::Forbidden(
                "Only the author can delete a comment".into(),
            ));
        }

        diesel::delete(comments::table.filter(comments::id.eq(comment_id)))
            .execute(&mut conn)?;
        if let Some(kind) = FeedItemKind::parse(&row.item_kind) {
            let item = FeedItemId::new(kind, row.owner_id, row.item_id);
            adjust_denormalized_comments(&mut conn, &item, -1)?;
        }
        Ok::<_, FeedError>(())
    })
    .await
    .map_err(|e| FeedError::Internal(e.to_string()))??;

    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

/// Feed read routes; the per-account rate limit is layered on by the router
/// assembly since it needs shared state.
pub fn configure_feed_read_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/feed", get(handle_get_feed))
}

pub fn configure_feed_interaction_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/feed/{item_id}/react", post(handle_toggle_reaction))
        .route(
            "/api/feed/{item_id}/comments",
            get(handle_list_comments).post(handle_add_comment),
        )
        .route("/api/feed/comments/{id}", delete(handle_delete_comment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(kind: FeedItemKind, owner: Uuid, entity: &str, ts: Option<DateTime<Utc>>) -> FeedItem {
        FeedItem::new(
            FeedItemId::new(kind, owner, entity),
            ts,
            FeedPayload::Post {
                post_id: Uuid::nil(),
                content: String::new(),
            },
        )
    }

    fn items_at(count: usize) -> Vec<FeedItem> {
        let base = Utc::now();
        (0..count)
            .map(|i| {
                item(
                    FeedItemKind::Post,
                    Uuid::new_v4(),
                    &i.to_string(),
                    Some(base - Duration::minutes(i as i64)),
                )
            })
            .collect()
    }

    #[test]
    fn audience_always_includes_the_viewer() {
        let viewer = Uuid::new_v4();
        assert_eq!(audience(viewer, vec![]), vec![viewer]);

        let other = Uuid::new_v4();
        let ids = audience(viewer, vec![other, viewer]);
        assert_eq!(ids.iter().filter(|id| **id == viewer).count(), 1);
        assert!(ids.contains(&other));
    }

    #[test]
    fn one_extra_row_drives_has_more() {
        let (page, has_more) = merge_and_page(items_at(16), 15, 0);
        assert_eq!(page.len(), 15);
        assert!(has_more);

        let (page, has_more) = merge_and_page(items_at(15), 15, 0);
        assert_eq!(page.len(), 15);
        assert!(!has_more);
    }

    #[test]
    fn offset_pages_through_the_merged_set() {
        let (page, has_more) = merge_and_page(items_at(25), 10, 20);
        assert_eq!(page.len(), 5);
        assert!(!has_more);
    }

    #[test]
    fn newest_items_come_first_and_null_timestamps_sink() {
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let items = vec![
            item(FeedItemKind::Post, owner, "old", Some(now - Duration::hours(2))),
            item(FeedItemKind::Trick, owner, "stale", None),
            item(FeedItemKind::Post, owner, "new", Some(now)),
        ];
        let (page, _) = merge_and_page(items, 10, 0);
        assert_eq!(page[0].identity.entity_id, "new");
        assert_eq!(page[1].identity.entity_id, "old");
        assert_eq!(page[2].identity.entity_id, "stale");
    }

    #[test]
    fn type_and_mine_filters_combine_with_or_per_source() {
        let kinds = [FeedItemKind::Trick];
        // A type match admits the whole audience regardless of `mine`.
        assert_eq!(
            source_scope(FeedItemKind::Trick, Some(&kinds), true),
            SourceScope::Audience
        );
        assert_eq!(
            source_scope(FeedItemKind::Trick, Some(&kinds), false),
            SourceScope::Audience
        );
        // Outside the type filter, `mine` still admits the viewer's own rows.
        assert_eq!(
            source_scope(FeedItemKind::Post, Some(&kinds), true),
            SourceScope::ViewerOnly
        );
        assert_eq!(
            source_scope(FeedItemKind::Post, Some(&kinds), false),
            SourceScope::Skip
        );
        // No filters at all.
        assert_eq!(source_scope(FeedItemKind::Event, None, false), SourceScope::Audience);
        assert_eq!(source_scope(FeedItemKind::Event, None, true), SourceScope::ViewerOnly);
    }

    #[test]
    fn mine_filter_narrows_the_query_before_the_fetch_window() {
        // With `mine` set the source is queried for the viewer alone, so a
        // prolific followee can never crowd the viewer's older rows out of
        // the fetch window.
        let viewer = Uuid::new_v4();
        let followee = Uuid::new_v4();
        let own = [viewer];
        let audience_ids = audience(viewer, vec![followee]);

        let scope = source_scope(FeedItemKind::Trick, None, true);
        assert_eq!(scoped_ids(scope, &audience_ids, &own), Some(&own[..]));

        let scope = source_scope(FeedItemKind::Trick, None, false);
        assert_eq!(scoped_ids(scope, &audience_ids, &own), Some(&audience_ids[..]));

        let kinds = [FeedItemKind::Event];
        let scope = source_scope(FeedItemKind::Trick, Some(&kinds), false);
        assert_eq!(scoped_ids(scope, &audience_ids, &own), None);
    }

    #[test]
    fn paging_bounds_are_enforced() {
        let query = |limit, offset| FeedQuery {
            limit,
            offset,
            types: None,
            mine: None,
        };
        assert_eq!(validate_paging(&query(None, None), 50).ok(), Some((20, 0)));
        assert_eq!(
            validate_paging(&query(Some(15), Some(MAX_FEED_OFFSET)), 50).ok(),
            Some((15, MAX_FEED_OFFSET))
        );
        assert!(validate_paging(&query(Some(0), None), 50).is_err());
        assert!(validate_paging(&query(Some(51), None), 50).is_err());
        assert!(validate_paging(&query(None, Some(-1)), 50).is_err());
        // An absurd offset is rejected instead of overflowing the fetch size.
        assert!(validate_paging(&query(None, Some(i64::MAX)), 50).is_err());
    }

    #[test]
    fn unknown_type_filters_are_rejected() {
        assert!(parse_type_filter("trick,post").is_ok());
        assert!(parse_type_filter("trick,banana").is_err());
    }

    #[test]
    fn legacy_reaction_rows_address_unscoped_items() {
        let owner = Uuid::new_v4();
        let event = item(FeedItemKind::Event, owner, "e1", Some(Utc::now()));
        assert!(addresses(&event, "event", "e1", owner));
        assert!(addresses(&event, "event", "e1", Uuid::nil()));
        assert!(!addresses(&event, "event", "e1", Uuid::new_v4()));

        let post = item(FeedItemKind::Post, owner, "p1", Some(Utc::now()));
        assert!(!addresses(&post, "post", "p1", Uuid::nil()));
    }

    #[test]
    fn reaction_queries_match_the_same_owners_counting_does() {
        let owner = Uuid::new_v4();
        let event = FeedItemId::new(FeedItemKind::Event, owner, "e1");
        assert_eq!(reaction_owner_scope(&event), vec![owner, Uuid::nil()]);

        let achievement = FeedItemId::new(FeedItemKind::Achievement, owner, "club-veteran");
        assert!(reaction_owner_scope(&achievement).contains(&Uuid::nil()));

        let post = FeedItemId::new(FeedItemKind::Post, owner, "p1");
        assert_eq!(reaction_owner_scope(&post), vec![owner]);
    }
}
