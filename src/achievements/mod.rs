pub mod definitions;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::dsl::count_distinct;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::shared::principal::AuthUser;
use crate::shared::schema::{
    article_reads, event_attendance, login_history, manual_achievements, orders, trick_progress,
    tricks, user_achievements, users,
};
use crate::shared::state::AppState;
use definitions::{
    definition, definitions, determine_tier, AchievementDef, AchievementKind, ProgressSource, Tier,
};

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = user_achievements)]
pub struct DbUserAchievement {
    pub id: Uuid,
    pub user_id: Uuid,
    pub achievement_id: String,
    pub tier: String,
    pub achieved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = manual_achievements)]
pub struct DbManualAchievement {
    pub id: Uuid,
    pub user_id: Uuid,
    pub achievement_id: String,
    pub awarded_by: Uuid,
    pub note: Option<String>,
    pub awarded_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AchievementError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AchievementError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            Self::Database(msg) | Self::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Consecutive-day login streak, walking back from `today`. Dates must be
/// distinct and sorted newest first. A gap of zero or one day from the
/// running expected date extends the streak; anything larger ends it.
pub fn login_streak(dates: &[NaiveDate], today: NaiveDate) -> i64 {
    let mut streak = 0;
    let mut expected = today;
    for &date in dates {
        let gap = (expected - date).num_days();
        if (0..=1).contains(&gap) {
            streak += 1;
            expected = date;
        } else {
            break;
        }
    }
    streak
}

fn login_dates(conn: &mut PgConnection, user_id: Uuid) -> QueryResult<Vec<NaiveDate>> {
    let stamps: Vec<DateTime<Utc>> = login_history::table
        .filter(login_history::user_id.eq(user_id))
        .filter(login_history::succeeded.eq(true))
        .order(login_history::created_at.desc())
        .select(login_history::created_at)
        .load(conn)?;

    let mut dates: Vec<NaiveDate> = stamps.into_iter().map(|t| t.date_naive()).collect();
    dates.dedup();
    Ok(dates)
}

fn compute_source_value(
    conn: &mut PgConnection,
    user_id: Uuid,
    source: ProgressSource,
) -> QueryResult<i64> {
    match source {
        ProgressSource::TricksMastered { category } => {
            // Every mastered (trick, stance) pair counts, so normal and
            // mirrored stance sum naturally.
            let base = trick_progress::table
                .filter(trick_progress::user_id.eq(user_id))
                .filter(trick_progress::status.eq("mastered"));
            match category {
                Some(category) => {
                    let trick_ids: Vec<Uuid> = tricks::table
                        .filter(tricks::category.eq(category))
                        .select(tricks::id)
                        .load(conn)?;
                    base.filter(trick_progress::trick_id.eq_any(trick_ids))
                        .count()
                        .get_result(conn)
                }
                None => base.count().get_result(conn),
            }
        }
        ProgressSource::ArticlesKnown => article_reads::table
            .filter(article_reads::user_id.eq(user_id))
            .filter(article_reads::known.eq(true))
            .count()
            .get_result(conn),
        ProgressSource::EventsAttended => event_attendance::table
            .filter(event_attendance::user_id.eq(user_id))
            .select(count_distinct(event_attendance::event_id))
            .first(conn),
        ProgressSource::OrdersCompleted => orders::table
            .filter(orders::user_id.eq(user_id))
            .filter(orders::status.eq_any(["completed", "fulfilled"]))
            .count()
            .get_result(conn),
        ProgressSource::AccountAgeDays => {
            let created_at: DateTime<Utc> = users::table
                .filter(users::id.eq(user_id))
                .select(users::created_at)
                .first(conn)?;
            Ok((Utc::now() - created_at).num_days().max(0))
        }
        ProgressSource::ProfileComplete => {
            let avatar: Option<String> = users::table
                .filter(users::id.eq(user_id))
                .select(users::avatar_url)
                .first(conn)?;
            Ok(i64::from(avatar.is_some()))
        }
        ProgressSource::LoginStreak => {
            let dates = login_dates(conn, user_id)?;
            Ok(login_streak(&dates, Utc::now().date_naive()))
        }
    }
}

/// Live progress for every automatic achievement. Each source is isolated: a
/// failing sub-query contributes zero instead of failing the whole map.
pub fn compute_progress(conn: &mut PgConnection, user_id: Uuid) -> HashMap<&'static str, i64> {
    let mut progress = HashMap::new();
    for def in definitions() {
        let Some(source) = def.source else { continue };
        let value = match compute_source_value(conn, user_id, source) {
            Ok(value) => value,
            Err(e) => {
                warn!(achievement = def.id, %user_id, error = %e, "progress source unavailable, defaulting to zero");
                0
            }
        };
        progress.insert(def.id, value);
    }
    progress
}

/// Ratchet decision: store the live tier only when it outranks what is
/// already on record. Never demotes.
fn ratchet(stored: Option<Tier>, live: Option<Tier>) -> Option<Tier> {
    match (stored, live) {
        (None, Some(live)) => Some(live),
        (Some(stored), Some(live)) if live.rank() > stored.rank() => Some(live),
        _ => None,
    }
}

/// Persist tier upgrades for every automatic achievement. Stored tiers only
/// ever advance, so a member who later regresses below a threshold keeps
/// what they earned. The write is absolute (never a delta), which makes the
/// read-then-write race between concurrent refreshes benign.
pub fn refresh_stored_tiers(
    conn: &mut PgConnection,
    user_id: Uuid,
    progress: &HashMap<&'static str, i64>,
) -> QueryResult<()> {
    let stored: HashMap<String, Tier> = user_achievements::table
        .filter(user_achievements::user_id.eq(user_id))
        .load::<DbUserAchievement>(conn)?
        .into_iter()
        .filter_map(|row| Tier::parse(&row.tier).map(|t| (row.achievement_id, t)))
        .collect();

    for def in definitions() {
        if def.kind != AchievementKind::Automatic {
            continue;
        }
        let value = progress.get(def.id).copied().unwrap_or(0);
        let live = determine_tier(value, &def.tiers);
        let Some(upgrade) = ratchet(stored.get(def.id).copied(), live) else {
            continue;
        };

        diesel::insert_into(user_achievements::table)
            .values(DbUserAchievement {
                id: Uuid::new_v4(),
                user_id,
                achievement_id: def.id.to_string(),
                tier: upgrade.as_str().to_string(),
                achieved_at: Utc::now(),
            })
            .on_conflict((
                user_achievements::user_id,
                user_achievements::achievement_id,
            ))
            .do_update()
            .set((
                user_achievements::tier.eq(upgrade.as_str()),
                user_achievements::achieved_at.eq(Utc::now()),
            ))
            .execute(conn)?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct AchievementStatus {
    pub id: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub achieved: bool,
    pub tier: Option<Tier>,
    pub progress: i64,
    pub achieved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct AchievementStats {
    pub total: usize,
    pub earned: usize,
    pub special_earned: usize,
    pub login_streak: i64,
}

#[derive(Debug, Serialize)]
pub struct AchievementsResponse {
    pub achievements: Vec<AchievementStatus>,
    pub stats: AchievementStats,
}

fn status_for(
    def: &'static AchievementDef,
    progress: &HashMap<&'static str, i64>,
    stored: &HashMap<String, (Tier, DateTime<Utc>)>,
    grants: &HashMap<String, DateTime<Utc>>,
) -> AchievementStatus {
    let (achieved, tier, value, achieved_at) = match def.kind {
        AchievementKind::Manual => match grants.get(def.id) {
            Some(&awarded_at) => (true, Some(Tier::Special), 1, Some(awarded_at)),
            None => (false, None, 0, None),
        },
        AchievementKind::Automatic => {
            let value = progress.get(def.id).copied().unwrap_or(0);
            match stored.get(def.id) {
                Some(&(tier, at)) => (true, Some(tier), value, Some(at)),
                None => (false, None, value, None),
            }
        }
    };

    AchievementStatus {
        id: def.id,
        name: def.name,
        icon: def.icon,
        description: def.description,
        category: def.category,
        achieved,
        tier,
        progress: value,
        achieved_at,
    }
}

fn build_overview(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<AchievementsResponse, AchievementError> {
    let progress = compute_progress(conn, user_id);
    refresh_stored_tiers(conn, user_id, &progress)
        .map_err(|e| AchievementError::Database(e.to_string()))?;

    let stored: HashMap<String, (Tier, DateTime<Utc>)> = user_achievements::table
        .filter(user_achievements::user_id.eq(user_id))
        .load::<DbUserAchievement>(conn)
        .map_err(|e| AchievementError::Database(e.to_string()))?
        .into_iter()
        .filter_map(|row| {
            Tier::parse(&row.tier).map(|t| (row.achievement_id, (t, row.achieved_at)))
        })
        .collect();

    let grants: HashMap<String, DateTime<Utc>> = manual_achievements::table
        .filter(manual_achievements::user_id.eq(user_id))
        .load::<DbManualAchievement>(conn)
        .map_err(|e| AchievementError::Database(e.to_string()))?
        .into_iter()
        .map(|row| (row.achievement_id, row.awarded_at))
        .collect();

    let achievements: Vec<AchievementStatus> = definitions()
        .iter()
        .map(|def| status_for(def, &progress, &stored, &grants))
        .collect();

    let earned = achievements.iter().filter(|a| a.achieved).count();
    let special_earned = achievements
        .iter()
        .filter(|a| a.tier == Some(Tier::Special))
        .count();
    let stats = AchievementStats {
        total: achievements.len(),
        earned,
        special_earned,
        login_streak: progress.get("daily-grind").copied().unwrap_or(0),
    };

    Ok(AchievementsResponse {
        achievements,
        stats,
    })
}

pub async fn handle_get_achievements(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<AchievementsResponse>, AchievementError> {
    let pool = state.conn.clone();

    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| AchievementError::Database(e.to_string()))?;
        build_overview(&mut conn, user.id)
    })
    .await
    .map_err(|e| AchievementError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn handle_recheck_achievements(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, AchievementError> {
    let pool = state.conn.clone();

    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| AchievementError::Database(e.to_string()))?;
        let progress = compute_progress(&mut conn, user.id);
        refresh_stored_tiers(&mut conn, user.id, &progress)
            .map_err(|e| AchievementError::Database(e.to_string()))
    })
    .await
    .map_err(|e| AchievementError::Internal(e.to_string()))??;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub user_id: Uuid,
    pub achievement_id: String,
    pub note: Option<String>,
}

/// Insert a manual grant row. The unique key on (user, achievement) makes a
/// repeat grant a no-op rather than an error; returns how many rows were
/// actually written.
pub fn record_manual_grant(
    conn: &mut PgConnection,
    grant: DbManualAchievement,
) -> QueryResult<usize> {
    diesel::insert_into(manual_achievements::table)
        .values(grant)
        .on_conflict((
            manual_achievements::user_id,
            manual_achievements::achievement_id,
        ))
        .do_nothing()
        .execute(conn)
}

/// Admin grant of a manual achievement. Idempotent: the unique key on
/// (user, achievement) makes a repeat grant a no-op, not an error.
pub async fn handle_grant_achievement(
    State(state): State<Arc<AppState>>,
    admin: AuthUser,
    Json(req): Json<GrantRequest>,
) -> Result<Json<serde_json::Value>, AchievementError> {
    if !admin.is_admin {
        return Err(AchievementError::Forbidden(
            "Granting achievements requires an admin".to_string(),
        ));
    }
    match definition(&req.achievement_id) {
        Some(def) if def.kind == AchievementKind::Manual => {}
        Some(_) => {
            return Err(AchievementError::Validation(format!(
                "Achievement '{}' is computed automatically",
                req.achievement_id
            )))
        }
        None => {
            return Err(AchievementError::Validation(format!(
                "Unknown achievement '{}'",
                req.achievement_id
            )))
        }
    }

    let pool = state.conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| AchievementError::Database(e.to_string()))?;

        record_manual_grant(
            &mut conn,
            DbManualAchievement {
                id: Uuid::new_v4(),
                user_id: req.user_id,
                achievement_id: req.achievement_id,
                awarded_by: admin.id,
                note: req.note,
                awarded_at: Utc::now(),
            },
        )
        .map_err(|e| AchievementError::Database(e.to_string()))?;
        Ok::<_, AchievementError>(())
    })
    .await
    .map_err(|e| AchievementError::Internal(e.to_string()))??;

    Ok(Json(serde_json::json!({ "status": "granted" })))
}

pub fn configure_achievement_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/achievements", get(handle_get_achievements))
        .route("/api/achievements/recheck", post(handle_recheck_achievements))
        .route("/api/achievements/grant", post(handle_grant_achievement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn day(today: NaiveDate, back: i64) -> NaiveDate {
        today - Duration::days(back)
    }

    #[test]
    fn streak_counts_consecutive_days_and_stops_at_a_gap() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 26).unwrap();
        let dates = [day(today, 0), day(today, 1), day(today, 2), day(today, 5)];
        assert_eq!(login_streak(&dates, today), 3);
    }

    #[test]
    fn streak_survives_a_missing_today() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 26).unwrap();
        let dates = [day(today, 1), day(today, 2)];
        assert_eq!(login_streak(&dates, today), 2);
    }

    #[test]
    fn streak_is_zero_without_recent_logins() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 26).unwrap();
        assert_eq!(login_streak(&[], today), 0);
        assert_eq!(login_streak(&[day(today, 3)], today), 0);
    }

    #[test]
    fn ratchet_only_ever_advances() {
        assert_eq!(ratchet(None, Some(Tier::Bronze)), Some(Tier::Bronze));
        assert_eq!(
            ratchet(Some(Tier::Bronze), Some(Tier::Gold)),
            Some(Tier::Gold)
        );
        assert_eq!(ratchet(Some(Tier::Gold), Some(Tier::Bronze)), None);
        assert_eq!(ratchet(Some(Tier::Gold), Some(Tier::Gold)), None);
        assert_eq!(ratchet(Some(Tier::Gold), None), None);
        assert_eq!(ratchet(None, None), None);
    }

    #[test]
    fn stored_rank_is_non_decreasing_across_refreshes() {
        // Simulate a progress history that regresses between refreshes.
        let tiers = definitions::TierThresholds::graded(1, 10, 25, 50);
        let history = [0_i64, 12, 3, 26, 9, 1000, 2];

        let mut stored: Option<Tier> = None;
        let mut last_rank = 0;
        for value in history {
            if let Some(upgrade) = ratchet(stored, determine_tier(value, &tiers)) {
                stored = Some(upgrade);
            }
            let rank = stored.map(|t| t.rank()).unwrap_or(0);
            assert!(rank >= last_rank, "rank regressed at value {value}");
            last_rank = rank;
        }
        assert_eq!(stored, Some(Tier::Platinum));
    }
}
