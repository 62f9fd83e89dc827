//! Feed item identity.
//!
//! A feed item is virtual, so interaction endpoints address it by a
//! synthesized id that stays stable across requests. The canonical
//! serialization is `kind_owner_entity`; an older two-part `kind:entity`
//! form (no owner) still circulates in saved client links for event and
//! achievement items and is accepted on parse.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedItemKind {
    Trick,
    Event,
    Achievement,
    Post,
}

impl FeedItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedItemKind::Trick => "trick",
            FeedItemKind::Event => "event",
            FeedItemKind::Achievement => "achievement",
            FeedItemKind::Post => "post",
        }
    }

    pub fn parse(s: &str) -> Option<FeedItemKind> {
        match s {
            "trick" => Some(FeedItemKind::Trick),
            "event" => Some(FeedItemKind::Event),
            "achievement" => Some(FeedItemKind::Achievement),
            "post" => Some(FeedItemKind::Post),
            _ => None,
        }
    }
}

impl fmt::Display for FeedItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (kind, owner, entity) triple identifying one logical feed item. `entity`
/// is the trick/event/post uuid or the achievement slug. A nil owner marks a
/// legacy, owner-unscoped reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedItemId {
    pub kind: FeedItemKind,
    pub owner_id: Uuid,
    pub entity_id: String,
}

impl FeedItemId {
    pub fn new(kind: FeedItemKind, owner_id: Uuid, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            owner_id,
            entity_id: entity_id.into(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.owner_id.is_nil()
    }
}

impl fmt::Display for FeedItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.kind, self.owner_id, self.entity_id)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid feed item id '{0}'")]
pub struct ParseFeedItemIdError(String);

impl FromStr for FeedItemId {
    type Err = ParseFeedItemIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseFeedItemIdError(s.to_string());

        // Legacy form: `kind:entity`, event/achievement only.
        if let Some((kind, entity)) = s.split_once(':') {
            let kind = FeedItemKind::parse(kind).ok_or_else(invalid)?;
            if !matches!(kind, FeedItemKind::Event | FeedItemKind::Achievement) {
                return Err(invalid());
            }
            if entity.is_empty() || entity.contains(':') {
                return Err(invalid());
            }
            return Ok(FeedItemId::new(kind, Uuid::nil(), entity));
        }

        let mut parts = s.splitn(3, '_');
        let kind = parts
            .next()
            .and_then(FeedItemKind::parse)
            .ok_or_else(invalid)?;
        let owner_id = parts
            .next()
            .and_then(|p| Uuid::parse_str(p).ok())
            .ok_or_else(invalid)?;
        let entity_id = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        Ok(FeedItemId::new(kind, owner_id, entity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_round_trips() {
        let owner = Uuid::new_v4();
        let entity = Uuid::new_v4();
        let id = FeedItemId::new(FeedItemKind::Trick, owner, entity.to_string());
        let parsed: FeedItemId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(!parsed.is_legacy());
    }

    #[test]
    fn achievement_slugs_survive_round_trip() {
        let id = FeedItemId::new(FeedItemKind::Achievement, Uuid::new_v4(), "daily-grind");
        let parsed: FeedItemId = id.to_string().parse().unwrap();
        assert_eq!(parsed.entity_id, "daily-grind");
    }

    #[test]
    fn legacy_form_is_accepted_for_events_and_achievements() {
        let event = Uuid::new_v4();
        let parsed: FeedItemId = format!("event:{event}").parse().unwrap();
        assert_eq!(parsed.kind, FeedItemKind::Event);
        assert!(parsed.is_legacy());
        assert_eq!(parsed.entity_id, event.to_string());

        let parsed: FeedItemId = "achievement:club-veteran".parse().unwrap();
        assert_eq!(parsed.kind, FeedItemKind::Achievement);
    }

    #[test]
    fn legacy_form_is_rejected_for_tricks_and_posts() {
        assert!(format!("trick:{}", Uuid::new_v4())
            .parse::<FeedItemId>()
            .is_err());
        assert!(format!("post:{}", Uuid::new_v4())
            .parse::<FeedItemId>()
            .is_err());
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for bad in ["", "trick", "banana_x_y", "trick_notauuid_x", "event:"] {
            assert!(bad.parse::<FeedItemId>().is_err(), "{bad}");
        }
    }
}
