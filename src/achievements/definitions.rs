//! Static achievement catalog.
//!
//! Definitions are in-process configuration, not rows: the set changes with a
//! deploy, never at runtime. Automatic achievements map a numeric progress
//! value onto ordered tier thresholds; manual ones are granted by an admin
//! and are always `special`.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Special,
}

impl Tier {
    /// Rank for ratchet comparisons: bronze < silver < gold < platinum < special.
    pub fn rank(self) -> u8 {
        match self {
            Tier::Bronze => 1,
            Tier::Silver => 2,
            Tier::Gold => 3,
            Tier::Platinum => 4,
            Tier::Special => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Bronze => "bronze",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
            Tier::Platinum => "platinum",
            Tier::Special => "special",
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "bronze" => Some(Tier::Bronze),
            "silver" => Some(Tier::Silver),
            "gold" => Some(Tier::Gold),
            "platinum" => Some(Tier::Platinum),
            "special" => Some(Tier::Special),
            _ => None,
        }
    }
}

/// Which raw activity counter feeds an automatic achievement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSource {
    /// Tricks mastered across both stances, optionally one trick category.
    TricksMastered { category: Option<&'static str> },
    ArticlesKnown,
    EventsAttended,
    OrdersCompleted,
    AccountAgeDays,
    /// 1 when the profile has an avatar, else 0.
    ProfileComplete,
    LoginStreak,
}

/// Thresholds are cumulative: reaching a value earns the highest tier whose
/// threshold it meets. An achievement carries either graded thresholds or a
/// single `special` threshold, not both.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierThresholds {
    pub bronze: Option<i64>,
    pub silver: Option<i64>,
    pub gold: Option<i64>,
    pub platinum: Option<i64>,
    pub special: Option<i64>,
}

impl TierThresholds {
    pub const fn graded(bronze: i64, silver: i64, gold: i64, platinum: i64) -> Self {
        Self {
            bronze: Some(bronze),
            silver: Some(silver),
            gold: Some(gold),
            platinum: Some(platinum),
            special: None,
        }
    }

    pub const fn special(threshold: i64) -> Self {
        Self {
            bronze: None,
            silver: None,
            gold: None,
            platinum: None,
            special: Some(threshold),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AchievementKind {
    Automatic,
    Manual,
}

#[derive(Debug, Clone)]
pub struct AchievementDef {
    pub id: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub kind: AchievementKind,
    pub source: Option<ProgressSource>,
    pub tiers: TierThresholds,
}

impl AchievementDef {
    const fn automatic(
        id: &'static str,
        name: &'static str,
        icon: &'static str,
        description: &'static str,
        category: &'static str,
        source: ProgressSource,
        tiers: TierThresholds,
    ) -> Self {
        Self {
            id,
            name,
            icon,
            description,
            category,
            kind: AchievementKind::Automatic,
            source: Some(source),
            tiers,
        }
    }

    const fn manual(
        id: &'static str,
        name: &'static str,
        icon: &'static str,
        description: &'static str,
        category: &'static str,
    ) -> Self {
        Self {
            id,
            name,
            icon,
            description,
            category,
            kind: AchievementKind::Manual,
            source: None,
            tiers: TierThresholds {
                bronze: None,
                silver: None,
                gold: None,
                platinum: None,
                special: None,
            },
        }
    }
}

static DEFINITIONS: Lazy<Vec<AchievementDef>> = Lazy::new(|| {
    vec![
        AchievementDef::automatic(
            "trick-collector",
            "Trick Collector",
            "🛹",
            "Master tricks in any category, both stances count",
            "tricks",
            ProgressSource::TricksMastered { category: None },
            TierThresholds::graded(1, 10, 25, 50),
        ),
        AchievementDef::automatic(
            "flip-fanatic",
            "Flip Fanatic",
            "🔄",
            "Master flip tricks",
            "tricks",
            ProgressSource::TricksMastered {
                category: Some("flip"),
            },
            TierThresholds::graded(1, 5, 15, 30),
        ),
        AchievementDef::automatic(
            "grind-guru",
            "Grind Guru",
            "🛤️",
            "Master grind tricks",
            "tricks",
            ProgressSource::TricksMastered {
                category: Some("grind"),
            },
            TierThresholds::graded(1, 5, 15, 30),
        ),
        AchievementDef::automatic(
            "bookworm",
            "Bookworm",
            "📚",
            "Mark club articles as known",
            "learning",
            ProgressSource::ArticlesKnown,
            TierThresholds::graded(1, 10, 25, 60),
        ),
        AchievementDef::automatic(
            "session-regular",
            "Session Regular",
            "📅",
            "Attend club events",
            "events",
            ProgressSource::EventsAttended,
            TierThresholds::graded(1, 5, 15, 40),
        ),
        AchievementDef::automatic(
            "shop-supporter",
            "Shop Supporter",
            "🛒",
            "Complete orders in the club shop",
            "shop",
            ProgressSource::OrdersCompleted,
            TierThresholds::graded(1, 3, 10, 25),
        ),
        AchievementDef::automatic(
            "club-veteran",
            "Club Veteran",
            "🏛️",
            "Days since joining the club",
            "membership",
            ProgressSource::AccountAgeDays,
            TierThresholds::graded(30, 180, 365, 1000),
        ),
        AchievementDef::automatic(
            "face-to-the-name",
            "Face to the Name",
            "🖼️",
            "Upload a profile picture",
            "membership",
            ProgressSource::ProfileComplete,
            TierThresholds::special(1),
        ),
        AchievementDef::automatic(
            "daily-grind",
            "Daily Grind",
            "🔥",
            "Log in on consecutive days",
            "membership",
            ProgressSource::LoginStreak,
            TierThresholds::graded(3, 7, 30, 100),
        ),
        AchievementDef::manual(
            "founding-member",
            "Founding Member",
            "🏅",
            "Was there when it all started",
            "membership",
        ),
        AchievementDef::manual(
            "staff-pick",
            "Staff Pick",
            "⭐",
            "Recognized by the club staff",
            "community",
        ),
    ]
});

pub fn definitions() -> &'static [AchievementDef] {
    &DEFINITIONS
}

pub fn definition(id: &str) -> Option<&'static AchievementDef> {
    DEFINITIONS.iter().find(|d| d.id == id)
}

/// Resolve a live progress value to a tier. Special-threshold achievements
/// resolve only to `special` or nothing; graded ones resolve to the highest
/// tier whose threshold the value meets.
pub fn determine_tier(value: i64, tiers: &TierThresholds) -> Option<Tier> {
    if let Some(special) = tiers.special {
        return (value >= special).then_some(Tier::Special);
    }
    for (threshold, tier) in [
        (tiers.platinum, Tier::Platinum),
        (tiers.gold, Tier::Gold),
        (tiers.silver, Tier::Silver),
        (tiers.bronze, Tier::Bronze),
    ] {
        if let Some(threshold) = threshold {
            if value >= threshold {
                return Some(tier);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graded_thresholds_resolve_to_highest_met_tier() {
        let tiers = TierThresholds::graded(1, 10, 25, 50);
        assert_eq!(determine_tier(0, &tiers), None);
        assert_eq!(determine_tier(1, &tiers), Some(Tier::Bronze));
        assert_eq!(determine_tier(9, &tiers), Some(Tier::Bronze));
        assert_eq!(determine_tier(10, &tiers), Some(Tier::Silver));
        assert_eq!(determine_tier(50, &tiers), Some(Tier::Platinum));
        assert_eq!(determine_tier(1000, &tiers), Some(Tier::Platinum));
    }

    #[test]
    fn special_thresholds_resolve_only_to_special() {
        let tiers = TierThresholds::special(1);
        assert_eq!(determine_tier(0, &tiers), None);
        assert_eq!(determine_tier(1, &tiers), Some(Tier::Special));
        assert_eq!(determine_tier(5, &tiers), Some(Tier::Special));
    }

    #[test]
    fn tier_ranks_are_strictly_ordered() {
        let ranks: Vec<u8> = [
            Tier::Bronze,
            Tier::Silver,
            Tier::Gold,
            Tier::Platinum,
            Tier::Special,
        ]
        .iter()
        .map(|t| t.rank())
        .collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn tier_strings_round_trip() {
        for tier in [
            Tier::Bronze,
            Tier::Silver,
            Tier::Gold,
            Tier::Platinum,
            Tier::Special,
        ] {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(Tier::parse("diamond"), None);
    }

    #[test]
    fn catalog_ids_are_unique() {
        let mut ids: Vec<&str> = definitions().iter().map(|d| d.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), definitions().len());
    }

    #[test]
    fn automatic_definitions_carry_a_source() {
        for def in definitions() {
            match def.kind {
                AchievementKind::Automatic => assert!(def.source.is_some(), "{}", def.id),
                AchievementKind::Manual => assert!(def.source.is_none(), "{}", def.id),
            }
        }
    }
}
