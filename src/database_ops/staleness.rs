//! Decides whether a game's external-source link needs re-syncing.
//!
//! Rules are evaluated in order and the first match wins:
//! 1. never synced,
//! 2. synced before the game's release,
//! 3. released within the last 14 days: 3-day threshold,
//! 4. otherwise a threshold picked by `update_priority` (>= 60: 7 days, else 30 days).
//!
//! Thresholds are strict "older than": a link synced exactly 7 days ago is still fresh.
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::database_ops::models::{Game, GameExternalSource};

pub const RECENT_RELEASE_WINDOW_DAYS: i64 = 14;
pub const RECENT_RELEASE_THRESHOLD_DAYS: i64 = 3;
pub const HIGH_PRIORITY_MIN: i32 = 60;
pub const HIGH_PRIORITY_THRESHOLD_DAYS: i64 = 7;
pub const DEFAULT_THRESHOLD_DAYS: i64 = 30;

/// Which rule settled the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessReason {
    NeverSynced,
    SyncedBeforeRelease,
    RecentRelease,
    HighPriority,
    DefaultPriority,
}

impl StalenessReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StalenessReason::NeverSynced => "never_synced",
            StalenessReason::SyncedBeforeRelease => "synced_before_release",
            StalenessReason::RecentRelease => "recent_release",
            StalenessReason::HighPriority => "high_priority",
            StalenessReason::DefaultPriority => "default_priority",
        }
    }

    /// Re-sync threshold applied by the rule, if it is a time-based one.
    pub fn threshold(self) -> Option<Duration> {
        match self {
            StalenessReason::NeverSynced | StalenessReason::SyncedBeforeRelease => None,
            StalenessReason::RecentRelease => Some(Duration::days(RECENT_RELEASE_THRESHOLD_DAYS)),
            StalenessReason::HighPriority => Some(Duration::days(HIGH_PRIORITY_THRESHOLD_DAYS)),
            StalenessReason::DefaultPriority => Some(Duration::days(DEFAULT_THRESHOLD_DAYS)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StalenessVerdict {
    pub stale: bool,
    pub reason: StalenessReason,
}

pub fn evaluate(game: &Game, link: &GameExternalSource, now: DateTime<Utc>) -> StalenessVerdict {
    let Some(last_synced_at) = link.last_synced_at else {
        return StalenessVerdict {
            stale: true,
            reason: StalenessReason::NeverSynced,
        };
    };

    if let Some(released) = game.first_release_date {
        if last_synced_at < released {
            return StalenessVerdict {
                stale: true,
                reason: StalenessReason::SyncedBeforeRelease,
            };
        }
    }

    let reason = if is_recent_release(game.first_release_date, now) {
        StalenessReason::RecentRelease
    } else if game.update_priority >= HIGH_PRIORITY_MIN {
        StalenessReason::HighPriority
    } else {
        StalenessReason::DefaultPriority
    };
    let threshold = reason
        .threshold()
        .unwrap_or_else(|| Duration::days(DEFAULT_THRESHOLD_DAYS));

    StalenessVerdict {
        stale: last_synced_at < now - threshold,
        reason,
    }
}

pub fn is_stale(game: &Game, link: &GameExternalSource, now: DateTime<Utc>) -> bool {
    evaluate(game, link, now).stale
}

// Released at or after `now - 14 days` and not in the future.
fn is_recent_release(released: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match released {
        Some(at) => at <= now && at >= now - Duration::days(RECENT_RELEASE_WINDOW_DAYS),
        None => false,
    }
}
