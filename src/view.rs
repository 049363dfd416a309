//! Materialized view records.
//!
//! A [`ViewEntry`] is a denormalized projection of one pending [`WorkItem`],
//! ranked so that "give me the best available item" is a single ordered read.
//! Entries are hints: a consumer must always confirm against the work item
//! itself before treating it as assigned.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::{WorkItem, WorkKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Leased,
    Expired,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Availability::Available => write!(f, "available"),
            Availability::Leased => write!(f, "leased"),
            Availability::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEntry {
    pub source_id: String,
    pub kind: WorkKind,
    /// Normalized region used for priority lookup and filtering.
    pub rank_key: String,
    /// Lower is more urgent.
    pub priority: u32,
    pub availability: Availability,
    pub category: String,
    pub locale: Option<String>,
    pub created_at: DateTime<Utc>,
    /// FIFO position inside the priority tier; later than `created_at` once skipped.
    pub queued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sort key of the available index: priority, then FIFO position.
pub type RankOrder = (u32, DateTime<Utc>, DateTime<Utc>, String);

impl ViewEntry {
    pub fn from_item(item: &WorkItem, priority: u32, now: DateTime<Utc>) -> Self {
        Self {
            source_id: item.id.clone(),
            kind: item.kind(),
            rank_key: normalize_key(&item.region),
            priority,
            availability: Availability::Available,
            category: item.payload.category().to_string(),
            locale: item.payload.locale().map(str::to_string),
            created_at: item.created_at,
            queued_at: item.queue_position(),
            updated_at: now,
        }
    }

    pub fn rank_order(&self) -> RankOrder {
        (
            self.priority,
            self.queued_at,
            self.created_at,
            self.source_id.clone(),
        )
    }
}

/// Categorical keys compare trimmed and case-insensitively.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Narrowing applied to `claim_next`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFilter {
    pub rank_key: Option<String>,
    pub category: Option<String>,
    pub locale: Option<String>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_rank_key(mut self, rank_key: impl AsRef<str>) -> Self {
        self.rank_key = Some(normalize_key(rank_key.as_ref()));
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn matches(&self, entry: &ViewEntry) -> bool {
        if let Some(ref key) = self.rank_key {
            if &entry.rank_key != key {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if &entry.category != category {
                return false;
            }
        }
        if let Some(ref locale) = self.locale {
            if entry.locale.as_deref() != Some(locale.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Result of one batch upsert. Rows that fail do not block the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    /// `(source_id, reason)` for each rejected row.
    pub failed: Vec<(String, String)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub removed: usize,
    /// Entries still marked available when they aged out.
    pub removed_available: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub kind: WorkKind,
    pub available: usize,
    pub leased: usize,
    /// Available entries per rank key.
    pub by_rank_key: BTreeMap<String, usize>,
}

impl QueueDepth {
    pub fn empty(kind: WorkKind) -> Self {
        Self {
            kind,
            available: 0,
            leased: 0,
            by_rank_key: BTreeMap::new(),
        }
    }
}
