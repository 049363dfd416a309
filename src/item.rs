use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two kinds of assignable work. Each kind has its own source collection,
/// its own materialized view and its own refresh job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// A survey response awaiting quality review.
    Review,
    /// A respondent phone number awaiting a call.
    Dial,
}

impl WorkKind {
    pub const ALL: [WorkKind; 2] = [WorkKind::Review, WorkKind::Dial];
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkKind::Review => write!(f, "review"),
            WorkKind::Dial => write!(f, "dial"),
        }
    }
}

impl FromStr for WorkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "review" => Ok(WorkKind::Review),
            "dial" => Ok(WorkKind::Dial),
            other => Err(format!("unknown work kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Leased,
    Resolved,
    Stale,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Resolved | ItemStatus::Stale)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "pending"),
            ItemStatus::Leased => write!(f, "leased"),
            ItemStatus::Resolved => write!(f, "resolved"),
            ItemStatus::Stale => write!(f, "stale"),
        }
    }
}

/// A time-bounded exclusive claim on one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub survey_id: String,
    #[serde(default)]
    pub language: Option<String>,
    /// Whether the response carries a playable recording.
    #[serde(default)]
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialPayload {
    pub campaign_id: String,
    pub phone: String,
    #[serde(default)]
    pub language: Option<String>,
    /// Set when the contact already belongs to a batch handed to a dialer.
    #[serde(default)]
    pub batch_id: Option<String>,
}

/// Kind-specific fields owned by ingestion flows. The core only reads the
/// category and locale used for claim filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Review(ReviewPayload),
    Dial(DialPayload),
}

impl Payload {
    pub fn kind(&self) -> WorkKind {
        match self {
            Payload::Review(_) => WorkKind::Review,
            Payload::Dial(_) => WorkKind::Dial,
        }
    }

    /// Survey for a review, campaign for a dial.
    pub fn category(&self) -> &str {
        match self {
            Payload::Review(p) => &p.survey_id,
            Payload::Dial(p) => &p.campaign_id,
        }
    }

    pub fn locale(&self) -> Option<&str> {
        match self {
            Payload::Review(p) => p.language.as_deref(),
            Payload::Dial(p) => p.language.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Categorical attribute resolved to a priority rank.
    pub region: String,
    pub status: ItemStatus,
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub last_skipped_at: Option<DateTime<Utc>>,
    pub payload: Payload,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, region: impl Into<String>, payload: Payload) -> Self {
        Self::with_created_at(id, region, payload, Utc::now())
    }

    pub fn with_created_at(
        id: impl Into<String>,
        region: impl Into<String>,
        payload: Payload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            status: ItemStatus::Pending,
            lease: None,
            created_at,
            last_activity_at: created_at,
            last_skipped_at: None,
            payload,
        }
    }

    pub fn kind(&self) -> WorkKind {
        self.payload.kind()
    }

    /// Status as every reader must see it: a leased item whose lease has
    /// lapsed (or vanished) counts as pending.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ItemStatus {
        match (self.status, &self.lease) {
            (ItemStatus::Leased, Some(lease)) if !lease.is_expired(now) => ItemStatus::Leased,
            (ItemStatus::Leased, _) => ItemStatus::Pending,
            (status, _) => status,
        }
    }

    /// The lease, if it is still in force.
    pub fn active_lease(&self, now: DateTime<Utc>) -> Option<&Lease> {
        match self.effective_status(now) {
            ItemStatus::Leased => self.lease.as_ref(),
            _ => None,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == ItemStatus::Pending
    }

    /// Position inside a priority tier. Skipping moves an item to the back.
    pub fn queue_position(&self) -> DateTime<Utc> {
        match self.last_skipped_at {
            Some(skipped) if skipped > self.created_at => skipped,
            _ => self.created_at,
        }
    }
}

/// How an agent finished with a leased item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Completed,
    Abandoned,
    Skipped,
}

impl std::fmt::Display for ReleaseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseOutcome::Completed => write!(f, "completed"),
            ReleaseOutcome::Abandoned => write!(f, "abandoned"),
            ReleaseOutcome::Skipped => write!(f, "skipped"),
        }
    }
}
