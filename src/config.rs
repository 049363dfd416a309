use std::time::Duration;

use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::item::WorkKind;

/// Tuning for one kind's view refresh job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshConfig {
    /// Time between refresh ticks
    pub interval: Duration,
    /// Only items created within this window are scanned
    pub recent_window: Duration,
    /// Hard cap on source rows read per cycle
    pub row_cap: usize,
    /// View entries written per upsert call
    pub batch_size: usize,
    /// A cycle running longer than this is abandoned
    pub cycle_timeout: Duration,
}

impl RefreshConfig {
    pub fn review_default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            recent_window: Duration::from_secs(24 * 60 * 60),
            row_cap: 5_000,
            batch_size: 200,
            cycle_timeout: Duration::from_secs(50),
        }
    }

    pub fn dial_default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            recent_window: Duration::from_secs(24 * 60 * 60),
            row_cap: 5_000,
            batch_size: 200,
            cycle_timeout: Duration::from_secs(12),
        }
    }
}

/// Leader lock settings.
///
/// The holder renews well inside the TTL so that one missed renewal does not
/// hand leadership to another instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderConfig {
    pub key: String,
    /// Identity written into the lock; unique per process.
    pub holder_id: String,
    pub ttl: Duration,
    pub renew_interval: Duration,
    /// Any lock store call slower than this counts as a failure.
    pub op_timeout: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            key: "assign-lite/view-refresher".to_string(),
            holder_id: Uuid::new_v4().to_string(),
            ttl: Duration::from_secs(60),
            renew_interval: Duration::from_secs(30),
            op_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub lease_duration: Duration,
    /// View entries not refreshed within this bound are purged.
    pub staleness_bound: Duration,
    /// Candidates tried by one `claim_next` before reporting an empty queue.
    pub max_claim_attempts: usize,
    pub review: RefreshConfig,
    pub dial: RefreshConfig,
    pub leader: LeaderConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30 * 60),
            staleness_bound: Duration::from_secs(60 * 60),
            max_claim_attempts: 8,
            review: RefreshConfig::review_default(),
            dial: RefreshConfig::dial_default(),
            leader: LeaderConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn refresh(&self, kind: WorkKind) -> &RefreshConfig {
        match kind {
            WorkKind::Review => &self.review,
            WorkKind::Dial => &self.dial,
        }
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_refresh(mut self, kind: WorkKind, refresh: RefreshConfig) -> Self {
        match kind {
            WorkKind::Review => self.review = refresh,
            WorkKind::Dial => self.dial = refresh,
        }
        self
    }

    pub fn with_leader(mut self, leader: LeaderConfig) -> Self {
        self.leader = leader;
        self
    }

    /// Reject settings that would break the lease or leadership guarantees.
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero() {
            return Err(QueueError::InvalidConfig(
                "lease duration must be positive".to_string(),
            ));
        }
        if self.max_claim_attempts == 0 {
            return Err(QueueError::InvalidConfig(
                "max claim attempts must be at least 1".to_string(),
            ));
        }
        if self.leader.renew_interval >= self.leader.ttl {
            return Err(QueueError::InvalidConfig(format!(
                "leader renew interval ({:?}) must be shorter than the lock TTL ({:?})",
                self.leader.renew_interval, self.leader.ttl
            )));
        }
        if self.leader.holder_id.is_empty() {
            return Err(QueueError::InvalidConfig(
                "leader holder id must not be empty".to_string(),
            ));
        }
        for kind in WorkKind::ALL {
            let refresh = self.refresh(kind);
            if refresh.interval.is_zero() {
                return Err(QueueError::InvalidConfig(format!(
                    "{kind} refresh interval must be positive"
                )));
            }
            if refresh.row_cap == 0 || refresh.batch_size == 0 {
                return Err(QueueError::InvalidConfig(format!(
                    "{kind} row cap and batch size must be positive"
                )));
            }
            if refresh.cycle_timeout.is_zero() {
                return Err(QueueError::InvalidConfig(format!(
                    "{kind} cycle timeout must be positive"
                )));
            }
        }
        Ok(())
    }
}
