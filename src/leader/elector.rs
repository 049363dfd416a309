use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::LeaderConfig;
use crate::leader::lock::{LeaderLock, LockStore};
use crate::leader::timer::random_acquire_interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Follower,
    /// Holding the lock; trusted only until `valid_until` unless renewed.
    Leader { valid_until: Instant },
    /// Leading without a lock. Single-instance deployments and tests only.
    Pinned,
}

/// Read side of the election, cloned into every component that must only
/// act while this process leads.
#[derive(Debug, Clone)]
pub struct Leadership {
    rx: watch::Receiver<LeaderState>,
}

impl Leadership {
    /// A handle whose state never changes.
    pub fn fixed(leading: bool) -> Self {
        let state = if leading {
            LeaderState::Pinned
        } else {
            LeaderState::Follower
        };
        let (_tx, rx) = watch::channel(state);
        Self { rx }
    }

    pub fn state(&self) -> LeaderState {
        *self.rx.borrow()
    }

    /// True only while the lock is held and its TTL, as last confirmed, has
    /// not run out. A renewal loop that stalls therefore fails closed.
    pub fn is_leader(&self) -> bool {
        match self.state() {
            LeaderState::Follower => false,
            LeaderState::Leader { valid_until } => Instant::now() < valid_until,
            LeaderState::Pinned => true,
        }
    }

    /// Wait for the next state change. Returns `false` once the elector is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Acquires and renews the leader lock for one process.
///
/// Followers retry acquisition at a jittered interval no longer than the
/// renew interval, so a lapsed leader is replaced within one TTL. Leaders
/// renew every renew interval; the first failed renewal demotes them.
pub struct LeaderElector {
    lock: LeaderLock,
    state_tx: watch::Sender<LeaderState>,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn LockStore>, config: LeaderConfig) -> (Self, Leadership) {
        let (state_tx, rx) = watch::channel(LeaderState::Follower);
        let elector = Self {
            lock: LeaderLock::new(store, config),
            state_tx,
        };
        (elector, Leadership { rx })
    }

    pub fn leadership(&self) -> Leadership {
        Leadership {
            rx: self.state_tx.subscribe(),
        }
    }

    pub fn holder_id(&self) -> &str {
        self.lock.holder_id()
    }

    /// Run until `shutdown` fires, then relinquish the lock if held.
    pub async fn run(self, shutdown: CancellationToken) {
        let config = self.lock.config().clone();
        let mut leading = false;

        loop {
            let attempt_started = Instant::now();

            if leading {
                if self.lock.renew().await {
                    self.publish(LeaderState::Leader {
                        valid_until: attempt_started + config.ttl,
                    });
                } else {
                    leading = false;
                    self.publish(LeaderState::Follower);
                    tracing::warn!(
                        key = %config.key,
                        holder_id = %config.holder_id,
                        "Leadership lost, refresh jobs stopped"
                    );
                }
            } else if self.lock.try_acquire().await {
                leading = true;
                self.publish(LeaderState::Leader {
                    valid_until: attempt_started + config.ttl,
                });
                tracing::info!(
                    key = %config.key,
                    holder_id = %config.holder_id,
                    ttl_ms = config.ttl.as_millis() as u64,
                    "Acquired leadership"
                );
            }

            let wait = if leading {
                config.renew_interval
            } else {
                random_acquire_interval(config.renew_interval / 2, config.renew_interval)
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if leading {
            self.publish(LeaderState::Follower);
            if self.lock.release().await {
                tracing::info!(key = %config.key, holder_id = %config.holder_id, "Leadership relinquished");
            }
        }
    }

    fn publish(&self, state: LeaderState) {
        // send_replace keeps working with no receivers left
        self.state_tx.send_replace(state);
    }
}
