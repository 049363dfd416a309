use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::item::WorkKind;
use crate::leader::Leadership;
use crate::refresh::refresher::ViewRefresher;

/// Why a tick did not start a cycle, or the handle of the cycle it started.
#[derive(Debug)]
pub enum TickOutcome {
    NotLeader,
    /// The previous cycle is still running.
    Busy,
    Started(JoinHandle<()>),
}

/// Clears the busy flag when the cycle task ends, is aborted or panics.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One periodic refresh job with its own run-state.
#[derive(Clone)]
pub struct RefreshJob {
    refresher: Arc<ViewRefresher>,
    busy: Arc<AtomicBool>,
}

impl RefreshJob {
    pub fn new(refresher: ViewRefresher) -> Self {
        Self {
            refresher: Arc::new(refresher),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> WorkKind {
        self.refresher.kind()
    }

    pub fn interval(&self) -> Duration {
        self.refresher.config().interval
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start a cycle if this process leads and no cycle is in flight.
    pub fn tick(&self, leadership: &Leadership) -> TickOutcome {
        let kind = self.kind();
        if !leadership.is_leader() {
            return TickOutcome::NotLeader;
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            tracing::debug!(kind = %kind, "Previous refresh cycle still running, tick skipped");
            return TickOutcome::Busy;
        }

        let guard = BusyGuard(self.busy.clone());
        let refresher = self.refresher.clone();
        let cycle_timeout = refresher.config().cycle_timeout;

        TickOutcome::Started(tokio::spawn(async move {
            let _guard = guard;
            let started = tokio::time::Instant::now();
            match tokio::time::timeout(cycle_timeout, refresher.run_cycle()).await {
                Ok(Ok(report)) => {
                    tracing::info!(
                        kind = %kind,
                        scanned = report.scanned,
                        upserted = report.upserted,
                        failed = report.failed,
                        marked_leased = report.marked_leased,
                        removed = report.resolved_removed + report.ineligible_removed,
                        swept = report.swept,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Refresh cycle complete"
                    );
                }
                Ok(Err(e)) => {
                    tracing::error!(kind = %kind, error = %e, "Refresh cycle failed");
                }
                Err(_) => {
                    tracing::error!(
                        kind = %kind,
                        timeout_ms = cycle_timeout.as_millis() as u64,
                        "Refresh cycle timed out"
                    );
                }
            }
        }))
    }
}

/// Runs every registered refresh job on its own interval, gated by leadership.
///
/// Holds all run-state itself, so independent schedulers can coexist in one
/// process (one per simulated instance in tests).
pub struct RefreshScheduler {
    jobs: Vec<RefreshJob>,
    leadership: Leadership,
}

impl RefreshScheduler {
    pub fn new(leadership: Leadership) -> Self {
        Self {
            jobs: Vec::new(),
            leadership,
        }
    }

    pub fn with_job(mut self, refresher: ViewRefresher) -> Self {
        self.jobs.push(RefreshJob::new(refresher));
        self
    }

    pub fn jobs(&self) -> &[RefreshJob] {
        &self.jobs
    }

    /// Drive all jobs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let handles: Vec<JoinHandle<()>> = self
            .jobs
            .into_iter()
            .map(|job| {
                let leadership = self.leadership.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(Self::job_loop(job, leadership, shutdown))
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Refresh job loop panicked");
            }
        }
    }

    async fn job_loop(job: RefreshJob, mut leadership: Leadership, shutdown: CancellationToken) {
        let kind = job.kind();
        let mut interval = tokio::time::interval(job.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut running: Option<JoinHandle<()>> = None;
        let mut watching = true;

        tracing::info!(kind = %kind, interval_ms = job.interval().as_millis() as u64, "Refresh job started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = interval.tick() => {
                    if let TickOutcome::Started(handle) = job.tick(&leadership) {
                        running = Some(handle);
                    }
                }

                alive = leadership.changed(), if watching => {
                    watching = alive;
                    if !leadership.is_leader() {
                        if let Some(handle) = running.take() {
                            if !handle.is_finished() {
                                handle.abort();
                                tracing::warn!(kind = %kind, "Refresh cycle aborted after losing leadership");
                            }
                        }
                    }
                }
            }
        }

        if let Some(handle) = running.take() {
            handle.abort();
        }
        tracing::info!(kind = %kind, "Refresh job stopped");
    }
}
