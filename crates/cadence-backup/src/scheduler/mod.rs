//! In-process cron for the backup scheduler
//!
//! A [`SchedulerContext`] owns the process [`RunLock`] and the schedule
//! registrations. It is built by the sidecar entrypoint and handed to the
//! leadership handler, which runs it while this replica leads.

pub mod actions;
pub mod cron;
pub mod lock;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cadence_common::leader_election::{Clock, SystemClock};
use cadence_common::{Error, Result};

pub use actions::{BackupAction, CheckAction, RunOutcome, ScheduledAction};
pub use cron::{CronExpr, CronParseError};
pub use lock::{RunGuard, RunLock};

/// Schedule of the repository integrity check (every third day at midnight)
pub const CHECK_SCHEDULE: &str = "0 0 */3 * *";

struct ScheduleEntry {
    expr: CronExpr,
    action: Arc<dyn ScheduledAction>,
}

/// Lock plus schedule registrations of one process
pub struct SchedulerContext {
    lock: RunLock,
    clock: Arc<dyn Clock>,
    entries: Vec<ScheduleEntry>,
}

impl SchedulerContext {
    /// Empty context with an available lock
    pub fn new() -> Self {
        Self {
            lock: RunLock::new(),
            clock: Arc::new(SystemClock),
            entries: Vec::new(),
        }
    }

    /// Share an existing run lock
    ///
    /// Every leadership term of a process uses the same lock, so a run left
    /// over from an earlier term still excludes new ones.
    pub fn with_lock(mut self, lock: RunLock) -> Self {
        self.lock = lock;
        self
    }

    /// Use a different wall clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fire `action` on `schedule`
    pub fn register(&mut self, schedule: &str, action: Arc<dyn ScheduledAction>) -> Result<()> {
        let expr = CronExpr::parse(schedule).map_err(|e| {
            Error::validation(format!("invalid schedule {schedule:?} for {}: {e}", action.name()))
        })?;
        self.entries.push(ScheduleEntry { expr, action });
        Ok(())
    }

    /// The lock shared by all registered actions
    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Fire registered actions until `shutdown` is cancelled
    ///
    /// Each firing runs on its own task. Cancelling stops new firings; runs
    /// already started are left to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut timers = JoinSet::new();
        for index in 0..self.entries.len() {
            let ctx = self.clone();
            let shutdown = shutdown.clone();
            timers.spawn(async move { ctx.drive(index, shutdown).await });
        }
        info!(schedules = self.entries.len(), "Backup scheduler started");

        while timers.join_next().await.is_some() {}
        info!("Backup scheduler stopped");
    }

    async fn drive(&self, index: usize, shutdown: CancellationToken) {
        let entry = &self.entries[index];
        let mut last_fired: Option<DateTime<Utc>> = None;
        loop {
            let now = self.clock.now();
            // Never fire the same tick twice if the timer wakes early
            let from = last_fired.filter(|l| *l > now).unwrap_or(now);
            let Some(next) = entry.expr.next_after(from) else {
                warn!(schedule = %entry.expr, action = entry.action.name(), "Schedule never fires again");
                return;
            };
            let delay = (next - now).to_std().unwrap_or_default();
            debug!(action = entry.action.name(), next = %next, "Next run scheduled");

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            last_fired = Some(next);

            let action = entry.action.clone();
            let lock = self.lock.clone();
            tokio::spawn(async move {
                let outcome = action.fire(&lock).await;
                debug!(action = action.name(), ?outcome, "Scheduled run finished");
            });
        }
    }
}

impl Default for SchedulerContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use tokio::time::Instant;

    /// Wall clock that follows tokio's (pausable) clock
    struct TokioClock {
        base: DateTime<Utc>,
        start: Instant,
    }

    impl TokioClock {
        fn starting_at(base: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                base,
                start: Instant::now(),
            })
        }
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap_or_default()
        }
    }

    /// Holds the lock for `hold` and tracks overlap
    struct RecordingAction {
        hold: Duration,
        fired: AtomicUsize,
        ran: AtomicUsize,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl RecordingAction {
        fn new(hold: Duration, active: Arc<AtomicUsize>, max_active: Arc<AtomicUsize>) -> Self {
            Self {
                hold,
                fired: AtomicUsize::new(0),
                ran: AtomicUsize::new(0),
                active,
                max_active,
            }
        }
    }

    #[async_trait]
    impl ScheduledAction for RecordingAction {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn fire(&self, lock: &RunLock) -> RunOutcome {
            self.fired.fetch_add(1, Ordering::SeqCst);
            let Some(_guard) = lock.try_acquire() else {
                return RunOutcome::Skipped;
            };
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.ran.fetch_add(1, Ordering::SeqCst);
            RunOutcome::Completed
        }
    }

    fn recording(hold: Duration) -> Arc<RecordingAction> {
        Arc::new(RecordingAction::new(
            hold,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        ))
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap()
    }

    #[test]
    fn invalid_schedule_is_rejected() {
        let mut ctx = SchedulerContext::new();
        let err = ctx
            .register("every minute", recording(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn story_fires_on_each_cron_tick_until_shutdown() {
        let action = recording(Duration::ZERO);
        let mut ctx = SchedulerContext::new().with_clock(TokioClock::starting_at(start()));
        ctx.register("* * * * *", action.clone()).unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(ctx).run(shutdown.clone()));

        // Ticks at 00:01, 00:02 and 00:03
        tokio::time::sleep(Duration::from_secs(190)).await;
        assert_eq!(action.ran.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(action.ran.load(Ordering::SeqCst), 3, "no firing after shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn story_overlapping_ticks_are_skipped_not_queued() {
        // Each run outlasts the next two ticks
        let action = recording(Duration::from_secs(150));
        let mut ctx = SchedulerContext::new().with_clock(TokioClock::starting_at(start()));
        ctx.register("* * * * *", action.clone()).unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(ctx).run(shutdown.clone()));

        // Ticks at 30s, 90s, 150s, 210s; the first run holds the lock until 180s
        tokio::time::sleep(Duration::from_secs(215)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(action.fired.load(Ordering::SeqCst), 4);
        assert_eq!(action.max_active.load(Ordering::SeqCst), 1);

        // The run started at 210s is not cancelled by shutdown
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(action.ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn story_backup_and_check_never_hold_the_lock_together() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let backup = Arc::new(RecordingAction::new(
            Duration::from_secs(45),
            active.clone(),
            max_active.clone(),
        ));
        let check = Arc::new(RecordingAction::new(
            Duration::from_secs(70),
            active.clone(),
            max_active.clone(),
        ));

        let mut ctx = SchedulerContext::new().with_clock(TokioClock::starting_at(start()));
        ctx.register("* * * * *", backup.clone()).unwrap();
        ctx.register("*/2 * * * *", check.clone()).unwrap();
        ctx.register("*/3 * * * *", backup.clone()).unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(ctx).run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(60 * 30)).await;
        shutdown.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        let fired = backup.fired.load(Ordering::SeqCst) + check.fired.load(Ordering::SeqCst);
        let ran = backup.ran.load(Ordering::SeqCst) + check.ran.load(Ordering::SeqCst);
        assert!(ran > 0);
        assert!(ran < fired, "contended ticks must be skipped");
    }

    #[test]
    fn check_schedule_is_valid() {
        assert!(CronExpr::parse(CHECK_SCHEDULE).is_ok());
    }
}
