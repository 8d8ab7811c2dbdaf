use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::engine::{Engine, EngineError};
use crate::limits::COMPACT_CHECK_INTERVAL;
use crate::model::RoomId;
use crate::observability;

#[derive(Debug, thiserror::Error)]
#[error("invalid cron schedule {expr:?}: {reason}")]
pub struct ScheduleError {
    pub expr: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SweepError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
}

/// Accept classic 5-field cron by prefixing a seconds field.
pub fn normalize_schedule(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    Schedule::from_str(&normalize_schedule(expr)).map_err(|e| ScheduleError {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// A unit of background maintenance work.
#[async_trait]
pub trait SweepJob: Clone + Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Rows touched, for status reporting.
    fn affected(output: &Self::Output) -> usize;

    async fn run(&self) -> Result<Self::Output, EngineError>;
}

/// Releases expired, unclaimed holds back into the ledger.
#[derive(Clone)]
pub struct HoldCleanupJob {
    pub engine: Arc<Engine>,
}

#[async_trait]
impl SweepJob for HoldCleanupJob {
    type Output = usize;

    fn name(&self) -> &'static str {
        "hold_cleanup"
    }

    fn affected(output: &usize) -> usize {
        *output
    }

    async fn run(&self) -> Result<usize, EngineError> {
        self.engine.release_expired_holds().await
    }
}

/// Flags every occupied room for cleaning.
#[derive(Clone)]
pub struct NightAuditJob {
    pub engine: Arc<Engine>,
}

#[async_trait]
impl SweepJob for NightAuditJob {
    type Output = Vec<RoomId>;

    fn name(&self) -> &'static str {
        "night_audit"
    }

    fn affected(output: &Vec<RoomId>) -> usize {
        output.len()
    }

    async fn run(&self) -> Result<Vec<RoomId>, EngineError> {
        self.engine.mark_occupied_rooms_dirty().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// -1 when the run failed.
    pub affected: i64,
    pub message: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct RunRecord<T> {
    pub summary: RunSummary,
    /// `None` when the run failed or timed out.
    pub output: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepStatus {
    pub name: &'static str,
    pub schedule: String,
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<RunSummary>,
}

/// Scheduler for one job. Single-flight: at most one run at a time, whether
/// started by the schedule or by a manual trigger.
pub struct Sweeper<J: SweepJob> {
    job: J,
    schedule: Schedule,
    schedule_expr: String,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    /// Held by the job task itself, so it outlives a timed-out wait.
    run_lock: Arc<tokio::sync::Mutex<()>>,
    last_run: Mutex<Option<RunRecord<J::Output>>>,
    /// Most recent tick the scheduled loop fired for.
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

impl<J: SweepJob> Sweeper<J> {
    pub fn new(
        job: J,
        schedule_expr: &str,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Result<Self, ScheduleError> {
        Ok(Self {
            schedule: parse_schedule(schedule_expr)?,
            schedule_expr: normalize_schedule(schedule_expr),
            job,
            clock,
            timeout,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            last_run: Mutex::new(None),
            last_tick: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &'static str {
        self.job.name()
    }

    /// First tick after both the clock and the last fired tick.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let from = match *self.last_tick.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(fired) if fired > now => fired,
            _ => now,
        };
        self.schedule.after(&from).next()
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub fn last_run(&self) -> Option<RunRecord<J::Output>> {
        self.last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self) -> SweepStatus {
        SweepStatus {
            name: self.name(),
            schedule: self.schedule_expr.clone(),
            running: self.is_running(),
            next_run: self.next_run(),
            last_run: self.last_run().map(|r| r.summary),
        }
    }

    /// Run now. Rejected if a run is already in flight.
    pub async fn trigger(&self) -> Result<RunRecord<J::Output>, SweepError> {
        let Ok(running) = self.run_lock.clone().try_lock_owned() else {
            warn!("{}: manual trigger rejected, run in progress", self.name());
            return Err(SweepError::AlreadyRunning(self.name()));
        };
        Ok(self.run_once(running).await)
    }

    /// Fire on every schedule tick until `shutdown` is cancelled.
    /// A failed run is recorded; the next attempt is the next tick.
    pub async fn run_scheduled(&self, shutdown: CancellationToken) {
        info!("{} scheduled: {}", self.name(), self.schedule_expr);
        loop {
            let Some(next) = self.next_run() else {
                warn!("{}: schedule has no upcoming runs", self.name());
                return;
            };
            let wait = (next - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("{} stopped", self.name());
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
            *self.last_tick.lock().unwrap_or_else(|e| e.into_inner()) = Some(next);
            match self.run_lock.clone().try_lock_owned() {
                Ok(running) => {
                    self.run_once(running).await;
                }
                Err(_) => warn!("{}: tick skipped, previous run still in progress", self.name()),
            }
        }
    }

    async fn run_once(&self, running: OwnedMutexGuard<()>) -> RunRecord<J::Output> {
        let name = self.name();
        let started_at = self.clock.now();
        let start = Instant::now();

        // The job runs on its own task: a timeout stops waiting for it but
        // never drops it halfway through a commit. The run guard goes with it.
        let job = self.job.clone();
        let handle = tokio::spawn(async move {
            let _running = running;
            job.run().await
        });
        let result = tokio::time::timeout(self.timeout, handle).await;

        let elapsed = start.elapsed();
        let (output, message) = match result {
            Ok(Ok(Ok(output))) => {
                let affected = J::affected(&output);
                (Some(output), format!("{name} completed: {affected} affected"))
            }
            Ok(Ok(Err(e))) => {
                error!("{name} failed: {e}");
                (None, format!("{name} failed: {e}"))
            }
            Ok(Err(e)) => {
                error!("{name} task panicked: {e}");
                (None, format!("{name} failed: task aborted"))
            }
            Err(_) => {
                error!("{name} timed out after {}s", self.timeout.as_secs());
                (None, format!("{name} timed out after {}s", self.timeout.as_secs()))
            }
        };

        let success = output.is_some();
        let affected = output
            .as_ref()
            .map_or(-1, |o| J::affected(o) as i64);
        let status = if success { "ok" } else { "error" };
        metrics::counter!(observability::SWEEP_RUNS_TOTAL, "job" => name, "status" => status)
            .increment(1);
        metrics::histogram!(observability::SWEEP_DURATION_SECONDS, "job" => name)
            .record(elapsed.as_secs_f64());
        if affected > 0 {
            metrics::counter!(observability::SWEEP_AFFECTED_TOTAL, "job" => name)
                .increment(affected as u64);
            info!("{message}");
        }

        let record = RunRecord {
            summary: RunSummary {
                started_at,
                finished_at: self.clock.now(),
                duration_ms: elapsed.as_millis() as u64,
                affected,
                message,
                success,
            },
            output,
        };
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        record
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct CountingJob {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl SweepJob for CountingJob {
        type Output = usize;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn affected(output: &usize) -> usize {
            *output
        }

        async fn run(&self) -> Result<usize, EngineError> {
            tokio::time::sleep(self.delay).await;
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                Err(EngineError::WalError("disk gone".into()))
            } else {
                Ok(n)
            }
        }
    }

    fn job(delay: Duration, fail: bool) -> CountingJob {
        CountingJob {
            calls: Arc::new(AtomicUsize::new(0)),
            delay,
            fail,
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 10, 2, 0).unwrap()))
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert_eq!(normalize_schedule("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_schedule("0 0 3 * * *"), "0 0 3 * * *");
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("not a schedule").is_err());
    }

    #[test]
    fn next_run_follows_injected_clock() {
        let clock = clock();
        let sweeper = Sweeper::new(
            job(Duration::ZERO, false),
            "*/5 * * * *",
            clock.clone(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            sweeper.next_run(),
            Some(Utc.with_ymd_and_hms(2026, 5, 1, 10, 5, 0).unwrap())
        );
        clock.advance(chrono::Duration::minutes(4));
        assert_eq!(
            sweeper.next_run(),
            Some(Utc.with_ymd_and_hms(2026, 5, 1, 10, 10, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn trigger_records_last_run() {
        let sweeper =
            Sweeper::new(job(Duration::ZERO, false), "0 0 3 * * *", clock(), Duration::from_secs(1))
                .unwrap();
        assert!(sweeper.status().last_run.is_none());

        let record = sweeper.trigger().await.unwrap();
        assert!(record.summary.success);
        assert_eq!(record.summary.affected, 1);
        assert_eq!(record.output, Some(1));

        let status = sweeper.status();
        assert_eq!(status.name, "counting");
        assert!(!status.running);
        assert_eq!(status.last_run.unwrap().affected, 1);
    }

    #[tokio::test]
    async fn failure_reports_negative_count() {
        let sweeper =
            Sweeper::new(job(Duration::ZERO, true), "0 0 3 * * *", clock(), Duration::from_secs(1))
                .unwrap();
        let record = sweeper.trigger().await.unwrap();
        assert!(!record.summary.success);
        assert_eq!(record.summary.affected, -1);
        assert!(record.summary.message.contains("disk gone"));
    }

    #[tokio::test]
    async fn timeout_is_a_failed_run() {
        let sweeper = Sweeper::new(
            job(Duration::from_secs(5), false),
            "0 0 3 * * *",
            clock(),
            Duration::from_millis(50),
        )
        .unwrap();
        let record = sweeper.trigger().await.unwrap();
        assert!(!record.summary.success);
        assert!(record.summary.message.contains("timed out"));
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected() {
        let sweeper = Arc::new(
            Sweeper::new(
                job(Duration::from_millis(200), false),
                "0 0 3 * * *",
                clock(),
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let first = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.trigger().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sweeper.is_running());
        assert_eq!(
            sweeper.trigger().await.unwrap_err(),
            SweepError::AlreadyRunning("counting")
        );
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn timed_out_job_keeps_the_run_slot_until_it_ends() {
        let job = job(Duration::from_millis(300), false);
        let calls = job.calls.clone();
        let sweeper =
            Sweeper::new(job, "0 0 3 * * *", clock(), Duration::from_millis(50)).unwrap();

        let record = sweeper.trigger().await.unwrap();
        assert!(record.summary.message.contains("timed out"));
        assert!(sweeper.is_running());
        assert!(sweeper.status().running);
        assert_eq!(
            sweeper.trigger().await.unwrap_err(),
            SweepError::AlreadyRunning("counting")
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!sweeper.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scheduled_loop_fires_each_tick_once_and_stops_on_shutdown() {
        let five_past = Utc.with_ymd_and_hms(2026, 5, 1, 10, 5, 0).unwrap();
        let clock = Arc::new(ManualClock::new(five_past - chrono::Duration::milliseconds(100)));
        let job = job(Duration::ZERO, false);
        let calls = job.calls.clone();
        let sweeper =
            Arc::new(Sweeper::new(job, "*/5 * * * *", clock, Duration::from_secs(1)).unwrap());
        assert_eq!(sweeper.next_run(), Some(five_past));

        let shutdown = CancellationToken::new();
        let task = {
            let sweeper = sweeper.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sweeper.run_scheduled(shutdown).await })
        };
        // The clock stays frozen before 10:05, so a loop that forgot the
        // fired tick would run again on every pass.
        tokio::time::sleep(Duration::from_millis(400)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sweeper.last_run().unwrap().summary.success);
        assert_eq!(
            sweeper.next_run(),
            Some(Utc.with_ymd_and_hms(2026, 5, 1, 10, 10, 0).unwrap())
        );
    }
}
