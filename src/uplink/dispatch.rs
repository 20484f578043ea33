//! The dispatch engine's shared machinery.
//!
//! Every operation mode works the same way: resources are processed
//! strictly sequentially (dependency order forbids overlap), and within a
//! resource per-payload tasks fan out through a semaphore-bounded pool.
//! Counters are updated with atomics and dashmaps so unordered task
//! completion never races, and a ticker logs status counts while tasks are
//! outstanding. A resource is complete only when succeeded + failed +
//! skipped equals the number of enqueued payloads.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::info;

use crate::uplink::api::ApiClient;
use crate::uplink::config::AppConfig;
use crate::uplink::hashlog::{HashlogError, LogEntry};
use crate::uplink::metadata::{MetadataProvider, SchemaError};
use crate::uplink::report::{FailureDetail, ResourceOutcome, RunReporter};

/// Task-queue flush interval: bounds memory on very large files, not a
/// correctness requirement.
pub const MAX_TASK_QUEUE_SIZE: usize = 2000;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum RunError {
    #[error(
        "aborting: {failed} failures reached the configured maximum of {max}; \
         review the errors, fix data or network conditions, and run again"
    )]
    TooManyFailures { failed: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Api(#[from] crate::uplink::api::ApiError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Hashlog(#[from] HashlogError),

    #[error(transparent)]
    Selection(#[from] crate::uplink::directory::SelectionError),

    #[error("operation cancelled at the confirmation prompt")]
    NotConfirmed,
}

pub type RunResult<T> = Result<T, RunError>;

/// Decides whether an already-logged payload should be dispatched again.
/// The conditions are OR-ed: any one of them qualifies the payload for a
/// resend. A payload never seen before is always processed.
#[derive(Debug, Clone, Default)]
pub struct ReprocessPolicy {
    pub force: bool,
    pub older_than: Option<i64>,
    pub newer_than: Option<i64>,
    pub resend_status_codes: Vec<u16>,
}

impl ReprocessPolicy {
    pub fn should_process(&self, entry: Option<LogEntry>) -> bool {
        let entry = match entry {
            Some(entry) => entry,
            None => return true,
        };
        self.force
            || self.older_than.is_some_and(|cutoff| entry.last_sent < cutoff)
            || self.newer_than.is_some_and(|cutoff| entry.last_sent > cutoff)
            || self.resend_status_codes.contains(&entry.status)
    }
}

/// Grouping key for failure reporting: identical failures are collapsed to
/// one group carrying the affected line numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FailureKey {
    pub status: u16,
    pub message: String,
    pub file: String,
}

/// Per-resource counters, safe under interleaved task completion.
pub struct RunCounters {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    status_counts: DashMap<u16, usize>,
    failures: DashMap<FailureKey, Vec<usize>>,
    skip_reasons: DashMap<String, usize>,
    /// Set once the failure limit is reached; enqueue loops and tasks check
    /// it and stop dispatching further payloads.
    abort: AtomicBool,
    /// Terminal failures across the whole run. Every resource's counters
    /// share one cell, so the limit cannot reset between resources.
    run_failed: Arc<AtomicUsize>,
    failure_limit: usize,
}

impl RunCounters {
    pub fn new(failure_limit: usize) -> Self {
        Self::shared(failure_limit, Arc::new(AtomicUsize::new(0)))
    }

    /// Counters backed by a run-wide cumulative failure count.
    pub fn shared(failure_limit: usize, run_failed: Arc<AtomicUsize>) -> Self {
        Self {
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            status_counts: DashMap::new(),
            failures: DashMap::new(),
            skip_reasons: DashMap::new(),
            abort: AtomicBool::new(false),
            run_failed,
            failure_limit,
        }
    }

    pub fn increment_status(&self, status: u16) {
        *self.status_counts.entry(status).or_insert(0) += 1;
    }

    pub fn mark_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn skip_with_reason(&self, reason: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        *self.skip_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    /// Records a per-payload failure and trips the abort flag when the
    /// run-wide cumulative limit is reached.
    pub fn record_failure(&self, status: u16, message: String, file: String, line: usize) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        let cumulative = self.run_failed.fetch_add(1, Ordering::SeqCst) + 1;
        self.failures
            .entry(FailureKey { status, message, file })
            .or_default()
            .push(line);
        if self.failure_limit > 0 && cumulative >= self.failure_limit {
            self.abort.store(true, Ordering::SeqCst);
        }
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Terminal failures across the whole run so far.
    pub fn run_failed(&self) -> usize {
        self.run_failed.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Payloads accounted for so far; drives the ticker and the completion
    /// condition.
    pub fn settled(&self) -> usize {
        self.succeeded() + self.failed() + self.skipped()
    }

    pub fn status_counts_string(&self) -> String {
        let mut counts: Vec<(u16, usize)> = self
            .status_counts
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        counts.sort_by_key(|(status, _)| *status);
        counts
            .iter()
            .map(|(status, count)| format!("{status}: {count}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Snapshot for the run report.
    pub fn outcome(&self, resource: &str) -> ResourceOutcome {
        let mut failures: Vec<FailureDetail> = self
            .failures
            .iter()
            .map(|entry| {
                let mut lines = entry.value().clone();
                lines.sort_unstable();
                FailureDetail {
                    status: entry.key().status,
                    message: entry.key().message.clone(),
                    file: entry.key().file.clone(),
                    count: lines.len(),
                    lines,
                }
            })
            .collect();
        failures.sort_by(|a, b| (&a.file, a.status).cmp(&(&b.file, b.status)));

        let skip_reasons = self
            .skip_reasons
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        ResourceOutcome {
            resource: resource.to_string(),
            processed: self.succeeded(),
            skipped: self.skipped(),
            failed: self.failed(),
            failures,
            skip_reasons,
        }
    }

    /// Logs each failure group once, most frequent first.
    pub fn log_failure_summary(&self) {
        let mut groups: Vec<(FailureKey, usize)> = self
            .failures
            .iter()
            .map(|e| (e.key().clone(), e.value().len()))
            .collect();
        groups.sort_by(|a, b| b.1.cmp(&a.1));
        for (key, count) in groups {
            info!(
                "  {}x {} {} (from {})",
                count, key.status, key.message, key.file
            );
        }
        for entry in self.skip_reasons.iter() {
            info!("  {}x skipped: {}", entry.value(), entry.key());
        }
    }
}

/// Semaphore-bounded fan-out for one resource's payload tasks.
pub struct TaskPool {
    semaphore: Arc<Semaphore>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            handles: Vec::new(),
        }
    }

    /// Spawns a task that runs once it holds a pool permit.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        self.handles.push(tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            task.await;
        }));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Awaits every queued task, logging status counts every couple of
    /// seconds while work is outstanding.
    pub async fn drain(&mut self, counters: &RunCounters, total: usize) {
        if self.handles.is_empty() {
            return;
        }
        let mut all = futures::future::join_all(self.handles.drain(..));
        loop {
            tokio::select! {
                _ = &mut all => break,
                _ = tokio::time::sleep(STATUS_LOG_INTERVAL) => {
                    if counters.settled() < total && !counters.status_counts_string().is_empty() {
                        info!("  (status counts: {})", counters.status_counts_string());
                    }
                }
            }
        }
    }
}

/// Everything an operation mode needs: immutable config, the API client,
/// schema metadata, the resolved working set, and the run-wide reporter.
pub struct Engine {
    pub config: Arc<AppConfig>,
    pub api: Arc<ApiClient>,
    pub meta: MetadataProvider,
    /// Working set in dependency order, after selector/exclude resolution.
    pub resources: Vec<String>,
    pub policy: ReprocessPolicy,
    pub keep_keys: Vec<String>,
    pub drop_keys: Vec<String>,
    pub reporter: RunReporter,
    pub wipe_cache: bool,
    /// Backs every resource's counters; the failure limit applies to this
    /// cumulative count, not to any single resource.
    pub run_failures: Arc<AtomicUsize>,
}

impl Engine {
    pub fn counters(&self) -> Arc<RunCounters> {
        Arc::new(RunCounters::shared(
            self.config.run.max_failures,
            self.run_failures.clone(),
        ))
    }

    pub fn pool(&self) -> TaskPool {
        TaskPool::new(self.config.connection.pool_size)
    }

    /// Records a resource's outcome and fails the run when the failure
    /// limit was hit.
    pub fn finish_resource(&self, resource: &str, counters: &RunCounters) -> RunResult<()> {
        info!(
            "finished processing resource {resource}  (status counts: {})",
            counters.status_counts_string()
        );
        counters.log_failure_summary();
        self.reporter.record(counters.outcome(resource));
        if counters.aborted() {
            return Err(RunError::TooManyFailures {
                failed: counters.run_failed(),
                max: self.config.run.max_failures,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(last_sent: i64, status: u16) -> Option<LogEntry> {
        Some(LogEntry { last_sent, status })
    }

    #[test]
    fn unseen_payload_is_always_processed() {
        let policy = ReprocessPolicy::default();
        assert!(policy.should_process(None));
    }

    #[test]
    fn logged_payload_with_no_criteria_is_skipped() {
        let policy = ReprocessPolicy::default();
        assert!(!policy.should_process(entry(1000, 201)));
    }

    #[test]
    fn force_always_reprocesses() {
        let policy = ReprocessPolicy {
            force: true,
            ..Default::default()
        };
        assert!(policy.should_process(entry(1000, 201)));
    }

    #[test]
    fn older_than_reprocesses_earlier_entries() {
        let policy = ReprocessPolicy {
            older_than: Some(1001),
            ..Default::default()
        };
        assert!(policy.should_process(entry(1000, 201)));
        assert!(!policy.should_process(entry(1002, 201)));
    }

    #[test]
    fn newer_than_reprocesses_later_entries() {
        let policy = ReprocessPolicy {
            newer_than: Some(999),
            ..Default::default()
        };
        assert!(policy.should_process(entry(1000, 201)));
        assert!(!policy.should_process(entry(998, 201)));
    }

    #[test]
    fn resend_status_codes_match_the_logged_status() {
        let policy = ReprocessPolicy {
            resend_status_codes: vec![500, 502],
            ..Default::default()
        };
        assert!(policy.should_process(entry(1000, 500)));
        assert!(!policy.should_process(entry(1000, 201)));
    }

    #[test]
    fn conditions_are_or_ed() {
        // older_than misses but the status code matches: still a resend.
        let policy = ReprocessPolicy {
            older_than: Some(500),
            resend_status_codes: vec![400],
            ..Default::default()
        };
        assert!(policy.should_process(entry(1000, 400)));
    }

    #[test]
    fn failure_limit_trips_the_abort_flag() {
        let counters = RunCounters::new(2);
        counters.record_failure(400, "bad".into(), "x.jsonl".into(), 1);
        assert!(!counters.aborted());
        counters.record_failure(400, "bad".into(), "x.jsonl".into(), 2);
        assert!(counters.aborted());
    }

    #[test]
    fn failure_limit_is_cumulative_across_counter_sets() {
        // one failure in each of two resources must still trip a limit of 2
        let shared = Arc::new(AtomicUsize::new(0));
        let first = RunCounters::shared(2, shared.clone());
        first.record_failure(400, "bad".into(), "a.jsonl".into(), 1);
        assert!(!first.aborted());

        let second = RunCounters::shared(2, shared);
        second.record_failure(400, "bad".into(), "b.jsonl".into(), 1);
        assert!(second.aborted());
        assert_eq!(second.failed(), 1);
        assert_eq!(second.run_failed(), 2);
    }

    #[test]
    fn identical_failures_collapse_into_one_group() {
        let counters = RunCounters::new(0);
        counters.record_failure(400, "missing ref".into(), "s.jsonl".into(), 3);
        counters.record_failure(400, "missing ref".into(), "s.jsonl".into(), 7);
        counters.record_failure(409, "conflict".into(), "s.jsonl".into(), 9);
        let outcome = counters.outcome("students");
        assert_eq!(outcome.failed, 3);
        assert_eq!(outcome.failures.len(), 2);
        let group = outcome
            .failures
            .iter()
            .find(|f| f.status == 400)
            .unwrap();
        assert_eq!(group.lines, vec![3, 7]);
    }

    #[tokio::test]
    async fn task_pool_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = TaskPool::new(2);
        let counters = RunCounters::new(0);
        for _ in 0..16 {
            let active = active.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.drain(&counters, 16).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
