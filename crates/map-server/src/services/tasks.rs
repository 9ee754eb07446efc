//! TaskRunner - executes one job and decides what gets scheduled next.
//!
//! | outcome        | effect                                          |
//! |----------------|-------------------------------------------------|
//! | Done           | first follow-up runs immediately                |
//! | Continue(task) | new watch keeps the chain, attempt count resets |
//! | Retry          | same job re-enqueued with backoff               |
//! | Stale          | lineage ends, follow-ups dropped                |
//!
//! Retryable errors (facility unreachable, database busy) are treated as
//! Retry. Anything else, including a target that no longer exists, drops
//! the job.

use map_core::tasks::{Job, RetryDecision, RetryPolicy, Scheduler, Task};
use map_core::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::campaign::CampaignService;
use super::monitor::{MonitorOutcome, MonitorService};
use super::placement::{PlacementOutcome, PlacementService};

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TaskMetrics {
    scheduled: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    stale: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`TaskMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounters {
    pub scheduled: u64,
    pub completed: u64,
    pub retried: u64,
    pub stale: u64,
    pub dropped: u64,
}

impl TaskMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TaskCounters {
        TaskCounters {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Retry,
    Continue(Task),
    Stale,
}

impl<S> MonitorOutcome<S> {
    fn into_task_outcome(self, next: impl FnOnce(S) -> Task) -> TaskOutcome {
        match self {
            MonitorOutcome::Resolved => TaskOutcome::Done,
            MonitorOutcome::Retry => TaskOutcome::Retry,
            MonitorOutcome::Transitioned(status) => TaskOutcome::Continue(next(status)),
            MonitorOutcome::Stale => TaskOutcome::Stale,
        }
    }
}

pub struct TaskRunner {
    monitor: Arc<MonitorService>,
    placement: Arc<PlacementService>,
    campaigns: Arc<CampaignService>,
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
    metrics: Arc<TaskMetrics>,
}

impl TaskRunner {
    pub fn new(
        monitor: Arc<MonitorService>,
        placement: Arc<PlacementService>,
        campaigns: Arc<CampaignService>,
        scheduler: Arc<dyn Scheduler>,
        policy: RetryPolicy,
        metrics: Arc<TaskMetrics>,
    ) -> Self {
        Self {
            monitor,
            placement,
            campaigns,
            scheduler,
            policy,
            metrics,
        }
    }

    /// Run a task once
    pub async fn run(&self, task: &Task) -> Result<TaskOutcome> {
        match task {
            Task::PlaceExperiment {
                campaign,
                experiment,
            } => match self.placement.place(campaign, experiment).await? {
                PlacementOutcome::Placed { .. } | PlacementOutcome::AlreadyPlaced => {
                    Ok(TaskOutcome::Done)
                }
                PlacementOutcome::NoFacilityAccepted => {
                    info!(campaign = %campaign, experiment = %experiment, "No facility accepted experiment");
                    Ok(TaskOutcome::Retry)
                }
            },
            Task::MonitorExperiment {
                campaign,
                experiment,
                expected,
            } => Ok(self
                .monitor
                .watch_experiment(campaign, experiment, *expected)
                .await?
                .into_task_outcome(|status| {
                    Task::monitor_experiment(campaign.as_str(), experiment.as_str(), status)
                })),
            Task::MonitorStage {
                campaign,
                experiment,
                stage,
                expected,
            } => Ok(self
                .monitor
                .watch_stage(campaign, experiment, stage, *expected)
                .await?
                .into_task_outcome(|status| {
                    Task::monitor_stage(campaign.as_str(), experiment.as_str(), stage.as_str(), status)
                })),
            Task::UpdateModel { campaign } => {
                self.campaigns.update_model(campaign).await?;
                Ok(TaskOutcome::Done)
            }
            Task::ProbeModel { campaign } => {
                self.campaigns.probe_model(campaign).await?;
                Ok(TaskOutcome::Done)
            }
        }
    }

    /// Run a job and schedule whatever follows from its outcome
    pub async fn execute(&self, job: Job) {
        debug!(task = %job.task, attempt = job.attempt, "Running task");

        match self.run(&job.task).await {
            Ok(TaskOutcome::Done) => {
                TaskMetrics::bump(&self.metrics.completed);
                if let Some(next) = job.into_followup() {
                    self.scheduler.schedule(next, Duration::ZERO);
                }
            }
            Ok(TaskOutcome::Continue(task)) => {
                TaskMetrics::bump(&self.metrics.completed);
                info!(from = %job.task, to = %task, "Watch continues with new status");
                let next = job.continue_with(task);
                self.scheduler.schedule(next, self.policy.delay_for(0));
            }
            Ok(TaskOutcome::Retry) => self.retry(&job, None),
            Ok(TaskOutcome::Stale) => {
                TaskMetrics::bump(&self.metrics.stale);
                debug!(
                    task = %job.task,
                    dropped_followups = job.followups.len(),
                    "Watch is stale; lineage ends"
                );
            }
            Err(e) if e.is_retryable() => self.retry(&job, Some(e.to_string())),
            Err(e) => {
                TaskMetrics::bump(&self.metrics.dropped);
                error!(task = %job.task, kind = job.task.kind(), error = %e, "Task failed; dropping");
            }
        }
    }

    fn retry(&self, job: &Job, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| "not resolved".to_string());
        match self.policy.decide(job.attempt) {
            RetryDecision::Retry { delay } => {
                TaskMetrics::bump(&self.metrics.retried);
                let next = job.retry();
                if self.policy.should_alert(next.attempt) {
                    warn!(
                        task = %job.task,
                        attempt = next.attempt,
                        delay_secs = delay.as_secs(),
                        reason = %reason,
                        "Task still retrying"
                    );
                } else {
                    info!(
                        task = %job.task,
                        attempt = next.attempt,
                        delay_secs = delay.as_secs(),
                        reason = %reason,
                        "Retrying task"
                    );
                }
                self.scheduler.schedule(next, delay);
            }
            RetryDecision::GiveUp => {
                TaskMetrics::bump(&self.metrics.dropped);
                error!(
                    task = %job.task,
                    attempt = job.attempt,
                    reason = %reason,
                    "Retry limit reached; dropping task"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use map_core::db::fixtures::ALPHA_URL;
    use map_core::{ExperimentStatus, MlModelStatus, StageStatus};

    fn runner(h: &Harness, policy: RetryPolicy) -> (TaskRunner, Arc<TaskMetrics>) {
        let metrics = Arc::new(TaskMetrics::new());
        let runner = TaskRunner::new(
            Arc::new(MonitorService::new(h.db.clone(), h.facility.clone())),
            Arc::new(PlacementService::new(h.db.clone(), h.facility.clone())),
            Arc::new(CampaignService::new(
                h.db.clone(),
                h.scheduler.clone(),
                h.advisor.clone(),
                None,
            )),
            h.scheduler.clone(),
            policy,
            metrics.clone(),
        );
        (runner, metrics)
    }

    fn placed(h: &Harness, status: ExperimentStatus) {
        h.fixture.propose(&h.db, "exp").unwrap();
        h.db
            .bind_facility("camp", "exp", h.fixture.alpha.id, "7")
            .unwrap();
        h.db
            .modify_experiment("camp", "exp", |exp| {
                Ok(map_core::status::apply_status(exp, status, None))
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_unplaced_experiment_retries_with_backoff() {
        let h = Harness::new();
        h.fixture.propose(&h.db, "exp").unwrap();
        let (runner, metrics) = runner(&h, RetryPolicy::default());

        let job = Job::new(Task::place("camp", "exp")).retry().retry();
        runner.execute(job).await;

        let scheduled = h.scheduler.take();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].job.attempt, 3);
        assert_eq!(scheduled[0].delay, Duration::from_secs(720));
        assert_eq!(metrics.snapshot().retried, 1);
    }

    #[tokio::test]
    async fn test_placement_done_runs_followup() {
        let h = Harness::new();
        h.fixture.propose(&h.db, "exp").unwrap();
        h.facility.accept(ALPHA_URL, "7");
        let (runner, metrics) = runner(&h, RetryPolicy::default());

        runner
            .execute(Job::new(Task::place("camp", "exp")).then(Task::probe_model("camp")))
            .await;

        let scheduled = h.scheduler.take();
        assert_eq!(scheduled[0].job, Job::new(Task::probe_model("camp")));
        assert_eq!(scheduled[0].delay, Duration::ZERO);
        assert_eq!(metrics.snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_terminal_watch_chains_into_model_update() {
        let h = Harness::new();
        placed(&h, ExperimentStatus::Completed);
        h.facility
            .report_results(&[("temperature", 50.0), ("flow_rate", 1.0), ("yield", 0.8), ("purity", 0.9)]);
        let (runner, _) = runner(&h, RetryPolicy::default());

        let job = Job::new(Task::monitor_experiment("camp", "exp", ExperimentStatus::Completed))
            .then(Task::update_model("camp"));
        runner.execute(job).await;

        let scheduled = h.scheduler.take();
        assert_eq!(scheduled.len(), 1);
        let next = scheduled[0].job.clone();
        assert_eq!(next, Job::new(Task::update_model("camp")));
        assert_eq!(
            h.db.require_campaign("camp").unwrap().ml_model_status,
            MlModelStatus::OutOfDate
        );

        runner.execute(next).await;
        assert_eq!(h.advisor.train_count(), 1);
        assert_eq!(
            h.db.require_campaign("camp").unwrap().ml_model_status,
            MlModelStatus::Running
        );
    }

    #[tokio::test]
    async fn test_transition_continues_with_fresh_attempts() {
        let h = Harness::new();
        placed(&h, ExperimentStatus::Running);
        h.facility.report_status("C");
        let (runner, _) = runner(&h, RetryPolicy::default());

        let job = Job::new(Task::monitor_experiment("camp", "exp", ExperimentStatus::Running))
            .then(Task::update_model("camp"))
            .retry();
        runner.execute(job).await;

        let scheduled = h.scheduler.take();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(
            scheduled[0].job,
            Job::new(Task::monitor_experiment("camp", "exp", ExperimentStatus::Completed))
                .then(Task::update_model("camp"))
        );
        assert_eq!(scheduled[0].delay, Duration::from_secs(180));
    }

    #[tokio::test]
    async fn test_stale_watch_drops_chain() {
        let h = Harness::new();
        placed(&h, ExperimentStatus::Completed);
        let (runner, metrics) = runner(&h, RetryPolicy::default());

        let job = Job::new(Task::monitor_experiment("camp", "exp", ExperimentStatus::Running))
            .then(Task::update_model("camp"));
        runner.execute(job).await;

        assert!(h.scheduler.is_empty());
        assert!(h.facility.calls().iter().all(|c| !c.starts_with("status")));
        let counters = metrics.snapshot();
        assert_eq!(counters.stale, 1);
        assert_eq!(counters.retried, 0);
    }

    #[tokio::test]
    async fn test_poll_failure_is_retried() {
        let h = Harness::new();
        h.fixture.propose(&h.db, "exp").unwrap();
        h.db
            .bind_facility("camp", "exp", h.fixture.alpha.id, "7")
            .unwrap();
        h.db
            .modify_stage("camp", "exp", "mix", |row| {
                Ok(map_core::status::apply_status(row, StageStatus::Running, None))
            })
            .unwrap();
        let (runner, metrics) = runner(&h, RetryPolicy::default());

        let job = Job::new(Task::monitor_stage("camp", "exp", "mix", StageStatus::Running));
        runner.execute(job.clone()).await;

        let scheduled = h.scheduler.take();
        assert_eq!(scheduled[0].job, job.retry());
        assert_eq!(metrics.snapshot().retried, 1);
    }

    #[tokio::test]
    async fn test_missing_target_is_dropped() {
        let h = Harness::new();
        let (runner, metrics) = runner(&h, RetryPolicy::default());

        runner
            .execute(Job::new(Task::place("camp", "ghost")).then(Task::update_model("camp")))
            .await;

        assert!(h.scheduler.is_empty());
        assert_eq!(metrics.snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn test_retry_limit_gives_up() {
        let h = Harness::new();
        h.fixture.propose(&h.db, "exp").unwrap();
        let policy = RetryPolicy {
            max_retries: Some(1),
            ..RetryPolicy::default()
        };
        let (runner, metrics) = runner(&h, policy);

        runner.execute(Job::new(Task::place("camp", "exp")).retry()).await;

        assert!(h.scheduler.is_empty());
        assert_eq!(metrics.snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn test_failed_training_dispatch_is_retried() {
        let h = Harness::new();
        h.advisor.fail(true);
        let (runner, metrics) = runner(&h, RetryPolicy::default());

        runner.execute(Job::new(Task::update_model("camp"))).await;

        let scheduled = h.scheduler.take();
        assert_eq!(scheduled[0].job, Job::new(Task::update_model("camp")).retry());
        assert_eq!(metrics.snapshot().retried, 1);
        assert_eq!(
            h.db.require_campaign("camp").unwrap().ml_model_status,
            MlModelStatus::Untrained
        );
    }
}
