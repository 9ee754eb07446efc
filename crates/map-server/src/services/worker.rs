//! Tokio-backed task queue.
//!
//! Jobs go through an unbounded mpsc channel drained by a fixed set of worker
//! tasks. A delayed submission parks in its own timer task until due, so
//! workers never sleep.

use map_core::tasks::{Job, Scheduler};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use super::tasks::{TaskMetrics, TaskRunner};

pub struct WorkerPool {
    sender: UnboundedSender<Job>,
    receiver: Mutex<Option<UnboundedReceiver<Job>>>,
    metrics: Arc<TaskMetrics>,
}

impl WorkerPool {
    pub fn new(metrics: Arc<TaskMetrics>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<TaskMetrics> {
        self.metrics.clone()
    }

    /// Spawn the workers. Jobs scheduled before this call are kept queued.
    ///
    /// Only the first call has an effect.
    pub fn start(&self, runner: Arc<TaskRunner>, workers: usize) {
        let receiver = match self.receiver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(receiver) = receiver else {
            warn!("Worker pool already started");
            return;
        };

        let workers = workers.max(1);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        info!(workers = workers, "Starting task workers");

        for worker in 0..workers {
            let receiver = receiver.clone();
            let runner = runner.clone();
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(job) = next else {
                        debug!(worker = worker, "Task queue closed; worker exiting");
                        break;
                    };
                    runner.execute(job).await;
                }
            });
        }
    }
}

impl Scheduler for WorkerPool {
    fn schedule(&self, job: Job, delay: Duration) {
        self.metrics.record_scheduled();
        debug!(task = %job.task, delay_secs = delay.as_secs(), "Task scheduled");

        if delay.is_zero() {
            if self.sender.send(job).is_err() {
                warn!("Task queue closed; job discarded");
            }
            return;
        }

        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(job).is_err() {
                warn!("Task queue closed; delayed job discarded");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{CampaignService, MonitorService, PlacementService};
    use crate::testing::Harness;
    use map_core::db::fixtures::BETA_URL;
    use map_core::tasks::{RetryPolicy, Task};
    use map_core::ExperimentStatus;

    fn pool_with_runner(h: &Harness, policy: RetryPolicy) -> Arc<WorkerPool> {
        let metrics = Arc::new(TaskMetrics::new());
        let pool = Arc::new(WorkerPool::new(metrics.clone()));
        let runner = Arc::new(TaskRunner::new(
            Arc::new(MonitorService::new(h.db.clone(), h.facility.clone())),
            Arc::new(PlacementService::new(h.db.clone(), h.facility.clone())),
            Arc::new(CampaignService::new(
                h.db.clone(),
                pool.clone(),
                h.advisor.clone(),
                None,
            )),
            pool.clone(),
            policy,
            metrics,
        ));
        pool.start(runner, 2);
        pool
    }

    async fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_placement_retries_until_a_facility_accepts() {
        let h = Harness::new();
        h.fixture.propose(&h.db, "exp").unwrap();
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(40),
            ..RetryPolicy::default()
        };
        let pool = pool_with_runner(&h, policy);

        pool.schedule(Job::new(Task::place("camp", "exp")), Duration::ZERO);
        wait_for(|| pool.metrics().snapshot().retried >= 2).await;
        assert!(!h.db.require_experiment("camp", "exp").unwrap().is_placed());

        h.facility.accept(BETA_URL, "42");
        wait_for(|| h.db.require_experiment("camp", "exp").unwrap().is_placed()).await;

        let exp = h.db.require_experiment("camp", "exp").unwrap();
        assert_eq!(exp.status, ExperimentStatus::NotStarted);
        assert_eq!(exp.facility_expid.as_deref(), Some("42"));
        wait_for(|| pool.metrics().snapshot().completed == 1).await;
    }

    #[tokio::test]
    async fn test_delayed_job_waits() {
        let h = Harness::new();
        let pool = pool_with_runner(&h, RetryPolicy::default());

        pool.schedule(Job::new(Task::probe_model("camp")), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.advisor.probe_count(), 0);

        wait_for(|| h.advisor.probe_count() == 1).await;
        let counters = pool.metrics().snapshot();
        assert_eq!(counters.scheduled, 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_ignored() {
        let h = Harness::new();
        let pool = pool_with_runner(&h, RetryPolicy::default());
        let metrics = pool.metrics();
        let runner = Arc::new(TaskRunner::new(
            Arc::new(MonitorService::new(h.db.clone(), h.facility.clone())),
            Arc::new(PlacementService::new(h.db.clone(), h.facility.clone())),
            Arc::new(CampaignService::new(
                h.db.clone(),
                pool.clone(),
                h.advisor.clone(),
                None,
            )),
            pool.clone(),
            RetryPolicy::default(),
            metrics,
        ));
        pool.start(runner, 1);

        pool.schedule(Job::new(Task::probe_model("camp")), Duration::ZERO);
        wait_for(|| h.advisor.probe_count() == 1).await;
    }
}
