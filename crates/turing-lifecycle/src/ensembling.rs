//! Batch ensembling jobs.
//!
//! `EnsemblingJobService` records jobs and cancellation requests.
//! `JobController` drives them: it claims pending jobs in id order, builds
//! and submits them through a `JobRunner`, polls running jobs and finishes
//! jobs whose cancellation was requested. Every status change goes through
//! the store, which rejects transitions the job state machine forbids.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use turing_core::config::EnsemblingConfig;
use turing_state::{EnsemblingJob, JobId, JobStatus, ProjectId, StateStore};

use crate::error::{LifecycleError, LifecycleResult, RunnerResult};

/// State of a submitted job as reported by the batch runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    Completed,
    Failed(String),
}

/// The batch platform jobs run on.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Build the job's image and return its reference.
    async fn build_image(&self, job: &EnsemblingJob) -> RunnerResult<String>;

    /// Submit the job and return the URL its run can be monitored at.
    async fn submit(&self, job: &EnsemblingJob) -> RunnerResult<String>;

    async fn poll(&self, job: &EnsemblingJob) -> RunnerResult<RunState>;

    async fn terminate(&self, job: &EnsemblingJob) -> RunnerResult<()>;
}

// ── Service ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct EnsemblingJobService {
    store: StateStore,
}

impl EnsemblingJobService {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Record a new job. It starts `pending` with no retries, whatever
    /// `spec` carries.
    pub fn create_job(&self, spec: &EnsemblingJob) -> LifecycleResult<EnsemblingJob> {
        if spec.name.is_empty() {
            return Err(LifecycleError::Invalid("job name must not be empty".to_string()));
        }
        let mut job = spec.clone();
        job.id = 0;
        job.status = JobStatus::Pending;
        job.retry_count = 0;
        job.error.clear();
        job.monitoring_url = None;
        job.infra_config.image_ref = None;

        let job = self.store.save_ensembling_job(&job)?;
        info!(job = %job.name, id = job.id, "ensembling job created");
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> LifecycleResult<EnsemblingJob> {
        self.store
            .get_ensembling_job(id)?
            .ok_or_else(|| LifecycleError::NotFound(format!("ensembling job {id}")))
    }

    pub fn list(&self, project_id: Option<ProjectId>) -> LifecycleResult<Vec<EnsemblingJob>> {
        Ok(self.store.list_ensembling_jobs(project_id)?)
    }

    /// Request cancellation. The controller stops the run on its next tick.
    pub fn terminate_job(&self, id: JobId) -> LifecycleResult<EnsemblingJob> {
        let job = self.get(id)?;
        if job.status.is_terminal() {
            return Err(LifecycleError::Conflict(format!(
                "ensembling job {} already finished as {:?}",
                job.name, job.status
            )));
        }
        let job = self
            .store
            .update_job_status(id, JobStatus::Terminating, None)?;
        info!(job = %job.name, id, "ensembling job termination requested");
        Ok(job)
    }

    /// Delete a finished job.
    pub fn delete_job(&self, id: JobId) -> LifecycleResult<()> {
        let job = self.get(id)?;
        if !job.status.is_terminal() {
            return Err(LifecycleError::Conflict(format!(
                "ensembling job {} is {:?}; terminate it before deleting",
                job.name, job.status
            )));
        }
        self.store.delete_ensembling_job(id)?;
        info!(job = %job.name, id, "ensembling job deleted");
        Ok(())
    }
}

// ── Controller ────────────────────────────────────────────────────

/// What one controller pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub terminated: usize,
    pub completed: usize,
    pub failed: usize,
    pub submitted: usize,
    pub requeued: usize,
}

pub struct JobController {
    store: StateStore,
    runner: Arc<dyn JobRunner>,
    config: EnsemblingConfig,
}

impl JobController {
    pub fn new(store: StateStore, runner: Arc<dyn JobRunner>, config: &EnsemblingConfig) -> Self {
        Self {
            store,
            runner,
            config: config.clone(),
        }
    }

    /// One pass: finish cancellations, poll running jobs, then claim and
    /// submit up to `batch_limit` pending jobs.
    ///
    /// Runner failures are recorded on the job; only store failures while
    /// listing jobs abort the pass.
    pub async fn tick(&self) -> LifecycleResult<TickSummary> {
        let mut summary = TickSummary::default();

        for job in self.store.list_jobs_by_status(JobStatus::Terminating)? {
            if let Err(e) = self.runner.terminate(&job).await {
                warn!(job = %job.name, error = %e, "failed to terminate ensembling job; will retry");
                continue;
            }
            if self.transition(&job, JobStatus::Terminated, None) {
                summary.terminated += 1;
            }
        }

        for job in self.store.list_jobs_by_status(JobStatus::Running)? {
            match self.runner.poll(&job).await {
                Ok(RunState::Running) => {}
                Ok(RunState::Completed) => {
                    if self.transition(&job, JobStatus::Completed, None) {
                        summary.completed += 1;
                    }
                }
                Ok(RunState::Failed(reason)) => {
                    if self.transition(&job, JobStatus::Failed, Some(&reason)) {
                        summary.failed += 1;
                    }
                }
                Err(e) => warn!(job = %job.name, error = %e, "failed to poll ensembling job"),
            }
        }

        for job in self.store.find_pending_jobs(self.config.batch_limit)? {
            match self.start(job).await {
                Started::Submitted => summary.submitted += 1,
                Started::Requeued => summary.requeued += 1,
                Started::Failed => summary.failed += 1,
                Started::Skipped => {}
            }
        }

        debug!(?summary, "ensembling controller pass finished");
        Ok(summary)
    }

    /// Run passes every `poll_interval` until `shutdown` changes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.poll_interval();
        info!(interval_secs = interval.as_secs(), "ensembling job controller started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "ensembling controller pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("ensembling job controller shutting down");
                    break;
                }
            }
        }
    }

    async fn start(&self, pending: EnsemblingJob) -> Started {
        let mut job = match self.store.claim_job(pending.id) {
            Ok(job) => job,
            Err(e) if e.is_conflict() => {
                debug!(job = %pending.name, error = %e, "ensembling job claimed elsewhere");
                return Started::Skipped;
            }
            Err(e) => {
                warn!(job = %pending.name, error = %e, "failed to claim ensembling job");
                return Started::Skipped;
            }
        };
        if job.infra_config.image_ref.is_none() {
            match self.runner.build_image(&job).await {
                Ok(image) => {
                    job.infra_config.image_ref = Some(image);
                    match self.store.save_ensembling_job(&job) {
                        Ok(saved) => job = saved,
                        Err(e) => {
                            warn!(job = %job.name, error = %e, "failed to store built image");
                        }
                    }
                }
                Err(e) => {
                    warn!(job = %job.name, error = %e, "ensembling job image build failed");
                    self.transition(&job, JobStatus::FailedBuilding, Some(&e.to_string()));
                    return Started::Failed;
                }
            }
        }

        match self.runner.submit(&job).await {
            Ok(url) => {
                job.monitoring_url = Some(url);
                if let Err(e) = self.store.save_ensembling_job(&job) {
                    warn!(job = %job.name, error = %e, "failed to store monitoring url");
                }
                if self.transition(&job, JobStatus::Running, Some("")) {
                    info!(job = %job.name, id = job.id, "ensembling job submitted");
                    Started::Submitted
                } else {
                    Started::Skipped
                }
            }
            Err(e) if job.retry_count < self.config.max_retries => {
                warn!(job = %job.name, retry = job.retry_count + 1, error = %e, "ensembling job submission failed; requeued");
                match self.store.record_job_retry(job.id, &e.to_string()) {
                    Ok(_) => Started::Requeued,
                    Err(e) => {
                        warn!(job = %job.name, error = %e, "failed to requeue ensembling job");
                        Started::Skipped
                    }
                }
            }
            Err(e) => {
                error!(job = %job.name, retries = job.retry_count, error = %e, "ensembling job submission failed; giving up");
                self.transition(&job, JobStatus::FailedSubmission, Some(&e.to_string()));
                Started::Failed
            }
        }
    }

    /// Apply a status change. A conflict means another actor moved the job
    /// first, which is not an error for the controller.
    fn transition(&self, job: &EnsemblingJob, status: JobStatus, error: Option<&str>) -> bool {
        match self.store.update_job_status(job.id, status, error) {
            Ok(_) => true,
            Err(e) if e.is_conflict() => {
                debug!(job = %job.name, error = %e, "ensembling job moved concurrently");
                false
            }
            Err(e) => {
                warn!(job = %job.name, status = ?status, error = %e, "failed to update ensembling job");
                false
            }
        }
    }
}

enum Started {
    Submitted,
    Requeued,
    Failed,
    Skipped,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use turing_state::{InfraConfig, JobConfig, JobResources};

    use crate::error::RunnerError;

    use super::*;

    #[derive(Default)]
    struct FakeRunner {
        build_error: Option<String>,
        build_delays: HashMap<String, Duration>,
        submissions: Mutex<Vec<JobId>>,
        submit_failures: Mutex<u32>,
        runs: Mutex<HashMap<JobId, RunState>>,
        builds: Mutex<u32>,
        terminated: Mutex<Vec<JobId>>,
    }

    impl FakeRunner {
        fn failing_submissions(n: u32) -> Self {
            Self {
                submit_failures: Mutex::new(n),
                ..Self::default()
            }
        }

        fn finish(&self, id: JobId, state: RunState) {
            self.runs.lock().unwrap().insert(id, state);
        }
    }

    #[async_trait]
    impl JobRunner for FakeRunner {
        async fn build_image(&self, job: &EnsemblingJob) -> RunnerResult<String> {
            if let Some(delay) = self.build_delays.get(&job.name) {
                tokio::time::sleep(*delay).await;
            }
            *self.builds.lock().unwrap() += 1;
            match &self.build_error {
                Some(msg) => Err(RunnerError(msg.clone())),
                None => Ok(format!("registry.local/{}:latest", job.name)),
            }
        }

        async fn submit(&self, job: &EnsemblingJob) -> RunnerResult<String> {
            let mut failures = self.submit_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(RunnerError("spark operator unavailable".to_string()));
            }
            self.submissions.lock().unwrap().push(job.id);
            self.runs.lock().unwrap().insert(job.id, RunState::Running);
            Ok(format!("http://spark.local/jobs/{}", job.id))
        }

        async fn poll(&self, job: &EnsemblingJob) -> RunnerResult<RunState> {
            self.runs
                .lock()
                .unwrap()
                .get(&job.id)
                .cloned()
                .ok_or_else(|| RunnerError(format!("unknown job {}", job.id)))
        }

        async fn terminate(&self, job: &EnsemblingJob) -> RunnerResult<()> {
            self.terminated.lock().unwrap().push(job.id);
            Ok(())
        }
    }

    fn job(name: &str) -> EnsemblingJob {
        EnsemblingJob {
            id: 0,
            name: name.to_string(),
            project_id: 1,
            ensembler_id: 10,
            environment_name: "staging".to_string(),
            infra_config: InfraConfig {
                artifact_uri: "gs://bucket/ensembler".to_string(),
                ensembler_name: "weighted".to_string(),
                service_account_name: "batch-sa".to_string(),
                resources: JobResources::default(),
                image_ref: Some("stale".to_string()),
            },
            job_config: JobConfig {
                version: "v1".to_string(),
                kind: "BatchEnsemblingJob".to_string(),
                name: name.to_string(),
                spec: serde_json::json!({ "source": {}, "sink": {} }),
            },
            retry_count: 5,
            status: JobStatus::Completed,
            error: "stale".to_string(),
            monitoring_url: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn setup(runner: FakeRunner) -> (EnsemblingJobService, JobController, Arc<FakeRunner>) {
        let store = StateStore::open_in_memory().unwrap();
        let runner = Arc::new(runner);
        let config = EnsemblingConfig {
            batch_limit: 2,
            max_retries: 1,
            ..EnsemblingConfig::default()
        };
        let controller = JobController::new(store.clone(), runner.clone(), &config);
        (EnsemblingJobService::new(store), controller, runner)
    }

    #[test]
    fn create_job_starts_pending() {
        let (jobs, _, _) = setup(FakeRunner::default());
        let created = jobs.create_job(&job("daily")).unwrap();

        assert_eq!(created.status, JobStatus::Pending);
        assert_eq!(created.retry_count, 0);
        assert!(created.error.is_empty());
        assert!(created.infra_config.image_ref.is_none());
        assert!(matches!(
            jobs.create_job(&job("")),
            Err(LifecycleError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn tick_builds_submits_and_completes() {
        let (jobs, controller, runner) = setup(FakeRunner::default());
        let created = jobs.create_job(&job("daily")).unwrap();

        let summary = controller.tick().await.unwrap();
        assert_eq!(summary.submitted, 1);
        let running = jobs.get(created.id).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(
            running.infra_config.image_ref.as_deref(),
            Some("registry.local/daily:latest")
        );
        assert_eq!(
            running.monitoring_url.as_deref(),
            Some(format!("http://spark.local/jobs/{}", created.id).as_str())
        );

        runner.finish(created.id, RunState::Completed);
        let summary = controller.tick().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert!(jobs.get(created.id).unwrap().status.is_successful());
    }

    #[tokio::test]
    async fn claims_at_most_batch_limit_in_id_order() {
        let (jobs, controller, _) = setup(FakeRunner::default());
        let ids: Vec<JobId> = ["a", "b", "c"]
            .iter()
            .map(|n| jobs.create_job(&job(n)).unwrap().id)
            .collect();

        controller.tick().await.unwrap();
        let statuses: Vec<JobStatus> = ids.iter().map(|id| jobs.get(*id).unwrap().status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Running, JobStatus::Running, JobStatus::Pending]
        );
    }

    #[tokio::test]
    async fn failed_submission_is_requeued_until_retries_run_out() {
        let (jobs, controller, runner) = setup(FakeRunner::failing_submissions(2));
        let created = jobs.create_job(&job("daily")).unwrap();

        assert_eq!(controller.tick().await.unwrap().requeued, 1);
        let requeued = jobs.get(created.id).unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.error, "spark operator unavailable");

        assert_eq!(controller.tick().await.unwrap().failed, 1);
        assert_eq!(jobs.get(created.id).unwrap().status, JobStatus::FailedSubmission);
        // The image built on the first attempt is reused.
        assert_eq!(*runner.builds.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn build_failure_is_terminal() {
        let runner = FakeRunner {
            build_error: Some("artifact missing".to_string()),
            ..FakeRunner::default()
        };
        let (jobs, controller, _) = setup(runner);
        let created = jobs.create_job(&job("daily")).unwrap();

        controller.tick().await.unwrap();
        let failed = jobs.get(created.id).unwrap();
        assert_eq!(failed.status, JobStatus::FailedBuilding);
        assert_eq!(failed.error, "artifact missing");
    }

    #[tokio::test]
    async fn run_failure_records_reason() {
        let (jobs, controller, runner) = setup(FakeRunner::default());
        let created = jobs.create_job(&job("daily")).unwrap();
        controller.tick().await.unwrap();

        runner.finish(created.id, RunState::Failed("executor lost".to_string()));
        controller.tick().await.unwrap();
        let failed = jobs.get(created.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error, "executor lost");
    }

    #[tokio::test]
    async fn termination_and_deletion() {
        let (jobs, controller, runner) = setup(FakeRunner::default());
        let created = jobs.create_job(&job("daily")).unwrap();

        assert!(matches!(
            jobs.delete_job(created.id),
            Err(LifecycleError::Conflict(_))
        ));

        jobs.terminate_job(created.id).unwrap();
        let summary = controller.tick().await.unwrap();
        assert_eq!(summary.terminated, 1);
        assert_eq!(summary.submitted, 0);
        assert_eq!(*runner.terminated.lock().unwrap(), vec![created.id]);
        assert_eq!(jobs.get(created.id).unwrap().status, JobStatus::Terminated);

        assert!(matches!(
            jobs.terminate_job(created.id),
            Err(LifecycleError::Conflict(_))
        ));
        jobs.delete_job(created.id).unwrap();
        assert!(matches!(jobs.get(created.id), Err(LifecycleError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_controllers_submit_each_job_once() {
        let store = StateStore::open_in_memory().unwrap();
        let runner = Arc::new(FakeRunner {
            build_delays: HashMap::from([
                ("fast".to_string(), Duration::from_secs(1)),
                ("slow".to_string(), Duration::from_secs(5)),
            ]),
            ..FakeRunner::default()
        });
        let config = EnsemblingConfig {
            batch_limit: 2,
            ..EnsemblingConfig::default()
        };
        let jobs = EnsemblingJobService::new(store.clone());
        let fast = jobs.create_job(&job("fast")).unwrap();
        let slow = jobs.create_job(&job("slow")).unwrap();

        // The first pass claims `fast` and is still building when the second
        // pass lists pending jobs, so both passes see `slow`.
        let first = JobController::new(store.clone(), runner.clone(), &config);
        let second = JobController::new(store, runner.clone(), &config);
        let (a, b) = tokio::join!(first.tick(), second.tick());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.submitted + b.submitted, 2);
        assert_eq!(*runner.builds.lock().unwrap(), 2);
        let mut submitted = runner.submissions.lock().unwrap().clone();
        submitted.sort();
        assert_eq!(submitted, vec![fast.id, slow.id]);
        assert_eq!(jobs.get(slow.id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (jobs, controller, _) = setup(FakeRunner::default());
        let created = jobs.create_job(&job("daily")).unwrap();
        let (tx, rx) = watch::channel(false);

        let controller = Arc::new(controller);
        let handle = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run(rx).await })
        };
        tokio::time::sleep(EnsemblingConfig::default().poll_interval() * 2).await;
        assert_eq!(jobs.get(created.id).unwrap().status, JobStatus::Running);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
