//! Ensembling job records.
//!
//! A job's status only changes through `claim_job`, `update_job_status` and
//! `record_job_retry`, which check the transition inside the write
//! transaction. `save_ensembling_job` never changes the stored status.

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{epoch_secs, get_record, map_err, next_id, not_found, put_record, StateStore};
use crate::tables::*;
use crate::types::*;

impl StateStore {
    /// Create a job (`id == 0`) or update an existing job's configuration.
    pub fn save_ensembling_job(&self, job: &EnsemblingJob) -> StateResult<EnsemblingJob> {
        let mut job = job.clone();
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if job.id == 0 {
            job.id = next_id(&txn, "ensembling_jobs")?;
            job.created_at = now;
        }
        {
            let mut table = txn.open_table(ENSEMBLING_JOBS).map_err(map_err!(Table))?;
            if let Some(existing) = get_record::<EnsemblingJob, _>(&table, job.id)? {
                job.status = existing.status;
                job.error = existing.error;
                job.retry_count = existing.retry_count;
                job.created_at = existing.created_at;
            }
            job.updated_at = now;
            put_record(&mut table, job.id, &job)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = job.id, name = %job.name, status = ?job.status, "ensembling job stored");
        Ok(job)
    }

    pub fn get_ensembling_job(&self, id: JobId) -> StateResult<Option<EnsemblingJob>> {
        self.read_record(ENSEMBLING_JOBS, id)
    }

    /// List jobs, optionally restricted to one project.
    pub fn list_ensembling_jobs(
        &self,
        project_id: Option<ProjectId>,
    ) -> StateResult<Vec<EnsemblingJob>> {
        let jobs: Vec<EnsemblingJob> = self.read_all(ENSEMBLING_JOBS)?;
        Ok(jobs
            .into_iter()
            .filter(|j| project_id.is_none_or(|p| j.project_id == p))
            .collect())
    }

    /// Jobs in `status`, ordered by id.
    pub fn list_jobs_by_status(&self, status: JobStatus) -> StateResult<Vec<EnsemblingJob>> {
        let jobs: Vec<EnsemblingJob> = self.read_all(ENSEMBLING_JOBS)?;
        Ok(jobs.into_iter().filter(|j| j.status == status).collect())
    }

    /// Up to `limit` pending jobs, oldest first.
    pub fn find_pending_jobs(&self, limit: usize) -> StateResult<Vec<EnsemblingJob>> {
        let mut jobs = self.list_jobs_by_status(JobStatus::Pending)?;
        jobs.truncate(limit);
        Ok(jobs)
    }

    /// Move a pending job to `building` and return the stored job.
    ///
    /// Fails with `Conflict` unless the job is still pending, so exactly one
    /// controller wins a job even when several read the same pending list.
    pub fn claim_job(&self, id: JobId) -> StateResult<EnsemblingJob> {
        self.mutate_job(id, |job| {
            if job.status != JobStatus::Pending {
                return Err(StateError::Conflict(format!(
                    "ensembling job {id} is {:?}, not pending",
                    job.status
                )));
            }
            job.status = JobStatus::Building;
            Ok(())
        })
    }

    /// Move a job to `status`, optionally recording an error message.
    ///
    /// Fails with `Conflict` if the job's current status does not allow it.
    pub fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
    ) -> StateResult<EnsemblingJob> {
        self.mutate_job(id, |job| {
            if !job.status.can_transition_to(status) {
                return Err(StateError::Conflict(format!(
                    "ensembling job {id} cannot move from {:?} to {status:?}",
                    job.status
                )));
            }
            job.status = status;
            if let Some(error) = error {
                job.error = error.to_string();
            }
            Ok(())
        })
    }

    /// Put a job back to `pending` after a failed submission and count the attempt.
    pub fn record_job_retry(&self, id: JobId, error: &str) -> StateResult<EnsemblingJob> {
        self.mutate_job(id, |job| {
            if !job.status.can_transition_to(JobStatus::Pending) {
                return Err(StateError::Conflict(format!(
                    "ensembling job {id} cannot be retried from {:?}",
                    job.status
                )));
            }
            job.status = JobStatus::Pending;
            job.retry_count += 1;
            job.error = error.to_string();
            Ok(())
        })
    }

    pub fn delete_ensembling_job(&self, id: JobId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ENSEMBLING_JOBS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn mutate_job<F>(&self, id: JobId, apply: F) -> StateResult<EnsemblingJob>
    where
        F: FnOnce(&mut EnsemblingJob) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let job = {
            let mut table = txn.open_table(ENSEMBLING_JOBS).map_err(map_err!(Table))?;
            let mut job: EnsemblingJob =
                get_record(&table, id)?.ok_or_else(|| not_found("ensembling job", id))?;
            apply(&mut job)?;
            job.updated_at = epoch_secs();
            put_record(&mut table, id, &job)?;
            job
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id, status = ?job.status, retry_count = job.retry_count, "ensembling job updated");
        Ok(job)
    }
}
