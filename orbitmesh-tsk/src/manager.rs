//  MANAGER.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the job manager: the single authority over job lifecycle
//!   state. Every transition is checked against the legal table and
//!   serialised per job; duplicate terminal reports are accepted
//!   idempotently; retries, timeouts and dead-lettering all go through
//!   here.
//

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use specifications::jobs::{Job, JobProgress, JobRequest, JobResult, JobStatus};
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};

use crate::deadletter::DeadLetterStore;
pub use crate::errors::JobError as Error;
use crate::progress::ProgressService;
use crate::queue::{PendingQueue, QueueEntry};
use crate::spec::{JobEvent, JobRepository};


/***** CONSTANTS *****/
/// The capacity of the manager's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;





/***** AUXILLARY *****/
/// Tunables of the job manager.
#[derive(Clone, Debug)]
pub struct JobManagerConfig {
    /// How long an assigned job may go unacknowledged before it is requeued.
    pub ack_deadline: Duration,
    /// How often a job may be requeued after a timeout.
    pub max_timeout_retries: u32,
}
impl Default for JobManagerConfig {
    #[inline]
    fn default() -> Self { Self { ack_deadline: Duration::from_secs(30), max_timeout_retries: 1 } }
}





/***** LIBRARY *****/
/// The job manager. Owns the queue and all lifecycle transitions; everything else observes it
/// through events or queries.
#[derive(Debug)]
pub struct JobManager {
    /// The job store plus idempotency index.
    repo: Arc<dyn JobRepository>,
    /// The pending-job priority queue.
    queue: PendingQueue,
    /// The dead-letter store.
    deadletter: Arc<DeadLetterStore>,
    /// The progress service.
    progress: Arc<ProgressService>,
    /// Per-job (and per-idempotency-key) locks serialising transitions.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// In-flight job count per agent, for the LeastConnections policy.
    active: DashMap<String, usize>,
    /// The channel on which job events are published.
    events: broadcast::Sender<JobEvent>,
    /// Tunables.
    config: JobManagerConfig,
}

impl JobManager {
    /// Constructor for the JobManager.
    ///
    /// # Arguments
    /// - `repo`: The job repository to store jobs in.
    /// - `config`: The manager's tunables.
    ///
    /// # Returns
    /// A new JobManager instance with an empty queue and dead-letter store.
    pub fn new(repo: Arc<dyn JobRepository>, config: JobManagerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            repo,
            queue: PendingQueue::new(),
            deadletter: Arc::new(DeadLetterStore::new()),
            progress: Arc::new(ProgressService::default()),
            locks: DashMap::new(),
            active: DashMap::new(),
            events,
            config,
        }
    }

    /// Subscribes to job events.
    #[inline]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> { self.events.subscribe() }

    /// Returns the dead-letter store.
    #[inline]
    pub fn deadletter(&self) -> &Arc<DeadLetterStore> { &self.deadletter }

    /// Returns the progress service.
    #[inline]
    pub fn progress(&self) -> &Arc<ProgressService> { &self.progress }

    /// Returns the number of queued jobs.
    #[inline]
    pub fn queue_len(&self) -> usize { self.queue.len() }

    /// Returns the number of in-flight jobs held by the given agent.
    #[inline]
    pub fn active_count(&self, agent_id: &str) -> usize { self.active.get(agent_id).map(|count| *count).unwrap_or(0) }

    /// Acquires the serialisation lock for the given key (a job id or `key:`-prefixed
    /// idempotency key).
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock: Arc<Mutex<()>> = self.locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        lock.lock_owned().await
    }

    /// Fetches a job or errors.
    async fn must_get(&self, id: &str) -> Result<Job, Error> {
        match self.repo.get(id).await? {
            Some(job) => Ok(job),
            None => Err(Error::UnknownJob { id: id.into() }),
        }
    }

    /// Performs one checked status transition, stamping the matching timestamp and emitting the
    /// change event.
    fn set_status(&self, job: &mut Job, to: JobStatus) -> Result<(), Error> {
        let from: JobStatus = job.status;
        if !from.can_transition_to(to) {
            return Err(Error::IllegalTransition { id: job.id().into(), from, to });
        }

        job.status = to;
        let now: DateTime<Utc> = Utc::now();
        match to {
            JobStatus::Assigned => job.assigned_at = Some(now),
            JobStatus::Acknowledged => job.acknowledged_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut => job.completed_at = Some(now),
            _ => {},
        }

        let _ = self.events.send(JobEvent::StatusChanged { job_id: job.id().into(), old: from, new: to });
        Ok(())
    }

    /// Walks a job forward to `Running` through whatever intermediate states it skipped.
    ///
    /// A fast node may report a result before any progress arrived; the recorded status path
    /// must still be legal, so the intermediate transitions are performed (and stamped) here.
    fn advance_to_running(&self, job: &mut Job) -> Result<(), Error> {
        if job.status == JobStatus::Assigned {
            self.set_status(job, JobStatus::Acknowledged)?;
        }
        if job.status == JobStatus::Acknowledged {
            self.set_status(job, JobStatus::Running)?;
        }
        match job.status {
            JobStatus::Running => Ok(()),
            other => Err(Error::IllegalTransition { id: job.id().into(), from: other, to: JobStatus::Running }),
        }
    }

    /// Bumps the in-flight counter for the given agent.
    fn track_assigned(&self, agent_id: &str) { *self.active.entry(agent_id.to_string()).or_insert(0) += 1; }

    /// Drops the in-flight counter for the agent currently on the job, if any.
    fn untrack_assigned(&self, job: &Job) {
        if let Some(agent_id) = &job.assigned_agent_id {
            if let Some(mut count) = self.active.get_mut(agent_id) {
                *count = count.saturating_sub(1);
            }
        }
    }



    /// Enqueues a job request.
    ///
    /// Submissions sharing an idempotency key collapse onto the live job for that key: as long
    /// as a non-terminal job with the key exists, it is returned unchanged.
    ///
    /// # Arguments
    /// - `request`: The request to enqueue.
    ///
    /// # Returns
    /// The (new or existing) job.
    ///
    /// # Errors
    /// This function errors if the repository fails.
    pub async fn enqueue(&self, request: JobRequest) -> Result<Job, Error> {
        let key: String = request.effective_key().to_string();
        let _guard: OwnedMutexGuard<()> = self.lock(&format!("key:{key}")).await;

        // Idempotency: an existing live job wins
        if let Some(existing) = self.repo.get_by_key(&key).await? {
            if !existing.is_terminal() {
                debug!("Enqueue for key '{key}' collapsed onto live job '{}'", existing.id());
                return Ok(existing);
            }
        }

        let job: Job = Job::new(request);
        self.repo.insert(job.clone()).await?;
        self.queue.push(QueueEntry::from_job(&job));
        info!("Enqueued job '{}' (command '{}', priority {})", job.id(), job.request.command, job.request.priority);
        let _ = self.events.send(JobEvent::Created { job: job.clone() });
        Ok(job)
    }

    /// Retrieves a job by id.
    ///
    /// # Errors
    /// This function errors if the repository fails.
    #[inline]
    pub async fn get(&self, id: &str) -> Result<Option<Job>, Error> { Ok(self.repo.get(id).await?) }

    /// Lists all jobs with the given status.
    ///
    /// # Errors
    /// This function errors if the repository fails.
    #[inline]
    pub async fn get_by_status(&self, status: JobStatus) -> Result<Vec<Job>, Error> { Ok(self.repo.list_by_status(status).await?) }

    /// Lists all jobs held by the given agent.
    ///
    /// # Errors
    /// This function errors if the repository fails.
    #[inline]
    pub async fn get_by_agent(&self, agent_id: &str) -> Result<Vec<Job>, Error> { Ok(self.repo.list_by_agent(agent_id).await?) }

    /// Lists all timed-out jobs.
    ///
    /// # Errors
    /// This function errors if the repository fails.
    #[inline]
    pub async fn get_timed_out(&self) -> Result<Vec<Job>, Error> { Ok(self.repo.list_by_status(JobStatus::TimedOut).await?) }

    /// Lists every job.
    ///
    /// # Errors
    /// This function errors if the repository fails.
    #[inline]
    pub async fn list(&self) -> Result<Vec<Job>, Error> { Ok(self.repo.list().await?) }

    /// Pops the highest-priority pending job whose requirements the given offer satisfies.
    ///
    /// The job stays `Pending` but leaves the queue; the caller must follow up with
    /// [`assign`](Self::assign) or push it back via [`revert_to_pending`](Self::revert_to_pending).
    ///
    /// # Arguments
    /// - `capabilities`: The capabilities the asking node offers.
    /// - `tags`: The tags the asking node carries.
    ///
    /// # Returns
    /// The matching job, or None.
    ///
    /// # Errors
    /// This function errors if the repository fails.
    pub async fn dequeue_next(&self, capabilities: &HashSet<String>, tags: &HashSet<String>) -> Result<Option<Job>, Error> {
        let entry: QueueEntry = match self.queue.dequeue_next(capabilities, tags) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.must_get(&entry.job_id).await.map(Some)
    }

    /// Returns the queued entries in dispatch order (used by the router-driven dispatch cycle).
    #[inline]
    pub fn queue_snapshot(&self) -> Vec<QueueEntry> { self.queue.snapshot() }

    /// Assigns a pending job to a node.
    ///
    /// # Arguments
    /// - `id`: The job to assign.
    /// - `agent_id`: The node receiving it.
    ///
    /// # Returns
    /// The updated job.
    ///
    /// # Errors
    /// This function errors if the job is unknown or not `Pending`.
    pub async fn assign(&self, id: &str, agent_id: &str) -> Result<Job, Error> {
        let _guard: OwnedMutexGuard<()> = self.lock(id).await;
        let mut job: Job = self.must_get(id).await?;

        self.set_status(&mut job, JobStatus::Assigned)?;
        job.assigned_agent_id = Some(agent_id.into());
        self.queue.remove(id);
        self.repo.save(job.clone()).await?;
        self.track_assigned(agent_id);
        debug!("Assigned job '{id}' to agent '{agent_id}'");
        Ok(job)
    }

    /// Records a node's acknowledgement of a job.
    ///
    /// Duplicate acknowledgements (including after the job already advanced further) are
    /// accepted idempotently.
    ///
    /// # Errors
    /// This function errors if the job is unknown or still `Pending`.
    pub async fn acknowledge(&self, id: &str, agent_id: &str) -> Result<(), Error> {
        let _guard: OwnedMutexGuard<()> = self.lock(id).await;
        let mut job: Job = self.must_get(id).await?;

        match job.status {
            JobStatus::Assigned => {
                self.set_status(&mut job, JobStatus::Acknowledged)?;
                job.assigned_agent_id.get_or_insert_with(|| agent_id.into());
                self.repo.save(job).await?;
                Ok(())
            },
            // Late or duplicate ACKs are harmless
            JobStatus::Acknowledged | JobStatus::Running => Ok(()),
            status if status.is_terminal() => Ok(()),
            status => Err(Error::IllegalTransition { id: id.into(), from: status, to: JobStatus::Acknowledged }),
        }
    }

    /// Records a successful terminal result.
    ///
    /// A duplicate report for an already-terminal job is accepted without any state change.
    ///
    /// # Errors
    /// This function errors if the job is unknown or was never dispatched.
    pub async fn complete(&self, id: &str, result: JobResult) -> Result<(), Error> {
        let _guard: OwnedMutexGuard<()> = self.lock(id).await;
        let mut job: Job = self.must_get(id).await?;
        if job.is_terminal() {
            debug!("Ignoring duplicate terminal report for job '{id}'");
            return Ok(());
        }

        self.advance_to_running(&mut job)?;
        self.set_status(&mut job, JobStatus::Completed)?;
        job.result = Some(result.clone());
        self.untrack_assigned(&job);
        self.repo.save(job.clone()).await?;
        self.repo.release_key(job.request.effective_key()).await?;
        self.progress.clear(id);
        info!("Job '{id}' completed");
        let _ = self.events.send(JobEvent::Completed { job_id: id.into(), result });
        Ok(())
    }

    /// Records a failure report. If retry budget remains, the job is requeued; otherwise it is
    /// dead-lettered.
    ///
    /// A duplicate report for an already-terminal job is accepted without any state change.
    ///
    /// # Arguments
    /// - `id`: The failed job.
    /// - `error`: The node-reported error.
    /// - `error_code`: The node-reported error code, if any.
    ///
    /// # Returns
    /// The job as it is after the failure was processed (requeued or dead).
    ///
    /// # Errors
    /// This function errors if the job is unknown or was never dispatched.
    pub async fn fail(&self, id: &str, error: impl Into<String>, error_code: Option<String>) -> Result<Job, Error> {
        let _guard: OwnedMutexGuard<()> = self.lock(id).await;
        let mut job: Job = self.must_get(id).await?;
        if job.is_terminal() {
            debug!("Ignoring duplicate terminal report for job '{id}'");
            return Ok(job);
        }
        let error: String = error.into();

        self.advance_to_running(&mut job)?;
        self.set_status(&mut job, JobStatus::Failed)?;
        job.result = Some(JobResult::failed(id, error.clone(), error_code, Duration::ZERO));
        self.untrack_assigned(&job);
        if let Some(agent_id) = job.assigned_agent_id.clone() {
            job.excluded_agent_ids.insert(agent_id);
        }

        if job.retry_count < job.request.max_retries {
            // Retry budget remains: back to the queue
            self.set_status(&mut job, JobStatus::Pending)?;
            job.retry_count += 1;
            job.assigned_agent_id = None;
            job.result = None;
            self.repo.save(job.clone()).await?;
            self.queue.push(QueueEntry::from_job(&job));
            info!("Job '{id}' failed ('{error}'); requeued (attempt {}/{})", job.retry_count, job.request.max_retries);
        } else {
            // Budget exhausted: dead letter
            self.repo.save(job.clone()).await?;
            self.repo.release_key(job.request.effective_key()).await?;
            self.progress.clear(id);
            let entry_id: String = self.deadletter.park(job.clone(), "retries exhausted");
            warn!("Job '{id}' failed terminally ('{error}'); dead-lettered as '{entry_id}'");
            let _ = self.events.send(JobEvent::Failed { job_id: id.into(), error: error.clone() });
            let _ = self.events.send(JobEvent::DeadLettered { entry_id, job_id: id.into(), reason: "retries exhausted".into() });
        }
        Ok(job)
    }

    /// Cancels a job.
    ///
    /// Cancelling an already-terminal job is a no-op.
    ///
    /// # Arguments
    /// - `id`: The job to cancel.
    /// - `reason`: An optional human-readable reason.
    ///
    /// # Returns
    /// The id of the node currently holding the job, if any (the caller should send it a
    /// cancel command).
    ///
    /// # Errors
    /// This function errors if the job is unknown.
    pub async fn cancel(&self, id: &str, reason: Option<String>) -> Result<Option<String>, Error> {
        let _guard: OwnedMutexGuard<()> = self.lock(id).await;
        let mut job: Job = self.must_get(id).await?;
        if job.is_terminal() {
            return Ok(None);
        }

        let holder: Option<String> = job.assigned_agent_id.clone();
        self.queue.remove(id);
        self.set_status(&mut job, JobStatus::Cancelled)?;
        job.result = Some(JobResult {
            job_id: id.into(),
            status: JobStatus::Cancelled,
            data: Vec::new(),
            error: reason.or_else(|| Some("cancelled".into())),
            error_code: None,
            duration: Duration::ZERO,
            finished_at: Utc::now(),
        });
        self.untrack_assigned(&job);
        self.repo.save(job.clone()).await?;
        self.repo.release_key(job.request.effective_key()).await?;
        self.progress.clear(id);
        info!("Job '{id}' cancelled");
        Ok(holder)
    }

    /// Explicitly requeues a `Failed` or `TimedOut` job, incrementing its retry count.
    ///
    /// # Errors
    /// This function errors if the job is unknown or not in a requeueable state.
    pub async fn requeue(&self, id: &str) -> Result<Job, Error> {
        let _guard: OwnedMutexGuard<()> = self.lock(id).await;
        let mut job: Job = self.must_get(id).await?;

        self.set_status(&mut job, JobStatus::Pending)?;
        job.retry_count += 1;
        job.assigned_agent_id = None;
        job.result = None;
        self.repo.claim_key(job.request.effective_key(), job.id()).await?;
        self.repo.save(job.clone()).await?;
        self.queue.push(QueueEntry::from_job(&job));
        Ok(job)
    }

    /// Times a job out. If timeout-retry budget remains it is requeued, otherwise it is
    /// dead-lettered with reason "timeout exhausted".
    ///
    /// An already-terminal job is left untouched, which makes the sweeper's transition fire
    /// exactly once.
    ///
    /// # Arguments
    /// - `id`: The job that exceeded its timeout.
    /// - `max_timeout_retries`: The timeout-retry budget to honour.
    ///
    /// # Errors
    /// This function errors if the job is unknown.
    pub async fn requeue_for_timeout(&self, id: &str, max_timeout_retries: u32) -> Result<(), Error> {
        let _guard: OwnedMutexGuard<()> = self.lock(id).await;
        let mut job: Job = self.must_get(id).await?;
        if job.is_terminal() {
            return Ok(());
        }

        self.set_status(&mut job, JobStatus::TimedOut)?;
        job.result = Some(JobResult {
            job_id: id.into(),
            status: JobStatus::TimedOut,
            data: Vec::new(),
            error: Some("execution timeout exceeded".into()),
            error_code: Some("timeout".into()),
            duration: Duration::ZERO,
            finished_at: Utc::now(),
        });
        self.untrack_assigned(&job);
        if let Some(agent_id) = job.assigned_agent_id.clone() {
            job.excluded_agent_ids.insert(agent_id);
        }

        if job.timeout_retry_count < max_timeout_retries {
            self.set_status(&mut job, JobStatus::Pending)?;
            job.timeout_retry_count += 1;
            job.assigned_agent_id = None;
            job.result = None;
            self.repo.save(job.clone()).await?;
            self.queue.push(QueueEntry::from_job(&job));
            warn!("Job '{id}' timed out; requeued (timeout retry {}/{})", job.timeout_retry_count, max_timeout_retries);
        } else {
            self.repo.save(job.clone()).await?;
            self.repo.release_key(job.request.effective_key()).await?;
            self.progress.clear(id);
            let entry_id: String = self.deadletter.park(job.clone(), "timeout exhausted");
            warn!("Job '{id}' timed out terminally; dead-lettered as '{entry_id}'");
            let _ = self.events.send(JobEvent::DeadLettered { entry_id, job_id: id.into(), reason: "timeout exhausted".into() });
        }
        Ok(())
    }

    /// Returns a dispatched job to the queue (failed send, missed ACK deadline, or an
    /// idempotent job whose node disconnected). The current holder is excluded from the next
    /// attempt.
    ///
    /// # Errors
    /// This function errors if the job is unknown or not out with a node.
    pub async fn revert_to_pending(&self, id: &str) -> Result<(), Error> {
        let _guard: OwnedMutexGuard<()> = self.lock(id).await;
        let mut job: Job = self.must_get(id).await?;
        if job.status == JobStatus::Pending {
            // Make sure it is queued, then we are done
            self.queue.push(QueueEntry::from_job(&job));
            return Ok(());
        }

        self.untrack_assigned(&job);
        if let Some(agent_id) = job.assigned_agent_id.take() {
            job.excluded_agent_ids.insert(agent_id);
        }
        self.set_status(&mut job, JobStatus::Pending)?;
        self.repo.save(job.clone()).await?;
        self.queue.push(QueueEntry::from_job(&job));
        debug!("Job '{id}' reverted to pending");
        Ok(())
    }

    /// Ingests a progress report: clamped storage, fan-out and the implicit
    /// `Acknowledged -> Running` transition on the first report.
    ///
    /// Reports for unknown or terminal jobs are dropped silently (they are expected after
    /// cancellations and reconnect replays).
    ///
    /// # Errors
    /// This function errors if the repository fails.
    pub async fn update_progress(&self, progress: JobProgress) -> Result<(), Error> {
        let _guard: OwnedMutexGuard<()> = self.lock(&progress.job_id).await;
        let mut job: Job = match self.repo.get(&progress.job_id).await? {
            Some(job) => job,
            None => return Ok(()),
        };
        if job.is_terminal() {
            return Ok(());
        }

        if matches!(job.status, JobStatus::Assigned | JobStatus::Acknowledged) {
            self.advance_to_running(&mut job)?;
            self.repo.save(job).await?;
        }
        self.progress.record(progress.clone());
        let _ = self.events.send(JobEvent::Progress(progress));
        Ok(())
    }

    /// Routes a node-reported terminal result to the matching transition.
    ///
    /// # Errors
    /// This function errors if the job is unknown or the report is inconsistent.
    pub async fn ingest_result(&self, result: JobResult) -> Result<(), Error> {
        match result.status {
            JobStatus::Completed => self.complete(&result.job_id.clone(), result).await,
            JobStatus::Failed => {
                let error: String = result.error.clone().unwrap_or_else(|| "handler failed".into());
                self.fail(&result.job_id, error, result.error_code).await.map(|_| ())
            },
            JobStatus::Cancelled => self.cancel(&result.job_id, result.error).await.map(|_| ()),
            JobStatus::TimedOut => self.requeue_for_timeout(&result.job_id, self.config.max_timeout_retries).await,
            // Non-terminal statuses cannot arrive in a result report (the wire type forbids it)
            other => Err(Error::IllegalTransition { id: result.job_id, from: other, to: other }),
        }
    }

    /// Scans for jobs that exceeded their timeout and fires the timeout transition on each.
    ///
    /// # Returns
    /// The ids of the jobs that were timed out by this sweep.
    ///
    /// # Errors
    /// This function errors if the repository fails; per-job failures are logged and skipped.
    pub async fn sweep_timeouts(&self) -> Result<Vec<String>, Error> {
        let now: DateTime<Utc> = Utc::now();
        let mut candidates: Vec<Job> = self.repo.list_by_status(JobStatus::Running).await?;
        candidates.extend(self.repo.list_by_status(JobStatus::Acknowledged).await?);
        candidates.extend(self.repo.list_by_status(JobStatus::Assigned).await?);

        let mut swept: Vec<String> = Vec::new();
        for job in candidates {
            let deadline: DateTime<Utc> = match job.timeout_deadline() {
                Some(deadline) => deadline,
                None => continue,
            };
            if deadline < now {
                if let Err(err) = self.requeue_for_timeout(job.id(), self.config.max_timeout_retries).await {
                    warn!("Failed to time out job '{}': {err}", job.id());
                    continue;
                }
                swept.push(job.id().to_string());
            }
        }
        Ok(swept)
    }

    /// Scans for assigned jobs whose ACK deadline passed and returns them to the queue.
    ///
    /// # Returns
    /// The ids of the jobs that were reverted by this sweep.
    ///
    /// # Errors
    /// This function errors if the repository fails; per-job failures are logged and skipped.
    pub async fn sweep_ack_deadlines(&self) -> Result<Vec<String>, Error> {
        let now: DateTime<Utc> = Utc::now();
        let deadline: chrono::Duration = chrono::Duration::from_std(self.config.ack_deadline).unwrap_or_else(|_| chrono::Duration::max_value());

        let mut swept: Vec<String> = Vec::new();
        for job in self.repo.list_by_status(JobStatus::Assigned).await? {
            let assigned_at: DateTime<Utc> = match job.assigned_at {
                Some(assigned_at) => assigned_at,
                None => continue,
            };
            if now - assigned_at > deadline {
                warn!("Job '{}' was not acknowledged within the deadline; requeueing", job.id());
                if let Err(err) = self.revert_to_pending(job.id()).await {
                    warn!("Failed to revert job '{}': {err}", job.id());
                    continue;
                }
                swept.push(job.id().to_string());
            }
        }
        Ok(swept)
    }

    /// Handles a node's disconnection: every job it held is either requeued (if the caller
    /// marked it idempotent) or dead-lettered (if not; re-sending it could run it twice).
    ///
    /// # Returns
    /// The ids of the jobs that were requeued.
    ///
    /// # Errors
    /// This function errors if the repository fails; per-job failures are logged and skipped.
    pub async fn handle_agent_disconnect(&self, agent_id: &str) -> Result<Vec<String>, Error> {
        let mut requeued: Vec<String> = Vec::new();
        for job in self.repo.list_by_agent(agent_id).await? {
            if job.is_terminal() || job.status == JobStatus::Pending {
                continue;
            }

            if job.request.is_idempotent() {
                if let Err(err) = self.revert_to_pending(job.id()).await {
                    warn!("Failed to requeue job '{}' after disconnect of '{agent_id}': {err}", job.id());
                    continue;
                }
                requeued.push(job.id().to_string());
            } else {
                // Without an idempotency key we cannot risk running it twice
                if let Err(err) = self.fail_to_deadletter(job.id(), format!("agent '{agent_id}' disconnected while holding a non-idempotent job")).await
                {
                    warn!("Failed to dead-letter job '{}' after disconnect of '{agent_id}': {err}", job.id());
                }
            }
        }
        Ok(requeued)
    }

    /// Fails a job straight into the dead-letter store, bypassing the retry budget.
    async fn fail_to_deadletter(&self, id: &str, reason: String) -> Result<(), Error> {
        let _guard: OwnedMutexGuard<()> = self.lock(id).await;
        let mut job: Job = self.must_get(id).await?;
        if job.is_terminal() {
            return Ok(());
        }

        self.advance_to_running(&mut job)?;
        self.set_status(&mut job, JobStatus::Failed)?;
        job.result = Some(JobResult::failed(id, reason.clone(), None, Duration::ZERO));
        self.untrack_assigned(&job);
        self.repo.save(job.clone()).await?;
        self.repo.release_key(job.request.effective_key()).await?;
        self.progress.clear(id);
        let entry_id: String = self.deadletter.park(job, reason.clone());
        let _ = self.events.send(JobEvent::DeadLettered { entry_id, job_id: id.into(), reason });
        Ok(())
    }

    /// Retries a dead-lettered job: the entry's attempt counter is bumped and the job is
    /// re-emitted to the main queue.
    ///
    /// # Returns
    /// The requeued job.
    ///
    /// # Errors
    /// This function errors if the entry is unknown or the job cannot be requeued.
    pub async fn retry_dead_letter(&self, entry_id: &str) -> Result<Job, Error> {
        let entry = self.deadletter.mark_retry(entry_id)?;
        self.requeue(entry.job.id()).await
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use crate::repository::MemJobRepository;

    use super::*;

    /// Builds a manager over a fresh in-memory repository.
    fn manager() -> JobManager { JobManager::new(Arc::new(MemJobRepository::new()), JobManagerConfig::default()) }

    /// Builds a minimal request for the given command.
    fn request(command: &str) -> JobRequest { JobRequest::new(command) }

    #[tokio::test]
    async fn test_idempotent_enqueue() {
        let manager: JobManager = manager();
        let mut req: JobRequest = request("echo");
        req.idempotency_key = Some("k1".into());
        req.parameters = b"hi".to_vec();

        let first: Job = manager.enqueue(req.clone()).await.unwrap();
        // A resubmission with the same key (but fresh id) collapses onto the first job
        req.id = uuid::Uuid::new_v4().to_string();
        let second: Job = manager.enqueue(req.clone()).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(manager.queue_len(), 1);

        // Once the job is terminal, the key is free again
        manager.assign(first.id(), "a1").await.unwrap();
        manager.acknowledge(first.id(), "a1").await.unwrap();
        manager.complete(first.id(), JobResult::completed(first.id(), b"hi".to_vec(), Duration::ZERO)).await.unwrap();
        req.id = uuid::Uuid::new_v4().to_string();
        let third: Job = manager.enqueue(req).await.unwrap();
        assert_ne!(first.id(), third.id());
    }

    #[tokio::test]
    async fn test_happy_path_records_legal_transitions() {
        let manager: JobManager = manager();
        let job: Job = manager.enqueue(request("echo")).await.unwrap();
        let id: String = job.id().to_string();

        manager.assign(&id, "a1").await.unwrap();
        manager.acknowledge(&id, "a1").await.unwrap();
        manager.update_progress(JobProgress::new(&id, 50, "halfway")).await.unwrap();
        manager.complete(&id, JobResult::completed(&id, b"done".to_vec(), Duration::from_millis(5))).await.unwrap();

        let job: Job = manager.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.assigned_at.is_some());
        assert!(job.acknowledged_at.is_some());
        assert!(job.completed_at.is_some());
        assert!(job.assigned_at <= job.acknowledged_at && job.acknowledged_at <= job.completed_at);
        assert_eq!(job.result.unwrap().data, b"done".to_vec());
        assert_eq!(manager.active_count("a1"), 0);
    }

    #[tokio::test]
    async fn test_retry_then_success_counts_attempts() {
        let manager: JobManager = manager();
        let mut req: JobRequest = request("flaky");
        req.max_retries = 2;
        let id: String = manager.enqueue(req).await.unwrap().id().to_string();

        // Two failures, both within budget
        for attempt in 1..=2u32 {
            manager.assign(&id, &format!("a{attempt}")).await.unwrap();
            manager.acknowledge(&id, &format!("a{attempt}")).await.unwrap();
            let job: Job = manager.fail(&id, "boom", None).await.unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.retry_count, attempt);
        }

        // Third dispatch completes
        manager.assign(&id, "a3").await.unwrap();
        manager.acknowledge(&id, "a3").await.unwrap();
        manager.complete(&id, JobResult::completed(&id, vec![], Duration::ZERO)).await.unwrap();

        let job: Job = manager.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 2);
        assert!(manager.deadletter().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let manager: JobManager = manager();
        let id: String = manager.enqueue(request("flaky")).await.unwrap().id().to_string();

        manager.assign(&id, "a1").await.unwrap();
        manager.acknowledge(&id, "a1").await.unwrap();
        let job: Job = manager.fail(&id, "boom", Some("E1".into())).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        assert_eq!(manager.deadletter().len(), 1);
        let entry = &manager.deadletter().list(0, 10)[0];
        assert_eq!(entry.job.id(), id);
        assert_eq!(entry.reason, "retries exhausted");
    }

    #[tokio::test]
    async fn test_timeout_sweep_fires_exactly_once() {
        let manager: JobManager = JobManager::new(Arc::new(MemJobRepository::new()), JobManagerConfig { max_timeout_retries: 0, ..Default::default() });
        let mut req: JobRequest = request("sleep");
        req.timeout = Some(Duration::from_millis(5));
        let id: String = manager.enqueue(req).await.unwrap().id().to_string();

        manager.assign(&id, "a1").await.unwrap();
        manager.acknowledge(&id, "a1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let swept: Vec<String> = manager.sweep_timeouts().await.unwrap();
        assert_eq!(swept, vec![id.clone()]);
        let job: Job = manager.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::TimedOut);
        assert!(manager.deadletter().list(0, 10)[0].reason.contains("timeout"));

        // The second sweep finds nothing; the transition fired exactly once
        assert!(manager.sweep_timeouts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_retry_budget_requeues_first() {
        let manager: JobManager = JobManager::new(Arc::new(MemJobRepository::new()), JobManagerConfig { max_timeout_retries: 1, ..Default::default() });
        let mut req: JobRequest = request("sleep");
        req.timeout = Some(Duration::from_millis(1));
        let id: String = manager.enqueue(req).await.unwrap().id().to_string();

        manager.assign(&id, "a1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.sweep_timeouts().await.unwrap();

        let job: Job = manager.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.timeout_retry_count, 1);
        assert!(job.excluded_agent_ids.contains("a1"));
        assert_eq!(manager.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_terminal_report_is_ignored() {
        let manager: JobManager = manager();
        let id: String = manager.enqueue(request("echo")).await.unwrap().id().to_string();
        manager.assign(&id, "a1").await.unwrap();
        manager.acknowledge(&id, "a1").await.unwrap();

        manager.complete(&id, JobResult::completed(&id, b"first".to_vec(), Duration::ZERO)).await.unwrap();
        // The duplicate (even a contradicting one) changes nothing
        manager.fail(&id, "late failure", None).await.unwrap();
        let job: Job = manager.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap().data, b"first".to_vec());
    }

    #[tokio::test]
    async fn test_cancel_pending_and_running() {
        let manager: JobManager = manager();

        // Cancelling a queued job returns no holder
        let id: String = manager.enqueue(request("echo")).await.unwrap().id().to_string();
        assert_eq!(manager.cancel(&id, Some("operator".into())).await.unwrap(), None);
        assert_eq!(manager.get(&id).await.unwrap().unwrap().status, JobStatus::Cancelled);
        assert_eq!(manager.queue_len(), 0);

        // Cancelling a dispatched job names the holder
        let id: String = manager.enqueue(request("echo")).await.unwrap().id().to_string();
        manager.assign(&id, "a1").await.unwrap();
        assert_eq!(manager.cancel(&id, None).await.unwrap().as_deref(), Some("a1"));

        // Cancelling again is a no-op
        assert_eq!(manager.cancel(&id, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dequeue_next_respects_capabilities() {
        let manager: JobManager = manager();
        let mut req: JobRequest = request("train");
        req.required_capabilities = HashSet::from(["gpu".to_string()]);
        req.priority = 10;
        manager.enqueue(req).await.unwrap();
        let plain: Job = manager.enqueue(request("echo")).await.unwrap();

        // A shell-only node never receives the gpu job
        let offer: HashSet<String> = HashSet::from(["shell".to_string()]);
        let got: Job = manager.dequeue_next(&offer, &HashSet::new()).await.unwrap().unwrap();
        assert_eq!(got.id(), plain.id());
        assert!(manager.dequeue_next(&offer, &HashSet::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ack_deadline_sweep_reverts() {
        let manager: JobManager =
            JobManager::new(Arc::new(MemJobRepository::new()), JobManagerConfig { ack_deadline: Duration::from_millis(5), ..Default::default() });
        let id: String = manager.enqueue(request("echo")).await.unwrap().id().to_string();
        manager.assign(&id, "a1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let swept: Vec<String> = manager.sweep_ack_deadlines().await.unwrap();
        assert_eq!(swept, vec![id.clone()]);

        let job: Job = manager.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.excluded_agent_ids.contains("a1"));
        assert_eq!(manager.active_count("a1"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_policy_depends_on_idempotency() {
        let manager: JobManager = manager();

        // An idempotent job survives the disconnect
        let mut keyed: JobRequest = request("echo");
        keyed.idempotency_key = Some("k1".into());
        let keyed_id: String = manager.enqueue(keyed).await.unwrap().id().to_string();
        manager.assign(&keyed_id, "a1").await.unwrap();
        manager.acknowledge(&keyed_id, "a1").await.unwrap();

        // A keyless job does not
        let plain_id: String = manager.enqueue(request("echo")).await.unwrap().id().to_string();
        manager.assign(&plain_id, "a1").await.unwrap();

        let requeued: Vec<String> = manager.handle_agent_disconnect("a1").await.unwrap();
        assert_eq!(requeued, vec![keyed_id.clone()]);

        assert_eq!(manager.get(&keyed_id).await.unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(manager.get(&plain_id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(manager.deadletter().len(), 1);
        assert!(manager.deadletter().list(0, 10)[0].reason.contains("disconnected"));
    }

    #[tokio::test]
    async fn test_dead_letter_retry_reemits() {
        let manager: JobManager = manager();
        let id: String = manager.enqueue(request("flaky")).await.unwrap().id().to_string();
        manager.assign(&id, "a1").await.unwrap();
        manager.acknowledge(&id, "a1").await.unwrap();
        manager.fail(&id, "boom", None).await.unwrap();

        let entry_id: String = manager.deadletter().list(0, 10)[0].id.clone();
        let job: Job = manager.retry_dead_letter(&entry_id).await.unwrap();
        assert_eq!(job.id(), id);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(manager.queue_len(), 1);
        assert_eq!(manager.deadletter().get(&entry_id).unwrap().retry_attempts, 1);
    }
}
