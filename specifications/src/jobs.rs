//  JOBS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the job data model: requests, live jobs with their lifecycle,
//!   results, progress reports and dead-letter entries. The legal status
//!   transition table lives here too, since both the host and any tooling
//!   that inspects persisted jobs must agree on it.
//

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter, Result as FResult};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use enum_debug::EnumDebug;
use serde::{Deserialize, Serialize};


/***** ERRORS *****/
/// Errors that relate to parsing job-related enums from strings.
#[derive(Debug)]
pub enum JobParseError {
    /// Unknown job status.
    UnknownStatus { raw: String },
    /// Unknown execution pattern.
    UnknownPattern { raw: String },
}
impl Display for JobParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use JobParseError::*;
        match self {
            UnknownStatus { raw } => write!(f, "Unknown job status '{raw}'"),
            UnknownPattern { raw } => write!(f, "Unknown execution pattern '{raw}'"),
        }
    }
}
impl std::error::Error for JobParseError {}





/***** AUXILLARY *****/
/// Defines the interaction pattern a job's command follows on the node.
#[derive(Clone, Copy, Debug, EnumDebug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPattern {
    /// The command is sent and no reply is expected.
    FireAndForget,
    /// The command returns a single reply payload.
    RequestResponse,
    /// The command yields a finite sequence of stream items.
    Streaming,
    /// The command runs for a while, emitting progress, before a terminal result.
    LongRunning,
}
impl Display for JobPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use JobPattern::*;
        match self {
            FireAndForget => write!(f, "fire-and-forget"),
            RequestResponse => write!(f, "request-response"),
            Streaming => write!(f, "streaming"),
            LongRunning => write!(f, "long-running"),
        }
    }
}

/// Defines the states a job can be in.
#[derive(Clone, Copy, Debug, EnumDebug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue for a node.
    Pending,
    /// Handed to a node, awaiting acknowledgement.
    Assigned,
    /// The node confirmed receipt.
    Acknowledged,
    /// The node is executing the command.
    Running,
    /// Terminal: the node reported success.
    Completed,
    /// Terminal: the node reported failure.
    Failed,
    /// Terminal: cancelled by the caller or by a workflow.
    Cancelled,
    /// Terminal: the timeout sweeper fired before a terminal report arrived.
    TimedOut,
}
impl JobStatus {
    /// Returns whether this status is terminal (absorbing, except for an explicit requeue).
    #[inline]
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut) }

    /// Returns whether a transition from this status to the given one is legal.
    ///
    /// The table is exactly:
    /// ```text
    /// Pending -> Assigned -> Acknowledged -> Running -> Completed|Failed|TimedOut
    /// Pending|Assigned|Acknowledged|Running -> Cancelled
    /// Failed|TimedOut -> Pending                 (requeue)
    /// Assigned|Acknowledged|Running -> Pending   (revert on send failure / missed ACK)
    /// Assigned|Acknowledged|Running -> TimedOut  (timeout sweeper)
    /// ```
    ///
    /// # Arguments
    /// - `next`: The status to transition to.
    ///
    /// # Returns
    /// True if the transition is allowed, false otherwise.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Assigned) => true,
            (Assigned, Acknowledged) => true,
            (Acknowledged, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            // The sweeper may time out anything that is out with a node
            (Assigned, TimedOut) | (Acknowledged, TimedOut) | (Running, TimedOut) => true,
            // Cancellation is legal from any non-terminal state
            (Pending, Cancelled) | (Assigned, Cancelled) | (Acknowledged, Cancelled) | (Running, Cancelled) => true,
            // Requeue after failure or timeout
            (Failed, Pending) | (TimedOut, Pending) => true,
            // Revert after a failed send or a missed ACK deadline
            (Assigned, Pending) | (Acknowledged, Pending) | (Running, Pending) => true,

            _ => false,
        }
    }
}
impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use JobStatus::*;
        match self {
            Pending => write!(f, "pending"),
            Assigned => write!(f, "assigned"),
            Acknowledged => write!(f, "acknowledged"),
            Running => write!(f, "running"),
            Completed => write!(f, "completed"),
            Failed => write!(f, "failed"),
            Cancelled => write!(f, "cancelled"),
            TimedOut => write!(f, "timed_out"),
        }
    }
}
impl FromStr for JobStatus {
    type Err = JobParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "acknowledged" => Ok(Self::Acknowledged),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),

            raw => Err(JobParseError::UnknownStatus { raw: raw.into() }),
        }
    }
}





/***** LIBRARY *****/
/// Defines a request for a single unit of work, as submitted by a caller.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JobRequest {
    /// Unique identifier of this request, generated by the producer.
    pub id: String,
    /// Caller-supplied idempotency key. When absent, the job is treated as non-idempotent
    /// (and the effective key defaults to `id`).
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// The command to execute on the node.
    pub command: String,
    /// The interaction pattern of the command.
    pub pattern: JobPattern,
    /// Opaque parameter payload, interpreted by the node-side handler.
    #[serde(default)]
    pub parameters: Vec<u8>,
    /// Scheduling priority; higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Optional per-job execution timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// How often the job may be retried after failure.
    #[serde(default)]
    pub max_retries: u32,
    /// Pin the job to a specific node.
    #[serde(default)]
    pub target_agent_id: Option<String>,
    /// Capabilities the executing node must advertise.
    #[serde(default)]
    pub required_capabilities: HashSet<String>,
    /// Tags the executing node must carry.
    #[serde(default)]
    pub required_tags: HashSet<String>,
    /// Correlates this job with an external flow (e.g., a workflow step).
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
impl JobRequest {
    /// Creates a minimal request for the given command with a fresh id.
    ///
    /// # Arguments
    /// - `command`: The command to execute.
    ///
    /// # Returns
    /// A new JobRequest with defaults for everything else.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            idempotency_key: None,
            command: command.into(),
            pattern: JobPattern::RequestResponse,
            parameters: Vec::new(),
            priority: 0,
            timeout: None,
            max_retries: 0,
            target_agent_id: None,
            required_capabilities: HashSet::new(),
            required_tags: HashSet::new(),
            correlation_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Returns the effective idempotency key of this request (the explicit key, or else the id).
    #[inline]
    pub fn effective_key(&self) -> &str { self.idempotency_key.as_deref().unwrap_or(&self.id) }

    /// Returns whether the caller explicitly marked this request idempotent.
    #[inline]
    pub fn is_idempotent(&self) -> bool { self.idempotency_key.is_some() }
}



/// Defines a tracked job: a request plus its full lifecycle state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Job {
    /// The request this job was created from.
    pub request: JobRequest,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// The node currently (or last) holding this job.
    pub assigned_agent_id: Option<String>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the job was last assigned to a node.
    pub assigned_at: Option<DateTime<Utc>>,
    /// When the node acknowledged the job.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// The terminal result, once reported.
    pub result: Option<JobResult>,
    /// Number of failure-driven retries performed so far.
    pub retry_count: u32,
    /// Number of timeout-driven retries performed so far.
    pub timeout_retry_count: u32,
    /// Nodes that already failed to execute this job; the router must avoid them on re-dispatch.
    #[serde(default)]
    pub excluded_agent_ids: HashSet<String>,
}
impl Job {
    /// Creates a fresh pending Job for the given request.
    ///
    /// # Arguments
    /// - `request`: The request to wrap.
    ///
    /// # Returns
    /// A new Job with `Status::Pending` and all lifecycle fields cleared.
    pub fn new(request: JobRequest) -> Self {
        Self {
            request,
            status: JobStatus::Pending,
            assigned_agent_id: None,
            created_at: Utc::now(),
            assigned_at: None,
            acknowledged_at: None,
            completed_at: None,
            result: None,
            retry_count: 0,
            timeout_retry_count: 0,
            excluded_agent_ids: HashSet::new(),
        }
    }

    /// Returns the job's id (which is the request's id).
    #[inline]
    pub fn id(&self) -> &str { &self.request.id }

    /// Returns whether this job is in a terminal state.
    #[inline]
    pub fn is_terminal(&self) -> bool { self.status.is_terminal() }

    /// Computes the moment this job times out, if it carries a timeout and is out with a node.
    ///
    /// # Returns
    /// The deadline, or None if the job has no timeout or has not been assigned.
    pub fn timeout_deadline(&self) -> Option<DateTime<Utc>> {
        let timeout: Duration = self.request.timeout?;
        let assigned: DateTime<Utc> = self.assigned_at?;
        Some(assigned + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::max_value()))
    }
}



/// Defines the terminal outcome of a job as reported by a node (or synthesised by the host).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JobResult {
    /// The job this result belongs to.
    pub job_id: String,
    /// The terminal status (`Completed`, `Failed`, `Cancelled` or `TimedOut`).
    pub status: JobStatus,
    /// Result payload (empty unless `Completed` or the handler attached diagnostics).
    #[serde(default)]
    pub data: Vec<u8>,
    /// Human-readable error, set when not `Completed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Machine-readable error code, when the handler supplied one.
    #[serde(default)]
    pub error_code: Option<String>,
    /// How long the execution took on the node.
    pub duration: Duration,
    /// When the node finished.
    pub finished_at: DateTime<Utc>,
}
impl JobResult {
    /// Creates a successful result for the given job with the given output payload.
    #[inline]
    pub fn completed(job_id: impl Into<String>, data: Vec<u8>, duration: Duration) -> Self {
        Self { job_id: job_id.into(), status: JobStatus::Completed, data, error: None, error_code: None, duration, finished_at: Utc::now() }
    }

    /// Creates a failed result for the given job with the given error.
    #[inline]
    pub fn failed(job_id: impl Into<String>, error: impl Into<String>, error_code: Option<String>, duration: Duration) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Failed,
            data: Vec::new(),
            error: Some(error.into()),
            error_code,
            duration,
            finished_at: Utc::now(),
        }
    }
}



/// Defines a single progress report for a job. Percentages outside 0..=100 are clamped at
/// construction.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JobProgress {
    /// The job this progress belongs to.
    pub job_id: String,
    /// Progress percentage in `0..=100`.
    percentage: u8,
    /// Human-readable progress message.
    pub message: String,
    /// Index of the current step, if the handler reports steps.
    #[serde(default)]
    pub current_step: Option<u32>,
    /// Total number of steps, if the handler reports steps.
    #[serde(default)]
    pub total_steps: Option<u32>,
    /// When the report was produced on the node.
    pub timestamp: DateTime<Utc>,
}
impl JobProgress {
    /// Creates a new progress report, clamping the percentage into `0..=100`.
    ///
    /// # Arguments
    /// - `job_id`: The job the progress belongs to.
    /// - `percentage`: The raw reported percentage; values above 100 are clamped to 100.
    /// - `message`: A human-readable progress message.
    ///
    /// # Returns
    /// A new JobProgress stamped with the current time.
    pub fn new(job_id: impl Into<String>, percentage: i64, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            percentage: percentage.clamp(0, 100) as u8,
            message: message.into(),
            current_step: None,
            total_steps: None,
            timestamp: Utc::now(),
        }
    }

    /// Returns the (clamped) percentage.
    #[inline]
    pub fn percentage(&self) -> u8 { self.percentage }

    /// Attaches step counters to this progress report.
    #[inline]
    pub fn with_steps(mut self, current: u32, total: u32) -> Self {
        self.current_step = Some(current);
        self.total_steps = Some(total);
        self
    }
}



/// Defines one item in a streaming job's output sequence.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StreamItem {
    /// The job this item belongs to.
    pub job_id: String,
    /// Monotonic sequence number within the job's stream.
    pub sequence: u64,
    /// The item payload.
    pub data: Vec<u8>,
    /// Whether this is the final item of the stream.
    pub is_final: bool,
}



/// Defines an entry in the dead-letter store.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeadLetterEntry {
    /// Unique id of the entry itself.
    pub id: String,
    /// The job at the moment it was dead-lettered.
    pub job: Job,
    /// Why the job ended up here.
    pub reason: String,
    /// When the entry was created.
    pub enqueued_at: DateTime<Utc>,
    /// Whether an operator asked for a retry.
    pub retry_requested: bool,
    /// How often a retry was requested for this entry.
    pub retry_attempts: u32,
}
impl DeadLetterEntry {
    /// Wraps the given job in a fresh dead-letter entry.
    ///
    /// # Arguments
    /// - `job`: The job to park.
    /// - `reason`: The reason it is parked.
    ///
    /// # Returns
    /// A new DeadLetterEntry with a generated id.
    pub fn new(job: Job, reason: impl Into<String>) -> Self {
        Self { id: uuid::Uuid::new_v4().to_string(), job, reason: reason.into(), enqueued_at: Utc::now(), retry_requested: false, retry_attempts: 0 }
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use JobStatus::*;

        // The happy path
        for (from, to) in [(Pending, Assigned), (Assigned, Acknowledged), (Acknowledged, Running), (Running, Completed)] {
            assert!(from.can_transition_to(to), "{from:?} -> {to:?} should be legal");
        }
        // Requeue
        assert!(Failed.can_transition_to(Pending));
        assert!(TimedOut.can_transition_to(Pending));
        // Cancellation from anything non-terminal
        for from in [Pending, Assigned, Acknowledged, Running] {
            assert!(from.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_terminal_states_absorbing() {
        use JobStatus::*;
        for from in [Completed, Cancelled] {
            for to in [Pending, Assigned, Acknowledged, Running, Completed, Failed, Cancelled, TimedOut] {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?} should be illegal");
            }
        }
        // Failed/TimedOut only escape via requeue to Pending
        for from in [Failed, TimedOut] {
            for to in [Assigned, Acknowledged, Running, Completed, Failed, Cancelled, TimedOut] {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?} should be illegal");
            }
            assert!(from.can_transition_to(Pending));
        }
    }

    #[test]
    fn test_skipping_states_is_illegal() {
        use JobStatus::*;
        assert!(!Pending.can_transition_to(Acknowledged));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Assigned.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_effective_key_defaults_to_id() {
        let mut req: JobRequest = JobRequest::new("echo");
        assert_eq!(req.effective_key(), req.id);
        assert!(!req.is_idempotent());

        req.idempotency_key = Some("k1".into());
        assert_eq!(req.effective_key(), "k1");
        assert!(req.is_idempotent());
    }

    #[test]
    fn test_progress_clamping() {
        assert_eq!(JobProgress::new("j", -5, "").percentage(), 0);
        assert_eq!(JobProgress::new("j", 0, "").percentage(), 0);
        assert_eq!(JobProgress::new("j", 42, "").percentage(), 42);
        assert_eq!(JobProgress::new("j", 100, "").percentage(), 100);
        assert_eq!(JobProgress::new("j", 250, "").percentage(), 100);
    }

    #[test]
    fn test_status_string_roundtrip() {
        use JobStatus::*;
        for status in [Pending, Assigned, Acknowledged, Running, Completed, Failed, Cancelled, TimedOut] {
            assert_eq!(JobStatus::from_str(&status.to_string()).unwrap(), status);
        }
        assert!(JobStatus::from_str("nonsense").is_err());
    }

    #[test]
    fn test_job_serde_roundtrip() {
        let mut req: JobRequest = JobRequest::new("echo");
        req.idempotency_key = Some("k1".into());
        req.parameters = b"hi".to_vec();
        req.priority = 7;
        req.timeout = Some(Duration::from_secs(30));
        req.max_retries = 2;
        req.required_capabilities = HashSet::from(["shell".to_string()]);
        req.metadata.insert("origin".into(), "test".into());

        let mut job: Job = Job::new(req);
        job.status = JobStatus::Running;
        job.assigned_agent_id = Some("agent-1".into());
        job.retry_count = 1;

        let raw: String = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.request.id, job.request.id);
        assert_eq!(back.request.idempotency_key, job.request.idempotency_key);
        assert_eq!(back.request.parameters, job.request.parameters);
        assert_eq!(back.request.priority, 7);
        assert_eq!(back.request.timeout, Some(Duration::from_secs(30)));
        assert_eq!(back.status, JobStatus::Running);
        assert_eq!(back.assigned_agent_id.as_deref(), Some("agent-1"));
        assert_eq!(back.retry_count, 1);
    }
}
