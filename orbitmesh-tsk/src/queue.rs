//  QUEUE.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the pending-job priority queue. Entries are ordered by
//!   (priority descending, creation time ascending, id) so iteration
//!   order is dispatch order and fully deterministic.
//

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use specifications::jobs::Job;


/***** AUXILLARY *****/
/// The ordering key of a queued job.
#[derive(Clone, Debug, Eq, PartialEq)]
struct QueueKey {
    /// Higher priority dequeues first.
    priority: i32,
    /// Earlier submission dequeues first within a priority.
    created_at: DateTime<Utc>,
    /// Final deterministic tie-break.
    job_id: String,
}
impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}
impl PartialOrd for QueueKey {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

/// What the queue remembers about a pending job; enough to match it against a node without a
/// repository round-trip.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    /// The queued job's id.
    pub job_id: String,
    /// Its scheduling priority.
    pub priority: i32,
    /// When it was created.
    pub created_at: DateTime<Utc>,
    /// The capabilities the executing node must cover.
    pub required_capabilities: HashSet<String>,
    /// The tags the executing node must carry.
    pub required_tags: HashSet<String>,
    /// A specific node the job is pinned to, if any.
    pub target_agent_id: Option<String>,
}
impl QueueEntry {
    /// Derives a queue entry from a job record.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id().to_string(),
            priority: job.request.priority,
            created_at: job.created_at,
            required_capabilities: job.request.required_capabilities.clone(),
            required_tags: job.request.required_tags.clone(),
            target_agent_id: job.request.target_agent_id.clone(),
        }
    }

    /// Returns whether this entry may run on a node offering the given capabilities and tags.
    #[inline]
    pub fn matches(&self, capabilities: &HashSet<String>, tags: &HashSet<String>) -> bool {
        self.required_capabilities.is_subset(capabilities) && self.required_tags.is_subset(tags)
    }

    /// Returns the ordering key of this entry.
    #[inline]
    fn key(&self) -> QueueKey { QueueKey { priority: self.priority, created_at: self.created_at, job_id: self.job_id.clone() } }
}

/// The queue's internal state.
#[derive(Debug, Default)]
struct QueueInner {
    /// Entries in dispatch order.
    entries: BTreeMap<QueueKey, QueueEntry>,
    /// Job id -> its ordering key, for O(log n) removal.
    by_id: HashMap<String, QueueKey>,
}





/***** LIBRARY *****/
/// The pending-job priority queue. Only non-terminal (in fact: only `Pending`) jobs occupy it.
#[derive(Debug, Default)]
pub struct PendingQueue {
    /// The state, under one lock.
    inner: Mutex<QueueInner>,
}
impl PendingQueue {
    /// Constructor for an empty PendingQueue.
    #[inline]
    pub fn new() -> Self { Self::default() }

    /// Pushes a job onto the queue. Re-pushing the same job id replaces the entry.
    pub fn push(&self, entry: QueueEntry) {
        let mut inner = self.inner.lock();
        if let Some(old_key) = inner.by_id.remove(&entry.job_id) {
            inner.entries.remove(&old_key);
        }
        let key: QueueKey = entry.key();
        inner.by_id.insert(entry.job_id.clone(), key.clone());
        inner.entries.insert(key, entry);
    }

    /// Removes the given job from the queue.
    ///
    /// # Returns
    /// True if the job was queued.
    pub fn remove(&self, job_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_id.remove(job_id) {
            Some(key) => inner.entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// Pops the highest-priority entry that matches the given capability and tag offer.
    ///
    /// # Arguments
    /// - `capabilities`: The capabilities the asking node offers.
    /// - `tags`: The tags the asking node carries.
    ///
    /// # Returns
    /// The matching entry, or None if nothing in the queue fits.
    pub fn dequeue_next(&self, capabilities: &HashSet<String>, tags: &HashSet<String>) -> Option<QueueEntry> {
        let mut inner = self.inner.lock();
        let key: QueueKey = inner.entries.iter().find(|(_, entry)| entry.matches(capabilities, tags)).map(|(key, _)| key.clone())?;
        inner.by_id.remove(&key.job_id);
        inner.entries.remove(&key)
    }

    /// Returns all queued entries in dispatch order, without removing them.
    #[inline]
    pub fn snapshot(&self) -> Vec<QueueEntry> { self.inner.lock().entries.values().cloned().collect() }

    /// Returns whether the given job is queued.
    #[inline]
    pub fn contains(&self, job_id: &str) -> bool { self.inner.lock().by_id.contains_key(job_id) }

    /// Returns the number of queued jobs.
    #[inline]
    pub fn len(&self) -> usize { self.inner.lock().entries.len() }

    /// Returns whether the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool { self.inner.lock().entries.is_empty() }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use specifications::jobs::JobRequest;

    use super::*;

    /// Builds a queue entry directly.
    fn entry(id: &str, priority: i32, caps: &[&str]) -> QueueEntry {
        QueueEntry {
            job_id: id.into(),
            priority,
            created_at: Utc::now(),
            required_capabilities: caps.iter().map(|cap| (*cap).to_string()).collect(),
            required_tags: HashSet::new(),
            target_agent_id: None,
        }
    }

    #[test]
    fn test_priority_then_age_ordering() {
        let queue: PendingQueue = PendingQueue::new();
        queue.push(entry("low", 0, &[]));
        queue.push(entry("high", 10, &[]));
        queue.push(entry("mid", 5, &[]));

        let order: Vec<String> = queue.snapshot().into_iter().map(|entry| entry.job_id).collect();
        assert_eq!(order, vec!["high".to_string(), "mid".to_string(), "low".to_string()]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue: PendingQueue = PendingQueue::new();
        let mut first: QueueEntry = entry("first", 1, &[]);
        let mut second: QueueEntry = entry("second", 1, &[]);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        second.created_at = Utc::now();
        queue.push(second);
        queue.push(first);

        let order: Vec<String> = queue.snapshot().into_iter().map(|entry| entry.job_id).collect();
        assert_eq!(order, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_dequeue_respects_capabilities() {
        let queue: PendingQueue = PendingQueue::new();
        queue.push(entry("gpu-job", 10, &["gpu"]));
        queue.push(entry("plain-job", 0, &[]));

        // A node without 'gpu' skips the higher-priority job
        let offer: HashSet<String> = HashSet::from(["shell".to_string()]);
        let got: QueueEntry = queue.dequeue_next(&offer, &HashSet::new()).unwrap();
        assert_eq!(got.job_id, "plain-job");

        // A gpu node gets the gpu job
        let offer: HashSet<String> = HashSet::from(["gpu".to_string()]);
        let got: QueueEntry = queue.dequeue_next(&offer, &HashSet::new()).unwrap();
        assert_eq!(got.job_id, "gpu-job");

        // Nothing left
        assert!(queue.dequeue_next(&offer, &HashSet::new()).is_none());
    }

    #[test]
    fn test_remove_and_repush() {
        let queue: PendingQueue = PendingQueue::new();
        let job: Job = Job::new(JobRequest::new("echo"));
        queue.push(QueueEntry::from_job(&job));
        assert!(queue.contains(job.id()));
        assert!(queue.remove(job.id()));
        assert!(!queue.remove(job.id()));
        assert!(queue.is_empty());
    }
}
