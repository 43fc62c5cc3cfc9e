//  DEADLETTER.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the dead-letter store: jobs that exhausted their retries
//!   (or could not be re-dispatched safely) are parked here, where an
//!   operator may inspect, retry or purge them.
//

use chrono::Utc;
use parking_lot::RwLock;
use specifications::jobs::{DeadLetterEntry, Job};

pub use crate::errors::JobError as Error;


/***** LIBRARY *****/
/// The dead-letter store. One entry per job; re-parking the same job updates its entry.
#[derive(Debug, Default)]
pub struct DeadLetterStore {
    /// The entries, newest last.
    entries: RwLock<Vec<DeadLetterEntry>>,
}
impl DeadLetterStore {
    /// Constructor for an empty DeadLetterStore.
    #[inline]
    pub fn new() -> Self { Self::default() }

    /// Parks the given job.
    ///
    /// If an entry for the same job already exists, its reason and timestamp are refreshed
    /// instead of creating a duplicate.
    ///
    /// # Arguments
    /// - `job`: The job to park, as it was when it died.
    /// - `reason`: Why it is parked.
    ///
    /// # Returns
    /// The id of the (new or refreshed) entry.
    pub fn park(&self, job: Job, reason: impl Into<String>) -> String {
        let reason: String = reason.into();
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.job.id() == job.id()) {
            entry.job = job;
            entry.reason = reason;
            entry.enqueued_at = Utc::now();
            return entry.id.clone();
        }

        let entry: DeadLetterEntry = DeadLetterEntry::new(job, reason);
        let id: String = entry.id.clone();
        entries.push(entry);
        id
    }

    /// Returns a clone of the given entry.
    #[inline]
    pub fn get(&self, entry_id: &str) -> Option<DeadLetterEntry> { self.entries.read().iter().find(|entry| entry.id == entry_id).cloned() }

    /// Returns a page of entries, oldest first.
    ///
    /// # Arguments
    /// - `offset`: How many entries to skip.
    /// - `limit`: The maximum number of entries to return.
    #[inline]
    pub fn list(&self, offset: usize, limit: usize) -> Vec<DeadLetterEntry> {
        self.entries.read().iter().skip(offset).take(limit).cloned().collect()
    }

    /// Marks the given entry for retry, incrementing its attempt counter.
    ///
    /// The job manager is responsible for actually re-emitting the job to the queue.
    ///
    /// # Returns
    /// A clone of the updated entry.
    ///
    /// # Errors
    /// This function errors if the entry is unknown.
    pub fn mark_retry(&self, entry_id: &str) -> Result<DeadLetterEntry, Error> {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|entry| entry.id == entry_id) {
            Some(entry) => {
                entry.retry_requested = true;
                entry.retry_attempts += 1;
                Ok(entry.clone())
            },
            None => Err(Error::UnknownDeadLetter { id: entry_id.into() }),
        }
    }

    /// Removes the given entry.
    ///
    /// # Errors
    /// This function errors if the entry is unknown.
    pub fn purge(&self, entry_id: &str) -> Result<(), Error> {
        let mut entries = self.entries.write();
        let before: usize = entries.len();
        entries.retain(|entry| entry.id != entry_id);
        if entries.len() == before { Err(Error::UnknownDeadLetter { id: entry_id.into() }) } else { Ok(()) }
    }

    /// Removes every entry.
    #[inline]
    pub fn purge_all(&self) { self.entries.write().clear(); }

    /// Returns the number of parked jobs.
    #[inline]
    pub fn len(&self) -> usize { self.entries.read().len() }

    /// Returns whether the store is empty.
    #[inline]
    pub fn is_empty(&self) -> bool { self.entries.read().is_empty() }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use specifications::jobs::JobRequest;

    use super::*;

    #[test]
    fn test_park_dedupes_by_job() {
        let store: DeadLetterStore = DeadLetterStore::new();
        let job: Job = Job::new(JobRequest::new("flaky"));

        let first: String = store.park(job.clone(), "retries exhausted");
        let second: String = store.park(job, "timeout exhausted");
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&first).unwrap().reason, "timeout exhausted");
    }

    #[test]
    fn test_retry_and_purge() {
        let store: DeadLetterStore = DeadLetterStore::new();
        let entry_id: String = store.park(Job::new(JobRequest::new("flaky")), "retries exhausted");

        let entry: DeadLetterEntry = store.mark_retry(&entry_id).unwrap();
        assert!(entry.retry_requested);
        assert_eq!(entry.retry_attempts, 1);
        assert_eq!(store.mark_retry(&entry_id).unwrap().retry_attempts, 2);

        store.purge(&entry_id).unwrap();
        assert!(store.is_empty());
        assert!(matches!(store.purge(&entry_id), Err(Error::UnknownDeadLetter { .. })));
    }
}
