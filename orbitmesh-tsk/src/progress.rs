//  PROGRESS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the progress service: the latest report and a bounded
//!   history per job, plus best-effort fan-out to subscribers. There are
//!   no back-pressure guarantees; subscribers that fall away are
//!   detached on the next report.
//

use std::collections::VecDeque;

use dashmap::DashMap;
use specifications::jobs::JobProgress;
use tokio::sync::mpsc;


/***** CONSTANTS *****/
/// How many historical reports are kept per job.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;





/***** AUXILLARY *****/
/// What the service tracks per job.
#[derive(Debug, Default)]
struct ProgressTrack {
    /// The most recent report.
    latest: Option<JobProgress>,
    /// The last [`DEFAULT_HISTORY_LIMIT`] reports, oldest first.
    history: VecDeque<JobProgress>,
}





/***** LIBRARY *****/
/// Ingests progress reports and fans them out to subscribers.
#[derive(Debug)]
pub struct ProgressService {
    /// Per-job tracking state.
    tracks: DashMap<String, ProgressTrack>,
    /// Per-job subscriber lists.
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<JobProgress>>>,
    /// How many historical entries to keep per job.
    history_limit: usize,
}

impl Default for ProgressService {
    #[inline]
    fn default() -> Self { Self::new(DEFAULT_HISTORY_LIMIT) }
}
impl ProgressService {
    /// Constructor for the ProgressService.
    ///
    /// # Arguments
    /// - `history_limit`: How many historical reports to keep per job.
    #[inline]
    pub fn new(history_limit: usize) -> Self { Self { tracks: DashMap::new(), subscribers: DashMap::new(), history_limit } }

    /// Records a progress report and fans it out to the job's subscribers.
    ///
    /// # Arguments
    /// - `progress`: The (already clamped) report to record.
    pub fn record(&self, progress: JobProgress) {
        // Update the track
        {
            let mut track = self.tracks.entry(progress.job_id.clone()).or_default();
            track.latest = Some(progress.clone());
            track.history.push_back(progress.clone());
            while track.history.len() > self.history_limit {
                track.history.pop_front();
            }
        }

        // Fan out, detaching subscribers whose receiver is gone
        if let Some(mut subscribers) = self.subscribers.get_mut(&progress.job_id) {
            subscribers.retain(|tx| tx.send(progress.clone()).is_ok());
        }
    }

    /// Subscribes to all future reports for the given job.
    ///
    /// # Arguments
    /// - `job_id`: The job to watch.
    ///
    /// # Returns
    /// An unbounded receiver of reports. Dropping it detaches the subscription.
    pub fn subscribe(&self, job_id: &str) -> mpsc::UnboundedReceiver<JobProgress> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(job_id.into()).or_default().push(tx);
        rx
    }

    /// Returns the latest report for the given job.
    #[inline]
    pub fn latest(&self, job_id: &str) -> Option<JobProgress> { self.tracks.get(job_id).and_then(|track| track.latest.clone()) }

    /// Returns the recorded history for the given job, oldest first.
    #[inline]
    pub fn history(&self, job_id: &str) -> Vec<JobProgress> {
        self.tracks.get(job_id).map(|track| track.history.iter().cloned().collect()).unwrap_or_default()
    }

    /// Drops all state for the given job (called on terminal transitions).
    pub fn clear(&self, job_id: &str) {
        self.tracks.remove(job_id);
        self.subscribers.remove(job_id);
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_and_bounded_history() {
        let service: ProgressService = ProgressService::new(3);
        for pct in [10, 20, 30, 40, 50] {
            service.record(JobProgress::new("j1", pct, format!("{pct}%")));
        }

        assert_eq!(service.latest("j1").unwrap().percentage(), 50);
        let history: Vec<u8> = service.history("j1").iter().map(|progress| progress.percentage()).collect();
        assert_eq!(history, vec![30, 40, 50]);
    }

    #[tokio::test]
    async fn test_subscribe_and_detach() {
        let service: ProgressService = ProgressService::new(10);
        let mut rx = service.subscribe("j1");

        service.record(JobProgress::new("j1", 25, "a quarter"));
        assert_eq!(rx.recv().await.unwrap().percentage(), 25);

        // Dropping the receiver detaches on the next record
        drop(rx);
        service.record(JobProgress::new("j1", 50, "half"));
        assert!(service.subscribers.get("j1").unwrap().is_empty());
    }

    #[test]
    fn test_clear_drops_everything() {
        let service: ProgressService = ProgressService::default();
        service.record(JobProgress::new("j1", 99, "almost"));
        service.clear("j1");
        assert!(service.latest("j1").is_none());
        assert!(service.history("j1").is_empty());
    }
}
