//  REPORTER.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the agent's outbound reporting path. While the transport
//!   is up, reports go straight out; while it is down they are parked in
//!   a bounded queue (drop-oldest on overflow, max age one hour) and
//!   replayed in order on reconnect. The host accepts duplicate terminal
//!   reports idempotently, so replaying is always safe.
//

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;
use specifications::jobs::{JobProgress, JobResult, StreamItem};
use specifications::reporting::{
    AcknowledgeRequest, ProgressReport, ReportConvertError, ReportingServiceClient, ResultReport, StateReport, StreamItemReport,
};
use tonic::Status;


/***** CONSTANTS *****/
/// The default maximum number of parked reports.
pub const DEFAULT_QUEUE_LIMIT: usize = 100;
/// The default maximum age of a parked report.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);





/***** AUXILLARY *****/
/// One outbound report.
#[derive(Clone, Debug)]
pub enum OutboundReport {
    /// A job acknowledgement.
    Ack { job_id: String },
    /// A progress report.
    Progress(ProgressReport),
    /// A terminal result.
    Result(ResultReport),
    /// One item of a streaming job.
    Stream(StreamItemReport),
    /// A self-reported lifecycle state.
    State(StateReport),
}

/// A parked report with its age.
#[derive(Clone, Debug)]
struct QueuedReport {
    /// The report itself.
    report: OutboundReport,
    /// When it was parked.
    enqueued_at: Instant,
}





/***** LIBRARY *****/
/// The agent's outbound reporting path, with its reconnect queue.
#[derive(Debug)]
pub struct Reporter {
    /// The id this agent reports as.
    agent_id: String,
    /// The live client, when the transport is up.
    client: Mutex<Option<ReportingServiceClient>>,
    /// Parked reports, oldest first.
    queue: Mutex<VecDeque<QueuedReport>>,
    /// Maximum number of parked reports.
    queue_limit: usize,
    /// Maximum age of a parked report.
    max_age: Duration,
}

impl Reporter {
    /// Constructor for the Reporter with the default queue bounds.
    #[inline]
    pub fn new(agent_id: impl Into<String>) -> Self { Self::with_limits(agent_id, DEFAULT_QUEUE_LIMIT, DEFAULT_MAX_AGE) }

    /// Constructor for the Reporter with explicit queue bounds.
    ///
    /// # Arguments
    /// - `agent_id`: The id this agent reports as.
    /// - `queue_limit`: Maximum number of parked reports (oldest dropped on overflow).
    /// - `max_age`: Parked reports older than this are dropped at replay time.
    pub fn with_limits(agent_id: impl Into<String>, queue_limit: usize, max_age: Duration) -> Self {
        Self { agent_id: agent_id.into(), client: Mutex::new(None), queue: Mutex::new(VecDeque::new()), queue_limit, max_age }
    }

    /// Returns the agent id this reporter speaks for.
    #[inline]
    pub fn agent_id(&self) -> &str { &self.agent_id }

    /// Installs a live client and replays the parked reports in order.
    pub async fn set_client(&self, client: ReportingServiceClient) {
        *self.client.lock() = Some(client);
        let replayed: usize = self.flush().await;
        if replayed > 0 {
            debug!("Replayed {replayed} parked report(s) after reconnect");
        }
    }

    /// Drops the client (transport went away).
    #[inline]
    pub fn clear_client(&self) { *self.client.lock() = None; }

    /// Returns the number of parked reports.
    #[inline]
    pub fn queued(&self) -> usize { self.queue.lock().len() }

    /// Sends one report through the live client.
    async fn send_raw(&self, report: OutboundReport) -> Result<(), Status> {
        // Clone the client out so the lock never spans an await
        let mut client: ReportingServiceClient = match self.client.lock().clone() {
            Some(client) => client,
            None => return Err(Status::unavailable("no live transport")),
        };

        match report {
            OutboundReport::Ack { job_id } => {
                client.acknowledge_job(AcknowledgeRequest { job_id, agent_id: self.agent_id.clone() }).await?;
            },
            OutboundReport::Progress(report) => {
                client.report_progress(report).await?;
            },
            OutboundReport::Result(report) => {
                client.report_result(report).await?;
            },
            OutboundReport::Stream(report) => {
                client.report_stream_item(report).await?;
            },
            OutboundReport::State(report) => {
                client.report_state(report).await?;
            },
        }
        Ok(())
    }

    /// Parks a report, dropping the oldest when the queue overflows.
    fn park(&self, report: OutboundReport) {
        let mut queue = self.queue.lock();
        while queue.len() >= self.queue_limit {
            queue.pop_front();
        }
        queue.push_back(QueuedReport { report, enqueued_at: Instant::now() });
    }

    /// Dispatches a report: straight out when the transport is up, parked otherwise.
    ///
    /// While older reports are still parked, new ones queue behind them so the host always
    /// sees reports in production order.
    pub async fn dispatch(&self, report: OutboundReport) {
        if self.queued() > 0 {
            self.park(report);
            self.flush().await;
            return;
        }
        if let Err(err) = self.send_raw(report.clone()).await {
            debug!("Parking report after send failure: {err}");
            self.clear_client();
            self.park(report);
        }
    }

    /// Replays parked reports in order, stopping at the first failure (order is preserved:
    /// the failed report goes back to the front).
    ///
    /// # Returns
    /// How many reports were replayed.
    pub async fn flush(&self) -> usize {
        let mut replayed: usize = 0;
        loop {
            // Pop the next still-fresh report
            let next: OutboundReport = {
                let mut queue = self.queue.lock();
                loop {
                    match queue.pop_front() {
                        Some(entry) if entry.enqueued_at.elapsed() > self.max_age => {
                            warn!("Dropping parked report older than {:?}", self.max_age);
                            continue;
                        },
                        Some(entry) => break entry.report,
                        None => return replayed,
                    }
                }
            };

            if let Err(err) = self.send_raw(next.clone()).await {
                debug!("Replay stopped: {err}");
                // Back to the front so ordering survives the next attempt
                self.queue.lock().push_front(QueuedReport { report: next, enqueued_at: Instant::now() });
                return replayed;
            }
            replayed += 1;
        }
    }



    /// Reports a job acknowledgement.
    pub async fn ack(&self, job_id: impl Into<String>) { self.dispatch(OutboundReport::Ack { job_id: job_id.into() }).await }

    /// Reports job progress.
    pub async fn progress(&self, progress: &JobProgress) {
        self.dispatch(OutboundReport::Progress(ProgressReport {
            job_id: progress.job_id.clone(),
            percentage: progress.percentage() as i64,
            message: progress.message.clone(),
            current_step: progress.current_step,
            total_steps: progress.total_steps,
            timestamp_ms: progress.timestamp.timestamp_millis(),
            agent_id: self.agent_id.clone(),
        }))
        .await
    }

    /// Reports a terminal result.
    ///
    /// # Errors
    /// This function errors if the result's status is not terminal (a handler bug).
    pub async fn result(&self, result: &JobResult) -> Result<(), ReportConvertError> {
        let report: ResultReport = ResultReport::from_result(result, &self.agent_id)?;
        self.dispatch(OutboundReport::Result(report)).await;
        Ok(())
    }

    /// Reports one item of a streaming job.
    pub async fn stream_item(&self, item: &StreamItem) {
        self.dispatch(OutboundReport::Stream(StreamItemReport {
            job_id: item.job_id.clone(),
            sequence: item.sequence,
            data: item.data.clone(),
            is_final: item.is_final,
            agent_id: self.agent_id.clone(),
        }))
        .await
    }

    /// Reports the agent's own lifecycle state.
    pub async fn state(&self, state: impl Into<String>) {
        self.dispatch(OutboundReport::State(StateReport { agent_id: self.agent_id.clone(), reported_state: state.into() })).await
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_park_without_transport() {
        let reporter: Reporter = Reporter::new("a1");
        reporter.ack("j1").await;
        reporter.state("ready").await;
        assert_eq!(reporter.queued(), 2);

        // Flushing without a client replays nothing and keeps the queue
        assert_eq!(reporter.flush().await, 0);
        assert_eq!(reporter.queued(), 2);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let reporter: Reporter = Reporter::with_limits("a1", 3, DEFAULT_MAX_AGE);
        for i in 0..5 {
            reporter.ack(format!("j{i}")).await;
        }
        assert_eq!(reporter.queued(), 3);

        // The survivors are the newest three, still in order
        let queue = reporter.queue.lock();
        let ids: Vec<String> = queue
            .iter()
            .map(|entry| match &entry.report {
                OutboundReport::Ack { job_id } => job_id.clone(),
                other => panic!("Unexpected report {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["j2".to_string(), "j3".to_string(), "j4".to_string()]);
    }

    #[tokio::test]
    async fn test_aged_reports_are_dropped_at_replay() {
        let reporter: Reporter = Reporter::with_limits("a1", 10, Duration::ZERO);
        reporter.ack("j1").await;
        assert_eq!(reporter.queued(), 1);

        // With max age zero the entry is stale immediately; replay drains it without sending
        assert_eq!(reporter.flush().await, 0);
        assert_eq!(reporter.queued(), 0);
    }
}
