//! Progress and status notifications.

use crate::job::{Job, JobId};
use crate::status::JobStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// A change observed on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A processor reported progress.
    Progress {
        job_id: JobId,
        progress: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// The job moved to a new status.
    StatusChanged {
        job_id: JobId,
        status: JobStatus,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl JobEvent {
    /// Status event for the current state of `job`.
    pub fn status(job: &Job) -> Self {
        JobEvent::StatusChanged {
            job_id: job.id.clone(),
            status: job.status,
            attempts: job.attempts,
            error: job.error.clone(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Progress { job_id, .. } | JobEvent::StatusChanged { job_id, .. } => job_id,
        }
    }

    /// Returns true for a status event into a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::StatusChanged { status, .. } if status.is_terminal())
    }
}

/// Fan-out of job events to subscribers.
pub(crate) struct ProgressHub {
    sender: broadcast::Sender<JobEvent>,
}

impl ProgressHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self, job_id: JobId) -> JobSubscription {
        JobSubscription {
            job_id,
            receiver: self.sender.subscribe(),
            seed: None,
            finished: false,
        }
    }

    pub(crate) fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

/// Stream of events for a single job.
///
/// Ends after the job reaches a terminal status. Slow subscribers skip
/// events they fell behind on rather than blocking the queue.
pub struct JobSubscription {
    job_id: JobId,
    receiver: broadcast::Receiver<JobEvent>,
    seed: Option<JobEvent>,
    finished: bool,
}

impl JobSubscription {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Queues `event` to be yielded before anything received from the hub.
    pub(crate) fn seed(&mut self, event: JobEvent) {
        self.seed = Some(event);
    }

    /// Waits for the next event of this job.
    ///
    /// Returns `None` once a terminal status was delivered or the queue is gone.
    pub async fn next(&mut self) -> Option<JobEvent> {
        if let Some(event) = self.seed.take() {
            self.finished = event.is_terminal();
            return Some(event);
        }
        if self.finished {
            return None;
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) if event.job_id() == &self.job_id => {
                    self.finished = event.is_terminal();
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(job_id = %self.job_id, skipped, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(job_id: &JobId, status: JobStatus) -> JobEvent {
        JobEvent::StatusChanged {
            job_id: job_id.clone(),
            status,
            attempts: 1,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_subscription_filters_by_job() {
        let hub = ProgressHub::new(16);
        let mine = JobId::new();
        let other = JobId::new();
        let mut subscription = hub.subscribe(mine.clone());

        hub.publish(JobEvent::Progress {
            job_id: other.clone(),
            progress: 10,
            message: None,
        });
        hub.publish(JobEvent::Progress {
            job_id: mine.clone(),
            progress: 40,
            message: Some("halfway-ish".into()),
        });

        let event = subscription.next().await.unwrap();
        assert_eq!(event.job_id(), &mine);
        assert!(matches!(event, JobEvent::Progress { progress: 40, .. }));
    }

    #[tokio::test]
    async fn test_subscription_ends_after_terminal_status() {
        let hub = ProgressHub::new(16);
        let id = JobId::new();
        let mut subscription = hub.subscribe(id.clone());

        hub.publish(status_event(&id, JobStatus::Processing));
        hub.publish(status_event(&id, JobStatus::Completed));
        hub.publish(status_event(&id, JobStatus::Completed));

        assert!(!subscription.next().await.unwrap().is_terminal());
        assert!(subscription.next().await.unwrap().is_terminal());
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_seeded_terminal_status_ends_subscription() {
        let hub = ProgressHub::new(16);
        let id = JobId::new();
        let mut subscription = hub.subscribe(id.clone());
        subscription.seed(status_event(&id, JobStatus::Failed));
        // Already buffered duplicates of the final status are not replayed.
        hub.publish(status_event(&id, JobStatus::Failed));

        assert!(subscription.next().await.unwrap().is_terminal());
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let hub = ProgressHub::new(2);
        let id = JobId::new();
        let mut subscription = hub.subscribe(id.clone());

        for progress in 0..5 {
            hub.publish(JobEvent::Progress {
                job_id: id.clone(),
                progress,
                message: None,
            });
        }

        match subscription.next().await {
            Some(JobEvent::Progress { progress, .. }) => assert_eq!(progress, 3),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let event = status_event(&JobId::from_string("j-1"), JobStatus::Failed);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["status"], "failed");
        assert!(json.get("error").is_none());
    }
}
