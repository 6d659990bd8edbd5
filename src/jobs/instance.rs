//! Job instance lifecycle
//!
//! An instance walks `Created → Started → Running` and ends in exactly one
//! of `Completed`, `Failed` or `Cancelled`. Terminal states are absorbing;
//! the transition that reaches one fires the single end event. Progress
//! lines are kept in a bounded tail and broadcast on the instance's topic.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{job_topic, BusEvent, EventBus, JobEvent};

use super::definition::JobParameters;

/// Progress lines retained for late subscribers.
const TAIL_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Started,
    Running,
    Failed,
    Cancelled,
    Completed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Cancelled | JobStatus::Completed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::Started => 1,
            JobStatus::Running => 2,
            JobStatus::Failed | JobStatus::Cancelled | JobStatus::Completed => 3,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Created => "CREATED",
            JobStatus::Started => "STARTED",
            JobStatus::Running => "RUNNING",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Completed => "COMPLETED",
        };
        write!(f, "{}", name)
    }
}

/// Persistable snapshot of an instance, also the REST view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub status: JobStatus,
    pub parameters: JobParameters,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tail: Vec<String>,
}

struct InstanceState {
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

pub struct JobInstance {
    pub id: String,
    pub type_name: String,
    pub parameters: JobParameters,
    pub created_at: DateTime<Utc>,
    state: Mutex<InstanceState>,
    status_tx: watch::Sender<JobStatus>,
    tail: Mutex<VecDeque<String>>,
    cancel: CancellationToken,
    events: Arc<EventBus>,
}

impl JobInstance {
    pub fn new(
        type_name: impl Into<String>,
        parameters: JobParameters,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(JobStatus::Created);
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            type_name: type_name.into(),
            parameters,
            created_at: Utc::now(),
            state: Mutex::new(InstanceState {
                status: JobStatus::Created,
                started_at: None,
                ended_at: None,
                error: None,
            }),
            status_tx,
            tail: Mutex::new(VecDeque::new()),
            cancel: CancellationToken::new(),
            events,
        })
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    /// Advance the state machine. Returns false when the transition is not
    /// a forward move (terminal states absorb everything).
    pub fn try_advance(&self, to: JobStatus, error: Option<String>) -> bool {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() || to.rank() <= state.status.rank() {
                return false;
            }
            state.status = to;
            match to {
                JobStatus::Started => state.started_at = Some(Utc::now()),
                _ if to.is_terminal() => {
                    state.ended_at = Some(Utc::now());
                    state.error = error;
                }
                _ => {}
            }
        }
        self.status_tx.send_replace(to);
        self.events.publish(
            &job_topic(&self.id),
            BusEvent::Job(JobEvent {
                job: self.id.clone(),
                line: None,
                status: Some(to.to_string()),
            }),
        );
        true
    }

    /// Append a progress line and broadcast it on the instance topic.
    pub fn fire(&self, line: impl Into<String>) {
        let line = line.into();
        {
            let mut tail = self.tail.lock();
            if tail.len() >= TAIL_LIMIT {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        self.events.publish(
            &job_topic(&self.id),
            BusEvent::Job(JobEvent {
                job: self.id.clone(),
                line: Some(line),
                status: None,
            }),
        );
    }

    pub fn tail(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }

    /// Request cooperative cancellation. Idempotent; the running handler
    /// observes the token and winds down.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve when the instance reaches a terminal status.
    pub async fn at_end(&self) -> JobStatus {
        let mut rx = self.status_tx.subscribe();
        let status = rx
            .wait_for(|status| status.is_terminal())
            .await
            .map(|s| *s)
            // The sender lives inside self, so this only fires in teardown.
            .unwrap_or_else(|_| self.status());
        status
    }

    pub fn record(&self) -> JobRecord {
        let state = self.state.lock();
        JobRecord {
            id: self.id.clone(),
            type_name: self.type_name.clone(),
            status: state.status,
            parameters: self.parameters.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            ended_at: state.ended_at,
            error: state.error.clone(),
            tail: self.tail.lock().iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> Arc<JobInstance> {
        JobInstance::new("job.test", JobParameters::new(), Arc::new(EventBus::new()))
    }

    #[test]
    fn test_monotonic_transitions() {
        let job = instance();
        assert_eq!(job.status(), JobStatus::Created);

        assert!(job.try_advance(JobStatus::Started, None));
        assert!(job.try_advance(JobStatus::Running, None));
        // Backwards moves are rejected.
        assert!(!job.try_advance(JobStatus::Started, None));
        assert!(job.try_advance(JobStatus::Completed, None));
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[test]
    fn test_terminal_states_absorb() {
        let job = instance();
        job.try_advance(JobStatus::Started, None);
        job.try_advance(JobStatus::Running, None);
        assert!(job.try_advance(JobStatus::Failed, Some("boom".into())));

        assert!(!job.try_advance(JobStatus::Completed, None));
        assert!(!job.try_advance(JobStatus::Cancelled, None));
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.record().error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_at_end_resolves_once_terminal() {
        let job = instance();
        let waiter = {
            let job = job.clone();
            tokio::spawn(async move { job.at_end().await })
        };

        job.try_advance(JobStatus::Started, None);
        job.try_advance(JobStatus::Running, None);
        job.try_advance(JobStatus::Completed, None);

        assert_eq!(waiter.await.unwrap(), JobStatus::Completed);
        // Late waiters resolve immediately.
        assert_eq!(job.at_end().await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_progress_events_and_tail() {
        let events = Arc::new(EventBus::new());
        let job = JobInstance::new("job.test", JobParameters::new(), events.clone());
        let mut rx = events.subscribe(&job_topic(&job.id));

        job.fire("step one");
        job.fire("step two");

        assert_eq!(job.tail(), vec!["step one", "step two"]);
        match rx.recv().await.unwrap() {
            BusEvent::Job(ev) => assert_eq!(ev.line.as_deref(), Some("step one")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_tail_is_bounded() {
        let job = instance();
        for i in 0..(TAIL_LIMIT + 25) {
            job.fire(format!("line {}", i));
        }
        let tail = job.tail();
        assert_eq!(tail.len(), TAIL_LIMIT);
        assert_eq!(tail[0], "line 25");
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let job = instance();
        assert!(!job.is_cancel_requested());
        job.cancel();
        job.cancel();
        assert!(job.is_cancel_requested());
    }
}
