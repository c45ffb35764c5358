use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::history::Attachment;
use super::object::ObjectId;
use super::transition::TransitionId;

/// Per-object values actions add to the transition history entry.
pub type HistoryKwargs = BTreeMap<ObjectId, BTreeMap<String, Value>>;

/// Values passed from one action to the ones that run after it.
pub type SharedParams = BTreeMap<String, Value>;

/// Flat user input of a transition form, keys are `<action>__<field>`.
pub type ActionData = BTreeMap<String, Value>;

/// Lifecycle status of a [`TransitionJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
    Killed,
    /// Paused by an action until something external resumes it.
    Frozen,
}

impl JobStatus {
    pub const NOT_ENDED: [JobStatus; 3] = [JobStatus::Queued, JobStatus::Started, JobStatus::Frozen];

    pub fn is_ended(self) -> bool {
        !Self::NOT_ENDED.contains(&self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
            JobStatus::Frozen => "frozen",
        };
        f.write_str(s)
    }
}

/// Execution status of a single action within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionJobActionStatus {
    Started,
    Finished,
    Failed,
}

impl fmt::Display for TransitionJobActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransitionJobActionStatus::Started => "started",
            TransitionJobActionStatus::Finished => "finished",
            TransitionJobActionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Parameters captured when the transition was triggered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    #[serde(default)]
    pub data: ActionData,
    #[serde(default)]
    pub history_kwargs: HistoryKwargs,
    #[serde(default)]
    pub shared_params: SharedParams,
}

impl JobParams {
    pub fn new(object_id: ObjectId, data: ActionData) -> Self {
        let mut history_kwargs = HistoryKwargs::new();
        history_kwargs.insert(object_id, BTreeMap::new());
        Self {
            data,
            history_kwargs,
            shared_params: SharedParams::new(),
        }
    }
}

/// Exclusive claim of a worker on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// One asynchronous run of a transition against one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionJob {
    pub id: Uuid,
    pub service_name: String,
    pub user: Option<String>,
    pub object_id: ObjectId,
    pub transition_id: TransitionId,
    pub params: JobParams,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransitionJob {
    pub fn new(
        service_name: impl Into<String>,
        user: Option<String>,
        object_id: ObjectId,
        transition_id: TransitionId,
        params: JobParams,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            service_name: service_name.into(),
            user,
            object_id,
            transition_id,
            params,
            status: JobStatus::Queued,
            reason: None,
            lease: None,
            not_before: None,
            attachments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True while the job has not ended (queued, started or frozen).
    pub fn is_running(&self) -> bool {
        !self.status.is_ended()
    }

    pub fn is_killed(&self) -> bool {
        self.status == JobStatus::Killed
    }

    /// Queued and past its `not_before`, or started with an expired lease.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => self.not_before.is_none_or(|at| at <= now),
            JobStatus::Started => self.lease.as_ref().is_none_or(|l| !l.is_live(now)),
            _ => false,
        }
    }

    pub fn live_lease_owner(&self, now: DateTime<Utc>) -> Option<&str> {
        self.lease
            .as_ref()
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.owner.as_str())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn start(&mut self) {
        if self.status == JobStatus::Queued {
            self.status = JobStatus::Started;
            self.not_before = None;
        }
        self.touch();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.reason = Some(reason.into());
        self.touch();
    }

    pub fn success(&mut self) {
        self.status = JobStatus::Finished;
        self.reason = None;
        self.touch();
    }

    pub fn freeze(&mut self) {
        self.status = JobStatus::Frozen;
        self.touch();
    }

    pub fn kill(&mut self) {
        self.status = JobStatus::Killed;
        self.touch();
    }

    /// Put the job back in the queue, not to be picked up before `delay` passes.
    pub fn reschedule(&mut self, delay: Duration) {
        self.status = JobStatus::Queued;
        self.not_before = Some(Utc::now() + delay);
        self.touch();
    }

    pub fn unfreeze(&mut self) -> bool {
        if self.status != JobStatus::Frozen {
            return false;
        }
        self.status = JobStatus::Queued;
        self.not_before = None;
        self.touch();
        true
    }
}

impl fmt::Display for TransitionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.service_name, self.id)
    }
}

/// Execution record of one action within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionJobAction {
    pub job_id: Uuid,
    pub action_name: String,
    pub status: TransitionJobActionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransitionJobAction {
    pub fn started(job_id: Uuid, action_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            action_name: action_name.into(),
            status: TransitionJobActionStatus::Started,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: TransitionJobActionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

impl fmt::Display for TransitionJobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job() -> TransitionJob {
        TransitionJob::new("ASYNC_TRANSITIONS", Some("jdoe".into()), 1, 1, JobParams::new(1, ActionData::new()))
    }

    #[test]
    fn job_creation_defaults() {
        let job = make_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.is_running());
        assert!(job.lease.is_none());
        assert!(job.params.history_kwargs.contains_key(&1));
    }

    #[test]
    fn start_only_moves_queued_jobs() {
        let mut job = make_job();
        job.start();
        assert_eq!(job.status, JobStatus::Started);

        job.fail("boom");
        job.start();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.is_running());
        assert_eq!(job.reason.as_deref(), Some("boom"));
    }

    #[test]
    fn frozen_job_is_running_but_not_due() {
        let mut job = make_job();
        job.start();
        job.freeze();
        assert!(job.is_running());
        assert!(!job.is_due(Utc::now()));

        assert!(job.unfreeze());
        assert!(job.is_due(Utc::now()));
        assert!(!job.unfreeze());
    }

    #[test]
    fn rescheduled_job_waits_for_delay() {
        let mut job = make_job();
        job.start();
        job.reschedule(Duration::seconds(60));
        assert_eq!(job.status, JobStatus::Queued);
        assert!(!job.is_due(Utc::now()));
        assert!(job.is_due(Utc::now() + Duration::seconds(61)));
    }

    #[test]
    fn started_job_is_due_once_lease_expires() {
        let mut job = make_job();
        job.start();
        let now = Utc::now();
        job.lease = Some(Lease {
            owner: "w1".into(),
            expires_at: now + Duration::seconds(30),
        });
        assert!(!job.is_due(now));
        assert_eq!(job.live_lease_owner(now), Some("w1"));
        assert!(job.is_due(now + Duration::seconds(31)));
        assert_eq!(job.live_lease_owner(now + Duration::seconds(31)), None);
    }

    #[test]
    fn every_write_touches_updated_at() {
        let mut job = make_job();
        let created = job.updated_at;
        job.start();
        job.freeze();
        assert!(job.unfreeze());
        assert!(job.updated_at >= created);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn killed_is_ended() {
        let mut job = make_job();
        job.kill();
        assert!(job.is_killed());
        assert!(JobStatus::Killed.is_ended());
        assert!(!JobStatus::Frozen.is_ended());
    }
}
