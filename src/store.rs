//! Transactional state of objects, transitions and transition jobs.
//!
//! [`Store::atomic`] runs a closure on a copy of the state and swaps it in
//! only when the closure succeeds, so a failing action leaves nothing
//! behind. A store opened from a path re-reads its JSON file at the start
//! of every transaction and rewrites it on commit, so separate `ralph`
//! processes see each other's changes. A transaction holds an exclusive
//! advisory lock on `<store>.lock` from the reload to the rename, so
//! transactions from different processes never interleave.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, TransitionError};
use crate::models::{
    AssetKind, BaseObject, Lease, ObjectId, Transition, TransitionId, TransitionJob,
    TransitionJobAction, TransitionJobActionStatus, TransitionModel, TransitionsHistory, User,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub objects: BTreeMap<ObjectId, BaseObject>,
    #[serde(default)]
    pub users: BTreeMap<String, User>,
    #[serde(default)]
    pub transition_models: Vec<TransitionModel>,
    #[serde(default)]
    pub transitions: BTreeMap<TransitionId, Transition>,
    #[serde(default)]
    pub jobs: BTreeMap<Uuid, TransitionJob>,
    #[serde(default)]
    pub job_actions: Vec<TransitionJobAction>,
    #[serde(default)]
    pub history: Vec<TransitionsHistory>,
    #[serde(default)]
    next_object_id: ObjectId,
    #[serde(default)]
    next_transition_id: TransitionId,
}

impl StoreState {
    // --- objects ---

    /// Store a new object under the next free id and return that id.
    pub fn insert_object(&mut self, mut object: BaseObject) -> ObjectId {
        self.next_object_id += 1;
        object.id = self.next_object_id;
        self.objects.insert(object.id, object);
        self.next_object_id
    }

    pub fn object(&self, id: ObjectId) -> Result<&BaseObject> {
        self.objects.get(&id).ok_or(TransitionError::ObjectNotFound(id))
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Result<&mut BaseObject> {
        self.objects
            .get_mut(&id)
            .ok_or(TransitionError::ObjectNotFound(id))
    }

    /// Owned copies of the objects, in the order of `ids`.
    pub fn objects(&self, ids: &[ObjectId]) -> Result<Vec<BaseObject>> {
        ids.iter().map(|id| self.object(*id).cloned()).collect()
    }

    /// Replace an existing object; unknown ids are an error.
    pub fn save_object(&mut self, object: BaseObject) -> Result<()> {
        let slot = self.object_mut(object.id)?;
        *slot = object;
        Ok(())
    }

    // --- users ---

    pub fn insert_user(&mut self, user: User) {
        self.users.insert(user.username.clone(), user);
    }

    pub fn user(&self, username: &str) -> Result<&User> {
        self.users
            .get(username)
            .ok_or_else(|| TransitionError::UserNotFound(username.to_string()))
    }

    // --- transitions ---

    /// Register `field_name` of `kind` as a transition field.
    pub fn register_transition_field(&mut self, kind: AssetKind, field_name: &str) {
        let model = TransitionModel::new(kind, field_name);
        if !self.transition_models.contains(&model) {
            self.transition_models.push(model);
        }
    }

    pub fn has_transition_fields(&self, kind: AssetKind) -> bool {
        self.transition_models.iter().any(|m| m.kind == kind)
    }

    /// Assign an id and register the transition's field for its kind.
    ///
    /// Fails with `DuplicateTransition` when the model already has one by that name.
    pub fn insert_transition(&mut self, mut transition: Transition) -> Result<TransitionId> {
        let duplicate = self
            .transitions
            .values()
            .any(|t| t.name == transition.name && t.model == transition.model);
        if duplicate {
            return Err(TransitionError::DuplicateTransition {
                name: transition.name,
                kind: transition.model.kind,
            });
        }
        self.register_transition_field(transition.model.kind, &transition.model.field_name);
        self.next_transition_id += 1;
        transition.id = self.next_transition_id;
        self.transitions.insert(transition.id, transition);
        Ok(self.next_transition_id)
    }

    pub fn transition(&self, id: TransitionId) -> Result<&Transition> {
        self.transitions
            .get(&id)
            .ok_or_else(|| TransitionError::TransitionNotFound(id.to_string()))
    }

    /// Look a transition up by name within one transition model.
    pub fn find_transition(&self, name: &str, kind: AssetKind, field: &str) -> Result<&Transition> {
        self.transitions
            .values()
            .find(|t| t.name == name && t.model.kind == kind && t.model.field_name == field)
            .ok_or_else(|| TransitionError::TransitionNotFound(name.to_string()))
    }

    pub fn transitions_for_field(&self, kind: AssetKind, field: &str) -> Vec<&Transition> {
        self.transitions
            .values()
            .filter(|t| t.model.kind == kind && t.model.field_name == field)
            .collect()
    }

    /// Delete a transition together with its jobs and their action records.
    pub fn delete_transition(&mut self, id: TransitionId) -> Result<Transition> {
        let transition = self
            .transitions
            .remove(&id)
            .ok_or_else(|| TransitionError::TransitionNotFound(id.to_string()))?;
        let job_ids: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|j| j.transition_id == id)
            .map(|j| j.id)
            .collect();
        for job_id in &job_ids {
            self.jobs.remove(job_id);
        }
        self.job_actions.retain(|a| !job_ids.contains(&a.job_id));
        Ok(transition)
    }

    // --- jobs ---

    pub fn insert_job(&mut self, job: TransitionJob) -> Uuid {
        let id = job.id;
        self.jobs.insert(id, job);
        id
    }

    pub fn job(&self, id: Uuid) -> Result<&TransitionJob> {
        self.jobs.get(&id).ok_or(TransitionError::JobNotFound(id))
    }

    pub fn job_mut(&mut self, id: Uuid) -> Result<&mut TransitionJob> {
        self.jobs.get_mut(&id).ok_or(TransitionError::JobNotFound(id))
    }

    /// The job, writable only by the owner of its live lease (or anyone if unleased).
    pub fn leased_job_mut(&mut self, id: Uuid, owner: &str) -> Result<&mut TransitionJob> {
        let now = Utc::now();
        let job = self.job_mut(id)?;
        if let Some(holder) = job.live_lease_owner(now) {
            if holder != owner {
                return Err(TransitionError::LeaseConflict {
                    job_id: id,
                    owner: holder.to_string(),
                });
            }
        }
        Ok(job)
    }

    pub fn jobs_for_object(&self, object_id: ObjectId) -> Vec<&TransitionJob> {
        let mut jobs: Vec<&TransitionJob> = self
            .jobs
            .values()
            .filter(|j| j.object_id == object_id)
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Jobs of the object that have not ended yet.
    pub fn active_jobs_for_object(&self, object_id: ObjectId) -> Vec<&TransitionJob> {
        self.jobs_for_object(object_id)
            .into_iter()
            .filter(|j| j.is_running())
            .collect()
    }

    /// Jobs of `service_name` a worker may pick up now, oldest first.
    pub fn due_jobs(&self, service_name: &str, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due: Vec<&TransitionJob> = self
            .jobs
            .values()
            .filter(|j| j.service_name == service_name && j.is_due(now))
            .collect();
        due.sort_by_key(|j| j.created_at);
        due.into_iter().map(|j| j.id).collect()
    }

    // --- job actions ---

    /// Action records of a job, in the order they were created.
    pub fn job_actions(&self, job_id: Uuid) -> Vec<&TransitionJobAction> {
        self.job_actions
            .iter()
            .filter(|a| a.job_id == job_id)
            .collect()
    }

    pub fn job_action(&self, job_id: Uuid, action_name: &str) -> Option<&TransitionJobAction> {
        self.job_actions
            .iter()
            .find(|a| a.job_id == job_id && a.action_name == action_name)
    }

    /// Existing record of the action, or a new one in `Started`.
    pub fn get_or_create_job_action(&mut self, job_id: Uuid, action_name: &str) -> &mut TransitionJobAction {
        let position = self
            .job_actions
            .iter()
            .position(|a| a.job_id == job_id && a.action_name == action_name);
        let index = match position {
            Some(index) => index,
            None => {
                self.job_actions
                    .push(TransitionJobAction::started(job_id, action_name));
                self.job_actions.len() - 1
            }
        };
        &mut self.job_actions[index]
    }

    pub fn set_job_action_status(
        &mut self,
        job_id: Uuid,
        action_name: &str,
        status: TransitionJobActionStatus,
    ) {
        self.get_or_create_job_action(job_id, action_name)
            .set_status(status);
    }

    // --- history ---

    pub fn add_history(&mut self, mut entry: TransitionsHistory) -> u64 {
        entry.id = self.history.len() as u64 + 1;
        let id = entry.id;
        self.history.push(entry);
        id
    }

    pub fn history_for_object(&self, object_id: ObjectId) -> Vec<&TransitionsHistory> {
        self.history
            .iter()
            .filter(|h| h.object_id == object_id)
            .collect()
    }
}

/// Shared handle over [`StoreState`].
#[derive(Debug, Default)]
pub struct Store {
    state: Mutex<StoreState>,
    path: Option<PathBuf>,
}

impl Store {
    /// A store with no backing file; state lives as long as the handle.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
            path: None,
        }
    }

    /// Load the store from a JSON file, starting empty if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            state: Mutex::new(load_shared(path)?),
            path: Some(path.to_path_buf()),
        })
    }

    /// Reload the state from the backing file, if any.
    ///
    /// Takes the shared side of the file lock, so it never observes a
    /// transaction from another process halfway through.
    pub fn refresh(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let state = load_shared(path)?;
            *self.lock() = state;
        }
        Ok(())
    }

    /// Backing file, `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read from the last committed (or refreshed) state without touching the file.
    pub fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        f(&self.lock())
    }

    /// Run `f` as one transaction: its changes are kept only if it returns `Ok`.
    ///
    /// For a file-backed store the exclusive file lock is held from the
    /// reload to the rename, so two processes committing at the same time
    /// are serialized instead of overwriting each other.
    pub fn atomic<T, E>(&self, f: impl FnOnce(&mut StoreState) -> Result<T, E>) -> Result<T, E>
    where
        E: From<TransitionError>,
    {
        let mut guard = self.lock();
        let Some(path) = &self.path else {
            let mut tx = guard.clone();
            let value = f(&mut tx)?;
            *guard = tx;
            return Ok(value);
        };

        let mut file_lock = open_lock(path)?;
        let _held = file_lock.write().map_err(TransitionError::from)?;
        *guard = load(path)?;
        let mut tx = guard.clone();
        let value = f(&mut tx)?;
        persist(path, &tx)?;
        *guard = tx;
        Ok(value)
    }

    /// Take the lease on a job for `owner`, failing if another worker holds a live one.
    pub fn claim_job(&self, job_id: Uuid, owner: &str, ttl: Duration) -> Result<TransitionJob> {
        self.atomic(|tx| {
            let job = tx.leased_job_mut(job_id, owner)?;
            job.lease = Some(Lease {
                owner: owner.to_string(),
                expires_at: Utc::now() + ttl,
            });
            job.touch();
            debug!(job_id = %job_id, owner, "Claimed job lease");
            Ok(job.clone())
        })
    }

    /// Drop `owner`'s lease. A lease held by someone else is left alone.
    pub fn release_job(&self, job_id: Uuid, owner: &str) -> Result<()> {
        self.atomic(|tx| {
            let job = tx.job_mut(job_id)?;
            if job.lease.as_ref().is_some_and(|l| l.owner == owner) {
                job.lease = None;
                job.touch();
            }
            Ok(())
        })
    }

    /// Apply `f` to the job as the lease owner.
    pub fn update_job<T>(
        &self,
        job_id: Uuid,
        owner: &str,
        f: impl FnOnce(&mut TransitionJob) -> T,
    ) -> Result<T> {
        self.atomic(|tx| {
            let job = tx.leased_job_mut(job_id, owner)?;
            Ok(f(job))
        })
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn open_lock(path: &Path) -> Result<RwLock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    Ok(RwLock::new(file))
}

fn load_shared(path: &Path) -> Result<StoreState> {
    if !path.exists() {
        return Ok(StoreState::default());
    }
    let file_lock = open_lock(path)?;
    let _held = file_lock.read()?;
    load(path)
}

fn load(path: &Path) -> Result<StoreState> {
    if !path.exists() {
        return Ok(StoreState::default());
    }
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn persist(path: &Path, state: &StoreState) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration as StdDuration;

    use crate::models::{ActionData, JobParams};

    fn state_with_job() -> (StoreState, Uuid) {
        let mut state = StoreState::default();
        let object_id = state.insert_object(BaseObject::new(AssetKind::DataCenterAsset, 1));
        let transition_id = state
            .insert_transition(Transition::new(
                "Deploy",
                TransitionModel::status(AssetKind::DataCenterAsset),
                [1],
                2,
            ))
            .unwrap();
        let job = TransitionJob::new(
            "ASYNC_TRANSITIONS",
            None,
            object_id,
            transition_id,
            JobParams::new(object_id, ActionData::new()),
        );
        let job_id = state.insert_job(job);
        (state, job_id)
    }

    #[test]
    fn atomic_rolls_back_on_error() {
        let store = Store::in_memory();
        let result: Result<()> = store.atomic(|tx| {
            tx.insert_object(BaseObject::new(AssetKind::Licence, 1));
            Err(TransitionError::NoInstances)
        });
        assert!(result.is_err());
        assert!(store.read(|s| s.objects.is_empty()));

        store
            .atomic(|tx| -> Result<()> {
                tx.insert_object(BaseObject::new(AssetKind::Licence, 1));
                Ok(())
            })
            .unwrap();
        assert_eq!(store.read(|s| s.objects.len()), 1);
    }

    #[test]
    fn transitions_are_unique_per_model() {
        let (mut state, _) = state_with_job();
        let again = Transition::new("Deploy", TransitionModel::status(AssetKind::DataCenterAsset), [1], 2);
        assert!(matches!(
            state.insert_transition(again),
            Err(TransitionError::DuplicateTransition { .. })
        ));
        let other_kind = Transition::new("Deploy", TransitionModel::status(AssetKind::VirtualServer), [1], 2);
        assert_eq!(state.insert_transition(other_kind).unwrap(), 2);
        assert!(state.has_transition_fields(AssetKind::VirtualServer));
    }

    #[test]
    fn get_or_create_job_action_is_idempotent() {
        let (mut state, job_id) = state_with_job();
        state.get_or_create_job_action(job_id, "clean_dns");
        state.set_job_action_status(job_id, "clean_dns", TransitionJobActionStatus::Finished);
        let action = state.get_or_create_job_action(job_id, "clean_dns");
        assert_eq!(action.status, TransitionJobActionStatus::Finished);
        assert_eq!(state.job_actions(job_id).len(), 1);
    }

    #[test]
    fn claim_rejects_second_owner_while_lease_is_live() {
        let (state, job_id) = state_with_job();
        let store = Store::from_state(state);

        let job = store.claim_job(job_id, "w1", Duration::seconds(60)).unwrap();
        assert_eq!(job.lease.as_ref().unwrap().owner, "w1");

        match store.claim_job(job_id, "w2", Duration::seconds(60)) {
            Err(TransitionError::LeaseConflict { owner, .. }) => assert_eq!(owner, "w1"),
            other => panic!("expected lease conflict, got {other:?}"),
        }
        assert!(store.update_job(job_id, "w2", |j| j.kill()).is_err());

        store.release_job(job_id, "w1").unwrap();
        assert!(store.claim_job(job_id, "w2", Duration::seconds(60)).is_ok());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let (state, job_id) = state_with_job();
        let store = Store::from_state(state);
        store.claim_job(job_id, "w1", Duration::seconds(-1)).unwrap();
        let job = store.claim_job(job_id, "w2", Duration::seconds(60)).unwrap();
        assert_eq!(job.lease.unwrap().owner, "w2");
    }

    #[test]
    fn due_jobs_filters_by_service() {
        let (mut state, job_id) = state_with_job();
        let now = Utc::now();
        assert_eq!(state.due_jobs("ASYNC_TRANSITIONS", now), vec![job_id]);
        assert!(state.due_jobs("OTHER", now).is_empty());

        state.job_mut(job_id).unwrap().fail("boom");
        assert!(state.due_jobs("ASYNC_TRANSITIONS", now).is_empty());
    }

    #[test]
    fn delete_transition_removes_its_jobs() {
        let (mut state, job_id) = state_with_job();
        state.get_or_create_job_action(job_id, "deploy");
        state.delete_transition(1).unwrap();
        assert!(state.jobs.is_empty());
        assert!(state.job_actions.is_empty());
    }

    #[test]
    fn open_persists_commits_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = Store::open(&path).unwrap();
        store
            .atomic(|tx| -> Result<()> {
                tx.insert_object(BaseObject::new(AssetKind::BackOfficeAsset, 1).with_hostname("laptop-1"));
                Ok(())
            })
            .unwrap();
        drop(store);

        let reopened = Store::open(&path).unwrap();
        let object = reopened.read(|s| s.object(1).cloned()).unwrap();
        assert_eq!(object.hostname.as_deref(), Some("laptop-1"));
        assert_eq!(reopened.path(), Some(path.as_path()));
    }

    #[test]
    fn stores_sharing_a_file_see_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let cli = Store::open(&path).unwrap();
        let worker = Store::open(&path).unwrap();

        cli.atomic(|tx| -> Result<()> {
            tx.insert_object(BaseObject::new(AssetKind::Licence, 1));
            Ok(())
        })
        .unwrap();
        assert!(worker.read(|s| s.objects.is_empty()));
        worker.refresh().unwrap();
        assert_eq!(worker.read(|s| s.objects.len()), 1);

        worker
            .atomic(|tx| -> Result<()> {
                tx.insert_object(BaseObject::new(AssetKind::Licence, 2));
                Ok(())
            })
            .unwrap();
        cli.refresh().unwrap();
        assert_eq!(cli.read(|s| s.objects.len()), 2);
    }

    #[test]
    fn concurrent_commits_from_two_handles_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let worker = Store::open(&path).unwrap();
        worker
            .atomic(|tx| -> Result<()> {
                tx.insert_object(BaseObject::new(AssetKind::DataCenterAsset, 1));
                Ok(())
            })
            .unwrap();

        let (inside_tx, inside_rx) = mpsc::channel();
        let cli_path = path.clone();
        let pinger = thread::spawn(move || {
            inside_rx.recv().unwrap();
            let cli = Store::open(&cli_path).unwrap();
            cli.atomic(|tx| -> Result<()> {
                tx.object_mut(1)?.fields.insert("last_ping".into(), "now".into());
                Ok(())
            })
            .unwrap();
        });

        worker
            .atomic(|tx| -> Result<()> {
                inside_tx.send(()).unwrap();
                thread::sleep(StdDuration::from_millis(200));
                tx.object_mut(1)?.fields.insert("preboot".into(), 1.into());
                Ok(())
            })
            .unwrap();
        pinger.join().unwrap();

        let reopened = Store::open(&path).unwrap();
        let object = reopened.read(|s| s.object(1).cloned()).unwrap();
        assert_eq!(object.fields.get("preboot"), Some(&serde_json::json!(1)));
        assert_eq!(object.fields.get("last_ping"), Some(&serde_json::json!("now")));
    }
}
