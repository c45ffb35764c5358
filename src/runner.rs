//! Asynchronous transition runner.
//!
//! Runs the actions of one [`TransitionJob`] in dependency order, one store
//! transaction per action, so progress made by earlier actions survives a
//! later failure. A job resumes from its first action that is not finished
//! yet: either after a reschedule, after being unfrozen, or after the worker
//! that held it died and its lease expired.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actions::{ActionContext, ActionDef, ActionOutcome, ActionRegistry};
use crate::engine::{
    CompletedTransition, check_action_with_instances, check_instances_for_transition,
    post_transition_instance_processing, prepare_action_data,
};
use crate::error::{Result, TransitionError};
use crate::models::{JobStatus, Transition, TransitionJob, TransitionJobActionStatus, User};
use crate::ordering::order_actions_by_requirements;
use crate::store::{Store, StoreState};

/// How a single run of a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    Failed(String),
    /// An action asked to be retried later; the job is queued again.
    Rescheduled,
    Frozen,
    Killed,
    AlreadyEnded,
    /// Leased by another worker, or frozen.
    Skipped,
}

/// Fails when an earlier action failed or more than one is still in flight.
pub fn check_previous_actions(state: &StoreState, job_id: Uuid) -> Result<()> {
    let executed = state.job_actions(job_id);
    if let Some(failed) = executed
        .iter()
        .find(|a| a.status == TransitionJobActionStatus::Failed)
    {
        return Err(TransitionError::PreviousActionFailed(failed.action_name.clone()));
    }
    let started = executed
        .iter()
        .filter(|a| a.status == TransitionJobActionStatus::Started)
        .count();
    if started > 1 {
        return Err(TransitionError::MoreThanOneStartedAction);
    }
    Ok(())
}

/// Runs asynchronous transition jobs on behalf of one worker.
///
/// Every write the runner makes goes through the job's lease, so two
/// runners sharing a store never execute the same job at once. A runner
/// whose lease was taken over stops at its next transaction with
/// [`TransitionError::LeaseConflict`].
pub struct TransitionRunner {
    store: Arc<Store>,
    registry: Arc<ActionRegistry>,
    worker_id: String,
    lease_ttl: Duration,
    reschedule_delay: Duration,
}

impl TransitionRunner {
    pub fn new(store: Arc<Store>, registry: Arc<ActionRegistry>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            registry,
            worker_id: worker_id.into(),
            lease_ttl: Duration::seconds(300),
            reschedule_delay: Duration::seconds(5),
        }
    }

    /// How long a claim stays valid; it is extended before every action.
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Delay before a rescheduled job becomes due again.
    pub fn with_reschedule_delay(mut self, reschedule_delay: Duration) -> Self {
        self.reschedule_delay = reschedule_delay;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run the job. Never fails: errors are logged and recorded on the job.
    ///
    /// The lease is released on every path except a lease conflict, where
    /// it belongs to someone else.
    pub fn run_async_transition(&self, job_id: Uuid) -> RunOutcome {
        let outcome = match self.perform(job_id) {
            Ok(outcome) => outcome,
            Err(TransitionError::LeaseConflict { owner, .. }) => {
                debug!(job_id = %job_id, owner = %owner, "Job leased by another worker, skipping");
                return RunOutcome::Skipped;
            }
            Err(err) => {
                error!(job_id = %job_id, worker = %self.worker_id, error = %err, "Transition job failed");
                let reason = err.to_string();
                self.mark_failed(job_id, &reason);
                RunOutcome::Failed(reason)
            }
        };
        self.release(job_id);
        outcome
    }

    /// Fail a job that is still running and drop this worker's lease on it.
    ///
    /// Used when a run is cut short outside the runner's own error
    /// handling, such as a panic on the blocking thread.
    pub fn abandon(&self, job_id: Uuid, reason: &str) {
        self.mark_failed(job_id, reason);
        self.release(job_id);
    }

    fn mark_failed(&self, job_id: Uuid, reason: &str) {
        let marked = self.store.atomic(|tx| -> Result<()> {
            let job = tx.leased_job_mut(job_id, &self.worker_id)?;
            if job.is_running() {
                job.fail(reason);
            }
            Ok(())
        });
        if let Err(err) = marked {
            error!(job_id = %job_id, error = %err, "Could not mark job as failed");
        }
    }

    fn release(&self, job_id: Uuid) {
        if let Err(err) = self.store.release_job(job_id, &self.worker_id) {
            warn!(job_id = %job_id, error = %err, "Could not release job lease");
        }
    }

    fn perform(&self, job_id: Uuid) -> Result<RunOutcome> {
        let job = self.store.claim_job(job_id, &self.worker_id, self.lease_ttl)?;
        if job.status.is_ended() {
            warn!(job_id = %job_id, status = %job.status, "Job already ended");
            return Ok(RunOutcome::AlreadyEnded);
        }
        if job.status == JobStatus::Frozen {
            debug!(job_id = %job_id, "Job is frozen until resumed");
            return Ok(RunOutcome::Skipped);
        }
        self.store
            .update_job(job_id, &self.worker_id, TransitionJob::start)?;

        let (transition, requester) = self.store.read(|state| -> Result<(Transition, Option<User>)> {
            let transition = state.transition(job.transition_id)?.clone();
            let instances = state.objects(&[job.object_id])?;
            let requester = job
                .user
                .as_deref()
                .map(|name| state.user(name).cloned())
                .transpose()?;
            check_instances_for_transition(
                state,
                &self.registry,
                &instances,
                &transition,
                requester.as_ref(),
                false,
            )?;
            check_action_with_instances(&self.registry, &instances, &transition)?;
            check_previous_actions(state, job_id)?;
            Ok((transition, requester))
        })?;

        let actions = order_actions_by_requirements(&transition, &self.registry)?;
        let completed: BTreeSet<String> = self.store.read(|state| {
            state
                .job_actions(job_id)
                .into_iter()
                .filter(|a| a.status != TransitionJobActionStatus::Started)
                .map(|a| a.action_name.clone())
                .collect()
        });

        for action in &actions {
            if completed.contains(&action.name) {
                debug!(job_id = %job_id, action = %action.name, "Action already completed, skipping");
                continue;
            }
            match self.run_action(job_id, action, requester.as_ref())? {
                None => return Ok(RunOutcome::Killed),
                Some(ActionOutcome::Reschedule) => return Ok(RunOutcome::Rescheduled),
                Some(ActionOutcome::Freeze) => return Ok(RunOutcome::Frozen),
                Some(ActionOutcome::Done | ActionOutcome::Attachment(_)) => {}
            }
        }

        self.finish(job_id, &transition, &actions)
    }

    /// Run one action in its own transaction.
    ///
    /// Returns `None` when the job was killed before the action started.
    fn run_action(
        &self,
        job_id: Uuid,
        action: &ActionDef,
        requester: Option<&User>,
    ) -> Result<Option<ActionOutcome>> {
        // Committed on its own so a crash inside the action leaves it `Started`.
        let killed = self.store.atomic(|tx| -> Result<bool> {
            let job = tx.leased_job_mut(job_id, &self.worker_id)?;
            if job.is_killed() {
                return Ok(true);
            }
            if let Some(lease) = job.lease.as_mut() {
                lease.expires_at = Utc::now() + self.lease_ttl;
            }
            tx.get_or_create_job_action(job_id, &action.name);
            Ok(false)
        })?;
        if killed {
            info!(job_id = %job_id, action = %action.name, "Job killed, stopping");
            return Ok(None);
        }
        info!(job_id = %job_id, action = %action.name, "Performing async action");

        let result = self.store.atomic(|tx| {
            let mut job = tx.leased_job_mut(job_id, &self.worker_id)?.clone();
            let mut instances = tx.objects(&[job.object_id])?;
            let job_action = tx.job_action(job_id, &action.name).cloned();
            let outcome = {
                let mut ctx = ActionContext {
                    instances: &mut instances,
                    requester,
                    params: prepare_action_data(action, &job.params.data),
                    history_kwargs: &mut job.params.history_kwargs,
                    shared_params: &mut job.params.shared_params,
                    attachments: &job.attachments,
                    job_action: job_action.as_ref(),
                };
                action.call(&mut ctx)
            }
            .map_err(|source| TransitionError::FailedAction {
                action: action.name.clone(),
                source,
            })?;

            for instance in instances {
                tx.save_object(instance)?;
            }
            match &outcome {
                ActionOutcome::Reschedule => job.reschedule(self.reschedule_delay),
                ActionOutcome::Freeze => {
                    tx.set_job_action_status(job_id, &action.name, TransitionJobActionStatus::Finished);
                    job.freeze();
                }
                ActionOutcome::Attachment(attachment) => {
                    tx.set_job_action_status(job_id, &action.name, TransitionJobActionStatus::Finished);
                    job.attachments.push(attachment.clone());
                    job.touch();
                }
                ActionOutcome::Done => {
                    tx.set_job_action_status(job_id, &action.name, TransitionJobActionStatus::Finished);
                    job.touch();
                }
            }
            *tx.job_mut(job_id)? = job;
            Ok(outcome)
        });

        match result {
            Ok(outcome) => {
                match &outcome {
                    ActionOutcome::Reschedule => {
                        info!(job_id = %job_id, action = %action.name, "Action rescheduled");
                    }
                    ActionOutcome::Freeze => {
                        info!(job_id = %job_id, action = %action.name, "Job frozen");
                    }
                    _ => debug!(job_id = %job_id, action = %action.name, "Action finished"),
                }
                Ok(Some(outcome))
            }
            Err(err @ TransitionError::LeaseConflict { .. }) => Err(err),
            Err(err) => {
                let marked = self.store.atomic(|tx| -> Result<()> {
                    tx.set_job_action_status(job_id, &action.name, TransitionJobActionStatus::Failed);
                    let job = tx.leased_job_mut(job_id, &self.worker_id)?;
                    if job.is_running() {
                        job.fail(err.to_string());
                    }
                    Ok(())
                });
                if let Err(mark_err) = marked {
                    error!(job_id = %job_id, action = %action.name, error = %mark_err, "Could not mark action as failed");
                }
                Err(err)
            }
        }
    }

    fn finish(&self, job_id: Uuid, transition: &Transition, actions: &[&ActionDef]) -> Result<RunOutcome> {
        self.store.atomic(|tx| {
            let job = tx.leased_job_mut(job_id, &self.worker_id)?.clone();
            if job.is_killed() {
                info!(job_id = %job_id, "Job killed before completion");
                return Ok(RunOutcome::Killed);
            }
            let instance = tx.object(job.object_id)?.clone();
            let done = CompletedTransition {
                transition,
                actions,
                data: &job.params.data,
                history_kwargs: &job.params.history_kwargs,
                attachments: &job.attachments,
                requester: job.user.as_deref(),
            };
            post_transition_instance_processing(tx, instance, &done)?;
            tx.job_mut(job_id)?.success();
            info!(job_id = %job_id, transition = %transition, "Transition job finished");
            Ok(RunOutcome::Finished)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransitionEngine;
    use crate::engine::TransitionRun;
    use crate::engine::tests::{LAPTOP, SERVER, deploy_data, registry, seeded_state, seeded_store};
    use crate::error::ActionError;
    use crate::models::{ActionData, AssetKind, TransitionJobAction, TransitionModel};
    use serde_json::json;

    struct Fixture {
        engine: TransitionEngine,
        runner: TransitionRunner,
        job_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(seeded_store());
        let registry = Arc::new(registry());
        let engine = TransitionEngine::new(Arc::clone(&store), Arc::clone(&registry));
        let TransitionRun::Scheduled(job_ids) = engine
            .run_transition(&[SERVER], "Deploy", "status", Some("admin"), deploy_data())
            .unwrap()
        else {
            panic!("expected scheduled jobs");
        };
        let runner = TransitionRunner::new(store, registry, "w1").with_reschedule_delay(Duration::zero());
        Fixture {
            engine,
            runner,
            job_id: job_ids[0],
        }
    }

    fn job(f: &Fixture) -> TransitionJob {
        f.engine.store().read(|s| s.job(f.job_id).cloned()).unwrap()
    }

    fn action_statuses(f: &Fixture) -> Vec<(String, TransitionJobActionStatus)> {
        f.engine.store().read(|s| {
            s.job_actions(f.job_id)
                .into_iter()
                .map(|a| (a.action_name.clone(), a.status))
                .collect()
        })
    }

    #[test]
    fn deployment_resumes_after_reschedule_and_freeze() {
        let f = fixture();

        assert_eq!(f.runner.run_async_transition(f.job_id), RunOutcome::Rescheduled);
        let queued = job(&f);
        assert_eq!(queued.status, JobStatus::Queued);
        assert!(queued.lease.is_none());
        assert_eq!(queued.params.history_kwargs[&SERVER]["ip"], "10.2.0.5");
        let statuses = action_statuses(&f);
        assert_eq!(statuses.len(), 8);
        assert_eq!(
            statuses.last().unwrap(),
            &("wait_for_dhcp_servers".to_string(), TransitionJobActionStatus::Started)
        );
        f.engine.store().read(|s| {
            let server = s.object(SERVER).unwrap();
            assert_eq!(server.hostname.as_deref(), Some("s1.dc"));
            assert_eq!(server.field("dns_records").unwrap()[0]["content"], "10.2.0.5");
            assert_eq!(server.status, 1);
        });

        f.engine.mark_dhcp_synced(SERVER).unwrap();
        assert_eq!(f.runner.run_async_transition(f.job_id), RunOutcome::Frozen);
        assert_eq!(job(&f).status, JobStatus::Frozen);
        assert_eq!(f.runner.run_async_transition(f.job_id), RunOutcome::Skipped);

        f.engine.ping(SERVER).unwrap();
        assert_eq!(f.runner.run_async_transition(f.job_id), RunOutcome::Finished);

        let finished = job(&f);
        assert_eq!(finished.status, JobStatus::Finished);
        assert!(
            action_statuses(&f)
                .iter()
                .all(|(_, status)| *status == TransitionJobActionStatus::Finished)
        );
        assert_eq!(action_statuses(&f).len(), 10);
        f.engine.store().read(|s| {
            let server = s.object(SERVER).unwrap();
            assert_eq!(server.status, 2);
            assert_eq!(server.field_str("preboot"), Some("ubuntu-22.04"));
            let history = s.history_for_object(SERVER);
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].source.as_deref(), Some("new"));
            assert_eq!(history[0].target.as_deref(), Some("in use"));
            assert_eq!(history[0].kwargs["Preboot"], "ubuntu-22.04");
            assert_eq!(history[0].kwargs["hostname"], "s1.dc");
            assert_eq!(history[0].logged_user.as_deref(), Some("admin"));
        });
        assert_eq!(f.runner.run_async_transition(f.job_id), RunOutcome::AlreadyEnded);
    }

    #[test]
    fn failing_action_fails_job_but_keeps_earlier_progress() {
        let f = fixture();
        let records: Vec<_> = (0..40)
            .map(|i| json!({"name": format!("r{i}"), "type": "A", "content": "10.0.0.9"}))
            .collect();
        f.engine
            .store()
            .atomic(|tx| -> Result<()> {
                tx.object_mut(SERVER)?.set_field("dns_records", records);
                Ok(())
            })
            .unwrap();

        let RunOutcome::Failed(reason) = f.runner.run_async_transition(f.job_id) else {
            panic!("expected failure");
        };
        assert!(reason.contains("clean_dns"));

        let failed = job(&f);
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.reason.as_deref(), Some(reason.as_str()));
        assert_eq!(
            action_statuses(&f),
            vec![
                ("clean_hostname".to_string(), TransitionJobActionStatus::Finished),
                ("clean_dns".to_string(), TransitionJobActionStatus::Failed),
            ]
        );
        f.engine.store().read(|s| {
            let server = s.object(SERVER).unwrap();
            // clean_hostname committed, clean_dns rolled back.
            assert!(server.hostname.is_none());
            assert_eq!(server.field("dns_records").unwrap().as_array().unwrap().len(), 40);
        });
    }

    fn insert_action(f: &Fixture, name: &str, status: TransitionJobActionStatus) {
        f.engine
            .store()
            .atomic(|tx| -> Result<()> {
                let mut action = TransitionJobAction::started(f.job_id, name);
                action.set_status(status);
                tx.job_actions.push(action);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn previously_failed_action_fails_job() {
        let f = fixture();
        insert_action(&f, "clean_hostname", TransitionJobActionStatus::Failed);
        assert_eq!(
            f.runner.run_async_transition(f.job_id),
            RunOutcome::Failed("Action clean_hostname has failed.".to_string())
        );
        assert_eq!(job(&f).status, JobStatus::Failed);
    }

    #[test]
    fn more_than_one_started_action_fails_job() {
        let f = fixture();
        insert_action(&f, "clean_hostname", TransitionJobActionStatus::Started);
        insert_action(&f, "clean_dns", TransitionJobActionStatus::Started);
        assert_eq!(
            f.runner.run_async_transition(f.job_id),
            RunOutcome::Failed(TransitionError::MoreThanOneStartedAction.to_string())
        );
        assert_eq!(job(&f).status, JobStatus::Failed);
    }

    #[test]
    fn completed_actions_are_skipped_on_resume() {
        let f = fixture();
        // clean_dns would refuse this many records if it ran again.
        let records: Vec<_> = (0..40).map(|i| json!({"name": format!("r{i}")})).collect();
        f.engine
            .store()
            .atomic(|tx| -> Result<()> {
                tx.object_mut(SERVER)?.set_field("dns_records", records);
                Ok(())
            })
            .unwrap();
        insert_action(&f, "clean_dns", TransitionJobActionStatus::Finished);

        assert_eq!(f.runner.run_async_transition(f.job_id), RunOutcome::Rescheduled);
        assert_eq!(action_statuses(&f).len(), 8);
        f.engine.store().read(|s| {
            let records = s.object(SERVER).unwrap().field("dns_records").cloned().unwrap();
            assert_eq!(records.as_array().unwrap().len(), 41);
        });
    }

    #[test]
    fn killed_job_is_not_run() {
        let f = fixture();
        f.engine.kill_job(f.job_id).unwrap();
        assert_eq!(f.runner.run_async_transition(f.job_id), RunOutcome::AlreadyEnded);
        assert!(action_statuses(&f).is_empty());
        assert_eq!(job(&f).status, JobStatus::Killed);
    }

    #[test]
    fn job_leased_by_another_worker_is_skipped() {
        let f = fixture();
        f.engine
            .store()
            .claim_job(f.job_id, "w2", Duration::seconds(60))
            .unwrap();
        assert_eq!(f.runner.run_async_transition(f.job_id), RunOutcome::Skipped);
        let untouched = job(&f);
        assert_eq!(untouched.status, JobStatus::Queued);
        assert_eq!(untouched.lease.unwrap().owner, "w2");
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let f = fixture();
        f.engine
            .store()
            .update_job(f.job_id, "w2", |j| j.start())
            .unwrap();
        f.engine
            .store()
            .claim_job(f.job_id, "w2", Duration::seconds(-1))
            .unwrap();
        assert_eq!(f.runner.run_async_transition(f.job_id), RunOutcome::Rescheduled);
    }

    #[test]
    fn missing_job_is_reported_as_failure() {
        let f = fixture();
        let missing = Uuid::new_v4();
        assert!(matches!(
            f.runner.run_async_transition(missing),
            RunOutcome::Failed(_)
        ));
    }

    #[test]
    fn check_previous_actions_accepts_single_started() {
        let f = fixture();
        insert_action(&f, "clean_hostname", TransitionJobActionStatus::Finished);
        insert_action(&f, "clean_dns", TransitionJobActionStatus::Started);
        f.engine
            .store()
            .read(|s| check_previous_actions(s, f.job_id))
            .unwrap();
    }

    /// Claim and start the job the way `perform` does before its first action.
    fn start_as(runner: &TransitionRunner, job_id: Uuid) {
        runner
            .store()
            .claim_job(job_id, runner.worker_id(), Duration::seconds(60))
            .unwrap();
        runner
            .store()
            .update_job(job_id, runner.worker_id(), TransitionJob::start)
            .unwrap();
    }

    #[test]
    fn kill_from_another_handle_stops_before_next_action() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let worker_store = Arc::new(Store::open(&path).unwrap());
        worker_store
            .atomic(|tx| -> Result<()> {
                *tx = seeded_state();
                Ok(())
            })
            .unwrap();
        let registry = Arc::new(registry());
        let cli = TransitionEngine::new(Arc::new(Store::open(&path).unwrap()), Arc::clone(&registry));
        let TransitionRun::Scheduled(job_ids) = cli
            .run_transition(&[SERVER], "Deploy", "status", Some("admin"), deploy_data())
            .unwrap()
        else {
            panic!("expected scheduled jobs");
        };
        let job_id = job_ids[0];

        let runner = TransitionRunner::new(Arc::clone(&worker_store), Arc::clone(&registry), "w1");
        start_as(&runner, job_id);
        let clean_hostname = registry.get(AssetKind::DataCenterAsset, "clean_hostname").unwrap();
        assert_eq!(
            runner.run_action(job_id, clean_hostname, None).unwrap(),
            Some(ActionOutcome::Done)
        );

        cli.kill_job(job_id).unwrap();
        // The worker's cached state still shows the job running.
        assert!(!worker_store.read(|s| s.job(job_id).unwrap().is_killed()));

        let clean_dns = registry.get(AssetKind::DataCenterAsset, "clean_dns").unwrap();
        assert_eq!(runner.run_action(job_id, clean_dns, None).unwrap(), None);

        worker_store.read(|s| {
            assert_eq!(s.job(job_id).unwrap().status, JobStatus::Killed);
            let names: Vec<_> = s
                .job_actions(job_id)
                .into_iter()
                .map(|a| a.action_name.clone())
                .collect();
            assert_eq!(names, vec!["clean_hostname".to_string()]);
        });
    }

    #[test]
    fn job_killed_after_last_action_is_not_completed() {
        let f = fixture();
        start_as(&f.runner, f.job_id);
        f.engine.kill_job(f.job_id).unwrap();

        let transition_id = job(&f).transition_id;
        let transition = f
            .engine
            .store()
            .read(|s| s.transition(transition_id).cloned())
            .unwrap();
        let actions = order_actions_by_requirements(&transition, &f.runner.registry).unwrap();
        assert_eq!(
            f.runner.finish(f.job_id, &transition, &actions).unwrap(),
            RunOutcome::Killed
        );

        assert_eq!(job(&f).status, JobStatus::Killed);
        f.engine.store().read(|s| {
            assert_eq!(s.object(SERVER).unwrap().status, 1);
            assert!(s.history_for_object(SERVER).is_empty());
        });
    }

    #[test]
    fn store_error_inside_action_marks_action_failed() {
        let f = fixture();
        start_as(&f.runner, f.job_id);
        f.engine
            .store()
            .atomic(|tx| -> Result<()> {
                tx.objects.remove(&SERVER);
                Ok(())
            })
            .unwrap();

        let clean_hostname = f
            .runner
            .registry
            .get(AssetKind::DataCenterAsset, "clean_hostname")
            .unwrap();
        assert!(matches!(
            f.runner.run_action(f.job_id, clean_hostname, None),
            Err(TransitionError::ObjectNotFound(SERVER))
        ));

        assert_eq!(
            action_statuses(&f),
            vec![("clean_hostname".to_string(), TransitionJobActionStatus::Failed)]
        );
        let failed = job(&f);
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.reason,
            Some(TransitionError::ObjectNotFound(SERVER).to_string())
        );
    }

    fn pick_rack(_: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let racks: Vec<&str> = Vec::new();
        panic!("no rack among {} candidates", racks.len())
    }

    #[test]
    fn panicking_action_fails_job_and_releases_lease() {
        let mut state = seeded_state();
        state
            .insert_transition(
                Transition::new("Rack", TransitionModel::status(AssetKind::BackOfficeAsset), [1], 4)
                    .with_actions(["pick_rack"])
                    .asynchronous(),
            )
            .unwrap();
        let mut registry = registry();
        registry.register(&[AssetKind::BackOfficeAsset], ActionDef::new("pick_rack", pick_rack));
        let store = Arc::new(Store::from_state(state));
        let registry = Arc::new(registry);
        let engine = TransitionEngine::new(Arc::clone(&store), Arc::clone(&registry));
        let TransitionRun::Scheduled(job_ids) = engine
            .run_transition(&[LAPTOP], "Rack", "status", None, ActionData::new())
            .unwrap()
        else {
            panic!("expected scheduled jobs");
        };
        let job_id = job_ids[0];

        let runner = TransitionRunner::new(store, registry, "w1");
        let RunOutcome::Failed(reason) = runner.run_async_transition(job_id) else {
            panic!("expected failure");
        };
        assert!(reason.contains("pick_rack panicked"), "{reason}");

        runner.store().read(|s| {
            let job = s.job(job_id).unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert!(job.lease.is_none());
            let actions = s.job_actions(job_id);
            assert_eq!(actions.len(), 1);
            assert_eq!(actions[0].status, TransitionJobActionStatus::Failed);
            assert_eq!(s.object(LAPTOP).unwrap().status, 1);
        });
    }

    #[test]
    fn abandon_fails_running_job_and_drops_lease() {
        let f = fixture();
        start_as(&f.runner, f.job_id);
        f.runner.abandon(f.job_id, "worker thread panicked");

        let abandoned = job(&f);
        assert_eq!(abandoned.status, JobStatus::Failed);
        assert_eq!(abandoned.reason.as_deref(), Some("worker thread panicked"));
        assert!(abandoned.lease.is_none());
    }
}
