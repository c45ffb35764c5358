//! Transition engine: resolves transitions, validates them against objects
//! and user input, and runs synchronous transitions in one store
//! transaction. Asynchronous transitions are turned into one
//! [`TransitionJob`] per object and handed to the runner.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actions::{ActionContext, ActionDef, ActionOutcome, ActionRegistry};
use crate::error::{ActionError, DataErrors, Result, TransitionError};
use crate::models::{
    ActionData, AssetKind, Attachment, BaseObject, HistoryKwargs, JobParams, JobStatus, ObjectId,
    SharedParams, Target, Transition, TransitionId, TransitionJob, TransitionsHistory, User,
};
use crate::ordering::order_actions_by_requirements;
use crate::store::{Store, StoreState};

/// How a caller names a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRef {
    Id(TransitionId),
    Name(String),
}

impl From<TransitionId> for TransitionRef {
    fn from(id: TransitionId) -> Self {
        TransitionRef::Id(id)
    }
}

impl From<&str> for TransitionRef {
    fn from(name: &str) -> Self {
        TransitionRef::Name(name.to_string())
    }
}

impl From<String> for TransitionRef {
    fn from(name: String) -> Self {
        TransitionRef::Name(name)
    }
}

impl fmt::Display for TransitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionRef::Id(id) => write!(f, "#{id}"),
            TransitionRef::Name(name) => f.write_str(name),
        }
    }
}

/// Result of a synchronous transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub success: bool,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionRun {
    /// Asynchronous transition: ids of the jobs created, one per object.
    Scheduled(Vec<Uuid>),
    Completed(TransitionOutcome),
}

/// Everything post-processing needs to know about a finished transition.
pub struct CompletedTransition<'a> {
    pub transition: &'a Transition,
    pub actions: &'a [&'a ActionDef],
    pub data: &'a ActionData,
    pub history_kwargs: &'a HistoryKwargs,
    pub attachments: &'a [Attachment],
    pub requester: Option<&'a str>,
}

/// Find the transition for the object's kind and `field`, by id or name.
pub fn check_and_get_transition(
    state: &StoreState,
    object: &BaseObject,
    transition: &TransitionRef,
    field: &str,
) -> Result<Transition> {
    if !state.has_transition_fields(object.kind) {
        return Err(TransitionError::TransitionModelNotFound(object.kind));
    }
    let found = match transition {
        TransitionRef::Id(id) => state
            .transition(*id)
            .ok()
            .filter(|t| t.model.kind == object.kind && t.model.field_name == field),
        TransitionRef::Name(name) => state.find_transition(name, object.kind, field).ok(),
    };
    found
        .cloned()
        .ok_or_else(|| TransitionError::TransitionNotFound(transition.to_string()))
}

/// Source status, action preconditions and, when `check_async_job` is set,
/// the one-running-async-job-per-object rule.
pub fn check_instances_for_transition(
    state: &StoreState,
    registry: &ActionRegistry,
    instances: &[BaseObject],
    transition: &Transition,
    requester: Option<&User>,
    check_async_job: bool,
) -> Result<()> {
    let mut errors: BTreeMap<ObjectId, Vec<String>> = BTreeMap::new();
    let field = &transition.model.field_name;

    for instance in instances {
        let allowed = instance
            .transition_value(field)
            .is_some_and(|value| transition.allows_source(value));
        if !allowed {
            errors.entry(instance.id).or_default().push(format!(
                "Transition {} is not allowed for {instance}",
                transition.name
            ));
        }
    }

    for action in transition.pure_actions(registry)? {
        for (object_id, message) in action.check_precondition(instances, requester) {
            errors.entry(object_id).or_default().push(message);
        }
    }

    if check_async_job && transition.is_async(registry)? {
        for instance in instances {
            if !state.active_jobs_for_object(instance.id).is_empty() {
                errors
                    .entry(instance.id)
                    .or_default()
                    .push("Another async transition for this object is already started".to_string());
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TransitionError::TransitionNotAllowed {
            name: transition.name.clone(),
            errors,
        })
    }
}

/// Run every action's own check over the whole set of instances.
pub fn check_action_with_instances(
    registry: &ActionRegistry,
    instances: &[BaseObject],
    transition: &Transition,
) -> Result<()> {
    for action in transition.pure_actions(registry)? {
        if let Err(err) = action.validate_instances(instances) {
            let message = format!("{}: {err}", action.display_name());
            let errors = instances
                .iter()
                .map(|instance| (instance.id, vec![message.clone()]))
                .collect();
            return Err(TransitionError::TransitionNotAllowed {
                name: transition.name.clone(),
                errors,
            });
        }
    }
    Ok(())
}

/// The action's own fields out of the flat transition data, with
/// `<action>__` stripped and defaults filled in.
pub fn prepare_action_data(action: &ActionDef, data: &ActionData) -> ActionData {
    let prefix = format!("{}__", action.name);
    let mut params: ActionData = data
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .map(|field| (field.to_string(), value.clone()))
        })
        .collect();
    for field in &action.form_fields {
        if let Some(default) = &field.default {
            params
                .entry(field.name.clone())
                .or_insert_with(|| default.clone());
        }
    }
    params
}

fn is_blank(value: &Value) -> bool {
    value.is_null() || value.as_str().is_some_and(|s| s.trim().is_empty())
}

/// Form errors of `data`: action name → field name → messages.
pub fn transition_data_validation(
    registry: &ActionRegistry,
    instances: &[BaseObject],
    transition: &Transition,
    data: &ActionData,
) -> Result<DataErrors> {
    let mut errors = DataErrors::new();
    for action in transition.pure_actions(registry)? {
        let params = prepare_action_data(action, data);
        for field in &action.form_fields {
            let mut messages = Vec::new();
            match params.get(&field.name).filter(|v| !is_blank(v)) {
                None if field.required => messages.push("This field is required.".to_string()),
                None => {}
                Some(value) => {
                    messages.extend(field.check_value(value));
                    if messages.is_empty() {
                        if let Some(validate) = &field.validation {
                            if let Err(message) = validate(instances, &params) {
                                messages.push(message);
                            }
                        }
                    }
                }
            }
            if !messages.is_empty() {
                errors
                    .entry(action.name.clone())
                    .or_default()
                    .insert(field.name.clone(), messages);
            }
        }
    }
    Ok(errors)
}

/// No user means the system itself, which may run anything.
pub fn check_user_perm_for_transition(user: Option<&User>, transition: &Transition) -> bool {
    user.is_none_or(|user| user.has_perm(&transition.permission_info().codename))
}

/// History entry values: labelled form input of the executed actions plus
/// whatever the actions recorded for the object.
pub fn get_history_dict(
    data: &ActionData,
    object_id: ObjectId,
    actions: &[&ActionDef],
    history_kwargs: &HistoryKwargs,
) -> BTreeMap<String, Value> {
    let mut history = BTreeMap::new();
    for action in actions {
        let params = prepare_action_data(action, data);
        for field in action.form_fields.iter().filter(|f| !f.exclude_from_history) {
            if let Some(value) = params.get(&field.name) {
                history.insert(field.label.clone(), field.display_value(value));
            }
        }
    }
    if let Some(recorded) = history_kwargs.get(&object_id) {
        history.extend(recorded.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    history
}

fn field_value_name(kind: AssetKind, field: &str, value: i64) -> String {
    if field == "status" {
        if let Some(name) = kind.status_name(value) {
            return name.to_string();
        }
    }
    value.to_string()
}

/// Set the target value, write the history entry and save the object.
pub fn post_transition_instance_processing(
    tx: &mut StoreState,
    mut instance: BaseObject,
    done: &CompletedTransition<'_>,
) -> Result<()> {
    let transition = done.transition;
    let field = &transition.model.field_name;
    let source = instance.transition_value(field);
    if let Target::Status(value) = transition.target {
        instance.set_transition_value(field, value);
    }
    let target = instance.transition_value(field);

    tx.add_history(TransitionsHistory {
        id: 0,
        transition_name: transition.name.clone(),
        kind: instance.kind,
        object_id: instance.id,
        logged_user: done.requester.map(str::to_string),
        source: source.map(|v| field_value_name(instance.kind, field, v)),
        target: target.map(|v| field_value_name(instance.kind, field, v)),
        kwargs: get_history_dict(done.data, instance.id, done.actions, done.history_kwargs),
        actions: done.actions.iter().map(|a| a.display_name()).collect(),
        attachments: done.attachments.iter().map(|a| a.id).collect(),
        created_at: Utc::now(),
    });

    if done.actions.iter().any(|a| a.disable_save_object) {
        debug!(object = %instance, transition = %transition, "Saving object disabled by action");
        return Ok(());
    }
    tx.save_object(instance)
}

struct Resolved {
    instances: Vec<BaseObject>,
    transition: Transition,
    user: Option<User>,
}

fn resolve(
    state: &StoreState,
    object_ids: &[ObjectId],
    transition: &TransitionRef,
    field: &str,
    requester: Option<&str>,
) -> Result<Resolved> {
    if object_ids.is_empty() {
        return Err(TransitionError::NoInstances);
    }
    let instances = state.objects(object_ids)?;
    let kind = instances[0].kind;
    if instances.iter().any(|o| o.kind != kind) {
        return Err(TransitionError::DifferentKinds);
    }
    let transition = check_and_get_transition(state, &instances[0], transition, field)?;
    let user = requester.map(|name| state.user(name).cloned()).transpose()?;
    if !check_user_perm_for_transition(user.as_ref(), &transition) {
        return Err(TransitionError::PermissionDenied {
            user: requester.unwrap_or_default().to_string(),
            transition: transition.name,
        });
    }
    Ok(Resolved {
        instances,
        transition,
        user,
    })
}

fn validate(state: &StoreState, registry: &ActionRegistry, resolved: &Resolved, data: &ActionData) -> Result<()> {
    let Resolved {
        instances,
        transition,
        user,
    } = resolved;
    check_instances_for_transition(state, registry, instances, transition, user.as_ref(), true)?;
    check_action_with_instances(registry, instances, transition)?;
    let errors = transition_data_validation(registry, instances, transition, data)?;
    if !errors.is_empty() {
        return Err(TransitionError::InvalidData {
            transition: transition.name.clone(),
            errors,
        });
    }
    Ok(())
}

pub struct TransitionEngine {
    store: Arc<Store>,
    registry: Arc<ActionRegistry>,
}

impl TransitionEngine {
    pub fn new(store: Arc<Store>, registry: Arc<ActionRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Run the transition on the objects: synchronously in place, or by
    /// scheduling one job per object when the transition is asynchronous.
    pub fn run_transition(
        &self,
        object_ids: &[ObjectId],
        transition: impl Into<TransitionRef>,
        field: &str,
        requester: Option<&str>,
        data: ActionData,
    ) -> Result<TransitionRun> {
        let transition_ref = transition.into();
        let is_async = self.store.read(|state| {
            let resolved = resolve(state, object_ids, &transition_ref, field, requester)?;
            resolved.transition.is_async(&self.registry)
        })?;
        if is_async {
            self.schedule_async_transition(object_ids, &transition_ref, field, requester, data)
                .map(TransitionRun::Scheduled)
        } else {
            self.run_field_transition(object_ids, transition_ref, field, requester, data)
                .map(TransitionRun::Completed)
        }
    }

    fn schedule_async_transition(
        &self,
        object_ids: &[ObjectId],
        transition_ref: &TransitionRef,
        field: &str,
        requester: Option<&str>,
        data: ActionData,
    ) -> Result<Vec<Uuid>> {
        let registry = &self.registry;
        self.store.atomic(|tx| {
            let resolved = resolve(tx, object_ids, transition_ref, field, requester)?;
            validate(tx, registry, &resolved, &data)?;
            let transition = &resolved.transition;
            let mut job_ids = Vec::with_capacity(resolved.instances.len());
            for instance in &resolved.instances {
                let job = TransitionJob::new(
                    transition.service_name(),
                    requester.map(str::to_string),
                    instance.id,
                    transition.id,
                    JobParams::new(instance.id, data.clone()),
                );
                info!(
                    job_id = %job.id,
                    transition = %transition,
                    object = %instance,
                    service = %job.service_name,
                    "Scheduled transition job"
                );
                job_ids.push(tx.insert_job(job));
            }
            Ok(job_ids)
        })
    }

    /// Run every action of the transition on the objects in one transaction.
    ///
    /// A failing action rolls everything back and yields `success = false`.
    pub fn run_field_transition(
        &self,
        object_ids: &[ObjectId],
        transition: impl Into<TransitionRef>,
        field: &str,
        requester: Option<&str>,
        data: ActionData,
    ) -> Result<TransitionOutcome> {
        let transition_ref = transition.into();
        let registry = &self.registry;
        let result = self.store.atomic(|tx| {
            let resolved = resolve(tx, object_ids, &transition_ref, field, requester)?;
            validate(tx, registry, &resolved, &data)?;
            let Resolved {
                mut instances,
                transition,
                user,
            } = resolved;

            let actions = order_actions_by_requirements(&transition, registry)?;
            let mut history_kwargs: HistoryKwargs = instances
                .iter()
                .map(|o| (o.id, BTreeMap::new()))
                .collect();
            let mut shared_params = SharedParams::new();
            let mut attachments = Vec::new();

            for action in &actions {
                info!(transition = %transition, action = %action.name, "Performing synchronous action");
                let outcome = {
                    let mut ctx = ActionContext {
                        instances: &mut instances,
                        requester: user.as_ref(),
                        params: prepare_action_data(action, &data),
                        history_kwargs: &mut history_kwargs,
                        shared_params: &mut shared_params,
                        attachments: &attachments,
                        job_action: None,
                    };
                    action.call(&mut ctx)
                };
                match outcome {
                    Ok(ActionOutcome::Done) => {}
                    Ok(ActionOutcome::Attachment(attachment)) => attachments.push(attachment),
                    Ok(ActionOutcome::Reschedule | ActionOutcome::Freeze) => {
                        return Err(TransitionError::FailedAction {
                            action: action.name.clone(),
                            source: ActionError::AsyncOnly {
                                action: action.name.clone(),
                            },
                        });
                    }
                    Err(source) => {
                        return Err(TransitionError::FailedAction {
                            action: action.name.clone(),
                            source,
                        });
                    }
                }
            }

            for instance in &instances {
                tx.save_object(instance.clone())?;
            }
            let done = CompletedTransition {
                transition: &transition,
                actions: &actions,
                data: &data,
                history_kwargs: &history_kwargs,
                attachments: &attachments,
                requester,
            };
            for instance in instances.iter().cloned() {
                post_transition_instance_processing(tx, instance, &done)?;
            }
            info!(transition = %transition, objects = instances.len(), "Transition finished");
            Ok(TransitionOutcome {
                success: true,
                attachments,
            })
        });

        match result {
            Err(TransitionError::FailedAction { action, source }) => {
                error!(
                    transition = %transition_ref,
                    action = %action,
                    error = %source,
                    "Action failed, transition rolled back"
                );
                Ok(TransitionOutcome {
                    success: false,
                    attachments: Vec::new(),
                })
            }
            other => other,
        }
    }

    /// Transitions of `field` the user may run on the object in its current state.
    pub fn get_available_transitions_for_field(
        &self,
        object_id: ObjectId,
        field: &str,
        requester: Option<&str>,
    ) -> Result<Vec<Transition>> {
        self.store.read(|state| {
            let object = state.object(object_id)?;
            let user = requester.map(|name| state.user(name)).transpose()?;
            let current = object.transition_value(field);
            Ok(state
                .transitions_for_field(object.kind, field)
                .into_iter()
                .filter(|t| current.is_some_and(|value| t.allows_source(value)))
                .filter(|t| check_user_perm_for_transition(user, t))
                .cloned()
                .collect())
        })
    }

    /// Jobs of the object that have not ended yet.
    pub fn get_transitions_for_object(&self, object_id: ObjectId) -> Vec<TransitionJob> {
        self.store.read(|state| {
            state
                .active_jobs_for_object(object_id)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    /// Stop the job before its next action.
    pub fn kill_job(&self, job_id: Uuid) -> Result<TransitionJob> {
        self.store.atomic(|tx| {
            let job = tx.job_mut(job_id)?;
            if job.is_running() {
                job.kill();
                info!(job_id = %job_id, "Job killed");
            } else {
                warn!(job_id = %job_id, status = %job.status, "Job already ended");
            }
            Ok(job.clone())
        })
    }

    /// Requeue a frozen job. Returns false when the job was not frozen.
    pub fn unfreeze_job(&self, job_id: Uuid) -> Result<bool> {
        self.store.atomic(|tx| {
            let unfrozen = tx.job_mut(job_id)?.unfreeze();
            if unfrozen {
                info!(job_id = %job_id, "Job unfrozen");
            }
            Ok(unfrozen)
        })
    }

    /// Record a ping from a freshly deployed object and resume its frozen jobs.
    pub fn ping(&self, object_id: ObjectId) -> Result<Vec<Uuid>> {
        self.store.atomic(|tx| {
            tx.object_mut(object_id)?
                .set_field("last_ping", Utc::now().to_rfc3339());
            let frozen: Vec<Uuid> = tx
                .jobs_for_object(object_id)
                .into_iter()
                .filter(|j| j.status == JobStatus::Frozen)
                .map(|j| j.id)
                .collect();
            for job_id in &frozen {
                tx.job_mut(*job_id)?.unfreeze();
            }
            info!(object_id, resumed = frozen.len(), "Ping received");
            Ok(frozen)
        })
    }

    /// Record that the DHCP servers picked up the object's entries.
    pub fn mark_dhcp_synced(&self, object_id: ObjectId) -> Result<()> {
        self.store.atomic(|tx| {
            tx.object_mut(object_id)?
                .set_field("dhcp_synced_at", Utc::now().to_rfc3339());
            Ok(())
        })
    }
}
