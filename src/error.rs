use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AssetKind, ObjectId};

pub type Result<T, E = TransitionError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Model {0} not found in registry")]
    TransitionModelNotFound(AssetKind),

    #[error("Transition not found: {0}")]
    TransitionNotFound(String),

    #[error("Transition {name} already exists for {kind}")]
    DuplicateTransition { name: String, kind: AssetKind },

    #[error("Transition {name} is not allowed for objects")]
    TransitionNotAllowed {
        name: String,
        errors: BTreeMap<ObjectId, Vec<String>>,
    },

    #[error("User {user} cannot run transition {transition}")]
    PermissionDenied { user: String, transition: String },

    #[error("Invalid data for transition {transition}")]
    InvalidData {
        transition: String,
        errors: DataErrors,
    },

    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Transition job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Action {action} is not registered for {kind}")]
    UnknownAction { kind: AssetKind, action: String },

    #[error("Cyclic run_after requirements between actions: {}", .0.join(", "))]
    CyclicActions(Vec<String>),

    #[error("All instances must be of the same kind")]
    DifferentKinds,

    #[error("No objects given")]
    NoInstances,

    #[error("Action {action} has failed: {source}")]
    FailedAction {
        action: String,
        #[source]
        source: ActionError,
    },

    #[error("Action {0} has failed.")]
    PreviousActionFailed(String),

    #[error("More than one started action")]
    MoreThanOneStartedAction,

    #[error("Job {job_id} is leased by {owner}")]
    LeaseConflict { job_id: Uuid, owner: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Field errors of transition form data: action name → field name → messages.
pub type DataErrors = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// Error raised from inside an action body.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ActionError {
    #[error("missing parameter: {0}")]
    MissingParam(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("{action} cannot run synchronously")]
    AsyncOnly { action: String },

    #[error("{0}")]
    Failed(String),
}

impl ActionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        ActionError::Failed(msg.into())
    }
}
