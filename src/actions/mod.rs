//! Transition actions: the named steps a transition is made of.
//!
//! An [`ActionDef`] couples the action body with the metadata the engine
//! needs before running it: ordering requirements (`run_after`), form
//! fields collected from the user, preconditions checked against the
//! instances, and flags such as `is_async`. Definitions live in an
//! [`ActionRegistry`] keyed by asset kind and name.

pub mod catalog;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::any::Any;
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;

use crate::error::{ActionError, Result, TransitionError};
use crate::models::{
    ActionData, AssetKind, Attachment, BaseObject, HistoryKwargs, ObjectId, SharedParams,
    TransitionJobAction, User,
};

pub type ActionFn =
    Arc<dyn Fn(&mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> + Send + Sync>;

/// Returns per-object error messages; an empty map means every object passes.
pub type PreconditionFn =
    Arc<dyn Fn(&[BaseObject], Option<&User>) -> BTreeMap<ObjectId, String> + Send + Sync>;

pub type InstancesCheckFn = Arc<dyn Fn(&[BaseObject]) -> Result<(), ActionError> + Send + Sync>;

pub type FieldValidationFn =
    Arc<dyn Fn(&[BaseObject], &ActionData) -> Result<(), String> + Send + Sync>;

/// What an action asks the engine to do once its body returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Done,
    /// Done, and the file is attached to the transition history.
    Attachment(Attachment),
    /// Not ready yet: requeue the job and run this action again later.
    Reschedule,
    /// Done, but the job is paused until resumed from outside.
    Freeze,
}

/// Kind of value a form field accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Char { max_length: Option<usize> },
    Integer,
    Boolean,
    Choice(Vec<(i64, String)>),
    Date,
    IpAddress,
}

/// A value collected from the user before an action runs.
#[derive(Clone)]
pub struct FormField {
    pub name: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<Value>,
    pub exclude_from_history: bool,
    pub validation: Option<FieldValidationFn>,
}

impl fmt::Debug for FormField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormField")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("exclude_from_history", &self.exclude_from_history)
            .finish_non_exhaustive()
    }
}

impl FormField {
    pub fn new(name: impl Into<String>, label: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind,
            required: true,
            default: None,
            exclude_from_history: false,
            validation: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn exclude_from_history(mut self) -> Self {
        self.exclude_from_history = true;
        self
    }

    pub fn validation<F>(mut self, f: F) -> Self
    where
        F: Fn(&[BaseObject], &ActionData) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validation = Some(Arc::new(f));
        self
    }

    /// Type errors of a submitted value.
    pub fn check_value(&self, value: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        match &self.kind {
            FieldKind::Char { max_length } => match value.as_str() {
                Some(s) => {
                    if let Some(max) = max_length {
                        if s.chars().count() > *max {
                            errors.push(format!(
                                "Ensure this value has at most {max} characters."
                            ));
                        }
                    }
                }
                None => errors.push("Enter a text value.".to_string()),
            },
            FieldKind::Integer => {
                if value_as_i64(value).is_none() {
                    errors.push("Enter a whole number.".to_string());
                }
            }
            FieldKind::Boolean => {
                if !value.is_boolean() {
                    errors.push("Enter true or false.".to_string());
                }
            }
            FieldKind::Choice(choices) => {
                let valid = value_as_i64(value)
                    .map(|id| choices.iter().any(|(choice, _)| *choice == id))
                    .unwrap_or(false);
                if !valid {
                    errors.push(format!(
                        "Select a valid choice. {value} is not one of the available choices."
                    ));
                }
            }
            FieldKind::Date => {
                let valid = value
                    .as_str()
                    .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
                    .unwrap_or(false);
                if !valid {
                    errors.push("Enter a valid date.".to_string());
                }
            }
            FieldKind::IpAddress => {
                let valid = value
                    .as_str()
                    .map(|s| s.parse::<IpAddr>().is_ok())
                    .unwrap_or(false);
                if !valid {
                    errors.push("Enter a valid IPv4 or IPv6 address.".to_string());
                }
            }
        }
        errors
    }

    /// Value as shown in the transition history (choice ids become labels).
    pub fn display_value(&self, value: &Value) -> Value {
        if let FieldKind::Choice(choices) = &self.kind {
            if let Some(id) = value_as_i64(value) {
                if let Some((_, label)) = choices.iter().find(|(choice, _)| *choice == id) {
                    return Value::from(label.clone());
                }
            }
        }
        value.clone()
    }
}

/// Integers may be posted as JSON numbers or numeric strings.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A registered transition action.
#[derive(Clone)]
pub struct ActionDef {
    pub name: String,
    pub verbose_name: Option<String>,
    pub run_after: Vec<String>,
    pub is_async: bool,
    pub form_fields: Vec<FormField>,
    pub disable_save_object: bool,
    precondition: Option<PreconditionFn>,
    validation: Option<InstancesCheckFn>,
    func: ActionFn,
}

impl fmt::Debug for ActionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDef")
            .field("name", &self.name)
            .field("run_after", &self.run_after)
            .field("is_async", &self.is_async)
            .field("form_fields", &self.form_fields)
            .finish_non_exhaustive()
    }
}

impl ActionDef {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            verbose_name: None,
            run_after: Vec::new(),
            is_async: false,
            form_fields: Vec::new(),
            disable_save_object: false,
            precondition: None,
            validation: None,
            func: Arc::new(func),
        }
    }

    pub fn verbose_name(mut self, verbose_name: impl Into<String>) -> Self {
        self.verbose_name = Some(verbose_name.into());
        self
    }

    pub fn run_after<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_after = requirements.into_iter().map(Into::into).collect();
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn form_field(mut self, field: FormField) -> Self {
        self.form_fields.push(field);
        self
    }

    pub fn disable_save_object(mut self) -> Self {
        self.disable_save_object = true;
        self
    }

    pub fn precondition<F>(mut self, f: F) -> Self
    where
        F: Fn(&[BaseObject], Option<&User>) -> BTreeMap<ObjectId, String> + Send + Sync + 'static,
    {
        self.precondition = Some(Arc::new(f));
        self
    }

    pub fn validation<F>(mut self, f: F) -> Self
    where
        F: Fn(&[BaseObject]) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        self.validation = Some(Arc::new(f));
        self
    }

    /// Name shown to users: `verbose_name`, or the name made readable.
    pub fn display_name(&self) -> String {
        if let Some(verbose) = &self.verbose_name {
            return verbose.clone();
        }
        let spaced = self.name.replace('_', " ");
        let mut chars = spaced.chars();
        match chars.next() {
            Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
            None => String::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.form_fields.iter().find(|f| f.name == name)
    }

    pub fn check_precondition(
        &self,
        instances: &[BaseObject],
        requester: Option<&User>,
    ) -> BTreeMap<ObjectId, String> {
        match &self.precondition {
            Some(check) => check(instances, requester),
            None => BTreeMap::new(),
        }
    }

    pub fn validate_instances(&self, instances: &[BaseObject]) -> Result<(), ActionError> {
        match &self.validation {
            Some(check) => check(instances),
            None => Ok(()),
        }
    }

    /// Run the action body. A panic inside it is reported as a failed action.
    pub fn call(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        panic::catch_unwind(AssertUnwindSafe(|| (self.func)(ctx))).unwrap_or_else(|payload| {
            Err(ActionError::failed(format!(
                "action {} panicked: {}",
                self.name,
                panic_message(payload.as_ref())
            )))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Everything an action body can see and modify while it runs.
pub struct ActionContext<'a> {
    pub instances: &'a mut [BaseObject],
    pub requester: Option<&'a User>,
    /// Transition data with this action's own fields unprefixed.
    pub params: ActionData,
    pub history_kwargs: &'a mut HistoryKwargs,
    pub shared_params: &'a mut SharedParams,
    pub attachments: &'a [Attachment],
    /// Execution record, only set when running inside a transition job.
    pub job_action: Option<&'a TransitionJobAction>,
}

impl ActionContext<'_> {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name).filter(|v| !v.is_null())
    }

    pub fn str_param(&self, name: &str) -> Result<&str, ActionError> {
        let value = self
            .param(name)
            .ok_or_else(|| ActionError::MissingParam(name.to_string()))?;
        value.as_str().ok_or_else(|| ActionError::InvalidParam {
            name: name.to_string(),
            reason: "expected a string".to_string(),
        })
    }

    pub fn i64_param(&self, name: &str) -> Result<i64, ActionError> {
        let value = self
            .param(name)
            .ok_or_else(|| ActionError::MissingParam(name.to_string()))?;
        value_as_i64(value).ok_or_else(|| ActionError::InvalidParam {
            name: name.to_string(),
            reason: "expected an integer".to_string(),
        })
    }

    pub fn record_history(&mut self, object_id: ObjectId, key: impl Into<String>, value: impl Into<Value>) {
        self.history_kwargs
            .entry(object_id)
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn history(&self, object_id: ObjectId, key: &str) -> Option<&Value> {
        self.history_kwargs.get(&object_id).and_then(|h| h.get(key))
    }

    /// Store `value` under `shared_params[key][object_id]`.
    pub fn share_for(&mut self, key: &str, object_id: ObjectId, value: impl Into<Value>) {
        let slot = self
            .shared_params
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !slot.is_object() {
            *slot = Value::Object(Default::default());
        }
        if let Value::Object(map) = slot {
            map.insert(object_id.to_string(), value.into());
        }
    }

    pub fn shared_for(&self, key: &str, object_id: ObjectId) -> Option<&Value> {
        self.shared_params
            .get(key)
            .and_then(|v| v.get(object_id.to_string()))
    }
}

/// Action definitions by asset kind and name.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<(AssetKind, String), ActionDef>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in deployment and back-office actions.
    pub fn with_catalog() -> Self {
        let mut registry = Self::new();
        catalog::register(&mut registry);
        registry
    }

    pub fn register(&mut self, kinds: &[AssetKind], action: ActionDef) -> &mut Self {
        for kind in kinds {
            self.actions
                .insert((*kind, action.name.clone()), action.clone());
        }
        self
    }

    pub fn get(&self, kind: AssetKind, name: &str) -> Result<&ActionDef> {
        self.actions
            .get(&(kind, name.to_string()))
            .ok_or_else(|| TransitionError::UnknownAction {
                kind,
                action: name.to_string(),
            })
    }

    pub fn contains(&self, kind: AssetKind, name: &str) -> bool {
        self.actions.contains_key(&(kind, name.to_string()))
    }

    /// Actions available to transitions of `kind`, ordered by name.
    pub fn actions_for_model(&self, kind: AssetKind) -> Vec<&ActionDef> {
        let mut actions: Vec<&ActionDef> = self
            .actions
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, action)| action)
            .collect();
        actions.sort_by(|a, b| a.name.cmp(&b.name));
        actions
    }
}
