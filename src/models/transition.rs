use std::fmt;

use serde::{Deserialize, Serialize};

use super::object::AssetKind;
use crate::actions::{ActionDef, ActionRegistry};
use crate::error::Result;

pub type TransitionId = u64;

/// Target value meaning "leave the transition field untouched".
pub const KEEP_ORIGINAL_STATUS: i64 = 0;

/// Service that runs asynchronous transitions unless a transition names another.
pub const DEFAULT_ASYNC_SERVICE_NAME: &str = "ASYNC_TRANSITIONS";

/// A field of an asset kind that transitions operate on (usually `status`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionModel {
    pub kind: AssetKind,
    pub field_name: String,
}

impl TransitionModel {
    pub fn new(kind: AssetKind, field_name: impl Into<String>) -> Self {
        Self {
            kind,
            field_name: field_name.into(),
        }
    }

    pub fn status(kind: AssetKind) -> Self {
        Self::new(kind, "status")
    }
}

impl fmt::Display for TransitionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.field_name)
    }
}

/// Value written to the transition field when a transition completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Target {
    Status(i64),
    KeepOriginal,
}

impl From<i64> for Target {
    fn from(value: i64) -> Self {
        if value == KEEP_ORIGINAL_STATUS {
            Target::KeepOriginal
        } else {
            Target::Status(value)
        }
    }
}

impl From<Target> for i64 {
    fn from(target: Target) -> Self {
        match target {
            Target::Status(value) => value,
            Target::KeepOriginal => KEEP_ORIGINAL_STATUS,
        }
    }
}

/// Permission row generated for every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionInfo {
    pub name: String,
    pub codename: String,
}

/// A named workflow moving objects from one of `source` values to `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub name: String,
    pub model: TransitionModel,
    pub source: Vec<i64>,
    pub target: Target,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub run_asynchronously: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_service_name: Option<String>,
}

impl Transition {
    /// An unsaved transition; the store assigns `id` on insert.
    ///
    /// `target` is a status value, or [`KEEP_ORIGINAL_STATUS`] to leave the
    /// field untouched.
    pub fn new(
        name: impl Into<String>,
        model: TransitionModel,
        source: impl IntoIterator<Item = i64>,
        target: i64,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            model,
            source: source.into_iter().collect(),
            target: Target::from(target),
            actions: Vec::new(),
            run_asynchronously: false,
            async_service_name: None,
        }
    }

    /// Action names, resolved against the registry for the model's kind.
    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    /// Run as jobs even when none of the actions is asynchronous.
    pub fn asynchronous(mut self) -> Self {
        self.run_asynchronously = true;
        self
    }

    /// Queue the jobs on another async service.
    pub fn on_service(mut self, service_name: impl Into<String>) -> Self {
        self.async_service_name = Some(service_name.into());
        self
    }

    pub fn permission_info(&self) -> PermissionInfo {
        PermissionInfo {
            name: format!("Can run {} transition", self.name.to_lowercase()),
            codename: format!("can_run_{}_transition", slugify(&self.name)),
        }
    }

    pub fn allows_source(&self, value: i64) -> bool {
        self.source.contains(&value)
    }

    /// Async service for this transition's jobs; empty means the default one.
    pub fn service_name(&self) -> &str {
        self.async_service_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_ASYNC_SERVICE_NAME)
    }

    /// Definitions of this transition's actions, in declaration order.
    pub fn pure_actions<'r>(&self, registry: &'r ActionRegistry) -> Result<Vec<&'r ActionDef>> {
        self.actions
            .iter()
            .map(|name| registry.get(self.model.kind, name))
            .collect()
    }

    /// Asynchronous when flagged so or when any of its actions is asynchronous.
    pub fn is_async(&self, registry: &ActionRegistry) -> Result<bool> {
        if self.run_asynchronously {
            return Ok(true);
        }
        Ok(self.pure_actions(registry)?.iter().any(|a| a.is_async))
    }

    pub fn has_form(&self, registry: &ActionRegistry) -> Result<bool> {
        Ok(self
            .pure_actions(registry)?
            .iter()
            .any(|a| !a.form_fields.is_empty()))
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Lowercase, drop punctuation, join words with `-`.
pub fn slugify(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '_')
        .collect::<String>()
        .to_lowercase();
    let mut slug = String::with_capacity(cleaned.len());
    let mut pending_dash = false;
    for c in cleaned.trim().chars() {
        if c.is_whitespace() || c == '-' {
            pending_dash = !slug.is_empty();
        } else {
            if pending_dash {
                slug.push('-');
                pending_dash = false;
            }
            slug.push(c);
        }
    }
    slug
}
