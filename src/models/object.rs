use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Index of a [`BaseObject`] in the store.
pub type ObjectId = u64;

/// Concrete kinds of the polymorphic `BaseObject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    DataCenterAsset,
    BackOfficeAsset,
    VirtualServer,
    Licence,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::DataCenterAsset => write!(f, "data center asset"),
            AssetKind::BackOfficeAsset => write!(f, "back office asset"),
            AssetKind::VirtualServer => write!(f, "virtual server"),
            AssetKind::Licence => write!(f, "licence"),
        }
    }
}

impl AssetKind {
    /// Status choices `(id, name)` of the kind's `status` field.
    pub fn status_choices(&self) -> &'static [(i64, &'static str)] {
        match self {
            AssetKind::DataCenterAsset => &[
                (1, "new"),
                (2, "in use"),
                (3, "free"),
                (4, "damaged"),
                (5, "liquidated"),
                (6, "to deploy"),
                (7, "cleaned"),
                (8, "pre liquidated"),
            ],
            AssetKind::BackOfficeAsset => &[
                (1, "new"),
                (2, "in progress"),
                (3, "waiting for release"),
                (4, "in use"),
                (5, "loan"),
                (6, "damaged"),
                (7, "liquidated"),
                (8, "in service"),
                (9, "installed"),
                (10, "free"),
                (11, "reserved"),
                (12, "sale"),
            ],
            AssetKind::VirtualServer => &[
                (1, "new"),
                (2, "in use"),
                (3, "to deploy"),
                (4, "liquidated"),
            ],
            AssetKind::Licence => &[(1, "new"), (2, "in use"), (3, "free"), (4, "liquidated")],
        }
    }

    pub fn status_name(&self, id: i64) -> Option<&'static str> {
        self.status_choices()
            .iter()
            .find(|(choice, _)| *choice == id)
            .map(|(_, name)| *name)
    }
}

/// Root entity for hardware, virtual and licence assets.
///
/// `status` backs the default transition field. Any other integer entry of
/// `fields` can be registered as a transition field too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseObject {
    pub id: ObjectId,
    pub kind: AssetKind,
    pub status: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl BaseObject {
    /// New unsaved object; the store assigns the id on insert.
    pub fn new(kind: AssetKind, status: i64) -> Self {
        Self {
            id: 0,
            kind,
            status,
            hostname: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn remove_field(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Current integer value of a transition field.
    pub fn transition_value(&self, field: &str) -> Option<i64> {
        if field == "status" {
            Some(self.status)
        } else {
            self.fields.get(field).and_then(Value::as_i64)
        }
    }

    pub fn set_transition_value(&mut self, field: &str, value: i64) {
        if field == "status" {
            self.status = value;
        } else {
            self.fields.insert(field.to_string(), Value::from(value));
        }
    }
}

impl fmt::Display for BaseObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hostname {
            Some(hostname) => write!(f, "{} #{} ({hostname})", self.kind, self.id),
            None => write!(f, "{} #{}", self.kind, self.id),
        }
    }
}
