use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::object::{AssetKind, ObjectId};

/// File produced by an action, e.g. a release report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub content: String,
}

impl Attachment {
    pub fn text(file_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            mime_type: "text/plain".to_string(),
            content: content.into(),
        }
    }
}

/// Audit entry written for every object a transition completed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionsHistory {
    pub id: u64,
    pub transition_name: String,
    pub kind: AssetKind,
    pub object_id: ObjectId,
    pub logged_user: Option<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub kwargs: BTreeMap<String, Value>,
    pub actions: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}
