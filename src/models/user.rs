use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::transition::Transition;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_superuser: false,
            permissions: BTreeSet::new(),
        }
    }

    pub fn superuser(username: impl Into<String>) -> Self {
        Self {
            is_superuser: true,
            ..Self::new(username)
        }
    }

    pub fn with_permission(mut self, codename: impl Into<String>) -> Self {
        self.permissions.insert(codename.into());
        self
    }

    pub fn grant_transition(self, transition: &Transition) -> Self {
        self.with_permission(transition.permission_info().codename)
    }

    pub fn has_perm(&self, codename: &str) -> bool {
        self.is_superuser || self.permissions.contains(codename)
    }
}
