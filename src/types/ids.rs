//! Session identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite key identifying one session: a (user, plugin) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub plugin_name: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, plugin_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            plugin_name: plugin_name.into(),
        }
    }

    /// Filter used by administrative clears: `None` matches everything.
    pub fn matches(&self, user_id: Option<&str>, plugin_name: Option<&str>) -> bool {
        user_id.map_or(true, |u| self.user_id == u)
            && plugin_name.map_or(true, |p| self.plugin_name == p)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.plugin_name)
    }
}
