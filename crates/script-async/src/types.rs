//! Script identity and script events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a running script: the scene object's numeric handle plus the
/// script's inventory item id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScriptId {
    pub local_id: u32,
    pub item_id: Uuid,
}

impl ScriptId {
    pub fn new(local_id: u32, item_id: Uuid) -> Self {
        Self { local_id, item_id }
    }
}

impl std::fmt::Display for ScriptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.local_id, self.item_id)
    }
}

/// A completion notification delivered to a script's event queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptEvent {
    /// Event handler name (e.g., "timer", "listen", "http_response")
    pub name: String,
    /// Handler arguments
    pub params: Vec<serde_json::Value>,
}

impl ScriptEvent {
    /// Create an event with arguments
    pub fn new(name: impl Into<String>, params: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Create an event without arguments
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }
}
