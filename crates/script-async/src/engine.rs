//! Script engine identity.
//!
//! The registry keys everything by engine *instance*. Two engines with the
//! same name are still distinct; a clone of an [`EngineHandle`] is the same
//! engine.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::EngineError;
use crate::types::ScriptEvent;
use crate::world::SceneWorld;

/// A running script engine, as seen by the async command manager.
pub trait ScriptEngine: Send + Sync + 'static {
    /// Engine name, used for logging only
    fn name(&self) -> &str;

    /// The scene this engine runs scripts in
    fn world(&self) -> Arc<dyn SceneWorld>;

    /// Queue an event for the script identified by `item_id`
    fn post_script_event(&self, item_id: Uuid, event: ScriptEvent) -> Result<(), EngineError>;
}

/// Identity-compared handle to a script engine.
#[derive(Clone)]
pub struct EngineHandle(Arc<dyn ScriptEngine>);

impl EngineHandle {
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        Self(engine)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn world(&self) -> Arc<dyn SceneWorld> {
        self.0.world()
    }

    pub fn post_script_event(&self, item_id: Uuid, event: ScriptEvent) -> Result<(), EngineError> {
        self.0.post_script_event(item_id, event)
    }

    /// Address of the engine instance; the identity used for equality
    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl<E: ScriptEngine> From<Arc<E>> for EngineHandle {
    fn from(engine: Arc<E>) -> Self {
        Self(engine)
    }
}

impl PartialEq for EngineHandle {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for EngineHandle {}

impl Hash for EngineHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("name", &self.name())
            .field("addr", &self.addr())
            .finish()
    }
}
