//! Per-engine facade over the registry.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::engine::EngineHandle;
use crate::error::Result;
use crate::persistence;
use crate::plugin::{
    Dataserver, HttpRequest, Listener, PluginBundle, SensorRepeat, Timer, XmlRequest,
};
use crate::registry::EngineRegistry;
use crate::types::ScriptId;

/// An engine's view of the async command machinery.
///
/// Constructing one registers the engine (once; later constructions for the
/// same engine share the bundle). Scripts enqueue work directly on the plugin
/// accessors.
#[derive(Clone)]
pub struct AsyncCommandManager {
    registry: Arc<EngineRegistry>,
    engine: EngineHandle,
    bundle: Arc<PluginBundle>,
}

impl AsyncCommandManager {
    pub fn new(registry: Arc<EngineRegistry>, engine: EngineHandle) -> Result<Self> {
        let bundle = registry.ensure_registered(&engine)?;
        Ok(Self {
            registry,
            engine,
            bundle,
        })
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn bundle(&self) -> &Arc<PluginBundle> {
        &self.bundle
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.bundle.listener
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.bundle.timer
    }

    pub fn sensor_repeat(&self) -> &Arc<SensorRepeat> {
        &self.bundle.sensor_repeat
    }

    pub fn dataserver(&self) -> &Arc<Dataserver> {
        &self.bundle.dataserver
    }

    pub fn http_request(&self) -> &Arc<HttpRequest> {
        &self.bundle.http_request
    }

    pub fn xml_request(&self) -> &Arc<XmlRequest> {
        &self.bundle.xml_request
    }

    /// Drop a script's pending operations. Without `reset_script` only its
    /// dataserver requests go.
    pub fn unregister_script(&self, local_id: u32, item_id: Uuid, reset_script: bool) -> Result<()> {
        persistence::teardown(&self.engine, &self.bundle, local_id, item_id, reset_script);
        Ok(())
    }

    pub fn serialize_script(&self, item_id: Uuid) -> Result<Vec<Value>> {
        Ok(persistence::serialize_bundle(&self.bundle, item_id))
    }

    pub fn restore_script(
        &self,
        local_id: u32,
        item_id: Uuid,
        host_id: Uuid,
        data: &[Value],
    ) -> Result<()> {
        persistence::restore_bundle(&self.bundle, ScriptId::new(local_id, item_id), host_id, data)
    }
}

impl std::fmt::Debug for AsyncCommandManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCommandManager")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
