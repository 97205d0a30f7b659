//! Persistence bridge and script teardown.
//!
//! A script's pending operations serialize to a flat stream of JSON values:
//!
//! ```text
//! "timer", 1, {..}, "sensor", 2, {..}, {..}
//! ```
//!
//! Each segment is a kind tag, a count, then that many opaque values, one per
//! operation. Kinds with nothing pending are left out. Restoring validates the
//! whole stream before touching any plugin and skips tags it does not know.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::plugin::{PluginBundle, PluginKind, RestoreUndo};
use crate::registry::EngineRegistry;
use crate::types::ScriptId;

/// One validated `tag, count, values..` run of a stream
#[derive(Debug)]
struct Segment<'a> {
    tag: &'a str,
    values: &'a [Value],
}

fn parse_segments(data: &[Value]) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut index = 0;
    while index < data.len() {
        let tag = data[index]
            .as_str()
            .ok_or_else(|| Error::malformed(index, "expected a kind tag"))?;
        let count_index = index + 1;
        let count = data
            .get(count_index)
            .ok_or_else(|| Error::malformed(count_index, "missing count"))?
            .as_u64()
            .ok_or_else(|| Error::malformed(count_index, "count is not a non-negative integer"))?;

        let start = count_index + 1;
        let end = usize::try_from(count)
            .ok()
            .and_then(|count| start.checked_add(count))
            .filter(|end| *end <= data.len())
            .ok_or_else(|| Error::malformed(count_index, format!("count {count} overruns data")))?;

        segments.push(Segment {
            tag,
            values: &data[start..end],
        });
        index = end;
    }
    Ok(segments)
}

/// Serialize every kind of a bundle for one script
pub(crate) fn serialize_bundle(bundle: &PluginBundle, item_id: Uuid) -> Vec<Value> {
    let mut data = Vec::new();
    for kind in PluginKind::ALL {
        let values = bundle.get(kind).serialize_script(item_id);
        if values.is_empty() {
            continue;
        }
        data.push(Value::from(kind.tag()));
        data.push(Value::from(values.len()));
        data.extend(values);
    }
    data
}

/// Restore a validated stream into a bundle. If a kind fails, every kind
/// already restored by this call is taken back, newest first, leaving the
/// script's earlier operations as they were.
pub(crate) fn restore_bundle(
    bundle: &PluginBundle,
    script: ScriptId,
    host_id: Uuid,
    data: &[Value],
) -> Result<()> {
    let segments = parse_segments(data)?;

    let mut restored: Vec<(PluginKind, RestoreUndo)> = Vec::new();
    for segment in segments {
        let Some(kind) = PluginKind::from_tag(segment.tag) else {
            tracing::warn!(tag = segment.tag, count = segment.values.len(), "Skipping unknown persisted kind");
            continue;
        };

        match bundle.get(kind).restore_script(script, host_id, segment.values) {
            Ok(undo) => {
                tracing::debug!(%script, %kind, count = segment.values.len(), "Restored pending operations");
                restored.push((kind, undo));
            }
            Err(e) => {
                for (done, undo) in restored.into_iter().rev() {
                    bundle.get(done).undo_restore(undo);
                }
                tracing::debug!(%script, %kind, error = %e, "Restore taken back");
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Drop a script's pending operations. Dataserver requests always go;
/// everything else only on reset.
pub(crate) fn teardown(
    engine: &EngineHandle,
    bundle: &PluginBundle,
    local_id: u32,
    item_id: Uuid,
    reset_script: bool,
) {
    bundle.dataserver.remove_events(local_id, item_id);
    if !reset_script {
        tracing::debug!(local_id, %item_id, "Removed dataserver requests");
        return;
    }

    let world = engine.world();

    bundle.timer.unset_timer_events(local_id, item_id);

    match world.http_requests() {
        Some(http) => http.stop_requests_for_script(item_id),
        None => tracing::debug!(%item_id, "No HTTP module; skipping request stop"),
    }
    bundle.http_request.stop_tracking(item_id);

    bundle.listener.remove_listens(item_id);
    match world.world_comm() {
        Some(comm) => comm.delete_listener(item_id),
        None => tracing::debug!(%item_id, "No world comm module; skipping listener removal"),
    }

    match world.xmlrpc() {
        Some(xmlrpc) => {
            xmlrpc.delete_channels(item_id);
            xmlrpc.cancel_srd_requests(item_id);
        }
        None => tracing::debug!(%item_id, "No XML-RPC module; skipping channel removal"),
    }
    bundle.xml_request.stop_tracking(item_id);

    bundle.sensor_repeat.unset_sense_repeater_events(local_id, item_id);

    tracing::debug!(local_id, %item_id, "Reset script async state");
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry operations
// ─────────────────────────────────────────────────────────────────────────────

impl EngineRegistry {
    /// Tear down a script's pending operations in the engine's bundle
    pub fn unregister_script(
        &self,
        engine: &EngineHandle,
        local_id: u32,
        item_id: Uuid,
        reset_script: bool,
    ) -> Result<()> {
        let bundle = self.bundle(engine)?;
        teardown(engine, &bundle, local_id, item_id, reset_script);
        Ok(())
    }

    /// Serialize a script's pending operations
    pub fn serialize_script(&self, engine: &EngineHandle, item_id: Uuid) -> Result<Vec<Value>> {
        let bundle = self.bundle(engine)?;
        Ok(serialize_bundle(&bundle, item_id))
    }

    /// Recreate a script's pending operations from
    /// [`serialize_script`](Self::serialize_script) output. A malformed stream
    /// restores nothing.
    pub fn restore_script(
        &self,
        engine: &EngineHandle,
        local_id: u32,
        item_id: Uuid,
        host_id: Uuid,
        data: &[Value],
    ) -> Result<()> {
        let bundle: Arc<PluginBundle> = self.bundle(engine)?;
        restore_bundle(&bundle, ScriptId::new(local_id, item_id), host_id, data)
    }
}
