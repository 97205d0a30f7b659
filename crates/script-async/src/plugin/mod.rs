//! Plugin capability and the six plugin kinds.
//!
//! Each kind owns the pending operations of one engine. The scheduler only
//! sees the [`AsyncPlugin`] surface: a non-blocking check, removal by owning
//! script, and per-script serialize/restore. A restore hands back a
//! [`RestoreUndo`] so a stream that fails part way can be taken back.

mod dataserver;
mod http_request;
mod listener;
mod sensor;
mod timer;
mod xml_request;

pub use dataserver::Dataserver;
pub use http_request::HttpRequest;
pub use listener::{ListenFilter, Listener};
pub use sensor::SensorRepeat;
pub use timer::Timer;
pub use xml_request::XmlRequest;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::time::TimeProvider;
use crate::types::{ScriptEvent, ScriptId};

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Kind
// ─────────────────────────────────────────────────────────────────────────────

/// The kinds of pending operation a bundle manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Listener,
    Timer,
    Sensor,
    Dataserver,
    HttpRequest,
    XmlRequest,
}

impl PluginKind {
    /// All kinds, in serialization order
    pub const ALL: [PluginKind; 6] = [
        PluginKind::Listener,
        PluginKind::Timer,
        PluginKind::Sensor,
        PluginKind::Dataserver,
        PluginKind::HttpRequest,
        PluginKind::XmlRequest,
    ];

    /// Tag written in front of this kind's values in a serialized script
    pub fn tag(&self) -> &'static str {
        match self {
            PluginKind::Listener => "listener",
            PluginKind::Timer => "timer",
            PluginKind::Sensor => "sensor",
            PluginKind::Dataserver => "dataserver",
            PluginKind::HttpRequest => "http_request",
            PluginKind::XmlRequest => "xml_request",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Contract every pending-operation kind implements.
pub trait AsyncPlugin: Send + Sync + 'static {
    fn kind(&self) -> PluginKind;

    /// Fire every operation that is due and reschedule or drop it.
    ///
    /// Must not block. An operation whose event could not be delivered stays
    /// due; the check carries on with the rest and reports the first failure.
    fn check(&self) -> Result<()>;

    /// Drop every pending operation owned by a script
    fn remove_script(&self, local_id: u32, item_id: Uuid);

    /// Number of pending operations owned by a script
    fn pending_count(&self, item_id: Uuid) -> usize;

    /// One opaque value per pending operation of a script
    fn serialize_script(&self, item_id: Uuid) -> Vec<serde_json::Value>;

    /// Recreate operations from [`serialize_script`](Self::serialize_script)
    /// output. Either every value is restored or none is.
    fn restore_script(
        &self,
        script: ScriptId,
        host_id: Uuid,
        data: &[serde_json::Value],
    ) -> Result<RestoreUndo>;

    /// Take back one successful [`restore_script`](Self::restore_script)
    /// call: drop exactly what it inserted and put back what it replaced.
    fn undo_restore(&self, undo: RestoreUndo);
}

/// What one restore call changed, readable only by the plugin that made it.
pub struct RestoreUndo(Box<dyn Any + Send>);

impl RestoreUndo {
    pub fn new<T: Any + Send>(record: T) -> Self {
        Self(Box::new(record))
    }

    /// Record of a restore that changed nothing
    pub fn nothing() -> Self {
        Self::new(())
    }

    /// The record, if this plugin kind made it and it changed something
    pub fn into_record<T: Any>(self) -> Option<T> {
        self.0.downcast::<T>().ok().map(|record| *record)
    }
}

impl std::fmt::Debug for RestoreUndo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreUndo").finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Bundle
// ─────────────────────────────────────────────────────────────────────────────

/// One instance of every plugin kind, owned by one engine.
pub struct PluginBundle {
    pub listener: Arc<Listener>,
    pub timer: Arc<Timer>,
    pub sensor_repeat: Arc<SensorRepeat>,
    pub dataserver: Arc<Dataserver>,
    pub http_request: Arc<HttpRequest>,
    pub xml_request: Arc<XmlRequest>,
}

impl PluginBundle {
    pub(crate) fn new(
        engine: &EngineHandle,
        time: &Arc<dyn TimeProvider>,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            listener: Arc::new(Listener::new(engine.clone(), config.max_listens_per_script)),
            timer: Arc::new(Timer::new(engine.clone(), time.clone())),
            sensor_repeat: Arc::new(SensorRepeat::new(engine.clone(), time.clone())),
            dataserver: Arc::new(Dataserver::new(
                engine.clone(),
                time.clone(),
                config.dataserver_timeout(),
            )),
            http_request: Arc::new(HttpRequest::new(engine.clone())),
            xml_request: Arc::new(XmlRequest::new(engine.clone())),
        }
    }

    /// The plugin of the given kind
    pub fn get(&self, kind: PluginKind) -> Arc<dyn AsyncPlugin> {
        match kind {
            PluginKind::Listener => self.listener.clone(),
            PluginKind::Timer => self.timer.clone(),
            PluginKind::Sensor => self.sensor_repeat.clone(),
            PluginKind::Dataserver => self.dataserver.clone(),
            PluginKind::HttpRequest => self.http_request.clone(),
            PluginKind::XmlRequest => self.xml_request.clone(),
        }
    }

    /// Pending operations of a script, per kind
    pub fn pending_counts(&self, item_id: Uuid) -> Vec<(PluginKind, usize)> {
        PluginKind::ALL
            .into_iter()
            .map(|kind| (kind, self.get(kind).pending_count(item_id)))
            .collect()
    }

    /// Pending operations of a script across all kinds
    pub fn total_pending(&self, item_id: Uuid) -> usize {
        self.pending_counts(item_id).iter().map(|(_, n)| n).sum()
    }
}

impl std::fmt::Debug for PluginBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginBundle").finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers shared by the kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps the first failure of a check while the check carries on.
pub(crate) struct CheckOutcome {
    kind: PluginKind,
    first: Option<Error>,
    failed: usize,
}

impl CheckOutcome {
    pub(crate) fn new(kind: PluginKind) -> Self {
        Self {
            kind,
            first: None,
            failed: 0,
        }
    }

    pub(crate) fn record(&mut self, reason: impl std::fmt::Display) {
        self.failed += 1;
        if self.first.is_none() {
            self.first = Some(Error::check_failed(self.kind, reason));
        }
    }

    pub(crate) fn finish(self) -> Result<()> {
        match self.first {
            None => Ok(()),
            Some(err) => {
                if self.failed > 1 {
                    tracing::debug!(kind = %self.kind, failed = self.failed, "Check had several failures");
                }
                Err(err)
            }
        }
    }
}

/// Post an event, returning whether it was accepted
pub(crate) fn post(
    engine: &EngineHandle,
    item_id: Uuid,
    event: ScriptEvent,
    outcome: &mut CheckOutcome,
) -> bool {
    match engine.post_script_event(item_id, event) {
        Ok(()) => true,
        Err(e) => {
            outcome.record(e);
            false
        }
    }
}

/// Decode every persisted value before anything is restored
pub(crate) fn decode_all<T: DeserializeOwned>(data: &[serde_json::Value]) -> Result<Vec<T>> {
    data.iter()
        .enumerate()
        .map(|(index, value)| {
            T::deserialize(value).map_err(|e| Error::malformed(index, e.to_string()))
        })
        .collect()
}

/// Persisted forms are plain structs; one that cannot be encoded is written
/// as null and rejected on restore
pub(crate) fn encode<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Entries one restore call added or overwrote in a keyed map, with the
/// value each key held before the call
pub(crate) struct Replaced<K, V>(Vec<(K, Option<V>)>);

impl<K: Ord, V> Replaced<K, V> {
    pub(crate) fn new() -> Self {
        Self(Vec::new())
    }

    /// Remember what `key` held, unless this call already changed it
    pub(crate) fn note(&mut self, key: K, old: Option<V>) {
        if !self.0.iter().any(|(seen, _)| *seen == key) {
            self.0.push((key, old));
        }
    }

    pub(crate) fn revert(self, map: &mut BTreeMap<K, V>) {
        for (key, old) in self.0 {
            match old {
                Some(old) => {
                    map.insert(key, old);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }
}

pub(crate) fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for kind in PluginKind::ALL {
            assert_eq!(PluginKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(PluginKind::from_tag("teleport"), None);
        assert_eq!(PluginKind::HttpRequest.to_string(), "http_request");
    }

    #[test]
    fn test_undo_record_is_typed() {
        let undo = RestoreUndo::new(vec![1u32, 2]);
        assert_eq!(undo.into_record::<Vec<u32>>(), Some(vec![1, 2]));
        assert_eq!(RestoreUndo::nothing().into_record::<Vec<u32>>(), None);
    }

    #[test]
    fn test_replaced_entries_revert() {
        let mut map = BTreeMap::from([(1, "kept"), (2, "original")]);
        let mut replaced = Replaced::new();
        replaced.note(2, map.insert(2, "restored"));
        replaced.note(3, map.insert(3, "added"));
        replaced.note(2, map.insert(2, "restored again"));

        replaced.revert(&mut map);
        assert_eq!(
            map.into_iter().collect::<Vec<_>>(),
            vec![(1, "kept"), (2, "original")]
        );
    }

    #[test]
    fn test_decode_all_reports_index() {
        let data = vec![serde_json::json!(1), serde_json::json!("two")];
        let result = decode_all::<u32>(&data);
        assert!(matches!(result, Err(Error::MalformedData { index: 1, .. })));
    }
}
