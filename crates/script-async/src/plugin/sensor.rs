//! Sensor repeats: periodic (or single) sensor sweeps run against the scene.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    AsyncPlugin, CheckOutcome, PluginKind, Replaced, RestoreUndo, decode_all, encode, millis, post,
};
use crate::engine::EngineHandle;
use crate::error::Result;
use crate::time::TimeProvider;
use crate::types::{ScriptEvent, ScriptId};
use crate::world::{DetectedObject, SenseQuery};

#[derive(Debug, Clone)]
struct SensorEntry {
    host_id: Uuid,
    query: SenseQuery,
    interval: Duration,
    next: Instant,
    repeat: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSensor {
    query: SenseQuery,
    interval_ms: u64,
    remaining_ms: u64,
    repeat: bool,
}

pub struct SensorRepeat {
    engine: EngineHandle,
    time: Arc<dyn TimeProvider>,
    sensors: Mutex<BTreeMap<ScriptId, SensorEntry>>,
}

impl SensorRepeat {
    pub(crate) fn new(engine: EngineHandle, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            engine,
            time,
            sensors: Mutex::new(BTreeMap::new()),
        }
    }

    /// Sweep every `interval` on behalf of `host_id`. A zero interval removes
    /// the repeat.
    pub fn sense_repeat(
        &self,
        local_id: u32,
        item_id: Uuid,
        host_id: Uuid,
        query: SenseQuery,
        interval: Duration,
    ) {
        let script = ScriptId::new(local_id, item_id);
        if interval.is_zero() {
            self.sensors.lock().remove(&script);
            return;
        }
        let entry = SensorEntry {
            host_id,
            query,
            interval,
            next: self.time.now() + interval,
            repeat: true,
        };
        self.sensors.lock().insert(script, entry);
    }

    /// Sweep once on the next pass
    pub fn sense_once(&self, local_id: u32, item_id: Uuid, host_id: Uuid, query: SenseQuery) {
        let entry = SensorEntry {
            host_id,
            query,
            interval: Duration::ZERO,
            next: self.time.now(),
            repeat: false,
        };
        self.sensors
            .lock()
            .insert(ScriptId::new(local_id, item_id), entry);
    }

    pub fn unset_sense_repeater_events(&self, local_id: u32, item_id: Uuid) {
        self.sensors.lock().remove(&ScriptId::new(local_id, item_id));
    }

    /// Object the sweep of a script runs on behalf of
    pub fn host_of(&self, local_id: u32, item_id: Uuid) -> Option<Uuid> {
        self.sensors
            .lock()
            .get(&ScriptId::new(local_id, item_id))
            .map(|entry| entry.host_id)
    }

    fn sweep_event(detected: Vec<DetectedObject>) -> ScriptEvent {
        if detected.is_empty() {
            return ScriptEvent::bare("no_sensor");
        }
        let count = detected.len();
        let objects = detected
            .into_iter()
            .map(|object| encode(&object))
            .collect::<Vec<_>>();
        ScriptEvent::new(
            "sensor",
            vec![serde_json::Value::from(count), serde_json::Value::Array(objects)],
        )
    }
}

impl AsyncPlugin for SensorRepeat {
    fn kind(&self) -> PluginKind {
        PluginKind::Sensor
    }

    fn check(&self) -> Result<()> {
        let now = self.time.now();
        let due: Vec<(ScriptId, Instant, SenseQuery)> = self
            .sensors
            .lock()
            .iter()
            .filter(|(_, entry)| entry.next <= now)
            .map(|(script, entry)| (*script, entry.next, entry.query.clone()))
            .collect();
        if due.is_empty() {
            return Ok(());
        }

        let world = self.engine.world();
        let mut outcome = CheckOutcome::new(PluginKind::Sensor);
        for (script, fired_at, query) in due {
            let event = Self::sweep_event(world.sense(&query));
            if !post(&self.engine, script.item_id, event, &mut outcome) {
                continue;
            }

            let mut sensors = self.sensors.lock();
            let Some(entry) = sensors.get_mut(&script).filter(|e| e.next == fired_at) else {
                continue;
            };
            if entry.repeat {
                entry.next = now + entry.interval;
            } else {
                sensors.remove(&script);
            }
        }
        outcome.finish()
    }

    fn remove_script(&self, local_id: u32, item_id: Uuid) {
        self.unset_sense_repeater_events(local_id, item_id);
    }

    fn pending_count(&self, item_id: Uuid) -> usize {
        self.sensors
            .lock()
            .keys()
            .filter(|script| script.item_id == item_id)
            .count()
    }

    fn serialize_script(&self, item_id: Uuid) -> Vec<serde_json::Value> {
        let now = self.time.now();
        self.sensors
            .lock()
            .iter()
            .filter(|(script, _)| script.item_id == item_id)
            .map(|(_, entry)| {
                encode(&PersistedSensor {
                    query: entry.query.clone(),
                    interval_ms: millis(entry.interval),
                    remaining_ms: millis(entry.next.saturating_duration_since(now)),
                    repeat: entry.repeat,
                })
            })
            .collect()
    }

    fn restore_script(
        &self,
        script: ScriptId,
        host_id: Uuid,
        data: &[serde_json::Value],
    ) -> Result<RestoreUndo> {
        let restored = decode_all::<PersistedSensor>(data)?;
        let now = self.time.now();

        let mut sensors = self.sensors.lock();
        let mut replaced = Replaced::new();
        for sensor in restored {
            let old = sensors.insert(
                script,
                SensorEntry {
                    host_id,
                    query: sensor.query,
                    interval: Duration::from_millis(sensor.interval_ms),
                    next: now + Duration::from_millis(sensor.remaining_ms),
                    repeat: sensor.repeat,
                },
            );
            replaced.note(script, old);
        }
        Ok(RestoreUndo::new(replaced))
    }

    fn undo_restore(&self, undo: RestoreUndo) {
        if let Some(replaced) = undo.into_record::<Replaced<ScriptId, SensorEntry>>() {
            replaced.revert(&mut self.sensors.lock());
        }
    }
}
