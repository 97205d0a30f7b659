//! Script timers. One timer per script, repeating or one-shot.

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

#[derive(Debug, Clone)]
struct TimerEntry {
    interval: Duration,
    next: Instant,
    repeat: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedTimer {
    interval_ms: u64,
    remaining_ms: u64,
    repeat: bool,
}

pub struct Timer {
    engine: EngineHandle,
    time: Arc<dyn TimeProvider>,
    timers: Mutex<BTreeMap<ScriptId, TimerEntry>>,
}

impl Timer {
    pub(crate) fn new(engine: EngineHandle, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            engine,
            time,
            timers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fire `timer` every `interval`. A zero interval removes the timer.
    pub fn set_timer_event(&self, local_id: u32, item_id: Uuid, interval: Duration) {
        let script = ScriptId::new(local_id, item_id);
        if interval.is_zero() {
            self.timers.lock().remove(&script);
            return;
        }
        let entry = TimerEntry {
            interval,
            next: self.time.now() + interval,
            repeat: true,
        };
        self.timers.lock().insert(script, entry);
    }

    /// Fire `timer` once after `delay`
    pub fn set_timer_once(&self, local_id: u32, item_id: Uuid, delay: Duration) {
        let entry = TimerEntry {
            interval: delay,
            next: self.time.now() + delay,
            repeat: false,
        };
        self.timers
            .lock()
            .insert(ScriptId::new(local_id, item_id), entry);
    }

    pub fn unset_timer_events(&self, local_id: u32, item_id: Uuid) {
        self.timers.lock().remove(&ScriptId::new(local_id, item_id));
    }
}

impl AsyncPlugin for Timer {
    fn kind(&self) -> PluginKind {
        PluginKind::Timer
    }

    fn check(&self) -> Result<()> {
        let now = self.time.now();
        let due: Vec<(ScriptId, Instant)> = self
            .timers
            .lock()
            .iter()
            .filter(|(_, entry)| entry.next <= now)
            .map(|(script, entry)| (*script, entry.next))
            .collect();

        let mut outcome = CheckOutcome::new(PluginKind::Timer);
        for (script, fired_at) in due {
            if !post(
                &self.engine,
                script.item_id,
                ScriptEvent::bare("timer"),
                &mut outcome,
            ) {
                continue;
            }

            let mut timers = self.timers.lock();
            // Replaced while the event was being posted
            let Some(entry) = timers.get_mut(&script).filter(|e| e.next == fired_at) else {
                continue;
            };
            if entry.repeat {
                entry.next = now + entry.interval;
            } else {
                timers.remove(&script);
            }
        }
        outcome.finish()
    }

    fn remove_script(&self, local_id: u32, item_id: Uuid) {
        self.unset_timer_events(local_id, item_id);
    }

    fn pending_count(&self, item_id: Uuid) -> usize {
        self.timers
            .lock()
            .keys()
            .filter(|script| script.item_id == item_id)
            .count()
    }

    fn serialize_script(&self, item_id: Uuid) -> Vec<serde_json::Value> {
        let now = self.time.now();
        self.timers
            .lock()
            .iter()
            .filter(|(script, _)| script.item_id == item_id)
            .map(|(_, entry)| {
                encode(&PersistedTimer {
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
        _host_id: Uuid,
        data: &[serde_json::Value],
    ) -> Result<RestoreUndo> {
        let restored = decode_all::<PersistedTimer>(data)?;
        let now = self.time.now();

        let mut timers = self.timers.lock();
        let mut replaced = Replaced::new();
        for timer in restored {
            let old = timers.insert(
                script,
                TimerEntry {
                    interval: Duration::from_millis(timer.interval_ms),
                    next: now + Duration::from_millis(timer.remaining_ms),
                    repeat: timer.repeat,
                },
            );
            replaced.note(script, old);
        }
        Ok(RestoreUndo::new(replaced))
    }

    fn undo_restore(&self, undo: RestoreUndo) {
        if let Some(replaced) = undo.into_record::<Replaced<ScriptId, TimerEntry>>() {
            replaced.revert(&mut self.timers.lock());
        }
    }
}
