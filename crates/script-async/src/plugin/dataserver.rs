//! Dataserver requests: a script asks for data by identifier and receives a
//! `dataserver` event once some subsystem replies.

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
struct DataserverRequest {
    script: ScriptId,
    key: Uuid,
    started: Instant,
    reply: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRequest {
    identifier: String,
    key: Uuid,
    age_ms: u64,
    #[serde(default)]
    reply: Option<String>,
}

pub struct Dataserver {
    engine: EngineHandle,
    time: Arc<dyn TimeProvider>,
    timeout: Duration,
    requests: Mutex<BTreeMap<String, DataserverRequest>>,
}

impl Dataserver {
    pub(crate) fn new(engine: EngineHandle, time: Arc<dyn TimeProvider>, timeout: Duration) -> Self {
        Self {
            engine,
            time,
            timeout,
            requests: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a request and return the key the script will see in the
    /// reply. `None` if the identifier is already pending.
    pub fn register_request(&self, local_id: u32, item_id: Uuid, identifier: &str) -> Option<Uuid> {
        let mut requests = self.requests.lock();
        if requests.contains_key(identifier) {
            return None;
        }
        let key = Uuid::new_v4();
        requests.insert(
            identifier.to_string(),
            DataserverRequest {
                script: ScriptId::new(local_id, item_id),
                key,
                started: self.time.now(),
                reply: None,
            },
        );
        Some(key)
    }

    /// Answer a pending request. Returns false if nothing is waiting on
    /// `identifier`.
    pub fn reply(&self, identifier: &str, data: impl Into<String>) -> bool {
        match self.requests.lock().get_mut(identifier) {
            Some(request) => {
                request.reply = Some(data.into());
                true
            }
            None => false,
        }
    }

    pub fn remove_events(&self, local_id: u32, item_id: Uuid) {
        let script = ScriptId::new(local_id, item_id);
        self.requests.lock().retain(|_, request| request.script != script);
    }
}

impl AsyncPlugin for Dataserver {
    fn kind(&self) -> PluginKind {
        PluginKind::Dataserver
    }

    fn check(&self) -> Result<()> {
        let now = self.time.now();
        let answered: Vec<(String, ScriptId, Uuid, String)> = {
            let mut requests = self.requests.lock();
            requests.retain(|identifier, request| {
                let expired = request.reply.is_none()
                    && now.saturating_duration_since(request.started) > self.timeout;
                if expired {
                    tracing::debug!(identifier = %identifier, script = %request.script, "Dataserver request expired");
                }
                !expired
            });
            requests
                .iter()
                .filter_map(|(identifier, request)| {
                    request
                        .reply
                        .clone()
                        .map(|data| (identifier.clone(), request.script, request.key, data))
                })
                .collect()
        };

        let mut outcome = CheckOutcome::new(PluginKind::Dataserver);
        for (identifier, script, key, data) in answered {
            let event = ScriptEvent::new(
                "dataserver",
                vec![serde_json::Value::from(key.to_string()), serde_json::Value::from(data)],
            );
            if !post(&self.engine, script.item_id, event, &mut outcome) {
                continue;
            }

            let mut requests = self.requests.lock();
            if requests.get(&identifier).is_some_and(|r| r.key == key) {
                requests.remove(&identifier);
            }
        }
        outcome.finish()
    }

    fn remove_script(&self, local_id: u32, item_id: Uuid) {
        self.remove_events(local_id, item_id);
    }

    fn pending_count(&self, item_id: Uuid) -> usize {
        self.requests
            .lock()
            .values()
            .filter(|request| request.script.item_id == item_id)
            .count()
    }

    fn serialize_script(&self, item_id: Uuid) -> Vec<serde_json::Value> {
        let now = self.time.now();
        self.requests
            .lock()
            .iter()
            .filter(|(_, request)| request.script.item_id == item_id)
            .map(|(identifier, request)| {
                encode(&PersistedRequest {
                    identifier: identifier.clone(),
                    key: request.key,
                    age_ms: millis(now.saturating_duration_since(request.started)),
                    reply: request.reply.clone(),
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
        let restored = decode_all::<PersistedRequest>(data)?;
        let now = self.time.now();

        let mut requests = self.requests.lock();
        let mut replaced = Replaced::new();
        for request in restored {
            let age = Duration::from_millis(request.age_ms);
            let old = requests.insert(
                request.identifier.clone(),
                DataserverRequest {
                    script,
                    key: request.key,
                    started: now.checked_sub(age).unwrap_or(now),
                    reply: request.reply,
                },
            );
            replaced.note(request.identifier, old);
        }
        Ok(RestoreUndo::new(replaced))
    }

    fn undo_restore(&self, undo: RestoreUndo) {
        if let Some(replaced) = undo.into_record::<Replaced<String, DataserverRequest>>() {
            replaced.revert(&mut self.requests.lock());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingEngine;
    use crate::time::VirtualTimeProvider;

    fn setup() -> (Arc<RecordingEngine>, VirtualTimeProvider, Dataserver) {
        let engine = RecordingEngine::new("dataserver");
        let time = VirtualTimeProvider::new();
        let dataserver = Dataserver::new(
            EngineHandle::from(engine.clone()),
            Arc::new(time.clone()),
            Duration::from_secs(30),
        );
        (engine, time, dataserver)
    }

    #[test]
    fn test_reply_is_delivered_once() {
        let (engine, _time, dataserver) = setup();
        let item = Uuid::new_v4();
        let key = dataserver.register_request(1, item, "owner:abc").unwrap();
        assert_eq!(dataserver.register_request(1, item, "owner:abc"), None);

        dataserver.check().unwrap();
        assert_eq!(engine.count("dataserver"), 0);

        assert!(dataserver.reply("owner:abc", "Some Name"));
        assert!(!dataserver.reply("unknown", "x"));
        dataserver.check().unwrap();
        dataserver.check().unwrap();

        let events = engine.events_named("dataserver");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.params[0], key.to_string());
        assert_eq!(events[0].1.params[1], "Some Name");
        assert_eq!(dataserver.pending_count(item), 0);
    }

    #[test]
    fn test_unanswered_request_expires() {
        let (engine, time, dataserver) = setup();
        let item = Uuid::new_v4();
        dataserver.register_request(1, item, "slow").unwrap();

        time.advance(Duration::from_secs(30));
        dataserver.check().unwrap();
        assert_eq!(dataserver.pending_count(item), 1);

        time.advance(Duration::from_millis(1));
        dataserver.check().unwrap();
        assert_eq!(dataserver.pending_count(item), 0);
        assert!(engine.events().is_empty());
    }

    #[test]
    fn test_restore_keeps_age_and_reply() {
        let (_engine, time, dataserver) = setup();
        let item = Uuid::new_v4();
        dataserver.register_request(1, item, "a").unwrap();
        dataserver.register_request(1, item, "b").unwrap();
        dataserver.reply("b", "done");
        time.advance(Duration::from_secs(5));

        let data = dataserver.serialize_script(item);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["age_ms"], 5000);

        let (engine, time, other) = setup();
        time.advance(Duration::from_secs(60));
        other
            .restore_script(ScriptId::new(1, item), Uuid::nil(), &data)
            .unwrap();
        assert_eq!(other.serialize_script(item), data);

        other.check().unwrap();
        assert_eq!(engine.count("dataserver"), 1);
        assert_eq!(other.pending_count(item), 1);
    }
}
