//! Chat listeners.
//!
//! Scripts open listens on a channel with optional name/key/message filters.
//! Every listener holds its own subscription to the scene's chat, so engines
//! sharing a scene each hear everything. A check hands every message heard
//! since the last check to the active listens it matches, skipping the
//! listening object's own chat.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use uuid::Uuid;

use super::{AsyncPlugin, CheckOutcome, PluginKind, RestoreUndo, decode_all, encode, post};
use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::types::{ScriptEvent, ScriptId};
use crate::world::ChatMessage;

/// What a listen matches. Empty name/message and a missing key match anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenFilter {
    pub channel: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: Option<Uuid>,
    #[serde(default)]
    pub message: String,
}

impl ListenFilter {
    /// Listen to everything said on `channel`
    pub fn channel(channel: i32) -> Self {
        Self {
            channel,
            name: String::new(),
            key: None,
            message: String::new(),
        }
    }

    pub fn matches(&self, chat: &ChatMessage) -> bool {
        self.channel == chat.channel
            && (self.name.is_empty() || self.name == chat.name)
            && self.key.is_none_or(|key| key == chat.sender)
            && (self.message.is_empty() || self.message == chat.message)
    }
}

#[derive(Debug, Clone)]
struct Listen {
    script: ScriptId,
    host_id: Uuid,
    handle: i32,
    filter: ListenFilter,
    active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedListen {
    handle: i32,
    channel: i32,
    name: String,
    key: Option<Uuid>,
    message: String,
    active: bool,
}

/// Listens one restore call overwrote, by handle
struct ReplacedListens {
    item_id: Uuid,
    handles: Vec<(i32, Option<Listen>)>,
}

pub struct Listener {
    engine: EngineHandle,
    max_per_script: usize,
    listens: Mutex<Vec<Listen>>,
    chat: Mutex<Option<broadcast::Receiver<ChatMessage>>>,
    /// Deliveries the engine refused, retried on the next check
    backlog: Mutex<VecDeque<(Uuid, ScriptEvent)>>,
}

impl Listener {
    pub(crate) fn new(engine: EngineHandle, max_per_script: usize) -> Self {
        let chat = engine.world().world_comm().map(|comm| comm.subscribe());
        Self {
            engine,
            max_per_script,
            listens: Mutex::new(Vec::new()),
            chat: Mutex::new(chat),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Open a listen for a script and return its handle
    pub fn listen(
        &self,
        local_id: u32,
        item_id: Uuid,
        host_id: Uuid,
        filter: ListenFilter,
    ) -> Result<i32> {
        let mut listens = self.listens.lock();
        let used: Vec<i32> = listens
            .iter()
            .filter(|l| l.script.item_id == item_id)
            .map(|l| l.handle)
            .collect();
        if used.len() >= self.max_per_script {
            return Err(Error::LimitExceeded(format!(
                "script {item_id} already has {} listens",
                used.len()
            )));
        }

        // Lowest free handle, starting at 1
        let handle = (1..).find(|h| !used.contains(h)).unwrap_or(1);
        listens.push(Listen {
            script: ScriptId::new(local_id, item_id),
            host_id,
            handle,
            filter,
            active: true,
        });
        Ok(handle)
    }

    /// Close one listen. Returns false if the script has no such handle.
    pub fn remove_listen(&self, item_id: Uuid, handle: i32) -> bool {
        let mut listens = self.listens.lock();
        let before = listens.len();
        listens.retain(|l| !(l.script.item_id == item_id && l.handle == handle));
        listens.len() != before
    }

    /// Close every listen of a script
    pub fn remove_listens(&self, item_id: Uuid) {
        self.listens.lock().retain(|l| l.script.item_id != item_id);
        self.backlog.lock().retain(|(item, _)| *item != item_id);
    }

    /// Pause or resume a listen without closing it
    pub fn set_listen_active(&self, item_id: Uuid, handle: i32, active: bool) -> bool {
        self.listens
            .lock()
            .iter_mut()
            .find(|l| l.script.item_id == item_id && l.handle == handle)
            .map(|l| l.active = active)
            .is_some()
    }

    /// Chat heard since the last call. Subscribes on first use when the
    /// scene had no comm module at construction.
    fn heard(&self) -> Vec<ChatMessage> {
        let mut chat = self.chat.lock();
        if chat.is_none() {
            *chat = self.engine.world().world_comm().map(|comm| comm.subscribe());
        }
        let Some(receiver) = chat.as_mut() else {
            return Vec::new();
        };

        let mut heard = Vec::new();
        let mut closed = false;
        loop {
            match receiver.try_recv() {
                Ok(message) => heard.push(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(engine = %self.engine.name(), missed, "Listener fell behind scene chat");
                }
                Err(TryRecvError::Closed) => {
                    closed = true;
                    break;
                }
            }
        }
        if closed {
            *chat = None;
        }
        heard
    }

    fn deliveries(&self, chat: &ChatMessage) -> Vec<(Uuid, ScriptEvent)> {
        let listens = self.listens.lock();
        listens
            .iter()
            .filter(|l| l.active && l.host_id != chat.sender && l.filter.matches(chat))
            .map(|l| {
                let event = ScriptEvent::new(
                    "listen",
                    vec![
                        serde_json::Value::from(chat.channel),
                        serde_json::Value::from(chat.name.clone()),
                        serde_json::Value::from(chat.sender.to_string()),
                        serde_json::Value::from(chat.message.clone()),
                    ],
                );
                (l.script.item_id, event)
            })
            .collect()
    }
}

impl AsyncPlugin for Listener {
    fn kind(&self) -> PluginKind {
        PluginKind::Listener
    }

    fn check(&self) -> Result<()> {
        let mut pending: Vec<(Uuid, ScriptEvent)> = self.backlog.lock().drain(..).collect();
        for chat in self.heard() {
            pending.extend(self.deliveries(&chat));
        }

        let mut outcome = CheckOutcome::new(PluginKind::Listener);
        let mut undelivered = Vec::new();
        for (item_id, event) in pending {
            if !post(&self.engine, item_id, event.clone(), &mut outcome) {
                undelivered.push((item_id, event));
            }
        }
        if !undelivered.is_empty() {
            self.backlog.lock().extend(undelivered);
        }
        outcome.finish()
    }

    fn remove_script(&self, _local_id: u32, item_id: Uuid) {
        self.remove_listens(item_id);
    }

    fn pending_count(&self, item_id: Uuid) -> usize {
        self.listens
            .lock()
            .iter()
            .filter(|l| l.script.item_id == item_id)
            .count()
    }

    fn serialize_script(&self, item_id: Uuid) -> Vec<serde_json::Value> {
        self.listens
            .lock()
            .iter()
            .filter(|l| l.script.item_id == item_id)
            .map(|l| {
                encode(&PersistedListen {
                    handle: l.handle,
                    channel: l.filter.channel,
                    name: l.filter.name.clone(),
                    key: l.filter.key,
                    message: l.filter.message.clone(),
                    active: l.active,
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
        let restored = decode_all::<PersistedListen>(data)?;

        let mut listens = self.listens.lock();
        let mut replaced = ReplacedListens {
            item_id: script.item_id,
            handles: Vec::new(),
        };
        for listen in restored {
            let old = listens
                .iter()
                .position(|l| l.script.item_id == script.item_id && l.handle == listen.handle)
                .map(|index| listens.remove(index));
            if !replaced.handles.iter().any(|(handle, _)| *handle == listen.handle) {
                replaced.handles.push((listen.handle, old));
            }
            listens.push(Listen {
                script,
                host_id,
                handle: listen.handle,
                filter: ListenFilter {
                    channel: listen.channel,
                    name: listen.name,
                    key: listen.key,
                    message: listen.message,
                },
                active: listen.active,
            });
        }
        Ok(RestoreUndo::new(replaced))
    }

    fn undo_restore(&self, undo: RestoreUndo) {
        let Some(replaced) = undo.into_record::<ReplacedListens>() else {
            return;
        };
        let mut listens = self.listens.lock();
        for (handle, old) in replaced.handles {
            listens.retain(|l| !(l.script.item_id == replaced.item_id && l.handle == handle));
            listens.extend(old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeWorld, RecordingEngine};
    use std::sync::Arc;

    fn setup(max: usize) -> (Arc<RecordingEngine>, Listener) {
        let engine = RecordingEngine::new("listener");
        let listener = Listener::new(EngineHandle::from(engine.clone()), max);
        (engine, listener)
    }

    #[test]
    fn test_matching_listens_receive_chat() {
        let (engine, listener) = setup(65);
        let (item_a, item_b) = (Uuid::new_v4(), Uuid::new_v4());
        let speaker = Uuid::new_v4();

        listener
            .listen(1, item_a, Uuid::new_v4(), ListenFilter::channel(0))
            .unwrap();
        let mut filtered = ListenFilter::channel(0);
        filtered.message = "open".to_string();
        listener.listen(2, item_b, Uuid::new_v4(), filtered).unwrap();

        let comm = engine.scene().comm().clone();
        comm.say(0, "Someone", speaker, "hello");
        comm.say(0, "Someone", speaker, "open");
        comm.say(5, "Someone", speaker, "open");
        listener.check().unwrap();

        let events = engine.events_named("listen");
        assert_eq!(events.iter().filter(|(item, _)| *item == item_a).count(), 2);
        assert_eq!(events.iter().filter(|(item, _)| *item == item_b).count(), 1);
        assert_eq!(
            events[0].1.params,
            vec![
                serde_json::json!(0),
                serde_json::json!("Someone"),
                serde_json::json!(speaker.to_string()),
                serde_json::json!("hello"),
            ]
        );
    }

    #[test]
    fn test_own_chat_and_inactive_listens_are_skipped() {
        let (engine, listener) = setup(65);
        let item = Uuid::new_v4();
        let host = Uuid::new_v4();
        let handle = listener
            .listen(1, item, host, ListenFilter::channel(7))
            .unwrap();

        let comm = engine.scene().comm().clone();
        comm.say(7, "Self", host, "echo");
        listener.check().unwrap();
        assert_eq!(engine.count("listen"), 0);

        assert!(listener.set_listen_active(item, handle, false));
        comm.say(7, "Other", Uuid::new_v4(), "hi");
        listener.check().unwrap();
        assert_eq!(engine.count("listen"), 0);
    }

    #[test]
    fn test_handles_and_limit() {
        let (_engine, listener) = setup(2);
        let item = Uuid::new_v4();
        let host = Uuid::new_v4();

        assert_eq!(listener.listen(1, item, host, ListenFilter::channel(1)).unwrap(), 1);
        assert_eq!(listener.listen(1, item, host, ListenFilter::channel(2)).unwrap(), 2);
        assert!(matches!(
            listener.listen(1, item, host, ListenFilter::channel(3)),
            Err(Error::LimitExceeded(_))
        ));

        assert!(listener.remove_listen(item, 1));
        assert!(!listener.remove_listen(item, 1));
        assert_eq!(listener.listen(1, item, host, ListenFilter::channel(3)).unwrap(), 1);
    }

    #[test]
    fn test_refused_delivery_is_retried() {
        let (engine, listener) = setup(65);
        let item = Uuid::new_v4();
        listener
            .listen(1, item, Uuid::new_v4(), ListenFilter::channel(0))
            .unwrap();
        engine.scene().comm().say(0, "A", Uuid::new_v4(), "once");

        engine.reject("listen");
        assert!(listener.check().is_err());
        engine.accept("listen");
        listener.check().unwrap();
        listener.check().unwrap();
        assert_eq!(engine.count("listen"), 1);
    }

    #[test]
    fn test_restore_keeps_handles() {
        let (_engine, listener) = setup(65);
        let item = Uuid::new_v4();
        let mut filter = ListenFilter::channel(-42);
        filter.key = Some(Uuid::new_v4());
        listener.listen(1, item, Uuid::new_v4(), ListenFilter::channel(0)).unwrap();
        let handle = listener.listen(1, item, Uuid::new_v4(), filter).unwrap();
        listener.set_listen_active(item, handle, false);

        let data = listener.serialize_script(item);
        let (_engine, other) = setup(65);
        other
            .restore_script(ScriptId::new(3, item), Uuid::new_v4(), &data)
            .unwrap();
        assert_eq!(other.pending_count(item), 2);
        assert_eq!(other.serialize_script(item), data);
    }

    #[test]
    fn test_engines_sharing_a_scene_both_hear_chat() {
        let scene = Arc::new(FakeWorld::full());
        let first = RecordingEngine::with_world("first", scene.clone());
        let second = RecordingEngine::with_world("second", scene.clone());
        let first_listener = Listener::new(EngineHandle::from(first.clone()), 65);
        let second_listener = Listener::new(EngineHandle::from(second.clone()), 65);
        first_listener
            .listen(1, Uuid::new_v4(), Uuid::new_v4(), ListenFilter::channel(0))
            .unwrap();
        second_listener
            .listen(1, Uuid::new_v4(), Uuid::new_v4(), ListenFilter::channel(0))
            .unwrap();

        scene.comm().say(0, "Visitor", Uuid::new_v4(), "hi");
        first_listener.check().unwrap();
        second_listener.check().unwrap();
        first_listener.check().unwrap();

        assert_eq!(first.count("listen"), 1);
        assert_eq!(second.count("listen"), 1);
    }

    #[test]
    fn test_undo_puts_back_replaced_listen() {
        let (_engine, listener) = setup(65);
        let item = Uuid::new_v4();
        listener
            .listen(1, item, Uuid::new_v4(), ListenFilter::channel(9))
            .unwrap();
        let before = listener.serialize_script(item);

        let data = vec![
            serde_json::json!({"handle": 1, "channel": 4, "name": "", "key": null, "message": "", "active": true}),
            serde_json::json!({"handle": 2, "channel": 5, "name": "", "key": null, "message": "", "active": false}),
        ];
        let undo = listener
            .restore_script(ScriptId::new(1, item), Uuid::new_v4(), &data)
            .unwrap();
        assert_eq!(listener.pending_count(item), 2);
        assert_ne!(listener.serialize_script(item), before);

        listener.undo_restore(undo);
        assert_eq!(listener.serialize_script(item), before);
    }
}
