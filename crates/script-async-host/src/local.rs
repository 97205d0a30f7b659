//! In-process engine and scene used by the host.
//!
//! The engine only counts the events it receives. The scene answers HTTP
//! requests on the next poll, broadcasts chat said through
//! [`LocalScene::say`] and reports a fixed set of nearby objects to sensor
//! sweeps.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use script_async::world::{
    ChatMessage, DetectedObject, HttpRequestModule, HttpRequestSpec, HttpResponse, SceneWorld,
    SenseQuery, WorldComm,
};
use script_async::{EngineError, ModuleError, ScriptEngine, ScriptEvent};

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

pub struct ConsoleEngine {
    name: String,
    scene: Arc<LocalScene>,
    counts: Mutex<BTreeMap<String, u64>>,
}

impl ConsoleEngine {
    pub fn new(name: String, scene: Arc<LocalScene>) -> Arc<Self> {
        Arc::new(Self {
            name,
            scene,
            counts: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn scene(&self) -> &Arc<LocalScene> {
        &self.scene
    }

    /// Events received so far, by event name
    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.counts.lock().clone()
    }
}

impl ScriptEngine for ConsoleEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn world(&self) -> Arc<dyn SceneWorld> {
        self.scene.clone()
    }

    fn post_script_event(&self, item_id: Uuid, event: ScriptEvent) -> Result<(), EngineError> {
        tracing::trace!(engine = %self.name, %item_id, event = %event.name, "Script event");
        *self.counts.lock().entry(event.name).or_default() += 1;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scene
// ─────────────────────────────────────────────────────────────────────────────

pub struct LocalScene {
    http: Arc<LocalHttp>,
    chat: Arc<LocalChat>,
    nearby: Vec<DetectedObject>,
}

impl LocalScene {
    pub fn new(nearby: usize) -> Arc<Self> {
        let nearby = (0..nearby)
            .map(|i| DetectedObject {
                key: Uuid::new_v4(),
                name: format!("object-{i}"),
                distance: 1.0 + i as f64,
            })
            .collect();
        Arc::new(Self {
            http: Arc::new(LocalHttp::default()),
            chat: Arc::new(LocalChat::new()),
            nearby,
        })
    }

    /// Say something on a chat channel
    pub fn say(&self, channel: i32, name: &str, sender: Uuid, message: &str) {
        let heard_by = self
            .chat
            .tx
            .send(ChatMessage {
                channel,
                name: name.to_string(),
                sender,
                message: message.to_string(),
            })
            .unwrap_or(0);
        tracing::trace!(channel, heard_by, "Chat");
    }
}

impl SceneWorld for LocalScene {
    fn http_requests(&self) -> Option<Arc<dyn HttpRequestModule>> {
        Some(self.http.clone())
    }

    fn world_comm(&self) -> Option<Arc<dyn WorldComm>> {
        Some(self.chat.clone())
    }

    fn sense(&self, query: &SenseQuery) -> Vec<DetectedObject> {
        self.nearby
            .iter()
            .filter(|object| object.distance <= query.range)
            .filter(|object| query.name.is_empty() || query.name == object.name)
            .cloned()
            .collect()
    }
}

/// Answers every request with its own URL on the next poll
#[derive(Default)]
struct LocalHttp {
    completed: Mutex<VecDeque<HttpResponse>>,
}

impl HttpRequestModule for LocalHttp {
    fn start_request(
        &self,
        request_id: Uuid,
        _local_id: u32,
        item_id: Uuid,
        spec: &HttpRequestSpec,
    ) -> Result<(), ModuleError> {
        if !spec.url.starts_with("http://") && !spec.url.starts_with("https://") {
            return Err(ModuleError::Rejected(format!("unsupported url {}", spec.url)));
        }
        self.completed.lock().push_back(HttpResponse {
            request_id,
            item_id,
            status: 200,
            metadata: Vec::new(),
            body: spec.url.clone(),
        });
        Ok(())
    }

    fn take_completed(&self, request_id: Uuid) -> Option<HttpResponse> {
        let mut completed = self.completed.lock();
        let index = completed
            .iter()
            .position(|response| response.request_id == request_id)?;
        completed.remove(index)
    }

    fn stop_request(&self, request_id: Uuid) {
        self.completed
            .lock()
            .retain(|response| response.request_id != request_id);
    }

    fn stop_requests_for_script(&self, item_id: Uuid) {
        self.completed
            .lock()
            .retain(|response| response.item_id != item_id);
    }
}

struct LocalChat {
    tx: broadcast::Sender<ChatMessage>,
}

impl LocalChat {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl WorldComm for LocalChat {
    fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.tx.subscribe()
    }

    fn delete_listener(&self, _item_id: Uuid) {}
}
