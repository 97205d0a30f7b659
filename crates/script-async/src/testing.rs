//! Test fakes: a recording engine and a scripted scene.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::engine::{EngineHandle, ScriptEngine};
use crate::error::{EngineError, ModuleError};
use crate::types::ScriptEvent;
use crate::world::{
    ChatMessage, DetectedObject, HttpRequestModule, HttpRequestSpec, HttpResponse,
    RemoteDataEvent, RemoteDataRequest, SceneWorld, SenseQuery, WorldComm, XmlRpcModule,
};

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Engine that records every posted event and can be told to reject some.
pub struct RecordingEngine {
    name: String,
    scene: Arc<FakeWorld>,
    events: Mutex<Vec<(Uuid, ScriptEvent)>>,
    rejected: Mutex<HashSet<String>>,
}

impl RecordingEngine {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_world(name, Arc::new(FakeWorld::full()))
    }

    pub fn with_world(name: &str, scene: Arc<FakeWorld>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            scene,
            events: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
        })
    }

    pub fn handle(name: &str) -> EngineHandle {
        EngineHandle::from(Self::new(name))
    }

    pub fn scene(&self) -> &Arc<FakeWorld> {
        &self.scene
    }

    pub fn events(&self) -> Vec<(Uuid, ScriptEvent)> {
        self.events.lock().clone()
    }

    pub fn events_named(&self, name: &str) -> Vec<(Uuid, ScriptEvent)> {
        self.events
            .lock()
            .iter()
            .filter(|(_, event)| event.name == name)
            .cloned()
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events_named(name).len()
    }

    /// Reject every future event with this name
    pub fn reject(&self, name: &str) {
        self.rejected.lock().insert(name.to_string());
    }

    pub fn accept(&self, name: &str) {
        self.rejected.lock().remove(name);
    }
}

impl ScriptEngine for RecordingEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn world(&self) -> Arc<dyn SceneWorld> {
        self.scene.clone()
    }

    fn post_script_event(&self, item_id: Uuid, event: ScriptEvent) -> Result<(), EngineError> {
        if self.rejected.lock().contains(&event.name) {
            return Err(EngineError::Rejected(event.name));
        }
        self.events.lock().push((item_id, event));
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scene
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeWorld {
    pub http: Option<Arc<FakeHttp>>,
    pub comm: Option<Arc<FakeComm>>,
    pub xmlrpc: Option<Arc<FakeXmlRpc>>,
    pub sensed: Mutex<Vec<DetectedObject>>,
    pub sense_calls: AtomicUsize,
}

impl FakeWorld {
    /// Scene without any optional module
    pub fn bare() -> Self {
        Self::default()
    }

    /// Scene with every optional module
    pub fn full() -> Self {
        Self {
            http: Some(Arc::new(FakeHttp::default())),
            comm: Some(Arc::new(FakeComm::default())),
            xmlrpc: Some(Arc::new(FakeXmlRpc::default())),
            ..Self::default()
        }
    }

    pub fn http(&self) -> &Arc<FakeHttp> {
        self.http.as_ref().expect("scene has no http module")
    }

    pub fn comm(&self) -> &Arc<FakeComm> {
        self.comm.as_ref().expect("scene has no world comm module")
    }

    pub fn xml(&self) -> &Arc<FakeXmlRpc> {
        self.xmlrpc.as_ref().expect("scene has no xmlrpc module")
    }

    pub fn set_sensed(&self, objects: Vec<DetectedObject>) {
        *self.sensed.lock() = objects;
    }
}

impl SceneWorld for FakeWorld {
    fn http_requests(&self) -> Option<Arc<dyn HttpRequestModule>> {
        self.http.clone().map(|m| m as Arc<dyn HttpRequestModule>)
    }

    fn world_comm(&self) -> Option<Arc<dyn WorldComm>> {
        self.comm.clone().map(|m| m as Arc<dyn WorldComm>)
    }

    fn xmlrpc(&self) -> Option<Arc<dyn XmlRpcModule>> {
        self.xmlrpc.clone().map(|m| m as Arc<dyn XmlRpcModule>)
    }

    fn sense(&self, _query: &SenseQuery) -> Vec<DetectedObject> {
        self.sense_calls.fetch_add(1, Ordering::SeqCst);
        self.sensed.lock().clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeHttp {
    pub started: Mutex<Vec<(Uuid, u32, Uuid, HttpRequestSpec)>>,
    pub completed: Mutex<VecDeque<HttpResponse>>,
    /// Scripts whose requests were all stopped
    pub stopped: Mutex<Vec<Uuid>>,
    pub stopped_requests: Mutex<Vec<Uuid>>,
    pub reject: AtomicBool,
}

impl FakeHttp {
    /// Complete a started request
    pub fn complete(&self, request_id: Uuid, status: u16, body: &str) {
        let item_id = self
            .started
            .lock()
            .iter()
            .find(|(id, ..)| *id == request_id)
            .map(|(_, _, item, _)| *item)
            .expect("request was never started");
        self.completed.lock().push_back(HttpResponse {
            request_id,
            item_id,
            status,
            metadata: Vec::new(),
            body: body.to_string(),
        });
    }
}

impl HttpRequestModule for FakeHttp {
    fn start_request(
        &self,
        request_id: Uuid,
        local_id: u32,
        item_id: Uuid,
        spec: &HttpRequestSpec,
    ) -> Result<(), ModuleError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ModuleError::Rejected(spec.url.clone()));
        }
        self.started
            .lock()
            .push((request_id, local_id, item_id, spec.clone()));
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
        self.stopped_requests.lock().push(request_id);
    }

    fn stop_requests_for_script(&self, item_id: Uuid) {
        self.stopped.lock().push(item_id);
    }
}

pub struct FakeComm {
    chat: broadcast::Sender<ChatMessage>,
    pub deleted: Mutex<Vec<Uuid>>,
}

impl Default for FakeComm {
    fn default() -> Self {
        let (chat, _) = broadcast::channel(64);
        Self {
            chat,
            deleted: Mutex::new(Vec::new()),
        }
    }
}

impl FakeComm {
    pub fn say(&self, channel: i32, name: &str, sender: Uuid, message: &str) {
        // Nobody subscribed yet is fine
        let _ = self.chat.send(ChatMessage {
            channel,
            name: name.to_string(),
            sender,
            message: message.to_string(),
        });
    }
}

impl WorldComm for FakeComm {
    fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.chat.subscribe()
    }

    fn delete_listener(&self, item_id: Uuid) {
        self.deleted.lock().push(item_id);
    }
}

#[derive(Default)]
pub struct FakeXmlRpc {
    pub opened: Mutex<Vec<(Uuid, u32, Uuid)>>,
    pub sent: Mutex<Vec<(Uuid, u32, Uuid, RemoteDataRequest)>>,
    pub inbound: Mutex<VecDeque<RemoteDataEvent>>,
    pub completed: Mutex<VecDeque<RemoteDataEvent>>,
    pub closed_channels: Mutex<Vec<Uuid>>,
    pub cancelled_sends: Mutex<Vec<Uuid>>,
    /// Scripts whose channels were all deleted
    pub deleted_channels: Mutex<Vec<Uuid>>,
    /// Scripts whose sends were all cancelled
    pub cancelled: Mutex<Vec<Uuid>>,
}

fn take_first(
    queue: &Mutex<VecDeque<RemoteDataEvent>>,
    matches: impl Fn(&RemoteDataEvent) -> bool,
) -> Option<RemoteDataEvent> {
    let mut queue = queue.lock();
    let index = queue.iter().position(matches)?;
    queue.remove(index)
}

impl XmlRpcModule for FakeXmlRpc {
    fn send_remote_data(
        &self,
        message_id: Uuid,
        local_id: u32,
        item_id: Uuid,
        request: &RemoteDataRequest,
    ) -> Result<(), ModuleError> {
        self.sent
            .lock()
            .push((message_id, local_id, item_id, request.clone()));
        Ok(())
    }

    fn open_channel(&self, channel: Uuid, local_id: u32, item_id: Uuid) -> Result<(), ModuleError> {
        self.opened.lock().push((channel, local_id, item_id));
        Ok(())
    }

    fn take_inbound_request(&self, channel: Uuid) -> Option<RemoteDataEvent> {
        take_first(&self.inbound, |event| event.channel == channel)
    }

    fn take_completed_send(&self, message_id: Uuid) -> Option<RemoteDataEvent> {
        take_first(&self.completed, |event| event.message_id == message_id)
    }

    fn close_channel(&self, channel: Uuid) {
        self.closed_channels.lock().push(channel);
    }

    fn cancel_send(&self, message_id: Uuid) {
        self.cancelled_sends.lock().push(message_id);
    }

    fn delete_channels(&self, item_id: Uuid) {
        self.deleted_channels.lock().push(item_id);
    }

    fn cancel_srd_requests(&self, item_id: Uuid) {
        self.cancelled.lock().push(item_id);
    }
}
