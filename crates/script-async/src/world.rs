//! Scene collaborators.
//!
//! The plugins poll these modules for completed I/O instead of awaiting it.
//! Several engines may share one scene, so results are taken by the key of
//! the operation that produced them and chat is broadcast to every
//! subscriber. Every module is optional: a scene without an HTTP module
//! simply cannot start HTTP requests, and teardown skips the missing module.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ModuleError;

// ─────────────────────────────────────────────────────────────────────────────
// Scene
// ─────────────────────────────────────────────────────────────────────────────

/// The scene a script engine runs in.
pub trait SceneWorld: Send + Sync + 'static {
    /// Outbound HTTP request module
    fn http_requests(&self) -> Option<Arc<dyn HttpRequestModule>> {
        None
    }

    /// Chat/communication module
    fn world_comm(&self) -> Option<Arc<dyn WorldComm>> {
        None
    }

    /// XML-RPC remote data module
    fn xmlrpc(&self) -> Option<Arc<dyn XmlRpcModule>> {
        None
    }

    /// Run a sensor sweep. Scenes without sensing find nothing.
    fn sense(&self, _query: &SenseQuery) -> Vec<DetectedObject> {
        Vec::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound HTTP request as issued by a script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: Vec::new(),
            body: String::new(),
        }
    }
}

/// A finished HTTP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub request_id: Uuid,
    pub item_id: Uuid,
    pub status: u16,
    #[serde(default)]
    pub metadata: Vec<serde_json::Value>,
    pub body: String,
}

pub trait HttpRequestModule: Send + Sync {
    /// Start a request under the caller-chosen id
    fn start_request(
        &self,
        request_id: Uuid,
        local_id: u32,
        item_id: Uuid,
        spec: &HttpRequestSpec,
    ) -> Result<(), ModuleError>;

    /// Take the response of a finished request, if it has finished
    fn take_completed(&self, request_id: Uuid) -> Option<HttpResponse>;

    /// Abort one request
    fn stop_request(&self, request_id: Uuid);

    /// Abort everything in flight for a script
    fn stop_requests_for_script(&self, item_id: Uuid);
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat
// ─────────────────────────────────────────────────────────────────────────────

/// A chat message heard in the scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub channel: i32,
    pub name: String,
    pub sender: Uuid,
    pub message: String,
}

pub trait WorldComm: Send + Sync {
    /// Receive every chat message heard from now on
    fn subscribe(&self) -> broadcast::Receiver<ChatMessage>;

    /// Drop any routing state the module keeps for a script
    fn delete_listener(&self, item_id: Uuid);
}

// ─────────────────────────────────────────────────────────────────────────────
// XML-RPC
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound remote data request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDataRequest {
    pub channel: Uuid,
    pub dest: String,
    pub idata: i32,
    pub sdata: String,
}

/// Remote data event types as seen by scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteDataKind {
    Request = 2,
    Reply = 3,
}

/// An inbound channel request or a completed outbound send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDataEvent {
    pub kind: RemoteDataKind,
    pub item_id: Uuid,
    pub channel: Uuid,
    pub message_id: Uuid,
    pub sender: String,
    pub idata: i32,
    pub sdata: String,
}

pub trait XmlRpcModule: Send + Sync {
    /// Send remote data under the caller-chosen message id
    fn send_remote_data(
        &self,
        message_id: Uuid,
        local_id: u32,
        item_id: Uuid,
        request: &RemoteDataRequest,
    ) -> Result<(), ModuleError>;

    /// Open an inbound channel for a script under the caller-chosen id
    fn open_channel(&self, channel: Uuid, local_id: u32, item_id: Uuid) -> Result<(), ModuleError>;

    /// Take the next inbound request on a channel
    fn take_inbound_request(&self, channel: Uuid) -> Option<RemoteDataEvent>;

    /// Take the reply to a send, if it has completed
    fn take_completed_send(&self, message_id: Uuid) -> Option<RemoteDataEvent>;

    fn close_channel(&self, channel: Uuid);

    fn cancel_send(&self, message_id: Uuid);

    /// Close every channel opened by a script
    fn delete_channels(&self, item_id: Uuid);

    /// Cancel outstanding send-remote-data requests of a script
    fn cancel_srd_requests(&self, item_id: Uuid);
}

// ─────────────────────────────────────────────────────────────────────────────
// Sensing
// ─────────────────────────────────────────────────────────────────────────────

/// Sensor sweep parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenseQuery {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: Option<Uuid>,
    #[serde(default)]
    pub type_mask: u32,
    pub range: f64,
    pub arc: f64,
}

/// Something a sensor sweep found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub key: Uuid,
    pub name: String,
    pub distance: f64,
}
