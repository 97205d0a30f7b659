//! Outbound HTTP requests.
//!
//! Requests run in the scene's HTTP module; this plugin remembers which
//! script owns each request id and turns completed responses into
//! `http_response` events. Responses are taken by request id, so a module
//! shared by several engines only ever hands each engine its own.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AsyncPlugin, CheckOutcome, PluginKind, RestoreUndo, decode_all, encode, post};
use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::types::{ScriptEvent, ScriptId};
use crate::world::{HttpRequestModule, HttpRequestSpec, HttpResponse};

#[derive(Debug, Clone)]
struct TrackedRequest {
    script: ScriptId,
    spec: HttpRequestSpec,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRequest {
    request_id: Uuid,
    spec: HttpRequestSpec,
}

pub struct HttpRequest {
    engine: EngineHandle,
    requests: Mutex<BTreeMap<Uuid, TrackedRequest>>,
    backlog: Mutex<VecDeque<HttpResponse>>,
}

impl HttpRequest {
    pub(crate) fn new(engine: EngineHandle) -> Self {
        Self {
            engine,
            requests: Mutex::new(BTreeMap::new()),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    fn module(&self) -> Result<Arc<dyn HttpRequestModule>> {
        self.engine
            .world()
            .http_requests()
            .ok_or(Error::ModuleUnavailable("http"))
    }

    /// Start a request for a script and return its id
    pub fn start_request(&self, local_id: u32, item_id: Uuid, spec: HttpRequestSpec) -> Result<Uuid> {
        let module = self.module()?;
        let request_id = Uuid::new_v4();
        module.start_request(request_id, local_id, item_id, &spec)?;

        self.requests.lock().insert(
            request_id,
            TrackedRequest {
                script: ScriptId::new(local_id, item_id),
                spec,
            },
        );
        Ok(request_id)
    }

    /// Forget every request of a script. The module keeps running them
    /// unless told otherwise; their responses are dropped.
    pub fn stop_tracking(&self, item_id: Uuid) {
        self.requests
            .lock()
            .retain(|_, request| request.script.item_id != item_id);
        self.backlog.lock().retain(|response| response.item_id != item_id);
    }

    fn tracked_ids(&self) -> Vec<Uuid> {
        self.requests.lock().keys().copied().collect()
    }

    /// Abort and forget requests issued by a restore that is being taken back
    fn withdraw(&self, module: &dyn HttpRequestModule, issued: &[Uuid]) {
        for request_id in issued {
            module.stop_request(*request_id);
        }
        let mut requests = self.requests.lock();
        for request_id in issued {
            requests.remove(request_id);
        }
        self.backlog
            .lock()
            .retain(|response| !issued.contains(&response.request_id));
    }
}

/// Request ids one restore call issued
struct IssuedRequests(Vec<Uuid>);

impl AsyncPlugin for HttpRequest {
    fn kind(&self) -> PluginKind {
        PluginKind::HttpRequest
    }

    fn check(&self) -> Result<()> {
        let mut responses: Vec<HttpResponse> = self.backlog.lock().drain(..).collect();
        if let Some(module) = self.engine.world().http_requests() {
            responses.extend(
                self.tracked_ids()
                    .into_iter()
                    .filter_map(|request_id| module.take_completed(request_id)),
            );
        }

        let mut outcome = CheckOutcome::new(PluginKind::HttpRequest);
        let mut undelivered = Vec::new();
        for response in responses {
            let event = ScriptEvent::new(
                "http_response",
                vec![
                    serde_json::Value::from(response.request_id.to_string()),
                    serde_json::Value::from(response.status),
                    serde_json::Value::Array(response.metadata.clone()),
                    serde_json::Value::from(response.body.clone()),
                ],
            );
            if post(&self.engine, response.item_id, event, &mut outcome) {
                self.requests.lock().remove(&response.request_id);
            } else {
                undelivered.push(response);
            }
        }
        if !undelivered.is_empty() {
            self.backlog.lock().extend(undelivered);
        }
        outcome.finish()
    }

    fn remove_script(&self, _local_id: u32, item_id: Uuid) {
        self.stop_tracking(item_id);
    }

    fn pending_count(&self, item_id: Uuid) -> usize {
        self.requests
            .lock()
            .values()
            .filter(|request| request.script.item_id == item_id)
            .count()
    }

    fn serialize_script(&self, item_id: Uuid) -> Vec<serde_json::Value> {
        self.requests
            .lock()
            .iter()
            .filter(|(_, request)| request.script.item_id == item_id)
            .map(|(request_id, request)| {
                encode(&PersistedRequest {
                    request_id: *request_id,
                    spec: request.spec.clone(),
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
        if restored.is_empty() {
            return Ok(RestoreUndo::nothing());
        }
        let module = self.module()?;

        // Re-issued under the original ids so scripts still recognise them.
        // Ids already tracked here are still running and are left alone.
        let tracked = self.tracked_ids();
        let fresh: Vec<PersistedRequest> = restored
            .into_iter()
            .filter(|request| !tracked.contains(&request.request_id))
            .collect();
        let mut issued = Vec::with_capacity(fresh.len());
        for request in &fresh {
            if let Err(e) =
                module.start_request(request.request_id, script.local_id, script.item_id, &request.spec)
            {
                self.withdraw(module.as_ref(), &issued);
                return Err(e.into());
            }
            issued.push(request.request_id);
        }

        let mut requests = self.requests.lock();
        for request in fresh {
            requests.insert(
                request.request_id,
                TrackedRequest {
                    script,
                    spec: request.spec,
                },
            );
        }
        Ok(RestoreUndo::new(IssuedRequests(issued)))
    }

    fn undo_restore(&self, undo: RestoreUndo) {
        let Some(IssuedRequests(issued)) = undo.into_record::<IssuedRequests>() else {
            return;
        };
        match self.module() {
            Ok(module) => self.withdraw(module.as_ref(), &issued),
            Err(e) => tracing::warn!(error = %e, "Cannot stop restored HTTP requests"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeWorld, RecordingEngine};
    use std::sync::atomic::Ordering;

    fn setup() -> (Arc<RecordingEngine>, HttpRequest) {
        let engine = RecordingEngine::new("http");
        let http = HttpRequest::new(EngineHandle::from(engine.clone()));
        (engine, http)
    }

    #[test]
    fn test_response_becomes_event() {
        let (engine, http) = setup();
        let item = Uuid::new_v4();
        let id = http
            .start_request(4, item, HttpRequestSpec::get("http://example.test/a"))
            .unwrap();
        assert_eq!(http.pending_count(item), 1);

        engine.scene().http().complete(id, 200, "ok");
        http.check().unwrap();

        let events = engine.events_named("http_response");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, item);
        assert_eq!(events[0].1.params[0], id.to_string());
        assert_eq!(events[0].1.params[1], 200);
        assert_eq!(events[0].1.params[3], "ok");
        assert_eq!(http.pending_count(item), 0);
    }

    #[test]
    fn test_missing_module() {
        let engine = RecordingEngine::with_world("bare", Arc::new(FakeWorld::bare()));
        let http = HttpRequest::new(EngineHandle::from(engine.clone()));
        let result = http.start_request(1, Uuid::new_v4(), HttpRequestSpec::get("http://x.test"));
        assert!(matches!(result, Err(Error::ModuleUnavailable("http"))));
        http.check().unwrap();
    }

    #[test]
    fn test_rejected_by_module() {
        let (engine, http) = setup();
        engine.scene().http().reject.store(true, Ordering::SeqCst);
        let item = Uuid::new_v4();
        let result = http.start_request(1, item, HttpRequestSpec::get("http://x.test"));
        assert!(matches!(result, Err(Error::Module(_))));
        assert_eq!(http.pending_count(item), 0);
    }

    #[test]
    fn test_refused_response_is_retried() {
        let (engine, http) = setup();
        let item = Uuid::new_v4();
        let id = http
            .start_request(1, item, HttpRequestSpec::get("http://x.test"))
            .unwrap();
        engine.scene().http().complete(id, 404, "");

        engine.reject("http_response");
        assert!(http.check().is_err());
        assert_eq!(http.pending_count(item), 1);

        engine.accept("http_response");
        http.check().unwrap();
        assert_eq!(engine.count("http_response"), 1);
        assert_eq!(http.pending_count(item), 0);
    }

    #[test]
    fn test_untracked_response_is_left_in_module() {
        let (engine, http) = setup();
        let item = Uuid::new_v4();
        let id = http
            .start_request(1, item, HttpRequestSpec::get("http://x.test"))
            .unwrap();
        http.stop_tracking(item);
        engine.scene().http().complete(id, 200, "late");

        http.check().unwrap();
        assert_eq!(engine.count("http_response"), 0);
        assert_eq!(engine.scene().http().completed.lock().len(), 1);
    }

    #[test]
    fn test_engines_sharing_a_module_take_only_their_own() {
        let scene = Arc::new(FakeWorld::full());
        let first = RecordingEngine::with_world("first", scene.clone());
        let second = RecordingEngine::with_world("second", scene.clone());
        let first_http = HttpRequest::new(EngineHandle::from(first.clone()));
        let second_http = HttpRequest::new(EngineHandle::from(second.clone()));
        let item = Uuid::new_v4();
        let id = second_http
            .start_request(1, item, HttpRequestSpec::get("http://x.test"))
            .unwrap();
        scene.http().complete(id, 200, "mine");

        first_http.check().unwrap();
        second_http.check().unwrap();
        assert_eq!(first.count("http_response"), 0);
        assert_eq!(second.count("http_response"), 1);
        assert_eq!(second_http.pending_count(item), 0);
    }

    #[test]
    fn test_restore_reissues_original_ids() {
        let (_engine, http) = setup();
        let item = Uuid::new_v4();
        let id = http
            .start_request(1, item, HttpRequestSpec::get("http://x.test/keep"))
            .unwrap();
        let data = http.serialize_script(item);

        let (engine, other) = setup();
        other
            .restore_script(ScriptId::new(8, item), Uuid::nil(), &data)
            .unwrap();

        let started = engine.scene().http().started.lock().clone();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, id);
        assert_eq!(started[0].1, 8);
        assert_eq!(other.serialize_script(item), data);
    }

    #[test]
    fn test_undo_stops_only_restored_requests() {
        let (engine, http) = setup();
        let item = Uuid::new_v4();
        let kept = http
            .start_request(1, item, HttpRequestSpec::get("http://x.test/kept"))
            .unwrap();
        let data = vec![serde_json::json!({
            "request_id": Uuid::new_v4(),
            "spec": {"url": "http://x.test/restored"}
        })];

        let undo = http.restore_script(ScriptId::new(1, item), Uuid::nil(), &data).unwrap();
        assert_eq!(http.pending_count(item), 2);

        http.undo_restore(undo);
        assert_eq!(http.pending_count(item), 1);
        let stopped = engine.scene().http().stopped_requests.lock().clone();
        assert_eq!(stopped.len(), 1);
        assert_ne!(stopped[0], kept);
        assert!(engine.scene().http().stopped.lock().is_empty());
    }
}
