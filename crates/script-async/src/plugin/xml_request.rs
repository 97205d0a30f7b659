//! XML-RPC remote data.
//!
//! Outbound sends are tracked by message id until the module reports them
//! complete. Inbound requests arrive on channels a script opened through
//! this plugin and are forwarded as they arrive. Both are taken from the
//! module by key, so engines sharing a scene never see each other's traffic.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AsyncPlugin, CheckOutcome, PluginKind, RestoreUndo, decode_all, encode, post};
use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::types::{ScriptEvent, ScriptId};
use crate::world::{RemoteDataEvent, RemoteDataKind, RemoteDataRequest, XmlRpcModule};

#[derive(Debug, Clone)]
struct TrackedSend {
    script: ScriptId,
    request: RemoteDataRequest,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum PersistedRemoteData {
    Channel {
        channel: Uuid,
    },
    Send {
        message_id: Uuid,
        request: RemoteDataRequest,
    },
}

/// A channel or send one restore call put into the module
#[derive(Debug, Clone, Copy, PartialEq)]
enum Issued {
    Channel(Uuid),
    Send(Uuid),
}

pub struct XmlRequest {
    engine: EngineHandle,
    channels: Mutex<BTreeMap<Uuid, ScriptId>>,
    sends: Mutex<BTreeMap<Uuid, TrackedSend>>,
    backlog: Mutex<VecDeque<RemoteDataEvent>>,
}

impl XmlRequest {
    pub(crate) fn new(engine: EngineHandle) -> Self {
        Self {
            engine,
            channels: Mutex::new(BTreeMap::new()),
            sends: Mutex::new(BTreeMap::new()),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    fn module(&self) -> Result<Arc<dyn XmlRpcModule>> {
        self.engine
            .world()
            .xmlrpc()
            .ok_or(Error::ModuleUnavailable("xmlrpc"))
    }

    /// Open an inbound channel for a script and return its id
    pub fn open_remote_data_channel(&self, local_id: u32, item_id: Uuid) -> Result<Uuid> {
        let module = self.module()?;
        let channel = Uuid::new_v4();
        module.open_channel(channel, local_id, item_id)?;

        self.channels
            .lock()
            .insert(channel, ScriptId::new(local_id, item_id));
        Ok(channel)
    }

    /// Send remote data for a script and return the message id
    pub fn send_remote_data(
        &self,
        local_id: u32,
        item_id: Uuid,
        request: RemoteDataRequest,
    ) -> Result<Uuid> {
        let module = self.module()?;
        let message_id = Uuid::new_v4();
        module.send_remote_data(message_id, local_id, item_id, &request)?;

        self.sends.lock().insert(
            message_id,
            TrackedSend {
                script: ScriptId::new(local_id, item_id),
                request,
            },
        );
        Ok(message_id)
    }

    /// Forget every channel and send of a script along with undelivered
    /// events for it
    pub fn stop_tracking(&self, item_id: Uuid) {
        self.channels
            .lock()
            .retain(|_, script| script.item_id != item_id);
        self.sends
            .lock()
            .retain(|_, send| send.script.item_id != item_id);
        self.backlog.lock().retain(|event| event.item_id != item_id);
    }

    fn remote_data_event(event: &RemoteDataEvent) -> ScriptEvent {
        ScriptEvent::new(
            "remote_data",
            vec![
                serde_json::Value::from(event.kind as i32),
                serde_json::Value::from(event.channel.to_string()),
                serde_json::Value::from(event.message_id.to_string()),
                serde_json::Value::from(event.sender.clone()),
                serde_json::Value::from(event.idata),
                serde_json::Value::from(event.sdata.clone()),
            ],
        )
    }

    fn is_tracked(&self, issued: Issued) -> bool {
        match issued {
            Issued::Channel(channel) => self.channels.lock().contains_key(&channel),
            Issued::Send(message_id) => self.sends.lock().contains_key(&message_id),
        }
    }

    /// Close and forget what a restore that is being taken back put in place
    fn withdraw(&self, module: &dyn XmlRpcModule, issued: &[Issued]) {
        for entry in issued {
            match entry {
                Issued::Channel(channel) => module.close_channel(*channel),
                Issued::Send(message_id) => module.cancel_send(*message_id),
            }
        }
        for entry in issued {
            match entry {
                Issued::Channel(channel) => {
                    self.channels.lock().remove(channel);
                }
                Issued::Send(message_id) => {
                    self.sends.lock().remove(message_id);
                }
            }
        }
        self.backlog.lock().retain(|event| {
            !issued.contains(&Issued::Channel(event.channel))
                && !issued.contains(&Issued::Send(event.message_id))
        });
    }
}

impl AsyncPlugin for XmlRequest {
    fn kind(&self) -> PluginKind {
        PluginKind::XmlRequest
    }

    fn check(&self) -> Result<()> {
        let mut events: Vec<RemoteDataEvent> = self.backlog.lock().drain(..).collect();
        if let Some(module) = self.engine.world().xmlrpc() {
            let channels: Vec<Uuid> = self.channels.lock().keys().copied().collect();
            for channel in channels {
                while let Some(event) = module.take_inbound_request(channel) {
                    events.push(event);
                }
            }
            let sends: Vec<Uuid> = self.sends.lock().keys().copied().collect();
            events.extend(
                sends
                    .into_iter()
                    .filter_map(|message_id| module.take_completed_send(message_id)),
            );
        }

        let mut outcome = CheckOutcome::new(PluginKind::XmlRequest);
        let mut undelivered = Vec::new();
        for event in events {
            if post(
                &self.engine,
                event.item_id,
                Self::remote_data_event(&event),
                &mut outcome,
            ) {
                if event.kind == RemoteDataKind::Reply {
                    self.sends.lock().remove(&event.message_id);
                }
            } else {
                undelivered.push(event);
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
        let channels = self
            .channels
            .lock()
            .values()
            .filter(|script| script.item_id == item_id)
            .count();
        let sends = self
            .sends
            .lock()
            .values()
            .filter(|send| send.script.item_id == item_id)
            .count();
        channels + sends
    }

    fn serialize_script(&self, item_id: Uuid) -> Vec<serde_json::Value> {
        let channels = self
            .channels
            .lock()
            .iter()
            .filter(|(_, script)| script.item_id == item_id)
            .map(|(channel, _)| encode(&PersistedRemoteData::Channel { channel: *channel }))
            .collect::<Vec<_>>();
        let sends = self
            .sends
            .lock()
            .iter()
            .filter(|(_, send)| send.script.item_id == item_id)
            .map(|(message_id, send)| {
                encode(&PersistedRemoteData::Send {
                    message_id: *message_id,
                    request: send.request.clone(),
                })
            })
            .collect::<Vec<_>>();
        channels.into_iter().chain(sends).collect()
    }

    fn restore_script(
        &self,
        script: ScriptId,
        _host_id: Uuid,
        data: &[serde_json::Value],
    ) -> Result<RestoreUndo> {
        let restored = decode_all::<PersistedRemoteData>(data)?;
        if restored.is_empty() {
            return Ok(RestoreUndo::nothing());
        }
        let module = self.module()?;

        // Reopened and re-sent under the original ids; ids already tracked
        // here are still live and are left alone
        let mut issued = Vec::with_capacity(restored.len());
        let mut fresh = Vec::with_capacity(restored.len());
        for entry in restored {
            let key = match &entry {
                PersistedRemoteData::Channel { channel } => Issued::Channel(*channel),
                PersistedRemoteData::Send { message_id, .. } => Issued::Send(*message_id),
            };
            if self.is_tracked(key) || issued.contains(&key) {
                continue;
            }
            let outcome = match &entry {
                PersistedRemoteData::Channel { channel } => {
                    module.open_channel(*channel, script.local_id, script.item_id)
                }
                PersistedRemoteData::Send {
                    message_id,
                    request,
                } => module.send_remote_data(*message_id, script.local_id, script.item_id, request),
            };
            if let Err(e) = outcome {
                self.withdraw(module.as_ref(), &issued);
                return Err(e.into());
            }
            issued.push(key);
            fresh.push(entry);
        }

        let mut channels = self.channels.lock();
        let mut sends = self.sends.lock();
        for entry in fresh {
            match entry {
                PersistedRemoteData::Channel { channel } => {
                    channels.insert(channel, script);
                }
                PersistedRemoteData::Send {
                    message_id,
                    request,
                } => {
                    sends.insert(message_id, TrackedSend { script, request });
                }
            }
        }
        Ok(RestoreUndo::new(issued))
    }

    fn undo_restore(&self, undo: RestoreUndo) {
        let Some(issued) = undo.into_record::<Vec<Issued>>() else {
            return;
        };
        match self.module() {
            Ok(module) => self.withdraw(module.as_ref(), &issued),
            Err(e) => tracing::warn!(error = %e, "Cannot withdraw restored remote data"),
        }
    }
}
