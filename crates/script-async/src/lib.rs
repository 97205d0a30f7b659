//! Script Async Commands
//!
//! Long-running, callback-style script operations (timers, listeners, sensor
//! repeats, dataserver replies, HTTP and XML-RPC requests) registered by any
//! number of script engines and polled to completion on one shared background
//! thread.
//!
//! # Architecture
//!
//! - [`EngineRegistry`] maps each engine identity to its [`PluginBundle`], one
//!   instance of every plugin kind, created exactly once
//! - A single scheduler thread (started on first registration) runs a pass over
//!   every bundle each cycle
//! - The persistence bridge serializes a script's pending operations into a flat
//!   token stream and restores them, and tears them down on script removal
//! - Everything the core needs from its host (engines, scene modules, thread
//!   watchdog, time) sits behind a trait
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = EngineRegistry::new(ManagerConfig::default());
//! let manager = AsyncCommandManager::new(registry.clone(), engine.clone())?;
//!
//! manager.timer().set_timer_event(local_id, item_id, Duration::from_secs(5));
//!
//! let state = manager.serialize_script(item_id)?;
//! manager.unregister_script(local_id, item_id, true)?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod manager;
pub mod persistence;
pub mod plugin;
pub mod registry;
pub mod scheduler;
pub mod time;
pub mod types;
pub mod watchdog;
pub mod world;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, ManagerConfig, TransportPollMode};
pub use engine::{EngineHandle, ScriptEngine};
pub use error::{EngineError, Error, ModuleError, Result};
pub use manager::AsyncCommandManager;
pub use plugin::{
    AsyncPlugin, Dataserver, HttpRequest, ListenFilter, Listener, PluginBundle, PluginKind,
    RestoreUndo, SensorRepeat, Timer, XmlRequest,
};
pub use registry::EngineRegistry;
pub use scheduler::{PassFailure, PassReport, SCHEDULER_THREAD_NAME, SchedulerState, SchedulerStats};
pub use time::{SystemTimeProvider, TimeProvider, VirtualTimeProvider};
pub use types::{ScriptEvent, ScriptId};
pub use watchdog::{ThreadPriority, ThreadWatchdog, Watchdog};
