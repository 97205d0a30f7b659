//! Engine Registry
//!
//! Maps each script engine to its [`PluginBundle`] and owns the scheduler
//! thread. Bundles are created on first registration and kept until the
//! registry is dropped.
//!
//! # Locking
//!
//! Lookups take the lock shared. Registration re-checks under an upgradable
//! guard and only then upgrades to exclusive, so concurrent first
//! registrations of the same engine build exactly one bundle. Nothing hands
//! out references into the locked state; callers get `Arc` clones.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ManagerConfig, TransportPollMode};
use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::guard::RegistryLock;
use crate::plugin::{
    AsyncPlugin, Dataserver, HttpRequest, Listener, PluginBundle, PluginKind, SensorRepeat, Timer,
    XmlRequest,
};
use crate::scheduler::{self, PassReport, SchedulerHandle, SchedulerState, SchedulerStats, StatsCounter};
use crate::time::{SystemTimeProvider, TimeProvider};
use crate::watchdog::{ThreadWatchdog, Watchdog};

type Snapshot = Vec<(EngineHandle, Arc<PluginBundle>)>;

#[derive(Default)]
pub(crate) struct RegistryState {
    /// Registration order
    engines: Vec<EngineHandle>,
    bundles: HashMap<EngineHandle, Arc<PluginBundle>>,
    scheduler: Option<SchedulerHandle>,
}

impl RegistryState {
    fn snapshot(&self) -> Snapshot {
        self.engines
            .iter()
            .filter_map(|engine| {
                self.bundles
                    .get(engine)
                    .map(|bundle| (engine.clone(), bundle.clone()))
            })
            .collect()
    }
}

/// Process-wide registry of script engines and their pending operations.
pub struct EngineRegistry {
    state: Arc<RegistryLock<RegistryState>>,
    config: ManagerConfig,
    time: Arc<dyn TimeProvider>,
    watchdog: Arc<dyn Watchdog>,
    stats: Arc<StatsCounter>,
}

impl EngineRegistry {
    /// Create a registry on the system clock with the default watchdog
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Self::with_providers(
            config,
            Arc::new(SystemTimeProvider),
            Arc::new(ThreadWatchdog::new()),
        )
    }

    pub fn with_providers(
        config: ManagerConfig,
        time: Arc<dyn TimeProvider>,
        watchdog: Arc<dyn Watchdog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(RegistryLock::new(RegistryState::default(), config.lock_timeout())),
            config,
            time,
            watchdog,
            stats: Arc::new(StatsCounter::default()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the engine's bundle, creating it on first use. The first
    /// registration also starts the scheduler when autostart is on.
    pub fn ensure_registered(&self, engine: &EngineHandle) -> Result<Arc<PluginBundle>> {
        if let Some(bundle) = self.state.shared()?.bundles.get(engine) {
            return Ok(bundle.clone());
        }

        let upgradable = self.state.upgradable()?;
        // Another caller may have registered between the two acquisitions
        if let Some(bundle) = upgradable.bundles.get(engine) {
            return Ok(bundle.clone());
        }

        let mut state = upgradable.upgrade()?;
        if self.config.autostart_scheduler && state.scheduler.is_none() {
            state.scheduler = Some(self.spawn_scheduler()?);
        }

        let bundle = Arc::new(PluginBundle::new(engine, &self.time, &self.config));
        state.engines.push(engine.clone());
        state.bundles.insert(engine.clone(), bundle.clone());
        tracing::info!(
            engine = engine.name(),
            engines = state.engines.len(),
            "Registered script engine"
        );

        drop(state.downgrade());
        Ok(bundle)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────────

    /// The engine's bundle; fails for engines never registered
    pub fn bundle(&self, engine: &EngineHandle) -> Result<Arc<PluginBundle>> {
        self.find_bundle(engine)?
            .ok_or_else(|| Error::NotRegistered(engine.name().to_string()))
    }

    pub fn find_bundle(&self, engine: &EngineHandle) -> Result<Option<Arc<PluginBundle>>> {
        Ok(self.state.shared()?.bundles.get(engine).cloned())
    }

    /// One plugin of the engine's bundle
    pub fn plugin(&self, engine: &EngineHandle, kind: PluginKind) -> Result<Arc<dyn AsyncPlugin>> {
        Ok(self.bundle(engine)?.get(kind))
    }

    pub fn listener(&self, engine: &EngineHandle) -> Result<Arc<Listener>> {
        Ok(self.bundle(engine)?.listener.clone())
    }

    pub fn timer(&self, engine: &EngineHandle) -> Result<Arc<Timer>> {
        Ok(self.bundle(engine)?.timer.clone())
    }

    pub fn sensor_repeat(&self, engine: &EngineHandle) -> Result<Arc<SensorRepeat>> {
        Ok(self.bundle(engine)?.sensor_repeat.clone())
    }

    pub fn dataserver(&self, engine: &EngineHandle) -> Result<Arc<Dataserver>> {
        Ok(self.bundle(engine)?.dataserver.clone())
    }

    pub fn http_request(&self, engine: &EngineHandle) -> Result<Arc<HttpRequest>> {
        Ok(self.bundle(engine)?.http_request.clone())
    }

    pub fn xml_request(&self, engine: &EngineHandle) -> Result<Arc<XmlRequest>> {
        Ok(self.bundle(engine)?.xml_request.clone())
    }

    pub fn find_timer(&self, engine: &EngineHandle) -> Result<Option<Arc<Timer>>> {
        Ok(self.find_bundle(engine)?.map(|b| b.timer.clone()))
    }

    pub fn find_sensor_repeat(&self, engine: &EngineHandle) -> Result<Option<Arc<SensorRepeat>>> {
        Ok(self.find_bundle(engine)?.map(|b| b.sensor_repeat.clone()))
    }

    pub fn find_dataserver(&self, engine: &EngineHandle) -> Result<Option<Arc<Dataserver>>> {
        Ok(self.find_bundle(engine)?.map(|b| b.dataserver.clone()))
    }

    pub fn find_listener(&self, engine: &EngineHandle) -> Result<Option<Arc<Listener>>> {
        Ok(self.find_bundle(engine)?.map(|b| b.listener.clone()))
    }

    /// Registered engines in registration order
    pub fn list_engines(&self) -> Result<Vec<EngineHandle>> {
        Ok(self.state.shared()?.engines.clone())
    }

    pub fn is_registered(&self, engine: &EngineHandle) -> Result<bool> {
        Ok(self.state.shared()?.bundles.contains_key(engine))
    }

    pub fn engine_count(&self) -> Result<usize> {
        Ok(self.state.shared()?.engines.len())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduler
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the scheduler if it is not running. Returns whether this call
    /// started it.
    pub fn start_scheduler(&self) -> Result<bool> {
        let mut state = self.state.exclusive()?;
        if state.scheduler.is_some() {
            return Ok(false);
        }
        state.scheduler = Some(self.spawn_scheduler()?);
        Ok(true)
    }

    pub fn scheduler_state(&self) -> Result<SchedulerState> {
        Ok(match self.state.shared()?.scheduler {
            Some(_) => SchedulerState::Running,
            None => SchedulerState::Stopped,
        })
    }

    /// Run one pass on the calling thread
    pub fn run_pass(&self) -> Result<PassReport> {
        let snapshot = self.state.shared()?.snapshot();
        let report = scheduler::run_pass(&snapshot, self.config.transport_poll);
        self.stats.record(&report);
        Ok(report)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot()
    }

    /// Stop the scheduler thread and wait for it. Pending operations are left
    /// as they are; serialize scripts first to hand them off.
    pub fn shutdown(&self) -> Result<()> {
        let handle = self.state.exclusive()?.scheduler.take();
        match handle {
            Some(handle) => {
                handle.stop()?;
                tracing::info!(passes = self.stats().passes, "Async command registry shut down");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn spawn_scheduler(&self) -> Result<SchedulerHandle> {
        let mode = self.config.transport_poll;
        if mode == TransportPollMode::FirstEngine {
            tracing::warn!("HTTP and XML-RPC responses are only polled through the first registered engine");
        }

        let state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.stats);
        SchedulerHandle::spawn(
            self.watchdog.clone(),
            self.config.cycle_interval(),
            move || {
                let snapshot = match state.shared() {
                    Ok(guard) => guard.snapshot(),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping async command pass");
                        return;
                    }
                };
                let report = scheduler::run_pass(&snapshot, mode);
                stats.record(&report);
            },
        )
    }
}

impl Drop for EngineRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Failed to stop async command scheduler");
        }
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
