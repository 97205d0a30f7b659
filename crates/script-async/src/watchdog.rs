//! Thread watchdog.
//!
//! Spawns named background threads and tracks when each last reported that
//! it is alive, so a host can detect a stalled scheduler.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Requested scheduling priority. Informational; std threads run at the
/// platform default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    Lowest,
    BelowNormal,
    Normal,
    AboveNormal,
    Highest,
}

/// Spawns watched threads and receives their liveness signals.
pub trait Watchdog: Send + Sync + 'static {
    /// Spawn a named thread running `body`
    fn start_thread(
        &self,
        name: &str,
        priority: ThreadPriority,
        background: bool,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::io::Result<JoinHandle<()>>;

    /// Liveness signal from the named thread
    fn update_thread(&self, name: &str);

    /// Stop watching the named thread
    fn remove_thread(&self, name: &str);
}

/// Snapshot of a watched thread
#[derive(Debug, Clone)]
pub struct WatchedThread {
    pub name: String,
    pub priority: ThreadPriority,
    pub background: bool,
    pub started_at: Instant,
    pub last_update: Instant,
    pub updates: u64,
}

/// Default watchdog: spawns with `thread::Builder` and keeps the last
/// liveness signal of every thread in memory.
#[derive(Debug, Default)]
pub struct ThreadWatchdog {
    threads: DashMap<String, WatchedThread>,
}

impl ThreadWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of a watched thread
    pub fn thread(&self, name: &str) -> Option<WatchedThread> {
        self.threads.get(name).map(|t| t.clone())
    }

    /// Names of threads that have not reported within `threshold`
    pub fn stalled(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        self.threads
            .iter()
            .filter(|entry| now.duration_since(entry.last_update) > threshold)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of threads being watched
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

impl Watchdog for ThreadWatchdog {
    fn start_thread(
        &self,
        name: &str,
        priority: ThreadPriority,
        background: bool,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::io::Result<JoinHandle<()>> {
        // Registered before spawning so the first liveness signal is never lost
        let now = Instant::now();
        self.threads.insert(
            name.to_string(),
            WatchedThread {
                name: name.to_string(),
                priority,
                background,
                started_at: now,
                last_update: now,
                updates: 0,
            },
        );

        let handle = match thread::Builder::new().name(name.to_string()).spawn(body) {
            Ok(handle) => handle,
            Err(e) => {
                self.threads.remove(name);
                return Err(e);
            }
        };
        tracing::debug!(thread = name, ?priority, background, "Started watched thread");

        Ok(handle)
    }

    fn update_thread(&self, name: &str) {
        if let Some(mut entry) = self.threads.get_mut(name) {
            entry.last_update = Instant::now();
            entry.updates += 1;
        }
    }

    fn remove_thread(&self, name: &str) {
        if self.threads.remove(name).is_some() {
            tracing::debug!(thread = name, "Stopped watching thread");
        }
    }
}
