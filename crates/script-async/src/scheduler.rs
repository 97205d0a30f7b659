//! Polling scheduler.
//!
//! One background thread per registry. Each cycle it waits on the stop
//! channel for up to the configured interval, then runs a pass: every check
//! of every bundle, in a fixed order, each one isolated from the others.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::TransportPollMode;
use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::plugin::{AsyncPlugin, PluginBundle, PluginKind};
use crate::watchdog::{ThreadPriority, Watchdog};

/// Name of the scheduler thread, as registered with the watchdog
pub const SCHEDULER_THREAD_NAME: &str = "async-command-handler";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// A check that failed or panicked during a pass
#[derive(Debug, Clone, PartialEq)]
pub struct PassFailure {
    pub engine: String,
    pub kind: PluginKind,
    pub reason: String,
}

/// Outcome of one pass over all bundles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    /// Engines in the pass snapshot
    pub engines: usize,
    pub checks_run: usize,
    pub failures: Vec<PassFailure>,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures of one kind
    pub fn failures_of(&self, kind: PluginKind) -> impl Iterator<Item = &PassFailure> {
        self.failures.iter().filter(move |f| f.kind == kind)
    }
}

/// Cumulative pass counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub passes: u64,
    /// Failed checks across all passes
    pub failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    passes: AtomicU64,
    failures: AtomicU64,
}

impl StatsCounter {
    pub(crate) fn record(&self, report: &PassReport) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.failures
            .fetch_add(report.failures.len() as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            passes: self.passes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread
// ─────────────────────────────────────────────────────────────────────────────

/// Running scheduler thread
pub(crate) struct SchedulerHandle {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Spawn the scheduler thread through the watchdog. `pass` runs once per
    /// cycle until [`stop`](Self::stop) is called.
    pub(crate) fn spawn<F>(watchdog: Arc<dyn Watchdog>, interval: Duration, pass: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_watchdog = watchdog.clone();

        let body = move || {
            tracing::info!(interval_ms = interval.as_millis() as u64, "Async command scheduler running");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        pass();
                        thread_watchdog.update_thread(SCHEDULER_THREAD_NAME);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            thread_watchdog.remove_thread(SCHEDULER_THREAD_NAME);
            tracing::info!("Async command scheduler stopped");
        };

        let thread = watchdog.start_thread(
            SCHEDULER_THREAD_NAME,
            ThreadPriority::Normal,
            true,
            Box::new(body),
        )?;

        Ok(Self { stop_tx, thread })
    }

    /// Signal the thread and wait for it to finish its current pass
    pub(crate) fn stop(self) -> Result<()> {
        // Already gone if the thread has exited
        let _ = self.stop_tx.send(());
        self.thread.join().map_err(|_| Error::ThreadPanic)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pass
// ─────────────────────────────────────────────────────────────────────────────

/// Run one pass over a snapshot of `(engine, bundle)` pairs.
///
/// HTTP and XML-RPC go first for the polled engines, then each engine in
/// registration order has its listeners, timers, sensors and dataserver
/// checked.
pub(crate) fn run_pass(
    bundles: &[(EngineHandle, Arc<PluginBundle>)],
    mode: TransportPollMode,
) -> PassReport {
    let mut report = PassReport {
        engines: bundles.len(),
        ..PassReport::default()
    };

    let transport: &[(EngineHandle, Arc<PluginBundle>)] = match mode {
        TransportPollMode::AllEngines => bundles,
        TransportPollMode::FirstEngine => &bundles[..bundles.len().min(1)],
    };
    for (engine, bundle) in transport {
        run_check(engine, bundle.http_request.as_ref(), &mut report);
    }
    for (engine, bundle) in transport {
        run_check(engine, bundle.xml_request.as_ref(), &mut report);
    }

    for (engine, bundle) in bundles {
        run_check(engine, bundle.listener.as_ref(), &mut report);
        run_check(engine, bundle.timer.as_ref(), &mut report);
        run_check(engine, bundle.sensor_repeat.as_ref(), &mut report);
        run_check(engine, bundle.dataserver.as_ref(), &mut report);
    }

    report
}

fn run_check(engine: &EngineHandle, plugin: &dyn AsyncPlugin, report: &mut PassReport) {
    report.checks_run += 1;

    let reason = match catch_unwind(AssertUnwindSafe(|| plugin.check())) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            format!("check panicked: {message}")
        }
    };

    tracing::error!(engine = engine.name(), kind = %plugin.kind(), %reason, "Async command check failed");
    report.failures.push(PassFailure {
        engine: engine.name().to_string(),
        kind: plugin.kind(),
        reason,
    });
}
