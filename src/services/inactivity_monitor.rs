// Inactivity Monitor
// Periodic sweep that tears down idle or dead sessions, plus the shutdown sweep.
// The sweep thread hands each teardown to its own worker so one slow process
// never delays the next tick for other devices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::session_registry::{RetiredSession, SessionRegistry, StopReason};
use super::thread_config::SessionThreadKind;

/// Default sweep period
pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Called once per evicted session, after its process was terminated
pub type StopCallback = Arc<dyn Fn(&str, StopReason) + Send + Sync>;

pub struct InactivityMonitor {
    name: String,
    registry: Arc<SessionRegistry>,
    timeout: Option<Duration>,
    period: Duration,
    on_stop: StopCallback,
    worker: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    stopped: AtomicBool,
}

impl InactivityMonitor {
    /// `timeout = None` disables idle eviction; dead processes are still reaped.
    pub fn new(
        name: &str,
        registry: Arc<SessionRegistry>,
        timeout: Option<Duration>,
        on_stop: StopCallback,
    ) -> Self {
        Self {
            name: name.to_string(),
            registry,
            timeout,
            period: SWEEP_PERIOD,
            on_stop,
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Spawn the sweep thread. No-op if already running or stopped.
    pub fn start(&self) -> std::io::Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if worker.is_some() {
            return Ok(());
        }

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let registry = Arc::clone(&self.registry);
        let on_stop = Arc::clone(&self.on_stop);
        let timeout = self.timeout;
        let period = self.period;
        let name = self.name.clone();

        let kind = SessionThreadKind::Monitor;
        let handle = kind.spawn(&kind.thread_name(&self.name), move || {
            log::info!(
                "[Monitor:{}] Started (period {:?}, timeout {:?})",
                name,
                period,
                timeout
            );
            loop {
                match cancel_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        sweep(&name, &registry, timeout, &on_stop, Dispatch::Worker);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            log::info!("[Monitor:{}] Stopped", name);
        })?;

        *worker = Some((cancel_tx, handle));
        Ok(())
    }

    /// Run one sweep, tearing down on the calling thread.
    /// Returns the number of sessions stopped.
    pub fn sweep_now(&self) -> usize {
        sweep(
            &self.name,
            &self.registry,
            self.timeout,
            &self.on_stop,
            Dispatch::Inline,
        )
    }

    /// Cancel the sweep thread and terminate every remaining session.
    /// Waits for teardowns already handed to workers. Only the first call does anything.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some((cancel_tx, handle)) = worker {
            let _ = cancel_tx.send(());
            if handle.join().is_err() {
                log::warn!("[Monitor:{}] Sweep thread panicked", self.name);
            }
        }

        let remaining = self.registry.drain();
        if !remaining.is_empty() {
            log::info!(
                "[Monitor:{}] Shutting down {} remaining session(s)",
                self.name,
                remaining.len()
            );
        }
        for retired in remaining {
            finish(retired, StopReason::Shutdown, &self.on_stop);
        }
    }
}

impl Drop for InactivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Inline,
    Worker,
}

fn sweep(
    name: &str,
    registry: &SessionRegistry,
    timeout: Option<Duration>,
    on_stop: &StopCallback,
    dispatch: Dispatch,
) -> usize {
    let evicted = registry.evict_where(|session| {
        if !session.is_alive() {
            Some(StopReason::Exited)
        } else if timeout.is_some_and(|limit| session.idle() >= limit) {
            Some(StopReason::Inactive)
        } else {
            None
        }
    });

    let count = evicted.len();
    for (retired, reason) in evicted {
        let session = retired.session();
        match reason {
            StopReason::Exited => log::warn!(
                "[Monitor:{}] Stream {} exited on its own after {}s",
                name,
                session.device_id(),
                session.uptime().as_secs()
            ),
            _ => log::info!(
                "[Monitor:{}] Stopping {} after {}s without activity",
                name,
                session.device_id(),
                session.idle().as_secs()
            ),
        }
        match dispatch {
            Dispatch::Inline => finish(retired, reason, on_stop),
            Dispatch::Worker => finish_on_worker(name, retired, reason, on_stop),
        }
    }
    count
}

/// Tear down on a short-lived thread; falls back to the caller's thread
/// if the worker cannot be started.
fn finish_on_worker(name: &str, retired: RetiredSession, reason: StopReason, on_stop: &StopCallback) {
    let (tx, rx) = mpsc::channel::<(RetiredSession, StopReason)>();
    let kind = SessionThreadKind::Teardown;
    let worker_stop = Arc::clone(on_stop);
    let spawned = kind.spawn(&kind.thread_name(retired.device_id()), move || {
        for (retired, reason) in rx {
            finish(retired, reason, &worker_stop);
        }
    });

    if let Err(e) = spawned {
        log::warn!(
            "[Monitor:{}] Could not start teardown worker for {}: {}",
            name,
            retired.device_id(),
            e
        );
        finish(retired, reason, on_stop);
        return;
    }
    if let Err(mpsc::SendError((retired, reason))) = tx.send((retired, reason)) {
        finish(retired, reason, on_stop);
    }
}

/// Terminate, report, then reopen the device by dropping `retired`
fn finish(retired: RetiredSession, reason: StopReason, on_stop: &StopCallback) {
    retired.terminate();
    on_stop(retired.device_id(), reason);
}
