// Stream Core
// Start/stop/keepalive orchestration shared by the frame and segment services.
//
// Every teardown (explicit stop, inactivity, process exit, shutdown) goes through
// the registry first; whichever path takes the session out of the registry
// terminates it and emits the single stop event. The device only reopens for new
// starts once that teardown, including the teardown hook, has completed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::error::{StreamError, StreamResult};
use super::events::{
    emit_event, EventSink, StreamStateEvent, STREAM_STARTED_EVENT, STREAM_STOPPED_EVENT,
};
use super::inactivity_monitor::{InactivityMonitor, StopCallback, SWEEP_PERIOD};
use super::session_registry::{
    Registration, Release, RetiredSession, SessionInfo, SessionRegistry, StopPolicy, StopReason,
    StreamCapacity, Supervised,
};
use crate::models::{Settings, StreamMode};

/// Runs after a session's process was terminated, before the stop event
pub type TeardownHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Registry and monitor parameters
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Clone one capacity into several configs to share the ceiling
    pub capacity: StreamCapacity,
    pub policy: StopPolicy,
    pub inactivity_timeout: Option<Duration>,
    pub sweep_period: Duration,
}

impl CoreConfig {
    pub fn from_settings(settings: &Settings, mode: StreamMode) -> Self {
        Self {
            capacity: StreamCapacity::new(settings.max_parallel_streams),
            policy: settings.stop_policy,
            inactivity_timeout: settings.inactivity_timeout(mode),
            sweep_period: SWEEP_PERIOD,
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum StartOutcome {
    /// A new process was launched
    Started,
    /// The device was already streaming; consumer count after joining
    Joined { consumers: usize },
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum StopOutcome {
    /// The process was torn down
    Stopped,
    /// Other consumers still use the stream
    StillShared { consumers: usize },
}

/// Post-termination work common to every teardown path
struct StopNotifier {
    mode: StreamMode,
    events: Arc<dyn EventSink>,
    after_teardown: Option<TeardownHook>,
}

impl StopNotifier {
    fn notify(&self, device_id: &str, reason: StopReason) {
        if let Some(hook) = &self.after_teardown {
            hook(device_id);
        }
        log::info!("[Stream:{}] Stopped ({:?})", device_id, reason);
        emit_event(
            self.events.as_ref(),
            STREAM_STOPPED_EVENT,
            &StreamStateEvent::stopped(device_id, self.mode, reason),
        );
    }

    fn finish(&self, retired: RetiredSession, reason: StopReason) {
        retired.terminate();
        self.notify(retired.device_id(), reason);
    }
}

pub struct StreamCore {
    mode: StreamMode,
    registry: Arc<SessionRegistry>,
    monitor: InactivityMonitor,
    notifier: Arc<StopNotifier>,
    closed: AtomicBool,
}

impl StreamCore {
    /// Build the registry and start its inactivity monitor
    pub fn new(
        mode: StreamMode,
        config: &CoreConfig,
        events: Arc<dyn EventSink>,
        after_teardown: Option<TeardownHook>,
    ) -> StreamResult<Self> {
        let registry = Arc::new(SessionRegistry::with_capacity(
            config.capacity.clone(),
            config.policy,
        ));
        let notifier = Arc::new(StopNotifier {
            mode,
            events,
            after_teardown,
        });

        let on_stop: StopCallback = {
            let notifier = Arc::clone(&notifier);
            Arc::new(move |device_id: &str, reason| notifier.notify(device_id, reason))
        };
        let monitor = InactivityMonitor::new(
            mode.as_str(),
            Arc::clone(&registry),
            config.inactivity_timeout,
            on_stop,
        )
        .with_period(config.sweep_period);
        monitor.start()?;

        log::info!(
            "[Stream] {} service ready (max {} parallel, timeout {:?}, {:?})",
            mode,
            config.capacity.max(),
            config.inactivity_timeout,
            config.policy
        );

        Ok(Self {
            mode,
            registry,
            monitor,
            notifier,
            closed: AtomicBool::new(false),
        })
    }

    /// Join the device's stream or launch it with `launch`.
    /// `launch` runs only when a new process is needed.
    pub fn start<F>(&self, device_id: &str, launch: F) -> StreamResult<StartOutcome>
    where
        F: FnOnce() -> StreamResult<Arc<dyn Supervised>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::ShuttingDown);
        }

        match self.registry.register(device_id, launch)? {
            Registration::Joined { consumers } => Ok(StartOutcome::Joined { consumers }),
            Registration::Started => {
                // Lost a race with shutdown: the drain may have missed this session
                if self.closed.load(Ordering::SeqCst) {
                    if let Release::Teardown(retired) = self.take_for_shutdown(device_id) {
                        self.notifier.finish(retired, StopReason::Shutdown);
                    }
                    return Err(StreamError::ShuttingDown);
                }

                log::info!("[Stream:{}] {} stream started", device_id, self.mode);
                emit_event(
                    self.notifier.events.as_ref(),
                    STREAM_STARTED_EVENT,
                    &StreamStateEvent::started(device_id, self.mode),
                );
                Ok(StartOutcome::Started)
            }
        }
    }

    /// Drop one consumer; tear the stream down when none remain
    pub fn stop(&self, device_id: &str) -> StreamResult<StopOutcome> {
        match self.registry.release(device_id) {
            Release::Teardown(retired) => {
                self.notifier.finish(retired, StopReason::Stopped);
                Ok(StopOutcome::Stopped)
            }
            Release::Retained { consumers } => {
                log::info!(
                    "[Stream:{}] Stop requested, {} consumer(s) remain",
                    device_id,
                    consumers
                );
                Ok(StopOutcome::StillShared { consumers })
            }
            Release::NotActive => Err(StreamError::NotStreaming(device_id.to_string())),
        }
    }

    /// Refresh the inactivity timer
    pub fn keep_alive(&self, device_id: &str) -> StreamResult<()> {
        if self.registry.touch(device_id) {
            Ok(())
        } else {
            Err(StreamError::NotStreaming(device_id.to_string()))
        }
    }

    /// Register another consumer of a running stream
    pub fn add_consumer(&self, device_id: &str) -> StreamResult<usize> {
        self.registry.increment_consumers(device_id)
    }

    pub fn is_streaming(&self, device_id: &str) -> bool {
        self.registry.is_active(device_id)
    }

    pub fn can_admit(&self) -> bool {
        self.registry.can_admit()
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot_active()
    }

    /// Stop the monitor and every running stream. Later starts are refused.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[Stream] Shutting down {} service", self.mode);
        self.monitor.stop();
    }

    fn take_for_shutdown(&self, device_id: &str) -> Release {
        loop {
            match self.registry.release(device_id) {
                Release::Retained { .. } => continue,
                other => return other,
            }
        }
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events::RecordingEventSink;
    use crate::services::session_registry::test_support::{handle, FakeProcess};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    fn config(max: usize, timeout: Option<Duration>) -> CoreConfig {
        CoreConfig {
            capacity: StreamCapacity::new(max),
            policy: StopPolicy::RefCounted,
            inactivity_timeout: timeout,
            sweep_period: Duration::from_millis(20),
        }
    }

    fn core_with(
        config: &CoreConfig,
        hook: Option<TeardownHook>,
    ) -> (StreamCore, Arc<RecordingEventSink>) {
        let events = Arc::new(RecordingEventSink::new());
        let core = StreamCore::new(
            StreamMode::Frames,
            config,
            Arc::clone(&events) as Arc<dyn EventSink>,
            hook,
        )
        .unwrap();
        (core, events)
    }

    #[test]
    fn test_shared_stream_lifecycle() {
        let (core, events) = core_with(&config(1, None), None);
        let process = FakeProcess::new();
        let launches = AtomicUsize::new(0);
        let launch = || {
            launches.fetch_add(1, Ordering::SeqCst);
            Ok(handle(&process))
        };

        assert_eq!(core.start("cam1", launch).unwrap(), StartOutcome::Started);
        assert_eq!(
            core.start("cam1", || Ok(handle(&process))).unwrap(),
            StartOutcome::Joined { consumers: 2 }
        );
        assert_eq!(launches.load(Ordering::SeqCst), 1);

        assert_eq!(
            core.stop("cam1").unwrap(),
            StopOutcome::StillShared { consumers: 1 }
        );
        assert_eq!(process.terminations(), 0);
        assert_eq!(core.stop("cam1").unwrap(), StopOutcome::Stopped);
        assert_eq!(process.terminations(), 1);
        assert!(matches!(core.stop("cam1"), Err(StreamError::NotStreaming(_))));

        assert_eq!(events.count(STREAM_STARTED_EVENT), 1);
        assert_eq!(events.count(STREAM_STOPPED_EVENT), 1);
    }

    #[test]
    fn test_inactive_stream_emits_one_stop_event() {
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook: TeardownHook = {
            let hook_calls = Arc::clone(&hook_calls);
            Arc::new(move |_: &str| {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let (core, events) = core_with(&config(1, Some(Duration::from_millis(100))), Some(hook));
        let process = FakeProcess::new();
        core.start("cam1", || Ok(handle(&process))).unwrap();

        let start = Instant::now();
        while core.is_streaming("cam1") && start.elapsed() < Duration::from_secs(3) {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(100));

        assert!(!core.is_streaming("cam1"));
        assert_eq!(events.count(STREAM_STOPPED_EVENT), 1);
        assert_eq!(events.events()[1].1["reason"], "inactive");
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(core.stop("cam1"), Err(StreamError::NotStreaming(_))));
    }

    #[test]
    fn test_stop_racing_sweep_tears_down_once() {
        let mut config = config(1, Some(Duration::from_millis(100)));
        config.sweep_period = Duration::from_secs(3600);
        let (core, events) = core_with(&config, None);

        for round in 0..20 {
            let process = FakeProcess::new();
            core.start("cam1", || Ok(handle(&process))).unwrap();
            core.registry.backdate("cam1", Duration::from_secs(60));

            let barrier = Barrier::new(2);
            let (swept, stopped) = thread::scope(|scope| {
                let sweeper = scope.spawn(|| {
                    barrier.wait();
                    core.monitor.sweep_now()
                });
                let stopper = scope.spawn(|| {
                    barrier.wait();
                    core.stop("cam1")
                });
                (sweeper.join().unwrap(), stopper.join().unwrap())
            });

            match stopped {
                Ok(StopOutcome::Stopped) => assert_eq!(swept, 0),
                Err(StreamError::NotStreaming(_)) => assert_eq!(swept, 1),
                other => panic!("unexpected stop result {other:?}"),
            }
            assert_eq!(process.terminations(), 1);
            assert_eq!(events.count(STREAM_STOPPED_EVENT), round + 1);
            assert!(!core.is_streaming("cam1"));
            assert!(core.can_admit());
        }
    }

    #[test]
    fn test_restart_waits_for_teardown_hook() {
        let hook_running = Arc::new(AtomicBool::new(false));
        let hook: TeardownHook = {
            let hook_running = Arc::clone(&hook_running);
            Arc::new(move |_: &str| {
                hook_running.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(300));
                hook_running.store(false, Ordering::SeqCst);
            })
        };
        let (core, events) = core_with(&config(1, None), Some(hook));
        let first = FakeProcess::new();
        core.start("cam1", || Ok(handle(&first))).unwrap();

        thread::scope(|scope| {
            let stopper = scope.spawn(|| core.stop("cam1"));
            while !hook_running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }

            let second = FakeProcess::new();
            let outcome = core.start("cam1", || {
                assert!(!hook_running.load(Ordering::SeqCst));
                Ok(handle(&second))
            });
            assert_eq!(outcome.unwrap(), StartOutcome::Started);
            assert_eq!(stopper.join().unwrap().unwrap(), StopOutcome::Stopped);
        });

        assert!(core.is_streaming("cam1"));
        assert_eq!(first.terminations(), 1);
        let names: Vec<String> = events.events().into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec![STREAM_STARTED_EVENT, STREAM_STOPPED_EVENT, STREAM_STARTED_EVENT]
        );
    }

    #[test]
    fn test_outcomes_serialize_with_state_tag() {
        assert_eq!(
            serde_json::to_value(StartOutcome::Joined { consumers: 2 }).unwrap(),
            serde_json::json!({ "state": "joined", "consumers": 2 })
        );
        assert_eq!(
            serde_json::to_value(StopOutcome::Stopped).unwrap(),
            serde_json::json!({ "state": "stopped" })
        );
    }

    #[test]
    fn test_keep_alive_requires_running_stream() {
        let (core, _) = core_with(&config(1, None), None);
        assert!(matches!(core.keep_alive("cam1"), Err(StreamError::NotStreaming(_))));
        assert!(matches!(core.add_consumer("cam1"), Err(StreamError::NotStreaming(_))));

        let process = FakeProcess::new();
        core.start("cam1", || Ok(handle(&process))).unwrap();
        assert!(core.keep_alive("cam1").is_ok());
        assert_eq!(core.add_consumer("cam1").unwrap(), 2);
    }

    #[test]
    fn test_failed_launch_emits_nothing() {
        let (core, events) = core_with(&config(1, None), None);
        let result = core.start("cam1", || Err(StreamError::RetriesExhausted { attempts: 20 }));
        assert!(matches!(result, Err(StreamError::RetriesExhausted { .. })));
        assert!(events.events().is_empty());
        assert!(core.can_admit());
    }

    #[test]
    fn test_shutdown_stops_everything_and_refuses_starts() {
        let (core, events) = core_with(&config(2, None), None);
        let first = FakeProcess::new();
        let second = FakeProcess::new();
        core.start("cam1", || Ok(handle(&first))).unwrap();
        core.start("cam2", || Ok(handle(&second))).unwrap();

        core.shutdown();
        assert_eq!(first.terminations(), 1);
        assert_eq!(second.terminations(), 1);
        assert_eq!(events.count(STREAM_STOPPED_EVENT), 2);
        assert!(core.active_sessions().is_empty());

        let third = FakeProcess::new();
        assert!(matches!(
            core.start("cam3", || Ok(handle(&third))),
            Err(StreamError::ShuttingDown)
        ));
    }
}
