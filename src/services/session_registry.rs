// Session Registry
// Tracks the single running process per device, its consumers and last activity.
//
// Every device owns a gate (mutex) that serializes start/stop/keepalive for that
// device only. The global ceiling is enforced with a compare-and-swap reservation
// taken while the gate is held, so concurrent starts never exceed the maximum and
// unrelated devices never wait on each other.
//
// A session leaving the registry becomes a `RetiredSession`. Until it is dropped
// the device is marked as stopping: new starts for that device wait, and its
// capacity slot stays taken.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::{StreamError, StreamResult};

/// Something a session keeps running and must be able to stop
pub trait Supervised: Send + Sync {
    /// Non-blocking liveness check
    fn is_alive(&self) -> bool;

    /// Stop everything the session owns. Must be idempotent.
    fn terminate(&self);
}

/// What a stop request does when other consumers still use the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopPolicy {
    /// Tear down only when the last consumer stops
    #[default]
    RefCounted,
    /// Any stop tears the stream down
    Immediate,
}

/// Why a session left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    /// Explicit stop by the last consumer
    Stopped,
    /// No keepalive within the inactivity timeout
    Inactive,
    /// The process (or its decoder) ended on its own
    Exited,
    /// Service shutdown sweep
    Shutdown,
}

/// One device's running stream
pub struct Session {
    device_id: String,
    handle: Arc<dyn Supervised>,
    consumers: usize,
    last_activity: Instant,
    started_at: Instant,
}

impl Session {
    fn new(device_id: &str, handle: Arc<dyn Supervised>) -> Self {
        let now = Instant::now();
        Self {
            device_id: device_id.to_string(),
            handle,
            consumers: 1,
            last_activity: now,
            started_at: now,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn consumers(&self) -> usize {
        self.consumers
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    /// Stop the process (and decoder) behind this session
    pub fn terminate(&self) {
        self.handle.terminate();
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            device_id: self.device_id.clone(),
            consumers: self.consumers,
            idle_secs: self.idle().as_secs(),
            uptime_secs: self.uptime().as_secs(),
            alive: self.is_alive(),
        }
    }

    #[cfg(test)]
    fn backdate(&mut self, by: Duration) {
        if let Some(earlier) = Instant::now().checked_sub(by) {
            self.last_activity = earlier;
        }
    }
}

/// Point-in-time view of a session for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub device_id: String,
    pub consumers: usize,
    pub idle_secs: u64,
    pub uptime_secs: u64,
    pub alive: bool,
}

/// Result of a register call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new session was created (the factory ran)
    Started,
    /// An existing session gained a consumer
    Joined { consumers: usize },
}

/// A session removed from the registry whose teardown is still running.
/// Dropping it reopens the device for new starts and frees its capacity slot,
/// so terminate and clean up before letting it go.
pub struct RetiredSession {
    session: Session,
    slot: Arc<DeviceSlot>,
    active: Arc<AtomicUsize>,
}

impl RetiredSession {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn device_id(&self) -> &str {
        self.session.device_id()
    }

    pub fn terminate(&self) {
        self.session.terminate();
    }
}

impl Drop for RetiredSession {
    fn drop(&mut self) {
        let mut gate = lock_gate(&self.slot);
        gate.stopping = false;
        self.active.fetch_sub(1, Ordering::SeqCst);
        drop(gate);
        self.slot.settled.notify_all();
    }
}

/// Result of a release call
pub enum Release {
    /// The session was removed; the caller owns its teardown
    Teardown(RetiredSession),
    /// Other consumers remain
    Retained { consumers: usize },
    /// No session for this device
    NotActive,
}

#[derive(Default)]
struct SlotState {
    session: Option<Session>,
    stopping: bool,
}

#[derive(Default)]
struct DeviceSlot {
    gate: Mutex<SlotState>,
    settled: Condvar,
    active: AtomicBool,
}

/// Capacity slot held while a session is being created.
/// Released on drop unless committed.
struct SlotReservation<'a> {
    active: &'a AtomicUsize,
    committed: bool,
}

impl SlotReservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Ceiling on running streams. Clones share one counter, so registries built
/// from the same capacity enforce a single limit between them.
#[derive(Debug, Clone)]
pub struct StreamCapacity {
    max: usize,
    active: Arc<AtomicUsize>,
}

impl StreamCapacity {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Running sessions, including ones still being torn down
    pub fn in_use(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Device id -> session map with a global concurrency ceiling
pub struct SessionRegistry {
    capacity: StreamCapacity,
    policy: StopPolicy,
    slots: DashMap<String, Arc<DeviceSlot>>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, policy: StopPolicy) -> Self {
        Self::with_capacity(StreamCapacity::new(max_sessions), policy)
    }

    /// Registry counting against a ceiling shared with other registries
    pub fn with_capacity(capacity: StreamCapacity, policy: StopPolicy) -> Self {
        Self {
            capacity,
            policy,
            slots: DashMap::new(),
        }
    }

    /// Number of sessions counted against the ceiling
    pub fn active_count(&self) -> usize {
        self.capacity.in_use()
    }

    /// True if another session would fit under the ceiling right now
    pub fn can_admit(&self) -> bool {
        self.active_count() < self.capacity.max
    }

    /// Non-blocking: a start still in progress counts as not active
    pub fn is_active(&self, device_id: &str) -> bool {
        self.existing_slot(device_id)
            .map(|slot| slot.active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Add a consumer to a running session
    pub fn increment_consumers(&self, device_id: &str) -> StreamResult<usize> {
        let slot = self
            .existing_slot(device_id)
            .ok_or_else(|| StreamError::NotStreaming(device_id.to_string()))?;
        let mut gate = lock_gate(&slot);
        match gate.session.as_mut() {
            Some(session) => {
                session.consumers += 1;
                session.touch();
                Ok(session.consumers)
            }
            None => Err(StreamError::NotStreaming(device_id.to_string())),
        }
    }

    /// Join the device's session, or admit and create one with `factory`.
    ///
    /// Calls for the same device are serialized: a second start waits for the
    /// first to finish and then joins it, and a start behind a running teardown
    /// waits for it. `factory` runs at most once per new session, with a capacity
    /// slot already reserved; if it fails the slot is released and nothing is
    /// recorded.
    pub fn register<F>(&self, device_id: &str, factory: F) -> StreamResult<Registration>
    where
        F: FnOnce() -> StreamResult<Arc<dyn Supervised>>,
    {
        let slot = self.slot(device_id);
        let mut gate = wait_settled(&slot, lock_gate(&slot));

        if let Some(session) = gate.session.as_mut() {
            session.consumers += 1;
            session.touch();
            log::info!(
                "[Stream:{}] Already streaming, consumers now {}",
                device_id,
                session.consumers
            );
            return Ok(Registration::Joined {
                consumers: session.consumers,
            });
        }

        let reservation = self.reserve(device_id)?;
        let handle = factory()?;

        gate.session = Some(Session::new(device_id, handle));
        slot.active.store(true, Ordering::SeqCst);
        reservation.commit();
        Ok(Registration::Started)
    }

    /// Drop one consumer. Removes the session when the policy says so.
    pub fn release(&self, device_id: &str) -> Release {
        let Some(slot) = self.existing_slot(device_id) else {
            return Release::NotActive;
        };
        let mut gate = lock_gate(&slot);

        let remaining = match gate.session.as_mut() {
            None => return Release::NotActive,
            Some(session) => match self.policy {
                StopPolicy::RefCounted => {
                    session.consumers = session.consumers.saturating_sub(1);
                    session.consumers
                }
                StopPolicy::Immediate => 0,
            },
        };

        if remaining > 0 {
            return Release::Retained {
                consumers: remaining,
            };
        }

        match self.take_locked(&slot, &mut gate) {
            Some(session) => Release::Teardown(session),
            None => Release::NotActive,
        }
    }

    /// Refresh the session's activity timestamp. False if not active.
    pub fn touch(&self, device_id: &str) -> bool {
        let Some(slot) = self.existing_slot(device_id) else {
            return false;
        };
        let mut gate = lock_gate(&slot);
        match gate.session.as_mut() {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Snapshot of registered sessions, sorted by device id.
    /// Devices busy in a start or stop are skipped rather than waited for.
    pub fn snapshot_active(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .all_slots()
            .iter()
            .filter_map(|slot| {
                let gate = try_lock_gate(slot)?;
                gate.session.as_ref().map(Session::info)
            })
            .collect();
        infos.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        infos
    }

    /// Remove every session for which `decide` returns a reason.
    /// Busy devices are skipped until the next call.
    pub fn evict_where<P>(&self, mut decide: P) -> Vec<(RetiredSession, StopReason)>
    where
        P: FnMut(&Session) -> Option<StopReason>,
    {
        let mut evicted = Vec::new();
        for slot in self.all_slots() {
            let Some(mut gate) = try_lock_gate(&slot) else {
                continue;
            };
            let reason = match gate.session.as_ref() {
                Some(session) => decide(session),
                None => None,
            };
            if let Some(reason) = reason {
                if let Some(session) = self.take_locked(&slot, &mut gate) {
                    evicted.push((session, reason));
                }
            }
        }
        evicted
    }

    /// Remove all sessions, waiting for in-flight starts and teardowns to finish
    pub fn drain(&self) -> Vec<RetiredSession> {
        let mut drained = Vec::new();
        for slot in self.all_slots() {
            let mut gate = wait_settled(&slot, lock_gate(&slot));
            if let Some(session) = self.take_locked(&slot, &mut gate) {
                drained.push(session);
            }
        }
        drained
    }

    fn reserve(&self, device_id: &str) -> StreamResult<SlotReservation<'_>> {
        let max = self.capacity.max;
        let mut current = self.capacity.active.load(Ordering::SeqCst);
        loop {
            if current >= max {
                log::warn!(
                    "[Stream:{}] Rejected: {} of {} parallel streams in use",
                    device_id,
                    current,
                    max
                );
                return Err(StreamError::CapacityExceeded {
                    device_id: device_id.to_string(),
                    max,
                });
            }
            match self.capacity.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Ok(SlotReservation {
                        active: self.capacity.active.as_ref(),
                        committed: false,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn take_locked(&self, slot: &Arc<DeviceSlot>, gate: &mut SlotState) -> Option<RetiredSession> {
        let session = gate.session.take()?;
        gate.stopping = true;
        slot.active.store(false, Ordering::SeqCst);
        Some(RetiredSession {
            session,
            slot: Arc::clone(slot),
            active: Arc::clone(&self.capacity.active),
        })
    }

    fn slot(&self, device_id: &str) -> Arc<DeviceSlot> {
        Arc::clone(
            self.slots
                .entry(device_id.to_string())
                .or_default()
                .value(),
        )
    }

    fn existing_slot(&self, device_id: &str) -> Option<Arc<DeviceSlot>> {
        self.slots.get(device_id).map(|slot| Arc::clone(slot.value()))
    }

    fn all_slots(&self) -> Vec<Arc<DeviceSlot>> {
        self.slots.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, device_id: &str, by: Duration) {
        if let Some(slot) = self.existing_slot(device_id) {
            if let Some(session) = lock_gate(&slot).session.as_mut() {
                session.backdate(by);
            }
        }
    }
}

fn lock_gate(slot: &DeviceSlot) -> MutexGuard<'_, SlotState> {
    slot.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Block until no teardown is running for the slot
fn wait_settled<'a>(
    slot: &'a DeviceSlot,
    mut gate: MutexGuard<'a, SlotState>,
) -> MutexGuard<'a, SlotState> {
    while gate.stopping {
        gate = slot
            .settled
            .wait(gate)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
    gate
}

fn try_lock_gate(slot: &DeviceSlot) -> Option<MutexGuard<'_, SlotState>> {
    match slot.gate.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn register_fake(registry: &SessionRegistry, device_id: &str) -> StreamResult<Registration> {
        let process = FakeProcess::new();
        registry.register(device_id, || Ok(handle(&process)))
    }

    #[test]
    fn test_capacity_scenario() {
        let registry = SessionRegistry::new(1, StopPolicy::RefCounted);

        assert_eq!(register_fake(&registry, "cam1").unwrap(), Registration::Started);
        assert!(!registry.can_admit());

        let err = register_fake(&registry, "cam2").unwrap_err();
        assert!(matches!(err, StreamError::CapacityExceeded { max: 1, .. }));
        assert!(!registry.is_active("cam2"));

        assert!(matches!(registry.release("cam1"), Release::Teardown(_)));
        assert!(registry.can_admit());

        assert_eq!(register_fake(&registry, "cam2").unwrap(), Registration::Started);
        assert!(registry.is_active("cam2"));
    }

    #[test]
    fn test_second_start_joins_without_factory() {
        let registry = SessionRegistry::new(2, StopPolicy::RefCounted);
        let spawns = AtomicUsize::new(0);
        let process = FakeProcess::new();

        for _ in 0..3 {
            registry
                .register("cam1", || {
                    spawns.fetch_add(1, Ordering::SeqCst);
                    Ok(handle(&process))
                })
                .unwrap();
        }

        assert_eq!(spawns.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.snapshot_active()[0].consumers, 3);
    }

    #[test]
    fn test_ref_counted_release() {
        let registry = SessionRegistry::new(1, StopPolicy::RefCounted);
        register_fake(&registry, "cam1").unwrap();
        assert_eq!(registry.increment_consumers("cam1").unwrap(), 2);

        assert!(matches!(
            registry.release("cam1"),
            Release::Retained { consumers: 1 }
        ));
        assert!(registry.is_active("cam1"));

        match registry.release("cam1") {
            Release::Teardown(session) => assert_eq!(session.device_id(), "cam1"),
            _ => panic!("expected teardown"),
        }
        assert!(!registry.is_active("cam1"));
        assert!(matches!(registry.release("cam1"), Release::NotActive));
    }

    #[test]
    fn test_immediate_policy_ignores_consumers() {
        let registry = SessionRegistry::new(1, StopPolicy::Immediate);
        register_fake(&registry, "cam1").unwrap();
        register_fake(&registry, "cam1").unwrap();

        assert!(matches!(registry.release("cam1"), Release::Teardown(_)));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_failed_factory_leaves_no_trace() {
        let registry = SessionRegistry::new(1, StopPolicy::RefCounted);
        let result = registry.register("cam1", || Err(StreamError::RetriesExhausted { attempts: 3 }));

        assert!(matches!(result, Err(StreamError::RetriesExhausted { .. })));
        assert!(!registry.is_active("cam1"));
        assert_eq!(registry.active_count(), 0);
        assert!(registry.snapshot_active().is_empty());
        assert_eq!(register_fake(&registry, "cam2").unwrap(), Registration::Started);
    }

    #[test]
    fn test_unknown_device_operations() {
        let registry = SessionRegistry::new(1, StopPolicy::RefCounted);
        assert!(matches!(
            registry.increment_consumers("ghost"),
            Err(StreamError::NotStreaming(_))
        ));
        assert!(!registry.touch("ghost"));
        assert!(matches!(registry.release("ghost"), Release::NotActive));
    }

    #[test]
    fn test_concurrent_starts_respect_ceiling() {
        let registry = Arc::new(SessionRegistry::new(3, StopPolicy::RefCounted));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let process = FakeProcess::new();
                    registry.register(&format!("cam{i}"), || {
                        thread::sleep(Duration::from_millis(20));
                        Ok(handle(&process))
                    })
                })
            })
            .collect();

        let started = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();

        assert_eq!(started, 3);
        assert_eq!(registry.active_count(), 3);
        assert_eq!(registry.snapshot_active().len(), 3);
    }

    #[test]
    fn test_concurrent_same_device_starts_spawn_once() {
        let registry = Arc::new(SessionRegistry::new(1, StopPolicy::RefCounted));
        let spawns = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let spawns = Arc::clone(&spawns);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let process = FakeProcess::new();
                    registry.register("cam1", || {
                        spawns.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(30));
                        Ok(handle(&process))
                    })
                })
            })
            .collect();

        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }
        assert_eq!(spawns.load(Ordering::SeqCst), 1);
        assert_eq!(registry.snapshot_active()[0].consumers, 6);
    }

    #[test]
    fn test_evict_where_removes_once() {
        let registry = SessionRegistry::new(3, StopPolicy::RefCounted);
        register_fake(&registry, "cam1").unwrap();
        register_fake(&registry, "cam2").unwrap();
        registry.backdate("cam1", Duration::from_secs(60));

        let timeout = Duration::from_secs(8);
        let evict = |s: &Session| (s.idle() >= timeout).then_some(StopReason::Inactive);

        let evicted = registry.evict_where(evict);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0.device_id(), "cam1");
        assert_eq!(evicted[0].1, StopReason::Inactive);

        assert!(registry.evict_where(evict).is_empty());
        assert!(registry.is_active("cam2"));
        assert_eq!(registry.active_count(), 2);
        drop(evicted);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_touch_resets_idle_time() {
        let registry = SessionRegistry::new(1, StopPolicy::RefCounted);
        register_fake(&registry, "cam1").unwrap();
        registry.backdate("cam1", Duration::from_secs(60));
        assert!(registry.snapshot_active()[0].idle_secs >= 60);

        assert!(registry.touch("cam1"));
        assert!(registry.snapshot_active()[0].idle_secs < 60);
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = SessionRegistry::new(2, StopPolicy::RefCounted);
        register_fake(&registry, "cam1").unwrap();
        register_fake(&registry, "cam2").unwrap();

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        drop(drained);
        assert_eq!(registry.active_count(), 0);
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn test_start_waits_for_running_teardown() {
        let registry = Arc::new(SessionRegistry::new(1, StopPolicy::RefCounted));
        register_fake(&registry, "cam1").unwrap();

        let retired = match registry.release("cam1") {
            Release::Teardown(retired) => retired,
            _ => panic!("expected teardown"),
        };
        assert!(!registry.is_active("cam1"));
        assert!(!registry.can_admit());

        let restart = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || register_fake(&registry, "cam1"))
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!restart.is_finished());
        assert!(!registry.is_active("cam1"));

        retired.terminate();
        drop(retired);
        assert_eq!(restart.join().unwrap().unwrap(), Registration::Started);
        assert!(registry.is_active("cam1"));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_other_devices_do_not_wait_for_teardown() {
        let registry = SessionRegistry::new(2, StopPolicy::RefCounted);
        register_fake(&registry, "cam1").unwrap();
        let Release::Teardown(retired) = registry.release("cam1") else {
            panic!("expected teardown");
        };

        assert_eq!(register_fake(&registry, "cam2").unwrap(), Registration::Started);
        assert!(matches!(
            register_fake(&registry, "cam3"),
            Err(StreamError::CapacityExceeded { max: 2, .. })
        ));
        drop(retired);
        assert_eq!(register_fake(&registry, "cam3").unwrap(), Registration::Started);
    }

    #[test]
    fn test_shared_capacity_spans_registries() {
        let capacity = StreamCapacity::new(1);
        let frames = SessionRegistry::with_capacity(capacity.clone(), StopPolicy::RefCounted);
        let segments = SessionRegistry::with_capacity(capacity.clone(), StopPolicy::RefCounted);

        register_fake(&frames, "cam1").unwrap();
        assert!(!segments.can_admit());
        assert!(matches!(
            register_fake(&segments, "cam2"),
            Err(StreamError::CapacityExceeded { max: 1, .. })
        ));

        assert!(matches!(frames.release("cam1"), Release::Teardown(_)));
        assert_eq!(capacity.in_use(), 0);
        assert_eq!(register_fake(&segments, "cam2").unwrap(), Registration::Started);
    }
}
