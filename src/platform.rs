use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::events::{WakeEvent, WakeSender};
use crate::models::{ReminderKey, Timestamp};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Exact,
    Inexact,
}

/// One-shot wake request. Registering a key that is already registered
/// replaces the earlier request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Registration {
    pub key: ReminderKey,
    pub at: Timestamp,
    pub precision: Precision,
    pub payload: WakeEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("exact wakes are not permitted and inexact fallback is disabled")]
    ExactDenied,
    #[error("timer facility unavailable: {0}")]
    Unavailable(String),
}

/// The OS timer facility.
pub trait AlarmPlatform: Send + Sync {
    /// Whether exact wakes are currently permitted. May change at any time.
    fn can_schedule_exact(&self) -> bool;
    fn register(&self, registration: Registration) -> Result<(), PlatformError>;
    /// Returns whether something was registered under `key`.
    fn cancel(&self, key: ReminderKey) -> bool;
    fn registrations(&self) -> Vec<Registration>;
}

/// Registrations held in memory and fired by hand. Simulates the OS facility,
/// including a revocable exact-wake permission and losing everything on
/// restart.
#[derive(Debug)]
pub struct ManualAlarmPlatform {
    exact_allowed: AtomicBool,
    entries: Mutex<BTreeMap<ReminderKey, Registration>>,
}

impl Default for ManualAlarmPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualAlarmPlatform {
    pub fn new() -> Self {
        Self {
            exact_allowed: AtomicBool::new(true),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_exact_allowed(&self, allowed: bool) {
        self.exact_allowed.store(allowed, Ordering::SeqCst);
    }

    /// Drops every registration, like a device reboot does.
    pub fn reset(&self) {
        self.entries.lock().expect("alarm platform poisoned").clear();
    }

    pub fn get(&self, key: ReminderKey) -> Option<Registration> {
        let guard = self.entries.lock().expect("alarm platform poisoned");
        guard.get(&key).cloned()
    }

    /// Removes and returns every registration due at `now`, earliest first.
    pub fn fire_due(&self, now: Timestamp) -> Vec<WakeEvent> {
        let mut guard = self.entries.lock().expect("alarm platform poisoned");
        let mut due: Vec<Registration> = guard.values().filter(|r| r.at <= now).cloned().collect();
        due.sort_by_key(|r| (r.at, r.key));
        for registration in &due {
            guard.remove(&registration.key);
        }
        due.into_iter().map(|r| r.payload).collect()
    }
}

impl AlarmPlatform for ManualAlarmPlatform {
    fn can_schedule_exact(&self) -> bool {
        self.exact_allowed.load(Ordering::SeqCst)
    }

    fn register(&self, registration: Registration) -> Result<(), PlatformError> {
        if registration.precision == Precision::Exact && !self.can_schedule_exact() {
            return Err(PlatformError::ExactDenied);
        }
        let mut guard = self.entries.lock().expect("alarm platform poisoned");
        guard.insert(registration.key, registration);
        Ok(())
    }

    fn cancel(&self, key: ReminderKey) -> bool {
        let mut guard = self.entries.lock().expect("alarm platform poisoned");
        guard.remove(&key).is_some()
    }

    fn registrations(&self) -> Vec<Registration> {
        let guard = self.entries.lock().expect("alarm platform poisoned");
        guard.values().cloned().collect()
    }
}

/// Inexact wakes may land this much later than requested.
const INEXACT_SLACK: Duration = Duration::from_secs(30);

struct TimerEntry {
    registration: Registration,
    generation: u64,
    handle: JoinHandle<()>,
}

/// In-process timer facility: one tokio sleep per registration, delivering
/// the payload on the wake channel when it elapses.
pub struct TokioAlarmPlatform {
    runtime: Handle,
    clock: Arc<dyn Clock>,
    wakes: WakeSender,
    exact_allowed: AtomicBool,
    generation: AtomicU64,
    entries: Arc<Mutex<BTreeMap<ReminderKey, TimerEntry>>>,
}

impl TokioAlarmPlatform {
    pub fn new(runtime: Handle, clock: Arc<dyn Clock>, wakes: WakeSender) -> Self {
        Self {
            runtime,
            clock,
            wakes,
            exact_allowed: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn set_exact_allowed(&self, allowed: bool) {
        self.exact_allowed.store(allowed, Ordering::SeqCst);
    }
}

impl AlarmPlatform for TokioAlarmPlatform {
    fn can_schedule_exact(&self) -> bool {
        self.exact_allowed.load(Ordering::SeqCst)
    }

    fn register(&self, registration: Registration) -> Result<(), PlatformError> {
        if registration.precision == Precision::Exact && !self.can_schedule_exact() {
            return Err(PlatformError::ExactDenied);
        }
        if self.wakes.is_closed() {
            return Err(PlatformError::Unavailable("wake channel closed".to_string()));
        }
        let remaining = registration.at.saturating_sub(self.clock.now()).max(0);
        let mut delay = Duration::from_millis(remaining as u64);
        if registration.precision == Precision::Inexact {
            delay += INEXACT_SLACK;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let key = registration.key;
        let payload = registration.payload;
        let entries = Arc::clone(&self.entries);
        let wakes = self.wakes.clone();

        let mut guard = self.entries.lock().expect("alarm platform poisoned");
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut guard = entries.lock().expect("alarm platform poisoned");
                // A replacement registered meanwhile owns the key now.
                if guard.get(&key).map(|entry| entry.generation) != Some(generation) {
                    return;
                }
                guard.remove(&key);
            }
            if wakes.send(payload).is_err() {
                log::warn!("alarm: wake channel closed, dropping reminder={key}");
            }
        });
        if let Some(previous) = guard.insert(
            key,
            TimerEntry {
                registration,
                generation,
                handle,
            },
        ) {
            previous.handle.abort();
        }
        Ok(())
    }

    fn cancel(&self, key: ReminderKey) -> bool {
        let mut guard = self.entries.lock().expect("alarm platform poisoned");
        match guard.remove(&key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    fn registrations(&self) -> Vec<Registration> {
        let guard = self.entries.lock().expect("alarm platform poisoned");
        guard
            .values()
            .map(|entry| entry.registration.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::events::wake_channel;

    fn make_registration(reminder_id: i64, at: Timestamp, precision: Precision) -> Registration {
        Registration {
            key: ReminderKey::new(1, reminder_id),
            at,
            precision,
            payload: WakeEvent {
                reminder_id,
                task_id: 42,
                user_id: 1,
            },
        }
    }

    #[test]
    fn manual_platform_rejects_exact_when_denied_but_accepts_inexact() {
        let platform = ManualAlarmPlatform::new();
        platform.set_exact_allowed(false);
        assert!(!platform.can_schedule_exact());
        assert!(matches!(
            platform.register(make_registration(1, 100, Precision::Exact)),
            Err(PlatformError::ExactDenied)
        ));
        platform
            .register(make_registration(1, 100, Precision::Inexact))
            .unwrap();
        assert_eq!(platform.registrations().len(), 1);
    }

    #[test]
    fn manual_platform_replaces_fires_and_cancels() {
        let platform = ManualAlarmPlatform::new();
        platform.register(make_registration(1, 100, Precision::Exact)).unwrap();
        platform.register(make_registration(1, 300, Precision::Exact)).unwrap();
        platform.register(make_registration(2, 200, Precision::Exact)).unwrap();
        assert_eq!(platform.get(ReminderKey::new(1, 1)).unwrap().at, 300);

        let fired = platform.fire_due(250);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reminder_id, 2);
        // One-shot.
        assert!(platform.fire_due(250).is_empty());

        assert!(platform.cancel(ReminderKey::new(1, 1)));
        assert!(!platform.cancel(ReminderKey::new(1, 1)));
        assert!(platform.registrations().is_empty());

        platform.register(make_registration(3, 1, Precision::Exact)).unwrap();
        platform.reset();
        assert!(platform.registrations().is_empty());
    }

    #[tokio::test]
    async fn tokio_platform_delivers_payload_when_timer_elapses() {
        let clock = Arc::new(FixedClock::new(1_000));
        let (tx, mut rx) = wake_channel();
        let platform = TokioAlarmPlatform::new(Handle::current(), clock, tx);

        platform.register(make_registration(1, 1_020, Precision::Exact)).unwrap();
        assert_eq!(platform.registrations().len(), 1);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("wake should arrive")
            .expect("channel open");
        assert_eq!(event.reminder_id, 1);
        tokio::task::yield_now().await;
        assert!(platform.registrations().is_empty());
    }

    #[tokio::test]
    async fn tokio_platform_cancel_and_replace_suppress_old_timers() {
        let clock = Arc::new(FixedClock::new(0));
        let (tx, mut rx) = wake_channel();
        let platform = TokioAlarmPlatform::new(Handle::current(), clock, tx);

        platform.register(make_registration(1, 10, Precision::Exact)).unwrap();
        assert!(platform.cancel(ReminderKey::new(1, 1)));
        assert!(!platform.cancel(ReminderKey::new(1, 1)));

        platform.register(make_registration(2, 10, Precision::Exact)).unwrap();
        let mut replacement = make_registration(2, 40, Precision::Exact);
        replacement.payload.task_id = 43;
        platform.register(replacement).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("wake should arrive")
            .expect("channel open");
        assert_eq!((event.reminder_id, event.task_id), (2, 43));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tokio_platform_refuses_exact_when_denied() {
        let clock = Arc::new(FixedClock::new(0));
        let (tx, _rx) = wake_channel();
        let platform = TokioAlarmPlatform::new(Handle::current(), clock, tx);
        platform.set_exact_allowed(false);
        assert!(matches!(
            platform.register(make_registration(1, 10, Precision::Exact)),
            Err(PlatformError::ExactDenied)
        ));
        platform
            .register(make_registration(1, 10, Precision::Inexact))
            .unwrap();
        assert_eq!(platform.registrations()[0].precision, Precision::Inexact);
    }

    #[tokio::test]
    async fn tokio_platform_clamps_extreme_fire_times() {
        let clock = Arc::new(FixedClock::new(i64::MIN + 1));
        let (tx, mut rx) = wake_channel();
        let platform = TokioAlarmPlatform::new(Handle::current(), clock.clone(), tx);

        platform.register(make_registration(1, i64::MAX, Precision::Exact)).unwrap();
        clock.set(1_000);
        platform.register(make_registration(2, i64::MIN, Precision::Exact)).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("past wake should fire at once")
            .expect("channel open");
        assert_eq!(event.reminder_id, 2);
        assert_eq!(platform.registrations().len(), 1);
    }
}
