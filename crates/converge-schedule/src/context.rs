use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::enumerate::Schedule;

/// Identity-derived key for schedule-local state.
///
/// Keys are composed from entity ids (a peer, a stream, or a peer/stream
/// pair) plus a static role name. They are never derived from value
/// equality, so two distinct entities with equal contents stay distinct.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StateKey {
    owner: u64,
    partner: u64,
    role: &'static str,
}

impl StateKey {
    /// A key owned by a single entity.
    pub fn scoped(owner: u64, role: &'static str) -> Self {
        Self {
            owner,
            partner: 0,
            role,
        }
    }

    /// A key owned by a pair of entities, e.g. a peer's view of a stream.
    pub fn paired(owner: u64, partner: u64, role: &'static str) -> Self {
        Self {
            owner,
            partner,
            role,
        }
    }
}

/// Mutable state owned by one schedule run.
///
/// Created when the executor starts a schedule and dropped after
/// finalisation. Contexts are never shared across schedules; that
/// isolation is what makes running schedules in parallel safe even though
/// each one spawns its own external processes.
pub struct ScheduleContext {
    schedule: Schedule,
    state: Mutex<HashMap<StateKey, Box<dyn Any + Send>>>,
}

impl ScheduleContext {
    pub fn new(schedule: Schedule) -> Arc<Self> {
        Arc::new(Self {
            schedule,
            state: Mutex::new(HashMap::new()),
        })
    }

    /// The schedule this context belongs to, for schedule-dependent
    /// expectation predicates and diagnostics.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn store<T: Send + 'static>(&self, key: StateKey, value: T) {
        self.state.lock().insert(key, Box::new(value));
    }

    /// Fetch a clone of the value under `key`. A missing key and a value
    /// of a different type both read as absent.
    pub fn get<T: Send + Clone + 'static>(&self, key: StateKey) -> Option<T> {
        self.state
            .lock()
            .get(&key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Remove and return the value under `key`, e.g. to perform async work
    /// on it before storing it back.
    pub fn take<T: Send + 'static>(&self, key: StateKey) -> Option<T> {
        let mut state = self.state.lock();
        match state.get(&key) {
            Some(v) if v.is::<T>() => {}
            _ => return None,
        }
        state
            .remove(&key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    /// Run `f` against the value under `key` in place.
    pub fn with_mut<T: Send + 'static, R>(
        &self,
        key: StateKey,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        self.state
            .lock()
            .get_mut(&key)
            .and_then(|v| v.downcast_mut::<T>())
            .map(f)
    }
}
