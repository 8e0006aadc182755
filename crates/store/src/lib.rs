//! evq store: a compressing FIFO of watch events sitting between a reflector and a controller loop.
//!
//! Producers report `add`/`update`/`delete` per object, or `replace`/`resync`
//! for the whole set. Events for the same key are merged in place while the
//! key waits in the queue, so the consumer only learns whether the object
//! still exists and what its latest state is. Keys leave the queue in the
//! order they first entered it.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use evq_core::{EventType, KeyError, KeyFunc};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, trace};

pub mod compress;

pub use compress::{resolve, Effect};

/// Compressing event queue keyed by a caller-supplied [`KeyFunc`].
///
/// Store, pending events and key order live behind one mutex; every public
/// method is atomic with respect to the others. [`pop`](Self::pop) blocks on
/// a condition variable until a key is queued or the queue is cancelled.
pub struct EventQueue<T, F> {
    key_fn: F,
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

struct QueueState<T> {
    /// Last observed object per key.
    store: FxHashMap<String, T>,
    /// Pending event per queued key.
    events: FxHashMap<String, EventType>,
    /// Queued keys, each at most once.
    queue: VecDeque<String>,
    relist: RelistState,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct RelistState {
    /// Last key enqueued by the most recent replace, until it is popped.
    last_key: Option<String>,
    count: usize,
    version: Option<String>,
    listed: bool,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            store: FxHashMap::default(),
            events: FxHashMap::default(),
            queue: VecDeque::new(),
            relist: RelistState::default(),
            cancelled: false,
        }
    }

    fn enqueue(&mut self, key: String, kind: EventType) {
        self.events.insert(key.clone(), kind);
        self.queue.push_back(key);
        counter!("event_queue_enqueued_total", 1u64, "type" => kind.as_str());
    }

    fn forget(&mut self, key: &str) {
        self.events.remove(key);
        self.store.remove(key);
        if let Some(pos) = self.queue.iter().position(|k| k == key) {
            self.queue.remove(pos);
        }
    }
}

impl<T: Clone> QueueState<T> {
    fn take_front(&mut self) -> Option<(String, EventType, T)> {
        let key = self.queue.pop_front()?;
        let kind = match self.events.remove(&key) {
            Some(kind) => kind,
            None => panic!("queued key {} has no pending event", key),
        };
        let obj = match kind {
            EventType::Deleted => self.store.remove(&key),
            _ => self.store.get(&key).cloned(),
        };
        let Some(obj) = obj else {
            panic!("queued key {} missing from store", key);
        };
        if self.relist.last_key.as_deref() == Some(key.as_str()) {
            self.relist.last_key = None;
        }
        Some((key, kind, obj))
    }
}

impl<T, F> std::fmt::Debug for EventQueue<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("event queue lock poisoned");
        f.debug_struct("EventQueue")
            .field("queued", &state.queue.len())
            .field("stored", &state.store.len())
            .field("cancelled", &state.cancelled)
            .finish_non_exhaustive()
    }
}

impl<T: Clone, F: KeyFunc<T>> EventQueue<T, F> {
    pub fn new(key_fn: F) -> Self {
        Self { key_fn, state: Mutex::new(QueueState::new()), ready: Condvar::new() }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().expect("event queue lock poisoned")
    }

    pub fn add(&self, obj: T) -> Result<(), KeyError> {
        self.handle(obj, EventType::Added)
    }

    pub fn update(&self, obj: T) -> Result<(), KeyError> {
        self.handle(obj, EventType::Modified)
    }

    pub fn delete(&self, obj: T) -> Result<(), KeyError> {
        self.handle(obj, EventType::Deleted)
    }

    fn handle(&self, obj: T, incoming: EventType) -> Result<(), KeyError> {
        let key = self.key_fn.key_of(&obj)?;
        let mut state = self.lock();
        let effect = resolve(state.events.get(&key).copied(), incoming);
        trace!(key = %key, %incoming, ?effect, "watch event");
        let enqueued = match effect {
            Effect::Add(kind) => {
                match kind {
                    // keep the last known payload so the deletion can carry it
                    EventType::Deleted => {
                        state.store.entry(key.clone()).or_insert(obj);
                    }
                    _ => {
                        state.store.insert(key.clone(), obj);
                    }
                }
                state.enqueue(key, kind);
                true
            }
            Effect::Compress(kind) => {
                if kind != EventType::Deleted {
                    state.store.insert(key.clone(), obj);
                }
                state.events.insert(key, kind);
                counter!("event_queue_compressed_total", 1u64);
                false
            }
            Effect::Drop => {
                debug!(key = %key, "added and deleted before delivery; dropping");
                state.forget(&key);
                counter!("event_queue_dropped_total", 1u64);
                false
            }
        };
        gauge!("event_queue_depth", state.queue.len() as f64);
        drop(state);
        if enqueued {
            self.ready.notify_one();
        }
        Ok(())
    }

    /// Discard every pending event and reseed the store from a full relist.
    ///
    /// Each object is queued as `Modified` in snapshot order; objects sharing
    /// a key collapse into one slot holding the last of them. Keys are computed
    /// up front, so a failing key function leaves the queue untouched.
    /// `version` is kept for diagnostics only.
    pub fn replace(&self, objects: Vec<T>, version: impl Into<String>) -> Result<(), KeyError> {
        let keyed = objects
            .into_iter()
            .map(|obj| Ok((self.key_fn.key_of(&obj)?, obj)))
            .collect::<Result<Vec<_>, KeyError>>()?;
        let version = version.into();

        let mut state = self.lock();
        state.queue.clear();
        state.events.clear();
        state.store.clear();
        for (key, obj) in keyed {
            if !state.events.contains_key(&key) {
                state.enqueue(key.clone(), EventType::Modified);
            }
            state.store.insert(key, obj);
        }
        let count = state.queue.len();
        let last_key = state.queue.back().cloned();
        state.relist = RelistState {
            last_key,
            count,
            version: Some(version.clone()),
            listed: true,
        };
        gauge!("event_queue_depth", count as f64);
        drop(state);

        counter!("event_queue_replace_total", 1u64);
        info!(version = %version, count, "event queue replaced");
        self.ready.notify_all();
        Ok(())
    }

    /// Queue a `Modified` event for every stored key that has nothing pending.
    ///
    /// Keys already queued keep their pending event and position; new ones
    /// are appended in key order.
    pub fn resync(&self) {
        let mut state = self.lock();
        let mut keys: Vec<String> =
            state.store.keys().filter(|k| !state.events.contains_key(*k)).cloned().collect();
        keys.sort_unstable();
        let count = keys.len();
        for key in keys {
            state.enqueue(key, EventType::Modified);
        }
        gauge!("event_queue_depth", state.queue.len() as f64);
        drop(state);

        debug!(count, "event queue resync");
        if count > 0 {
            self.ready.notify_all();
        }
    }

    /// Block until a key is queued, then deliver its merged event.
    ///
    /// Returns `None` once the queue is cancelled, whether or not keys remain.
    ///
    /// # Panics
    ///
    /// Panics if the popped key has no stored object, which only happens when
    /// a producer broke the event ordering contract.
    pub fn pop(&self) -> Option<(EventType, T)> {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return None;
            }
            if let Some((key, kind, obj)) = state.take_front() {
                let depth = state.queue.len();
                drop(state);
                Self::delivered(&key, kind, depth);
                return Some((kind, obj));
            }
            state = self.ready.wait(state).expect("event queue lock poisoned");
        }
    }

    /// Non-blocking [`pop`](Self::pop): `None` when empty or cancelled.
    pub fn try_pop(&self) -> Option<(EventType, T)> {
        let mut state = self.lock();
        if state.cancelled {
            return None;
        }
        let (key, kind, obj) = state.take_front()?;
        let depth = state.queue.len();
        drop(state);
        Self::delivered(&key, kind, depth);
        Some((kind, obj))
    }

    fn delivered(key: &str, kind: EventType, depth: usize) {
        counter!("event_queue_popped_total", 1u64, "type" => kind.as_str());
        gauge!("event_queue_depth", depth as f64);
        trace!(key = %key, %kind, depth, "event popped");
    }

    /// Stop the queue: wake every blocked [`pop`](Self::pop) and make later calls return `None`.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if !state.cancelled {
            state.cancelled = true;
            info!(pending = state.queue.len(), "event queue cancelled");
        }
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Objects of the queued keys, in queue order.
    pub fn list(&self) -> Vec<T> {
        let state = self.lock();
        state.queue.iter().filter_map(|k| state.store.get(k).cloned()).collect()
    }

    /// Queued keys, in queue order.
    pub fn list_keys(&self) -> Vec<String> {
        self.lock().queue.iter().cloned().collect()
    }

    pub fn contained_ids(&self) -> FxHashSet<String> {
        self.lock().queue.iter().cloned().collect()
    }

    /// Stored object for `obj`'s key, visible only while that key is queued.
    pub fn get(&self, obj: &T) -> Result<Option<T>, KeyError> {
        let key = self.key_fn.key_of(obj)?;
        Ok(self.get_by_key(&key))
    }

    /// Stored object for `key`, visible only while the key is queued.
    pub fn get_by_key(&self, key: &str) -> Option<T> {
        let state = self.lock();
        if state.events.contains_key(key) {
            state.store.get(key).cloned()
        } else {
            None
        }
    }

    /// Event currently pending for `key`, if it is queued.
    pub fn pending_event(&self, key: &str) -> Option<EventType> {
        self.lock().events.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// True once every key queued by the latest [`replace`](Self::replace) has been popped.
    pub fn list_consumed(&self) -> bool {
        self.lock().relist.last_key.is_none()
    }

    /// Number of keys queued by the latest [`replace`](Self::replace).
    pub fn list_count(&self) -> usize {
        self.lock().relist.count
    }

    pub fn list_successful_at_least_once(&self) -> bool {
        self.lock().relist.listed
    }

    pub fn last_replace_version(&self) -> Option<String> {
        self.lock().relist.version.clone()
    }
}
