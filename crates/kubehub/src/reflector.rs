//! Translates watcher events into queue calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use evq_core::EventType;
use kube::runtime::watcher::Event;
use kube::Resource;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::{object_key, ResourceQueue};

/// Producer side of a [`ResourceQueue`].
///
/// kube's watcher reports `Applied` for both creations and updates; the
/// reflector remembers which keys exist so it can tell them apart. An object
/// recreated while its deletion is still waiting in the queue is parked until
/// the consumer has popped that deletion.
pub struct Reflector<K> {
    queue: Arc<ResourceQueue<K>>,
    known: HashSet<String>,
    parked: HashMap<String, K>,
    relists: u64,
}

impl<K: Resource + Clone> Reflector<K> {
    pub fn new(queue: Arc<ResourceQueue<K>>) -> Self {
        Self { queue, known: HashSet::new(), parked: HashMap::new(), relists: 0 }
    }

    pub fn queue(&self) -> &Arc<ResourceQueue<K>> {
        &self.queue
    }

    /// Keys the reflector believes currently exist.
    pub fn known(&self) -> &HashSet<String> {
        &self.known
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    pub fn apply(&mut self, ev: Event<K>) {
        match ev {
            Event::Applied(obj) => {
                counter!("reflector_events_total", 1u64, "event" => "applied");
                let Some(key) = keyed(&obj) else { return };
                self.applied(key, obj);
            }
            Event::Deleted(obj) => {
                counter!("reflector_events_total", 1u64, "event" => "deleted");
                let Some(key) = keyed(&obj) else { return };
                if self.parked.remove(&key).is_some() {
                    // recreated and deleted again; the queued deletion already covers it
                    debug!(key = %key, "parked object deleted");
                    return;
                }
                self.known.remove(&key);
                if let Err(e) = self.queue.delete(obj) {
                    warn!(key = %key, error = %e, "delete rejected");
                }
            }
            Event::Restarted(list) => {
                counter!("reflector_events_total", 1u64, "event" => "restarted");
                self.relists += 1;
                let mut keys = HashSet::with_capacity(list.len());
                let objects: Vec<K> = list
                    .into_iter()
                    .filter_map(|o| keyed(&o).map(|k| (k, o)))
                    .map(|(k, o)| {
                        keys.insert(k);
                        o
                    })
                    .collect();
                let version = format!("relist-{}", self.relists);
                match self.queue.replace(objects, version.as_str()) {
                    Ok(()) => {
                        self.known = keys;
                        self.parked.clear();
                        info!(version = %version, count = self.known.len(), "relisted");
                    }
                    Err(e) => warn!(version = %version, error = %e, "relist rejected"),
                }
            }
        }
    }

    /// Retry parked objects whose pending deletion has been delivered.
    pub fn flush_parked(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        let ready: Vec<String> = self
            .parked
            .keys()
            .filter(|k| self.queue.pending_event(k) != Some(EventType::Deleted))
            .cloned()
            .collect();
        for key in ready {
            if let Some(obj) = self.parked.remove(&key) {
                self.applied(key, obj);
            }
        }
    }

    fn applied(&mut self, key: String, obj: K) {
        self.parked.remove(&key);
        if self.queue.pending_event(&key) == Some(EventType::Deleted) {
            debug!(key = %key, "deletion still pending; parking object");
            self.parked.insert(key, obj);
            return;
        }
        let res = if self.known.contains(&key) {
            self.queue.update(obj)
        } else {
            self.queue.add(obj)
        };
        match res {
            Ok(()) => {
                self.known.insert(key);
            }
            Err(e) => warn!(key = %key, error = %e, "applied object rejected"),
        }
    }
}

fn keyed<K: Resource>(obj: &K) -> Option<String> {
    match object_key(obj) {
        Ok(key) => Some(key),
        Err(e) => {
            counter!("reflector_skipped_total", 1u64);
            warn!(error = %e, "skipping object without a usable key");
            None
        }
    }
}
