use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::DeviceSchema;

struct Entry {
    schema: Arc<DeviceSchema>,
    loaded_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

/// Bounded, time-limited cache of derived schemas keyed by blueprint reference
pub struct SchemaCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl SchemaCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Fresh entry for `reference`; expired entries are dropped on lookup
    pub fn get(&self, reference: &str) -> Option<Arc<DeviceSchema>> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(reference) {
            Some(entry) if entry.loaded_at.elapsed() < self.ttl => {
                return Some(entry.schema.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(reference);
            inner.order.retain(|r| r != reference);
        }
        None
    }

    pub fn insert(&self, reference: &str, schema: Arc<DeviceSchema>) {
        let mut inner = self.inner.lock();
        let entry = Entry {
            schema,
            loaded_at: Instant::now(),
        };
        if inner.entries.insert(reference.to_string(), entry).is_some() {
            inner.order.retain(|r| r != reference);
        }
        inner.order.push_back(reference.to_string());

        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn invalidate(&self, reference: &str) {
        let mut inner = self.inner.lock();
        inner.entries.remove(reference);
        inner.order.retain(|r| r != reference);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
