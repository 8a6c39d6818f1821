use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

#[derive(Default)]
struct Seen {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

/// Remembers the most recent event ids so redelivered events are ignored.
///
/// Bounded: once `capacity` ids are held the oldest is forgotten.
pub struct DedupFilter {
    seen: Mutex<Seen>,
    capacity: usize,
}

impl DedupFilter {
    pub fn new(capacity: usize) -> Self {
        DedupFilter {
            seen: Mutex::new(Seen::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; returns false when it was already seen
    pub fn first_sighting(&self, id: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.ids.contains(id) {
            return false;
        }

        seen.ids.insert(id.to_string());
        seen.order.push_back(id.to_string());
        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
