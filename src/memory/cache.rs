use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::perception::types::Point;

struct Inner {
    entries: HashMap<String, (Point, Instant)>,
    /// Least recently used at the front.
    order: VecDeque<String>,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn forget(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }
}

/// Where named elements were last found. Entries expire after the TTL and
/// the least recently used entry is evicted past capacity. Names are
/// compared case-insensitively.
pub struct ElementCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

fn key_of(name: &str) -> String {
    name.trim().to_lowercase()
}

impl ElementCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn put(&self, name: &str, point: Point) {
        let key = key_of(name);
        if key.is_empty() {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.entries.insert(key.clone(), (point, Instant::now()));
        inner.touch(&key);
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn get(&self, name: &str) -> Option<Point> {
        let key = key_of(name);
        let mut inner = self.inner.lock().ok()?;
        let (point, stored) = *inner.entries.get(&key)?;
        if stored.elapsed() > self.ttl {
            inner.forget(&key);
            return None;
        }
        inner.touch(&key);
        Some(point)
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.forget(&key_of(name));
        }
    }

    /// Live entries, most recently used first.
    pub fn snapshot(&self) -> Vec<(String, Point)> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .order
            .iter()
            .rev()
            .filter_map(|k| {
                let (p, at) = inner.entries.get(k)?;
                (at.elapsed() <= self.ttl).then(|| (k.clone(), *p))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.order.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let cache = ElementCache::new(Duration::from_secs(60), 10);
        cache.put("  Save Button ", Point::new(1, 2));
        assert_eq!(cache.get("save button"), Some(Point::new(1, 2)));
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ElementCache::new(Duration::from_secs(60), 2);
        cache.put("a", Point::new(1, 1));
        cache.put("b", Point::new(2, 2));
        // touch a so b becomes the oldest
        cache.get("a");
        cache.put("c", Point::new(3, 3));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        let names: Vec<String> = cache.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn expired_entries_disappear() {
        let cache = ElementCache::new(Duration::ZERO, 10);
        cache.put("x", Point::new(0, 0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("x").is_none());
        assert!(cache.is_empty());
    }
}
