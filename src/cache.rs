//! Bounded LRU cache used for open tables and uncompressed blocks.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

struct LruInner<K, V> {
    capacity: usize,
    map: HashMap<K, (V, u64)>,
    // Recency queue with lazy invalidation: an entry is live only if its
    // tick matches the map's.
    recency: VecDeque<(u64, K)>,
    tick: u64,
}

pub struct Cache<K, V> {
    inner: Mutex<LruInner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    pub fn new(capacity: usize) -> Cache<K, V> {
        assert!(capacity > 0);
        Cache {
            inner: Mutex::new(LruInner {
                capacity,
                map: HashMap::new(),
                recency: VecDeque::new(),
                tick: 0,
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        let value = match inner.map.get_mut(key) {
            Some((value, stamp)) => {
                *stamp = tick;
                value.clone()
            }
            None => return None,
        };
        inner.recency.push_back((tick, key.clone()));
        inner.compact_queue();
        Some(value)
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        inner.map.insert(key.clone(), (value, tick));
        inner.recency.push_back((tick, key));
        while inner.map.len() > inner.capacity {
            match inner.recency.pop_front() {
                Some((stamp, key)) => {
                    if inner.map.get(&key).map(|(_, s)| *s) == Some(stamp) {
                        inner.map.remove(&key);
                    }
                }
                None => break,
            }
        }
        inner.compact_queue();
    }

    pub fn erase(&self, key: &K) {
        self.inner.lock().unwrap().map.remove(key);
    }

    /// Drops every entry whose key matches, e.g. all blocks of a deleted
    /// table file.
    pub fn erase_matching<F: Fn(&K) -> bool>(&self, pred: F) {
        self.inner.lock().unwrap().map.retain(|k, _| !pred(k));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, V> LruInner<K, V> {
    /// Rebuilds the recency queue when stale entries dominate it.
    fn compact_queue(&mut self) {
        if self.recency.len() > 2 * self.map.len() + 16 {
            let map = &self.map;
            self.recency
                .retain(|(stamp, key)| map.get(key).map(|(_, s)| *s) == Some(*stamp));
        }
    }
}
