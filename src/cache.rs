//! LRU residency cache for decoded node payloads.
//!
//! Entries are kept in a doubly linked list threaded through a slab, oldest
//! first, so touching and evicting are O(1). Every entry carries a cost (the
//! node's point count) and the cache evicts from the old end until the total
//! cost fits the budget. Entries touched during the current visibility pass
//! are never evicted, even if that leaves the cache over budget.

use slab::Slab;
use std::collections::HashMap;
use std::hash::Hash;
use tracing::trace;

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    cost: u64,
    last_touch: u64,
    pinned: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub struct NodeCache<K, V> {
    entries: Slab<Entry<K, V>>,
    index: HashMap<K, usize>,
    /// Least recently touched.
    head: Option<usize>,
    /// Most recently touched.
    tail: Option<usize>,
    total_cost: u64,
    budget: u64,
    pass: u64,
}

impl<K: Copy + Eq + Hash, V> NodeCache<K, V> {
    pub fn new(budget: u64) -> Self {
        Self {
            entries: Slab::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            total_cost: 0,
            budget,
            pass: 0,
        }
    }

    /// Starts a new visibility pass. Entries touched before lose their protection.
    pub fn begin_pass(&mut self) {
        self.pass += 1;
    }

    pub fn pass(&self) -> u64 {
        self.pass
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn set_budget(&mut self, budget: u64) {
        self.budget = budget;
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Reads an entry without refreshing it.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|&slot| &self.entries[slot].value)
    }

    /// Marks the entry as used by the current pass and moves it to the recent end.
    /// Returns `false` if the key is not resident.
    pub fn touch(&mut self, key: &K) -> bool {
        let Some(&slot) = self.index.get(key) else {
            return false;
        };
        self.entries[slot].last_touch = self.pass;
        self.unlink(slot);
        self.push_back(slot);
        true
    }

    pub fn is_protected(&self, key: &K) -> bool {
        self.index
            .get(key)
            .is_some_and(|&slot| self.entries[slot].last_touch == self.pass)
    }

    /// Pinned entries count towards the budget but are never evicted.
    pub fn pin(&mut self, key: &K) {
        if let Some(&slot) = self.index.get(key) {
            self.entries[slot].pinned = true;
        }
    }

    /// Inserts or replaces an entry as touched by the current pass, then evicts
    /// down to the budget. Returns the evicted entries.
    pub fn insert(&mut self, key: K, cost: u64, value: V) -> Vec<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            let entry = &mut self.entries[slot];
            self.total_cost = self.total_cost - entry.cost + cost;
            entry.cost = cost;
            entry.value = value;
            self.touch(&key);
        } else {
            let slot = self.entries.insert(Entry {
                key,
                value,
                cost,
                last_touch: self.pass,
                pinned: false,
                prev: None,
                next: None,
            });
            self.push_back(slot);
            self.index.insert(key, slot);
            self.total_cost += cost;
        }
        self.free_memory()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.unlink(slot);
        let entry = self.entries.remove(slot);
        self.total_cost -= entry.cost;
        Some(entry.value)
    }

    /// Evicts least recently touched entries until the total cost fits the budget.
    /// Entries of the current pass and pinned entries are skipped.
    pub fn free_memory(&mut self) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        let mut cursor = self.head;

        while self.total_cost > self.budget {
            let Some(slot) = cursor else {
                break;
            };
            let entry = &self.entries[slot];
            cursor = entry.next;
            if entry.last_touch == self.pass {
                // everything after this one was touched in this pass as well
                break;
            }
            if entry.pinned {
                continue;
            }

            let key = entry.key;
            if let Some(value) = self.remove(&key) {
                evicted.push((key, value));
            }
        }

        if !evicted.is_empty() {
            trace!(
                evicted = evicted.len(),
                total_cost = self.total_cost,
                budget = self.budget,
                "freed cache memory"
            );
        }
        evicted
    }

    /// Keys from least to most recently touched.
    pub fn keys_by_age(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.entries.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            keys.push(self.entries[slot].key);
            cursor = self.entries[slot].next;
        }
        keys
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = &self.entries[slot];
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
        let entry = &mut self.entries[slot];
        entry.prev = None;
        entry.next = None;
    }

    fn push_back(&mut self, slot: usize) {
        self.entries[slot].prev = self.tail;
        self.entries[slot].next = None;
        match self.tail {
            Some(t) => self.entries[t].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_moves_to_recent_end() {
        let mut cache = NodeCache::new(100);
        cache.insert(1, 10, "a");
        cache.insert(2, 10, "b");
        cache.insert(3, 10, "c");
        assert_eq!(cache.keys_by_age(), vec![1, 2, 3]);

        assert!(cache.touch(&1));
        assert_eq!(cache.keys_by_age(), vec![2, 3, 1]);
        assert!(!cache.touch(&9));
        assert_eq!(cache.total_cost(), 30);
    }

    #[test]
    fn test_evicts_oldest_first_until_budget() {
        let mut cache = NodeCache::new(25);
        cache.insert(1, 10, "a");
        cache.insert(2, 10, "b");
        cache.begin_pass();
        cache.touch(&1);

        let evicted = cache.insert(3, 10, "c");
        assert_eq!(evicted, vec![(2, "b")]);
        assert_eq!(cache.total_cost(), 20);
        assert_eq!(cache.keys_by_age(), vec![1, 3]);
    }

    #[test]
    fn test_current_pass_is_protected() {
        let mut cache = NodeCache::new(15);
        cache.begin_pass();
        assert!(cache.insert(1, 10, "a").is_empty());
        assert!(cache.insert(2, 10, "b").is_empty());
        // over budget, but everything was touched in this pass
        assert_eq!(cache.total_cost(), 20);
        assert!(cache.is_protected(&1));

        cache.begin_pass();
        cache.touch(&2);
        let evicted = cache.free_memory();
        assert_eq!(evicted, vec![(1, "a")]);
        assert!(cache.contains(&2));
    }

    #[test]
    fn test_pinned_entries_stay() {
        let mut cache = NodeCache::new(5);
        cache.insert(0, 10, "root");
        cache.pin(&0);
        cache.insert(1, 10, "a");
        cache.begin_pass();

        let evicted = cache.free_memory();
        assert_eq!(evicted, vec![(1, "a")]);
        assert!(cache.contains(&0));
        assert_eq!(cache.total_cost(), 10);
    }

    #[test]
    fn test_replace_updates_cost() {
        let mut cache = NodeCache::new(100);
        cache.insert(1, 10, "a");
        cache.insert(1, 30, "b");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 30);
        assert_eq!(cache.get(&1), Some(&"b"));
        assert_eq!(cache.remove(&1), Some("b"));
        assert_eq!(cache.total_cost(), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.keys_by_age(), Vec::<i32>::new());
    }

    #[test]
    fn test_budget_holds_after_each_pass() {
        let mut cache = NodeCache::new(50);
        for frame in 0..20u64 {
            cache.begin_pass();
            for k in 0..3 {
                let key = frame * 3 + k;
                cache.insert(key, 10, key);
            }
            cache.free_memory();
            // at most the budget, or only this pass's entries
            assert!(cache.total_cost() <= 50 || cache.keys_by_age().iter().all(|k| cache.is_protected(k)));
        }
        assert_eq!(cache.total_cost(), 50);
    }
}
