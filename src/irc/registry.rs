//! Concurrent keyed store shared by every connection task.
//!
//! A thin layer over a sharded concurrent map. Each operation is
//! linearizable per key; `set` is a compare-and-insert (never a
//! check-then-put), which is what lets nick collisions be detected at
//! bind time without a separate locking scheme.
//!
//! Lock order: a *channel* entry guard may be held while touching the
//! *user* registry, never the reverse, and no guard is ever held across
//! an `.await`.

use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// A keyed registry of `V` values.
#[derive(Debug)]
pub struct Registry<K: Eq + Hash, V> {
    map: DashMap<K, V>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Insert only if `key` is absent. Returns whether the value was
    /// inserted; an existing entry is never overwritten.
    pub fn set(&self, key: K, value: V) -> bool {
        match self.map.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Insert or overwrite unconditionally.
    pub fn update(&self, key: K, value: V) -> bool {
        self.map.insert(key, value);
        true
    }

    /// Snapshot of the current value, if present.
    pub fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.map.remove(key).is_some()
    }

    /// Remove `key`, returning the final value. Atomic: exactly one of
    /// two racing callers gets the value.
    pub fn take(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, value)| value)
    }

    /// Snapshot of all entries.
    pub fn dump(&self) -> Vec<(K, V)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Remove every entry.
    pub fn flush(&self) {
        self.map.clear();
    }

    /// Read-modify-write under the entry lock. Returns a snapshot of the
    /// updated value, or `None` when the key is absent.
    pub fn modify(&self, key: &K, f: impl FnOnce(&mut V)) -> Option<V> {
        self.map.get_mut(key).map(|mut entry| {
            f(entry.value_mut());
            entry.value().clone()
        })
    }

    /// Run `f` under the entry read guard. Reads of the same key may run
    /// concurrently.
    pub fn read<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.map.get(key).map(|entry| f(entry.value()))
    }

    /// Run `f` under the *exclusive* entry guard. Callers of this (and of
    /// `modify`) on the same key serialize, which is what gives channel
    /// fan-outs their single per-channel order.
    pub fn with_mut<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.map.get_mut(key).map(|mut entry| f(entry.value_mut()))
    }

    /// Insert-if-absent, then read-modify-write, as one entry operation.
    /// Returns a snapshot of the updated value.
    pub fn upsert_with(&self, key: K, default: impl FnOnce() -> V, f: impl FnOnce(&mut V)) -> V {
        let mut entry = self.map.entry(key).or_insert_with(default);
        f(entry.value_mut());
        entry.value().clone()
    }

    /// Remove `key` only while the current value satisfies `pred`.
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> bool {
        self.map.remove_if(key, |_, v| pred(v)).is_some()
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
