//! Dense, insertion-ordered lookup tables.
//!
//! The controller keeps three of these: nodes by id, servers by name and maps
//! by name. Entries live contiguously in a `Vec` so iteration order is stable
//! and `len()` always equals the number of live entries; a side index maps
//! each key to its slot so lookups do not scan.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// A key to value registry with contiguous storage.
#[derive(Debug, Clone)]
pub struct Table<K, V> {
    entries: Vec<(K, V)>,
    index: HashMap<K, usize>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<K, V> Table<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if `key` is present.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Slot currently occupied by `key`.
    pub fn position<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key).copied()
    }

    /// Looks up the value stored under `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.index.get(key)?;
        Some(&self.entries[slot].1)
    }

    /// Mutable lookup.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.index.get(key)?;
        Some(&mut self.entries[slot].1)
    }

    /// Inserts `value` under `key`, appending it at the end of the table.
    ///
    /// If the key is already present its value is replaced in place and the
    /// previous value is returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&slot) = self.index.get(&key) {
            return Some(std::mem::replace(&mut self.entries[slot].1, value));
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        None
    }

    /// Removes `key` and returns its value.
    ///
    /// Trailing entries shift down one slot so the table stays contiguous.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.index.remove(key)?;
        let (_, value) = self.entries.remove(slot);
        self.compact_from(slot);
        Some(value)
    }

    /// Re-indexes every entry from `start` onward after a removal shifted them.
    ///
    /// Must not run while another traversal of this table is in progress.
    pub fn compact_from(&mut self, start: usize) {
        for (slot, (key, _)) in self.entries.iter().enumerate().skip(start) {
            if let Some(position) = self.index.get_mut(key) {
                *position = slot;
            }
        }
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Iterates entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Iterates keys in slot order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(k, _)| k)
    }

    /// Iterates values in slot order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    /// Checks that every slot is indexed exactly once.
    #[cfg(test)]
    pub(crate) fn is_contiguous(&self) -> bool {
        self.index.len() == self.entries.len()
            && self
                .entries
                .iter()
                .enumerate()
                .all(|(slot, (key, _))| self.index.get(key) == Some(&slot))
    }
}
