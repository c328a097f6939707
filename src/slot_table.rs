//! SlotTable: namespace-keyed storage with stable, generational handles.
//!
//! Entries live in a `SlotMap` and are indexed by a `hashbrown::HashTable`
//! of slot keys. Each entry stores its precomputed hash, so removal and
//! rehashing never hash the namespace again. A `Handle` stays valid until
//! its entry is removed; after that it never aliases a newer entry, even
//! one inserted under the same namespace.

use core::hash::BuildHasher;
use hashbrown::hash_table;
use hashbrown::HashTable;
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle(DefaultKey);

#[derive(Debug)]
struct Entry<V> {
    namespace: Box<str>,
    value: V,
    hash: u64,
}

#[derive(Debug, Eq, PartialEq)]
pub enum InsertError {
    DuplicateKey,
}

pub struct SlotTable<V, S = RandomState> {
    hasher: S,
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Entry<V>>,
}

impl<V> SlotTable<V> {
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<V> Default for SlotTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, S: BuildHasher> SlotTable<V, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            hasher,
            index: HashTable::new(),
            slots: SlotMap::with_key(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn find(&self, namespace: &str) -> Option<Handle> {
        let hash = self.hasher.hash_one(namespace);
        self.index
            .find(hash, |&k| {
                self.slots
                    .get(k)
                    .map(|e| &*e.namespace == namespace)
                    .unwrap_or(false)
            })
            .map(|&k| Handle(k))
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.find(namespace).is_some()
    }

    pub fn insert(&mut self, namespace: &str, value: V) -> Result<Handle, InsertError> {
        let hash = self.hasher.hash_one(namespace);
        match self.index.entry(
            hash,
            |&k| {
                self.slots
                    .get(k)
                    .map(|e| &*e.namespace == namespace)
                    .unwrap_or(false)
            },
            |&k| self.slots.get(k).map(|e| e.hash).unwrap_or(0),
        ) {
            hash_table::Entry::Occupied(_) => Err(InsertError::DuplicateKey),
            hash_table::Entry::Vacant(v) => {
                let k = self.slots.insert(Entry {
                    namespace: namespace.into(),
                    value,
                    hash,
                });
                v.insert(k);
                Ok(Handle(k))
            }
        }
    }

    /// Unlink and return the entry behind `handle`; `None` if it is stale.
    pub fn remove(&mut self, handle: Handle) -> Option<(Box<str>, V)> {
        let entry = self.slots.remove(handle.0)?;
        if let Ok(occupied) = self.index.find_entry(entry.hash, |&k| k == handle.0) {
            occupied.remove();
        }
        Some((entry.namespace, entry.value))
    }

    pub fn get(&self, handle: Handle) -> Option<&V> {
        self.slots.get(handle.0).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut V> {
        self.slots.get_mut(handle.0).map(|e| &mut e.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &str, &V)> {
        self.slots
            .iter()
            .map(|(k, e)| (Handle(k), &*e.namespace, &e.value))
    }

    /// Remove every entry, yielding them in slot order.
    pub fn drain(&mut self) -> impl Iterator<Item = (Box<str>, V)> + '_ {
        self.index.clear();
        self.slots.drain().map(|(_, e)| (e.namespace, e.value))
    }
}
