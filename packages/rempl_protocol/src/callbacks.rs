//! One-shot reply correlation.
//!
//! Every request that expects an answer registers a pending entry under a
//! fresh [`CallbackId`] and sends the id along. The reply carries the id back;
//! [`CallbackTable::take`] hands out the entry exactly once.

use std::collections::HashMap;

use crate::ids::CallbackId;

#[derive(Debug)]
pub struct CallbackTable<T> {
    pending: HashMap<CallbackId, T>,
}

impl<T> Default for CallbackTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CallbackTable<T> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Store `entry` under a fresh id and return the id.
    pub fn register(&mut self, entry: T) -> CallbackId {
        let mut id = CallbackId::generate();
        while self.pending.contains_key(&id) {
            id = CallbackId::generate();
        }
        self.pending.insert(id.clone(), entry);
        id
    }

    /// Remove and return the entry for `id`. A second call for the same id
    /// returns `None`.
    pub fn take(&mut self, id: &CallbackId) -> Option<T> {
        self.pending.remove(id)
    }

    /// Drop every pending entry. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn contains(&self, id: &CallbackId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
