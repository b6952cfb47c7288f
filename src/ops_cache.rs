use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::protocol::Operation;

// per-key ring floor and the write-triggered gc period
pub const OPS_THRESHOLD: usize = 50;
// slack against resizing on every gc
pub const RESIZE_THRESHOLD: usize = 5;

// packed per-key operation ring. live ops occupy `slots[0..len]` in
// strictly increasing op id order; `slots.len()` is the allocated
// capacity, adjusted only during gc
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsEntry {
    key: Bytes,
    len: usize,
    next_op_id: u64,
    slots: Vec<Option<(u64, Operation)>>,
}

impl OpsEntry {
    pub fn new(key: Bytes) -> Self {
        Self {
            key,
            len: 0,
            next_op_id: 0,
            slots: vec![None; OPS_THRESHOLD],
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn next_op_id(&self) -> u64 {
        self.next_op_id
    }

    pub fn bump_op_id(&mut self) -> u64 {
        self.next_op_id += 1;
        self.next_op_id
    }

    pub fn append(&mut self, op_id: u64, op: Operation) {
        debug_assert!(self
            .slots
            .get(self.len.wrapping_sub(1))
            .and_then(|slot| slot.as_ref())
            .map(|(id, _)| *id < op_id)
            .unwrap_or(true));
        if self.len == self.slots.len() {
            // gc left no room, grow in place
            self.slots.push(Some((op_id, op)));
        } else {
            self.slots[self.len] = Some((op_id, op));
        }
        self.len += 1
    }

    pub fn ops(&self) -> impl Iterator<Item = &(u64, Operation)> + '_ {
        self.slots[..self.len].iter().filter_map(|slot| slot.as_ref())
    }

    // the prefix a reader works against after dropping the table guard
    pub fn observed(&self) -> Vec<(u64, Operation)> {
        self.ops().cloned().collect()
    }

    pub fn rebuild(&mut self, kept: Vec<(u64, Operation)>, capacity: usize) {
        let capacity = capacity.max(kept.len());
        self.len = kept.len();
        self.slots = kept.into_iter().map(Some).collect();
        self.slots.resize(capacity, None)
    }
}

pub fn resized_capacity(new_len: usize, capacity: usize) -> usize {
    if new_len > capacity - RESIZE_THRESHOLD {
        capacity * 2
    } else if capacity / 2 <= OPS_THRESHOLD {
        capacity
    } else if capacity / 2 - RESIZE_THRESHOLD > new_len {
        capacity / 2
    } else {
        capacity
    }
}

// table-level concurrency: any thread may look up and copy a key's
// prefix, multi-step mutation happens only on the partition command task
#[derive(Debug, Clone, Default)]
pub struct OpsCache(Arc<RwLock<HashMap<Bytes, OpsEntry>>>);

impl OpsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member(&self, key: &Bytes) -> bool {
        self.0.read().contains_key(key)
    }

    pub fn lookup(&self, key: &Bytes) -> Option<(usize, usize, u64, Vec<(u64, Operation)>)> {
        let table = self.0.read();
        let entry = table.get(key)?;
        Some((
            entry.len(),
            entry.capacity(),
            entry.next_op_id(),
            entry.observed(),
        ))
    }

    pub fn with_or_insert<R>(&self, key: &Bytes, f: impl FnOnce(&mut OpsEntry) -> R) -> R {
        let mut table = self.0.write();
        let entry = table
            .entry(key.clone())
            .or_insert_with(|| OpsEntry::new(key.clone()));
        f(entry)
    }

    pub fn with_existing<R>(&self, key: &Bytes, f: impl FnOnce(&mut OpsEntry) -> R) -> Option<R> {
        self.0.write().get_mut(key).map(f)
    }

    pub fn insert_entry(&self, entry: OpsEntry) {
        self.0.write().insert(entry.key().clone(), entry);
    }

    pub fn for_each(&self, mut f: impl FnMut(&OpsEntry)) {
        for entry in self.0.read().values() {
            f(entry)
        }
    }

    pub fn clear(&self) {
        self.0.write().clear()
    }
}
