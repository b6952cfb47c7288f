use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{
    clock::VectorClock,
    protocol::{CommitParams, Snapshot, TransactionProtocol},
};

pub const SNAPSHOT_THRESHOLD: usize = 10;
pub const SNAPSHOT_MIN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    // the vector this materialization is valid at, i.e. the read vector
    // that produced it. selection for reads always goes through this
    pub vc: VectorClock,
    pub params: CommitParams,
    pub snapshot: Snapshot,
}

// ordered map from snapshot vector to materialized value, youngest first
// under the protocol's precedence. the threshold keeps it small enough
// that a linear list beats anything clever
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcOrderedSnapshots(Vec<SnapshotEntry>);

fn precedence_vc(entry: &SnapshotEntry, protocol: TransactionProtocol) -> &VectorClock {
    match protocol {
        // physics positions snapshots by their dependency vector
        TransactionProtocol::Physics => entry.params.dependency_vc().unwrap_or(&entry.vc),
        _ => &entry.vc,
    }
}

impl VcOrderedSnapshots {
    pub fn insert_newer(&mut self, entry: SnapshotEntry, protocol: TransactionProtocol) {
        for index in 0..self.0.len() {
            let existing = precedence_vc(&self.0[index], protocol);
            let incoming = precedence_vc(&entry, protocol);
            if incoming.le(existing) && existing.le(incoming) {
                // duplicate under the partial order, keep the fresher
                // materialization
                self.0[index] = entry;
                return;
            }
            if existing.le(incoming) {
                self.0.insert(index, entry);
                return;
            }
        }
        self.0.push(entry)
    }

    // youngest entry not exceeding the target, and whether it is the
    // youngest overall (only then may a read persist its refinement)
    pub fn get_not_newer(&self, target: &VectorClock) -> Option<(&SnapshotEntry, bool)> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.vc.le(target))
            .map(|(index, entry)| (entry, index == 0))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn newest(&self) -> Option<&SnapshotEntry> {
        self.0.first()
    }

    pub fn oldest(&self) -> Option<&SnapshotEntry> {
        self.0.last()
    }

    pub fn retain_newest(&mut self, count: usize) {
        self.0.truncate(count)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotEntry> + '_ {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotCache(Arc<RwLock<HashMap<Bytes, VcOrderedSnapshots>>>);

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &Bytes) -> bool {
        self.0.read().contains_key(key)
    }

    pub fn size(&self, key: &Bytes) -> usize {
        self.0.read().get(key).map(VcOrderedSnapshots::len).unwrap_or_default()
    }

    pub fn get_not_newer(
        &self,
        key: &Bytes,
        target: &VectorClock,
    ) -> Option<(SnapshotEntry, bool)> {
        let table = self.0.read();
        let (entry, is_newest) = table.get(key)?.get_not_newer(target)?;
        Some((entry.clone(), is_newest))
    }

    pub fn newest(&self, key: &Bytes) -> Option<SnapshotEntry> {
        self.0.read().get(key)?.newest().cloned()
    }

    pub fn with_or_insert<R>(
        &self,
        key: &Bytes,
        f: impl FnOnce(&mut VcOrderedSnapshots) -> R,
    ) -> R {
        let mut table = self.0.write();
        f(table.entry(key.clone()).or_default())
    }

    pub fn clear(&self) {
        self.0.write().clear()
    }
}
