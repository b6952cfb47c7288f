use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
};

use bytes::Bytes;

use crate::{
    crdt::CrdtType,
    materializer::{ReadError, UpdateError},
    partition::PartitionHandle,
    protocol::{CommitParams, Operation, Snapshot, Transaction},
};

pub type PartitionId = u64;
pub type NodeId = u64;

// placement is out of scope for the materializer, only the preflist
// shape is consumed: the head entry owns the key
pub trait Ring {
    fn preflist_from_key(&self, key: &[u8]) -> Vec<(PartitionId, NodeId)>;
}

// hash placement over a fixed partition count, single node
#[derive(Debug, Clone)]
pub struct ModRing {
    pub partitions: u64,
    pub node: NodeId,
    pub preflist_len: usize,
}

impl Ring for ModRing {
    fn preflist_from_key(&self, key: &[u8]) -> Vec<(PartitionId, NodeId)> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let primary = hasher.finish() % self.partitions;
        (0..self.preflist_len as u64)
            .map(|offset| ((primary + offset) % self.partitions, self.node))
            .collect()
    }
}

pub struct Cluster<R> {
    ring: R,
    partitions: HashMap<PartitionId, PartitionHandle>,
}

impl<R> Cluster<R> {
    pub fn new(ring: R) -> Self {
        Self {
            ring,
            partitions: Default::default(),
        }
    }

    pub fn insert_partition(
        &mut self,
        partition: PartitionId,
        handle: PartitionHandle,
    ) -> anyhow::Result<()> {
        let replaced = self.partitions.insert(partition, handle);
        anyhow::ensure!(replaced.is_none(), "duplicated partition {partition}");
        Ok(())
    }
}

impl<R: Ring> Cluster<R> {
    fn owner(&self, key: &[u8]) -> anyhow::Result<&PartitionHandle> {
        let (partition, _) = *self
            .ring
            .preflist_from_key(key)
            .first()
            .ok_or(anyhow::format_err!("empty preflist"))?;
        self.partitions
            .get(&partition)
            .ok_or(anyhow::format_err!("no handle for partition {partition}"))
    }

    pub fn read(
        &self,
        key: &Bytes,
        crdt_type: CrdtType,
        txn: &Transaction,
    ) -> anyhow::Result<Result<(Snapshot, CommitParams), ReadError>> {
        Ok(self.owner(key)?.read(key, crdt_type, txn))
    }

    pub async fn update(
        &self,
        key: &Bytes,
        op: Operation,
    ) -> anyhow::Result<Result<(), UpdateError>> {
        Ok(self.owner(key)?.update(op).await)
    }

    // aggregated readiness, true only when every partition finished
    // rehydrating
    pub async fn check_tables_ready(&self) -> bool {
        for handle in self.partitions.values() {
            if !handle.check_ready().await {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflist_is_stable_and_in_range() {
        let ring = ModRing {
            partitions: 8,
            node: 1,
            preflist_len: 3,
        };
        let preflist = ring.preflist_from_key(b"some key");
        assert_eq!(preflist, ring.preflist_from_key(b"some key"));
        assert_eq!(preflist.len(), 3);
        for (partition, node) in preflist {
            assert!(partition < 8);
            assert_eq!(node, 1)
        }
    }

    #[test]
    fn preflist_wraps_around() {
        let ring = ModRing {
            partitions: 2,
            node: 0,
            preflist_len: 2,
        };
        let mut partitions = ring
            .preflist_from_key(b"k")
            .into_iter()
            .map(|(partition, _)| partition)
            .collect::<Vec<_>>();
        partitions.sort_unstable();
        assert_eq!(partitions, vec![0, 1])
    }
}
