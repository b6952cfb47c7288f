use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    clock::{now_micros, VectorClock},
    crdt::CrdtType,
    event::{SendEvent, Void},
    log::{Log, LogError},
    ops_cache::{resized_capacity, OpsCache, OPS_THRESHOLD},
    protocol::{
        is_causally_compatible, op_not_already_in_snapshot, CommitParams, Config, Operation,
        PhysicsReadMeta, Snapshot, Transaction, TransactionProtocol, TxnId,
    },
    ring::PartitionId,
    snapshot_cache::{SnapshotCache, SnapshotEntry, SNAPSHOT_MIN, SNAPSHOT_THRESHOLD},
};

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("partition is still rehydrating")]
    NotReady,
    #[error("no causally compatible operation for the read vector")]
    NoCompatibleOperation,
    #[error("log read failed")]
    Log(#[source] LogError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("gc-inducing read failed")]
    OpGc(#[source] ReadError),
    #[error("partition is still rehydrating")]
    NotReady,
    #[error("partition command processor is gone")]
    Closed,
}

// snapshot writeback emitted by reads running on caller threads, applied
// by the partition command task
#[derive(Debug, Clone)]
pub struct StoreSs {
    pub key: Bytes,
    pub entry: SnapshotEntry,
}

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub ops: OpsCache,
    pub snapshots: SnapshotCache,
}

// per-partition materialize and gc engine. holds the two cache tables and
// everything a read needs, so reads can run on the caller's thread while
// the partition command task funnels all multi-step writes
#[derive(Clone)]
pub struct Materializer {
    pub config: Arc<Config>,
    pub tables: Tables,
    pub log: Arc<dyn Log>,
    pub partition: PartitionId,
}

impl Materializer {
    pub fn new(config: Arc<Config>, log: Arc<dyn Log>, partition: PartitionId) -> Self {
        Self {
            config,
            tables: Default::default(),
            log,
            partition,
        }
    }

    pub fn read(
        &self,
        key: &Bytes,
        crdt_type: CrdtType,
        txn: &Transaction,
        writeback: &mut impl SendEvent<StoreSs>,
    ) -> Result<(Snapshot, CommitParams), ReadError> {
        self.read_internal(key, crdt_type, txn, false, writeback)
    }

    fn read_internal(
        &self,
        key: &Bytes,
        crdt_type: CrdtType,
        txn: &Transaction,
        should_gc: bool,
        writeback: &mut impl SendEvent<StoreSs>,
    ) -> Result<(Snapshot, CommitParams), ReadError> {
        let protocol = txn.protocol;
        let Some((_, _, _, observed)) = self.tables.ops.lookup(key) else {
            return Ok((Snapshot::blank(crdt_type), self.initial_params(protocol)));
        };

        let (effective_vc, temp_params) = match protocol {
            TransactionProtocol::Physics => {
                let meta = txn.physics_meta();
                match self.adjust_read_vc(&observed, &meta) {
                    Ok(anchored) => anchored,
                    Err(ReadError::NoCompatibleOperation) => {
                        let up = meta.dep_upbound;
                        (
                            up.clone(),
                            CommitParams::Physics {
                                commit_vc: up.clone(),
                                dependency_vc: up.clone(),
                                read_vc: up,
                            },
                        )
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => (txn.snapshot_vc.clone(), CommitParams::Ignore),
        };

        // base snapshot plus the op suffix to replay on top of it
        let mut from_log = false;
        let (base, is_newest, replay) = if !self.tables.snapshots.contains(key) {
            let blank = SnapshotEntry {
                vc: VectorClock::new(),
                params: CommitParams::Ignore,
                snapshot: Snapshot::blank(crdt_type),
            };
            self.store(key, blank.clone(), txn, false, writeback);
            (blank, true, observed)
        } else if let Some((entry, is_newest)) =
            self.tables.snapshots.get_not_newer(key, &effective_vc)
        {
            (entry, is_newest, observed)
        } else {
            // nothing cached at or below the requested vector
            from_log = true;
            let read = self
                .log
                .get(self.partition, key, crdt_type, &effective_vc, protocol)
                .map_err(ReadError::Log)?;
            debug!(
                ops = read.ops.len(),
                "snapshot cache miss, materializing from the log"
            );
            let base_last = read.base.last_op_id;
            let replay = read
                .ops
                .into_iter()
                .enumerate()
                .map(|(index, op)| (base_last + index as u64 + 1, op))
                .collect();
            let base = SnapshotEntry {
                vc: effective_vc.clone(),
                params: read.params,
                snapshot: read.base,
            };
            (base, read.is_newest, replay)
        };

        let physics_window = match (&protocol, &temp_params) {
            (TransactionProtocol::Physics, CommitParams::Physics { read_vc, .. }) => {
                Some((txn.physics_meta(), read_vc.clone()))
            }
            _ => None,
        };

        let base_last = base.snapshot.last_op_id;
        let mut value = base.snapshot.value.clone();
        let mut last_op_id = base_last;
        let mut join_vc = base.vc.clone();
        let mut applied = 0usize;
        // contiguous stays true while every op so far is folded into the
        // result or already witnessed by the base, which is what makes the
        // refined snapshot safe to describe by its last op id alone
        let mut contiguous = true;
        for (op_id, op) in &replay {
            if *op_id <= base_last {
                continue;
            }
            let commit_vc = op.commit_vc(protocol);
            if !op_not_already_in_snapshot(base.params.base_vc(), &commit_vc) {
                if contiguous {
                    last_op_id = (*op_id).max(last_op_id)
                }
                continue;
            }
            let mut visible = commit_vc.le(&effective_vc);
            if let Some((meta, read_vc)) = &physics_window {
                visible = visible
                    && is_causally_compatible(
                        read_vc,
                        &meta.commit_time_lowbound,
                        &op.dependency_vc,
                        &meta.dep_upbound,
                    )
            }
            if !visible {
                contiguous = false;
                continue;
            }
            value.apply(&op.payload)?;
            join_vc = join_vc.merge(&commit_vc);
            applied += 1;
            if contiguous {
                last_op_id = (*op_id).max(last_op_id)
            }
        }
        let snapshot = Snapshot { last_op_id, value };

        if !from_log {
            if applied > 0 && is_newest && contiguous {
                let entry = match protocol {
                    TransactionProtocol::Physics => SnapshotEntry {
                        vc: join_vc.clone(),
                        params: temp_params.clone(),
                        snapshot: snapshot.clone(),
                    },
                    // a contiguous refinement carries no commit identity
                    // of its own: the op id prefix describes it exactly
                    _ => SnapshotEntry {
                        vc: join_vc.clone(),
                        params: CommitParams::Ignore,
                        snapshot: snapshot.clone(),
                    },
                };
                self.store(key, entry, txn, should_gc, writeback)
            } else if should_gc {
                // the refinement is not cacheable but pruning must still
                // happen, reinserting the base runs it
                self.store(key, base, txn, true, writeback)
            }
        }

        let return_params = match protocol {
            TransactionProtocol::Physics => temp_params,
            _ => CommitParams::Vc(join_vc),
        };
        Ok((snapshot, return_params))
    }

    fn initial_params(&self, protocol: TransactionProtocol) -> CommitParams {
        match protocol {
            TransactionProtocol::Physics => CommitParams::Physics {
                commit_vc: VectorClock::new(),
                dependency_vc: VectorClock::new(),
                read_vc: VectorClock::new().with(self.config.dc_id, now_micros()),
            },
            _ => CommitParams::Vc(VectorClock::new()),
        }
    }

    // physics reads have no fixed snapshot vector: walk the observed ops
    // newest first and anchor on the first whose commit is causally
    // admissible for this transaction's window
    fn adjust_read_vc(
        &self,
        observed: &[(u64, Operation)],
        meta: &PhysicsReadMeta,
    ) -> Result<(VectorClock, CommitParams), ReadError> {
        let local_dc = self.config.dc_id;
        for (_, op) in observed.iter().rev() {
            let mut commit_vc = op.commit_vc(TransactionProtocol::Physics);
            // one decrement retry per candidate keeps the walk bounded by
            // the list length
            for _ in 0..2 {
                let read_vc = op
                    .dependency_vc
                    .clone()
                    .with(local_dc, now_micros().max(commit_vc.get(local_dc)));
                if is_causally_compatible(
                    &read_vc,
                    &meta.commit_time_lowbound,
                    &op.dependency_vc,
                    &meta.dep_upbound,
                ) {
                    return Ok((
                        commit_vc.clone(),
                        CommitParams::Physics {
                            commit_vc,
                            dependency_vc: op.dependency_vc.clone(),
                            read_vc,
                        },
                    ));
                }
                let local = commit_vc.get(local_dc);
                if local == 0 {
                    break;
                }
                commit_vc.set(local_dc, local - 1)
            }
        }
        Err(ReadError::NoCompatibleOperation)
    }

    fn store(
        &self,
        key: &Bytes,
        entry: SnapshotEntry,
        txn: &Transaction,
        should_gc: bool,
        writeback: &mut impl SendEvent<StoreSs>,
    ) {
        if txn.txn_id.is_internal() {
            self.store_snapshot(key, entry, should_gc)
        } else if writeback
            .send(StoreSs {
                key: key.clone(),
                entry,
            })
            .is_err()
        {
            warn!("dropping snapshot writeback for a terminated partition")
        }
    }

    // gc engine. insert the snapshot, then when the dict is over threshold
    // (or the caller demands it) shed history on both tables
    pub fn store_snapshot(&self, key: &Bytes, entry: SnapshotEntry, should_gc: bool) {
        let protocol = self.config.protocol;
        let cutoff = self.tables.snapshots.with_or_insert(key, |dict| {
            dict.insert_newer(entry, protocol);
            if dict.len() < SNAPSHOT_THRESHOLD && !should_gc {
                return None;
            }
            dict.retain_newest(SNAPSHOT_MIN);
            let seed = dict.oldest()?.vc.clone();
            Some(dict.iter().fold(seed, |low, entry| low.min_merge(&entry.vc)))
        });
        let Some(cutoff) = cutoff else { return };
        // ops shrink only after the dict no longer offers snapshots below
        // the cutoff, so a concurrent reader cannot pair an old snapshot
        // with an already pruned suffix
        self.tables.ops.with_existing(key, |entry| {
            let mut kept = entry
                .ops()
                .filter(|(_, op)| !op.commit_vc(protocol).le(&cutoff))
                .cloned()
                .collect::<Vec<_>>();
            if kept.is_empty() {
                // never leave a key bare while snapshots for it exist
                kept = entry.ops().take(1).cloned().collect()
            }
            let capacity = resized_capacity(kept.len(), entry.capacity());
            if kept.len() < entry.len() || capacity != entry.capacity() {
                debug!(
                    pruned = entry.len() - kept.len(),
                    capacity, "collected operation history"
                );
            }
            entry.rebuild(kept, capacity)
        });
    }

    // write path. only ever called from the partition command task, which
    // is what makes the reread after the gc-inducing read race free
    pub fn insert_op(&self, key: &Bytes, op: Operation) -> Result<(), UpdateError> {
        let (len, capacity, new_id) = self
            .tables
            .ops
            .with_or_insert(key, |entry| (entry.len(), entry.capacity(), entry.bump_op_id()));
        if len >= capacity || new_id % OPS_THRESHOLD as u64 == 0 {
            let txn = self.gc_read_txn(&op);
            self.read_internal(key, op.crdt_type, &txn, true, &mut Void)
                .map_err(UpdateError::OpGc)?;
        }
        if self
            .tables
            .ops
            .with_existing(key, |entry| entry.append(new_id, op))
            .is_none()
        {
            warn!("dropping update for a terminated partition")
        }
        Ok(())
    }

    fn gc_read_txn(&self, op: &Operation) -> Transaction {
        let protocol = self.config.protocol;
        match protocol {
            TransactionProtocol::Physics => {
                let vc = if op.dependency_vc.is_empty() {
                    VectorClock::new().with(self.config.dc_id, now_micros())
                } else {
                    op.dependency_vc.clone()
                };
                Transaction {
                    txn_id: TxnId::LogReplay,
                    protocol,
                    snapshot_vc: vc.clone(),
                    physics: Some(PhysicsReadMeta {
                        commit_time_lowbound: VectorClock::new(),
                        dep_upbound: vc,
                    }),
                }
            }
            _ => Transaction::snapshot_read(protocol, TxnId::LogReplay, op.snapshot_vc.clone()),
        }
    }
}
