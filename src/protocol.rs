use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    clock::{DcId, VectorClock},
    crdt::{CrdtOp, CrdtType, CrdtValue},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionProtocol {
    ClockSi,
    Gr,
    Physics,
}

impl FromStr for TransactionProtocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "clocksi" => Ok(Self::ClockSi),
            "gr" => Ok(Self::Gr),
            "physics" => Ok(Self::Physics),
            _ => anyhow::bail!("unknown transactional protocol {s}"),
        }
    }
}

// immutable per-partition configuration, captured once at init
#[derive(Debug, Clone)]
pub struct Config {
    pub protocol: TransactionProtocol,
    pub recover_from_log: bool,
    pub dc_id: DcId,
}

impl Config {
    pub fn new(protocol: TransactionProtocol, dc_id: DcId) -> Self {
        Self {
            protocol,
            recover_from_log: false,
            dc_id,
        }
    }
}

// the two non-client ids mark internally issued reads: their snapshot
// writeback must happen synchronously in place, otherwise the write path
// (which reads to induce gc) and the read path (which writes back
// snapshots) would recurse into each other forever
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnId {
    Client(u64),
    Test,
    LogReplay,
}

impl TxnId {
    pub fn is_internal(&self) -> bool {
        !matches!(self, Self::Client(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicsReadMeta {
    pub commit_time_lowbound: VectorClock,
    pub dep_upbound: VectorClock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_id: TxnId,
    pub protocol: TransactionProtocol,
    pub snapshot_vc: VectorClock,
    // present iff protocol is physics
    pub physics: Option<PhysicsReadMeta>,
}

impl Transaction {
    pub fn snapshot_read(protocol: TransactionProtocol, txn_id: TxnId, vc: VectorClock) -> Self {
        Self {
            txn_id,
            protocol,
            snapshot_vc: vc,
            physics: None,
        }
    }

    pub fn physics_meta(&self) -> PhysicsReadMeta {
        self.physics.clone().unwrap_or_default()
    }
}

// per-protocol commit metadata attached to a cached snapshot and returned
// from reads. `Ignore` marks snapshots materialized by the read path
// itself: they carry no commit identity of their own, so the
// already-in-snapshot test must pass every operation through and leave
// dedup to the op id filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitParams {
    Ignore,
    Vc(VectorClock),
    Physics {
        commit_vc: VectorClock,
        dependency_vc: VectorClock,
        read_vc: VectorClock,
    },
}

impl CommitParams {
    // the vector an operation's commit vector is compared against by
    // `op_not_already_in_snapshot`
    pub fn base_vc(&self) -> Option<&VectorClock> {
        match self {
            Self::Ignore => None,
            Self::Vc(vc) => Some(vc),
            Self::Physics { commit_vc, .. } => Some(commit_vc),
        }
    }

    pub fn dependency_vc(&self) -> Option<&VectorClock> {
        match self {
            Self::Physics { dependency_vc, .. } => Some(dependency_vc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub key: Bytes,
    pub crdt_type: CrdtType,
    pub payload: CrdtOp,
    pub snapshot_vc: VectorClock,
    pub dependency_vc: VectorClock,
    pub dc_and_commit_time: (DcId, u64),
    pub txid: u64,
}

impl Operation {
    // commit vector: the dependency base (per protocol) with the
    // originating dc's component raised to the local commit time
    pub fn commit_vc(&self, protocol: TransactionProtocol) -> VectorClock {
        let (dc, commit_time) = self.dc_and_commit_time;
        let base = match protocol {
            TransactionProtocol::Physics => &self.dependency_vc,
            _ => &self.snapshot_vc,
        };
        base.clone().with(dc, commit_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_op_id: u64,
    pub value: CrdtValue,
}

impl Snapshot {
    pub fn blank(crdt_type: CrdtType) -> Self {
        Self {
            last_op_id: 0,
            value: crdt_type.new(),
        }
    }
}

// whether an operation may anchor a read's snapshot under physics: the
// read vector must have caught up to the commit-time lowbound while the
// operation's dependencies stay within the allowed upbound
pub fn is_causally_compatible(
    read_vc: &VectorClock,
    commit_time_lowbound: &VectorClock,
    op_dependency_vc: &VectorClock,
    dep_upbound: &VectorClock,
) -> bool {
    read_vc.ge(commit_time_lowbound) && op_dependency_vc.le(dep_upbound)
}

// true when the operation is not yet folded into a snapshot whose commit
// vector is `base`. a snapshot without commit identity cannot witness any
// operation, so everything passes
pub fn op_not_already_in_snapshot(base: Option<&VectorClock>, op_commit_vc: &VectorClock) -> bool {
    match base {
        None => true,
        Some(base) => !op_commit_vc.le(base),
    }
}
