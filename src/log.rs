use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    clock::VectorClock,
    crdt::CrdtType,
    protocol::{CommitParams, Operation, Snapshot, TransactionProtocol},
    ring::PartitionId,
};

pub type LogPosition = u64;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log is not ready")]
    NotReady,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub enum LogChunk {
    Page {
        next: LogPosition,
        ops: Vec<Operation>,
    },
    Eof {
        ops: Vec<Operation>,
    },
}

// reply to the per-key fallback read: a base snapshot plus the committed
// suffix the caller replays exactly like a cache hit
#[derive(Debug, Clone)]
pub struct LogRead {
    pub base: Snapshot,
    pub params: CommitParams,
    pub ops: Vec<Operation>,
    pub is_newest: bool,
}

// the commit log is the partition's source of truth. the materializer
// only consumes it: paged streaming at startup and the per-key read
// when the snapshot cache cannot answer
pub trait Log: Send + Sync {
    fn get_all(
        &self,
        partition: PartitionId,
        from: Option<LogPosition>,
    ) -> Result<LogChunk, LogError>;

    fn get(
        &self,
        partition: PartitionId,
        key: &Bytes,
        crdt_type: CrdtType,
        upto: &VectorClock,
        protocol: TransactionProtocol,
    ) -> Result<LogRead, LogError>;
}

const MEM_LOG_PAGE: usize = 128;

#[derive(Debug, Default)]
struct MemLogState {
    ops: HashMap<PartitionId, Vec<Operation>>,
    ready: bool,
}

// in-memory log for tests and single-node deployments
#[derive(Debug)]
pub struct MemLog(Mutex<MemLogState>);

impl Default for MemLog {
    fn default() -> Self {
        Self(Mutex::new(MemLogState {
            ops: Default::default(),
            ready: true,
        }))
    }
}

impl MemLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, partition: PartitionId, op: Operation) {
        self.0.lock().ops.entry(partition).or_default().push(op)
    }

    pub fn set_ready(&self, ready: bool) {
        self.0.lock().ready = ready
    }
}

impl Log for MemLog {
    fn get_all(
        &self,
        partition: PartitionId,
        from: Option<LogPosition>,
    ) -> Result<LogChunk, LogError> {
        let state = self.0.lock();
        if !state.ready {
            return Err(LogError::NotReady);
        }
        let ops = state.ops.get(&partition).map(Vec::as_slice).unwrap_or(&[]);
        let from = from.unwrap_or_default() as usize;
        if from > ops.len() {
            return Err(anyhow::format_err!("continuation {from} out of range").into());
        }
        let end = (from + MEM_LOG_PAGE).min(ops.len());
        let page = ops[from..end].to_vec();
        if end < ops.len() {
            Ok(LogChunk::Page {
                next: end as _,
                ops: page,
            })
        } else {
            Ok(LogChunk::Eof { ops: page })
        }
    }

    fn get(
        &self,
        partition: PartitionId,
        key: &Bytes,
        crdt_type: CrdtType,
        upto: &VectorClock,
        protocol: TransactionProtocol,
    ) -> Result<LogRead, LogError> {
        let state = self.0.lock();
        if !state.ready {
            return Err(LogError::NotReady);
        }
        let ops = state
            .ops
            .get(&partition)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter(|op| op.key == *key && op.commit_vc(protocol).le(upto))
            .cloned()
            .collect();
        Ok(LogRead {
            base: Snapshot::blank(crdt_type),
            params: CommitParams::Ignore,
            ops,
            is_newest: false,
        })
    }
}
