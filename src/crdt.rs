use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// replicated type registry. operation payloads are downstream effects: the
// coordinator already resolved them against its read snapshot, the
// materializer only folds them, so every `apply` must commute with
// reordering of concurrent effects. dedup of redelivered effects is done by
// op id upstream, not here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrdtType {
    GCounter,
    PnCounter,
    LwwRegister,
    GSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrdtValue {
    GCounter(u64),
    PnCounter(i64),
    // (timestamp, payload), highest pair wins
    LwwRegister(Option<(u64, Bytes)>),
    GSet(BTreeSet<Bytes>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrdtOp {
    Increment(u64),
    Decrement(u64),
    Assign(u64, Bytes),
    Insert(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    Counter(i64),
    Register(Option<Bytes>),
    Set(Vec<Bytes>),
}

impl CrdtType {
    pub fn new(self) -> CrdtValue {
        match self {
            Self::GCounter => CrdtValue::GCounter(0),
            Self::PnCounter => CrdtValue::PnCounter(0),
            Self::LwwRegister => CrdtValue::LwwRegister(None),
            Self::GSet => CrdtValue::GSet(Default::default()),
        }
    }
}

impl CrdtValue {
    pub fn apply(&mut self, op: &CrdtOp) -> anyhow::Result<()> {
        match (self, op) {
            (Self::GCounter(count), CrdtOp::Increment(delta)) => *count += delta,
            (Self::PnCounter(count), CrdtOp::Increment(delta)) => *count += *delta as i64,
            (Self::PnCounter(count), CrdtOp::Decrement(delta)) => *count -= *delta as i64,
            (Self::LwwRegister(slot), CrdtOp::Assign(timestamp, payload)) => {
                let incoming = (*timestamp, payload.clone());
                if slot.as_ref() < Some(&incoming) {
                    *slot = Some(incoming)
                }
            }
            (Self::GSet(members), CrdtOp::Insert(member)) => {
                members.insert(member.clone());
            }
            (value, op) => anyhow::bail!("operation {op:?} does not apply to {value:?}"),
        }
        Ok(())
    }

    pub fn value(&self) -> ReadResult {
        match self {
            Self::GCounter(count) => ReadResult::Counter(*count as _),
            Self::PnCounter(count) => ReadResult::Counter(*count),
            Self::LwwRegister(slot) => {
                ReadResult::Register(slot.as_ref().map(|(_, payload)| payload.clone()))
            }
            Self::GSet(members) => ReadResult::Set(members.iter().cloned().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_folds_increments() -> anyhow::Result<()> {
        let mut value = CrdtType::GCounter.new();
        for _ in 0..10 {
            value.apply(&CrdtOp::Increment(1))?
        }
        assert_eq!(value.value(), ReadResult::Counter(10));
        Ok(())
    }

    #[test]
    fn pn_counter_goes_negative() -> anyhow::Result<()> {
        let mut value = CrdtType::PnCounter.new();
        value.apply(&CrdtOp::Increment(2))?;
        value.apply(&CrdtOp::Decrement(5))?;
        assert_eq!(value.value(), ReadResult::Counter(-3));
        Ok(())
    }

    #[test]
    fn register_keeps_highest_timestamp() -> anyhow::Result<()> {
        let mut value = CrdtType::LwwRegister.new();
        value.apply(&CrdtOp::Assign(7, Bytes::from_static(b"late")))?;
        value.apply(&CrdtOp::Assign(3, Bytes::from_static(b"early")))?;
        assert_eq!(
            value.value(),
            ReadResult::Register(Some(Bytes::from_static(b"late")))
        );
        Ok(())
    }

    #[test]
    fn set_insert_is_idempotent() -> anyhow::Result<()> {
        let mut value = CrdtType::GSet.new();
        value.apply(&CrdtOp::Insert(Bytes::from_static(b"a")))?;
        value.apply(&CrdtOp::Insert(Bytes::from_static(b"a")))?;
        assert_eq!(value.value(), ReadResult::Set(vec![Bytes::from_static(b"a")]));
        Ok(())
    }

    #[test]
    fn mismatched_op_rejected() {
        let mut value = CrdtType::GCounter.new();
        assert!(value.apply(&CrdtOp::Insert(Bytes::new())).is_err())
    }
}
