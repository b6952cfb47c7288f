use std::{cmp::Ordering, collections::BTreeMap, time::SystemTime};

use serde::{Deserialize, Serialize};

pub type DcId = u16;

pub fn now_micros() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .unwrap_or_default()
        .as_micros() as _
}

// per-datacenter timestamp vector. missing entries read as zero and zero
// entries are elided, so structural equality matches the partial order's
// equality
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<DcId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dc: DcId) -> u64 {
        self.0.get(&dc).copied().unwrap_or_default()
    }

    pub fn set(&mut self, dc: DcId, timestamp: u64) {
        if timestamp == 0 {
            self.0.remove(&dc);
        } else {
            self.0.insert(dc, timestamp);
        }
    }

    pub fn with(mut self, dc: DcId, timestamp: u64) -> Self {
        self.set(dc, timestamp);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn le(&self, other: &Self) -> bool {
        self.0
            .iter()
            .all(|(dc, timestamp)| *timestamp <= other.get(*dc))
    }

    pub fn ge(&self, other: &Self) -> bool {
        other.le(self)
    }

    // pointwise max
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (dc, timestamp) in &other.0 {
            merged
                .entry(*dc)
                .and_modify(|t| *t = (*t).max(*timestamp))
                .or_insert(*timestamp);
        }
        Self(merged)
    }

    // pointwise min, where a missing entry means zero
    pub fn min_merge(&self, other: &Self) -> Self {
        Self(
            self.0
                .iter()
                .filter_map(|(dc, timestamp)| {
                    other.0.get(dc).map(|t| (*dc, (*timestamp).min(*t)))
                })
                .collect(),
        )
    }
}

impl FromIterator<(DcId, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (DcId, u64)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .filter(|(_, timestamp)| *timestamp != 0)
                .collect(),
        )
    }
}

impl<const N: usize> From<[(DcId, u64); N]> for VectorClock {
    fn from(entries: [(DcId, u64); N]) -> Self {
        entries.into_iter().collect()
    }
}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.le(other), other.le(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use rand::{thread_rng, Rng};

    use super::*;

    fn random_vc(rng: &mut impl Rng) -> VectorClock {
        (0..rng.gen_range(0..4u16))
            .map(|dc| (dc, rng.gen_range(0..4u64)))
            .collect()
    }

    #[test]
    fn missing_entry_reads_zero() {
        let vc = VectorClock::from([(1, 10)]);
        assert_eq!(vc.get(1), 10);
        assert_eq!(vc.get(2), 0);
        assert!(VectorClock::from([(2, 0)]).is_empty())
    }

    #[test]
    fn partial_order_ignores_elided_zero() {
        let a = VectorClock::from([(1, 1)]);
        let b = VectorClock::from([(1, 1), (2, 0)]);
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Equal));
        assert_eq!(a, b)
    }

    #[test]
    fn concurrent_clocks_incomparable() {
        let a = VectorClock::from([(1, 1)]);
        let b = VectorClock::from([(2, 1)]);
        assert!(!a.le(&b));
        assert!(!b.le(&a));
        assert_eq!(a.partial_cmp(&b), None)
    }

    #[test]
    fn merge_dominates_both() {
        let mut rng = thread_rng();
        for _ in 0..1000 {
            let a = random_vc(&mut rng);
            let b = random_vc(&mut rng);
            let merged = a.merge(&b);
            assert!(a.le(&merged));
            assert!(b.le(&merged));
            let low = a.min_merge(&b);
            assert!(low.le(&a));
            assert!(low.le(&b))
        }
    }

    #[test]
    fn min_merge_is_pointwise() {
        let a = VectorClock::from([(1, 3), (2, 7)]);
        let b = VectorClock::from([(1, 5), (3, 2)]);
        assert_eq!(a.min_merge(&b), VectorClock::from([(1, 3)]))
    }
}
