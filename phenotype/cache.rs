// ========================================================================================
//
//                  The feature cache: at-most-once storage of computed counts
//
// ========================================================================================
//
// The first value put for a (feature, sample) key is the only one ever stored. A later
// put for the same key leaves the stored value alone and hands back both values, so a
// caller can tell "already computed" apart from "computed twice and disagreed". There
// is no update and no delete.

use crate::types::{FeatureId, FeatureValue, SampleId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::cmp::Ordering;

/// A put that found the key already occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlreadyComputedConflict {
    pub existing: FeatureValue,
    pub attempted: FeatureValue,
}

impl AlreadyComputedConflict {
    /// True when the two computations produced different counts.
    pub fn disagrees(&self) -> bool {
        self.existing.count != self.attempted.count
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    AlreadyComputed(AlreadyComputedConflict),
}

impl PutOutcome {
    pub fn conflict(&self) -> Option<&AlreadyComputedConflict> {
        match self {
            PutOutcome::Stored => None,
            PutOutcome::AlreadyComputed(conflict) => Some(conflict),
        }
    }
}

#[derive(Debug, Default)]
pub struct FeatureCache {
    entries: DashMap<(FeatureId, SampleId), FeatureValue>,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a cache from previously persisted values. Duplicate keys in the input are
    /// reported, first occurrence wins.
    pub fn from_values(
        values: impl IntoIterator<Item = FeatureValue>,
    ) -> (Self, Vec<AlreadyComputedConflict>) {
        let cache = Self::new();
        let conflicts = values
            .into_iter()
            .filter_map(|value| match cache.put(value) {
                PutOutcome::Stored => None,
                PutOutcome::AlreadyComputed(conflict) => Some(conflict),
            })
            .collect();
        (cache, conflicts)
    }

    /// Stores `value` iff its key is vacant. The shard lock covers only the existence
    /// check and the insert.
    pub fn put(&self, value: FeatureValue) -> PutOutcome {
        let key = (value.feature.clone(), value.sample.clone());
        let outcome = match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
                PutOutcome::Stored
            }
            Entry::Occupied(slot) => PutOutcome::AlreadyComputed(AlreadyComputedConflict {
                existing: slot.get().clone(),
                attempted: value,
            }),
        };

        if let PutOutcome::AlreadyComputed(conflict) = &outcome {
            if conflict.disagrees() {
                log::warn!(
                    "Feature '{}' for sample '{}' already holds count {}; discarding disagreeing count {}",
                    conflict.existing.feature,
                    conflict.existing.sample,
                    conflict.existing.count,
                    conflict.attempted.count
                );
            } else {
                log::debug!(
                    "Feature '{}' for sample '{}' already computed with the same count {}",
                    conflict.existing.feature,
                    conflict.existing.sample,
                    conflict.existing.count
                );
            }
        }
        outcome
    }

    /// `None` is the not-found signal, a normal outcome.
    pub fn get(&self, feature: &FeatureId, sample: &SampleId) -> Option<FeatureValue> {
        self.entries
            .get(&(feature.clone(), sample.clone()))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every stored value, in natural feature then sample order.
    pub fn values(&self) -> Vec<FeatureValue> {
        let mut values: Vec<FeatureValue> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        values.sort_by(|a, b| match natord::compare(a.feature.as_str(), b.feature.as_str()) {
            Ordering::Equal => natord::compare(a.sample.as_str(), b.sample.as_str()),
            other => other,
        });
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(count: u64) -> FeatureValue {
        FeatureValue {
            feature: FeatureId::from("CD15+"),
            sample: SampleId::from("WCM1"),
            count,
        }
    }

    #[test]
    fn miss_then_store_then_hit() {
        let cache = FeatureCache::new();
        let feature = FeatureId::from("CD15+");
        let sample = SampleId::from("WCM1");
        assert_eq!(cache.get(&feature, &sample), None);
        assert_eq!(cache.put(value(19115)), PutOutcome::Stored);
        assert_eq!(cache.get(&feature, &sample), Some(value(19115)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn second_put_reports_conflict_and_keeps_first_value() {
        let cache = FeatureCache::new();
        cache.put(value(19115));
        let outcome = cache.put(value(28134));
        let conflict = outcome.conflict().expect("second put must conflict");
        assert_eq!(conflict.existing.count, 19115);
        assert_eq!(conflict.attempted.count, 28134);
        assert!(conflict.disagrees());
        assert_eq!(
            cache
                .get(&FeatureId::from("CD15+"), &SampleId::from("WCM1"))
                .map(|v| v.count),
            Some(19115)
        );
    }

    #[test]
    fn agreeing_repeat_is_still_reported() {
        let cache = FeatureCache::new();
        cache.put(value(7));
        let outcome = cache.put(value(7));
        let conflict = outcome.conflict().unwrap();
        assert!(!conflict.disagrees());
    }

    #[test]
    fn warm_start_reports_duplicates_and_orders_snapshot() {
        let mut other_sample = value(3);
        other_sample.sample = SampleId::from("WCM10");
        let mut second = value(5);
        second.sample = SampleId::from("WCM2");

        let (cache, conflicts) =
            FeatureCache::from_values(vec![other_sample, value(1), second, value(9)]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].existing.count, 1);
        assert_eq!(conflicts[0].attempted.count, 9);

        let samples: Vec<String> = cache
            .values()
            .into_iter()
            .map(|v| v.sample.to_string())
            .collect();
        assert_eq!(samples, vec!["WCM1", "WCM2", "WCM10"]);
    }
}
