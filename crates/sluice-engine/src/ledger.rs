use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use sluice_core::error::{Result, SluiceError};
use sluice_core::types::{ArtifactRecord, ArtifactTag};

/// How many retired artifacts a ledger keeps around.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Cap on `old` entries; the oldest are evicted first. `None` keeps all.
    pub max_old: Option<usize>,
    /// Remove evicted artifacts from the backend as well.
    pub delete_evicted: bool,
}

/// What one `advance` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceReport {
    /// `new` -> `current`
    pub promoted: usize,
    /// `current` -> `old`
    pub retired: usize,
    /// Keys dropped by the retention policy, oldest first.
    pub evicted: Vec<String>,
}

/// Per-resource record of artifact lifecycle tags.
///
/// Tags only move forward (`new -> current -> old`). Evicted keys stay
/// remembered until [`forget`](Self::forget) releases them, so a blob that
/// is still on the backend is never ingested twice.
#[derive(Debug, Default)]
pub struct ArtifactLedger {
    owner: String,
    /// Live records keyed by insertion sequence.
    records: BTreeMap<u64, ArtifactRecord>,
    /// Every key recorded and not forgotten, including evicted ones.
    seen: HashSet<String>,
    next_seq: u64,
}

impl ArtifactLedger {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Default::default()
        }
    }

    /// Add a record under `tag`. Fails if `key` was ever recorded.
    pub fn record(&mut self, key: &str, tag: ArtifactTag) -> Result<ArtifactRecord> {
        if !self.seen.insert(key.to_string()) {
            return Err(SluiceError::DuplicateArtifact {
                node: self.owner.clone(),
                key: key.to_string(),
            });
        }
        let record = ArtifactRecord {
            key: key.to_string(),
            tag,
            created_at: Utc::now(),
            owner: self.owner.clone(),
            seq: self.next_seq,
        };
        self.records.insert(self.next_seq, record.clone());
        self.next_seq += 1;
        Ok(record)
    }

    /// Drop `key` entirely so it can be recorded again. Returns whether it was known.
    pub fn forget(&mut self, key: &str) -> bool {
        self.records.retain(|_, r| r.key != key);
        self.seen.remove(key)
    }

    /// Whether `key` has ever been recorded (evicted keys included).
    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn get(&self, key: &str) -> Option<&ArtifactRecord> {
        self.records.values().find(|r| r.key == key)
    }

    /// Keys under `tag`, oldest first.
    pub fn list(&self, tag: ArtifactTag) -> Vec<String> {
        let mut matching: Vec<&ArtifactRecord> =
            self.records.values().filter(|r| r.tag == tag).collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        matching.into_iter().map(|r| r.key.clone()).collect()
    }

    /// Live records under `tag`, or all live records.
    pub fn count(&self, tag: Option<ArtifactTag>) -> usize {
        match tag {
            Some(tag) => self.records.values().filter(|r| r.tag == tag).count(),
            None => self.records.len(),
        }
    }

    pub fn records(&self) -> Vec<ArtifactRecord> {
        self.records.values().cloned().collect()
    }

    /// Retire `current`, promote `new`, then enforce `policy`.
    pub fn advance(&mut self, policy: &RetentionPolicy) -> AdvanceReport {
        let mut report = AdvanceReport::default();

        for record in self.records.values_mut() {
            match record.tag {
                ArtifactTag::Current => {
                    record.tag = ArtifactTag::Old;
                    report.retired += 1;
                }
                ArtifactTag::New => {
                    record.tag = ArtifactTag::Current;
                    report.promoted += 1;
                }
                ArtifactTag::Old => {}
            }
        }

        if let Some(max_old) = policy.max_old {
            let old_seqs: Vec<u64> = self
                .records
                .iter()
                .filter(|(_, r)| r.tag == ArtifactTag::Old)
                .map(|(seq, _)| *seq)
                .collect();
            let excess = old_seqs.len().saturating_sub(max_old);
            for seq in old_seqs.into_iter().take(excess) {
                if let Some(record) = self.records.remove(&seq) {
                    report.evicted.push(record.key);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("haiku/test_file{}.txt", i)).collect()
    }

    #[test]
    fn test_ten_records_then_advance() {
        let mut ledger = ArtifactLedger::new("haiku_data_store");
        let keys = keys(10);
        for k in &keys {
            ledger.record(k, ArtifactTag::New).unwrap();
        }
        assert_eq!(ledger.list(ArtifactTag::New), keys);

        let report = ledger.advance(&RetentionPolicy::default());
        assert_eq!(report.promoted, 10);
        assert_eq!(report.retired, 0);
        assert_eq!(ledger.list(ArtifactTag::Current), keys);
        assert!(ledger.list(ArtifactTag::New).is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut ledger = ArtifactLedger::new("store");
        ledger.record("a", ArtifactTag::New).unwrap();
        let err = ledger.record("a", ArtifactTag::Current).unwrap_err();
        assert!(matches!(err, SluiceError::DuplicateArtifact { .. }));
        assert_eq!(ledger.count(None), 1);
    }

    #[test]
    fn test_retention_evicts_oldest_and_remembers_keys() {
        let mut ledger = ArtifactLedger::new("store");
        let policy = RetentionPolicy {
            max_old: Some(1),
            delete_evicted: false,
        };
        for batch in 0..3 {
            ledger.record(&format!("k{}", batch), ArtifactTag::New).unwrap();
            ledger.advance(&policy);
        }
        // k2 current, k1 old, k0 evicted
        assert_eq!(ledger.list(ArtifactTag::Current), vec!["k2"]);
        assert_eq!(ledger.list(ArtifactTag::Old), vec!["k1"]);
        assert!(ledger.get("k0").is_none());
        assert!(ledger.contains("k0"));
        assert!(ledger.record("k0", ArtifactTag::New).is_err());
    }

    #[test]
    fn test_forget_releases_live_and_evicted_keys() {
        let mut ledger = ArtifactLedger::new("store");
        let policy = RetentionPolicy {
            max_old: Some(0),
            delete_evicted: true,
        };
        ledger.record("latest.txt", ArtifactTag::New).unwrap();
        ledger.record("model0.txt", ArtifactTag::Current).unwrap();

        assert!(ledger.forget("model0.txt"));
        assert!(ledger.get("model0.txt").is_none());
        assert_eq!(ledger.count(None), 1);

        ledger.advance(&policy);
        let report = ledger.advance(&policy);
        assert_eq!(report.evicted, vec!["latest.txt"]);
        assert!(ledger.forget("latest.txt"));
        assert!(!ledger.contains("latest.txt"));
        ledger.record("latest.txt", ArtifactTag::New).unwrap();
        assert_eq!(ledger.list(ArtifactTag::New), vec!["latest.txt"]);

        assert!(!ledger.forget("never.txt"));
    }

    #[test]
    fn test_advance_with_nothing_new_retires_current() {
        let mut ledger = ArtifactLedger::new("store");
        ledger.record("model0", ArtifactTag::Current).unwrap();
        let report = ledger.advance(&RetentionPolicy::default());
        assert_eq!(report.retired, 1);
        assert_eq!(report.promoted, 0);
        assert_eq!(ledger.count(Some(ArtifactTag::Old)), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Record,
        Advance,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![3 => Just(Op::Record), 1 => Just(Op::Advance)]
    }

    proptest! {
        #[test]
        fn tags_never_move_backwards(
            ops in proptest::collection::vec(op(), 1..60),
            max_old in proptest::option::of(0usize..4),
        ) {
            let policy = RetentionPolicy { max_old, delete_evicted: false };
            let mut ledger = ArtifactLedger::new("store");
            let mut last_seen: std::collections::HashMap<String, ArtifactTag> = Default::default();
            let mut next = 0usize;

            for op in ops {
                match op {
                    Op::Record => {
                        ledger.record(&format!("k{}", next), ArtifactTag::New).unwrap();
                        next += 1;
                    }
                    Op::Advance => {
                        ledger.advance(&policy);
                    }
                }
                for record in ledger.records() {
                    if let Some(prev) = last_seen.get(&record.key) {
                        prop_assert!(record.tag >= *prev);
                    }
                    last_seen.insert(record.key.clone(), record.tag);
                }
                if let Some(cap) = max_old {
                    prop_assert!(ledger.count(Some(ArtifactTag::Old)) <= cap);
                }
            }
        }
    }
}
