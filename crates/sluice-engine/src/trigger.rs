use sluice_core::types::ArtifactTag;

use crate::ledger::ArtifactLedger;

/// Pure predicate over a resource node's ledger.
///
/// Re-evaluated after every ledger mutation. Must not have side effects.
pub trait TriggerCondition: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn evaluate(&self, ledger: &ArtifactLedger) -> bool;

    /// True when the condition holds regardless of ledger contents.
    fn is_unconditional(&self) -> bool {
        false
    }
}

/// Fires once at least `k` artifacts are tagged `new`.
#[derive(Debug, Clone, Copy)]
pub struct NewArtifactThreshold(pub usize);

impl Default for NewArtifactThreshold {
    fn default() -> Self {
        Self(1)
    }
}

impl TriggerCondition for NewArtifactThreshold {
    fn name(&self) -> &str {
        "new_artifact_threshold"
    }

    fn evaluate(&self, ledger: &ArtifactLedger) -> bool {
        ledger.count(Some(ArtifactTag::New)) >= self.0.max(1)
    }
}

/// Fires every epoch. Used by passthrough stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct Always;

impl TriggerCondition for Always {
    fn name(&self) -> &str {
        "always"
    }

    fn evaluate(&self, _ledger: &ArtifactLedger) -> bool {
        true
    }

    fn is_unconditional(&self) -> bool {
        true
    }
}

/// Map a configured threshold to a condition; 0 means fire every epoch.
pub fn from_threshold(threshold: usize) -> Box<dyn TriggerCondition> {
    if threshold == 0 {
        Box::new(Always)
    } else {
        Box::new(NewArtifactThreshold(threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_counts_only_new() {
        let mut ledger = ArtifactLedger::new("store");
        let cond = NewArtifactThreshold(2);
        assert!(!cond.evaluate(&ledger));

        ledger.record("a", ArtifactTag::New).unwrap();
        ledger.record("b", ArtifactTag::Current).unwrap();
        assert!(!cond.evaluate(&ledger));

        ledger.record("c", ArtifactTag::New).unwrap();
        assert!(cond.evaluate(&ledger));
    }

    #[test]
    fn test_default_threshold_is_one() {
        let mut ledger = ArtifactLedger::new("store");
        let cond = NewArtifactThreshold::default();
        assert!(!cond.evaluate(&ledger));
        ledger.record("a", ArtifactTag::New).unwrap();
        assert!(cond.evaluate(&ledger));
    }

    #[test]
    fn test_from_threshold() {
        assert!(from_threshold(0).is_unconditional());
        assert_eq!(from_threshold(3).name(), "new_artifact_threshold");
    }
}
