//! Plan-change rules
//!
//! Pure classification of a requested subject set against the current one.
//! Everything here is side-effect free; the subscription service calls it
//! before touching Stripe or the database.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::pricing::monthly_price_cents;

/// Reasons a requested change is rejected before reaching the provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanChangeError {
    #[error("at least one subject must remain selected")]
    EmptySelection,

    #[error("a change cannot add and remove subjects at the same time ({added} added, {removed} removed)")]
    MixedChange { added: usize, removed: usize },

    #[error("the selected subjects match the current subscription")]
    NoChange,

    #[error("unknown subjects: {0:?}")]
    UnknownSubjects(Vec<Uuid>),

    #[error("subject {0} is not scheduled for removal")]
    NotRestorable(Uuid),

    #[error("only scheduled removals can be restored")]
    RestoreOnUpgrade,
}

/// Direction of a subscription change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Price goes up: subjects are added
    Upgrade,
    /// Price goes down: subjects are removed
    Downgrade,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Upgrade => "upgrade",
            ChangeType::Downgrade => "downgrade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upgrade" => Some(ChangeType::Upgrade),
            "downgrade" => Some(ChangeType::Downgrade),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// When a change should take effect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTiming {
    /// Upgrades are charged and granted now; downgrades still wait for period end
    #[default]
    Immediate,
    /// Both directions wait for the next billing period
    EndOfPeriod,
}

/// A validated change from the current subject set to a target set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanChange {
    pub change_type: ChangeType,
    pub current: BTreeSet<Uuid>,
    pub target: BTreeSet<Uuid>,
    pub added: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

impl PlanChange {
    /// Validate and classify a change. Duplicate ids in `target` collapse.
    pub fn classify(current: &BTreeSet<Uuid>, target: &[Uuid]) -> Result<Self, PlanChangeError> {
        let target: BTreeSet<Uuid> = target.iter().copied().collect();

        if target.is_empty() {
            return Err(PlanChangeError::EmptySelection);
        }

        let added: Vec<Uuid> = target.difference(current).copied().collect();
        let removed: Vec<Uuid> = current.difference(&target).copied().collect();

        let change_type = match (added.is_empty(), removed.is_empty()) {
            (true, true) => return Err(PlanChangeError::NoChange),
            (false, true) => ChangeType::Upgrade,
            (true, false) => ChangeType::Downgrade,
            (false, false) => {
                return Err(PlanChangeError::MixedChange {
                    added: added.len(),
                    removed: removed.len(),
                })
            }
        };

        Ok(Self {
            change_type,
            current: current.clone(),
            target,
            added,
            removed,
        })
    }

    pub fn current_price_cents(&self) -> i64 {
        monthly_price_cents(self.current.len())
    }

    pub fn new_price_cents(&self) -> i64 {
        monthly_price_cents(self.target.len())
    }

    pub fn price_delta_cents(&self) -> i64 {
        self.new_price_cents() - self.current_price_cents()
    }

    /// Whether entitlements and charges apply right away
    pub fn applies_immediately(&self, timing: ChangeTiming) -> bool {
        self.change_type == ChangeType::Upgrade && timing == ChangeTiming::Immediate
    }
}

/// Put scheduled removals back into a pending downgrade's target set
///
/// Every id in `restore` must be in `previous` but not in `target`.
pub fn restore_subjects(
    previous: &BTreeSet<Uuid>,
    target: &BTreeSet<Uuid>,
    restore: &[Uuid],
) -> Result<BTreeSet<Uuid>, PlanChangeError> {
    let mut restored = target.clone();
    for id in restore {
        if !previous.contains(id) || target.contains(id) {
            return Err(PlanChangeError::NotRestorable(*id));
        }
        restored.insert(*id);
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn set(ids: &[Uuid]) -> BTreeSet<Uuid> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_adding_subjects_is_upgrade() {
        let all = ids(3);
        let change = PlanChange::classify(&set(&all[..1]), &all).unwrap();

        assert_eq!(change.change_type, ChangeType::Upgrade);
        assert_eq!(change.added.len(), 2);
        assert!(change.removed.is_empty());
        assert_eq!(change.current_price_cents(), 499);
        assert_eq!(change.new_price_cents(), 997);
        assert_eq!(change.price_delta_cents(), 498);
    }

    #[test]
    fn test_removing_subjects_is_downgrade() {
        let all = ids(3);
        let change = PlanChange::classify(&set(&all), &all[..2]).unwrap();

        assert_eq!(change.change_type, ChangeType::Downgrade);
        assert_eq!(change.removed, vec![all[2]]);
        assert!(change.added.is_empty());
        assert_eq!(change.price_delta_cents(), -249);
    }

    #[test]
    fn test_empty_selection_rejected() {
        let all = ids(2);
        assert_eq!(
            PlanChange::classify(&set(&all), &[]),
            Err(PlanChangeError::EmptySelection)
        );
    }

    #[test]
    fn test_mixed_change_rejected() {
        let all = ids(3);
        let err = PlanChange::classify(&set(&all[..2]), &[all[0], all[2]]).unwrap_err();
        assert_eq!(
            err,
            PlanChangeError::MixedChange {
                added: 1,
                removed: 1
            }
        );
    }

    #[test]
    fn test_same_set_is_no_change() {
        let all = ids(2);
        // Order and duplicates do not matter
        let target = vec![all[1], all[0], all[1]];
        assert_eq!(
            PlanChange::classify(&set(&all), &target),
            Err(PlanChangeError::NoChange)
        );
    }

    #[test]
    fn test_timing() {
        let all = ids(2);
        let upgrade = PlanChange::classify(&set(&all[..1]), &all).unwrap();
        let downgrade = PlanChange::classify(&set(&all), &all[..1]).unwrap();

        assert!(upgrade.applies_immediately(ChangeTiming::Immediate));
        assert!(!upgrade.applies_immediately(ChangeTiming::EndOfPeriod));
        assert!(!downgrade.applies_immediately(ChangeTiming::Immediate));
    }

    #[test]
    fn test_restore_subjects() {
        let all = ids(4);
        let previous = set(&all);
        let target = set(&all[..1]);

        let restored = restore_subjects(&previous, &target, &[all[2]]).unwrap();
        assert_eq!(restored, set(&[all[0], all[2]]));

        // Already kept
        assert_eq!(
            restore_subjects(&previous, &target, &[all[0]]),
            Err(PlanChangeError::NotRestorable(all[0]))
        );

        // Never subscribed
        let stranger = Uuid::new_v4();
        assert_eq!(
            restore_subjects(&previous, &target, &[stranger]),
            Err(PlanChangeError::NotRestorable(stranger))
        );
    }

    #[test]
    fn test_change_type_serde() {
        assert_eq!(serde_json::to_string(&ChangeType::Downgrade).unwrap(), "\"downgrade\"");
        assert_eq!(ChangeType::parse("upgrade"), Some(ChangeType::Upgrade));
        assert_eq!(ChangeType::parse("sidegrade"), None);

        let timing: ChangeTiming = serde_json::from_str("\"end_of_period\"").unwrap();
        assert_eq!(timing, ChangeTiming::EndOfPeriod);
        assert_eq!(ChangeTiming::default(), ChangeTiming::Immediate);
    }
}
