//! System-wide halt switch raised by emergency interventions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::lock;
use crate::ids::RecordId;

/// Why the system was halted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltNotice {
    /// Intervention record that raised the halt.
    pub record_id: RecordId,
    /// Human-readable condition.
    pub reason: String,
    /// When the halt was raised.
    pub raised_at: DateTime<Utc>,
}

/// Halt switch shared through the execution context.
///
/// Several emergency records may hold the switch at once; it drops only
/// after every holder has released it.
#[derive(Debug, Default)]
pub struct HaltSwitch {
    raised: AtomicBool,
    holders: Mutex<BTreeMap<RecordId, HaltNotice>>,
}

impl HaltSwitch {
    /// A lowered switch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the system is halted.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Raise the halt on behalf of a record.
    ///
    /// Returns `false` if that record already holds it.
    pub fn raise(&self, notice: HaltNotice) -> bool {
        let mut holders = lock(&self.holders);
        if holders.contains_key(&notice.record_id) {
            return false;
        }
        holders.insert(notice.record_id.clone(), notice);
        self.raised.store(true, Ordering::Release);
        true
    }

    /// Release the hold of one record. Returns `true` when the switch drops.
    pub fn release(&self, record_id: &str) -> bool {
        let mut holders = lock(&self.holders);
        if holders.remove(record_id).is_none() {
            return false;
        }
        let empty = holders.is_empty();
        if empty {
            self.raised.store(false, Ordering::Release);
        }
        empty
    }

    /// Earliest active notice.
    pub fn notice(&self) -> Option<HaltNotice> {
        lock(&self.holders)
            .values()
            .min_by_key(|n| n.raised_at)
            .cloned()
    }

    /// Records currently holding the switch.
    pub fn holders(&self) -> Vec<RecordId> {
        lock(&self.holders).keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(id: &str) -> HaltNotice {
        HaltNotice {
            record_id: id.to_string(),
            reason: "dead letters".to_string(),
            raised_at: Utc::now(),
        }
    }

    #[test]
    fn test_raise_and_release() {
        let halt = HaltSwitch::new();
        assert!(!halt.is_raised());
        assert!(halt.raise(notice("r1")));
        assert!(halt.is_raised());
        assert!(!halt.raise(notice("r1")));
        assert!(halt.release("r1"));
        assert!(!halt.is_raised());
    }

    #[test]
    fn test_stays_raised_until_last_holder() {
        let halt = HaltSwitch::new();
        halt.raise(notice("r1"));
        halt.raise(notice("r2"));
        assert!(!halt.release("r1"));
        assert!(halt.is_raised());
        assert_eq!(halt.holders(), vec!["r2".to_string()]);
        assert!(halt.release("r2"));
        assert!(halt.notice().is_none());
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let halt = HaltSwitch::new();
        halt.raise(notice("r1"));
        assert!(!halt.release("other"));
        assert!(halt.is_raised());
    }
}
