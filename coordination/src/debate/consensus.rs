//! Consensus strategies: vote tallying and decision selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::state::DebateSession;
use crate::ids::SessionId;

/// Rule a vote tally must satisfy to produce a decision.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsensusStrategy {
    /// Most votes wins.
    #[default]
    Plurality,
    /// More than half of the votes cast.
    Majority,
    /// At least `threshold` (0.0–1.0) of the votes cast.
    Supermajority { threshold: f64 },
    /// Every vote cast for the same position.
    Unanimous,
}

impl std::fmt::Display for ConsensusStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plurality => write!(f, "plurality"),
            Self::Majority => write!(f, "majority"),
            Self::Supermajority { threshold } => write!(f, "supermajority({:.2})", threshold),
            Self::Unanimous => write!(f, "unanimous"),
        }
    }
}

/// Votes per position.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tally {
    /// Count per position.
    pub counts: BTreeMap<String, usize>,
    /// Total votes cast.
    pub total: usize,
}

impl Tally {
    /// Count the current votes of a session.
    pub fn of(session: &DebateSession) -> Self {
        let mut counts = BTreeMap::new();
        for vote in session.votes.values() {
            *counts.entry(vote.position.clone()).or_insert(0) += 1;
        }
        Self {
            counts,
            total: session.votes.len(),
        }
    }

    /// Votes for one position.
    pub fn count(&self, position: &str) -> usize {
        self.counts.get(position).copied().unwrap_or(0)
    }
}

/// Winning position chosen from a tally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Winning position.
    pub position: String,
    /// Whether an exact tie was broken by argument order.
    pub tie_broken: bool,
}

impl ConsensusStrategy {
    /// Pick the winning position or explain why there is none.
    ///
    /// `argued_order` lists positions by their first argument; leaders with
    /// equal counts are ordered by it.
    pub fn select(&self, tally: &Tally, argued_order: &[&str]) -> Result<Selection, String> {
        if tally.total == 0 {
            return Err("no votes cast".to_string());
        }
        let top = tally.counts.values().copied().max().unwrap_or(0);
        let mut leaders: Vec<&str> = argued_order
            .iter()
            .copied()
            .filter(|p| tally.count(p) == top)
            .collect();
        // Positions missing from the argument order still count.
        for position in tally.counts.keys() {
            if tally.count(position) == top && !leaders.contains(&position.as_str()) {
                leaders.push(position.as_str());
            }
        }
        let Some(winner) = leaders.first() else {
            return Err("no leading position".to_string());
        };

        let share = top as f64 / tally.total as f64;
        let satisfied = match self {
            Self::Plurality => true,
            Self::Majority => top * 2 > tally.total,
            Self::Supermajority { threshold } => share >= *threshold,
            Self::Unanimous => top == tally.total,
        };
        if !satisfied {
            return Err(format!(
                "{} not reached: '{}' has {}/{} votes",
                self, winner, top, tally.total
            ));
        }

        Ok(Selection {
            position: (*winner).to_string(),
            tie_broken: leaders.len() > 1,
        })
    }

    /// Check that the strategy is usable.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Supermajority { threshold } if !(0.5..=1.0).contains(threshold) => Err(format!(
                "supermajority threshold must be within 0.5..=1.0, got {}",
                threshold
            )),
            _ => Ok(()),
        }
    }
}

/// Result of a resolved debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Session decided.
    pub session_id: SessionId,
    /// Topic of the session.
    pub topic: String,
    /// Winning position.
    pub position: String,
    /// Final tally.
    pub tally: Tally,
    /// Total votes counted.
    pub votes_cast: usize,
    /// Whether the result came from the tie-break.
    pub tie_broken: bool,
    /// Strategy applied.
    pub strategy: ConsensusStrategy,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(votes: &[(&str, usize)]) -> Tally {
        let counts: BTreeMap<String, usize> =
            votes.iter().map(|(p, c)| (p.to_string(), *c)).collect();
        let total = counts.values().sum();
        Tally { counts, total }
    }

    #[test]
    fn test_plurality_picks_leader() {
        let t = tally(&[("a", 2), ("b", 1), ("c", 1)]);
        let s = ConsensusStrategy::Plurality.select(&t, &["b", "a", "c"]).unwrap();
        assert_eq!(s.position, "a");
        assert!(!s.tie_broken);
    }

    #[test]
    fn test_tie_broken_by_first_argument() {
        let t = tally(&[("a", 2), ("b", 2)]);
        let s = ConsensusStrategy::Plurality.select(&t, &["b", "a"]).unwrap();
        assert_eq!(s.position, "b");
        assert!(s.tie_broken);
    }

    #[test]
    fn test_majority_requires_more_than_half() {
        let split = tally(&[("a", 2), ("b", 2)]);
        assert!(ConsensusStrategy::Majority.select(&split, &["a", "b"]).is_err());
        let clear = tally(&[("a", 3), ("b", 2)]);
        assert_eq!(
            ConsensusStrategy::Majority.select(&clear, &["a", "b"]).unwrap().position,
            "a"
        );
    }

    #[test]
    fn test_supermajority_threshold() {
        let t = tally(&[("a", 2), ("b", 1)]);
        let two_thirds = ConsensusStrategy::Supermajority { threshold: 0.66 };
        assert!(two_thirds.select(&t, &["a", "b"]).is_ok());
        let three_quarters = ConsensusStrategy::Supermajority { threshold: 0.75 };
        assert!(three_quarters.select(&t, &["a", "b"]).is_err());
    }

    #[test]
    fn test_unanimous() {
        assert!(ConsensusStrategy::Unanimous
            .select(&tally(&[("a", 3)]), &["a"])
            .is_ok());
        assert!(ConsensusStrategy::Unanimous
            .select(&tally(&[("a", 2), ("b", 1)]), &["a", "b"])
            .is_err());
    }

    #[test]
    fn test_no_votes_is_error() {
        let err = ConsensusStrategy::Plurality
            .select(&Tally::default(), &["a"])
            .unwrap_err();
        assert_eq!(err, "no votes cast");
    }

    #[test]
    fn test_validate_threshold() {
        assert!(ConsensusStrategy::Supermajority { threshold: 0.4 }.validate().is_err());
        assert!(ConsensusStrategy::Supermajority { threshold: 0.66 }.validate().is_ok());
        assert!(ConsensusStrategy::Plurality.validate().is_ok());
    }

    #[test]
    fn test_strategy_serde_tag() {
        let json = serde_json::to_value(ConsensusStrategy::Supermajority { threshold: 0.75 }).unwrap();
        assert_eq!(json["kind"], "supermajority");
        let back: ConsensusStrategy = serde_json::from_value(json).unwrap();
        assert_eq!(back, ConsensusStrategy::Supermajority { threshold: 0.75 });
    }
}
